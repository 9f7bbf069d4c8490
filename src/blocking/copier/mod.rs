//! Copy engine: per collection copy, database copy and the config resolver.
#[doc(hidden)]
pub mod batch;
mod container;
mod database;
mod resolver;

pub use container::{copy_container, CopyProgress};
pub use database::{copy_database, DatabaseCopyReport};
pub use resolver::{resolve, ContainerConfigs, Decision};
