//! provide mongo copy blocking apis.

mod connection;
#[doc(hidden)]
pub mod copier;
mod mongo_copier;
#[doc(hidden)]
pub mod store;

pub use connection::{ClientCache, Credential, Endpoint};
pub use mongo_copier::MongoCopier;
