//! Mongo copy lib, which provides an easily usage api to copy data from one mongodb database to another.
//!
//! Provides one copier: [MongoCopier], which can copy a whole database or a single collection.
//!
//! A database copy is destructive: every collection in the destination database is dropped
//! before the source collections are copied, even when the source database is empty.
//!
//! # Database copy example:
//! ```no_run
//! use mongo_copy::{CancelToken, ContainerCopyConfig, Endpoint, MongoCopier};
//!
//! let copier = MongoCopier::new();
//! let source = Endpoint::new("mongodb://localhost:27017");
//! let target = Endpoint::new("mongodb://localhost:27018");
//! let configs = vec![ContainerCopyConfig::excluded("audit_log")];
//! copier
//!     .copy_database(&source, "app", &target, "app_clone", None, 50, &configs, &CancelToken::new())
//!     .unwrap();
//! ```
//!
//! # Collection copy example:
//! ```no_run
//! use mongo_copy::{CancelToken, Endpoint, MongoCopier};
//!
//! let copier = MongoCopier::new();
//! let source = Endpoint::new("mongodb://localhost:27017");
//! let target = Endpoint::new("mongodb://localhost:27018");
//! let progress = copier
//!     .copy_container(&source, "app", "users", &target, "app", "users_copy", None, 50, &CancelToken::new())
//!     .unwrap();
//! println!("copied {} documents", progress.items_written);
//! ```

#![warn(missing_docs)]

#[doc(hidden)]
pub mod blocking;
mod cancel;
pub mod config;
mod error;

/// default number of upserts kept in flight for one collection.
pub const DEFAULT_CONCURRENCY: usize = 50;
/// default number of documents in one source page.
pub const DEFAULT_PAGE_SIZE: u32 = 1000;

/// document identity key name.
const ID_KEY: &str = "_id";
/// document creation time key name, used by cutoff filters only.
const CREATED_AT_KEY: &str = "createdAt";
/// mongodb internal database which saves sharding metadata.
const CONFIG_DB: &str = "config";
/// mongodb internal collection which saves sharded collection metadata.
const SHARDED_COLLS: &str = "collections";

pub use blocking::copier::{
    copy_container, copy_database, resolve, ContainerConfigs, CopyProgress, DatabaseCopyReport,
    Decision,
};
pub use blocking::store::{
    ContainerDescriptor, DocumentContainer, DocumentDatabase, ItemFilter, MemoryContainer,
    MemoryDatabase, MemoryStore, MongoContainer, MongoDatabase, UniqueKey, UniqueKeyPolicy,
};
pub use blocking::{ClientCache, Credential, Endpoint, MongoCopier};
pub use cancel::CancelToken;
pub use config::{ContainerCopyConfig, CopierConfig};
pub use error::{CopyError, Result};
