//! Storage abstraction used by the copier.
//!
//! The copier only talks to a database through [DocumentDatabase] and to a collection through
//! [DocumentContainer]. [MongoDatabase] is the real implementation, [MemoryDatabase] keeps
//! everything in process.
mod memory;
mod mongo;

use crate::error::Result;
use crate::CREATED_AT_KEY;
use bson::{doc, Bson, Document};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

pub use memory::{MemoryContainer, MemoryDatabase, MemoryPages, MemoryStore};
pub use mongo::{MongoContainer, MongoDatabase, MongoPages};

/// One unique key, made of one or more document paths like `/email`.
///
/// Index options which change what is unique are kept, so the destination rejects exactly the
/// documents the source would reject.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UniqueKey {
    /// paths which are unique together.
    pub paths: Vec<String>,
    /// documents which lack every path are not indexed.
    pub sparse: bool,
    /// only documents matching this filter are indexed.
    pub partial_filter: Option<Document>,
    /// collation used to compare string values.
    pub collation: Option<Document>,
}

/// Unique keys of a collection, copied as is to the destination.
pub type UniqueKeyPolicy = Vec<UniqueKey>;

/// Properties of a collection which the destination needs to be provisioned with.
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerDescriptor {
    /// collection name.
    pub id: String,
    /// partition key path, like `/tenantId`.
    pub partition_key_path: Option<String>,
    /// unique keys.
    pub unique_key_policy: UniqueKeyPolicy,
}

impl ContainerDescriptor {
    /// create a descriptor with no partition key and no unique key.
    pub fn new(id: impl Into<String>) -> Self {
        ContainerDescriptor {
            id: id.into(),
            partition_key_path: None,
            unique_key_policy: vec![],
        }
    }

    /// set partition key path.
    pub fn with_partition_key(mut self, path: impl Into<String>) -> Self {
        self.partition_key_path = Some(path.into());
        self
    }

    /// add a unique key.
    pub fn with_unique_key(mut self, paths: &[&str]) -> Self {
        self.unique_key_policy.push(UniqueKey {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            ..UniqueKey::default()
        });
        self
    }

    /// Partition key field name, which is the partition key path with one leading `/` removed.
    ///
    /// Returns None when the path is absent or blank, the store infers the key from the
    /// document itself in that case.
    pub fn partition_key_field(&self) -> Option<&str> {
        let path = self.partition_key_path.as_deref()?;
        if path.trim().is_empty() {
            return None;
        }
        Some(path.strip_prefix('/').unwrap_or(path))
    }
}

/// Filter applied when reading source documents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ItemFilter {
    /// documents whose `createdAt` >= the given time.
    CreatedSince(DateTime<Utc>),
}

impl ItemFilter {
    /// build filter from an optional cutoff, None means full scan.
    pub fn from_cutoff(cutoff: Option<DateTime<Utc>>) -> Option<ItemFilter> {
        cutoff.map(ItemFilter::CreatedSince)
    }

    /// Mongodb query for this filter.
    ///
    /// The cutoff is bound as a bson date value. Date typed `createdAt` compares directly,
    /// string typed `createdAt` is converted to a date on the server and compared the same way.
    pub fn to_query(&self) -> Document {
        match self {
            ItemFilter::CreatedSince(cutoff) => {
                let cutoff = bson::DateTime::from_millis(ceil_millis(cutoff));
                let field = format!("${}", CREATED_AT_KEY);
                doc! {
                    "$or": [
                        { CREATED_AT_KEY: { "$gte": cutoff } },
                        {
                            CREATED_AT_KEY: { "$type": "string" },
                            "$expr": {
                                "$gte": [
                                    {
                                        "$convert": {
                                            "input": field,
                                            "to": "date",
                                            "onError": Bson::Null,
                                            "onNull": Bson::Null,
                                        }
                                    },
                                    cutoff,
                                ]
                            }
                        },
                    ]
                }
            }
        }
    }

    /// check if `doc` passes this filter, with the same semantic as [to_query](ItemFilter::to_query).
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            ItemFilter::CreatedSince(cutoff) => match doc.get(CREATED_AT_KEY) {
                Some(Bson::DateTime(created)) => created.timestamp_millis() >= ceil_millis(cutoff),
                Some(Bson::String(created)) => parse_date_string(created)
                    .map(|created| created >= *cutoff)
                    .unwrap_or(false),
                _ => false,
            },
        }
    }
}

/// Milliseconds since epoch of `at`, rounded up.
///
/// Bson dates have millisecond precision, a date is >= `at` iff its millis >= this value.
fn ceil_millis(at: &DateTime<Utc>) -> i64 {
    let millis = at.timestamp_millis();
    if at.timestamp_subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis + 1
    }
}

/// Parse a date string the way mongodb's `$convert` to date does.
///
/// RFC 3339 strings keep their offset. Date time without a zone and date only strings are UTC.
fn parse_date_string(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(value) {
        return Some(at.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Value at a dotted path like `a.b`, going through nested documents.
pub(crate) fn value_at_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut parts = path.split('.');
    let mut value = doc.get(parts.next()?)?;
    for part in parts {
        match value {
            Bson::Document(inner) => value = inner.get(part)?,
            _ => return None,
        }
    }
    Some(value)
}

/// A collection which documents can be read from and upserted to.
///
/// Handles are cloned into write workers, so they should be cheap to clone.
pub trait DocumentContainer: Clone + Send + Sync + 'static {
    /// pages of documents returned by [query_items](DocumentContainer::query_items).
    type Pages: Iterator<Item = Result<Vec<Document>>>;

    /// collection name.
    fn name(&self) -> &str;

    /// read collection properties.
    fn descriptor(&self) -> Result<ContainerDescriptor>;

    /// Read documents which pass `filter`, all documents when it's None.
    ///
    /// Pages are produced lazily, in order, and can't be restarted.
    fn query_items(&self, filter: Option<&ItemFilter>) -> Result<Self::Pages>;

    /// Insert `doc`, or replace the document with the same `_id` and partition key value.
    ///
    /// `partition_key` is the partition key field name, None means the key is taken from the
    /// document by the store.
    fn upsert_item(&self, doc: Document, partition_key: Option<&str>) -> Result<()>;
}

/// A database which holds collections.
pub trait DocumentDatabase {
    /// collection handle type.
    type Container: DocumentContainer;

    /// database name.
    fn name(&self) -> &str;

    /// list all collections, in a stable order.
    fn list_containers(&self) -> Result<Vec<ContainerDescriptor>>;

    /// drop every collection in this database.
    fn delete_all_containers(&self) -> Result<()>;

    /// get an existing collection.
    fn get_container(&self, name: &str) -> Result<Self::Container>;

    /// Get collection `name`, create it with given partition key and unique keys when it's absent.
    ///
    /// An existing collection is returned untouched.
    fn get_or_create_container(
        &self,
        name: &str,
        partition_key_path: Option<&str>,
        unique_key_policy: &UniqueKeyPolicy,
    ) -> Result<Self::Container>;
}
