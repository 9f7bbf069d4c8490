use super::{
    value_at_path, ContainerDescriptor, DocumentContainer, DocumentDatabase, ItemFilter,
    UniqueKey, UniqueKeyPolicy,
};
use crate::error::{CopyError, Result};
use crate::{CONFIG_DB, ID_KEY, SHARDED_COLLS};
use bson::{doc, Bson, Document};
use mongodb::options::{Collation, FindOptions, IndexOptions, ReplaceOptions};
use mongodb::sync::{Client, Collection, Cursor, Database};
use mongodb::IndexModel;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Mongodb database handle.
#[derive(Clone)]
pub struct MongoDatabase {
    client: Client,
    db: Database,
    page_size: u32,
}

impl MongoDatabase {
    /// wrap database `name` of `client`, documents are read `page_size` at a time.
    pub fn new(client: Client, name: &str, page_size: u32) -> Self {
        MongoDatabase {
            db: client.database(name),
            client,
            page_size,
        }
    }

    fn container(&self, name: &str) -> MongoContainer {
        MongoContainer {
            client: self.client.clone(),
            db_name: self.db.name().to_string(),
            coll: self.db.collection(name),
            page_size: self.page_size,
            shard_key: Arc::new(OnceLock::new()),
        }
    }

    fn user_collection_names(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .db
            .list_collection_names(doc! {"type": "collection"})?
            .into_iter()
            .filter(|name| !name.starts_with("system."))
            .collect();
        names.sort();
        Ok(names)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(!self
            .db
            .list_collection_names(doc! {"name": name})?
            .is_empty())
    }
}

impl DocumentDatabase for MongoDatabase {
    type Container = MongoContainer;

    fn name(&self) -> &str {
        self.db.name()
    }

    fn list_containers(&self) -> Result<Vec<ContainerDescriptor>> {
        self.user_collection_names()?
            .iter()
            .map(|name| self.container(name).descriptor())
            .collect()
    }

    fn delete_all_containers(&self) -> Result<()> {
        for name in self.user_collection_names()? {
            debug!(db = self.db.name(), coll = %name, "Drop collection");
            self.db.collection::<Document>(&name).drop(None)?;
        }
        Ok(())
    }

    fn get_container(&self, name: &str) -> Result<MongoContainer> {
        if !self.exists(name)? {
            return Err(CopyError::ContainerNotFound {
                db: self.db.name().to_string(),
                container: name.to_string(),
            });
        }
        Ok(self.container(name))
    }

    fn get_or_create_container(
        &self,
        name: &str,
        partition_key_path: Option<&str>,
        unique_key_policy: &UniqueKeyPolicy,
    ) -> Result<MongoContainer> {
        let container = self.container(name);
        if self.exists(name)? {
            return Ok(container);
        }

        debug!(db = self.db.name(), coll = name, ?partition_key_path, "Create collection");
        self.db.create_collection(name, None)?;
        for unique_key in unique_key_policy {
            container.coll.create_index(unique_index(name, unique_key)?, None)?;
        }
        Ok(container)
    }
}

/// Mongodb collection handle.
#[derive(Clone)]
pub struct MongoContainer {
    client: Client,
    db_name: String,
    coll: Collection<Document>,
    page_size: u32,
    /// shard key fields of this collection, read on first upsert.
    shard_key: Arc<OnceLock<Vec<String>>>,
}

impl MongoContainer {
    fn unique_keys(&self) -> Result<UniqueKeyPolicy> {
        let mut policy = vec![];
        for index in self.coll.list_indexes(None)? {
            if let Some(unique_key) = unique_key_of(self.coll.name(), &index?)? {
                policy.push(unique_key);
            }
        }
        Ok(policy)
    }

    /// read shard key from sharding catalog, None means the collection is unsharded.
    fn read_shard_key(&self) -> Result<Option<Document>> {
        let ns = format!("{}.{}", self.db_name, self.coll.name());
        let catalog = self
            .client
            .database(CONFIG_DB)
            .collection::<Document>(SHARDED_COLLS);
        let entry = match catalog.find_one(doc! {ID_KEY: ns.as_str()}, None) {
            Ok(entry) => entry,
            Err(e) => {
                // unsharded deployments may not let us read `config` database.
                debug!(%ns, error = %e, "Can't read sharding catalog, treat collection as unsharded");
                return Ok(None);
            }
        };
        match entry.as_ref().and_then(|entry| entry.get("key")) {
            Some(Bson::Document(key)) => Ok(Some(key.clone())),
            Some(other) => Err(CopyError::metadata(
                self.coll.name(),
                format!("shard key should be a document, got {:?}", other),
            )),
            None => Ok(None),
        }
    }

    /// partition key path is the first shard key field, `a.b` becomes `/a/b`.
    fn partition_key_path(&self) -> Result<Option<String>> {
        Ok(self
            .read_shard_key()?
            .and_then(|key| key.keys().next().map(|k| format!("/{}", k.replace('.', "/")))))
    }

    fn shard_key_fields(&self) -> Result<&[String]> {
        if let Some(fields) = self.shard_key.get() {
            return Ok(fields);
        }
        let fields = self
            .read_shard_key()?
            .map(|key| key.keys().cloned().collect())
            .unwrap_or_default();
        Ok(self.shard_key.get_or_init(|| fields))
    }
}

/// Convert an index of collection `coll` to a unique key, None when it's not a unique index.
///
/// The `_id` index is skipped, it always exists.
fn unique_key_of(coll: &str, index: &IndexModel) -> Result<Option<UniqueKey>> {
    let options = match &index.options {
        Some(options) if options.unique == Some(true) => options,
        _ => return Ok(None),
    };
    if index.keys.keys().any(|k| k == ID_KEY) {
        return Ok(None);
    }
    let collation = match &options.collation {
        Some(collation) => Some(bson::to_document(collation).map_err(|e| {
            CopyError::metadata(coll, format!("invalid index collation: {}", e))
        })?),
        None => None,
    };
    Ok(Some(UniqueKey {
        paths: index
            .keys
            .keys()
            .map(|k| format!("/{}", k.replace('.', "/")))
            .collect(),
        sparse: options.sparse.unwrap_or(false),
        partial_filter: options.partial_filter_expression.clone(),
        collation,
    }))
}

/// Build the unique index of `unique_key`, for collection `coll`.
fn unique_index(coll: &str, unique_key: &UniqueKey) -> Result<IndexModel> {
    let mut keys = Document::new();
    for path in unique_key.paths.iter() {
        keys.insert(path.trim_start_matches('/').replace('/', "."), 1);
    }
    let collation = match &unique_key.collation {
        Some(collation) => Some(bson::from_document::<Collation>(collation.clone()).map_err(
            |e| CopyError::metadata(coll, format!("invalid index collation: {}", e)),
        )?),
        None => None,
    };
    let options = IndexOptions::builder()
        .unique(true)
        .sparse(unique_key.sparse.then_some(true))
        .partial_filter_expression(unique_key.partial_filter.clone())
        .collation(collation)
        .build();
    Ok(IndexModel::builder().keys(keys).options(options).build())
}

/// Filter which selects the stored version of `doc`: `_id`, every shard key field and the
/// partition key field, when `doc` has them.
fn upsert_filter(
    doc: &Document,
    id: Bson,
    shard_key_fields: &[String],
    partition_key: Option<&str>,
) -> Document {
    let partition_key = partition_key.map(|field| field.replace('/', "."));
    let mut query = doc! {ID_KEY: id};
    for field in shard_key_fields
        .iter()
        .map(String::as_str)
        .chain(partition_key.as_deref())
    {
        if query.contains_key(field) {
            continue;
        }
        if let Some(value) = value_at_path(doc, field) {
            query.insert(field, value.clone());
        }
    }
    query
}

impl DocumentContainer for MongoContainer {
    type Pages = MongoPages;

    fn name(&self) -> &str {
        self.coll.name()
    }

    fn descriptor(&self) -> Result<ContainerDescriptor> {
        Ok(ContainerDescriptor {
            id: self.coll.name().to_string(),
            partition_key_path: self.partition_key_path()?,
            unique_key_policy: self.unique_keys()?,
        })
    }

    fn query_items(&self, filter: Option<&ItemFilter>) -> Result<MongoPages> {
        let cursor = self.coll.find(
            filter.map(ItemFilter::to_query),
            FindOptions::builder().batch_size(self.page_size).build(),
        )?;
        Ok(MongoPages {
            cursor,
            page_size: self.page_size as usize,
            exhausted: false,
        })
    }

    fn upsert_item(&self, doc: Document, partition_key: Option<&str>) -> Result<()> {
        let id = doc
            .get(ID_KEY)
            .cloned()
            .ok_or_else(|| CopyError::MissingId {
                container: self.coll.name().to_string(),
            })?;
        let query = upsert_filter(&doc, id, self.shard_key_fields()?, partition_key);
        self.coll.replace_one(
            query,
            doc,
            ReplaceOptions::builder().upsert(true).build(),
        )?;
        Ok(())
    }
}

/// Cuts a mongodb cursor into pages of `page_size` documents.
pub struct MongoPages {
    cursor: Cursor<Document>,
    page_size: usize,
    exhausted: bool,
}

impl Iterator for MongoPages {
    type Item = Result<Vec<Document>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        let mut page = Vec::with_capacity(self.page_size);
        while page.len() < self.page_size {
            match self.cursor.next() {
                Some(Ok(doc)) => page.push(doc),
                Some(Err(e)) => {
                    self.exhausted = true;
                    return Some(Err(e.into()));
                }
                None => {
                    self.exhausted = true;
                    break;
                }
            }
        }
        if page.is_empty() {
            None
        } else {
            Some(Ok(page))
        }
    }
}
