use super::{
    value_at_path, ContainerDescriptor, DocumentContainer, DocumentDatabase, ItemFilter,
    UniqueKeyPolicy,
};
use crate::error::{CopyError, Result};
use crate::ID_KEY;
use bson::{Bson, Document};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// In process document store, which behaves like a mongodb deployment.
///
/// It's used for dry runs and tests, so it also records how it is used: upsert calls, the peak
/// number of concurrent upserts and pages served. Clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<HashMap<String, BTreeMap<String, MemoryCollection>>>>,
    stats: Arc<Stats>,
    page_size: usize,
}

#[derive(Default)]
struct Stats {
    upserts: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    pages_served: AtomicUsize,
    fail_listing: AtomicBool,
    fail_ids: Mutex<HashSet<String>>,
    upsert_delay: Mutex<Option<Duration>>,
}

struct MemoryCollection {
    descriptor: ContainerDescriptor,
    items: Vec<Document>,
    index: HashMap<String, usize>,
}

impl MemoryCollection {
    fn new(descriptor: ContainerDescriptor) -> Self {
        MemoryCollection {
            descriptor,
            items: vec![],
            index: HashMap::new(),
        }
    }

    fn upsert(&mut self, doc: Document, partition_key: Option<&str>) -> Result<()> {
        let id = doc.get(ID_KEY).ok_or_else(|| CopyError::MissingId {
            container: self.descriptor.id.clone(),
        })?;
        let partition_key = partition_key.or_else(|| self.descriptor.partition_key_field());
        let pk_value = partition_key.and_then(|field| value_at_path(&doc, &field.replace('/', ".")));
        let key = format!("{:?}|{:?}", id, pk_value);
        match self.index.get(&key) {
            Some(pos) => self.items[*pos] = doc,
            None => {
                self.index.insert(key, self.items.len());
                self.items.push(doc);
            }
        }
        Ok(())
    }
}

impl MemoryStore {
    /// create an empty store, which serves `page_size` documents per page.
    pub fn new(page_size: usize) -> Self {
        MemoryStore {
            inner: Arc::new(Mutex::new(HashMap::new())),
            stats: Arc::new(Stats::default()),
            page_size: page_size.max(1),
        }
    }

    /// get database `name`, it's created on first write.
    pub fn database(&self, name: &str) -> MemoryDatabase {
        MemoryDatabase {
            store: self.clone(),
            name: name.to_string(),
        }
    }

    /// create collection `descriptor.id` in database `db`, replacing any existing one.
    pub fn create_container(&self, db: &str, descriptor: ContainerDescriptor) {
        self.lock()
            .entry(db.to_string())
            .or_default()
            .insert(descriptor.id.clone(), MemoryCollection::new(descriptor));
    }

    /// upsert `docs` into collection `coll`, it's created without partition key when absent.
    pub fn insert_documents(&self, db: &str, coll: &str, docs: Vec<Document>) -> Result<()> {
        let mut inner = self.lock();
        let collection = inner
            .entry(db.to_string())
            .or_default()
            .entry(coll.to_string())
            .or_insert_with(|| MemoryCollection::new(ContainerDescriptor::new(coll)));
        for doc in docs {
            collection.upsert(doc, None)?;
        }
        Ok(())
    }

    /// all documents of a collection, in insertion order.
    pub fn documents(&self, db: &str, coll: &str) -> Vec<Document> {
        self.lock()
            .get(db)
            .and_then(|colls| colls.get(coll))
            .map(|c| c.items.clone())
            .unwrap_or_default()
    }

    /// collection names of database `db`, sorted.
    pub fn container_names(&self, db: &str) -> Vec<String> {
        self.lock()
            .get(db)
            .map(|colls| colls.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// properties of a collection.
    pub fn descriptor(&self, db: &str, coll: &str) -> Option<ContainerDescriptor> {
        self.lock()
            .get(db)
            .and_then(|colls| colls.get(coll))
            .map(|c| c.descriptor.clone())
    }

    /// make every upsert of a document whose `_id` is the string `id` fail.
    pub fn fail_upsert_of(&self, id: &str) {
        self.stats
            .fail_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string());
    }

    /// make collection listing fail.
    pub fn fail_listing(&self) {
        self.stats.fail_listing.store(true, Ordering::SeqCst);
    }

    /// hold every upsert for `delay` before it's applied.
    pub fn set_upsert_delay(&self, delay: Duration) {
        *self
            .stats
            .upsert_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    /// how many upserts have been called.
    pub fn upsert_count(&self) -> usize {
        self.stats.upserts.load(Ordering::SeqCst)
    }

    /// the maximum number of upserts which ran at the same time.
    pub fn peak_concurrent_upserts(&self) -> usize {
        self.stats.peak_in_flight.load(Ordering::SeqCst)
    }

    /// how many pages have been read.
    pub fn pages_served(&self) -> usize {
        self.stats.pages_served.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BTreeMap<String, MemoryCollection>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn upsert(&self, db: &str, coll: &str, doc: Document, partition_key: Option<&str>) -> Result<()> {
        self.stats.upserts.fetch_add(1, Ordering::SeqCst);
        let running = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let result = self.apply_upsert(db, coll, doc, partition_key);
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn apply_upsert(
        &self,
        db: &str,
        coll: &str,
        doc: Document,
        partition_key: Option<&str>,
    ) -> Result<()> {
        let delay = *self
            .stats
            .upsert_delay
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if let Some(Bson::String(id)) = doc.get(ID_KEY) {
            let rejected = self
                .stats
                .fail_ids
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(id);
            if rejected {
                return Err(CopyError::Store(format!("upsert of document {:?} rejected", id)));
            }
        }
        let mut inner = self.lock();
        let collection = inner
            .get_mut(db)
            .and_then(|colls| colls.get_mut(coll))
            .ok_or_else(|| CopyError::ContainerNotFound {
                db: db.to_string(),
                container: coll.to_string(),
            })?;
        collection.upsert(doc, partition_key)
    }
}

/// Database handle of a [MemoryStore].
#[derive(Clone)]
pub struct MemoryDatabase {
    store: MemoryStore,
    name: String,
}

impl MemoryDatabase {
    fn container(&self, name: &str) -> MemoryContainer {
        MemoryContainer {
            store: self.store.clone(),
            db: self.name.clone(),
            name: name.to_string(),
        }
    }
}

impl DocumentDatabase for MemoryDatabase {
    type Container = MemoryContainer;

    fn name(&self) -> &str {
        &self.name
    }

    fn list_containers(&self) -> Result<Vec<ContainerDescriptor>> {
        if self.store.stats.fail_listing.load(Ordering::SeqCst) {
            return Err(CopyError::Store(format!(
                "list collections of {:?} rejected",
                self.name
            )));
        }
        Ok(self
            .store
            .lock()
            .get(&self.name)
            .map(|colls| colls.values().map(|c| c.descriptor.clone()).collect())
            .unwrap_or_default())
    }

    fn delete_all_containers(&self) -> Result<()> {
        self.store.lock().remove(&self.name);
        Ok(())
    }

    fn get_container(&self, name: &str) -> Result<MemoryContainer> {
        if self.store.descriptor(&self.name, name).is_none() {
            return Err(CopyError::ContainerNotFound {
                db: self.name.clone(),
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
    ) -> Result<MemoryContainer> {
        self.store
            .lock()
            .entry(self.name.clone())
            .or_default()
            .entry(name.to_string())
            .or_insert_with(|| {
                MemoryCollection::new(ContainerDescriptor {
                    id: name.to_string(),
                    partition_key_path: partition_key_path.map(str::to_string),
                    unique_key_policy: unique_key_policy.clone(),
                })
            });
        Ok(self.container(name))
    }
}

/// Collection handle of a [MemoryStore].
#[derive(Clone)]
pub struct MemoryContainer {
    store: MemoryStore,
    db: String,
    name: String,
}

impl DocumentContainer for MemoryContainer {
    type Pages = MemoryPages;

    fn name(&self) -> &str {
        &self.name
    }

    fn descriptor(&self) -> Result<ContainerDescriptor> {
        self.store
            .descriptor(&self.db, &self.name)
            .ok_or_else(|| CopyError::ContainerNotFound {
                db: self.db.clone(),
                container: self.name.clone(),
            })
    }

    fn query_items(&self, filter: Option<&ItemFilter>) -> Result<MemoryPages> {
        let docs: Vec<Document> = self
            .store
            .documents(&self.db, &self.name)
            .into_iter()
            .filter(|doc| filter.map_or(true, |f| f.matches(doc)))
            .collect();
        Ok(MemoryPages {
            docs: docs.into_iter(),
            page_size: self.store.page_size,
            stats: self.store.stats.clone(),
        })
    }

    fn upsert_item(&self, doc: Document, partition_key: Option<&str>) -> Result<()> {
        self.store.upsert(&self.db, &self.name, doc, partition_key)
    }
}

/// Pages of a [MemoryContainer] query, the result is fixed when the query is made.
pub struct MemoryPages {
    docs: std::vec::IntoIter<Document>,
    page_size: usize,
    stats: Arc<Stats>,
}

impl Iterator for MemoryPages {
    type Item = Result<Vec<Document>>;

    fn next(&mut self) -> Option<Self::Item> {
        let page: Vec<Document> = self.docs.by_ref().take(self.page_size).collect();
        if page.is_empty() {
            return None;
        }
        self.stats.pages_served.fetch_add(1, Ordering::SeqCst);
        Some(Ok(page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_upsert_keys_on_id_and_partition_key() {
        let store = MemoryStore::new(10);
        store.create_container("db", ContainerDescriptor::new("c").with_partition_key("/pk"));
        let coll = store.database("db").get_container("c").unwrap();

        coll.upsert_item(doc! {"_id": 1, "pk": "a", "v": 1}, Some("pk")).unwrap();
        coll.upsert_item(doc! {"_id": 1, "pk": "a", "v": 2}, Some("pk")).unwrap();
        coll.upsert_item(doc! {"_id": 1, "pk": "b", "v": 3}, Some("pk")).unwrap();
        // no explicit key, the collection's partition key is used.
        coll.upsert_item(doc! {"_id": 1, "pk": "b", "v": 4}, None).unwrap();

        assert_eq!(
            store.documents("db", "c"),
            vec![
                doc! {"_id": 1, "pk": "a", "v": 2},
                doc! {"_id": 1, "pk": "b", "v": 4}
            ]
        );
        assert_eq!(store.upsert_count(), 4);
    }

    #[test]
    fn test_upsert_with_nested_partition_key() {
        let store = MemoryStore::new(10);
        store.create_container("db", ContainerDescriptor::new("c").with_partition_key("/region/zone"));
        let coll = store.database("db").get_container("c").unwrap();

        coll.upsert_item(doc! {"_id": 1, "region": {"zone": "a"}, "v": 1}, Some("region/zone")).unwrap();
        coll.upsert_item(doc! {"_id": 1, "region": {"zone": "b"}, "v": 2}, Some("region/zone")).unwrap();
        coll.upsert_item(doc! {"_id": 1, "region": {"zone": "a"}, "v": 3}, Some("region/zone")).unwrap();

        assert_eq!(
            store.documents("db", "c"),
            vec![
                doc! {"_id": 1, "region": {"zone": "a"}, "v": 3},
                doc! {"_id": 1, "region": {"zone": "b"}, "v": 2}
            ]
        );
    }

    #[test]
    fn test_upsert_without_id_fails() {
        let store = MemoryStore::new(10);
        store.create_container("db", ContainerDescriptor::new("c"));
        let coll = store.database("db").get_container("c").unwrap();
        assert!(matches!(
            coll.upsert_item(doc! {"a": 1}, None),
            Err(CopyError::MissingId { .. })
        ));
    }

    #[test]
    fn test_pages() {
        let store = MemoryStore::new(2);
        let docs = (0..5).map(|i| doc! {"_id": i}).collect();
        store.insert_documents("db", "c", docs).unwrap();
        let coll = store.database("db").get_container("c").unwrap();
        let sizes: Vec<usize> = coll
            .query_items(None)
            .unwrap()
            .map(|page| page.unwrap().len())
            .collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(store.pages_served(), 3);
    }

    #[test]
    fn test_get_or_create_keeps_existing_schema() {
        let store = MemoryStore::new(10);
        store.create_container("db", ContainerDescriptor::new("c").with_partition_key("/pk"));
        let db = store.database("db");
        db.get_or_create_container("c", Some("/other"), &vec![]).unwrap();
        assert_eq!(
            store.descriptor("db", "c").unwrap().partition_key_path.as_deref(),
            Some("/pk")
        );
        assert!(matches!(
            db.get_container("missing"),
            Err(CopyError::ContainerNotFound { .. })
        ));
    }
}
