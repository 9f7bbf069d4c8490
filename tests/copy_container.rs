use bson::{doc, Document};
use chrono::{DateTime, TimeZone, Utc};
use mongo_copy::{
    copy_container, CancelToken, ContainerDescriptor, CopyError, DocumentContainer,
    DocumentDatabase, ItemFilter, MemoryContainer, MemoryStore,
};
use std::time::Duration;

const SRC_DB: &str = "copy_test_source";
const DST_DB: &str = "copy_test_target";

struct Context {
    source: MemoryStore,
    target: MemoryStore,
}

impl Context {
    fn new(page_size: usize) -> Self {
        Context {
            source: MemoryStore::new(page_size),
            target: MemoryStore::new(page_size),
        }
    }

    fn seed(&self, coll: &str, docs: Vec<Document>) {
        self.source.insert_documents(SRC_DB, coll, docs).unwrap();
    }

    fn source_coll(&self, coll: &str) -> MemoryContainer {
        self.source.database(SRC_DB).get_container(coll).unwrap()
    }

    fn copy(&self, coll: &str, cutoff: Option<DateTime<Utc>>, limit: usize) -> mongo_copy::Result<mongo_copy::CopyProgress> {
        copy_container(
            &self.source_coll(coll),
            &self.target.database(DST_DB),
            coll,
            cutoff,
            limit,
            &CancelToken::new(),
        )
    }
}

/// string ids of a target collection, sorted.
fn copied_ids(context: &Context, coll: &str) -> Vec<String> {
    let mut ids: Vec<String> = context
        .target
        .documents(DST_DB, coll)
        .iter()
        .map(|d| d.get_str("_id").unwrap().to_string())
        .collect();
    ids.sort();
    ids
}

fn cutoff() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

fn created(days_after_cutoff: i64) -> bson::DateTime {
    let at = cutoff() + chrono::Duration::days(days_after_cutoff);
    bson::DateTime::from_millis(at.timestamp_millis())
}

#[test]
fn test_copy_250_documents() {
    let context = Context::new(100);
    let docs: Vec<Document> = (0..250).map(|i| doc! {"_id": i, "a": 3}).collect();
    context.seed("items", docs.clone());

    let progress = context.copy("items", None, 50).unwrap();

    // upserts of one batch complete in any order.
    let mut copied = context.target.documents(DST_DB, "items");
    copied.sort_by_key(|d| d.get_i32("_id").unwrap());
    assert_eq!(copied, docs);
    assert_eq!(progress.items_read, 250);
    assert_eq!(progress.items_written, 250);
    assert_eq!(progress.pages, 3);
    assert_eq!(progress.full_batches, 5);
    assert_eq!(progress.partial_batches, 0);
}

#[test]
fn test_batch_boundary() {
    let context = Context::new(10);
    context.seed("items", (0..5).map(|i| doc! {"_id": i}).collect());
    context.target.set_upsert_delay(Duration::from_millis(10));

    let progress = context.copy("items", None, 2).unwrap();

    assert_eq!(progress.full_batches, 2);
    assert_eq!(progress.partial_batches, 1);
    assert_eq!(progress.items_written, 5);
    assert!(context.target.peak_concurrent_upserts() <= 2);
    assert_eq!(context.target.upsert_count(), 5);
}

#[test]
fn test_batches_span_pages() {
    // 7 documents in pages of 3, batches of 4: the first batch takes a whole page and a bit of the next.
    let context = Context::new(3);
    context.seed("items", (0..7).map(|i| doc! {"_id": i}).collect());

    let progress = context.copy("items", None, 4).unwrap();

    assert_eq!(progress.pages, 3);
    assert_eq!(progress.full_batches, 1);
    assert_eq!(progress.partial_batches, 1);
    assert_eq!(context.target.documents(DST_DB, "items").len(), 7);
}

#[test]
fn test_cutoff_filters_documents() {
    let context = Context::new(10);
    context.seed(
        "events",
        vec![
            doc! {"_id": "old", "createdAt": created(-1)},
            doc! {"_id": "edge", "createdAt": created(0)},
            doc! {"_id": "new", "createdAt": created(3)},
            doc! {"_id": "new_str", "createdAt": "2024-02-01T00:00:00Z"},
            doc! {"_id": "old_str", "createdAt": "2023-02-01T00:00:00Z"},
            doc! {"_id": "no_created_at"},
        ],
    );

    let progress = context.copy("events", Some(cutoff()), 50).unwrap();

    assert_eq!(copied_ids(&context, "events"), vec!["edge", "new", "new_str"]);
    assert_eq!(progress.items_read, 3);
    let filter = ItemFilter::CreatedSince(cutoff());
    for doc in context.target.documents(DST_DB, "events") {
        assert!(filter.matches(&doc));
    }
}

#[test]
fn test_no_cutoff_copies_documents_without_created_at() {
    let context = Context::new(10);
    context.seed(
        "events",
        vec![doc! {"_id": 1, "createdAt": created(-10)}, doc! {"_id": 2}],
    );

    context.copy("events", None, 50).unwrap();

    assert_eq!(context.target.documents(DST_DB, "events").len(), 2);
}

#[test]
fn test_copy_is_idempotent() {
    let context = Context::new(4);
    context.seed("users", (0..10).map(|i| doc! {"_id": i, "v": 0}).collect());

    context.copy("users", None, 3).unwrap();
    context.copy("users", None, 3).unwrap();
    assert_eq!(context.target.documents(DST_DB, "users").len(), 10);

    context.seed("users", vec![doc! {"_id": 4, "v": 1}]);
    context.copy("users", None, 3).unwrap();

    let target = context.target.documents(DST_DB, "users");
    assert_eq!(target.len(), 10);
    for doc in target {
        let expected = if doc.get_i32("_id").unwrap() == 4 { 1 } else { 0 };
        assert_eq!(doc.get_i32("v").unwrap(), expected);
    }
}

#[test]
fn test_destination_created_with_source_properties() {
    let context = Context::new(10);
    context.source.create_container(
        SRC_DB,
        ContainerDescriptor::new("orders")
            .with_partition_key("/tenant")
            .with_unique_key(&["/number"]),
    );
    context.seed(
        "orders",
        vec![
            doc! {"_id": 1, "tenant": "a", "number": 1},
            doc! {"_id": 1, "tenant": "b", "number": 2},
        ],
    );

    context.copy("orders", None, 5).unwrap();

    assert_eq!(
        context.target.descriptor(DST_DB, "orders").unwrap(),
        ContainerDescriptor::new("orders")
            .with_partition_key("/tenant")
            .with_unique_key(&["/number"])
    );
    // same `_id` under different partition keys are different documents.
    assert_eq!(context.target.documents(DST_DB, "orders").len(), 2);
}

#[test]
fn test_existing_destination_kept() {
    let context = Context::new(10);
    context.seed("items", vec![doc! {"_id": 1}]);
    context
        .target
        .create_container(DST_DB, ContainerDescriptor::new("items").with_partition_key("/pk"));
    context
        .target
        .insert_documents(DST_DB, "items", vec![doc! {"_id": 99}])
        .unwrap();

    context.copy("items", None, 5).unwrap();

    assert_eq!(
        context.target.documents(DST_DB, "items"),
        vec![doc! {"_id": 99}, doc! {"_id": 1}]
    );
    assert_eq!(
        context
            .target
            .descriptor(DST_DB, "items")
            .unwrap()
            .partition_key_path
            .as_deref(),
        Some("/pk")
    );
}

#[test]
fn test_failed_upsert_aborts_copy() {
    let context = Context::new(2);
    context.seed(
        "items",
        vec![
            doc! {"_id": "a"},
            doc! {"_id": "b"},
            doc! {"_id": "bad"},
            doc! {"_id": "c"},
            doc! {"_id": "d"},
            doc! {"_id": "e"},
        ],
    );
    context.target.fail_upsert_of("bad");

    let err = context.copy("items", None, 2).unwrap_err();

    assert!(matches!(err, CopyError::Write { .. }));
    // first batch is kept, the good half of the failing batch too, nothing after it is read.
    assert_eq!(copied_ids(&context, "items"), vec!["a", "b", "c"]);
    assert_eq!(context.source.pages_served(), 2);
}

#[test]
fn test_zero_concurrency_rejected_before_any_write() {
    let context = Context::new(10);
    context.seed("items", vec![doc! {"_id": 1}]);

    let err = context.copy("items", None, 0).unwrap_err();

    assert!(matches!(err, CopyError::InvalidConcurrency(0)));
    assert!(context.target.container_names(DST_DB).is_empty());
}

#[test]
fn test_cancel_before_start() {
    let context = Context::new(10);
    context.seed("items", (0..5).map(|i| doc! {"_id": i}).collect());
    let cancel = CancelToken::new();
    cancel.cancel();

    let err = copy_container(
        &context.source_coll("items"),
        &context.target.database(DST_DB),
        "items",
        None,
        2,
        &cancel,
    )
    .unwrap_err();

    assert!(matches!(err, CopyError::Cancelled));
    assert_eq!(context.source.pages_served(), 0);
    assert_eq!(context.target.upsert_count(), 0);
}

/// Source collection which cancels the copy once its first page is handed out.
#[derive(Clone)]
struct CancelAfterFirstPage {
    inner: MemoryContainer,
    cancel: CancelToken,
}

struct CancellingPages<I> {
    inner: I,
    cancel: CancelToken,
}

impl<I: Iterator> Iterator for CancellingPages<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<I::Item> {
        let page = self.inner.next();
        self.cancel.cancel();
        page
    }
}

impl DocumentContainer for CancelAfterFirstPage {
    type Pages = CancellingPages<<MemoryContainer as DocumentContainer>::Pages>;

    fn name(&self) -> &str {
        self.inner.name()
    }

    fn descriptor(&self) -> mongo_copy::Result<ContainerDescriptor> {
        self.inner.descriptor()
    }

    fn query_items(&self, filter: Option<&ItemFilter>) -> mongo_copy::Result<Self::Pages> {
        Ok(CancellingPages {
            inner: self.inner.query_items(filter)?,
            cancel: self.cancel.clone(),
        })
    }

    fn upsert_item(&self, doc: Document, partition_key: Option<&str>) -> mongo_copy::Result<()> {
        self.inner.upsert_item(doc, partition_key)
    }
}

#[test]
fn test_cancel_between_pages_awaits_dispatched_batch() {
    // page of 3 with batches of 4: three upserts are in flight when cancel is seen.
    let context = Context::new(3);
    context.seed("items", (0..9).map(|i| doc! {"_id": i}).collect());
    context.target.set_upsert_delay(Duration::from_millis(20));
    let cancel = CancelToken::new();
    let source = CancelAfterFirstPage {
        inner: context.source_coll("items"),
        cancel: cancel.clone(),
    };

    let err = copy_container(
        &source,
        &context.target.database(DST_DB),
        "items",
        None,
        4,
        &cancel,
    )
    .unwrap_err();

    assert!(matches!(err, CopyError::Cancelled));
    assert_eq!(context.source.pages_served(), 1);
    // in-flight upserts completed before the copy returned.
    assert_eq!(context.target.documents(DST_DB, "items").len(), 3);
    assert_eq!(context.target.upsert_count(), 3);
}

#[test]
fn test_sub_millisecond_cutoff_excludes_earlier_documents() {
    let context = Context::new(10);
    context.seed(
        "events",
        vec![
            doc! {"_id": "same_ms_before", "createdAt": "2024-01-01T00:00:00.0001Z"},
            doc! {"_id": "same_ms_date", "createdAt": created(0)},
            doc! {"_id": "same_ms_after", "createdAt": "2024-01-01T00:00:00.0009Z"},
            doc! {"_id": "next_ms", "createdAt": bson::DateTime::from_millis(cutoff().timestamp_millis() + 1)},
        ],
    );
    let precise_cutoff = cutoff() + chrono::Duration::microseconds(900);

    context.copy("events", Some(precise_cutoff), 50).unwrap();

    assert_eq!(copied_ids(&context, "events"), vec!["next_ms", "same_ms_after"]);
}

#[test]
fn test_cutoff_accepts_date_strings_without_zone() {
    let context = Context::new(10);
    context.seed(
        "events",
        vec![
            doc! {"_id": "date_only", "createdAt": "2024-01-01"},
            doc! {"_id": "no_zone", "createdAt": "2024-01-02T10:00:00"},
            doc! {"_id": "space", "createdAt": "2024-01-03 10:00:00.5"},
            doc! {"_id": "old_date_only", "createdAt": "2023-12-31"},
            doc! {"_id": "old_no_zone", "createdAt": "2023-12-31T23:59:59"},
        ],
    );

    context.copy("events", Some(cutoff()), 50).unwrap();

    assert_eq!(copied_ids(&context, "events"), vec!["date_only", "no_zone", "space"]);
}
