use super::batch::write_pool;
use super::container::{copy_container_on, CopyProgress};
use super::resolver::{resolve, ContainerConfigs, Decision};
use crate::blocking::store::{ContainerDescriptor, DocumentDatabase};
use crate::cancel::CancelToken;
use crate::config::ContainerCopyConfig;
use crate::error::{CopyError, Result};
use chrono::{DateTime, Utc};
use tracing::{info, info_span};
use uuid::Uuid;

/// What a database copy did.
#[derive(Debug, Clone, Default)]
pub struct DatabaseCopyReport {
    /// copied collections and their progress, in copy order.
    pub copied: Vec<(String, CopyProgress)>,
    /// excluded collections, in enumeration order.
    pub skipped: Vec<String>,
}

impl DatabaseCopyReport {
    /// total documents written to destination.
    pub fn items_written(&self) -> u64 {
        self.copied.iter().map(|(_, p)| p.items_written).sum()
    }
}

/// Copy every collection of `source` into `destination`.
///
/// **Destructive**: every collection in `destination` is dropped first, whether or not the source
/// has a collection with the same name, and before the source is even listed. A run which is
/// already cancelled drops nothing.
///
/// Source collections are then copied one by one, in listing order, each under the name it has in
/// the source. `configs` can exclude collections or give them their own cutoff, otherwise
/// `global_cutoff` is used. The first failing collection aborts the whole copy; collections
/// copied before it stay, later ones are never created.
pub fn copy_database<S, D>(
    source: &S,
    destination: &D,
    global_cutoff: Option<DateTime<Utc>>,
    concurrency_limit: usize,
    configs: &[ContainerCopyConfig],
    cancel: &CancelToken,
) -> Result<DatabaseCopyReport>
where
    S: DocumentDatabase,
    D: DocumentDatabase,
{
    if concurrency_limit == 0 {
        return Err(CopyError::InvalidConcurrency(concurrency_limit));
    }
    let run_id = Uuid::new_v4();
    let span = info_span!("copy_database", %run_id, source_db = source.name(), dest_db = destination.name());
    let _enter = span.enter();

    info!(?global_cutoff, "Begin to copy database. ");
    let configs = ContainerConfigs::new(configs);
    let excluded = configs.excluded();
    if !excluded.is_empty() {
        info!(count = excluded.len(), containers = ?excluded, "Excluding collections from copy. ");
    }
    let custom_cutoffs = configs.custom_cutoffs();
    if !custom_cutoffs.is_empty() {
        info!(containers = ?custom_cutoffs, "Collections with custom cutoff. ");
    }

    if cancel.is_cancelled() {
        info!("Copy database cancelled before resetting destination. ");
        return Err(CopyError::Cancelled);
    }
    destination.delete_all_containers()?;
    info!("Finished deleting collections in destination database. ");

    if cancel.is_cancelled() {
        info!("Copy database cancelled before listing source. ");
        return Err(CopyError::Cancelled);
    }
    let source_containers = source.list_containers()?;
    let plan = plan_copies(&source_containers, global_cutoff, &configs);

    let pool = write_pool(concurrency_limit)?;
    let mut report = DatabaseCopyReport::default();
    for (descriptor, decision) in plan {
        if decision.skip {
            info!(coll = %descriptor.id, "Skipping excluded collection. ");
            report.skipped.push(descriptor.id.clone());
            continue;
        }
        if cancel.is_cancelled() {
            info!(copied = report.copied.len(), "Copy database cancelled. ");
            return Err(CopyError::Cancelled);
        }

        let source_container = source.get_container(&descriptor.id)?;
        let progress = copy_container_on(
            &pool,
            &source_container,
            destination,
            &descriptor.id,
            decision.cutoff,
            concurrency_limit,
            cancel,
        )?;
        report.copied.push((descriptor.id.clone(), progress));
    }

    info!(
        copied = report.copied.len(),
        skipped = report.skipped.len(),
        written = report.items_written(),
        "Copy database complete. "
    );
    Ok(report)
}

/// Pair every source collection with its copy decision, keeping listing order.
fn plan_copies<'a>(
    containers: &'a [ContainerDescriptor],
    global_cutoff: Option<DateTime<Utc>>,
    configs: &ContainerConfigs,
) -> Vec<(&'a ContainerDescriptor, Decision)> {
    containers
        .iter()
        .map(|c| (c, resolve(&c.id, global_cutoff, configs)))
        .collect()
}
