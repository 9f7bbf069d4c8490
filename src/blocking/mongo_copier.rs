use super::connection::{ClientCache, Endpoint};
use super::copier::{self, CopyProgress, DatabaseCopyReport};
use super::store::{DocumentDatabase, MongoDatabase};
use crate::cancel::CancelToken;
use crate::config::ContainerCopyConfig;
use crate::error::Result;
use crate::DEFAULT_PAGE_SIZE;
use chrono::{DateTime, Utc};

/// Copy mongodb databases and collections between endpoints.
///
/// Clients are cached per endpoint, so one copier can serve many copies.
pub struct MongoCopier {
    clients: ClientCache,
    page_size: u32,
}

impl Default for MongoCopier {
    fn default() -> Self {
        Self::new()
    }
}

impl MongoCopier {
    /// create a copier which reads [DEFAULT_PAGE_SIZE] documents per page.
    pub fn new() -> MongoCopier {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    /// create a copier which reads `page_size` documents per page.
    pub fn with_page_size(page_size: u32) -> MongoCopier {
        MongoCopier {
            clients: ClientCache::new(),
            page_size: page_size.max(1),
        }
    }

    /// get database `name` on `endpoint`.
    pub fn database(&self, endpoint: &Endpoint, name: &str) -> Result<MongoDatabase> {
        let client = self.clients.get_client(endpoint)?;
        Ok(MongoDatabase::new(client, name, self.page_size))
    }

    /// Copy every collection of `src_db` on `src` into `dst_db` on `dst`.
    ///
    /// **Destructive**: all collections of `dst_db` are dropped before copying, see
    /// [copy_database](crate::copy_database).
    #[allow(clippy::too_many_arguments)]
    pub fn copy_database(
        &self,
        src: &Endpoint,
        src_db: &str,
        dst: &Endpoint,
        dst_db: &str,
        cutoff: Option<DateTime<Utc>>,
        concurrency_limit: usize,
        configs: &[ContainerCopyConfig],
        cancel: &CancelToken,
    ) -> Result<DatabaseCopyReport> {
        self.clients.check_permission(src, src_db)?;
        self.clients.check_permission(dst, dst_db)?;
        let source = self.database(src, src_db)?;
        let destination = self.database(dst, dst_db)?;
        copier::copy_database(
            &source,
            &destination,
            cutoff,
            concurrency_limit,
            configs,
            cancel,
        )
    }

    /// Copy collection `src_coll` of `src_db` into `dst_coll` of `dst_db`.
    ///
    /// The destination collection is created when absent and is never emptied first.
    #[allow(clippy::too_many_arguments)]
    pub fn copy_container(
        &self,
        src: &Endpoint,
        src_db: &str,
        src_coll: &str,
        dst: &Endpoint,
        dst_db: &str,
        dst_coll: &str,
        cutoff: Option<DateTime<Utc>>,
        concurrency_limit: usize,
        cancel: &CancelToken,
    ) -> Result<CopyProgress> {
        self.clients.check_permission(src, src_db)?;
        self.clients.check_permission(dst, dst_db)?;
        let source = self.database(src, src_db)?.get_container(src_coll)?;
        let destination = self.database(dst, dst_db)?;
        copier::copy_container(
            &source,
            &destination,
            dst_coll,
            cutoff,
            concurrency_limit,
            cancel,
        )
    }
}
