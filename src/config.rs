//! mongo_copy basic configuration, express in toml.
//!
//! Basic configuration file example:
//! ```toml
//! [src]
//! url = "mongodb://localhost:27017"
//! db = "app"
//!
//! [dst]
//! url = "mongodb://localhost:27018"
//! db = "app_clone"
//! username = "root"
//! password = "secret"
//! auth_source = "admin"
//!
//! [copy]
//! # only copy documents whose `createdAt` >= cutoff, must be a quoted RFC 3339 string.
//! cutoff = "2024-01-01T00:00:00Z"
//! concurrency = 50
//! page_size = 1000
//! containers = [
//!     { name = "audit_log", exclude = true },
//!     { name = "events", cutoff = "2024-06-01T00:00:00Z" },
//! ]
//!
//! [log]
//! dir = "/var/log/mongo_copy"
//! ```
use crate::blocking::{Credential, Endpoint};
use crate::error::{CopyError, Result};
use crate::{DEFAULT_CONCURRENCY, DEFAULT_PAGE_SIZE};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;

/// Copy configuration for one collection, used by database copy.
///
/// `name` is matched case-insensitively against source collection names.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ContainerCopyConfig {
    /// collection name.
    #[serde(rename = "name")]
    pub container_name: String,
    /// cutoff for this collection only, overrides the global one.
    #[serde(default, rename = "cutoff")]
    pub cutoff_utc: Option<DateTime<Utc>>,
    /// don't copy this collection at all.
    #[serde(default)]
    pub exclude: bool,
}

impl ContainerCopyConfig {
    /// config which excludes `name` from copy.
    pub fn excluded(name: impl Into<String>) -> Self {
        ContainerCopyConfig {
            container_name: name.into(),
            cutoff_utc: None,
            exclude: true,
        }
    }

    /// config which copies `name` with its own `cutoff`.
    pub fn with_cutoff(name: impl Into<String>, cutoff: DateTime<Utc>) -> Self {
        ContainerCopyConfig {
            container_name: name.into(),
            cutoff_utc: Some(cutoff),
            exclude: false,
        }
    }
}

/// Global mongo copier configuration.
#[derive(Deserialize, Debug)]
pub struct CopierConfig {
    src: EndpointConf,
    dst: EndpointConf,
    #[serde(default)]
    copy: CopyConf,
    #[serde(default)]
    log: Option<Log>,
}

impl CopierConfig {
    /// read and validate configuration from toml file `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<CopierConfig> {
        let data = std::fs::read(path)?;
        let conf: CopierConfig = toml::from_slice(&data)?;
        conf.validate()?;
        Ok(conf)
    }

    /// check values which can't be expressed by types.
    pub fn validate(&self) -> Result<()> {
        if self.copy.concurrency == 0 {
            return Err(CopyError::Config(
                "`copy.concurrency` should be at least 1".to_string(),
            ));
        }
        if self.copy.page_size == 0 {
            return Err(CopyError::Config(
                "`copy.page_size` should be at least 1".to_string(),
            ));
        }
        for (side, conf) in [("src", &self.src), ("dst", &self.dst)] {
            if conf.db.is_empty() {
                return Err(CopyError::Config(format!("`{}.db` should not be empty", side)));
            }
            if conf.username.is_some() != conf.password.is_some() {
                return Err(CopyError::Config(format!(
                    "`{0}.username` and `{0}.password` should be given together",
                    side
                )));
            }
        }
        Ok(())
    }

    /// get source endpoint.
    pub fn get_src(&self) -> Endpoint {
        self.src.to_endpoint()
    }

    /// get destination endpoint.
    pub fn get_dst(&self) -> Endpoint {
        self.dst.to_endpoint()
    }

    /// get source database name.
    pub fn get_src_db(&self) -> &str {
        &self.src.db
    }

    /// get destination database name.
    pub fn get_dst_db(&self) -> &str {
        &self.dst.db
    }

    /// get global cutoff.
    pub fn get_cutoff(&self) -> Option<DateTime<Utc>> {
        self.copy.cutoff
    }

    /// override global cutoff.
    pub fn set_cutoff(&mut self, cutoff: DateTime<Utc>) {
        self.copy.cutoff = Some(cutoff);
    }

    /// get how many upserts are kept in flight per collection.
    pub fn get_concurrency(&self) -> usize {
        self.copy.concurrency
    }

    /// override concurrency limit, it's validated again by the copier.
    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.copy.concurrency = concurrency;
    }

    /// get how many documents are read in one page.
    pub fn get_page_size(&self) -> u32 {
        self.copy.page_size
    }

    /// get per collection configs.
    pub fn get_containers(&self) -> &[ContainerCopyConfig] {
        &self.copy.containers
    }

    /// get directory to save log files, None means only log to stdout.
    pub fn get_log_dir(&self) -> Option<&str> {
        self.log.as_ref().map(|l| l.dir.as_str())
    }
}

/// Mongodb endpoint configuration.
#[derive(Deserialize, Debug)]
struct EndpointConf {
    /// mongodb url, begins with 'mongodb://' or 'mongodb+srv://'
    url: String,
    /// database name.
    db: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    /// authentication database, mongodb uses `admin` when it's None.
    #[serde(default)]
    auth_source: Option<String>,
}

impl EndpointConf {
    fn to_endpoint(&self) -> Endpoint {
        let endpoint = Endpoint::new(&self.url);
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => endpoint.with_credential(Credential {
                username: username.clone(),
                password: password.clone(),
                source: self.auth_source.clone(),
            }),
            _ => endpoint,
        }
    }
}

/// Detail copy config.
#[derive(Deserialize, Debug)]
struct CopyConf {
    #[serde(default)]
    cutoff: Option<DateTime<Utc>>,
    #[serde(default = "default_concurrency")]
    concurrency: usize,
    #[serde(default = "default_page_size")]
    page_size: u32,
    #[serde(default)]
    containers: Vec<ContainerCopyConfig>,
}

impl Default for CopyConf {
    fn default() -> Self {
        CopyConf {
            cutoff: None,
            concurrency: default_concurrency(),
            page_size: default_page_size(),
            containers: vec![],
        }
    }
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

/// Logger config, for now it just includes where to save log files.
#[derive(Deserialize, Debug)]
struct Log {
    dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FULL_CONF: &str = r#"
[src]
url = "mongodb://localhost:27017"
db = "app"

[dst]
url = "mongodb://localhost:27018"
db = "app_clone"
username = "root"
password = "secret"

[copy]
cutoff = "2024-01-01T00:00:00Z"
concurrency = 8
containers = [
    { name = "Audit", exclude = true },
    { name = "events", cutoff = "2024-06-01T00:00:00Z" },
]

[log]
dir = "/tmp/mongo_copy"
"#;

    #[test]
    fn test_parse_full_config() {
        let conf: CopierConfig = toml::from_str(FULL_CONF).unwrap();
        conf.validate().unwrap();
        assert_eq!(conf.get_src_db(), "app");
        assert_eq!(conf.get_dst_db(), "app_clone");
        assert_eq!(conf.get_concurrency(), 8);
        assert_eq!(conf.get_page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(
            conf.get_cutoff(),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(
            conf.get_containers(),
            &[
                ContainerCopyConfig::excluded("Audit"),
                ContainerCopyConfig::with_cutoff(
                    "events",
                    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
                ),
            ]
        );
        assert!(conf.get_src().credential.is_none());
        let dst_credential = conf.get_dst().credential.unwrap();
        assert_eq!(dst_credential.username, "root");
        assert_eq!(dst_credential.source, None);
        assert_eq!(conf.get_log_dir(), Some("/tmp/mongo_copy"));
    }

    #[test]
    fn test_copy_section_defaults() {
        let conf: CopierConfig = toml::from_str(
            r#"
[src]
url = "mongodb://localhost:27017"
db = "a"
[dst]
url = "mongodb://localhost:27018"
db = "b"
"#,
        )
        .unwrap();
        conf.validate().unwrap();
        assert_eq!(conf.get_concurrency(), DEFAULT_CONCURRENCY);
        assert_eq!(conf.get_cutoff(), None);
        assert!(conf.get_containers().is_empty());
        assert_eq!(conf.get_log_dir(), None);
    }

    #[test]
    fn test_reject_zero_concurrency() {
        let mut conf: CopierConfig = toml::from_str(FULL_CONF).unwrap();
        conf.set_concurrency(0);
        assert!(matches!(conf.validate(), Err(CopyError::Config(_))));
    }

    #[test]
    fn test_reject_username_without_password() {
        let conf: CopierConfig = toml::from_str(
            r#"
[src]
url = "mongodb://localhost:27017"
db = "a"
username = "root"
[dst]
url = "mongodb://localhost:27018"
db = "b"
"#,
        )
        .unwrap();
        assert!(matches!(conf.validate(), Err(CopyError::Config(_))));
    }
}
