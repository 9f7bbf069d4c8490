use crate::config::ContainerCopyConfig;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// What to do with one source collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// don't copy this collection at all.
    pub skip: bool,
    /// cutoff to filter documents with, None means copy everything.
    pub cutoff: Option<DateTime<Utc>>,
}

/// Per collection copy configs, keyed by lower-cased collection name.
///
/// When the same name appears more than once, the later config wins.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfigs {
    configs: HashMap<String, ContainerCopyConfig>,
}

impl ContainerConfigs {
    /// build lookup table from `configs`.
    pub fn new(configs: &[ContainerCopyConfig]) -> Self {
        ContainerConfigs {
            configs: configs
                .iter()
                .map(|c| (c.container_name.to_lowercase(), c.clone()))
                .collect(),
        }
    }

    /// get config for collection `name`, ignoring case.
    pub fn get(&self, name: &str) -> Option<&ContainerCopyConfig> {
        self.configs.get(&name.to_lowercase())
    }

    /// names of excluded collections, sorted.
    pub fn excluded(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .configs
            .values()
            .filter(|c| c.exclude)
            .map(|c| c.container_name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    /// collections which have their own cutoff, sorted by name.
    pub fn custom_cutoffs(&self) -> Vec<(&str, DateTime<Utc>)> {
        let mut cutoffs: Vec<(&str, DateTime<Utc>)> = self
            .configs
            .values()
            .filter(|c| !c.exclude)
            .filter_map(|c| c.cutoff_utc.map(|t| (c.container_name.as_str(), t)))
            .collect();
        cutoffs.sort_unstable();
        cutoffs
    }
}

/// Decide whether collection `container_id` is copied, and with which cutoff.
///
/// An excluded collection is skipped. Otherwise its own cutoff is used when it has one, and the
/// `global_cutoff` when it doesn't.
///
/// ```
/// use chrono::{TimeZone, Utc};
/// use mongo_copy::{resolve, ContainerConfigs, ContainerCopyConfig};
///
/// let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
/// let t2 = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
/// let configs = ContainerConfigs::new(&[
///     ContainerCopyConfig::excluded("A"),
///     ContainerCopyConfig::with_cutoff("B", t2),
/// ]);
///
/// assert!(resolve("a", Some(t1), &configs).skip);
/// assert_eq!(resolve("B", Some(t1), &configs).cutoff, Some(t2));
/// assert_eq!(resolve("D", Some(t1), &configs).cutoff, Some(t1));
/// ```
pub fn resolve(
    container_id: &str,
    global_cutoff: Option<DateTime<Utc>>,
    configs: &ContainerConfigs,
) -> Decision {
    match configs.get(container_id) {
        Some(config) if config.exclude => Decision {
            skip: true,
            cutoff: None,
        },
        Some(config) => Decision {
            skip: false,
            cutoff: config.cutoff_utc.or(global_cutoff),
        },
        None => Decision {
            skip: false,
            cutoff: global_cutoff,
        },
    }
}
