//! ---
//! vtnc_section: "07-operator-binary"
//! vtnc_subsection: "binary"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Startup snapshot summary for the inspect-startup command."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use indexmap::IndexMap;
use serde::Serialize;
use vtnc_alloc::{LabelAllocator, PoolSnapshot};
use vtnc_common::AppConfig;
use vtnc_store::{ConfigRecord, ConfigStore, KeyType, MemoryStore, Partition, ScopeFilter};

#[derive(Debug, Serialize)]
pub struct PoolUsage {
    pub scope: String,
    pub used: u64,
    pub capacity: u64,
}

impl From<PoolSnapshot> for PoolUsage {
    fn from(pool: PoolSnapshot) -> Self {
        Self {
            scope: pool.scope,
            used: pool.used,
            capacity: pool.capacity,
        }
    }
}

/// Summary of a verified startup snapshot.
#[derive(Debug, Serialize)]
pub struct StartupReport {
    pub records: usize,
    pub pools: Vec<PoolUsage>,
    /// Derived topology node counts per VTN, keyed by key-type name.
    pub topology: IndexMap<String, IndexMap<String, usize>>,
}

impl StartupReport {
    pub fn build(config: &AppConfig, records: Vec<ConfigRecord>) -> Result<Self> {
        let total = records.len();
        let store = Arc::new(MemoryStore::new());
        store.replace_partition(Partition::Running, records)?;
        let allocator = LabelAllocator::new(store.clone(), config.allocator.clone());

        let mut pools = Vec::new();
        for record in store.read_all(Partition::Running, KeyType::LabelPool, &ScopeFilter::all())? {
            pools.push(allocator.pool(Partition::Running, record.key.name())?.into());
        }

        let mut topology: IndexMap<String, IndexMap<String, usize>> = IndexMap::new();
        for key_type in [
            KeyType::LeafBridge,
            KeyType::LeafInterface,
            KeyType::TunnelHub,
            KeyType::TunnelInterface,
            KeyType::Link,
        ] {
            for record in store.read_all(Partition::Running, key_type, &ScopeFilter::all())? {
                let vtn = record.key.vtn().unwrap_or_default().to_owned();
                *topology
                    .entry(vtn)
                    .or_default()
                    .entry(key_type.to_string())
                    .or_default() += 1;
            }
        }

        Ok(Self {
            records: total,
            pools,
            topology,
        })
    }

    pub fn render(&self, path: &Path) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Snapshot: {} ({} records)", path.display(), self.records);
        let _ = writeln!(out, "Pools:");
        for pool in &self.pools {
            let _ = writeln!(out, "  {:<24} {:>5} / {}", pool.scope, pool.used, pool.capacity);
        }
        let _ = writeln!(out, "Topology:");
        for (vtn, counts) in &self.topology {
            let counts = counts
                .iter()
                .map(|(key_type, count)| format!("{key_type}={count}"))
                .collect::<Vec<_>>()
                .join(" ");
            let _ = writeln!(out, "  {vtn}: {counts}");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vtnc_store::RecordKey;

    #[test]
    fn report_counts_pools_and_nodes_per_vtn() {
        let records = vec![
            ConfigRecord::new(RecordKey::new(KeyType::LabelPool, ["vtn:v1"])).with_attr("used_count", 2),
            ConfigRecord::new(RecordKey::new(KeyType::PoolLimit, ["vtn:v1"])).with_attr("capacity", 10),
            ConfigRecord::new(RecordKey::new(KeyType::LeafBridge, ["v1", "br", "leaf-000001"])),
            ConfigRecord::new(RecordKey::new(KeyType::LeafBridge, ["v1", "br", "leaf-000002"])),
            ConfigRecord::new(RecordKey::new(KeyType::TunnelHub, ["v1", "hub-000001"])),
            ConfigRecord::new(RecordKey::new(KeyType::LeafBridge, ["v2", "br", "leaf-000003"])),
        ];
        let report = StartupReport::build(&AppConfig::default(), records).unwrap();
        assert_eq!(report.records, 6);
        assert_eq!(report.pools.len(), 1);
        assert_eq!((report.pools[0].used, report.pools[0].capacity), (2, 10));
        assert_eq!(report.topology["v1"]["leaf_bridge"], 2);
        assert_eq!(report.topology["v1"]["tunnel_hub"], 1);
        assert_eq!(report.topology["v2"].len(), 1);

        let text = report.render(Path::new("startup.json"));
        assert!(text.contains("vtn:v1"));
        assert!(text.contains("leaf_bridge=2"));
    }
}
