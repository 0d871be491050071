// 📤 Graph Exporter - flat snapshot of the classified graph
//
// A snapshot is four JSON files in the output directory. They are written to
// temp files first and renamed into place under a lock file, so readers see
// either the previous snapshot or the new one.

use crate::error::{AnalysisError, AnalysisResult};
use crate::graph::{EntityGraph, EntityNode, Ratio, SaleDetail, Status};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const TABLE_FILE: &str = "gst_table_data.json";
pub const NAMES_FILE: &str = "pan_names.json";
pub const AVAILABILITY_FILE: &str = "pan_availability.json";
pub const SALES_FILE: &str = "sales_records.json";
const LOCK_FILE: &str = ".snapshot.lock";

// ============================================================================
// SNAPSHOT MODEL
// ============================================================================

/// One row of the node table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(rename = "PAN")]
    pub pan: String,
    #[serde(rename = "Entity_Name")]
    pub entity_name: String,
    #[serde(rename = "Total_Sales", with = "rust_decimal::serde::arbitrary_precision")]
    pub total_sales: Decimal,
    #[serde(rename = "Total_Purchases", with = "rust_decimal::serde::arbitrary_precision")]
    pub total_purchases: Decimal,
    /// null when there are purchases but no sales
    #[serde(
        rename = "Purchase_to_Sales_Ratio",
        with = "rust_decimal::serde::arbitrary_precision_option"
    )]
    pub purchase_to_sales_ratio: Option<Decimal>,
    #[serde(rename = "Transaction_Count")]
    pub transaction_count: u64,
    #[serde(rename = "Avg_Transaction_Size", with = "rust_decimal::serde::arbitrary_precision")]
    pub avg_transaction_size: Decimal,
    #[serde(rename = "Is_Bogus")]
    pub is_bogus: bool,
    #[serde(rename = "Is_Contaminated")]
    pub is_contaminated: bool,
    #[serde(rename = "Contamination_Level", with = "rust_decimal::serde::arbitrary_precision")]
    pub contamination_level: Decimal,
    #[serde(rename = "Bogus_Value", with = "rust_decimal::serde::arbitrary_precision")]
    pub bogus_value: Decimal,
    /// Comma-separated
    #[serde(rename = "Children_PANs")]
    pub children_pans: String,
    #[serde(rename = "Parents_PANs")]
    pub parents_pans: String,
    #[serde(rename = "Risk_Score")]
    pub risk_score: f64,
    #[serde(rename = "Status")]
    pub status: Status,
    #[serde(rename = "Data_Available")]
    pub data_available: bool,
}

impl NodeRecord {
    pub fn from_node(node: &EntityNode) -> Self {
        NodeRecord {
            pan: node.id.clone(),
            entity_name: node.entity_name.clone(),
            total_sales: node.total_sales,
            total_purchases: node.total_purchases,
            purchase_to_sales_ratio: node.purchase_to_sales_ratio.value(),
            transaction_count: node.transaction_count,
            avg_transaction_size: node.avg_transaction_size,
            is_bogus: node.is_bogus,
            is_contaminated: node.is_contaminated,
            contamination_level: node.contamination_level,
            bogus_value: node.bogus_value,
            children_pans: node.children_ids.join(","),
            parents_pans: node.parent_ids.join(","),
            risk_score: node.risk_score,
            status: node.status,
            data_available: node.data_available,
        }
    }

    pub fn children(&self) -> Vec<String> {
        split_ids(&self.children_pans)
    }

    pub fn parents(&self) -> Vec<String> {
        split_ids(&self.parents_pans)
    }

    pub fn ratio(&self) -> Ratio {
        match self.purchase_to_sales_ratio {
            Some(r) => Ratio::Finite(r),
            None => Ratio::Infinite,
        }
    }
}

fn split_ids(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Everything a consumer needs, in publication form
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSnapshot {
    /// Discovery order; the root comes first
    pub nodes: Vec<NodeRecord>,
    pub names: BTreeMap<String, String>,
    pub availability: BTreeMap<String, bool>,
    pub sales: BTreeMap<String, Vec<SaleDetail>>,
}

impl GraphSnapshot {
    /// Flatten a classified graph. Link symmetry is checked first.
    pub fn from_graph(graph: &EntityGraph) -> AnalysisResult<Self> {
        graph.verify_symmetry()?;

        let mut snapshot = GraphSnapshot::default();
        for node in graph.nodes() {
            snapshot.nodes.push(NodeRecord::from_node(node));
            snapshot
                .names
                .insert(node.id.clone(), node.entity_name.clone());
            snapshot
                .availability
                .insert(node.id.clone(), node.data_available);
            if node.data_available {
                snapshot
                    .sales
                    .insert(node.id.clone(), node.sales_records.clone());
            }
        }
        Ok(snapshot)
    }

    pub fn root_id(&self) -> Option<&str> {
        self.nodes.first().map(|n| n.pan.as_str())
    }

    pub fn node(&self, pan: &str) -> Option<&NodeRecord> {
        self.nodes.iter().find(|n| n.pan == pan)
    }

    /// Serialized files, in publication order
    pub fn to_files(&self) -> AnalysisResult<Vec<(&'static str, Vec<u8>)>> {
        Ok(vec![
            (TABLE_FILE, serde_json::to_vec_pretty(&self.nodes)?),
            (NAMES_FILE, serde_json::to_vec_pretty(&self.names)?),
            (AVAILABILITY_FILE, serde_json::to_vec_pretty(&self.availability)?),
            (SALES_FILE, serde_json::to_vec_pretty(&self.sales)?),
        ])
    }

    /// Read a published snapshot back from `dir`
    pub fn load(dir: &Path) -> AnalysisResult<Self> {
        let nodes: Vec<NodeRecord> = read_json(&dir.join(TABLE_FILE))?;
        let names = read_json(&dir.join(NAMES_FILE))?;
        let availability = read_json(&dir.join(AVAILABILITY_FILE))?;
        let sales = read_json(&dir.join(SALES_FILE))?;

        info!(dir = %dir.display(), nodes = nodes.len(), "loaded snapshot");
        Ok(GraphSnapshot {
            nodes,
            names,
            availability,
            sales,
        })
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> AnalysisResult<T> {
    let bytes = fs::read(path)
        .map_err(|e| AnalysisError::Snapshot(format!("cannot read {}: {}", path.display(), e)))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AnalysisError::Snapshot(format!("cannot parse {}: {}", path.display(), e)))
}

impl EntityGraph {
    /// Rebuild a traversable graph from a published snapshot
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> EntityGraph {
        let mut graph = EntityGraph::new();
        for record in &snapshot.nodes {
            let mut node = EntityNode::new(&record.pan, record.data_available);
            node.entity_name = record.entity_name.clone();
            node.total_sales = record.total_sales;
            node.total_purchases = record.total_purchases;
            node.transaction_count = record.transaction_count;
            node.avg_transaction_size = record.avg_transaction_size;
            node.purchase_to_sales_ratio = record.ratio();
            node.is_bogus = record.is_bogus;
            node.is_contaminated = record.is_contaminated;
            node.contamination_level = record.contamination_level;
            node.bogus_value = record.bogus_value;
            node.risk_score = record.risk_score;
            node.status = record.status;
            node.children_ids = record.children();
            node.parent_ids = record.parents();
            node.sales_records = snapshot.sales.get(&record.pan).cloned().unwrap_or_default();
            graph.add_node(node);
        }
        graph
    }
}

// ============================================================================
// PUBLICATION
// ============================================================================

/// Publishes snapshots into one output directory
pub struct SnapshotWriter {
    dir: PathBuf,
}

/// Held for the duration of a publish; removes the lock file on drop
struct PublishLock {
    path: PathBuf,
}

impl PublishLock {
    fn acquire(dir: &Path) -> AnalysisResult<Self> {
        let path = dir.join(LOCK_FILE);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                writeln!(file, "{}", std::process::id())?;
                Ok(PublishLock { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(AnalysisError::SnapshotLocked(dir.display().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for PublishLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove publish lock");
        }
    }
}

impl SnapshotWriter {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        SnapshotWriter { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write every file of the snapshot, replacing the previous one.
    ///
    /// All temp files are written and synced before the first rename; a
    /// failure up to that point leaves the previous snapshot as it was.
    pub fn publish(&self, snapshot: &GraphSnapshot) -> AnalysisResult<Vec<PathBuf>> {
        fs::create_dir_all(&self.dir)?;
        let _lock = PublishLock::acquire(&self.dir)?;

        let files = snapshot.to_files()?;
        let mut staged: Vec<(PathBuf, PathBuf)> = Vec::with_capacity(files.len());

        for (name, bytes) in &files {
            let tmp = self.dir.join(format!(".{}.tmp", name));
            if let Err(e) = write_synced(&tmp, bytes) {
                for (tmp, _) in &staged {
                    let _ = fs::remove_file(tmp);
                }
                let _ = fs::remove_file(&tmp);
                return Err(e);
            }
            staged.push((tmp, self.dir.join(name)));
        }

        let mut published = Vec::with_capacity(staged.len());
        for (tmp, target) in staged {
            fs::rename(&tmp, &target)?;
            published.push(target);
        }

        info!(
            dir = %self.dir.display(),
            nodes = snapshot.nodes.len(),
            "snapshot published"
        );
        Ok(published)
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> AnalysisResult<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}
