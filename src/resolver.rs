// 🧭 Entity Resolver - builds the entity graph breadth-first from the root
//
// Children of an entity are the buyers in its own SALE records. Every entity
// referenced by a record becomes a node, with or without a spreadsheet of its
// own; the ones without one are kept as MISSING nodes so the tree shows where
// the data stops.

use crate::cache::{content_hash, ParseCache};
use crate::error::{AnalysisError, AnalysisResult};
use crate::graph::{EntityGraph, EntityNode};
use crate::parser::{
    detect_format, load_file, pan_from_filename, Direction, LoaderSettings, ParsedSheet,
    TransactionRecord,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// ============================================================================
// FILE INDEX
// ============================================================================

/// PAN → spreadsheet path for one data directory
#[derive(Debug, Clone, Default)]
pub struct FileIndex {
    files: BTreeMap<String, PathBuf>,
}

impl FileIndex {
    /// Scan `dir` for spreadsheets named `<PAN>_*.{xlsx,csv,...}`.
    ///
    /// Office lock files (`~$...`) and dot files are skipped. When two files
    /// carry the same PAN the lexicographically first one wins.
    pub fn scan(dir: &Path) -> AnalysisResult<Self> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();

        let mut files = BTreeMap::new();
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with('~') || name.starts_with('.') {
                continue;
            }
            if detect_format(&path).is_none() {
                continue;
            }
            let Some(pan) = pan_from_filename(&path) else {
                debug!(file = name, "no PAN in filename, ignored");
                continue;
            };
            if let Some(existing) = files.get(&pan) {
                warn!(
                    pan = %pan,
                    kept = %Path::new(existing).display(),
                    ignored = name,
                    "duplicate spreadsheet for PAN"
                );
                continue;
            }
            files.insert(pan, path);
        }

        info!(dir = %dir.display(), files = files.len(), "indexed data directory");
        Ok(FileIndex { files })
    }

    pub fn get(&self, pan: &str) -> Option<&PathBuf> {
        self.files.get(pan)
    }

    pub fn contains(&self, pan: &str) -> bool {
        self.files.contains_key(pan)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn pans(&self) -> impl Iterator<Item = &String> {
        self.files.keys()
    }
}

// ============================================================================
// RECORD PROVIDERS
// ============================================================================

/// RecordProvider - where entity spreadsheets come from
///
/// The resolver never touches the filesystem itself, so the whole engine can
/// run against in-memory sheets.
pub trait RecordProvider {
    /// Whether the entity has a spreadsheet at all
    fn has_data(&self, pan: &str) -> bool;

    /// Load and parse the entity's spreadsheet
    fn load(&self, pan: &str) -> AnalysisResult<ParsedSheet>;

    /// Label used in error messages (file name for disk-backed providers)
    fn source_label(&self, pan: &str) -> String {
        pan.to_string()
    }
}

/// Spreadsheets on disk, optionally through the parse cache
pub struct DirectoryProvider {
    index: FileIndex,
    settings: LoaderSettings,
    cache: Option<ParseCache>,
}

impl DirectoryProvider {
    pub fn new(index: FileIndex, settings: LoaderSettings) -> Self {
        DirectoryProvider {
            index,
            settings,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: ParseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn index(&self) -> &FileIndex {
        &self.index
    }

    pub fn cache(&self) -> Option<&ParseCache> {
        self.cache.as_ref()
    }

    fn load_cached(&self, cache: &ParseCache, path: &Path) -> AnalysisResult<ParsedSheet> {
        let bytes = fs::read(path)?;
        let hash = content_hash(&bytes, &self.settings);
        let key = path.display().to_string();

        if let Some(cached) = cache.get(&key, &hash)? {
            return Ok(cached.sheet);
        }

        let sheet = load_file(path, &self.settings)?;
        if let Err(e) = cache.put(&key, &hash, &sheet) {
            // A cache write failure only costs a re-parse next run
            warn!(file = %key, error = %e, "could not store parsed sheet");
        }
        Ok(sheet)
    }
}

impl RecordProvider for DirectoryProvider {
    fn has_data(&self, pan: &str) -> bool {
        self.index.contains(pan)
    }

    fn load(&self, pan: &str) -> AnalysisResult<ParsedSheet> {
        let path = self.index.get(pan).ok_or_else(|| AnalysisError::MissingFile {
            pan: pan.to_string(),
        })?;

        match &self.cache {
            Some(cache) => self.load_cached(cache, path),
            None => load_file(path, &self.settings),
        }
    }

    fn source_label(&self, pan: &str) -> String {
        self.index
            .get(pan)
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| pan.to_string())
    }
}

/// Already-parsed sheets keyed by PAN
#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    sheets: HashMap<String, ParsedSheet>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, pan: &str, sheet: ParsedSheet) {
        self.sheets.insert(pan.to_string(), sheet);
    }

    /// Builder form of `insert`
    pub fn with_sheet(mut self, pan: &str, name: &str, records: Vec<TransactionRecord>) -> Self {
        self.insert(
            pan,
            ParsedSheet {
                entity_name: Some(name.to_string()),
                records,
                rejected: Vec::new(),
            },
        );
        self
    }
}

impl RecordProvider for MemoryProvider {
    fn has_data(&self, pan: &str) -> bool {
        self.sheets.contains_key(pan)
    }

    fn load(&self, pan: &str) -> AnalysisResult<ParsedSheet> {
        self.sheets
            .get(pan)
            .cloned()
            .ok_or_else(|| AnalysisError::MissingFile {
                pan: pan.to_string(),
            })
    }
}

// ============================================================================
// RESOLUTION
// ============================================================================

/// Output of one resolution pass
#[derive(Debug)]
pub struct ResolveResult {
    /// Root actually used (may differ from the configured one)
    pub root_id: String,
    pub graph: EntityGraph,
    /// Parsed records of every entity that had data
    pub records: HashMap<String, Vec<TransactionRecord>>,
    /// Recoverable problems met on the way
    pub errors: Vec<AnalysisError>,
    /// Parent → child edges left out to keep the graph acyclic
    pub dropped_edges: Vec<(String, String)>,
}

impl ResolveResult {
    pub fn missing_count(&self) -> usize {
        self.graph.nodes().filter(|n| !n.data_available).count()
    }
}

/// Decide which root to start from.
///
/// The configured root wins when it has data. Otherwise the PAN embedded in
/// `root_file` is tried, and failing that the configured root is kept as a
/// MISSING node.
pub fn select_root(configured: &str, root_file: Option<&str>, provider: &dyn RecordProvider) -> String {
    let configured = configured.trim().to_uppercase();
    if provider.has_data(&configured) {
        return configured;
    }

    if let Some(file) = root_file {
        match pan_from_filename(Path::new(file)) {
            Some(pan) if provider.has_data(&pan) => {
                warn!(configured = %configured, root = %pan, file, "configured root has no data, using root file");
                return pan;
            }
            _ => {
                warn!(file, "root file does not name an entity with data");
            }
        }
    }

    warn!(root = %configured, "root entity has no spreadsheet, keeping it as missing");
    configured
}

/// Resolve the graph reachable from `root_id`
pub fn resolve(root_id: &str, provider: &dyn RecordProvider) -> ResolveResult {
    let root_id = root_id.trim().to_uppercase();
    let mut graph = EntityGraph::new();
    let mut records: HashMap<String, Vec<TransactionRecord>> = HashMap::new();
    let mut errors = Vec::new();
    let mut dropped_edges = Vec::new();

    let mut root = EntityNode::new(&root_id, provider.has_data(&root_id));
    root.entity_name = root_id.clone();
    graph.add_node(root);

    let mut queue = VecDeque::from([root_id.clone()]);

    while let Some(current) = queue.pop_front() {
        if !provider.has_data(&current) {
            warn!(pan = %current, "no spreadsheet for entity");
            errors.push(AnalysisError::MissingFile { pan: current });
            continue;
        }

        let sheet = match provider.load(&current) {
            Ok(sheet) => sheet,
            Err(e) => {
                // An unreadable file degrades the entity to MISSING
                warn!(pan = %current, error = %e, "could not load spreadsheet");
                if let Some(node) = graph.get_mut(&current) {
                    node.data_available = false;
                }
                errors.push(e);
                continue;
            }
        };

        errors.extend(sheet.errors(&provider.source_label(&current)));
        if let (Some(name), Some(node)) = (&sheet.entity_name, graph.get_mut(&current)) {
            node.entity_name = name.clone();
        }

        for record in sheet.records.iter().filter(|r| r.direction == Direction::Sale) {
            let child = &record.counterparty_id;
            if *child == current || *child == root_id {
                continue;
            }

            if !graph.contains(child) {
                let mut node = EntityNode::new(child, provider.has_data(child));
                node.entity_name = record
                    .counterparty_name
                    .clone()
                    .unwrap_or_else(|| child.clone());
                graph.add_node(node);
                queue.push_back(child.clone());
            } else if graph.reaches(child, &current) {
                if !dropped_edges.iter().any(|(p, c)| p == &current && c == child) {
                    warn!(parent = %current, child = %child, "edge would close a cycle, dropped");
                    dropped_edges.push((current.clone(), child.clone()));
                }
                continue;
            }

            graph.link(&current, child);
        }

        debug!(pan = %current, records = sheet.records.len(), "resolved entity");
        records.insert(current, sheet.records);
    }

    info!(
        root = %root_id,
        nodes = graph.len(),
        with_data = records.len(),
        errors = errors.len(),
        "entity graph resolved"
    );

    ResolveResult {
        root_id,
        graph,
        records,
        errors,
        dropped_edges,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::tests::{data_row, dec, sheet_rows};

    fn sale(pan: &str, name: &str, amount: &str) -> TransactionRecord {
        TransactionRecord::new(Direction::Sale, pan, dec(amount)).with_name(name)
    }

    fn purchase(pan: &str, amount: &str) -> TransactionRecord {
        TransactionRecord::new(Direction::Purchase, pan, dec(amount))
    }

    fn sample_provider() -> MemoryProvider {
        MemoryProvider::new()
            .with_sheet(
                "AAAAA1111A",
                "Root Co",
                vec![
                    sale("BBBBB2222B", "Beta", "100"),
                    sale("CCCCC3333C", "Gamma", "50"),
                    sale("X123456789", "Ghost Ltd", "5"),
                ],
            )
            .with_sheet(
                "BBBBB2222B",
                "Beta Traders",
                vec![purchase("AAAAA1111A", "100"), sale("DDDDD4444D", "Delta", "70")],
            )
            .with_sheet("CCCCC3333C", "Gamma Inc", vec![sale("DDDDD4444D", "Delta", "20")])
            .with_sheet("DDDDD4444D", "Delta LLP", vec![])
    }

    #[test]
    fn test_breadth_first_discovery_order() {
        let result = resolve("AAAAA1111A", &sample_provider());
        let ids: Vec<&str> = result.graph.nodes().map(|n| n.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["AAAAA1111A", "BBBBB2222B", "CCCCC3333C", "X123456789", "DDDDD4444D"]
        );

        let d = result.graph.get("DDDDD4444D").unwrap();
        assert_eq!(d.parent_ids, vec!["BBBBB2222B", "CCCCC3333C"]);
        assert!(result.graph.verify_symmetry().is_ok());
        println!("✅ Test passed: {} nodes resolved", result.graph.len());
    }

    #[test]
    fn test_missing_file_becomes_unavailable_node() {
        let result = resolve("AAAAA1111A", &sample_provider());
        let ghost = result.graph.get("X123456789").unwrap();
        assert!(!ghost.data_available);
        assert_eq!(ghost.entity_name, "Ghost Ltd");
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, AnalysisError::MissingFile { pan } if pan == "X123456789")));
        assert_eq!(result.missing_count(), 1);
        assert!(!result.records.contains_key("X123456789"));
    }

    #[test]
    fn test_own_sheet_name_wins() {
        let result = resolve("AAAAA1111A", &sample_provider());
        assert_eq!(result.graph.get("BBBBB2222B").unwrap().entity_name, "Beta Traders");
        assert_eq!(result.graph.get("AAAAA1111A").unwrap().entity_name, "Root Co");
    }

    #[test]
    fn test_back_edge_dropped() {
        let provider = MemoryProvider::new()
            .with_sheet("AAAAA1111A", "A", vec![sale("BBBBB2222B", "B", "10")])
            .with_sheet("BBBBB2222B", "B", vec![sale("CCCCC3333C", "C", "10")])
            .with_sheet("CCCCC3333C", "C", vec![sale("BBBBB2222B", "B", "10")]);

        let result = resolve("AAAAA1111A", &provider);
        assert_eq!(
            result.dropped_edges,
            vec![("CCCCC3333C".to_string(), "BBBBB2222B".to_string())]
        );
        assert!(result.graph.topological_order().is_ok());
    }

    #[test]
    fn test_sales_to_root_and_self_are_not_children() {
        let provider = MemoryProvider::new()
            .with_sheet("AAAAA1111A", "A", vec![sale("BBBBB2222B", "B", "10"), sale("AAAAA1111A", "A", "1")])
            .with_sheet("BBBBB2222B", "B", vec![sale("AAAAA1111A", "A", "3")]);

        let result = resolve("AAAAA1111A", &provider);
        assert!(result.graph.get("AAAAA1111A").unwrap().parent_ids.is_empty());
        assert_eq!(result.graph.get("AAAAA1111A").unwrap().children_ids, vec!["BBBBB2222B"]);
        assert!(result.dropped_edges.is_empty());
    }

    #[test]
    fn test_duplicate_sales_link_once() {
        let provider = MemoryProvider::new().with_sheet(
            "AAAAA1111A",
            "A",
            vec![sale("BBBBB2222B", "B", "10"), sale("BBBBB2222B", "B", "15")],
        );
        let result = resolve("AAAAA1111A", &provider);
        assert_eq!(result.graph.get("AAAAA1111A").unwrap().children_ids.len(), 1);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let first = resolve("AAAAA1111A", &sample_provider());
        let second = resolve("AAAAA1111A", &sample_provider());
        let ids = |r: &ResolveResult| r.graph.nodes().map(|n| n.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn test_root_selection_fallback() {
        let provider = sample_provider();
        assert_eq!(select_root("aaaaa1111a", None, &provider), "AAAAA1111A");
        assert_eq!(
            select_root("ZZZZZ9999Z", Some("BBBBB2222B_GST_Data.xlsx"), &provider),
            "BBBBB2222B"
        );
        assert_eq!(
            select_root("ZZZZZ9999Z", Some("QQQQQ0000Q_GST.xlsx"), &provider),
            "ZZZZZ9999Z"
        );
    }

    #[test]
    fn test_missing_root_is_single_missing_node() {
        let result = resolve("ZZZZZ9999Z", &MemoryProvider::new());
        assert_eq!(result.graph.len(), 1);
        assert!(!result.graph.get("ZZZZZ9999Z").unwrap().data_available);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn test_directory_provider_with_csv_and_cache() {
        let dir = tempfile::tempdir().unwrap();
        let rows = sheet_rows(
            "Root Co",
            vec![
                data_row("GSTR1-R", "BBBBB2222B", "Beta", "1,000.00"),
                data_row("GSTR1-P", "CCCCC3333C", "Gamma", "400"),
            ],
        );
        let csv: String = rows
            .iter()
            .map(|row| {
                let line = row
                    .iter()
                    .map(|c| c.as_text().unwrap_or_default().replace(',', ""))
                    .collect::<Vec<_>>()
                    .join(",");
                format!("{},\n", line)
            })
            .collect();
        fs::write(dir.path().join("AAAAA1111A_GST.csv"), &csv).unwrap();
        fs::write(dir.path().join("~$AAAAA1111A_GST.csv"), "junk").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let index = FileIndex::scan(dir.path()).unwrap();
        assert_eq!(index.len(), 1);

        let provider = DirectoryProvider::new(index, LoaderSettings::default())
            .with_cache(ParseCache::in_memory().unwrap());

        let first = resolve("AAAAA1111A", &provider);
        assert_eq!(first.records["AAAAA1111A"].len(), 2);
        assert_eq!(first.records["AAAAA1111A"][0].amount, dec("1000.00"));
        assert_eq!(first.graph.get("AAAAA1111A").unwrap().entity_name, "Root Co");

        let second = resolve("AAAAA1111A", &provider);
        assert_eq!(second.records["AAAAA1111A"], first.records["AAAAA1111A"]);
        let cache = provider.cache().unwrap();
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn test_duplicate_pan_keeps_first_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("AAAAA1111A_b.csv"), "").unwrap();
        fs::write(dir.path().join("AAAAA1111A_a.csv"), "").unwrap();

        let index = FileIndex::scan(dir.path()).unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.get("AAAAA1111A").unwrap().ends_with("AAAAA1111A_a.csv"));
    }
}
