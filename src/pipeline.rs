// 🔄 Analysis Pipeline - Loader → Resolver → Aggregator → Classifier → Exporter
//
// Stages run strictly in sequence. The deadline is checked between stages and
// nothing is published unless every stage succeeded.

use crate::aggregator::apply_aggregates;
use crate::cache::ParseCache;
use crate::classifier::{ClassificationSummary, Classifier};
use crate::config::AnalysisConfig;
use crate::error::{AnalysisError, AnalysisResult};
use crate::exporter::{GraphSnapshot, SnapshotWriter};
use crate::resolver::{resolve, select_root, DirectoryProvider, FileIndex, RecordProvider};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, info_span, warn};
use uuid::Uuid;

// ============================================================================
// DEADLINE
// ============================================================================

/// Wall-clock budget for one run
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    budget: Option<Duration>,
}

impl Deadline {
    pub fn new(budget: Option<Duration>) -> Self {
        Deadline {
            started: Instant::now(),
            budget,
        }
    }

    /// Fails with `Timeout` once the budget is spent
    pub fn check(&self, stage: &'static str) -> AnalysisResult<()> {
        match self.budget {
            Some(budget) if self.started.elapsed() >= budget => {
                Err(AnalysisError::Timeout { stage })
            }
            _ => Ok(()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

// ============================================================================
// RUN RESULT
// ============================================================================

/// Counters for one run. Logged and returned, never written into the snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RunMetrics {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub nodes: usize,
    pub entities_with_data: usize,
    pub missing: usize,
    pub bogus: usize,
    pub contaminated: usize,
    pub recoverable_errors: usize,
    pub dropped_edges: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

#[derive(Debug)]
pub struct AnalysisOutcome {
    /// Root the run actually started from
    pub root_id: String,
    pub snapshot: GraphSnapshot,
    pub classification: ClassificationSummary,
    /// Row- and entity-scoped problems that did not stop the run
    pub errors: Vec<AnalysisError>,
    pub metrics: RunMetrics,
    /// Files written by `run`; empty for `analyze`
    pub published: Vec<PathBuf>,
}

// ============================================================================
// ENTRY POINTS
// ============================================================================

/// Run every stage against `provider` without publishing
pub fn analyze(config: &AnalysisConfig, provider: &dyn RecordProvider) -> AnalysisResult<AnalysisOutcome> {
    analyze_within(config, provider, Deadline::new(config.timeout()))
}

fn analyze_within(
    config: &AnalysisConfig,
    provider: &dyn RecordProvider,
    deadline: Deadline,
) -> AnalysisResult<AnalysisOutcome> {
    config.validate()?;
    let classifier = Classifier::new(config.threshold_band()?, config.risk_weights);

    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    let root_id = select_root(&config.root_id(), config.root_file.as_deref(), provider);

    let span = info_span!("analysis", run_id = %run_id, root = %root_id);
    let _enter = span.enter();
    info!("analysis started");

    // 1-2. Load + resolve
    let resolved = resolve(&root_id, provider);
    deadline.check("resolve")?;

    let entities_with_data = resolved.records.len();
    let dropped_edges = resolved.dropped_edges.len();
    let mut graph = resolved.graph;
    let mut errors = resolved.errors;

    // 3. Aggregate
    errors.extend(apply_aggregates(&mut graph, &resolved.records));
    deadline.check("aggregate")?;

    // 4. Classify
    let classification = classifier.classify(&mut graph)?;
    deadline.check("classify")?;

    // 5. Snapshot
    let snapshot = GraphSnapshot::from_graph(&graph)?;
    deadline.check("export")?;

    let metrics = RunMetrics {
        run_id,
        started_at,
        duration_ms: deadline.elapsed().as_millis() as u64,
        nodes: graph.len(),
        entities_with_data,
        missing: classification.missing,
        bogus: classification.bogus,
        contaminated: classification.contaminated,
        recoverable_errors: errors.len(),
        dropped_edges,
        cache_hits: 0,
        cache_misses: 0,
    };

    info!(
        nodes = metrics.nodes,
        with_data = metrics.entities_with_data,
        recoverable_errors = metrics.recoverable_errors,
        duration_ms = metrics.duration_ms,
        "analysis finished"
    );

    Ok(AnalysisOutcome {
        root_id: resolved.root_id,
        snapshot,
        classification,
        errors,
        metrics,
        published: Vec::new(),
    })
}

/// Analyze `provider` and publish the snapshot to the configured output directory
pub fn run_with_provider(
    config: &AnalysisConfig,
    provider: &dyn RecordProvider,
) -> AnalysisResult<AnalysisOutcome> {
    let mut outcome = analyze(config, provider)?;
    outcome.published = SnapshotWriter::new(&config.output_directory).publish(&outcome.snapshot)?;
    Ok(outcome)
}

/// Full run over the configured data directory
pub fn run(config: &AnalysisConfig) -> AnalysisResult<AnalysisOutcome> {
    config.validate()?;

    let index = FileIndex::scan(&config.data_directory)?;
    let mut provider = DirectoryProvider::new(index, config.loader_settings());
    if config.cache_enabled {
        match ParseCache::open(&config.cache_path) {
            Ok(cache) => provider = provider.with_cache(cache),
            Err(e) => {
                warn!(path = %config.cache_path.display(), error = %e, "parse cache unavailable, parsing every file");
            }
        }
    }

    let mut outcome = run_with_provider(config, &provider)?;
    if let Some(cache) = provider.cache() {
        outcome.metrics.cache_hits = cache.hits();
        outcome.metrics.cache_misses = cache.misses();
    }
    Ok(outcome)
}
