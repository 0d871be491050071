// GST Hierarchy Analysis - Web Server
// Read-only REST API over the last published snapshot

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use gst_hierarchy::summary::{high_contamination, sales_view, HIGH_CONTAMINATION_LIMIT};
use gst_hierarchy::{AnalysisConfig, AnalysisSummary, EntityGraph, GraphSnapshot, NodeRecord, VisibleNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const SEARCH_LIMIT: usize = 10;

/// Snapshot plus the graph rebuilt from it, swapped whole on reload
struct Loaded {
    snapshot: GraphSnapshot,
    graph: EntityGraph,
}

impl Loaded {
    fn new(snapshot: GraphSnapshot) -> Self {
        let graph = EntityGraph::from_snapshot(&snapshot);
        Loaded { snapshot, graph }
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    config: Arc<AnalysisConfig>,
    current: Arc<RwLock<Option<Arc<Loaded>>>>,
}

impl AppState {
    fn new(config: AnalysisConfig, loaded: Option<Loaded>) -> Self {
        AppState {
            config: Arc::new(config),
            current: Arc::new(RwLock::new(loaded.map(Arc::new))),
        }
    }

    fn current(&self) -> Option<Arc<Loaded>> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace(&self, loaded: Loaded) {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(Arc::new(loaded));
    }
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

fn ok<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(ApiResponse::ok(data))).into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let body = ApiResponse {
        success: false,
        data: (),
        error: Some(message.into()),
    };
    (status, Json(body)).into_response()
}

fn no_snapshot() -> Response {
    error_response(StatusCode::NOT_FOUND, "Analysis data not found")
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
    snapshot_loaded: bool,
}

#[derive(Serialize)]
struct ConfigResponse {
    root_node_pan: String,
    bogus_threshold: f64,
    risk_threshold: f64,
}

#[derive(Serialize)]
struct RootResponse {
    pan: String,
    entity_name: String,
    children: usize,
    status: &'static str,
}

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
}

#[derive(Deserialize)]
struct TreeParams {
    /// Comma-separated ids of expanded nodes
    #[serde(default)]
    expanded: String,
    /// Tree root; defaults to the snapshot root
    root: Option<String>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /health - Health check
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        service: "GST Hierarchy Analysis",
        version: gst_hierarchy::VERSION,
        snapshot_loaded: state.current().is_some(),
    })
}

/// GET /api/config - Analysis settings the snapshot was produced with
async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    ok(ConfigResponse {
        root_node_pan: state.config.root_id(),
        bogus_threshold: state.config.bogus_threshold,
        risk_threshold: state.config.risk_threshold,
    })
}

/// GET /api/nodes - Full node table
async fn get_nodes(State(state): State<AppState>) -> impl IntoResponse {
    match state.current() {
        Some(loaded) => ok(&loaded.snapshot.nodes),
        None => no_snapshot(),
    }
}

/// GET /api/names - PAN → entity name
async fn get_names(State(state): State<AppState>) -> impl IntoResponse {
    match state.current() {
        Some(loaded) => ok(&loaded.snapshot.names),
        None => no_snapshot(),
    }
}

/// GET /api/availability - PAN → has spreadsheet
async fn get_availability(State(state): State<AppState>) -> impl IntoResponse {
    match state.current() {
        Some(loaded) => ok(&loaded.snapshot.availability),
        None => no_snapshot(),
    }
}

/// GET /api/sales/:pan - Sales detail of one seller
async fn get_sales(State(state): State<AppState>, Path(pan): Path<String>) -> impl IntoResponse {
    let Some(loaded) = state.current() else {
        return no_snapshot();
    };

    // Decode URL-encoded PAN
    let pan = urlencoding::decode(&pan)
        .map(|p| p.into_owned())
        .unwrap_or_else(|_| pan.clone())
        .trim()
        .to_uppercase();

    match sales_view(&loaded.snapshot, &pan) {
        Some(view) => ok(view),
        None => error_response(StatusCode::NOT_FOUND, format!("No data found for PAN: {}", pan)),
    }
}

/// GET /api/analysis/summary - Dashboard statistics
async fn get_summary(State(state): State<AppState>) -> impl IntoResponse {
    match state.current() {
        Some(loaded) => ok(AnalysisSummary::from_snapshot(
            &loaded.snapshot,
            state.config.risk_threshold,
        )),
        None => no_snapshot(),
    }
}

/// GET /api/analysis/high-contamination - Top entities above 50%
async fn get_high_contamination(State(state): State<AppState>) -> impl IntoResponse {
    match state.current() {
        Some(loaded) => ok(high_contamination(&loaded.snapshot, HIGH_CONTAMINATION_LIMIT)),
        None => no_snapshot(),
    }
}

/// GET /api/analysis/search?q= - PAN or name substring search
async fn search_entities(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> impl IntoResponse {
    let Some(loaded) = state.current() else {
        return no_snapshot();
    };

    let results: Vec<&NodeRecord> = loaded
        .graph
        .search(&params.q)
        .into_iter()
        .filter_map(|node| loaded.snapshot.node(&node.id))
        .take(SEARCH_LIMIT)
        .collect();
    ok(results)
}

/// GET /api/tree/visible?expanded=A,B - Rows of the expandable tree
async fn get_visible_tree(
    State(state): State<AppState>,
    Query(params): Query<TreeParams>,
) -> impl IntoResponse {
    let Some(loaded) = state.current() else {
        return no_snapshot();
    };

    let root = match params.root {
        Some(root) => root.trim().to_uppercase(),
        None => loaded.snapshot.root_id().unwrap_or_default().to_string(),
    };
    if !loaded.graph.contains(&root) {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown root: {}", root));
    }

    let expanded: HashSet<String> = params
        .expanded
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect();

    let rows: Vec<VisibleNode> = loaded.graph.visible_nodes(&root, &expanded).collect();
    ok(rows)
}

/// GET /api/roots - Entities without parents
async fn get_roots(State(state): State<AppState>) -> impl IntoResponse {
    let Some(loaded) = state.current() else {
        return no_snapshot();
    };

    let roots: Vec<RootResponse> = loaded
        .graph
        .roots()
        .into_iter()
        .map(|node| RootResponse {
            pan: node.id.clone(),
            entity_name: node.entity_name.clone(),
            children: node.children_ids.len(),
            status: node.status.as_str(),
        })
        .collect();
    ok(roots)
}

/// POST /api/reload - Re-read the published snapshot from disk
async fn reload_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    let dir = state.config.output_directory.clone();
    let result = tokio::task::spawn_blocking(move || GraphSnapshot::load(&dir)).await;

    match result {
        Ok(Ok(snapshot)) => {
            let nodes = snapshot.nodes.len();
            state.replace(Loaded::new(snapshot));
            info!(nodes, "snapshot reloaded");
            ok(serde_json::json!({ "nodes": nodes }))
        }
        Ok(Err(e)) => {
            warn!(error = %e, "snapshot reload failed");
            error_response(StatusCode::NOT_FOUND, e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/config", get(get_config))
        .route("/nodes", get(get_nodes))
        .route("/names", get(get_names))
        .route("/availability", get(get_availability))
        .route("/sales/:pan", get(get_sales))
        .route("/analysis/summary", get(get_summary))
        .route("/analysis/high-contamination", get(get_high_contamination))
        .route("/analysis/search", get(search_entities))
        .route("/tree/visible", get(get_visible_tree))
        .route("/roots", get(get_roots))
        .route("/reload", post(reload_snapshot))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health_check))
        .with_state(state)
        .nest("/api", api_routes)
        .nest_service("/static", ServeDir::new("web"))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::var("GST_CONFIG").unwrap_or_else(|_| "config/settings.yaml".to_string());
    let mut config = AnalysisConfig::load_or_default(&config_path)?;
    config.apply_env_overrides()?;
    config.validate()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("{},tower_http=info", config.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    println!("🌐 GST Hierarchy Analysis - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let loaded = match GraphSnapshot::load(&config.output_directory) {
        Ok(snapshot) => {
            println!("✓ Snapshot loaded: {} entities", snapshot.nodes.len());
            Some(Loaded::new(snapshot))
        }
        Err(e) => {
            eprintln!("⚠️  No snapshot yet ({})", e);
            eprintln!("   Run: gst-hierarchy analyze");
            eprintln!("   then POST /api/reload");
            None
        }
    };

    let addr = format!("{}:{}", config.web_host, config.web_port);
    let app = build_router(AppState::new(config, loaded));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/nodes", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use gst_hierarchy::{EntityNode, Status};
    use tower::ServiceExt;

    fn sample_snapshot() -> GraphSnapshot {
        let mut graph = EntityGraph::new();
        for (id, name) in [
            ("AAAAA1111A", "Root Co"),
            ("BBBBB2222B", "Beta Steel"),
            ("CCCCC3333C", "Gamma"),
        ] {
            let mut node = EntityNode::new(id, true);
            node.entity_name = name.to_string();
            graph.add_node(node);
        }
        graph.link("AAAAA1111A", "BBBBB2222B");
        graph.link("BBBBB2222B", "CCCCC3333C");
        let c = graph.get_mut("CCCCC3333C").unwrap();
        c.contamination_level = "75".parse().unwrap();
        c.is_contaminated = true;
        c.status = Status::Contaminated;
        GraphSnapshot::from_graph(&graph).unwrap()
    }

    fn app_with(snapshot: Option<GraphSnapshot>) -> Router {
        build_router(AppState::new(AnalysisConfig::default(), snapshot.map(Loaded::new)))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = get_json(app_with(None), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["snapshot_loaded"], false);
    }

    #[tokio::test]
    async fn test_nodes_without_snapshot_is_404() {
        let (status, body) = get_json(app_with(None), "/api/nodes").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_visible_tree() {
        let app = app_with(Some(sample_snapshot()));

        let (_, body) = get_json(app.clone(), "/api/tree/visible").await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = get_json(app, "/api/tree/visible?expanded=AAAAA1111A,bbbbb2222b").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body["data"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[2]["id"], "CCCCC3333C");
        assert_eq!(rows[2]["depth"], 2);
    }

    #[tokio::test]
    async fn test_search_and_high_contamination() {
        let app = app_with(Some(sample_snapshot()));

        let (_, body) = get_json(app.clone(), "/api/analysis/search?q=steel").await;
        assert_eq!(body["data"][0]["PAN"], "BBBBB2222B");

        let (_, body) = get_json(app, "/api/analysis/high-contamination").await;
        let flagged = body["data"].as_array().unwrap();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0]["Status"], "CONTAMINATED");
    }

    #[tokio::test]
    async fn test_sales_unknown_pan() {
        let (status, _) = get_json(app_with(Some(sample_snapshot())), "/api/sales/ZZZZZ9999Z").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_roots_and_summary() {
        let app = app_with(Some(sample_snapshot()));

        let (_, body) = get_json(app.clone(), "/api/roots").await;
        assert_eq!(body["data"][0]["pan"], "AAAAA1111A");
        assert_eq!(body["data"][0]["children"], 1);

        let (_, body) = get_json(app, "/api/analysis/summary").await;
        assert_eq!(body["data"]["total_nodes"], 3);
        assert_eq!(body["data"]["contaminated_nodes"], 1);
    }
}
