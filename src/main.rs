use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use gst_hierarchy::summary::{high_contamination, HIGH_CONTAMINATION_LIMIT};
use gst_hierarchy::{pipeline, AnalysisConfig, AnalysisSummary, EntityGraph, GraphSnapshot};

const DEFAULT_CONFIG_PATH: &str = "config/settings.yaml";

#[derive(Parser)]
#[command(name = "gst-hierarchy")]
#[command(about = "GST entity hierarchy analysis: bogus and contaminated entity detection")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML or JSON)
    #[arg(long, short = 'c', global = true, env = "GST_CONFIG")]
    config: Option<PathBuf>,

    /// Environment preset (development, production, testing) used when no file is given
    #[arg(long, global = true, env = "GST_ENV")]
    env: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse spreadsheets, classify entities and publish the snapshot
    Analyze {
        /// Root entity PAN
        #[arg(long)]
        root: Option<String>,

        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Bogus threshold t in (0, 1); normal band is [1-t, 1/(1-t)]
        #[arg(long)]
        threshold: Option<f64>,

        /// Parse every file even when the cache has it
        #[arg(long)]
        no_cache: bool,
    },

    /// List entities without parents in the last published snapshot
    Roots,

    /// Summary statistics of the last published snapshot
    Summary {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Browse the last published snapshot in the terminal
    Browse,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_tracing(&config.log_level);

    match cli.command {
        Commands::Analyze {
            root,
            data_dir,
            output_dir,
            threshold,
            no_cache,
        } => {
            let mut config = config;
            if let Some(root) = root {
                config.root_node_id = root;
            }
            if let Some(dir) = data_dir {
                config.data_directory = dir;
            }
            if let Some(dir) = output_dir {
                config.output_directory = dir;
            }
            if let Some(t) = threshold {
                config.bogus_threshold = t;
            }
            if no_cache {
                config.cache_enabled = false;
            }
            run_analyze(&config)?;
        }
        Commands::Roots => run_roots(&config)?,
        Commands::Summary { json } => run_summary(&config, json)?,
        Commands::Browse => run_browse(&config)?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AnalysisConfig> {
    let mut config = match (&cli.config, &cli.env) {
        (Some(path), _) => AnalysisConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        (None, Some(env)) => AnalysisConfig::for_environment(env),
        (None, None) => AnalysisConfig::load_or_default(DEFAULT_CONFIG_PATH)?,
    };
    config
        .apply_env_overrides()
        .context("applying GST_* environment overrides")?;
    Ok(config)
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_snapshot(config: &AnalysisConfig) -> Result<GraphSnapshot> {
    GraphSnapshot::load(&config.output_directory).with_context(|| {
        format!(
            "no analysis snapshot in {} (run `gst-hierarchy analyze` first)",
            config.output_directory.display()
        )
    })
}

fn run_analyze(config: &AnalysisConfig) -> Result<()> {
    println!("🔍 GST Hierarchy Analysis");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("📂 Data:      {}", config.data_directory.display());
    println!("📤 Output:    {}", config.output_directory.display());
    println!("🌳 Root:      {}", config.root_id());
    println!("⚖️  Threshold: {}", config.bogus_threshold);

    let outcome = pipeline::run(config).context("analysis failed")?;
    let m = &outcome.metrics;

    println!("\n✓ Root used: {}", outcome.root_id);
    println!("✓ Entities: {} ({} with data, {} missing)", m.nodes, m.entities_with_data, m.missing);
    println!("✓ Bogus: {}", m.bogus);
    println!("✓ Contaminated: {}", m.contaminated);
    if m.cache_hits + m.cache_misses > 0 {
        println!("✓ Parse cache: {} hits, {} misses", m.cache_hits, m.cache_misses);
    }
    if m.dropped_edges > 0 {
        println!("⚠️  {} edge(s) dropped to keep the hierarchy acyclic", m.dropped_edges);
    }

    if !outcome.errors.is_empty() {
        println!("\n⚠️  {} recoverable issue(s):", outcome.errors.len());
        for error in outcome.errors.iter().take(10) {
            println!("   - {}", error);
        }
        if outcome.errors.len() > 10 {
            println!("   … and {} more", outcome.errors.len() - 10);
        }
    }

    println!("\n━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for path in &outcome.published {
        println!("💾 {}", path.display());
    }
    println!("✅ Analysis complete in {} ms (run {})", m.duration_ms, m.run_id);
    Ok(())
}

fn run_roots(config: &AnalysisConfig) -> Result<()> {
    let snapshot = load_snapshot(config)?;
    let graph = EntityGraph::from_snapshot(&snapshot);

    println!("🌳 Root entities");
    for node in graph.roots() {
        println!(
            "  {}  {:<40} {:>3} children  {}",
            node.id,
            node.entity_name,
            node.children_ids.len(),
            node.status.as_str()
        );
    }
    Ok(())
}

fn run_summary(config: &AnalysisConfig, json: bool) -> Result<()> {
    let snapshot = load_snapshot(config)?;
    let summary = AnalysisSummary::from_snapshot(&snapshot, config.risk_threshold);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("📊 Analysis Summary");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Entities:        {}", summary.total_nodes);
    println!("Bogus:           {} ({:.2}%)", summary.bogus_nodes, summary.bogus_percentage);
    println!(
        "Contaminated:    {} ({:.2}%)",
        summary.contaminated_nodes, summary.contaminated_percentage
    );
    println!("Missing data:    {}", summary.missing_nodes);
    println!("High risk (>{}): {}", config.risk_threshold, summary.high_risk_nodes);
    println!("Total sales:     {}", summary.total_sales.round_dp(2));
    println!("Total purchases: {}", summary.total_purchases.round_dp(2));
    println!("Bogus value:     {}", summary.total_bogus_value.round_dp(2));
    println!("Overall P/S:     {}", summary.overall_ps_ratio);

    let d = &summary.contamination_distribution;
    println!("\nContamination distribution");
    println!("  None       {}", d.none);
    println!("  Low        {}", d.low);
    println!("  Medium     {}", d.medium);
    println!("  High       {}", d.high);
    println!("  Very High  {}", d.very_high);

    let flagged = high_contamination(&snapshot, HIGH_CONTAMINATION_LIMIT);
    if !flagged.is_empty() {
        println!("\n🚩 Highest contamination");
        for node in flagged {
            println!(
                "  {}  {:<40} {}%",
                node.pan,
                node.entity_name,
                node.contamination_level.round_dp(2)
            );
        }
    }
    Ok(())
}

#[cfg(feature = "tui")]
fn run_browse(config: &AnalysisConfig) -> Result<()> {
    use gst_hierarchy::ui;

    println!("🖥️  Loading GST hierarchy browser...\n");
    let snapshot = load_snapshot(config)?;
    println!("✓ Loaded {} entities\n", snapshot.nodes.len());

    let mut app = ui::App::new(&snapshot);
    ui::run_ui(&mut app)?;

    println!("\n✅ Browser closed");
    Ok(())
}

#[cfg(not(feature = "tui"))]
fn run_browse(_config: &AnalysisConfig) -> Result<()> {
    eprintln!("❌ Terminal browser not available!");
    eprintln!("   Rebuild with: cargo build --features tui");
    eprintln!("   Or use the web API: cargo run --bin gst-server --features server");
    std::process::exit(1);
}
