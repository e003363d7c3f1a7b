use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use meridian_accel::{AccelParams, AccelerationManager, DeviceKind};
use meridian_assist::{ClaudeSource, FallbackOrchestrator, PerplexitySource, WebSearchSource};
use meridian_clock::TimeSync;
use meridian_config::AppConfig;
use meridian_llm::{LlamaCppModel, LocalModel};
use meridian_runtime::{ControllerAction, PipelineController};
use meridian_search::{SearchCache, SearchParams, WebSearchAggregator};
use meridian_store::DocumentStore;

#[derive(Debug, Parser)]
#[command(name = "meridian", version, about = "A local, on-device AI assistant")]
struct Cli {
    /// Base directory for configuration and persisted state.
    #[arg(long, value_name = "DIR")]
    base_dir: Option<PathBuf>,

    /// Start the local execution bridge at launch.
    #[arg(long)]
    bridge: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // Flag beats environment beats the home-directory default.
    let base_dir = cli
        .base_dir
        .clone()
        .or_else(|| std::env::var("MERIDIAN_BASE_DIR").ok().map(PathBuf::from))
        .unwrap_or_else(|| AppConfig::default().base_dir());
    let mut config = AppConfig::load_from(base_dir.join("meridian.toml"))?;
    config.agent.base_dir = base_dir.display().to_string();

    let store = Arc::new(
        DocumentStore::open(config.base_dir()).context("open state directory")?,
    );

    // Logging: stderr at the configured level plus a daily rolling file.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone()));
    let file_appender = tracing_appender::rolling::daily(config.logs_dir(), "meridian.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr).compact())
        .with(tracing_subscriber::fmt::layer().with_writer(file_writer).with_ansi(false))
        .init();

    // Clock: background refresh for temporal awareness.
    let clock = Arc::new(TimeSync::new(
        &config.clock.knowledge_cutoff,
        Duration::from_secs(config.clock.sync_interval_secs),
        Some(Arc::clone(&store)),
    ));
    clock.start();

    // Local model.
    let binary = PathBuf::from(&config.llm.binary_path);
    let binary = if binary.exists() {
        binary
    } else {
        LlamaCppModel::locate_binary("./llama.cpp").unwrap_or(binary)
    };
    let model = LlamaCppModel::new(
        binary.clone(),
        &config.llm.model_path,
        Duration::from_secs(config.llm.timeout_secs),
    );
    if !model.available() {
        warn!(
            binary = %binary.display(),
            model = %config.llm.model_path,
            "local model not found; prompts will rely on external sources"
        );
    }

    // Acceleration: report the device the model would run on.
    let mut accel_params = AccelParams {
        battery_threshold_pct: config.accel.battery_threshold_pct,
        temp_threshold_c: config.accel.temp_threshold_c,
        profile_ttl: Duration::from_secs(config.accel.profile_ttl_hours as u64 * 3600),
        npu_sdk_env: config.accel.npu_sdk_env.clone(),
        ..AccelParams::default()
    };
    accel_params.engines.insert(DeviceKind::Cpu, binary);
    let accel = AccelerationManager::new(Arc::clone(&store), accel_params);
    let assigned = accel.assign_device(&config.llm.model_path, "auto").await;
    info!(device = assigned.as_str(), "inference device assigned");

    // Fallback cascade: web search, then the research CLI, then the hosted
    // assistant endpoint.
    let search_params = SearchParams {
        max_workers: config.search.max_workers,
        overall_timeout: Duration::from_secs(config.search.overall_timeout_secs),
        per_source_timeout: Duration::from_secs(config.search.per_source_timeout_secs),
        use_cache: config.search.use_cache,
    };
    let cache = SearchCache::new(
        Arc::clone(&store),
        Duration::from_secs(config.search.cache_ttl_minutes * 60),
    );
    let aggregator = Arc::new(WebSearchAggregator::with_default_sources(cache, search_params));
    let assist_timeout = Duration::from_secs(config.assist.per_source_timeout_secs);
    let orchestrator = FallbackOrchestrator::new(
        vec![
            Arc::new(WebSearchSource::new(aggregator)),
            Arc::new(PerplexitySource::new(
                config.assist.perplexity_command.clone(),
                assist_timeout,
            )),
            Arc::new(ClaudeSource::new(
                config.assist.claude_endpoint.clone(),
                std::env::var(&config.assist.api_key_env).ok(),
                assist_timeout,
            )),
        ],
        Arc::clone(&store),
        assist_timeout,
        config.assist.websearch_min_confidence,
    );

    let agent_name = config.agent.name.clone();
    let mut controller = PipelineController::new(
        config,
        store,
        Arc::clone(&clock),
        Box::new(model),
        orchestrator,
        accel,
    );

    if cli.bridge {
        if let ControllerAction::Reply(text) = controller.process("#bridge").await {
            println!("{text}");
        }
    }

    print_header(&agent_name, controller.assist_enabled());

    // ── Interactive loop ─────────────────────────────────────────────────────

    let stdin = io::stdin();
    loop {
        let Some(input) = read_multiline(&stdin, &agent_name)? else {
            break; // EOF behaves like #exit
        };
        if input.is_empty() {
            continue;
        }

        match controller.process(&input).await {
            ControllerAction::Exit => break,
            ControllerAction::Reply(text) => {
                if !text.is_empty() {
                    println!("\n{text}\n");
                }
            }
        }
    }

    println!("Goodbye!");
    controller.shutdown();
    Ok(())
}

fn print_header(agent_name: &str, assist_enabled: bool) {
    println!("{}", "=".repeat(60));
    println!("{agent_name} — local AI assistant");
    println!("Assist fallback: {}", if assist_enabled { "ON" } else { "OFF" });
    println!("{}", "=".repeat(60));
    println!("Commands: #exit | #help | #assist | #performance | #memory | #feedback | #context\n");
}

/// Read one logical line; a trailing backslash continues onto the next line.
/// Returns `None` on EOF.
fn read_multiline(stdin: &io::Stdin, agent_name: &str) -> Result<Option<String>> {
    print!("{agent_name}> ");
    io::stdout().flush()?;

    let mut lines: Vec<String> = Vec::new();
    loop {
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(if lines.is_empty() { None } else { Some(lines.join("\n")) });
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if let Some(continued) = trimmed.strip_suffix('\\') {
            lines.push(continued.to_string());
            print!("     > ");
            io::stdout().flush()?;
        } else {
            lines.push(trimmed.to_string());
            break;
        }
    }
    Ok(Some(lines.join("\n").trim().to_string()))
}
