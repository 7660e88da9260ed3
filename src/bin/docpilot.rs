//! Service binary: serve the HTTP API or run a one-shot ingest
//!
//! Exit codes: 0 success, 2 configuration error, 3 unrecoverable ingest
//! failure.

use docpilot::api;
use docpilot::config::AssistantConfig;
use docpilot::ingest::{IngestOptions, IngestStatus};
use docpilot::sources::{SourceSpec, SourceType};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: i32 = 2;
const EXIT_INGEST: i32 = 3;

fn usage() -> ! {
    eprintln!(
        "usage:\n  docpilot [--config <path>] serve\n  docpilot [--config <path>] ingest <source_type> <source_spec-json>"
    );
    std::process::exit(EXIT_CONFIG);
}

fn load_config(path: Option<&str>) -> AssistantConfig {
    let mut config = match path {
        Some(path) => match AssistantConfig::from_file(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("failed to load config {path}: {err}");
                std::process::exit(EXIT_CONFIG);
            }
        },
        None => AssistantConfig::default(),
    };

    config.apply_env();
    if let Err(err) = config.validate() {
        eprintln!("invalid configuration: {err}");
        std::process::exit(EXIT_CONFIG);
    }
    config
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut args = args.as_slice();

    let mut config_path: Option<String> = None;
    if args.first().map(String::as_str) == Some("--config") {
        let Some(path) = args.get(1) else { usage() };
        config_path = Some(path.clone());
        args = &args[2..];
    }

    let config = load_config(config_path.as_deref());

    let modes: Vec<&str> = args.iter().map(String::as_str).collect();
    match *modes.as_slice() {
        [] | ["serve"] => serve(config).await,
        ["ingest", source_type, spec_json] => ingest(config, source_type, spec_json).await,
        _ => usage(),
    }
}

async fn serve(config: AssistantConfig) {
    info!("Starting docpilot {}", docpilot::VERSION);

    let result = tokio::select! {
        result = api::serve(config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    };

    if let Err(err) = result {
        error!("Server failed: {}", err);
        std::process::exit(1);
    }
}

async fn ingest(config: AssistantConfig, source_type: &str, spec_json: &str) {
    let source_type: SourceType =
        match serde_json::from_value(serde_json::Value::String(source_type.to_string())) {
            Ok(source_type) => source_type,
            Err(_) => {
                eprintln!("unknown source type: {source_type}");
                std::process::exit(EXIT_CONFIG);
            }
        };

    let spec: SourceSpec = match serde_json::from_str(spec_json) {
        Ok(spec) => spec,
        Err(err) => {
            eprintln!("invalid source spec: {err}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let state = match api::AppState::new(config).await {
        Ok(state) => state,
        Err(err) => {
            eprintln!("failed to initialize: {err}");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let cancel = CancellationToken::new();
    let ingest_options = IngestOptions::default();
    let job = state
        .ingestion
        .ingest(source_type, &spec, &ingest_options, &cancel);

    let report = tokio::select! {
        result = job => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            info!("Ingest cancelled");
            return;
        }
    };

    match report {
        Ok(report) => {
            info!(
                "Ingest finished: {} vectors upserted, {} failed",
                report.vectors_upserted,
                report.failed.len()
            );
            if report.status == IngestStatus::CompletedWithErrors {
                for failed in &report.failed {
                    error!("  {}: {}", failed.path, failed.reason);
                }
            }
        }
        Err(err) => {
            error!("Ingest failed: {}", err);
            std::process::exit(EXIT_INGEST);
        }
    }
}
