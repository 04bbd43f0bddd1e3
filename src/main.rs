use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use intelliextract::config::Config;
use intelliextract::coordinator::{ExecuteRequest, ProgressEvent, WorkflowCoordinator};
use intelliextract::extraction_client::{ExtractionClient, HttpExtractionClient, MockExtractionClient};
use intelliextract::object_store::S3ObjectStore;
use intelliextract::progress::ProgressStream;
use intelliextract::report::{JsonFileReportSink, NullReportSink, ReportSink};
use intelliextract::store::{CaseId, SqliteRecordStore};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "intelliextract", about = "Resumable batch extraction pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Mirror configured buckets into local staging.
    Sync {
        #[arg(long, value_parser = parse_pair)]
        pair: Vec<(String, String)>,
    },
    /// Submit staged files to the extraction API.
    Extract {
        #[arg(long, value_parser = parse_pair)]
        pair: Vec<(String, String)>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        requests_per_second: Option<u32>,
        #[arg(long)]
        retry_failed: bool,
        #[arg(long)]
        skip_completed: bool,
    },
    /// Sync then extract in one run.
    Pipe {
        #[arg(long, value_parser = parse_pair)]
        pair: Vec<(String, String)>,
    },
    /// Clean up a partially-downloaded file left by a crashed run.
    Resume,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    let (tenant, purchaser) = s
        .split_once(':')
        .ok_or_else(|| "expected tenant:purchaser".to_string())?;
    Ok((tenant.to_string(), purchaser.to_string()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(20);
        }
    };

    init_tracing(&config);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = e.to_string();
            tracing::error!(error = %message, "run failed");
            if message.starts_with("configuration error") {
                ExitCode::from(20)
            } else if message.starts_with("network unreachable") {
                ExitCode::from(10)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

fn init_tracing(config: &Config) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stdout_layer = fmt::layer().with_target(false);

    let registry = tracing_subscriber::registry().with(env_filter).with(stdout_layer);

    if let Some(log_file) = &config.log_file {
        let directory = log_file.parent().unwrap_or_else(|| std::path::Path::new("."));
        let file_name = log_file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("intelliextract.log");
        let file_appender = tracing_appender::rolling::daily(directory, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        // Leak the guard so the background writer stays alive for the process lifetime.
        Box::leak(Box::new(guard));
        let json_layer = fmt::layer().json().with_writer(non_blocking);
        registry.with(json_layer).init();
    } else {
        registry.init();
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let cli = Cli::parse();
    let progress = ProgressStream::new();

    let store = Arc::new(SqliteRecordStore::open(&config.checkpoint_path).await?);
    let object_store = Arc::new(S3ObjectStore::from_env().await);
    let extraction_client: Arc<dyn ExtractionClient> = if config.use_mock_extraction {
        Arc::new(MockExtractionClient::default())
    } else {
        Arc::new(HttpExtractionClient::new(
            config.extraction_base_url.clone(),
            config.auth.clone(),
            std::time::Duration::from_secs(config.request_timeout_secs),
        )?)
    };
    let report_sink: Arc<dyn ReportSink> = match &config.report_dir {
        Some(dir) => Arc::new(JsonFileReportSink::new(dir.clone())),
        None => Arc::new(NullReportSink),
    };

    let coordinator = WorkflowCoordinator::new(
        store.clone(),
        object_store,
        extraction_client,
        report_sink,
        config.clone(),
    );

    let (case_id, pairs, retry_failed, concurrency, requests_per_second, skip_completed) =
        match cli.command {
            Command::Sync { pair } => (CaseId::Sync, pair, false, None, None, false),
            Command::Extract {
                pair,
                concurrency,
                requests_per_second,
                retry_failed,
                skip_completed,
            } => (
                CaseId::Extract,
                pair,
                retry_failed,
                concurrency,
                requests_per_second,
                skip_completed,
            ),
            Command::Pipe { pair } => (CaseId::Pipe, pair, false, None, None, false),
            Command::Resume => {
                // Resume is a maintenance op, not a run: clean the dangling
                // partial download and exit.
                intelliextract::sync_engine::recover_dangling_download(store.as_ref()).await?;
                progress.log("resume: cleaned up partial download state");
                return Ok(());
            }
        };

    let request = ExecuteRequest {
        case_id,
        pairs,
        retry_failed,
        concurrency,
        requests_per_second,
        skip_completed,
    };

    let on_update: intelliextract::coordinator::OnUpdate = Arc::new(move |event| match event {
        ProgressEvent::RunId(id) => tracing::info!(run_id = %id, "run started"),
        ProgressEvent::Log(message) => {
            tracing::info!("{message}");
            progress.log(&message);
        }
        ProgressEvent::Progress { phase, done, total } => {
            tracing::debug!(phase, done, total, "progress");
        }
        ProgressEvent::ResumeSkip { already, total } => {
            progress.resume_skip(already, total);
        }
        ProgressEvent::CumulativeMetrics {
            success,
            failed,
            total,
        } => {
            progress.cumulative_metrics(success, failed, total);
        }
        ProgressEvent::Report(metrics) => {
            tracing::info!(
                success = metrics.success,
                failed = metrics.failed,
                skipped = metrics.skipped,
                "run summary"
            );
        }
        ProgressEvent::Error(message) => tracing::error!("{message}"),
    });

    let outcome = coordinator.execute(request, on_update).await;

    if let Err(e) = store.backup().await {
        tracing::warn!(error = %e, "disaster-recovery backup copy failed");
    }

    outcome?;
    Ok(())
}
