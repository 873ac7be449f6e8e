use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use attachment_pipeline::config::PipelineConfig;
use attachment_pipeline::llm::{LlmConfig, create_provider, create_vision};
use attachment_pipeline::pipeline::{
    ConvertStage, ExtractStage, FetchStage, Pipeline, RunReport, StageRunner,
};
use attachment_pipeline::rasterize::PdfToPpm;
use attachment_pipeline::schema::{LlmSchemaRegistry, SchemaRegistry};
use attachment_pipeline::source::{ImapConfig, ImapSource};
use attachment_pipeline::store::{ItemKey, Ledger, LibSqlLedger, Stage, Status};
use attachment_pipeline::workspace::Workspace;

#[derive(Parser, Debug)]
#[command(name = "attachment-pipeline")]
#[command(author, version, about = "Fetch, extract and convert email attachments")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run fetch, extract and convert in order (default)
    Run,
    /// Download new attachments from the mailbox
    Fetch,
    /// Transcribe downloaded documents
    Extract,
    /// Turn extracted text into structured records
    Convert,
    /// Show Ledger statistics
    Status {
        /// Number of recent rows to list
        #[arg(long, default_value_t = 10)]
        recent: usize,
    },
    /// Make a failed item eligible for the next run
    Retry {
        source_id: String,
        attachment_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _ = dotenvy::dotenv();

    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    let config = PipelineConfig::from_env()?;
    let _log_guard = init_logging(config.log_dir.as_deref())?;

    let workspace = Workspace::new(config.base_dir.clone());
    workspace
        .ensure_dirs()
        .await
        .context("Failed to create workspace directories")?;

    let ledger: Arc<dyn Ledger> = Arc::new(
        LibSqlLedger::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open ledger at {}", config.db_path.display()))?,
    );

    let stages: Vec<Stage> = match cli.command.unwrap_or(Command::Run) {
        Command::Status { recent } => {
            print_status(ledger.as_ref(), recent).await?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Retry {
            source_id,
            attachment_id,
        } => {
            let row = ledger.rearm(&ItemKey::new(source_id, attachment_id)).await?;
            let failed_from = row.failed_from.map(|s| s.to_string()).unwrap_or_default();
            println!(
                "{} re-armed; the next run retries it from {failed_from}",
                row.key
            );
            return Ok(ExitCode::SUCCESS);
        }
        Command::Run => Stage::ORDER.to_vec(),
        Command::Fetch => vec![Stage::Fetch],
        Command::Extract => vec![Stage::Extract],
        Command::Convert => vec![Stage::Convert],
    };
    let explicit_fetch = stages == [Stage::Fetch];

    let pipeline = build_pipeline(&stages, explicit_fetch, &config, &ledger, &workspace)?;
    let report = pipeline.run().await?;
    print_report(&report, &pipeline.stages());

    let summary = ledger.summary(0).await?;
    let failed = summary.count(Status::Failed);
    if failed > 0 {
        eprintln!("{failed} item(s) in failed state; see `attachment-pipeline status`");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn init_logging(log_dir: Option<&Path>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).context("Failed to create log directory")?;
            let appender = tracing_appender::rolling::daily(dir, "attachment-pipeline.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_target(false)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}

fn build_pipeline(
    stages: &[Stage],
    explicit_fetch: bool,
    config: &PipelineConfig,
    ledger: &Arc<dyn Ledger>,
    workspace: &Workspace,
) -> anyhow::Result<Pipeline> {
    let mut pipeline = Pipeline::new();

    if stages.contains(&Stage::Fetch) {
        match ImapConfig::from_env()? {
            Some(imap) => {
                tracing::info!(host = %imap.host, mailbox = %imap.mailbox, "Mail source configured");
                let fetch: Arc<dyn StageRunner> = Arc::new(FetchStage::new(
                    Arc::clone(ledger),
                    Arc::new(ImapSource::new(imap)),
                    workspace.clone(),
                    config.clone(),
                ));
                pipeline = pipeline.with_stage(fetch);
            }
            None if explicit_fetch => bail!("IMAP_HOST is not set; nothing to fetch from"),
            None => tracing::warn!("IMAP_HOST is not set, skipping fetch"),
        }
    }

    if stages.contains(&Stage::Extract) || stages.contains(&Stage::Convert) {
        let llm_config = LlmConfig::from_env()?;

        if stages.contains(&Stage::Extract) {
            let extract: Arc<dyn StageRunner> = Arc::new(ExtractStage::new(
                Arc::clone(ledger),
                Arc::new(PdfToPpm::new(config.render_dpi)),
                create_vision(&llm_config)?,
                workspace.clone(),
            ));
            pipeline = pipeline.with_stage(extract);
        }

        if stages.contains(&Stage::Convert) {
            let llm = create_provider(&llm_config)?;
            let registry: Arc<dyn SchemaRegistry> = match &config.schemas_path {
                Some(path) => Arc::new(LlmSchemaRegistry::from_file(path, llm)?),
                None => Arc::new(LlmSchemaRegistry::builtin(llm)?),
            };
            let convert: Arc<dyn StageRunner> = Arc::new(ConvertStage::new(
                Arc::clone(ledger),
                registry,
                workspace.clone(),
            ));
            pipeline = pipeline.with_stage(convert);
        }
    }

    Ok(pipeline)
}

fn print_report(report: &RunReport, stages: &[Stage]) {
    for outcome in report.notable() {
        println!("{outcome}");
    }
    println!("\nRun {}", report.run_id);
    for stage in stages {
        let counts = report.counts(*stage);
        println!(
            "  {:<8} succeeded {:>4}  failed {:>4}  skipped {:>4}",
            stage.as_str(),
            counts.succeeded,
            counts.failed,
            counts.skipped
        );
    }
    if report.conflicts > 0 {
        println!("  {} row(s) advanced concurrently by another run", report.conflicts);
    }
}

async fn print_status(ledger: &dyn Ledger, recent: usize) -> anyhow::Result<()> {
    let summary = ledger.summary(recent).await?;

    println!("Items: {}", summary.total);
    for status in Status::ALL {
        println!("  {:<11} {:>6}", status.as_str(), summary.count(status));
    }
    println!(
        "Sources: {}  Threads: {}  Senders: {}",
        summary.unique_sources, summary.unique_threads, summary.unique_senders
    );
    if !summary.by_extension.is_empty() {
        let parts: Vec<String> = summary
            .by_extension
            .iter()
            .map(|(ext, n)| format!("{ext}={n}"))
            .collect();
        println!("Extensions: {}", parts.join(" "));
    }

    let failed: Vec<_> = ledger
        .list_rows()
        .await?
        .into_iter()
        .filter(|r| r.status == Status::Failed)
        .collect();
    if !failed.is_empty() {
        println!("\nFailed:");
        for row in &failed {
            println!(
                "  {} ({}) from {} [{}{}]: {}",
                row.key,
                row.attachment_name,
                row.failed_from.map(|s| s.as_str()).unwrap_or("?"),
                row.failure_kind.map(|k| k.as_str()).unwrap_or("?"),
                if row.retryable { ", will retry" } else { "" },
                row.error_detail.as_deref().unwrap_or("")
            );
        }
    }

    if !summary.recent.is_empty() {
        println!("\nRecent:");
        for row in &summary.recent {
            println!(
                "  {}  {:<10} {} ({})",
                row.created_at.format("%Y-%m-%d %H:%M"),
                row.status.as_str(),
                row.attachment_name,
                row.key
            );
        }
    }
    Ok(())
}
