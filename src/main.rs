use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::{path::PathBuf, sync::Arc};
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

mod client;
mod config;
mod events;
mod metrics;
mod models;
mod monitor;
mod poller;
mod proxy;
mod recent;
mod render;
mod stream;
mod timeline;

use client::BackendClient;
use config::MonitorCfg;
use metrics::MetricTable;
use models::{Depth, ResearchRequest};
use stream::ReplayTransport;
use timeline::LiveRun;

#[derive(Debug, Parser)]
#[command(name = "runscope", version, about = "Live monitor for research-orchestration runs")]
struct Cli {
    /// Optional YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Backend base URL (overrides the config file)
    #[arg(long, global = true, env = "RUNSCOPE_BACKEND_URL")]
    backend: Option<String>,
    /// Where the recent-runs list is kept
    #[arg(long, global = true, env = "RUNSCOPE_STATE")]
    state: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Start a research run
    Start {
        #[arg(long)]
        topic: String,
        #[arg(long, value_enum, default_value_t = Depth::Standard)]
        depth: Depth,
        /// Defaults to the depth preset (3 / 6 / 10)
        #[arg(long)]
        max_sources: Option<u32>,
        /// Comma-separated domain allow-list, e.g. "arxiv.org, nature.com"
        #[arg(long)]
        domains: Option<String>,
        /// Keep watching the new run
        #[arg(long, default_value_t = false)]
        follow: bool,
    },
    /// Live timeline, run list and metrics; defaults to the most recent run
    Watch { run_id: Option<String> },
    /// List runs known to the backend
    Runs,
    /// Show one run's status
    Run { run_id: String },
    /// Parsed metrics snapshot
    Metrics {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Backend health
    Health,
    /// Resend a run's report to the backend's webhook
    Notify { run_id: String },
    /// Fetch a run's report
    Report {
        run_id: String,
        /// Print the report instead of saving it
        #[arg(long, default_value_t = false)]
        inline: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Run ids started from this machine, newest first
    Recent,
    /// Rebuild a timeline from a captured event stream (SSE text or one frame per line)
    Replay {
        file: PathBuf,
        #[arg(long, default_value = "replay")]
        run_id: String,
    },
    /// Serve the report/notify passthrough routes
    Serve {
        #[arg(long, env = "RUNSCOPE_BIND")]
        bind: Option<String>,
    },
}

/// Default report path: a bare file in the working directory, whatever the run id contains.
fn report_file_name(run_id: &str) -> PathBuf {
    let safe: String = run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    PathBuf::from(format!("{safe}-report.md"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("runscope=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = MonitorCfg::load(cli.config.as_deref()).await?;
    if let Some(backend) = cli.backend {
        cfg.backend_url = backend;
    }
    if let Some(state) = cli.state {
        cfg.state_path = state;
    }
    cfg.validate()?;
    let client = BackendClient::new(&cfg.backend_url, cfg.request_timeout())?;

    match cli.cmd {
        Cmd::Start { topic, depth, max_sources, domains, follow } => {
            let req = ResearchRequest::new(&topic, depth, max_sources, domains.as_deref())?;
            let created = client.start_research(&req).await?;
            tracing::info!(run_id = %created.run_id, depth = ?req.depth, max_sources = req.max_sources, "run started");
            match recent::remember(&cfg.state_path, &created.run_id).await {
                Ok(ids) => tracing::debug!(remembered = ids.len(), "recent runs updated"),
                Err(e) => tracing::warn!("could not remember run: {e:#}"),
            }
            println!("{}", created.run_id);
            if follow {
                monitor::watch(client, &cfg, Some(created.run_id)).await?;
            }
        }
        Cmd::Watch { run_id } => {
            let run_id = match run_id {
                Some(id) => Some(id),
                None => recent::load(&cfg.state_path).await.into_iter().next(),
            };
            monitor::watch(client, &cfg, run_id).await?;
        }
        Cmd::Runs => {
            let runs = client.list_runs().await?;
            print!("{}", render::render_runs(&runs));
        }
        Cmd::Run { run_id } => {
            let run = client.get_run(&run_id).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Cmd::Metrics { json } => {
            let table = MetricTable::parse(&client.metrics_text().await?);
            tracing::debug!(series = table.len(), "metrics parsed");
            if json {
                println!("{}", serde_json::to_string_pretty(&table)?);
            } else {
                print!("{}", render::render_metrics(&table));
            }
        }
        Cmd::Health => {
            let h = client.health().await?;
            println!("{} {} v{} (model: {}, search: {})", h.service, h.status, h.version, h.groq_model, h.search_provider);
        }
        Cmd::Notify { run_id } => {
            let resp = client.notify(&run_id).await?;
            let status = resp.status();
            let body = resp.text().await.context("reading notify response")?;
            if !status.is_success() {
                bail!("notify failed: {status}: {body}");
            }
            println!("{body}");
        }
        Cmd::Report { run_id, inline, out } => {
            let resp = client.report(&run_id, inline).await?;
            let status = resp.status();
            let bytes = resp.bytes().await.context("reading report")?;
            if !status.is_success() {
                bail!("report fetch failed: {status}: {}", String::from_utf8_lossy(&bytes));
            }
            if inline && out.is_none() {
                println!("{}", String::from_utf8_lossy(&bytes));
            } else {
                let path = out.unwrap_or_else(|| report_file_name(&run_id));
                tokio::fs::write(&path, &bytes)
                    .await
                    .with_context(|| format!("writing {}", path.display()))?;
                println!("saved {}", path.display());
            }
        }
        Cmd::Recent => {
            for id in recent::load(&cfg.state_path).await {
                println!("{id}");
            }
        }
        Cmd::Replay { file, run_id } => {
            let text = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("reading {}", file.display()))?;
            let transport = ReplayTransport::from_capture(&text);
            tracing::info!(frames = transport.len(), "replaying capture");
            let mut live = LiveRun::new(Arc::new(transport), Arc::new(Notify::new()));
            live.follow(&run_id).await;
            live.drain().await;
            print!("{}", render::render_timeline(&live.snapshot()));
        }
        Cmd::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| cfg.bind.clone());
            proxy::serve(&bind, client).await?;
        }
    }
    Ok(())
}
