use anyhow::Result;
use std::{
    io::{BufRead, Write},
    sync::Arc,
    thread,
};
use tokio::sync::{mpsc, Notify};

use crate::{
    client::BackendClient,
    config::MonitorCfg,
    models::RunSummary,
    poller::{PolledState, RunPoller},
    render::{render_metrics, render_runs, render_timeline},
    stream::SseTransport,
    timeline::{LiveRun, Timeline},
};

/// A line typed while the dashboard is up.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Refresh,
    Follow(String),
    Quit,
}

fn parse_input(line: &str) -> Input {
    match line.trim() {
        "" | "r" | "refresh" => Input::Refresh,
        "q" | "quit" => Input::Quit,
        other => Input::Follow(other.strip_prefix("f ").unwrap_or(other).trim().to_string()),
    }
}

/// Exact id, else the single listed run starting with `prefix`, else `prefix` itself.
fn resolve_run(prefix: &str, runs: &[RunSummary]) -> String {
    if runs.iter().any(|r| r.run_id == prefix) {
        return prefix.to_string();
    }
    let mut hits = runs.iter().filter(|r| r.run_id.starts_with(prefix));
    match (hits.next(), hits.next()) {
        (Some(run), None) => run.run_id.clone(),
        _ => prefix.to_string(),
    }
}

pub fn compose(timeline: &Timeline, streaming: bool, polled: &PolledState) -> String {
    let feed = match (&timeline.run_id, streaming) {
        (None, _) => "",
        (Some(_), true) => "  feed: live\n",
        (Some(_), false) => "  feed: closed\n",
    };
    format!(
        "{}{}\n{}\n{}\n[enter] refresh runs · [f <run>] follow run · [q] quit",
        render_timeline(timeline),
        feed,
        render_runs(&polled.runs()),
        render_metrics(&polled.metrics()),
    )
}

fn draw(frame: &str) {
    let mut out = std::io::stdout().lock();
    let _ = writeln!(out, "\x1b[2J\x1b[H{frame}");
    let _ = out.flush();
}

/// Blocking stdin reads live on their own thread so they never hold up runtime shutdown.
fn stdin_lines() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Live dashboard until Ctrl-C or `q`: one event subscription plus the two pollers.
pub async fn watch(client: BackendClient, cfg: &MonitorCfg, run_id: Option<String>) -> Result<()> {
    let changed = Arc::new(Notify::new());
    let mut live = LiveRun::new(Arc::new(SseTransport::new(client.clone())), changed.clone());
    let poller = RunPoller::spawn(client, cfg.runs_every(), cfg.metrics_every(), changed.clone());
    if let Some(id) = run_id.as_deref() {
        live.follow(id).await;
    }

    let mut input = stdin_lines();
    let mut stdin_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        draw(&compose(&live.snapshot(), live.is_streaming(), poller.state()));
        tokio::select! {
            _ = changed.notified() => {}
            _ = &mut ctrl_c => break,
            line = input.recv(), if stdin_open => match line {
                Some(line) => match parse_input(&line) {
                    Input::Refresh => poller.refresh_runs().await,
                    Input::Quit => break,
                    Input::Follow(prefix) => {
                        let id = resolve_run(&prefix, &poller.state().runs());
                        live.follow(&id).await;
                    }
                },
                None => stdin_open = false,
            },
        }
    }

    live.release().await;
    poller.shutdown().await;
    tracing::debug!("dashboard closed");
    Ok(())
}
