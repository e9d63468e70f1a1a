use futures_util::StreamExt;
use parking_lot::RwLock;
use std::{sync::Arc, time::Duration};
use tokio::{sync::Notify, task::JoinHandle, time::MissedTickBehavior};
use tokio_stream::wrappers::IntervalStream;

use crate::{client::BackendClient, metrics::MetricTable, models::RunSummary};

/// Last successfully fetched run list and metrics; failed polls leave them untouched.
#[derive(Default)]
pub struct PolledState {
    runs: RwLock<Vec<RunSummary>>,
    metrics: RwLock<MetricTable>,
}

impl PolledState {
    pub fn runs(&self) -> Vec<RunSummary> {
        self.runs.read().clone()
    }

    pub fn metrics(&self) -> MetricTable {
        self.metrics.read().clone()
    }
}

/// Two independent timers: the run list and the metrics snapshot.
pub struct RunPoller {
    client: BackendClient,
    state: Arc<PolledState>,
    changed: Arc<Notify>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunPoller {
    pub fn spawn(client: BackendClient, runs_every: Duration, metrics_every: Duration, changed: Arc<Notify>) -> Self {
        let state = Arc::new(PolledState::default());
        let mut tasks = Vec::with_capacity(2);

        {
            let (client, state, changed) = (client.clone(), state.clone(), changed.clone());
            tasks.push(tokio::spawn(async move {
                let mut ticks = ticker(runs_every);
                while ticks.next().await.is_some() {
                    if poll_runs(&client, &state).await {
                        changed.notify_one();
                    }
                }
            }));
        }
        {
            let (client, state, changed) = (client.clone(), state.clone(), changed.clone());
            tasks.push(tokio::spawn(async move {
                let mut ticks = ticker(metrics_every);
                while ticks.next().await.is_some() {
                    if poll_metrics(&client, &state).await {
                        changed.notify_one();
                    }
                }
            }));
        }

        Self { client, state, changed, tasks }
    }

    pub fn state(&self) -> &Arc<PolledState> {
        &self.state
    }

    /// One run-list fetch outside the timer, e.g. right after starting a run.
    pub async fn refresh_runs(&self) {
        if poll_runs(&self.client, &self.state).await {
            self.changed.notify_one();
        }
    }

    /// Stops both timers; nothing polls after this returns.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// First tick fires immediately; late ticks are not bunched up.
fn ticker(every: Duration) -> IntervalStream {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    IntervalStream::new(interval)
}

pub async fn poll_runs(client: &BackendClient, state: &PolledState) -> bool {
    match client.list_runs().await {
        Ok(runs) => {
            *state.runs.write() = runs;
            true
        }
        Err(err) => {
            tracing::debug!("runs poll failed: {err:#}");
            false
        }
    }
}

pub async fn poll_metrics(client: &BackendClient, state: &PolledState) -> bool {
    match client.metrics_text().await {
        Ok(text) if text.trim().is_empty() => {
            tracing::debug!("metrics poll returned nothing; keeping last snapshot");
            false
        }
        Ok(text) => {
            *state.metrics.write() = MetricTable::parse(&text);
            true
        }
        Err(err) => {
            tracing::debug!("metrics poll failed: {err:#}");
            false
        }
    }
}
