use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Notify;

use crate::{
    events::{RunEvent, Step},
    stream::{EventTransport, Subscription},
};

/// All events of one step, in arrival order. `last` decides the step's shown status.
#[derive(Debug, Clone, PartialEq)]
pub struct StepGroup {
    pub step: Step,
    pub events: Vec<RunEvent>,
    pub last: RunEvent,
}

/// Append-only event log for the run being followed.
#[derive(Debug, Default)]
pub struct StepAggregator {
    run_id: Option<String>,
    generation: u64,
    events: Vec<RunEvent>,
}

impl StepAggregator {
    /// Empties the log for `run_id` and returns the generation new appends must carry.
    pub fn reset(&mut self, run_id: &str) -> u64 {
        self.generation += 1;
        self.run_id = Some(run_id.to_string());
        self.events.clear();
        self.generation
    }

    pub fn clear(&mut self) {
        self.generation += 1;
        self.run_id = None;
        self.events.clear();
    }

    /// Appends unless `generation` belongs to a run that has since been replaced.
    pub fn append(&mut self, generation: u64, ev: RunEvent) -> bool {
        if generation != self.generation {
            return false;
        }
        self.events.push(ev);
        true
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn events(&self) -> &[RunEvent] {
        &self.events
    }

    pub fn groups(&self) -> Vec<StepGroup> {
        group_steps(&self.events)
    }

    pub fn snapshot(&self) -> Timeline {
        Timeline {
            run_id: self.run_id().map(String::from),
            total_events: self.events().len(),
            groups: self.groups(),
        }
    }
}

/// Projects an event log onto the fixed step order.
///
/// Steps without events are omitted; unknown step names stay in the log but get no group.
pub fn group_steps(events: &[RunEvent]) -> Vec<StepGroup> {
    let mut by_step: HashMap<Step, Vec<RunEvent>> = HashMap::new();
    for ev in events {
        if let Some(step) = ev.step_kind() {
            by_step.entry(step).or_default().push(ev.clone());
        }
    }
    Step::ORDER
        .into_iter()
        .filter_map(|step| {
            let events = by_step.remove(&step)?;
            let last = events.last()?.clone();
            Some(StepGroup { step, events, last })
        })
        .collect()
}

/// A consistent view of the followed run, taken under the lock.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    pub run_id: Option<String>,
    pub total_events: usize,
    pub groups: Vec<StepGroup>,
}

/// Owns the one live subscription and the log it feeds.
pub struct LiveRun {
    transport: Arc<dyn EventTransport>,
    log: Arc<Mutex<StepAggregator>>,
    current: Option<Subscription>,
    changed: Arc<Notify>,
}

impl LiveRun {
    pub fn new(transport: Arc<dyn EventTransport>, changed: Arc<Notify>) -> Self {
        Self {
            transport,
            log: Arc::new(Mutex::new(StepAggregator::default())),
            current: None,
            changed,
        }
    }

    pub fn run_id(&self) -> Option<&str> {
        self.current.as_ref().map(|s| s.run_id())
    }

    /// Switches to `run_id`: the old feed is closed before the log is reset and the new feed opened.
    /// Following the current run again only resubscribes once its feed has ended.
    pub async fn follow(&mut self, run_id: &str) {
        if self.run_id() == Some(run_id) && self.is_streaming() {
            return;
        }
        if let Some(old) = self.current.take() {
            tracing::info!(from = old.run_id(), to = run_id, "switching run");
            old.close().await;
        }
        let generation = self.log.lock().reset(run_id);
        let log = self.log.clone();
        let changed = self.changed.clone();
        self.current = Some(Subscription::open(self.transport.clone(), run_id, move |ev| {
            if log.lock().append(generation, ev) {
                changed.notify_one();
            }
        }));
        self.changed.notify_one();
    }

    /// Drops the subscription and the log.
    pub async fn release(&mut self) {
        if let Some(sub) = self.current.take() {
            sub.close().await;
        }
        self.log.lock().clear();
    }

    /// Waits for the current feed to end by itself, keeping the log.
    pub async fn drain(&mut self) {
        if let Some(sub) = self.current.take() {
            sub.finished().await;
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.current.as_ref().is_some_and(|s| !s.is_finished())
    }

    pub fn snapshot(&self) -> Timeline {
        self.log.lock().snapshot()
    }
}
