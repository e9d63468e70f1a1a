use chrono::{DateTime, Local, NaiveDateTime, Utc};
use std::fmt::Write;

use crate::{
    events::RunEvent,
    metrics::MetricTable,
    models::RunSummary,
    timeline::Timeline,
};

/// Runs shown in the recent list.
const RUNS_SHOWN: usize = 8;

/// Local `HH:MM:SS` for RFC 3339 or naive (UTC) ISO timestamps; unparsable input is shown as-is.
pub fn pretty_ts(ts: &str) -> String {
    if ts.is_empty() {
        return String::new();
    }
    let parsed = DateTime::parse_from_rfc3339(ts)
        .map(|t| t.with_timezone(&Utc))
        .or_else(|_| NaiveDateTime::parse_from_str(ts, "%Y-%m-%dT%H:%M:%S%.f").map(|n| n.and_utc()));
    match parsed {
        Ok(t) => t.with_timezone(&Local).format("%H:%M:%S").to_string(),
        Err(_) => ts.to_string(),
    }
}

fn short_id(id: &str) -> String {
    match id.char_indices().nth(8) {
        Some((cut, _)) => format!("{}…", &id[..cut]),
        None => id.to_string(),
    }
}

pub fn event_line(ev: &RunEvent) -> String {
    let mut line = format!("{} — {} → {}", pretty_ts(&ev.ts), ev.origin(), ev.status.as_str());
    if let Some(msg) = ev.message.as_deref().filter(|m| !m.is_empty()) {
        let _ = write!(line, " • {msg}");
    }
    if let Some(ms) = ev.duration_ms {
        let _ = write!(line, " ({ms} ms)");
    }
    if let Some(data) = ev.payload() {
        let _ = write!(line, " • {}", serde_json::Value::Object(data.clone()));
    }
    line
}

pub fn render_timeline(tl: &Timeline) -> String {
    let mut out = String::from("Live Timeline\n");
    let Some(run_id) = tl.run_id.as_deref() else {
        out.push_str("  Start a run to begin streaming events.\n");
        return out;
    };
    let _ = writeln!(out, "  run: {}", short_id(run_id));
    if tl.total_events == 0 {
        out.push_str("  Waiting for first event…\n");
        return out;
    }
    for group in &tl.groups {
        let _ = writeln!(out, "  {:<11} [{}]", group.step.as_str(), group.last.status.as_str());
        for ev in &group.events {
            let _ = writeln!(out, "    {}", event_line(ev));
        }
    }
    out
}

pub fn render_runs(runs: &[RunSummary]) -> String {
    let mut out = String::from("Recent Runs\n");
    if runs.is_empty() {
        out.push_str("  No runs yet.\n");
        return out;
    }
    for run in runs.iter().take(RUNS_SHOWN) {
        let _ = writeln!(
            out,
            "  {:<10} {:<9} {}",
            short_id(&run.run_id),
            run.status.as_str(),
            run.topic.as_deref().filter(|t| !t.is_empty()).unwrap_or("(no topic)"),
        );
        let mut when = format!("created {}", pretty_ts(&run.created_at));
        if let Some(ts) = run.started_at.as_deref() {
            let _ = write!(when, " • started {}", pretty_ts(ts));
        }
        if let Some(ts) = run.finished_at.as_deref() {
            let _ = write!(when, " • finished {}", pretty_ts(ts));
        }
        let _ = writeln!(out, "             {when}");
        if let Some(err) = run.error.as_deref() {
            let _ = writeln!(out, "             error: {err}");
        }
    }
    out
}

fn render_section(out: &mut String, title: &str, table: &MetricTable, prefix: &str, empty: &str) {
    let _ = writeln!(out, "  {title}");
    let mut any = false;
    for (key, value) in table.section(prefix) {
        any = true;
        let _ = writeln!(out, "    {key:<40} {value}");
    }
    if !any {
        let _ = writeln!(out, "    {empty}");
    }
}

pub fn render_metrics(table: &MetricTable) -> String {
    let mut out = String::from("Metrics Snapshot\n");
    render_section(&mut out, "HTTP", table, "http:", "No data yet.");
    render_section(&mut out, "Groq", table, "groq:", "No data yet (or GROQ_API_KEY not set).");
    render_section(&mut out, "Webhooks", table, "webhook:", "No data yet.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::RunStatus, timeline::group_steps};
    use serde_json::json;

    fn ev(value: serde_json::Value) -> RunEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn unparsable_timestamps_pass_through() {
        assert_eq!(pretty_ts(""), "");
        assert_eq!(pretty_ts("yesterday"), "yesterday");
        assert_eq!(pretty_ts("2025-01-01T10:00:00.123456").len(), 8);
        assert_eq!(pretty_ts("2025-01-01T10:00:00Z").len(), 8);
    }

    #[test]
    fn event_line_falls_back_to_orchestrator_and_shows_data() {
        let line = event_line(&ev(json!({
            "event_id": "e", "step": "search", "status": "completed",
            "message": "found 3", "data": {"hits": 3}
        })));
        assert!(line.contains("orchestrator → completed • found 3 • {\"hits\":3}"), "{line}");

        let line = event_line(&ev(json!({"event_id": "e", "step": "plan", "status": "started",
                                         "agent": "planner", "data": {}})));
        assert!(line.ends_with("planner → started"), "{line}");
    }

    #[test]
    fn timeline_states() {
        assert!(render_timeline(&Timeline::default()).contains("Start a run"));

        let waiting = Timeline { run_id: Some("0123456789abcdef".into()), ..Default::default() };
        let text = render_timeline(&waiting);
        assert!(text.contains("run: 01234567…"));
        assert!(text.contains("Waiting for first event"));

        let events = vec![
            ev(json!({"event_id": "1", "step": "plan", "status": "started"})),
            ev(json!({"event_id": "2", "step": "plan", "status": "completed"})),
        ];
        let tl = Timeline { run_id: Some("r".into()), total_events: 2, groups: group_steps(&events) };
        assert!(render_timeline(&tl).contains("plan        [completed]"));
    }

    #[test]
    fn runs_are_capped_and_topicless_runs_labelled() {
        let runs: Vec<_> = (0..10)
            .map(|i| RunSummary {
                run_id: format!("run-{i}"),
                status: RunStatus::Pending,
                created_at: "2025-01-01T10:00:00".into(),
                started_at: None,
                finished_at: None,
                error: None,
                topic: None,
                depth: None,
            })
            .collect();
        let text = render_runs(&runs);
        assert_eq!(text.matches("(no topic)").count(), RUNS_SHOWN);
        assert!(render_runs(&[]).contains("No runs yet."));
    }

    #[test]
    fn metrics_sections() {
        let table = MetricTable::parse("http_requests_total{status=\"200\",handler=\"/runs\"} 10\n");
        let text = render_metrics(&table);
        assert!(text.contains("200:/runs"));
        assert!(text.contains("GROQ_API_KEY"));
    }
}
