use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Pipeline phases in timeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Plan,
    Search,
    Retrieve,
    Summarize,
    Synthesize,
    Critique,
    Present,
    Run,
}

impl Step {
    pub const ORDER: [Step; 8] = [
        Step::Plan,
        Step::Search,
        Step::Retrieve,
        Step::Summarize,
        Step::Synthesize,
        Step::Critique,
        Step::Present,
        Step::Run,
    ];

    pub fn parse(name: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|s| s.as_str() == name)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Plan => "plan",
            Step::Search => "search",
            Step::Retrieve => "retrieve",
            Step::Summarize => "summarize",
            Step::Synthesize => "synthesize",
            Step::Critique => "critique",
            Step::Present => "present",
            Step::Run => "run",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Progress,
    Completed,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Started => "started",
            EventStatus::Progress => "progress",
            EventStatus::Completed => "completed",
            EventStatus::Error => "error",
            EventStatus::Unknown => "unknown",
        }
    }
}

/// One progress notification pushed by the backend for a run step.
///
/// Only `event_id` is load-bearing. Every other field is display payload: a value of the
/// wrong type decodes to the field's default instead of rejecting the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    #[serde(deserialize_with = "id_text")]
    pub event_id: String,
    #[serde(default, deserialize_with = "lenient")]
    pub run_id: String,
    #[serde(default, deserialize_with = "lenient")]
    pub step: String,
    #[serde(default, deserialize_with = "lenient")]
    pub agent: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub status: EventStatus,
    #[serde(default, deserialize_with = "text_or_json")]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub ts: String,
    #[serde(default, deserialize_with = "millis")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub data: Option<Value>,
}

fn lenient<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = Value::deserialize(de)?;
    Ok(T::deserialize(value).unwrap_or_default())
}

/// Strings as-is, numbers in their JSON spelling; anything else leaves the id empty.
fn id_text<'de, D: Deserializer<'de>>(de: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

/// Non-string messages are kept as their JSON text.
fn text_or_json<'de, D: Deserializer<'de>>(de: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(de)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

/// Fractional or string-encoded durations are rounded; negative or non-numeric ones are dropped.
fn millis<'de, D: Deserializer<'de>>(de: D) -> Result<Option<u64>, D::Error> {
    let value = Value::deserialize(de)?;
    let ms = match &value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| *f >= 0.0).map(|f| f.round() as u64),
        _ => None,
    };
    Ok(ms)
}

impl RunEvent {
    pub fn step_kind(&self) -> Option<Step> {
        Step::parse(&self.step)
    }

    /// Originator label; events without one come from the orchestrator.
    pub fn origin(&self) -> &str {
        self.agent.as_deref().filter(|a| !a.is_empty()).unwrap_or("orchestrator")
    }

    /// `data` as a non-empty object, if any.
    pub fn payload(&self) -> Option<&serde_json::Map<String, Value>> {
        self.data.as_ref().and_then(Value::as_object).filter(|m| !m.is_empty())
    }
}

/// Decodes one frame payload into events, in line order.
///
/// The backend may coalesce several JSON records into one frame. Each line is parsed on its own;
/// lines that are not JSON, or that lack an `event_id` (the connection greeting), are dropped
/// without affecting their neighbours.
pub fn decode_frame(payload: &str) -> Vec<RunEvent> {
    payload
        .split('\n')
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .filter_map(decode_line)
        .collect()
}

fn decode_line(line: &str) -> Option<RunEvent> {
    let value = match serde_json::from_str::<Value>(line) {
        Ok(v @ Value::Object(_)) => v,
        Ok(_) => return None,
        Err(err) => {
            tracing::trace!(%err, "dropping undecodable frame line");
            return None;
        }
    };
    match serde_json::from_value::<RunEvent>(value) {
        Ok(ev) if !ev.event_id.is_empty() => Some(ev),
        Ok(_) => None,
        Err(err) => {
            tracing::trace!(%err, "dropping record without an event_id");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn line(id: &str, step: &str, status: &str) -> String {
        json!({
            "event_id": id,
            "run_id": "r1",
            "step": step,
            "status": status,
            "ts": "2025-01-01T10:00:00",
        })
        .to_string()
    }

    #[test]
    fn coalesced_frame_keeps_order_and_skips_garbage() {
        let frame = [
            line("a", "plan", "started"),
            "{not json".to_string(),
            String::new(),
            line("b", "plan", "completed"),
            "   ".to_string(),
            "[1,2,3]".to_string(),
            line("c", "search", "started"),
        ]
        .join("\n");
        let ids: Vec<_> = decode_frame(&frame).into_iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn heartbeats_never_decode() {
        let frame = [
            json!({"ts": "2025-01-01T10:00:00", "message": "connected"}).to_string(),
            json!({"event_id": "", "step": "plan"}).to_string(),
            json!({"message": "still here"}).to_string(),
        ]
        .join("\n");
        assert!(decode_frame(&frame).is_empty());
    }

    #[test]
    fn crlf_lines_and_optional_fields() {
        let frame = format!(
            "{}\r\n{}\r\n",
            line("a", "retrieve", "progress"),
            json!({"event_id": "b", "run_id": "r1", "step": "mystery", "status": "paused",
                   "agent": "fetcher", "duration_ms": 42, "data": {"n": 3}})
        );
        let events = decode_frame(&frame);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, EventStatus::Progress);
        assert_eq!(events[0].origin(), "orchestrator");
        assert_eq!(events[1].step_kind(), None);
        assert_eq!(events[1].status, EventStatus::Unknown);
        assert_eq!(events[1].origin(), "fetcher");
        assert_eq!(events[1].duration_ms, Some(42));
        assert_eq!(events[1].payload().map(|m| m.len()), Some(1));
    }

    #[test]
    fn odd_payload_types_do_not_drop_the_record() {
        let frame = [
            json!({"event_id": "a", "step": "plan", "duration_ms": 1.5}).to_string(),
            json!({"event_id": "b", "step": "plan", "ts": null}).to_string(),
            json!({"event_id": "c", "step": null, "status": 7}).to_string(),
            json!({"event_id": "d", "message": {"detail": "x"}, "agent": ["p"]}).to_string(),
            json!({"event_id": 5, "run_id": null, "duration_ms": "-3"}).to_string(),
            json!({"event_id": {"nested": true}}).to_string(),
        ]
        .join("\n");
        let events = decode_frame(&frame);
        let ids: Vec<_> = events.iter().map(|e| e.event_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", "5"]);

        assert_eq!(events[0].duration_ms, Some(2));
        assert_eq!(events[1].ts, "");
        assert_eq!(events[2].step_kind(), None);
        assert_eq!(events[2].status, EventStatus::Unknown);
        assert_eq!(events[3].message.as_deref(), Some(r#"{"detail":"x"}"#));
        assert_eq!(events[3].origin(), "orchestrator");
        assert_eq!(events[4].duration_ms, None);
        assert_eq!(events[4].run_id, "");
    }

    #[test]
    fn step_vocabulary_round_trips_names() {
        for step in Step::ORDER {
            assert_eq!(Step::parse(step.as_str()), Some(step));
        }
        assert_eq!(Step::parse("Plan"), None);
    }
}
