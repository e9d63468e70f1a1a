use anyhow::{anyhow, Context, Result};
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::ACCEPT;
use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::task::JoinHandle;

use crate::{
    client::BackendClient,
    events::{decode_frame, RunEvent},
};

/// Raw frame payloads in arrival order. An `Err` ends the stream.
pub type FrameStream = BoxStream<'static, Result<String>>;

/// Something that can open a run's push feed.
pub trait EventTransport: Send + Sync {
    fn open<'a>(&'a self, run_id: &'a str) -> Pin<Box<dyn Future<Output = Result<FrameStream>> + Send + 'a>>;
    fn name(&self) -> &'static str;
}

/// One dispatched Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub id: Option<String>,
    pub data: String,
}

/// Incremental SSE decoder; chunks may split anywhere, including inside a UTF-8 sequence.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: String,
    id: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            if let Some(frame) = self.line(line.trim_end_matches('\r')) {
                out.push(frame);
            }
        }
        out
    }

    /// Flushes a trailing line and any event not yet terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buf.is_empty() {
            let raw = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&raw).into_owned();
            if let Some(frame) = self.line(line.trim_end_matches('\r')) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = value.to_string(),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = std::mem::take(&mut self.event);
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        let event = if event.is_empty() { "message".to_string() } else { event };
        Some(SseFrame { event, id, data })
    }
}

/// Frames the timeline cares about; the greeting and other named events are skipped.
fn is_run_event(frame: &SseFrame) -> bool {
    frame.event == "run_event" || frame.event == "message"
}

/// `GET /events?run_id=<id>` as a Server-Sent-Events stream.
pub struct SseTransport {
    client: BackendClient,
}

impl SseTransport {
    pub fn new(client: BackendClient) -> Self {
        Self { client }
    }
}

impl EventTransport for SseTransport {
    fn open<'a>(&'a self, run_id: &'a str) -> Pin<Box<dyn Future<Output = Result<FrameStream>> + Send + 'a>> {
        Box::pin(async move {
            let resp = self.client
                .http()
                .get(self.client.url("/events"))
                .query(&[("run_id", run_id)])
                .header(ACCEPT, "text/event-stream")
                .send()
                .await
                .context("connecting to events stream")?;
            if !resp.status().is_success() {
                return Err(anyhow!("events stream failed: {}", resp.status()));
            }
            let mut bytes = Box::pin(resp.bytes_stream());
            let frames = async_stream::stream! {
                let mut decoder = SseDecoder::default();
                while let Some(chunk) = bytes.next().await {
                    match chunk {
                        Ok(chunk) => {
                            for frame in decoder.feed(&chunk) {
                                if is_run_event(&frame) {
                                    yield Ok(frame.data);
                                } else {
                                    tracing::trace!(event = %frame.event, id = ?frame.id, "skipping sse frame");
                                }
                            }
                        }
                        Err(err) => {
                            yield Err(anyhow!(err).context("events stream dropped"));
                            return;
                        }
                    }
                }
                if let Some(frame) = decoder.finish() {
                    if is_run_event(&frame) {
                        yield Ok(frame.data);
                    }
                }
            };
            Ok(frames.boxed())
        })
    }

    fn name(&self) -> &'static str { "sse" }
}

/// Serves a fixed, already captured list of frames to every subscriber.
pub struct ReplayTransport {
    frames: Vec<String>,
}

impl ReplayTransport {
    pub fn new(frames: Vec<String>) -> Self {
        Self { frames }
    }

    /// Accepts either raw SSE text (as captured from `/events`) or one frame per line.
    pub fn from_capture(text: &str) -> Self {
        let is_sse = text.lines().any(|l| l.starts_with("data:"));
        let frames = if is_sse {
            let mut decoder = SseDecoder::default();
            let mut frames = decoder.feed(text.as_bytes());
            frames.extend(decoder.finish());
            frames.into_iter().filter(is_run_event).map(|f| f.data).collect()
        } else {
            text.lines().filter(|l| !l.trim().is_empty()).map(String::from).collect()
        };
        Self::new(frames)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }
}

impl EventTransport for ReplayTransport {
    fn open<'a>(&'a self, _run_id: &'a str) -> Pin<Box<dyn Future<Output = Result<FrameStream>> + Send + 'a>> {
        let frames: Vec<Result<String>> = self.frames.iter().cloned().map(Ok).collect();
        Box::pin(async move { Ok(stream::iter(frames).boxed()) })
    }

    fn name(&self) -> &'static str { "replay" }
}

/// A live subscription to one run's feed.
///
/// Records are handed to the callback as soon as they are decoded, in frame order and line order.
/// Transport failures end the subscription quietly; nothing reconnects. Dropping the handle
/// aborts the feed; [`Subscription::close`] additionally waits until the callback is gone.
pub struct Subscription {
    run_id: String,
    closed: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn open<F>(transport: Arc<dyn EventTransport>, run_id: &str, mut on_record: F) -> Self
    where
        F: FnMut(RunEvent) + Send + 'static,
    {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        let id = run_id.to_string();
        let task = tokio::spawn(async move {
            let mut frames = match transport.open(&id).await {
                Ok(frames) => frames,
                Err(err) => {
                    tracing::warn!(run_id = %id, transport = transport.name(), "subscription failed: {err:#}");
                    return;
                }
            };
            tracing::debug!(run_id = %id, transport = transport.name(), "subscribed");
            while let Some(frame) = frames.next().await {
                let payload = match frame {
                    Ok(p) => p,
                    Err(err) => {
                        tracing::warn!(run_id = %id, "subscription dropped: {err:#}");
                        break;
                    }
                };
                for ev in decode_frame(&payload) {
                    if flag.load(Ordering::Acquire) {
                        return;
                    }
                    on_record(ev);
                }
            }
            tracing::debug!(run_id = %id, "feed ended");
        });
        Self { run_id: run_id.to_string(), closed, task: Some(task) }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Detaches the callback and closes the transport. No delivery happens after this returns.
    pub async fn close(mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }

    /// Waits for the feed to end on its own.
    pub async fn finished(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ChannelTransport;
    use super::*;
    use axum::{extract::Query, http::{header, StatusCode}, response::IntoResponse, routing::get, Router};
    use serde_json::json;
    use tokio::sync::mpsc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn record(id: &str, step: &str) -> String {
        json!({"event_id": id, "run_id": "r1", "step": step, "status": "started", "ts": "2025-01-01T10:00:00"})
            .to_string()
    }

    fn collector() -> (impl FnMut(RunEvent) + Send + 'static, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (move |ev| { let _ = tx.send(ev); }, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> Option<RunEvent> {
        timeout(Duration::from_secs(2), rx.recv()).await.ok().flatten()
    }

    #[test]
    fn decoder_is_chunking_independent() {
        let raw = "event: hello\ndata: {\"message\":\"connected\"}\n\n\
                   : keep-alive\n\n\
                   event: run_event\nid: e1\ndata: {\"a\":1}\ndata: {\"b\":2}\n\n\
                   data: tail\r\n\r\n";
        let mut whole = SseDecoder::default();
        let expected = whole.feed(raw.as_bytes());
        assert_eq!(expected.len(), 3);
        assert_eq!(expected[1].event, "run_event");
        assert_eq!(expected[1].id.as_deref(), Some("e1"));
        assert_eq!(expected[1].data, "{\"a\":1}\n{\"b\":2}");
        assert_eq!(expected[2].event, "message");

        for size in [1, 2, 3, 7, 16] {
            let mut dec = SseDecoder::default();
            let mut got = Vec::new();
            for chunk in raw.as_bytes().chunks(size) {
                got.extend(dec.feed(chunk));
            }
            got.extend(dec.finish());
            assert_eq!(got, expected, "chunk size {size}");
        }
    }

    #[test]
    fn decoder_survives_split_utf8() {
        let raw = "data: {\"message\":\"café\"}\n\n".as_bytes();
        let split = raw.iter().position(|b| *b == 0xC3).unwrap() + 1;
        let mut dec = SseDecoder::default();
        assert!(dec.feed(&raw[..split]).is_empty());
        let frames = dec.feed(&raw[split..]);
        assert_eq!(frames[0].data, "{\"message\":\"café\"}");
    }

    #[test]
    fn finish_flushes_unterminated_event() {
        let mut dec = SseDecoder::default();
        assert!(dec.feed(b"event: run_event\ndata: x").is_empty());
        let frame = dec.finish().unwrap();
        assert_eq!((frame.event.as_str(), frame.data.as_str()), ("run_event", "x"));
        assert!(dec.finish().is_none());
    }

    #[test]
    fn capture_replay_skips_greeting() {
        let capture = format!(
            "event: hello\ndata: {{\"message\":\"connected\"}}\n\nevent: run_event\ndata: {}\n\n",
            record("a", "plan")
        );
        assert_eq!(ReplayTransport::from_capture(&capture).len(), 1);
        let jsonl = format!("{}\n\n{}\n", record("a", "plan"), record("b", "plan"));
        assert_eq!(ReplayTransport::from_capture(&jsonl).len(), 2);
    }

    #[tokio::test]
    async fn delivers_records_in_order_across_frames() {
        let transport = Arc::new(ChannelTransport::default());
        let feed = transport.feed("r1");
        let (cb, mut rx) = collector();
        let sub = Subscription::open(transport, "r1", cb);

        feed.send(format!("{}\ngarbage\n{}", record("a", "plan"), record("b", "plan"))).unwrap();
        feed.send(json!({"message": "ping"}).to_string()).unwrap();
        feed.send(record("c", "search")).unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(next(&mut rx).await.unwrap().event_id);
        }
        assert_eq!(ids, vec!["a", "b", "c"]);
        sub.close().await;
    }

    #[tokio::test]
    async fn nothing_arrives_after_close() {
        let transport = Arc::new(ChannelTransport::default());
        let feed = transport.feed("r1");
        let (cb, mut rx) = collector();
        let sub = Subscription::open(transport, "r1", cb);

        feed.send(record("a", "plan")).unwrap();
        assert_eq!(next(&mut rx).await.unwrap().event_id, "a");

        sub.close().await;
        let _ = feed.send(record("b", "plan"));
        // The callback (and its sender) is gone once close returns.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_before_any_frame_is_safe() {
        let transport = Arc::new(ChannelTransport::default());
        let _feed = transport.feed("r1");
        let (cb, mut rx) = collector();
        let sub = Subscription::open(transport, "r1", cb);
        sub.close().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn handshake_failure_ends_quietly() {
        let transport = Arc::new(ChannelTransport::default());
        let (cb, mut rx) = collector();
        let sub = Subscription::open(transport, "unknown", cb);
        assert!(next(&mut rx).await.is_none());
        assert!(sub.is_finished());
    }

    #[tokio::test]
    async fn replay_feed_finishes_on_its_own() {
        let transport = Arc::new(ReplayTransport::new(vec![record("a", "plan"), record("b", "run")]));
        let (cb, mut rx) = collector();
        Subscription::open(transport, "any", cb).finished().await;
        assert_eq!(rx.recv().await.unwrap().event_id, "a");
        assert_eq!(rx.recv().await.unwrap().event_id, "b");
        assert!(rx.recv().await.is_none());
    }

    #[derive(serde::Deserialize)]
    struct EventsQuery {
        run_id: Option<String>,
    }

    /// Fake `/events` that writes messages the way the backend does: each ends with a single
    /// newline, so everything up to the keep-alive comment arrives as one dispatch.
    async fn events_backend() -> String {
        let app = Router::new().route(
            "/events",
            get(|Query(q): Query<EventsQuery>| async move {
                if q.run_id.as_deref() != Some("r1") {
                    return StatusCode::NOT_FOUND.into_response();
                }
                let body = format!(
                    "event: hello\ndata: {}\nevent: run_event\nid: e1\ndata: {}\nevent: run_event\nid: e2\ndata: {}\n: keep-alive\n\n",
                    json!({"ts": "2025-01-01T10:00:00", "message": "connected"}),
                    record("e1", "plan"),
                    record("e2", "search"),
                );
                ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    fn sse(base: &str) -> Arc<SseTransport> {
        Arc::new(SseTransport::new(BackendClient::new(base, Duration::from_secs(2)).unwrap()))
    }

    #[tokio::test]
    async fn sse_transport_delivers_backend_framing_in_order() {
        let base = events_backend().await;
        let (cb, mut rx) = collector();
        Subscription::open(sse(&base), "r1", cb).finished().await;
        let mut ids = Vec::new();
        while let Some(ev) = rx.recv().await {
            ids.push(ev.event_id);
        }
        assert_eq!(ids, vec!["e1", "e2"]);
    }

    #[tokio::test]
    async fn sse_handshake_rejection_ends_quietly() {
        let base = events_backend().await;
        let err = sse(&base).open("other").await.err().unwrap();
        assert!(err.to_string().contains("404"), "{err}");

        let (cb, mut rx) = collector();
        Subscription::open(sse(&base), "other", cb).finished().await;
        assert!(rx.recv().await.is_none());
    }
}
