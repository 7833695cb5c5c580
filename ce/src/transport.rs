//! Transport stream client
//!
//! Opens the provider HTTP request and exposes the response body as a lazy,
//! cancellable sequence of decoded SSE payload strings, keyed by a
//! caller-supplied task id. One long-lived reqwest client is kept per
//! provider endpoint; streams can outlive any read timeout, so only the
//! connect timeout is set.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::codec::ProviderRequest;
use crate::codec::openai::DONE_SENTINEL;
use crate::error::ChatError;

/// Connect timeout; read timeout stays disabled for long streams
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Channel capacity for stream events
const EVENT_BUFFER: usize = 64;

/// One event from an open stream
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// One SSE `data:` payload, stripped of protocol framing
    Payload(String),
    /// Stream exhausted normally
    Done,
    /// Stream torn down by an explicit cancel
    Cancelled,
    /// Connection-level or protocol-level failure
    Failed(ChatError),
}

/// Handle to an open stream
pub struct StreamHandle {
    pub task_id: String,
    pub events: mpsc::Receiver<StreamEvent>,
    /// Set before transport teardown so termination races classify correctly
    pub cancelled: Arc<AtomicBool>,
}

/// Seam between the orchestrator and the network
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Issue the request and stream raw SSE payloads
    async fn open(&self, request: ProviderRequest, task_id: &str) -> StreamHandle;

    /// Abort the stream for a task id. Idempotent; unknown ids are a no-op.
    fn cancel(&self, task_id: &str);
}

struct TaskEntry {
    cancelled: Arc<AtomicBool>,
    abort: tokio::task::AbortHandle,
}

/// Production transport over reqwest
pub struct StreamClient {
    clients: Mutex<HashMap<String, Client>>,
    tasks: Arc<Mutex<HashMap<String, TaskEntry>>>,
    proxy: Option<String>,
}

impl StreamClient {
    pub fn new(proxy: Option<String>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            proxy,
        }
    }

    /// Get or build the shared client for an endpoint
    fn client_for(&self, url: &str) -> Result<Client, ChatError> {
        let key = endpoint_key(url);
        let mut clients = self.clients.lock().expect("client map poisoned");
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);
        if let Some(proxy) = &self.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| ChatError::Network(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| ChatError::Network(e.to_string()))?;

        debug!(endpoint = %key, "client_for: built new endpoint client");
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl StreamTransport for StreamClient {
    async fn open(&self, request: ProviderRequest, task_id: &str) -> StreamHandle {
        debug!(%task_id, url = %request.url, "open: called");
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancelled = Arc::new(AtomicBool::new(false));

        let client = match self.client_for(&request.url) {
            Ok(c) => c,
            Err(e) => {
                let _ = tx.send(StreamEvent::Failed(e)).await;
                return StreamHandle {
                    task_id: task_id.to_string(),
                    events: rx,
                    cancelled,
                };
            }
        };

        let tasks = Arc::clone(&self.tasks);
        let id = task_id.to_string();
        let flag = Arc::clone(&cancelled);
        // Hold the map lock across the spawn: a fast-terminating stream runs
        // its own removal, which must not happen before the entry exists.
        let mut map = self.tasks.lock().expect("task map poisoned");
        let join = tokio::spawn(async move {
            run_stream(client, request, tx, Arc::clone(&flag)).await;
            tasks.lock().expect("task map poisoned").remove(&id);
        });
        map.insert(
            task_id.to_string(),
            TaskEntry {
                cancelled: Arc::clone(&cancelled),
                abort: join.abort_handle(),
            },
        );
        drop(map);

        StreamHandle {
            task_id: task_id.to_string(),
            events: rx,
            cancelled,
        }
    }

    fn cancel(&self, task_id: &str) {
        let entry = self.tasks.lock().expect("task map poisoned").remove(task_id);
        match entry {
            Some(entry) => {
                debug!(%task_id, "cancel: aborting stream");
                // flag first, then teardown
                entry.cancelled.store(true, Ordering::SeqCst);
                entry.abort.abort();
            }
            None => {
                debug!(%task_id, "cancel: unknown or finished task, no-op");
            }
        }
    }
}

/// Consume the response body, forwarding SSE payloads until done
async fn run_stream(
    client: Client,
    request: ProviderRequest,
    tx: mpsc::Sender<StreamEvent>,
    cancelled: Arc<AtomicBool>,
) {
    let mut req = client.post(&request.url).json(&request.body);
    for (name, value) in &request.headers {
        req = req.header(name, value);
    }

    let response = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "run_stream: connect failed");
            send_terminal(&tx, &cancelled, ChatError::from(e)).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), body = %text, "run_stream: error status");
        send_terminal(&tx, &cancelled, ChatError::from_status(status.as_u16(), text)).await;
        return;
    }

    let mut stream = response.bytes_stream();
    let mut buffer = String::new();

    while let Some(chunk) = stream.next().await {
        if cancelled.load(Ordering::SeqCst) {
            let _ = tx.send(StreamEvent::Cancelled).await;
            return;
        }

        let bytes = match chunk {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "run_stream: read failed");
                send_terminal(&tx, &cancelled, ChatError::from(e)).await;
                return;
            }
        };

        buffer.push_str(&String::from_utf8_lossy(&bytes));
        while let Some(payload) = next_sse_payload(&mut buffer) {
            if payload == DONE_SENTINEL {
                let _ = tx.send(StreamEvent::Done).await;
                return;
            }
            if tx.send(StreamEvent::Payload(payload)).await.is_err() {
                // consumer gone
                return;
            }
        }
    }

    // Gemini streams end on socket close rather than a sentinel
    let _ = tx.send(StreamEvent::Done).await;
}

async fn send_terminal(tx: &mpsc::Sender<StreamEvent>, cancelled: &AtomicBool, err: ChatError) {
    let event = if cancelled.load(Ordering::SeqCst) {
        StreamEvent::Cancelled
    } else {
        StreamEvent::Failed(err)
    };
    let _ = tx.send(event).await;
}

/// Pop the next complete `data:` payload from the framing buffer.
///
/// Skips comments, event/id lines, and blank separators.
fn next_sse_payload(buffer: &mut String) -> Option<String> {
    while let Some(line_end) = buffer.find('\n') {
        let line = buffer[..line_end].trim_end_matches('\r').to_string();
        buffer.drain(..=line_end);

        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim();
            if !data.is_empty() {
                return Some(data.to_string());
            }
        }
    }
    None
}

/// Extract `scheme://host[:port]` as the client-cache key
fn endpoint_key(url: &str) -> String {
    match url.find("://") {
        Some(i) => {
            let path_start = url[i + 3..].find('/').map(|j| i + 3 + j).unwrap_or(url.len());
            url[..path_start].to_string()
        }
        None => url.to_string(),
    }
}

/// Scripted transport for tests
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    /// One scripted `open` call
    pub struct ScriptedCall {
        pub events: Vec<StreamEvent>,
        /// Keep the stream open after the scripted events until cancelled
        pub then_hold: bool,
    }

    impl ScriptedCall {
        pub fn completed(payloads: &[&str]) -> Self {
            let mut events: Vec<StreamEvent> = payloads.iter().map(|p| StreamEvent::Payload(p.to_string())).collect();
            events.push(StreamEvent::Done);
            Self {
                events,
                then_hold: false,
            }
        }

        pub fn failed(err: ChatError) -> Self {
            Self {
                events: vec![StreamEvent::Failed(err)],
                then_hold: false,
            }
        }

        pub fn stalled_after(payloads: &[&str]) -> Self {
            Self {
                events: payloads.iter().map(|p| StreamEvent::Payload(p.to_string())).collect(),
                then_hold: true,
            }
        }
    }

    /// Transport that replays scripted calls instead of hitting the network
    pub struct MockTransport {
        calls: Mutex<VecDeque<ScriptedCall>>,
        open_count: AtomicUsize,
        cancelled_ids: Mutex<Vec<String>>,
        flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
        requests: Mutex<Vec<ProviderRequest>>,
    }

    impl MockTransport {
        pub fn new(calls: Vec<ScriptedCall>) -> Self {
            Self {
                calls: Mutex::new(calls.into()),
                open_count: AtomicUsize::new(0),
                cancelled_ids: Mutex::new(Vec::new()),
                flags: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn open_count(&self) -> usize {
            self.open_count.load(Ordering::SeqCst)
        }

        pub fn cancelled_ids(&self) -> Vec<String> {
            self.cancelled_ids.lock().expect("mock lock poisoned").clone()
        }

        /// Requests seen so far, in open order
        pub fn requests(&self) -> Vec<ProviderRequest> {
            self.requests.lock().expect("mock lock poisoned").clone()
        }
    }

    #[async_trait]
    impl StreamTransport for MockTransport {
        async fn open(&self, request: ProviderRequest, task_id: &str) -> StreamHandle {
            self.open_count.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().expect("mock lock poisoned").push(request);
            let call = self
                .calls
                .lock()
                .expect("mock lock poisoned")
                .pop_front()
                .unwrap_or(ScriptedCall {
                    events: vec![StreamEvent::Done],
                    then_hold: false,
                });

            let (tx, rx) = mpsc::channel(EVENT_BUFFER);
            let cancelled = Arc::new(AtomicBool::new(false));
            self.flags
                .lock()
                .expect("mock lock poisoned")
                .insert(task_id.to_string(), Arc::clone(&cancelled));

            let flag = Arc::clone(&cancelled);
            tokio::spawn(async move {
                for event in call.events {
                    if flag.load(Ordering::SeqCst) {
                        let _ = tx.send(StreamEvent::Cancelled).await;
                        return;
                    }
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                while call.then_hold {
                    if flag.load(Ordering::SeqCst) {
                        let _ = tx.send(StreamEvent::Cancelled).await;
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });

            StreamHandle {
                task_id: task_id.to_string(),
                events: rx,
                cancelled,
            }
        }

        fn cancel(&self, task_id: &str) {
            self.cancelled_ids
                .lock()
                .expect("mock lock poisoned")
                .push(task_id.to_string());
            if let Some(flag) = self.flags.lock().expect("mock lock poisoned").get(task_id) {
                flag.store(true, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_sse_payload_framing() {
        let mut buffer = String::from("event: message\ndata: {\"a\":1}\n\ndata: [DONE]\n");
        assert_eq!(next_sse_payload(&mut buffer), Some("{\"a\":1}".to_string()));
        assert_eq!(next_sse_payload(&mut buffer), Some("[DONE]".to_string()));
        assert_eq!(next_sse_payload(&mut buffer), None);
    }

    #[test]
    fn test_next_sse_payload_partial_line_waits() {
        let mut buffer = String::from("data: {\"partial\":");
        assert_eq!(next_sse_payload(&mut buffer), None);
        buffer.push_str("1}\n");
        assert_eq!(next_sse_payload(&mut buffer), Some("{\"partial\":1}".to_string()));
    }

    #[test]
    fn test_next_sse_payload_crlf() {
        let mut buffer = String::from("data: hello\r\n");
        assert_eq!(next_sse_payload(&mut buffer), Some("hello".to_string()));
    }

    #[test]
    fn test_endpoint_key() {
        assert_eq!(
            endpoint_key("https://api.example.com/v1/chat/completions"),
            "https://api.example.com"
        );
        assert_eq!(endpoint_key("http://localhost:11434/v1/chat"), "http://localhost:11434");
    }

    #[tokio::test]
    async fn test_task_map_drains_after_fast_failures() {
        let client = StreamClient::new(None);
        let request = ProviderRequest {
            url: "http://127.0.0.1:1/v1/chat/completions".to_string(),
            headers: vec![],
            body: serde_json::json!({}),
        };

        // port 1 refuses instantly, so each stream task terminates fast
        for i in 0..50 {
            let mut handle = client.open(request.clone(), &format!("t{i}")).await;
            while let Some(event) = handle.events.recv().await {
                if !matches!(event, StreamEvent::Payload(_)) {
                    break;
                }
            }
        }

        // each task removes its own entry after its terminal event
        for _ in 0..200 {
            if client.tasks.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(client.tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_noop() {
        let client = StreamClient::new(None);
        // must not panic or error
        client.cancel("no-such-task");
        client.cancel("no-such-task");
    }

    #[tokio::test]
    async fn test_mock_transport_replays_script() {
        use mock::{MockTransport, ScriptedCall};

        let transport = MockTransport::new(vec![ScriptedCall::completed(&["one", "two"])]);
        let request = ProviderRequest {
            url: "http://test".to_string(),
            headers: vec![],
            body: serde_json::json!({}),
        };

        let mut handle = transport.open(request, "t1").await;
        assert!(matches!(handle.events.recv().await, Some(StreamEvent::Payload(p)) if p == "one"));
        assert!(matches!(handle.events.recv().await, Some(StreamEvent::Payload(p)) if p == "two"));
        assert!(matches!(handle.events.recv().await, Some(StreamEvent::Done)));
        assert_eq!(transport.open_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_cancel_interrupts_hold() {
        use mock::{MockTransport, ScriptedCall};

        let transport = MockTransport::new(vec![ScriptedCall::stalled_after(&["partial"])]);
        let request = ProviderRequest {
            url: "http://test".to_string(),
            headers: vec![],
            body: serde_json::json!({}),
        };

        let mut handle = transport.open(request, "t1").await;
        assert!(matches!(handle.events.recv().await, Some(StreamEvent::Payload(_))));

        transport.cancel("t1");
        assert!(matches!(handle.events.recv().await, Some(StreamEvent::Cancelled)));
        assert_eq!(transport.cancelled_ids(), vec!["t1".to_string()]);
    }
}
