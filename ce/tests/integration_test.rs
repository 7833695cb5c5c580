//! Integration tests for ChatEngine
//!
//! These tests verify end-to-end behavior across the codec, transport,
//! retrieval, and orchestration layers, using the scripted mock transport
//! in place of the network.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use chatengine::config::{GenerationParams, OrchestratorConfig, ProviderConfig};
use chatengine::gateway::mock::RecordingGateway;
use chatengine::gateway::{KnowledgeRetriever, PersistenceGateway, Retriever, UiEvent};
use chatengine::orchestrator::{CANCEL_MARKER, Orchestrator, TurnStatus};
use chatengine::session::SessionCache;
use chatengine::transport::mock::{MockTransport, ScriptedCall};
use chatengine::transport::StreamTransport;
use knowledgestore::{IngestOptions, KnowledgeStore};

fn openai_provider() -> ProviderConfig {
    ProviderConfig::OpenAi {
        base_url: "https://api.example.com/v1".to_string(),
        api_key: "sk-test".to_string(),
        model: "gpt-test".to_string(),
        params: GenerationParams::default(),
    }
}

fn openai_delta(text: &str) -> String {
    format!(r#"{{"choices":[{{"delta":{{"content":"{text}"}}}}]}}"#)
}

// =============================================================================
// Retrieval + Orchestration
// =============================================================================

#[tokio::test]
async fn test_retrieval_augments_turn_end_to_end() {
    let mut store = KnowledgeStore::open_in_memory().expect("Failed to open store");
    store
        .ingest(
            "paris.txt",
            "Paris is the capital of France and sits on the Seine.",
            &IngestOptions::default(),
        )
        .expect("Failed to ingest");

    let retriever: Arc<dyn Retriever> = Arc::new(KnowledgeRetriever::new(store));
    let transport = Arc::new(MockTransport::new(vec![ScriptedCall::completed(&[
        &openai_delta("It is Paris."),
    ])]));
    let gateway: Arc<dyn PersistenceGateway> = Arc::new(RecordingGateway::new());
    let (ui_tx, mut ui_rx) = mpsc::channel(1024);

    let mut orchestrator = Orchestrator::new(
        "it-session",
        openai_provider(),
        None,
        OrchestratorConfig::default(),
        transport.clone() as Arc<dyn StreamTransport>,
        gateway,
        Some(retriever),
        ui_tx,
    );

    let report = orchestrator
        .send("What is the capital of France?", &[])
        .await
        .expect("send failed");
    assert!(report.status.is_completed());

    // The wire request carried the retrieved chunk alongside the question
    let requests = transport.requests();
    assert_eq!(requests.len(), 1);
    let body = requests[0].body.to_string();
    assert!(body.contains("capital of France"));
    assert!(body.contains("paris.txt"));
    assert!(body.contains("Seine"));

    // But the conversation history keeps the raw user input only
    assert_eq!(
        orchestrator.history()[0].text_content(),
        "What is the capital of France?"
    );

    while ui_rx.try_recv().is_ok() {}
}

#[tokio::test]
async fn test_completed_turn_persists_and_touches_session() {
    let transport = Arc::new(MockTransport::new(vec![ScriptedCall::completed(&[
        &openai_delta("Hello"),
        &openai_delta(", world"),
    ])]));
    let gateway = Arc::new(RecordingGateway::new());
    let (ui_tx, mut ui_rx) = mpsc::channel(1024);

    let mut orchestrator = Orchestrator::new(
        "persist-session",
        openai_provider(),
        None,
        OrchestratorConfig::default(),
        transport as Arc<dyn StreamTransport>,
        gateway.clone() as Arc<dyn PersistenceGateway>,
        None,
        ui_tx,
    );

    let report = orchestrator.send("hi", &[]).await.expect("send failed");
    assert_eq!(
        report.status,
        TurnStatus::Completed {
            text: "Hello, world".to_string()
        }
    );

    assert_eq!(gateway.last_write(), Some("Hello, world".to_string()));
    assert_eq!(gateway.touches(), vec!["persist-session".to_string()]);

    // The stream was visible delta-by-delta
    let mut deltas = Vec::new();
    while let Ok(event) = ui_rx.try_recv() {
        if let UiEvent::AppendToLast(d) = event {
            deltas.push(d);
        }
    }
    assert_eq!(deltas.concat(), "Hello, world");
}

// =============================================================================
// Gemini wire format
// =============================================================================

#[tokio::test]
async fn test_gemini_turn_end_to_end() {
    let provider = ProviderConfig::Gemini {
        base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        api_key: "g-test".to_string(),
        model: "gemini-test".to_string(),
        params: GenerationParams::default(),
    };
    let payload = r#"{"candidates":[{"content":{"parts":[{"text":"Bonjour"}]}}]}"#;
    let transport = Arc::new(MockTransport::new(vec![ScriptedCall::completed(&[payload])]));
    let gateway = Arc::new(RecordingGateway::new());
    let (ui_tx, mut ui_rx) = mpsc::channel(1024);

    let mut orchestrator = Orchestrator::new(
        "gemini-session",
        provider,
        None,
        OrchestratorConfig::default(),
        transport.clone() as Arc<dyn StreamTransport>,
        gateway.clone() as Arc<dyn PersistenceGateway>,
        None,
        ui_tx,
    );

    let report = orchestrator.send("salut", &[]).await.expect("send failed");
    assert_eq!(
        report.status,
        TurnStatus::Completed {
            text: "Bonjour".to_string()
        }
    );

    let requests = transport.requests();
    assert!(requests[0].url.contains(":streamGenerateContent?alt=sse"));
    assert!(requests[0].url.contains("key=g-test"));
    let body = requests[0].body.to_string();
    assert!(body.contains("contents"));
    assert!(body.contains("generationConfig"));

    assert_eq!(gateway.last_write(), Some("Bonjour".to_string()));
    while ui_rx.try_recv().is_ok() {}
}

// =============================================================================
// Session cache
// =============================================================================

#[tokio::test]
async fn test_evicted_session_cancels_its_orchestrator_stream() {
    let transport = Arc::new(MockTransport::new(vec![ScriptedCall::stalled_after(&[
        &openai_delta("partial"),
    ])]));
    let cache = Arc::new(SessionCache::new(transport.clone() as Arc<dyn StreamTransport>, 2));
    let gateway = Arc::new(RecordingGateway::new());
    let (ui_tx, mut ui_rx) = mpsc::channel(1024);

    // The orchestrator shares the cached session's scope, so cache-level
    // eviction reaches its in-flight stream.
    let session = cache.get_or_create("session-a", "alpha");
    let mut orchestrator = Orchestrator::new(
        "session-a",
        openai_provider(),
        None,
        OrchestratorConfig::default(),
        transport.clone() as Arc<dyn StreamTransport>,
        gateway.clone() as Arc<dyn PersistenceGateway>,
        None,
        ui_tx,
    )
    .with_scope(session.scope.clone());

    // While the turn is still streaming, two more sessions push it out
    let evictor = Arc::clone(&cache);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        evictor.get_or_create("session-b", "beta");
        evictor.get_or_create("session-c", "gamma");
    });

    let report = orchestrator.send("first", &[]).await.expect("send failed");
    assert_eq!(report.status, TurnStatus::Cancelled);
    assert_eq!(cache.len(), 2);
    assert!(transport.cancelled_ids().len() == 1);

    // Mirroring the rendered events into the state shows the marked partial
    drop(orchestrator);
    while let Ok(event) = ui_rx.try_recv() {
        session.apply(&event);
    }
    let messages = session.messages.lock().unwrap();
    assert!(
        messages
            .last()
            .expect("no mirrored messages")
            .text_content()
            .ends_with(CANCEL_MARKER)
    );
    assert!(!session.generating.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn test_cancelled_turn_keeps_partial_and_session_recovers() {
    // A cancelled turn keeps its partial text and never surfaces as an
    // error; the session accepts the next turn normally.
    let transport = Arc::new(MockTransport::new(vec![
        ScriptedCall::stalled_after(&[&openai_delta("slow answer")]),
        ScriptedCall::completed(&[&openai_delta("fast answer")]),
    ]));
    let gateway = Arc::new(RecordingGateway::new());
    let (ui_tx, mut ui_rx) = mpsc::channel(1024);

    let mut orchestrator = Orchestrator::new(
        "supersede-session",
        openai_provider(),
        None,
        OrchestratorConfig::default(),
        transport.clone() as Arc<dyn StreamTransport>,
        gateway.clone() as Arc<dyn PersistenceGateway>,
        None,
        ui_tx,
    );

    let scope = orchestrator.scope();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(80)).await;
        scope.cancel();
    });

    let first = orchestrator.send("first", &[]).await.expect("send failed");
    assert_eq!(first.status, TurnStatus::Cancelled);

    let second = orchestrator.send("second", &[]).await.expect("send failed");
    assert_eq!(
        second.status,
        TurnStatus::Completed {
            text: "fast answer".to_string()
        }
    );

    // The cancelled partial kept its text, the new turn persisted last
    let writes: Vec<String> = gateway.writes().into_iter().map(|(_, c)| c).collect();
    assert!(writes.iter().any(|w| w.contains("slow answer")));
    assert_eq!(writes.last().map(String::as_str), Some("fast answer"));

    while ui_rx.try_recv().is_ok() {}
}
