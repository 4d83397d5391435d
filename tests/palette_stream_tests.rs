//! Node-palette fan-out behavior against mocked providers.
//!
//! Covers the fan-out contract: dedup across providers, per-provider
//! ordering, cancellation on client disconnect, per-provider failure
//! isolation, and epoch-based stale-chunk dropping.

mod common;

use common::{build_facade, sse_body, test_provider};
use mindcanvas::config::{PaletteConfig, ProviderVariant};
use mindcanvas::diagram::DiagramKind;
use mindcanvas::palette::{PaletteEvent, PaletteStreamer, SessionManager};
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn palette_config() -> PaletteConfig {
    PaletteConfig {
        providers_per_batch: 2,
        nodes_per_provider: 5,
        overall_deadline: Duration::from_secs(5),
        cancel_grace: Duration::from_millis(200),
        idle_expiry: Duration::from_secs(600),
    }
}

async fn mock_stream_provider(server: &MockServer, nodes: &[&str], delay: Duration) {
    let deltas: Vec<String> = nodes.iter().map(|n| format!("{n}\n")).collect();
    let delta_refs: Vec<&str> = deltas.iter().map(String::as_str).collect();
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&delta_refs, 10, 10), "text/event-stream")
                .set_delay(delay),
        )
        .mount(server)
        .await;
}

async fn collect_events(mut handle: mindcanvas::palette::BatchHandle) -> Vec<PaletteEvent> {
    let mut events = Vec::new();
    while let Some(event) = handle.events.recv().await {
        events.push(event);
    }
    events
}

fn is_subsequence(needle: &[String], haystack: &[&str]) -> bool {
    let mut iter = haystack.iter();
    needle.iter().all(|n| iter.any(|h| h == n))
}

#[tokio::test]
async fn test_batch_merges_dedups_and_completes() {
    // Arrange: two providers, one overlapping node ("stomata").
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    mock_stream_provider(&server_a, &["chlorophyll", "stomata", "xylem"], Duration::ZERO).await;
    mock_stream_provider(&server_b, &["stomata", "phloem"], Duration::ZERO).await;

    let providers = [
        test_provider("alpha", &server_a.uri(), ProviderVariant::Stream),
        test_provider("beta", &server_b.uri(), ProviderVariant::Stream),
    ];
    let (facade, _, _) = build_facade(&providers);
    let manager = SessionManager::new(palette_config());
    let streamer = PaletteStreamer::new(facade, palette_config());
    let session = manager
        .open(1, "photosynthesis", DiagramKind::BubbleMap, Vec::new())
        .await;

    // Act
    let handle = streamer
        .next_batch(Arc::clone(&session), None)
        .await
        .expect("batch starts");
    let events = collect_events(handle).await;

    // Assert: framing events in order.
    assert!(
        matches!(events.first(), Some(PaletteEvent::BatchStarted { .. })),
        "Stream opens with batch_started"
    );
    let total = match events.last() {
        Some(PaletteEvent::BatchCompleted { total_unique_nodes }) => *total_unique_nodes,
        other => panic!("stream must end with batch_completed, got {other:?}"),
    };
    assert_eq!(total, 4, "5 candidates minus 1 overlap");

    // Dedup: no node string appears twice.
    let nodes: Vec<(String, String)> = events
        .iter()
        .filter_map(|e| match e {
            PaletteEvent::NodeGenerated { node, provider, .. } => {
                Some((node.clone(), provider.clone()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(nodes.len(), 4);
    let mut seen: Vec<&String> = nodes.iter().map(|(n, _)| n).collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 4, "No duplicate node in the merged stream");

    // Per-provider order is the order that provider emitted.
    let alpha_nodes: Vec<String> = nodes
        .iter()
        .filter(|(_, p)| p == "alpha")
        .map(|(n, _)| n.clone())
        .collect();
    assert!(
        is_subsequence(&alpha_nodes, &["chlorophyll", "stomata", "xylem"]),
        "alpha's nodes out of order: {alpha_nodes:?}"
    );
    let beta_nodes: Vec<String> = nodes
        .iter()
        .filter(|(_, p)| p == "beta")
        .map(|(n, _)| n.clone())
        .collect();
    assert!(is_subsequence(&beta_nodes, &["stomata", "phloem"]));

    // Both providers reported done.
    let done_count = events
        .iter()
        .filter(|e| matches!(e, PaletteEvent::ProviderDone { .. }))
        .count();
    assert_eq!(done_count, 2);
}

#[tokio::test]
async fn test_client_cancel_stops_events_and_releases_permits() {
    // Arrange: slow providers so cancellation lands mid-batch.
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    mock_stream_provider(&server_a, &["one", "two"], Duration::from_secs(2)).await;
    mock_stream_provider(&server_b, &["three"], Duration::from_secs(2)).await;

    let providers = [
        test_provider("alpha", &server_a.uri(), ProviderVariant::Stream),
        test_provider("beta", &server_b.uri(), ProviderVariant::Stream),
    ];
    let (facade, limiter, _) = build_facade(&providers);
    let manager = SessionManager::new(palette_config());
    let streamer = PaletteStreamer::new(facade, palette_config());
    let session = manager
        .open(1, "topic", DiagramKind::BubbleMap, Vec::new())
        .await;

    // Act: take batch_started, then disconnect.
    let mut handle = streamer
        .next_batch(Arc::clone(&session), None)
        .await
        .expect("batch starts");
    let first = handle.events.recv().await;
    assert!(matches!(first, Some(PaletteEvent::BatchStarted { .. })));
    handle.cancel.cancel();

    // Assert: no node_generated after cancel; the channel just closes.
    let rest = tokio::time::timeout(Duration::from_millis(500), handle.events.recv()).await;
    assert!(
        matches!(rest, Ok(None)),
        "After cancel the stream closes without further events, got {rest:?}"
    );

    // All permits released within a second.
    let deadline = std::time::Instant::now() + Duration::from_secs(1);
    loop {
        let alpha = limiter.in_flight("alpha").await.unwrap();
        let beta = limiter.in_flight("beta").await.unwrap();
        if alpha == 0 && beta == 0 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "Permits still held 1 s after cancel: alpha={alpha} beta={beta}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The dedup set survives for a reconnect within idle expiry.
    assert!(manager.get(&session.id).await.is_some());
}

#[tokio::test]
async fn test_one_provider_failure_does_not_abort_the_batch() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    mock_stream_provider(&server_a, &["alpha-node"], Duration::ZERO).await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server_b)
        .await;

    let providers = [
        test_provider("alpha", &server_a.uri(), ProviderVariant::Stream),
        test_provider("beta", &server_b.uri(), ProviderVariant::Stream),
    ];
    let (facade, _, _) = build_facade(&providers);
    let manager = SessionManager::new(palette_config());
    let streamer = PaletteStreamer::new(facade, palette_config());
    let session = manager
        .open(1, "topic", DiagramKind::BubbleMap, Vec::new())
        .await;

    let handle = streamer.next_batch(session, None).await.expect("starts");
    let events = collect_events(handle).await;

    // The healthy provider's node arrives and the batch completes.
    assert!(events.iter().any(
        |e| matches!(e, PaletteEvent::NodeGenerated { node, .. } if node == "alpha-node")
    ));
    assert!(matches!(
        events.last(),
        Some(PaletteEvent::BatchCompleted {
            total_unique_nodes: 1
        })
    ));
    // The failed provider is reported, not hidden.
    assert!(events.iter().any(
        |e| matches!(e, PaletteEvent::ProviderDone { provider, status } if provider == "beta" && status != "ok")
    ));
}

#[tokio::test]
async fn test_all_provider_failures_emit_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;

    let providers = [
        test_provider("alpha", &server.uri(), ProviderVariant::Stream),
        test_provider("beta", &server.uri(), ProviderVariant::Stream),
    ];
    let (facade, _, _) = build_facade(&providers);
    let manager = SessionManager::new(palette_config());
    let streamer = PaletteStreamer::new(facade, palette_config());
    let session = manager
        .open(1, "topic", DiagramKind::BubbleMap, Vec::new())
        .await;

    let handle = streamer.next_batch(session, None).await.expect("starts");
    let events = collect_events(handle).await;

    assert!(
        matches!(events.last(), Some(PaletteEvent::Error { .. })),
        "All providers failing terminates the stream with error, got {:?}",
        events.last()
    );
}

#[tokio::test]
async fn test_stage_advance_drops_stale_epoch_nodes() {
    // Arrange: nodes arrive after the client has moved to the next
    // stage; they carry the old epoch and must not leak through.
    let server = MockServer::start().await;
    mock_stream_provider(&server, &["late-node"], Duration::from_millis(300)).await;

    let providers = [
        test_provider("alpha", &server.uri(), ProviderVariant::Stream),
        test_provider("beta", &server.uri(), ProviderVariant::Stream),
    ];
    let (facade, _, _) = build_facade(&providers);
    let manager = SessionManager::new(palette_config());
    let streamer = PaletteStreamer::new(facade, palette_config());
    let session = manager
        .open(1, "biology", DiagramKind::Mindmap, Vec::new())
        .await;

    // Act: start a batch in stage "dimensions", then advance mid-flight.
    let handle = streamer
        .next_batch(Arc::clone(&session), None)
        .await
        .expect("starts");
    tokio::time::sleep(Duration::from_millis(50)).await;
    session
        .advance_stage(vec!["anatomy".to_string()])
        .expect("mindmap advances");
    let events = collect_events(handle).await;

    // Assert: the late nodes were dropped at the merger.
    let node_count = events
        .iter()
        .filter(|e| matches!(e, PaletteEvent::NodeGenerated { .. }))
        .count();
    assert_eq!(node_count, 0, "Stale-epoch nodes must not reach the client");
    assert!(matches!(
        events.last(),
        Some(PaletteEvent::BatchCompleted {
            total_unique_nodes: 0
        })
    ));
}
