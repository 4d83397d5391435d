use crate::config::PaletteConfig;
use crate::diagram::DiagramKind;
use crate::palette::{normalize_node, SessionManager};
use std::time::Duration;

// Unit Tests for PaletteSession / SessionManager
//
// UNIT UNDER TEST: per-session state (dedup, stages, epochs, expiry)
//
// BUSINESS RESPONSIBILITY:
//   - No node string is claimed twice within a session
//   - Stage transitions lock the prior stage and advance the epoch so
//     late chunks from the old stage are droppable
//   - Reopening over existing content starts at the next stage with one
//     tab per earlier item
//   - Idle sessions are swept and their cancellation subtree fires

fn config_with_expiry(idle_expiry: Duration) -> PaletteConfig {
    PaletteConfig {
        idle_expiry,
        ..PaletteConfig::default()
    }
}

#[test]
fn test_normalization_trims_and_lowercases() {
    assert_eq!(normalize_node("  Chlorophyll "), "chlorophyll");
    assert_eq!(normalize_node("LIGHT reaction"), "light reaction");
}

#[tokio::test]
async fn test_dedup_claims_each_node_once() {
    let manager = SessionManager::new(PaletteConfig::default());
    let session = manager
        .open(1, "photosynthesis", DiagramKind::BubbleMap, Vec::new())
        .await;

    assert!(session.try_claim("Chlorophyll"), "First claim is fresh");
    assert!(
        !session.try_claim("chlorophyll"),
        "Dedup is case-insensitive"
    );
    assert!(
        !session.try_claim("  Chlorophyll  "),
        "Dedup ignores surrounding whitespace"
    );
    assert_eq!(session.suggested_count(), 1);
}

#[tokio::test]
async fn test_stage_advance_locks_prior_stage_and_bumps_epoch() {
    let manager = SessionManager::new(PaletteConfig::default());
    let session = manager
        .open(1, "biology", DiagramKind::Mindmap, Vec::new())
        .await;

    // Arrange
    assert_eq!(session.current_stage(), "dimensions");
    assert_eq!(session.epoch(), 0);
    assert!(session.stage_open("dimensions"));

    // Act
    let next = session
        .advance_stage(vec!["structure".to_string(), "function".to_string()])
        .expect("mindmap has a second stage");

    // Assert
    assert_eq!(next, "categories");
    assert_eq!(session.epoch(), 1, "Epoch advances with the stage");
    assert!(
        !session.stage_open("dimensions"),
        "The finished stage must not regenerate"
    );
    assert!(session.stage_open("categories"));
    assert_eq!(session.tabs(), vec!["structure", "function"]);
}

#[tokio::test]
async fn test_single_stage_kind_cannot_advance() {
    let manager = SessionManager::new(PaletteConfig::default());
    let session = manager
        .open(1, "cats", DiagramKind::BubbleMap, Vec::new())
        .await;

    let result = session.advance_stage(Vec::new());

    assert!(result.is_err(), "bubble_map has a single stage");
}

#[tokio::test]
async fn test_reopen_with_existing_items_starts_at_next_stage() {
    let manager = SessionManager::new(PaletteConfig::default());
    let existing = vec!["Roots".to_string(), "Leaves".to_string()];

    // Act: the diagram already has stage-1 content.
    let session = manager
        .open(1, "plants", DiagramKind::TreeMap, existing)
        .await;

    // Assert
    assert_eq!(
        session.current_stage(),
        "children",
        "Stage 1 is done; the session starts at the next stage"
    );
    assert!(!session.stage_open("categories"));
    assert_eq!(
        session.tabs(),
        vec!["Roots", "Leaves"],
        "One tab per existing earlier-stage item"
    );
    assert!(
        !session.try_claim("roots"),
        "Existing items participate in dedup"
    );
}

#[tokio::test]
async fn test_session_lookup_and_close() {
    let manager = SessionManager::new(PaletteConfig::default());
    let session = manager
        .open(7, "topic", DiagramKind::BubbleMap, Vec::new())
        .await;
    let id = session.id.clone();

    assert!(manager.get(&id).await.is_some());

    let token = session.batch_token();
    manager.close(&id).await;

    assert!(manager.get(&id).await.is_none(), "Closed sessions are gone");
    assert!(
        token.is_cancelled(),
        "Closing a session cancels its whole subtree"
    );
}

#[tokio::test]
async fn test_idle_sweep_discards_expired_sessions() {
    // Arrange: zero expiry makes every session instantly stale.
    let manager = SessionManager::new(config_with_expiry(Duration::ZERO));
    let session = manager
        .open(1, "topic", DiagramKind::BubbleMap, Vec::new())
        .await;
    let token = session.batch_token();

    // Act
    let removed = manager.sweep_idle().await;

    // Assert
    assert_eq!(removed, 1);
    assert_eq!(manager.len().await, 0);
    assert!(token.is_cancelled(), "Sweep cancels the session subtree");
}

#[tokio::test]
async fn test_sweep_retains_active_sessions() {
    let manager = SessionManager::new(config_with_expiry(Duration::from_secs(600)));
    let _session = manager
        .open(1, "topic", DiagramKind::BubbleMap, Vec::new())
        .await;

    let removed = manager.sweep_idle().await;

    assert_eq!(removed, 0, "Fresh sessions survive the sweep");
    assert_eq!(manager.len().await, 1);
}
