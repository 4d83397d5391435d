//! Palette session state.
//!
//! Sessions live in the memory of the owning worker process and die with
//! it; a client that lands on another worker simply opens a new session.
//! State is kept for a grace period after disconnect so a quick
//! reconnect with the same session id keeps de-duplicating against what
//! it already saw, then an idle sweep discards it.

use crate::config::PaletteConfig;
use crate::diagram::DiagramKind;
use crate::error::{AppError, AppResult};
use crate::logging::{log_debug, log_info};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Dedup key for a node string: trimmed and lowercased.
pub fn normalize_node(raw: &str) -> String {
    raw.trim().to_lowercase()
}

#[derive(Debug)]
struct SessionState {
    /// Normalized node strings already sent to this client. Strictly
    /// monotonic until session end.
    suggested: HashSet<String>,
    /// Index into the kind's stage sequence.
    stage_index: usize,
    /// Stages whose contents must no longer be regenerated.
    locked_stages: HashSet<&'static str>,
    /// One tab per earlier-stage item when a session reopens on a
    /// diagram that already has content.
    tabs: Vec<String>,
}

/// One client's palette context.
#[derive(Debug)]
pub struct PaletteSession {
    pub id: String,
    pub user_id: i64,
    pub topic: String,
    pub kind: DiagramKind,
    state: Mutex<SessionState>,
    /// Root of this session's cancellation tree. Batches run on child
    /// tokens; closing the session cancels the subtree.
    cancel: CancellationToken,
    /// Advances on every stage transition. The merger drops nodes
    /// stamped with an older epoch, so a late batch from a cancelled
    /// stage cannot leak into the new stage's stream.
    epoch: AtomicU64,
    last_activity: Mutex<Instant>,
}

impl PaletteSession {
    fn new(
        id: String,
        user_id: i64,
        topic: String,
        kind: DiagramKind,
        existing_items: Vec<String>,
    ) -> Self {
        let stages = kind.stage_sequence();
        // Reopening with earlier-stage content: that stage is done, lock
        // it and start at the next one with a tab per existing item.
        let (stage_index, locked, tabs) = if existing_items.is_empty() || stages.len() == 1 {
            (0, HashSet::new(), Vec::new())
        } else {
            (1, HashSet::from([stages[0]]), existing_items.clone())
        };

        let suggested = existing_items.iter().map(|s| normalize_node(s)).collect();

        Self {
            id,
            user_id,
            topic,
            kind,
            state: Mutex::new(SessionState {
                suggested,
                stage_index,
                locked_stages: locked,
                tabs,
            }),
            cancel: CancellationToken::new(),
            epoch: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Current stage name.
    pub fn current_stage(&self) -> &'static str {
        let state = self.state.lock().expect("session mutex poisoned");
        self.kind.stage_sequence()[state.stage_index]
    }

    /// Tabs carried over from an earlier stage, if any.
    pub fn tabs(&self) -> Vec<String> {
        self.state.lock().expect("session mutex poisoned").tabs.clone()
    }

    /// Current epoch. Batches stamp every node they produce with the
    /// epoch they started under.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Child token for one batch; cancelled by session close or stage
    /// advance.
    pub fn batch_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Claim a node for this session. Returns `true` when the node was
    /// fresh (and is now recorded), `false` for a duplicate.
    pub fn try_claim(&self, node: &str) -> bool {
        let mut state = self.state.lock().expect("session mutex poisoned");
        state.suggested.insert(normalize_node(node))
    }

    /// Number of nodes suggested so far.
    pub fn suggested_count(&self) -> usize {
        self.state
            .lock()
            .expect("session mutex poisoned")
            .suggested
            .len()
    }

    /// Snapshot of suggested nodes for prompt construction.
    pub fn suggested_snapshot(&self) -> Vec<String> {
        let state = self.state.lock().expect("session mutex poisoned");
        state.suggested.iter().cloned().collect()
    }

    /// Whether generation is allowed for `stage` (not locked, is the
    /// current stage).
    pub fn stage_open(&self, stage: &str) -> bool {
        let state = self.state.lock().expect("session mutex poisoned");
        !state.locked_stages.contains(stage)
            && self.kind.stage_sequence()[state.stage_index] == stage
    }

    /// Transition to the next stage: lock the current one, bump the
    /// epoch, and populate tabs from `items` (the contents the client
    /// settled on for the finished stage).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Validation`] when already at the last stage.
    pub fn advance_stage(&self, items: Vec<String>) -> AppResult<&'static str> {
        let stages = self.kind.stage_sequence();
        let mut state = self.state.lock().expect("session mutex poisoned");
        if state.stage_index + 1 >= stages.len() {
            return Err(AppError::validation(format!(
                "diagram kind {} has no stage after {}",
                self.kind.as_str(),
                stages[state.stage_index]
            )));
        }
        let prior = stages[state.stage_index];
        state.locked_stages.insert(prior);
        state.stage_index += 1;
        state.tabs = items;
        let next = stages[state.stage_index];
        drop(state);

        // Late nodes from the prior stage now carry a stale epoch and
        // are dropped at the merger.
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        log_debug!(
            session = %self.id,
            prior_stage = prior,
            next_stage = next,
            epoch = epoch,
            "Stage advanced"
        );
        Ok(next)
    }

    /// Record activity, deferring idle expiry.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("session mutex poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("session mutex poisoned")
            .elapsed()
    }

    /// Cancel the whole session subtree.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Owner of all live palette sessions in this worker.
#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<PaletteSession>>>,
    config: PaletteConfig,
}

impl SessionManager {
    pub fn new(config: PaletteConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Open a session. `existing_items` carries earlier-stage content
    /// when the client reopens a palette on a diagram that already has
    /// some; the session then starts directly at the next stage.
    pub async fn open(
        &self,
        user_id: i64,
        topic: impl Into<String>,
        kind: DiagramKind,
        existing_items: Vec<String>,
    ) -> Arc<PaletteSession> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(PaletteSession::new(
            id.clone(),
            user_id,
            topic.into(),
            kind,
            existing_items,
        ));
        self.sessions
            .write()
            .await
            .insert(id.clone(), Arc::clone(&session));
        log_info!(session = %id, user_id = user_id, kind = kind.as_str(), "Palette session opened");
        session
    }

    /// Fetch a live session, refreshing its activity clock.
    pub async fn get(&self, id: &str) -> Option<Arc<PaletteSession>> {
        let session = self.sessions.read().await.get(id).cloned()?;
        session.touch();
        Some(session)
    }

    /// Explicitly close and discard a session.
    pub async fn close(&self, id: &str) {
        if let Some(session) = self.sessions.write().await.remove(id) {
            session.close();
            log_info!(session = %id, "Palette session closed");
        }
    }

    /// Live session count.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Discard sessions idle past expiry. Returns how many were removed.
    pub async fn sweep_idle(&self) -> usize {
        let expiry = self.config.idle_expiry;
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| {
            let keep = session.idle_for() < expiry;
            if !keep {
                session.close();
            }
            keep
        });
        let removed = before - sessions.len();
        if removed > 0 {
            log_debug!(removed = removed, remaining = sessions.len(), "Idle sessions swept");
        }
        removed
    }

    /// Background sweep task; runs until `cancel` fires.
    pub fn spawn_expiry_sweep(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.sweep_idle().await;
                    }
                }
            }
        })
    }
}
