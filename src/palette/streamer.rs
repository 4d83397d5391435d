//! Fan-out / merge streamer.
//!
//! One batch runs K provider calls in parallel, parses their output into
//! candidate nodes as it arrives, de-duplicates against the session, and
//! merges everything into a single ordered event stream. Per-provider
//! order is preserved (each provider task feeds the shared channel
//! sequentially); global order is first-come as merged.
//!
//! Cancellation tree for one batch:
//!
//! ```text
//! session root ── batch handle token ── fan-out token ── provider ctx tokens
//! ```
//!
//! Client disconnect cancels the handle token and with it the whole
//! subtree; the batch deadline cancels only the fan-out token, so the
//! merger can still emit `provider_done` / `batch_completed` events.

use crate::config::PaletteConfig;
use crate::diagram::{clean_node_line, palette_prompt};
use crate::error::{AppError, AppResult};
use crate::facade::{CallContext, LlmFacade};
use crate::logging::{log_debug, log_warn};
use crate::palette::session::PaletteSession;
use crate::providers::{ChatRequest, Chunk};
use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Event channel depth toward the SSE writer.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted on the merged stream, in SSE order.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PaletteEvent {
    BatchStarted {
        session_id: String,
        stage: &'static str,
        epoch: u64,
    },
    NodeGenerated {
        node: String,
        provider: String,
        stage: &'static str,
    },
    ProviderDone {
        provider: String,
        status: String,
    },
    BatchCompleted {
        total_unique_nodes: usize,
    },
    Error {
        kind: String,
        message: String,
    },
}

impl PaletteEvent {
    /// SSE `event:` name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::BatchStarted { .. } => "batch_started",
            Self::NodeGenerated { .. } => "node_generated",
            Self::ProviderDone { .. } => "provider_done",
            Self::BatchCompleted { .. } => "batch_completed",
            Self::Error { .. } => "error",
        }
    }
}

/// What a provider task reports to the merger.
#[derive(Debug)]
enum ProviderMsg {
    Node {
        provider: String,
        /// Session epoch the batch started under; stale epochs are
        /// dropped at the merger.
        epoch: u64,
        node: String,
    },
    Done {
        provider: String,
        ok: bool,
        status: String,
    },
}

/// A running batch: the merged event stream plus the token that cancels
/// it. The HTTP layer cancels the token when the client disconnects.
#[derive(Debug)]
pub struct BatchHandle {
    pub events: mpsc::Receiver<PaletteEvent>,
    pub cancel: CancellationToken,
}

/// Session-scoped fan-out runner. One per worker, injected into the
/// HTTP layer.
#[derive(Debug)]
pub struct PaletteStreamer {
    facade: Arc<LlmFacade>,
    config: PaletteConfig,
}

impl PaletteStreamer {
    pub fn new(facade: Arc<LlmFacade>, config: PaletteConfig) -> Self {
        Self { facade, config }
    }

    /// Run one batch for `session`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Validation`] when the session's current stage
    /// is locked, or when no providers are configured.
    pub async fn next_batch(
        &self,
        session: Arc<PaletteSession>,
        stage_data: Option<String>,
    ) -> AppResult<BatchHandle> {
        session.touch();
        let stage = session.current_stage();
        if !session.stage_open(stage) {
            return Err(AppError::validation(format!("stage {stage} is locked")));
        }

        let mut provider_ids = self.facade.provider_ids();
        provider_ids.sort();
        provider_ids.truncate(self.config.providers_per_batch);
        if provider_ids.is_empty() {
            return Err(AppError::validation("no providers configured"));
        }

        let epoch = session.epoch();
        let handle_cancel = session.batch_token();
        let fanout_cancel = handle_cancel.child_token();

        // One snapshot feeds every provider's prompt; the live set keeps
        // growing as the batch runs, but prompt-side discouragement only
        // needs what the client has already seen.
        let suggested = session.suggested_snapshot();
        let prompt_base = |_provider: &str| {
            palette_prompt(
                &session.topic,
                session.kind,
                stage,
                stage_data.as_deref(),
                &suggested,
                self.config.nodes_per_provider,
            )
        };

        let (node_tx, node_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        for provider_id in &provider_ids {
            let request = ChatRequest::new(prompt_base(provider_id));
            let ctx = CallContext::new(
                session.user_id,
                "node_palette",
                fanout_cancel.child_token(),
            );
            tokio::spawn(run_provider(
                Arc::clone(&self.facade),
                provider_id.clone(),
                request,
                ctx,
                epoch,
                node_tx.clone(),
            ));
        }
        drop(node_tx);

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(merge(
            session,
            stage,
            epoch,
            provider_ids.len(),
            self.config.clone(),
            handle_cancel.clone(),
            fanout_cancel,
            node_rx,
            event_tx,
        ));

        Ok(BatchHandle {
            events: event_rx,
            cancel: handle_cancel,
        })
    }
}

/// Drive one provider call and feed candidates to the merger in the
/// order the provider emitted them.
async fn run_provider(
    facade: Arc<LlmFacade>,
    provider_id: String,
    request: ChatRequest,
    ctx: CallContext,
    epoch: u64,
    tx: mpsc::Sender<ProviderMsg>,
) {
    let mut stream = match facade.chat_stream(&provider_id, &request, &ctx).await {
        Ok(stream) => stream,
        Err(err) => {
            let _ = tx
                .send(ProviderMsg::Done {
                    provider: provider_id,
                    ok: false,
                    status: err.code().to_string(),
                })
                .await;
            return;
        }
    };

    let mut line_buf = String::new();
    let mut completed = false;
    let mut failure: Option<String> = None;

    while let Some(chunk) = stream.next().await {
        match chunk {
            Chunk::Delta(delta) => {
                line_buf.push_str(&delta);
                while let Some(newline) = line_buf.find('\n') {
                    let line = line_buf[..newline].to_string();
                    line_buf.drain(..=newline);
                    if let Some(node) = clean_node_line(&line) {
                        let msg = ProviderMsg::Node {
                            provider: provider_id.clone(),
                            epoch,
                            node,
                        };
                        if tx.send(msg).await.is_err() {
                            return;
                        }
                    }
                }
            }
            Chunk::Meta { .. } => {}
            Chunk::Done(_) => {
                completed = true;
                break;
            }
            Chunk::Error { message, .. } => {
                failure = Some(message);
                break;
            }
        }
    }

    // Flush a trailing unterminated line.
    if completed {
        if let Some(node) = clean_node_line(&line_buf) {
            let _ = tx
                .send(ProviderMsg::Node {
                    provider: provider_id.clone(),
                    epoch,
                    node,
                })
                .await;
        }
    }

    let (ok, status) = match (completed, failure) {
        (true, _) => (true, "ok".to_string()),
        (false, Some(message)) => (false, message),
        // Stream ended without a terminal marker: cancelled upstream.
        (false, None) => (false, "cancelled".to_string()),
    };
    let _ = tx
        .send(ProviderMsg::Done {
            provider: provider_id,
            ok,
            status,
        })
        .await;
}

/// The single merger task: dedups, stamps, orders, and terminates the
/// event stream.
#[allow(clippy::too_many_arguments)]
async fn merge(
    session: Arc<PaletteSession>,
    stage: &'static str,
    epoch: u64,
    provider_count: usize,
    config: PaletteConfig,
    handle_cancel: CancellationToken,
    fanout_cancel: CancellationToken,
    mut node_rx: mpsc::Receiver<ProviderMsg>,
    event_tx: mpsc::Sender<PaletteEvent>,
) {
    let started_event = PaletteEvent::BatchStarted {
        session_id: session.id.clone(),
        stage,
        epoch,
    };
    if event_tx.send(started_event).await.is_err() {
        handle_cancel.cancel();
        return;
    }

    let deadline = tokio::time::sleep(config.overall_deadline);
    tokio::pin!(deadline);

    let mut unique = 0usize;
    let mut done = 0usize;
    let mut succeeded = 0usize;
    let mut deadline_hit = false;

    loop {
        tokio::select! {
            // Client disconnect: stop emitting immediately; the token
            // cancels every provider subtree.
            _ = handle_cancel.cancelled() => {
                log_debug!(session = %session.id, "Batch cancelled by client");
                return;
            }
            _ = &mut deadline, if !deadline_hit => {
                deadline_hit = true;
                fanout_cancel.cancel();
                // Grace period: drain provider_done reports, drop any
                // late nodes, then force completion.
                let grace = tokio::time::sleep(config.cancel_grace);
                tokio::pin!(grace);
                loop {
                    tokio::select! {
                        _ = handle_cancel.cancelled() => return,
                        _ = &mut grace => break,
                        msg = node_rx.recv() => match msg {
                            Some(ProviderMsg::Done { provider, ok, status }) => {
                                done += 1;
                                if ok { succeeded += 1; }
                                let event = PaletteEvent::ProviderDone { provider, status };
                                if event_tx.send(event).await.is_err() {
                                    handle_cancel.cancel();
                                    return;
                                }
                            }
                            Some(ProviderMsg::Node { .. }) => {}
                            None => break,
                        }
                    }
                }
                break;
            }
            msg = node_rx.recv() => match msg {
                Some(ProviderMsg::Node { provider, epoch: node_epoch, node }) => {
                    // Stale epoch: a batch from a stage the client left.
                    if node_epoch != session.epoch() {
                        continue;
                    }
                    if !session.try_claim(&node) {
                        log_debug!(session = %session.id, node = %node, "Duplicate node dropped");
                        continue;
                    }
                    unique += 1;
                    let event = PaletteEvent::NodeGenerated { node, provider, stage };
                    if event_tx.send(event).await.is_err() {
                        handle_cancel.cancel();
                        return;
                    }
                }
                Some(ProviderMsg::Done { provider, ok, status }) => {
                    done += 1;
                    if ok { succeeded += 1; }
                    let event = PaletteEvent::ProviderDone { provider, status };
                    if event_tx.send(event).await.is_err() {
                        handle_cancel.cancel();
                        return;
                    }
                    if done == provider_count {
                        break;
                    }
                }
                None => break,
            }
        }
    }

    let final_event = if succeeded == 0 && done == provider_count {
        log_warn!(session = %session.id, "All providers failed in batch");
        PaletteEvent::Error {
            kind: "upstream_error".to_string(),
            message: "all providers failed".to_string(),
        }
    } else {
        PaletteEvent::BatchCompleted {
            total_unique_nodes: unique,
        }
    };
    let _ = event_tx.send(final_event).await;
}
