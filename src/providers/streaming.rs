//! Streaming HTTP provider.
//!
//! POSTs with `stream=true` and parses the event-per-token framing: one
//! `data: <json>` line per delta, terminated by the `[DONE]` sentinel,
//! with a usage summary in the final event. Frames arrive on arbitrary
//! byte boundaries, so a line buffer reassembles them before parsing.

use super::{
    classify_status, classify_transport, Chunk, ChunkStream, ProviderBackend, WireRequest,
    WireStreamEvent,
};
use crate::config::{ProviderSettings, ProviderVariant};
use crate::error::{AppError, AppResult};
use crate::logging::{log_debug, log_warn};
use crate::providers::{ChatRequest, ChatResponse, TokenUsage};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Channel capacity for the chunk pipeline. Small on purpose: the
/// producer must not run far ahead of a slow consumer.
const CHANNEL_CAPACITY: usize = 32;

/// OpenAI-compatible streaming backend.
#[derive(Debug)]
pub struct StreamProvider {
    settings: ProviderSettings,
    http: reqwest::Client,
}

impl StreamProvider {
    pub fn new(settings: ProviderSettings, http: reqwest::Client) -> Self {
        Self { settings, http }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.settings.base_url)
    }
}

#[async_trait]
impl ProviderBackend for StreamProvider {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn variant(&self) -> ProviderVariant {
        ProviderVariant::Stream
    }

    async fn complete(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
        // Collect the stream into a single response for call sites that
        // want the one-shot shape.
        let mut stream = self.open_stream(request).await?;
        let mut content = String::new();
        let mut usage = TokenUsage::default();

        while let Some(chunk) = stream.next().await {
            match chunk {
                Chunk::Delta(delta) => content.push_str(&delta),
                Chunk::Meta { .. } => {}
                Chunk::Done(final_usage) => usage = final_usage,
                Chunk::Error { message, .. } => {
                    return Err(AppError::upstream_error(&self.settings.id, message, false, None));
                }
            }
        }

        Ok(ChatResponse {
            content,
            usage,
            model: self.settings.model.clone(),
        })
    }

    async fn open_stream(&self, request: &ChatRequest) -> AppResult<ChunkStream> {
        let mut wire = WireRequest::from_chat(&self.settings, request);
        wire.stream = Some(true);

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.settings.api_key)
            .timeout(self.settings.request_timeout)
            .json(&wire)
            .send()
            .await
            .map_err(|e| {
                classify_transport(&self.settings.id, e, self.settings.request_timeout.as_secs())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.settings.id, status.as_u16(), &body));
        }

        let provider = self.settings.id.clone();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        // The producer owns the HTTP response. When the consumer drops
        // the receiver, the next send fails, the task returns, and the
        // response body (and with it the upstream connection) closes.
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut line_buf = String::new();
            let mut usage: Option<TokenUsage> = None;
            let mut tokens_so_far: u32 = 0;

            'read: while let Some(piece) = bytes.next().await {
                let piece = match piece {
                    Ok(p) => p,
                    Err(e) => {
                        log_warn!(provider = %provider, error = %e, "Stream transport failed mid-response");
                        let _ = tx
                            .send(Chunk::Error {
                                kind: "upstream_error",
                                message: format!("stream interrupted: {e}"),
                            })
                            .await;
                        return;
                    }
                };

                line_buf.push_str(&String::from_utf8_lossy(&piece));

                while let Some(newline) = line_buf.find('\n') {
                    let line = line_buf[..newline].trim().to_string();
                    line_buf.drain(..=newline);

                    let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
                        continue;
                    };
                    if payload == "[DONE]" {
                        break 'read;
                    }

                    let event: WireStreamEvent = match serde_json::from_str(payload) {
                        Ok(event) => event,
                        Err(e) => {
                            log_warn!(
                                provider = %provider,
                                error = %e,
                                "Dropping unparseable stream frame"
                            );
                            continue;
                        }
                    };

                    if let Some(wire_usage) = event.usage {
                        usage = Some(wire_usage.into());
                    }
                    for choice in event.choices {
                        if let Some(delta) = choice.delta.content {
                            if delta.is_empty() {
                                continue;
                            }
                            tokens_so_far += 1;
                            if tx.send(Chunk::Delta(delta)).await.is_err() {
                                // Consumer gone: close upstream now.
                                return;
                            }
                        }
                        if choice.finish_reason.is_some() {
                            break 'read;
                        }
                    }
                }
            }

            let final_usage = usage.unwrap_or(TokenUsage {
                prompt_tokens: 0,
                completion_tokens: tokens_so_far,
                total_tokens: tokens_so_far,
            });
            log_debug!(
                provider = %provider,
                completion_tokens = final_usage.completion_tokens,
                "Stream completed"
            );
            let _ = tx.send(Chunk::Done(final_usage)).await;
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}
