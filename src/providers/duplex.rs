//! Duplex WebSocket provider.
//!
//! Persistent bidirectional channel for realtime scenarios. Messages are
//! JSON objects with a `type` discriminator: the request goes out as
//! `input`, the provider answers with `response_chunk` frames and a
//! terminal `response_done` (or `error`). The socket is a scoped
//! resource: it closes when the chunk stream is dropped.

use super::{Chunk, ChunkStream, ProviderBackend};
use crate::config::{ProviderSettings, ProviderVariant};
use crate::error::{AppError, AppResult};
use crate::logging::{log_debug, log_warn};
use crate::providers::{ChatRequest, ChatResponse, TokenUsage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Serialize)]
struct DuplexInput<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum DuplexFrame {
    #[serde(rename = "response_chunk")]
    ResponseChunk { delta: String },
    #[serde(rename = "response_done")]
    ResponseDone {
        #[serde(default)]
        prompt_tokens: u32,
        #[serde(default)]
        completion_tokens: u32,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

/// WebSocket duplex backend.
#[derive(Debug)]
pub struct DuplexProvider {
    settings: ProviderSettings,
}

impl DuplexProvider {
    pub fn new(settings: ProviderSettings) -> Self {
        Self { settings }
    }

    fn socket_url(&self) -> String {
        let base = self
            .settings
            .base_url
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{base}/v1/realtime?authorization=Bearer%20{}", self.settings.api_key)
    }
}

#[async_trait]
impl ProviderBackend for DuplexProvider {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn variant(&self) -> ProviderVariant {
        ProviderVariant::Duplex
    }

    async fn complete(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
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
        let url = self.socket_url();
        let (socket, _) = connect_async(url.as_str()).await.map_err(|e| {
            AppError::upstream_error(
                &self.settings.id,
                format!("socket open failed: {e}"),
                true,
                Some(Box::new(e)),
            )
        })?;
        let (mut sink, mut source) = socket.split();

        let input = DuplexInput {
            kind: "input",
            model: &self.settings.model,
            prompt: &request.prompt,
            system: request.system.as_deref(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };
        let payload = serde_json::to_string(&input)
            .map_err(|e| AppError::internal(format!("input serialization failed: {e}")))?;
        sink.send(Message::Text(payload)).await.map_err(|e| {
            AppError::upstream_error(
                &self.settings.id,
                format!("socket send failed: {e}"),
                true,
                Some(Box::new(e)),
            )
        })?;

        let provider = self.settings.id.clone();
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        // Reader task owns the socket halves; it closes the socket when
        // the stream terminates or the consumer goes away.
        tokio::spawn(async move {
            loop {
                let frame = match source.next().await {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => {
                        let _ = tx
                            .send(Chunk::Error {
                                kind: "upstream_error",
                                message: "socket closed before response_done".to_string(),
                            })
                            .await;
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log_warn!(provider = %provider, error = %e, "Duplex socket failed");
                        let _ = tx
                            .send(Chunk::Error {
                                kind: "upstream_error",
                                message: format!("socket failure: {e}"),
                            })
                            .await;
                        break;
                    }
                };

                let parsed: DuplexFrame = match serde_json::from_str(&frame) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        log_warn!(provider = %provider, error = %e, "Dropping unparseable duplex frame");
                        continue;
                    }
                };

                match parsed {
                    DuplexFrame::ResponseChunk { delta } => {
                        if tx.send(Chunk::Delta(delta)).await.is_err() {
                            break;
                        }
                    }
                    DuplexFrame::ResponseDone {
                        prompt_tokens,
                        completion_tokens,
                    } => {
                        log_debug!(provider = %provider, completion_tokens, "Duplex response done");
                        let _ = tx
                            .send(Chunk::Done(TokenUsage {
                                prompt_tokens,
                                completion_tokens,
                                total_tokens: prompt_tokens + completion_tokens,
                            }))
                            .await;
                        break;
                    }
                    DuplexFrame::Error { message } => {
                        let _ = tx
                            .send(Chunk::Error {
                                kind: "upstream_error",
                                message,
                            })
                            .await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}
