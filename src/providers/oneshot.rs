//! One-shot HTTP provider.
//!
//! Single request, full JSON body back. Used for providers whose API does
//! not support (or whose call sites do not need) token streaming.

use super::{
    classify_status, classify_transport, Chunk, ChunkStream, ProviderBackend, WireRequest,
    WireResponse,
};
use crate::config::{ProviderSettings, ProviderVariant};
use crate::error::{AppError, AppResult};
use crate::logging::log_debug;
use crate::providers::{ChatRequest, ChatResponse};
use async_trait::async_trait;
use futures_util::StreamExt;

/// OpenAI-compatible one-shot backend.
#[derive(Debug)]
pub struct OneShotProvider {
    settings: ProviderSettings,
    http: reqwest::Client,
}

impl OneShotProvider {
    pub fn new(settings: ProviderSettings, http: reqwest::Client) -> Self {
        Self { settings, http }
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/chat/completions", self.settings.base_url)
    }
}

#[async_trait]
impl ProviderBackend for OneShotProvider {
    fn id(&self) -> &str {
        &self.settings.id
    }

    fn variant(&self) -> ProviderVariant {
        ProviderVariant::OneShot
    }

    async fn complete(&self, request: &ChatRequest) -> AppResult<ChatResponse> {
        let wire = WireRequest::from_chat(&self.settings, request);

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

        let body: WireResponse = response.json().await.map_err(|e| {
            AppError::upstream_error(
                &self.settings.id,
                format!("malformed response body: {e}"),
                false,
                Some(Box::new(e)),
            )
        })?;

        let content = body
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| {
                AppError::upstream_error(
                    &self.settings.id,
                    "response carried no completion content",
                    false,
                    None,
                )
            })?;

        let usage: crate::providers::TokenUsage = body.usage.map(Into::into).unwrap_or_default();

        log_debug!(
            provider = %self.settings.id,
            content_length = content.len(),
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "One-shot completion received"
        );

        Ok(ChatResponse {
            content,
            usage,
            model: body.model.unwrap_or_else(|| self.settings.model.clone()),
        })
    }

    async fn open_stream(&self, request: &ChatRequest) -> AppResult<ChunkStream> {
        // No streaming transport; adapt the full response into a
        // two-chunk stream so callers see one shape.
        let response = self.complete(request).await?;
        let chunks = vec![Chunk::Delta(response.content), Chunk::Done(response.usage)];
        Ok(futures_util::stream::iter(chunks).boxed())
    }
}
