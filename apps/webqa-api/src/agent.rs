//! Upstream browser-agent client.
//!
//! The agent is an external service: we hand it the session key and the
//! user's instructions, and it answers with a `text/event-stream` body
//! in the UI message stream protocol. This client only starts the
//! stream; tapping and persistence happen in `webqa_capture`.

use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::CONTENT_TYPE;
use serde_json::json;
use thiserror::Error;
use webqa_protocol::Run;

pub const UI_MESSAGE_STREAM_HEADER: &str = "x-vercel-ai-ui-message-stream";
pub const UI_MESSAGE_STREAM_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("agent produced no event stream (content-type {content_type:?})")]
    MissingStream { content_type: String },
}

#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    endpoint: String,
}

impl AgentClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    /// Kick off one agent execution and hand back its raw byte stream.
    ///
    /// A response without a usable event stream is fatal here, before
    /// any logging wrapping is attempted.
    pub async fn start_stream(
        &self,
        run: &Run,
        prompt: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, reqwest::Error>>, AgentError> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(&json!({
                "sessionKey": run.session_key,
                "runId": run.run_id,
                "prompt": prompt,
            }))
            .send()
            .await?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        if !content_type.starts_with("text/event-stream") {
            return Err(AgentError::MissingStream { content_type });
        }

        Ok(response.bytes_stream().boxed())
    }
}
