use futures::StreamExt;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::config::ChatConfig;
use crate::error::{AppError, Result};
use crate::models::{
    ChatRequest, ModelInfo, ModelList, ProcessStatus, PullProgress, ResponseChunk, RunningModel,
};
use crate::stream::SseDecoder;

// ============================================================================
// Backend API Client
// ============================================================================

/// HTTP client for the inference backend. Owns two `reqwest` clients:
/// management calls get an overall request deadline, streaming exchanges
/// only a connect deadline (a generation may legitimately run for
/// minutes).
pub struct ApiClient {
    http: reqwest::Client,
    streaming: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &ChatConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let streaming = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            streaming,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ------------------------------------------------------------------
    // Model management
    // ------------------------------------------------------------------

    /// List the models the backend has available.
    pub async fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let resp = self.http.get(self.url("/api/tags")).send().await?;
        if !resp.status().is_success() {
            return Err(backend_error(resp).await);
        }
        let list: ModelList = resp.json().await?;
        Ok(list.models)
    }

    /// Models currently loaded into backend memory.
    pub async fn running_models(&self) -> Result<Vec<RunningModel>> {
        let resp = self.http.get(self.url("/api/ps")).send().await?;
        if !resp.status().is_success() {
            return Err(backend_error(resp).await);
        }
        let status: ProcessStatus = resp.json().await?;
        Ok(status.models)
    }

    /// Create a custom model from a Modelfile. Slow for large bases; the
    /// backend answers once the model is registered.
    pub async fn create_model(&self, name: &str, modelfile: &str) -> Result<String> {
        log::info!("creating model '{}' ({} byte Modelfile)", name, modelfile.len());
        let resp = self
            .streaming
            .post(self.url("/api/create"))
            .json(&serde_json::json!({
                "name": name,
                "modelfile": modelfile,
                "stream": false
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(backend_error(resp).await);
        }
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        let status = body
            .get("status")
            .and_then(|s| s.as_str())
            .unwrap_or("success");
        Ok(format!("Model '{}' created: {}", name, status))
    }

    /// Pull a model from the backend's registry, yielding progress events
    /// as they stream in. The returned stream ends when the transport
    /// closes or a transport error surfaces.
    pub async fn pull_model(
        &self,
        name: &str,
    ) -> Result<BoxStream<'static, Result<PullProgress>>> {
        log::info!("pulling model '{}'", name);
        let resp = self
            .streaming
            .post(self.url("/api/pull"))
            .json(&serde_json::json!({ "name": name, "stream": true }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(backend_error(resp).await);
        }

        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::<PullProgress>::new();
            let mut body = Box::pin(resp.bytes_stream());
            while let Some(chunk) = body.next().await {
                match chunk {
                    Ok(bytes) => {
                        for event in decoder.feed(&bytes) {
                            yield Ok(event);
                        }
                    }
                    Err(e) => {
                        yield Err(AppError::transport(format!("pull interrupted: {}", e)));
                        return;
                    }
                }
            }
            if let Some(event) = decoder.finish() {
                yield Ok(event);
            }
        };
        Ok(stream.boxed())
    }

    // ------------------------------------------------------------------
    // Chat / generate
    // ------------------------------------------------------------------

    /// Issue a streaming exchange and hand back the raw response; the
    /// session pumps its byte stream through the decoder. Non-2xx before
    /// any byte streams is a transport-level failure.
    pub async fn send_chat(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let resp = self
            .streaming
            .post(self.url(request.mode.endpoint()))
            .json(request)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(backend_error(resp).await);
        }
        Ok(resp)
    }

    /// Non-streaming exchange: one JSON body carrying the whole response.
    pub async fn complete(&self, request: &ChatRequest) -> Result<String> {
        let resp = self
            .streaming
            .post(self.url(request.mode.endpoint()))
            .json(request)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(backend_error(resp).await);
        }
        let chunk: ResponseChunk = resp.json().await?;
        if let Some(error) = chunk.error {
            return Err(AppError::model(error));
        }
        chunk
            .response
            .ok_or_else(|| AppError::malformed_event("response body carries no response field"))
    }
}

async fn backend_error(resp: reqwest::Response) -> AppError {
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    AppError::backend_status(status, &body)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChatMode;

    fn client_with_base(base_url: &str) -> ApiClient {
        let config = ChatConfig {
            base_url: base_url.to_string(),
            ..ChatConfig::default()
        };
        ApiClient::new(&config).unwrap()
    }

    #[test]
    fn test_url_joining_trims_trailing_slash() {
        let client = client_with_base("http://localhost:11434/");
        assert_eq!(client.url("/api/tags"), "http://localhost:11434/api/tags");
    }

    #[test]
    fn test_mode_routes_to_distinct_endpoints() {
        let client = client_with_base("http://localhost:11434");
        assert_eq!(
            client.url(ChatMode::Chat.endpoint()),
            "http://localhost:11434/api/chat"
        );
        assert_eq!(
            client.url(ChatMode::Generate.endpoint()),
            "http://localhost:11434/api/generate"
        );
    }
}
