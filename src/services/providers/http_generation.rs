/// HTTP generation service client
///
/// Posts the preference summary as JSON and returns the response body
/// untouched. The session fingerprint travels as `Idempotency-Key` so a
/// retried request for the same answers is deduplicated upstream.
use reqwest::Client as HttpClient;
use std::time::Duration;

use crate::{
    error::{AppError, AppResult},
    services::providers::{GenerationRequest, GenerationService},
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Clone)]
pub struct HttpGenerationClient {
    http_client: HttpClient,
    api_url: String,
    api_key: Option<String>,
}

impl HttpGenerationClient {
    pub fn new(api_url: String, api_key: Option<String>, timeout: Duration) -> AppResult<Self> {
        let http_client = HttpClient::builder().timeout(timeout).build()?;

        Ok(Self {
            http_client,
            api_url,
            api_key,
        })
    }
}

#[async_trait::async_trait]
impl GenerationService for HttpGenerationClient {
    #[tracing::instrument(skip_all, fields(domain = %request.domain, count = request.count))]
    async fn generate(&self, request: &GenerationRequest) -> AppResult<String> {
        let mut builder = self
            .http_client
            .post(&self.api_url)
            .header(IDEMPOTENCY_KEY_HEADER, &request.idempotency_key)
            .json(request);

        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key);
        }

        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::UpstreamService(format!(
                "generation service returned status {}: {}",
                status, body
            )));
        }

        let body = response.text().await?;
        tracing::debug!(bytes = body.len(), "Generation response received");
        Ok(body)
    }

    fn name(&self) -> &'static str {
        "generation"
    }
}
