//! HTTP provider.
//!
//! Sends a request to a configured URL and captures the response as the
//! output value. `429` maps to a rate-limit error and `5xx` to
//! temporary unavailability, both retry-eligible; other non-success
//! statuses fail terminally.

use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::Method;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::provider::{ExecContext, Provider, ProviderOutput};
use crate::types::PrInfo;

/// Provider for `http` checks.
pub struct HttpProvider {
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider").finish_non_exhaustive()
    }
}

impl Default for HttpProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpProvider {
    /// Create a provider with a fresh client.
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Create a provider sharing an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &'static str {
        "http"
    }

    fn description(&self) -> &'static str {
        "HTTP call with JSON-aware response capture"
    }

    fn validate_config(&self, config: &Value) -> bool {
        config
            .get("url")
            .and_then(Value::as_str)
            .is_some_and(|url| !url.trim().is_empty())
    }

    async fn execute(
        &self,
        _pr: &PrInfo,
        config: &Value,
        dependency_results: &IndexMap<String, Value>,
        ctx: &ExecContext,
    ) -> EngineResult<ProviderOutput> {
        let url = config
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::ProviderConfig {
                check_id: ctx.check_id.clone(),
                reason: "http check requires a `url`".to_string(),
            })?;

        let method = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("POST");
        let method =
            Method::from_bytes(method.to_ascii_uppercase().as_bytes()).map_err(|_| {
                EngineError::ProviderConfig {
                    check_id: ctx.check_id.clone(),
                    reason: format!("invalid http method: {method}"),
                }
            })?;

        let mut request = self.client.request(method, url);

        if let Some(Value::Object(headers)) = config.get("headers") {
            for (name, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(name.as_str(), value);
                }
            }
        }

        // Explicit body wins; otherwise the visible dependency outputs
        // are the payload, so chains of checks compose naturally.
        let body = match config.get("body") {
            Some(body) => Some(body.clone()),
            None if dependency_results.is_empty() => None,
            None => Some(
                serde_json::to_value(dependency_results)
                    .unwrap_or(Value::Null),
            ),
        };
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = tokio::select! {
            response = request.send() => response?,
            () = ctx.cancel.cancelled() => {
                return Err(EngineError::Shutdown {
                    reason: format!("http call for check `{}` cancelled", ctx.check_id),
                });
            }
        };

        let status = response.status();
        let text = response.text().await?;

        if status.as_u16() == 429 {
            return Err(EngineError::RateLimited {
                message: format!("{url} returned 429"),
            });
        }
        if status.is_server_error() {
            return Err(EngineError::TemporaryUnavailable {
                message: format!("{url} returned {status}"),
            });
        }
        if !status.is_success() {
            return Err(EngineError::ProviderFailed {
                check_id: ctx.check_id.clone(),
                reason: format!("{url} returned {status}"),
            });
        }

        let value = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(ProviderOutput::value(value))
    }
}
