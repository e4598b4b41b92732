use std::time::Duration;

use axum::body::Bytes;
use futures_util::Stream;
use serde::Serialize;

use super::types::ConfigPayload;
use crate::error::AppError;

/// Longest upstream error body quoted back in an `AppError::Upstream`.
const ERROR_BODY_PREVIEW: usize = 300;

// ============================================================================
// Request body
// ============================================================================

#[derive(Serialize)]
struct RunFlowBody<'a> {
    input_value: &'a str,
    input_type: &'static str,
    output_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<&'a str>,
    tweaks: Tweaks<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Tweaks<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    store_token: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    catalog_token: Option<&'a str>,
}

// ============================================================================
// UpstreamClient
// ============================================================================

/// HTTP client for the hosted conversational flow.
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: url::Url,
}

impl UpstreamClient {
    /// Build a client for `base_url`. The timeouts apply per request; the
    /// request timeout also bounds a streamed body.
    pub fn new(
        base_url: impl Into<String>,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = base_url.into();
        let base_url = url::Url::parse(&base_url)
            .map_err(|e| AppError::Config(format!("Invalid upstream URL '{}': {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Config(format!(
                "Upstream URL '{}' cannot carry a path",
                base_url
            )));
        }

        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// `{base}/api/v1/run/{flowId}?stream={stream}`
    fn run_url(&self, flow_id: &str, stream: bool) -> url::Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["api", "v1", "run", flow_id]);
        }
        url.query_pairs_mut()
            .append_pair("stream", if stream { "true" } else { "false" });
        url
    }

    // --------------------------------------------------------------------
    // Private HTTP helpers
    // --------------------------------------------------------------------

    /// Build the authenticated `run` request for one message.
    fn run_request(
        &self,
        config: &ConfigPayload,
        message: &str,
        stream: bool,
    ) -> reqwest::RequestBuilder {
        let url = self.run_url(&config.flow_id, stream);
        let body = RunFlowBody {
            input_value: message,
            input_type: "chat",
            output_type: "chat",
            session_id: config.session_id.as_deref(),
            tweaks: Tweaks {
                store_token: config.store_token.as_deref(),
                catalog_token: config.catalog_token.as_deref(),
            },
        };

        self.http
            .post(url)
            .bearer_auth(&config.api_key)
            .header("X-Account-Id", &config.account_id)
            .header("X-Project-Id", &config.project_id)
            .json(&body)
    }

    /// Send a request and fail with the status and a body preview unless it
    /// succeeded.
    async fn send_checked(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, AppError> {
        let response = req.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
        Err(AppError::Upstream(format!(
            "flow returned {}: {}",
            status,
            preview.trim()
        )))
    }

    // --------------------------------------------------------------------
    // Flow runs
    // --------------------------------------------------------------------

    /// `POST /api/v1/run/{flowId}?stream=false` -- one complete reply document.
    pub async fn run(
        &self,
        config: &ConfigPayload,
        message: &str,
    ) -> Result<serde_json::Value, AppError> {
        let response = self
            .send_checked(self.run_request(config, message, false))
            .await?;
        response
            .json()
            .await
            .map_err(|e| AppError::Upstream(format!("malformed flow response: {}", e)))
    }

    /// `POST /api/v1/run/{flowId}?stream=true` -- the raw event byte stream.
    pub async fn run_stream(
        &self,
        config: &ConfigPayload,
        message: &str,
    ) -> Result<impl Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin, AppError> {
        let response = self
            .send_checked(self.run_request(config, message, true))
            .await?;
        tracing::debug!(flow_id = %config.flow_id, "Upstream stream opened");
        Ok(Box::pin(response.bytes_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConfigPayload {
        ConfigPayload {
            api_key: "key-1".into(),
            account_id: "acct".into(),
            project_id: "proj".into(),
            flow_id: "flow 1".into(),
            session_id: Some("sess".into()),
            store_token: Some("store".into()),
            catalog_token: None,
        }
    }

    #[test]
    fn test_run_request_shape() {
        let client = UpstreamClient::new(
            "https://flows.example.com/",
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .unwrap();
        let req = client.run_request(&config(), "hi", true).build().unwrap();

        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(
            req.url().as_str(),
            "https://flows.example.com/api/v1/run/flow%201?stream=true"
        );
        assert_eq!(req.headers()["authorization"], "Bearer key-1");
        assert_eq!(req.headers()["x-account-id"], "acct");
        assert_eq!(req.headers()["x-project-id"], "proj");

        let body: serde_json::Value =
            serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["input_value"], "hi");
        assert_eq!(body["input_type"], "chat");
        assert_eq!(body["session_id"], "sess");
        assert_eq!(body["tweaks"], serde_json::json!({"storeToken": "store"}));
    }

    #[test]
    fn test_base_path_is_kept_and_bad_urls_rejected() {
        let client = UpstreamClient::new(
            "http://127.0.0.1:9000/flows",
            Duration::from_secs(5),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(
            client.run_url("abc", false).as_str(),
            "http://127.0.0.1:9000/flows/api/v1/run/abc?stream=false"
        );

        let err = UpstreamClient::new("not a url", Duration::from_secs(1), Duration::from_secs(1));
        assert!(matches!(err, Err(AppError::Config(_))));
    }
}
