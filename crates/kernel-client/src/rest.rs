//! REST client for the kernel lifecycle API.
//!
//! The kernel connection issues these calls itself for interrupt, restart,
//! and shutdown; kernel start/list and the subshell endpoints are included
//! for callers that manage kernels through the same server.
//!
//! Every endpoint has exactly one expected success status; any other status
//! (including a 200 where 204 was expected) is surfaced as
//! [`RestError::Status`]. A 404 on shutdown or interrupt means the kernel is
//! already gone and resolves successfully.

use log::{debug, info};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::RestError;

/// Connection settings for a kernel server.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// HTTP base URL, no trailing slash (e.g. `http://127.0.0.1:8888`).
    pub base_url: String,
    /// WebSocket base URL, derived from `base_url` unless overridden.
    pub ws_url: String,
    /// Optional API token, sent as `Authorization: token <...>`.
    pub token: Option<String>,
    pub(crate) client: reqwest::Client,
}

impl ServerSettings {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let ws_url = if let Some(rest) = base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            format!("ws://{}", base_url)
        };
        Self {
            base_url,
            ws_url,
            token: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = ws_url.into().trim_end_matches('/').to_string();
        self
    }
}

/// Kernel model returned by the lifecycle API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connections: Option<u64>,
}

#[derive(Serialize)]
struct StartKernelBody<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct SubshellModel {
    subshell_id: String,
}

/// Client for the kernel lifecycle REST endpoints.
#[derive(Debug, Clone)]
pub struct KernelApiClient {
    settings: ServerSettings,
}

impl KernelApiClient {
    pub fn new(settings: ServerSettings) -> Self {
        Self { settings }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/kernels{}", self.settings.base_url, path)
    }

    fn request(&self, method: reqwest::Method, url: String) -> reqwest::RequestBuilder {
        let builder = self.settings.client.request(method, url);
        match &self.settings.token {
            Some(token) => builder.header("Authorization", format!("token {}", token)),
            None => builder,
        }
    }

    /// Check the response against the single expected status.
    async fn expect_status(
        &self,
        response: reqwest::Response,
        expected: StatusCode,
    ) -> Result<reqwest::Response, RestError> {
        let status = response.status();
        if status == expected {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RestError::Status {
            status: status.as_u16(),
            body,
        })
    }

    /// Like `expect_status`, but a 404 resolves successfully: the kernel is
    /// already gone, which is what shutdown and interrupt were after.
    async fn expect_status_or_missing(
        &self,
        response: reqwest::Response,
        expected: StatusCode,
    ) -> Result<(), RestError> {
        if response.status() == StatusCode::NOT_FOUND {
            debug!("[kernel-api] 404 treated as already gone");
            return Ok(());
        }
        self.expect_status(response, expected).await?;
        Ok(())
    }

    async fn json_body<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RestError> {
        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|e| RestError::InvalidPayload(e.to_string()))
    }

    /// Start a new kernel. Expects 201.
    pub async fn start_kernel(&self, name: &str) -> Result<KernelModel, RestError> {
        let response = self
            .request(reqwest::Method::POST, self.url(""))
            .json(&StartKernelBody { name })
            .send()
            .await?;
        let response = self.expect_status(response, StatusCode::CREATED).await?;
        let model: KernelModel = Self::json_body(response).await?;
        info!("[kernel-api] Started kernel {} ({})", model.id, model.name);
        Ok(model)
    }

    /// List running kernels. Expects 200.
    pub async fn list_kernels(&self) -> Result<Vec<KernelModel>, RestError> {
        let response = self.request(reqwest::Method::GET, self.url("")).send().await?;
        let response = self.expect_status(response, StatusCode::OK).await?;
        Self::json_body(response).await
    }

    /// Fetch a single kernel model. Expects 200.
    pub async fn get_kernel(&self, id: &str) -> Result<KernelModel, RestError> {
        let response = self
            .request(reqwest::Method::GET, self.url(&format!("/{}", id)))
            .send()
            .await?;
        let response = self.expect_status(response, StatusCode::OK).await?;
        Self::json_body(response).await
    }

    /// Interrupt a kernel. Expects 204; 404 means already gone.
    pub async fn interrupt(&self, id: &str) -> Result<(), RestError> {
        let response = self
            .request(reqwest::Method::POST, self.url(&format!("/{}/interrupt", id)))
            .send()
            .await?;
        self.expect_status_or_missing(response, StatusCode::NO_CONTENT)
            .await?;
        info!("[kernel-api] Interrupted kernel {}", id);
        Ok(())
    }

    /// Restart a kernel. Expects 200 with the refreshed model.
    pub async fn restart(&self, id: &str) -> Result<KernelModel, RestError> {
        let response = self
            .request(reqwest::Method::POST, self.url(&format!("/{}/restart", id)))
            .send()
            .await?;
        let response = self.expect_status(response, StatusCode::OK).await?;
        let model = Self::json_body(response).await?;
        info!("[kernel-api] Restarted kernel {}", id);
        Ok(model)
    }

    /// Shut down a kernel. Expects 204; 404 means already gone.
    pub async fn shutdown(&self, id: &str) -> Result<(), RestError> {
        let response = self
            .request(reqwest::Method::DELETE, self.url(&format!("/{}", id)))
            .send()
            .await?;
        self.expect_status_or_missing(response, StatusCode::NO_CONTENT)
            .await?;
        info!("[kernel-api] Shut down kernel {}", id);
        Ok(())
    }

    /// List a kernel's subshells. Expects 200.
    pub async fn list_subshells(&self, id: &str) -> Result<Vec<String>, RestError> {
        let response = self
            .request(reqwest::Method::GET, self.url(&format!("/{}/subshells", id)))
            .send()
            .await?;
        let response = self.expect_status(response, StatusCode::OK).await?;
        Self::json_body(response).await
    }

    /// Create a subshell. Expects 201 with `{"subshell_id": ...}`.
    pub async fn create_subshell(&self, id: &str) -> Result<String, RestError> {
        let response = self
            .request(reqwest::Method::POST, self.url(&format!("/{}/subshells", id)))
            .send()
            .await?;
        let response = self.expect_status(response, StatusCode::CREATED).await?;
        let model: SubshellModel = Self::json_body(response).await?;
        Ok(model.subshell_id)
    }

    /// Delete a subshell. Expects 204.
    pub async fn delete_subshell(&self, id: &str, subshell_id: &str) -> Result<(), RestError> {
        let response = self
            .request(
                reqwest::Method::DELETE,
                self.url(&format!("/{}/subshells/{}", id, subshell_id)),
            )
            .send()
            .await?;
        self.expect_status(response, StatusCode::NO_CONTENT).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_derivation() {
        let settings = ServerSettings::new("http://localhost:8888/");
        assert_eq!(settings.base_url, "http://localhost:8888");
        assert_eq!(settings.ws_url, "ws://localhost:8888");

        let tls = ServerSettings::new("https://hub.example.org");
        assert_eq!(tls.ws_url, "wss://hub.example.org");
    }

    #[test]
    fn test_ws_url_override() {
        let settings =
            ServerSettings::new("http://localhost:8888").with_ws_url("ws://proxy:9999/");
        assert_eq!(settings.ws_url, "ws://proxy:9999");
    }

    #[test]
    fn test_kernel_model_parsing() {
        let model: KernelModel = serde_json::from_value(serde_json::json!({
            "id": "k-1",
            "name": "python3",
            "execution_state": "idle",
            "connections": 2
        }))
        .unwrap();
        assert_eq!(model.id, "k-1");
        assert_eq!(model.execution_state.as_deref(), Some("idle"));

        // Minimal model without optional fields
        let minimal: KernelModel =
            serde_json::from_value(serde_json::json!({"id": "k-2", "name": "deno"})).unwrap();
        assert!(minimal.execution_state.is_none());
    }

    #[test]
    fn test_endpoint_urls() {
        let client = KernelApiClient::new(ServerSettings::new("http://localhost:1234"));
        assert_eq!(client.url(""), "http://localhost:1234/api/kernels");
        assert_eq!(
            client.url("/abc/interrupt"),
            "http://localhost:1234/api/kernels/abc/interrupt"
        );
    }
}
