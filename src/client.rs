//! HTTP client for the upstream telemetry service
//!
//! Wraps a `reqwest` client with basic authentication and returns raw
//! streaming responses so callers can consume large history payloads
//! chunk by chunk.

use crate::config::directory::Credentials;
use crate::config::UpstreamConfig;
use crate::error::{HistoryError, Result};
use crate::model::HistorySelection;
use base64::Engine;
use reqwest::{Client, ClientBuilder};
use tracing::{debug, warn};
use url::Url;

/// HTTP client bound to one site's credentials
pub struct TelemetryClient {
    /// HTTP client instance
    client: Client,

    /// Fully resolved history endpoint
    endpoint: Url,

    /// Site this client authenticates as
    site: String,
}

impl TelemetryClient {
    /// Create a new client for the given site
    pub fn new(config: &UpstreamConfig, credentials: &Credentials) -> Result<Self> {
        let mut client_builder = ClientBuilder::new()
            .timeout(config.request_timeout)
            .user_agent(format!("thermo-history/{}", env!("CARGO_PKG_VERSION")));

        if !config.verify_ssl {
            warn!("SSL verification disabled - this is insecure for production use");
            client_builder = client_builder.danger_accept_invalid_certs(true);
        }

        // Basic authentication via default header
        let auth_header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!(
                "{username}:{password}",
                username = credentials.username,
                password = credentials.password
            ))
        );
        let mut default_headers = reqwest::header::HeaderMap::new();
        let header_value = reqwest::header::HeaderValue::from_str(&auth_header).map_err(|e| {
            HistoryError::invalid_input(format!("Invalid authorization header: {e}"))
        })?;
        default_headers.insert(reqwest::header::AUTHORIZATION, header_value);
        client_builder = client_builder.default_headers(default_headers);

        let client = client_builder
            .build()
            .map_err(|e| HistoryError::connection(format!("Failed to build HTTP client: {e}")))?;

        let endpoint = config
            .base_url
            .join(&config.history_path)
            .map_err(|e| HistoryError::connection(format!("Invalid history endpoint: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            site: credentials.site.clone(),
        })
    }

    /// History endpoint this client posts to
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Post a history selection and return the streaming response.
    ///
    /// Non-success statuses are drained for their body and surfaced as
    /// transport errors; the error constructor truncates oversized bodies.
    pub async fn fetch_history(&self, selection: &HistorySelection) -> Result<reqwest::Response> {
        debug!(
            "fetching history for site {} from {} to {}",
            self.site, selection.start_date_time, selection.end_date_time
        );

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(selection)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HistoryError::transport(status.as_u16(), &body));
        }

        debug!("history request for site {} accepted: {status}", self.site);
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_credentials() -> Credentials {
        Credentials {
            site: "site-1".to_string(),
            username: "ops".to_string(),
            password: "s3cret".to_string(),
        }
    }

    #[test]
    fn test_endpoint_joins_base_and_path() {
        let config = UpstreamConfig {
            base_url: "http://10.0.0.5:8080".parse().unwrap(),
            ..UpstreamConfig::default()
        };
        let client = TelemetryClient::new(&config, &test_credentials()).unwrap();
        assert_eq!(
            client.endpoint().as_str(),
            "http://10.0.0.5:8080/api/v1/thermostat/history"
        );
    }

    #[test]
    fn test_awkward_secrets_become_header_safe() {
        // encoding keeps control characters out of the header value
        let config = UpstreamConfig::default();
        let mut credentials = test_credentials();
        credentials.password = "line\nbreak:with colon".to_string();

        assert!(TelemetryClient::new(&config, &credentials).is_ok());
    }
}
