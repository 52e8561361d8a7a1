//! WireMock-based telemetry service mocking infrastructure
//!
//! Simulates the upstream history endpoint so ingestion tests run against
//! realistic JSON documents without a live service.

use serde_json::{json, Value};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

/// History endpoint path matching the default configuration
pub const HISTORY_PATH: &str = "/api/v1/thermostat/history";

/// Mock telemetry service for testing
pub struct MockTelemetryServer {
    pub server: MockServer,
    pub base_url: String,
}

impl MockTelemetryServer {
    /// Create a mock server with no mounted endpoints
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let base_url = server.uri();
        Self { server, base_url }
    }

    /// Get the mock server's base URL
    pub fn url(&self) -> &str {
        &self.base_url
    }

    /// Serve one raw JSON body for every history request
    pub async fn mock_history_body(&self, body: impl Into<String>) {
        Mock::given(method("POST"))
            .and(path(HISTORY_PATH))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body.into(), "application/json"))
            .mount(&self.server)
            .await;
    }

    /// Serve an error status with a plain text body
    pub async fn mock_error_response(&self, status: u16, message: &str) {
        Mock::given(method("POST"))
            .and(path(HISTORY_PATH))
            .respond_with(ResponseTemplate::new(status).set_body_string(message.to_owned()))
            .mount(&self.server)
            .await;
    }

    /// Mount a custom mock
    pub async fn add_mock(&self, mock: Mock) {
        mock.mount(&self.server).await;
    }
}

/// Build a complete service document around history blocks.
///
/// The status message lands after the history array, matching where the
/// live service puts it.
pub fn history_document(blocks: &[Value], message: &str) -> String {
    json!({
        "code": 200,
        "result": [{
            "ThermostatHistory": blocks,
            "message": message,
        }],
    })
    .to_string()
}

/// One device block with an hourly sample for each entry of `hours`
pub fn device_block(serial: &str, name: &str, date: &str, hours: &[u32]) -> Value {
    let samples: Vec<Value> = hours
        .iter()
        .map(|hour| {
            json!({
                "timestamp": format!("{date}T{hour:02}:00:00"),
                "runStatus": "Cool",
                "temperature": 70.0 + *hour as f64 / 10.0,
                "coolSetting": 74.0,
                "heatSetting": 68.0,
            })
        })
        .collect();
    json!({
        "serialNo": serial,
        "deviceName": name,
        "groupName": "Floor 1",
        "History": samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_creation() {
        let mock_server = MockTelemetryServer::start().await;
        assert!(!mock_server.url().is_empty());
    }

    #[test]
    fn test_document_places_message_after_history() {
        let body = history_document(&[device_block("A1", "Lobby", "2025-08-30", &[0])], "done");
        let array_at = body.find("ThermostatHistory").unwrap();
        let message_at = body.find("\"message\"").unwrap();
        assert!(message_at > array_at);
    }
}
