use std::time::Duration;

use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use skiff_domain::TargetDocument;
use tracing::debug;

use crate::error::CloudError;

/// Deadline for the target-state poll.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);
/// Deadline for state reports, registration and log upload.
pub const REPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub uuid: String,
    pub device_name: String,
    pub device_type: String,
    pub device_api_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttTopics {
    pub publish: String,
    pub subscribe: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttCredentials {
    pub username: String,
    pub password: String,
    pub broker: String,
    pub topics: Option<MqttTopics>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub id: i64,
    pub uuid: String,
    pub mqtt: Option<MqttCredentials>,
    pub created_at: Option<String>,
}

/// Result of a conditional target-state fetch.
#[derive(Debug)]
pub enum TargetFetch {
    NotModified,
    Modified {
        document: TargetDocument,
        etag: Option<String>,
    },
}

/// Typed HTTP client for the cloud service. All calls carry a request-scoped
/// deadline and a Bearer token; retry policy belongs to the callers.
#[derive(Clone)]
pub struct CloudClient {
    http: reqwest::Client,
    base: String,
}

impl CloudClient {
    pub fn new(api_endpoint: &str) -> Result<Self, CloudError> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base: format!("{}/api/v1", api_endpoint.trim_end_matches('/')),
        })
    }

    pub async fn register(
        &self,
        provisioning_key: &str,
        request: &RegisterRequest,
    ) -> Result<RegisterResponse, CloudError> {
        let response = self
            .http
            .post(format!("{}/device/register", self.base))
            .bearer_auth(provisioning_key)
            .timeout(REPORT_TIMEOUT)
            .json(request)
            .send()
            .await?;
        let response = check(response).await?;
        Ok(response.json().await?)
    }

    pub async fn key_exchange(
        &self,
        device_key: &str,
        uuid: &str,
    ) -> Result<(), CloudError> {
        let response = self
            .http
            .post(format!("{}/device/{}/key-exchange", self.base, uuid))
            .bearer_auth(device_key)
            .timeout(REPORT_TIMEOUT)
            .json(&serde_json::json!({ "uuid": uuid, "device_api_key": device_key }))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Conditional GET of the device's target document.
    pub async fn fetch_target(
        &self,
        device_key: &str,
        uuid: &str,
        etag: Option<&str>,
    ) -> Result<TargetFetch, CloudError> {
        let mut request = self
            .http
            .get(format!("{}/device/{}/state", self.base, uuid))
            .bearer_auth(device_key)
            .timeout(POLL_TIMEOUT);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            debug!("target state unchanged (304)");
            return Ok(TargetFetch::NotModified);
        }
        let response = check(response).await?;
        let new_etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        // Body shape: { "<uuid>": { apps, config } }
        let mut body: std::collections::HashMap<String, TargetDocument> =
            response.json().await?;
        let document = body.remove(uuid).unwrap_or_default();
        Ok(TargetFetch::Modified { document, etag: new_etag })
    }

    /// PATCH the current-state report. `report` is the full body
    /// `{ "<uuid>": { apps, cpu_usage, …, is_online: true } }`.
    pub async fn report_state(
        &self,
        device_key: &str,
        report: &serde_json::Value,
    ) -> Result<(), CloudError> {
        let response = self
            .http
            .patch(format!("{}/device/state", self.base))
            .bearer_auth(device_key)
            .timeout(REPORT_TIMEOUT)
            .json(report)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Upload NDJSON log lines. Format beyond line-delimited JSON is the
    /// transport's concern.
    pub async fn upload_logs(
        &self,
        device_key: &str,
        uuid: &str,
        ndjson: String,
    ) -> Result<(), CloudError> {
        let response = self
            .http
            .post(format!("{}/device/{}/logs", self.base, uuid))
            .bearer_auth(device_key)
            .timeout(REPORT_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(ndjson)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, CloudError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(CloudError::Unauthorized);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CloudError::Status { status: status.as_u16(), body })
}
