use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, error};

use crate::engine::error::CaseError;
use crate::engine::types::RawCase;
use crate::query::SearchRequest;
use crate::store::{CaseStore, EventSubmitter, SearchPage, SubmitTarget, SystemCredentials};

const SERVICE_AUTH_HEADER: &str = "ServiceAuthorization";

/// Client for a remote case-record API.
pub struct HttpCaseStore {
    client: reqwest::Client,
    base_url: String,
    case_type: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    cases: Vec<Value>,
}

#[derive(Deserialize)]
struct StartEventResponse {
    token: String,
    case_details: RawCase,
}

impl HttpCaseStore {
    pub fn new(base_url: &str, case_type: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            case_type: case_type.to_string(),
        })
    }

    fn authorized(&self, request: RequestBuilder, creds: &SystemCredentials) -> RequestBuilder {
        request
            .bearer_auth(&creds.user_token)
            .header(SERVICE_AUTH_HEADER, &creds.service_token)
    }

    fn lease_url(&self, task: &str) -> String {
        format!("{}/leases/{}", self.base_url, task)
    }

    async fn start_event(
        &self,
        creds: &SystemCredentials,
        case_id: i64,
        event_id: &str,
    ) -> Result<StartEventResponse, CaseError> {
        let url = format!(
            "{}/cases/{}/event-triggers/{}",
            self.base_url, case_id, event_id
        );
        let response = self
            .authorized(self.client.get(&url), creds)
            .send()
            .await
            .map_err(|e| CaseError::submit(case_id, event_id, format!("start event failed: {}", e)))?;

        let response = reject_failure(response)
            .await
            .map_err(|reason| CaseError::submit(case_id, event_id, reason))?;

        response
            .json::<StartEventResponse>()
            .await
            .map_err(|e| CaseError::deserialization(case_id, format!("start event response: {}", e)))
    }
}

/// Turn a non-success response into a readable reason.
async fn reject_failure(response: Response) -> Result<Response, String> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
        .unwrap_or(body);
    Err(format!("HTTP {}: {}", status, message))
}

#[async_trait]
impl CaseStore for HttpCaseStore {
    async fn acquire_lease(&self, creds: &SystemCredentials, task: &str) -> Result<(), CaseError> {
        let response = self
            .authorized(self.client.post(self.lease_url(task)), creds)
            .send()
            .await
            .map_err(|e| CaseError::Search(format!("lease request failed: {}", e)))?;

        if response.status() == StatusCode::CONFLICT {
            return Err(CaseError::Conflict(format!("task '{}' is already running", task)));
        }
        reject_failure(response).await.map_err(CaseError::Search)?;
        Ok(())
    }

    async fn release_lease(&self, creds: &SystemCredentials, task: &str) -> Result<(), CaseError> {
        let response = self
            .authorized(self.client.delete(self.lease_url(task)), creds)
            .send()
            .await
            .map_err(|e| CaseError::Search(format!("lease release failed: {}", e)))?;
        reject_failure(response).await.map_err(CaseError::Search)?;
        Ok(())
    }

    async fn search(
        &self,
        creds: &SystemCredentials,
        request: &SearchRequest,
    ) -> Result<SearchPage, CaseError> {
        let url = format!("{}/searchCases?ctid={}", self.base_url, self.case_type);
        let response = self
            .authorized(self.client.post(&url), creds)
            .json(request)
            .send()
            .await
            .map_err(|e| CaseError::Search(format!("search request failed: {}", e)))?;

        if response.status() == StatusCode::CONFLICT {
            return Err(CaseError::Conflict("search rejected with HTTP 409".to_string()));
        }
        let response = reject_failure(response).await.map_err(CaseError::Search)?;

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| CaseError::Search(format!("malformed search response: {}", e)))?;

        debug!(
            total = body.total.unwrap_or_default(),
            page = body.cases.len(),
            "Fetched search page"
        );

        let has_more = !body.cases.is_empty();
        let mut page = SearchPage {
            total: body.total,
            has_more,
            ..SearchPage::default()
        };
        for record in body.cases {
            match decode_case(record) {
                Ok(case) => page.cases.push(case),
                Err(Some(e)) => page.rejected.push(e),
                Err(None) => {}
            }
        }
        Ok(page)
    }

    async fn fetch(&self, creds: &SystemCredentials, case_id: i64) -> Result<RawCase, CaseError> {
        let url = format!("{}/cases/{}", self.base_url, case_id);
        let response = self
            .authorized(self.client.get(&url), creds)
            .send()
            .await
            .map_err(|e| CaseError::Search(format!("fetch of case {} failed: {}", case_id, e)))?;
        let response = reject_failure(response).await.map_err(CaseError::Search)?;

        response
            .json()
            .await
            .map_err(|e| CaseError::deserialization(case_id, e.to_string()))
    }
}

#[async_trait]
impl EventSubmitter for HttpCaseStore {
    async fn submit(
        &self,
        creds: &SystemCredentials,
        target: SubmitTarget<'_>,
        event_id: &str,
    ) -> Result<RawCase, CaseError> {
        let case_id = target.case_id();
        let started = self.start_event(creds, case_id, event_id).await?;

        let data = match target {
            SubmitTarget::CaseId(_) => started.case_details.data,
            SubmitTarget::Snapshot(snapshot) => {
                if snapshot.version.is_some() && snapshot.version != started.case_details.version {
                    return Err(CaseError::submit(
                        case_id,
                        event_id,
                        format!(
                            "case was modified since it was read (snapshot version {:?}, current {:?})",
                            snapshot.version, started.case_details.version
                        ),
                    ));
                }
                serde_json::Value::Object(snapshot.data.clone())
            }
        };

        let body = json!({
            "event": { "id": event_id },
            "event_token": started.token,
            "data": data,
            "ignore_warning": true,
        });

        let url = format!("{}/cases/{}/events", self.base_url, case_id);
        let response = self
            .authorized(self.client.post(&url), creds)
            .json(&body)
            .send()
            .await
            .map_err(|e| CaseError::submit(case_id, event_id, format!("submit failed: {}", e)))?;
        let response = reject_failure(response)
            .await
            .map_err(|reason| CaseError::submit(case_id, event_id, reason))?;

        response
            .json()
            .await
            .map_err(|e| CaseError::deserialization(case_id, format!("submit response: {}", e)))
    }
}

/// Decode one search record. A record without a usable id cannot be reported
/// against a case, so it is logged and dropped.
fn decode_case(record: Value) -> Result<RawCase, Option<CaseError>> {
    let id = record.get("id").and_then(Value::as_i64);
    serde_json::from_value::<RawCase>(record).map_err(|e| match id {
        Some(case_id) => Some(CaseError::deserialization(case_id, e.to_string())),
        None => {
            error!(error = %e, "Dropping search record without a case id");
            None
        }
    })
}
