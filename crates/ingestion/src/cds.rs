//! Client for the reanalysis archive API (Copernicus Climate Data Store).
//!
//! One retrieve call submits a request, polls the task queue and
//! downloads the resulting multi-message GRIB payload. Availability is a
//! first-class outcome, not an error: a date the archive has not
//! published yet comes back as [`RetrieveOutcome::NotAvailable`] so the
//! caller can truncate its range instead of aborting.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::fetch::Deadline;

/// One product request against the archive.
#[derive(Debug, Clone)]
pub struct CdsRequest {
    pub dataset: String,
    /// `analysis` or `forecast`.
    pub product_type: &'static str,
    /// API query names, in the order messages should map back to
    /// variables.
    pub variables: Vec<String>,
    pub date: NaiveDate,
    /// Times of day, `HH:MM`.
    pub times: Vec<String>,
    /// Lead hours for forecast products; empty for analysis.
    pub leadtime_hours: Vec<u32>,
}

impl CdsRequest {
    /// The archive's analysis cycle: every three hours.
    pub fn analysis_times() -> Vec<String> {
        (0..24).step_by(3).map(|h| format!("{h:02}:00")).collect()
    }
}

/// Structured status of one retrieve call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveOutcome {
    /// Payload written to the destination path.
    Completed,
    /// The archive has not published the requested date yet.
    NotAvailable,
}

/// The invocation seam the fetcher depends on.
#[async_trait]
pub trait ReanalysisApi: Send + Sync {
    async fn retrieve(&self, request: &CdsRequest, dest: &Path) -> Result<RetrieveOutcome>;
}

#[derive(Debug, Deserialize)]
struct TaskReply {
    state: String,
    request_id: Option<String>,
    location: Option<String>,
    error: Option<TaskError>,
}

#[derive(Debug, Deserialize)]
struct TaskError {
    message: Option<String>,
    reason: Option<String>,
}

impl TaskReply {
    fn error_text(&self) -> String {
        let e = match &self.error {
            Some(e) => e,
            None => return String::from("no error detail"),
        };
        match (&e.message, &e.reason) {
            (Some(m), Some(r)) => format!("{m}: {r}"),
            (Some(m), None) => m.clone(),
            (None, Some(r)) => r.clone(),
            (None, None) => String::from("no error detail"),
        }
    }
}

/// reqwest-backed CDS client.
pub struct CdsClient {
    client: reqwest::Client,
    base_url: String,
    /// `UID:KEY` pair as issued by the archive.
    key: String,
    poll_interval: Duration,
    deadline: Deadline,
}

impl CdsClient {
    pub const DEFAULT_URL: &'static str = "https://cds.climate.copernicus.eu/api/v2";

    pub fn new(key: String, deadline: Deadline) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(3600))
                .build()?,
            base_url: Self::DEFAULT_URL.to_string(),
            key,
            poll_interval: Duration::from_secs(20),
            deadline,
        })
    }

    fn auth(&self) -> (String, Option<String>) {
        match self.key.split_once(':') {
            Some((uid, key)) => (uid.to_string(), Some(key.to_string())),
            None => (self.key.clone(), None),
        }
    }

    /// The archive reports an unpublished or out-of-range date as a
    /// failed task with one of two request-validation messages.
    fn is_not_available(text: &str) -> bool {
        text.contains("Please, check that your date selection is valid")
            || text.contains("the request you have submitted is not valid")
    }

    async fn submit(&self, request: &CdsRequest) -> Result<TaskReply> {
        let mut body = json!({
            "product_type": request.product_type,
            "format": "grib",
            "variable": request.variables,
            "level_type": "surface_or_atmosphere",
            "data_type": "reanalysis",
            "year": request.date.format("%Y").to_string(),
            "month": request.date.format("%m").to_string(),
            "day": request.date.format("%d").to_string(),
            "time": request.times,
        });
        if !request.leadtime_hours.is_empty() {
            body["leadtime_hour"] = json!(request
                .leadtime_hours
                .iter()
                .map(|h| h.to_string())
                .collect::<Vec<_>>());
        }

        let (user, password) = self.auth();
        let reply = self
            .client
            .post(format!("{}/resources/{}", self.base_url, request.dataset))
            .basic_auth(user, password)
            .json(&body)
            .send()
            .await?
            .json::<TaskReply>()
            .await?;
        Ok(reply)
    }

    async fn poll(&self, request_id: &str) -> Result<TaskReply> {
        let (user, password) = self.auth();
        let reply = self
            .client
            .get(format!("{}/tasks/{}", self.base_url, request_id))
            .basic_auth(user, password)
            .send()
            .await?
            .json::<TaskReply>()
            .await?;
        Ok(reply)
    }

    async fn download(&self, location: &str, dest: &Path) -> Result<()> {
        let url = if location.starts_with("http") {
            location.to_string()
        } else {
            format!("{}/{}", self.base_url, location.trim_start_matches('/'))
        };
        let (user, password) = self.auth();
        let response = self
            .client
            .get(&url)
            .basic_auth(user, password)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(IngestError::Upstream {
                status: response.status().as_u16(),
                url,
            });
        }
        let body = response.bytes().await?;
        tokio::fs::write(dest, &body).await?;
        debug!(dest = %dest.display(), bytes = body.len(), "Downloaded payload");
        Ok(())
    }
}

#[async_trait]
impl ReanalysisApi for CdsClient {
    async fn retrieve(&self, request: &CdsRequest, dest: &Path) -> Result<RetrieveOutcome> {
        info!(
            dataset = %request.dataset,
            product = request.product_type,
            date = %request.date,
            "Submitting archive request"
        );
        let mut reply = self.submit(request).await?;

        loop {
            match reply.state.as_str() {
                "completed" => {
                    let location = reply
                        .location
                        .ok_or_else(|| IngestError::Api("completed task without location".into()))?;
                    self.download(&location, dest).await?;
                    return Ok(RetrieveOutcome::Completed);
                }
                "failed" => {
                    let text = reply.error_text();
                    if Self::is_not_available(&text) {
                        return Ok(RetrieveOutcome::NotAvailable);
                    }
                    return Err(IngestError::Api(text));
                }
                "queued" | "running" => {
                    if self.deadline.is_exhausted() {
                        return Err(IngestError::DeadlineExceeded {
                            hours: self.deadline.hours_budget(),
                            url: format!("{}/resources/{}", self.base_url, request.dataset),
                        });
                    }
                    let request_id = reply
                        .request_id
                        .clone()
                        .ok_or_else(|| IngestError::Api("queued task without request id".into()))?;
                    tokio::time::sleep(self.poll_interval).await;
                    reply = self.poll(&request_id).await?;
                }
                other => {
                    return Err(IngestError::Api(format!("unexpected task state '{other}'")));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_times_cover_the_three_hourly_cycle() {
        let times = CdsRequest::analysis_times();
        assert_eq!(times.len(), 8);
        assert_eq!(times[0], "00:00");
        assert_eq!(times[7], "21:00");
    }

    #[test]
    fn availability_is_detected_from_validation_messages() {
        assert!(CdsClient::is_not_available(
            "Exception: Please, check that your date selection is valid"
        ));
        assert!(CdsClient::is_not_available(
            "the request you have submitted is not valid"
        ));
        assert!(!CdsClient::is_not_available("quota exceeded"));
    }

    #[test]
    fn task_error_text_joins_message_and_reason() {
        let reply = TaskReply {
            state: "failed".into(),
            request_id: None,
            location: None,
            error: Some(TaskError {
                message: Some("bad request".into()),
                reason: Some("date out of range".into()),
            }),
        };
        assert_eq!(reply.error_text(), "bad request: date out of range");
    }
}
