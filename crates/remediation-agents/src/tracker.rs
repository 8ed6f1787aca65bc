//! Ticket sources: an HTTP issue tracker and a JSON file.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use orchestration::{Ticket, TicketFilter, TicketSource, TrackerStatus};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::TrackerEndpoint;

/// Status change pushed to a tracker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub tracker_id: String,
    pub status: TrackerStatus,
    pub comment: String,
}

/// Tracker exposing `GET /tickets` and `POST /tickets/{id}/status`.
pub struct HttpTracker {
    endpoint: TrackerEndpoint,
    http: reqwest::Client,
}

impl HttpTracker {
    pub fn new(endpoint: TrackerEndpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build tracker HTTP client")?;
        Ok(Self { endpoint, http })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.endpoint.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl TicketSource for HttpTracker {
    async fn fetch_new_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        let url = format!("{}/tickets", self.endpoint.url);
        // Inclusive bound with no limit: ties at the cursor and the batch
        // limit are resolved by `filter.apply` below.
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(after) = &filter.after {
            query.push(("updated_since", after.revised_at.to_rfc3339()));
        }
        for priority in &filter.priorities {
            query.push(("priority", priority.to_string()));
        }

        let response = self
            .authorize(self.http.get(&url).query(&query))
            .send()
            .await
            .with_context(|| format!("Tracker request failed: GET {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Tracker returned {status} for GET {url}: {body}");
        }

        let tickets: Vec<Ticket> = response
            .json()
            .await
            .context("Failed to parse tracker ticket list")?;
        debug!(count = tickets.len(), "Fetched tickets from tracker");
        // The tracker may ignore query parameters it does not support.
        Ok(filter.apply(tickets))
    }

    async fn update_ticket_status(
        &self,
        tracker_id: &str,
        status: TrackerStatus,
        comment: &str,
    ) -> Result<()> {
        let url = format!("{}/tickets/{tracker_id}/status", self.endpoint.url);
        let body = StatusUpdate {
            tracker_id: tracker_id.to_string(),
            status,
            comment: comment.to_string(),
        };
        let response = self
            .authorize(self.http.post(&url).json(&body))
            .send()
            .await
            .with_context(|| format!("Tracker request failed: POST {url}"))?;
        let code = response.status();
        if !code.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Tracker returned {code} for POST {url}: {text}");
        }
        info!(tracker_id, %status, "Tracker status updated");
        Ok(())
    }
}

/// Tickets read from a JSON array on disk. Status updates are kept in
/// memory and logged.
pub struct FileTicketSource {
    path: PathBuf,
    updates: Mutex<Vec<StatusUpdate>>,
}

impl FileTicketSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every ticket in the file.
    pub fn read_all(&self) -> Result<Vec<Ticket>> {
        read_tickets(&self.path)
    }

    /// Status updates received so far, oldest first.
    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Parse a JSON array of tickets.
pub fn read_tickets(path: &Path) -> Result<Vec<Ticket>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read tickets from {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse tickets in {}", path.display()))
}

#[async_trait]
impl TicketSource for FileTicketSource {
    async fn fetch_new_tickets(&self, filter: &TicketFilter) -> Result<Vec<Ticket>> {
        Ok(filter.apply(self.read_all()?))
    }

    async fn update_ticket_status(
        &self,
        tracker_id: &str,
        status: TrackerStatus,
        comment: &str,
    ) -> Result<()> {
        info!(tracker_id, %status, comment, "Ticket status");
        let update = StatusUpdate {
            tracker_id: tracker_id.to_string(),
            status,
            comment: comment.to_string(),
        };
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(update);
        Ok(())
    }
}
