//! Airtable REST client.
//!
//! Records are created with `POST {base_url}/{base_id}/{table}` and a body of
//! the form `{"records": [{"fields": {...}}]}`, authenticated with a bearer
//! token.

use std::fmt;
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use super::{CommitError, CommitReceipt, RecordStore};
use crate::types::{StoreRecords, TableName};

/// Default Airtable API root.
pub const DEFAULT_BASE_URL: &str = "https://api.airtable.com/v0";

/// Connection settings for an Airtable base.
#[derive(Clone)]
pub struct AirtableConfig {
    pub base_url: String,
    pub base_id: String,
    pub token: String,
    /// Bound on the whole request, including reading the response.
    pub timeout: Duration,
}

impl fmt::Debug for AirtableConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AirtableConfig")
            .field("base_url", &self.base_url)
            .field("base_id", &self.base_id)
            .field("token", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct AirtableStore {
    config: AirtableConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CreatedRecords {
    records: Vec<CreatedRecord>,
}

#[derive(Debug, Deserialize)]
struct CreatedRecord {
    id: String,
}

impl AirtableStore {
    pub fn new(config: AirtableConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }

    fn table_url(&self, table: &TableName) -> Result<Url, CommitError> {
        let mut url = Url::parse(self.config.base_url.trim_end_matches('/')).map_err(|e| {
            CommitError::permanent(format!(
                "invalid store base URL {:?}: {e}",
                self.config.base_url
            ))
        })?;
        url.path_segments_mut()
            .map_err(|()| {
                CommitError::permanent(format!(
                    "store base URL {:?} cannot take a path",
                    self.config.base_url
                ))
            })?
            .pop_if_empty()
            .push(&self.config.base_id)
            .push(table.as_str());
        Ok(url)
    }
}

impl RecordStore for AirtableStore {
    async fn commit_record(
        &self,
        table: &TableName,
        records: &StoreRecords,
    ) -> Result<CommitReceipt, CommitError> {
        let url = self.table_url(table)?;
        debug!(%url, records = records.records.len(), "Committing records");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.token)
            .json(records)
            .send()
            .await
            .map_err(CommitError::from_reqwest)?;

        let status = response.status();
        let body = response.bytes().await.map_err(CommitError::from_reqwest)?;

        if !status.is_success() {
            let message = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|value| {
                    value
                        .pointer("/error/message")
                        .or_else(|| value.get("error"))
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| String::from_utf8_lossy(&body).to_string());
            return Err(CommitError::from_status(status, message));
        }

        let created: CreatedRecords = serde_json::from_slice(&body).map_err(|e| {
            CommitError::permanent(format!(
                "store accepted the write but the response was unreadable: {e}"
            ))
        })?;

        Ok(CommitReceipt {
            record_ids: created.records.into_iter().map(|r| r.id).collect(),
        })
    }
}
