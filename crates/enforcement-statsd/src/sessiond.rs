//! HTTP/JSON client for the upstream session manager.

use crate::collaborators::{SessionStateReporter, UsageReporter};
use crate::error::{EnforcementStatsError, Result};
use crate::tables::constants::SESSIOND_RPC_TIMEOUT;
use crate::types::{NgSessionState, UsageRecordTable};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, instrument};

const REPORT_RULE_STATS_PATH: &str = "report_rule_stats";
const SESSION_STATE_PATH: &str = "set_session_state";

pub struct HttpSessiondClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSessiondClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(SESSIOND_RPC_TIMEOUT)
            .build()
            .map_err(|e| EnforcementStatsError::config("sessiond.url", e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<()> {
        let url = self.endpoint(path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| EnforcementStatsError::upstream(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| EnforcementStatsError::upstream(e.to_string()))?;
        debug!(url, "Upstream accepted report");
        Ok(())
    }
}

#[async_trait]
impl UsageReporter for HttpSessiondClient {
    #[instrument(skip(self, table), fields(records = table.len()))]
    async fn report_rule_stats(&self, table: UsageRecordTable) -> Result<()> {
        self.post(REPORT_RULE_STATS_PATH, &table).await
    }
}

#[async_trait]
impl SessionStateReporter for HttpSessiondClient {
    #[instrument(skip(self, sessions), fields(sessions = sessions.len()))]
    async fn report_session_state(&self, sessions: HashMap<u32, NgSessionState>) -> Result<()> {
        self.post(SESSION_STATE_PATH, &sessions).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_path() {
        let client = HttpSessiondClient::new("http://127.0.0.1:50065/").unwrap();
        assert_eq!(
            client.endpoint(REPORT_RULE_STATS_PATH),
            "http://127.0.0.1:50065/report_rule_stats"
        );
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_rejection() {
        // port 9 (discard) is closed on test hosts
        let client = HttpSessiondClient::new("http://127.0.0.1:9").unwrap();
        let err = client
            .report_rule_stats(UsageRecordTable::empty(1, false))
            .await
            .unwrap_err();
        assert!(matches!(err, EnforcementStatsError::UpstreamRejected { .. }));
    }
}
