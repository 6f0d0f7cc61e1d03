use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use loopctl_core::models::{GlucoseUnit, TempTarget};
use loopctl_core::nightscout::{override_closed_event, override_started_event, temp_target_event};
use loopctl_core::service::SyncReporter;

pub struct NightscoutClient {
    client: reqwest::Client,
    rt: tokio::runtime::Handle,
    base_url: String,
    token: Option<String>,
    units: GlucoseUnit,
}

impl NightscoutClient {
    pub fn new(base_url: String, token: Option<String>, units: GlucoseUnit) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(format!(
                "loopctl/{} (therapy override CLI)",
                env!("CARGO_PKG_VERSION")
            ))
            .timeout(std::time::Duration::from_secs(10))
            .connect_timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");
        Self {
            client,
            rt: tokio::runtime::Handle::current(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            units,
        }
    }

    pub async fn post_treatment_async<T: Serialize + Sync>(&self, treatment: &T) -> Result<()> {
        let url = format!("{}/api/v1/treatments", self.base_url);
        let mut req = self.client.post(&url).json(treatment);
        if let Some(token) = &self.token {
            req = req.query(&[("token", token.as_str())]);
        }
        let resp = req.send().await.context("Failed to reach Nightscout")?;
        resp.error_for_status()
            .context("Nightscout rejected the treatment")?;
        Ok(())
    }

    fn post_treatment<T: Serialize + Sync>(&self, treatment: &T) -> Result<()> {
        let result =
            tokio::task::block_in_place(|| self.rt.block_on(self.post_treatment_async(treatment)));
        if let Err(e) = &result {
            eprintln!("Note: Nightscout report failed: {e:#}");
        }
        result
    }
}

impl SyncReporter for NightscoutClient {
    fn report_temp_target(&self, target: &TempTarget) -> Result<()> {
        self.post_treatment(&temp_target_event(target, self.units))
    }

    fn report_override_started(
        &self,
        label: &str,
        duration_min: i64,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        self.post_treatment(&override_started_event(label, duration_min, started_at))
    }

    fn report_override_closed(
        &self,
        label: &str,
        duration_min: i64,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        self.post_treatment(&override_closed_event(label, duration_min, started_at))
    }
}

/// Reporter used when no Nightscout URL is configured. Everything stays
/// local and every report succeeds trivially.
pub struct NoopReporter;

impl SyncReporter for NoopReporter {
    fn report_temp_target(&self, _: &TempTarget) -> Result<()> {
        Ok(())
    }

    fn report_override_started(&self, _: &str, _: i64, _: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    fn report_override_closed(&self, _: &str, _: i64, _: DateTime<Utc>) -> Result<()> {
        Ok(())
    }
}
