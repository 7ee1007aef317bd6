use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::{NetworkConfig, StoreConfig};
use crate::models::{AttendanceEvent, CalendarDay, CapacityRule, ForecastRow, MemberHold};
use crate::pipeline::PipelineInputs;
use crate::traits::ForecastStore;

const ON_CONFLICT: &str = "session_date,session_name,session_start";

/// Client for a PostgREST endpoint such as Supabase's `/rest/v1`.
#[derive(Clone, Debug)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: Url,
    forecast_table: String,
    page_size: usize,
}

impl RestStore {
    /// Create a new REST store with configurable timeouts.
    pub fn new(
        base_url: &str,
        api_key: &str,
        forecast_table: String,
        page_size: usize,
        network_config: &NetworkConfig,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let key = HeaderValue::from_str(api_key).context("API key is not a valid header value")?;
        headers.insert("apikey", key);
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .context("API key is not a valid header value")?;
        headers.insert(AUTHORIZATION, bearer);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(network_config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(network_config.connect_timeout_secs))
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .with_context(|| format!("Invalid REST URL: {}", base_url))?;

        Ok(Self {
            client,
            base_url,
            forecast_table,
            page_size: page_size.max(1),
        })
    }

    /// Build a store from the `store` and `network` config sections.
    pub fn from_config(store: &StoreConfig, network: &NetworkConfig) -> Result<Self> {
        let url = store
            .rest_url
            .as_deref()
            .context("store.rest_url (or SUPABASE_URL) is not set")?;
        let key = store
            .rest_key
            .as_deref()
            .context("store.rest_key (or SUPABASE_SERVICE_ROLE_KEY) is not set")?;
        Self::new(
            url,
            key,
            store.forecast_table.clone(),
            store.page_size,
            network,
        )
    }

    fn table_url(&self, table: &str, params: &[(&str, String)]) -> Result<Url> {
        let raw = format!("{}/rest/v1/{}", self.base_url.as_str().trim_end_matches('/'), table);
        Url::parse_with_params(&raw, params).with_context(|| format!("Invalid table URL: {}", raw))
    }

    /// Fetch every row of a table, one page at a time.
    pub async fn fetch_table<T: DeserializeOwned>(&self, table: &str) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        let mut offset = 0usize;

        loop {
            let url = self.table_url(
                table,
                &[
                    ("select", "*".to_string()),
                    ("limit", self.page_size.to_string()),
                    ("offset", offset.to_string()),
                ],
            )?;

            let response = self
                .client
                .get(url)
                .send()
                .await
                .with_context(|| format!("Failed to send request for {}", table))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                anyhow::bail!("REST API returned {} for {}: {}", status, table, body);
            }

            let page: Vec<T> = response
                .json()
                .await
                .with_context(|| format!("Failed to parse rows from {}", table))?;

            let page_len = page.len();
            rows.extend(page);
            debug!("Fetched {} rows from {} at offset {}", page_len, table, offset);

            if page_len < self.page_size {
                break;
            }
            offset += page_len;
        }

        info!("Retrieved {} rows from {}", rows.len(), table);
        Ok(rows)
    }
}

impl ForecastStore for RestStore {
    async fn load_inputs(&self) -> Result<PipelineInputs> {
        let (attendance, calendar, holds, capacity_rules) = tokio::try_join!(
            self.fetch_table::<AttendanceEvent>("member_daily_sessions_attended"),
            self.fetch_table::<CalendarDay>("work_calendar"),
            self.fetch_table::<MemberHold>("member_holds"),
            self.fetch_table::<CapacityRule>("system_config"),
        )?;

        Ok(PipelineInputs {
            attendance,
            calendar,
            holds,
            capacity_rules,
        })
    }

    async fn upsert_forecasts(&self, rows: &[ForecastRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let url = self.table_url(
            &self.forecast_table,
            &[("on_conflict", ON_CONFLICT.to_string())],
        )?;

        let response = self
            .client
            .post(url)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await
            .context("Failed to send forecast upsert")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Forecast upsert returned {}: {}", status, body);
        }

        info!("Upserted {} rows into {}", rows.len(), self.forecast_table);
        Ok(rows.len())
    }
}
