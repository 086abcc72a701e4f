//! Read side of the job/section CRUD API.
//!
//! Runs never persist anything; once a run settles the authoritative state is
//! re-fetched through a [`JobStore`].

use crate::config::ClientConfig;
use crate::errors::{JobtrackError, StoreError};
use crate::model::{JobId, SectionPhase, SectionStatus};

/// Catalogue entry describing one generated section.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SectionDefinition {
    pub key: String,
    pub label: String,
    /// Display order (lower first).
    pub order: i32,
    pub phase: SectionPhase,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Persisted section with its last known status and content.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Section {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub job: String,
    pub section_key: String,
    #[serde(default)]
    pub phase: Option<SectionPhase>,
    #[serde(default)]
    pub status: SectionStatus,
    #[serde(default)]
    pub content_md: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub generation_time_ms: Option<u64>,
}

/// Job record with its embedded persisted sections.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JobDetail {
    pub id: JobId,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub jd_url: Option<String>,
    #[serde(default)]
    pub pipeline_stage: String,
    #[serde(default)]
    pub extraction_status: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub hours: Option<f64>,
    #[serde(default)]
    pub verdict: Option<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
}

impl JobDetail {
    /// Persisted section for `key`, if any.
    pub fn section(&self, key: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.section_key == key)
    }

    /// Last persisted status for `key`.
    pub fn persisted_status(&self, key: &str) -> Option<SectionStatus> {
        self.section(key).map(|s| s.status)
    }
}

/// Read-only access to the CRUD store.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Section catalogue, fetched once per view.
    async fn fetch_section_catalogue(&self) -> Result<Vec<SectionDefinition>, StoreError>;

    /// Job record including its current persisted sections.
    async fn fetch_job(&self, job_id: &JobId) -> Result<JobDetail, StoreError>;
}

/// `JobStore` backed by the tracker's REST API.
#[derive(Clone, Debug)]
pub struct HttpJobStore {
    http: reqwest::Client,
    config: ClientConfig,
}

impl HttpJobStore {
    pub fn new(config: ClientConfig) -> Result<Self, JobtrackError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| JobtrackError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, StoreError> {
        let url = self.config.api_url(path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(StoreError::Http {
                status: status.as_u16(),
                detail: error_detail(&body, status.as_u16()),
            });
        }
        serde_json::from_slice(&body).map_err(|e| StoreError::Decode(format!("{url}: {e}")))
    }
}

#[async_trait::async_trait]
impl JobStore for HttpJobStore {
    async fn fetch_section_catalogue(&self) -> Result<Vec<SectionDefinition>, StoreError> {
        self.get_json("section-definitions").await
    }

    async fn fetch_job(&self, job_id: &JobId) -> Result<JobDetail, StoreError> {
        self.get_json(&format!("jobs/{job_id}")).await
    }
}

fn error_detail(body: &[u8], status: u16) -> String {
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(ToOwned::to_owned))
        .unwrap_or_else(|| format!("Request failed: {status}"))
}
