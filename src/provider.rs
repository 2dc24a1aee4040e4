//! CI provider client.
//!
//! Fetches build metadata and console logs over HTTP, decoding only the
//! subset of fields the engine consumes. Unknown fields are ignored.
//!
//! The coordinator talks to the provider through the [`BuildSource`] trait so
//! tests can substitute an in-memory fake.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, ScanError};

/// One action within a build step. Absent flags decode as false.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionPayload {
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub timedout: bool,
    #[serde(default)]
    pub output_url: Option<String>,
}

/// One named build step.
#[derive(Debug, Clone, Deserialize)]
pub struct StepPayload {
    pub name: String,
    #[serde(default)]
    pub actions: Vec<ActionPayload>,
}

/// The consumed subset of the build-metadata document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildPayload {
    #[serde(default)]
    pub steps: Vec<StepPayload>,
}

/// One element of the console-log payload.
#[derive(Debug, Clone, Deserialize)]
pub struct LogChunk {
    #[serde(rename = "type")]
    pub chunk_type: String,
    #[serde(default)]
    pub message: String,
}

/// The single failing step of a build, per the classification rule: the
/// first step whose any action has `failed` or `timedout` set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailingStep {
    /// No step reported a failure (idiopathic build).
    None,
    /// The failing action timed out; there is no scannable log.
    Timeout { step_name: String },
    /// The failing action failed outright. `output_url` may still be absent.
    Failed {
        step_name: String,
        output_url: Option<String>,
    },
}

/// Classify a build's failing step.
pub fn failing_step(build: &BuildPayload) -> FailingStep {
    for step in &build.steps {
        for action in &step.actions {
            if action.timedout {
                return FailingStep::Timeout {
                    step_name: step.name.clone(),
                };
            }
            if action.failed {
                return FailingStep::Failed {
                    step_name: step.name.clone(),
                    output_url: action.output_url.clone(),
                };
            }
        }
    }
    FailingStep::None
}

/// Assemble the canonical log text: the concatenation of `message` for every
/// chunk with `type == "out"`, joined without separators.
pub fn assemble_log_text(chunks: &[LogChunk]) -> String {
    let mut text = String::new();
    for chunk in chunks {
        if chunk.chunk_type == "out" {
            text.push_str(&chunk.message);
        }
    }
    text
}

/// Source of build metadata and console logs.
#[async_trait]
pub trait BuildSource: Send + Sync {
    /// Fetch the build-metadata document for a build number.
    async fn fetch_build(&self, build_num: i64) -> Result<BuildPayload>;

    /// Download a console log and return the canonical text.
    async fn fetch_log(&self, url: &str) -> Result<String>;
}

/// HTTP client against a real CI provider.
pub struct CiClient {
    client: reqwest::Client,
    base_url: String,
}

impl CiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// GET a URL and return the body, mapping non-2xx to an error that keeps
    /// the status and URL.
    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(ScanError::Http {
                status: response.status(),
                url: url.to_string(),
            });
        }

        Ok(response.text().await?)
    }
}

#[async_trait]
impl BuildSource for CiClient {
    async fn fetch_build(&self, build_num: i64) -> Result<BuildPayload> {
        let url = format!("{}/{}", self.base_url, build_num);
        debug!(build_num, %url, "fetching build metadata");

        let body = self.get_text(&url).await?;
        let payload: BuildPayload = serde_json::from_str(&body)?;
        Ok(payload)
    }

    async fn fetch_log(&self, url: &str) -> Result<String> {
        debug!(%url, "downloading console log");

        let body = self.get_text(url).await?;
        let chunks: Vec<LogChunk> = serde_json::from_str(&body)?;
        Ok(assemble_log_text(&chunks))
    }
}
