//! Client for the external reviewer service.
//!
//! The reviewer is a black box reached over HTTP with a JSON request/response
//! pair. Its failure taxonomy maps into the core's: 4xx responses are
//! terminal (retrying won't help), 5xx and transport failures are transient.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;

use reviewd_core::{ReviewRequest, ReviewResponse};

use crate::runtime::context::StepError;

/// Reviews can take a while; allow well beyond the provider-call timeout.
const REVIEW_TIMEOUT: Duration = Duration::from_secs(600);

#[async_trait]
pub trait Reviewer: Send + Sync {
    async fn run_review(&self, request: &ReviewRequest) -> Result<ReviewResponse, StepError>;
}

pub struct HttpReviewer {
    http: Client,
    base_url: String,
    model: Option<String>,
    max_tokens: Option<u32>,
}

impl HttpReviewer {
    pub fn new(base_url: &str, model: Option<String>, max_tokens: Option<u32>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REVIEW_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            max_tokens,
        })
    }
}

#[async_trait]
impl Reviewer for HttpReviewer {
    async fn run_review(&self, request: &ReviewRequest) -> Result<ReviewResponse, StepError> {
        let mut request = request.clone();
        request.model = self.model.clone();
        request.max_tokens = self.max_tokens;

        let resp = self
            .http
            .post(format!("{}/review", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| StepError::transient(anyhow!("calling reviewer: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = anyhow!("reviewer returned {}: {}", status, body.trim());
            if status.is_client_error() {
                return Err(StepError::Terminal(err));
            }
            return Err(StepError::Transient(err));
        }

        resp.json::<ReviewResponse>()
            .await
            .map_err(|e| StepError::transient(anyhow!("decoding reviewer response: {}", e)))
    }
}
