//! HTTP text detector client
//!
//! Posts the image as base64 JSON to an OCR service and returns the
//! detections in the order the service reported them.

use crate::domain::types::{CapturedImage, TextDetection};
use crate::io::collaborators::TextDetector;
use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    key: &'a str,
    image: String,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<TextDetection>,
}

pub struct HttpTextDetector {
    url: String,
    client: reqwest::Client,
}

impl HttpTextDetector {
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build detector HTTP client")?;
        Ok(Self { url: url.to_string(), client })
    }
}

/// Parse a detector response body
fn parse_detections(body: &[u8]) -> anyhow::Result<Vec<TextDetection>> {
    let response: DetectResponse =
        serde_json::from_slice(body).context("Failed to parse detector response")?;
    Ok(response.detections)
}

#[async_trait]
impl TextDetector for HttpTextDetector {
    async fn detect(&self, image: &CapturedImage) -> anyhow::Result<Vec<TextDetection>> {
        let start = Instant::now();
        let request = DetectRequest { key: &image.key, image: STANDARD.encode(&image.bytes) };
        let body = serde_json::to_vec(&request)?;

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Detector request to {} failed", self.url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("detector returned HTTP {}", status.as_u16());
        }

        let detections = parse_detections(&response.bytes().await?)?;
        debug!(
            key = %image.key,
            tokens = detections.len(),
            latency_ms = start.elapsed().as_millis() as u64,
            "text_detected"
        );
        Ok(detections)
    }
}
