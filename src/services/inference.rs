use image::RgbImage;
use reqwest::Client;
use serde::Deserialize;
use tokio::runtime::Handle;

use crate::models::detection::Detection;
use crate::services::frames;

/// Per-frame object detector.
///
/// Called from the blocking pool, never from an async task, so
/// implementations are free to do heavy synchronous work.
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>, InferenceError>;
}

/// Client for a Cloudflare Workers AI object-detection model.
pub struct WorkersAiDetector {
    http: Client,
    account_id: String,
    api_token: String,
    model: String,
    label: Option<String>,
    runtime: Handle,
}

#[derive(Deserialize)]
struct DetectionResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Vec<DetectedObject>,
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct DetectedObject {
    score: f64,
    #[serde(default)]
    label: String,
    #[serde(rename = "box")]
    bounds: Bounds,
}

#[derive(Debug, Deserialize)]
struct Bounds {
    xmin: f64,
    ymin: f64,
    xmax: f64,
    ymax: f64,
}

impl WorkersAiDetector {
    /// `runtime` drives the HTTP calls issued from blocking threads.
    pub fn new(
        account_id: &str,
        api_token: &str,
        model: &str,
        label: Option<String>,
        runtime: Handle,
    ) -> Result<Self, InferenceError> {
        if account_id.is_empty() || api_token.is_empty() {
            return Err(InferenceError::Config(
                "Workers AI account id and API token are required".to_string(),
            ));
        }

        Ok(Self {
            http: Client::new(),
            account_id: account_id.to_string(),
            api_token: api_token.to_string(),
            model: model.to_string(),
            label,
            runtime,
        })
    }

    async fn request(&self, jpeg: Vec<u8>) -> Result<Vec<DetectedObject>, InferenceError> {
        let url = format!(
            "https://api.cloudflare.com/client/v4/accounts/{}/ai/run/{}",
            self.account_id, self.model
        );

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(jpeg)
            .send()
            .await?
            .error_for_status()?;

        let body: DetectionResponse = response.json().await?;
        if !body.success {
            return Err(InferenceError::Rejected(
                serde_json::Value::Array(body.errors).to_string(),
            ));
        }

        Ok(body.result)
    }

    fn keep(&self, object: &DetectedObject) -> bool {
        self.label
            .as_deref()
            .map_or(true, |wanted| object.label.eq_ignore_ascii_case(wanted))
    }
}

impl Detector for WorkersAiDetector {
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>, InferenceError> {
        let jpeg = frames::encode_jpeg(frame)
            .map_err(|e| InferenceError::Encode(e.to_string()))?;
        let objects = self.runtime.block_on(self.request(jpeg))?;

        Ok(objects
            .iter()
            .filter(|o| self.keep(o))
            .map(|o| {
                let b = &o.bounds;
                Detection::from_xyxy(o.score, [b.xmin, b.ymin, b.xmax, b.ymax])
            })
            .collect())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Model rejected the frame: {0}")]
    Rejected(String),

    #[error("Failed to encode frame: {0}")]
    Encode(String),

    #[error("Inference configuration error: {0}")]
    Config(String),
}
