//! HTTP client for the image-generation service.
//!
//! One `generate` call is a submit followed by a status-poll loop: the
//! submit returns a task UUID (in one of several response shapes), and the
//! poll loop waits for a terminal status and digs the image URL out of the
//! result. Three queue variants (prod/dev/ops) select the endpoint pair.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PollSettings;
use crate::model::subtask::{ApiQueue, PromptItem};
use crate::model::task::ClientArgs;

/// Target pixel area for dimension derivation (1024 x 1024).
const TARGET_PIXELS: f64 = 1024.0 * 1024.0;

/// Statuses that end the poll loop.
const TERMINAL_STATUSES: [&str; 5] = ["completed", "success", "failed", "error", "timeout"];

/// Fixed timeout applied to each status poll request.
const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure surface of a single generation attempt, consumed by the retry
/// classifier.
#[derive(Debug, Error)]
pub enum ImageApiError {
    /// HTTP 451 or an `ILLEGAL_IMAGE` task status. Never retried.
    #[error("content rejected by the image service")]
    IllegalContent,

    /// Poll exhaustion or an explicit `TIMEOUT` task status.
    #[error("image generation timed out")]
    Timeout,

    /// The service reported a `FAILURE` task status.
    #[error("image service reported generation failure")]
    Failure,

    /// The submit response carried no recognisable task UUID.
    #[error("no task uuid in submit response: {0}")]
    MissingTaskUuid(String),

    /// A terminal result carried no recognisable image URL.
    #[error("no image url in terminal result: {0}")]
    MissingImageUrl(String),

    /// Transport-level or unexpected HTTP failure.
    #[error("http error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for ImageApiError {
    fn from(err: reqwest::Error) -> Self {
        ImageApiError::Http(err.to_string())
    }
}

/// One generation request, fully resolved from a subtask.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub prompts: Vec<PromptItem>,
    pub ratio: String,
    /// Zero asks the service for a random seed per attempt.
    pub seed: i64,
    pub use_polish: bool,
    pub client_args: ClientArgs,
    pub queue: ApiQueue,
    pub poll: PollSettings,
}

/// Final output of a successful generation.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageOutput {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub seed: i64,
}

/// The image-generation API surface, behind a trait so executors can be
/// driven against a test double.
#[async_trait]
pub trait ImageApi: Send + Sync {
    async fn generate(&self, request: &GenerateRequest) -> Result<ImageOutput, ImageApiError>;
}

/// Derives `(width, height)` from a `"W:H"` ratio so that the area is
/// close to 1024^2 and both sides are multiples of 8. Malformed ratios fall
/// back to 1024 x 1024.
pub fn calculate_dimensions(ratio: &str) -> (u32, u32) {
    let parts: Vec<&str> = ratio.split(':').collect();
    if parts.len() == 2 {
        if let (Ok(width_ratio), Ok(height_ratio)) =
            (parts[0].trim().parse::<f64>(), parts[1].trim().parse::<f64>())
        {
            if width_ratio > 0.0 && height_ratio > 0.0 {
                let x = (TARGET_PIXELS / (width_ratio * height_ratio)).sqrt();
                let width = ((width_ratio * x / 8.0).round() * 8.0) as u32;
                let height = ((height_ratio * x / 8.0).round() * 8.0) as u32;
                if width > 0 && height > 0 {
                    return (width, height);
                }
            }
        }
        warn!(ratio = %ratio, "could not derive dimensions, using 1024x1024");
    }
    (1024, 1024)
}

/// Client for the image service's submit + poll protocol.
pub struct MakeImageClient {
    http: Client,
    api_token: String,
    submit_timeout: Duration,
    prod_base: String,
    dev_base: String,
    ops_base: String,
}

impl MakeImageClient {
    /// Creates a client with the production endpoint set.
    pub fn new(api_token: impl Into<String>, submit_timeout: Duration) -> Self {
        Self {
            http: Client::builder()
                .build()
                .expect("Failed to build HTTP client"),
            api_token: api_token.into(),
            submit_timeout,
            prod_base: "https://api.make.com".to_string(),
            dev_base: "https://dev.api.make.com".to_string(),
            ops_base: "https://ops.api.make.com".to_string(),
        }
    }

    /// Overrides the base URL for one queue. Used by embedders and tests.
    pub fn with_base_url(mut self, queue: ApiQueue, base: impl Into<String>) -> Self {
        let base = base.into();
        match queue {
            ApiQueue::Prod => self.prod_base = base,
            ApiQueue::Dev => self.dev_base = base,
            ApiQueue::Ops => self.ops_base = base,
        }
        self
    }

    fn base(&self, queue: ApiQueue) -> &str {
        match queue {
            ApiQueue::Prod => &self.prod_base,
            ApiQueue::Dev => &self.dev_base,
            ApiQueue::Ops => &self.ops_base,
        }
    }

    fn submit_url(&self, queue: ApiQueue) -> String {
        format!("{}/v1/generate", self.base(queue))
    }

    fn status_url(&self, queue: ApiQueue, task_uuid: &str) -> String {
        format!("{}/v1/tasks/{}", self.base(queue), task_uuid)
    }

    fn decorate(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.api_token)
            .header("X-Client-Version", "1.0.0")
            .header("X-Client-Platform", "backend")
    }

    async fn submit(
        &self,
        request: &GenerateRequest,
        width: u32,
        height: u32,
    ) -> Result<Value, ImageApiError> {
        let mut payload = json!({
            "prompts": request.prompts,
            "width": width,
            "height": height,
            "seed": request.seed,
            "batch_size": 1,
            "quality": "standard",
            "advanced_translator": request.use_polish,
        });
        if !request.client_args.is_empty() {
            payload["client_args"] = serde_json::to_value(&request.client_args)
                .map_err(|e| ImageApiError::Http(e.to_string()))?;
        }

        let response = self
            .decorate(self.http.post(self.submit_url(request.queue)))
            .timeout(self.submit_timeout)
            .json(&payload)
            .send()
            .await?;

        if response.status() == StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS {
            return Err(ImageApiError::IllegalContent);
        }
        let response = response.error_for_status()?;
        Ok(response.json::<Value>().await?)
    }

    /// Polls until a terminal status arrives or attempts run out.
    async fn poll(
        &self,
        request: &GenerateRequest,
        task_uuid: &str,
    ) -> Result<Value, ImageApiError> {
        let url = self.status_url(request.queue, task_uuid);

        for attempt in 0..request.poll.max_attempts {
            let response = self
                .decorate(self.http.get(&url))
                .timeout(POLL_REQUEST_TIMEOUT)
                .send()
                .await;

            match response {
                Ok(response) if response.status() == StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS => {
                    return Err(ImageApiError::IllegalContent);
                }
                Ok(response) => match response.error_for_status() {
                    Ok(response) => {
                        let body: Value = response.json().await?;
                        let status = body
                            .get("status")
                            .and_then(Value::as_str)
                            .unwrap_or_default();
                        if TERMINAL_STATUSES.contains(&status) {
                            debug!(task_uuid = %task_uuid, status = %status, attempt, "poll reached terminal status");
                            return Ok(body);
                        }
                    }
                    Err(err) => {
                        warn!(task_uuid = %task_uuid, attempt, error = %err, "status poll failed");
                    }
                },
                Err(err) => {
                    warn!(task_uuid = %task_uuid, attempt, error = %err, "status poll failed");
                }
            }

            tokio::time::sleep(request.poll.interval).await;
        }

        Err(ImageApiError::Timeout)
    }
}

#[async_trait]
impl ImageApi for MakeImageClient {
    async fn generate(&self, request: &GenerateRequest) -> Result<ImageOutput, ImageApiError> {
        let (width, height) = calculate_dimensions(&request.ratio);

        let submit_response = self.submit(request, width, height).await?;
        let task_uuid = extract_task_uuid(&submit_response)
            .ok_or_else(|| ImageApiError::MissingTaskUuid(submit_response.to_string()))?;
        debug!(task_uuid = %task_uuid, queue = %request.queue, "generation task submitted");

        let result = self.poll(request, &task_uuid).await?;

        match result.get("task_status").and_then(Value::as_str) {
            Some("ILLEGAL_IMAGE") => return Err(ImageApiError::IllegalContent),
            Some("FAILURE") => return Err(ImageApiError::Failure),
            Some("TIMEOUT") => return Err(ImageApiError::Timeout),
            _ => {}
        }
        match result.get("status").and_then(Value::as_str) {
            Some("failed") | Some("error") => return Err(ImageApiError::Failure),
            Some("timeout") => return Err(ImageApiError::Timeout),
            _ => {}
        }

        let url = extract_image_url(&result)
            .ok_or_else(|| ImageApiError::MissingImageUrl(result.to_string()))?;

        Ok(ImageOutput {
            url,
            width,
            height,
            seed: result
                .get("seed")
                .and_then(Value::as_i64)
                .unwrap_or(request.seed),
        })
    }
}

/// Digs the task UUID out of a submit response: either a bare string, or
/// one of `uuid`/`task_uuid`/`id`/`task_id`, possibly nested under `data`.
fn extract_task_uuid(response: &Value) -> Option<String> {
    if let Some(text) = response.as_str() {
        if text.len() > 30 && text.contains('-') {
            return Some(text.trim().to_string());
        }
    }

    const KEYS: [&str; 4] = ["uuid", "task_uuid", "id", "task_id"];
    for key in KEYS {
        if let Some(value) = response.get(key).and_then(Value::as_str) {
            return Some(value.to_string());
        }
    }
    if let Some(data) = response.get("data") {
        for key in KEYS {
            if let Some(value) = data.get(key).and_then(Value::as_str) {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Digs the image URL out of a terminal result, trying the known locations
/// in order.
fn extract_image_url(result: &Value) -> Option<String> {
    if let Some(url) = result.get("url").and_then(Value::as_str) {
        return Some(url.to_string());
    }
    if let Some(url) = result.get("image_url").and_then(Value::as_str) {
        return Some(url.to_string());
    }
    if let Some(data) = result.get("data") {
        if let Some(url) = data.get("url").and_then(Value::as_str) {
            return Some(url.to_string());
        }
        if let Some(url) = data.get("image_url").and_then(Value::as_str) {
            return Some(url.to_string());
        }
    }
    if let Some(first) = result.get("images").and_then(Value::as_array).and_then(|a| a.first()) {
        if let Some(url) = first.as_str() {
            return Some(url.to_string());
        }
        if let Some(url) = first.get("url").and_then(Value::as_str) {
            return Some(url.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions_square() {
        assert_eq!(calculate_dimensions("1:1"), (1024, 1024));
    }

    #[test]
    fn test_dimensions_wide() {
        let (width, height) = calculate_dimensions("16:9");
        assert_eq!((width, height), (1368, 768));
        assert_eq!(width % 8, 0);
        assert_eq!(height % 8, 0);
        // Area stays close to the 1024^2 target.
        let area = f64::from(width) * f64::from(height);
        assert!((area - TARGET_PIXELS).abs() / TARGET_PIXELS < 0.05);
    }

    #[test]
    fn test_dimensions_four_three() {
        assert_eq!(calculate_dimensions("4:3"), (1184, 888));
    }

    #[test]
    fn test_dimensions_fallback() {
        assert_eq!(calculate_dimensions("square"), (1024, 1024));
        assert_eq!(calculate_dimensions("16:nine"), (1024, 1024));
        assert_eq!(calculate_dimensions("0:1"), (1024, 1024));
        assert_eq!(calculate_dimensions(""), (1024, 1024));
    }

    #[test]
    fn test_extract_task_uuid_variants() {
        let bare = Value::String("123e4567-e89b-12d3-a456-426614174000".to_string());
        assert!(extract_task_uuid(&bare).is_some());

        let short = Value::String("abc-123".to_string());
        assert!(extract_task_uuid(&short).is_none());

        for key in ["uuid", "task_uuid", "id", "task_id"] {
            let direct = json!({ key: "task-1" });
            assert_eq!(extract_task_uuid(&direct).as_deref(), Some("task-1"));

            let nested = json!({ "data": { key: "task-2" } });
            assert_eq!(extract_task_uuid(&nested).as_deref(), Some("task-2"));
        }

        assert!(extract_task_uuid(&json!({ "other": "x" })).is_none());
    }

    #[test]
    fn test_extract_image_url_probe_order() {
        let direct = json!({ "url": "https://img/1.png", "image_url": "https://img/2.png" });
        assert_eq!(extract_image_url(&direct).as_deref(), Some("https://img/1.png"));

        let image_url = json!({ "image_url": "https://img/2.png" });
        assert_eq!(extract_image_url(&image_url).as_deref(), Some("https://img/2.png"));

        let nested = json!({ "data": { "url": "https://img/3.png" } });
        assert_eq!(extract_image_url(&nested).as_deref(), Some("https://img/3.png"));

        let nested_image = json!({ "data": { "image_url": "https://img/4.png" } });
        assert_eq!(
            extract_image_url(&nested_image).as_deref(),
            Some("https://img/4.png")
        );

        let images_str = json!({ "images": ["https://img/5.png"] });
        assert_eq!(extract_image_url(&images_str).as_deref(), Some("https://img/5.png"));

        let images_obj = json!({ "images": [{ "url": "https://img/6.png" }] });
        assert_eq!(extract_image_url(&images_obj).as_deref(), Some("https://img/6.png"));

        assert!(extract_image_url(&json!({ "images": [] })).is_none());
        assert!(extract_image_url(&json!({})).is_none());
    }

    #[test]
    fn test_queue_base_urls() {
        let client = MakeImageClient::new("token", Duration::from_secs(300))
            .with_base_url(ApiQueue::Dev, "http://localhost:9000");
        assert_eq!(
            client.submit_url(ApiQueue::Dev),
            "http://localhost:9000/v1/generate"
        );
        assert_eq!(
            client.status_url(ApiQueue::Dev, "abc"),
            "http://localhost:9000/v1/tasks/abc"
        );
        assert_eq!(client.submit_url(ApiQueue::Prod), "https://api.make.com/v1/generate");
    }
}
