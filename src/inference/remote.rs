use super::adapter::{BackendInput, InferenceAdapter, InferenceOutput, InputKind};
use crate::config::RemoteConfig;
use crate::error::{Result, ScanError};
use crate::frame::EncodedImage;
use crate::interpreter::ClassScores;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Body returned by the classification service
#[derive(Debug, Deserialize)]
pub(crate) struct ClassifyResponse {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub all_predictions: Option<HashMap<String, f32>>,
    #[serde(default, alias = "message")]
    pub error: Option<String>,
}

impl ClassifyResponse {
    pub(crate) fn into_scores(self, status: u16) -> Result<ClassScores> {
        if self.success == Some(false) {
            return Err(ScanError::backend(
                Some(status),
                self.error
                    .unwrap_or_else(|| "classification unsuccessful".to_string()),
            ));
        }

        if let Some(predictions) = self.all_predictions.filter(|p| !p.is_empty()) {
            return ClassScores::from_label_map(&predictions);
        }

        match (self.category, self.confidence) {
            (Some(category), Some(confidence)) => {
                ClassScores::from_top(category.parse()?, confidence)
            }
            _ => Err(ScanError::backend(
                Some(status),
                "response carries neither all_predictions nor category/confidence",
            )),
        }
    }
}

/// Classifier backed by the HTTP waste classification service.
///
/// Uploads the compressed still as `multipart/form-data`; the service does its
/// own preprocessing.
pub struct RemoteClassifier {
    config: RemoteConfig,
    client: Client,
    ready: AtomicBool,
}

impl RemoteClassifier {
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| ScanError::BackendInitFailed {
                details: format!("HTTP client: {}", e),
            })?;

        Ok(Self {
            config,
            client,
            ready: AtomicBool::new(false),
        })
    }

    fn min_backoff(&self) -> Duration {
        Duration::from_secs(self.config.rate_limit_backoff_seconds)
    }

    fn transport_error(&self, error: reqwest::Error) -> ScanError {
        if error.is_timeout() {
            ScanError::backend(
                None,
                format!("request timed out after {}s", self.config.timeout_seconds),
            )
        } else {
            ScanError::backend(None, error.to_string())
        }
    }

    fn build_form(&self, image: EncodedImage) -> Result<Form> {
        let mime = image.format.mime_type();
        let file_name = image.file_name();
        let part = Part::bytes(image.data)
            .file_name(file_name)
            .mime_str(mime)
            .map_err(|e| ScanError::backend(None, format!("invalid upload part: {}", e)))?;

        Ok(Form::new()
            .part("image", part)
            .text("device_id", self.config.device_id.clone()))
    }
}

/// Seconds form of `Retry-After`; HTTP-date values are ignored
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl InferenceAdapter for RemoteClassifier {
    fn name(&self) -> &str {
        "remote"
    }

    fn input_kind(&self) -> InputKind {
        InputKind::EncodedImage
    }

    async fn initialize(&self) -> bool {
        if self.ready.load(Ordering::Acquire) {
            return true;
        }

        info!("Checking classification service at {}", self.config.health_endpoint);
        match self.client.get(&self.config.health_endpoint).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Classification service healthy ({})", response.status());
                self.ready.store(true, Ordering::Release);
                true
            }
            Ok(response) => {
                warn!("Classification service health check returned {}", response.status());
                false
            }
            Err(e) => {
                warn!("Classification service unreachable: {}", e);
                false
            }
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    async fn infer(&self, input: BackendInput) -> Result<InferenceOutput> {
        let image = match input {
            BackendInput::Image(image) => image,
            BackendInput::Tensor(_) => {
                return Err(ScanError::backend(
                    None,
                    "remote backend expects an encoded image",
                ))
            }
        };

        debug!(
            "Uploading {}x{} image ({} bytes) to {}",
            image.width,
            image.height,
            image.data.len(),
            self.config.endpoint
        );

        let started = Instant::now();
        let form = self.build_form(image)?;
        let response = self
            .client
            .post(&self.config.endpoint)
            .header(ACCEPT, "application/json")
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let wait = retry_after(response.headers())
                .map_or(self.min_backoff(), |d| d.max(self.min_backoff()));
            return Err(ScanError::RateLimited { retry_after: wait });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ScanError::backend(Some(status.as_u16()), body));
        }

        let body: ClassifyResponse = response.json().await.map_err(|e| {
            ScanError::backend(Some(status.as_u16()), format!("invalid response body: {}", e))
        })?;
        let scores = body.into_scores(status.as_u16())?;
        let elapsed = started.elapsed();

        debug!("Remote classification took {}ms", elapsed.as_millis());
        Ok(InferenceOutput { scores, elapsed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> Result<ClassScores> {
        serde_json::from_str::<ClassifyResponse>(body)
            .unwrap()
            .into_scores(200)
    }

    #[test]
    fn test_all_predictions_preferred() {
        let scores = parse(
            r#"{"success":true,"category":"toxic","confidence":0.5,
                "all_predictions":{"biodegradable":0.2,"non_biodegradable":0.3,"toxic":0.5}}"#,
        )
        .unwrap();
        assert_eq!(scores.as_slice(), &[0.2, 0.3, 0.5]);
    }

    #[test]
    fn test_category_fallback() {
        let scores = parse(r#"{"success":true,"category":"Biodegradable","confidence":0.8}"#)
            .unwrap();
        let values = scores.as_slice();
        assert!((values[0] - 0.8).abs() < 1e-6);
        assert!((values[1] - 0.1).abs() < 1e-6);
        assert!((values[2] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_unsuccessful_and_empty_bodies() {
        assert!(matches!(
            parse(r#"{"success":false,"error":"model offline"}"#),
            Err(ScanError::BackendError { status: Some(200), ref detail }) if detail == "model offline"
        ));
        assert!(matches!(
            parse(r#"{"success":true}"#),
            Err(ScanError::BackendError { .. })
        ));
        assert!(matches!(
            parse(r#"{"all_predictions":{"biodegradable":1.0}}"#),
            Err(ScanError::ScoreCardinalityMismatch { actual: 1, .. })
        ));
    }

    #[test]
    fn test_retry_after_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);

        headers.insert(RETRY_AFTER, "30".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(30)));

        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2015 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }
}
