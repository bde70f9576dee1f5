//! Classifier - Vehicle Detector Adapter
//!
//! ## Responsibilities
//!
//! - Send encoded frames to the detection server
//! - Parse detector output into raw detections
//! - Validate raw detections and apply the target class filter
//!
//! The detector itself is opaque: it takes a JPEG and returns boxes with a
//! confidence and a class label.

use crate::capture_source::Frame;
use crate::error::{Error, Result};
use crate::models::{Detection, RawDetection};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;

/// Inference seam used by camera workers
pub trait Classifier: Send + Sync {
    /// Detect vehicles in one encoded frame
    fn infer(&self, frame: Frame) -> BoxFuture<'_, Result<Vec<RawDetection>>>;
}

/// Detection server response
#[derive(Debug, Clone, Deserialize)]
pub struct DetectResponse {
    #[serde(default)]
    pub detections: Vec<RawDetection>,
    #[serde(default)]
    pub inference_ms: Option<u64>,
}

/// HTTP detection server client
pub struct HttpClassifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpClassifier {
    /// Create new client with the default 30s request timeout
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    /// Create new client with custom timeout
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "detector URL must be http(s), got {:?}",
                base_url
            )));
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// Check detection server health
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/healthz", self.base_url);
        match self.client.get(&url).send().await {
            Ok(resp) => Ok(resp.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    /// Post one frame and parse the response
    pub async fn detect(&self, frame: &Frame) -> Result<DetectResponse> {
        let url = format!("{}/v1/detect", self.base_url);

        let form = Form::new().part(
            "infer_image",
            Part::bytes(frame.as_bytes().to_vec())
                .file_name("frame.jpg")
                .mime_str("image/jpeg")?,
        );

        let resp = self.client.post(&url).multipart(form).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Inference(format!(
                "detector returned {} - {}",
                status, body
            )));
        }

        let result: DetectResponse = resp.json().await?;
        if let Some(ms) = result.inference_ms {
            tracing::trace!(
                inference_ms = ms,
                count = result.detections.len(),
                "Detector responded"
            );
        }
        Ok(result)
    }

    /// Get base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Classifier for HttpClassifier {
    fn infer(&self, frame: Frame) -> BoxFuture<'_, Result<Vec<RawDetection>>> {
        async move {
            let resp = self.detect(&frame).await?;
            Ok(resp.detections)
        }
        .boxed()
    }
}

/// Validate raw detector output and keep only target classes
///
/// Malformed records are dropped with a warning. An empty `target_classes` keeps
/// every class.
pub fn to_detections(
    raw: Vec<RawDetection>,
    frame_id: u64,
    timestamp: DateTime<Utc>,
    target_classes: &[String],
) -> Vec<Detection> {
    raw.into_iter()
        .filter(|r| {
            target_classes.is_empty()
                || target_classes
                    .iter()
                    .any(|c| c.eq_ignore_ascii_case(&r.class_name))
        })
        .filter_map(|r| match r.validate(frame_id, timestamp) {
            Ok(d) => Some(d),
            Err(e) => {
                tracing::warn!(frame_id = frame_id, error = %e, "Dropping malformed detection");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(class_name: &str, bbox: Vec<f64>) -> RawDetection {
        RawDetection {
            bbox,
            confidence: 0.8,
            class_name: class_name.to_string(),
        }
    }

    #[test]
    fn test_to_detections_filters_classes() {
        let input = vec![
            raw("car", vec![0.0, 0.0, 10.0, 10.0]),
            raw("person", vec![0.0, 0.0, 10.0, 10.0]),
            raw("Truck", vec![5.0, 5.0, 10.0, 10.0]),
        ];
        let targets = vec!["car".to_string(), "truck".to_string()];

        let out = to_detections(input, 3, Utc::now(), &targets);
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|d| d.frame_id == 3));
    }

    #[test]
    fn test_to_detections_drops_malformed() {
        let input = vec![
            raw("car", vec![0.0, 0.0, -1.0, 10.0]),
            raw("car", vec![0.0, 0.0]),
            raw("car", vec![1.0, 1.0, 2.0, 2.0]),
        ];

        let out = to_detections(input, 0, Utc::now(), &[]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_detect_response_parse() {
        let json = r#"{
            "detections": [
                {"bbox": [12.5, 40, 100, 60], "confidence": 0.91, "class_name": "car"}
            ],
            "inference_ms": 42
        }"#;
        let resp: DetectResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.detections.len(), 1);
        assert_eq!(resp.detections[0].bbox, vec![12.5, 40.0, 100.0, 60.0]);
        assert_eq!(resp.inference_ms, Some(42));

        let empty: DetectResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.detections.is_empty());
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let c = HttpClassifier::new("http://detector:8000/").unwrap();
        assert_eq!(c.base_url(), "http://detector:8000");
    }

    #[test]
    fn test_rejects_non_http_url() {
        let err = HttpClassifier::new("detector:8000").err().unwrap();
        assert_eq!(err.code(), "CONFIG_ERROR");
        assert!(HttpClassifier::new("  ").is_err());
        assert!(HttpClassifier::new("https://detector.lot/").is_ok());
    }
}
