//! HTTP adapter for the inference service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::error::{DetectorError, DetectorResult};
use crate::types::{Detector, StageOutput, StageRequest};

/// First in-call retry delay; doubles per attempt.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Ceiling on the in-call retry delay.
const RETRY_MAX_DELAY: Duration = Duration::from_secs(10);

/// Bound on a health check request, independent of the stage timeout.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before in-call retry number `attempt + 1`.
fn retry_delay(attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    RETRY_BASE_DELAY.saturating_mul(factor).min(RETRY_MAX_DELAY)
}

/// Configuration for the HTTP detector.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Base URL of the inference service
    pub base_url: String,
    /// Per-request timeout
    pub timeout: Duration,
    /// Connection-level retries within a single stage call
    pub max_retries: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            timeout: Duration::from_secs(120),
            max_retries: 1,
        }
    }
}

impl DetectorConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("DETECTOR_URL")
                .unwrap_or_else(|_| "http://localhost:8001".to_string()),
            timeout: Duration::from_secs(
                std::env::var("DETECTOR_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(120),
            ),
            max_retries: std::env::var("DETECTOR_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
        }
    }
}

/// Detector backed by `POST {base_url}/detect`.
pub struct HttpDetector {
    http: Client,
    config: DetectorConfig,
}

impl HttpDetector {
    pub fn new(config: DetectorConfig) -> DetectorResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(DetectorError::Network)?;

        Ok(Self { http, config })
    }

    async fn send(&self, request: &StageRequest) -> DetectorResult<StageOutput> {
        let url = format!("{}/detect", self.config.base_url.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| self.classify_transport(e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<StageOutput>()
                .await
                .map_err(|e| DetectorError::InvalidResponse(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                DetectorError::InvalidInput(body)
            }
            StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => {
                DetectorError::ServiceUnavailable(format!("{}: {}", status, body))
            }
            s if s.is_server_error() => {
                DetectorError::ServiceUnavailable(format!("{}: {}", status, body))
            }
            _ => DetectorError::Rejected(format!("{}: {}", status, body)),
        })
    }

    fn classify_transport(&self, error: reqwest::Error) -> DetectorError {
        if error.is_timeout() {
            DetectorError::Timeout(self.config.timeout.as_secs())
        } else {
            DetectorError::Network(error)
        }
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, request: StageRequest) -> DetectorResult<StageOutput> {
        debug!(
            job_id = %request.job_id,
            stage = %request.stage,
            "Sending detector request"
        );

        let mut attempt = 0;
        loop {
            match self.send(&request).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    let delay = retry_delay(attempt);
                    warn!(
                        job_id = %request.job_id,
                        stage = %request.stage,
                        "Detector request failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.config.base_url.trim_end_matches('/'));
        match self.http.get(&url).timeout(HEALTH_CHECK_TIMEOUT).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!("Detector health check failed: {}", response.status());
                false
            }
            Err(e) => {
                warn!("Detector health check error: {}", e);
                false
            }
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Artifact;
    use mscan_models::{ContentHash, JobId, Stage};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn detector(server: &MockServer) -> HttpDetector {
        HttpDetector::new(DetectorConfig {
            base_url: server.uri(),
            timeout: Duration::from_secs(2),
            max_retries: 0,
        })
        .unwrap()
    }

    fn request() -> StageRequest {
        StageRequest::new(
            &JobId::from_string("job-1"),
            Stage::Inference,
            "s3://bucket/a.mp4",
            &ContentHash::of_bytes(b"a"),
        )
    }

    #[test]
    fn test_config_defaults() {
        let config = DetectorConfig::default();
        assert_eq!(config.base_url, "http://localhost:8001");
        assert_eq!(config.timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_retry_delay_is_capped() {
        assert_eq!(retry_delay(0), Duration::from_millis(500));
        assert_eq!(retry_delay(1), Duration::from_secs(1));
        assert_eq!(retry_delay(5), RETRY_MAX_DELAY);
        assert_eq!(retry_delay(64), RETRY_MAX_DELAY);
        assert_eq!(retry_delay(u32::MAX), RETRY_MAX_DELAY);
    }

    #[tokio::test]
    async fn test_detect_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "artifact": {"label": "authentic", "score": 0.93}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let output = detector(&server).detect(request()).await.unwrap();
        assert_eq!(
            output.artifact,
            Artifact::new(serde_json::json!({"label": "authentic", "score": 0.93}))
        );
    }

    #[tokio::test]
    async fn test_unprocessable_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .respond_with(ResponseTemplate::new(422).set_body_string("corrupt media"))
            .mount(&server)
            .await;

        let err = detector(&server).detect(request()).await.unwrap_err();
        assert!(matches!(err, DetectorError::InvalidInput(ref b) if b == "corrupt media"));
        assert!(err.is_permanent_failure());
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = detector(&server).detect(request()).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/detect"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let err = detector(&server).detect(request()).await.unwrap_err();
        assert!(matches!(err, DetectorError::Timeout(2)));
    }

    #[tokio::test]
    async fn test_health_check() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        assert!(detector(&server).health_check().await);
    }

    #[tokio::test]
    async fn test_failing_health_endpoint_reports_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        assert!(!detector(&server).health_check().await);
    }
}
