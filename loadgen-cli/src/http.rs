//! Contains a remote implementation using HTTP to post inference requests.

use std::time::{Duration, Instant};

use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use thiserror::Error;

use crate::config::Target;
use crate::payload::InferRequest;

/// Why a response did not pass its checks.
#[derive(Debug, Error)]
pub enum CheckError {
    /// The endpoint answered with a status other than `200 OK`.
    #[error("unexpected status {status}")]
    Status {
        /// The status of the response.
        status: StatusCode,
        /// Time from sending the request until the response body was read.
        duration: Duration,
    },
    /// The response does not declare a JSON content type.
    #[error(
        "response is not JSON (content type: {})",
        .content_type.as_deref().unwrap_or("none")
    )]
    NotJson {
        /// The declared content type, if any.
        content_type: Option<String>,
        /// Time from sending the request until the response body was read.
        duration: Duration,
    },
    /// The request could not be sent or the response could not be read.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

impl CheckError {
    /// Time until the response was read, or `None` if no response arrived.
    pub fn duration(&self) -> Option<Duration> {
        match *self {
            CheckError::Status { duration, .. } | CheckError::NotJson { duration, .. } => {
                Some(duration)
            }
            CheckError::Transport(_) => None,
        }
    }
}

/// A completed request that passed its checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Exchange {
    /// Time from sending the request until the response body was read.
    pub duration: Duration,
    /// Size of the response body.
    pub bytes: u64,
}

/// A remote implementation using HTTP to post inference requests.
#[derive(Clone, Debug)]
pub struct InferenceRemote {
    client: reqwest::Client,
    url: String,
}

impl InferenceRemote {
    /// Creates a new `InferenceRemote` for the configured target.
    pub fn new(target: &Target) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(target.timeout)
            .build()?;

        Ok(Self {
            client,
            url: target.url.clone(),
        })
    }

    /// The URL requests are posted to.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Posts one request and checks the response.
    ///
    /// A response passes when its status is `200 OK` and its content type contains
    /// `application/json`. The body is read in full but not parsed. Responses that fail their
    /// checks still report how long they took.
    pub async fn infer(&self, request: &InferRequest) -> Result<Exchange, CheckError> {
        let start = Instant::now();
        let response = self.client.post(&self.url).json(request).send().await?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await?;
        let duration = start.elapsed();

        if status != StatusCode::OK {
            return Err(CheckError::Status { status, duration });
        }
        if !content_type
            .as_deref()
            .is_some_and(|value| value.contains("application/json"))
        {
            return Err(CheckError::NotJson {
                content_type,
                duration,
            });
        }

        Ok(Exchange {
            duration,
            bytes: body.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use loadgen_test::server::{Behavior, TestServer};

    use super::*;

    fn remote(url: String) -> InferenceRemote {
        let target = Target {
            url,
            ..Default::default()
        };
        InferenceRemote::new(&target).unwrap()
    }

    fn request() -> InferRequest {
        InferRequest {
            inputs: vec!["this is great".into(), "terrible idea".into()],
        }
    }

    #[tokio::test]
    async fn passes_checks() {
        let server = TestServer::new().await;
        let remote = remote(server.url("/infer"));

        let exchange = remote.infer(&request()).await.unwrap();
        assert!(exchange.bytes > 0);
        assert_eq!(server.requests(), 1);
    }

    #[tokio::test]
    async fn fails_on_status() {
        let server = TestServer::with_behavior(Behavior {
            status: StatusCode::SERVICE_UNAVAILABLE,
            ..Default::default()
        })
        .await;
        let remote = remote(server.url("/infer"));

        let error = remote.infer(&request()).await.unwrap_err();
        assert!(matches!(
            error,
            CheckError::Status {
                status: StatusCode::SERVICE_UNAVAILABLE,
                ..
            }
        ));
        assert_eq!(error.to_string(), "unexpected status 503 Service Unavailable");
    }

    #[tokio::test]
    async fn failed_status_reports_duration() {
        let server = TestServer::with_behavior(Behavior {
            latency: Duration::from_millis(200),
            status: StatusCode::INTERNAL_SERVER_ERROR,
            ..Default::default()
        })
        .await;
        let remote = remote(server.url("/infer"));

        let error = remote.infer(&request()).await.unwrap_err();
        let duration = error.duration().expect("a response arrived");
        assert!(duration >= Duration::from_millis(200), "{duration:?}");
    }

    #[tokio::test]
    async fn fails_on_plain_text() {
        let server = TestServer::with_behavior(Behavior {
            json: false,
            ..Default::default()
        })
        .await;
        let remote = remote(server.url("/infer"));

        let error = remote.infer(&request()).await.unwrap_err();
        let CheckError::NotJson {
            content_type: Some(content_type),
            ..
        } = &error
        else {
            panic!("expected NotJson, got {error:?}");
        };
        assert!(content_type.starts_with("text/plain"));
        assert!(error.duration().is_some());
    }

    #[tokio::test]
    async fn fails_on_unreachable_endpoint() {
        let server = TestServer::new().await;
        let url = server.url("/infer");
        drop(server);
        // Give the aborted server task a moment to release the socket.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let error = remote(url).infer(&request()).await.unwrap_err();
        assert!(matches!(error, CheckError::Transport(_)), "{error:?}");
        assert_eq!(error.duration(), None);
    }

    #[tokio::test]
    async fn times_out() {
        let server = TestServer::with_behavior(Behavior {
            latency: Duration::from_secs(5),
            ..Default::default()
        })
        .await;
        let target = Target {
            url: server.url("/infer"),
            timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let remote = InferenceRemote::new(&target).unwrap();

        let error = remote.infer(&request()).await.unwrap_err();
        let CheckError::Transport(error) = error else {
            panic!("expected a transport error");
        };
        assert!(error.is_timeout());
    }
}
