//! Chaos-injection wrapper around an outbound HTTP transport.

use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ChaosConfig;
use crate::error::Result;

/// Status/headers/body captured from a downstream call, with status
/// rewritable independent of the body -- `reqwest::Response` does not
/// allow mutating its status in place.
pub struct ChaosResponse {
    pub status: StatusCode,
    pub headers: reqwest::header::HeaderMap,
    pub body: bytes::Bytes,
}

#[derive(Clone)]
pub struct ChaosTransport {
    client: reqwest::Client,
    config: ChaosConfig,
}

impl ChaosTransport {
    pub fn new(client: reqwest::Client, config: ChaosConfig) -> Self {
        Self { client, config }
    }

    /// Access to the wrapped client for building requests before handing
    /// them to `send` -- the transport itself has no request-building API.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Sends `req`, possibly delaying beforehand and rewriting a successful
    /// status to 500 afterward. Never retries; never mutates the request.
    pub async fn send(
        &self,
        req: reqwest::Request,
        cancel: &CancellationToken,
    ) -> Result<ChaosResponse> {
        self.maybe_delay(cancel).await;

        let response = self.client.execute(req).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        let status = if status.is_success() && self.should_inject_error() {
            debug!("chaos: rewriting {status} to 500");
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            status
        };

        Ok(ChaosResponse {
            status,
            headers,
            body,
        })
    }

    async fn maybe_delay(&self, cancel: &CancellationToken) {
        if self.config.delay_rate <= 0.0 || self.config.max_delay_ms == 0 {
            return;
        }
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() >= self.config.delay_rate {
            return;
        }
        let delay_ms = rng.gen_range(0..self.config.max_delay_ms);
        debug!("chaos: injecting {delay_ms}ms delay");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            _ = cancel.cancelled() => {}
        }
    }

    fn should_inject_error(&self) -> bool {
        if self.config.error_rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < self.config.error_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(error_rate: f64, delay_rate: f64, max_delay_ms: u64) -> ChaosConfig {
        ChaosConfig {
            error_rate,
            delay_rate,
            max_delay_ms,
        }
    }

    #[tokio::test]
    async fn zero_delay_rate_never_sleeps() {
        let transport = ChaosTransport::new(reqwest::Client::new(), config(0.0, 0.0, 500));
        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();
        transport.maybe_delay(&cancel).await;
        assert!(start.elapsed() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn full_delay_rate_sleeps_within_bound() {
        let transport = ChaosTransport::new(reqwest::Client::new(), config(0.0, 1.0, 50));
        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();
        transport.maybe_delay(&cancel).await;
        assert!(start.elapsed() < Duration::from_millis(60));
    }

    #[tokio::test]
    async fn delay_honors_cancellation() {
        let transport = ChaosTransport::new(reqwest::Client::new(), config(0.0, 1.0, 10_000));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = std::time::Instant::now();
        transport.maybe_delay(&cancel).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn error_rate_zero_never_injects() {
        let transport = ChaosTransport::new(reqwest::Client::new(), config(0.0, 0.0, 0));
        for _ in 0..100 {
            assert!(!transport.should_inject_error());
        }
    }

    #[test]
    fn error_rate_one_always_injects() {
        let transport = ChaosTransport::new(reqwest::Client::new(), config(1.0, 0.0, 0));
        for _ in 0..100 {
            assert!(transport.should_inject_error());
        }
    }
}
