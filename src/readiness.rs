//! Readiness gate.
//!
//! Polls the provisioned endpoint until it accepts a TCP connection,
//! bounded by an overall deadline. This is a host-level check: a
//! listening sshd proves the machine booted, not that the deployed
//! application is serving. The optional HTTP probe covers the latter
//! after handoff.

use std::time::{Duration, Instant};

use reqwest::Client;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::{HttpProbeConfig, ReadinessConfig};
use crate::error::{GangwayError, ReadinessError, Result};

/// Upper bound on a single TCP connect attempt.
const CONNECT_ATTEMPT_SECS: u64 = 3;

/// Report of a successful readiness wait.
#[derive(Debug, Clone)]
pub struct ReadinessReport {
    /// Endpoint that accepted the connection.
    pub endpoint: String,
    /// Number of probe attempts made.
    pub attempts: u32,
    /// Total time waited.
    pub elapsed: Duration,
}

/// TCP readiness gate.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    /// Port to probe.
    port: u16,
    /// Interval between probes.
    interval: Duration,
    /// Overall deadline.
    timeout: Duration,
}

impl ReadinessGate {
    /// Creates a gate from the readiness configuration.
    #[must_use]
    pub const fn from_config(config: &ReadinessConfig) -> Self {
        Self {
            port: config.port,
            interval: Duration::from_secs(config.interval_secs),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }

    /// Creates a gate with explicit parameters.
    #[must_use]
    pub const fn new(port: u16, interval: Duration, timeout: Duration) -> Self {
        Self {
            port,
            interval,
            timeout,
        }
    }

    /// Waits until `host:port` accepts a TCP connection.
    ///
    /// Returns on the first accepted connection. The wait is always
    /// bounded: the deadline is checked before every attempt and each
    /// connect attempt is itself clamped to the remaining budget.
    ///
    /// # Errors
    ///
    /// Returns `ReadinessError::Timeout` when the deadline passes
    /// without an accepted connection.
    pub async fn wait_for_tcp(&self, host: &str) -> Result<ReadinessReport> {
        let endpoint = format!("{host}:{}", self.port);
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut attempts: u32 = 0;

        info!(
            "Waiting up to {}s for {endpoint} to accept connections",
            self.timeout.as_secs()
        );

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(self.timeout_error(&endpoint, attempts));
            }

            attempts += 1;
            let attempt_budget =
                Duration::from_secs(CONNECT_ATTEMPT_SECS).min(deadline - now);

            match tokio::time::timeout(attempt_budget, TcpStream::connect(&endpoint)).await {
                Ok(Ok(_stream)) => {
                    let elapsed = start.elapsed();
                    info!(
                        "{endpoint} accepted a connection after {attempts} attempts ({:.1}s)",
                        elapsed.as_secs_f64()
                    );
                    return Ok(ReadinessReport {
                        endpoint,
                        attempts,
                        elapsed,
                    });
                }
                Ok(Err(e)) => {
                    debug!("Probe {attempts} of {endpoint} refused: {e}");
                }
                Err(_) => {
                    debug!("Probe {attempts} of {endpoint} timed out");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timeout_error(&endpoint, attempts));
            }

            let sleep = self.interval.min(deadline - now);
            tokio::time::sleep(sleep).await;
        }
    }

    /// Builds the timeout error for an endpoint.
    fn timeout_error(&self, endpoint: &str, attempts: u32) -> GangwayError {
        warn!("{endpoint} not ready within {}s", self.timeout.as_secs());
        GangwayError::Readiness(ReadinessError::Timeout {
            endpoint: endpoint.to_string(),
            timeout_secs: self.timeout.as_secs(),
            attempts,
        })
    }
}

/// HTTP application probe.
#[derive(Debug)]
pub struct HttpProbe {
    /// HTTP client.
    client: Client,
    /// Probe configuration.
    config: HttpProbeConfig,
}

impl HttpProbe {
    /// Creates a probe from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn from_config(config: &HttpProbeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                GangwayError::Readiness(ReadinessError::Probe {
                    message: format!("Failed to create HTTP client: {e}"),
                })
            })?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Checks the application endpoint once.
    ///
    /// # Errors
    ///
    /// Returns a probe error when the request fails or the response is
    /// not a success status.
    pub async fn check(&self, host: &str) -> Result<u16> {
        let url = format!(
            "http://{host}:{}{}",
            self.config.port, self.config.path
        );
        debug!("HTTP probe: {url}");

        let response = self.client.get(&url).send().await.map_err(|e| {
            GangwayError::Readiness(ReadinessError::Probe {
                message: format!("HTTP probe of {url} failed: {e}"),
            })
        })?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(GangwayError::Readiness(ReadinessError::Probe {
                message: format!("HTTP probe of {url} returned {status}"),
            }))
        }
    }

    /// Waits until the application responds with a success status.
    ///
    /// # Errors
    ///
    /// Returns `ReadinessError::Timeout` when the deadline passes.
    pub async fn wait_for_ok(
        &self,
        host: &str,
        interval: Duration,
        timeout: Duration,
    ) -> Result<ReadinessReport> {
        let endpoint = format!("{host}:{}{}", self.config.port, self.config.path);
        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if self.check(host).await.is_ok() {
                return Ok(ReadinessReport {
                    endpoint,
                    attempts,
                    elapsed: start.elapsed(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(GangwayError::Readiness(ReadinessError::Timeout {
                    endpoint,
                    timeout_secs: timeout.as_secs(),
                    attempts,
                }));
            }

            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_tcp_gate_succeeds_on_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let port = listener.local_addr().expect("addr").port();

        // Keep the listener alive while probing
        let gate = ReadinessGate::new(
            port,
            Duration::from_millis(100),
            Duration::from_secs(5),
        );
        let report = gate
            .wait_for_tcp("127.0.0.1")
            .await
            .expect("gate should succeed");

        assert_eq!(report.attempts, 1);
        drop(listener);
    }

    #[tokio::test]
    async fn test_tcp_gate_times_out_within_bound() {
        // Port 1 on localhost refuses connections
        let timeout = Duration::from_millis(600);
        let gate = ReadinessGate::new(1, Duration::from_millis(100), timeout);

        let start = Instant::now();
        let result = gate.wait_for_tcp("127.0.0.1").await;
        let elapsed = start.elapsed();

        match result {
            Err(GangwayError::Readiness(ReadinessError::Timeout {
                timeout_secs,
                attempts,
                ..
            })) => {
                assert_eq!(timeout_secs, 0); // sub-second timeout rounds down
                assert!(attempts >= 1);
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        // Within the bound, never indefinite: allow one extra second of
        // slack for the final clamped attempt
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_tcp_gate_retries_until_endpoint_appears() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        // Rebind shortly after the gate starts probing
        let rebind = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            TcpListener::bind(addr).await.expect("rebind should succeed")
        });

        let gate = ReadinessGate::new(
            addr.port(),
            Duration::from_millis(50),
            Duration::from_secs(5),
        );
        let report = gate
            .wait_for_tcp("127.0.0.1")
            .await
            .expect("gate should succeed once the endpoint appears");

        assert!(report.attempts > 1);
        drop(rebind.await.expect("rebind task"));
    }

    #[tokio::test]
    async fn test_http_probe_ok() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let addr = server.address();
        let probe = HttpProbe::from_config(&HttpProbeConfig {
            path: String::from("/health"),
            port: addr.port(),
            timeout_secs: 2,
        })
        .expect("probe should build");

        let status = probe
            .check(&addr.ip().to_string())
            .await
            .expect("probe should succeed");
        assert_eq!(status, 200);
    }

    #[tokio::test]
    async fn test_http_probe_failure_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let addr = server.address();
        let probe = HttpProbe::from_config(&HttpProbeConfig {
            path: String::from("/health"),
            port: addr.port(),
            timeout_secs: 2,
        })
        .expect("probe should build");

        assert!(probe.check(&addr.ip().to_string()).await.is_err());
    }
}
