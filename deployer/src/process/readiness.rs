//! Readiness polling
//!
//! A TCP connect every poll interval, then an HTTP(S) request once the port
//! accepts connections. 200, 302 and 401 all count as serving: the GUI
//! answers unauthenticated requests with a login redirect or a challenge.

use std::time::Duration;

use reqwest::{redirect, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::errors::DeployError;

/// Interval between TCP connection attempts
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const READY_STATUSES: [StatusCode; 3] = [StatusCode::OK, StatusCode::FOUND, StatusCode::UNAUTHORIZED];

/// Outcome of a readiness wait
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessResult {
    pub ready: bool,
    pub url: String,
}

/// Polls a local port until the service behind it answers
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    client: Client,
    scheme: String,
    host: String,
    poll_interval: Duration,
}

impl ReadinessProbe {
    /// `scheme` is `http` or `https`; certificates are not validated since
    /// the server generates a self-signed one
    pub fn new(scheme: &str) -> Result<Self, DeployError> {
        if scheme != "http" && scheme != "https" {
            return Err(DeployError::ConfigurationError(format!(
                "Unsupported readiness scheme '{}'",
                scheme
            )));
        }

        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(redirect::Policy::none())
            .timeout(PROBE_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            scheme: scheme.to_string(),
            host: "127.0.0.1".to_string(),
            poll_interval: POLL_INTERVAL,
        })
    }

    pub fn with_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn url(&self, port: u16) -> String {
        format!("{}://{}:{}/", self.scheme, self.host, port)
    }

    /// Wait until `port` serves, for at most `timeout`.
    ///
    /// Never returns an error: a service that is not up in time yields
    /// `ready: false`.
    pub async fn wait_for_readiness(&self, port: u16, timeout: Duration) -> ReadinessResult {
        let url = self.url(port);
        info!("Waiting up to {:?} for {}", timeout, url);

        let ready = match tokio::time::timeout(timeout, self.poll(port, &url)).await {
            Ok(()) => true,
            Err(_) => {
                warn!("{} not ready after {:?}", url, timeout);
                false
            }
        };

        ReadinessResult { ready, url }
    }

    async fn poll(&self, port: u16, url: &str) {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let connect = TcpStream::connect((self.host.as_str(), port));
            match tokio::time::timeout(self.poll_interval, connect).await {
                Ok(Ok(_)) => {
                    if self.probe(url).await {
                        info!("{} ready after {} attempt(s)", url, attempt);
                        return;
                    }
                }
                Ok(Err(e)) => debug!("Port {} not accepting connections: {}", port, e),
                Err(_) => debug!("Connect to port {} timed out", port),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn probe(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) if READY_STATUSES.contains(&response.status()) => true,
            Ok(response) => {
                debug!("{} answered {}", url, response.status());
                false
            }
            Err(e) => {
                debug!("Probe of {} failed: {}", url, e);
                false
            }
        }
    }
}
