//! Clients for the Slurm REST API (slurmrestd)
//!
//! Only the controller ping endpoint is used. A client also runs a
//! background loop that keeps pinging until it is stopped, so readiness
//! transitions show up in the logs even between reconciles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use slurm_common::Error;

/// Header carrying the Slurm JWT
pub const TOKEN_HEADER: &str = "X-SLURM-USER-TOKEN";

/// Path of the controller ping endpoint
pub const PING_PATH: &str = "/slurm/v0.0.43/ping";

/// `pinged` value of a responsive controller
pub const PINGED_UP: &str = "UP";

/// Default interval between background pings
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Default timeout for a single REST request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One controller's answer to a ping
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct PingResult {
    /// Controller host
    #[serde(default)]
    pub hostname: String,
    /// `UP` or `DOWN`
    #[serde(default)]
    pub pinged: String,
    /// Round trip in microseconds
    #[serde(default)]
    pub latency: Option<i64>,
    /// `primary`, `backup`, ...
    #[serde(default)]
    pub mode: Option<String>,
}

impl PingResult {
    /// True if the controller answered
    pub fn is_up(&self) -> bool {
        self.pinged == PINGED_UP
    }
}

#[derive(Debug, Deserialize)]
struct PingResponse {
    #[serde(default)]
    pings: Vec<PingResult>,
}

/// A live connection to one Slurm cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SlurmClient: Send + Sync {
    /// Base URL the client talks to
    fn server(&self) -> String;

    /// JWT the client authenticates with
    fn token(&self) -> String;

    /// Run the background refresh loop until [`SlurmClient::stop`]
    async fn start(&self);

    /// Stop the background loop; calling it again has no effect
    fn stop(&self);

    /// Ping every controller of the cluster.
    ///
    /// An endpoint that answers 404 or 204 yields an empty list.
    async fn list_pings(&self) -> Result<Vec<PingResult>, Error>;
}

/// Builds clients for a server and token
#[cfg_attr(test, automock)]
pub trait SlurmClientFactory: Send + Sync {
    /// Create a client; it is not started
    fn create(&self, server: &str, token: &str) -> Result<Arc<dyn SlurmClient>, Error>;
}

/// Tuning shared by every REST client
#[derive(Clone, Copy, Debug)]
pub struct SlurmClientConfig {
    /// Interval between background pings
    pub refresh_interval: Duration,
    /// Timeout for a single request
    pub request_timeout: Duration,
}

impl Default for SlurmClientConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// reqwest-backed client for slurmrestd
pub struct RestSlurmClient {
    server: String,
    token: String,
    http: reqwest::Client,
    refresh_interval: Duration,
    cancel: CancellationToken,
    health: watch::Sender<Option<bool>>,
}

impl RestSlurmClient {
    /// Create a client for `server` authenticating with `token`
    pub fn new(server: &str, token: &str, config: SlurmClientConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::slurm(server, format!("failed to build HTTP client: {e}"), None))?;
        let (health, _) = watch::channel(None);
        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            token: token.to_string(),
            http,
            refresh_interval: config.refresh_interval,
            cancel: CancellationToken::new(),
            health,
        })
    }

    /// Last health seen by the background loop; `None` before the first ping
    pub fn health(&self) -> watch::Receiver<Option<bool>> {
        self.health.subscribe()
    }

    fn ping_url(&self) -> String {
        format!("{}{}", self.server, PING_PATH)
    }

    async fn refresh(&self) {
        let up = match self.list_pings().await {
            Ok(pings) => pings.iter().any(PingResult::is_up),
            Err(e) => {
                debug!(server = %self.server, error = %e, "Background ping failed");
                false
            }
        };
        let previous = self.health.send_replace(Some(up));
        if previous != Some(up) {
            if up {
                info!(server = %self.server, "Slurm controller is up");
            } else {
                warn!(server = %self.server, "Slurm controller is not responding");
            }
        }
    }
}

#[async_trait]
impl SlurmClient for RestSlurmClient {
    fn server(&self) -> String {
        self.server.clone()
    }

    fn token(&self) -> String {
        self.token.clone()
    }

    async fn start(&self) {
        let mut ticker = tokio::time::interval(self.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(server = %self.server, "Starting Slurm client refresh loop");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(server = %self.server, "Slurm client stopped");
                    break;
                }
                _ = ticker.tick() => self.refresh().await,
            }
        }
    }

    fn stop(&self) {
        self.cancel.cancel();
    }

    async fn list_pings(&self) -> Result<Vec<PingResult>, Error> {
        let response = self
            .http
            .get(self.ping_url())
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await
            .map_err(|e| Error::slurm(&self.server, format!("request failed: {e}"), None))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(Error::slurm(
                &self.server,
                format!("ping returned HTTP {status}"),
                Some(status.as_u16()),
            ));
        }

        let body: PingResponse = response
            .json()
            .await
            .map_err(|e| Error::slurm(&self.server, format!("invalid ping response: {e}"), None))?;
        Ok(body.pings)
    }
}

/// Factory for [`RestSlurmClient`]s sharing one configuration
#[derive(Clone, Copy, Debug, Default)]
pub struct RestClientFactory {
    config: SlurmClientConfig,
}

impl RestClientFactory {
    /// Create a factory handing `config` to every client
    pub fn new(config: SlurmClientConfig) -> Self {
        Self { config }
    }
}

impl SlurmClientFactory for RestClientFactory {
    fn create(&self, server: &str, token: &str) -> Result<Arc<dyn SlurmClient>, Error> {
        Ok(Arc::new(RestSlurmClient::new(server, token, self.config)?))
    }
}
