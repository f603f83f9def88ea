use std::time::Duration;

use futures::future::join_all;
use negotiator_core::{Dispatched, Payload};
use reqwest::Client;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::err::{Error, Result};

use super::DependencyWaiter;

// Consts

const SUCCESS_MARKER: &str = "success";

// WaitArgs

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WaitArgs {
    pub max_poll_interval: Duration,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitArgs {
    fn default() -> Self {
        Self {
            max_poll_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(300),
        }
    }
}

// HttpDependencyWaiter

/// Polls the watch URL of each dependency until it reports success.
///
/// Certificates are not verified: watch URLs usually point at cluster endpoints with self-signed certificates.
pub struct HttpDependencyWaiter {
    args: WaitArgs,
    client: Client,
}

impl HttpDependencyWaiter {
    pub fn new(args: WaitArgs) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self { args, client })
    }

    async fn poll(&self, dep: &Dispatched, token: &str) -> reqwest::Result<bool> {
        let body = self
            .client
            .get(&dep.watch_url)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body.to_lowercase().contains(SUCCESS_MARKER))
    }

    #[instrument(skip(self, dep, token), fields(deployment.name = %dep.deployment_name, watch.url = %dep.watch_url))]
    async fn wait_for(&self, dep: &Dispatched, token: &str) -> std::result::Result<(), String> {
        let deadline = Instant::now() + self.args.timeout;
        let mut delay = self.args.poll_interval;
        let mut last_err = None;
        loop {
            match timeout_at(deadline, self.poll(dep, token)).await {
                Ok(Ok(true)) => {
                    info!("dependency is ready");
                    return Ok(());
                }
                Ok(Ok(false)) => {
                    debug!("dependency is not ready yet");
                    last_err = None;
                }
                Ok(Err(err)) => {
                    warn!("failed to poll dependency: {err}");
                    last_err = Some(err.to_string());
                }
                Err(_) => break,
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(self.args.max_poll_interval);
        }
        warn!("dependency not ready in time");
        let msg = format!("Failed to deploy dependency: {}", dep.deployment_name);
        Err(match last_err {
            Some(err) => format!("{msg}: {err}"),
            None => msg,
        })
    }
}

impl DependencyWaiter for HttpDependencyWaiter {
    #[instrument(skip(self, deps, payload), fields(dependencies = deps.len()))]
    async fn wait(&self, deps: &[Dispatched], payload: &Payload) -> Result {
        let token = payload.target.token.as_str();
        let errs: Vec<String> = join_all(deps.iter().map(|dep| self.wait_for(dep, token)))
            .await
            .into_iter()
            .filter_map(|res| res.err())
            .collect();
        if errs.is_empty() {
            Ok(())
        } else {
            Err(Error::Dependencies(errs))
        }
    }
}

// Tests
