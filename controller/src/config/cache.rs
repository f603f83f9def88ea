use k8s_openapi::api::apps::v1::Deployment;
use negotiator_core::{
    status::{StatusKind, StatusPublisher},
    ServiceKind,
};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::err::Result;

use super::{is_own_deployment, job::JobWatcher, rewrite_env, Configurer, Reporter};

// Consts

pub const CACHE_HOST: &str = "data-cache";
pub const ENV_REDIS_HOST: &str = "FH_REDIS_HOST";

// CacheConfigurer

/// Points apps at the in-namespace cache. No job is involved.
pub struct CacheConfigurer<PUBLISHER: StatusPublisher> {
    reporter: Reporter<PUBLISHER>,
}

impl<PUBLISHER: StatusPublisher> CacheConfigurer<PUBLISHER> {
    pub fn new(reporter: Reporter<PUBLISHER>) -> Self {
        Self { reporter }
    }
}

impl<PUBLISHER: StatusPublisher> Configurer for CacheConfigurer<PUBLISHER> {
    #[instrument(skip(self, _ns, deployment))]
    async fn configure(
        &self,
        _ns: &str,
        deployment: &Mutex<Deployment>,
    ) -> Result<Option<JobWatcher>> {
        let mut deployment = deployment.lock().await;
        if is_own_deployment(&deployment, ServiceKind::Cache) {
            self.reporter.publish(
                StatusKind::InProgress,
                "no need to configure own cache deployment",
            );
            return Ok(None);
        }
        if rewrite_env(&mut deployment, ENV_REDIS_HOST, CACHE_HOST) {
            debug!("cache host updated");
            self.reporter.publish(
                StatusKind::InProgress,
                format!("updated env var {ENV_REDIS_HOST} to {CACHE_HOST}"),
            );
        } else {
            debug!("cache host already up to date");
        }
        Ok(None)
    }
}

// Tests
