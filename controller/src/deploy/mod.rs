use std::{collections::BTreeMap, future::Future};

use k8s_openapi::api::{apps::v1::Deployment, core::v1::Service};
use negotiator_core::{Dispatched, Payload, ANNOTATION_DEPENDENCIES};
use tracing::{debug, instrument, warn};

use crate::err::{Error, Result};

// Mods

pub mod template;
pub mod wait;

// Data structs

/// Rendered service template: the deployment and the services exposing it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Template {
    pub annotations: BTreeMap<String, String>,
    pub deployment: Deployment,
    pub name: String,
    pub services: Vec<Service>,
}

impl Template {
    /// Names of the templates this one depends on, from the whitespace-separated annotation.
    pub fn dependencies(&self) -> Vec<&str> {
        self.annotations
            .get(ANNOTATION_DEPENDENCIES)
            .map(|deps| deps.split_whitespace().collect())
            .unwrap_or_default()
    }
}

// Traits

#[cfg_attr(test, mockall::automock)]
pub trait Deployer: Send + Sync {
    fn dispatch(&self, ns: &str, tpl: &Template)
        -> impl Future<Output = Result<Dispatched>> + Send;

    fn load(&self, ns: &str, name: &str, payload: &Payload) -> Result<Template>;
}

#[cfg_attr(test, mockall::automock)]
pub trait DependencyWaiter: Send + Sync {
    fn wait(
        &self,
        deps: &[Dispatched],
        payload: &Payload,
    ) -> impl Future<Output = Result> + Send;
}

// Functions

/// Loads and dispatches every dependency of `tpl`, in annotation order.
///
/// On failure, dependencies already dispatched are returned inside the error.
#[instrument(skip(deployer, tpl, payload), fields(template.name = %tpl.name, resource.namespace = ns))]
pub async fn deploy_dependency_services<DEPLOYER: Deployer>(
    deployer: &DEPLOYER,
    tpl: &Template,
    ns: &str,
    payload: &Payload,
) -> Result<Vec<Dispatched>> {
    let mut dispatched = vec![];
    for name in tpl.dependencies() {
        debug!(dependency = name, "dispatching dependency");
        let res = match deployer.load(ns, name, payload) {
            Ok(dep) => deployer.dispatch(ns, &dep).await,
            Err(err) => Err(err),
        };
        match res {
            Ok(dep) => dispatched.push(dep),
            Err(err) => {
                warn!(dependency = name, "failed to dispatch dependency: {err}");
                return Err(Error::DependencyDispatch {
                    dispatched,
                    name: name.into(),
                    source: Box::new(err),
                });
            }
        }
    }
    Ok(dispatched)
}

// Tests
