use std::{fmt::Debug, future::Future, pin::Pin};

use futures::{Stream, StreamExt};
use k8s_openapi::{api::batch::v1::Job, NamespaceResourceScope};
use kube::{
    api::{ListParams, Patch, PatchParams, PostParams, WatchEvent, WatchParams},
    Api, Client, Resource, Result,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, instrument};

// Consts

const MANAGER: &str = "negotiator";

// Types

pub type JobEventStream = Pin<Box<dyn Stream<Item = JobEvent> + Send>>;

// Events

/// Event observed on a watched job.
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    Added(Job),
    Deleted(Job),
    Error(String),
    Modified(Job),
}

// Traits

pub trait NamespacedResource:
    Clone
    + Debug
    + DeserializeOwned
    + Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Send
    + Serialize
    + Sync
{
}

impl<
        RESOURCE: Clone
            + Debug
            + DeserializeOwned
            + Resource<DynamicType = (), Scope = NamespaceResourceScope>
            + Send
            + Serialize
            + Sync,
    > NamespacedResource for RESOURCE
{
}

#[cfg_attr(feature = "mock", mockall::automock)]
pub trait KubeClient: Send + Sync {
    fn create_from<RESOURCE: NamespacedResource + 'static>(
        &self,
        ns: &str,
        res: &RESOURCE,
    ) -> impl Future<Output = Result<()>> + Send;

    fn get_from<RESOURCE: NamespacedResource + 'static>(
        &self,
        ns: &str,
        name: &str,
    ) -> impl Future<Output = Result<Option<RESOURCE>>> + Send;

    fn list_from<RESOURCE: NamespacedResource + 'static>(
        &self,
        ns: &str,
        sel: &str,
    ) -> impl Future<Output = Result<Vec<RESOURCE>>> + Send;

    fn patch_from<RESOURCE: NamespacedResource + 'static>(
        &self,
        ns: &str,
        name: &str,
        res: &RESOURCE,
    ) -> impl Future<Output = Result<()>> + Send;

    fn replace_from<RESOURCE: NamespacedResource + 'static>(
        &self,
        ns: &str,
        name: &str,
        res: &RESOURCE,
    ) -> impl Future<Output = Result<()>> + Send;

    fn watch_job(&self, ns: &str, name: &str)
        -> impl Future<Output = Result<JobEventStream>> + Send;
}

// DefaultKubeClient

pub struct DefaultKubeClient(Client);

impl DefaultKubeClient {
    pub fn new(kube: Client) -> Self {
        Self(kube)
    }
}

impl KubeClient for DefaultKubeClient {
    #[instrument(skip(self, ns, res), fields(resource.api_version = %RESOURCE::api_version(&()), resource.kind = %RESOURCE::kind(&()), resource.namespace = ns))]
    async fn create_from<RESOURCE: NamespacedResource>(&self, ns: &str, res: &RESOURCE) -> Result<()> {
        debug!("creating resource");
        let api: Api<RESOURCE> = Api::namespaced(self.0.clone(), ns);
        api.create(&PostParams::default(), res).await?;
        Ok(())
    }

    #[instrument(skip(self, ns, name), fields(resource.api_version = %RESOURCE::api_version(&()), resource.kind = %RESOURCE::kind(&()), resource.name = name, resource.namespace = ns))]
    async fn get_from<RESOURCE: NamespacedResource>(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<RESOURCE>> {
        debug!("getting resource");
        let api: Api<RESOURCE> = Api::namespaced(self.0.clone(), ns);
        api.get_opt(name).await
    }

    #[instrument(skip(self, ns, sel), fields(resource.api_version = %RESOURCE::api_version(&()), resource.kind = %RESOURCE::kind(&()), resource.namespace = ns, resource.selector = sel))]
    async fn list_from<RESOURCE: NamespacedResource>(
        &self,
        ns: &str,
        sel: &str,
    ) -> Result<Vec<RESOURCE>> {
        debug!("listing resources");
        let api: Api<RESOURCE> = Api::namespaced(self.0.clone(), ns);
        let params = ListParams {
            label_selector: Some(sel.into()),
            ..Default::default()
        };
        let list = api.list(&params).await?;
        Ok(list.items)
    }

    #[instrument(skip(self, ns, name, res), fields(resource.api_version = %RESOURCE::api_version(&()), resource.kind = %RESOURCE::kind(&()), resource.name = name, resource.namespace = ns))]
    async fn patch_from<RESOURCE: NamespacedResource>(
        &self,
        ns: &str,
        name: &str,
        res: &RESOURCE,
    ) -> Result<()> {
        debug!("applying resource");
        let api: Api<RESOURCE> = Api::namespaced(self.0.clone(), ns);
        let params = PatchParams::apply(MANAGER).force();
        api.patch(name, &params, &Patch::Apply(res)).await?;
        Ok(())
    }

    #[instrument(skip(self, ns, name, res), fields(resource.api_version = %RESOURCE::api_version(&()), resource.kind = %RESOURCE::kind(&()), resource.name = name, resource.namespace = ns))]
    async fn replace_from<RESOURCE: NamespacedResource>(
        &self,
        ns: &str,
        name: &str,
        res: &RESOURCE,
    ) -> Result<()> {
        debug!("replacing resource");
        let api: Api<RESOURCE> = Api::namespaced(self.0.clone(), ns);
        api.replace(name, &PostParams::default(), res).await?;
        Ok(())
    }

    #[instrument(skip(self, ns, name), fields(resource.kind = "Job", resource.name = name, resource.namespace = ns))]
    async fn watch_job(&self, ns: &str, name: &str) -> Result<JobEventStream> {
        debug!("watching job");
        let api: Api<Job> = Api::namespaced(self.0.clone(), ns);
        let params = WatchParams::default().fields(&format!("metadata.name={name}"));
        let stream = api.watch(&params, "0").await?.filter_map(|evt| async move {
            match evt {
                Ok(WatchEvent::Added(job)) => Some(JobEvent::Added(job)),
                Ok(WatchEvent::Modified(job)) => Some(JobEvent::Modified(job)),
                Ok(WatchEvent::Deleted(job)) => Some(JobEvent::Deleted(job)),
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(err)) => Some(JobEvent::Error(err.message)),
                Err(err) => Some(JobEvent::Error(err.to_string())),
            }
        });
        Ok(stream.boxed())
    }
}

// Functions

pub fn selector(sel: &[(&str, &str)]) -> String {
    sel.iter()
        .map(|(key, val)| format!("{key}={val}"))
        .reduce(|acc, sel| format!("{acc},{sel}"))
        .unwrap_or_default()
}

// Tests
