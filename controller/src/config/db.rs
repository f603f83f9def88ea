use std::sync::Arc;

use k8s_openapi::api::{apps::v1::Deployment, batch::v1::Job, core::v1::Service};
use negotiator_core::{
    kube::{selector, KubeClient},
    status::StatusPublisher,
    ServiceKind, LABEL_NAME,
};
use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::{
    err::{Error, Result},
    renderer::Renderer,
    template::TemplateLoader,
};

use super::{job, job::JobWatcher, Reporter};

// Functions

pub fn job_name(deployment: &str) -> String {
    format!("{deployment}-dataconfig-job")
}

/// Renders `value` as a double-quoted YAML scalar, so job templates can interpolate it as is.
pub fn quoted(value: &str) -> String {
    serde_json::Value::String(value.into()).to_string()
}

// DatabaseJobs

/// Cluster lookups and job submission shared by database configurers.
pub struct DatabaseJobs<
    KUBE: KubeClient,
    LOADER: TemplateLoader,
    PUBLISHER: StatusPublisher,
    RENDERER: Renderer,
> {
    kind: ServiceKind,
    kube: Arc<KUBE>,
    loader: Arc<LOADER>,
    renderer: Arc<RENDERER>,
    reporter: Reporter<PUBLISHER>,
}

impl<KUBE: KubeClient, LOADER: TemplateLoader, PUBLISHER: StatusPublisher, RENDERER: Renderer>
    DatabaseJobs<KUBE, LOADER, PUBLISHER, RENDERER>
{
    pub fn new(
        kind: ServiceKind,
        kube: Arc<KUBE>,
        loader: Arc<LOADER>,
        renderer: Arc<RENDERER>,
        reporter: Reporter<PUBLISHER>,
    ) -> Self {
        Self {
            kind,
            kube,
            loader,
            renderer,
            reporter,
        }
    }

    pub fn reporter(&self) -> &Reporter<PUBLISHER> {
        &self.reporter
    }

    pub async fn find_service(&self, ns: &str) -> Result<Service> {
        let sel = selector(&[(LABEL_NAME, self.kind.name())]);
        self.kube
            .list_from::<Service>(ns, &sel)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::ServiceNotFound(self.kind))
    }

    pub async fn find_service_deployment(&self, ns: &str) -> Result<Deployment> {
        let sel = selector(&[(LABEL_NAME, self.kind.name())]);
        self.kube
            .list_from::<Deployment>(ns, &sel)
            .await?
            .into_iter()
            .next()
            .ok_or(Error::ServiceDeploymentNotFound(self.kind))
    }

    pub async fn job_exists(&self, ns: &str, name: &str) -> Result<bool> {
        let job = self.kube.get_from::<Job>(ns, name).await?;
        Ok(job.is_some())
    }

    #[instrument(skip(self, ns, vars), fields(resource.namespace = ns, service.kind = %self.kind))]
    pub async fn submit<VARIABLES: Serialize + 'static>(
        &self,
        ns: &str,
        tpl: &str,
        vars: &VARIABLES,
    ) -> Result<JobWatcher>
    where
        PUBLISHER: 'static,
    {
        let src = self.loader.load(tpl)?;
        let mut yaml = vec![];
        self.renderer.render(&src, vars, &mut yaml)?;
        let job: Job = serde_yaml::from_slice(&yaml).map_err(Error::JobDecode)?;
        let name = job.metadata.name.clone().ok_or(Error::UnnamedResource)?;
        debug!(job.name = %name, "creating job");
        self.kube
            .create_from(ns, &job)
            .await
            .map_err(Error::JobSubmission)?;
        let events = self.kube.watch_job(ns, &name).await?;
        info!(job.name = %name, "configuration job started");
        Ok(job::spawn(events, self.reporter.clone(), self.kind, &name))
    }
}

// Tests
