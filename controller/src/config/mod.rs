use std::{collections::HashSet, future::Future, sync::Arc};

use futures::future::join_all;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Container, EnvVar},
};
use negotiator_core::{
    kube::{selector, KubeClient},
    status::{status_key, StatusKind, StatusPublisher},
    Configuration, ServiceKind, LABEL_NAME, LABEL_TYPE, TYPE_ENVIRONMENT_SERVICE,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{
    err::{Error, Result},
    pwd::PasswordGenerator,
    renderer::Renderer,
    template::TemplateLoader,
};

use self::{
    cache::CacheConfigurer,
    db::DatabaseJobs,
    job::JobWatcher,
    mongo::MongoConfigurer,
    mysql::MysqlConfigurer,
};

// Mods

pub mod cache;
pub mod db;
pub mod job;
pub mod mongo;
pub mod mysql;

// Consts

const PERSIST_ATTEMPTS: u32 = 3;

// Traits

/// Adapts an app deployment so it can reach one kind of environment service.
///
/// Mutations are applied to the shared deployment; persisting it is up to the caller.
/// Configurers that start a job return the handle of the task watching it.
#[cfg_attr(test, mockall::automock)]
pub trait Configurer: Send + Sync {
    fn configure(
        &self,
        ns: &str,
        deployment: &tokio::sync::Mutex<Deployment>,
    ) -> impl Future<Output = Result<Option<JobWatcher>>> + Send;
}

#[cfg_attr(test, mockall::automock(type Configurer = MockConfigurer;))]
pub trait ConfigurerFactory: Send + Sync {
    type Configurer: Configurer;

    fn build(&self, kind: ServiceKind, config: &Configuration) -> Self::Configurer;
}

#[cfg_attr(test, mockall::automock)]
pub trait ServiceConfigurator: Send + Sync {
    fn configure(&self, config: &Configuration) -> impl Future<Output = Result> + Send;
}

// Reporter

/// Publishes statuses under a single key. Publication failures are logged, never propagated.
pub struct Reporter<PUBLISHER: StatusPublisher> {
    key: String,
    publisher: Arc<PUBLISHER>,
}

impl<PUBLISHER: StatusPublisher> Reporter<PUBLISHER> {
    pub fn new(publisher: Arc<PUBLISHER>, key: String) -> Self {
        Self { key, publisher }
    }

    pub fn clear(&self) {
        if let Err(err) = self.publisher.clear(&self.key) {
            warn!(status.key = %self.key, "failed to clear status: {err}");
        }
    }

    pub fn publish<DESCRIPTION: AsRef<str>>(&self, status: StatusKind, description: DESCRIPTION) {
        if let Err(err) = self
            .publisher
            .publish(&self.key, status, description.as_ref())
        {
            warn!(status.key = %self.key, "failed to publish status: {err}");
        }
    }
}

impl<PUBLISHER: StatusPublisher> Clone for Reporter<PUBLISHER> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            publisher: self.publisher.clone(),
        }
    }
}

// ConfigurationFactory

pub struct ConfigurationFactory<
    KUBE: KubeClient,
    LOADER: TemplateLoader,
    PASSWORDGENERATOR: PasswordGenerator,
    PUBLISHER: StatusPublisher,
    RENDERER: Renderer,
> {
    kube: Arc<KUBE>,
    loader: Arc<LOADER>,
    password_generator: Arc<PASSWORDGENERATOR>,
    publisher: Arc<PUBLISHER>,
    renderer: Arc<RENDERER>,
}

impl<
        KUBE: KubeClient,
        LOADER: TemplateLoader,
        PASSWORDGENERATOR: PasswordGenerator,
        PUBLISHER: StatusPublisher,
        RENDERER: Renderer,
    > ConfigurationFactory<KUBE, LOADER, PASSWORDGENERATOR, PUBLISHER, RENDERER>
{
    pub fn new(
        kube: Arc<KUBE>,
        loader: Arc<LOADER>,
        password_generator: Arc<PASSWORDGENERATOR>,
        publisher: Arc<PUBLISHER>,
        renderer: Arc<RENDERER>,
    ) -> Self {
        Self {
            kube,
            loader,
            password_generator,
            publisher,
            renderer,
        }
    }

    fn jobs(
        &self,
        kind: ServiceKind,
        reporter: Reporter<PUBLISHER>,
    ) -> DatabaseJobs<KUBE, LOADER, PUBLISHER, RENDERER> {
        DatabaseJobs::new(
            kind,
            self.kube.clone(),
            self.loader.clone(),
            self.renderer.clone(),
            reporter,
        )
    }
}

impl<
        KUBE: KubeClient + 'static,
        LOADER: TemplateLoader,
        PASSWORDGENERATOR: PasswordGenerator,
        PUBLISHER: StatusPublisher + 'static,
        RENDERER: Renderer,
    > ConfigurerFactory for ConfigurationFactory<KUBE, LOADER, PASSWORDGENERATOR, PUBLISHER, RENDERER>
{
    type Configurer = ServiceConfigurer<KUBE, LOADER, PASSWORDGENERATOR, PUBLISHER, RENDERER>;

    fn build(&self, kind: ServiceKind, config: &Configuration) -> Self::Configurer {
        let reporter = Reporter::new(
            self.publisher.clone(),
            status_key(&config.instance_id, config.action),
        );
        match kind {
            ServiceKind::Cache => ServiceConfigurer::Cache(CacheConfigurer::new(reporter)),
            ServiceKind::DataMongo => ServiceConfigurer::DataMongo(MongoConfigurer::new(
                self.jobs(kind, reporter),
                self.password_generator.clone(),
            )),
            ServiceKind::DataMysql => ServiceConfigurer::DataMysql(MysqlConfigurer::new(
                self.jobs(kind, reporter),
                self.password_generator.clone(),
            )),
        }
    }
}

// ServiceConfigurer

pub enum ServiceConfigurer<
    KUBE: KubeClient,
    LOADER: TemplateLoader,
    PASSWORDGENERATOR: PasswordGenerator,
    PUBLISHER: StatusPublisher,
    RENDERER: Renderer,
> {
    Cache(CacheConfigurer<PUBLISHER>),
    DataMongo(MongoConfigurer<KUBE, LOADER, PASSWORDGENERATOR, PUBLISHER, RENDERER>),
    DataMysql(MysqlConfigurer<KUBE, LOADER, PASSWORDGENERATOR, PUBLISHER, RENDERER>),
}

impl<
        KUBE: KubeClient + 'static,
        LOADER: TemplateLoader,
        PASSWORDGENERATOR: PasswordGenerator,
        PUBLISHER: StatusPublisher + 'static,
        RENDERER: Renderer,
    > Configurer for ServiceConfigurer<KUBE, LOADER, PASSWORDGENERATOR, PUBLISHER, RENDERER>
{
    async fn configure(
        &self,
        ns: &str,
        deployment: &Mutex<Deployment>,
    ) -> Result<Option<JobWatcher>> {
        match self {
            Self::Cache(configurer) => configurer.configure(ns, deployment).await,
            Self::DataMongo(configurer) => configurer.configure(ns, deployment).await,
            Self::DataMysql(configurer) => configurer.configure(ns, deployment).await,
        }
    }
}

// EnvironmentServiceConfigController

/// Configures an app deployment against every environment service of its namespace.
pub struct EnvironmentServiceConfigController<
    FACTORY: ConfigurerFactory,
    KUBE: KubeClient,
    PUBLISHER: StatusPublisher,
> {
    factory: FACTORY,
    kube: Arc<KUBE>,
    publisher: Arc<PUBLISHER>,
}

impl<FACTORY: ConfigurerFactory, KUBE: KubeClient, PUBLISHER: StatusPublisher>
    EnvironmentServiceConfigController<FACTORY, KUBE, PUBLISHER>
{
    pub fn new(factory: FACTORY, kube: Arc<KUBE>, publisher: Arc<PUBLISHER>) -> Self {
        Self {
            factory,
            kube,
            publisher,
        }
    }

    /// Writes the configured env onto the latest version of the deployment.
    ///
    /// The deployment keeps changing while jobs run, so it is read again before each write.
    async fn persist(&self, ns: &str, name: &str, configured: &Deployment) -> Result {
        let mut attempt = 1;
        loop {
            let mut latest = self
                .kube
                .get_from::<Deployment>(ns, name)
                .await
                .map_err(Error::Persist)?
                .ok_or_else(|| Error::DeploymentNotFound(name.into()))?;
            copy_env(configured, &mut latest);
            match self.kube.replace_from(ns, name, &latest).await {
                Ok(()) => return Ok(()),
                Err(err) if is_conflict(&err) && attempt < PERSIST_ATTEMPTS => {
                    debug!(attempt, "deployment changed while being persisted, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(Error::Persist(err)),
            }
        }
    }
}

impl<FACTORY: ConfigurerFactory, KUBE: KubeClient, PUBLISHER: StatusPublisher> ServiceConfigurator
    for EnvironmentServiceConfigController<FACTORY, KUBE, PUBLISHER>
{
    #[instrument(skip(self, config), fields(action = %config.action, deployment.name = %config.deployment_name, instance.id = %config.instance_id, resource.namespace = %config.namespace))]
    async fn configure(&self, config: &Configuration) -> Result {
        let ns = &config.namespace;
        let name = &config.deployment_name;
        let reporter = Reporter::new(
            self.publisher.clone(),
            status_key(&config.instance_id, config.action),
        );
        reporter.clear();
        let deployment = self
            .kube
            .get_from::<Deployment>(ns, name)
            .await
            .map_err(|source| Error::DeploymentRetrieval {
                name: name.clone(),
                source,
            })?
            .ok_or_else(|| Error::DeploymentNotFound(name.clone()))?;
        let sel = selector(&[(LABEL_TYPE, TYPE_ENVIRONMENT_SERVICE)]);
        let services = match self.kube.list_from::<Deployment>(ns, &sel).await {
            Ok(services) => services,
            Err(err) => {
                reporter.publish(
                    StatusKind::Failed,
                    format!(
                        "failed to retrieve environment service deployments during configuration of {name}: {err}"
                    ),
                );
                return Err(err.into());
            }
        };
        reporter.publish(
            StatusKind::InProgress,
            format!("found {} services", services.len()),
        );
        let configurers: Vec<_> = service_kinds(&services)
            .into_iter()
            .map(|kind| {
                debug!(service.kind = %kind, "configuring service");
                reporter.publish(StatusKind::InProgress, format!("configuring {kind}"));
                (kind, self.factory.build(kind, config))
            })
            .collect();
        let deployment = Mutex::new(deployment);
        let results = join_all(configurers.iter().map(|(kind, configurer)| {
            let deployment = &deployment;
            async move { (*kind, configurer.configure(ns, deployment).await) }
        }))
        .await;
        let mut errs = vec![];
        let mut watchers = vec![];
        for (kind, res) in results {
            match res {
                Ok(Some(watcher)) => watchers.push((kind, watcher)),
                Ok(None) => {}
                Err(err) => {
                    warn!(service.kind = %kind, "failed to configure service: {err}");
                    errs.push(err.to_string());
                }
            }
        }
        for (kind, watcher) in watchers {
            match watcher.await {
                Ok(outcome) if outcome.is_success() => {
                    debug!(service.kind = %kind, "configuration job succeeded");
                }
                Ok(outcome) => errs.push(format!("{kind} configuration job {outcome}")),
                Err(err) => errs.push(format!("{kind} configuration job watch failed: {err}")),
            }
        }
        let deployment = deployment.into_inner();
        if let Err(err) = self.persist(ns, name, &deployment).await {
            reporter.publish(StatusKind::Failed, err.to_string());
            return Err(err);
        }
        if !errs.is_empty() {
            let err = Error::Configuration(errs);
            reporter.publish(StatusKind::Failed, err.to_string());
            return Err(err);
        }
        reporter.publish(StatusKind::Succeeded, "service configuration complete");
        info!("deployment configured");
        Ok(())
    }
}

// Functions

pub(crate) fn container_env(deployment: &Deployment, name: &str) -> Option<String> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod| pod.containers.first())
        .and_then(|container| container.env.as_ref())
        .and_then(|env| env.iter().find(|var| var.name == name))
        .and_then(|var| var.value.clone())
}

/// Replaces the env of every container of `target` by the one of its namesake in `source`.
fn copy_env(source: &Deployment, target: &mut Deployment) {
    let containers = source
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| pod.containers.as_slice())
        .unwrap_or_default();
    for container in containers_mut(target) {
        if let Some(src) = containers.iter().find(|src| src.name == container.name) {
            container.env.clone_from(&src.env);
        }
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}

pub(crate) fn is_own_deployment(deployment: &Deployment, kind: ServiceKind) -> bool {
    label(deployment, LABEL_NAME) == Some(kind.name())
}

pub(crate) fn label<'a>(deployment: &'a Deployment, key: &str) -> Option<&'a str> {
    deployment
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

/// Sets `name` on every container, adding it where missing.
pub(crate) fn upsert_env(deployment: &mut Deployment, name: &str, value: &str) {
    for container in containers_mut(deployment) {
        let env = container.env.get_or_insert_with(Vec::new);
        match env.iter_mut().find(|var| var.name == name) {
            Some(var) => {
                var.value = Some(value.into());
                var.value_from = None;
            }
            None => env.push(EnvVar {
                name: name.into(),
                value: Some(value.into()),
                value_from: None,
            }),
        }
    }
}

/// Rewrites `name` where containers already define it. Returns whether something changed.
pub(crate) fn rewrite_env(deployment: &mut Deployment, name: &str, value: &str) -> bool {
    let mut changed = false;
    for container in containers_mut(deployment) {
        let vars = container.env.iter_mut().flatten();
        for var in vars.filter(|var| var.name == name) {
            if var.value.as_deref() != Some(value) {
                var.value = Some(value.into());
                changed = true;
            }
        }
    }
    changed
}

fn containers_mut(deployment: &mut Deployment) -> impl Iterator<Item = &mut Container> {
    deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .into_iter()
        .flat_map(|pod| pod.containers.iter_mut())
}

fn service_kinds(services: &[Deployment]) -> Vec<ServiceKind> {
    let mut configured = HashSet::new();
    let mut kinds = vec![];
    for svc in services {
        let Some(name) = label(svc, LABEL_NAME) else {
            warn!(
                deployment.name = svc.metadata.name.as_deref(),
                "environment service has no `{LABEL_NAME}` label, skipping"
            );
            continue;
        };
        match name.parse::<ServiceKind>() {
            Ok(kind) => {
                if configured.insert(kind) {
                    kinds.push(kind);
                }
            }
            Err(err) => warn!("{err}, skipping"),
        }
    }
    kinds
}

// Tests
