use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use negotiator_core::{
    kube::KubeClient,
    status::{StatusKind, StatusPublisher},
    ServiceKind, LABEL_GUID,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::{
    err::{Error, Result},
    pwd::PasswordGenerator,
    renderer::Renderer,
    template::{TemplateLoader, JOB_TEMPLATE_MONGO},
};

use super::{
    container_env,
    db::{job_name, quoted, DatabaseJobs},
    is_own_deployment,
    job::JobWatcher,
    label, upsert_env, Configurer,
};

// Consts

pub const ENV_ADMIN_PASSWORD: &str = "MONGODB_ADMIN_PASSWORD";
pub const ENV_CONN_URL: &str = "FH_MONGODB_CONN_URL";
pub const ENV_REPLICA_NAME: &str = "MONGODB_REPLICA_NAME";

const ADMIN_USER: &str = "admin";
const KIND: ServiceKind = ServiceKind::DataMongo;
const PORT: u16 = 27017;

// MongoConfigurer

pub struct MongoConfigurer<
    KUBE: KubeClient,
    LOADER: TemplateLoader,
    PASSWORDGENERATOR: PasswordGenerator,
    PUBLISHER: StatusPublisher,
    RENDERER: Renderer,
> {
    jobs: DatabaseJobs<KUBE, LOADER, PUBLISHER, RENDERER>,
    password_generator: Arc<PASSWORDGENERATOR>,
}

impl<
        KUBE: KubeClient,
        LOADER: TemplateLoader,
        PASSWORDGENERATOR: PasswordGenerator,
        PUBLISHER: StatusPublisher + 'static,
        RENDERER: Renderer,
    > MongoConfigurer<KUBE, LOADER, PASSWORDGENERATOR, PUBLISHER, RENDERER>
{
    pub fn new(
        jobs: DatabaseJobs<KUBE, LOADER, PUBLISHER, RENDERER>,
        password_generator: Arc<PASSWORDGENERATOR>,
    ) -> Self {
        Self {
            jobs,
            password_generator,
        }
    }

    async fn run(&self, ns: &str, deployment: &Mutex<Deployment>) -> Result<Option<JobWatcher>> {
        let reporter = self.jobs.reporter();
        let (name, guid) = {
            let deployment = deployment.lock().await;
            if is_own_deployment(&deployment, KIND) {
                reporter.publish(
                    StatusKind::InProgress,
                    format!("no need to configure own {KIND} deployment"),
                );
                return Ok(None);
            }
            let name = deployment
                .metadata
                .name
                .clone()
                .ok_or(Error::UnnamedResource)?;
            let guid = label(&deployment, LABEL_GUID)
                .filter(|guid| !guid.is_empty())
                .map(String::from);
            (name, guid)
        };
        reporter.publish(
            StatusKind::InProgress,
            format!("starting configuration of {KIND} service for {name}"),
        );
        let data = self.jobs.find_service_deployment(ns).await?;
        let svc = self.jobs.find_service(ns).await?;
        let dbhost = svc.metadata.name.ok_or(Error::UnnamedResource)?;
        let job_name = job_name(&name);
        if self.jobs.job_exists(ns, &job_name).await? {
            debug!(job.name = %job_name, "job already exists");
            reporter.publish(
                StatusKind::Succeeded,
                format!("configuration job {job_name} already exists, no need to run it again"),
            );
            return Ok(None);
        }
        let admin_password =
            container_env(&data, ENV_ADMIN_PASSWORD).ok_or(Error::MissingEnv(ENV_ADMIN_PASSWORD))?;
        let replica_set = container_env(&data, ENV_REPLICA_NAME).filter(|rs| !rs.is_empty());
        let database = guid.unwrap_or_else(|| name.clone());
        let password = self.password_generator.generate()?;
        let url = connection_url(&database, &password, &dbhost, replica_set.as_deref());
        upsert_env(&mut *deployment.lock().await, ENV_CONN_URL, &url);
        reporter.publish(
            StatusKind::InProgress,
            format!("updated env var {ENV_CONN_URL}"),
        );
        let vars = JobVariables {
            admin_password: quoted(&admin_password),
            admin_user: quoted(ADMIN_USER),
            database: quoted(&database),
            database_password: quoted(&password),
            database_user: quoted(&database),
            dbhost: quoted(&dbhost),
            job_name,
            name,
            replica_set: replica_set.as_deref().map(quoted),
        };
        let watcher = self.jobs.submit(ns, JOB_TEMPLATE_MONGO, &vars).await?;
        reporter.publish(
            StatusKind::InProgress,
            format!("{KIND} configuration job {} started", vars.job_name),
        );
        Ok(Some(watcher))
    }
}

impl<
        KUBE: KubeClient,
        LOADER: TemplateLoader,
        PASSWORDGENERATOR: PasswordGenerator,
        PUBLISHER: StatusPublisher + 'static,
        RENDERER: Renderer,
    > Configurer for MongoConfigurer<KUBE, LOADER, PASSWORDGENERATOR, PUBLISHER, RENDERER>
{
    #[instrument(skip(self, ns, deployment), fields(resource.namespace = ns, service.kind = %KIND))]
    async fn configure(
        &self,
        ns: &str,
        deployment: &Mutex<Deployment>,
    ) -> Result<Option<JobWatcher>> {
        self.run(ns, deployment).await.inspect_err(|err| {
            self.jobs
                .reporter()
                .publish(StatusKind::Failed, format!("failed to configure {KIND}: {err}"))
        })
    }
}

// Functions

fn connection_url(database: &str, password: &str, host: &str, replica_set: Option<&str>) -> String {
    let url = format!("mongodb://{database}:{password}@{host}:{PORT}/{database}");
    match replica_set {
        Some(rs) => format!("{url}?replicaSet={rs}"),
        None => url,
    }
}

// JobVariables

/// Env values are pre-quoted YAML scalars.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobVariables {
    admin_password: String,
    admin_user: String,
    database: String,
    database_password: String,
    database_user: String,
    dbhost: String,
    job_name: String,
    name: String,
    replica_set: Option<String>,
}

// Tests
