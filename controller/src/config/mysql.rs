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
    template::{TemplateLoader, JOB_TEMPLATE_MYSQL},
};

use super::{
    container_env,
    db::{job_name, quoted, DatabaseJobs},
    is_own_deployment,
    job::JobWatcher,
    label, upsert_env, Configurer,
};

// Consts

pub const ENV_DATABASE: &str = "MYSQL_DATABASE";
pub const ENV_PASSWORD: &str = "MYSQL_PASSWORD";
pub const ENV_ROOT_PASSWORD: &str = "MYSQL_ROOT_PASSWORD";
pub const ENV_USER: &str = "MYSQL_USER";

const ADMIN_DATABASE: &str = "mysql";
const ADMIN_USERNAME: &str = "root";
const KIND: ServiceKind = ServiceKind::DataMysql;
// MySQL rejects longer user names.
const USERNAME_MAX_LEN: usize = 16;

// MysqlConfigurer

pub struct MysqlConfigurer<
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
    > MysqlConfigurer<KUBE, LOADER, PASSWORDGENERATOR, PUBLISHER, RENDERER>
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
            (name, label(&deployment, LABEL_GUID).map(String::from))
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
            container_env(&data, ENV_ROOT_PASSWORD).ok_or(Error::MissingEnv(ENV_ROOT_PASSWORD))?;
        let guid = guid.ok_or_else(|| Error::MissingLabel {
            label: LABEL_GUID,
            name: name.clone(),
        })?;
        let database = if guid.is_empty() { name.clone() } else { guid };
        let username: String = database.chars().take(USERNAME_MAX_LEN).collect();
        let password = self.password_generator.generate()?;
        {
            let mut deployment = deployment.lock().await;
            upsert_env(&mut deployment, ENV_USER, &username);
            upsert_env(&mut deployment, ENV_PASSWORD, &password);
            upsert_env(&mut deployment, ENV_DATABASE, &database);
        }
        reporter.publish(
            StatusKind::InProgress,
            format!("updated env vars {ENV_USER}, {ENV_PASSWORD} and {ENV_DATABASE}"),
        );
        let vars = JobVariables {
            admin_database: quoted(ADMIN_DATABASE),
            admin_password: quoted(&admin_password),
            admin_username: quoted(ADMIN_USERNAME),
            dbhost: quoted(&dbhost),
            job_name,
            name,
            user_database: quoted(&database),
            user_password: quoted(&password),
            user_username: quoted(&username),
        };
        let watcher = self.jobs.submit(ns, JOB_TEMPLATE_MYSQL, &vars).await?;
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
    > Configurer for MysqlConfigurer<KUBE, LOADER, PASSWORDGENERATOR, PUBLISHER, RENDERER>
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

// JobVariables

/// Env values are pre-quoted YAML scalars.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct JobVariables {
    admin_database: String,
    admin_password: String,
    admin_username: String,
    dbhost: String,
    job_name: String,
    name: String,
    user_database: String,
    user_password: String,
    user_username: String,
}

// Tests

#[cfg(test)]
mod test {
    use futures::{stream, StreamExt};
    use k8s_openapi::api::{batch::v1::Job, core::v1::Service};
    use kube::api::ObjectMeta;
    use mockall::predicate::*;
    use negotiator_core::{
        kube::{selector, JobEvent, MockKubeClient},
        status::{MemoryStatusStore, StatusRetriever},
        LABEL_NAME,
    };

    use crate::{
        config::{job::JobOutcome, Reporter},
        pwd::MockPasswordGenerator,
        renderer::LiquidRenderer,
        template::DefaultTemplateLoader,
        test::*,
    };

    use super::*;

    // Data

    #[derive(Clone)]
    struct Data {
        app: Deployment,
        data: Vec<Deployment>,
    }

    impl Default for Data {
        fn default() -> Self {
            Self {
                app: deployment(
                    "app1",
                    &[(LABEL_GUID, "abcdefghijklmnopqrstuvwx")],
                    &[(ENV_USER, "stale")],
                ),
                data: vec![deployment(
                    "mysql",
                    &[(LABEL_NAME, "data-mysql")],
                    &[(ENV_ROOT_PASSWORD, "rootpwd")],
                )],
            }
        }
    }

    // Mocks

    #[derive(Clone, Copy)]
    enum Submission {
        Accepted,
        None,
        Rejected,
    }

    // Functions

    async fn test(
        data: Data,
        submission: Submission,
    ) -> (Result<Option<JobWatcher>>, Deployment, Arc<MemoryStatusStore>, Captured<Job>) {
        init_tracer();
        let store = Arc::new(MemoryStatusStore::new());
        let sel = selector(&[(LABEL_NAME, "data-mysql")]);
        let mut kube = MockKubeClient::new();
        kube.expect_list_from::<Deployment>()
            .with(eq("ns"), eq(sel.clone()))
            .returning({
                let data = data.data.clone();
                move |_, _| async_ok(data.clone())
            });
        kube.expect_list_from::<Service>()
            .with(eq("ns"), eq(sel))
            .returning(|_, _| {
                async_ok(vec![Service {
                    metadata: ObjectMeta {
                        name: Some("mysql-svc".into()),
                        ..Default::default()
                    },
                    ..Default::default()
                }])
            });
        kube.expect_get_from::<Job>()
            .with(eq("ns"), eq("app1-dataconfig-job"))
            .returning(|_, _| async_ok(None::<Job>));
        let created = Captured::default();
        if !matches!(submission, Submission::None) {
            let created = created.clone();
            let rejected = matches!(submission, Submission::Rejected);
            kube.expect_create_from::<Job>()
                .with(eq("ns"), always())
                .times(1)
                .returning(move |_, job: &Job| {
                    created.set(job.clone());
                    if rejected {
                        async_err(kube_err())
                    } else {
                        async_ok(())
                    }
                });
        }
        if matches!(submission, Submission::Accepted) {
            kube.expect_watch_job()
                .with(eq("ns"), eq("app1-dataconfig-job"))
                .times(1)
                .returning(|_, _| {
                    let events = stream::iter([JobEvent::Deleted(Job::default())]).boxed();
                    Box::pin(async move { Ok(events) })
                });
        }
        let mut pwd = MockPasswordGenerator::new();
        pwd.expect_generate().returning(|| Ok("userpwd".into()));
        let jobs = DatabaseJobs::new(
            KIND,
            Arc::new(kube),
            Arc::new(DefaultTemplateLoader::new(None)),
            Arc::new(LiquidRenderer::new().unwrap()),
            Reporter::new(store.clone(), "app1:provision".into()),
        );
        let configurer = MysqlConfigurer::new(jobs, Arc::new(pwd));
        let deployment = Mutex::new(data.app);
        let res = configurer.configure("ns", &deployment).await;
        (res, deployment.into_inner(), store, created)
    }

    // Tests

    #[tokio::test]
    async fn job_started() {
        let (res, deployment, _, created) = test(Data::default(), Submission::Accepted).await;
        let outcome = res.unwrap().unwrap().await.unwrap();
        assert_eq!(outcome, JobOutcome::Deleted);
        assert_eq!(
            container_env(&deployment, ENV_USER).as_deref(),
            Some("abcdefghijklmnop")
        );
        assert_eq!(container_env(&deployment, ENV_PASSWORD).as_deref(), Some("userpwd"));
        assert_eq!(
            container_env(&deployment, ENV_DATABASE).as_deref(),
            Some("abcdefghijklmnopqrstuvwx")
        );
        let job = created.get().unwrap();
        let container = &job.spec.unwrap().template.spec.unwrap().containers[0];
        let env = container.env.clone().unwrap();
        let value = |name: &str| {
            env.iter()
                .find(|var| var.name == name)
                .and_then(|var| var.value.clone())
        };
        assert_eq!(value("DB_HOST").as_deref(), Some("mysql-svc"));
        assert_eq!(value("ADMIN_USERNAME").as_deref(), Some("root"));
        assert_eq!(value("ADMIN_PASSWORD").as_deref(), Some("rootpwd"));
        assert_eq!(value("ADMIN_DATABASE").as_deref(), Some("mysql"));
        assert_eq!(value("USER_USERNAME").as_deref(), Some("abcdefghijklmnop"));
    }

    #[tokio::test]
    async fn empty_guid() {
        let data = Data {
            app: deployment("app1", &[(LABEL_GUID, "")], &[]),
            ..Default::default()
        };
        let (res, deployment, _, _) = test(data, Submission::Accepted).await;
        res.unwrap().unwrap().await.unwrap();
        assert_eq!(container_env(&deployment, ENV_DATABASE).as_deref(), Some("app1"));
        assert_eq!(container_env(&deployment, ENV_USER).as_deref(), Some("app1"));
    }

    #[tokio::test]
    async fn missing_guid() {
        let data = Data {
            app: deployment("app1", &[], &[]),
            ..Default::default()
        };
        let (res, deployment, store, _) = test(data, Submission::None).await;
        let err = res.unwrap_err();
        assert!(
            matches!(err, Error::MissingLabel { label, name } if label == LABEL_GUID && name == "app1")
        );
        assert_eq!(container_env(&deployment, ENV_USER), None);
        let status = store.get("app1:provision").unwrap();
        assert_eq!(status.status, StatusKind::Failed);
    }

    #[tokio::test]
    async fn missing_root_password() {
        let data = Data {
            data: vec![deployment("mysql", &[(LABEL_NAME, "data-mysql")], &[])],
            ..Default::default()
        };
        let (res, _, _, _) = test(data, Submission::None).await;
        assert!(matches!(res.unwrap_err(), Error::MissingEnv(ENV_ROOT_PASSWORD)));
    }

    #[tokio::test]
    async fn job_submission_failure() {
        let (res, deployment, store, created) = test(Data::default(), Submission::Rejected).await;
        assert!(matches!(res.unwrap_err(), Error::JobSubmission(_)));
        assert!(created.get().is_some());
        assert_eq!(container_env(&deployment, ENV_PASSWORD).as_deref(), Some("userpwd"));
        let status = store.get("app1:provision").unwrap();
        assert_eq!(status.status, StatusKind::Failed);
    }

    #[tokio::test]
    async fn special_chars_in_root_password() {
        let password = r#"r"o\ot: #{pwd}"#;
        let data = Data {
            data: vec![deployment(
                "mysql",
                &[(LABEL_NAME, "data-mysql")],
                &[(ENV_ROOT_PASSWORD, password)],
            )],
            ..Default::default()
        };
        let (res, _, _, created) = test(data, Submission::Accepted).await;
        res.unwrap().unwrap().await.unwrap();
        let job = created.get().unwrap();
        let container = &job.spec.unwrap().template.spec.unwrap().containers[0];
        let env = container.env.clone().unwrap();
        let admin_password = env
            .iter()
            .find(|var| var.name == "ADMIN_PASSWORD")
            .and_then(|var| var.value.clone());
        assert_eq!(admin_password.as_deref(), Some(password));
    }
}
