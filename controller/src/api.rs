use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderName, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use k8s_openapi::api::apps::v1::Deployment;
use negotiator_core::{
    kube::KubeClient,
    process::shutdown_signal,
    status::{self, last_action_key, status_key, Status, StatusRetriever, NO_PLAN},
    Action, Configuration, Dispatched, Payload,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info, info_span, instrument};

use crate::{
    config::ServiceConfigurator,
    deploy::{deploy_dependency_services, DependencyWaiter, Deployer},
    metrics::{self, Metrics},
};

// Consts

const BEARER_PREFIX: &str = "Bearer ";
const HEADER_CORRELATION_ID: &str = "x-correlation-id";

// Types

type Result<VALUE = ()> = std::result::Result<VALUE, Error>;

// Error

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Controller(
        #[from]
        #[source]
        crate::err::Error,
    ),
    #[error("{0}")]
    Kube(
        #[from]
        #[source]
        kube::Error,
    ),
    #[error("{0}")]
    NotFound(String),
    #[error("failed to retrieve status: {0}")]
    Status(
        #[from]
        #[source]
        status::Error,
    ),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            Self::Controller(crate::err::Error::TemplateNotFound(name)) => {
                (StatusCode::NOT_FOUND, format!("template `{name}` doesn't exist")).into_response()
            }
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            Self::Status(err @ status::Error::NotFound(_)) => {
                (StatusCode::NOT_FOUND, err.to_string()).into_response()
            }
            err => {
                error!("{err}");
                (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
            }
        }
    }
}

// ApiContext

pub struct ApiContext<
    CONFIGURATOR: ServiceConfigurator,
    DEPLOYER: Deployer,
    KUBE: KubeClient,
    RETRIEVER: StatusRetriever,
    WAITER: DependencyWaiter,
> {
    pub configurator: CONFIGURATOR,
    pub deployer: DEPLOYER,
    pub kube: Arc<KUBE>,
    pub metrics: Metrics,
    pub retriever: Arc<RETRIEVER>,
    pub waiter: WAITER,
}

// Data structs

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
enum DeployStatus {
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "success")]
    Success,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
struct DeployStatusResponse {
    status: DeployStatus,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
struct LastOperationQuery {
    operation: Option<String>,
    plan_id: Option<String>,
}

// Functions

pub async fn start_api<
    CONFIGURATOR: ServiceConfigurator + 'static,
    DEPLOYER: Deployer + 'static,
    KUBE: KubeClient + 'static,
    RETRIEVER: StatusRetriever + 'static,
    WAITER: DependencyWaiter + 'static,
>(
    addr: SocketAddr,
    ctx: ApiContext<CONFIGURATOR, DEPLOYER, KUBE, RETRIEVER, WAITER>,
) -> anyhow::Result<()> {
    debug!("binding tcp listener");
    let tcp = TcpListener::bind(addr).await?;
    info!(%addr, "server started");
    axum::serve(tcp, create_router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

fn create_router<
    CONFIGURATOR: ServiceConfigurator + 'static,
    DEPLOYER: Deployer + 'static,
    KUBE: KubeClient + 'static,
    RETRIEVER: StatusRetriever + 'static,
    WAITER: DependencyWaiter + 'static,
>(
    ctx: ApiContext<CONFIGURATOR, DEPLOYER, KUBE, RETRIEVER, WAITER>,
) -> Router {
    let correlation_id = HeaderName::from_static(HEADER_CORRELATION_ID);
    let trace_layer = TraceLayer::new_for_http().make_span_with(|req: &Request<_>| {
        let correlation_id = req
            .headers()
            .get(HEADER_CORRELATION_ID)
            .and_then(|val| val.to_str().ok())
            .unwrap_or_default();
        let span = info_span!(
            "http_request",
            correlation.id = correlation_id,
            http.method = %req.method(),
            http.path = req.uri().path(),
        );
        debug!(parent: &span, "http request received");
        span
    });
    let metrics = ctx.metrics.clone();
    let deploy = Router::new()
        .route("/deploy/{namespace}/{template}", post(deploy))
        .route(
            "/deploy/status/{namespace}/{deployment}",
            get(deploy_status),
        )
        .route_layer(middleware::from_fn(require_bearer));
    Router::new()
        .merge(deploy)
        .route(
            "/service_instances/{instance_id}/last_operation",
            get(last_operation),
        )
        .route("/sys/info/health", get(health))
        .route("/sys/info/ping", get(ping))
        .with_state(Arc::new(ctx))
        .merge(metrics::router(metrics.clone()))
        .route_layer(middleware::from_fn_with_state(metrics, metrics::track))
        .layer(PropagateRequestIdLayer::new(correlation_id.clone()))
        .layer(trace_layer)
        .layer(SetRequestIdLayer::new(correlation_id, MakeRequestUuid))
        .layer(CatchPanicLayer::new())
}

#[instrument(skip_all, fields(resource.namespace = %ns, template.name = %template))]
async fn deploy<
    CONFIGURATOR: ServiceConfigurator,
    DEPLOYER: Deployer,
    KUBE: KubeClient,
    RETRIEVER: StatusRetriever,
    WAITER: DependencyWaiter,
>(
    State(ctx): State<Arc<ApiContext<CONFIGURATOR, DEPLOYER, KUBE, RETRIEVER, WAITER>>>,
    Path((ns, template)): Path<(String, String)>,
    Json(payload): Json<Payload>,
) -> Result<(StatusCode, Json<Dispatched>)> {
    debug!("loading template");
    let tpl = ctx.deployer.load(&ns, &template, &payload)?;
    let deps = deploy_dependency_services(&ctx.deployer, &tpl, &ns, &payload).await?;
    debug!(dependencies = deps.len(), "waiting for dependencies");
    ctx.waiter.wait(&deps, &payload).await?;
    let dispatched = ctx.deployer.dispatch(&ns, &tpl).await?;
    let config = Configuration {
        action: Action::Provision,
        deployment_name: dispatched.deployment_name.clone(),
        instance_id: payload
            .instance_id
            .clone()
            .unwrap_or_else(|| dispatched.deployment_name.clone()),
        namespace: ns,
    };
    ctx.configurator.configure(&config).await?;
    info!(deployment.name = %dispatched.deployment_name, "template deployed");
    Ok((StatusCode::CREATED, Json(dispatched)))
}

#[instrument(skip_all, fields(resource.namespace = %ns, deployment.name = %name))]
async fn deploy_status<
    CONFIGURATOR: ServiceConfigurator,
    DEPLOYER: Deployer,
    KUBE: KubeClient,
    RETRIEVER: StatusRetriever,
    WAITER: DependencyWaiter,
>(
    State(ctx): State<Arc<ApiContext<CONFIGURATOR, DEPLOYER, KUBE, RETRIEVER, WAITER>>>,
    Path((ns, name)): Path<(String, String)>,
) -> Result<Json<DeployStatusResponse>> {
    let deployment = ctx
        .kube
        .get_from::<Deployment>(&ns, &name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("deployment `{name}` doesn't exist")))?;
    let status = if rollout_complete(&deployment) {
        DeployStatus::Success
    } else {
        DeployStatus::InProgress
    };
    Ok(Json(DeployStatusResponse { status }))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
    })
}

#[instrument(skip_all, fields(instance.id = %instance_id))]
async fn last_operation<
    CONFIGURATOR: ServiceConfigurator,
    DEPLOYER: Deployer,
    KUBE: KubeClient,
    RETRIEVER: StatusRetriever,
    WAITER: DependencyWaiter,
>(
    State(ctx): State<Arc<ApiContext<CONFIGURATOR, DEPLOYER, KUBE, RETRIEVER, WAITER>>>,
    Path(instance_id): Path<String>,
    Query(query): Query<LastOperationQuery>,
) -> Result<Json<Status>> {
    let operation = query
        .operation
        .ok_or_else(|| Error::BadRequest("missing `operation` query parameter".into()))?;
    let action: Action = operation
        .parse()
        .map_err(|err: negotiator_core::ParseError| Error::BadRequest(err.to_string()))?;
    let plan_id = query.plan_id.as_deref().filter(|plan| !plan.is_empty());
    let key = last_action_key(&instance_id, plan_id, action);
    let status = match ctx.retriever.get(&key) {
        Err(status::Error::NotFound(_)) if plan_id.unwrap_or(NO_PLAN) == NO_PLAN => {
            debug!("no status for plan, falling back to controller key");
            ctx.retriever.get(&status_key(&instance_id, action))?
        }
        res => res?,
    };
    Ok(Json(status))
}

async fn ping() -> &'static str {
    "OK"
}

async fn require_bearer(req: Request<Body>, next: Next) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|val| val.to_str().ok())
        .and_then(|val| val.strip_prefix(BEARER_PREFIX))
        .is_some_and(|token| !token.trim().is_empty());
    if authorized {
        next.run(req).await
    } else {
        debug!("request without bearer token rejected");
        (StatusCode::UNAUTHORIZED, "missing bearer token").into_response()
    }
}

fn rollout_complete(deployment: &Deployment) -> bool {
    let Some(status) = &deployment.status else {
        return false;
    };
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let generation_observed = match (deployment.metadata.generation, status.observed_generation) {
        (Some(generation), Some(observed)) => observed >= generation,
        (None, _) => true,
        (Some(_), None) => false,
    };
    generation_observed
        && status.updated_replicas.unwrap_or(0) >= desired
        && status.available_replicas.unwrap_or(0) >= desired
}

// Tests

#[cfg(test)]
mod test {
    use axum::http::{HeaderMap, Method};
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use kube::api::ObjectMeta;
    use mockall::predicate::*;
    use negotiator_core::{
        kube::MockKubeClient,
        status::{MemoryStatusStore, StatusKind, StatusPublisher},
        Target,
    };
    use tower::ServiceExt;

    use crate::{
        config::MockServiceConfigurator,
        deploy::{MockDependencyWaiter, MockDeployer, Template},
        test::*,
    };

    use super::*;

    // Types

    type Context = ApiContext<
        MockServiceConfigurator,
        MockDeployer,
        MockKubeClient,
        MemoryStatusStore,
        MockDependencyWaiter,
    >;

    // Functions

    fn context() -> Context {
        ApiContext {
            configurator: MockServiceConfigurator::new(),
            deployer: MockDeployer::new(),
            kube: Arc::new(MockKubeClient::new()),
            metrics: Metrics::new().unwrap(),
            retriever: Arc::new(MemoryStatusStore::new()),
            waiter: MockDependencyWaiter::new(),
        }
    }

    async fn call(ctx: Context, req: Request<Body>) -> (StatusCode, HeaderMap, String) {
        init_tracer();
        let resp = create_router(ctx).oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    fn request(method: Method, uri: &str) -> axum::http::request::Builder {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
    }

    async fn send(ctx: Context, method: Method, uri: &str, body: Option<String>) -> (StatusCode, String) {
        let req = request(method, uri)
            .header(header::AUTHORIZATION, "Bearer token")
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .unwrap();
        let (status, _, body) = call(ctx, req).await;
        (status, body)
    }

    fn rolled_out(ready: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                generation: Some(2),
                name: Some("app1".into()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                available_replicas: Some(ready),
                observed_generation: Some(2),
                updated_replicas: Some(ready),
                ..Default::default()
            }),
        }
    }

    // Mods

    mod deploy {
        use super::*;

        // Data

        fn payload() -> Payload {
            Payload {
                instance_id: None,
                options: Default::default(),
                target: Target {
                    host: "https://host".into(),
                    token: "token".into(),
                },
            }
        }

        fn dispatched() -> Dispatched {
            Dispatched {
                deployment_name: "cloudapp".into(),
                watch_url: "http://localhost:8080/deploy/status/ns/cloudapp".into(),
            }
        }

        fn dispatching_context() -> Context {
            let mut ctx = super::context();
            ctx.deployer
                .expect_load()
                .with(eq("ns"), eq("cloudapp"), eq(payload()))
                .times(1)
                .returning(|_, name, _| {
                    Ok(Template {
                        name: name.into(),
                        ..Default::default()
                    })
                });
            ctx.waiter
                .expect_wait()
                .with(eq(Vec::<Dispatched>::new()), eq(payload()))
                .times(1)
                .returning(|_, _| async_ok(()));
            ctx.deployer
                .expect_dispatch()
                .withf(|ns, tpl| ns == "ns" && tpl.name == "cloudapp")
                .times(1)
                .returning(|_, _| async_ok(dispatched()));
            ctx
        }

        fn context(configured: crate::err::Result) -> Context {
            let mut ctx = dispatching_context();
            let configured = std::sync::Mutex::new(Some(configured));
            ctx.configurator
                .expect_configure()
                .with(eq(Configuration {
                    action: Action::Provision,
                    deployment_name: "cloudapp".into(),
                    instance_id: "cloudapp".into(),
                    namespace: "ns".into(),
                }))
                .times(1)
                .returning(move |_| {
                    let res = configured.lock().unwrap().take().unwrap();
                    Box::pin(async move { res })
                });
            ctx
        }

        // Tests

        #[tokio::test]
        async fn created() {
            let body = serde_json::to_string(&payload()).unwrap();
            let (status, body) = send(context(Ok(())), Method::POST, "/deploy/ns/cloudapp", Some(body)).await;
            assert_eq!(status, StatusCode::CREATED);
            let resp: Dispatched = serde_json::from_str(&body).unwrap();
            assert_eq!(resp, dispatched());
        }

        #[tokio::test]
        async fn configuration_failed() {
            let body = serde_json::to_string(&payload()).unwrap();
            let err = crate::err::Error::Configuration(vec!["data-mongo failed".into()]);
            let (status, body) = send(context(Err(err)), Method::POST, "/deploy/ns/cloudapp", Some(body)).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
            assert!(body.contains("data-mongo failed"));
        }

        #[tokio::test]
        async fn configurator_panic_recovered() {
            let mut ctx = dispatching_context();
            ctx.configurator
                .expect_configure()
                .returning(|_| panic!("configurator crashed"));
            let body = serde_json::to_string(&payload()).unwrap();
            let (status, _) = send(ctx, Method::POST, "/deploy/ns/cloudapp", Some(body)).await;
            assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        }

        #[tokio::test]
        async fn without_bearer_token() {
            let body = serde_json::to_string(&payload()).unwrap();
            let req = request(Method::POST, "/deploy/ns/cloudapp")
                .body(Body::from(body))
                .unwrap();
            let (status, _, _) = call(super::context(), req).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn with_empty_bearer_token() {
            let req = request(Method::GET, "/deploy/status/ns/app1")
                .header(header::AUTHORIZATION, "Bearer ")
                .body(Body::empty())
                .unwrap();
            let (status, _, _) = call(super::context(), req).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn template_not_found() {
            let mut ctx = super::context();
            ctx.deployer
                .expect_load()
                .returning(|_, name, _| Err(crate::err::Error::TemplateNotFound(name.into())));
            let body = serde_json::to_string(&payload()).unwrap();
            let (status, _) = send(ctx, Method::POST, "/deploy/ns/unknown", Some(body)).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }
    }

    mod deploy_status {
        use super::*;

        async fn test(deployment: Option<Deployment>) -> (StatusCode, String) {
            let mut ctx = context();
            let mut kube = MockKubeClient::new();
            kube.expect_get_from::<Deployment>()
                .with(eq("ns"), eq("app1"))
                .times(1)
                .returning(move |_, _| async_ok(deployment.clone()));
            ctx.kube = Arc::new(kube);
            send(ctx, Method::GET, "/deploy/status/ns/app1", None).await
        }

        #[tokio::test]
        async fn success() {
            let (status, body) = test(Some(rolled_out(2))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, r#"{"status":"success"}"#);
        }

        #[tokio::test]
        async fn in_progress() {
            let (status, body) = test(Some(rolled_out(1))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, r#"{"status":"in progress"}"#);
        }

        #[tokio::test]
        async fn not_found() {
            let (status, _) = test(None).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }
    }

    mod last_operation {
        use super::*;

        fn context(statuses: &[(&str, StatusKind, &str)]) -> Context {
            let store = MemoryStatusStore::new();
            for (key, status, desc) in statuses {
                store.publish(key, *status, desc).unwrap();
            }
            let mut ctx = super::context();
            ctx.retriever = Arc::new(store);
            ctx
        }

        #[tokio::test]
        async fn with_plan() {
            let ctx = context(&[("app1:plan1:update", StatusKind::Succeeded, "done")]);
            let (status, body) = send(
                ctx,
                Method::GET,
                "/service_instances/app1/last_operation?operation=update&plan_id=plan1",
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            let resp: Status = serde_json::from_str(&body).unwrap();
            assert_eq!(resp.status, StatusKind::Succeeded);
            assert_eq!(resp.description, "done");
            assert_eq!(resp.log, ["done"]);
        }

        #[tokio::test]
        async fn falls_back_on_controller_key() {
            let ctx = context(&[
                ("app1:provision", StatusKind::InProgress, "found 2 services"),
                ("app1:provision", StatusKind::InProgress, "configuring cache"),
            ]);
            let (status, body) = send(
                ctx,
                Method::GET,
                "/service_instances/app1/last_operation?operation=provision",
                None,
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            let resp: Status = serde_json::from_str(&body).unwrap();
            assert_eq!(resp.status, StatusKind::InProgress);
            assert_eq!(resp.log.len(), 2);
        }

        #[tokio::test]
        async fn not_found() {
            let (status, _) = send(
                context(&[]),
                Method::GET,
                "/service_instances/app1/last_operation?operation=provision",
                None,
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND);
        }

        #[tokio::test]
        async fn missing_operation() {
            let (status, _) = send(
                context(&[]),
                Method::GET,
                "/service_instances/app1/last_operation",
                None,
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn unknown_operation() {
            let (status, body) = send(
                context(&[]),
                Method::GET,
                "/service_instances/app1/last_operation?operation=destroy",
                None,
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(body.contains("destroy"));
        }
    }

    mod sys {
        use super::*;

        #[tokio::test]
        async fn ping() {
            let (status, body) = send(context(), Method::GET, "/sys/info/ping", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, "OK");
        }

        #[tokio::test]
        async fn health() {
            let (status, body) = send(context(), Method::GET, "/sys/info/health", None).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body, r#"{"status":"ok"}"#);
        }

        #[tokio::test]
        async fn correlation_id_propagated() {
            let req = request(Method::GET, "/sys/info/ping")
                .header(HEADER_CORRELATION_ID, "corr-1")
                .body(Body::empty())
                .unwrap();
            let (status, headers, _) = call(context(), req).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(headers[HEADER_CORRELATION_ID], "corr-1");
        }

        #[tokio::test]
        async fn correlation_id_generated() {
            let req = request(Method::GET, "/sys/info/ping")
                .body(Body::empty())
                .unwrap();
            let (_, headers, _) = call(context(), req).await;
            let id = headers[HEADER_CORRELATION_ID].to_str().unwrap();
            assert!(!id.is_empty());
        }

        #[tokio::test]
        async fn metrics() {
            let ctx = context();
            let metrics = ctx.metrics.clone();
            let (status, _) = send(ctx, Method::GET, "/sys/info/ping", None).await;
            assert_eq!(status, StatusCode::OK);
            let text = metrics.export().unwrap();
            assert!(text.contains(r#"http_requests_total{code="200",handler="/sys/info/ping"} 1"#));
        }
    }
}
