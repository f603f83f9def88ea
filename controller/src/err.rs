use negotiator_core::{Dispatched, ServiceKind};

// Types

pub type Result<VALUE = ()> = std::result::Result<VALUE, Error>;

// Error

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("some configuration jobs failed {0:?}")]
    Configuration(Vec<String>),
    #[error("{}", .0.join("\n"))]
    Dependencies(Vec<String>),
    #[error("failed to dispatch dependency `{name}`: {source}")]
    DependencyDispatch {
        dispatched: Vec<Dispatched>,
        name: String,
        #[source]
        source: Box<Error>,
    },
    #[error("could not find deployment `{0}`")]
    DeploymentNotFound(String),
    #[error("unexpected error retrieving deployment `{name}`: {source}")]
    DeploymentRetrieval {
        name: String,
        #[source]
        source: kube::Error,
    },
    #[error("http error: {0}")]
    Http(
        #[from]
        #[source]
        reqwest::Error,
    ),
    #[error("failed to decode job: {0}")]
    JobDecode(#[source] serde_yaml::Error),
    #[error("failed to submit job: {0}")]
    JobSubmission(#[source] kube::Error),
    #[error("kubernetes error: {0}")]
    Kube(
        #[from]
        #[source]
        kube::Error,
    ),
    #[error("expected to find an env var `{0}` but it was not present")]
    MissingEnv(&'static str),
    #[error("could not find label `{label}` on deployment `{name}`")]
    MissingLabel { label: &'static str, name: String },
    #[error("failed to generate password: {0}")]
    PasswordGeneration(String),
    #[error("failed to update deployment after configuring it: {0}")]
    Persist(#[source] kube::Error),
    #[error("no {0} deployment exists")]
    ServiceDeploymentNotFound(ServiceKind),
    #[error("no service for {0} found")]
    ServiceNotFound(ServiceKind),
    #[error("failed to decode template `{name}`: {source}")]
    TemplateDecode {
        name: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to load template `{name}`: {source}")]
    TemplateLoad {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("template `{0}` doesn't exist")]
    TemplateNotFound(String),
    #[error("failed to render template: {0}")]
    TemplateRender(
        #[from]
        #[source]
        liquid::Error,
    ),
    #[error("template `{name}` defines unsupported object `{kind}`")]
    TemplateUnsupportedObject { kind: String, name: String },
    #[error("template `{0}` doesn't define a deployment")]
    TemplateWithoutDeployment(String),
    #[error("resource doesn't have name")]
    UnnamedResource,
}
