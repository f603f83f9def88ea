use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// Mods

pub mod kube;
pub mod process;
pub mod status;
pub mod tracer;

// Consts

pub const ANNOTATION_DEPENDENCIES: &str = "dependencies";

pub const LABEL_GUID: &str = "rhmap/guid";
pub const LABEL_NAME: &str = "rhmap/name";
pub const LABEL_TYPE: &str = "rhmap/type";

pub const TYPE_ENVIRONMENT_SERVICE: &str = "environmentService";

// Errors

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("unknown {kind} `{value}`")]
pub struct ParseError {
    pub kind: &'static str,
    pub value: String,
}

// Data structs

/// What is being configured and why.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Configuration {
    pub action: Action,
    pub deployment_name: String,
    pub instance_id: String,
    pub namespace: String,
}

/// Handle on a dependency deployment that was triggered but is not known to be ready yet.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatched {
    pub deployment_name: String,
    pub watch_url: String,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    /// Identifier used to correlate status. Deployment name is used if not specified.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Extra variables made available to templates.
    #[serde(default)]
    pub options: Map<String, Value>,
    pub target: Target,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub host: String,
    pub token: String,
}

// Action

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Deprovision,
    Provision,
    Update,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deprovision => "deprovision",
            Self::Provision => "provision",
            Self::Update => "update",
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deprovision" => Ok(Self::Deprovision),
            "provision" => Ok(Self::Provision),
            "update" => Ok(Self::Update),
            _ => Err(ParseError {
                kind: "action",
                value: s.into(),
            }),
        }
    }
}

// ServiceKind

/// Kind of environment service, as found in the `rhmap/name` label of its deployment.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ServiceKind {
    Cache,
    DataMongo,
    DataMysql,
}

impl ServiceKind {
    pub const ALL: [Self; 3] = [Self::Cache, Self::DataMongo, Self::DataMysql];

    pub fn name(self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::DataMongo => "data-mongo",
            Self::DataMysql => "data-mysql",
        }
    }
}

impl Display for ServiceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| ParseError {
                kind: "service kind",
                value: s.into(),
            })
    }
}

// Tests
