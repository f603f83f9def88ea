use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    sync::RwLock,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::Action;

// Consts

pub const NO_PLAN: &str = "noplan";

// Types

pub type Result<VALUE = ()> = std::result::Result<VALUE, Error>;

// Error

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no status recorded for `{0}`")]
    NotFound(String),
    #[error("status store is poisoned")]
    Poisoned,
}

// Data structs

/// Progress of one configuration run. The log only grows while the run is in flight.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Status {
    pub description: String,
    pub log: Vec<String>,
    #[serde(skip)]
    pub started: DateTime<Utc>,
    pub status: StatusKind,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum StatusKind {
    #[serde(rename = "failed")]
    Failed,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "succeeded")]
    Succeeded,
}

impl Display for StatusKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed => f.write_str("failed"),
            Self::InProgress => f.write_str("in progress"),
            Self::Succeeded => f.write_str("succeeded"),
        }
    }
}

// Traits

#[cfg_attr(feature = "mock", mockall::automock)]
pub trait StatusPublisher: Send + Sync {
    fn clear(&self, key: &str) -> Result;

    fn publish(&self, key: &str, status: StatusKind, description: &str) -> Result;
}

#[cfg_attr(feature = "mock", mockall::automock)]
pub trait StatusRetriever: Send + Sync {
    fn get(&self, key: &str) -> Result<Status>;
}

// LogStatusPublisher

/// Publisher used when no store is wired: statuses only end up in logs.
pub struct LogStatusPublisher;

impl StatusPublisher for LogStatusPublisher {
    fn clear(&self, _key: &str) -> Result {
        Ok(())
    }

    fn publish(&self, key: &str, status: StatusKind, description: &str) -> Result {
        info!(status.key = key, %status, "{description}");
        Ok(())
    }
}

// MemoryStatusStore

#[derive(Default)]
pub struct MemoryStatusStore(RwLock<HashMap<String, Status>>);

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusPublisher for MemoryStatusStore {
    #[instrument(skip(self))]
    fn clear(&self, key: &str) -> Result {
        debug!("clearing status");
        let mut statuses = self.0.write().map_err(|_| Error::Poisoned)?;
        statuses.remove(key);
        Ok(())
    }

    #[instrument(skip(self, description))]
    fn publish(&self, key: &str, status: StatusKind, description: &str) -> Result {
        debug!("{description}");
        let mut statuses = self.0.write().map_err(|_| Error::Poisoned)?;
        let entry = statuses.entry(key.into()).or_insert_with(|| Status {
            description: String::new(),
            log: vec![],
            started: Utc::now(),
            status,
        });
        entry.description = description.into();
        entry.log.push(description.into());
        entry.status = status;
        Ok(())
    }
}

impl StatusRetriever for MemoryStatusStore {
    fn get(&self, key: &str) -> Result<Status> {
        let statuses = self.0.read().map_err(|_| Error::Poisoned)?;
        statuses
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.into()))
    }
}

// Functions

/// Key under which the controller publishes progress of a configuration.
pub fn status_key(instance_id: &str, action: Action) -> String {
    [instance_id, action.as_str()].join(":")
}

/// Key used to look up the last action of an instance. Plan defaults to [`NO_PLAN`].
pub fn last_action_key(instance_id: &str, plan_id: Option<&str>, action: Action) -> String {
    let plan_id = plan_id.filter(|plan| !plan.is_empty()).unwrap_or(NO_PLAN);
    [instance_id, plan_id, action.as_str()].join(":")
}

// Tests
