use std::fmt::{self, Display, Formatter};

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use negotiator_core::{
    kube::{JobEvent, JobEventStream},
    status::{StatusKind, StatusPublisher},
    ServiceKind,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::Reporter;

// Consts

const REASON_DEADLINE_EXCEEDED: &str = "DeadlineExceeded";

// Types

pub type JobWatcher = JoinHandle<JobOutcome>;

// JobOutcome

/// How watching a configuration job ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobOutcome {
    DeadlineExceeded(String),
    Deleted,
    Errored(String),
    Interrupted,
    Succeeded,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl Display for JobOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeadlineExceeded(msg) => write!(f, "timed out: {msg}"),
            Self::Deleted => f.write_str("was deleted before completion"),
            Self::Errored(msg) => write!(f, "errored: {msg}"),
            Self::Interrupted => f.write_str("stopped being watched before completion"),
            Self::Succeeded => f.write_str("succeeded"),
        }
    }
}

// JobState

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum JobState {
    DeadlineExceeded(String),
    Running { failed: i32, succeeded: i32 },
    Succeeded,
}

impl JobState {
    pub fn of(job: &Job) -> Self {
        let status = job.status.as_ref();
        let deadline = status
            .and_then(|status| status.conditions.as_ref())
            .and_then(|conds| {
                conds
                    .iter()
                    .find(|cond| cond.reason.as_deref() == Some(REASON_DEADLINE_EXCEEDED))
            });
        if let Some(cond) = deadline {
            return Self::DeadlineExceeded(cond.message.clone().unwrap_or_default());
        }
        let succeeded = status.and_then(|status| status.succeeded).unwrap_or(0);
        let failed = status.and_then(|status| status.failed).unwrap_or(0);
        if succeeded >= 1 {
            Self::Succeeded
        } else {
            Self::Running { failed, succeeded }
        }
    }
}

// Functions

/// Follows job events until the job reaches a terminal state. Dropping the stream stops the watch.
pub async fn watch<PUBLISHER: StatusPublisher>(
    mut events: JobEventStream,
    reporter: Reporter<PUBLISHER>,
    kind: ServiceKind,
) -> JobOutcome {
    while let Some(evt) = events.next().await {
        let job = match evt {
            JobEvent::Added(job) | JobEvent::Modified(job) => job,
            JobEvent::Deleted(_) => {
                warn!("job deleted");
                reporter.publish(
                    StatusKind::Failed,
                    format!("{kind} configuration job was deleted"),
                );
                return JobOutcome::Deleted;
            }
            JobEvent::Error(msg) => {
                warn!("job watch failed: {msg}");
                reporter.publish(
                    StatusKind::Failed,
                    format!("unexpected error watching {kind} configuration job: {msg}"),
                );
                return JobOutcome::Errored(msg);
            }
        };
        match JobState::of(&job) {
            JobState::DeadlineExceeded(msg) => {
                warn!("job deadline exceeded");
                reporter.publish(
                    StatusKind::Failed,
                    format!("configuration job timed out and failed to configure {kind}: {msg}"),
                );
                return JobOutcome::DeadlineExceeded(msg);
            }
            JobState::Running { failed, succeeded } => {
                debug!(failed, succeeded, "job is running");
                reporter.publish(
                    StatusKind::InProgress,
                    format!("job status succeeded {succeeded} failed {failed}"),
                );
            }
            JobState::Succeeded => {
                info!("job succeeded");
                reporter.publish(
                    StatusKind::InProgress,
                    format!("{kind} configuration job succeeded"),
                );
                return JobOutcome::Succeeded;
            }
        }
    }
    warn!("job watch ended");
    reporter.publish(
        StatusKind::Failed,
        format!("{kind} configuration job stopped being watched before completion"),
    );
    JobOutcome::Interrupted
}

pub fn spawn<PUBLISHER: StatusPublisher + 'static>(
    events: JobEventStream,
    reporter: Reporter<PUBLISHER>,
    kind: ServiceKind,
    job_name: &str,
) -> JobWatcher {
    let span = info_span!("watch_job", job.name = job_name, service.kind = %kind);
    tokio::spawn(watch(events, reporter, kind).instrument(span))
}

// Tests
