use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run_spec::RunSpecId;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Mints a fresh ephemeral/stateful task id for `run_spec_id`. Task ids
    /// are always prefixed by their owning run spec's id.
    pub fn for_run_spec(run_spec_id: &RunSpecId) -> Self {
        TaskId(format!("{}.{}", run_spec_id.as_str(), short_uuid()))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn for_run_spec(run_spec_id: &RunSpecId) -> Self {
        InstanceId(format!("{}.instance-{}", run_spec_id.as_str(), short_uuid()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub hostname: String,
    /// Snapshot of the agent's attributes at match time, used by placement
    /// constraint evaluation against peer instances.
    pub attributes: HashMap<String, String>,
}

impl AgentInfo {
    pub fn new(agent_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self { agent_id: agent_id.into(), hostname: hostname.into(), attributes: HashMap::new() }
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }
}

/// The status lattice a task/instance moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceStatusKind {
    Created,
    Reserved,
    Staging,
    Starting,
    Running,
    Killing,
    Killed,
    Failed,
    Finished,
    Gone,
    Dropped,
    Unreachable,
    Unknown,
    Error,
}

impl InstanceStatusKind {
    /// Terminal statuses destroy the ephemeral task that carries them. The
    /// factory never calls this itself (it only ever constructs fresh,
    /// non-terminal statuses); it's exposed for the caller's reconciliation
    /// loop, which owns deciding when a terminal status should drop a task
    /// from the instance store.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatusKind::Finished
                | InstanceStatusKind::Failed
                | InstanceStatusKind::Killed
                | InstanceStatusKind::Gone
                | InstanceStatusKind::Dropped
                | InstanceStatusKind::Error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub status: InstanceStatusKind,
    /// The clock reading at which `status` was last set to a new value.
    pub last_changed: DateTime<Utc>,
    /// The clock reading at which this status record was last derived, which
    /// may be later than `last_changed` if nothing about the category
    /// changed. Whether the two are forced equal on a no-op refresh is a
    /// configuration choice, controlled by `SchedulerConfig::last_updated_equals_last_changed`.
    pub last_updated: DateTime<Utc>,
    pub run_spec_version: DateTime<Utc>,
    pub healthy: Option<bool>,
}

/// Reservation timeout, carried while a reservation sits in a non-terminal,
/// time-bounded substate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timeout {
    pub initiated: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub reason: TimeoutReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutReason {
    ReservationTimeout,
    RelaunchEscalationTimeout,
    ReservationConfigUpdate,
}

/// The states a stateful task's reservation traverses.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ReservationState {
    New(Option<Timeout>),
    Launched,
    Suspended(Option<Timeout>),
    Garbage(Option<Timeout>),
    Unknown(Option<Timeout>),
}

impl ReservationState {
    pub fn timeout(self) -> Option<Timeout> {
        match self {
            ReservationState::New(t)
            | ReservationState::Suspended(t)
            | ReservationState::Garbage(t)
            | ReservationState::Unknown(t) => t,
            ReservationState::Launched => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub volume_ids: Vec<String>,
    pub state: ReservationState,
}

/// A task's tagged variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Task {
    LaunchedEphemeral {
        task_id: TaskId,
        agent_info: AgentInfo,
        run_spec_version: DateTime<Utc>,
        status: InstanceStatus,
        host_ports: Vec<u32>,
        /// Set for a pod task: the name of the container it implements.
        container_name: Option<String>,
    },
    Reserved {
        task_id: TaskId,
        agent_info: AgentInfo,
        reservation: Reservation,
        reserved_at: DateTime<Utc>,
    },
    LaunchedOnReservation {
        task_id: TaskId,
        agent_info: AgentInfo,
        run_spec_version: DateTime<Utc>,
        status: InstanceStatus,
        host_ports: Vec<u32>,
        reservation: Reservation,
    },
}

impl Task {
    pub fn task_id(&self) -> &TaskId {
        match self {
            Task::LaunchedEphemeral { task_id, .. }
            | Task::Reserved { task_id, .. }
            | Task::LaunchedOnReservation { task_id, .. } => task_id,
        }
    }

    pub fn agent_info(&self) -> &AgentInfo {
        match self {
            Task::LaunchedEphemeral { agent_info, .. }
            | Task::Reserved { agent_info, .. }
            | Task::LaunchedOnReservation { agent_info, .. } => agent_info,
        }
    }

    pub fn reservation(&self) -> Option<&Reservation> {
        match self {
            Task::LaunchedEphemeral { .. } => None,
            Task::Reserved { reservation, .. } | Task::LaunchedOnReservation { reservation, .. } => Some(reservation),
        }
    }

    pub fn is_reserved(&self) -> bool {
        matches!(self, Task::Reserved { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub instance_id: InstanceId,
    pub run_spec_id: RunSpecId,
    pub agent_info: AgentInfo,
    pub state: InstanceStatus,
    pub tasks: BTreeMap<TaskId, Task>,
}

impl Instance {
    /// Every task id is prefixed by the owning run spec's id. The factory
    /// upholds this by construction (`TaskId::for_run_spec`); this check is
    /// exposed for the caller's instance store to assert against on
    /// read/write or during reconciliation, not called from this crate.
    pub fn check_run_spec_prefix_invariant(&self) -> bool {
        self.tasks.keys().all(|id| self.run_spec_id.is_prefix_of(&id.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_are_exactly_the_destroying_ones() {
        for kind in [InstanceStatusKind::Finished, InstanceStatusKind::Failed, InstanceStatusKind::Killed, InstanceStatusKind::Gone, InstanceStatusKind::Dropped, InstanceStatusKind::Error] {
            assert!(kind.is_terminal(), "{:?} should be terminal", kind);
        }
        for kind in [InstanceStatusKind::Created, InstanceStatusKind::Staging, InstanceStatusKind::Starting, InstanceStatusKind::Running] {
            assert!(!kind.is_terminal(), "{:?} should not be terminal", kind);
        }
    }

    #[test]
    fn prefix_invariant_holds_for_ids_minted_by_for_run_spec() {
        let run_spec_id = RunSpecId("/group/app".to_string());
        let task_id = TaskId::for_run_spec(&run_spec_id);
        let instance = Instance {
            instance_id: InstanceId::for_run_spec(&run_spec_id),
            run_spec_id: run_spec_id.clone(),
            agent_info: AgentInfo::new("agent-1".to_string(), "host-a".to_string()),
            state: InstanceStatus {
                status: InstanceStatusKind::Created,
                last_changed: chrono::Utc::now(),
                last_updated: chrono::Utc::now(),
                run_spec_version: chrono::Utc::now(),
                healthy: None,
            },
            tasks: BTreeMap::from([(task_id, Task::LaunchedEphemeral {
                task_id: TaskId::for_run_spec(&run_spec_id),
                agent_info: AgentInfo::new("agent-1".to_string(), "host-a".to_string()),
                run_spec_version: chrono::Utc::now(),
                status: InstanceStatus {
                    status: InstanceStatusKind::Created,
                    last_changed: chrono::Utc::now(),
                    last_updated: chrono::Utc::now(),
                    run_spec_version: chrono::Utc::now(),
                    healthy: None,
                },
                host_ports: vec![],
                container_name: None,
            })]),
        };
        assert!(instance.check_run_spec_prefix_invariant());
    }

    #[test]
    fn prefix_invariant_fails_for_a_foreign_task_id() {
        let run_spec_id = RunSpecId("/group/app".to_string());
        let foreign_id = TaskId("/group/other.deadbeef".to_string());
        let instance = Instance {
            instance_id: InstanceId::for_run_spec(&run_spec_id),
            run_spec_id: run_spec_id.clone(),
            agent_info: AgentInfo::new("agent-1".to_string(), "host-a".to_string()),
            state: InstanceStatus {
                status: InstanceStatusKind::Created,
                last_changed: chrono::Utc::now(),
                last_updated: chrono::Utc::now(),
                run_spec_version: chrono::Utc::now(),
                healthy: None,
            },
            tasks: BTreeMap::from([(foreign_id.clone(), Task::LaunchedEphemeral {
                task_id: foreign_id,
                agent_info: AgentInfo::new("agent-1".to_string(), "host-a".to_string()),
                run_spec_version: chrono::Utc::now(),
                status: InstanceStatus {
                    status: InstanceStatusKind::Created,
                    last_changed: chrono::Utc::now(),
                    last_updated: chrono::Utc::now(),
                    run_spec_version: chrono::Utc::now(),
                    healthy: None,
                },
                host_ports: vec![],
                container_name: None,
            })]),
        };
        assert!(!instance.check_run_spec_prefix_invariant());
    }
}
