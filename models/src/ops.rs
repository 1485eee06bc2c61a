use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::instance::{AgentInfo, Instance, InstanceId, InstanceStatus, Task, TaskId};
use crate::resource::{DiskSource, OfferResource, ResourceKind, Reservation, Role};
use crate::run_spec::HealthCheckProtocol;

/// One scalar resource fragment consumed by a match, tagged with the
/// role/reservation it came from so the builder can echo it onto the wire
/// payload unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedScalar {
    pub kind: ResourceKind,
    pub role: Role,
    pub reservation: Reservation,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedPort {
    pub host_port: u32,
    pub role: Role,
    pub endpoint_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedVolume {
    pub request_name: String,
    pub disk_source: DiskSource,
    pub role: Role,
    pub reservation: Reservation,
    pub size: f64,
    /// `Some` when the disk fragment already carries a persistence id (a
    /// `reservedWithLabels` match against an existing persistent volume);
    /// `None` when matched from unreserved disk (a `reservable` match), in
    /// which case the caller mints a fresh id -- kept out of the matcher
    /// itself so it stays pure and deterministic.
    pub volume_id: Option<String>,
}

/// The output of the resource matcher: the exact offer fragments
/// consumed by a single match attempt, copied by value so the match never
/// back-references the offer it came from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceMatch {
    pub scalars: Vec<MatchedScalar>,
    pub ports: Vec<MatchedPort>,
    pub volumes: Vec<MatchedVolume>,
}

impl ResourceMatch {
    pub fn total(&self, kind: ResourceKind) -> f64 {
        self.scalars.iter().filter(|s| s.kind == kind).map(|s| s.amount).sum()
    }

    pub fn host_ports(&self) -> Vec<u32> {
        self.ports.iter().map(|p| p.host_port).collect()
    }

    pub fn as_offer_resources(&self) -> Vec<OfferResource> {
        use crate::resource::ResourceValue;
        let mut out: Vec<OfferResource> = self
            .scalars
            .iter()
            .map(|s| OfferResource {
                kind: s.kind,
                role: s.role.clone(),
                reservation: s.reservation.clone(),
                disk: None,
                value: ResourceValue::Scalar(s.amount),
            })
            .collect();
        for v in &self.volumes {
            out.push(OfferResource {
                kind: ResourceKind::Disk,
                role: v.role.clone(),
                reservation: v.reservation.clone(),
                disk: Some(crate::resource::DiskInfo {
                    source: v.disk_source,
                    persistence_id: v.volume_id.clone(),
                }),
                value: ResourceValue::Scalar(v.size),
            });
        }
        out
    }
}

/// The pairing produced by the persistent-volume matcher: the
/// `Reserved` task whose volumes are present in the offer, and the ids it
/// matched on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMatch {
    pub reserved_task_id: TaskId,
    pub reserved_agent_info: AgentInfo,
    pub reserved_at: DateTime<Utc>,
    pub volume_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortMapping {
    pub endpoint_name: String,
    pub container_port: Option<u32>,
    pub host_port: u32,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompiledHealthCheck {
    Command(String),
    EndpointAssociation { endpoint_name: String, protocol: HealthCheckProtocol, path: Option<String> },
}

/// The resource-manager wire payload for a single task, built by the task
/// builder. Must round-trip unchanged through serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub name: String,
    pub agent_id: String,
    pub resources: Vec<OfferResource>,
    pub command: Option<String>,
    pub image: Option<String>,
    pub env: Vec<(String, String)>,
    pub container_name: Option<String>,
    pub health_check: Option<CompiledHealthCheck>,
    pub port_mappings: Vec<PortMapping>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: String,
    pub agent_id: String,
    pub resources: Vec<OfferResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroupInfo {
    pub tasks: Vec<TaskInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVolume {
    pub volume_id: String,
    pub disk_source: DiskSource,
    pub size: f64,
}

/// The state-store update a launch/reserve operation carries alongside its
/// wire payload. The core never applies this itself -- the caller
/// does, against its own instance store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StateOp {
    Launch {
        instance_id: InstanceId,
        run_spec_version: DateTime<Utc>,
        status: InstanceStatus,
        host_ports: Vec<u32>,
    },
    Reserve {
        task: Task,
    },
}

/// The typed instance-operation taxonomy the factory emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InstanceOp {
    LaunchEphemeral {
        task_info: TaskInfo,
        task: Task,
    },
    LaunchGroup {
        executor_info: ExecutorInfo,
        task_group_info: TaskGroupInfo,
        instance: Instance,
        host_ports: Vec<u32>,
    },
    LaunchOnReservation {
        task_info: TaskInfo,
        state_op: StateOp,
        task: Task,
    },
    ReserveAndCreateVolumes {
        framework_id: String,
        state_op: StateOp,
        resources: Vec<OfferResource>,
        local_volumes: Vec<LocalVolume>,
    },
}
