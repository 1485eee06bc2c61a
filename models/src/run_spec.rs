use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resource::{DiskSource, Role};

/// Hierarchical identifier for a run spec, e.g. `/group/app`. Task ids are
/// minted by appending a suffix to this path, so `runSpecId` is always a
/// prefix of every task id it owns.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunSpecId(pub String);

impl RunSpecId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_prefix_of(&self, task_id: &str) -> bool {
        task_id.starts_with(self.0.as_str())
    }
}

impl std::fmt::Display for RunSpecId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceDemand {
    pub cpu: f64,
    pub mem: f64,
    pub disk: f64,
    pub gpu: f64,
}

impl ResourceDemand {
    pub const ZERO: ResourceDemand = ResourceDemand { cpu: 0.0, mem: 0.0, disk: 0.0, gpu: 0.0 };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostPortRequest {
    Fixed(u32),
    Any,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub container_port: Option<u32>,
    pub host_port: Option<HostPortRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthCheckProtocol {
    Http,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HealthCheckSpec {
    Command(String),
    Endpoint { endpoint_name: String, protocol: HealthCheckProtocol, path: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistentVolumeRequest {
    pub name: String,
    pub size: f64,
    pub disk_source: DiskSource,
}

/// Placement constraints evaluated against an offer's agent attributes and
/// the run spec's current peer instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlacementConstraint {
    /// At most one instance of this run spec per agent.
    UniqueHostname,
    /// At most `max` instances sharing the same value of `attribute`.
    MaxPerAttribute { attribute: String, max: u32 },
    /// The offer's agent must carry `attribute = value`.
    AttributeEquals { attribute: String, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: Option<String>,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub endpoints: Vec<Endpoint>,
    pub health_check: Option<HealthCheckSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSpec {
    pub id: RunSpecId,
    pub version: DateTime<Utc>,
    pub resources: ResourceDemand,
    pub accepted_roles: BTreeSet<Role>,
    pub container: ContainerSpec,
    pub volumes: Vec<PersistentVolumeRequest>,
    pub constraints: Vec<PlacementConstraint>,
}

impl AppSpec {
    pub fn is_resident(&self) -> bool {
        !self.volumes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodContainerSpec {
    pub resources: ResourceDemand,
    pub container: ContainerSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub id: RunSpecId,
    pub version: DateTime<Utc>,
    pub accepted_roles: BTreeSet<Role>,
    pub containers: Vec<PodContainerSpec>,
    pub constraints: Vec<PlacementConstraint>,
}

impl PodSpec {
    pub fn total_resources(&self) -> ResourceDemand {
        self.containers.iter().fold(ResourceDemand::ZERO, |acc, c| ResourceDemand {
            cpu: acc.cpu + c.resources.cpu,
            mem: acc.mem + c.resources.mem,
            disk: acc.disk + c.resources.disk,
            gpu: acc.gpu + c.resources.gpu,
        })
    }
}

/// A tagged variant over the run spec kinds the core understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunSpec {
    App(AppSpec),
    Pod(PodSpec),
}

impl RunSpec {
    pub fn id(&self) -> &RunSpecId {
        match self {
            RunSpec::App(app) => &app.id,
            RunSpec::Pod(pod) => &pod.id,
        }
    }

    pub fn version(&self) -> DateTime<Utc> {
        match self {
            RunSpec::App(app) => app.version,
            RunSpec::Pod(pod) => pod.version,
        }
    }

    pub fn accepted_roles(&self) -> &BTreeSet<Role> {
        match self {
            RunSpec::App(app) => &app.accepted_roles,
            RunSpec::Pod(pod) => &pod.accepted_roles,
        }
    }

    pub fn constraints(&self) -> &[PlacementConstraint] {
        match self {
            RunSpec::App(app) => &app.constraints,
            RunSpec::Pod(pod) => &pod.constraints,
        }
    }

    pub fn is_resident(&self) -> bool {
        match self {
            RunSpec::App(app) => app.is_resident(),
            RunSpec::Pod(_) => false,
        }
    }
}
