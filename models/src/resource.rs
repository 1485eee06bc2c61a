use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A scalar or ranged resource kind carried on an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum ResourceKind {
    Cpu,
    Mem,
    Disk,
    Gpu,
    Ports,
}

/// Namespace under which a resource is offered and may be reserved.
pub type Role = String;

/// Provenance of a disk resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub enum DiskSource {
    Root,
    Mount,
    Path,
}

/// Labels attached to a dynamic reservation. Compared for exact-match, so a
/// `BTreeMap` keeps ordering (and therefore equality/hashing) deterministic.
pub type ReservationLabels = BTreeMap<String, String>;

pub const LABEL_FRAMEWORK_ID: &str = "marathon_framework_id";
pub const LABEL_TASK_ID: &str = "marathon_task_id";

/// Builds the exact label set a reservation for `task_id` under `framework_id`
/// must carry exactly.
pub fn reservation_labels(framework_id: &str, task_id: &str) -> ReservationLabels {
    let mut labels = ReservationLabels::new();
    labels.insert(LABEL_FRAMEWORK_ID.to_string(), framework_id.to_string());
    labels.insert(LABEL_TASK_ID.to_string(), task_id.to_string());
    labels
}

/// The reservation state of an individual offer resource fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reservation {
    Unreserved,
    Dynamic {
        role: Role,
        labels: ReservationLabels,
    },
}

impl Reservation {
    pub fn is_unreserved(&self) -> bool {
        matches!(self, Reservation::Unreserved)
    }

    pub fn labels(&self) -> Option<&ReservationLabels> {
        match self {
            Reservation::Unreserved => None,
            Reservation::Dynamic { labels, .. } => Some(labels),
        }
    }
}

/// A closed, inclusive range of port numbers, as carried by a `ports` resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub begin: u32,
    pub end: u32,
}

impl PortRange {
    pub fn new(begin: u32, end: u32) -> Self {
        Self { begin, end }
    }

    pub fn contains(&self, port: u32) -> bool {
        port >= self.begin && port <= self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.begin + 1
    }

    pub fn is_empty(&self) -> bool {
        self.begin > self.end
    }
}

/// A single persistent-volume fragment attached to a disk resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub source: DiskSource,
    /// Set once a volume has been created against this disk fragment.
    pub persistence_id: Option<String>,
}

/// The value carried by a single offer resource: either a scalar quantity or
/// a set of port ranges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResourceValue {
    Scalar(f64),
    Ranges(Vec<PortRange>),
}

/// One resource fragment inside an `Offer`. Offers bundle many of these,
/// possibly several fragments of the same `kind` under different roles,
/// reservations, or disk sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferResource {
    pub kind: ResourceKind,
    pub role: Role,
    pub reservation: Reservation,
    pub disk: Option<DiskInfo>,
    pub value: ResourceValue,
}

impl OfferResource {
    pub fn scalar(&self) -> Option<f64> {
        match &self.value {
            ResourceValue::Scalar(v) => Some(*v),
            ResourceValue::Ranges(_) => None,
        }
    }

    pub fn ranges(&self) -> Option<&[PortRange]> {
        match &self.value {
            ResourceValue::Scalar(_) => None,
            ResourceValue::Ranges(r) => Some(r),
        }
    }
}
