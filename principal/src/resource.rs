use std::collections::BTreeSet;

use models::instance::Instance;
use models::offer::Offer;
use models::instance::TaskId;
use models::ops::{MatchedPort, MatchedScalar, MatchedVolume, ResourceMatch};
use models::resource::{DiskSource, OfferResource, ReservationLabels, Reservation, ResourceKind, Role};
use models::run_spec::{HostPortRequest, PersistentVolumeRequest, PlacementConstraint, ResourceDemand};

use crate::constraints::satisfies_constraints;

/// A predicate over individual offer resources, expressing which
/// roles/reservations are eligible for a given matching attempt.
#[derive(Debug, Clone)]
pub enum ResourceSelector {
    /// Only unreserved resources in the framework's role set.
    Reservable { accepted_roles: BTreeSet<Role> },
    /// Only resources dynamically reserved under `roles` whose labels match
    /// `labels` exactly.
    ReservedWithLabels { roles: BTreeSet<Role>, labels: ReservationLabels },
    /// Ordinary scheduling: any role in the accepted set, reserved or not.
    AnyRole { accepted_roles: BTreeSet<Role> },
}

fn role_allowed(accepted: &BTreeSet<Role>, role: &Role) -> bool {
    accepted.contains(role) || accepted.contains("*")
}

impl ResourceSelector {
    pub fn accepts(&self, resource: &OfferResource) -> bool {
        match self {
            ResourceSelector::Reservable { accepted_roles } => {
                resource.reservation.is_unreserved() && role_allowed(accepted_roles, &resource.role)
            }
            ResourceSelector::ReservedWithLabels { roles, labels } => match &resource.reservation {
                Reservation::Dynamic { role, labels: resource_labels } => {
                    role_allowed(roles, role) && resource_labels == labels
                }
                Reservation::Unreserved => false,
            },
            ResourceSelector::AnyRole { accepted_roles } => role_allowed(accepted_roles, &resource.role),
        }
    }

    pub fn allowed_roles(&self) -> &BTreeSet<Role> {
        match self {
            ResourceSelector::Reservable { accepted_roles } | ResourceSelector::AnyRole { accepted_roles } => accepted_roles,
            ResourceSelector::ReservedWithLabels { roles, .. } => roles,
        }
    }
}

/// Everything the matcher needs about a run spec's demand, decoupled from
/// whether it came from an `App` or a `Pod` container (matching operates over a
/// single flattened request either way).
#[derive(Debug, Clone)]
pub struct PortRequest {
    pub endpoint_name: Option<String>,
    pub container_port: Option<u32>,
    pub request: HostPortRequest,
}

#[derive(Debug, Clone)]
pub struct MatchRequest<'a> {
    pub demand: ResourceDemand,
    pub ports: Vec<PortRequest>,
    pub volumes: &'a [PersistentVolumeRequest],
    pub constraints: &'a [PlacementConstraint],
}

#[derive(Debug, Clone)]
struct ScalarSlot {
    index: usize,
    kind: ResourceKind,
    role: Role,
    reservation: Reservation,
    disk: Option<models::resource::DiskInfo>,
    remaining: f64,
}

fn scalar_sort_key(slot: &ScalarSlot) -> (Role, String, u8, usize, ordered_f64::NotNanF64) {
    let labels_key = slot
        .reservation
        .labels()
        .map(|l| format!("{:?}", l))
        .unwrap_or_default();
    let disk_key = match slot.disk.as_ref().map(|d| d.source) {
        Some(DiskSource::Root) => 0,
        Some(DiskSource::Mount) => 1,
        Some(DiskSource::Path) => 2,
        None => 3,
    };
    (slot.role.clone(), labels_key, disk_key, slot.index, ordered_f64::NotNanF64(slot.remaining))
}

/// Minimal wrapper so `f64` leftover amounts can take part in a deterministic
/// sort key (offer resources never carry NaN quantities).
mod ordered_f64 {
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct NotNanF64(pub f64);
    impl Eq for NotNanF64 {}
    impl PartialOrd for NotNanF64 {
        fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for NotNanF64 {
        fn cmp(&self, other: &Self) -> std::cmp::Ordering {
            self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
        }
    }
}

fn consume_scalar(
    pool: &mut [ScalarSlot],
    kind: ResourceKind,
    selector: &ResourceSelector,
    needed: f64,
) -> Option<Vec<MatchedScalar>> {
    if needed <= 0.0 {
        return Some(Vec::new());
    }

    let mut candidate_indices: Vec<usize> = pool
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.kind == kind && slot.remaining > 0.0 && selector.accepts(&as_offer_resource(slot)))
        .map(|(i, _)| i)
        .collect();

    // Prefer resources of smaller leftover first to reduce fragmentation;
    // tie-break deterministically by (role, reservation-labels,
    // disk-source-kind, resource order in offer).
    candidate_indices.sort_by_key(|&i| scalar_sort_key(&pool[i]));

    let mut remaining_needed = needed;
    let mut consumed = Vec::new();

    for idx in candidate_indices {
        if remaining_needed <= 0.0 {
            break;
        }
        let slot = &mut pool[idx];
        let take = remaining_needed.min(slot.remaining);
        if take <= 0.0 {
            continue;
        }
        slot.remaining -= take;
        remaining_needed -= take;
        consumed.push(MatchedScalar {
            kind,
            role: slot.role.clone(),
            reservation: slot.reservation.clone(),
            amount: take,
        });
    }

    if remaining_needed > 1e-9 {
        None
    } else {
        Some(consumed)
    }
}

fn as_offer_resource(slot: &ScalarSlot) -> OfferResource {
    OfferResource {
        kind: slot.kind,
        role: slot.role.clone(),
        reservation: slot.reservation.clone(),
        disk: slot.disk.clone(),
        value: models::resource::ResourceValue::Scalar(slot.remaining),
    }
}

#[derive(Debug, Clone)]
struct PortSlot {
    index: usize,
    role: Role,
    reservation: Reservation,
    begin: u32,
    end: u32,
    used: BTreeSet<u32>,
}

impl PortSlot {
    fn lowest_free(&self) -> Option<u32> {
        (self.begin..=self.end).find(|p| !self.used.contains(p))
    }

    fn contains_free(&self, port: u32) -> bool {
        port >= self.begin && port <= self.end && !self.used.contains(&port)
    }
}

fn assign_ports(
    pool: &mut [PortSlot],
    selector: &ResourceSelector,
    requests: &[PortRequest],
) -> Option<Vec<MatchedPort>> {
    let mut assigned = Vec::with_capacity(requests.len());

    for request in requests {
        let fixed = match request.request {
            HostPortRequest::Fixed(p) => Some(p),
            HostPortRequest::Any => None,
        };

        let mut candidate_indices: Vec<usize> = pool
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                selector.accepts(&OfferResource {
                    kind: ResourceKind::Ports,
                    role: slot.role.clone(),
                    reservation: slot.reservation.clone(),
                    disk: None,
                    value: models::resource::ResourceValue::Ranges(vec![]),
                })
            })
            .map(|(i, _)| i)
            .collect();

        // Lowest range first: sort by (begin, index) so ties are
        // reproducible regardless of hash/iteration order.
        candidate_indices.sort_by_key(|&i| (pool[i].begin, pool[i].index));

        let mut picked = None;
        for idx in candidate_indices {
            let slot = &pool[idx];
            match fixed {
                Some(p) if slot.contains_free(p) => {
                    picked = Some((idx, p));
                    break;
                }
                None => {
                    if let Some(p) = slot.lowest_free() {
                        picked = Some((idx, p));
                        break;
                    }
                }
                _ => continue,
            }
        }

        let (idx, port) = picked?;
        pool[idx].used.insert(port);
        assigned.push(MatchedPort {
            host_port: port,
            role: pool[idx].role.clone(),
            endpoint_name: request.endpoint_name.clone(),
        });
    }

    Some(assigned)
}

fn place_volumes(
    pool: &mut [ScalarSlot],
    selector: &ResourceSelector,
    volumes: &[PersistentVolumeRequest],
) -> Option<Vec<MatchedVolume>> {
    let mut placed = Vec::with_capacity(volumes.len());

    for volume in volumes {
        let mut candidate_indices: Vec<usize> = pool
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.kind == ResourceKind::Disk
                    && slot.remaining > 0.0
                    && slot.disk.as_ref().map(|d| d.source) == Some(volume.disk_source)
                    && selector.accepts(&as_offer_resource(slot))
            })
            .map(|(i, _)| i)
            .collect();

        candidate_indices.sort_by_key(|&i| scalar_sort_key(&pool[i]));

        let idx = candidate_indices
            .into_iter()
            .find(|&i| pool[i].remaining >= volume.size || volume.disk_source == DiskSource::Mount)?;

        let slot = &mut pool[idx];
        // Mount disks are indivisible: the whole fragment is consumed
        // regardless of the requested size.
        let consumed_size = if volume.disk_source == DiskSource::Mount { slot.remaining } else { volume.size };
        let existing_id = slot.disk.as_ref().and_then(|d| d.persistence_id.clone());
        slot.remaining -= consumed_size;

        placed.push(MatchedVolume {
            request_name: volume.name.clone(),
            disk_source: volume.disk_source,
            role: slot.role.clone(),
            reservation: slot.reservation.clone(),
            size: consumed_size,
            volume_id: existing_id,
        });
    }

    Some(placed)
}

/// The resource matcher: given an offer, a flattened resource
/// request, peer instances (for constraint evaluation), and a selector,
/// returns the concrete assignment of offer fragments to the request, or
/// `None` if the offer cannot satisfy it.
pub fn match_resources(
    offer: &Offer,
    request: &MatchRequest,
    peers: &[&Instance],
    selector: &ResourceSelector,
    exclude_task_id: Option<&TaskId>,
) -> Option<ResourceMatch> {
    // Step 1: constraint pre-filter, evaluated before resource arithmetic
    // because constraint failure is common and cheap.
    if !satisfies_constraints(request.constraints, offer, peers, exclude_task_id) {
        return None;
    }

    let mut scalar_pool: Vec<ScalarSlot> = offer
        .resources
        .iter()
        .enumerate()
        .filter_map(|(index, resource)| {
            resource.scalar().map(|amount| ScalarSlot {
                index,
                kind: resource.kind,
                role: resource.role.clone(),
                reservation: resource.reservation.clone(),
                disk: resource.disk.clone(),
                remaining: amount,
            })
        })
        .collect();

    let mut port_pool: Vec<PortSlot> = offer
        .resources
        .iter()
        .enumerate()
        .filter_map(|(index, resource)| {
            resource.ranges().map(|ranges| {
                ranges.iter().map(move |range| PortSlot {
                    index,
                    role: resource.role.clone(),
                    reservation: resource.reservation.clone(),
                    begin: range.begin,
                    end: range.end,
                    used: BTreeSet::new(),
                })
            })
        })
        .flatten()
        .collect();

    // Step 2: scalar consumption.
    let mut scalars = Vec::new();
    for (kind, needed) in [
        (ResourceKind::Cpu, request.demand.cpu),
        (ResourceKind::Mem, request.demand.mem),
        (ResourceKind::Disk, request.demand.disk),
        (ResourceKind::Gpu, request.demand.gpu),
    ] {
        scalars.extend(consume_scalar(&mut scalar_pool, kind, selector, needed)?);
    }

    // Step 3: port assignment.
    let ports = assign_ports(&mut port_pool, selector, &request.ports)?;

    // Step 4: persistent-volume placement.
    let volumes = place_volumes(&mut scalar_pool, selector, request.volumes)?;

    Some(ResourceMatch { scalars, ports, volumes })
}
