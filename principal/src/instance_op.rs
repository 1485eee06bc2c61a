use std::collections::BTreeSet;

use tracing::{debug, debug_span, warn};

use models::instance::{AgentInfo, Instance, InstanceId, InstanceStatus, InstanceStatusKind, ReservationState, Task, TaskId, Timeout, TimeoutReason};
use models::offer::Offer;
use models::ops::{InstanceOp, LocalVolume, StateOp};
use models::resource::{reservation_labels, Reservation as ResourceReservation, Role};
use models::run_spec::{AppSpec, PodSpec, RunSpec};

use crate::builder::{build_task_group, build_task_info, BuilderConfig, RunSpecTaskProcessor};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::error::CoreError;
use crate::resource::{match_resources, MatchRequest, PortRequest, ResourceSelector};
use crate::volume::match_volumes;

/// Bundles everything `build_instance_op` needs.
pub struct BuildRequest<'a> {
    pub run_spec: &'a RunSpec,
    pub offer: &'a Offer,
    pub current_instances: &'a [&'a Instance],
    pub additional_launches: u32,
    pub framework_id: &'a str,
}

fn port_requests(endpoints: &[models::run_spec::Endpoint]) -> Vec<PortRequest> {
    endpoints
        .iter()
        .filter_map(|e| {
            e.host_port.map(|request| PortRequest { endpoint_name: Some(e.name.clone()), container_port: e.container_port, request })
        })
        .collect()
}

fn builder_config(accepted_roles: &BTreeSet<Role>, config: &SchedulerConfig) -> BuilderConfig {
    BuilderConfig { accepted_roles: accepted_roles.clone(), env_vars_prefix: config.env_vars_prefix.clone() }
}

/// A freshly minted status always has `last_updated == last_changed`: the
/// `last_updated_equals_last_changed` flag only matters on a no-op refresh of
/// an existing status, which happens in the caller's reconciliation loop, not
/// here.
fn fresh_status(clock: &dyn Clock, run_spec_version: chrono::DateTime<chrono::Utc>, _config: &SchedulerConfig) -> InstanceStatus {
    let now = clock.now();
    InstanceStatus { status: InstanceStatusKind::Created, last_changed: now, last_updated: now, run_spec_version, healthy: None }
}

/// The instance-op factory entry point. Returns `Ok(None)` on a normal
/// mismatch, never an error: a mismatch is not an error kind, just the
/// "no operation" outcome.
pub fn build_instance_op(
    request: &BuildRequest,
    config: &SchedulerConfig,
    clock: &dyn Clock,
    processors: &[Box<dyn RunSpecTaskProcessor>],
) -> Result<Option<InstanceOp>, CoreError> {
    let _span = debug_span!("build_instance_op", run_spec_id = %request.run_spec.id()).entered();

    match request.run_spec {
        RunSpec::App(app) if !app.is_resident() => Ok(infer_ephemeral_app(request, app, config, clock, processors)),
        RunSpec::App(app) => infer_stateful(request, app, config, clock, processors),
        RunSpec::Pod(pod) => Ok(infer_pod_instance(request, pod, config, clock, processors)),
    }
}

fn infer_ephemeral_app(
    request: &BuildRequest,
    app: &AppSpec,
    config: &SchedulerConfig,
    clock: &dyn Clock,
    processors: &[Box<dyn RunSpecTaskProcessor>],
) -> Option<InstanceOp> {
    let accepted_roles = config.effective_accepted_roles(&app.accepted_roles).clone();
    let selector = ResourceSelector::AnyRole { accepted_roles: accepted_roles.clone() };

    let match_request = MatchRequest {
        demand: app.resources,
        ports: port_requests(&app.container.endpoints),
        volumes: &app.volumes,
        constraints: &app.constraints,
    };

    let resource_match = match match_resources(request.offer, &match_request, request.current_instances, &selector, None) {
        Some(m) => m,
        None => {
            debug!(reason = "insufficient resources", "resource match failed");
            return None;
        }
    };

    let task_id = TaskId::for_run_spec(&app.id);
    let cfg = builder_config(&accepted_roles, config);
    let task_info = build_task_info(task_id.clone(), &request.offer.agent_id, &app.container, &resource_match, &cfg, processors);

    let agent_info = AgentInfo::new(request.offer.agent_id.clone(), request.offer.hostname.clone()).with_attributes(request.offer.attributes.clone());
    let status = fresh_status(clock, app.version, config);
    let task = Task::LaunchedEphemeral {
        task_id,
        agent_info,
        run_spec_version: app.version,
        status,
        host_ports: resource_match.host_ports(),
        container_name: None,
    };

    Some(InstanceOp::LaunchEphemeral { task_info, task })
}

fn infer_pod_instance(
    request: &BuildRequest,
    pod: &PodSpec,
    config: &SchedulerConfig,
    clock: &dyn Clock,
    processors: &[Box<dyn RunSpecTaskProcessor>],
) -> Option<InstanceOp> {
    let accepted_roles = config.effective_accepted_roles(&pod.accepted_roles).clone();
    let selector = ResourceSelector::AnyRole { accepted_roles: accepted_roles.clone() };

    let all_endpoints: Vec<models::run_spec::Endpoint> =
        pod.containers.iter().flat_map(|c| c.container.endpoints.clone()).collect();

    let match_request = MatchRequest {
        demand: pod.total_resources(),
        ports: port_requests(&all_endpoints),
        volumes: &[],
        constraints: &pod.constraints,
    };

    let resource_match = match match_resources(request.offer, &match_request, request.current_instances, &selector, None) {
        Some(m) => m,
        None => {
            debug!(reason = "insufficient resources", "resource match failed");
            return None;
        }
    };

    let task_ids: Vec<TaskId> = pod.containers.iter().map(|_| TaskId::for_run_spec(&pod.id)).collect();
    let cfg = builder_config(&accepted_roles, config);
    let executor_id = format!("{}.executor-{}", pod.id, uuid::Uuid::new_v4().simple());

    let (executor_info, task_group_info) =
        build_task_group(&pod.containers, &task_ids, &request.offer.agent_id, executor_id, &resource_match, &cfg, processors);

    let agent_info = AgentInfo::new(request.offer.agent_id.clone(), request.offer.hostname.clone()).with_attributes(request.offer.attributes.clone());
    let status = fresh_status(clock, pod.version, config);
    let host_ports = resource_match.host_ports();

    let mut tasks = std::collections::BTreeMap::new();
    for ((container, task_id), task_info) in pod.containers.iter().zip(task_ids.iter()).zip(task_group_info.tasks.iter()) {
        let task_host_ports = if config.pod_tasks_carry_host_ports {
            task_info.port_mappings.iter().map(|m| m.host_port).collect()
        } else {
            Vec::new()
        };
        tasks.insert(
            task_id.clone(),
            Task::LaunchedEphemeral {
                task_id: task_id.clone(),
                agent_info: agent_info.clone(),
                run_spec_version: pod.version,
                status: status.clone(),
                host_ports: task_host_ports,
                container_name: Some(container.container.name.clone()),
            },
        );
    }

    let instance = Instance {
        instance_id: InstanceId::for_run_spec(&pod.id),
        run_spec_id: pod.id.clone(),
        agent_info,
        state: status,
        tasks,
    };

    Some(InstanceOp::LaunchGroup { executor_info, task_group_info, instance, host_ports })
}

fn infer_stateful(
    request: &BuildRequest,
    app: &AppSpec,
    config: &SchedulerConfig,
    clock: &dyn Clock,
    processors: &[Box<dyn RunSpecTaskProcessor>],
) -> Result<Option<InstanceOp>, CoreError> {
    if request.additional_launches > 0 {
        let reserved_candidates: Vec<&Instance> =
            request.current_instances.iter().filter(|i| i.tasks.values().any(Task::is_reserved)).copied().collect();

        if !reserved_candidates.is_empty() {
            if let Some(op) = try_launch_on_reservation(request, app, config, clock, processors, &reserved_candidates)? {
                return Ok(Some(op));
            }
        }
    }

    if count_waiting_reservations(request.current_instances) < request.additional_launches {
        return Ok(try_reserve_and_create_volumes(request, app, config, clock));
    }

    Ok(None)
}

fn count_waiting_reservations(instances: &[&Instance]) -> u32 {
    instances.iter().flat_map(|i| i.tasks.values()).filter(|t| t.is_reserved()).count() as u32
}

fn try_launch_on_reservation(
    request: &BuildRequest,
    app: &AppSpec,
    config: &SchedulerConfig,
    clock: &dyn Clock,
    processors: &[Box<dyn RunSpecTaskProcessor>],
    reserved_candidates: &[&Instance],
) -> Result<Option<InstanceOp>, CoreError> {
    let volume_match = match match_volumes(request.offer, reserved_candidates) {
        Some(v) => v,
        None => return Ok(None),
    };

    let accepted_roles = config.effective_accepted_roles(&app.accepted_roles).clone();
    let mut roles = BTreeSet::new();
    roles.insert(config.mesos_role.clone().unwrap_or_else(|| "*".to_string()));

    let labels = reservation_labels(request.framework_id, &volume_match.reserved_task_id.0);
    let selector = ResourceSelector::ReservedWithLabels { roles, labels };

    let match_request = MatchRequest {
        demand: app.resources,
        ports: port_requests(&app.container.endpoints),
        volumes: &[],
        constraints: &app.constraints,
    };

    let resource_match = match match_resources(
        request.offer,
        &match_request,
        request.current_instances,
        &selector,
        Some(&volume_match.reserved_task_id),
    ) {
        Some(m) => m,
        None => {
            debug!(reason = "insufficient resources for launch-on-reservation", "resource match failed");
            return Ok(None);
        }
    };

    let cfg = builder_config(&accepted_roles, config);
    let task_id = volume_match.reserved_task_id.clone();
    let task_info = build_task_info(task_id.clone(), &request.offer.agent_id, &app.container, &resource_match, &cfg, processors);

    let status = fresh_status(clock, app.version, config);
    let host_ports = resource_match.host_ports();

    let reservation = models::instance::Reservation { volume_ids: volume_match.volume_ids.clone(), state: ReservationState::Launched };
    let agent_info = AgentInfo::new(request.offer.agent_id.clone(), request.offer.hostname.clone()).with_attributes(request.offer.attributes.clone());

    let task = Task::LaunchedOnReservation {
        task_id: task_id.clone(),
        agent_info,
        run_spec_version: app.version,
        status: status.clone(),
        host_ports: host_ports.clone(),
        reservation,
    };

    let state_op = StateOp::Launch {
        instance_id: InstanceId::for_run_spec(&app.id),
        run_spec_version: app.version,
        status,
        host_ports,
    };

    Ok(Some(InstanceOp::LaunchOnReservation { task_info, state_op, task }))
}

fn try_reserve_and_create_volumes(
    request: &BuildRequest,
    app: &AppSpec,
    config: &SchedulerConfig,
    clock: &dyn Clock,
) -> Option<InstanceOp> {
    let declared = config.effective_accepted_roles(&app.accepted_roles);
    let unreserved_eligible: BTreeSet<Role> = declared.iter().cloned().collect();

    if unreserved_eligible.is_empty() {
        warn!(run_spec_id = %app.id, "no unreserved-eligible role for stateful reservation");
        return None;
    }

    let selector = ResourceSelector::Reservable { accepted_roles: unreserved_eligible };

    let match_request = MatchRequest { demand: app.resources, ports: vec![], volumes: &app.volumes, constraints: &app.constraints };

    let resource_match = match match_resources(request.offer, &match_request, request.current_instances, &selector, None) {
        Some(m) => m,
        None => {
            debug!(reason = "insufficient resources for reservation", "resource match failed");
            return None;
        }
    };

    let task_id = TaskId::for_run_spec(&app.id);
    let now = clock.now();
    let deadline = now + config.task_reservation_timeout;
    let timeout = Timeout { initiated: now, deadline, reason: TimeoutReason::ReservationTimeout };

    let volume_ids: Vec<String> = resource_match
        .volumes
        .iter()
        .map(|v| v.volume_id.clone().unwrap_or_else(|| uuid::Uuid::new_v4().to_string()))
        .collect();

    let agent_info = AgentInfo::new(request.offer.agent_id.clone(), request.offer.hostname.clone()).with_attributes(request.offer.attributes.clone());

    let reservation = models::instance::Reservation { volume_ids: volume_ids.clone(), state: ReservationState::New(Some(timeout)) };
    let task = Task::Reserved { task_id, agent_info, reservation, reserved_at: now };

    let local_volumes: Vec<LocalVolume> = resource_match
        .volumes
        .iter()
        .zip(volume_ids.iter())
        .map(|(v, id)| LocalVolume { volume_id: id.clone(), disk_source: v.disk_source, size: v.size })
        .collect();

    let labels = reservation_labels(request.framework_id, &task.task_id().0);
    let resources = resource_match
        .as_offer_resources()
        .into_iter()
        .map(|mut r| {
            if let Some(role) = config.mesos_role.clone() {
                r.reservation = ResourceReservation::Dynamic { role, labels: labels.clone() };
            } else if !r.reservation.is_unreserved() {
                // already reserved fragment kept as-is
            } else {
                r.reservation = ResourceReservation::Dynamic { role: r.role.clone(), labels: labels.clone() };
            }
            r
        })
        .collect();

    Some(InstanceOp::ReserveAndCreateVolumes {
        framework_id: request.framework_id.to_string(),
        state_op: StateOp::Reserve { task },
        resources,
        local_volumes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use chrono::Utc;
    use models::offer::Offer;
    use models::resource::{DiskSource, OfferResource, PortRange, Reservation as ResRes, ResourceKind, ResourceValue};
    use models::run_spec::{ContainerSpec, PersistentVolumeRequest, PodContainerSpec, ResourceDemand, RunSpecId};
    use std::collections::BTreeSet;

    fn base_app(resident: bool) -> AppSpec {
        let mut roles = BTreeSet::new();
        roles.insert("*".to_string());
        AppSpec {
            id: RunSpecId("/app".to_string()),
            version: Utc::now(),
            resources: ResourceDemand { cpu: 0.2, mem: 16.0, disk: 0.0, gpu: 0.0 },
            accepted_roles: roles,
            container: ContainerSpec { name: "app".into(), image: None, command: Some("sleep 600".into()), ..Default::default() },
            volumes: if resident { vec![PersistentVolumeRequest { name: "data".into(), size: 100.0, disk_source: DiskSource::Root }] } else { vec![] },
            constraints: vec![],
        }
    }

    fn sufficient_offer() -> Offer {
        Offer::new("o1", "agent-1", "host-a")
            .with_resource(OfferResource { kind: ResourceKind::Cpu, role: "*".into(), reservation: ResRes::Unreserved, disk: None, value: ResourceValue::Scalar(1.0) })
            .with_resource(OfferResource { kind: ResourceKind::Mem, role: "*".into(), reservation: ResRes::Unreserved, disk: None, value: ResourceValue::Scalar(1024.0) })
            .with_resource(OfferResource { kind: ResourceKind::Ports, role: "*".into(), reservation: ResRes::Unreserved, disk: None, value: ResourceValue::Ranges(vec![PortRange::new(31000, 31100)]) })
    }

    #[test]
    fn s1_app_offer_sufficient_produces_launch_ephemeral() {
        let app = base_app(false);
        let run_spec = RunSpec::App(app);
        let offer = sufficient_offer();
        let config = SchedulerConfig::default();
        let clock = FixedClock(Utc::now());
        let instances: Vec<&Instance> = vec![];
        let request = BuildRequest { run_spec: &run_spec, offer: &offer, current_instances: &instances, additional_launches: 1, framework_id: "fw-1" };

        let op = build_instance_op(&request, &config, &clock, &[]).unwrap().expect("should match");
        match op {
            InstanceOp::LaunchEphemeral { task, .. } => {
                assert!(matches!(task, Task::LaunchedEphemeral { status, host_ports, .. } if status.status == InstanceStatusKind::Created && host_ports.is_empty()));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn s2_app_offer_insufficient_memory_yields_no_operation() {
        let app = base_app(false);
        let run_spec = RunSpec::App(app);
        let mut offer = sufficient_offer();
        offer.resources[1] = OfferResource { kind: ResourceKind::Mem, role: "*".into(), reservation: ResRes::Unreserved, disk: None, value: ResourceValue::Scalar(8.0) };
        let config = SchedulerConfig::default();
        let clock = FixedClock(Utc::now());
        let instances: Vec<&Instance> = vec![];
        let request = BuildRequest { run_spec: &run_spec, offer: &offer, current_instances: &instances, additional_launches: 1, framework_id: "fw-1" };

        let op = build_instance_op(&request, &config, &clock, &[]).unwrap();
        assert!(op.is_none());
    }

    #[test]
    fn s3_pod_with_two_containers_produces_launch_group() {
        let mut roles = BTreeSet::new();
        roles.insert("*".to_string());
        let pod = PodSpec {
            id: RunSpecId("/pod".to_string()),
            version: Utc::now(),
            accepted_roles: roles,
            containers: vec![
                PodContainerSpec { resources: ResourceDemand { cpu: 0.1, mem: 32.0, disk: 0.0, gpu: 0.0 }, container: ContainerSpec { name: "task1".into(), ..Default::default() } },
                PodContainerSpec { resources: ResourceDemand { cpu: 0.1, mem: 32.0, disk: 0.0, gpu: 0.0 }, container: ContainerSpec { name: "task2".into(), ..Default::default() } },
            ],
            constraints: vec![],
        };
        let run_spec = RunSpec::Pod(pod);
        let offer = Offer::new("o1", "agent-1", "host-a")
            .with_resource(OfferResource { kind: ResourceKind::Cpu, role: "*".into(), reservation: ResRes::Unreserved, disk: None, value: ResourceValue::Scalar(1.0) })
            .with_resource(OfferResource { kind: ResourceKind::Mem, role: "*".into(), reservation: ResRes::Unreserved, disk: None, value: ResourceValue::Scalar(256.0) });
        let config = SchedulerConfig::default();
        let clock = FixedClock(Utc::now());
        let instances: Vec<&Instance> = vec![];
        let request = BuildRequest { run_spec: &run_spec, offer: &offer, current_instances: &instances, additional_launches: 1, framework_id: "fw-1" };

        let op = build_instance_op(&request, &config, &clock, &[]).unwrap().expect("should match");
        match op {
            InstanceOp::LaunchGroup { task_group_info, instance, .. } => {
                assert_eq!(task_group_info.tasks.len(), 2);
                assert_eq!(instance.tasks.len(), 2);
                assert!(instance.tasks.values().all(|t| matches!(t, Task::LaunchedEphemeral { status, .. } if status.status == InstanceStatusKind::Created)));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn pod_tasks_carry_host_ports_slices_ports_per_container() {
        use models::run_spec::{Endpoint, HostPortRequest};

        let mut roles = BTreeSet::new();
        roles.insert("*".to_string());
        let pod = PodSpec {
            id: RunSpecId("/pod".to_string()),
            version: Utc::now(),
            accepted_roles: roles,
            containers: vec![
                PodContainerSpec {
                    resources: ResourceDemand { cpu: 0.1, mem: 32.0, disk: 0.0, gpu: 0.0 },
                    container: ContainerSpec {
                        name: "task1".into(),
                        endpoints: vec![Endpoint { name: "http".into(), container_port: Some(80), host_port: Some(HostPortRequest::Any) }],
                        ..Default::default()
                    },
                },
                PodContainerSpec {
                    resources: ResourceDemand { cpu: 0.1, mem: 32.0, disk: 0.0, gpu: 0.0 },
                    container: ContainerSpec {
                        name: "task2".into(),
                        endpoints: vec![Endpoint { name: "grpc".into(), container_port: Some(9090), host_port: Some(HostPortRequest::Any) }],
                        ..Default::default()
                    },
                },
            ],
            constraints: vec![],
        };
        let run_spec = RunSpec::Pod(pod);
        let offer = Offer::new("o1", "agent-1", "host-a")
            .with_resource(OfferResource { kind: ResourceKind::Cpu, role: "*".into(), reservation: ResRes::Unreserved, disk: None, value: ResourceValue::Scalar(1.0) })
            .with_resource(OfferResource { kind: ResourceKind::Mem, role: "*".into(), reservation: ResRes::Unreserved, disk: None, value: ResourceValue::Scalar(256.0) })
            .with_resource(OfferResource {
                kind: ResourceKind::Ports,
                role: "*".into(),
                reservation: ResRes::Unreserved,
                disk: None,
                value: ResourceValue::Ranges(vec![PortRange::new(31000, 31001)]),
            });
        let mut config = SchedulerConfig::default();
        config.pod_tasks_carry_host_ports = true;
        let clock = FixedClock(Utc::now());
        let instances: Vec<&Instance> = vec![];
        let request = BuildRequest { run_spec: &run_spec, offer: &offer, current_instances: &instances, additional_launches: 1, framework_id: "fw-1" };

        let op = build_instance_op(&request, &config, &clock, &[]).unwrap().expect("should match");
        match op {
            InstanceOp::LaunchGroup { instance, .. } => {
                for task in instance.tasks.values() {
                    match task {
                        Task::LaunchedEphemeral { host_ports, .. } => assert_eq!(host_ports.len(), 1, "each task should carry only its own port"),
                        other => panic!("unexpected task: {:?}", other),
                    }
                }
                let all_ports: BTreeSet<u32> = instance
                    .tasks
                    .values()
                    .flat_map(|t| match t {
                        Task::LaunchedEphemeral { host_ports, .. } => host_ports.clone(),
                        _ => vec![],
                    })
                    .collect();
                assert_eq!(all_ports, BTreeSet::from([31000, 31001]));
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }

    #[test]
    fn s4_stateful_reserve_with_no_existing_reservation() {
        let app = base_app(true);
        let run_spec = RunSpec::App(app);
        let offer = Offer::new("o1", "agent-1", "host-a").with_resource(OfferResource {
            kind: ResourceKind::Disk,
            role: "*".into(),
            reservation: ResRes::Unreserved,
            disk: Some(models::resource::DiskInfo { source: DiskSource::Root, persistence_id: None }),
            value: ResourceValue::Scalar(200.0),
        });
        let config = SchedulerConfig::default();
        let now = Utc::now();
        let clock = FixedClock(now);
        let instances: Vec<&Instance> = vec![];
        let request = BuildRequest { run_spec: &run_spec, offer: &offer, current_instances: &instances, additional_launches: 1, framework_id: "fw-1" };

        let op = build_instance_op(&request, &config, &clock, &[]).unwrap().expect("should reserve");
        match op {
            InstanceOp::ReserveAndCreateVolumes { state_op, local_volumes, .. } => {
                assert_eq!(local_volumes.len(), 1);
                match state_op {
                    StateOp::Reserve { task } => {
                        assert!(matches!(task, Task::Reserved { reservation, .. } if matches!(reservation.state, ReservationState::New(Some(t)) if t.deadline == now + config.task_reservation_timeout)));
                    }
                    _ => panic!("expected Reserve state op"),
                }
            }
            other => panic!("unexpected op: {:?}", other),
        }
    }
}
