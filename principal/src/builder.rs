use std::collections::{BTreeMap, BTreeSet, VecDeque};

use models::instance::TaskId;
use models::ops::{CompiledHealthCheck, ExecutorInfo, MatchedScalar, PortMapping, ResourceMatch, TaskGroupInfo, TaskInfo};
use models::resource::{OfferResource, Reservation, ResourceKind, ResourceValue, Role};
use models::run_spec::{ContainerSpec, Endpoint, HealthCheckSpec, PodContainerSpec, ResourceDemand};

/// Hook for plugin-authored mutations applied after a task (or task group) is
/// built. Plugins are applied left-to-right and may never fail the
/// pipeline: both hooks are infallible by signature.
pub trait RunSpecTaskProcessor: Send + Sync {
    fn process_task_info(&self, _task_info: &mut TaskInfo) {}
    fn process_task_group(&self, _task_group: &mut TaskGroupInfo) {}
}

#[derive(Debug, Clone, Default)]
pub struct BuilderConfig {
    pub accepted_roles: BTreeSet<Role>,
    pub env_vars_prefix: Option<String>,
}

fn env_name(prefix: &Option<String>, name: &str) -> String {
    match prefix {
        Some(p) => format!("{p}{name}"),
        None => name.to_string(),
    }
}

fn compile_health_check(spec: &HealthCheckSpec) -> CompiledHealthCheck {
    match spec {
        HealthCheckSpec::Command(cmd) => CompiledHealthCheck::Command(cmd.clone()),
        HealthCheckSpec::Endpoint { endpoint_name, protocol, path } => {
            CompiledHealthCheck::EndpointAssociation { endpoint_name: endpoint_name.clone(), protocol: *protocol, path: path.clone() }
        }
    }
}

/// Zips `endpoints` that declared a `hostPort` against matched ports drawn
/// from `queue`, in declaration order. Endpoints without a requested
/// host port receive no mapping.
fn take_port_mappings(endpoints: &[Endpoint], queue: &mut VecDeque<models::ops::MatchedPort>) -> Vec<PortMapping> {
    endpoints
        .iter()
        .filter(|e| e.host_port.is_some())
        .filter_map(|e| {
            queue.pop_front().map(|matched| PortMapping {
                endpoint_name: e.name.clone(),
                container_port: e.container_port,
                host_port: matched.host_port,
                role: matched.role,
            })
        })
        .collect()
}

fn scalars_by_kind(scalars: &[MatchedScalar]) -> BTreeMap<ResourceKind, VecDeque<MatchedScalar>> {
    let mut queues: BTreeMap<ResourceKind, VecDeque<MatchedScalar>> = BTreeMap::new();
    for s in scalars {
        queues.entry(s.kind).or_default().push_back(s.clone());
    }
    queues
}

/// Splits the pod's combined matched scalars out to each container according
/// to its own declared demand, in the same left-to-right order the matcher
/// used to consume them, so a fragment spanning more than
/// one container's need is split rather than duplicated.
fn slice_scalars_by_demand(scalars: &[MatchedScalar], demands: &[ResourceDemand]) -> Vec<Vec<MatchedScalar>> {
    let mut queues = scalars_by_kind(scalars);
    let mut result = vec![Vec::new(); demands.len()];

    for (i, demand) in demands.iter().enumerate() {
        for (kind, amount) in [
            (ResourceKind::Cpu, demand.cpu),
            (ResourceKind::Mem, demand.mem),
            (ResourceKind::Disk, demand.disk),
            (ResourceKind::Gpu, demand.gpu),
        ] {
            let mut needed = amount;
            if needed <= 0.0 {
                continue;
            }
            let Some(queue) = queues.get_mut(&kind) else { continue };
            while needed > 1e-9 {
                let Some(mut front) = queue.pop_front() else { break };
                if front.amount <= needed + 1e-9 {
                    needed -= front.amount;
                    result[i].push(front);
                } else {
                    let mut taken = front.clone();
                    taken.amount = needed;
                    front.amount -= needed;
                    result[i].push(taken);
                    queue.push_front(front);
                    needed = 0.0;
                }
            }
        }
    }

    result
}

fn to_offer_resource(s: &MatchedScalar) -> OfferResource {
    OfferResource { kind: s.kind, role: s.role.clone(), reservation: s.reservation.clone(), disk: None, value: ResourceValue::Scalar(s.amount) }
}

fn build_env(container: &ContainerSpec, config: &BuilderConfig) -> Vec<(String, String)> {
    container.env.iter().map(|(k, v)| (env_name(&config.env_vars_prefix, k), v.clone())).collect()
}

/// Builds a single task's wire payload for an app run spec.
pub fn build_task_info(
    task_id: TaskId,
    agent_id: &str,
    container: &ContainerSpec,
    resource_match: &ResourceMatch,
    config: &BuilderConfig,
    processors: &[Box<dyn RunSpecTaskProcessor>],
) -> TaskInfo {
    let mut port_queue: VecDeque<_> = resource_match.ports.clone().into();
    let port_mappings = take_port_mappings(&container.endpoints, &mut port_queue);

    let mut task_info = TaskInfo {
        task_id,
        name: container.name.clone(),
        agent_id: agent_id.to_string(),
        resources: resource_match.as_offer_resources(),
        command: container.command.clone(),
        image: container.image.clone(),
        env: build_env(container, config),
        container_name: Some(container.name.clone()),
        health_check: container.health_check.as_ref().map(compile_health_check),
        port_mappings,
    };

    for processor in processors {
        processor.process_task_info(&mut task_info);
    }

    task_info
}

/// Builds the shared executor plus one `TaskInfo` per container for a pod
/// run spec. `task_ids` must be the same length as `containers`, in
/// the same order; `resource_match` is the combined match over the pod's
/// total demand.
pub fn build_task_group(
    containers: &[PodContainerSpec],
    task_ids: &[TaskId],
    agent_id: &str,
    executor_id: String,
    resource_match: &ResourceMatch,
    config: &BuilderConfig,
    processors: &[Box<dyn RunSpecTaskProcessor>],
) -> (ExecutorInfo, TaskGroupInfo) {
    let demands: Vec<ResourceDemand> = containers.iter().map(|c| c.resources).collect();
    let per_container_scalars = slice_scalars_by_demand(&resource_match.scalars, &demands);
    let mut port_queue: VecDeque<_> = resource_match.ports.clone().into();

    let mut tasks = Vec::with_capacity(containers.len());
    for ((container, task_id), scalars) in containers.iter().zip(task_ids.iter()).zip(per_container_scalars) {
        let port_mappings = take_port_mappings(&container.container.endpoints, &mut port_queue);

        let mut task_info = TaskInfo {
            task_id: task_id.clone(),
            name: container.container.name.clone(),
            agent_id: agent_id.to_string(),
            resources: scalars.iter().map(to_offer_resource).collect(),
            command: container.container.command.clone(),
            image: container.container.image.clone(),
            env: build_env(&container.container, config),
            container_name: Some(container.container.name.clone()),
            health_check: container.container.health_check.as_ref().map(compile_health_check),
            port_mappings,
        };

        for processor in processors {
            processor.process_task_info(&mut task_info);
        }

        tasks.push(task_info);
    }

    let mut task_group_info = TaskGroupInfo { tasks };
    for processor in processors {
        processor.process_task_group(&mut task_group_info);
    }

    let executor_info = ExecutorInfo { executor_id, agent_id: agent_id.to_string(), resources: resource_match.as_offer_resources() };

    (executor_info, task_group_info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::ops::MatchedPort;
    use models::run_spec::{Endpoint, HostPortRequest};

    fn scalar(kind: ResourceKind, amount: f64) -> MatchedScalar {
        MatchedScalar { kind, role: "*".to_string(), reservation: Reservation::Unreserved, amount }
    }

    #[test]
    fn slices_a_combined_fragment_across_two_containers() {
        let scalars = vec![scalar(ResourceKind::Cpu, 1.0)];
        let demands = vec![
            ResourceDemand { cpu: 0.4, mem: 0.0, disk: 0.0, gpu: 0.0 },
            ResourceDemand { cpu: 0.6, mem: 0.0, disk: 0.0, gpu: 0.0 },
        ];
        let sliced = slice_scalars_by_demand(&scalars, &demands);
        assert_eq!(sliced[0][0].amount, 0.4);
        assert_eq!(sliced[1][0].amount, 0.6);
    }

    #[test]
    fn port_mappings_zip_in_declaration_order() {
        let endpoints = vec![
            Endpoint { name: "http".into(), container_port: Some(80), host_port: Some(HostPortRequest::Any) },
            Endpoint { name: "metrics".into(), container_port: Some(9000), host_port: None },
            Endpoint { name: "grpc".into(), container_port: Some(9090), host_port: Some(HostPortRequest::Any) },
        ];
        let mut queue: VecDeque<MatchedPort> = VecDeque::from(vec![
            MatchedPort { host_port: 31000, role: "*".to_string(), endpoint_name: None },
            MatchedPort { host_port: 31001, role: "*".to_string(), endpoint_name: None },
        ]);
        let mappings = take_port_mappings(&endpoints, &mut queue);
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].endpoint_name, "http");
        assert_eq!(mappings[0].host_port, 31000);
        assert_eq!(mappings[1].endpoint_name, "grpc");
        assert_eq!(mappings[1].host_port, 31001);
    }

    #[test]
    fn plugin_mutation_is_applied_after_build() {
        struct TagIt;
        impl RunSpecTaskProcessor for TagIt {
            fn process_task_info(&self, task_info: &mut TaskInfo) {
                task_info.env.push(("TAGGED".to_string(), "1".to_string()));
            }
        }

        let container = ContainerSpec { name: "c".into(), image: Some("img".into()), ..Default::default() };
        let resource_match = ResourceMatch::default();
        let config = BuilderConfig::default();
        let processors: Vec<Box<dyn RunSpecTaskProcessor>> = vec![Box::new(TagIt)];

        let task_info = build_task_info(TaskId("/app.t1".to_string()), "agent-1", &container, &resource_match, &config, &processors);
        assert!(task_info.env.contains(&("TAGGED".to_string(), "1".to_string())));
    }
}
