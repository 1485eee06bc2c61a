use models::instance::Instance;
use models::offer::Offer;
use models::instance::TaskId;
use models::run_spec::PlacementConstraint;

/// Evaluates `constraints` against `offer` considering `peers`.
///
/// `exclude_task_id` lets the launch-on-reservation branch drop the task it
/// is about to relaunch from the peer set, so a uniqueness constraint does
/// not see the target task as a conflicting peer of itself.
pub fn satisfies_constraints(
    constraints: &[PlacementConstraint],
    offer: &Offer,
    peers: &[&Instance],
    exclude_task_id: Option<&TaskId>,
) -> bool {
    let relevant_peers: Vec<&&Instance> = peers
        .iter()
        .filter(|instance| match exclude_task_id {
            Some(excluded) => !instance.tasks.keys().any(|id| id == excluded),
            None => true,
        })
        .collect();

    constraints.iter().all(|constraint| match constraint {
        PlacementConstraint::UniqueHostname => {
            !relevant_peers.iter().any(|instance| instance.agent_info.hostname == offer.hostname)
        }
        PlacementConstraint::AttributeEquals { attribute, value } => {
            offer.attributes.get(attribute).map(|v| v == value).unwrap_or(false)
        }
        PlacementConstraint::MaxPerAttribute { attribute, max } => {
            let offer_value = match offer.attributes.get(attribute) {
                Some(v) => v,
                // The offer doesn't advertise the attribute at all: nothing to group by, so allow it.
                None => return true,
            };
            let existing = relevant_peers
                .iter()
                .filter(|instance| instance.agent_info.attributes.get(attribute) == Some(offer_value))
                .count();
            (existing as u32) < *max
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::instance::{AgentInfo, InstanceId, InstanceStatus, InstanceStatusKind};
    use models::run_spec::RunSpecId;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn peer(hostname: &str, task_id: &str) -> Instance {
        let now = Utc::now();
        let mut tasks = BTreeMap::new();
        tasks.insert(
            TaskId(task_id.to_string()),
            models::instance::Task::LaunchedEphemeral {
                task_id: TaskId(task_id.to_string()),
                agent_info: AgentInfo::new("agent-1", hostname),
                run_spec_version: now,
                status: InstanceStatus {
                    status: InstanceStatusKind::Running,
                    last_changed: now,
                    last_updated: now,
                    run_spec_version: now,
                    healthy: None,
                },
                host_ports: vec![],
                container_name: None,
            },
        );
        Instance {
            instance_id: InstanceId("/app.instance-1".to_string()),
            run_spec_id: RunSpecId("/app".to_string()),
            agent_info: AgentInfo::new("agent-1", hostname),
            state: InstanceStatus {
                status: InstanceStatusKind::Running,
                last_changed: now,
                last_updated: now,
                run_spec_version: now,
                healthy: None,
            },
            tasks,
        }
    }

    #[test]
    fn unique_hostname_rejects_repeat_host() {
        let offer = Offer::new("o1", "agent-1", "host-a");
        let existing = peer("host-a", "/app.t1");
        let peers: Vec<&Instance> = vec![&existing];
        assert!(!satisfies_constraints(&[PlacementConstraint::UniqueHostname], &offer, &peers, None));
    }

    #[test]
    fn unique_hostname_allows_distinct_host() {
        let offer = Offer::new("o1", "agent-2", "host-b");
        let existing = peer("host-a", "/app.t1");
        let peers: Vec<&Instance> = vec![&existing];
        assert!(satisfies_constraints(&[PlacementConstraint::UniqueHostname], &offer, &peers, None));
    }

    #[test]
    fn self_exclusion_lets_the_reserved_task_relaunch_on_its_own_host() {
        let offer = Offer::new("o1", "agent-1", "host-a");
        let existing = peer("host-a", "/app.t1");
        let peers: Vec<&Instance> = vec![&existing];
        let excluded = TaskId("/app.t1".to_string());
        assert!(satisfies_constraints(&[PlacementConstraint::UniqueHostname], &offer, &peers, Some(&excluded)));
    }
}
