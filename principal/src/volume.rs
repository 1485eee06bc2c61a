use models::instance::{Instance, Task};
use models::offer::Offer;
use models::ops::VolumeMatch;
use models::resource::ResourceKind;

/// The persistent-volume matcher: finds the `Reserved` task among
/// `candidates` whose reservation volume ids are all present as persistent
/// disk fragments on `offer`.
///
/// When more than one candidate qualifies, the earliest-reserved task wins;
/// ties are broken by task id so the choice never depends on map iteration
/// order.
pub fn match_volumes<'a>(offer: &Offer, candidates: &[&'a Instance]) -> Option<VolumeMatch> {
    let offer_volume_ids: Vec<&str> = offer
        .resources
        .iter()
        .filter(|r| r.kind == ResourceKind::Disk)
        .filter_map(|r| r.disk.as_ref().and_then(|d| d.persistence_id.as_deref()))
        .collect();

    let mut qualifying: Vec<VolumeMatch> = Vec::new();

    for instance in candidates {
        for task in instance.tasks.values() {
            if let Task::Reserved { task_id, agent_info, reservation, reserved_at } = task {
                if !reservation.volume_ids.is_empty()
                    && reservation.volume_ids.iter().all(|id| offer_volume_ids.contains(&id.as_str()))
                {
                    qualifying.push(VolumeMatch {
                        reserved_task_id: task_id.clone(),
                        reserved_agent_info: agent_info.clone(),
                        reserved_at: *reserved_at,
                        volume_ids: reservation.volume_ids.clone(),
                    });
                }
            }
        }
    }

    qualifying.sort_by(|a, b| a.reserved_at.cmp(&b.reserved_at).then_with(|| a.reserved_task_id.cmp(&b.reserved_task_id)));

    qualifying.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use models::instance::{AgentInfo, InstanceId, InstanceStatus, InstanceStatusKind, Reservation, ReservationState, TaskId};
    use models::offer::Offer;
    use models::resource::{DiskInfo, DiskSource, OfferResource, Reservation as ResourceReservation, ResourceValue};
    use models::run_spec::RunSpecId;
    use std::collections::BTreeMap;

    fn reserved_task(task_id: &str, volume_ids: Vec<&str>, reserved_at: chrono::DateTime<Utc>) -> Task {
        Task::Reserved {
            task_id: TaskId(task_id.to_string()),
            agent_info: AgentInfo::new("agent-1", "host-a"),
            reservation: Reservation { volume_ids: volume_ids.into_iter().map(String::from).collect(), state: ReservationState::New(None) },
            reserved_at,
        }
    }

    fn instance_with(run_spec_id: &str, task: Task) -> Instance {
        let now = Utc::now();
        let mut tasks = BTreeMap::new();
        tasks.insert(task.task_id().clone(), task);
        Instance {
            instance_id: InstanceId(format!("{}.instance-1", run_spec_id)),
            run_spec_id: RunSpecId(run_spec_id.to_string()),
            agent_info: AgentInfo::new("agent-1", "host-a"),
            state: InstanceStatus { status: InstanceStatusKind::Reserved, last_changed: now, last_updated: now, run_spec_version: now, healthy: None },
            tasks,
        }
    }

    fn disk_offer(volume_id: &str) -> Offer {
        Offer::new("o1", "agent-1", "host-a").with_resource(OfferResource {
            kind: ResourceKind::Disk,
            role: "*".to_string(),
            reservation: ResourceReservation::Unreserved,
            disk: Some(DiskInfo { source: DiskSource::Mount, persistence_id: Some(volume_id.to_string()) }),
            value: ResourceValue::Scalar(100.0),
        })
    }

    #[test]
    fn matches_the_reserved_task_carrying_the_offered_volume() {
        let now = Utc::now();
        let instance = instance_with("/app", reserved_task("/app.t1", vec!["vol-1"], now));
        let offer = disk_offer("vol-1");
        let m = match_volumes(&offer, &[&instance]).expect("should match");
        assert_eq!(m.reserved_task_id, TaskId("/app.t1".to_string()));
        assert_eq!(m.volume_ids, vec!["vol-1".to_string()]);
    }

    #[test]
    fn no_match_when_offer_lacks_the_volume() {
        let now = Utc::now();
        let instance = instance_with("/app", reserved_task("/app.t1", vec!["vol-1"], now));
        let offer = disk_offer("vol-2");
        assert!(match_volumes(&offer, &[&instance]).is_none());
    }

    #[test]
    fn earliest_reservation_wins_ties() {
        let now = Utc::now();
        let earlier = now - Duration::minutes(10);
        let a = instance_with("/app", reserved_task("/app.t1", vec!["vol-1"], now));
        let b = instance_with("/app", reserved_task("/app.t2", vec!["vol-1"], earlier));
        let offer = disk_offer("vol-1");
        let m = match_volumes(&offer, &[&a, &b]).unwrap();
        assert_eq!(m.reserved_task_id, TaskId("/app.t2".to_string()));
    }
}
