use chrono::{DateTime, Utc};
use tracing::debug;

use models::instance::{ReservationState, Timeout, TimeoutReason};

/// Events that can advance a reservation's state. Agent loss is
/// folded in as a transition applicable from any state, so it is expressed
/// as its own entry point rather than a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationEvent {
    MatchingOfferLaunch,
    DeadlinePassed,
    TaskTerminatedVolumesRetained,
}

/// Applies `event` to `state` at `now`, returning the next state, or `None`
/// when the transition destroys the reservation outright (a `Suspended` or
/// `Garbage` reservation past its deadline). Returns `state` unchanged if `event`
/// has no effect from that state. `suspend_deadline` is only consulted by the
/// `Launched -> Suspended` transition, to give the freshly suspended
/// reservation a deadline of its own to eventually be garbage-collected by;
/// callers pass `now + config.task_reservation_timeout`.
pub fn next_state(state: ReservationState, event: ReservationEvent, now: DateTime<Utc>, suspend_deadline: DateTime<Utc>) -> Option<ReservationState> {
    let next = match (state, event) {
        (ReservationState::New(_), ReservationEvent::MatchingOfferLaunch) => Some(ReservationState::Launched),
        (ReservationState::New(timeout), ReservationEvent::DeadlinePassed) if deadline_passed(timeout, now) => {
            Some(ReservationState::Garbage(timeout))
        }
        (ReservationState::Launched, ReservationEvent::TaskTerminatedVolumesRetained) => {
            let timeout = Timeout { initiated: now, deadline: suspend_deadline, reason: TimeoutReason::ReservationTimeout };
            Some(ReservationState::Suspended(Some(timeout)))
        }
        (ReservationState::Suspended(_), ReservationEvent::MatchingOfferLaunch) => Some(ReservationState::Launched),
        (ReservationState::Suspended(timeout), ReservationEvent::DeadlinePassed) if deadline_passed(timeout, now) => {
            None
        }
        (ReservationState::Garbage(timeout), ReservationEvent::DeadlinePassed) if deadline_passed(timeout, now) => {
            None
        }
        (unchanged, _) => Some(unchanged),
    };

    debug!(?state, ?event, ?next, "reservation transition");
    next
}

fn deadline_passed(timeout: Option<Timeout>, now: DateTime<Utc>) -> bool {
    timeout.map(|t| now >= t.deadline).unwrap_or(false)
}

/// Folds an agent-loss/reconciliation-gap observation into `state`,
/// applicable regardless of the current state.
pub fn on_agent_lost(state: ReservationState, now: DateTime<Utc>, deadline: DateTime<Utc>) -> ReservationState {
    let timeout = Timeout { initiated: now, deadline, reason: TimeoutReason::ReservationConfigUpdate };
    debug!(?state, "reservation lost agent, moving to Unknown");
    match state {
        ReservationState::Launched => ReservationState::Unknown(Some(timeout)),
        ReservationState::New(_) | ReservationState::Suspended(_) | ReservationState::Garbage(_) | ReservationState::Unknown(_) => {
            ReservationState::Unknown(Some(timeout))
        }
    }
}
