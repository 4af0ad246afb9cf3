// Outbox message lifecycle.
//
// Pending -> Processing -> {Sent | Failed | Dead}
// Failed -> Pending (retry sweep) | Dead
// Processing -> Pending (stale recovery, cancelled claim)
// Sent and Dead are terminal.

pub mod events;
pub mod states;

pub use events::OutboxEvent;
pub use states::OutboxStatus;

/// Resolve the status an event leads to, or `None` when the transition is not allowed
pub fn next_status(current: OutboxStatus, event: &OutboxEvent) -> Option<OutboxStatus> {
    use OutboxEvent as E;
    use OutboxStatus as S;

    match (current, event) {
        (S::Pending, E::Claim) => Some(S::Processing),
        (S::Processing, E::Publish) => Some(S::Sent),
        (S::Processing, E::Fail(_)) => Some(S::Failed),
        (S::Processing, E::Abandon(_)) => Some(S::Dead),
        (S::Processing, E::Release) => Some(S::Pending),
        (S::Failed, E::Requeue) => Some(S::Pending),
        (S::Failed, E::Abandon(_)) => Some(S::Dead),
        _ => None,
    }
}
