use ulid::Ulid;

use crate::model::{IntervalStatus, InvalidInterval};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    /// `conflicts` lists the blocking reservations in start order.
    #[error("reservation {id} conflicts with {}", join_ids(.conflicts))]
    Conflict { id: Ulid, conflicts: Vec<Ulid> },
    #[error(transparent)]
    InvalidInterval(#[from] InvalidInterval),
    #[error("reservation {id} is {status}; only active reservations can change")]
    InvalidTransition { id: Ulid, status: IntervalStatus },
    #[error("vehicle {id} still has {count} active reservations")]
    HasActiveReservations { id: Ulid, count: usize },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

fn join_ids(ids: &[Ulid]) -> String {
    ids.iter()
        .map(Ulid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
