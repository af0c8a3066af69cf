//! Error types for the swarm core.

use crate::member::MemberId;

/// Everything that can go wrong at a single member or at the coordinator.
///
/// None of these abort a tick: `NoNeighbor` is absorbed by the planning phase
/// and configuration errors are raised at construction or update time.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("ideal separation must be finite and positive, got {0}")]
    InvalidIdealSeparation(f32),
    #[error("separation threshold {threshold} must be in [0, {ideal})")]
    InvalidThreshold { threshold: f32, ideal: f32 },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("neighbor slot {slot} is unset")]
    NoNeighbor { slot: usize },
    #[error("member {0} is not part of the swarm")]
    UnknownMember(MemberId),
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

pub type SwarmResult<T> = Result<T, SwarmError>;
