use thiserror::Error;

use crate::PartyId;

/// Everything that can go wrong during setup or a protocol run.
///
/// Honest parties propagate these; a party that already knows itself to be
/// in the corrupt set swallows `Protocol` errors and terminates quietly so
/// the scheduler can finish the round loop.
#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("bad options file: {0}")]
    Options(String),

    #[error("bad configuration: {0}")]
    Config(String),

    #[error("bad circuit: {0}")]
    Circuit(String),

    #[error("bad input binding: {0}")]
    Input(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("structural invariant breached: {0}")]
    Invariant(String),

    #[error("more corrupted parties than the protocol can handle")]
    TooManyCorrupt,

    #[error("party {0} failed: {1}")]
    Party(PartyId, Box<SimulationError>),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SimulationError>;
