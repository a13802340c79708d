//! Simulator for secure multi-party circuit evaluation over a prime field.
//!
//! N computing parties run in one address space, one thread each, clocked by
//! a synchronous round scheduler. Three protocols are implemented:
//!
//! - CEPS: circuit evaluation with passive security (plain Shamir sharing,
//!   degree reduction through public recombination),
//! - CEAS: circuit evaluation with active security (homomorphic commitments
//!   backed by verifiable secret sharing, with dispute resolution), and
//! - CEAS with circuit randomization (multiplication gates consume
//!   preprocessed triples, so the evaluation phase only pays two opens per
//!   multiplication).

pub mod behavior;
pub mod channel;
pub mod circuit;
pub mod commitment;
pub mod error;
pub mod field;
pub mod message;
pub mod naming;
pub mod options;
pub mod party;
pub mod poly;
pub mod simulator;

pub use error::SimulationError;

/// Identifier of a computing party, in `1..=N`.
pub type PartyId = usize;

/// Reserved id meaning "no party".
pub const NO_PARTY: PartyId = 0;

/// String identifier of a commitment record.
pub type CommitmentId = String;

/// Number of a gate within a circuit, starting at 1.
pub type GateNumber = usize;

/// Which protocol the parties run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    None,
    Ceps,
    Ceas,
    CeasWithCircuitRandomization,
}

impl Protocol {
    pub fn from_code(code: u64) -> Option<Protocol> {
        match code {
            0 => Some(Protocol::None),
            1 => Some(Protocol::Ceps),
            2 => Some(Protocol::Ceas),
            3 => Some(Protocol::CeasWithCircuitRandomization),
            _ => None,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Protocol::Ceas | Protocol::CeasWithCircuitRandomization)
    }
}
