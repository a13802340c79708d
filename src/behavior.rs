use std::collections::BTreeSet;
use std::str::FromStr;

use crate::error::SimulationError;

/// Catalogue of dishonest deviations. Each one is a localized mutation at a
/// specific protocol step; a party configured with a deviation behaves
/// per-protocol everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Deviation {
    /// Tamper with the shares the party emits for commitments it touches:
    /// the verifier points relayed to party 1 during commit step 2, and the
    /// opening polynomial released for its own committed output share
    /// (designated open and fallback open). The former is absorbed by the
    /// dispute machinery; the latter convicts the cheater by consensus.
    CommitmentSendInvalidShare,
    /// As a disputed commitment owner, refuse to broadcast disputed values.
    CommitmentDoNotOpenDisputed,
    /// Accuse party 1 even though its disputed values checked out.
    CommitmentAccuseHonest,
    /// As an accused owner, refuse to broadcast the verifiable shares.
    CommitmentAccusedDoNotOpenShare,
    /// Open own commitment with a negated polynomial.
    OpenWithInvalidFx0,
    /// Sabotage other parties' opens with tweaked verifiers.
    OpenSendInvalidVerifiers,
    /// Designated-open own commitment with a negated polynomial.
    DesignatedOpenWithInvalidFx0,
    /// After a designated open is rejected, refuse the forced open.
    DesignatedOpenDoNotOpenRejected,
    /// Sabotage other parties' designated opens with tweaked verifiers.
    DesignatedOpenSendInvalidVerifiers,
    /// As transfer target, commit to value + 1 instead of the value opened.
    TransferTargetCommitsToDifferentValue,
    /// Reject a perfectly valid transfer as a third-party checker.
    TransferRejectValidTransfer,
    /// As transfer source, privately send a tweaked first coefficient.
    TransferSourceSendsBadCoefficient,
    /// As a transfer source with an erroneous transfer, refuse the
    /// repairing open.
    TransferSourceDoNotOpenErroneous,
    /// Commit to product + 1 in commitment multiplication.
    MultiplicationCommitToDifferentValue,
    /// Reject a valid commitment multiplication as a checker.
    MultiplicationRejectValidMultiplication,
}

impl FromStr for Deviation {
    type Err = SimulationError;

    fn from_str(s: &str) -> Result<Deviation, SimulationError> {
        Ok(match s {
            "commitment_send_invalid_share" => Deviation::CommitmentSendInvalidShare,
            "commitment_do_not_open_disputed" => Deviation::CommitmentDoNotOpenDisputed,
            "commitment_accuse_honest" => Deviation::CommitmentAccuseHonest,
            "commitment_accused_do_not_open_share" => Deviation::CommitmentAccusedDoNotOpenShare,
            "open_with_invalid_fx0" => Deviation::OpenWithInvalidFx0,
            "open_send_invalid_verifiers" => Deviation::OpenSendInvalidVerifiers,
            "designated_open_with_invalid_fx0" => Deviation::DesignatedOpenWithInvalidFx0,
            "designated_open_do_not_open_rejected" => Deviation::DesignatedOpenDoNotOpenRejected,
            "designated_open_send_invalid_verifiers" => {
                Deviation::DesignatedOpenSendInvalidVerifiers
            }
            "transfer_target_commits_to_different_value" => {
                Deviation::TransferTargetCommitsToDifferentValue
            }
            "transfer_reject_valid_transfer" => Deviation::TransferRejectValidTransfer,
            "transfer_source_sends_bad_coefficient" => {
                Deviation::TransferSourceSendsBadCoefficient
            }
            "transfer_source_do_not_open_erroneous" => {
                Deviation::TransferSourceDoNotOpenErroneous
            }
            "multiplication_commit_to_different_value" => {
                Deviation::MultiplicationCommitToDifferentValue
            }
            "multiplication_reject_valid_multiplication" => {
                Deviation::MultiplicationRejectValidMultiplication
            }
            other => {
                return Err(SimulationError::Options(format!(
                    "unknown dishonest scenario: {other}"
                )))
            }
        })
    }
}

/// Per-party dishonesty configuration. A party can be flagged dishonest
/// with an empty deviation set, in which case it follows the protocol and
/// only counts toward the tolerance bookkeeping of the test setup.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    dishonest: bool,
    deviations: BTreeSet<Deviation>,
}

impl Behavior {
    pub fn honest() -> Behavior {
        Behavior::default()
    }

    pub fn dishonest(deviations: impl IntoIterator<Item = Deviation>) -> Behavior {
        Behavior {
            dishonest: true,
            deviations: deviations.into_iter().collect(),
        }
    }

    pub fn is_dishonest(&self) -> bool {
        self.dishonest
    }

    /// True when this party is dishonest and plays out the given scenario.
    pub fn deviates(&self, d: Deviation) -> bool {
        self.dishonest && self.deviations.contains(&d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scenario_names_parse() {
        assert_eq!(
            "commitment_send_invalid_share".parse::<Deviation>().unwrap(),
            Deviation::CommitmentSendInvalidShare
        );
        assert_eq!(
            "multiplication_reject_valid_multiplication"
                .parse::<Deviation>()
                .unwrap(),
            Deviation::MultiplicationRejectValidMultiplication
        );
        assert!("no_such_scenario".parse::<Deviation>().is_err());
    }

    #[test]
    fn honest_parties_never_deviate() {
        let b = Behavior::honest();
        assert!(!b.is_dishonest());
        assert!(!b.deviates(Deviation::OpenWithInvalidFx0));
        let d = Behavior::dishonest([Deviation::OpenWithInvalidFx0]);
        assert!(d.deviates(Deviation::OpenWithInvalidFx0));
        assert!(!d.deviates(Deviation::OpenSendInvalidVerifiers));
        let flagged = Behavior::dishonest([]);
        assert!(flagged.is_dishonest());
        assert!(!flagged.deviates(Deviation::OpenWithInvalidFx0));
    }
}
