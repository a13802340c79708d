use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::poly::Poly;
use crate::{CommitmentId, PartyId, NO_PARTY};

/// A value disputed between two parties during a commit: the owner later
/// opens f(disputer, disputed) on the broadcast channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisputedValue {
    pub disputer: PartyId,
    pub disputed: PartyId,
    pub val: u64,
    pub opened: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Accusation {
    pub accused: PartyId,
    /// debug info only, never part of any decision
    pub reason: String,
}

/// A verifiable share polynomial f(x, k) opened on broadcast for accuser k.
#[derive(Debug, Clone)]
pub struct OpenedVerifiableShare {
    pub k: PartyId,
    pub fkx: Poly,
}

/// Working state of one commitment transfer; on the wire only the
/// (commit id, source, target) triple is meaningful.
#[derive(Debug, Clone)]
pub struct CommitmentTransfer {
    pub commit_id: CommitmentId,
    pub source: PartyId,
    pub target: PartyId,
    /// something went wrong with this transfer; it is ignored until the
    /// public repair step
    pub error: bool,
    pub rejecters: BTreeSet<PartyId>,
    pub transferred_commit_id: CommitmentId,
    /// combined coefficient commitments for the source polynomial, per party
    pub fkx: BTreeMap<PartyId, CommitmentId>,
    /// combined coefficient commitments for the target polynomial, per party
    pub gkx: BTreeMap<PartyId, CommitmentId>,
}

impl Default for CommitmentTransfer {
    fn default() -> CommitmentTransfer {
        CommitmentTransfer {
            commit_id: CommitmentId::new(),
            source: NO_PARTY,
            target: NO_PARTY,
            error: true,
            rejecters: BTreeSet::new(),
            transferred_commit_id: CommitmentId::new(),
            fkx: BTreeMap::new(),
            gkx: BTreeMap::new(),
        }
    }
}

impl CommitmentTransfer {
    pub fn new(commit_id: CommitmentId, source: PartyId, target: PartyId) -> CommitmentTransfer {
        CommitmentTransfer {
            commit_id,
            source,
            target,
            error: false,
            ..CommitmentTransfer::default()
        }
    }

    pub fn is_rejected(&self) -> bool {
        !self.rejecters.is_empty()
    }
}

/// Working state of one commitment multiplication; on the wire only the
/// (cid1, cid2, cid3, owner) tuple is meaningful.
#[derive(Debug, Clone)]
pub struct CommitmentMult {
    pub cid1: CommitmentId,
    pub cid2: CommitmentId,
    pub cid3: CommitmentId,
    pub owner: PartyId,
    pub error: bool,
    pub rejecters: BTreeSet<PartyId>,
    pub fkx: BTreeMap<PartyId, CommitmentId>,
    pub gkx: BTreeMap<PartyId, CommitmentId>,
    pub hkx: BTreeMap<PartyId, CommitmentId>,
}

impl Default for CommitmentMult {
    fn default() -> CommitmentMult {
        CommitmentMult {
            cid1: CommitmentId::new(),
            cid2: CommitmentId::new(),
            cid3: CommitmentId::new(),
            owner: NO_PARTY,
            error: true,
            rejecters: BTreeSet::new(),
            fkx: BTreeMap::new(),
            gkx: BTreeMap::new(),
            hkx: BTreeMap::new(),
        }
    }
}

impl CommitmentMult {
    pub fn new(
        cid1: CommitmentId,
        cid2: CommitmentId,
        cid3: CommitmentId,
        owner: PartyId,
    ) -> CommitmentMult {
        CommitmentMult {
            cid1,
            cid2,
            cid3,
            owner,
            error: false,
            ..CommitmentMult::default()
        }
    }

    pub fn is_rejected(&self) -> bool {
        !self.rejecters.is_empty()
    }
}

/// One round message. The fields are union-like: each protocol step only
/// populates the handful it needs. Messages become `Arc`'d once sent so
/// sender and receivers share one immutable copy.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub sender: PartyId,
    pub share: Option<u64>,
    pub verifiable_share: Option<Poly>,
    pub input_label: Option<String>,
    pub commit_id: Option<CommitmentId>,
    /// target of the ongoing action, e.g. the receiver of a designated open
    pub target: PartyId,
    /// per-commitment verifier points, for the consistency checks
    pub verifiers: BTreeMap<CommitmentId, u64>,
    /// per-commitment sets of disputed parties
    pub disputes: BTreeMap<CommitmentId, BTreeSet<PartyId>>,
    pub disputed_values: Vec<DisputedValue>,
    pub accusations: Vec<Accusation>,
    pub opened_verifiable_shares: Vec<OpenedVerifiableShare>,
    pub designated_open_rejected: bool,
    pub transfers: Vec<CommitmentTransfer>,
    pub multiplications: Vec<CommitmentMult>,
    pub debug_tag: Option<String>,
}

pub type MessagePtr = Arc<Message>;

impl Message {
    pub fn new(sender: PartyId) -> Message {
        Message {
            sender,
            ..Message::default()
        }
    }

    pub fn set_input(&mut self, label: &str) {
        self.input_label = Some(label.to_string());
    }

    pub fn is_input(&self) -> bool {
        self.input_label.is_some()
    }

    pub fn add_verifier(&mut self, cid: &str, val: u64) {
        self.verifiers.insert(cid.to_string(), val);
    }

    pub fn verifier(&self, cid: &str) -> Option<u64> {
        self.verifiers.get(cid).copied()
    }

    pub fn add_dispute(&mut self, cid: &str, disputed: PartyId) {
        self.disputes.entry(cid.to_string()).or_default().insert(disputed);
    }

    pub fn disputes_for(&self, cid: &str) -> BTreeSet<PartyId> {
        self.disputes.get(cid).cloned().unwrap_or_default()
    }

    pub fn add_disputed_value(&mut self, disputer: PartyId, disputed: PartyId, val: u64) {
        self.disputed_values.push(DisputedValue {
            disputer,
            disputed,
            val,
            opened: true,
        });
    }

    pub fn disputed_value(&self, disputer: PartyId, disputed: PartyId) -> Option<u64> {
        self.disputed_values
            .iter()
            .find(|d| d.disputer == disputer && d.disputed == disputed)
            .map(|d| d.val)
    }

    pub fn add_accused(&mut self, accused: PartyId, reason: &str) {
        self.accusations.push(Accusation {
            accused,
            reason: reason.to_string(),
        });
    }

    pub fn add_opened_verifiable_share(&mut self, k: PartyId, fkx: Poly) {
        self.opened_verifiable_shares.push(OpenedVerifiableShare { k, fkx });
    }

    pub fn add_transfer(&mut self, commit_id: &str, source: PartyId, target: PartyId) {
        self.transfers
            .push(CommitmentTransfer::new(commit_id.to_string(), source, target));
    }

    pub fn add_multiplication(&mut self, cid1: &str, cid2: &str, cid3: &str, owner: PartyId) {
        self.multiplications.push(CommitmentMult::new(
            cid1.to_string(),
            cid2.to_string(),
            cid3.to_string(),
            owner,
        ));
    }
}

impl fmt::Display for Message {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(out, "msg from {}", self.sender)?;
        if let Some(tag) = &self.debug_tag {
            write!(out, " [{tag}]")?;
        }
        if let Some(s) = self.share {
            write!(out, " share={s}")?;
        }
        if let Some(cid) = &self.commit_id {
            write!(out, " cid={cid}")?;
        }
        if let Some(l) = &self.input_label {
            write!(out, " label={l}")?;
        }
        if self.target != NO_PARTY {
            write!(out, " target={}", self.target)?;
        }
        if let Some(vs) = &self.verifiable_share {
            write!(out, " poly=({vs})")?;
        }
        if !self.verifiers.is_empty() {
            write!(out, " verifiers={}", self.verifiers.len())?;
        }
        if !self.disputes.is_empty() {
            write!(out, " disputes={}", self.disputes.len())?;
        }
        if !self.disputed_values.is_empty() {
            write!(out, " opened-disputes={}", self.disputed_values.len())?;
        }
        if !self.accusations.is_empty() {
            let accused: Vec<String> = self
                .accusations
                .iter()
                .map(|a| a.accused.to_string())
                .collect();
            write!(out, " accuses=[{}]", accused.join(","))?;
        }
        if !self.opened_verifiable_shares.is_empty() {
            write!(out, " opened-shares={}", self.opened_verifiable_shares.len())?;
        }
        if self.designated_open_rejected {
            write!(out, " REJECTED")?;
        }
        for t in &self.transfers {
            write!(out, " transfer({} {}->{})", t.commit_id, t.source, t.target)?;
        }
        for m in &self.multiplications {
            write!(out, " mult({} * {} -> {})", m.cid1, m.cid2, m.cid3)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifiers_and_disputes_round_trip() {
        let mut m = Message::new(2);
        m.add_verifier("c1", 17);
        m.add_dispute("c1", 3);
        m.add_dispute("c1", 3); // duplicate collapses
        m.add_dispute("c1", 1);
        assert_eq!(m.verifier("c1"), Some(17));
        assert_eq!(m.verifier("c2"), None);
        assert_eq!(m.disputes_for("c1"), [1, 3].into_iter().collect());
        assert!(m.disputes_for("c2").is_empty());
    }

    #[test]
    fn disputed_values_are_keyed_by_pair() {
        let mut m = Message::new(1);
        m.add_disputed_value(1, 2, 40);
        m.add_disputed_value(2, 1, 41);
        assert_eq!(m.disputed_value(1, 2), Some(40));
        assert_eq!(m.disputed_value(2, 1), Some(41));
        assert_eq!(m.disputed_value(1, 3), None);
    }

    #[test]
    fn default_transfer_and_mult_start_in_error() {
        assert!(CommitmentTransfer::default().error);
        assert!(CommitmentMult::default().error);
        assert!(!CommitmentTransfer::new("c".into(), 1, 2).error);
        assert!(!CommitmentMult::new("a".into(), "b".into(), "c".into(), 1).error);
    }
}
