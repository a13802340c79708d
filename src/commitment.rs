use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::{Result, SimulationError};
use crate::message::DisputedValue;
use crate::poly::Poly;
use crate::{CommitmentId, PartyId, NO_PARTY};

/// Everything one party records about one commitment.
///
/// The secret-independent attributes of permanent records (owner, flags,
/// opened value once opened) are identical across honest parties; the
/// share and the verifiable share polynomial are the holder's private view.
#[derive(Debug, Clone)]
pub struct CommitmentRecord {
    owner: PartyId,
    holder: PartyId,
    commit_id: CommitmentId,
    pub disputes: Vec<DisputedValue>,
    accusers: BTreeSet<PartyId>,
    /// f(x, holder), received privately from the owner in commit step 1
    verifiable_share: Poly,
    /// replacement broadcast in commit step 6, if we accused
    broadcast_verifiable_share: Option<Poly>,
    /// our degree-d share of the committed value, f_holder(0)
    share: u64,
    /// f(0, x); the owner keeps it to open the commitment later
    fx0: Poly,
    /// missing or inconsistent broadcast during the ongoing commit; all
    /// honest parties agree on this flag without further interaction
    inconsistent_broadcast: bool,
    in_progress: bool,
    success: bool,
    opened: bool,
    designated_open_targets: BTreeSet<PartyId>,
    opened_value: u64,
    input: bool,
    input_label: Option<String>,
    output: bool,
    vss: bool,
    permanent: bool,
    distributor: PartyId,
    share_name_suffix: String,
    mul_triple: bool,
}

impl CommitmentRecord {
    fn new(owner: PartyId, holder: PartyId, commit_id: CommitmentId) -> CommitmentRecord {
        CommitmentRecord {
            owner,
            holder,
            commit_id,
            disputes: Vec::new(),
            accusers: BTreeSet::new(),
            verifiable_share: Poly::zero(),
            broadcast_verifiable_share: None,
            share: 0,
            fx0: Poly::zero(),
            inconsistent_broadcast: false,
            in_progress: true,
            success: false,
            opened: false,
            designated_open_targets: BTreeSet::new(),
            opened_value: 0,
            input: false,
            input_label: None,
            output: false,
            vss: false,
            permanent: false,
            distributor: NO_PARTY,
            share_name_suffix: String::new(),
            mul_triple: false,
        }
    }

    pub fn owner(&self) -> PartyId {
        self.owner
    }

    pub fn commit_id(&self) -> &CommitmentId {
        &self.commit_id
    }

    pub fn share(&self) -> u64 {
        self.share
    }

    pub fn set_share(&mut self, s: u64) {
        self.share = s;
    }

    pub fn fx0(&self) -> &Poly {
        &self.fx0
    }

    pub fn set_fx0(&mut self, p: Poly) {
        self.fx0 = p;
    }

    pub fn verifiable_share(&self) -> &Poly {
        &self.verifiable_share
    }

    pub fn set_verifiable_share(&mut self, p: Poly) {
        self.verifiable_share = p;
    }

    pub fn broadcast_verifiable_share(&self) -> Option<&Poly> {
        self.broadcast_verifiable_share.as_ref()
    }

    pub fn set_broadcast_verifiable_share(&mut self, p: Poly) {
        self.broadcast_verifiable_share = Some(p);
    }

    pub fn set_opened(&mut self) {
        self.opened = true;
    }

    pub fn is_opened(&self) -> bool {
        self.opened
    }

    pub fn add_designated_open(&mut self, target: PartyId) {
        self.designated_open_targets.insert(target);
    }

    pub fn is_designated_opened_to(&self, p: PartyId) -> bool {
        self.designated_open_targets.contains(&p)
    }

    /// Callers store values already reduced mod p; they get compared a lot.
    pub fn set_opened_value(&mut self, v: u64) {
        self.opened_value = v;
    }

    /// The stored value with no visibility guard; snapshotting and public
    /// repair use it, protocol logic goes through `opened_value`.
    pub fn opened_value_raw(&self) -> u64 {
        self.opened_value
    }

    /// The value behind the commitment, legal to read only when it has
    /// been made visible to this holder.
    pub fn opened_value(&self) -> Result<u64> {
        if !self.is_value_open_to_us() {
            return Err(SimulationError::Invariant(format!(
                "tried to retrieve value of unopened commitment {}",
                self.commit_id
            )));
        }
        Ok(self.opened_value)
    }

    pub fn is_value_open_to(&self, p: PartyId) -> bool {
        self.opened || self.is_designated_opened_to(p) || self.owner == p
    }

    pub fn is_value_open_to_us(&self) -> bool {
        self.is_value_open_to(self.holder)
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    pub fn set_done(&mut self, success: bool) {
        self.in_progress = false;
        self.success = success;
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn add_dispute(&mut self, disputer: PartyId, disputed: PartyId) {
        if self
            .disputes
            .iter()
            .any(|d| d.disputer == disputer && d.disputed == disputed)
        {
            return;
        }
        self.disputes.push(DisputedValue {
            disputer,
            disputed,
            val: 0,
            opened: false,
        });
    }

    pub fn set_dispute_value(&mut self, disputer: PartyId, disputed: PartyId, val: u64) {
        for d in &mut self.disputes {
            if d.disputer == disputer && d.disputed == disputed {
                d.val = val;
                d.opened = true;
                return; // add_dispute guarantees a single match
            }
        }
    }

    pub fn add_accuser(&mut self, accuser: PartyId) {
        self.accusers.insert(accuser);
    }

    pub fn accusers(&self) -> &BTreeSet<PartyId> {
        &self.accusers
    }

    pub fn accuser_count(&self) -> usize {
        self.accusers.len()
    }

    pub fn is_accuser(&self, p: PartyId) -> bool {
        self.accusers.contains(&p)
    }

    pub fn set_inconsistent_broadcast(&mut self) {
        self.inconsistent_broadcast = true;
    }

    pub fn is_inconsistent_broadcast(&self) -> bool {
        self.inconsistent_broadcast
    }

    pub fn set_input(&mut self, label: &str) {
        self.input = true;
        self.input_label = Some(label.to_string());
    }

    pub fn is_input(&self) -> bool {
        self.input
    }

    pub fn input_label(&self) -> Option<&str> {
        self.input_label.as_deref()
    }

    pub fn mark_as_output(&mut self) {
        self.output = true;
    }

    pub fn clear_output_flag(&mut self) {
        self.output = false;
    }

    pub fn is_output(&self) -> bool {
        self.output
    }

    pub fn set_vss(&mut self, vss: bool) {
        self.vss = vss;
    }

    pub fn is_vss(&self) -> bool {
        self.vss
    }

    pub fn set_permanent(&mut self) {
        self.permanent = true;
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn set_distributor(&mut self, p: PartyId) {
        self.distributor = p;
    }

    pub fn distributor(&self) -> PartyId {
        self.distributor
    }

    pub fn set_share_name_suffix(&mut self, suffix: &str) {
        self.share_name_suffix = suffix.to_string();
    }

    pub fn share_name_suffix(&self) -> &str {
        &self.share_name_suffix
    }

    pub fn set_mul_triple(&mut self, t: bool) {
        self.mul_triple = t;
    }

    pub fn is_mul_triple(&self) -> bool {
        self.mul_triple
    }
}

impl fmt::Display for CommitmentRecord {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(out, "---- record at party {} ----", self.holder)?;
        writeln!(out, "commit id : {}", self.commit_id)?;
        writeln!(out, "owner     : {}", self.owner)?;
        writeln!(out, "opened    : {}", self.opened)?;
        if !self.designated_open_targets.is_empty() {
            let ts: Vec<String> = self
                .designated_open_targets
                .iter()
                .map(|p| p.to_string())
                .collect();
            writeln!(out, "designated-opened to : {}", ts.join(" "))?;
        }
        writeln!(out, "opened value : {}", self.opened_value)?;
        writeln!(out, "share     : {}", self.share)?;
        writeln!(out, "success   : {}", self.success)?;
        writeln!(out, "inprogress: {}", self.in_progress)?;
        if !self.disputes.is_empty() {
            for d in &self.disputes {
                writeln!(
                    out,
                    "dispute {} -> {} : {} opened {}",
                    d.disputer, d.disputed, d.val, d.opened
                )?;
            }
        }
        if !self.accusers.is_empty() {
            let acc: Vec<String> = self.accusers.iter().map(|p| p.to_string()).collect();
            writeln!(out, "accusers  : {}", acc.join(" "))?;
        }
        write!(
            out,
            "vss {} input {} output {} permanent {}",
            self.vss, self.input, self.output, self.permanent
        )
    }
}

/// A multiplication triple prepared in the preprocessing phase: the three
/// commitment names plus the VSS shares received for the product, kept for
/// the evaluation-phase degree reduction.
#[derive(Debug, Clone, Default)]
pub struct MultiplicationTriple {
    pub first_mult: CommitmentId,
    pub second_mult: CommitmentId,
    pub product: CommitmentId,
    pub received_shares: Vec<CommitmentId>,
}

/// One party's table of commitment records, keyed by commitment id.
///
/// Iteration order is the id order, which keeps every table walk (and the
/// auto-generated fresh ids those walks may trigger) deterministic across
/// parties and runs.
#[derive(Debug)]
pub struct CommitmentTable {
    pid: PartyId,
    counter: u64,
    records: BTreeMap<CommitmentId, CommitmentRecord>,
}

impl CommitmentTable {
    pub fn new(pid: PartyId) -> CommitmentTable {
        CommitmentTable {
            pid,
            counter: 0,
            records: BTreeMap::new(),
        }
    }

    fn next_commit_id(&mut self) -> CommitmentId {
        self.counter += 1;
        format!("party{}_commitment_{}", self.pid, self.counter)
    }

    /// Creates a record under a fresh auto-generated id.
    pub fn add_record(&mut self, owner: PartyId) -> CommitmentId {
        let cid = self.next_commit_id();
        self.insert(owner, &cid);
        cid
    }

    /// Creates a record under the supplied id; empty or colliding ids are
    /// rerouted to a fresh auto-generated one, deterministically.
    pub fn add_record_named(&mut self, owner: PartyId, cid: &str) -> CommitmentId {
        let mut cid = cid.to_string();
        if cid.is_empty() || self.exists(&cid) {
            loop {
                cid = self.next_commit_id();
                if !self.exists(&cid) {
                    break;
                }
            }
        }
        self.insert(owner, &cid);
        cid
    }

    fn insert(&mut self, owner: PartyId, cid: &str) {
        let record = CommitmentRecord::new(owner, self.pid, cid.to_string());
        self.records.insert(cid.to_string(), record);
    }

    /// Re-adds a record evicted from another table (sequential runs).
    pub fn adopt(&mut self, record: CommitmentRecord) -> Result<()> {
        if record.commit_id.is_empty() || self.exists(&record.commit_id) {
            return Err(SimulationError::Invariant(format!(
                "bad commitment id: {}",
                record.commit_id
            )));
        }
        self.records.insert(record.commit_id.clone(), record);
        Ok(())
    }

    pub fn remove(&mut self, cid: &str) -> Result<CommitmentRecord> {
        self.records
            .remove(cid)
            .ok_or_else(|| SimulationError::Invariant(format!("record not found: {cid}")))
    }

    pub fn exists(&self, cid: &str) -> bool {
        self.records.contains_key(cid)
    }

    pub fn get(&self, cid: &str) -> Option<&CommitmentRecord> {
        self.records.get(cid)
    }

    pub fn get_mut(&mut self, cid: &str) -> Option<&mut CommitmentRecord> {
        self.records.get_mut(cid)
    }

    /// The record of the commitment `owner` currently has in progress.
    pub fn record_for_ongoing_commitment(&mut self, owner: PartyId) -> Option<&mut CommitmentRecord> {
        self.records
            .values_mut()
            .find(|r| r.owner == owner && r.in_progress)
    }

    pub fn ongoing_commits(&self) -> Vec<CommitmentId> {
        self.records
            .values()
            .filter(|r| r.in_progress)
            .map(|r| r.commit_id.clone())
            .collect()
    }

    pub fn vss_shares_received_by(&self, receiver: PartyId) -> Vec<CommitmentId> {
        self.records
            .values()
            .filter(|r| r.vss && r.owner == receiver)
            .map(|r| r.commit_id.clone())
            .collect()
    }

    pub fn input_shares_received_by(&self, receiver: PartyId) -> Vec<CommitmentId> {
        self.records
            .values()
            .filter(|r| r.input && r.owner == receiver)
            .map(|r| r.commit_id.clone())
            .collect()
    }

    pub fn input_share_count_received_by(&self, receiver: PartyId) -> usize {
        self.input_shares_received_by(receiver).len()
    }

    pub fn output_shares(&self) -> Vec<CommitmentId> {
        self.records
            .values()
            .filter(|r| r.output)
            .map(|r| r.commit_id.clone())
            .collect()
    }

    pub fn clear_vss_flags(&mut self) {
        for r in self.records.values_mut() {
            r.vss = false;
        }
    }

    /// Drops every record not marked permanent; called between phases to
    /// keep the table size manageable.
    pub fn clean_up(&mut self) {
        self.records.retain(|_, r| r.permanent);
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        if self.records.contains_key(new) {
            return Err(SimulationError::Invariant(format!(
                "commitment id already exists: {new}"
            )));
        }
        let mut record = self
            .records
            .remove(old)
            .ok_or_else(|| SimulationError::Invariant(format!("bad commitment id: {old}")))?;
        record.commit_id = new.to_string();
        self.records.insert(new.to_string(), record);
        Ok(())
    }

    pub fn records(&self) -> impl Iterator<Item = &CommitmentRecord> {
        self.records.values()
    }
}

impl fmt::Display for CommitmentTable {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(out, "records for party {}", self.pid)?;
        for r in self.records.values() {
            writeln!(out, "{r}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_follow_the_counter() {
        let mut t = CommitmentTable::new(3);
        assert_eq!(t.add_record(3), "party3_commitment_1");
        assert_eq!(t.add_record(1), "party3_commitment_2");
    }

    #[test]
    fn colliding_or_empty_names_are_rerouted() {
        let mut t = CommitmentTable::new(1);
        assert_eq!(t.add_record_named(1, "mine"), "mine");
        assert_eq!(t.add_record_named(2, "mine"), "party1_commitment_1");
        assert_eq!(t.add_record_named(2, ""), "party1_commitment_2");
    }

    #[test]
    fn rename_moves_the_record() {
        let mut t = CommitmentTable::new(1);
        t.add_record_named(2, "old");
        t.get_mut("old").unwrap().set_share(9);
        t.rename("old", "new").unwrap();
        assert!(!t.exists("old"));
        assert_eq!(t.get("new").unwrap().share(), 9);
        assert_eq!(t.get("new").unwrap().commit_id(), "new");
        t.add_record_named(2, "taken");
        assert!(t.rename("new", "taken").is_err());
        assert!(t.rename("ghost", "other").is_err());
    }

    #[test]
    fn clean_up_keeps_permanent_records() {
        let mut t = CommitmentTable::new(1);
        t.add_record_named(1, "temp");
        t.add_record_named(1, "kept");
        t.get_mut("kept").unwrap().set_permanent();
        t.clean_up();
        assert!(!t.exists("temp"));
        assert!(t.exists("kept"));
    }

    #[test]
    fn flag_queries_select_records() {
        let mut t = CommitmentTable::new(1);
        t.add_record_named(1, "a");
        t.get_mut("a").unwrap().set_vss(true);
        t.get_mut("a").unwrap().set_input("x");
        t.add_record_named(2, "b");
        t.get_mut("b").unwrap().set_vss(true);
        t.add_record_named(1, "c");
        t.get_mut("c").unwrap().mark_as_output();
        assert_eq!(t.vss_shares_received_by(1), vec!["a".to_string()]);
        assert_eq!(t.input_share_count_received_by(1), 1);
        assert_eq!(t.input_share_count_received_by(2), 0);
        assert_eq!(t.output_shares(), vec!["c".to_string()]);
        t.clear_vss_flags();
        assert!(t.vss_shares_received_by(1).is_empty());
    }

    #[test]
    fn opened_value_is_guarded() {
        let mut t = CommitmentTable::new(2);
        t.add_record_named(1, "c");
        let r = t.get_mut("c").unwrap();
        r.set_opened_value(5);
        assert!(r.opened_value().is_err());
        r.add_designated_open(2);
        assert_eq!(r.opened_value().unwrap(), 5);
        // the owner always sees its own value
        let mut t1 = CommitmentTable::new(1);
        t1.add_record_named(1, "c");
        let r1 = t1.get_mut("c").unwrap();
        r1.set_opened_value(7);
        assert_eq!(r1.opened_value().unwrap(), 7);
    }

    #[test]
    fn ongoing_commitment_tracking() {
        let mut t = CommitmentTable::new(1);
        t.add_record_named(2, "c2");
        t.add_record_named(3, "c3");
        assert_eq!(t.ongoing_commits(), vec!["c2".to_string(), "c3".to_string()]);
        t.get_mut("c2").unwrap().set_done(true);
        assert_eq!(t.ongoing_commits(), vec!["c3".to_string()]);
        assert!(t.record_for_ongoing_commitment(2).is_none());
        assert_eq!(
            t.record_for_ongoing_commitment(3).unwrap().commit_id(),
            "c3"
        );
    }

    #[test]
    fn disputes_deduplicate() {
        let mut t = CommitmentTable::new(1);
        t.add_record_named(1, "c");
        let r = t.get_mut("c").unwrap();
        r.add_dispute(1, 2);
        r.add_dispute(1, 2);
        r.add_dispute(2, 1);
        assert_eq!(r.disputes.len(), 2);
        r.set_dispute_value(1, 2, 99);
        assert!(r.disputes[0].opened);
        assert_eq!(r.disputes[0].val, 99);
        assert!(!r.disputes[1].opened);
    }
}
