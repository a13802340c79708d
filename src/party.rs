use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use rand_chacha::ChaCha20Rng;
use rand_core::SeedableRng;
use tracing::debug;

use crate::behavior::{Behavior, Deviation};
use crate::channel::{ConsensusBroadcast, RoundSync, SecureChannel};
use crate::circuit::{Circuit, GateKind};
use crate::commitment::{CommitmentTable, MultiplicationTriple};
use crate::error::{Result, SimulationError};
use crate::field::{is_probable_prime, Field};
use crate::message::{CommitmentMult, CommitmentTransfer, Message, MessagePtr};
use crate::naming::{
    added_commit_id, coeff_commit_id_for_mult, coeff_commit_id_for_sharing,
    coeff_commit_id_for_transfer, const_mult_commit_id, is_reserved, make_share_name,
    make_share_name_with_prefix, make_triple_name, multiplied_commit_id, split_share_name,
    transferred_commit_id, POLY_F, POLY_G, POLY_H, TRIPLE_D, TRIPLE_E, TRIPLE_M1, TRIPLE_M2,
    TRIPLE_PROD,
};
use crate::poly::{recombination_vector, Poly, SymmBivariatePoly};
use crate::{CommitmentId, GateNumber, PartyId, Protocol, NO_PARTY};

/// Secret-independent view of one permanent commitment record, exported for
/// post-run inspection. `self_value` is only populated on records the
/// snapshotting party owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSnapshot {
    pub cid: CommitmentId,
    pub owner: PartyId,
    pub success: bool,
    pub opened: bool,
    pub opened_value: Option<u64>,
    pub input: bool,
    pub output: bool,
    pub share: u64,
    pub self_value: Option<u64>,
}

#[derive(Debug, Clone, Default)]
pub struct PartySnapshot {
    pub pid: PartyId,
    pub dishonest: bool,
    pub corrupted: BTreeSet<PartyId>,
    pub records: Vec<RecordSnapshot>,
}

/// One computing party: protocol engine for CEPS and CEAS, plus the Fcom
/// subprotocol suite the latter is built on.
pub struct Party {
    pid: PartyId,
    n: usize,
    /// polynomial degree for the sharing scheme, threshold - 1
    d: usize,
    field: Field,
    circuit: Circuit,
    commitments: CommitmentTable,
    corrupted: BTreeSet<PartyId>,
    recombination: Vec<u64>,
    triples: BTreeMap<GateNumber, MultiplicationTriple>,
    running: Protocol,
    max_dishonest: usize,
    rng: ChaCha20Rng,
    secrets: BTreeMap<String, u64>,
    data_user: PartyId,
    behavior: Behavior,
    sync: Arc<RoundSync>,
    senders: Vec<Arc<SecureChannel>>,
    receivers: Vec<Arc<SecureChannel>>,
    broadcast: Option<Arc<ConsensusBroadcast>>,
    result: Option<u64>,
}

impl Party {
    pub fn new(pid: PartyId, party_count: usize, threshold: usize, field_prime: u64) -> Party {
        Party {
            pid,
            n: party_count,
            d: threshold.saturating_sub(1),
            field: Field::new(field_prime),
            circuit: Circuit::default(),
            commitments: CommitmentTable::new(pid),
            corrupted: BTreeSet::new(),
            recombination: vec![0; party_count],
            triples: BTreeMap::new(),
            running: Protocol::None,
            max_dishonest: 0,
            rng: ChaCha20Rng::from_entropy(),
            secrets: BTreeMap::new(),
            data_user: NO_PARTY,
            behavior: Behavior::honest(),
            sync: Arc::new(RoundSync::new()),
            senders: Vec::new(),
            receivers: Vec::new(),
            broadcast: None,
            result: None,
        }
    }

    pub fn pid(&self) -> PartyId {
        self.pid
    }

    pub fn protocol(&self) -> Protocol {
        self.running
    }

    pub fn set_circuit(&mut self, c: Circuit) {
        self.circuit = c;
    }

    pub fn set_protocol(&mut self, p: Protocol) {
        self.running = p;
    }

    pub fn set_broadcast(&mut self, cb: Arc<ConsensusBroadcast>) {
        self.broadcast = Some(cb);
    }

    pub fn set_channels(
        &mut self,
        senders: Vec<Arc<SecureChannel>>,
        receivers: Vec<Arc<SecureChannel>>,
    ) {
        self.senders = senders;
        self.receivers = receivers;
    }

    pub fn set_data_user(&mut self, p: PartyId) {
        self.data_user = p;
    }

    pub fn set_behavior(&mut self, b: Behavior) {
        self.behavior = b;
    }

    pub fn add_secret(&mut self, label: &str, val: u64) -> Result<()> {
        if self.secrets.contains_key(label) {
            return Err(SimulationError::Input(format!(
                "tried to insert secret with existing label: {label}"
            )));
        }
        self.secrets.insert(label.to_string(), val);
        Ok(())
    }

    /// Deterministic per-party RNG derived from a base seed.
    pub fn seed_rng(&mut self, base: u64) {
        let mixed = base ^ (self.pid as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        self.rng = ChaCha20Rng::seed_from_u64(mixed);
    }

    pub fn sync(&self) -> Arc<RoundSync> {
        Arc::clone(&self.sync)
    }

    /// Signals the scheduler that this party is finished, whatever state
    /// the protocol is in. Idempotent.
    pub fn finish(&self) {
        self.sync.end();
    }

    pub fn snapshot(&self) -> PartySnapshot {
        let records = self
            .commitments
            .records()
            .filter(|r| r.is_permanent())
            .map(|r| RecordSnapshot {
                cid: r.commit_id().clone(),
                owner: r.owner(),
                success: r.is_success(),
                opened: r.is_opened(),
                opened_value: r.is_opened().then(|| r.opened_value_raw()),
                input: r.is_input(),
                output: r.is_output(),
                share: r.share(),
                self_value: (r.owner() == self.pid).then(|| r.opened_value_raw()),
            })
            .collect();
        PartySnapshot {
            pid: self.pid,
            dishonest: self.behavior.is_dishonest(),
            corrupted: self.corrupted.clone(),
            records,
        }
    }

    pub fn table_dump(&self) -> String {
        let corrupt: Vec<String> = self.corrupted.iter().map(|p| p.to_string()).collect();
        format!(
            "{}corrupt: [{}]\nrecombination: {:?}",
            self.commitments,
            corrupt.join(" "),
            self.recombination
        )
    }

    // entry points

    pub fn run_protocol(&mut self) -> Result<Option<u64>> {
        let res = match self.running {
            Protocol::Ceps => self.run_ceps(),
            Protocol::Ceas => self.run_ceas(false, true),
            Protocol::CeasWithCircuitRandomization => self.run_ceas(true, true),
            Protocol::None => Err(SimulationError::Config("unknown protocol".into())),
        };
        self.absorb_if_corrupt(res)
    }

    /// Runs CEAS, remaps the committed shares of the result into input
    /// records of `next_circuit` under `prev_result_label`, and runs CEAS
    /// again. The corrupt set carries over.
    pub fn run_protocol_sequential(
        &mut self,
        prev_result_label: &str,
        next_circuit: Circuit,
    ) -> Result<Option<u64>> {
        let res = self.run_sequential_inner(prev_result_label, next_circuit);
        self.absorb_if_corrupt(res)
    }

    fn run_sequential_inner(&mut self, prev_result_label: &str, next_circuit: Circuit) -> Result<()> {
        if self.running != Protocol::Ceas {
            return Err(SimulationError::Config(
                "unsupported protocol for sequential run".into(),
            ));
        }
        self.run_ceas(false, false)?;
        // the input count is chosen as unique suffix so the carried records
        // cannot collide with the next run's input-sharing names
        let suffix = next_circuit.input_count().to_string();
        let result_cid = self.circuit.retrieve_output_cid()?;
        let mut next_table = CommitmentTable::new(self.pid);
        for k in 1..=self.n {
            let old_k = self.share_name_for(k, &result_cid)?;
            let new_k = make_share_name(NO_PARTY, k, &suffix, true, false, false);
            self.commitments.rename(&old_k, &new_k)?;
            let mut rec = self.commitments.remove(&new_k)?;
            rec.clear_output_flag();
            rec.set_input(prev_result_label);
            next_table.adopt(rec)?;
        }
        self.commitments = next_table;
        self.circuit = next_circuit;
        self.run_ceas(false, true)
    }

    /// A party that already knows itself corrupt swallows protocol errors
    /// and leaves quietly; anything unexpected from an honest party is
    /// propagated.
    fn absorb_if_corrupt(&mut self, res: Result<()>) -> Result<Option<u64>> {
        match res {
            Ok(()) => Ok(self.result),
            Err(e) => {
                if self.is_corrupt(self.pid) {
                    self.end();
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    // small helpers

    fn new_msg(&self) -> Message {
        Message::new(self.pid)
    }

    fn interact(&self) {
        self.sync.interact();
    }

    fn end(&self) {
        self.sync.end();
    }

    fn bcast(&self) -> &ConsensusBroadcast {
        self.broadcast
            .as_deref()
            .expect("broadcast checked at sanity time")
    }

    fn send_to(&self, p: PartyId, m: Message) {
        self.senders[p - 1].send(Arc::new(m));
    }

    fn recv_from(&self, p: PartyId) -> Option<MessagePtr> {
        self.receivers[p - 1].recv()
    }

    fn is_corrupt(&self, p: PartyId) -> bool {
        self.corrupted.contains(&p)
    }

    /// Idempotent; raises the tolerance error when the set outgrows what
    /// the running protocol can handle, and always refreshes the
    /// recombination vector.
    fn add_corrupt(&mut self, p: PartyId) -> Result<()> {
        self.corrupted.insert(p);
        if self.corrupted.len() > self.max_dishonest {
            return Err(SimulationError::TooManyCorrupt);
        }
        self.set_recombination_vector();
        Ok(())
    }

    fn set_recombination_vector(&mut self) {
        self.recombination = recombination_vector(self.field, self.n, &self.corrupted);
    }

    fn dot_recombination(&self, shares: &[u64]) -> u64 {
        let mut acc = 0u64;
        for i in 0..self.n {
            acc = self.field.add(acc, self.field.mul(self.recombination[i], shares[i]));
        }
        acc
    }

    /// Round-robin target choice: in iteration i party p addresses p + i.
    /// Needed because each party may receive at most one private message
    /// per round.
    fn target_for_iteration(&self, i: usize) -> PartyId {
        let k = self.pid + i;
        if k > self.n {
            k - self.n
        } else {
            k
        }
    }

    /// The party addressing `target` in the round-robin slot fixed by the
    /// (sample_source, sample_target) pair.
    fn source_from_target(
        &self,
        target: PartyId,
        sample_source: PartyId,
        sample_target: PartyId,
    ) -> PartyId {
        let diff = if sample_target > sample_source {
            sample_target - sample_source
        } else {
            self.n + sample_target - sample_source
        };
        if target > diff {
            target - diff
        } else {
            self.n + target - diff
        }
    }

    fn target_from_source(
        &self,
        source: PartyId,
        sample_source: PartyId,
        sample_target: PartyId,
    ) -> PartyId {
        self.source_from_target(source, sample_target, sample_source)
    }

    /// If the given verifiable share f_k can be cross-checked against the
    /// point f(x, y), evaluate it and report a conflict.
    fn check_consistency(&self, x: PartyId, y: PartyId, val: u64, k: PartyId, f_k: &Poly) -> bool {
        if x == k || y == k {
            let arg = if x == k { y } else { x };
            return f_k.eval(self.field, arg as u64) == val;
        }
        true
    }

    fn share_name_for(&self, k: PartyId, cid: &str) -> Result<CommitmentId> {
        if k == self.pid {
            return Ok(cid.to_string());
        }
        let parts = split_share_name(cid)?;
        if parts.receiver != self.pid {
            return Err(SimulationError::Invariant(
                "given share belongs to other party".into(),
            ));
        }
        Ok(make_share_name_with_prefix(
            &parts.prefix,
            parts.distributor,
            k,
            &parts.suffix,
        ))
    }

    fn sanity_checks(&mut self) -> Result<()> {
        if self.n < 3 {
            return Err(SimulationError::Config(
                "number of computing parties must be greater than 2".into(),
            ));
        }
        if self.running.is_active() {
            // solving for max corrupt C from C <= d and C < n - 2d
            let c = if self.n % 3 == 0 {
                (self.n - 1) / 3
            } else {
                self.n / 3
            };
            if self.n as i64 - 2 * self.d as i64 <= c as i64 {
                return Err(SimulationError::Config(
                    "threshold too large for max. number of corrupt parties".into(),
                ));
            }
            if self.d < c {
                return Err(SimulationError::Config(
                    "threshold too small for max. number of corrupt parties".into(),
                ));
            }
            // the formula gives 0 for n = 3, which would turn the first
            // conviction into an abort; the runtime budget is floored at 1
            self.max_dishonest = c.max(1);
        }
        if self.field.prime() <= self.n as u64 {
            return Err(SimulationError::Config(
                "field size must be greater than number of computing parties".into(),
            ));
        }
        if !is_probable_prime(self.field.prime()) {
            return Err(SimulationError::Config(
                "supplied field prime is a composite".into(),
            ));
        }
        if self.broadcast.is_none() {
            return Err(SimulationError::Config("no secure broadcast".into()));
        }
        if self.senders.len() != self.n || self.receivers.len() != self.n {
            return Err(SimulationError::Config("channels not set".into()));
        }
        if self.circuit.gate_count() == 0 {
            return Err(SimulationError::Config("circuit not set".into()));
        }
        if self.data_user == NO_PARTY || self.data_user > self.n {
            return Err(SimulationError::Config("data user not set".into()));
        }
        if self.circuit.output_count() != 1 {
            return Err(SimulationError::Config(
                "function must have single output".into(),
            ));
        }
        Ok(())
    }

    /// Secrets this party will share for the current circuit: only labels
    /// the circuit declares; everything else stays private and the party
    /// distributes zero fillers instead.
    fn secrets_for_circuit(&self) -> Vec<(String, u64)> {
        let labels = self.circuit.labels();
        self.secrets
            .iter()
            .filter(|(l, _)| labels.contains(l.as_str()))
            .map(|(l, v)| (l.clone(), *v))
            .collect()
    }

    // plain secret sharing (CEPS)

    /// Distributes shares [v; f]_d over the private channels.
    fn distribute_shares(&mut self, val: u64, label: Option<&str>) -> Result<()> {
        let f = Poly::sample(self.field, &mut self.rng, val, self.d);
        if !f.degree_is(self.d) {
            return Err(SimulationError::Protocol("bad polynomial degree".into()));
        }
        let shares = f.eval_at_parties(self.field, self.n);
        for i in 0..self.n {
            let mut m = self.new_msg();
            m.share = Some(shares[i]);
            if let Some(l) = label {
                m.set_input(l);
            }
            self.send_to(i + 1, m);
        }
        Ok(())
    }

    /// Protocol CEPS: circuit evaluation with passive security.
    fn run_ceps(&mut self) -> Result<()> {
        self.sanity_checks()?;
        self.set_recombination_vector();

        // step 1 of 3: input sharing
        let input_num = self.circuit.input_count();
        let mut to_share = self.secrets_for_circuit().into_iter();
        let mut messages: Vec<MessagePtr> = Vec::new();
        let mut loop_counter = 0;
        while messages.len() < input_num && loop_counter < input_num {
            if let Some((label, value)) = to_share.next() {
                self.distribute_shares(value, Some(&label))?;
            }
            self.interact();
            for i in 0..self.n {
                // only data providers are expected to send messages
                if let Some(m) = self.recv_from(i + 1) {
                    messages.push(m);
                }
            }
            loop_counter += 1;
        }
        if messages.len() < input_num {
            return Err(SimulationError::Input("missing inputs".into()));
        }
        if messages.len() > input_num {
            return Err(SimulationError::Input(
                "received more inputs than expected".into(),
            ));
        }
        for m in &messages {
            let share = m
                .share
                .ok_or_else(|| SimulationError::Protocol("input message without share".into()))?;
            let label = m.input_label.as_deref().ok_or_else(|| {
                SimulationError::Protocol("input message without label".into())
            })?;
            self.circuit.assign_input(share, label)?;
        }

        // step 2 of 3: computation
        while let Some(g) = self.circuit.next_ready() {
            match self.circuit.gate(g).kind() {
                GateKind::Add | GateKind::ConstMult(_) => {
                    let v = self.circuit.local_compute(self.field, g)?;
                    self.circuit.assign_result(g, v);
                }
                GateKind::Mult => {
                    // the local product has degree 2d; reshare and recombine
                    let local = self.circuit.local_compute(self.field, g)?;
                    self.distribute_shares(local, None)?;
                    self.interact();
                    let mut shares = vec![0u64; self.n];
                    for i in 0..self.n {
                        match self.recv_from(i + 1) {
                            Some(m) => {
                                shares[i] = m.share.ok_or_else(|| {
                                    SimulationError::Protocol("share message without share".into())
                                })?
                            }
                            // no active cheaters is the standing assumption here
                            None => {
                                return Err(SimulationError::Protocol(
                                    "a party fails to participate".into(),
                                ))
                            }
                        }
                    }
                    let v = self.dot_recombination(&shares);
                    self.circuit.assign_result(g, v);
                }
            }
        }

        // step 3 of 3: output reconstruction
        let mut m = self.new_msg();
        m.share = Some(self.circuit.retrieve_output()?);
        self.send_to(self.data_user, m);
        self.interact();
        if self.pid == self.data_user {
            let mut shares = vec![0u64; self.n];
            let mut received = 0;
            for i in 0..self.n {
                if let Some(m) = self.recv_from(i + 1) {
                    if let Some(s) = m.share {
                        shares[i] = s;
                        received += 1;
                    }
                }
            }
            if received > self.d {
                let v = self.dot_recombination(&shares);
                println!("Evaluation result : {v}");
                self.result = Some(v);
            } else {
                println!(
                    "Data user did not receive enough shares to recover evaluation result. \
                     (Protocol cannot tolerate active cheaters.)"
                );
            }
        }
        self.end();
        Ok(())
    }

    // local commitment algebra (CEAS)

    fn public_commit(&mut self, cid: &str, val: u64) {
        let val = self.field.reduce(val);
        let rec = self.commitments.get_mut(cid).expect("record exists");
        rec.set_share(val);
        rec.set_opened();
        rec.set_opened_value(val);
        let p = Poly::constant(val);
        rec.set_verifiable_share(p.clone());
        rec.set_fx0(p);
        rec.set_done(false); // done, but not successfully
    }

    fn public_commit_to_zero(&mut self, cid: &str) {
        self.public_commit(cid, 0);
    }

    fn add_commitments(&mut self, cid1: &str, cid2: &str) -> Result<CommitmentId> {
        let (o1, s1, ok1) = match self.commitments.get(cid1) {
            Some(r) => (r.owner(), r.share(), r.is_success()),
            None => {
                return Err(SimulationError::Invariant(format!(
                    "trying addition with nonexistent commitment: {cid1}+{cid2}"
                )))
            }
        };
        let (o2, s2, ok2) = match self.commitments.get(cid2) {
            Some(r) => (r.owner(), r.share(), r.is_success()),
            None => {
                return Err(SimulationError::Invariant(format!(
                    "trying addition with nonexistent commitment: {cid1}+{cid2}"
                )))
            }
        };
        if o1 != o2 {
            return Err(SimulationError::Invariant(
                "trying to add commitments with different owners".into(),
            ));
        }
        let cid3 = added_commit_id(cid1, cid2);
        if !self.commitments.exists(&cid3) {
            self.commitments.add_record_named(o1, &cid3);
        }
        if o1 == self.pid {
            let fx0 = {
                let f1 = self.commitments.get(cid1).expect("checked").fx0();
                let f2 = self.commitments.get(cid2).expect("checked").fx0();
                f1.add(self.field, f2)
            };
            let ov = fx0.eval(self.field, 0);
            let rec = self.commitments.get_mut(&cid3).expect("just created");
            rec.set_fx0(fx0);
            rec.set_opened_value(ov);
        }
        let sum = self.field.add(s1, s2);
        let rec = self.commitments.get_mut(&cid3).expect("just created");
        rec.set_share(sum);
        rec.set_done(ok1 && ok2);
        Ok(cid3)
    }

    fn const_mult_commitment(&mut self, c: u64, cid: &str) -> Result<CommitmentId> {
        let c = self.field.reduce(c);
        let (owner, share, ok) = match self.commitments.get(cid) {
            Some(r) => (r.owner(), r.share(), r.is_success()),
            None => {
                return Err(SimulationError::Invariant(format!(
                    "trying scalar multiplication with nonexistent commitment: {cid}"
                )))
            }
        };
        let cid3 = const_mult_commit_id(c, cid);
        if !self.commitments.exists(&cid3) {
            self.commitments.add_record_named(owner, &cid3);
        }
        if owner == self.pid {
            let fx0 = self
                .commitments
                .get(cid)
                .expect("checked")
                .fx0()
                .scalar_mul(self.field, c);
            let ov = fx0.eval(self.field, 0);
            let rec = self.commitments.get_mut(&cid3).expect("just created");
            rec.set_fx0(fx0);
            rec.set_opened_value(ov);
        }
        let rec = self.commitments.get_mut(&cid3).expect("just created");
        rec.set_share(self.field.mul(c, share));
        rec.set_done(ok);
        Ok(cid3)
    }

    fn const_add_commitment(&mut self, c: u64, cid: &str) -> Result<CommitmentId> {
        let owner = self
            .commitments
            .get(cid)
            .ok_or_else(|| {
                SimulationError::Invariant(format!(
                    "trying scalar addition with nonexistent commitment: {cid}"
                ))
            })?
            .owner();
        let temp = self.commitments.add_record(owner);
        self.public_commit(&temp, c);
        self.commitments.get_mut(&temp).expect("just created").set_done(true);
        self.add_commitments(cid, &temp)
    }

    fn subtract_commitments(&mut self, cid1: &str, cid2: &str) -> Result<CommitmentId> {
        let minus_one = self.field.neg(1);
        let minus_second = self.const_mult_commitment(minus_one, cid2)?;
        self.add_commitments(cid1, &minus_second)
    }

    /// <f(k)> = cid + sum over k^i . <cid_coeff_i>, built from add and
    /// scalar-mult so every party forms the same derived records.
    fn combine_coeff_commits_for_sharing(&mut self, cid: &str, k: PartyId) -> Result<CommitmentId> {
        let mut combined = cid.to_string();
        let mut scalar = 1u64;
        for i in 1..=self.d {
            scalar = self.field.mul(scalar, k as u64);
            let coeff_cid = coeff_commit_id_for_sharing(cid, i);
            let term = self.const_mult_commitment(scalar, &coeff_cid)?;
            combined = self.add_commitments(&combined, &term)?;
        }
        Ok(combined)
    }

    fn combine_coeff_commits_for_transfer(
        &mut self,
        cid: &str,
        k: PartyId,
        source: PartyId,
        target: PartyId,
    ) -> Result<CommitmentId> {
        let mut combined = cid.to_string();
        let mut scalar = 1u64;
        for i in 1..=self.d {
            scalar = self.field.mul(scalar, k as u64);
            let coeff_cid = coeff_commit_id_for_transfer(cid, source, target, i);
            let term = self.const_mult_commitment(scalar, &coeff_cid)?;
            combined = self.add_commitments(&combined, &term)?;
        }
        Ok(combined)
    }

    fn combine_coeff_commits_for_mult(
        &mut self,
        poly_name: &str,
        cid: &str,
        cid1: &str,
        cid2: &str,
        k: PartyId,
        degree: usize,
    ) -> Result<CommitmentId> {
        let mut combined = cid.to_string();
        let mut scalar = 1u64;
        for i in 1..=degree {
            scalar = self.field.mul(scalar, k as u64);
            let coeff_cid = coeff_commit_id_for_mult(poly_name, cid1, cid2, i);
            let term = self.const_mult_commitment(scalar, &coeff_cid)?;
            combined = self.add_commitments(&combined, &term)?;
        }
        Ok(combined)
    }

    // the commit protocol (Protocol Perfect-Com-Simple)

    /// Commits this party to `val`. Eight rounds of interaction; every
    /// party runs its own commit in lockstep, so the steps below handle all
    /// ongoing commitments, not just ours. On failure the record is forced
    /// to a public commitment to zero and the owner lands in the corrupt
    /// set.
    fn commit(&mut self, val: u64, predetermined: Option<&str>) -> Result<CommitmentId> {
        let f = SymmBivariatePoly::sample(self.field, &mut self.rng, val, self.d);
        // step 1: privately send verifiable shares f(x, j) to each party j,
        // keep f(0, x) for opening later
        let commit_id = match predetermined {
            None => self.commitments.add_record(self.pid),
            Some(cid) => self.commitments.add_record_named(self.pid, cid),
        };
        for j in 1..=self.n {
            let mut m = self.new_msg();
            m.debug_tag = Some("commit step 1".into());
            m.commit_id = Some(commit_id.clone());
            m.verifiable_share = Some(f.eval_at(self.field, j as u64));
            self.send_to(j, m);
        }
        let fx0 = f.eval_at(self.field, 0);
        let opened = fx0.eval(self.field, 0);
        let rec = self.commitments.get_mut(&commit_id).expect("just created");
        rec.set_fx0(fx0);
        // f(0,0) is saved so it need not be recomputed from fx0 every time
        rec.set_opened_value(opened);
        self.interact();

        // step 2: evaluate every received share polynomial at each peer's
        // index and exchange the points privately
        {
            let mut out: Vec<Message> = (1..=self.n)
                .map(|_| {
                    let mut m = self.new_msg();
                    m.debug_tag = Some("commit step 2".into());
                    m
                })
                .collect();
            for i in 0..self.n {
                let Some(m) = self.recv_from(i + 1) else { continue };
                let mcid = m.commit_id.clone().unwrap_or_default();
                let cid = if m.sender != self.pid {
                    // reserved or colliding ids get rerouted to a fresh name
                    if is_reserved(&mcid) {
                        self.commitments.add_record(m.sender)
                    } else {
                        self.commitments.add_record_named(m.sender, &mcid)
                    }
                } else {
                    mcid
                };
                let vs = m.verifiable_share.clone().unwrap_or_default();
                self.commitments
                    .get_mut(&cid)
                    .expect("just created")
                    .set_verifiable_share(vs.clone());
                let points = vs.eval_at_parties(self.field, self.n);
                for j in 0..self.n {
                    let mut v = points[j];
                    if j == 0 && self.behavior.deviates(Deviation::CommitmentSendInvalidShare) {
                        v = self.field.add(v, 1); // defective point toward party 1
                    }
                    out[j].add_verifier(&cid, v);
                }
            }
            for (j, m) in out.into_iter().enumerate() {
                self.send_to(j + 1, m);
            }
        }
        // remember the declared commitments; later messages about anything
        // else are ignored
        let cids = self.commitments.ongoing_commits();
        self.interact();

        // step 3: the symmetry of f exposes inconsistencies; broadcast the
        // set of peers whose cross-check failed
        {
            let mut bm = self.new_msg();
            bm.debug_tag = Some("commit step 3".into());
            for i in 0..self.n {
                let Some(m) = self.recv_from(i + 1) else { continue };
                if m.sender == self.pid {
                    continue;
                }
                for cid in &cids {
                    let ours = self.commitments.get(cid).expect("declared").verifiable_share();
                    if ours.degree_at_most(self.d) {
                        match m.verifier(cid) {
                            Some(v) => {
                                // their f(m, n) against our f(n, m)
                                if v != ours.eval(self.field, (i + 1) as u64) {
                                    bm.add_dispute(cid, m.sender);
                                }
                            }
                            // a missing verifier cannot be checked; dispute
                            // so the owner has to open
                            None => bm.add_dispute(cid, m.sender),
                        }
                    } else {
                        // wrong degree: the polynomial is useless for any
                        // check, dispute every sender
                        bm.add_dispute(cid, m.sender);
                    }
                }
            }
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();

        // step 4: record everyone's disputes, and for our own commitment
        // broadcast the true f(m, n) of every disputed pair
        {
            let mut bm = self.new_msg();
            bm.debug_tag = Some("commit step 4".into());
            for i in 0..self.n {
                let Some(m) = self.bcast().recv(i + 1) else { continue };
                for cid in &cids {
                    for disputed in m.disputes_for(cid) {
                        self.commitments
                            .get_mut(cid)
                            .expect("declared")
                            .add_dispute(m.sender, disputed);
                    }
                }
            }
            let disputes = self.commitments.get(&commit_id).expect("ours").disputes.clone();
            if !disputes.is_empty() {
                bm.commit_id = Some(commit_id.clone());
            }
            for d in &disputes {
                let v = f.eval_pair(self.field, d.disputer as u64, d.disputed as u64);
                if !self.behavior.deviates(Deviation::CommitmentDoNotOpenDisputed) {
                    bm.add_disputed_value(d.disputer, d.disputed, v);
                }
            }
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();

        // step 5: check that all disputed values were broadcast and agree
        // with what we received privately in step 1; accuse otherwise
        {
            let mut bm = self.new_msg();
            bm.debug_tag = Some("commit step 5".into());
            for cid in &cids {
                let rec = self.commitments.get(cid).expect("declared").clone();
                let owner = rec.owner();
                if owner != self.pid {
                    for d in &rec.disputes {
                        let Some(m) = self.bcast().recv(owner) else {
                            bm.add_accused(owner, "did not open (no message)");
                            break;
                        };
                        match m.disputed_value(d.disputer, d.disputed) {
                            None => {
                                bm.add_accused(
                                    owner,
                                    &format!("did not open {} - {}", d.disputer, d.disputed),
                                );
                                break;
                            }
                            Some(v) => {
                                if !self.check_consistency(
                                    d.disputer,
                                    d.disputed,
                                    v,
                                    self.pid,
                                    rec.verifiable_share(),
                                ) {
                                    bm.add_accused(owner, "opened inconsistent value");
                                    break;
                                }
                            }
                        }
                        if self.behavior.deviates(Deviation::CommitmentAccuseHonest) && owner == 1 {
                            bm.add_accused(owner, "because i am a dirty cheater");
                        }
                    }
                }
                // keep the broadcast points; step 7 checks polynomials
                // against them
                for d in &rec.disputes {
                    if let Some(m) = self.bcast().recv(owner) {
                        if let Some(v) = m.disputed_value(d.disputer, d.disputed) {
                            self.commitments
                                .get_mut(cid)
                                .expect("declared")
                                .set_dispute_value(d.disputer, d.disputed, v);
                        }
                    }
                }
            }
            if self.behavior.deviates(Deviation::CommitmentAccusedDoNotOpenShare) {
                // accuse self so the refusal below has something to refuse
                bm.add_accused(self.pid, "");
            }
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();

        // step 6: record accusations; broadcast f(x, k) for each accuser k
        // of our own commitment
        {
            let mut bm = self.new_msg();
            bm.debug_tag = Some("commit step 6".into());
            for i in 0..self.n {
                let Some(m) = self.bcast().recv(i + 1) else { continue };
                for ac in &m.accusations {
                    if let Some(rec) = self.commitments.record_for_ongoing_commitment(ac.accused) {
                        rec.add_accuser(m.sender);
                    }
                }
            }
            let accusers = self.commitments.get(&commit_id).expect("ours").accusers().clone();
            for k in accusers {
                if !self.behavior.deviates(Deviation::CommitmentAccusedDoNotOpenShare) {
                    bm.add_opened_verifiable_share(k, f.eval_at(self.field, k as u64));
                }
            }
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();

        // step 7: verify the broadcast polynomials: degree, agreement with
        // our own share, and agreement with the points opened in step 4
        {
            let mut bm = self.new_msg();
            bm.debug_tag = Some("commit step 7".into());
            for k in 1..=self.n {
                if k == self.pid {
                    continue;
                }
                let rec_cid = match self.commitments.record_for_ongoing_commitment(k) {
                    Some(r) => r.commit_id().clone(),
                    None => {
                        return Err(SimulationError::Protocol(
                            "missing record for ongoing commitment".into(),
                        ))
                    }
                };
                let rec = self.commitments.get(&rec_cid).expect("found above").clone();
                if rec.accusers().is_empty() {
                    continue;
                }
                let Some(m) = self.bcast().recv(k) else {
                    // accusers exist but the owner opened nothing
                    bm.add_accused(k, "");
                    continue;
                };
                let mut opened_for: BTreeSet<PartyId> = BTreeSet::new();
                for ovs in &m.opened_verifiable_shares {
                    opened_for.insert(ovs.k);
                    if ovs.k == self.pid {
                        self.commitments
                            .get_mut(&rec_cid)
                            .expect("found above")
                            .set_broadcast_verifiable_share(ovs.fkx.clone());
                    }
                }
                if &opened_for != rec.accusers() {
                    // shares missing for some accuser, or extra ones opened
                    bm.add_accused(k, "");
                    self.commitments
                        .get_mut(&rec_cid)
                        .expect("found above")
                        .set_inconsistent_broadcast();
                    continue;
                }
                for ovs in &m.opened_verifiable_shares {
                    if !ovs.fkx.degree_at_most(self.d) {
                        bm.add_accused(k, "");
                        break;
                    }
                    if ovs.k == self.pid && ovs.fkx != *rec.verifiable_share() {
                        bm.add_accused(k, "");
                        break;
                    }
                    for d in &rec.disputes {
                        if d.opened
                            && !self.check_consistency(d.disputer, d.disputed, d.val, ovs.k, &ovs.fkx)
                        {
                            bm.add_accused(k, "");
                            self.commitments
                                .get_mut(&rec_cid)
                                .expect("found above")
                                .set_inconsistent_broadcast();
                            break;
                        }
                    }
                }
            }
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();

        // step 8: final accusation tally; a commitment fails iff the owner
        // broadcast inconsistently or more than d parties accused (so at
        // least one honest party did)
        {
            for i in 0..self.n {
                let Some(m) = self.bcast().recv(i + 1) else { continue };
                for ac in &m.accusations {
                    if let Some(rec) = self.commitments.record_for_ongoing_commitment(ac.accused) {
                        rec.add_accuser(m.sender);
                    }
                }
            }
            for cid in &cids {
                let (failed, owner) = {
                    let rec = self.commitments.get(cid).expect("declared");
                    (
                        rec.is_inconsistent_broadcast() || rec.accuser_count() > self.d,
                        rec.owner(),
                    )
                };
                if failed {
                    self.commitments.get_mut(cid).expect("declared").set_done(false);
                    self.add_corrupt(owner)?;
                    self.public_commit_to_zero(cid);
                } else {
                    let rec = self.commitments.get_mut(cid).expect("declared");
                    rec.set_done(true);
                    let poly = if rec.is_accuser(self.pid) && rec.broadcast_verifiable_share().is_some()
                    {
                        rec.broadcast_verifiable_share().expect("checked").clone()
                    } else {
                        rec.verifiable_share().clone()
                    };
                    let share = poly.eval(self.field, 0);
                    rec.set_share(share);
                }
            }
        }
        self.interact();
        Ok(commit_id)
    }

    /// The polynomial an owner releases to open `cid`, with the configured
    /// corruption applied. `commitment_send_invalid_share` only tampers
    /// with output-share openings.
    fn maybe_corrupt_fx0(&self, cid: &str, fx0: Poly, open_deviation: Deviation) -> Poly {
        let is_output = self
            .commitments
            .get(cid)
            .map(|r| r.is_output())
            .unwrap_or(false);
        if self.behavior.deviates(open_deviation)
            || (is_output && self.behavior.deviates(Deviation::CommitmentSendInvalidShare))
        {
            fx0.neg(self.field)
        } else {
            fx0
        }
    }

    /// Opens a commitment on the broadcast channel; pass None to only
    /// participate in other parties' opens. Because the outcome depends
    /// solely on broadcast content, all honest parties agree on it.
    fn open(&mut self, commit_id: Option<&str>) -> Result<()> {
        let mut opens: Vec<CommitmentId> = Vec::new();
        // step 1: the owner broadcasts f(0, x)
        {
            let mut bm = self.new_msg();
            bm.debug_tag = Some(format!("open step 1 : {}", commit_id.unwrap_or("")));
            bm.commit_id = commit_id.map(String::from);
            if let Some(cid) = commit_id {
                let fx0 = self
                    .commitments
                    .get(cid)
                    .filter(|r| r.owner() == self.pid)
                    .map(|r| r.fx0().clone());
                if let Some(fx0) = fx0 {
                    bm.verifiable_share =
                        Some(self.maybe_corrupt_fx0(cid, fx0, Deviation::OpenWithInvalidFx0));
                }
            }
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();
        // step 2: everyone broadcasts a verifier per ongoing open
        {
            let mut bm = self.new_msg();
            bm.debug_tag = Some("open step 2".into());
            for i in 0..self.n {
                let Some(m) = self.bcast().recv(i + 1) else { continue };
                let Some(mcid) = m.commit_id.clone() else { continue };
                let valid = self
                    .commitments
                    .get(&mcid)
                    .map(|r| r.owner() == m.sender)
                    .unwrap_or(false);
                if valid {
                    opens.push(mcid.clone());
                    let fx0 = m.verifiable_share.clone().unwrap_or_default();
                    self.commitments.get_mut(&mcid).expect("checked").set_fx0(fx0);
                    let mut v = self.commitments.get(&mcid).expect("checked").share();
                    if self.behavior.deviates(Deviation::OpenSendInvalidVerifiers) {
                        v = self.field.add(v, 1);
                    }
                    bm.add_verifier(&mcid, v);
                }
            }
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();
        // step 3: an open succeeds iff fx0 has degree <= d and more than 2d
        // verifiers match the shares derivable from it
        {
            for cid in &opens {
                let (fx0, owner) = {
                    let rec = self.commitments.get(cid).expect("collected");
                    (rec.fx0().clone(), rec.owner())
                };
                if fx0.degree_at_most(self.d) {
                    let mut counter = 0;
                    for i in 0..self.n {
                        let verifier = self.bcast().recv(i + 1).and_then(|m| m.verifier(cid));
                        if let Some(v) = verifier {
                            if v == fx0.eval(self.field, (i + 1) as u64) {
                                counter += 1;
                            }
                        }
                    }
                    if counter > 2 * self.d {
                        let opened = fx0.eval(self.field, 0);
                        let rec = self.commitments.get_mut(cid).expect("collected");
                        rec.set_opened();
                        rec.set_opened_value(opened);
                    } else {
                        self.add_corrupt(owner)?;
                    }
                } else {
                    self.add_corrupt(owner)?;
                }
            }
        }
        self.interact();
        Ok(())
    }

    /// Opens `cid` to party `k` only; everyone else still participates as
    /// a verifier source. Parallel designated opens are legal as long as no
    /// two address the same target, which the round-robin scheme enforces.
    /// A rejected designated open falls back to a public open in place.
    fn designated_open(
        &mut self,
        commit_id: Option<&str>,
        k: PartyId,
        is_output_opening: bool,
    ) -> Result<()> {
        // step 1: fx0 goes privately to k; the broadcast announcement tells
        // everyone about the ongoing set
        {
            if let Some(cid) = commit_id {
                let mut mk = self.new_msg();
                mk.debug_tag = Some(format!("designated open step 1 : {cid}"));
                let fx0 = self
                    .commitments
                    .get(cid)
                    .filter(|r| r.owner() == self.pid)
                    .map(|r| r.fx0().clone());
                if let Some(fx0) = fx0 {
                    mk.commit_id = Some(cid.to_string());
                    mk.verifiable_share = Some(self.maybe_corrupt_fx0(
                        cid,
                        fx0,
                        Deviation::DesignatedOpenWithInvalidFx0,
                    ));
                }
                self.send_to(k, mk);
            }
            let mut bm = self.new_msg();
            bm.commit_id = commit_id.map(String::from);
            bm.target = k;
            bm.debug_tag = Some(format!(
                "designated open step 1 : {} {}",
                commit_id.unwrap_or(""),
                if is_output_opening {
                    "(opening output)".to_string()
                } else {
                    format!("(opening to party {k})")
                }
            ));
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();
        let mut designated_opens: Vec<(CommitmentId, PartyId)> = Vec::new();
        let expected_opener = self.source_from_target(self.pid, self.pid, k);
        // step 2: learn the ongoing opens, take in the private fx0 meant
        // for us, send a verifier privately to each open's target
        {
            for i in 0..self.n {
                let Some(m) = self.bcast().recv(i + 1) else { continue };
                let Some(mcid) = m.commit_id.clone() else { continue };
                let valid = self
                    .commitments
                    .get(&mcid)
                    .map(|r| r.owner() == m.sender)
                    .unwrap_or(false);
                if valid {
                    designated_opens.push((mcid.clone(), m.target));
                    if is_output_opening {
                        // all parallel designated opens are output openings,
                        // or none are
                        self.commitments.get_mut(&mcid).expect("checked").mark_as_output();
                    }
                }
            }
            if let Some(m) = self.recv_from(expected_opener) {
                if let Some(mcid) = m.commit_id.clone() {
                    let valid = self
                        .commitments
                        .get(&mcid)
                        .map(|r| r.owner() == m.sender)
                        .unwrap_or(false);
                    if valid {
                        let fx0 = m.verifiable_share.clone().unwrap_or_default();
                        self.commitments.get_mut(&mcid).expect("checked").set_fx0(fx0);
                    }
                }
            } // with no message the fx0 stays zero, which is fine
            for (cid, target) in &designated_opens {
                let share = self.commitments.get(cid).expect("collected").share();
                let v = if self.behavior.deviates(Deviation::DesignatedOpenSendInvalidVerifiers) {
                    self.field.add(share, 1)
                } else {
                    share
                };
                let mut mk = self.new_msg();
                mk.debug_tag = Some("designated open step 2".into());
                mk.add_verifier(cid, v);
                self.send_to(*target, mk);
            }
        }
        self.interact();
        // step 3: the target validates fx0 against the private verifiers
        // and broadcasts acceptance or rejection
        {
            for (cid, target) in &designated_opens {
                if *target != self.pid {
                    continue;
                }
                let fx0 = self.commitments.get(cid).expect("collected").fx0().clone();
                let mut bm = self.new_msg();
                bm.debug_tag = Some("designated open step 3".into());
                bm.commit_id = Some(cid.clone());
                bm.target = self.pid;
                let mut accepted = false;
                if fx0.degree_at_most(self.d) {
                    let mut counter = 0;
                    for i in 0..self.n {
                        let verifier = self.recv_from(i + 1).and_then(|m| m.verifier(cid));
                        if let Some(v) = verifier {
                            if v == fx0.eval(self.field, (i + 1) as u64) {
                                counter += 1;
                            }
                        }
                    }
                    if counter > 2 * self.d {
                        accepted = true;
                    }
                }
                if accepted {
                    let opened = fx0.eval(self.field, 0);
                    let rec = self.commitments.get_mut(cid).expect("collected");
                    rec.add_designated_open(self.pid);
                    rec.set_opened_value(opened);
                } else {
                    bm.designated_open_rejected = true;
                }
                self.bcast().broadcast(Arc::new(bm));
            }
        }
        self.interact();
        // step 4: rejected owners open publicly, everyone else participates
        {
            let mut ours_rejected = false;
            let mut rejected: BTreeSet<CommitmentId> = BTreeSet::new();
            for i in 0..self.n {
                let Some(m) = self.bcast().recv(i + 1) else { continue };
                let mcid = m.commit_id.clone().unwrap_or_default();
                // only the scheme-designated target may accept or reject
                let source = self.source_from_target(m.sender, self.pid, k);
                let valid = self
                    .commitments
                    .get(&mcid)
                    .map(|r| r.owner() == source)
                    .unwrap_or(false);
                if valid {
                    if m.designated_open_rejected {
                        if source == self.pid {
                            ours_rejected = true;
                        }
                        rejected.insert(mcid);
                    } else {
                        self.commitments
                            .get_mut(&mcid)
                            .expect("checked")
                            .add_designated_open(m.sender);
                    }
                } else {
                    self.add_corrupt(m.sender)?;
                }
            }
            if !rejected.is_empty() {
                if ours_rejected {
                    if self.behavior.deviates(Deviation::DesignatedOpenDoNotOpenRejected) {
                        self.open(None)?;
                    } else {
                        self.open(commit_id)?;
                    }
                } else {
                    self.open(None)?;
                }
            }
            for cid in &rejected {
                let (opened, owner) = {
                    let rec = self.commitments.get(cid).expect("collected");
                    (rec.is_opened(), rec.owner())
                };
                if !opened {
                    // rejected and then not opened either
                    self.add_corrupt(owner)?;
                }
            }
        }
        self.interact();
        Ok(())
    }

    // Protocol Perfect Transfer

    /// Moves ownership of `commit_id` to party `k`, preserving the shared
    /// value and its verifiable-share consistency. All parties transfer in
    /// lockstep, one transfer per party per invocation.
    fn transfer_commitment(&mut self, commit_id: &str, k: PartyId) -> Result<()> {
        // step 0: announce which commitments are being transferred
        {
            let mut bm = self.new_msg();
            bm.debug_tag = Some(format!("transfer step 0 : {commit_id} to party {k}"));
            bm.add_transfer(commit_id, self.pid, k);
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();
        let mut transfers: Vec<CommitmentTransfer> = Vec::new();
        // step 1: validate the announcements, then open to the target
        {
            for i in 0..self.n {
                let sender = i + 1;
                let Some(m) = self.bcast().recv(sender) else { continue };
                if m.transfers.len() == 1 {
                    let ct = &m.transfers[0];
                    let scheme_ok = ct.source == self.source_from_target(ct.target, self.pid, k);
                    let record_ok = self
                        .commitments
                        .get(&ct.commit_id)
                        .map(|r| r.is_success() && r.owner() == ct.source && r.owner() == sender)
                        .unwrap_or(false);
                    if scheme_ok && record_ok {
                        // anything else the message contains is ignored
                        transfers.push(CommitmentTransfer::new(
                            ct.commit_id.clone(),
                            ct.source,
                            ct.target,
                        ));
                    } else {
                        self.add_corrupt(sender)?;
                    }
                } else {
                    // exactly one transfer per party expected
                    self.add_corrupt(sender)?;
                }
            }
            self.designated_open(Some(commit_id), k, false)?;
        }
        // step 2: the target commits to the value opened to it; transfers
        // whose open failed are flagged for the repair step
        {
            let mut trans_to_us = CommitmentTransfer::default();
            let mut value = 0u64;
            for t in &mut transfers {
                if !t.error {
                    let rec = self.commitments.get(&t.commit_id).expect("validated");
                    t.error = !rec.is_value_open_to(t.target);
                    if !t.error && self.pid == t.target {
                        value = rec.opened_value()?;
                        trans_to_us = t.clone();
                    }
                }
            }
            if !trans_to_us.error {
                if self
                    .behavior
                    .deviates(Deviation::TransferTargetCommitsToDifferentValue)
                    && trans_to_us.source == 3
                {
                    value = self.field.add(value, 1);
                }
                let tcid =
                    transferred_commit_id(&trans_to_us.commit_id, trans_to_us.source, trans_to_us.target);
                self.commit(value, Some(&tcid))?;
            } else {
                // dummy commitment to keep the rounds aligned
                self.commit(0, None)?;
            }
        }
        // step 3: the source commits to the coefficients of a fresh
        // polynomial g with g(0) = value and sends them privately to the
        // target, enabling the cross-check of the two commitments
        {
            let mut trans_from_us = CommitmentTransfer::default();
            for t in &mut transfers {
                if !t.error {
                    let tcid = transferred_commit_id(&t.commit_id, t.source, t.target);
                    let ok = self
                        .commitments
                        .get(&tcid)
                        .map(|r| r.owner() == t.target && r.is_success())
                        .unwrap_or(false);
                    if ok {
                        t.transferred_commit_id = tcid;
                    } else {
                        t.error = true;
                    }
                }
                if t.source == self.pid {
                    trans_from_us = t.clone();
                }
            }
            if !trans_from_us.error {
                let opened = self.commitments.get(commit_id).expect("ours").opened_value()?;
                let g = Poly::sample(self.field, &mut self.rng, opened, self.d);
                for i in 1..=self.d {
                    let coeff_cid = coeff_commit_id_for_transfer(commit_id, self.pid, k, i);
                    self.commit(g.coeff(i), Some(&coeff_cid))?;
                }
                let mut gsend = g.clone();
                gsend.set_coeff(0, 0);
                if self
                    .behavior
                    .deviates(Deviation::TransferSourceSendsBadCoefficient)
                    && trans_from_us.target == 3
                {
                    gsend.set_coeff(1, self.field.add(gsend.coeff(1), 1));
                }
                let mut m = self.new_msg();
                m.debug_tag = Some(format!("transfer step 3 : {commit_id}"));
                m.verifiable_share = Some(gsend);
                self.send_to(k, m);
            } else {
                for _ in 1..=self.d {
                    self.commit(0, None)?;
                }
            }
        }
        self.interact();
        // step 3 continued: the target commits to the received coefficients,
        // then both halves are designated-opened pointwise
        {
            let mut g = Poly::zero();
            let mut trans_to_us = CommitmentTransfer::default();
            for t in &transfers {
                if t.target == self.pid {
                    if !t.error {
                        match self.recv_from(t.source) {
                            Some(m) => {
                                let coeffs = m.verifiable_share.clone().unwrap_or_default();
                                if coeffs.degree_is(self.d) {
                                    g = coeffs;
                                } else {
                                    // the source is clearly corrupt but the
                                    // others cannot know yet; assume zeroes
                                    // and force the open later
                                    g = Poly::zero();
                                }
                            }
                            None => g = Poly::zero(),
                        }
                    }
                    trans_to_us = t.clone();
                }
            }
            if !trans_to_us.error {
                for i in 1..=self.d {
                    let coeff_cid = coeff_commit_id_for_transfer(
                        &trans_to_us.transferred_commit_id,
                        trans_to_us.source,
                        trans_to_us.target,
                        i,
                    );
                    self.commit(g.coeff(i), Some(&coeff_cid))?;
                }
            } else {
                for _ in 1..=self.d {
                    self.commit(0, None)?;
                }
            }
            // no more commits will happen; flag transfers with corrupt ends
            for t in &mut transfers {
                if self.is_corrupt(t.target) || self.is_corrupt(t.source) {
                    t.error = true;
                }
            }
            // every party can now locally form <f(k)> and <g(k)> for every
            // pair, which the upcoming designated opens need
            let mut trans_from_us = CommitmentTransfer::default();
            for idx in 0..transfers.len() {
                if !transfers[idx].error {
                    let (cid, tcid, source, target) = {
                        let t = &transfers[idx];
                        (
                            t.commit_id.clone(),
                            t.transferred_commit_id.clone(),
                            t.source,
                            t.target,
                        )
                    };
                    for kk in 1..=self.n {
                        let fk = self.combine_coeff_commits_for_transfer(&cid, kk, source, target)?;
                        let gk = self.combine_coeff_commits_for_transfer(&tcid, kk, source, target)?;
                        transfers[idx].fkx.insert(kk, fk);
                        transfers[idx].gkx.insert(kk, gk);
                    }
                }
                if transfers[idx].source == self.pid {
                    trans_from_us = transfers[idx].clone();
                }
                if transfers[idx].target == self.pid {
                    trans_to_us = transfers[idx].clone();
                }
            }
            for i in 1..self.n {
                let kk = self.target_for_iteration(i);
                if !trans_from_us.error {
                    let cid = trans_from_us.fkx[&kk].clone();
                    self.designated_open(Some(&cid), kk, false)?;
                } else {
                    self.designated_open(None, kk, false)?;
                }
            }
            for i in 1..self.n {
                let kk = self.target_for_iteration(i);
                if !trans_to_us.error {
                    let cid = trans_to_us.gkx[&kk].clone();
                    self.designated_open(Some(&cid), kk, false)?;
                } else {
                    self.designated_open(None, kk, false)?;
                }
            }
        }
        // step 4: check the pair opened to us and broadcast rejections
        {
            let mut bm = self.new_msg();
            bm.debug_tag = Some("transfer step 4 - rejected transfers".into());
            for t in &transfers {
                if t.error {
                    continue;
                }
                let crf = self.commitments.get(&t.fkx[&self.pid]).expect("combined");
                let crg = self.commitments.get(&t.gkx[&self.pid]).expect("combined");
                let open_ok = crf.is_value_open_to_us() && crg.is_value_open_to_us();
                let values_ok = open_ok && crf.opened_value()? == crg.opened_value()?;
                if !values_ok {
                    // only rejections travel; honest rejections are the
                    // interesting ones
                    bm.add_transfer(&t.commit_id, t.source, t.target);
                }
                if self.behavior.deviates(Deviation::TransferRejectValidTransfer)
                    && t.source == 3
                    && t.target == 1
                {
                    bm.add_transfer(&t.commit_id, t.source, t.target);
                }
            }
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();
        // step 5: open the rejected points publicly (aligned across
        // parties), then decide who lied
        {
            for i in 0..self.n {
                let sender = i + 1;
                let Some(m) = self.bcast().recv(sender) else { continue };
                if m.transfers.len() > transfers.len() {
                    self.add_corrupt(sender)?;
                    continue;
                }
                for t in &mut transfers {
                    if t.error {
                        continue;
                    }
                    for reject in &m.transfers {
                        let matches = t.commit_id == reject.commit_id
                            && t.source == reject.source
                            && t.target == reject.target;
                        if matches {
                            t.rejecters.insert(sender);
                            break;
                        }
                    }
                }
            }
            let mut opens_per_party: BTreeMap<PartyId, usize> = BTreeMap::new();
            let mut trans_from_us = CommitmentTransfer::default();
            let mut trans_to_us = CommitmentTransfer::default();
            for t in &transfers {
                if t.source == self.pid {
                    trans_from_us = t.clone();
                }
                if t.target == self.pid {
                    trans_to_us = t.clone();
                }
                if !t.error {
                    *opens_per_party.entry(t.source).or_insert(0) += t.rejecters.len();
                    *opens_per_party.entry(t.target).or_insert(0) += t.rejecters.len();
                }
            }
            let max_opens = opens_per_party.values().copied().max().unwrap_or(0);
            let mut own_opens = 0;
            if !trans_from_us.error {
                for kk in trans_from_us.rejecters.iter() {
                    let cid = trans_from_us.fkx[kk].clone();
                    self.open(Some(&cid))?;
                }
                own_opens += trans_from_us.rejecters.len();
            }
            if !trans_to_us.error {
                for kk in trans_to_us.rejecters.iter() {
                    let cid = trans_to_us.gkx[kk].clone();
                    self.open(Some(&cid))?;
                }
                own_opens += trans_to_us.rejecters.len();
            }
            // everyone participates in the same number of opens
            for _ in own_opens..max_opens {
                self.open(None)?;
            }
            for t in &mut transfers {
                if !t.error && t.is_rejected() {
                    for kk in t.rejecters.clone() {
                        let source_ok = self
                            .commitments
                            .get(&t.fkx[&kk])
                            .map(|r| r.is_opened())
                            .unwrap_or(false);
                        let target_ok = self
                            .commitments
                            .get(&t.gkx[&kk])
                            .map(|r| r.is_opened())
                            .unwrap_or(false);
                        if !source_ok {
                            self.add_corrupt(t.source)?;
                        }
                        if !target_ok {
                            self.add_corrupt(t.target)?;
                        }
                        let open_ok = source_ok && target_ok;
                        let values_ok = open_ok && {
                            let fv = self.commitments.get(&t.fkx[&kk]).expect("opened").opened_value()?;
                            let gv = self.commitments.get(&t.gkx[&kk]).expect("opened").opened_value()?;
                            fv == gv
                        };
                        if !open_ok || !values_ok {
                            t.error = true;
                            break;
                        } else if !self.is_corrupt(t.source) && !self.is_corrupt(t.target) {
                            // both ends opened matching values; the
                            // rejecter lied
                            self.add_corrupt(kk)?;
                        }
                    }
                }
            }
        }
        // step 5 continued: erroneous transfers are repaired with a public
        // commitment so the surrounding VSS keeps consistent shares
        {
            let mut trans_from_us = CommitmentTransfer::default();
            for t in &transfers {
                if t.source == self.pid {
                    trans_from_us = t.clone();
                }
            }
            if trans_from_us.error {
                if self
                    .behavior
                    .deviates(Deviation::TransferSourceDoNotOpenErroneous)
                {
                    self.open(None)?;
                } else {
                    self.open(Some(commit_id))?;
                }
            } else {
                self.open(None)?;
            }
            for t in &mut transfers {
                if !t.error {
                    continue;
                }
                let opened_val = self
                    .commitments
                    .get(&t.commit_id)
                    .filter(|r| r.is_opened())
                    .map(|r| r.opened_value_raw());
                match opened_val {
                    Some(v) => {
                        t.transferred_commit_id =
                            transferred_commit_id(&t.commit_id, t.source, t.target);
                        if !self.commitments.exists(&t.transferred_commit_id) {
                            self.commitments
                                .add_record_named(t.target, &t.transferred_commit_id);
                        }
                        self.public_commit(&t.transferred_commit_id, v);
                    }
                    // the transfer fails for good; zero shares will stand in
                    // for whatever this source distributed
                    None => self.add_corrupt(t.source)?,
                }
            }
        }
        self.interact();
        Ok(())
    }

    // Protocol Perfect Commitment Multiplication

    /// Commits this party to the product of the values behind `cid1` and
    /// `cid2`, with a proof that convinces every checker. All parties
    /// multiply in lockstep.
    fn multiply_commitments(&mut self, cid1: &str, cid2: &str) -> Result<CommitmentId> {
        // step 1: commit to the product and announce the multiplication
        let u = self
            .commitments
            .get(cid1)
            .filter(|r| r.owner() == self.pid)
            .ok_or_else(|| {
                SimulationError::Invariant(format!("bad commit id in multiplication: {cid1}"))
            })?
            .opened_value()?;
        let v = self
            .commitments
            .get(cid2)
            .filter(|r| r.owner() == self.pid)
            .ok_or_else(|| {
                SimulationError::Invariant(format!("bad commit id in multiplication: {cid2}"))
            })?
            .opened_value()?;
        let mut w = self.field.mul(u, v);
        if self
            .behavior
            .deviates(Deviation::MultiplicationCommitToDifferentValue)
        {
            w = self.field.add(w, 1);
        }
        let cid3 = self.commit(w, Some(&multiplied_commit_id(cid1, cid2)))?;
        {
            let mut bm = self.new_msg();
            bm.debug_tag = Some(format!("multiply step 1 : {cid1} * {cid2}"));
            bm.add_multiplication(cid1, cid2, &cid3, self.pid);
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();
        // step 2: validate the announcements, then commit to the
        // coefficients of f, g and h = f * g
        let mut mults: Vec<CommitmentMult> = Vec::new();
        {
            for i in 0..self.n {
                let sender = i + 1;
                match self.bcast().recv(sender) {
                    Some(m) if m.multiplications.len() == 1 => {
                        let rm = &m.multiplications[0];
                        let owned = |cid: &str| {
                            self.commitments
                                .get(cid)
                                .map(|r| r.owner() == sender)
                                .unwrap_or(false)
                        };
                        if owned(&rm.cid1) && owned(&rm.cid2) && owned(&rm.cid3) {
                            mults.push(CommitmentMult::new(
                                rm.cid1.clone(),
                                rm.cid2.clone(),
                                rm.cid3.clone(),
                                sender,
                            ));
                        } else if !self.is_corrupt(self.pid) {
                            // a party already marked corrupt keeps running
                            // but must not convict others over its own
                            // earlier failures
                            self.add_corrupt(sender)?;
                        }
                    }
                    Some(_) => self.add_corrupt(sender)?,
                    None => self.add_corrupt(sender)?,
                }
            }
            let f = Poly::sample(self.field, &mut self.rng, u, self.d);
            let g = Poly::sample(self.field, &mut self.rng, v, self.d);
            let h = f.mul(self.field, &g);
            if !h.degree_is(2 * self.d) {
                return Err(SimulationError::Protocol(
                    "bad polynomial in commitment multiplication".into(),
                ));
            }
            for i in 1..=self.d {
                let coeff_cid = coeff_commit_id_for_mult(POLY_F, cid1, cid2, i);
                self.commit(f.coeff(i), Some(&coeff_cid))?;
            }
            for i in 1..=self.d {
                let coeff_cid = coeff_commit_id_for_mult(POLY_G, cid1, cid2, i);
                self.commit(g.coeff(i), Some(&coeff_cid))?;
            }
            for i in 1..=2 * self.d {
                let coeff_cid = coeff_commit_id_for_mult(POLY_H, cid1, cid2, i);
                self.commit(h.coeff(i), Some(&coeff_cid))?;
            }
            for m in &mut mults {
                if self.is_corrupt(m.owner) {
                    m.error = true;
                }
            }
        }
        // step 3: form <f(k)>, <g(k)>, <h(k)> for every party and
        // designated-open our own to each checker in the round-robin
        {
            let mut my_mult = CommitmentMult::default();
            for idx in 0..mults.len() {
                if !mults[idx].error {
                    let (c1, c2, c3) = {
                        let m = &mults[idx];
                        (m.cid1.clone(), m.cid2.clone(), m.cid3.clone())
                    };
                    for kk in 1..=self.n {
                        let fk = self
                            .combine_coeff_commits_for_mult(POLY_F, &c1, &c1, &c2, kk, self.d)?;
                        let gk = self
                            .combine_coeff_commits_for_mult(POLY_G, &c2, &c1, &c2, kk, self.d)?;
                        let hk = self
                            .combine_coeff_commits_for_mult(POLY_H, &c3, &c1, &c2, kk, 2 * self.d)?;
                        mults[idx].fkx.insert(kk, fk);
                        mults[idx].gkx.insert(kk, gk);
                        mults[idx].hkx.insert(kk, hk);
                    }
                }
                if mults[idx].owner == self.pid {
                    my_mult = mults[idx].clone();
                }
            }
            for i in 1..self.n {
                let kk = self.target_for_iteration(i);
                if !my_mult.error {
                    let fk = my_mult.fkx[&kk].clone();
                    self.designated_open(Some(&fk), kk, false)?;
                    let gk = my_mult.gkx[&kk].clone();
                    self.designated_open(Some(&gk), kk, false)?;
                    let hk = my_mult.hkx[&kk].clone();
                    self.designated_open(Some(&hk), kk, false)?;
                } else {
                    self.designated_open(None, kk, false)?;
                    self.designated_open(None, kk, false)?;
                    self.designated_open(None, kk, false)?;
                }
            }
        }
        // step 4: check f(pid) * g(pid) = h(pid) for each ongoing
        // multiplication; broadcast rejections
        {
            let mut bm = self.new_msg();
            bm.debug_tag = Some("multiply step 4 - rejected multiplications".into());
            for m in &mults {
                if m.error {
                    continue;
                }
                let crf = self.commitments.get(&m.fkx[&self.pid]).expect("combined");
                let crg = self.commitments.get(&m.gkx[&self.pid]).expect("combined");
                let crh = self.commitments.get(&m.hkx[&self.pid]).expect("combined");
                let open_ok = crf.is_value_open_to_us()
                    && crg.is_value_open_to_us()
                    && crh.is_value_open_to_us();
                let values_ok = open_ok && {
                    let prod = self.field.mul(crf.opened_value()?, crg.opened_value()?);
                    prod == crh.opened_value()?
                };
                if !values_ok {
                    bm.add_multiplication(&m.cid1, &m.cid2, &m.cid3, m.owner);
                }
                if self
                    .behavior
                    .deviates(Deviation::MultiplicationRejectValidMultiplication)
                    && m.owner == 3
                {
                    bm.add_multiplication(&m.cid1, &m.cid2, &m.cid3, m.owner);
                }
            }
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();
        // step 5: open the triples for every rejecter (aligned), then
        // decide whether the owner or the rejecter cheated
        {
            for i in 0..self.n {
                let sender = i + 1;
                let Some(m) = self.bcast().recv(sender) else { continue };
                if m.multiplications.len() > mults.len() {
                    self.add_corrupt(sender)?;
                    continue;
                }
                for mm in &mut mults {
                    if mm.error {
                        continue;
                    }
                    for reject in &m.multiplications {
                        let matches = mm.cid1 == reject.cid1
                            && mm.cid2 == reject.cid2
                            && mm.cid3 == reject.cid3;
                        if matches {
                            mm.rejecters.insert(sender);
                            break;
                        }
                    }
                }
            }
            let mut max_rejecters = 0;
            let mut my_mult = CommitmentMult::default();
            for m in &mults {
                if m.owner == self.pid {
                    my_mult = m.clone();
                }
                if !m.error {
                    max_rejecters = max_rejecters.max(m.rejecters.len());
                }
            }
            if !my_mult.error {
                for kk in my_mult.rejecters.iter() {
                    let fk = my_mult.fkx[kk].clone();
                    self.open(Some(&fk))?;
                    let gk = my_mult.gkx[kk].clone();
                    self.open(Some(&gk))?;
                    let hk = my_mult.hkx[kk].clone();
                    self.open(Some(&hk))?;
                }
            }
            let own = if my_mult.error {
                0
            } else {
                my_mult.rejecters.len()
            };
            for _ in own..max_rejecters {
                self.open(None)?;
                self.open(None)?;
                self.open(None)?;
            }
            for m in &mut mults {
                if !m.error && m.is_rejected() {
                    for kk in m.rejecters.clone() {
                        let f_ok = self
                            .commitments
                            .get(&m.fkx[&kk])
                            .map(|r| r.is_opened())
                            .unwrap_or(false);
                        let g_ok = self
                            .commitments
                            .get(&m.gkx[&kk])
                            .map(|r| r.is_opened())
                            .unwrap_or(false);
                        let h_ok = self
                            .commitments
                            .get(&m.hkx[&kk])
                            .map(|r| r.is_opened())
                            .unwrap_or(false);
                        let open_ok = f_ok && g_ok && h_ok;
                        let values_ok = open_ok && {
                            let fv = self.commitments.get(&m.fkx[&kk]).expect("opened").opened_value()?;
                            let gv = self.commitments.get(&m.gkx[&kk]).expect("opened").opened_value()?;
                            let hv = self.commitments.get(&m.hkx[&kk]).expect("opened").opened_value()?;
                            self.field.mul(fv, gv) == hv
                        };
                        if !open_ok || !values_ok {
                            self.add_corrupt(m.owner)?;
                            m.error = true;
                            break;
                        } else if !self.is_corrupt(m.owner) {
                            // the owner also passed the designated opens, so
                            // the rejecter must have lied
                            self.add_corrupt(kk)?;
                        }
                    }
                }
            }
        }
        self.interact();
        Ok(cid3)
    }

    // Verifiable secret sharing

    /// VSS of a fresh value: commit first, then distribute the committed
    /// shares.
    fn distribute_verifiable_shares_value(
        &mut self,
        val: u64,
        unique_suffix: &str,
        label: Option<&str>,
        preprocessing: bool,
        input_phase: bool,
    ) -> Result<()> {
        if (input_phase && preprocessing) || (!input_phase && label.is_some()) {
            return Err(SimulationError::Invariant(
                "conflicting argument values".into(),
            ));
        }
        let cid = self.commit(val, None)?;
        self.distribute_verifiable_shares(&cid, unique_suffix, label, preprocessing, input_phase)
    }

    /// VSS from an existing commitment owned by this party. Honest parties
    /// either receive consistent committed shares or agree the dealer is
    /// dishonest.
    fn distribute_verifiable_shares(
        &mut self,
        cid: &str,
        unique_suffix: &str,
        label: Option<&str>,
        preprocessing: bool,
        input_phase: bool,
    ) -> Result<()> {
        // step 1: commit to every non-constant coefficient of a fresh
        // sharing polynomial and announce the VSS
        {
            self.commitments.clear_vss_flags();
            let val = self
                .commitments
                .get(cid)
                .filter(|r| r.owner() == self.pid)
                .ok_or_else(|| SimulationError::Invariant(format!("bad commit id: {cid}")))?
                .opened_value()?;
            let f = Poly::sample(self.field, &mut self.rng, val, self.d);
            if !f.degree_is(self.d) {
                return Err(SimulationError::Protocol("bad polynomial degree".into()));
            }
            for i in 1..=self.d {
                let coeff_cid = coeff_commit_id_for_sharing(cid, i);
                self.commit(f.coeff(i), Some(&coeff_cid))?;
            }
            let mut bm = self.new_msg();
            bm.commit_id = Some(cid.to_string());
            if let Some(l) = label {
                bm.set_input(l);
            }
            self.bcast().broadcast(Arc::new(bm));
        }
        self.interact();
        // step 2: every coefficient is committed, so every party can form
        // <f(k)> for every dealer and every receiver locally
        let mut share_matrix: BTreeMap<PartyId, Vec<CommitmentId>> = BTreeMap::new();
        let mut labels: BTreeMap<PartyId, Option<String>> = BTreeMap::new();
        {
            let mut vss_msgs: Vec<MessagePtr> = Vec::new();
            for i in 0..self.n {
                let p = i + 1;
                match self.bcast().recv(p) {
                    Some(m) => {
                        let mcid = m.commit_id.clone().unwrap_or_default();
                        let ok = self
                            .commitments
                            .get(&mcid)
                            .map(|r| r.owner() == m.sender)
                            .unwrap_or(false);
                        if ok {
                            vss_msgs.push(m);
                        } else {
                            self.add_corrupt(p)?;
                        }
                    }
                    // every party must deal its share of the interaction
                    None => self.add_corrupt(p)?,
                }
            }
            for m in &vss_msgs {
                let mcid = m.commit_id.clone().expect("validated");
                let mut row = Vec::with_capacity(self.n);
                for kk in 1..=self.n {
                    row.push(self.combine_coeff_commits_for_sharing(&mcid, kk)?);
                }
                share_matrix.insert(m.sender, row);
                labels.insert(
                    m.sender,
                    if input_phase && m.is_input() {
                        m.input_label.clone()
                    } else {
                        None
                    },
                );
            }
        }
        // step 3: transfer our shares to their receivers; each party is
        // targeted at most once per iteration so the transfers can run in
        // parallel
        {
            for i in 1..self.n {
                let kk = self.target_for_iteration(i);
                let share_cid = share_matrix
                    .get(&self.pid)
                    .ok_or_else(|| SimulationError::Protocol("own VSS row missing".into()))?
                    [kk - 1]
                    .clone();
                self.transfer_commitment(&share_cid, kk)?;
            }
            // rename everything into the canonical share-name scheme; for
            // corrupt dealers zero shares stand in, effectively excluding
            // them from recombination
            for p in 1..=self.n {
                for kk in 1..=self.n {
                    let new_name =
                        make_share_name(p, kk, unique_suffix, input_phase, preprocessing, false);
                    if self.is_corrupt(p) {
                        if !self.commitments.exists(&new_name) {
                            self.commitments.add_record_named(kk, &new_name);
                        }
                        self.public_commit_to_zero(&new_name);
                        let rec = self.commitments.get_mut(&new_name).expect("created");
                        rec.set_vss(true);
                        rec.set_permanent();
                        rec.set_distributor(p);
                        rec.set_share_name_suffix(unique_suffix);
                        rec.set_mul_triple(preprocessing);
                        // deliberately not marked as an input: a missing
                        // input halts the run rather than silently becoming
                        // a zero
                    } else {
                        let share_cid = if kk == p {
                            share_matrix[&p][p - 1].clone() // not transferred to self
                        } else {
                            transferred_commit_id(&share_matrix[&p][kk - 1], p, kk)
                        };
                        let label = labels.get(&p).cloned().flatten();
                        self.commitments.rename(&share_cid, &new_name)?;
                        let rec = self.commitments.get_mut(&new_name).expect("renamed");
                        rec.set_vss(true);
                        rec.set_permanent();
                        rec.set_distributor(p);
                        rec.set_share_name_suffix(unique_suffix);
                        if let Some(l) = label {
                            rec.set_input(&l);
                        }
                        rec.set_mul_triple(preprocessing);
                    }
                }
            }
        }
        self.interact();
        Ok(())
    }

    /// Degree reduction: recombine degree-2d committed shares back into a
    /// degree-d committed share, doing every party's local computation so
    /// the records stay synchronized.
    fn run_degree_reduction(
        &mut self,
        share_cids: &[CommitmentId],
        gn: GateNumber,
    ) -> Result<CommitmentId> {
        let mut result = CommitmentId::new();
        for kk in 1..=self.n {
            let mut combined: Option<CommitmentId> = None;
            for cid in share_cids {
                let distributor = self.commitments.get(cid).expect("selected").distributor();
                let r = self.recombination[distributor - 1];
                let share_k = self.share_name_for(kk, cid)?;
                let term = self.const_mult_commitment(r, &share_k)?;
                combined = Some(match combined {
                    None => term,
                    Some(c) => self.add_commitments(&c, &term)?,
                });
            }
            let combined = combined
                .ok_or_else(|| SimulationError::Protocol("no shares to recombine".into()))?;
            let result_k = make_share_name(NO_PARTY, kk, &gn.to_string(), false, false, true);
            self.commitments.rename(&combined, &result_k)?;
            let rec = self.commitments.get(&result_k).expect("renamed");
            if rec.owner() != kk {
                return Err(SimulationError::Invariant(
                    "wire is assigned invalid commitment".into(),
                ));
            }
            self.commitments.get_mut(&result_k).expect("renamed").set_permanent();
            if kk == self.pid {
                result = result_k;
            }
        }
        Ok(result)
    }

    /// Summation over committed shares, renamed into the triple-name scheme.
    fn sum_shares(
        &mut self,
        share_cids: &[CommitmentId],
        gn: GateNumber,
        kind: &str,
    ) -> Result<CommitmentId> {
        let mut result = CommitmentId::new();
        for kk in 1..=self.n {
            let mut combined: Option<CommitmentId> = None;
            for cid in share_cids {
                let share_k = self.share_name_for(kk, cid)?;
                combined = Some(match combined {
                    None => share_k,
                    Some(c) => self.add_commitments(&c, &share_k)?,
                });
            }
            let combined = combined
                .ok_or_else(|| SimulationError::Protocol("no shares to sum".into()))?;
            let result_k = make_triple_name(kk, kind, gn);
            self.commitments.rename(&combined, &result_k)?;
            let rec = self.commitments.get(&result_k).expect("renamed");
            if rec.owner() != kk {
                return Err(SimulationError::Invariant("invalid commitment".into()));
            }
            self.commitments.get_mut(&result_k).expect("renamed").set_permanent();
            if kk == self.pid {
                result = result_k;
            }
        }
        Ok(result)
    }

    /// Preprocessing for circuit randomization: one multiplication triple
    /// per MUL gate. Triples are processed one at a time here; the point is
    /// the round reduction in the evaluation phase, not preprocessing
    /// throughput.
    fn run_preprocessing(&mut self) -> Result<()> {
        let gate_numbers = self.circuit.mult_gate_numbers();
        for gn in &gate_numbers {
            self.triples.insert(*gn, MultiplicationTriple::default());
        }
        for gn in gate_numbers {
            // d + 1 contributions would suffice for a random sum; every
            // party contributing keeps the pattern uniform
            let x = self.field.sample(&mut self.rng);
            let y = self.field.sample(&mut self.rng);
            self.distribute_verifiable_shares_value(
                x,
                &format!("{gn}{TRIPLE_M1}"),
                None,
                true,
                false,
            )?;
            let shares_m1 = self.commitments.vss_shares_received_by(self.pid);
            self.distribute_verifiable_shares_value(
                y,
                &format!("{gn}{TRIPLE_M2}"),
                None,
                true,
                false,
            )?;
            let shares_m2 = self.commitments.vss_shares_received_by(self.pid);
            // any linear combination works; as long as one dealer is honest
            // nobody knows the sum
            let id_mult1 = self.sum_shares(&shares_m1, gn, TRIPLE_M1)?;
            let id_mult2 = self.sum_shares(&shares_m2, gn, TRIPLE_M2)?;
            let product = self.multiply_commitments(&id_mult1, &id_mult2)?;
            self.distribute_verifiable_shares(&product, &gn.to_string(), None, true, false)?;
            self.triples.get_mut(&gn).expect("inserted").received_shares =
                self.commitments.vss_shares_received_by(self.pid);
            for kk in 1..=self.n {
                let id1_k = make_triple_name(kk, TRIPLE_M1, gn);
                let id2_k = make_triple_name(kk, TRIPLE_M2, gn);
                let prod_k = multiplied_commit_id(&id1_k, &id2_k);
                let all_ok = [&id1_k, &id2_k, &prod_k].iter().all(|c| {
                    self.commitments
                        .get(c)
                        .map(|r| r.owner() == kk)
                        .unwrap_or(false)
                });
                if !all_ok {
                    self.add_corrupt(kk)?;
                    continue;
                }
                for c in [&id1_k, &id2_k, &prod_k] {
                    let rec = self.commitments.get_mut(c).expect("checked");
                    rec.set_mul_triple(true);
                    rec.set_permanent();
                }
                if kk == self.pid {
                    let t = self.triples.get_mut(&gn).expect("inserted");
                    t.first_mult = id1_k;
                    t.second_mult = id2_k;
                    t.product = prod_k;
                }
            }
        }
        Ok(())
    }

    /// Protocol CEAS: circuit evaluation with active security, optionally
    /// with circuit randomization.
    fn run_ceas(&mut self, randomization: bool, final_run: bool) -> Result<()> {
        self.sanity_checks()?;
        // the recombination vector is refreshed whenever a party is newly
        // marked corrupt
        self.set_recombination_vector();

        if randomization {
            self.run_preprocessing()?;
            self.commitments.clean_up();
        }

        // step 1 of 3: input sharing
        {
            let input_num = self.circuit.input_count();
            let mut to_share = self.secrets_for_circuit().into_iter();
            let mut loop_counter = 0;
            // a party that never deals cannot stall the loop forever; the
            // counter bound ends it and the shortfall is fatal below
            while self.commitments.input_share_count_received_by(self.pid) < input_num
                && loop_counter < input_num
            {
                let suffix = loop_counter.to_string();
                match to_share.next() {
                    Some((label, value)) => self.distribute_verifiable_shares_value(
                        value,
                        &suffix,
                        Some(&label),
                        false,
                        true,
                    )?,
                    // parties with nothing left to share deal zero fillers
                    // so every iteration has the same interaction pattern
                    None => {
                        self.distribute_verifiable_shares_value(0, &suffix, None, false, true)?
                    }
                }
                loop_counter += 1;
            }
            self.commitments.clean_up();
            let input_shares = self.commitments.input_shares_received_by(self.pid);
            if input_shares.len() < input_num {
                return Err(SimulationError::Input("missing inputs".into()));
            }
            if input_shares.len() > input_num {
                return Err(SimulationError::Input(
                    "received more inputs than expected".into(),
                ));
            }
            for cid in &input_shares {
                let label = self
                    .commitments
                    .get(cid)
                    .and_then(|r| r.input_label().map(String::from))
                    .ok_or_else(|| SimulationError::Invariant("input share without label".into()))?;
                self.circuit.assign_input_cid(cid, &label)?;
                debug!(party = self.pid, cid = %cid, label = %label, "assigned input wire");
            }
        }
        self.interact();

        // step 2 of 3: computation
        while let Some(g) = self.circuit.next_ready() {
            let gn = self.circuit.gate(g).number();
            match self.circuit.gate(g).kind() {
                GateKind::Add => {
                    let cids = self.circuit.input_cids(g)?;
                    for kk in 1..=self.n {
                        // do every party's local computation to keep the
                        // records synchronized
                        let s1 = self.share_name_for(kk, &cids[0])?;
                        let s2 = self.share_name_for(kk, &cids[1])?;
                        let add_k = self.add_commitments(&s1, &s2)?;
                        let result_k =
                            make_share_name(NO_PARTY, kk, &gn.to_string(), false, false, true);
                        self.commitments.rename(&add_k, &result_k)?;
                        self.finish_gate_share(g, kk, &result_k)?;
                    }
                }
                GateKind::ConstMult(c) => {
                    let scalar = self.field.reduce_signed(c);
                    let cids = self.circuit.input_cids(g)?;
                    for kk in 1..=self.n {
                        let s_k = self.share_name_for(kk, &cids[0])?;
                        let mult_k = self.const_mult_commitment(scalar, &s_k)?;
                        let result_k =
                            make_share_name(NO_PARTY, kk, &gn.to_string(), false, false, true);
                        self.commitments.rename(&mult_k, &result_k)?;
                        self.finish_gate_share(g, kk, &result_k)?;
                    }
                }
                GateKind::Mult if randomization => {
                    self.process_mult_gate_randomized(g, gn)?;
                }
                GateKind::Mult => {
                    // [[ab; fg]]_2d = [[a; f]]_d * [[b; g]]_d, then reduce
                    let cids = self.circuit.input_cids(g)?;
                    let local = self.multiply_commitments(&cids[0], &cids[1])?;
                    self.distribute_verifiable_shares(&local, &gn.to_string(), None, false, false)?;
                    let mut received = self.commitments.vss_shares_received_by(self.pid);
                    received.retain(|c| {
                        let dist = self.commitments.get(c).expect("selected").distributor();
                        !self.is_corrupt(dist)
                    });
                    if received.len() <= 2 * self.d {
                        // deg(h) = 2d, so fewer shares cannot recombine
                        return Err(SimulationError::Protocol(
                            "more dishonest than the protocol can handle".into(),
                        ));
                    }
                    received
                        .sort_by_key(|c| self.commitments.get(c).expect("selected").distributor());
                    let result = self.run_degree_reduction(&received, gn)?;
                    self.circuit.assign_result_cid(g, &result);
                    debug!(party = self.pid, gate = gn, cid = %result, "multiplication gate reduced");
                }
            }
            self.commitments.clean_up();
        }
        self.interact();

        // step 3 of 3: output reconstruction
        {
            let result = self.circuit.retrieve_output_cid()?;
            // parties cannot designated-open to the same target in
            // parallel, so they take turns
            for i in 0..self.n {
                let kk = i + 1;
                if kk == self.data_user {
                    continue;
                }
                if kk == self.pid {
                    self.designated_open(Some(&result), self.data_user, true)?;
                } else {
                    // single share per party is enforced by the target
                    // selection scheme
                    let target = self.target_from_source(self.pid, kk, self.data_user);
                    self.designated_open(None, target, true)?;
                }
            }
            if self.pid == self.data_user {
                // our own share was never designated-opened; mark it here
                self.commitments
                    .get_mut(&result)
                    .expect("output cid")
                    .mark_as_output();
                let mut output_shares = self.commitments.output_shares();
                if output_shares.len() > self.n {
                    return Err(SimulationError::Protocol("too many output shares".into()));
                }
                output_shares.retain(|c| {
                    let r = self.commitments.get(c).expect("listed");
                    r.is_value_open_to_us() && !self.is_corrupt(r.owner())
                });
                if output_shares.len() > self.d {
                    let mut shares = vec![0u64; self.n];
                    for c in &output_shares {
                        let r = self.commitments.get(c).expect("listed");
                        shares[r.owner() - 1] = r.opened_value()?;
                    }
                    let v = self.dot_recombination(&shares);
                    println!("Evaluation result : {v}");
                    self.result = Some(v);
                } else {
                    println!(
                        "Data user did not receive enough shares to recover evaluation result. \
                         (More dishonest than the protocol can handle)"
                    );
                }
            }
        }
        if final_run {
            self.end();
        } else {
            self.interact();
        }
        Ok(())
    }

    fn finish_gate_share(&mut self, g: crate::circuit::GateId, kk: PartyId, result_k: &str) -> Result<()> {
        let rec = self.commitments.get(result_k).expect("renamed");
        if rec.owner() != kk {
            return Err(SimulationError::Invariant(
                "wire is assigned invalid commitment".into(),
            ));
        }
        self.commitments.get_mut(result_k).expect("renamed").set_permanent();
        if kk == self.pid {
            self.circuit.assign_result_cid(g, result_k);
        }
        Ok(())
    }

    /// Multiplication gate under circuit randomization: open e = a - x and
    /// d = b - y, then [[ab]] = [[xy]] + e[[b]] + d[[a]] - e.d. The two
    /// opens are the only interaction the gate needs.
    fn process_mult_gate_randomized(
        &mut self,
        g: crate::circuit::GateId,
        gn: GateNumber,
    ) -> Result<()> {
        let triple = self
            .triples
            .get(&gn)
            .cloned()
            .ok_or_else(|| SimulationError::Invariant("missing triple".into()))?;
        let cids = self.circuit.input_cids(g)?;
        let mut e_pid = CommitmentId::new();
        let mut d_pid = CommitmentId::new();
        for kk in 1..=self.n {
            let in1_k = self.share_name_for(kk, &cids[0])?;
            let in2_k = self.share_name_for(kk, &cids[1])?;
            let e = self.subtract_commitments(&in1_k, &make_triple_name(kk, TRIPLE_M1, gn))?;
            let dd = self.subtract_commitments(&in2_k, &make_triple_name(kk, TRIPLE_M2, gn))?;
            let e_new = make_triple_name(kk, TRIPLE_E, gn);
            let d_new = make_triple_name(kk, TRIPLE_D, gn);
            self.commitments.rename(&e, &e_new)?;
            self.commitments.rename(&dd, &d_new)?;
            if kk == self.pid {
                e_pid = e_new;
                d_pid = d_new;
            }
        }
        self.open(Some(&e_pid.clone()))?;
        self.open(Some(&d_pid.clone()))?;
        // recombine the kept product shares into our degree-d share of xy
        let mut received: Vec<CommitmentId> = triple
            .received_shares
            .iter()
            .filter(|c| {
                self.commitments
                    .get(c)
                    .map(|r| !self.is_corrupt(r.distributor()))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        if received.len() <= 2 * self.d {
            return Err(SimulationError::Protocol(
                "more dishonest than the protocol can handle".into(),
            ));
        }
        received.sort_by_key(|c| self.commitments.get(c).expect("selected").distributor());
        let result_pid = self.run_degree_reduction(&received, gn)?;
        for kk in 1..=self.n {
            let ek = make_triple_name(kk, TRIPLE_E, gn);
            let dk = make_triple_name(kk, TRIPLE_D, gn);
            let e_opened = self
                .commitments
                .get(&ek)
                .map(|r| r.is_opened())
                .unwrap_or(false);
            let d_opened = self
                .commitments
                .get(&dk)
                .map(|r| r.is_opened())
                .unwrap_or(false);
            if !e_opened || !d_opened {
                self.add_corrupt(kk)?;
                if kk == self.pid {
                    // corrupt parties stay alive; the result share keeps
                    // the protocol moving
                    self.circuit.assign_result_cid(g, &result_pid);
                }
                continue;
            }
            let e_val = self.commitments.get(&ek).expect("opened").opened_value()?;
            let d_val = self.commitments.get(&dk).expect("opened").opened_value()?;
            let in1_k = self.share_name_for(kk, &cids[0])?;
            let in2_k = self.share_name_for(kk, &cids[1])?;
            let result_k = make_share_name(NO_PARTY, kk, &gn.to_string(), false, false, true);
            let temp_k = make_triple_name(kk, TRIPLE_PROD, gn);
            // start from [[x * y]]
            self.commitments.rename(&result_k, &temp_k)?;
            let term_e = self.const_mult_commitment(e_val, &in2_k)?;
            let temp_k = self.add_commitments(&temp_k, &term_e)?;
            let term_d = self.const_mult_commitment(d_val, &in1_k)?;
            let temp_k = self.add_commitments(&temp_k, &term_d)?;
            let minus_ed = self.field.neg(self.field.mul(e_val, d_val));
            let temp_k = self.const_add_commitment(minus_ed, &temp_k)?;
            self.commitments.rename(&temp_k, &result_k)?;
            self.finish_gate_share(g, kk, &result_k)?;
        }
        Ok(())
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_party(pid: PartyId, n: usize, t: usize, p: u64) -> Party {
        let mut party = Party::new(pid, n, t, p);
        party.seed_rng(42);
        party
    }

    #[test]
    fn round_robin_targets_cycle_over_all_peers() {
        let p = local_party(2, 5, 2, 2039);
        let targets: Vec<PartyId> = (1..5).map(|i| p.target_for_iteration(i)).collect();
        assert_eq!(targets, vec![3, 4, 5, 1]);
        // each party is targeted at most once per iteration
        for i in 1..5 {
            let mut seen = BTreeSet::new();
            for pid in 1..=5 {
                let q = local_party(pid, 5, 2, 2039);
                assert!(seen.insert(q.target_for_iteration(i)));
            }
        }
    }

    #[test]
    fn source_and_target_schemes_invert_each_other() {
        let p = local_party(1, 5, 2, 2039);
        for source in 1..=5 {
            for target in 1..=5 {
                if source == target {
                    continue;
                }
                for x in 1..=5 {
                    let t = p.target_from_source(x, source, target);
                    assert_eq!(p.source_from_target(t, source, target), x);
                }
            }
        }
    }

    #[test]
    fn corrupt_bookkeeping_updates_recombination() {
        let mut p = local_party(1, 3, 2, 2039);
        p.max_dishonest = 1;
        p.set_recombination_vector();
        assert!(p.recombination.iter().all(|&r| r != 0));
        p.add_corrupt(2).unwrap();
        assert!(p.is_corrupt(2));
        assert_eq!(p.recombination[1], 0);
        // idempotent
        p.add_corrupt(2).unwrap();
        // beyond the budget the tolerance error fires
        assert!(matches!(
            p.add_corrupt(3),
            Err(SimulationError::TooManyCorrupt)
        ));
    }

    #[test]
    fn share_names_translate_between_parties() {
        let p = local_party(2, 3, 2, 2039);
        let mine = make_share_name(1, 2, "0", true, false, false);
        assert_eq!(p.share_name_for(2, &mine).unwrap(), mine);
        assert_eq!(p.share_name_for(3, &mine).unwrap(), "share(input)@1@3@0");
        // a share held by someone else cannot be translated
        let theirs = make_share_name(1, 3, "0", true, false, false);
        assert!(p.share_name_for(1, &theirs).is_err());
    }

    #[test]
    fn commitment_algebra_tracks_shares_and_values() {
        let mut p = local_party(1, 3, 2, 2039);
        let f = p.field;
        let a = p.commitments.add_record_named(1, "a");
        p.public_commit(&a, 20);
        p.commitments.get_mut(&a).unwrap().set_done(true);
        let b = p.commitments.add_record_named(1, "b");
        p.public_commit(&b, 5);
        p.commitments.get_mut(&b).unwrap().set_done(true);

        let sum = p.add_commitments(&a, &b).unwrap();
        assert_eq!(sum, "_(a_+_b)_");
        assert_eq!(p.commitments.get(&sum).unwrap().share(), 25);
        assert_eq!(p.commitments.get(&sum).unwrap().opened_value().unwrap(), 25);
        assert!(p.commitments.get(&sum).unwrap().is_success());

        let scaled = p.const_mult_commitment(3, &a).unwrap();
        assert_eq!(scaled, "_(3_._a)_");
        assert_eq!(p.commitments.get(&scaled).unwrap().share(), 60);

        let diff = p.subtract_commitments(&a, &b).unwrap();
        assert_eq!(p.commitments.get(&diff).unwrap().share(), 15);
        assert_eq!(
            p.commitments.get(&diff).unwrap().opened_value().unwrap(),
            15
        );

        let shifted = p.const_add_commitment(f.neg(1), &a).unwrap();
        assert_eq!(p.commitments.get(&shifted).unwrap().share(), 19);
    }

    #[test]
    fn adding_commitments_of_different_owners_is_fatal() {
        let mut p = local_party(1, 3, 2, 2039);
        let a = p.commitments.add_record_named(1, "a");
        p.public_commit(&a, 1);
        let b = p.commitments.add_record_named(2, "b");
        p.public_commit(&b, 2);
        assert!(matches!(
            p.add_commitments(&a, &b),
            Err(SimulationError::Invariant(_))
        ));
        assert!(p.add_commitments(&a, "ghost").is_err());
    }

    #[test]
    fn combined_coefficient_commitments_interpolate_the_share() {
        // combining <v> with k^i-weighted coefficient commitments must
        // yield a commitment to f(k)
        let mut p = local_party(1, 4, 3, 2039);
        let f = p.field;
        let v = 123u64;
        let poly = Poly::from_coeffs(vec![v, 7, 11]);
        let base = p.commitments.add_record_named(1, "base");
        p.public_commit(&base, v);
        p.commitments.get_mut(&base).unwrap().set_done(true);
        for i in 1..=2 {
            let cid = coeff_commit_id_for_sharing("base", i);
            let cid = p.commitments.add_record_named(1, &cid);
            p.public_commit(&cid, poly.coeff(i));
            p.commitments.get_mut(&cid).unwrap().set_done(true);
        }
        for k in 1..=4u64 {
            let combined = p.combine_coeff_commits_for_sharing("base", k as usize).unwrap();
            let rec = p.commitments.get(&combined).unwrap();
            assert_eq!(rec.opened_value().unwrap(), poly.eval(f, k));
            assert_eq!(rec.share(), poly.eval(f, k));
        }
    }

    #[test]
    fn sanity_rejects_bad_configurations() {
        // too few parties
        let mut p = local_party(1, 2, 2, 2039);
        assert!(p.sanity_checks().is_err());
        // composite prime
        let mut p = local_party(1, 3, 2, 2040);
        p.running = Protocol::Ceps;
        assert!(p.sanity_checks().is_err());
        // field too small
        let mut p = local_party(1, 5, 2, 5);
        assert!(p.sanity_checks().is_err());
        // threshold too large for the active band: n=4, t=3 gives d=2 and
        // n - 2d = 0 <= c
        let mut p = local_party(1, 4, 3, 2039);
        p.running = Protocol::Ceas;
        assert!(p.sanity_checks().is_err());
    }

    #[test]
    fn active_sanity_floors_the_corruption_budget() {
        let mut p = local_party(1, 3, 2, 2039);
        p.running = Protocol::Ceas;
        p.set_circuit(Circuit::parse("a*b").unwrap());
        p.set_broadcast(Arc::new(ConsensusBroadcast::new()));
        let senders = (0..3).map(|_| Arc::new(SecureChannel::new())).collect();
        let receivers = (0..3).map(|_| Arc::new(SecureChannel::new())).collect();
        p.set_channels(senders, receivers);
        p.set_data_user(1);
        p.sanity_checks().unwrap();
        assert_eq!(p.max_dishonest, 1);
        // n = 7 gives the plain floor(n/3)
        let mut p7 = local_party(1, 7, 3, 2039);
        p7.running = Protocol::Ceas;
        p7.set_circuit(Circuit::parse("a*b").unwrap());
        p7.set_broadcast(Arc::new(ConsensusBroadcast::new()));
        let senders = (0..7).map(|_| Arc::new(SecureChannel::new())).collect();
        let receivers = (0..7).map(|_| Arc::new(SecureChannel::new())).collect();
        p7.set_channels(senders, receivers);
        p7.set_data_user(1);
        p7.sanity_checks().unwrap();
        assert_eq!(p7.max_dishonest, 2);
    }

    #[test]
    fn duplicate_secret_labels_are_rejected() {
        let mut p = local_party(1, 3, 2, 2039);
        p.add_secret("a", 3).unwrap();
        assert!(p.add_secret("a", 4).is_err());
        p.set_circuit(Circuit::parse("a*b").unwrap());
        // only labels the circuit declares are shared
        p.add_secret("z", 9).unwrap();
        let shared = p.secrets_for_circuit();
        assert_eq!(shared, vec![("a".to_string(), 3)]);
    }

    #[test]
    fn consistency_check_only_applies_to_touching_pairs() {
        let p = local_party(1, 3, 2, 2039);
        let f_k = Poly::from_coeffs(vec![4, 2]); // 4 + 2x
        // pair (2, 3) does not touch party 1: always consistent
        assert!(p.check_consistency(2, 3, 999, 1, &f_k));
        // pair (1, 3): f_1(3) = 10
        assert!(p.check_consistency(1, 3, 10, 1, &f_k));
        assert!(!p.check_consistency(1, 3, 11, 1, &f_k));
        assert!(p.check_consistency(3, 1, 10, 1, &f_k));
    }
}
