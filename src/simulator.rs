use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::behavior::Behavior;
use crate::channel::{ConsensusBroadcast, RoundSync, SecureChannel};
use crate::circuit::Circuit;
use crate::error::{Result, SimulationError};
use crate::options::SimulatorOptions;
use crate::party::{Party, PartySnapshot};
use crate::{Protocol, NO_PARTY};

/// What a finished run leaves behind: the per-party protocol outcomes (the
/// data user's entry carries the evaluation result) and a snapshot of each
/// party's permanent records for invariant checking.
#[derive(Debug)]
pub struct SimulationReport {
    pub rounds: u64,
    pub results: Vec<Option<u64>>,
    pub parties: Vec<PartySnapshot>,
}

impl SimulationReport {
    pub fn result_at_data_user(&self, data_user: usize) -> Option<u64> {
        self.results.get(data_user - 1).copied().flatten()
    }
}

/// Builds the party fleet from an options file and drives it to completion.
///
/// One thread per party plus the scheduler; channels form an N x N matrix
/// of directed slots, so promoting every future buffer at the barrier is
/// all the delivery there is.
pub struct Simulator {
    options: SimulatorOptions,
    seed: Option<u64>,
    round_length: Duration,
    max_rounds: u64,
}

impl Simulator {
    pub fn new(options: SimulatorOptions) -> Simulator {
        Simulator {
            options,
            seed: None,
            round_length: Duration::ZERO,
            max_rounds: 1_000_000,
        }
    }

    /// Fixed base seed; with it, a run is bit-for-bit reproducible.
    pub fn with_seed(mut self, seed: u64) -> Simulator {
        self.seed = Some(seed);
        self
    }

    /// Simulated wire delay per round. Zero is semantically sound because
    /// the buffer swaps are atomic either way.
    pub fn with_round_length(mut self, d: Duration) -> Simulator {
        self.round_length = d;
        self
    }

    fn build_circuit(&self) -> Result<Circuit> {
        match &self.options.comparator {
            Some(c) => Circuit::comparator(c.bitlength, &c.label_a, &c.label_b, &c.label_one),
            None => Circuit::parse(&self.options.circuit_desc),
        }
    }

    pub fn run(&self) -> Result<SimulationReport> {
        let opts = &self.options;
        let n = opts.n;
        if n == 0 {
            return Err(SimulationError::Options("party count must be positive".into()));
        }
        let broadcast = Arc::new(ConsensusBroadcast::new());
        let channels: Vec<Vec<Arc<SecureChannel>>> = (0..n)
            .map(|_| (0..n).map(|_| Arc::new(SecureChannel::new())).collect())
            .collect();

        let mut parties = Vec::with_capacity(n);
        for i in 0..n {
            let pid = i + 1;
            let mut party = Party::new(pid, n, opts.threshold, opts.field_prime);
            // the circuit is built separately for each party to mimic
            // execution on independent machines
            party.set_circuit(self.build_circuit()?);
            party.set_protocol(opts.protocol);
            party.set_broadcast(Arc::clone(&broadcast));
            let senders = (0..n).map(|j| Arc::clone(&channels[i][j])).collect();
            let receivers = (0..n).map(|j| Arc::clone(&channels[j][i])).collect();
            party.set_channels(senders, receivers);
            party.set_data_user(opts.data_user);
            if let Some(seed) = self.seed {
                party.seed_rng(seed);
            }
            parties.push(party);
        }
        for input in &opts.secrets {
            if input.party == NO_PARTY || input.party > n {
                return Err(SimulationError::Options(format!(
                    "input for unknown party {}",
                    input.party
                )));
            }
            parties[input.party - 1].add_secret(&input.label, input.value)?;
        }
        for (p, deviations) in &opts.corrupted {
            if *p == NO_PARTY || *p > n {
                return Err(SimulationError::Options(format!("unknown corrupt party {p}")));
            }
            parties[*p - 1].set_behavior(Behavior::dishonest(deviations.iter().copied()));
        }

        let syncs: Vec<Arc<RoundSync>> = parties.iter().map(|p| p.sync()).collect();
        let seq_run = opts.seq_run.clone();
        let mut handles = Vec::with_capacity(n);
        for mut party in parties {
            let seq_run = seq_run.clone();
            handles.push(thread::spawn(
                move || -> (Result<Option<u64>>, PartySnapshot) {
                    let res = match &seq_run {
                        Some(seq) if party.protocol() == Protocol::Ceas => {
                            match Circuit::parse(&seq.next_circuit_desc) {
                                Ok(next) => {
                                    party.run_protocol_sequential(&seq.prev_result_label, next)
                                }
                                Err(e) => Err(e),
                            }
                        }
                        _ => party.run_protocol(),
                    };
                    if res.is_err() {
                        // let the scheduler wind down even though this
                        // party went wrong
                        party.finish();
                    }
                    debug!(party = party.pid(), "final state\n{}", party.table_dump());
                    (res, party.snapshot())
                },
            ));
        }

        let rounds = self.synchronize(&syncs, &channels, &broadcast);

        let mut results = Vec::with_capacity(n);
        let mut snapshots = Vec::with_capacity(n);
        let mut first_err: Option<SimulationError> = None;
        for (i, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok((res, snapshot)) => {
                    match res {
                        Ok(v) => results.push(v),
                        Err(e) => {
                            results.push(None);
                            if first_err.is_none() {
                                first_err = Some(SimulationError::Party(i + 1, Box::new(e)));
                            }
                        }
                    }
                    snapshots.push(snapshot);
                }
                Err(_) => {
                    results.push(None);
                    snapshots.push(PartySnapshot::default());
                    if first_err.is_none() {
                        first_err =
                            Some(SimulationError::Protocol(format!("party {} panicked", i + 1)));
                    }
                }
            }
        }
        if let Some(e) = first_err {
            return Err(e);
        }
        Ok(SimulationReport {
            rounds,
            results,
            parties: snapshots,
        })
    }

    /// The synchronizer: waits for every live party to reach its suspension
    /// point, swaps all channel buffers at once, and releases the fleet
    /// into the next round. Messages sent in round r are therefore observed
    /// in round r+1 and never earlier or later.
    fn synchronize(
        &self,
        syncs: &[Arc<RoundSync>],
        channels: &[Vec<Arc<SecureChannel>>],
        broadcast: &ConsensusBroadcast,
    ) -> u64 {
        let mut rounds: u64 = 0;
        loop {
            if syncs.iter().all(|s| s.is_done()) {
                return rounds;
            }
            for s in syncs {
                if !s.is_done() {
                    s.wait_interactive();
                }
            }
            if syncs.iter().all(|s| s.is_done()) {
                return rounds;
            }
            for s in syncs {
                s.clear_interactive();
            }
            rounds += 1;
            println!("**************************************************************");
            println!("Transmitting messages. Round : {rounds}");
            broadcast.swap_to_future();
            for row in channels {
                for ch in row {
                    ch.swap_to_future();
                }
            }
            if tracing::enabled!(tracing::Level::DEBUG) {
                self.dump_round(channels, broadcast);
            }
            if rounds >= self.max_rounds {
                for s in syncs {
                    s.abort();
                }
                return rounds;
            }
            if !self.round_length.is_zero() {
                thread::sleep(self.round_length);
            }
            for s in syncs {
                s.release();
            }
        }
    }

    fn dump_round(&self, channels: &[Vec<Arc<SecureChannel>>], broadcast: &ConsensusBroadcast) {
        for (i, row) in channels.iter().enumerate() {
            for (j, ch) in row.iter().enumerate() {
                if let Some(m) = ch.recv() {
                    debug!(from = i + 1, to = j + 1, "private: {m}");
                }
            }
        }
        for p in 1..=channels.len() {
            if let Some(m) = broadcast.recv(p) {
                debug!(from = p, "broadcast: {m}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(text: &str) -> SimulatorOptions {
        text.parse().unwrap()
    }

    #[test]
    fn rejects_out_of_range_parties() {
        let text = "\
# N
@3
# T
@2
# FIELD_PRIME
@2039
# PROTOCOL
@1
# INPUTS
@9@a@3
# CORRUPT
# DATA_USER
@1
# COMPARATOR
@FALSE
# CIRCUIT_DESC
@a
# SEQ_RUN
@FALSE
";
        let sim = Simulator::new(options(text));
        assert!(matches!(sim.run(), Err(SimulationError::Options(_))));
    }

    #[test]
    fn config_errors_are_fatal_at_startup() {
        // composite field prime: every party fails its sanity checks
        let text = "\
# N
@3
# T
@2
# FIELD_PRIME
@2040
# PROTOCOL
@1
# INPUTS
@1@a@3
@2@b@5
@3@c@7
# CORRUPT
# DATA_USER
@1
# COMPARATOR
@FALSE
# CIRCUIT_DESC
@(a+b)*(c.2)
# SEQ_RUN
@FALSE
";
        let sim = Simulator::new(options(text));
        match sim.run() {
            Err(SimulationError::Party(_, inner)) => {
                assert!(matches!(*inner, SimulationError::Config(_)))
            }
            other => panic!("expected a config failure, got {other:?}"),
        }
    }
}
