use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

use crate::message::MessagePtr;
use crate::PartyId;

/// A private channel slot for one direction (i -> j).
///
/// At most one message per round: `send` stages into the future buffer, the
/// scheduler promotes future to present at the round barrier, `recv` reads
/// the present. Reading does not consume - several protocol steps inspect
/// the same round's message more than once.
#[derive(Debug, Default)]
pub struct SecureChannel {
    slots: Mutex<Slots>,
}

#[derive(Debug, Default)]
struct Slots {
    future: Option<MessagePtr>,
    present: Option<MessagePtr>,
}

impl SecureChannel {
    pub fn new() -> SecureChannel {
        SecureChannel::default()
    }

    pub fn send(&self, m: MessagePtr) {
        self.slots.lock().unwrap().future = Some(m);
    }

    pub fn has_msg(&self) -> bool {
        self.slots.lock().unwrap().present.is_some()
    }

    pub fn recv(&self) -> Option<MessagePtr> {
        self.slots.lock().unwrap().present.clone()
    }

    /// Discards the past and promotes the future. Only the scheduler calls
    /// this, at the round barrier.
    pub fn swap_to_future(&self) {
        let mut slots = self.slots.lock().unwrap();
        slots.present = slots.future.take();
    }
}

/// Consensus broadcast: every party sees the same sender -> message map for
/// a round. Writes are mutex-guarded because all party threads insert into
/// the future map concurrently during the local-compute phase.
#[derive(Debug, Default)]
pub struct ConsensusBroadcast {
    slots: Mutex<BroadcastSlots>,
}

#[derive(Debug, Default)]
struct BroadcastSlots {
    future: BTreeMap<PartyId, MessagePtr>,
    present: BTreeMap<PartyId, MessagePtr>,
}

impl ConsensusBroadcast {
    pub fn new() -> ConsensusBroadcast {
        ConsensusBroadcast::default()
    }

    pub fn broadcast(&self, m: MessagePtr) {
        let sender = m.sender;
        self.slots.lock().unwrap().future.insert(sender, m);
    }

    pub fn has_msg(&self, sender: PartyId) -> bool {
        self.slots.lock().unwrap().present.contains_key(&sender)
    }

    pub fn recv(&self, sender: PartyId) -> Option<MessagePtr> {
        self.slots.lock().unwrap().present.get(&sender).cloned()
    }

    pub fn swap_to_future(&self) {
        let mut slots = self.slots.lock().unwrap();
        slots.present = std::mem::take(&mut slots.future);
    }
}

/// The handshake between one party thread and the scheduler.
///
/// `interact` flips `interactive`, wakes the scheduler, and blocks until the
/// scheduler has swapped the channel buffers and granted `messages_ready`.
/// A party in `done` state releases the scheduler once and never interacts
/// again.
#[derive(Debug, Default)]
pub struct RoundSync {
    state: Mutex<SyncState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct SyncState {
    interactive: bool,
    messages_ready: bool,
    done: bool,
    aborted: bool,
}

impl RoundSync {
    pub fn new() -> RoundSync {
        RoundSync::default()
    }

    /// Called by the party at each suspension point.
    ///
    /// Panics if the scheduler aborted the run (round-limit safety net);
    /// the party thread unwinds and the simulator reports the failure.
    pub fn interact(&self) {
        let mut st = self.state.lock().unwrap();
        st.interactive = true;
        self.cv.notify_all();
        st = self
            .cv
            .wait_while(st, |st| !st.messages_ready)
            .unwrap();
        st.messages_ready = false;
        if st.aborted {
            panic!("simulation aborted by the scheduler");
        }
    }

    /// Called by the party when it leaves the protocol, normally or not.
    pub fn end(&self) {
        let mut st = self.state.lock().unwrap();
        st.done = true;
        st.interactive = true; // let the scheduler progress and terminate
        self.cv.notify_all();
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().done
    }

    /// Scheduler side: block until the party reaches its next suspension
    /// point (or is done for good).
    pub fn wait_interactive(&self) {
        let st = self.state.lock().unwrap();
        let _st = self
            .cv
            .wait_while(st, |st| !st.interactive && !st.done)
            .unwrap();
    }

    /// Scheduler side: rearm the suspension point.
    pub fn clear_interactive(&self) {
        let mut st = self.state.lock().unwrap();
        if !st.done {
            st.interactive = false;
        }
    }

    /// Scheduler side: release the party into the next round.
    pub fn release(&self) {
        let mut st = self.state.lock().unwrap();
        if !st.done {
            st.messages_ready = true;
            self.cv.notify_all();
        }
    }

    /// Scheduler side: unblock the party and make its next suspension
    /// point fail. Last resort when the round limit is hit.
    pub fn abort(&self) {
        let mut st = self.state.lock().unwrap();
        st.aborted = true;
        st.messages_ready = true;
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::sync::Arc;

    fn msg(sender: PartyId) -> MessagePtr {
        Arc::new(Message::new(sender))
    }

    #[test]
    fn channel_messages_appear_only_after_the_swap() {
        let ch = SecureChannel::new();
        ch.send(msg(1));
        assert!(!ch.has_msg());
        ch.swap_to_future();
        assert!(ch.has_msg());
        assert_eq!(ch.recv().unwrap().sender, 1);
        // reading does not consume within the round
        assert!(ch.has_msg());
        // next swap discards the past
        ch.swap_to_future();
        assert!(!ch.has_msg());
    }

    #[test]
    fn channel_carries_at_most_one_message_per_round() {
        let ch = SecureChannel::new();
        ch.send(msg(1));
        ch.send(msg(2));
        ch.swap_to_future();
        assert_eq!(ch.recv().unwrap().sender, 2);
    }

    #[test]
    fn broadcast_is_keyed_by_sender() {
        let cb = ConsensusBroadcast::new();
        cb.broadcast(msg(1));
        cb.broadcast(msg(3));
        assert!(!cb.has_msg(1));
        cb.swap_to_future();
        assert!(cb.has_msg(1));
        assert!(!cb.has_msg(2));
        assert!(cb.has_msg(3));
        assert_eq!(cb.recv(3).unwrap().sender, 3);
        cb.swap_to_future();
        assert!(!cb.has_msg(1));
    }

    #[test]
    fn round_sync_handshake() {
        use std::thread;
        let sync = Arc::new(RoundSync::new());
        let party = Arc::clone(&sync);
        let handle = thread::spawn(move || {
            for _ in 0..3 {
                party.interact();
            }
            party.end();
        });
        for _ in 0..3 {
            sync.wait_interactive();
            assert!(!sync.is_done());
            sync.clear_interactive();
            sync.release();
        }
        sync.wait_interactive();
        assert!(sync.is_done());
        handle.join().unwrap();
    }
}
