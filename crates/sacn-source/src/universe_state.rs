//! Per-universe transmit state.
//!
//! Each universe keeps its levels datagram (and optionally a 0xDD
//! per-address-priority datagram) fully serialized; mutations patch the
//! affected bytes in place and the 44 Hz tick decides which buffers go
//! out. The tick math lives here, away from any socket, so the cadence
//! and termination rules are tested without I/O.

use sacn_protocol::frame::DataFrame;
use sacn_protocol::packet::StartCode;
use sacn_protocol::{Priority, SourceName, Universe, UNIVERSE_SIZE};
use uuid::Uuid;

/// Number of terminated packets sent before a universe stops, and the
/// resend window after any mutation.
pub(crate) const DIRTY_SENDS: u8 = 3;

/// Ticks (of 44 per cycle) that carry a keep-alive levels packet even
/// with no changes pending.
const KEEPALIVE_TICKS: [u8; 4] = [0, 11, 22, 33];

/// What one tick decided for one universe. The patched buffers are read
/// off the state afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct TickPlan {
    pub send_levels: bool,
    pub send_priorities: bool,
    /// The termination burst just finished; the caller drops (or parks)
    /// the universe.
    pub finished_terminating: bool,
}

pub(crate) struct UniverseState {
    universe: Universe,
    priority: Priority,
    levels: DataFrame,
    priorities: Option<DataFrame>,
    sequence: u8,
    transmit_counter: u8,
    dirty_counter: u8,
    dirty_priority: bool,
    should_terminate: bool,
    remove_after_terminate: bool,
    /// Burst finished after a whole-source stop; held for resume, not
    /// ticked.
    parked: bool,
}

impl UniverseState {
    pub fn new(
        cid: Uuid,
        name: &SourceName,
        universe: Universe,
        priority: Priority,
        levels: &[u8],
        priorities: Option<&[u8]>,
    ) -> Self {
        let levels_frame = DataFrame::new(
            cid,
            name,
            priority,
            universe,
            StartCode::Levels,
            &pad(levels),
        );
        let priorities_frame = priorities.map(|values| {
            DataFrame::new(
                cid,
                name,
                priority,
                universe,
                StartCode::PerAddressPriority,
                &clamp_priorities(values),
            )
        });
        UniverseState {
            universe,
            priority,
            levels: levels_frame,
            priorities: priorities_frame,
            sequence: 0,
            transmit_counter: 0,
            dirty_counter: DIRTY_SENDS,
            dirty_priority: priorities.is_some(),
            should_terminate: false,
            remove_after_terminate: false,
            parked: false,
        }
    }

    pub fn universe(&self) -> Universe {
        self.universe
    }

    pub fn is_terminating(&self) -> bool {
        self.should_terminate
    }

    pub fn remove_after_terminate(&self) -> bool {
        self.remove_after_terminate
    }

    pub fn is_parked(&self) -> bool {
        self.parked
    }

    pub fn park(&mut self) {
        self.parked = true;
    }

    pub fn levels_frame(&self) -> &DataFrame {
        &self.levels
    }

    pub fn priorities_frame(&self) -> Option<&DataFrame> {
        self.priorities.as_ref()
    }

    // -- Tick --

    /// Advance one transmit tick: choose what to send, stamp sequence
    /// numbers into the outgoing buffers, and age the dirty counters.
    pub fn tick(&mut self) -> TickPlan {
        let keepalive = KEEPALIVE_TICKS.contains(&self.transmit_counter);
        let send_levels = keepalive || self.dirty_counter > 0;
        let send_priorities = self.priorities.is_some()
            && !self.should_terminate
            && (self.dirty_priority || self.transmit_counter == 0);

        let mut plan = TickPlan::default();
        if send_levels {
            self.levels.set_sequence(self.sequence);
            self.sequence = self.sequence.wrapping_add(1);
            plan.send_levels = true;
            if self.dirty_counter > 0 {
                self.dirty_counter -= 1;
                if self.dirty_counter == 0 && self.should_terminate {
                    plan.finished_terminating = true;
                }
            }
        }
        if send_priorities {
            let frame = self.priorities.as_mut().expect("checked above");
            frame.set_sequence(self.sequence);
            self.sequence = self.sequence.wrapping_add(1);
            self.dirty_priority = false;
            plan.send_priorities = true;
        }

        self.transmit_counter = (self.transmit_counter + 1) % sacn_protocol::TICKS_PER_CYCLE;
        plan
    }

    // -- Mutations --

    pub fn set_levels(&mut self, levels: &[u8]) {
        self.levels.set_values(&pad(levels));
        self.mark_dirty();
    }

    pub fn set_slot(&mut self, slot: usize, level: u8) {
        self.levels.set_slot(slot, level);
        self.mark_dirty();
    }

    /// Install, replace, or (with `None`) withdraw the per-address
    /// priority stream.
    pub fn set_priorities(&mut self, cid: Uuid, name: &SourceName, priorities: Option<&[u8]>) {
        match priorities {
            Some(values) => match self.priorities.as_mut() {
                Some(frame) => frame.set_values(&clamp_priorities(values)),
                None => {
                    let frame = DataFrame::new(
                        cid,
                        name,
                        self.priority,
                        self.universe,
                        StartCode::PerAddressPriority,
                        &clamp_priorities(values),
                    );
                    self.priorities = Some(frame);
                }
            },
            None => {
                self.priorities = None;
            }
        }
        self.dirty_priority = self.priorities.is_some();
        self.mark_dirty();
    }

    pub fn set_universe_priority(&mut self, priority: Priority) {
        self.priority = priority;
        self.levels.set_priority(priority);
        if let Some(frame) = self.priorities.as_mut() {
            frame.set_priority(priority);
        }
        self.mark_dirty();
    }

    pub fn set_source_name(&mut self, name: &SourceName) {
        self.levels.set_source_name(name);
        if let Some(frame) = self.priorities.as_mut() {
            frame.set_source_name(name);
        }
        self.mark_dirty();
    }

    /// Begin the terminated-packet burst. The next three levels packets
    /// carry the Terminated bit; `tick` reports when the burst is done.
    pub fn terminate(&mut self, remove: bool) {
        self.should_terminate = true;
        self.remove_after_terminate = remove;
        self.dirty_counter = DIRTY_SENDS;
        self.levels.set_terminated(true);
    }

    /// Re-arm a universe parked by a whole-source stop so a restart
    /// transmits it again from a clean cycle.
    pub fn revive(&mut self) {
        self.should_terminate = false;
        self.remove_after_terminate = false;
        self.parked = false;
        self.levels.set_terminated(false);
        self.transmit_counter = 0;
        self.dirty_counter = DIRTY_SENDS;
        self.dirty_priority = self.priorities.is_some();
    }

    /// One terminated levels datagram for a socket being retired,
    /// stamped with the next sequence number. The live buffer's option
    /// bits are left as they were.
    pub fn terminated_snapshot(&mut self) -> Vec<u8> {
        self.levels.set_sequence(self.sequence);
        self.sequence = self.sequence.wrapping_add(1);
        let was_terminating = self.should_terminate;
        if !was_terminating {
            self.levels.set_terminated(true);
        }
        let bytes = self.levels.as_bytes().to_vec();
        if !was_terminating {
            self.levels.set_terminated(false);
        }
        bytes
    }

    fn mark_dirty(&mut self) {
        self.dirty_counter = DIRTY_SENDS;
    }
}

fn pad(values: &[u8]) -> [u8; UNIVERSE_SIZE] {
    let mut out = [0u8; UNIVERSE_SIZE];
    let len = values.len().min(UNIVERSE_SIZE);
    out[..len].copy_from_slice(&values[..len]);
    out
}

fn clamp_priorities(values: &[u8]) -> [u8; UNIVERSE_SIZE] {
    let mut out = pad(values);
    for value in out.iter_mut().take(values.len().min(UNIVERSE_SIZE)) {
        *value = Priority::clamped(*value).get();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sacn_protocol::packet::Packet;
    use sacn_protocol::TICKS_PER_CYCLE;

    fn state(priorities: Option<&[u8]>) -> UniverseState {
        UniverseState::new(
            Uuid::from_bytes([1; 16]),
            &SourceName::new("test"),
            Universe::new(1).unwrap(),
            Priority::default(),
            &[255, 128],
            priorities,
        )
    }

    fn drain_dirty(state: &mut UniverseState) {
        // A fresh universe resends for three ticks; run a full cycle so
        // the next one starts clean at transmit counter 0.
        for _ in 0..TICKS_PER_CYCLE {
            state.tick();
        }
    }

    #[test]
    fn steady_state_sends_on_keepalive_ticks_only() {
        let mut state = state(None);
        drain_dirty(&mut state);

        let mut sent = Vec::new();
        for tick in 0..TICKS_PER_CYCLE {
            if state.tick().send_levels {
                sent.push(tick);
            }
        }
        assert_eq!(sent, vec![0, 11, 22, 33]);
    }

    #[test]
    fn mutation_forces_three_consecutive_sends() {
        let mut state = state(None);
        drain_dirty(&mut state);

        state.tick(); // tick 0, keep-alive
        state.set_slot(0, 10);
        let sent: Vec<bool> = (0..4).map(|_| state.tick().send_levels).collect();
        // Ticks 1, 2, 3 resend the change; tick 4 is quiet again.
        assert_eq!(sent, vec![true, true, true, false]);
    }

    #[test]
    fn priority_stream_sends_on_cycle_start_and_when_dirty() {
        let mut state = state(Some(&[100; 512]));
        drain_dirty(&mut state);

        let mut sent = Vec::new();
        for tick in 0..TICKS_PER_CYCLE {
            if state.tick().send_priorities {
                sent.push(tick);
            }
        }
        assert_eq!(sent, vec![0]);

        state.set_priorities(
            Uuid::from_bytes([1; 16]),
            &SourceName::new("test"),
            Some(&[90; 512]),
        );
        assert!(state.tick().send_priorities);
        assert!(!state.tick().send_priorities);
    }

    #[test]
    fn sequence_shared_between_streams() {
        let mut state = state(Some(&[100; 512]));
        let plan = state.tick();
        assert!(plan.send_levels && plan.send_priorities);

        let levels_seq = state.levels_frame().sequence();
        let priorities_seq = state.priorities_frame().unwrap().sequence();
        assert_eq!(priorities_seq, levels_seq.wrapping_add(1));
    }

    #[test]
    fn termination_burst_is_exactly_three_packets() {
        let mut state = state(Some(&[100; 512]));
        drain_dirty(&mut state);
        state.tick(); // tick 0

        state.terminate(true);
        let mut terminated_sends = 0;
        let mut finished = false;
        for _ in 0..10 {
            if finished {
                break;
            }
            let plan = state.tick();
            assert!(!plan.send_priorities, "no PAP during termination");
            if plan.send_levels {
                terminated_sends += 1;
                let Ok(Packet::Data(packet)) = Packet::parse(state.levels_frame().as_bytes())
                else {
                    panic!("frame must parse");
                };
                assert!(packet.terminated);
            }
            finished = plan.finished_terminating;
        }
        assert_eq!(terminated_sends, 3);
        assert!(finished);
        assert!(state.remove_after_terminate());
    }

    #[test]
    fn revive_clears_termination() {
        let mut state = state(None);
        state.terminate(false);
        while !state.tick().finished_terminating {}

        state.revive();
        assert!(!state.is_terminating());
        let plan = state.tick();
        assert!(plan.send_levels);
        let Ok(Packet::Data(packet)) = Packet::parse(state.levels_frame().as_bytes()) else {
            panic!("frame must parse");
        };
        assert!(!packet.terminated);
    }

    #[test]
    fn forty_four_sends_per_cycle_while_dirty_free() {
        let mut state = state(None);
        drain_dirty(&mut state);

        // Two clean cycles: 4 keep-alives each.
        let sends: usize = (0..TICKS_PER_CYCLE as usize * 2)
            .filter(|_| state.tick().send_levels)
            .count();
        assert_eq!(sends, 8);
    }
}
