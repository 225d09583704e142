use shared::messages::Heartbeat;
use shared::types::{LivenessState, LoadEstimate, NodeId, Role};
use std::collections::HashMap;
use tracing::debug;

/// Everything this node currently believes about one peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: NodeId,
    pub role: Role,
    pub load: LoadEstimate,
    pub liveness: LivenessState,
    last_seq: u64,
    last_seen_tick: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivenessTransition {
    pub node: NodeId,
    pub from: LivenessState,
    pub to: LivenessState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Accepted,
    /// Accepted, and the peer was Suspected or Dead before.
    Recovered,
    /// Sequence number did not advance; the beacon was dropped.
    Stale,
}

/// Per-node liveness table. Heartbeats and interval ticks feed it; the
/// classification is purely local and never gossiped. One missed
/// interval is tolerated silently, longer gaps walk the peer through
/// Suspected to Dead.
pub struct HealthMonitor {
    peers: HashMap<NodeId, PeerRecord>,
    tick: u64,
    suspect_after: u32,
    dead_after: u32,
}

impl HealthMonitor {
    pub fn new(suspect_after: u32, dead_after: u32) -> Self {
        Self {
            peers: HashMap::new(),
            tick: 0,
            suspect_after,
            dead_after,
        }
    }

    /// Registers a configured peer before any beacon arrives. It starts
    /// Alive and has until the dead window expires to prove itself, so a
    /// peer that is down from the very beginning is still detected.
    pub fn seed_peer(&mut self, id: NodeId, role: Role) {
        self.peers.entry(id.clone()).or_insert(PeerRecord {
            id,
            role,
            load: LoadEstimate::Unknown,
            liveness: LivenessState::Alive,
            last_seq: 0,
            last_seen_tick: self.tick,
        });
    }

    /// Applies one heartbeat. Beacons whose sequence number does not
    /// advance past the last accepted one are dropped, so duplicated or
    /// reordered delivery can only refresh, never regress, the view.
    pub fn record_heartbeat(&mut self, hb: &Heartbeat) -> HeartbeatOutcome {
        match self.peers.get_mut(&hb.sender) {
            Some(rec) => {
                if hb.seq <= rec.last_seq {
                    debug!(peer = %hb.sender, seq = hb.seq, last = rec.last_seq, "stale heartbeat dropped");
                    return HeartbeatOutcome::Stale;
                }
                let was = rec.liveness;
                rec.last_seq = hb.seq;
                rec.last_seen_tick = self.tick;
                rec.role = hb.role;
                rec.load = hb.load;
                rec.liveness = LivenessState::Alive;
                if was == LivenessState::Alive {
                    HeartbeatOutcome::Accepted
                } else {
                    HeartbeatOutcome::Recovered
                }
            }
            None => {
                self.peers.insert(
                    hb.sender.clone(),
                    PeerRecord {
                        id: hb.sender.clone(),
                        role: hb.role,
                        load: hb.load,
                        liveness: LivenessState::Alive,
                        last_seq: hb.seq,
                        last_seen_tick: self.tick,
                    },
                );
                HeartbeatOutcome::Accepted
            }
        }
    }

    /// Advances the interval clock and reclassifies every peer. Returns
    /// only the transitions, so callers can react to edges rather than
    /// levels.
    pub fn tick(&mut self) -> Vec<LivenessTransition> {
        self.tick += 1;
        let mut transitions = Vec::new();
        for rec in self.peers.values_mut() {
            let misses = (self.tick - rec.last_seen_tick) as u32;
            let next = if misses < self.suspect_after {
                LivenessState::Alive
            } else if misses < self.dead_after {
                LivenessState::Suspected
            } else {
                LivenessState::Dead
            };
            if next != rec.liveness {
                transitions.push(LivenessTransition {
                    node: rec.id.clone(),
                    from: rec.liveness,
                    to: next,
                });
                rec.liveness = next;
            }
        }
        transitions
    }

    /// A peer this node has never heard of is as good as dead.
    pub fn liveness_of(&self, id: &NodeId) -> LivenessState {
        self.peers
            .get(id)
            .map(|r| r.liveness)
            .unwrap_or(LivenessState::Dead)
    }

    pub fn load_of(&self, id: &NodeId) -> LoadEstimate {
        self.peers
            .get(id)
            .map(|r| r.load)
            .unwrap_or(LoadEstimate::Unknown)
    }

    pub fn record(&self, id: &NodeId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn alive_peer_count(&self) -> usize {
        self.peers
            .values()
            .filter(|r| r.liveness == LivenessState::Alive)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hb(sender: &str, seq: u64) -> Heartbeat {
        Heartbeat {
            sender: sender.into(),
            role: Role::Worker,
            load: LoadEstimate::Known(25),
            seq,
        }
    }

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(3, 8)
    }

    #[test]
    fn tolerates_two_missed_intervals() {
        let mut m = monitor();
        m.record_heartbeat(&hb("office", 1));

        assert!(m.tick().is_empty());
        assert!(m.tick().is_empty());
        assert_eq!(m.liveness_of(&"office".into()), LivenessState::Alive);
    }

    #[test]
    fn suspects_after_three_misses_and_kills_after_eight() {
        let mut m = monitor();
        m.record_heartbeat(&hb("office", 1));

        m.tick();
        m.tick();
        let transitions = m.tick();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, LivenessState::Suspected);

        for _ in 0..4 {
            assert!(m.tick().is_empty());
        }
        let transitions = m.tick();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].from, LivenessState::Suspected);
        assert_eq!(transitions[0].to, LivenessState::Dead);
        assert_eq!(m.liveness_of(&"office".into()), LivenessState::Dead);
    }

    #[test]
    fn any_valid_heartbeat_revives_a_peer() {
        let mut m = monitor();
        m.record_heartbeat(&hb("office", 1));
        for _ in 0..10 {
            m.tick();
        }
        assert_eq!(m.liveness_of(&"office".into()), LivenessState::Dead);

        let outcome = m.record_heartbeat(&hb("office", 2));
        assert_eq!(outcome, HeartbeatOutcome::Recovered);
        assert_eq!(m.liveness_of(&"office".into()), LivenessState::Alive);
    }

    #[test]
    fn stale_sequence_numbers_do_not_refresh() {
        let mut m = monitor();
        m.record_heartbeat(&hb("office", 5));
        m.tick();
        m.tick();

        // Reordered delivery of an older beacon.
        assert_eq!(m.record_heartbeat(&hb("office", 3)), HeartbeatOutcome::Stale);
        assert_eq!(m.record_heartbeat(&hb("office", 5)), HeartbeatOutcome::Stale);

        // The decay clock keeps running as if nothing arrived.
        let transitions = m.tick();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].to, LivenessState::Suspected);
    }

    #[test]
    fn replayed_burst_leaves_state_as_a_single_delivery_would() {
        let mut m = monitor();
        m.record_heartbeat(&hb("office", 7));
        let before = m.snapshot();

        for _ in 0..5 {
            m.record_heartbeat(&hb("office", 7));
        }
        let after = m.snapshot();
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].liveness, after[0].liveness);
        assert_eq!(before[0].last_seq, after[0].last_seq);
    }

    #[test]
    fn unknown_peer_reads_dead_and_unknown_load() {
        let m = monitor();
        assert_eq!(m.liveness_of(&"ghost".into()), LivenessState::Dead);
        assert_eq!(m.load_of(&"ghost".into()), LoadEstimate::Unknown);
    }

    #[test]
    fn heartbeats_carry_load_and_role() {
        let mut m = monitor();
        let beacon = Heartbeat {
            sender: "kitchen".into(),
            role: Role::Coordinator,
            load: LoadEstimate::Known(62),
            seq: 1,
        };
        m.record_heartbeat(&beacon);

        let rec = m.record(&"kitchen".into()).unwrap();
        assert_eq!(rec.load, LoadEstimate::Known(62));
        assert_eq!(rec.role, Role::Coordinator);
    }

    #[test]
    fn seeded_peer_decays_if_it_never_speaks() {
        let mut m = monitor();
        m.seed_peer("hallway".into(), Role::Worker);
        assert_eq!(m.liveness_of(&"hallway".into()), LivenessState::Alive);

        for _ in 0..8 {
            m.tick();
        }
        assert_eq!(m.liveness_of(&"hallway".into()), LivenessState::Dead);
    }
}
