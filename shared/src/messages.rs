use crate::types::{LoadEstimate, NodeId, Role, Task, TaskOutcome, Term};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FleetMessage {
    Heartbeat(Heartbeat),
    Ballot(ElectionBallot),
    Vote(ElectionVote),
    Announce(Announcement),
    Assign(TaskAssignment),
    Complete(TaskCompletion),
}

impl FleetMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            FleetMessage::Heartbeat(_) => "heartbeat",
            FleetMessage::Ballot(_) => "ballot",
            FleetMessage::Vote(_) => "vote",
            FleetMessage::Announce(_) => "announce",
            FleetMessage::Assign(_) => "assign",
            FleetMessage::Complete(_) => "complete",
        }
    }
}

/// Periodic liveness beacon. `seq` increases strictly per sender so
/// receivers can discard reordered or duplicated beacons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sender: NodeId,
    pub role: Role,
    pub load: LoadEstimate,
    pub seq: u64,
}

/// A node's claim to coordination for `term`, weighted by `priority`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionBallot {
    pub candidate: NodeId,
    pub priority: f64,
    pub term: Term,
}

impl ElectionBallot {
    /// True when this ballot beats `other` for the same term: higher
    /// priority wins, equal priorities fall back to the lexically
    /// smaller candidate id. Every node applies the same order, so all
    /// voters pick the same winner from the same ballots.
    pub fn outranks(&self, other: &ElectionBallot) -> bool {
        match self.priority.partial_cmp(&other.priority) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Less) => false,
            _ => self.candidate < other.candidate,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionVote {
    pub voter: NodeId,
    pub candidate: NodeId,
    pub term: Term,
}

/// Role claim, broadcast on startup, on winning an election and when a
/// supervisor reclaims coordination after an outage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub sender: NodeId,
    pub role: Role,
    pub term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub coordinator: NodeId,
    pub task: Task,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCompletion {
    pub worker: NodeId,
    pub outcome: TaskOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ballot(candidate: &str, priority: f64) -> ElectionBallot {
        ElectionBallot {
            candidate: candidate.into(),
            priority,
            term: 1,
        }
    }

    #[test]
    fn higher_priority_outranks() {
        assert!(ballot("kitchen", 9.0).outranks(&ballot("office", 2.0)));
        assert!(!ballot("office", 2.0).outranks(&ballot("kitchen", 9.0)));
    }

    #[test]
    fn priority_tie_goes_to_lexically_smaller_id() {
        assert!(ballot("kitchen", 5.0).outranks(&ballot("office", 5.0)));
        assert!(!ballot("office", 5.0).outranks(&ballot("kitchen", 5.0)));
    }
}
