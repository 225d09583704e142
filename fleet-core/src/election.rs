use serde::Serialize;
use shared::messages::{Announcement, ElectionBallot, ElectionVote};
use shared::types::{NodeId, Role, Term};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectionPhase {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallotOutcome {
    /// First votable ballot for the current term. The caller should
    /// close the collection window one window-length from now.
    /// `stepped_down` is set when the ballot carried a higher term and
    /// dethroned this node.
    OpensWindow { stepped_down: bool },
    /// Ballot recorded into an already open (or already voted) term.
    Recorded,
    /// Term already superseded; the ballot was dropped.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// The claim is current; adopt the announced term.
    Accepted,
    /// The claim is current and this node was Leader of an older term.
    SteppedDown,
    /// The announcer is behind; the caller should answer with its own
    /// announcement so the sender can catch up.
    Stale,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyOutcome {
    Won(Term),
    /// No strict majority this round; back off and retry.
    Split,
    /// Superseded mid-round, the candidacy is over.
    Lost,
}

/// Priority-ballot election state for one node. All timing lives in the
/// caller; this type only orders ballots, enforces the one-vote-per-term
/// rule and counts majorities, so the safety-critical rules are testable
/// without a clock.
pub struct Election {
    me: NodeId,
    phase: ElectionPhase,
    term: Term,
    voted_in: Option<Term>,
    ballots: Vec<ElectionBallot>,
    votes_for_me: HashSet<NodeId>,
    window_open: bool,
    consecutive_splits: u32,
}

impl Election {
    pub fn new(me: NodeId) -> Self {
        Self {
            me,
            phase: ElectionPhase::Follower,
            term: 0,
            voted_in: None,
            ballots: Vec::new(),
            votes_for_me: HashSet::new(),
            window_open: false,
            consecutive_splits: 0,
        }
    }

    pub fn phase(&self) -> ElectionPhase {
        self.phase
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn splits(&self) -> u32 {
        self.consecutive_splits
    }

    /// Moves to a newer term, forgetting everything tied to the old one.
    /// Returns true when this node held leadership and lost it.
    fn adopt_term(&mut self, term: Term) -> bool {
        let was_leader = self.phase == ElectionPhase::Leader;
        self.term = term;
        self.voted_in = None;
        self.ballots.clear();
        self.votes_for_me.clear();
        self.window_open = false;
        self.phase = ElectionPhase::Follower;
        was_leader
    }

    /// Opens a candidacy and returns the ballot to broadcast. While a
    /// voting window for the current term is open and this node's vote
    /// is unspent, the candidacy joins that term, so near-simultaneous
    /// candidates compete on one ballot list instead of escalating
    /// terms past each other. Otherwise it claims the next term. The
    /// caller votes later, at window close, like every other
    /// participant; the own ballot competes on equal footing.
    pub fn start_candidacy(&mut self, priority: f64) -> ElectionBallot {
        let joining = self.window_open && self.voted_in != Some(self.term);
        if !joining {
            self.term += 1;
            self.voted_in = None;
            self.ballots.clear();
            self.votes_for_me.clear();
            self.window_open = true;
        }
        self.phase = ElectionPhase::Candidate;
        let ballot = ElectionBallot {
            candidate: self.me.clone(),
            priority,
            term: self.term,
        };
        self.ballots.push(ballot.clone());
        ballot
    }

    /// True when this node has spent its vote for the current term and
    /// the outcome is still unknown. A would-be candidate should give
    /// the voted-for election one window to announce a winner before
    /// claiming a fresh term over it.
    pub fn awaiting_result(&self) -> bool {
        self.phase == ElectionPhase::Follower
            && !self.window_open
            && self.voted_in == Some(self.term)
    }

    pub fn observe_ballot(&mut self, ballot: ElectionBallot) -> BallotOutcome {
        if ballot.term < self.term {
            return BallotOutcome::Stale;
        }
        let stepped_down = if ballot.term > self.term {
            self.adopt_term(ballot.term)
        } else {
            false
        };
        self.ballots.push(ballot);

        let can_vote = self.phase != ElectionPhase::Leader
            && !self.window_open
            && self.voted_in != Some(self.term);
        if can_vote {
            self.window_open = true;
            BallotOutcome::OpensWindow { stepped_down }
        } else {
            BallotOutcome::Recorded
        }
    }

    /// Ends the collection window and casts this node's single vote for
    /// the term: the highest-priority ballot seen, ties to the lexically
    /// smaller candidate. Returns None when the window is gone or the
    /// vote is already spent.
    pub fn close_window(&mut self) -> Option<ElectionVote> {
        if !self.window_open {
            return None;
        }
        self.window_open = false;
        if self.voted_in == Some(self.term) {
            return None;
        }
        let best = self
            .ballots
            .iter()
            .fold(None::<&ElectionBallot>, |best, b| match best {
                Some(current) if current.outranks(b) => Some(current),
                _ => Some(b),
            })?;
        self.voted_in = Some(self.term);
        Some(ElectionVote {
            voter: self.me.clone(),
            candidate: best.candidate.clone(),
            term: self.term,
        })
    }

    /// Counts a vote towards this node's candidacy. Votes for other
    /// candidates, other terms, or outside a candidacy are ignored.
    pub fn record_vote(&mut self, vote: &ElectionVote) -> bool {
        if vote.term != self.term
            || self.phase != ElectionPhase::Candidate
            || vote.candidate != self.me
        {
            return false;
        }
        self.votes_for_me.insert(vote.voter.clone());
        true
    }

    /// Settles the candidacy against a strict majority of `population`
    /// (this node plus the peers it currently believes alive).
    pub fn tally(&mut self, population: usize) -> TallyOutcome {
        if self.phase != ElectionPhase::Candidate {
            return TallyOutcome::Lost;
        }
        if self.votes_for_me.len() * 2 > population {
            self.phase = ElectionPhase::Leader;
            self.consecutive_splits = 0;
            TallyOutcome::Won(self.term)
        } else {
            self.phase = ElectionPhase::Follower;
            self.consecutive_splits += 1;
            TallyOutcome::Split
        }
    }

    pub fn observe_announcement(&mut self, ann: &Announcement) -> AnnounceOutcome {
        if ann.sender == self.me {
            return AnnounceOutcome::Ignored;
        }
        if ann.term < self.term {
            return AnnounceOutcome::Stale;
        }
        if ann.term > self.term {
            return if self.adopt_term(ann.term) {
                AnnounceOutcome::SteppedDown
            } else {
                AnnounceOutcome::Accepted
            };
        }
        // Equal term. A leader keeps the term it announced; a candidate
        // concedes to whoever already claims it.
        match self.phase {
            ElectionPhase::Leader if ann.role == Role::Coordinator => AnnounceOutcome::Ignored,
            ElectionPhase::Candidate if ann.role == Role::Coordinator => {
                self.phase = ElectionPhase::Follower;
                self.window_open = false;
                AnnounceOutcome::Accepted
            }
            _ => AnnounceOutcome::Accepted,
        }
    }

    /// Claims the term after the highest this node has observed. Used by
    /// a supervisor reasserting coordination: the fresh term outranks
    /// any interim leader.
    pub fn claim_term(&mut self) -> Term {
        self.term += 1;
        self.voted_in = None;
        self.ballots.clear();
        self.votes_for_me.clear();
        self.window_open = false;
        self.term
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ballot(candidate: &str, priority: f64, term: Term) -> ElectionBallot {
        ElectionBallot {
            candidate: candidate.into(),
            priority,
            term,
        }
    }

    fn vote(voter: &str, candidate: &str, term: Term) -> ElectionVote {
        ElectionVote {
            voter: voter.into(),
            candidate: candidate.into(),
            term,
        }
    }

    #[test]
    fn follower_votes_once_for_the_best_ballot() {
        let mut el = Election::new("hallway".into());

        let outcome = el.observe_ballot(ballot("office", 3.0, 1));
        assert_eq!(
            outcome,
            BallotOutcome::OpensWindow {
                stepped_down: false
            }
        );
        assert_eq!(el.observe_ballot(ballot("kitchen", 9.0, 1)), BallotOutcome::Recorded);

        let v = el.close_window().unwrap();
        assert_eq!(v.candidate, "kitchen");
        assert_eq!(v.term, 1);

        // The single vote for this term is spent.
        assert!(el.close_window().is_none());
        assert_eq!(el.observe_ballot(ballot("office", 99.0, 1)), BallotOutcome::Recorded);
        assert!(el.close_window().is_none());
    }

    #[test]
    fn priority_ties_go_to_the_lexically_smaller_candidate() {
        let mut el = Election::new("hallway".into());
        el.observe_ballot(ballot("office", 5.0, 1));
        el.observe_ballot(ballot("kitchen", 5.0, 1));

        let v = el.close_window().unwrap();
        assert_eq!(v.candidate, "kitchen");
    }

    #[test]
    fn candidate_concedes_to_a_stronger_rival() {
        let mut el = Election::new("kitchen".into());
        let own = el.start_candidacy(2.0);
        assert_eq!(own.term, 1);
        assert_eq!(el.observe_ballot(ballot("office", 8.0, 1)), BallotOutcome::Recorded);

        let v = el.close_window().unwrap();
        assert_eq!(v.candidate, "office");
    }

    #[test]
    fn late_candidacy_joins_an_open_window() {
        let mut el = Election::new("office".into());
        el.observe_ballot(ballot("kitchen", 4.0, 1));

        // Candidacy after a rival's ballot stays in the rival's term.
        let own = el.start_candidacy(9.0);
        assert_eq!(own.term, 1);
        assert_eq!(el.phase(), ElectionPhase::Candidate);

        let v = el.close_window().unwrap();
        assert_eq!(v.candidate, "office");
        assert_eq!(v.term, 1);
    }

    #[test]
    fn candidacy_after_a_spent_vote_claims_the_next_term() {
        let mut el = Election::new("office".into());
        el.observe_ballot(ballot("kitchen", 4.0, 1));
        el.close_window().unwrap();
        assert!(el.awaiting_result());

        let own = el.start_candidacy(9.0);
        assert_eq!(own.term, 2);
        assert!(!el.awaiting_result());
    }

    #[test]
    fn awaiting_result_clears_when_a_newer_term_arrives() {
        let mut el = Election::new("hallway".into());
        el.observe_ballot(ballot("office", 3.0, 1));
        assert!(!el.awaiting_result());
        el.close_window().unwrap();
        assert!(el.awaiting_result());

        // A fresh term makes the spent vote irrelevant.
        el.observe_ballot(ballot("kitchen", 2.0, 2));
        assert!(!el.awaiting_result());
    }

    #[test]
    fn candidate_wins_with_a_strict_majority() {
        let mut el = Election::new("office".into());
        el.start_candidacy(8.0);
        let own = el.close_window().unwrap();
        assert_eq!(own.candidate, "office");
        assert!(el.record_vote(&own));
        assert!(el.record_vote(&vote("kitchen", "office", 1)));

        assert_eq!(el.tally(3), TallyOutcome::Won(1));
        assert_eq!(el.phase(), ElectionPhase::Leader);
    }

    #[test]
    fn exactly_half_is_not_a_majority() {
        let mut el = Election::new("office".into());
        el.start_candidacy(8.0);
        let own = el.close_window().unwrap();
        el.record_vote(&own);
        el.record_vote(&vote("kitchen", "office", 1));

        assert_eq!(el.tally(4), TallyOutcome::Split);
        assert_eq!(el.phase(), ElectionPhase::Follower);
        assert_eq!(el.splits(), 1);
    }

    #[test]
    fn duplicate_votes_from_one_voter_count_once() {
        let mut el = Election::new("office".into());
        el.start_candidacy(8.0);
        el.record_vote(&vote("kitchen", "office", 1));
        el.record_vote(&vote("kitchen", "office", 1));

        assert_eq!(el.tally(3), TallyOutcome::Split);
    }

    #[test]
    fn votes_for_other_terms_or_candidates_are_ignored() {
        let mut el = Election::new("office".into());
        el.start_candidacy(8.0);

        assert!(!el.record_vote(&vote("kitchen", "office", 9)));
        assert!(!el.record_vote(&vote("kitchen", "kitchen", 1)));
        assert_eq!(el.tally(3), TallyOutcome::Split);
    }

    #[test]
    fn stale_ballots_are_dropped() {
        let mut el = Election::new("hallway".into());
        el.observe_ballot(ballot("office", 3.0, 5));

        assert_eq!(el.observe_ballot(ballot("kitchen", 9.0, 4)), BallotOutcome::Stale);
        assert_eq!(el.term(), 5);
    }

    #[test]
    fn higher_term_ballot_dethrones_a_leader() {
        let mut el = Election::new("office".into());
        el.start_candidacy(8.0);
        let own = el.close_window().unwrap();
        el.record_vote(&own);
        el.record_vote(&vote("kitchen", "office", 1));
        el.tally(3);
        assert_eq!(el.phase(), ElectionPhase::Leader);

        let outcome = el.observe_ballot(ballot("kitchen", 4.0, 2));
        assert_eq!(outcome, BallotOutcome::OpensWindow { stepped_down: true });
        assert_eq!(el.phase(), ElectionPhase::Follower);
        assert_eq!(el.term(), 2);
    }

    #[test]
    fn announcements_resolve_by_term_order() {
        let mut el = Election::new("office".into());
        el.start_candidacy(8.0);
        let own = el.close_window().unwrap();
        el.record_vote(&own);
        el.record_vote(&vote("kitchen", "office", 1));
        el.tally(3);

        let stale = Announcement {
            sender: "supervisor".into(),
            role: Role::Coordinator,
            term: 0,
        };
        assert_eq!(el.observe_announcement(&stale), AnnounceOutcome::Stale);
        assert_eq!(el.phase(), ElectionPhase::Leader);

        let reclaim = Announcement {
            sender: "supervisor".into(),
            role: Role::Coordinator,
            term: 2,
        };
        assert_eq!(el.observe_announcement(&reclaim), AnnounceOutcome::SteppedDown);
        assert_eq!(el.phase(), ElectionPhase::Follower);
        assert_eq!(el.term(), 2);
    }

    #[test]
    fn claimed_terms_outrank_everything_seen() {
        let mut el = Election::new("supervisor".into());
        el.observe_ballot(ballot("office", 3.0, 7));
        assert_eq!(el.claim_term(), 8);
        assert_eq!(el.term(), 8);
    }

    // Full exchange between two simultaneous candidates and a bystander:
    // every participant votes identically, so exactly one node can reach
    // a majority for the term.
    #[test]
    fn simultaneous_candidacies_elect_at_most_one_leader() {
        let mut office = Election::new("office".into());
        let mut kitchen = Election::new("kitchen".into());
        let mut hallway = Election::new("hallway".into());

        let office_ballot = office.start_candidacy(10.0);
        let kitchen_ballot = kitchen.start_candidacy(4.0);

        office.observe_ballot(kitchen_ballot.clone());
        kitchen.observe_ballot(office_ballot.clone());
        hallway.observe_ballot(office_ballot);
        hallway.observe_ballot(kitchen_ballot);

        let votes: Vec<ElectionVote> = [
            office.close_window(),
            kitchen.close_window(),
            hallway.close_window(),
        ]
        .into_iter()
        .flatten()
        .collect();
        assert_eq!(votes.len(), 3);

        for v in &votes {
            match v.candidate.as_str() {
                "office" => {
                    office.record_vote(v);
                }
                "kitchen" => {
                    kitchen.record_vote(v);
                }
                other => panic!("vote for unexpected candidate {other}"),
            }
        }

        let office_won = matches!(office.tally(3), TallyOutcome::Won(_));
        let kitchen_won = matches!(kitchen.tally(3), TallyOutcome::Won(_));
        assert!(office_won, "higher priority candidate should win");
        assert!(!kitchen_won);
    }
}
