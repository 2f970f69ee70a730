//! Master election state machine
//!
//! `Announcing → Elected | Deferred`. Each instance enters with a random nonce.
//! While announcing, it records every rival ballot it hears about. At the end of
//! the election window it defers if an elected peer answered, or if any rival
//! holds a lower `(nonce, instance)` ballot; otherwise it is elected. Contenders
//! (announcing or elected) answer each announcement with their own ballot, so two
//! overlapping announcers always learn about each other.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::transport::FrameBody;

/// Election role of one physical coordinator instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ElectionState {
    Announcing,
    Elected,
    Deferred,
}

/// Ballot ordering is the tie-break: lowest nonce wins, instance id breaks equal nonces
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ballot {
    pub nonce: u64,
    pub instance: Uuid,
}

impl Ballot {
    pub fn new(nonce: u64, instance: Uuid) -> Self {
        Self { nonce, instance }
    }

    /// Fresh ballot with a random nonce
    pub fn random(instance: Uuid) -> Self {
        Self::new(rand::random(), instance)
    }
}

#[derive(Debug, Clone)]
pub struct Election {
    ballot: Ballot,
    state: ElectionState,
    saw_master: bool,
    lowest_rival: Option<Ballot>,
}

impl Election {
    pub fn new(ballot: Ballot) -> Self {
        Self {
            ballot,
            state: ElectionState::Announcing,
            saw_master: false,
            lowest_rival: None,
        }
    }

    pub fn ballot(&self) -> Ballot {
        self.ballot
    }

    pub fn state(&self) -> ElectionState {
        self.state
    }

    /// Frame announcing this instance
    pub fn announcement(&self) -> FrameBody {
        FrameBody::Announce {
            nonce: self.ballot.nonce,
        }
    }

    /// Observe a peer's announcement; returns the reply to publish, if any
    pub fn on_announce(&mut self, peer: Ballot) -> Option<FrameBody> {
        debug!(?peer, state = ?self.state, "Election::on_announce: called");
        match self.state {
            ElectionState::Announcing => {
                self.record_rival(peer);
                Some(self.presence(false))
            }
            ElectionState::Elected => Some(self.presence(true)),
            ElectionState::Deferred => None,
        }
    }

    /// Observe a contender's reply
    pub fn on_present(&mut self, peer: Ballot, elected: bool) {
        debug!(?peer, elected, state = ?self.state, "Election::on_present: called");
        if self.state != ElectionState::Announcing {
            return;
        }
        if elected {
            self.saw_master = true;
        } else {
            self.record_rival(peer);
        }
    }

    /// Close the election window; the outcome is fixed after the first call
    pub fn decide(&mut self) -> bool {
        if self.state == ElectionState::Announcing {
            let outranked = self.lowest_rival.is_some_and(|rival| rival < self.ballot);
            self.state = if self.saw_master || outranked {
                ElectionState::Deferred
            } else {
                ElectionState::Elected
            };
            debug!(state = ?self.state, saw_master = self.saw_master, outranked, "Election::decide: decided");
        }
        self.state == ElectionState::Elected
    }

    fn presence(&self, elected: bool) -> FrameBody {
        FrameBody::Present {
            nonce: self.ballot.nonce,
            elected,
        }
    }

    fn record_rival(&mut self, peer: Ballot) {
        if peer == self.ballot {
            return;
        }
        self.lowest_rival = Some(match self.lowest_rival {
            Some(current) if current <= peer => current,
            _ => peer,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ballot(nonce: u64) -> Ballot {
        Ballot::new(nonce, Uuid::new_v4())
    }

    #[test]
    fn test_lone_instance_is_elected() {
        let mut election = Election::new(ballot(42));
        assert_eq!(election.state(), ElectionState::Announcing);
        assert!(election.decide());
        assert_eq!(election.state(), ElectionState::Elected);
    }

    #[test]
    fn test_lowest_nonce_wins() {
        let a = ballot(10);
        let b = ballot(20);
        let mut ea = Election::new(a);
        let mut eb = Election::new(b);

        // b hears a's announcement and replies; a hears the reply
        let reply = eb.on_announce(a).unwrap();
        match reply {
            FrameBody::Present { nonce, elected } => ea.on_present(Ballot::new(nonce, b.instance), elected),
            other => panic!("unexpected reply {other:?}"),
        }

        assert!(ea.decide());
        assert!(!eb.decide());
    }

    #[test]
    fn test_equal_nonce_broken_by_instance() {
        let a = Ballot::new(5, Uuid::from_u128(1));
        let b = Ballot::new(5, Uuid::from_u128(2));
        let mut ea = Election::new(a);
        let mut eb = Election::new(b);
        ea.on_present(b, false);
        eb.on_present(a, false);
        assert!(ea.decide());
        assert!(!eb.decide());
    }

    #[test]
    fn test_elected_peer_forces_deferral_even_with_lower_nonce() {
        let mut late = Election::new(ballot(1));
        late.on_present(ballot(999), true);
        assert!(!late.decide());
        assert_eq!(late.state(), ElectionState::Deferred);
    }

    #[test]
    fn test_master_answers_and_deferred_stays_silent() {
        let mut master = Election::new(ballot(3));
        master.decide();
        assert_eq!(master.on_announce(ballot(1)), Some(FrameBody::Present { nonce: 3, elected: true }));

        let mut deferred = Election::new(ballot(9));
        deferred.on_present(ballot(3), true);
        deferred.decide();
        assert_eq!(deferred.on_announce(ballot(1)), None);
    }

    #[test]
    fn test_decision_is_final() {
        let mut election = Election::new(ballot(50));
        assert!(election.decide());
        election.on_present(ballot(1), false);
        election.on_present(ballot(2), true);
        assert!(election.decide());
    }

    #[test]
    fn test_exactly_one_master_among_many() {
        let ballots: Vec<Ballot> = (0..8).map(|i| ballot(1000 - i * 7)).collect();
        let mut elections: Vec<Election> = ballots.iter().copied().map(Election::new).collect();

        // Every instance hears every other announcement
        for (i, election) in elections.iter_mut().enumerate() {
            for (j, peer) in ballots.iter().enumerate() {
                if i != j {
                    election.on_announce(*peer);
                }
            }
        }

        let masters = elections.iter_mut().filter_map(|e| e.decide().then_some(e.ballot())).count();
        assert_eq!(masters, 1);
    }
}
