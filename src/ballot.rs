//! Per-index quorum tally.

use crate::conf::Configuration;
use crate::types::PeerId;

/// Cursor that accelerates repeated grants by the same peer across
/// adjacent indices: the position found for index `i` is almost always the
/// position for `i + 1`.
#[derive(Debug, Clone, Copy)]
pub struct PosHint {
    pos0: i64,
    pos1: i64,
}

impl Default for PosHint {
    fn default() -> Self {
        Self { pos0: -1, pos1: -1 }
    }
}

#[derive(Debug, Clone)]
struct UnfoundPeerId {
    peer: PeerId,
    found: bool,
}

/// Tally of acknowledgements needed to commit one log index.
///
/// A simple configuration grants once the single counter reaches zero; a
/// joint configuration requires both the current and the old counter to
/// reach zero. Learners never appear in a ballot.
#[derive(Debug, Clone)]
pub struct Ballot {
    peers: Vec<UnfoundPeerId>,
    old_peers: Vec<UnfoundPeerId>,
    quorum: i32,
    old_quorum: i32,
}

impl Ballot {
    pub fn new(conf: &Configuration, old_conf: Option<&Configuration>) -> Self {
        let peers: Vec<UnfoundPeerId> = conf
            .peers()
            .map(|p| UnfoundPeerId {
                peer: p.clone(),
                found: false,
            })
            .collect();
        let old_peers: Vec<UnfoundPeerId> = old_conf
            .map(|c| {
                c.peers()
                    .map(|p| UnfoundPeerId {
                        peer: p.clone(),
                        found: false,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let quorum = peers.len() as i32 / 2 + 1;
        let old_quorum = if old_peers.is_empty() {
            0
        } else {
            old_peers.len() as i32 / 2 + 1
        };
        Self {
            peers,
            old_peers,
            quorum,
            old_quorum,
        }
    }

    fn find(slots: &[UnfoundPeerId], peer: &PeerId, hint: i64) -> i64 {
        if hint >= 0 {
            if let Some(slot) = slots.get(hint as usize) {
                if &slot.peer == peer {
                    return hint;
                }
            }
        }
        slots
            .iter()
            .position(|s| &s.peer == peer)
            .map(|p| p as i64)
            .unwrap_or(-1)
    }

    /// Record `peer`'s acknowledgement, returning an updated hint for the
    /// next adjacent index.
    pub fn grant_with_hint(&mut self, peer: &PeerId, hint: PosHint) -> PosHint {
        let mut hint = hint;
        hint.pos0 = Self::find(&self.peers, peer, hint.pos0);
        if hint.pos0 >= 0 {
            let slot = &mut self.peers[hint.pos0 as usize];
            if !slot.found {
                slot.found = true;
                self.quorum -= 1;
            }
        }
        if self.old_peers.is_empty() {
            hint.pos1 = -1;
            return hint;
        }
        hint.pos1 = Self::find(&self.old_peers, peer, hint.pos1);
        if hint.pos1 >= 0 {
            let slot = &mut self.old_peers[hint.pos1 as usize];
            if !slot.found {
                slot.found = true;
                self.old_quorum -= 1;
            }
        }
        hint
    }

    pub fn grant(&mut self, peer: &PeerId) {
        self.grant_with_hint(peer, PosHint::default());
    }

    pub fn is_granted(&self) -> bool {
        self.quorum <= 0 && self.old_quorum <= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> PeerId {
        PeerId::new("127.0.0.1", port)
    }

    #[test]
    fn test_simple_majority() {
        let conf = Configuration::new([peer(1), peer(2), peer(3)]);
        let mut ballot = Ballot::new(&conf, None);
        assert!(!ballot.is_granted());
        ballot.grant(&peer(1));
        assert!(!ballot.is_granted());
        ballot.grant(&peer(3));
        assert!(ballot.is_granted());
    }

    #[test]
    fn test_duplicate_grant_counts_once() {
        let conf = Configuration::new([peer(1), peer(2), peer(3)]);
        let mut ballot = Ballot::new(&conf, None);
        ballot.grant(&peer(1));
        ballot.grant(&peer(1));
        assert!(!ballot.is_granted());
    }

    #[test]
    fn test_unknown_peer_ignored() {
        let conf = Configuration::new([peer(1), peer(2), peer(3)]);
        let mut ballot = Ballot::new(&conf, None);
        ballot.grant(&peer(9));
        ballot.grant(&peer(1));
        ballot.grant(&peer(2));
        assert!(ballot.is_granted());
    }

    #[test]
    fn test_joint_needs_both_quorums() {
        let cur = Configuration::new([peer(3), peer(4), peer(5)]);
        let old = Configuration::new([peer(1), peer(2), peer(3)]);
        let mut ballot = Ballot::new(&cur, Some(&old));

        // Majority of new only: not granted.
        ballot.grant(&peer(4));
        ballot.grant(&peer(5));
        assert!(!ballot.is_granted());

        // One shared peer completes the old quorum too? No: old still
        // needs a second voter.
        ballot.grant(&peer(3));
        assert!(!ballot.is_granted());

        ballot.grant(&peer(1));
        assert!(ballot.is_granted());
    }

    #[test]
    fn test_hint_survives_adjacent_indices() {
        let conf = Configuration::new([peer(1), peer(2), peer(3)]);
        let mut b1 = Ballot::new(&conf, None);
        let mut b2 = Ballot::new(&conf, None);
        let hint = b1.grant_with_hint(&peer(2), PosHint::default());
        let hint = b2.grant_with_hint(&peer(2), hint);
        assert!(hint.pos0 >= 0);
        b2.grant(&peer(3));
        assert!(b2.is_granted());
    }
}
