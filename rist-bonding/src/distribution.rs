//! Weighted distribution and duplication
//!
//! Candidates are the live members, or every member when none is live yet
//! (so traffic flows while peers are still connecting). If every candidate
//! has weight 0 the block is duplicated to all of them. Otherwise it goes
//! to exactly one nonzero-weight candidate, picked by smooth weighted
//! round-robin: over any run of `sum(weights)` picks each member is chosen
//! exactly `weight` times, interleaved rather than in bursts.

use crate::group::Member;
use rist_protocol::PeerId;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Weighted round-robin state
#[derive(Debug, Default)]
pub struct Distributor {
    current: BTreeMap<PeerId, i64>,
}

impl Distributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pick the targets for one block
    pub fn select<M: Member>(&mut self, members: &[Arc<M>]) -> Vec<Arc<M>> {
        let live: Vec<&Arc<M>> = members.iter().filter(|m| m.is_live()).collect();
        let candidates: Vec<&Arc<M>> = if live.is_empty() {
            members.iter().collect()
        } else {
            live
        };

        let weighted: Vec<&Arc<M>> = candidates
            .iter()
            .copied()
            .filter(|m| m.weight() > 0)
            .collect();
        if weighted.is_empty() {
            return candidates.into_iter().cloned().collect();
        }

        let total: i64 = weighted.iter().map(|m| m.weight() as i64).sum();
        let mut best: Option<(&Arc<M>, i64)> = None;
        for member in &weighted {
            let current = self.current.entry(member.peer_id()).or_insert(0);
            *current += member.weight() as i64;
            if best.map_or(true, |(_, score)| *current > score) {
                best = Some((member, *current));
            }
        }

        match best {
            Some((chosen, _)) => {
                if let Some(current) = self.current.get_mut(&chosen.peer_id()) {
                    *current -= total;
                }
                vec![Arc::clone(chosen)]
            }
            None => Vec::new(),
        }
    }

    /// Drop state for a removed member
    pub fn forget(&mut self, peer: PeerId) {
        self.current.remove(&peer);
    }

    pub fn reset(&mut self) {
        self.current.clear();
    }
}
