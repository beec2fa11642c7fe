//! Peer Group Management
//!
//! Holds the peers of one context. Adding or removing a peer takes the
//! group's write lock; distribution and statistics take the read lock.

use crate::distribution::Distributor;
use parking_lot::{Mutex, RwLock};
use rist_protocol::PeerId;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Group errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    #[error("Group is full (max {max} members)")]
    GroupFull { max: usize },

    #[error("Member not found: {0}")]
    MemberNotFound(PeerId),

    #[error("Member already present: {0}")]
    DuplicateMember(PeerId),

    #[error("Group has no members")]
    NoMembers,
}

/// What the group needs to know about a member
pub trait Member: Send + Sync {
    fn peer_id(&self) -> PeerId;

    /// 0 duplicates, otherwise a proportional share
    fn weight(&self) -> u32;

    /// Established and able to carry data
    fn is_live(&self) -> bool;
}

/// Group statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupStats {
    pub member_count: usize,
    pub live_count: usize,
    /// Sum of nonzero weights
    pub total_weight: u64,
}

/// Set of peers sharing one flow
pub struct PeerGroup<M: Member> {
    members: RwLock<BTreeMap<PeerId, Arc<M>>>,
    distributor: Mutex<Distributor>,
    max_members: usize,
}

impl<M: Member> PeerGroup<M> {
    /// Create an empty group
    pub fn new(max_members: usize) -> Self {
        PeerGroup {
            members: RwLock::new(BTreeMap::new()),
            distributor: Mutex::new(Distributor::new()),
            max_members,
        }
    }

    /// Add a member
    pub fn add(&self, member: Arc<M>) -> Result<(), GroupError> {
        let mut members = self.members.write();
        let id = member.peer_id();

        if members.contains_key(&id) {
            return Err(GroupError::DuplicateMember(id));
        }
        if members.len() >= self.max_members {
            return Err(GroupError::GroupFull {
                max: self.max_members,
            });
        }

        members.insert(id, member);
        debug!(peer = %id, count = members.len(), "peer joined group");
        Ok(())
    }

    /// Remove a member, returning it
    pub fn remove(&self, id: PeerId) -> Result<Arc<M>, GroupError> {
        let removed = self
            .members
            .write()
            .remove(&id)
            .ok_or(GroupError::MemberNotFound(id))?;
        self.distributor.lock().forget(id);
        debug!(peer = %id, "peer left group");
        Ok(removed)
    }

    /// Remove every member
    pub fn drain(&self) -> Vec<Arc<M>> {
        let drained = std::mem::take(&mut *self.members.write());
        self.distributor.lock().reset();
        drained.into_values().collect()
    }

    pub fn get(&self, id: PeerId) -> Option<Arc<M>> {
        self.members.read().get(&id).cloned()
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.members.read().contains_key(&id)
    }

    /// All members, ordered by id
    pub fn members(&self) -> Vec<Arc<M>> {
        self.members.read().values().cloned().collect()
    }

    pub fn live_members(&self) -> Vec<Arc<M>> {
        self.members
            .read()
            .values()
            .filter(|m| m.is_live())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    /// Members that should carry the next data block
    ///
    /// See [`Distributor::select`] for the rules.
    pub fn select_targets(&self) -> Result<Vec<Arc<M>>, GroupError> {
        let members = self.members.read();
        if members.is_empty() {
            return Err(GroupError::NoMembers);
        }
        let all: Vec<Arc<M>> = members.values().cloned().collect();
        drop(members);
        Ok(self.distributor.lock().select(&all))
    }

    pub fn stats(&self) -> GroupStats {
        let members = self.members.read();
        GroupStats {
            member_count: members.len(),
            live_count: members.values().filter(|m| m.is_live()).count(),
            total_weight: members.values().map(|m| m.weight() as u64).sum(),
        }
    }
}
