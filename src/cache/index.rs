//! Order Index - logical sequence over entry ids
//!
//! Keeps the doubly linked order of ids independently of where the values
//! physically live. Nodes sit in an arena keyed by id; neighbours are stored
//! as ids, so there are no pointers to keep alive.
//!
//! ```text
//!   head                                   tail
//!  ┌────┐  next  ┌────┐  next  ┌────┐  next  ┌────┐
//!  │ 11 │──────▶│ 12 │──────▶│ 15 │──────▶│ 16 │
//!  │    │◀──────│    │◀──────│    │◀──────│    │
//!  └────┘  prev  └────┘  prev  └────┘  prev  └────┘
//! ```
//!
//! The sequence is append/consume ordered: ids join at the tail and normally
//! leave from the head. An id missing between head and tail means entries
//! were deleted behind the index's back, and lookups through it fail with
//! [`Error::Corruption`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::entry::{EntryId, MetadataNode};
use crate::error::{Error, Result};

/// A change to the order, local or received from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexChange {
    Added(EntryId),
    Removed(EntryId),
    Cleared,
}

/// An id handed out by [`OrderIndex::reserve_id`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// The id the next entry must use
    pub id: EntryId,
    /// Peer changes applied while catching up before the id was assigned
    pub applied: Vec<IndexChange>,
}

impl Reservation {
    pub fn local(id: EntryId) -> Self {
        Self {
            id,
            applied: Vec::new(),
        }
    }
}

/// Source of remote order changes, run as a background task by the cache
#[async_trait]
pub trait ChangeFeed: Send {
    /// Run until `token` fires, calling `wake.notify_one()` whenever changes
    /// are ready for [`OrderIndex::drain_remote`].
    async fn run(self: Box<Self>, token: CancellationToken, wake: Arc<Notify>);
}

/// Order index trait
///
/// All methods are called with the owning cache's lock held; implementations
/// need no synchronization of their own for local state.
#[async_trait]
pub trait OrderIndex: Send + Sync {
    /// Assign the id for the next entry
    async fn reserve_id(&mut self) -> Result<Reservation>;

    /// Give back a reservation whose entry could not be stored
    async fn abandon(&mut self, _id: EntryId) -> Result<()> {
        Ok(())
    }

    /// Append `id` as the new tail
    async fn add_tail(&mut self, id: EntryId) -> Result<()>;

    /// Splice `id` out of the order. False when it was not present.
    async fn remove(&mut self, id: EntryId) -> Result<bool>;

    /// Forget every node
    async fn clear(&mut self) -> Result<()>;

    /// The id following `id`
    ///
    /// - `None` or an id before the head → head
    /// - empty index, the tail, or beyond the tail → `None`
    /// - a missing id between head and tail → [`Error::Corruption`]
    fn next_id(&self, id: Option<EntryId>) -> Result<Option<EntryId>>;

    fn head(&self) -> Option<EntryId>;

    fn tail(&self) -> Option<EntryId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, id: EntryId) -> bool;

    fn node(&self, id: EntryId) -> Option<MetadataNode>;

    /// Hand over the remote change feed, if the index has one
    fn take_feed(&mut self) -> Option<Box<dyn ChangeFeed>> {
        None
    }

    /// Apply remote changes received by the feed since the last call
    async fn drain_remote(&mut self) -> Result<Vec<IndexChange>> {
        Ok(Vec::new())
    }
}

// =============================================================================
// Linked Index
// =============================================================================

/// In-memory linked order
#[derive(Debug, Default, Clone)]
pub struct LinkedIndex {
    nodes: HashMap<EntryId, MetadataNode>,
    head: Option<EntryId>,
    tail: Option<EntryId>,
    /// Highest id ever assigned or observed; ids are never reused
    last_assigned: EntryId,
}

impl LinkedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start assigning after `floor` (ids ≤ floor are considered taken)
    pub fn starting_after(floor: EntryId) -> Self {
        Self {
            last_assigned: floor,
            ..Self::default()
        }
    }

    /// Highest id assigned or observed so far
    pub fn last_assigned(&self) -> EntryId {
        self.last_assigned
    }

    /// Record an id assigned elsewhere so it is never handed out again
    pub fn observe(&mut self, id: EntryId) {
        self.last_assigned = self.last_assigned.max(id);
    }

    /// Take the next free id
    pub fn assign(&mut self) -> EntryId {
        self.last_assigned += 1;
        self.last_assigned
    }

    /// Append as the new tail. Ids must arrive in increasing order.
    pub fn link_tail(&mut self, id: EntryId) -> Result<()> {
        if self.nodes.contains_key(&id) {
            return Err(Error::Internal(format!("id {} is already linked", id)));
        }
        if let Some(tail) = self.tail {
            if id <= tail {
                return Err(Error::Internal(format!(
                    "id {} does not follow tail {}",
                    id, tail
                )));
            }
        }

        let mut node = MetadataNode::detached(id);
        match self.tail {
            Some(tail) => {
                node.previous = Some(tail);
                if let Some(previous) = self.nodes.get_mut(&tail) {
                    previous.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.nodes.insert(id, node);
        self.observe(id);
        Ok(())
    }

    /// Insert keeping ascending id order. False when already present.
    ///
    /// Used for adds that arrive late from peers; local adds always go
    /// through [`LinkedIndex::link_tail`].
    pub fn insert_ordered(&mut self, id: EntryId) -> Result<bool> {
        if self.nodes.contains_key(&id) {
            return Ok(false);
        }
        let (head, tail) = match (self.head, self.tail) {
            (Some(head), Some(tail)) => (head, tail),
            _ => {
                self.link_tail(id)?;
                return Ok(true);
            }
        };
        if id > tail {
            self.link_tail(id)?;
            return Ok(true);
        }

        self.observe(id);
        if id < head {
            let node = MetadataNode {
                id,
                previous: None,
                next: Some(head),
            };
            if let Some(old_head) = self.nodes.get_mut(&head) {
                old_head.previous = Some(id);
            }
            self.nodes.insert(id, node);
            self.head = Some(id);
            return Ok(true);
        }

        // Walk back from the tail to the first node with a smaller id
        let mut cursor = tail;
        loop {
            let node = self
                .nodes
                .get(&cursor)
                .copied()
                .ok_or_else(|| self.corruption(cursor))?;
            if node.id < id {
                let node_next = node.next;
                self.nodes.insert(
                    id,
                    MetadataNode {
                        id,
                        previous: Some(node.id),
                        next: node_next,
                    },
                );
                if let Some(current) = self.nodes.get_mut(&node.id) {
                    current.next = Some(id);
                }
                if let Some(next) = node_next {
                    if let Some(successor) = self.nodes.get_mut(&next) {
                        successor.previous = Some(id);
                    }
                }
                return Ok(true);
            }
            match node.previous {
                Some(previous) => cursor = previous,
                None => return Err(self.corruption(id)),
            }
        }
    }

    /// Splice out a node and relink its neighbours
    pub fn unlink(&mut self, id: EntryId) -> bool {
        let Some(node) = self.nodes.remove(&id) else {
            return false;
        };

        match node.previous {
            Some(previous) => {
                if let Some(prev_node) = self.nodes.get_mut(&previous) {
                    prev_node.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(next_node) = self.nodes.get_mut(&next) {
                    next_node.previous = node.previous;
                }
            }
            None => self.tail = node.previous,
        }
        true
    }

    /// Drop every node; the id counter keeps going
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.head = None;
        self.tail = None;
    }

    /// Ids from head to tail
    pub fn ids(&self) -> Vec<EntryId> {
        let mut ids = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.nodes.get(&id).and_then(|node| node.next);
        }
        ids
    }

    /// Resolve the successor of `id` against the local order
    pub fn successor(&self, id: Option<EntryId>) -> Result<Option<EntryId>> {
        let (head, tail) = match (self.head, self.tail) {
            (Some(head), Some(tail)) => (head, tail),
            _ => return Ok(None),
        };

        match id {
            None => Ok(Some(head)),
            Some(id) if id < head => Ok(Some(head)),
            Some(id) if id >= tail => Ok(None),
            Some(id) => match self.nodes.get(&id) {
                Some(node) => Ok(node.next),
                None => Err(self.corruption(id)),
            },
        }
    }

    pub fn get(&self, id: EntryId) -> Option<MetadataNode> {
        self.nodes.get(&id).copied()
    }

    pub fn first(&self) -> Option<EntryId> {
        self.head
    }

    pub fn last(&self) -> Option<EntryId> {
        self.tail
    }

    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    pub fn has(&self, id: EntryId) -> bool {
        self.nodes.contains_key(&id)
    }

    fn corruption(&self, id: EntryId) -> Error {
        Error::Corruption {
            id,
            head: self.head,
            tail: self.tail,
        }
    }
}

#[async_trait]
impl OrderIndex for LinkedIndex {
    async fn reserve_id(&mut self) -> Result<Reservation> {
        Ok(Reservation::local(self.assign()))
    }

    async fn add_tail(&mut self, id: EntryId) -> Result<()> {
        self.link_tail(id)
    }

    async fn remove(&mut self, id: EntryId) -> Result<bool> {
        Ok(self.unlink(id))
    }

    async fn clear(&mut self) -> Result<()> {
        self.reset();
        Ok(())
    }

    fn next_id(&self, id: Option<EntryId>) -> Result<Option<EntryId>> {
        self.successor(id)
    }

    fn head(&self) -> Option<EntryId> {
        self.head
    }

    fn tail(&self) -> Option<EntryId> {
        self.tail
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn contains(&self, id: EntryId) -> bool {
        self.nodes.contains_key(&id)
    }

    fn node(&self, id: EntryId) -> Option<MetadataNode> {
        self.get(id)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    fn index_with(ids: &[EntryId]) -> LinkedIndex {
        let mut index = LinkedIndex::new();
        for &id in ids {
            index.link_tail(id).unwrap();
        }
        index
    }

    #[test]
    fn test_empty_index_has_no_next() {
        let index = LinkedIndex::new();
        assert_eq!(index.successor(None).unwrap(), None);
        assert_eq!(index.successor(Some(5)).unwrap(), None);
    }

    #[test]
    fn test_next_id_rules() {
        let index = index_with(&[3, 4, 7, 9]);

        assert_eq!(index.successor(None).unwrap(), Some(3));
        assert_eq!(index.successor(Some(1)).unwrap(), Some(3));
        assert_eq!(index.successor(Some(3)).unwrap(), Some(4));
        assert_eq!(index.successor(Some(4)).unwrap(), Some(7));
        assert_eq!(index.successor(Some(9)).unwrap(), None);
        assert_eq!(index.successor(Some(12)).unwrap(), None);
    }

    #[test]
    fn test_mid_sequence_gap_is_corruption() {
        let index = index_with(&[3, 4, 7, 9]);

        assert_matches!(
            index.successor(Some(5)),
            Err(Error::Corruption { id: 5, head: Some(3), tail: Some(9) })
        );
    }

    #[test]
    fn test_unlink_relinks_neighbours() {
        let mut index = index_with(&[1, 2, 3]);

        assert!(index.unlink(2));
        assert_eq!(index.get(1).unwrap().next, Some(3));
        assert_eq!(index.get(3).unwrap().previous, Some(1));
        assert_eq!(index.ids(), vec![1, 3]);

        assert!(index.unlink(1));
        assert_eq!(index.first(), Some(3));
        assert!(index.get(3).unwrap().is_head());

        assert!(index.unlink(3));
        assert_eq!(index.first(), None);
        assert_eq!(index.last(), None);
        assert!(!index.unlink(3));
    }

    #[test]
    fn test_link_tail_rejects_out_of_order() {
        let mut index = index_with(&[5]);
        assert_matches!(index.link_tail(5), Err(Error::Internal(_)));
        assert_matches!(index.link_tail(4), Err(Error::Internal(_)));
    }

    #[test]
    fn test_ids_continue_after_reset() {
        let mut index = LinkedIndex::new();
        let first = index.assign();
        index.link_tail(first).unwrap();
        index.reset();

        assert_eq!(index.assign(), first + 1);
    }

    #[test]
    fn test_insert_ordered_fills_gaps() {
        let mut index = index_with(&[2, 6, 9]);

        assert!(index.insert_ordered(7).unwrap());
        assert!(index.insert_ordered(1).unwrap());
        assert!(index.insert_ordered(12).unwrap());
        assert!(!index.insert_ordered(6).unwrap());

        assert_eq!(index.ids(), vec![1, 2, 6, 7, 9, 12]);
        assert_eq!(index.get(7).unwrap().previous, Some(6));
        assert_eq!(index.get(9).unwrap().previous, Some(7));
        assert_eq!(index.last_assigned(), 12);
    }

    #[tokio::test]
    async fn test_trait_reserve_then_add() {
        let mut index = LinkedIndex::starting_after(100);
        let reservation = index.reserve_id().await.unwrap();
        assert_eq!(reservation.id, 101);
        assert!(reservation.applied.is_empty());

        index.add_tail(reservation.id).await.unwrap();
        assert_eq!(OrderIndex::head(&index), Some(101));
        assert!(index.take_feed().is_none());
        assert!(index.drain_remote().await.unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_links_stay_consistent(ops in prop::collection::vec((any::<bool>(), 0usize..64), 1..200)) {
            let mut index = LinkedIndex::new();
            let mut model: Vec<EntryId> = Vec::new();

            for (add, pick) in ops {
                if add || model.is_empty() {
                    let id = index.assign();
                    index.link_tail(id).unwrap();
                    model.push(id);
                } else {
                    let id = model.remove(pick % model.len());
                    prop_assert!(index.unlink(id));
                }

                prop_assert_eq!(index.ids(), model.clone());
                prop_assert_eq!(index.first(), model.first().copied());
                prop_assert_eq!(index.last(), model.last().copied());

                // Walking with successor visits exactly the model
                let mut walked = Vec::new();
                let mut cursor = None;
                while let Some(next) = index.successor(cursor).unwrap() {
                    walked.push(next);
                    cursor = Some(next);
                }
                prop_assert_eq!(walked, model.clone());
            }
        }
    }
}
