//! Generational arena holding the search graph.
//!
//! Nodes are addressed by [`NodeId`] handles (slot index + generation). Freeing
//! a slot bumps its generation, so handles kept elsewhere (record bindings,
//! stale children lists) simply stop resolving instead of pointing at a reused
//! node.

use std::collections::{HashSet, VecDeque};
use std::fmt::{self, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chess::ChessMove;

use crate::mcts::error::SearchError;
use crate::mcts::node::SearchNode;
use crate::mcts::{lock, read, write};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub fn index(self) -> u32 {
        self.index
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<Arc<SearchNode>>,
}

#[derive(Debug, Default)]
pub struct SearchGraph {
    slots: RwLock<Vec<Slot>>,
    free: Mutex<Vec<u32>>,
    root: RwLock<Option<NodeId>>,
    creation_counter: AtomicU64,
    /// Bumped at the start of every search, when the root's accumulators restart.
    search_epoch: AtomicU64,
}

impl SearchGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a slot and stores the node built by `make`. The builder runs
    /// without any arena lock held.
    pub fn insert<F>(&self, make: F) -> Result<Arc<SearchNode>, SearchError>
    where
        F: FnOnce(NodeId, u64) -> Result<SearchNode, SearchError>,
    {
        let id = self.reserve();
        let order = self.creation_counter.fetch_add(1, Ordering::Relaxed);
        match make(id, order) {
            Ok(node) => {
                let node = Arc::new(node);
                let mut slots = write(&self.slots);
                let slot = &mut slots[id.index as usize];
                slot.node = Some(Arc::clone(&node));
                Ok(node)
            }
            Err(e) => {
                self.release(&[id.index]);
                Err(e)
            }
        }
    }

    fn reserve(&self) -> NodeId {
        let recycled = lock(&self.free).pop();
        let mut slots = write(&self.slots);
        let index = match recycled {
            Some(index) => index,
            None => {
                slots.push(Slot::default());
                (slots.len() - 1) as u32
            }
        };
        NodeId::new(index, slots[index as usize].generation)
    }

    fn release(&self, indices: &[u32]) {
        if indices.is_empty() {
            return;
        }
        {
            let mut slots = write(&self.slots);
            for &index in indices {
                let slot = &mut slots[index as usize];
                slot.node = None;
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
        lock(&self.free).extend_from_slice(indices);
    }

    pub fn get(&self, id: NodeId) -> Option<Arc<SearchNode>> {
        let slots = read(&self.slots);
        slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.clone())
    }

    pub fn node(&self, id: NodeId) -> Result<Arc<SearchNode>, SearchError> {
        self.get(id).ok_or(SearchError::StaleNode(id))
    }

    pub fn is_live(&self, id: NodeId) -> bool {
        let slots = read(&self.slots);
        slots
            .get(id.index as usize)
            .is_some_and(|slot| slot.generation == id.generation && slot.node.is_some())
    }

    pub fn root_id(&self) -> Option<NodeId> {
        *read(&self.root)
    }

    pub fn root(&self) -> Result<Arc<SearchNode>, SearchError> {
        let id = self.root_id().ok_or(SearchError::NoRoot)?;
        self.node(id)
    }

    /// Frees every node and installs a fresh root.
    pub fn reset_with_root<F>(&self, make: F) -> Result<Arc<SearchNode>, SearchError>
    where
        F: FnOnce(NodeId, u64) -> Result<SearchNode, SearchError>,
    {
        let live: Vec<u32> = {
            let slots = read(&self.slots);
            slots
                .iter()
                .enumerate()
                .filter(|(_, slot)| slot.node.is_some())
                .map(|(index, _)| index as u32)
                .collect()
        };
        self.release(&live);
        *write(&self.root) = None;
        let root = self.insert(make)?;
        *write(&self.root) = Some(root.id());
        Ok(root)
    }

    /// Makes `id` the root and frees everything outside its subtree. Returns
    /// how many nodes were freed.
    pub fn set_as_root(&self, id: NodeId) -> Result<usize, SearchError> {
        let new_root = self.node(id)?;
        let keep: HashSet<NodeId> = self.subtree_ids(id).into_iter().collect();
        new_root.clear_parent();

        let pruned: Vec<u32> = {
            let slots = read(&self.slots);
            slots
                .iter()
                .enumerate()
                .filter(|(index, slot)| {
                    slot.node.is_some()
                        && !keep.contains(&NodeId::new(*index as u32, slot.generation))
                })
                .map(|(index, _)| index as u32)
                .collect()
        };
        self.release(&pruned);
        *write(&self.root) = Some(id);
        log::debug!(
            "🌳 Re-rooted on {} ({} kept, {} freed)",
            id,
            keep.len(),
            pruned.len()
        );
        Ok(pruned.len())
    }

    /// Frees the given nodes and all their descendants.
    pub fn free_subtrees(&self, ids: &[NodeId]) -> usize {
        let doomed: Vec<u32> = ids
            .iter()
            .flat_map(|&id| self.subtree_ids(id))
            .map(NodeId::index)
            .collect();
        self.release(&doomed);
        doomed.len()
    }

    /// Live nodes reachable from `id`, `id` included, breadth first.
    pub fn subtree_ids(&self, id: NodeId) -> Vec<NodeId> {
        let mut seen = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.get(current) else {
                continue;
            };
            seen.push(current);
            queue.extend(node.children().into_iter().map(|(_, child)| child));
        }
        seen
    }

    /// Ancestors of `id` from its parent up to the current root. `None` when
    /// the node or one of its ancestors is gone, or when the chain does not end
    /// at the root.
    pub fn ancestor_chain(&self, id: NodeId) -> Option<Vec<Arc<SearchNode>>> {
        let root = self.root_id()?;
        let node = self.get(id)?;
        if id == root {
            return Some(Vec::new());
        }
        let limit = read(&self.slots).len();
        let mut chain = Vec::new();
        let mut parent = node.parent();
        while let Some(parent_id) = parent {
            let ancestor = self.get(parent_id)?;
            parent = ancestor.parent();
            chain.push(ancestor);
            if parent_id == root {
                return Some(chain);
            }
            if chain.len() > limit {
                break;
            }
        }
        None
    }

    /// Returns the child of `parent` reached by `mv`, creating it with `make`
    /// while holding the parent's children lock. The flag tells whether the
    /// child was created by this call.
    pub fn expand_child<F>(
        &self,
        parent: &SearchNode,
        mv: ChessMove,
        make: F,
    ) -> Result<(Arc<SearchNode>, bool), SearchError>
    where
        F: FnOnce(NodeId, u64) -> Result<SearchNode, SearchError>,
    {
        let mut children = parent.children_guard();
        if let Some(&(_, existing)) = children.iter().find(|(child_move, _)| *child_move == mv) {
            if let Some(child) = self.get(existing) {
                return Ok((child, false));
            }
            children.retain(|(child_move, _)| *child_move != mv);
        }
        let child = self.insert(make)?;
        child.set_parent(parent.id(), |id| self.is_live(id))?;
        children.push((mv, child.id()));
        Ok((child, true))
    }

    /// Links an existing node under `parent` as the child reached by `mv`,
    /// replacing any stale entry for that move.
    pub fn attach(&self, parent: NodeId, child: NodeId, mv: ChessMove) -> Result<(), SearchError> {
        let parent_node = self.node(parent)?;
        let child_node = self.node(child)?;
        child_node.set_parent(parent, |id| self.is_live(id))?;

        let mut children = parent_node.children_guard();
        if !children.iter().any(|&(m, id)| m == mv && id == child) {
            children.retain(|(m, _)| *m != mv);
            children.push((mv, child));
        }
        Ok(())
    }

    pub fn live_nodes(&self) -> usize {
        read(&self.slots)
            .iter()
            .filter(|slot| slot.node.is_some())
            .count()
    }

    pub fn reset_creation_counter(&self) {
        self.creation_counter.store(0, Ordering::Relaxed);
    }

    /// Opens a new search: resets the creation counter and returns the new epoch.
    pub fn begin_search(&self) -> u64 {
        self.reset_creation_counter();
        self.search_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn search_epoch(&self) -> u64 {
        self.search_epoch.load(Ordering::Acquire)
    }

    pub fn created_nodes(&self) -> u64 {
        self.creation_counter.load(Ordering::Relaxed)
    }

    /// Text dump of a subtree for diagnostics, children by visits descending.
    pub fn dump_subtree(&self, id: NodeId, max_depth: usize) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, id, 0, max_depth);
        out
    }

    fn dump_into(&self, out: &mut String, id: NodeId, depth: usize, max_depth: usize) {
        let Some(node) = self.get(id) else {
            let _ = writeln!(out, "{}{} <freed>", "  ".repeat(depth), id);
            return;
        };
        let _ = writeln!(out, "{}{}", "  ".repeat(depth), node);
        if depth >= max_depth {
            return;
        }
        let mut children: Vec<Arc<SearchNode>> = node
            .children()
            .into_iter()
            .filter_map(|(_, child)| self.get(child))
            .collect();
        children.sort_by_key(|child| std::cmp::Reverse(child.visits()));
        for child in children {
            self.dump_into(out, child.id(), depth + 1, max_depth);
        }
    }
}
