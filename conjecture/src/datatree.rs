//! The choice tree: a compressed trie of every draw sequence seen so far.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. A node stores a
//! run of draws with no recorded alternatives, followed by an optional
//! [`Transition`] saying what happened next: a branch on the next draw, a
//! recorded conclusion, or a killed remainder. Recording the same prefix
//! twice with different draws is how generation flakiness is detected.

use std::collections::{HashMap, HashSet};

use log::warn;
use rand::Rng;

use crate::data::{ConjectureData, DataObserver, InterestingOrigin, Status};
use crate::error::{ConjectureError, DataError, DrawResult, PreviouslyUnseenBehaviour};
use crate::utils::{bits_to_bytes, int_to_bytes};

/// Index of a node in the tree arena
pub type NodeId = usize;

const ROOT: NodeId = 0;

/// Random attempts at a branch before falling back to a deterministic scan
const MAX_RANDOM_BRANCH_ATTEMPTS: usize = 1000;

/// What follows the run of draws stored in a node.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The next draw of `bit_length` bits has been seen with several values
    Branch {
        bit_length: u32,
        children: HashMap<u64, NodeId>,
    },
    /// The test case ended here
    Conclusion {
        status: Status,
        interesting_origin: Option<InterestingOrigin>,
    },
    /// The test declared everything after this point uninteresting
    Killed { next_node: NodeId },
}

#[derive(Debug, Clone, Default)]
struct TreeNode {
    bit_lengths: Vec<u32>,
    values: Vec<u64>,
    /// Positions in `values` that came from forced draws. Allocated on first use.
    forced: Option<HashSet<usize>>,
    transition: Option<Transition>,
    is_exhausted: bool,
}

impl TreeNode {
    fn is_forced(&self, i: usize) -> bool {
        self.forced.as_ref().is_some_and(|forced| forced.contains(&i))
    }

    fn forced_count(&self) -> usize {
        self.forced.as_ref().map_or(0, HashSet::len)
    }

    fn mark_forced(&mut self, i: usize) {
        debug_assert!(i < self.values.len());
        self.forced.get_or_insert_with(HashSet::new).insert(i);
    }
}

fn inconsistent(message: impl Into<String>) -> DataError {
    DataError::Flaky(message.into())
}

fn random_bits<R: Rng + ?Sized>(random: &mut R, n_bits: u32) -> u64 {
    let value = random.r#gen::<u64>();
    if n_bits >= 64 {
        value
    } else {
        value & ((1u64 << n_bits) - 1)
    }
}

fn max_children(bit_length: u32) -> u128 {
    1u128 << bit_length
}

/// Record of every draw sequence the runner has executed.
#[derive(Debug, Clone)]
pub struct DataTree {
    nodes: Vec<TreeNode>,
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DataTree {
    /// An empty tree with a single live root
    pub fn new() -> Self {
        Self {
            nodes: vec![TreeNode::default()],
        }
    }

    /// True once every path through the tree is known to be dead
    pub fn is_exhausted(&self) -> bool {
        self.nodes[ROOT].is_exhausted
    }

    /// Start recording a new execution from the root
    pub fn new_observer(&mut self) -> TreeRecordingObserver<'_> {
        TreeRecordingObserver::new(self)
    }

    fn alloc(&mut self, node: TreeNode) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Split `id` before position `i`, turning that position into a branch.
    ///
    /// Everything after `i` moves into a new child keyed by the old value.
    fn split_at(&mut self, id: NodeId, i: usize) -> DrawResult<()> {
        let node = &mut self.nodes[id];
        if node.is_forced(i) {
            return Err(inconsistent(format!(
                "draw {} was forced in a previous run but produced a different value now",
                i
            )));
        }
        let key = node.values[i];
        let bit_length = node.bit_lengths[i];

        let child = TreeNode {
            bit_lengths: node.bit_lengths.split_off(i + 1),
            values: node.values.split_off(i + 1),
            forced: node.forced.as_ref().map(|forced| {
                forced
                    .iter()
                    .filter(|&&j| j > i)
                    .map(|&j| j - i - 1)
                    .collect()
            }),
            transition: node.transition.take(),
            is_exhausted: false,
        };
        node.bit_lengths.truncate(i);
        node.values.truncate(i);
        if let Some(forced) = node.forced.as_mut() {
            forced.retain(|&j| j < i);
        }

        let child_id = self.alloc(child);
        self.check_exhausted(child_id);
        let mut children = HashMap::new();
        children.insert(key, child_id);
        self.nodes[id].transition = Some(Transition::Branch {
            bit_length,
            children,
        });
        Ok(())
    }

    /// Recompute and return whether `id` is exhausted.
    ///
    /// A node is exhausted when none of its own draws can vary and
    /// everything reachable after it is exhausted as well.
    fn check_exhausted(&mut self, id: NodeId) -> bool {
        let node = &self.nodes[id];
        if node.is_exhausted || node.forced_count() != node.values.len() {
            return node.is_exhausted;
        }
        let exhausted = match &node.transition {
            None => false,
            Some(Transition::Conclusion { .. }) | Some(Transition::Killed { .. }) => true,
            Some(Transition::Branch {
                bit_length,
                children,
            }) => {
                children.len() as u128 == max_children(*bit_length)
                    && children.values().all(|&child| self.nodes[child].is_exhausted)
            }
        };
        self.nodes[id].is_exhausted = exhausted;
        exhausted
    }

    /// A short buffer which no recorded execution starts with.
    ///
    /// Appending arbitrary bytes to it produces a test case whose path
    /// through the tree leaves every fully explored region.
    pub fn generate_novel_prefix<R: Rng + ?Sized>(
        &self,
        random: &mut R,
    ) -> Result<Vec<u8>, ConjectureError> {
        if self.is_exhausted() {
            return Err(ConjectureError::internal(
                "cannot generate a novel prefix from an exhausted tree",
            ));
        }
        fn append(prefix: &mut Vec<u8>, n_bits: u32, value: u64) {
            prefix.extend_from_slice(&int_to_bytes(value, bits_to_bytes(n_bits)));
        }

        let mut prefix = Vec::new();
        let mut current = ROOT;
        loop {
            let node = &self.nodes[current];
            for (i, (&n_bits, &value)) in node.bit_lengths.iter().zip(&node.values).enumerate() {
                if node.is_forced(i) {
                    append(&mut prefix, n_bits, value);
                    continue;
                }
                loop {
                    let k = random_bits(random, n_bits);
                    if k != value {
                        append(&mut prefix, n_bits, k);
                        return Ok(prefix);
                    }
                }
            }

            let (bit_length, children) = match &node.transition {
                None => return Ok(prefix),
                Some(Transition::Branch {
                    bit_length,
                    children,
                }) => (*bit_length, children),
                Some(_) => {
                    return Err(ConjectureError::internal(
                        "live node ends in a conclusion with no free draws",
                    ));
                }
            };

            let mut next = None;
            for _ in 0..MAX_RANDOM_BRANCH_ATTEMPTS {
                let k = random_bits(random, bit_length);
                match children.get(&k) {
                    None => {
                        append(&mut prefix, bit_length, k);
                        return Ok(prefix);
                    }
                    Some(&child) if !self.nodes[child].is_exhausted => {
                        next = Some((k, child));
                        break;
                    }
                    Some(_) => {}
                }
            }
            let (k, child) = match next {
                Some(found) => found,
                None => match self.scan_branch(bit_length, children) {
                    (k, None) => {
                        append(&mut prefix, bit_length, k);
                        return Ok(prefix);
                    }
                    (k, Some(child)) => (k, child),
                },
            };
            append(&mut prefix, bit_length, k);
            current = child;
        }
    }

    /// Deterministic fallback when random probing keeps hitting dead children.
    ///
    /// Returns a live child if there is one, otherwise the smallest unused key.
    fn scan_branch(
        &self,
        bit_length: u32,
        children: &HashMap<u64, NodeId>,
    ) -> (u64, Option<NodeId>) {
        let mut keys: Vec<u64> = children.keys().copied().collect();
        keys.sort_unstable();
        if let Some(&k) = keys
            .iter()
            .find(|k| !self.nodes[children[*k]].is_exhausted)
        {
            return (k, Some(children[&k]));
        }
        let mut candidate = 0u64;
        for k in keys {
            if k != candidate {
                break;
            }
            candidate += 1;
        }
        debug_assert!(u128::from(candidate) < max_children(bit_length));
        (candidate, None)
    }

    /// Replay `data` against recorded history without running the test.
    ///
    /// On success `data` is frozen with the status the test would produce.
    /// Returns [`PreviouslyUnseenBehaviour`] as soon as the buffer leaves
    /// the recorded tree.
    pub fn simulate_test_function(
        &self,
        data: &mut ConjectureData,
    ) -> Result<(), PreviouslyUnseenBehaviour> {
        match self.simulate(data) {
            Ok(Some(())) | Err(DataError::StopTest { .. }) => Ok(()),
            Ok(None) | Err(_) => Err(PreviouslyUnseenBehaviour),
        }
    }

    /// `Ok(None)` means the walk fell off the tree
    fn simulate(&self, data: &mut ConjectureData) -> DrawResult<Option<()>> {
        let mut current = ROOT;
        loop {
            let node = &self.nodes[current];
            for (i, (&n_bits, &previous)) in node.bit_lengths.iter().zip(&node.values).enumerate() {
                let forced = node.is_forced(i).then_some(previous);
                if data.draw_bits(n_bits, forced)? != previous {
                    return Ok(None);
                }
            }
            match &node.transition {
                None => return Ok(None),
                Some(Transition::Conclusion {
                    status,
                    interesting_origin,
                }) => {
                    match status {
                        Status::Valid => data.freeze()?,
                        Status::Invalid => match data.mark_invalid()? {},
                        Status::Interesting => {
                            match data.mark_interesting(interesting_origin.clone())? {}
                        }
                        Status::Overrun => match data.mark_overrun()? {},
                    }
                    return Ok(Some(()));
                }
                Some(Transition::Branch {
                    bit_length,
                    children,
                }) => {
                    let value = data.draw_bits(*bit_length, None)?;
                    match children.get(&value) {
                        Some(&child) => current = child,
                        None => return Ok(None),
                    }
                }
                Some(Transition::Killed { next_node }) => {
                    data.kill_branch()?;
                    current = *next_node;
                }
            }
        }
    }

    /// Canonicalise `buffer` using recorded history.
    ///
    /// Returns the buffer the test would actually consume and, if the tree
    /// already knows how it ends, the predicted status.
    pub fn rewrite(&self, buffer: &[u8]) -> (Vec<u8>, Option<Status>) {
        let mut data = ConjectureData::for_buffer(buffer);
        match self.simulate_test_function(&mut data) {
            Ok(()) => (data.buffer().to_vec(), Some(data.status())),
            Err(PreviouslyUnseenBehaviour) => (buffer.to_vec(), None),
        }
    }
}

/// Observer that records one execution into a [`DataTree`].
///
/// Attach it to a [`ConjectureData`] through
/// [`DataTree::new_observer`]. Disagreements with earlier recordings of
/// the same prefix surface as [`DataError::Flaky`] from the draw or
/// conclusion that exposed them.
#[derive(Debug)]
pub struct TreeRecordingObserver<'a> {
    tree: &'a mut DataTree,
    current_node: NodeId,
    index_in_current_node: usize,
    trail: Vec<NodeId>,
    killed: bool,
}

impl<'a> TreeRecordingObserver<'a> {
    fn new(tree: &'a mut DataTree) -> Self {
        Self {
            tree,
            current_node: ROOT,
            index_in_current_node: 0,
            trail: vec![ROOT],
            killed: false,
        }
    }

    fn move_to(&mut self, id: NodeId) {
        self.current_node = id;
        self.index_in_current_node = 0;
    }

    fn update_exhausted(&mut self) {
        for &id in self.trail.iter().rev() {
            if !self.tree.check_exhausted(id) {
                break;
            }
        }
    }
}

impl DataObserver for TreeRecordingObserver<'_> {
    fn draw_bits(&mut self, n_bits: u32, forced: bool, value: u64) -> DrawResult<()> {
        let i = self.index_in_current_node;
        self.index_in_current_node += 1;
        let id = self.current_node;
        let node = &mut self.tree.nodes[id];

        if i < node.values.len() {
            if n_bits != node.bit_lengths[i] {
                return Err(inconsistent(format!(
                    "expected a draw of {} bits but got {} bits",
                    node.bit_lengths[i], n_bits
                )));
            }
            if forced && !node.is_forced(i) {
                return Err(inconsistent(format!(
                    "draw {} is forced now but was free in a previous run",
                    i
                )));
            }
            if value != node.values[i] {
                self.tree.split_at(id, i)?;
                let child = self.tree.alloc(TreeNode::default());
                if let Some(Transition::Branch { children, .. }) =
                    &mut self.tree.nodes[id].transition
                {
                    children.insert(value, child);
                }
                self.move_to(child);
            }
        } else {
            match &mut node.transition {
                None => {
                    node.bit_lengths.push(n_bits);
                    node.values.push(value);
                    if forced {
                        node.mark_forced(i);
                    }
                }
                Some(Transition::Conclusion { status, .. }) => {
                    return Err(inconsistent(format!(
                        "drew {} more bits after a previous run concluded as {}",
                        n_bits, status
                    )));
                }
                Some(Transition::Killed { .. }) => {
                    return Err(inconsistent(
                        "drew past a branch that a previous run killed",
                    ));
                }
                Some(Transition::Branch {
                    bit_length,
                    children,
                }) => {
                    if n_bits != *bit_length {
                        return Err(inconsistent(format!(
                            "expected a draw of {} bits at a branch but got {} bits",
                            bit_length, n_bits
                        )));
                    }
                    let child = match children.get(&value) {
                        Some(&child) => child,
                        None => {
                            let child = self.tree.alloc(TreeNode::default());
                            if let Some(Transition::Branch { children, .. }) =
                                &mut self.tree.nodes[id].transition
                            {
                                children.insert(value, child);
                            }
                            child
                        }
                    };
                    self.move_to(child);
                }
            }
        }

        if self.trail.last() != Some(&self.current_node) {
            self.trail.push(self.current_node);
        }
        Ok(())
    }

    fn conclude_test(
        &mut self,
        status: Status,
        interesting_origin: Option<&InterestingOrigin>,
    ) -> DrawResult<()> {
        if status == Status::Overrun {
            return Ok(());
        }
        let id = self.current_node;
        let node = &mut self.tree.nodes[id];
        if self.index_in_current_node < node.values.len() {
            return Err(inconsistent(format!(
                "concluded as {} after {} draws where a previous run kept drawing",
                status, self.index_in_current_node
            )));
        }

        let new_transition = Transition::Conclusion {
            status,
            interesting_origin: interesting_origin.cloned(),
        };
        match &node.transition {
            None => node.transition = Some(new_transition),
            Some(Transition::Branch { .. }) => {
                return Err(inconsistent(format!(
                    "concluded as {} where a previous run kept drawing",
                    status
                )));
            }
            Some(Transition::Killed { .. }) => {
                return Err(inconsistent(format!(
                    "concluded as {} where a previous run killed the branch",
                    status
                )));
            }
            Some(existing) if *existing == new_transition => {}
            Some(Transition::Conclusion {
                status: previous, ..
            }) => {
                // Flakiness from INTERESTING to VALID is reported with a
                // better message once shrinking notices it.
                if *previous == Status::Interesting && status == Status::Valid {
                    warn!("test case previously INTERESTING now concluded VALID");
                } else {
                    return Err(inconsistent(format!(
                        "previous run concluded as {} but this run concluded as {}",
                        previous, status
                    )));
                }
            }
        }

        self.tree.check_exhausted(id);
        if !self.killed {
            self.update_exhausted();
        }
        Ok(())
    }

    fn kill_branch(&mut self) -> DrawResult<()> {
        if self.killed {
            return Ok(());
        }
        self.killed = true;
        let id = self.current_node;
        let node = &self.tree.nodes[id];
        if self.index_in_current_node < node.values.len() {
            return Err(inconsistent(
                "killed a branch in the middle of a previously recorded run",
            ));
        }
        let next = match &node.transition {
            Some(Transition::Killed { next_node }) => *next_node,
            None => {
                let next_node = self.tree.alloc(TreeNode::default());
                self.tree.nodes[id].transition = Some(Transition::Killed { next_node });
                self.update_exhausted();
                next_node
            }
            Some(_) => {
                return Err(inconsistent(
                    "killed a branch where a previous run branched or concluded",
                ));
            }
        };
        self.move_to(next);
        self.trail.push(next);
        Ok(())
    }
}
