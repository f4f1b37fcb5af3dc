//! The on-disk B+ tree. Every node is a record identified by its head page;
//! the tree root and leftmost leaf are persisted in the pager's
//! custom-metadata slot. Splits are right-biased, deletes rebalance with
//! borrow-then-merge, and leaves chain left to right for ordered traversal.

use std::path::Path;

use tracing::{debug, trace};

use crate::error::{BrambleError, Result};
use crate::pager::{DEFAULT_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::storage::Storage;

pub mod iter;
pub mod node;

pub use iter::Iter;
use node::{Node, NodeId, Pointer, TreeMetadata};

pub const MIN_ORDER: usize = 3;
pub const MAX_ORDER: usize = 1000;
pub const DEFAULT_ORDER: usize = 500;

pub const MAX_KEY_SIZE: usize = u16::MAX as usize;
pub const MAX_VALUE_SIZE: usize = u16::MAX as usize;

/// Open-time parameters. Both are fixed at file creation; reopening with
/// different values is an error.
#[derive(Debug, Clone, Copy)]
pub struct TreeConfig {
    pub page_size: u16,
    pub order: usize,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            order: DEFAULT_ORDER,
        }
    }
}

pub struct BpTree {
    storage: Storage,
    order: usize,
    metadata: Option<TreeMetadata>,
}

impl BpTree {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, TreeConfig::default())
    }

    pub fn open_with_config(path: impl AsRef<Path>, config: TreeConfig) -> Result<Self> {
        if !(MIN_ORDER..=MAX_ORDER).contains(&config.order) {
            return Err(BrambleError::InvalidConfig(format!(
                "order must be in {MIN_ORDER}..={MAX_ORDER}, got {}",
                config.order
            )));
        }
        if config.page_size < MIN_PAGE_SIZE {
            return Err(BrambleError::InvalidConfig(format!(
                "page size must be at least {MIN_PAGE_SIZE}, got {}",
                config.page_size
            )));
        }

        let storage = Storage::open(path, config.page_size)?;
        let metadata = storage.load_metadata()?;
        if let Some(metadata) = &metadata {
            if metadata.order as usize != config.order {
                return Err(BrambleError::Incompatible(format!(
                    "tree was created with order {}, but {} was given",
                    metadata.order, config.order
                )));
            }
        }
        debug!(
            order = config.order,
            page_size = config.page_size,
            empty = metadata.is_none(),
            "opened tree"
        );
        Ok(Self {
            storage,
            order: config.order,
            metadata,
        })
    }

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(metadata) = self.metadata else {
            return Ok(None);
        };
        let leaf = self.find_leaf(metadata.root_id, key)?;
        match search_key(&leaf.keys, key) {
            Ok(position) => Ok(Some(leaf.value_at(position)?.to_vec())),
            Err(_) => Ok(None),
        }
    }

    /// Inserts or overwrites `key`, returning the previous value on
    /// overwrite.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
        if key.len() > MAX_KEY_SIZE {
            return Err(BrambleError::InputTooLarge(format!(
                "key is {} bytes, the maximum is {MAX_KEY_SIZE}",
                key.len()
            )));
        }
        if value.len() > MAX_VALUE_SIZE {
            return Err(BrambleError::InputTooLarge(format!(
                "value is {} bytes, the maximum is {MAX_VALUE_SIZE}",
                value.len()
            )));
        }

        let Some(metadata) = self.metadata else {
            let id = self.storage.new_node()?;
            let mut leaf = Node::new_leaf(id, self.order);
            leaf.keys.push(key.to_vec());
            leaf.pointers.insert(0, Pointer::Value(value.to_vec()));
            self.storage.update_node(&leaf)?;
            let metadata = TreeMetadata {
                order: self.order as u16,
                root_id: id,
                leftmost_id: id,
            };
            self.storage.update_metadata(&metadata)?;
            self.metadata = Some(metadata);
            return Ok(None);
        };

        let mut leaf = self.find_leaf(metadata.root_id, key)?;
        match search_key(&leaf.keys, key) {
            Ok(position) => {
                let previous = leaf.value_at(position)?.to_vec();
                leaf.pointers[position] = Pointer::Value(value.to_vec());
                self.storage.update_node(&leaf)?;
                Ok(Some(previous))
            }
            Err(position) => {
                leaf.keys.insert(position, key.to_vec());
                leaf.pointers.insert(position, Pointer::Value(value.to_vec()));
                if leaf.key_num() <= self.order - 1 {
                    self.storage.update_node(&leaf)?;
                } else {
                    self.split_leaf(leaf)?;
                }
                Ok(None)
            }
        }
    }

    /// Removes `key`, returning its value if it was present.
    pub fn delete(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(metadata) = self.metadata else {
            return Ok(None);
        };
        let mut leaf = self.find_leaf(metadata.root_id, key)?;
        let Ok(position) = search_key(&leaf.keys, key) else {
            return Ok(None);
        };

        leaf.keys.remove(position);
        let Pointer::Value(previous) = leaf.pointers.remove(position) else {
            return Err(BrambleError::Corrupt(format!(
                "leaf {} holds a child id in a value slot",
                leaf.id
            )));
        };

        if leaf.id == metadata.root_id {
            if leaf.keys.is_empty() {
                self.storage.delete_node(leaf.id)?;
                self.storage.delete_metadata()?;
                self.metadata = None;
            } else {
                self.storage.update_node(&leaf)?;
            }
            return Ok(Some(previous));
        }

        if leaf.key_num() >= self.min_keys() {
            self.storage.update_node(&leaf)?;
        } else {
            self.rebalance_leaf(leaf)?;
        }
        self.fix_index(key)?;
        Ok(Some(previous))
    }

    /// Iterates entries in ascending key order.
    pub fn iter(&self) -> Result<Iter<'_>> {
        let node = match self.metadata {
            Some(metadata) => Some(self.storage.load_node(metadata.leftmost_id)?),
            None => None,
        };
        Ok(Iter::new(&self.storage, node))
    }

    /// The number of live key-value pairs.
    pub fn len(&self) -> Result<usize> {
        let Some(metadata) = self.metadata else {
            return Ok(0);
        };
        let mut count = 0;
        let mut id = metadata.leftmost_id;
        while id != 0 {
            let node = self.storage.load_node(id)?;
            count += node.key_num();
            id = node.next_leaf()?;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_none()
    }

    pub fn flush(&mut self) -> Result<()> {
        self.storage.flush()
    }

    /// Flushes and releases the underlying file.
    pub fn close(self) -> Result<()> {
        self.storage.close()
    }

    fn min_keys(&self) -> usize {
        self.order.div_ceil(2) - 1
    }

    fn find_leaf(&self, root_id: NodeId, key: &[u8]) -> Result<Node> {
        let mut node = self.storage.load_node(root_id)?;
        while !node.leaf {
            let index = descend_index(&node.keys, key);
            node = self.storage.load_node(node.child_at(index)?)?;
        }
        Ok(node)
    }

    /// Splits an over-full leaf. The first ⌈order/2⌉ entries stay in place,
    /// the rest move to a new right sibling whose first key becomes the
    /// separator; the leaf chain is relinked through the new node.
    fn split_leaf(&mut self, mut left: Node) -> Result<()> {
        let middle = self.order.div_ceil(2);
        let right_id = self.storage.new_node()?;
        let mut right = Node::new_leaf(right_id, self.order);
        right.parent_id = left.parent_id;
        right.keys = left.keys.split_off(middle);
        // values past the middle plus the old next-leaf pointer
        right.pointers = left.pointers.split_off(middle);
        left.pointers.push(Pointer::Child(right_id));
        let separator = right.keys[0].clone();
        trace!(left = left.id, right = right_id, "split leaf");

        self.storage.update_node(&right)?;
        self.storage.update_node(&left)?;
        self.insert_into_parent(left, separator, right_id)
    }

    /// Splits an over-full internal node, promoting the key at index
    /// ⌈order/2⌉−1 of the combined key array. Children handed to the new
    /// right sibling are re-parented.
    fn split_internal(&mut self, mut left: Node) -> Result<()> {
        let promote = self.order.div_ceil(2) - 1;
        let right_id = self.storage.new_node()?;
        let mut right = Node::new_internal(right_id, self.order);
        right.parent_id = left.parent_id;
        right.keys = left.keys.split_off(promote + 1);
        let separator = left.keys.pop().ok_or_else(|| {
            BrambleError::Corrupt(format!("internal node {} split with no keys", left.id))
        })?;
        right.pointers = left.pointers.split_off(promote + 1);
        trace!(left = left.id, right = right_id, "split internal node");

        for pointer in &right.pointers {
            let Pointer::Child(child_id) = pointer else {
                return Err(BrambleError::Corrupt(format!(
                    "internal node {} holds a value slot",
                    left.id
                )));
            };
            let mut child = self.storage.load_node(*child_id)?;
            child.parent_id = right_id;
            self.storage.update_node(&child)?;
        }

        self.storage.update_node(&right)?;
        self.storage.update_node(&left)?;
        self.insert_into_parent(left, separator, right_id)
    }

    fn insert_into_parent(
        &mut self,
        left: Node,
        separator: Vec<u8>,
        right_id: NodeId,
    ) -> Result<()> {
        if left.parent_id == 0 {
            return self.create_new_root(left, separator, right_id);
        }
        let mut parent = self.storage.load_node(left.parent_id)?;
        let position = descend_index(&parent.keys, &separator);
        parent.keys.insert(position, separator);
        parent
            .pointers
            .insert(position + 1, Pointer::Child(right_id));
        if parent.key_num() <= self.order - 1 {
            self.storage.update_node(&parent)
        } else {
            self.split_internal(parent)
        }
    }

    fn create_new_root(&mut self, mut left: Node, separator: Vec<u8>, right_id: NodeId) -> Result<()> {
        let root_id = self.storage.new_node()?;
        let mut root = Node::new_internal(root_id, self.order);
        root.keys.push(separator);
        root.pointers = vec![Pointer::Child(left.id), Pointer::Child(right_id)];
        self.storage.update_node(&root)?;

        left.parent_id = root_id;
        self.storage.update_node(&left)?;
        let mut right = self.storage.load_node(right_id)?;
        right.parent_id = root_id;
        self.storage.update_node(&right)?;

        let Some(mut metadata) = self.metadata else {
            return Err(BrambleError::Corrupt("tree metadata missing".into()));
        };
        metadata.root_id = root_id;
        self.storage.update_metadata(&metadata)?;
        self.metadata = Some(metadata);
        trace!(root = root_id, "grew tree by a level");
        Ok(())
    }

    /// Brings an under-full leaf back to the fill invariant: borrow from a
    /// sibling with spare keys, otherwise merge with one.
    fn rebalance_leaf(&mut self, mut node: Node) -> Result<()> {
        let mut parent = self.storage.load_node(node.parent_id)?;
        let position = parent.child_position(node.id).ok_or_else(|| {
            BrambleError::Corrupt(format!(
                "node {} is not a child of its parent {}",
                node.id, parent.id
            ))
        })?;

        if position > 0 {
            let mut left = self.storage.load_node(parent.child_at(position - 1)?)?;
            if left.key_num() > self.min_keys() {
                let key = left.keys.pop().ok_or_else(|| {
                    BrambleError::Corrupt(format!("leaf {} has no keys to lend", left.id))
                })?;
                let value = left.pointers.remove(left.pointers.len() - 2);
                node.keys.insert(0, key);
                node.pointers.insert(0, value);
                parent.keys[position - 1] = node.keys[0].clone();
                self.storage.update_node(&left)?;
                self.storage.update_node(&node)?;
                return self.storage.update_node(&parent);
            }
        }

        if position < parent.pointers.len() - 1 {
            let mut right = self.storage.load_node(parent.child_at(position + 1)?)?;
            if right.key_num() > self.min_keys() {
                let key = right.keys.remove(0);
                let value = right.pointers.remove(0);
                node.keys.push(key);
                node.pointers.insert(node.keys.len() - 1, value);
                parent.keys[position] = right.keys[0].clone();
                self.storage.update_node(&right)?;
                self.storage.update_node(&node)?;
                return self.storage.update_node(&parent);
            }
        }

        if position > 0 {
            // absorb the under-full leaf into its left sibling; the sibling
            // inherits the node's next-leaf pointer with the other entries
            let mut left = self.storage.load_node(parent.child_at(position - 1)?)?;
            trace!(absorbed = node.id, into = left.id, "merged leaf left");
            left.pointers.pop();
            left.keys.append(&mut node.keys);
            left.pointers.append(&mut node.pointers);
            self.storage.update_node(&left)?;
            self.storage.delete_node(node.id)?;
            parent.keys.remove(position - 1);
            parent.pointers.remove(position);
            self.rebalance_parent(parent)
        } else {
            let right_id = parent.child_at(position + 1)?;
            let mut right = self.storage.load_node(right_id)?;
            trace!(absorbed = right_id, into = node.id, "merged leaf right");
            node.pointers.pop();
            node.keys.append(&mut right.keys);
            node.pointers.append(&mut right.pointers);
            self.storage.update_node(&node)?;
            self.storage.delete_node(right_id)?;
            parent.keys.remove(position);
            parent.pointers.remove(position + 1);
            self.rebalance_parent(parent)
        }
    }

    /// After a merge removed a separator from `parent`, restore its fill
    /// invariant, collapsing the root when it runs out of keys.
    fn rebalance_parent(&mut self, parent: Node) -> Result<()> {
        if parent.parent_id == 0 {
            if parent.keys.is_empty() {
                return self.promote_child_to_root(parent);
            }
            return self.storage.update_node(&parent);
        }
        if parent.key_num() >= self.min_keys() {
            return self.storage.update_node(&parent);
        }
        self.rebalance_internal(parent)
    }

    fn promote_child_to_root(&mut self, root: Node) -> Result<()> {
        let child_id = root.child_at(0)?;
        let mut child = self.storage.load_node(child_id)?;
        child.parent_id = 0;
        self.storage.update_node(&child)?;
        self.storage.delete_node(root.id)?;

        let Some(mut metadata) = self.metadata else {
            return Err(BrambleError::Corrupt("tree metadata missing".into()));
        };
        metadata.root_id = child_id;
        self.storage.update_metadata(&metadata)?;
        self.metadata = Some(metadata);
        trace!(root = child_id, "shrank tree by a level");
        Ok(())
    }

    /// Internal-node rebalancing. Borrowed keys rotate through the parent;
    /// merges fold the parent's separator between the two key sequences.
    fn rebalance_internal(&mut self, mut node: Node) -> Result<()> {
        let mut parent = self.storage.load_node(node.parent_id)?;
        let position = parent.child_position(node.id).ok_or_else(|| {
            BrambleError::Corrupt(format!(
                "node {} is not a child of its parent {}",
                node.id, parent.id
            ))
        })?;

        if position > 0 {
            let mut left = self.storage.load_node(parent.child_at(position - 1)?)?;
            if left.key_num() > self.min_keys() {
                let boundary = left.keys.pop().ok_or_else(|| {
                    BrambleError::Corrupt(format!("node {} has no keys to lend", left.id))
                })?;
                let separator = std::mem::replace(&mut parent.keys[position - 1], boundary);
                node.keys.insert(0, separator);
                let moved = left.pointers.pop().ok_or_else(|| {
                    BrambleError::Corrupt(format!("node {} has no children to lend", left.id))
                })?;
                self.reparent(&moved, node.id)?;
                node.pointers.insert(0, moved);
                self.storage.update_node(&left)?;
                self.storage.update_node(&node)?;
                return self.storage.update_node(&parent);
            }
        }

        if position < parent.pointers.len() - 1 {
            let mut right = self.storage.load_node(parent.child_at(position + 1)?)?;
            if right.key_num() > self.min_keys() {
                let boundary = right.keys.remove(0);
                let separator = std::mem::replace(&mut parent.keys[position], boundary);
                node.keys.push(separator);
                let moved = right.pointers.remove(0);
                self.reparent(&moved, node.id)?;
                node.pointers.push(moved);
                self.storage.update_node(&right)?;
                self.storage.update_node(&node)?;
                return self.storage.update_node(&parent);
            }
        }

        if position > 0 {
            let mut left = self.storage.load_node(parent.child_at(position - 1)?)?;
            trace!(absorbed = node.id, into = left.id, "merged internal left");
            left.keys.push(parent.keys.remove(position - 1));
            parent.pointers.remove(position);
            left.keys.append(&mut node.keys);
            for pointer in &node.pointers {
                self.reparent(pointer, left.id)?;
            }
            left.pointers.append(&mut node.pointers);
            self.storage.update_node(&left)?;
            self.storage.delete_node(node.id)?;
            self.rebalance_parent(parent)
        } else {
            let right_id = parent.child_at(position + 1)?;
            let mut right = self.storage.load_node(right_id)?;
            trace!(absorbed = right_id, into = node.id, "merged internal right");
            node.keys.push(parent.keys.remove(position));
            parent.pointers.remove(position + 1);
            node.keys.append(&mut right.keys);
            for pointer in &right.pointers {
                self.reparent(pointer, node.id)?;
            }
            node.pointers.append(&mut right.pointers);
            self.storage.update_node(&node)?;
            self.storage.delete_node(right_id)?;
            self.rebalance_parent(parent)
        }
    }

    fn reparent(&mut self, pointer: &Pointer, parent_id: NodeId) -> Result<()> {
        let Pointer::Child(child_id) = pointer else {
            return Err(BrambleError::Corrupt(
                "internal node holds a value slot".into(),
            ));
        };
        let mut child = self.storage.load_node(*child_id)?;
        child.parent_id = parent_id;
        self.storage.update_node(&child)
    }

    /// Replaces a deleted key that still serves as a separator in the index
    /// with the smallest key of the subtree to its right. Descends fresh
    /// from the root, so earlier rebalancing cannot strand the update.
    fn fix_index(&mut self, key: &[u8]) -> Result<()> {
        let Some(metadata) = self.metadata else {
            return Ok(());
        };
        let mut node = self.storage.load_node(metadata.root_id)?;
        while !node.leaf {
            if let Ok(position) = search_key(&node.keys, key) {
                let replacement = self.leftmost_key(node.child_at(position + 1)?)?;
                node.keys[position] = replacement;
                return self.storage.update_node(&node);
            }
            let index = descend_index(&node.keys, key);
            node = self.storage.load_node(node.child_at(index)?)?;
        }
        Ok(())
    }

    fn leftmost_key(&self, id: NodeId) -> Result<Vec<u8>> {
        let mut node = self.storage.load_node(id)?;
        while !node.leaf {
            node = self.storage.load_node(node.child_at(0)?)?;
        }
        node.keys.first().cloned().ok_or_else(|| {
            BrambleError::Corrupt(format!("leaf {} is empty inside a populated tree", node.id))
        })
    }
}

/// Smallest child index `i` such that `key < keys[i]`; equal keys descend to
/// the right.
fn descend_index(keys: &[Vec<u8>], key: &[u8]) -> usize {
    keys.partition_point(|candidate| candidate.as_slice() <= key)
}

fn search_key(keys: &[Vec<u8>], key: &[u8]) -> std::result::Result<usize, usize> {
    keys.binary_search_by(|candidate| candidate.as_slice().cmp(key))
}
