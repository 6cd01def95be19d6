//! B+Tree index.
//!
//! An in-memory tree of order 128 mapping [`IndexKey`]s to heap
//! [`TupleId`]s. Leaves chain through `next` pointers for range scans.
//! Nodes hold only child references (no parent back-pointers); inserts
//! recurse down and propagate splits back up the return path. Concurrency
//! is tree-level: one reader-writer lock around the whole structure.
//!
//! Deletes remove from the leaf without rebalancing; trees that saw heavy
//! churn are rebuilt from a heap scan when the table is opened.
//!
//! # Persistence
//!
//! [`BPlusTree::save`] writes a 16-byte header (`order: u32`, 12 reserved
//! bytes) followed by a pre-order walk:
//! `{node_type: u8, num_keys: u32, keys..., (values... | num_children: u32,
//! children...)}`. Keys carry a 1-byte tag: `1` = int64, `2` = string with
//! a `u32` length prefix (float and composite keys persist through their
//! stable string form). Loading relinks the leaf chain as leaves appear in
//! pre-order, which is left-to-right.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::common::{SlotId, TupleId};
use crate::error::{DbError, Result};
use crate::index::key::IndexKey;

/// Default tree order (max children per internal node).
pub const DEFAULT_ORDER: usize = 128;

const NODE_TYPE_LEAF: u8 = 1;
const NODE_TYPE_INTERNAL: u8 = 2;

const KEY_TAG_INT: u8 = 1;
const KEY_TAG_STRING: u8 = 2;

type NodeRef = Arc<RwLock<Node>>;

struct Node {
    is_leaf: bool,
    keys: Vec<IndexKey>,
    /// Leaf payloads, parallel to `keys`.
    values: Vec<TupleId>,
    /// Internal children; `children.len() == keys.len() + 1`.
    children: Vec<NodeRef>,
    next_leaf: Option<NodeRef>,
}

impl Node {
    fn new_leaf() -> Self {
        Self {
            is_leaf: true,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            next_leaf: None,
        }
    }

    fn new_internal() -> Self {
        Self {
            is_leaf: false,
            keys: Vec::new(),
            values: Vec::new(),
            children: Vec::new(),
            next_leaf: None,
        }
    }

    /// Index of the child to descend into: past every separator `<= key`,
    /// so an exact match lands in the right subtree where the promoted
    /// middle key lives.
    fn find_child_index(&self, key: &IndexKey) -> usize {
        self.keys.partition_point(|k| k <= key)
    }
}

/// Order-128 B+Tree from typed keys to tuple IDs.
pub struct BPlusTree {
    root: RwLock<Option<NodeRef>>,
    order: usize,
    height: RwLock<usize>,
}

impl BPlusTree {
    pub fn new() -> Self {
        Self::with_order(DEFAULT_ORDER)
    }

    pub fn with_order(order: usize) -> Self {
        assert!(order >= 3, "B+Tree order must be at least 3");
        Self {
            root: RwLock::new(None),
            order,
            height: RwLock::new(0),
        }
    }

    /// Number of levels, 0 for an empty tree.
    pub fn height(&self) -> usize {
        *self.height.read()
    }

    /// Inserts a key. Duplicate keys are refused.
    pub fn insert(&self, key: IndexKey, value: TupleId) -> Result<()> {
        let mut root_lock = self.root.write();

        let root = match root_lock.as_ref() {
            None => {
                let mut leaf = Node::new_leaf();
                leaf.keys.push(key);
                leaf.values.push(value);
                *root_lock = Some(Arc::new(RwLock::new(leaf)));
                *self.height.write() = 1;
                return Ok(());
            }
            Some(root) => root.clone(),
        };

        if let Some((sep, right)) = self.insert_recursive(&root, key, value)? {
            let mut new_root = Node::new_internal();
            new_root.keys.push(sep);
            new_root.children.push(root);
            new_root.children.push(right);
            *root_lock = Some(Arc::new(RwLock::new(new_root)));
            *self.height.write() += 1;
        }
        Ok(())
    }

    fn insert_recursive(
        &self,
        node_ref: &NodeRef,
        key: IndexKey,
        value: TupleId,
    ) -> Result<Option<(IndexKey, NodeRef)>> {
        let mut node = node_ref.write();

        if node.is_leaf {
            match node.keys.binary_search(&key) {
                Ok(_) => return Err(DbError::DuplicateKey(key.to_string())),
                Err(pos) => {
                    node.keys.insert(pos, key);
                    node.values.insert(pos, value);
                }
            }
            if node.keys.len() >= self.order {
                return Ok(Some(self.split_leaf(&mut node)));
            }
            return Ok(None);
        }

        let child_idx = node.find_child_index(&key);
        let child = node.children[child_idx].clone();
        drop(node);

        if let Some((sep, right)) = self.insert_recursive(&child, key, value)? {
            let mut node = node_ref.write();
            node.keys.insert(child_idx, sep);
            node.children.insert(child_idx + 1, right);
            if node.keys.len() >= self.order {
                return Ok(Some(self.split_internal(&mut node)));
            }
        }
        Ok(None)
    }

    /// Splits a full leaf: the upper half including the middle key moves to
    /// a new right sibling, the middle key is promoted (as a copy), and the
    /// leaf chain is relinked through the new node.
    fn split_leaf(&self, node: &mut Node) -> (IndexKey, NodeRef) {
        let mid = node.keys.len() / 2;
        let mut right = Node::new_leaf();
        right.keys = node.keys.split_off(mid);
        right.values = node.values.split_off(mid);
        right.next_leaf = node.next_leaf.take();

        let sep = right.keys[0].clone();
        let right = Arc::new(RwLock::new(right));
        node.next_leaf = Some(right.clone());
        (sep, right)
    }

    /// Splits a full internal node: the upper half minus the middle key
    /// moves right; the middle key itself is promoted.
    fn split_internal(&self, node: &mut Node) -> (IndexKey, NodeRef) {
        let mid = node.keys.len() / 2;
        let mut right = Node::new_internal();
        right.keys = node.keys.split_off(mid + 1);
        right.children = node.children.split_off(mid + 1);
        let sep = node.keys.pop().expect("middle key present in full node");

        (sep, Arc::new(RwLock::new(right)))
    }

    /// Point lookup.
    pub fn search(&self, key: &IndexKey) -> Option<TupleId> {
        let root = self.root.read().clone()?;
        let leaf = Self::find_leaf(root, key);
        let node = leaf.read();
        node.keys
            .binary_search(key)
            .ok()
            .map(|pos| node.values[pos])
    }

    /// Inclusive range scan; results come back in ascending key order.
    pub fn range_search(&self, lo: &IndexKey, hi: &IndexKey) -> Vec<(IndexKey, TupleId)> {
        let mut results = Vec::new();
        let Some(root) = self.root.read().clone() else {
            return results;
        };

        let mut current = Some(Self::find_leaf(root, lo));
        while let Some(leaf_ref) = current {
            let leaf = leaf_ref.read();
            for (k, v) in leaf.keys.iter().zip(leaf.values.iter()) {
                if k > hi {
                    return results;
                }
                if k >= lo {
                    results.push((k.clone(), *v));
                }
            }
            current = leaf.next_leaf.clone();
        }
        results
    }

    /// Removes a key from its leaf (no rebalancing). Returns whether the
    /// key was present.
    pub fn delete(&self, key: &IndexKey) -> bool {
        let Some(root) = self.root.read().clone() else {
            return false;
        };
        let leaf = Self::find_leaf(root, key);
        let mut node = leaf.write();
        match node.keys.binary_search(key) {
            Ok(pos) => {
                node.keys.remove(pos);
                node.values.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Total number of keys.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let Some(root) = self.root.read().clone() else {
            return 0;
        };
        let mut current = Some(Self::leftmost_leaf(root));
        while let Some(leaf_ref) = current {
            let leaf = leaf_ref.read();
            count += leaf.keys.len();
            current = leaf.next_leaf.clone();
        }
        count
    }

    pub fn is_empty(&self) -> bool {
        self.root.read().is_none() || self.len() == 0
    }

    fn find_leaf(mut node_ref: NodeRef, key: &IndexKey) -> NodeRef {
        loop {
            let next = {
                let node = node_ref.read();
                if node.is_leaf {
                    return node_ref.clone();
                }
                node.children[node.find_child_index(key)].clone()
            };
            node_ref = next;
        }
    }

    fn leftmost_leaf(mut node_ref: NodeRef) -> NodeRef {
        loop {
            let next = {
                let node = node_ref.read();
                if node.is_leaf {
                    return node_ref.clone();
                }
                node.children[0].clone()
            };
            node_ref = next;
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Writes the tree to disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.order as u32).to_le_bytes());
        buf.extend_from_slice(&[0u8; 12]);

        if let Some(root) = self.root.read().clone() {
            Self::encode_node(&root, &mut buf);
        }
        std::fs::write(path, buf)?;
        Ok(())
    }

    /// Reads a tree previously written by [`BPlusTree::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        if bytes.len() < 16 {
            return Err(DbError::corruption("index file shorter than its header"));
        }
        let order = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        if order < 3 {
            return Err(DbError::corruption(format!("index order {} invalid", order)));
        }

        let tree = Self::with_order(order);
        if bytes.len() == 16 {
            return Ok(tree);
        }

        let mut pos = 16;
        let mut last_leaf: Option<NodeRef> = None;
        let mut height = 0;
        let root = Self::decode_node(&bytes, &mut pos, &mut last_leaf, 1, &mut height)?;
        if pos != bytes.len() {
            return Err(DbError::corruption(format!(
                "index file has {} trailing bytes",
                bytes.len() - pos
            )));
        }

        *tree.root.write() = Some(root);
        *tree.height.write() = height;
        Ok(tree)
    }

    fn encode_node(node_ref: &NodeRef, buf: &mut Vec<u8>) {
        let node = node_ref.read();
        buf.push(if node.is_leaf {
            NODE_TYPE_LEAF
        } else {
            NODE_TYPE_INTERNAL
        });
        buf.extend_from_slice(&(node.keys.len() as u32).to_le_bytes());
        for key in &node.keys {
            encode_key(buf, key);
        }
        if node.is_leaf {
            for value in &node.values {
                buf.extend_from_slice(&value.page_id.to_le_bytes());
                buf.extend_from_slice(&value.slot.to_le_bytes());
            }
        } else {
            buf.extend_from_slice(&(node.children.len() as u32).to_le_bytes());
            for child in &node.children {
                Self::encode_node(child, buf);
            }
        }
    }

    fn decode_node(
        bytes: &[u8],
        pos: &mut usize,
        last_leaf: &mut Option<NodeRef>,
        depth: usize,
        height: &mut usize,
    ) -> Result<NodeRef> {
        let node_type = read_u8(bytes, pos)?;
        let num_keys = read_u32(bytes, pos)? as usize;
        let mut keys = Vec::with_capacity(num_keys);
        for _ in 0..num_keys {
            keys.push(decode_key(bytes, pos)?);
        }

        match node_type {
            NODE_TYPE_LEAF => {
                let mut values = Vec::with_capacity(num_keys);
                for _ in 0..num_keys {
                    let page_id = read_u32(bytes, pos)?;
                    let slot = read_u16(bytes, pos)? as SlotId;
                    values.push(TupleId::new(page_id, slot));
                }
                let mut leaf = Node::new_leaf();
                leaf.keys = keys;
                leaf.values = values;
                let leaf = Arc::new(RwLock::new(leaf));
                if let Some(prev) = last_leaf.replace(leaf.clone()) {
                    prev.write().next_leaf = Some(leaf.clone());
                }
                *height = (*height).max(depth);
                Ok(leaf)
            }
            NODE_TYPE_INTERNAL => {
                let num_children = read_u32(bytes, pos)? as usize;
                if num_children != num_keys + 1 {
                    return Err(DbError::corruption(format!(
                        "internal index node has {} keys but {} children",
                        num_keys, num_children
                    )));
                }
                let mut node = Node::new_internal();
                node.keys = keys;
                for _ in 0..num_children {
                    node.children
                        .push(Self::decode_node(bytes, pos, last_leaf, depth + 1, height)?);
                }
                Ok(Arc::new(RwLock::new(node)))
            }
            other => Err(DbError::corruption(format!(
                "unknown index node type {}",
                other
            ))),
        }
    }
}

impl Default for BPlusTree {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_key(buf: &mut Vec<u8>, key: &IndexKey) {
    match key {
        IndexKey::Int(i) => {
            buf.push(KEY_TAG_INT);
            buf.extend_from_slice(&i.to_le_bytes());
        }
        // Floats and composites persist through their stable string form;
        // cross-type comparison makes the reloaded key find the same spot.
        other => {
            let s = other.stable_string();
            buf.push(KEY_TAG_STRING);
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
    }
}

fn decode_key(bytes: &[u8], pos: &mut usize) -> Result<IndexKey> {
    match read_u8(bytes, pos)? {
        KEY_TAG_INT => {
            let raw = read_array::<8>(bytes, pos)?;
            Ok(IndexKey::Int(i64::from_le_bytes(raw)))
        }
        KEY_TAG_STRING => {
            let len = read_u32(bytes, pos)? as usize;
            if bytes.len() - *pos < len {
                return Err(DbError::corruption("index key truncated"));
            }
            let s = String::from_utf8(bytes[*pos..*pos + len].to_vec())
                .map_err(|_| DbError::corruption("index key is not UTF-8"))?;
            *pos += len;
            Ok(IndexKey::Str(s))
        }
        other => Err(DbError::corruption(format!(
            "unknown index key tag {}",
            other
        ))),
    }
}

fn read_u8(bytes: &[u8], pos: &mut usize) -> Result<u8> {
    let raw = read_array::<1>(bytes, pos)?;
    Ok(raw[0])
}

fn read_u16(bytes: &[u8], pos: &mut usize) -> Result<u16> {
    Ok(u16::from_le_bytes(read_array::<2>(bytes, pos)?))
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array::<4>(bytes, pos)?))
}

fn read_array<const N: usize>(bytes: &[u8], pos: &mut usize) -> Result<[u8; N]> {
    if bytes.len() - *pos < N {
        return Err(DbError::corruption("index file truncated"));
    }
    let out: [u8; N] = bytes[*pos..*pos + N].try_into().unwrap();
    *pos += N;
    Ok(out)
}
