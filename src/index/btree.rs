//! Order-4 B+Tree mapping one column's values to the row numbers holding them
//!
//! Nodes live in an arena and refer to each other by position, so the whole tree
//! serializes as one flat snapshot. Internal nodes carry navigation keys only; leaves
//! carry the sorted keys, one row-number list per key, and a link to the next leaf.
//! Deleting never merges or redistributes nodes: an index is rebuilt from its sheet
//! instead of being maintained through heavy churn.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::sql::types::Value;

pub const ORDER: usize = 4;
pub const MAX_KEYS: usize = ORDER - 1;

type NodeId = usize;

/// A totally ordered key extracted from a cell value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl IndexKey {
    /// Integers and floats share one numeric key space; dates index by their ISO text
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Boolean(b) => IndexKey::Bool(*b),
            Value::Integer(i) => IndexKey::Number(*i as f64),
            Value::Float(f) => IndexKey::Number(*f),
            Value::String(s) => IndexKey::Text(s.clone()),
            v @ (Value::Date(_) | Value::DateTime(_)) => IndexKey::Text(v.to_string()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            IndexKey::Null => 0,
            IndexKey::Bool(_) => 1,
            IndexKey::Number(_) => 2,
            IndexKey::Text(_) => 3,
        }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Bool(a), IndexKey::Bool(b)) => a.cmp(b),
            (IndexKey::Number(a), IndexKey::Number(b)) => a.total_cmp(b),
            (IndexKey::Text(a), IndexKey::Text(b)) => a.cmp(b),
            // Cross-type (and Null/Null): order by variant
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Internal {
        keys: Vec<IndexKey>,
        children: Vec<NodeId>,
    },
    Leaf {
        keys: Vec<IndexKey>,
        values: Vec<Vec<usize>>,
        next: Option<NodeId>,
    },
}

impl Node {
    fn empty_leaf() -> Self {
        Node::Leaf {
            keys: Vec::new(),
            values: Vec::new(),
            next: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BPlusTree {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Default for BPlusTree {
    fn default() -> Self {
        Self::new()
    }
}

impl BPlusTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::empty_leaf()],
            root: 0,
        }
    }

    /// Appends `row` to the row list of `key`, splitting full nodes on the way back up
    pub fn insert(&mut self, key: IndexKey, row: usize) {
        if let Some((promoted, right)) = self.insert_into(self.root, key, row) {
            let new_root = self.alloc(Node::Internal {
                keys: vec![promoted],
                children: vec![self.root, right],
            });
            self.root = new_root;
        }
    }

    fn insert_into(&mut self, id: NodeId, key: IndexKey, row: usize) -> Option<(IndexKey, NodeId)> {
        let child = match &mut self.nodes[id] {
            Node::Leaf { keys, values, .. } => {
                match keys.binary_search(&key) {
                    Ok(pos) => values[pos].push(row),
                    Err(pos) => {
                        keys.insert(pos, key);
                        values.insert(pos, vec![row]);
                    }
                }
                return if keys.len() > MAX_KEYS {
                    Some(self.split_leaf(id))
                } else {
                    None
                };
            }
            Node::Internal { keys, children } => {
                let pos = keys.partition_point(|k| k <= &key);
                (pos, children[pos])
            }
        };

        let (pos, child_id) = child;
        let (promoted, right) = self.insert_into(child_id, key, row)?;
        if let Node::Internal { keys, children } = &mut self.nodes[id] {
            keys.insert(pos, promoted);
            children.insert(pos + 1, right);
            if keys.len() > MAX_KEYS {
                return Some(self.split_internal(id));
            }
        }
        None
    }

    /// Moves the right half of a leaf into a new sibling linked right after it
    fn split_leaf(&mut self, id: NodeId) -> (IndexKey, NodeId) {
        let new_id = self.nodes.len();
        let (right_keys, right_values, next) = match &mut self.nodes[id] {
            Node::Leaf { keys, values, next } => {
                let mid = keys.len() / 2;
                let right = (keys.split_off(mid), values.split_off(mid), *next);
                *next = Some(new_id);
                right
            }
            Node::Internal { .. } => unreachable!("split_leaf on internal node"),
        };
        let promoted = right_keys[0].clone();
        self.nodes.push(Node::Leaf {
            keys: right_keys,
            values: right_values,
            next,
        });
        (promoted, new_id)
    }

    /// Keeps `keys[..mid]`/`children[..=mid]` on the left and promotes `keys[mid]`
    fn split_internal(&mut self, id: NodeId) -> (IndexKey, NodeId) {
        let (promoted, right_keys, right_children) = match &mut self.nodes[id] {
            Node::Internal { keys, children } => {
                let mid = keys.len() / 2;
                let right_keys = keys.split_off(mid + 1);
                let right_children = children.split_off(mid + 1);
                let promoted = keys.pop().unwrap_or(IndexKey::Null);
                (promoted, right_keys, right_children)
            }
            Node::Leaf { .. } => unreachable!("split_internal on leaf node"),
        };
        let new_id = self.alloc(Node::Internal {
            keys: right_keys,
            children: right_children,
        });
        (promoted, new_id)
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    /// Descends to the leaf that owns `key`
    fn find_leaf(&self, key: &IndexKey) -> NodeId {
        let mut id = self.root;
        loop {
            match &self.nodes[id] {
                Node::Leaf { .. } => return id,
                Node::Internal { keys, children } => {
                    id = children[keys.partition_point(|k| k <= key)];
                }
            }
        }
    }

    /// Row numbers stored under `key`, empty when absent
    pub fn search(&self, key: &IndexKey) -> Vec<usize> {
        match &self.nodes[self.find_leaf(key)] {
            Node::Leaf { keys, values, .. } => match keys.binary_search(key) {
                Ok(pos) => values[pos].clone(),
                Err(_) => Vec::new(),
            },
            Node::Internal { .. } => Vec::new(),
        }
    }

    /// Row numbers of every key in `[start, end]`, in key order
    pub fn range_search(&self, start: &IndexKey, end: &IndexKey) -> Vec<usize> {
        let mut result = Vec::new();
        if start > end {
            return result;
        }
        let mut current = Some(self.find_leaf(start));
        while let Some(id) = current {
            let Node::Leaf { keys, values, next } = &self.nodes[id] else {
                break;
            };
            for (key, rows) in keys.iter().zip(values) {
                if key > end {
                    return result;
                }
                if key >= start {
                    result.extend_from_slice(rows);
                }
            }
            current = *next;
        }
        result
    }

    /// Smallest key not below `start`
    fn first_from(&self, start: &IndexKey) -> Option<&IndexKey> {
        let mut current = Some(self.find_leaf(start));
        while let Some(id) = current {
            let Node::Leaf { keys, next, .. } = &self.nodes[id] else {
                return None;
            };
            if let Some(key) = keys.iter().find(|k| *k >= start) {
                return Some(key);
            }
            current = *next;
        }
        None
    }

    /// Whether every key is NULL or a number
    pub fn is_numeric(&self) -> bool {
        matches!(
            self.first_from(&IndexKey::Bool(false)),
            None | Some(IndexKey::Number(_))
        ) && self.first_from(&IndexKey::Text(String::new())).is_none()
    }

    /// Removes one occurrence of `row` under `key`; the key goes once its list is empty.
    /// Returns whether anything was removed.
    pub fn delete(&mut self, key: &IndexKey, row: usize) -> bool {
        let leaf = self.find_leaf(key);
        let removed = match &mut self.nodes[leaf] {
            Node::Leaf { keys, values, .. } => match keys.binary_search(key) {
                Ok(pos) => match values[pos].iter().position(|r| *r == row) {
                    Some(at) => {
                        values[pos].remove(at);
                        if values[pos].is_empty() {
                            keys.remove(pos);
                            values.remove(pos);
                        }
                        true
                    }
                    None => false,
                },
                Err(_) => false,
            },
            Node::Internal { .. } => false,
        };

        if let Node::Internal { keys, children } = &self.nodes[self.root] {
            if keys.is_empty() && children.len() == 1 {
                self.root = children[0];
            }
        }
        removed
    }

    /// Levels from root to leaf; a lone leaf has height 1
    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut id = self.root;
        while let Node::Internal { children, .. } = &self.nodes[id] {
            id = children[0];
            height += 1;
        }
        height
    }

    fn first_leaf(&self) -> NodeId {
        let mut id = self.root;
        while let Node::Internal { children, .. } = &self.nodes[id] {
            id = children[0];
        }
        id
    }

    /// All `(key, rows)` pairs following the leaf chain
    pub fn entries(&self) -> Vec<(IndexKey, Vec<usize>)> {
        let mut out = Vec::new();
        let mut current = Some(self.first_leaf());
        while let Some(id) = current {
            let Node::Leaf { keys, values, next } = &self.nodes[id] else {
                break;
            };
            out.extend(keys.iter().cloned().zip(values.iter().cloned()));
            current = *next;
        }
        out
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Navigation keys of the root, empty while the root is still a leaf
    pub fn root_keys(&self) -> &[IndexKey] {
        match &self.nodes[self.root] {
            Node::Internal { keys, .. } => keys,
            Node::Leaf { .. } => &[],
        }
    }

    /// First key of each leaf in chain order
    pub fn leaf_first_keys(&self) -> Vec<IndexKey> {
        let mut out = Vec::new();
        let mut current = Some(self.first_leaf());
        while let Some(id) = current {
            let Node::Leaf { keys, next, .. } = &self.nodes[id] else {
                break;
            };
            if let Some(k) = keys.first() {
                out.push(k.clone());
            }
            current = *next;
        }
        out
    }
}
