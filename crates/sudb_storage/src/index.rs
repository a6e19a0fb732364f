//! Persistent B+-tree index with duplicate postings.
//!
//! Keys are heterogeneous JSON scalars; ordering is defined within the
//! numeric and string branches, and keys from different branches compare
//! equal (a carried compatibility quirk). Leaves carry posting lists of
//! `u64` row ids and are linked left-to-right for range traversal. Every
//! mutation persists a whole-tree bincode snapshot.

use std::cmp::Ordering;
use std::fs;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sudb_common::{SudbError, SudbResult};

/// An index key: a JSON scalar lifted into a bincode-friendly shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl From<&Value> for IndexKey {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => IndexKey::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => IndexKey::String(s.clone()),
            // Containers index by their JSON text.
            other => IndexKey::String(other.to_string()),
        }
    }
}

/// Total within a branch; heterogeneous keys compare equal.
fn compare_keys(a: &IndexKey, b: &IndexKey) -> Ordering {
    match (a, b) {
        (IndexKey::Number(x), IndexKey::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
        (IndexKey::String(x), IndexKey::String(y)) => x.cmp(y),
        (IndexKey::Bool(x), IndexKey::Bool(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Node {
    leaf: bool,
    keys: Vec<IndexKey>,
    /// Child node indices (internal nodes only).
    children: Vec<usize>,
    /// Posting lists, parallel to `keys` (leaves only).
    postings: Vec<Vec<u64>>,
    /// Right sibling (leaves only).
    next: Option<usize>,
}

impl Node {
    fn new_leaf() -> Self {
        Self {
            leaf: true,
            ..Default::default()
        }
    }
}

/// Arena-backed tree. Nodes are addressed by index into `nodes`.
#[derive(Debug, Serialize, Deserialize)]
struct Tree {
    degree: usize,
    root: usize,
    nodes: Vec<Node>,
}

impl Tree {
    fn new(degree: usize) -> Self {
        Self {
            degree,
            root: 0,
            nodes: vec![Node::new_leaf()],
        }
    }

    fn max_keys(&self) -> usize {
        2 * self.degree
    }

    /// First position whose key is not less than `key`.
    fn find_pos(keys: &[IndexKey], key: &IndexKey) -> usize {
        keys.iter()
            .position(|k| compare_keys(k, key) != Ordering::Less)
            .unwrap_or(keys.len())
    }

    /// Child slot to descend into: the number of separators ≤ `key`, so a
    /// key equal to a separator lands in the right subtree that holds it.
    fn child_slot(keys: &[IndexKey], key: &IndexKey) -> usize {
        keys.iter()
            .take_while(|k| compare_keys(k, key) != Ordering::Greater)
            .count()
    }

    fn find_leaf(&self, key: &IndexKey) -> usize {
        let mut idx = self.root;
        while !self.nodes[idx].leaf {
            let slot = Self::child_slot(&self.nodes[idx].keys, key);
            idx = self.nodes[idx].children[slot];
        }
        idx
    }

    /// Insert, splitting up the spine as needed. Returns the separator and
    /// new right sibling when `node_idx` itself split.
    fn insert_into(
        &mut self,
        node_idx: usize,
        key: &IndexKey,
        row_id: u64,
    ) -> Option<(IndexKey, usize)> {
        let max_keys = self.max_keys();

        if self.nodes[node_idx].leaf {
            let pos = Self::find_pos(&self.nodes[node_idx].keys, key);
            let node = &mut self.nodes[node_idx];
            if pos < node.keys.len() && compare_keys(&node.keys[pos], key) == Ordering::Equal {
                node.postings[pos].push(row_id);
                return None;
            }
            node.keys.insert(pos, key.clone());
            node.postings.insert(pos, vec![row_id]);
            if node.keys.len() > max_keys {
                return Some(self.split_leaf(node_idx));
            }
            return None;
        }

        let slot = Self::child_slot(&self.nodes[node_idx].keys, key);
        let child = self.nodes[node_idx].children[slot];
        let (separator, right) = self.insert_into(child, key, row_id)?;

        let node = &mut self.nodes[node_idx];
        node.keys.insert(slot, separator);
        node.children.insert(slot + 1, right);
        if node.keys.len() > max_keys {
            return Some(self.split_internal(node_idx));
        }
        None
    }

    /// Split a full leaf at the midpoint; the separator is the first key of
    /// the right half, which keeps all its data.
    fn split_leaf(&mut self, idx: usize) -> (IndexKey, usize) {
        let mid = self.nodes[idx].keys.len() / 2;
        let right = Node {
            leaf: true,
            keys: self.nodes[idx].keys.split_off(mid),
            children: Vec::new(),
            postings: self.nodes[idx].postings.split_off(mid),
            next: self.nodes[idx].next,
        };
        let separator = right.keys[0].clone();
        let right_idx = self.nodes.len();
        self.nodes.push(right);
        self.nodes[idx].next = Some(right_idx);
        (separator, right_idx)
    }

    /// Split a full internal node; the middle key moves up instead of being
    /// copied, so deep trees form correctly.
    fn split_internal(&mut self, idx: usize) -> (IndexKey, usize) {
        let mid = self.nodes[idx].keys.len() / 2;
        let mut right_keys = self.nodes[idx].keys.split_off(mid);
        let separator = right_keys.remove(0);
        let right_children = self.nodes[idx].children.split_off(mid + 1);

        let right = Node {
            leaf: false,
            keys: right_keys,
            children: right_children,
            postings: Vec::new(),
            next: None,
        };
        let right_idx = self.nodes.len();
        self.nodes.push(right);
        (separator, right_idx)
    }

    fn add(&mut self, key: IndexKey, row_id: u64) {
        if let Some((separator, right)) = self.insert_into(self.root, &key, row_id) {
            let new_root = Node {
                leaf: false,
                keys: vec![separator],
                children: vec![self.root, right],
                postings: Vec::new(),
                next: None,
            };
            self.root = self.nodes.len();
            self.nodes.push(new_root);
        }
    }

    fn find(&self, key: &IndexKey) -> Vec<u64> {
        let leaf = self.find_leaf(key);
        let pos = Self::find_pos(&self.nodes[leaf].keys, key);
        let node = &self.nodes[leaf];
        if pos < node.keys.len() && compare_keys(&node.keys[pos], key) == Ordering::Equal {
            node.postings[pos].clone()
        } else {
            Vec::new()
        }
    }

    fn remove(&mut self, key: &IndexKey, row_id: u64) {
        let leaf = self.find_leaf(key);
        let pos = Self::find_pos(&self.nodes[leaf].keys, key);
        let node = &mut self.nodes[leaf];
        if pos < node.keys.len() && compare_keys(&node.keys[pos], key) == Ordering::Equal {
            node.postings[pos].retain(|id| *id != row_id);
            if node.postings[pos].is_empty() {
                // No underflow rebalancing: emptied keys just leave.
                node.keys.remove(pos);
                node.postings.remove(pos);
            }
        }
    }
}

/// The index handle: a tree behind a read-write lock plus its file path.
pub struct BPlusTreeIndex {
    tree: RwLock<Tree>,
    path: PathBuf,
}

impl BPlusTreeIndex {
    /// Open the index at `path`, loading an existing snapshot or starting
    /// empty.
    pub fn open(path: impl Into<PathBuf>, degree: usize) -> SudbResult<Self> {
        let path = path.into();
        let tree = match fs::read(&path) {
            Ok(bytes) => bincode::deserialize(&bytes)
                .map_err(|e| SudbError::Integrity(format!("索引文件损坏 {path:?}: {e}")))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tree::new(degree.max(1)),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            tree: RwLock::new(tree),
            path,
        })
    }

    /// Append `row_id` under `key`, inserting the key when absent. Persists
    /// the whole tree.
    pub fn add(&self, key: &Value, row_id: u64) -> SudbResult<()> {
        let mut tree = self.tree.write();
        tree.add(IndexKey::from(key), row_id);
        self.save_locked(&tree)
    }

    /// The posting list for `key`, or empty.
    pub fn find(&self, key: &Value) -> Vec<u64> {
        self.tree.read().find(&IndexKey::from(key))
    }

    /// Remove `row_id` from the posting of `key`; the key itself leaves when
    /// its posting empties. Persists the whole tree.
    pub fn remove(&self, key: &Value, row_id: u64) -> SudbResult<()> {
        let mut tree = self.tree.write();
        tree.remove(&IndexKey::from(key), row_id);
        self.save_locked(&tree)
    }

    fn save_locked(&self, tree: &Tree) -> SudbResult<()> {
        let bytes = bincode::serialize(tree)
            .map_err(|e| SudbError::Internal(format!("索引序列化失败: {e}")))?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open(dir: &TempDir, degree: usize) -> BPlusTreeIndex {
        BPlusTreeIndex::open(dir.path().join("indexes/age.idx"), degree).unwrap()
    }

    #[test]
    fn test_add_and_find() {
        let dir = TempDir::new().unwrap();
        let idx = open(&dir, 2);
        idx.add(&json!(25), 0).unwrap();
        idx.add(&json!(30), 1).unwrap();
        assert_eq!(idx.find(&json!(25)), vec![0]);
        assert_eq!(idx.find(&json!(30)), vec![1]);
        assert!(idx.find(&json!(99)).is_empty());
    }

    #[test]
    fn test_duplicate_postings() {
        let dir = TempDir::new().unwrap();
        let idx = open(&dir, 2);
        idx.add(&json!("x"), 1).unwrap();
        idx.add(&json!("x"), 2).unwrap();
        idx.add(&json!("x"), 2).unwrap();
        assert_eq!(idx.find(&json!("x")), vec![1, 2, 2]);
    }

    #[test]
    fn test_remove_row_and_key() {
        let dir = TempDir::new().unwrap();
        let idx = open(&dir, 2);
        idx.add(&json!(1), 10).unwrap();
        idx.add(&json!(1), 11).unwrap();
        idx.remove(&json!(1), 10).unwrap();
        assert_eq!(idx.find(&json!(1)), vec![11]);
        idx.remove(&json!(1), 11).unwrap();
        assert!(idx.find(&json!(1)).is_empty());
        // Removing from an absent key is a no-op.
        idx.remove(&json!(1), 11).unwrap();
    }

    #[test]
    fn test_leaf_splits_keep_all_keys() {
        let dir = TempDir::new().unwrap();
        let idx = open(&dir, 2); // leaf capacity 4
        for i in 0..20u64 {
            idx.add(&json!(i), i).unwrap();
        }
        for i in 0..20u64 {
            assert_eq!(idx.find(&json!(i)), vec![i], "key {i} lost after splits");
        }
    }

    #[test]
    fn test_deep_tree_with_internal_splits() {
        let dir = TempDir::new().unwrap();
        let idx = open(&dir, 2);
        // Enough keys to force several levels of internal splits.
        for i in 0..500u64 {
            idx.add(&json!(i), i).unwrap();
        }
        for i in 0..500u64 {
            assert_eq!(idx.find(&json!(i)), vec![i], "key {i} lost in deep tree");
        }
    }

    #[test]
    fn test_reverse_and_interleaved_order() {
        let dir = TempDir::new().unwrap();
        let idx = open(&dir, 2);
        for i in (0..100u64).rev() {
            idx.add(&json!(i), i).unwrap();
        }
        for i in (0..100u64).step_by(2) {
            idx.remove(&json!(i), i).unwrap();
        }
        for i in 0..100u64 {
            let expected: Vec<u64> = if i % 2 == 0 { vec![] } else { vec![i] };
            assert_eq!(idx.find(&json!(i)), expected);
        }
    }

    #[test]
    fn test_string_keys() {
        let dir = TempDir::new().unwrap();
        let idx = open(&dir, 2);
        let names = ["delta", "alpha", "echo", "charlie", "bravo"];
        for (i, name) in names.iter().enumerate() {
            idx.add(&json!(name), i as u64).unwrap();
        }
        for (i, name) in names.iter().enumerate() {
            assert_eq!(idx.find(&json!(name)), vec![i as u64]);
        }
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let idx = open(&dir, 2);
            for i in 0..50u64 {
                idx.add(&json!(i), i).unwrap();
            }
        }
        let idx = open(&dir, 2);
        for i in 0..50u64 {
            assert_eq!(idx.find(&json!(i)), vec![i]);
        }
    }

    #[test]
    fn test_corrupt_snapshot_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.idx");
        std::fs::write(&path, b"\xFF\xFF not bincode").unwrap();
        assert!(BPlusTreeIndex::open(&path, 2).is_err());
    }

    #[test]
    fn test_find_matches_multiset_invariant() {
        // After an arbitrary interleaving of add/remove, find(k) equals the
        // adds minus the removes for that key.
        let dir = TempDir::new().unwrap();
        let idx = open(&dir, 2);
        idx.add(&json!(7), 1).unwrap();
        idx.add(&json!(7), 2).unwrap();
        idx.add(&json!(3), 3).unwrap();
        idx.remove(&json!(7), 1).unwrap();
        idx.add(&json!(7), 4).unwrap();
        idx.remove(&json!(3), 3).unwrap();
        assert_eq!(idx.find(&json!(7)), vec![2, 4]);
        assert!(idx.find(&json!(3)).is_empty());
    }
}
