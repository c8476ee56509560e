//! A label-indexed tree of DNS names.
//!
//! Both the [zone index][crate::zone::ZoneIndex] and each zone's
//! [record tree][crate::zone::RecordTree] are built on [`LabelTree`]. Nodes live in an arena and
//! refer to their parent by [`NodeId`], so walking up to a zone cut never needs shared ownership.
//!
//! A name is addressed by its labels read root-to-leaf, i.e. `www.example.jp.` is the path
//! `["jp", "example", "www"]`. See [`labels`].

use std::collections::HashMap;
use trust_dns_proto::rr::Name;

/// Index of a node inside a [`LabelTree`].
pub type NodeId = usize;

/// Returns the lower-cased labels of `name` in root-to-leaf order.
#[must_use]
pub fn labels(name: &Name) -> Vec<String> {
    let mut labels: Vec<String> = name
        .iter()
        .map(|label| String::from_utf8_lossy(label).to_ascii_lowercase())
        .collect();
    labels.reverse();
    labels
}

#[derive(Debug, Clone)]
struct Node<T> {
    parent: Option<NodeId>,
    children: HashMap<String, NodeId>,
    data: T,
}

/// A tree of DNS labels carrying a `T` at every node.
#[derive(Debug, Clone)]
pub struct LabelTree<T> {
    nodes: Vec<Node<T>>,
}

impl<T: Default> Default for LabelTree<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Default> LabelTree<T> {
    /// The root node, standing for the DNS root `.`.
    pub const ROOT: NodeId = 0;

    #[must_use]
    pub fn new() -> Self {
        LabelTree {
            nodes: vec![Node {
                parent: None,
                children: HashMap::new(),
                data: T::default(),
            }],
        }
    }

    /// Walks `labels` from the root, creating any missing nodes, and returns the final node.
    pub fn insert(&mut self, labels: &[String]) -> NodeId {
        let mut current = Self::ROOT;
        for label in labels {
            current = match self.nodes[current].children.get(label) {
                Some(&child) => child,
                None => {
                    let child = self.nodes.len();
                    self.nodes.push(Node {
                        parent: Some(current),
                        children: HashMap::new(),
                        data: T::default(),
                    });
                    self.nodes[current].children.insert(label.clone(), child);
                    child
                }
            };
        }
        current
    }
}

impl<T> LabelTree<T> {
    /// Returns the node at exactly `labels`, if it exists.
    #[must_use]
    pub fn lookup(&self, labels: &[String]) -> Option<NodeId> {
        let (node, depth) = self.closest(labels);
        (depth == labels.len()).then_some(node)
    }

    /// Returns the deepest existing node on the path of `labels` together with how many labels
    /// matched. A full match means the name itself exists.
    #[must_use]
    pub fn closest(&self, labels: &[String]) -> (NodeId, usize) {
        let mut current = 0;
        for (depth, label) in labels.iter().enumerate() {
            match self.nodes[current].children.get(label) {
                Some(&child) => current = child,
                None => return (current, depth),
            }
        }
        (current, labels.len())
    }

    /// Returns every existing node on the path of `labels`, root first.
    #[must_use]
    pub fn path(&self, labels: &[String]) -> Vec<NodeId> {
        let mut path = vec![0];
        let mut current = 0;
        for label in labels {
            match self.nodes[current].children.get(label) {
                Some(&child) => {
                    path.push(child);
                    current = child;
                }
                None => break,
            }
        }
        path
    }

    #[must_use]
    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id].parent
    }

    #[must_use]
    pub fn has_children(&self, id: NodeId) -> bool {
        !self.nodes[id].children.is_empty()
    }

    /// Returns the ids of every node below `id`, not including `id` itself.
    #[must_use]
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut found = Vec::new();
        let mut pending: Vec<NodeId> = self.nodes[id].children.values().copied().collect();
        while let Some(next) = pending.pop() {
            found.push(next);
            pending.extend(self.nodes[next].children.values().copied());
        }
        found
    }

    #[must_use]
    pub fn get(&self, id: NodeId) -> &T {
        &self.nodes[id].data
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut T {
        &mut self.nodes[id].data
    }

    /// Iterates over every node in creation order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> {
        self.nodes.iter().enumerate().map(|(id, node)| (id, &node.data))
    }

    /// Number of nodes, including the root.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn l(name: &str) -> Vec<String> {
        labels(&Name::from_str(name).unwrap())
    }

    #[test]
    fn labels_are_reversed_and_lowercased() {
        assert_eq!(l("WWW.Example.JP."), vec!["jp", "example", "www"]);
        assert!(l(".").is_empty());
    }

    #[test]
    fn insert_creates_intermediate_nodes() {
        let mut tree: LabelTree<u8> = LabelTree::new();
        let leaf = tree.insert(&l("a.b.example.jp."));
        assert_eq!(tree.len(), 5);
        assert_eq!(tree.lookup(&l("a.b.example.jp.")), Some(leaf));
        assert!(tree.lookup(&l("b.example.jp.")).is_some());
        assert_eq!(tree.lookup(&l("c.example.jp.")), None);
        assert_eq!(tree.insert(&l("a.b.example.jp.")), leaf);
    }

    #[test]
    fn closest_reports_matched_depth() {
        let mut tree: LabelTree<u8> = LabelTree::new();
        let example = tree.insert(&l("example.jp."));
        assert_eq!(tree.closest(&l("x.y.example.jp.")), (example, 2));
        assert_eq!(tree.closest(&l("example.com.")), (LabelTree::<u8>::ROOT, 0));
    }

    #[test]
    fn parents_and_descendants() {
        let mut tree: LabelTree<u8> = LabelTree::new();
        let sub = tree.insert(&l("sub.example.jp."));
        let deep = tree.insert(&l("deep.sub.example.jp."));
        let other = tree.insert(&l("other.example.jp."));
        assert_eq!(tree.parent(deep), Some(sub));
        assert_eq!(tree.descendants(sub), vec![deep]);
        assert!(!tree.has_children(other));
        assert_eq!(tree.path(&l("x.sub.example.jp.")).len(), 4);
        *tree.get_mut(deep) = 7;
        assert_eq!(*tree.get(deep), 7);
    }
}
