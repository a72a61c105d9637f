//! Rosters and communication trees.
//!
//! A [`Roster`] is the ordered set of identities taking part in one
//! computation; a [`Tree`] is a rooted spanning structure over it that
//! scopes direct communication to parent/children. Both are built once per
//! run and immutable afterward, and both carry deterministic ids: two
//! conodes constructing the same tree from the same roster agree on its id
//! without talking to each other.

use uuid::Uuid;

use crate::error::{ConetError, Result};
use crate::identity::Identity;

/// Index of a node within a tree's arena.
pub type TreeNodeId = usize;

/// Ordered set of participant identities, unique by id.
#[derive(Clone, Debug)]
pub struct Roster {
    id: Uuid,
    list: Vec<Identity>,
}

impl Roster {
    /// Build a roster; the order given here determines tree construction.
    ///
    /// Fails if two entries share an identity id.
    pub fn new(list: Vec<Identity>) -> Result<Self> {
        if list.is_empty() {
            return Err(ConetError::Tree("roster cannot be empty".into()));
        }
        for (i, a) in list.iter().enumerate() {
            for b in list.iter().skip(i + 1) {
                if a.id() == b.id() {
                    return Err(ConetError::Tree(format!(
                        "duplicate identity {} in roster",
                        a.id()
                    )));
                }
            }
        }

        let mut name = Vec::with_capacity(12 + list.len() * 16);
        name.extend_from_slice(b"conet:roster:");
        for identity in &list {
            name.extend_from_slice(identity.id().as_uuid().as_bytes());
        }
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, &name);

        Ok(Self { id, list })
    }

    /// Deterministic id of this roster.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Number of identities.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Whether the roster is empty (never true for a constructed roster).
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Identity at a roster position.
    pub fn get(&self, index: usize) -> Option<&Identity> {
        self.list.get(index)
    }

    /// Identities in roster order.
    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.list.iter()
    }

    /// Roster position of an identity id.
    pub fn index_of(&self, id: crate::identity::IdentityId) -> Option<usize> {
        self.list.iter().position(|identity| identity.id() == id)
    }

    /// A binary tree over the whole roster, rooted at the first identity.
    pub fn generate_binary_tree(&self) -> Tree {
        self.generate_nary_tree(2)
    }

    /// An n-ary tree over the whole roster, one node per identity.
    pub fn generate_nary_tree(&self, branching: usize) -> Tree {
        self.generate_sized_tree(branching, self.len())
    }

    /// An n-ary tree with `size` node slots over this roster.
    ///
    /// With `size` larger than the roster, slots wrap around and several
    /// tree nodes alias the same identity (co-located simulated processes).
    /// Such a tree fails [`Tree::uses_whole_roster`] and must not be used
    /// for global shutdown directly.
    pub fn generate_sized_tree(&self, branching: usize, size: usize) -> Tree {
        assert!(branching >= 1, "tree branching factor must be at least 1");
        assert!(size >= 1, "tree must have at least one node");

        let mut nodes = Vec::with_capacity(size);
        for slot in 0..size {
            let parent = if slot == 0 {
                None
            } else {
                Some((slot - 1) / branching)
            };
            let first = slot * branching + 1;
            let last = (first + branching).min(size);
            let children: Vec<TreeNodeId> = (first..last).collect();
            nodes.push(TreeNode {
                roster_index: slot % self.len(),
                parent,
                children,
            });
        }

        let mut name = Vec::with_capacity(16 + 16 + size * 8);
        name.extend_from_slice(b"conet:tree:");
        name.extend_from_slice(self.id.as_bytes());
        name.extend_from_slice(&(branching as u64).to_be_bytes());
        name.extend_from_slice(&(size as u64).to_be_bytes());
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, &name);

        Tree {
            id,
            roster: self.clone(),
            nodes,
        }
    }
}

/// One slot in a tree's arena, referencing its identity by roster index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeNode {
    /// Position of this node's identity in the roster.
    pub roster_index: usize,
    /// Parent slot; `None` for the root.
    pub parent: Option<TreeNodeId>,
    /// Child slots in order.
    pub children: Vec<TreeNodeId>,
}

/// A rooted spanning structure over a roster.
#[derive(Clone, Debug)]
pub struct Tree {
    id: Uuid,
    roster: Roster,
    nodes: Vec<TreeNode>,
}

impl Tree {
    /// Deterministic id of this tree.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The roster this tree spans.
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Number of node slots.
    pub fn size(&self) -> usize {
        self.nodes.len()
    }

    /// The root slot.
    pub fn root(&self) -> TreeNodeId {
        0
    }

    /// A node by slot.
    pub fn node(&self, id: TreeNodeId) -> &TreeNode {
        &self.nodes[id]
    }

    /// The identity a slot maps to.
    pub fn identity(&self, id: TreeNodeId) -> &Identity {
        self.roster
            .get(self.nodes[id].roster_index)
            .expect("tree node references roster entry")
    }

    /// Whether every roster identity owns exactly one tree slot.
    ///
    /// Required before a tree may drive global shutdown: an aliased tree
    /// would close one host while another of its slots still needs it.
    pub fn uses_whole_roster(&self) -> bool {
        if self.nodes.len() != self.roster.len() {
            return false;
        }
        let mut used = vec![false; self.roster.len()];
        for node in &self.nodes {
            if used[node.roster_index] {
                return false;
            }
            used[node.roster_index] = true;
        }
        used.into_iter().all(|u| u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::testing::TestElement;
    use crate::suite::PublicKey;

    fn roster(n: u8) -> Roster {
        let list = (0..n)
            .map(|i| {
                let public = PublicKey::from_element(&TestElement::from_seed(i + 1)).unwrap();
                Identity::new(public, vec![format!("127.0.0.1:{}", 2000 + i as u16)])
            })
            .collect();
        Roster::new(list).unwrap()
    }

    #[test]
    fn rejects_duplicates() {
        let public = PublicKey::from_element(&TestElement::from_seed(1)).unwrap();
        let a = Identity::new(public.clone(), vec!["a:1".into()]);
        let b = Identity::new(public, vec!["b:2".into()]);
        assert!(matches!(
            Roster::new(vec![a, b]),
            Err(ConetError::Tree(_))
        ));
    }

    #[test]
    fn binary_tree_shape() {
        let tree = roster(7).generate_binary_tree();
        assert_eq!(tree.size(), 7);
        assert_eq!(tree.node(0).children, vec![1, 2]);
        assert_eq!(tree.node(1).children, vec![3, 4]);
        assert_eq!(tree.node(2).children, vec![5, 6]);
        assert_eq!(tree.node(3).children, Vec::<usize>::new());
        assert_eq!(tree.node(6).parent, Some(2));
        assert_eq!(tree.node(0).parent, None);
    }

    #[test]
    fn parent_child_agree() {
        let tree = roster(5).generate_nary_tree(3);
        for slot in 0..tree.size() {
            for &child in &tree.node(slot).children {
                assert_eq!(tree.node(child).parent, Some(slot));
            }
        }
    }

    #[test]
    fn ids_are_deterministic() {
        let r = roster(4);
        assert_eq!(
            r.generate_binary_tree().id(),
            r.generate_binary_tree().id()
        );
        assert_ne!(
            r.generate_binary_tree().id(),
            r.generate_nary_tree(3).id()
        );
    }

    #[test]
    fn whole_roster_view() {
        let r = roster(3);
        assert!(r.generate_binary_tree().uses_whole_roster());

        let aliased = r.generate_sized_tree(2, 6);
        assert_eq!(aliased.size(), 6);
        assert!(!aliased.uses_whole_roster());
        // Slots wrap around the roster in order.
        assert_eq!(aliased.node(3).roster_index, 0);
    }

    #[test]
    fn root_is_first_roster_entry() {
        let r = roster(3);
        let tree = r.generate_binary_tree();
        assert_eq!(tree.identity(tree.root()).id(), r.get(0).unwrap().id());
    }
}
