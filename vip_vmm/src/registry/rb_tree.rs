/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Red-black trees over registry slot indices.
//!
//! Every slot owns exactly one node, links are slot indices instead of pointers.
//! Keys are hashed into `roots.len()` buckets, each bucket is an independent tree.

use super::table::SlotIndex;

#[derive(Debug, Clone, Copy, Default)]
struct Node {
    key: u64,
    parent: Option<u32>,
    left: Option<u32>,
    right: Option<u32>,
    red: bool,
    linked: bool,
}

pub(crate) struct RbForest {
    nodes: Vec<Node>,
    roots: Vec<Option<u32>>,
}

impl RbForest {
    pub(crate) fn new(buckets: usize) -> Self {
        debug_assert!(buckets > 0);
        Self {
            nodes: Vec::new(),
            roots: vec![None; buckets],
        }
    }

    #[inline]
    fn bucket(&self, key: u64) -> usize {
        (key % self.roots.len() as u64) as usize
    }

    #[inline]
    fn node(&self, index: u32) -> &Node {
        &self.nodes[index as usize]
    }

    #[inline]
    fn node_mut(&mut self, index: u32) -> &mut Node {
        &mut self.nodes[index as usize]
    }

    #[inline]
    fn is_red(&self, index: Option<u32>) -> bool {
        index.map_or(false, |i| self.node(i).red)
    }

    #[inline]
    fn set_black(&mut self, index: Option<u32>) {
        if let Some(i) = index {
            self.node_mut(i).red = false;
        }
    }

    fn rotate_left(&mut self, bucket: usize, x: u32) {
        let Some(y) = self.node(x).right else {
            debug_assert!(false, "rotate_left without right child");
            return;
        };

        let y_left = self.node(y).left;
        self.node_mut(x).right = y_left;
        if let Some(l) = y_left {
            self.node_mut(l).parent = Some(x);
        }

        self.replace_child(bucket, x, Some(y));
        self.node_mut(y).left = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    fn rotate_right(&mut self, bucket: usize, x: u32) {
        let Some(y) = self.node(x).left else {
            debug_assert!(false, "rotate_right without left child");
            return;
        };

        let y_right = self.node(y).right;
        self.node_mut(x).left = y_right;
        if let Some(r) = y_right {
            self.node_mut(r).parent = Some(x);
        }

        self.replace_child(bucket, x, Some(y));
        self.node_mut(y).right = Some(x);
        self.node_mut(x).parent = Some(y);
    }

    /// Puts `v` where `u` hangs in its parent (or the root) and updates `v`'s parent
    fn replace_child(&mut self, bucket: usize, u: u32, v: Option<u32>) {
        let parent = self.node(u).parent;
        match parent {
            None => self.roots[bucket] = v,
            Some(p) => {
                if self.node(p).left == Some(u) {
                    self.node_mut(p).left = v;
                } else {
                    self.node_mut(p).right = v;
                }
            }
        }
        if let Some(v) = v {
            self.node_mut(v).parent = parent;
        }
    }

    fn minimum(&self, mut index: u32) -> u32 {
        while let Some(left) = self.node(index).left {
            index = left;
        }
        index
    }

    fn insert(&mut self, z: u32, key: u64) {
        let bucket = self.bucket(key);

        let mut parent = None;
        let mut cur = self.roots[bucket];
        while let Some(c) = cur {
            parent = Some(c);
            cur = if key < self.node(c).key {
                self.node(c).left
            } else {
                self.node(c).right
            };
        }

        *self.node_mut(z) = Node {
            key,
            parent,
            left: None,
            right: None,
            red: true,
            linked: true,
        };

        match parent {
            None => self.roots[bucket] = Some(z),
            Some(p) => {
                if key < self.node(p).key {
                    self.node_mut(p).left = Some(z);
                } else {
                    self.node_mut(p).right = Some(z);
                }
            }
        }

        self.insert_fixup(bucket, z);
    }

    fn insert_fixup(&mut self, bucket: usize, mut z: u32) {
        while let Some(p) = self.node(z).parent.filter(|p| self.node(*p).red) {
            // a red node is never the root
            let Some(g) = self.node(p).parent else { break };

            if self.node(g).left == Some(p) {
                let uncle = self.node(g).right;
                if self.is_red(uncle) {
                    self.set_black(Some(p));
                    self.set_black(uncle);
                    self.node_mut(g).red = true;
                    z = g;
                } else {
                    if self.node(p).right == Some(z) {
                        z = p;
                        self.rotate_left(bucket, z);
                    }
                    let Some(p) = self.node(z).parent else { break };
                    let Some(g) = self.node(p).parent else { break };
                    self.node_mut(p).red = false;
                    self.node_mut(g).red = true;
                    self.rotate_right(bucket, g);
                }
            } else {
                let uncle = self.node(g).left;
                if self.is_red(uncle) {
                    self.set_black(Some(p));
                    self.set_black(uncle);
                    self.node_mut(g).red = true;
                    z = g;
                } else {
                    if self.node(p).left == Some(z) {
                        z = p;
                        self.rotate_right(bucket, z);
                    }
                    let Some(p) = self.node(z).parent else { break };
                    let Some(g) = self.node(p).parent else { break };
                    self.node_mut(p).red = false;
                    self.node_mut(g).red = true;
                    self.rotate_left(bucket, g);
                }
            }
        }

        let root = self.roots[bucket];
        self.set_black(root);
    }

    fn delete(&mut self, z: u32) {
        let bucket = self.bucket(self.node(z).key);

        let mut removed_red = self.node(z).red;
        let x;
        let x_parent;

        let (z_left, z_right) = (self.node(z).left, self.node(z).right);
        match (z_left, z_right) {
            (None, _) => {
                x = z_right;
                x_parent = self.node(z).parent;
                self.replace_child(bucket, z, z_right);
            }
            (_, None) => {
                x = z_left;
                x_parent = self.node(z).parent;
                self.replace_child(bucket, z, z_left);
            }
            (Some(z_left), Some(z_right)) => {
                // successor takes z's place and color
                let y = self.minimum(z_right);
                removed_red = self.node(y).red;
                x = self.node(y).right;

                if self.node(y).parent == Some(z) {
                    x_parent = Some(y);
                } else {
                    x_parent = self.node(y).parent;
                    self.replace_child(bucket, y, x);
                    self.node_mut(y).right = Some(z_right);
                    self.node_mut(z_right).parent = Some(y);
                }

                self.replace_child(bucket, z, Some(y));
                self.node_mut(y).left = Some(z_left);
                self.node_mut(z_left).parent = Some(y);
                self.node_mut(y).red = self.node(z).red;
            }
        }

        if !removed_red {
            self.delete_fixup(bucket, x, x_parent);
        }

        *self.node_mut(z) = Node::default();
    }

    fn delete_fixup(&mut self, bucket: usize, mut x: Option<u32>, mut x_parent: Option<u32>) {
        while x != self.roots[bucket] && !self.is_red(x) {
            let Some(p) = x_parent else { break };

            if self.node(p).left == x {
                let mut w = self.node(p).right;
                if self.is_red(w) {
                    self.set_black(w);
                    self.node_mut(p).red = true;
                    self.rotate_left(bucket, p);
                    w = self.node(p).right;
                }
                // the sibling of a doubly black node always exists
                let Some(s) = w else { break };

                if !self.is_red(self.node(s).left) && !self.is_red(self.node(s).right) {
                    self.node_mut(s).red = true;
                    x = Some(p);
                    x_parent = self.node(p).parent;
                } else {
                    let mut s = s;
                    if !self.is_red(self.node(s).right) {
                        let s_left = self.node(s).left;
                        self.set_black(s_left);
                        self.node_mut(s).red = true;
                        self.rotate_right(bucket, s);
                        let Some(new_s) = self.node(p).right else { break };
                        s = new_s;
                    }
                    self.node_mut(s).red = self.node(p).red;
                    self.node_mut(p).red = false;
                    let s_right = self.node(s).right;
                    self.set_black(s_right);
                    self.rotate_left(bucket, p);
                    x = self.roots[bucket];
                    x_parent = None;
                }
            } else {
                let mut w = self.node(p).left;
                if self.is_red(w) {
                    self.set_black(w);
                    self.node_mut(p).red = true;
                    self.rotate_right(bucket, p);
                    w = self.node(p).left;
                }
                let Some(s) = w else { break };

                if !self.is_red(self.node(s).left) && !self.is_red(self.node(s).right) {
                    self.node_mut(s).red = true;
                    x = Some(p);
                    x_parent = self.node(p).parent;
                } else {
                    let mut s = s;
                    if !self.is_red(self.node(s).left) {
                        let s_right = self.node(s).right;
                        self.set_black(s_right);
                        self.node_mut(s).red = true;
                        self.rotate_left(bucket, s);
                        let Some(new_s) = self.node(p).left else { break };
                        s = new_s;
                    }
                    self.node_mut(s).red = self.node(p).red;
                    self.node_mut(p).red = false;
                    let s_left = self.node(s).left;
                    self.set_black(s_left);
                    self.rotate_right(bucket, p);
                    x = self.roots[bucket];
                    x_parent = None;
                }
            }
        }

        self.set_black(x);
    }

    /// Checks all red-black and search tree properties, returns the number of linked nodes
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> usize {
        fn check(
            forest: &RbForest,
            bucket: usize,
            node: Option<u32>,
            parent: Option<u32>,
            bounds: (Option<u64>, Option<u64>),
            count: &mut usize,
        ) -> usize {
            let Some(i) = node else { return 1 };
            let n = forest.node(i);

            assert!(n.linked, "node {} reachable but not linked", i);
            assert_eq!(n.parent, parent, "broken parent link at {}", i);
            assert_eq!(forest.bucket(n.key), bucket, "node {} in wrong bucket", i);
            if let Some(low) = bounds.0 {
                assert!(n.key >= low);
            }
            if let Some(high) = bounds.1 {
                assert!(n.key < high);
            }
            if n.red {
                assert!(!forest.is_red(n.left) && !forest.is_red(n.right), "red node {} has red child", i);
            }

            *count += 1;
            let left = check(forest, bucket, n.left, Some(i), (bounds.0, Some(n.key)), count);
            let right = check(forest, bucket, n.right, Some(i), (Some(n.key), bounds.1), count);
            assert_eq!(left, right, "black height differs below {}", i);

            left + if n.red { 0 } else { 1 }
        }

        let mut count = 0;
        for (bucket, root) in self.roots.iter().enumerate() {
            assert!(!self.is_red(*root), "red root in bucket {}", bucket);
            check(self, bucket, *root, None, (None, None), &mut count);
        }

        assert_eq!(count, self.nodes.iter().filter(|n| n.linked).count());
        count
    }
}

impl SlotIndex for RbForest {
    fn grow(&mut self, capacity: usize) {
        debug_assert!(capacity >= self.nodes.len());
        self.nodes.resize(capacity, Node::default());
    }

    fn find(&self, key: u64) -> Option<u32> {
        let mut cur = self.roots[self.bucket(key)];
        while let Some(c) = cur {
            let node = self.node(c);
            if key == node.key {
                return Some(c);
            }
            cur = if key < node.key { node.left } else { node.right };
        }
        None
    }

    fn link(&mut self, index: u32, key: u64) {
        debug_assert!(!self.node(index).linked, "slot {} linked twice", index);
        debug_assert!(self.find(key).is_none(), "duplicate key {:#x}", key);
        self.insert(index, key);
    }

    fn unlink(&mut self, index: u32) {
        if self.node(index).linked {
            self.delete(index);
        }
    }
}
