use super::{Overlap, RegionBackend, RegionTracker};
use crate::region::{MatchFlags, Region};

struct Node {
    region: Region,
    left: Option<usize>,
    right: Option<usize>,
}

/// Top-down splay tree keyed by virtual start address. Nodes live in an
/// arena; lookups splay the touched key to the root, so repeated accesses to
/// the same region stay cheap.
#[derive(Default)]
pub struct SplayTracker {
    nodes: Vec<Node>,
    free: Vec<usize>,
    root: Option<usize>,
    len: usize,
}

impl SplayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(&self, node: usize) -> usize {
        self.nodes[node].region.va_start
    }

    fn alloc(&mut self, region: Region) -> usize {
        let node = Node {
            region,
            left: None,
            right: None,
        };
        match self.free.pop() {
            Some(index) => {
                self.nodes[index] = node;
                index
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    /// Splays the subtree rooted at `t` around `key` and returns the new root:
    /// the node holding `key`, or the last node visited looking for it.
    fn splay_from(&mut self, mut t: usize, key: usize) -> usize {
        let mut left_root = None;
        let mut right_root = None;
        let mut left_max: Option<usize> = None;
        let mut right_min: Option<usize> = None;

        loop {
            if key < self.key(t) {
                let Some(mut l) = self.nodes[t].left else {
                    break;
                };
                if key < self.key(l) {
                    // rotate right
                    self.nodes[t].left = self.nodes[l].right;
                    self.nodes[l].right = Some(t);
                    t = l;
                    match self.nodes[t].left {
                        Some(next) => l = next,
                        None => break,
                    }
                }
                // link right
                match right_min {
                    Some(r) => self.nodes[r].left = Some(t),
                    None => right_root = Some(t),
                }
                right_min = Some(t);
                t = l;
            } else if key > self.key(t) {
                let Some(mut r) = self.nodes[t].right else {
                    break;
                };
                if key > self.key(r) {
                    // rotate left
                    self.nodes[t].right = self.nodes[r].left;
                    self.nodes[r].left = Some(t);
                    t = r;
                    match self.nodes[t].right {
                        Some(next) => r = next,
                        None => break,
                    }
                }
                // link left
                match left_max {
                    Some(l) => self.nodes[l].right = Some(t),
                    None => left_root = Some(t),
                }
                left_max = Some(t);
                t = r;
            } else {
                break;
            }
        }

        match left_max {
            Some(l) => self.nodes[l].right = self.nodes[t].left,
            None => left_root = self.nodes[t].left,
        }
        match right_min {
            Some(r) => self.nodes[r].left = self.nodes[t].right,
            None => right_root = self.nodes[t].right,
        }
        self.nodes[t].left = left_root;
        self.nodes[t].right = right_root;
        t
    }

    fn splay(&mut self, key: usize) -> Option<usize> {
        let root = self.root?;
        let root = self.splay_from(root, key);
        self.root = Some(root);
        Some(root)
    }

    fn rightmost(&self, mut node: usize) -> usize {
        while let Some(next) = self.nodes[node].right {
            node = next;
        }
        node
    }

    /// Largest key `<= key`.
    fn floor(&mut self, key: usize) -> Option<usize> {
        let root = self.splay(key)?;
        if self.key(root) <= key {
            Some(root)
        } else {
            self.nodes[root].left.map(|l| self.rightmost(l))
        }
    }

    fn exact(&mut self, key: usize) -> Option<usize> {
        let root = self.splay(key)?;
        if self.key(root) == key {
            Some(root)
        } else {
            None
        }
    }

    fn matching(&mut self, region: &Region, flags: MatchFlags) -> Option<usize> {
        let node = self.exact(region.va_start)?;
        if flags.matches(&self.nodes[node].region, region) {
            Some(node)
        } else {
            None
        }
    }

    /// In-order regions whose start lies in `[start, end)`.
    fn starting_in(&self, start: usize, end: usize) -> Vec<&Region> {
        let mut out = Vec::new();
        let mut stack = Vec::new();
        let mut cursor = self.root;
        loop {
            while let Some(node) = cursor {
                stack.push(node);
                cursor = if self.key(node) > start {
                    self.nodes[node].left
                } else {
                    None
                };
            }
            let Some(node) = stack.pop() else {
                break;
            };
            let key = self.key(node);
            if key >= end {
                break;
            }
            if key >= start {
                out.push(&self.nodes[node].region);
            }
            cursor = self.nodes[node].right;
        }
        out
    }
}

impl RegionTracker for SplayTracker {
    fn backend(&self) -> RegionBackend {
        RegionBackend::SplayTree
    }

    fn insert(&mut self, region: Region) {
        let key = region.va_start;
        let Some(root) = self.splay(key) else {
            let node = self.alloc(region);
            self.root = Some(node);
            self.len += 1;
            return;
        };
        if self.key(root) == key {
            self.nodes[root].region = region;
            return;
        }
        let node = self.alloc(region);
        if key < self.key(root) {
            self.nodes[node].left = self.nodes[root].left.take();
            self.nodes[node].right = Some(root);
        } else {
            self.nodes[node].right = self.nodes[root].right.take();
            self.nodes[node].left = Some(root);
        }
        self.root = Some(node);
        self.len += 1;
    }

    fn remove(&mut self, region: &Region, flags: MatchFlags) -> Option<Region> {
        let node = self.matching(region, flags)?;
        let removed = self.nodes[node].region;
        self.root = match self.nodes[node].left {
            None => self.nodes[node].right,
            Some(left) => {
                // Every key on the left is smaller, so the maximum ends up at
                // the root with no right child.
                let new_root = self.splay_from(left, region.va_start);
                self.nodes[new_root].right = self.nodes[node].right;
                Some(new_root)
            }
        };
        self.nodes[node].left = None;
        self.nodes[node].right = None;
        self.free.push(node);
        self.len -= 1;
        Some(removed)
    }

    fn check_overlap(&mut self, region: &Region) -> Overlap {
        let predecessor = match self.floor(region.va_start) {
            Some(node) if self.key(node) < region.va_start => Some(self.nodes[node].region),
            _ => None,
        };
        let following = self.starting_in(region.va_start, region.end());
        Overlap::classify(region, predecessor.iter().chain(following))
    }

    fn find_region_at(&mut self, address: usize) -> Option<&mut Region> {
        let node = self.floor(address)?;
        let region = &mut self.nodes[node].region;
        if region.contains_address(address) {
            Some(region)
        } else {
            None
        }
    }

    fn contains(&mut self, region: &Region, flags: MatchFlags) -> Option<&mut Region> {
        let node = self.matching(region, flags)?;
        Some(&mut self.nodes[node].region)
    }

    fn len(&self) -> usize {
        self.len
    }

    fn regions(&self) -> Vec<Region> {
        self.starting_in(0, usize::MAX)
            .into_iter()
            .copied()
            .chain(self.exact_max())
            .collect()
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = None;
        self.len = 0;
    }
}

impl SplayTracker {
    /// A region starting at `usize::MAX` falls outside `starting_in(0, MAX)`.
    fn exact_max(&self) -> Option<Region> {
        let root = self.root?;
        let node = self.rightmost(root);
        (self.key(node) == usize::MAX).then(|| self.nodes[node].region)
    }
}
