//! Box-keyed spatial tree over indices.
//!
//! An octree that maps bounding boxes to `usize` payloads (vertex or
//! triangle indices). Entries that straddle an internal split stay at
//! that node, so removal and query never miss.

use crate::{BoundingBox, Vec3};

const MAX_LEAF_ENTRIES: usize = 16;
const MAX_DEPTH: u8 = 10;

#[derive(Debug, Clone, Copy)]
struct Entry {
    bbox: BoundingBox,
    index: usize,
}

#[derive(Debug, Clone)]
enum Node {
    Leaf(Vec<Entry>),
    Branch {
        // Entries whose box crosses the split planes of this node.
        straddlers: Vec<Entry>,
        children: Box<[Node; 8]>,
    },
}

impl Node {
    fn empty_leaf() -> Self {
        Node::Leaf(Vec::new())
    }
}

/// Spatial search tree mapping bounding boxes to indices.
#[derive(Debug, Clone)]
pub struct SpatialTree {
    bounds: BoundingBox,
    root: Node,
    count: usize,
}

fn child_bounds(bounds: &BoundingBox, octant: usize) -> BoundingBox {
    let mid = (bounds.min + bounds.max) * 0.5;
    let mut min = bounds.min;
    let mut max = mid;
    for axis in 0..3 {
        if octant & (1 << axis) != 0 {
            min[axis] = mid[axis];
            max[axis] = bounds.max[axis];
        }
    }
    BoundingBox::new(min, max)
}

fn octant_of(bounds: &BoundingBox, bbox: &BoundingBox) -> Option<usize> {
    let mid = (bounds.min + bounds.max) * 0.5;
    let mut octant = 0;
    for axis in 0..3 {
        if bbox.min[axis] >= mid[axis] {
            octant |= 1 << axis;
        } else if bbox.max[axis] >= mid[axis] {
            // Straddles the split plane on this axis.
            return None;
        }
    }
    Some(octant)
}

impl SpatialTree {
    /// A tree covering `bounds`. Entries outside the bounds are kept at
    /// the root and still found, only less efficiently.
    pub fn new(bounds: BoundingBox) -> Self {
        Self {
            bounds,
            root: Node::empty_leaf(),
            count: 0,
        }
    }

    /// Drop all entries and adopt new bounds.
    pub fn reset(&mut self, bounds: BoundingBox) {
        self.bounds = bounds;
        self.root = Node::empty_leaf();
        self.count = 0;
    }

    /// Drop all entries, keeping the bounds.
    pub fn clear(&mut self) {
        self.root = Node::empty_leaf();
        self.count = 0;
    }

    /// The bounds the tree was built over.
    pub fn bounds(&self) -> &BoundingBox {
        &self.bounds
    }

    /// Number of entries in the tree.
    pub fn len(&self) -> usize {
        self.count
    }

    /// True when the tree holds no entries.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Add an entry.
    pub fn add(&mut self, bbox: BoundingBox, index: usize) -> bool {
        let entry = Entry { bbox, index };
        let bounds = self.bounds;
        Self::add_to(&mut self.root, &bounds, entry, 0);
        self.count += 1;
        true
    }

    fn add_to(node: &mut Node, bounds: &BoundingBox, entry: Entry, depth: u8) {
        match node {
            Node::Leaf(entries) => {
                if entries.len() < MAX_LEAF_ENTRIES || depth >= MAX_DEPTH {
                    entries.push(entry);
                    return;
                }
                // Split: redistribute this leaf's entries into octants.
                let old = std::mem::take(entries);
                *node = Node::Branch {
                    straddlers: Vec::new(),
                    children: Box::new(std::array::from_fn(|_| Node::empty_leaf())),
                };
                for e in old {
                    Self::add_to(node, bounds, e, depth);
                }
                Self::add_to(node, bounds, entry, depth);
            }
            Node::Branch {
                straddlers,
                children,
            } => match octant_of(bounds, &entry.bbox) {
                Some(octant) => {
                    let cb = child_bounds(bounds, octant);
                    Self::add_to(&mut children[octant], &cb, entry, depth + 1);
                }
                None => straddlers.push(entry),
            },
        }
    }

    /// Remove the entry with this exact index whose stored box contains
    /// the given box's centre. Returns false when not present.
    pub fn remove(&mut self, bbox: &BoundingBox, index: usize) -> bool {
        let bounds = self.bounds;
        if Self::remove_from(&mut self.root, &bounds, bbox, index) {
            self.count -= 1;
            true
        } else {
            false
        }
    }

    fn remove_from(node: &mut Node, bounds: &BoundingBox, bbox: &BoundingBox, index: usize) -> bool {
        match node {
            Node::Leaf(entries) => {
                if let Some(pos) = entries.iter().position(|e| e.index == index) {
                    entries.swap_remove(pos);
                    return true;
                }
                false
            }
            Node::Branch {
                straddlers,
                children,
            } => {
                if let Some(pos) = straddlers.iter().position(|e| e.index == index) {
                    straddlers.swap_remove(pos);
                    return true;
                }
                match octant_of(bounds, bbox) {
                    Some(octant) => {
                        let cb = child_bounds(bounds, octant);
                        Self::remove_from(&mut children[octant], &cb, bbox, index)
                    }
                    None => false,
                }
            }
        }
    }

    /// Collect the indices of all entries whose boxes intersect `bbox`.
    pub fn find(&self, bbox: &BoundingBox) -> Vec<usize> {
        let mut hits = Vec::new();
        self.find_into(bbox, &mut hits);
        hits
    }

    /// As [`find`](Self::find), appending into a caller-owned vector.
    pub fn find_into(&self, bbox: &BoundingBox, hits: &mut Vec<usize>) {
        Self::find_in(&self.root, &self.bounds, bbox, hits);
    }

    fn find_in(node: &Node, bounds: &BoundingBox, bbox: &BoundingBox, hits: &mut Vec<usize>) {
        match node {
            Node::Leaf(entries) => {
                for e in entries {
                    if e.bbox.intersects(bbox) {
                        hits.push(e.index);
                    }
                }
            }
            Node::Branch {
                straddlers,
                children,
            } => {
                for e in straddlers {
                    if e.bbox.intersects(bbox) {
                        hits.push(e.index);
                    }
                }
                for (octant, child) in children.iter().enumerate() {
                    let cb = child_bounds(bounds, octant);
                    if cb.intersects(bbox) {
                        Self::find_in(child, &cb, bbox, hits);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_tree() -> SpatialTree {
        SpatialTree::new(BoundingBox::new(
            Vec3::new(0.0, 0.0, 0.0),
            Vec3::new(10.0, 10.0, 10.0),
        ))
    }

    #[test]
    fn test_add_find_remove() {
        let mut tree = unit_tree();
        let pt = Vec3::new(2.0, 2.0, 2.0);
        let bb = BoundingBox::from_point(&pt);
        tree.add(bb, 7);
        assert_eq!(tree.len(), 1);

        let hits = tree.find(&bb);
        assert_eq!(hits, vec![7]);

        assert!(tree.remove(&bb, 7));
        assert!(tree.is_empty());
        assert!(!tree.remove(&bb, 7));
    }

    #[test]
    fn test_split_and_query() {
        let mut tree = unit_tree();
        // Enough points to force several leaf splits.
        let mut n = 0;
        for i in 0..10 {
            for j in 0..10 {
                for k in 0..10 {
                    let pt = Vec3::new(i as f64, j as f64, k as f64);
                    tree.add(BoundingBox::from_point(&pt), n);
                    n += 1;
                }
            }
        }
        assert_eq!(tree.len(), 1000);

        let mut query = BoundingBox::from_point(&Vec3::new(5.0, 5.0, 5.0));
        query.grow(0.5);
        let hits = tree.find(&query);
        assert_eq!(hits.len(), 1);

        let mut wide = BoundingBox::from_point(&Vec3::new(5.0, 5.0, 5.0));
        wide.grow(1.0);
        let hits = tree.find(&wide);
        assert_eq!(hits.len(), 27);
    }

    #[test]
    fn test_straddling_entry_found() {
        let mut tree = unit_tree();
        // A box across the centre cannot descend into one octant.
        let mut bb = BoundingBox::from_point(&Vec3::new(5.0, 5.0, 5.0));
        bb.grow(1.0);
        // Force a branch first.
        for i in 0..40 {
            let pt = Vec3::new(0.1 + 0.01 * i as f64, 0.1, 0.1);
            tree.add(BoundingBox::from_point(&pt), 100 + i);
        }
        tree.add(bb, 1);
        let hits = tree.find(&BoundingBox::from_point(&Vec3::new(5.5, 5.5, 5.5)));
        assert_eq!(hits, vec![1]);
    }

    #[test]
    fn test_reset_clears() {
        let mut tree = unit_tree();
        tree.add(BoundingBox::from_point(&Vec3::new(1.0, 1.0, 1.0)), 0);
        tree.reset(BoundingBox::new(Vec3::zeros(), Vec3::new(1.0, 1.0, 1.0)));
        assert!(tree.is_empty());
    }
}
