//! Hand-rolled KD-tree over the 4-D peer-selection space.
//!
//! Peers are projected to `(pingMs*1.0, hops*0.7, geoKm*0.2, (100-score)*1.2)`
//! (score inverted so lower is always closer to ideal) and indexed so the
//! peer nearest the origin — the "ideal" peer — can be found without a full
//! scan. Rebuilt from scratch on every registry mutation; no incremental
//! balancing.

const DIMS: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct Point(pub [f64; DIMS]);

impl Point {
    pub fn from_metrics(ping_ms: f64, hops: u32, geo_km: f64, score: f64) -> Self {
        Point([
            ping_ms * 1.0,
            hops as f64 * 0.7,
            geo_km * 0.2,
            (100.0 - score) * 1.2,
        ])
    }

    fn distance_sq(&self, other: &Point) -> f64 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum()
    }
}

struct Node {
    point: Point,
    index: usize,
    axis: usize,
    left: Option<Box<Node>>,
    right: Option<Box<Node>>,
}

/// Indexes a fixed set of `(Point, original index)` pairs for nearest-origin
/// queries. `index` lets callers map a hit back to their own peer list.
pub struct KdTree {
    root: Option<Box<Node>>,
    len: usize,
}

impl KdTree {
    pub fn empty() -> Self {
        Self { root: None, len: 0 }
    }

    /// Build a tree from `points`, indexed by their position in the slice.
    /// Ties in the median split are broken by the original (insertion)
    /// order, so construction is deterministic.
    pub fn build(points: &[Point]) -> Self {
        let mut items: Vec<(usize, Point)> = points.iter().copied().enumerate().collect();
        let len = items.len();
        let root = Self::build_recursive(&mut items, 0);
        Self { root, len }
    }

    fn build_recursive(items: &mut [(usize, Point)], depth: usize) -> Option<Box<Node>> {
        if items.is_empty() {
            return None;
        }
        let axis = depth % DIMS;
        items.sort_by(|a, b| {
            a.1 .0[axis]
                .partial_cmp(&b.1 .0[axis])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        let mid = items.len() / 2;
        let (left_items, rest) = items.split_at_mut(mid);
        let (median, right_items) = rest.split_first_mut().expect("non-empty slice has a median");

        let left = Self::build_recursive(left_items, depth + 1);
        let right = Self::build_recursive(right_items, depth + 1);

        Some(Box::new(Node {
            point: median.1,
            index: median.0,
            axis,
            left,
            right,
        }))
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Nearest point to `target` by Euclidean distance; ties are broken by
    /// the smaller original index (stable under insertion order).
    pub fn nearest(&self, target: &Point) -> Option<usize> {
        let root = self.root.as_deref()?;
        let mut best_index = root.index;
        let mut best_dist = root.point.distance_sq(target);
        Self::search(root, target, &mut best_index, &mut best_dist);
        Some(best_index)
    }

    fn search(node: &Node, target: &Point, best_index: &mut usize, best_dist: &mut f64) {
        let d = node.point.distance_sq(target);
        if d < *best_dist || (d == *best_dist && node.index < *best_index) {
            *best_dist = d;
            *best_index = node.index;
        }

        let axis = node.axis;
        let diff = target.0[axis] - node.point.0[axis];
        let (near, far) = if diff < 0.0 {
            (&node.left, &node.right)
        } else {
            (&node.right, &node.left)
        };

        if let Some(near) = near {
            Self::search(near, target, best_index, best_dist);
        }
        if diff * diff < *best_dist {
            if let Some(far) = far {
                Self::search(far, target, best_index, best_dist);
            }
        }
    }

    /// The `n` nearest points to `target`, sorted closest-first. A simple
    /// full-tree gather-then-sort; registries are expected to stay small
    /// (hundreds to low thousands of peers), so this is adequate.
    pub fn nearest_n(&self, target: &Point, n: usize) -> Vec<usize> {
        let mut all = Vec::with_capacity(self.len);
        if let Some(root) = &self.root {
            Self::collect(root, &mut all);
        }
        all.sort_by(|a, b| {
            let da = a.1.distance_sq(target);
            let db = b.1.distance_sq(target);
            da.partial_cmp(&db)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        all.into_iter().take(n).map(|(i, _)| i).collect()
    }

    fn collect<'a>(node: &'a Node, out: &mut Vec<(usize, Point)>) {
        out.push((node.index, node.point));
        if let Some(left) = &node.left {
            Self::collect(left, out);
        }
        if let Some(right) = &node.right {
            Self::collect(right, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_has_no_nearest() {
        let tree = KdTree::build(&[]);
        assert!(tree.is_empty());
        assert_eq!(tree.nearest(&Point([0.0; 4])), None);
    }

    #[test]
    fn finds_exact_match() {
        let points = vec![
            Point::from_metrics(50.0, 3, 200.0, 80.0),
            Point::from_metrics(5.0, 1, 10.0, 95.0),
            Point::from_metrics(500.0, 10, 5000.0, 10.0),
        ];
        let tree = KdTree::build(&points);
        let nearest = tree.nearest(&Point([0.0; 4])).unwrap();
        assert_eq!(nearest, 1); // the lowest-ping, highest-score point
    }

    #[test]
    fn nearest_n_orders_by_distance() {
        let points = vec![
            Point::from_metrics(100.0, 2, 50.0, 60.0),
            Point::from_metrics(10.0, 1, 5.0, 90.0),
            Point::from_metrics(30.0, 1, 20.0, 85.0),
        ];
        let tree = KdTree::build(&points);
        let ranked = tree.nearest_n(&Point([0.0; 4]), 2);
        assert_eq!(ranked, vec![1, 2]);
    }

    #[test]
    fn ties_broken_by_insertion_order() {
        let points = vec![Point([1.0, 1.0, 1.0, 1.0]), Point([1.0, 1.0, 1.0, 1.0])];
        let tree = KdTree::build(&points);
        assert_eq!(tree.nearest(&Point([0.0; 4])), Some(0));
    }
}
