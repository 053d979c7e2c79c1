// SPDX-License-Identifier: CEPL-1.0
//! Geometry snapshot handed over by the host on every render call.
//!
//! None of these types are cached by the renderer; each call packs whatever
//! it is given (see [`crate::frame::FrameGeometry`]).
use glam::DVec2;

/// Ordered list of closed loops. The last point of a loop connects back to
/// the first one.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PolygonSet {
    pub polygons: Vec<Vec<DVec2>>,
}

impl PolygonSet {
    pub fn new(polygons: Vec<Vec<DVec2>>) -> Self {
        Self { polygons }
    }

    pub fn is_empty(&self) -> bool {
        self.point_count() == 0
    }

    /// Total number of points across all loops.
    pub fn point_count(&self) -> usize {
        self.polygons.iter().map(Vec::len).sum()
    }

    /// Every loop expanded into explicit segments, closing edge included.
    pub fn edges(&self) -> impl Iterator<Item = (DVec2, DVec2)> + '_ {
        self.polygons.iter().flat_map(|polygon| {
            let n = polygon.len();
            (0..n).map(move |i| (polygon[i], polygon[(i + 1) % n]))
        })
    }
}

/// One node of the decomposition debug tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolygonTree {
    /// Signed winding count of the region bounded by this loop.
    pub net_winding: i32,
    /// Indices into [`Triangulation::vertices`].
    pub vertex_indices: Vec<u32>,
    pub children: Vec<PolygonTree>,
}

impl PolygonTree {
    /// Number of nodes in this subtree, itself included.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(PolygonTree::count).sum::<usize>()
    }

    fn visit<'a>(&'a self, out: &mut Vec<&'a PolygonTree>) {
        out.push(self);
        for child in &self.children {
            child.visit(out);
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Triangulation {
    pub vertices: Vec<DVec2>,
    pub polygon_tree: Vec<PolygonTree>,
    pub triangles: Vec<[u32; 3]>,
}

impl Triangulation {
    pub fn debug_polygon_count(&self) -> usize {
        self.polygon_tree.iter().map(PolygonTree::count).sum()
    }

    /// Pre-order walk over the whole forest: each parent comes before its
    /// children, roots in their stored order.
    pub fn debug_polygons(&self) -> Vec<&PolygonTree> {
        let mut out = Vec::with_capacity(self.debug_polygon_count());
        for root in &self.polygon_tree {
            root.visit(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<DVec2> {
        vec![
            DVec2::new(0.0, 0.0),
            DVec2::new(1.0, 0.0),
            DVec2::new(1.0, 1.0),
            DVec2::new(0.0, 1.0),
        ]
    }

    #[test]
    fn edges_close_every_loop() {
        let set = PolygonSet::new(vec![square(), vec![DVec2::new(5.0, 5.0)]]);
        let edges: Vec<_> = set.edges().collect();
        assert_eq!(edges.len(), 5);
        assert_eq!(edges[3], (DVec2::new(0.0, 1.0), DVec2::new(0.0, 0.0)));
        // a single point loop degenerates to a zero-length segment
        assert_eq!(edges[4], (DVec2::new(5.0, 5.0), DVec2::new(5.0, 5.0)));
    }

    #[test]
    fn empty_loops_contribute_nothing() {
        let set = PolygonSet::new(vec![Vec::new(), Vec::new()]);
        assert!(set.is_empty());
        assert_eq!(set.edges().count(), 0);
    }

    #[test]
    fn debug_polygons_are_preorder() {
        let leaf = |w| PolygonTree {
            net_winding: w,
            vertex_indices: vec![0, 1, 2],
            children: Vec::new(),
        };
        let tri = Triangulation {
            polygon_tree: vec![
                PolygonTree {
                    net_winding: 1,
                    vertex_indices: vec![0, 1, 2, 3],
                    children: vec![leaf(2), leaf(0)],
                },
                leaf(-1),
            ],
            ..Default::default()
        };
        assert_eq!(tri.debug_polygon_count(), 4);
        let windings: Vec<_> = tri.debug_polygons().iter().map(|p| p.net_winding).collect();
        assert_eq!(windings, vec![1, 2, 0, -1]);
    }
}
