// SPDX-License-Identifier: CEPL-1.0
//! Demo scene and a display-only triangulation: every loop is fanned from
//! its first point. Correct for convex loops, approximate otherwise.
use glam::DVec2;
use meshview_render::{PolygonSet, PolygonTree, Triangulation};

/// Outer square, a hole, and a separate triangle, in logical pixels.
pub fn default_polygons() -> Vec<Vec<[f64; 2]>> {
    vec![
        vec![[80.0, 80.0], [420.0, 80.0], [420.0, 420.0], [80.0, 420.0]],
        vec![[180.0, 180.0], [180.0, 320.0], [320.0, 320.0], [320.0, 180.0]],
        vec![[500.0, 120.0], [700.0, 160.0], [560.0, 380.0]],
    ]
}

pub fn polygon_set(loops: &[Vec<[f64; 2]>]) -> PolygonSet {
    PolygonSet::new(
        loops
            .iter()
            .map(|l| l.iter().map(|&[x, y]| DVec2::new(x, y)).collect())
            .collect(),
    )
}

fn signed_area(points: &[DVec2]) -> f64 {
    let n = points.len();
    (0..n)
        .map(|i| points[i].perp_dot(points[(i + 1) % n]))
        .sum::<f64>()
        * 0.5
}

fn winding(points: &[DVec2]) -> i32 {
    let a = signed_area(points);
    if a > 0.0 {
        1
    } else if a < 0.0 {
        -1
    } else {
        0
    }
}

pub fn fan_triangulation(polygons: &PolygonSet) -> Triangulation {
    let mut out = Triangulation::default();
    for points in &polygons.polygons {
        let base = out.vertices.len() as u32;
        let n = points.len() as u32;
        out.vertices.extend_from_slice(points);
        out.triangles
            .extend((1..n.saturating_sub(1)).map(|i| [base, base + i, base + i + 1]));
        out.polygon_tree.push(PolygonTree {
            net_winding: winding(points),
            vertex_indices: (base..base + n).collect(),
            children: Vec::new(),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fans_every_loop() {
        let set = polygon_set(&default_polygons());
        let t = fan_triangulation(&set);
        assert_eq!(t.vertices.len(), 11);
        // 2 + 2 + 1
        assert_eq!(t.triangles.len(), 5);
        assert_eq!(t.triangles[2], [4, 5, 6]);
        assert_eq!(t.debug_polygon_count(), 3);
        assert!(t
            .triangles
            .iter()
            .flatten()
            .all(|&i| (i as usize) < t.vertices.len()));
    }

    #[test]
    fn winding_follows_orientation() {
        let t = fan_triangulation(&polygon_set(&default_polygons()));
        let windings: Vec<i32> = t.polygon_tree.iter().map(|p| p.net_winding).collect();
        assert_eq!(windings, vec![1, -1, 1]);
    }

    #[test]
    fn degenerate_loops_add_no_triangles() {
        let set = polygon_set(&[vec![[0.0, 0.0]], vec![[0.0, 0.0], [1.0, 1.0]], vec![]]);
        let t = fan_triangulation(&set);
        assert!(t.triangles.is_empty());
        assert_eq!(t.vertices.len(), 3);
        assert_eq!(t.polygon_tree[1].vertex_indices, vec![1, 2]);
        assert_eq!(t.polygon_tree[1].net_winding, 0);
    }
}
