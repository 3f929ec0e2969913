//! Clean-up shared by both extractors.
//!
//! The raw output of an extractor is an indexed triangle soup that may contain
//! small closed pockets, nested shells and locally flipped triangles. The
//! passes here work on triangle adjacency built from a sorted edge list, so
//! non-manifold edges (three or more triangles) are represented faithfully
//! and simply never traversed.

use crate::geometry::ray_triangle;
use crate::types::TriangleMesh;
use nalgebra::{Point3, Vector3};
use tracing::debug;

/// Probe directions for the inside test. Skewed so that axis-aligned input
/// rarely hits an edge exactly.
const PROBE_DIRECTIONS: [[f64; 3]; 6] = [
    [1.0, 0.0123, 0.0371],
    [-1.0, 0.0211, -0.0137],
    [0.0173, 1.0, 0.0291],
    [-0.0313, -1.0, 0.0119],
    [0.0241, -0.0157, 1.0],
    [0.0107, 0.0337, -1.0],
];

/// Triangle soup with per-edge neighbor lists and component labels.
#[derive(Debug, Default)]
pub(crate) struct IsoSoup {
    pub vertices: Vec<Point3<f64>>,
    pub triangles: Vec<[u32; 3]>,
    deleted: Vec<bool>,
    /// Start of the shared neighbor list of edge `k` of triangle `t` at `3 * t + k`.
    first_neighbor: Vec<usize>,
    /// `-1` terminated lists of all triangles sharing an edge, the owner included.
    neighbors: Vec<i32>,
    triangle_group: Vec<i32>,
    groups: Vec<Vec<u32>>,
}

impl IsoSoup {
    pub fn new(vertices: Vec<Point3<f64>>, triangles: Vec<[u32; 3]>) -> Self {
        let deleted = vec![false; triangles.len()];
        Self {
            vertices,
            triangles,
            deleted,
            ..Self::default()
        }
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn num_live_triangles(&self) -> usize {
        self.deleted.iter().filter(|d| !**d).count()
    }

    /// Build the shared edge lists from a sorted edge array.
    pub fn build_neighbors(&mut self) {
        let num_triangles = self.triangles.len();
        let mut edges: Vec<(u32, u32, u32)> = Vec::with_capacity(3 * num_triangles);
        for (t, tri) in self.triangles.iter().enumerate() {
            if self.deleted[t] {
                continue;
            }
            for k in 0..3 {
                let (a, b) = (tri[k], tri[(k + 1) % 3]);
                edges.push((a.min(b), a.max(b), (3 * t + k) as u32));
            }
        }
        edges.sort_unstable();

        self.neighbors.clear();
        self.first_neighbor = vec![0; 3 * num_triangles];
        // deleted triangles point at an empty list
        self.neighbors.push(-1);

        let mut i = 0;
        while i < edges.len() {
            let mut j = i;
            while j < edges.len() && edges[j].0 == edges[i].0 && edges[j].1 == edges[i].1 {
                j += 1;
            }
            let start = self.neighbors.len();
            for e in &edges[i..j] {
                self.neighbors.push((e.2 / 3) as i32);
                self.first_neighbor[e.2 as usize] = start;
            }
            self.neighbors.push(-1);
            i = j;
        }
    }

    /// All triangles on edge `k` of `t`, including `t` itself.
    fn edge_list(&self, t: usize, k: usize) -> &[i32] {
        let start = self.first_neighbor[3 * t + k];
        let len = self.neighbors[start..]
            .iter()
            .position(|&n| n < 0)
            .unwrap_or(0);
        &self.neighbors[start..start + len]
    }

    /// The single other triangle across edge `k` of `t` when the edge is manifold.
    fn manifold_neighbor(&self, t: usize, k: usize) -> Option<usize> {
        let list = self.edge_list(t, k);
        if list.len() != 2 {
            return None;
        }
        list.iter()
            .map(|&n| n as usize)
            .find(|&n| n != t)
    }

    /// Label connected components, crossing manifold edges only.
    pub fn determine_groups(&mut self) {
        let num_triangles = self.triangles.len();
        self.triangle_group = vec![-1; num_triangles];
        self.groups.clear();

        let mut stack = Vec::new();
        for start in 0..num_triangles {
            if self.deleted[start] || self.triangle_group[start] >= 0 {
                continue;
            }
            let group = self.groups.len() as i32;
            let mut members = Vec::new();
            self.triangle_group[start] = group;
            stack.push(start);
            while let Some(t) = stack.pop() {
                members.push(t as u32);
                for k in 0..3 {
                    match self.manifold_neighbor(t, k) {
                        Some(n) if self.triangle_group[n] < 0 => {
                            self.triangle_group[n] = group;
                            stack.push(n);
                        }
                        _ => {}
                    }
                }
            }
            self.groups.push(members);
        }
    }

    fn delete_triangle(&mut self, t: usize) {
        for k in 0..3 {
            let start = self.first_neighbor[3 * t + k];
            let mut end = start;
            let mut pos = None;
            while self.neighbors[end] >= 0 {
                if self.neighbors[end] == t as i32 {
                    pos = Some(end);
                }
                end += 1;
            }
            if let Some(pos) = pos {
                self.neighbors[pos] = self.neighbors[end - 1];
                self.neighbors[end - 1] = -1;
            }
        }
        self.deleted[t] = true;
        self.triangle_group[t] = -1;
    }

    fn delete_group(&mut self, group: usize) {
        let members = std::mem::take(&mut self.groups[group]);
        for &t in &members {
            self.delete_triangle(t as usize);
        }
    }

    /// Delete groups of at most `max_size` triangles. Returns the number removed.
    pub fn remove_bubbles(&mut self, max_size: usize) -> usize {
        let mut removed = 0;
        for g in 0..self.groups.len() {
            let size = self.groups[g].len();
            if size == 0 || size > max_size {
                continue;
            }
            self.delete_group(g);
            removed += 1;
        }
        self.drop_empty_groups();
        removed
    }

    /// Keep only the `keep` groups with the most triangles.
    pub fn keep_biggest_groups(&mut self, keep: usize) -> usize {
        if keep == 0 || self.groups.len() <= keep {
            return 0;
        }
        let mut order: Vec<usize> = (0..self.groups.len()).collect();
        order.sort_by_key(|&g| std::cmp::Reverse(self.groups[g].len()));
        let removed = order.len() - keep;
        for &g in &order[keep..] {
            self.delete_group(g);
        }
        self.drop_empty_groups();
        removed
    }

    /// Delete groups that lie inside another group.
    ///
    /// A group counts as enclosed by another when a strict majority of the
    /// probe rays from one of its points cross the other group an odd number
    /// of times.
    pub fn discard_inner_groups(&mut self) -> usize {
        let n = self.groups.len();
        if n < 2 {
            return 0;
        }
        let mut inner = vec![false; n];
        for g in 0..n {
            let Some(&probe_triangle) = self.groups[g].first() else {
                continue;
            };
            let origin = self.triangle_center(probe_triangle as usize);
            inner[g] = (0..n).any(|h| h != g && self.is_enclosed_by(&origin, h));
        }

        let mut removed = 0;
        for (g, is_inner) in inner.into_iter().enumerate() {
            if is_inner {
                self.delete_group(g);
                removed += 1;
            }
        }
        self.drop_empty_groups();
        removed
    }

    fn is_enclosed_by(&self, origin: &Point3<f64>, group: usize) -> bool {
        let mut votes = 0;
        for d in &PROBE_DIRECTIONS {
            let dir = Vector3::new(d[0], d[1], d[2]);
            let crossings = self.groups[group]
                .iter()
                .filter(|&&t| {
                    let [a, b, c] = self.triangles[t as usize];
                    ray_triangle(
                        origin,
                        &dir,
                        &self.vertices[a as usize],
                        &self.vertices[b as usize],
                        &self.vertices[c as usize],
                    )
                    .is_some_and(|hit| hit.t > 0.0)
                })
                .count();
            if crossings % 2 == 1 {
                votes += 1;
            }
        }
        votes * 2 > PROBE_DIRECTIONS.len()
    }

    fn triangle_center(&self, t: usize) -> Point3<f64> {
        let [a, b, c] = self.triangles[t];
        Point3::from(
            (self.vertices[a as usize].coords
                + self.vertices[b as usize].coords
                + self.vertices[c as usize].coords)
                / 3.0,
        )
    }

    fn drop_empty_groups(&mut self) {
        self.groups.retain(|g| !g.is_empty());
        for (g, members) in self.groups.iter().enumerate() {
            for &t in members {
                self.triangle_group[t as usize] = g as i32;
            }
        }
    }

    /// Make the winding consistent across manifold edges.
    ///
    /// Each component takes the winding of its first triangle; closed
    /// components with negative volume are then turned inside out.
    pub fn fix_orientations(&mut self) {
        let num_triangles = self.triangles.len();
        // 0 = not visited, 1 = keep, 2 = flip
        let mut marks = vec![0u8; num_triangles];
        let mut stack = Vec::new();

        for start in 0..num_triangles {
            if self.deleted[start] || marks[start] != 0 {
                continue;
            }
            marks[start] = 1;
            stack.push(start);
            while let Some(t) = stack.pop() {
                for k in 0..3 {
                    let Some(adj) = self.manifold_neighbor(t, k) else {
                        continue;
                    };
                    if marks[adj] != 0 {
                        continue;
                    }
                    let tri = self.triangles[t];
                    let (i0, i1) = if marks[t] == 1 {
                        (tri[k], tri[(k + 1) % 3])
                    } else {
                        (tri[(k + 1) % 3], tri[k])
                    };
                    let other = self.triangles[adj];
                    let same_direction = (0..3).any(|m| other[m] == i0 && other[(m + 1) % 3] == i1);
                    marks[adj] = if same_direction { 2 } else { 1 };
                    stack.push(adj);
                }
            }
        }

        let mut flipped = 0usize;
        for (t, mark) in marks.iter().enumerate() {
            if *mark == 2 {
                self.triangles[t].swap(0, 1);
                flipped += 1;
            }
        }

        for g in 0..self.groups.len() {
            if !self.is_group_closed(g) || self.group_volume(g) >= 0.0 {
                continue;
            }
            for &t in &self.groups[g] {
                self.triangles[t as usize].swap(0, 1);
            }
        }
        debug!(
            target: "mesh_kernel::mesh_state",
            flipped, "Orientation fixed"
        );
    }

    fn is_group_closed(&self, group: usize) -> bool {
        self.groups[group]
            .iter()
            .all(|&t| (0..3).all(|k| self.manifold_neighbor(t as usize, k).is_some()))
    }

    fn group_volume(&self, group: usize) -> f64 {
        self.groups[group]
            .iter()
            .map(|&t| {
                let [a, b, c] = self.triangles[t as usize];
                let (a, b, c) = (
                    self.vertices[a as usize].coords,
                    self.vertices[b as usize].coords,
                    self.vertices[c as usize].coords,
                );
                a.dot(&b.cross(&c))
            })
            .sum::<f64>()
            / 6.0
    }

    /// Drop deleted triangles and unreferenced vertices, renumbering densely.
    pub fn compress(self) -> TriangleMesh {
        let mut remap = vec![u32::MAX; self.vertices.len()];
        let mut positions = Vec::new();
        let mut triangles = Vec::with_capacity(self.triangles.len());
        for (t, tri) in self.triangles.iter().enumerate() {
            if self.deleted[t] {
                continue;
            }
            let mut out = [0u32; 3];
            for k in 0..3 {
                let v = tri[k] as usize;
                if remap[v] == u32::MAX {
                    remap[v] = positions.len() as u32;
                    positions.push(self.vertices[v]);
                }
                out[k] = remap[v];
            }
            triangles.push(out);
        }
        TriangleMesh::from_parts(&positions, &triangles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cube_soup(offset: f64, size: f64) -> (Vec<Point3<f64>>, Vec<[u32; 3]>) {
        let min = Point3::new(offset, offset, offset);
        let max = Point3::new(offset + size, offset + size, offset + size);
        let mesh = TriangleMesh::cuboid(min, max);
        (mesh.positions(), mesh.triangles)
    }

    fn merged(parts: &[(Vec<Point3<f64>>, Vec<[u32; 3]>)]) -> IsoSoup {
        let mut vertices = Vec::new();
        let mut triangles = Vec::new();
        for (v, t) in parts {
            let base = vertices.len() as u32;
            vertices.extend_from_slice(v);
            triangles.extend(t.iter().map(|t| [t[0] + base, t[1] + base, t[2] + base]));
        }
        let mut soup = IsoSoup::new(vertices, triangles);
        soup.build_neighbors();
        soup.determine_groups();
        soup
    }

    #[test]
    fn test_groups_and_neighbors() {
        let soup = merged(&[cube_soup(0.0, 1.0), cube_soup(5.0, 1.0)]);
        assert_eq!(soup.num_groups(), 2);
        for t in 0..soup.triangles.len() {
            for k in 0..3 {
                let n = soup.manifold_neighbor(t, k);
                assert!(n.is_some());
                let n = n.unwrap_or(0);
                assert!((0..3).any(|m| soup.manifold_neighbor(n, m) == Some(t)));
            }
        }
    }

    #[test]
    fn test_non_manifold_edges_split_groups() {
        // three triangles sharing one edge
        let vertices = vec![
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.5, 1.0, 0.0),
            Point3::new(0.5, -1.0, 0.0),
            Point3::new(0.5, 0.0, 1.0),
        ];
        let mut soup = IsoSoup::new(vertices, vec![[0, 1, 2], [1, 0, 3], [0, 1, 4]]);
        soup.build_neighbors();
        assert_eq!(soup.edge_list(0, 0).len(), 3);
        assert_eq!(soup.manifold_neighbor(0, 0), None);
        soup.determine_groups();
        assert_eq!(soup.num_groups(), 3);
    }

    #[test]
    fn test_remove_bubbles_and_keep_biggest() {
        let mut soup = merged(&[cube_soup(0.0, 1.0), cube_soup(5.0, 1.0)]);
        assert_eq!(soup.remove_bubbles(11), 0);
        assert_eq!(soup.remove_bubbles(12), 2);
        assert_eq!(soup.num_live_triangles(), 0);

        let mut soup = merged(&[cube_soup(0.0, 1.0), cube_soup(5.0, 1.0), cube_soup(9.0, 1.0)]);
        assert_eq!(soup.keep_biggest_groups(1), 2);
        assert_eq!(soup.num_groups(), 1);
        assert_eq!(soup.compress().triangle_count(), 12);
    }

    #[test]
    fn test_discard_inner_groups() {
        let mut soup = merged(&[cube_soup(0.0, 4.0), cube_soup(1.0, 1.0), cube_soup(10.0, 1.0)]);
        assert_eq!(soup.num_groups(), 3);
        assert_eq!(soup.discard_inner_groups(), 1);
        let mesh = soup.compress();
        assert_eq!(mesh.triangle_count(), 24);
        assert!(mesh.bounds().max.x > 10.0);
        assert!(mesh.bounds().min.x < 0.5);
    }

    #[test]
    fn test_fix_orientations_repairs_flips() {
        let (vertices, mut triangles) = cube_soup(0.0, 1.0);
        // start from an inside-out cube with two extra flipped faces
        for t in &mut triangles {
            t.swap(1, 2);
        }
        triangles[3].swap(0, 2);
        triangles[7].swap(1, 2);
        let mut soup = IsoSoup::new(vertices, triangles);
        soup.build_neighbors();
        soup.determine_groups();
        soup.fix_orientations();
        let mesh = soup.compress();
        assert!(mesh.border_edges().is_empty());
        assert!((mesh.signed_volume() - 1.0).abs() < 1e-12);
    }
}
