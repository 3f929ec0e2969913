//! Generalized marching cubes with exact edge intersections.
//!
//! Instead of resampling a density field, every grid line is intersected with
//! the registered triangles and a vertex is placed exactly where it pierces
//! the surface. A cell then knows which of its 12 edges are cut; flood-filling
//! its corners across the uncut edges yields up to 8 corner groups, and a
//! template keyed by the group labeling connects the cut vertices.
//!
//! Cells are stored sparsely, keyed by integer coordinates. A cell owns the
//! three edges leaving its minimum corner and the three faces touching it, so
//! neighboring cells always share the same vertex for a common edge or face.
//!
//! Cells where the surface ends (open input) get a single fan along the
//! boundary chain instead of a template.

use super::cube::{
    CENTER_VERTEX, EDGE_NEIGHBORS, FACE_EDGES, NUM_LOCAL_VERTICES, corner_groups, group_template,
};
use super::postprocess::IsoSoup;
use super::{IsoParams, IsoStats, IsosurfaceExtractor, finish_soup};
use crate::error::{KernelError, KernelResult};
use crate::progress::{HierarchicalProgress, ProgressListener, report_every};
use crate::tracing_ext::{OperationTimer, log_mesh_stats};
use crate::types::{Bounds, TriangleMesh};
use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
struct GeneralizedCube {
    cell: [i32; 3],
    /// Vertices on the edges leaving the minimum corner along x, y, z.
    vert_refs: [i32; 3],
    /// Vertices on the faces through the minimum corner, normal to x, y, z.
    side_vertex: [i32; 3],
    /// Points where input triangle edges cross those faces.
    side_bounds: [Bounds; 3],
}

impl GeneralizedCube {
    fn new(cell: [i32; 3]) -> Self {
        Self {
            cell,
            vert_refs: [-1; 3],
            side_vertex: [-1; 3],
            side_bounds: [Bounds::empty(); 3],
        }
    }
}

/// Working state of one extraction.
struct CubeGrid {
    spacing: f64,
    inv_spacing: f64,
    cubes: Vec<GeneralizedCube>,
    index: HashMap<[i32; 3], u32>,
    vertices: Vec<Point3<f64>>,
    triangles: Vec<[u32; 3]>,
    dropped_cells: usize,
}

impl CubeGrid {
    fn new(spacing: f64) -> Self {
        Self {
            spacing,
            inv_spacing: 1.0 / spacing,
            cubes: Vec::new(),
            index: HashMap::new(),
            vertices: Vec::new(),
            triangles: Vec::new(),
            dropped_cells: 0,
        }
    }

    fn find(&self, cell: [i32; 3]) -> Option<usize> {
        self.index.get(&cell).map(|&i| i as usize)
    }

    fn create(&mut self, cell: [i32; 3]) -> usize {
        if let Some(nr) = self.find(cell) {
            return nr;
        }
        let nr = self.cubes.len();
        self.cubes.push(GeneralizedCube::new(cell));
        self.index.insert(cell, nr as u32);
        nr
    }

    fn neighbor(&self, nr: usize, offset: [i32; 3]) -> Option<usize> {
        let c = self.cubes[nr].cell;
        self.find([c[0] + offset[0], c[1] + offset[1], c[2] + offset[2]])
    }

    fn register_triangle(&mut self, p: &[Point3<f64>; 3]) {
        let mut bounds = Bounds::from_points(p.iter());
        bounds.fatten(0.001 * self.spacing);
        let n = (p[1] - p[0]).cross(&(p[2] - p[0]));
        let d = n.dot(&p[0].coords);

        let mut min = [0i32; 3];
        let mut max = [0i32; 3];
        for k in 0..3 {
            min[k] = (bounds.min[k] * self.inv_spacing).floor() as i32;
            max[k] = (bounds.max[k] * self.inv_spacing).floor() as i32 + 1;
        }

        // grid lines along dim0 piercing the triangle
        for dim0 in 0..3 {
            if n[dim0] == 0.0 {
                continue;
            }
            let dim1 = (dim0 + 1) % 3;
            let dim2 = (dim1 + 1) % 3;
            let edge_fn = |a: &Point3<f64>, b: &Point3<f64>, u: f64, v: f64| {
                (b[dim1] - a[dim1]) * (v - a[dim2]) - (u - a[dim1]) * (b[dim2] - a[dim2])
            };

            for c1 in min[dim1]..=max[dim1] {
                for c2 in min[dim2]..=max[dim2] {
                    let axis1 = c1 as f64 * self.spacing;
                    let axis2 = c2 as f64 * self.spacing;
                    let e = [
                        edge_fn(&p[0], &p[1], axis1, axis2),
                        edge_fn(&p[1], &p[2], axis1, axis2),
                        edge_fn(&p[2], &p[0], axis1, axis2),
                    ];
                    let inside = if n[dim0] > 0.0 {
                        e.iter().all(|&x| x >= 0.0)
                    } else {
                        e.iter().all(|&x| x <= 0.0)
                    };
                    if !inside {
                        continue;
                    }

                    let pos = (d - axis1 * n[dim1] - axis2 * n[dim2]) / n[dim0];
                    let mut coord = [0i32; 3];
                    coord[dim0] = (pos * self.inv_spacing).floor() as i32;
                    coord[dim1] = c1;
                    coord[dim2] = c2;

                    let nr = self.create(coord);
                    if self.cubes[nr].vert_refs[dim0] < 0 {
                        let mut vert = Point3::new(
                            coord[0] as f64 * self.spacing,
                            coord[1] as f64 * self.spacing,
                            coord[2] as f64 * self.spacing,
                        );
                        vert[dim0] = pos;
                        self.cubes[nr].vert_refs[dim0] = self.vertices.len() as i32;
                        self.vertices.push(vert);
                    }
                }
            }
        }

        // triangle edges crossing the minimum faces of cells
        for xi in min[0]..=max[0] {
            for yi in min[1]..=max[1] {
                for zi in min[2]..=max[2] {
                    let lo = Vector3::new(xi as f64, yi as f64, zi as f64) * self.spacing;
                    let hi = lo + Vector3::repeat(self.spacing);
                    for i in 0..3 {
                        let (q0, q1) = (p[i], p[(i + 1) % 3]);
                        for axis in 0..3 {
                            if q0[axis] == q1[axis] {
                                continue;
                            }
                            let t = (lo[axis] - q0[axis]) / (q1[axis] - q0[axis]);
                            if !(0.0..=1.0).contains(&t) {
                                continue;
                            }
                            let qt = q0 + (q1 - q0) * t;
                            let (a1, a2) = ((axis + 1) % 3, (axis + 2) % 3);
                            if lo[a1] <= qt[a1] && qt[a1] <= hi[a1] && lo[a2] <= qt[a2] && qt[a2] <= hi[a2] {
                                let nr = self.create([xi, yi, zi]);
                                self.cubes[nr].side_bounds[axis].include(&qt);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Make sure every cell with a vertex has the lower neighbors that share it.
    fn complete_cells(&mut self) {
        const LOWER: [[i32; 3]; 7] = [
            [-1, 0, 0],
            [-1, -1, 0],
            [0, -1, 0],
            [0, 0, -1],
            [-1, 0, -1],
            [-1, -1, -1],
            [0, -1, -1],
        ];
        let num_cubes = self.cubes.len();
        for i in 0..num_cubes {
            let c = self.cubes[i].cell;
            for o in &LOWER {
                self.create([c[0] + o[0], c[1] + o[1], c[2] + o[2]]);
            }
        }
    }

    /// Vertex numbers of the 12 cell edges, -1 where uncut or unknown.
    fn cube_edges(&self, nr: usize) -> [i32; 12] {
        let mut edges = [-1i32; 12];
        let own = &self.cubes[nr].vert_refs;
        edges[0] = own[0];
        edges[3] = own[1];
        edges[8] = own[2];

        let shared: [([i32; 3], [(usize, usize); 2]); 6] = [
            ([1, 0, 0], [(1, 1), (9, 2)]),
            ([0, 1, 0], [(2, 0), (11, 2)]),
            ([0, 0, 1], [(4, 0), (7, 1)]),
            ([1, 1, 0], [(10, 2), (10, 2)]),
            ([0, 1, 1], [(6, 0), (6, 0)]),
            ([1, 0, 1], [(5, 1), (5, 1)]),
        ];
        for (offset, refs) in &shared {
            if let Some(other) = self.neighbor(nr, *offset) {
                for &(edge, axis) in refs {
                    edges[edge] = self.cubes[other].vert_refs[axis];
                }
            }
        }
        edges
    }

    /// Cell and slot holding the vertex of local face `face`.
    fn face_owner(&self, nr: usize, face: usize) -> Option<(usize, usize)> {
        match face {
            0 => Some((nr, 0)),
            1 => self.neighbor(nr, [1, 0, 0]).map(|o| (o, 0)),
            2 => Some((nr, 1)),
            3 => self.neighbor(nr, [0, 1, 0]).map(|o| (o, 1)),
            4 => Some((nr, 2)),
            _ => self.neighbor(nr, [0, 0, 1]).map(|o| (o, 2)),
        }
    }

    fn create_triangles_for_cube(&mut self, nr: usize) {
        let edges = self.cube_edges(nr);
        if edges.iter().all(|&v| v < 0) {
            return;
        }

        let mut vert_nrs = [-1i32; NUM_LOCAL_VERTICES];
        vert_nrs[..12].copy_from_slice(&edges);

        let mut start_face: Option<usize> = None;
        for face in 0..6 {
            let Some((owner, slot)) = self.face_owner(nr, face) else {
                continue;
            };
            let mut pos = Vector3::zeros();
            let mut num = 0;
            for &e in &FACE_EDGES[face] {
                if edges[e] >= 0 {
                    pos += self.vertices[edges[e] as usize].coords;
                    num += 1;
                }
            }
            if num == 0 || num == 2 {
                continue;
            }
            pos /= num as f64;

            if num == 1 {
                start_face.get_or_insert(12 + face);
                let b = &self.cubes[owner].side_bounds[slot];
                if b.is_empty() {
                    continue;
                }
                // snap to the crossing point farthest from the lone edge vertex
                for k in 0..3 {
                    pos[k] = if (pos[k] - b.min[k]).abs() > (pos[k] - b.max[k]).abs() {
                        b.min[k]
                    } else {
                        b.max[k]
                    };
                }
            }

            if self.cubes[owner].side_vertex[slot] < 0 {
                self.cubes[owner].side_vertex[slot] = self.vertices.len() as i32;
                self.vertices.push(Point3::from(pos));
            }
            vert_nrs[12 + face] = self.cubes[owner].side_vertex[slot];
        }

        match start_face {
            Some(start) => self.fan_border_cell(start, &vert_nrs),
            None => self.fill_from_template(&edges, &mut vert_nrs),
        }
    }

    /// Fan along the longest chain of cut vertices reachable from the start face.
    fn fan_border_cell(&mut self, start: usize, vert_nrs: &[i32; NUM_LOCAL_VERTICES]) {
        let mut prev = [-1i32; NUM_LOCAL_VERTICES];
        let mut visited = [false; NUM_LOCAL_VERTICES];
        // (vertex, predecessor, depth)
        let mut stack: Vec<(usize, i32, i32)> = Vec::with_capacity(20);
        stack.push((start, -1, 0));

        let mut max_vert = start;
        let mut max_depth = -1;
        while let Some((v, from, depth)) = stack.pop() {
            if visited[v] {
                continue;
            }
            visited[v] = true;
            prev[v] = from;
            let depth = depth + 1;
            if depth > max_depth {
                max_depth = depth;
                max_vert = v;
            }

            let exists = |x: usize| vert_nrs[x] >= 0;
            if v < 12 {
                for half in [0, 4] {
                    let face = EDGE_NEIGHBORS[v][half] as usize;
                    if exists(face) {
                        if !visited[face] {
                            stack.push((face, v as i32, depth));
                        }
                    } else {
                        for &e in &EDGE_NEIGHBORS[v][half + 1..half + 4] {
                            let e = e as usize;
                            if exists(e) && !visited[e] {
                                stack.push((e, v as i32, depth));
                            }
                        }
                    }
                }
            } else {
                for &e in &FACE_EDGES[v - 12] {
                    if exists(e) && !visited[e] {
                        stack.push((e, v as i32, depth));
                    }
                }
            }
        }

        let mut chain = Vec::with_capacity(14);
        let mut v = max_vert as i32;
        while v >= 0 {
            if vert_nrs[v as usize] >= 0 {
                chain.push(vert_nrs[v as usize] as u32);
            }
            v = prev[v as usize];
        }
        for i in 0..chain.len().saturating_sub(2) {
            self.triangles.push([chain[0], chain[i + 1], chain[i + 2]]);
        }
    }

    fn fill_from_template(&mut self, edges: &[i32; 12], vert_nrs: &mut [i32; NUM_LOCAL_VERTICES]) {
        let mut cut = [false; 12];
        for (c, &v) in cut.iter_mut().zip(edges) {
            *c = v >= 0;
        }
        let template = group_template(&corner_groups(&cut));

        let missing = template
            .iter()
            .flatten()
            .any(|&l| l != CENTER_VERTEX && vert_nrs[l as usize] < 0);
        if missing {
            trace!("Cell without a valid template fan dropped");
            self.dropped_cells += 1;
            return;
        }

        let needs_center = template.iter().flatten().any(|&l| l == CENTER_VERTEX);
        if needs_center {
            let (sum, num) = edges
                .iter()
                .filter(|&&v| v >= 0)
                .fold((Vector3::zeros(), 0usize), |(s, n), &v| {
                    (s + self.vertices[v as usize].coords, n + 1)
                });
            vert_nrs[CENTER_VERTEX as usize] = self.vertices.len() as i32;
            self.vertices.push(Point3::from(sum / num as f64));
        }

        for t in template {
            self.triangles.push([
                vert_nrs[t[0] as usize] as u32,
                vert_nrs[t[1] as usize] as u32,
                vert_nrs[t[2] as usize] as u32,
            ]);
        }
    }
}

/// Isosurface extractor placing vertices at exact grid-line intersections.
#[derive(Debug, Clone)]
pub struct GeneralizedExtractor {
    params: IsoParams,
    bounds: Option<Bounds>,
    triangles: Vec<[Point3<f64>; 3]>,
    mesh: TriangleMesh,
    stats: IsoStats,
}

impl GeneralizedExtractor {
    /// Create an extractor; nothing is computed until [`IsosurfaceExtractor::extract`].
    pub fn new(params: IsoParams) -> Self {
        Self {
            params,
            bounds: None,
            triangles: Vec::new(),
            mesh: TriangleMesh::new(),
            stats: IsoStats::default(),
        }
    }

    /// Derive the grid spacing from this box instead of the registered triangles.
    pub fn set_bounds(&mut self, bounds: Bounds) {
        self.bounds = Some(bounds);
    }

    /// Number of registered triangles.
    pub fn num_registered(&self) -> usize {
        self.triangles.len()
    }
}

impl IsosurfaceExtractor for GeneralizedExtractor {
    fn add_triangle(&mut self, p0: &Point3<f64>, p1: &Point3<f64>, p2: &Point3<f64>) {
        self.triangles.push([*p0, *p1, *p2]);
    }

    fn extract(&mut self, progress: Option<&mut dyn ProgressListener>) -> KernelResult<()> {
        let params = self.params.validated()?;
        if self.triangles.is_empty() {
            return Err(KernelError::empty_mesh("no triangles registered").reported());
        }
        let _timer =
            OperationTimer::with_context("generalized_isosurface", self.triangles.len(), 0);
        let mut progress = HierarchicalProgress::new(100, progress);
        let mut stats = IsoStats::default();

        let bounds = self
            .bounds
            .unwrap_or_else(|| Bounds::from_points(self.triangles.iter().flatten()));
        let diagonal = bounds.diagonal();
        if diagonal <= 0.0 {
            debug!("Registered triangles have no extent, output is empty");
            self.mesh = TriangleMesh::new();
            self.stats = stats;
            return Ok(());
        }
        let mut grid = CubeGrid::new(diagonal / params.subdivision as f64);

        progress.set_subtask_work(20, Some("Register Triangles"));
        let n = self.triangles.len();
        for (i, t) in self.triangles.iter().enumerate() {
            grid.register_triangle(t);
            report_every(&mut progress, i, n, 0xff);
        }
        progress.complete_subtask();

        progress.set_subtask_work(10, Some("Complete Cells"));
        grid.complete_cells();
        progress.complete_subtask();

        progress.set_subtask_work(10, Some("Create Triangles"));
        let num_cubes = grid.cubes.len();
        for i in 0..num_cubes {
            grid.create_triangles_for_cube(i);
            report_every(&mut progress, i, num_cubes, 0x3ff);
        }
        stats.cells = num_cubes;
        progress.complete_subtask();
        debug!(
            cells = num_cubes,
            dropped = grid.dropped_cells,
            vertices = grid.vertices.len(),
            triangles = grid.triangles.len(),
            "Cell triangulation done"
        );

        let soup = IsoSoup::new(grid.vertices, grid.triangles);
        let mesh = finish_soup(soup, &params, &mut stats, &mut progress);
        log_mesh_stats(&mesh, "generalized isosurface");
        self.mesh = mesh;
        self.stats = stats;
        Ok(())
    }

    fn mesh(&self) -> &TriangleMesh {
        &self.mesh
    }

    fn stats(&self) -> &IsoStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shifted_cube() -> TriangleMesh {
        TriangleMesh::cuboid(Point3::new(0.05, 0.07, 0.09), Point3::new(1.05, 1.07, 1.09))
    }

    fn on_cube_surface(p: &Point3<f64>, min: &Point3<f64>, max: &Point3<f64>) -> bool {
        let eps = 1e-9;
        let inside = (0..3).all(|k| p[k] >= min[k] - eps && p[k] <= max[k] + eps);
        let on_face = (0..3).any(|k| (p[k] - min[k]).abs() < eps || (p[k] - max[k]).abs() < eps);
        inside && on_face
    }

    #[test]
    fn test_cube_vertices_lie_on_input() {
        let cube = shifted_cube();
        let mut extractor = GeneralizedExtractor::new(IsoParams::with_subdivision(4));
        extractor.add_mesh(&cube);
        assert!(extractor.extract(None).is_ok());

        let mesh = extractor.mesh();
        assert!(!mesh.is_empty());
        assert_eq!(extractor.stats().num_groups, 1);
        assert!(mesh.border_edges().is_empty());

        let (min, max) = (Point3::new(0.05, 0.07, 0.09), Point3::new(1.05, 1.07, 1.09));
        for v in &mesh.vertices {
            assert!(on_cube_surface(&v.position, &min, &max), "{:?}", v.position);
        }
        // corners are cut off, never added
        let volume = mesh.signed_volume();
        assert!(volume > 0.5 && volume < 1.0 + 1e-9, "volume {}", volume);
    }

    #[test]
    fn test_grid_line_intersection_is_exact() {
        let mut grid = CubeGrid::new(1.0);
        grid.register_triangle(&[
            Point3::new(0.3, -1.0, -1.0),
            Point3::new(0.3, 3.0, -1.0),
            Point3::new(0.3, -1.0, 3.0),
        ]);
        // the x-line through (y, z) = (0, 0) pierces at x = 0.3, owned by cell (0, 0, 0)
        let nr = grid.find([0, 0, 0]);
        assert!(nr.is_some());
        let v = grid.cubes[nr.unwrap_or(0)].vert_refs[0];
        assert!(v >= 0);
        let p = grid.vertices[v as usize];
        assert!((p.x - 0.3).abs() < 1e-12 && p.y == 0.0 && p.z == 0.0);
        // parallel grid lines are skipped
        assert!(grid.cubes.iter().all(|c| c.vert_refs[1] < 0 && c.vert_refs[2] < 0));
    }

    #[test]
    fn test_complete_cells_adds_lower_neighbors() {
        let mut grid = CubeGrid::new(1.0);
        grid.create([2, 2, 2]);
        grid.complete_cells();
        assert_eq!(grid.cubes.len(), 8);
        assert!(grid.find([1, 1, 1]).is_some());
        assert!(grid.find([3, 2, 2]).is_none());
    }

    #[test]
    fn test_open_sheet_produces_border_fans() {
        // a single square crossing a few cells, open on all sides
        let mut extractor = GeneralizedExtractor::new(IsoParams::with_subdivision(6));
        let (a, b, c, d) = (
            Point3::new(0.12, 0.13, 0.51),
            Point3::new(1.07, 0.13, 0.51),
            Point3::new(1.07, 1.11, 0.51),
            Point3::new(0.12, 1.11, 0.51),
        );
        extractor.add_triangle(&a, &b, &c);
        extractor.add_triangle(&a, &c, &d);
        assert!(extractor.extract(None).is_ok());
        let mesh = extractor.mesh();
        assert!(!mesh.is_empty());
        for v in &mesh.vertices {
            assert!((v.position.z - 0.51).abs() < 1e-9);
        }
    }
}
