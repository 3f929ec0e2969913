//! Tetrahedralization of closed surfaces for soft-body simulation.
//!
//! [`Tetrahedralizer`] fills the inside of a registered surface with
//! tetrahedra built from the surface vertices:
//!
//! 1. Vertices closer than `0.3 * diagonal / subdivision` are welded.
//! 2. The surface triangles go into a [`SpatialHash`] for later inside tests.
//! 3. Every vertex is inserted into a Delaunay tetrahedralization that starts
//!    from one tetrahedron enclosing everything (Bowyer-Watson). The
//!    containing tetrahedron is found by walking towards the point; the
//!    cavity of tetrahedra whose circumsphere holds the new point is replaced
//!    by a fan around it.
//! 4. Edges crossing the surface are swapped away where the ring of
//!    tetrahedra around them can be re-fanned without inverting anything.
//! 5. Tetrahedra touching the enclosing vertices, tetrahedra whose center
//!    loses a parity vote of three axis rays, and slivers are removed.
//!
//! # Example
//!
//! ```
//! use mesh_kernel::tetra::{TetraParams, Tetrahedralizer};
//! use mesh_kernel::TriangleMesh;
//! use nalgebra::Point3;
//!
//! let cube = TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
//! let mut tetrahedralizer = Tetrahedralizer::new(TetraParams::default());
//! tetrahedralizer.register_mesh(&cube).unwrap();
//! tetrahedralizer.end_registration(None).unwrap();
//! assert!((tetrahedralizer.to_mesh().volume() - 1.0).abs() < 1e-9);
//! ```

use crate::error::{KernelError, KernelResult};
use crate::geometry::{circumsphere, point_in_tetra, ray_triangle, tetra_quality, tetra_volume};
use crate::progress::{HierarchicalProgress, ProgressListener, report_every};
use crate::spatial_hash::SpatialHash;
use crate::tracing_ext::{OperationTimer, log_tetra_stats};
use crate::types::{Bounds, TetraMesh, TriangleMesh};
use nalgebra::{Matrix3, Point3, Vector3};
use tracing::{debug, trace};

/// Weld distance as a fraction of one subdivision cell.
const WELD_THRESHOLD: f64 = 0.3;

/// Edge endpoints closer than this fraction of a cell to a triangle plane never count as crossing it.
const SWAP_THRESHOLD: f64 = 0.05;

/// Swap passes after the first one.
const MAX_SWAP_PASSES: usize = 20;

/// Tetrahedra below this shape quality are dropped as slivers.
pub const MIN_TETRA_QUALITY: f64 = 0.001;

/// Steps of the point location walk before falling back to a linear scan.
const MAX_WALK_STEPS: usize = 1000;

const RAY_EPSILON: f64 = 1e-5;

/// Vertex slots of the face opposite each vertex, oriented outward for a
/// positively oriented tetrahedron.
const FACES: [[usize; 3]; 4] = [[1, 2, 3], [2, 0, 3], [0, 1, 3], [2, 1, 0]];

/// Parameters for tetrahedralization.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "pipeline-config",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct TetraParams {
    /// Cells along the bounds diagonal; sets the weld distance and the
    /// surface crossing tolerance of the swap pass. Default: 20
    pub subdivision: u32,
}

impl Default for TetraParams {
    fn default() -> Self {
        Self { subdivision: 20 }
    }
}

impl TetraParams {
    /// Default parameters with a given subdivision.
    pub fn with_subdivision(subdivision: u32) -> Self {
        Self { subdivision }
    }

    pub(crate) fn validate(&self) -> KernelResult<()> {
        if self.subdivision == 0 {
            return Err(
                KernelError::invalid_parameter("subdivision", 0.0, "must be at least 1").reported(),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Tetra {
    vertices: [u32; 4],
    /// Neighbor across the face opposite each vertex.
    neighbors: [Option<u32>; 4],
    deleted: bool,
    /// Circumsphere center and squared radius, computed on first use.
    sphere: Option<(Point3<f64>, f64)>,
}

impl Tetra {
    fn new(vertices: [u32; 4]) -> Self {
        Self {
            vertices,
            neighbors: [None; 4],
            deleted: false,
            sphere: None,
        }
    }

    fn contains(&self, v: u32) -> bool {
        self.vertices.contains(&v)
    }

    /// Slot of the vertex that is not part of `face`.
    fn slot_opposite(&self, face: &[u32; 3]) -> Option<usize> {
        self.vertices.iter().position(|v| !face.contains(v))
    }

    /// The two vertices other than `v0` and `v1`, in slot order.
    fn opposite_pair(&self, v0: u32, v1: u32) -> [u32; 2] {
        let mut pair = [0; 2];
        let mut k = 0;
        for &v in &self.vertices {
            if v != v0 && v != v1 && k < 2 {
                pair[k] = v;
                k += 1;
            }
        }
        pair
    }
}

/// Chain directed link edges into one closed polygon.
fn close_ring(mut link: Vec<[u32; 2]>) -> Option<Vec<u32>> {
    let [start, mut end] = link.pop()?;
    let mut ring = vec![start, end];
    while !link.is_empty() {
        let k = link.iter().position(|e| e[0] == end)?;
        end = link.swap_remove(k)[1];
        ring.push(end);
    }
    if ring.first() != ring.last() {
        return None;
    }
    ring.pop();
    (ring.len() >= 3).then_some(ring)
}

/// Builds a tetrahedral mesh filling a closed triangle surface.
///
/// Register the surface with [`Self::register_vertex`] and
/// [`Self::register_triangle`], then call [`Self::end_registration`] once.
/// The result stays available through [`Self::vertices`] and
/// [`Self::tetrahedra`] until [`Self::clear`].
#[derive(Debug, Clone)]
pub struct Tetrahedralizer {
    params: TetraParams,
    vertices: Vec<Point3<f64>>,
    triangles: Vec<[u32; 3]>,
    tetras: Vec<Tetra>,
    hash: SpatialHash,
    bounds: Bounds,
    diagonal: f64,
    /// Index of the first enclosing vertex; all later vertices are synthetic.
    first_far: usize,
    num_swaps: usize,
    output: TetraMesh,
    finalized: bool,
}

impl Tetrahedralizer {
    /// Create an empty tetrahedralizer.
    pub fn new(params: TetraParams) -> Self {
        Self {
            params,
            vertices: Vec::new(),
            triangles: Vec::new(),
            tetras: Vec::new(),
            hash: SpatialHash::new(1.0),
            bounds: Bounds::empty(),
            diagonal: 0.0,
            first_far: 0,
            num_swaps: 0,
            output: TetraMesh::default(),
            finalized: false,
        }
    }

    /// Drop the surface and the result, keeping the parameters.
    pub fn clear(&mut self) {
        let params = self.params.clone();
        *self = Self::new(params);
    }

    /// Whether [`Self::end_registration`] ran.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Parameters used by [`Self::end_registration`].
    pub fn params(&self) -> &TetraParams {
        &self.params
    }

    /// Register a surface vertex and return its index.
    pub fn register_vertex(&mut self, position: Point3<f64>) -> KernelResult<u32> {
        if self.finalized {
            return Err(KernelError::RegistrationClosed {
                operation: "register_vertex",
            }
            .reported());
        }
        self.vertices.push(position);
        self.bounds.include(&position);
        Ok((self.vertices.len() - 1) as u32)
    }

    /// Register a surface triangle over previously registered vertices.
    pub fn register_triangle(&mut self, v0: u32, v1: u32, v2: u32) -> KernelResult<()> {
        if self.finalized {
            return Err(KernelError::RegistrationClosed {
                operation: "register_triangle",
            }
            .reported());
        }
        let count = self.vertices.len();
        for (position, &v) in [v0, v1, v2].iter().enumerate() {
            if v as usize >= count {
                let position = self.triangles.len() * 3 + position;
                return Err(KernelError::index_out_of_range(position, v, count).reported());
            }
        }
        self.triangles.push([v0, v1, v2]);
        Ok(())
    }

    /// Register every vertex and triangle of `mesh`.
    pub fn register_mesh(&mut self, mesh: &TriangleMesh) -> KernelResult<()> {
        let offset = self.vertices.len() as u32;
        for v in &mesh.vertices {
            self.register_vertex(v.position)?;
        }
        for &[a, b, c] in &mesh.triangles {
            self.register_triangle(a + offset, b + offset, c + offset)?;
        }
        Ok(())
    }

    /// Build the tetrahedral mesh.
    ///
    /// Fails without side effects when the parameters are invalid, the
    /// surface is empty or flat in every direction, or the tetrahedralizer
    /// was already finalized.
    pub fn end_registration(
        &mut self,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<()> {
        if self.finalized {
            return Err(KernelError::RegistrationClosed {
                operation: "end_registration",
            }
            .reported());
        }
        self.params.validate()?;
        if self.triangles.is_empty() {
            return Err(KernelError::empty_mesh("no surface triangles registered").reported());
        }
        self.diagonal = self.bounds.diagonal();
        if !(self.diagonal > 0.0) {
            return Err(KernelError::empty_mesh("surface has zero extent").reported());
        }

        let _timer = OperationTimer::with_context(
            "tetrahedralize",
            self.triangles.len(),
            self.vertices.len(),
        );
        let mut progress = HierarchicalProgress::new(100, progress);

        self.weld_vertices();
        self.hash.set_spacing(0.1 * self.diagonal);
        for (t, triangle) in self.triangles.iter().enumerate() {
            let bounds = Bounds::from_points(triangle.iter().map(|&v| &self.vertices[v as usize]));
            self.hash.add_bounds(&bounds, t as u32);
        }

        progress.set_subtask_work(10, Some("Delaunay Tetrahedralization"));
        self.insert_vertices(&mut progress);
        progress.complete_subtask();

        // neighbor links are not maintained past this point
        self.compress_tetrahedra();

        let mut start = 0;
        let mut old_count = self.tetras.len();
        let mut last_swapped = usize::MAX;
        let mut fraction = 50;
        for pass in 0..=MAX_SWAP_PASSES {
            fraction /= 2;
            progress.set_subtask_work(fraction, Some("Swapping Tetrahedra"));
            let swapped = self.swap_tetrahedra(start, &mut progress);
            progress.complete_subtask();
            trace!(pass, swapped, "swap pass");
            self.num_swaps += swapped;
            start = old_count;
            old_count = self.tetras.len();
            if swapped == 0 || swapped >= last_swapped {
                break;
            }
            last_swapped = swapped;
        }

        progress.set_subtask_work(-1, Some("Removing outer tetrahedra"));
        self.remove_outer_tetrahedra(&mut progress);
        progress.complete_subtask();

        self.compress_tetrahedra();
        self.output = self.compress_vertices();

        self.tetras.clear();
        self.triangles.clear();
        self.hash.reset();
        self.finalized = true;

        debug!(
            vertices = self.output.vertices.len(),
            tetrahedra = self.output.tetrahedra.len(),
            swaps = self.num_swaps,
            "tetrahedralization finished"
        );
        log_tetra_stats(&self.output, "tetrahedralize");
        Ok(())
    }

    /// Output vertex positions; empty before finalization.
    pub fn vertices(&self) -> &[Point3<f64>] {
        &self.output.vertices
    }

    /// Output tetrahedra as vertex index quadruples.
    pub fn tetrahedra(&self) -> &[[u32; 4]] {
        &self.output.tetrahedra
    }

    /// Number of output tetrahedra.
    pub fn num_tetrahedra(&self) -> usize {
        self.output.tetrahedra.len()
    }

    /// Edges swapped because they crossed the surface.
    pub fn num_swaps(&self) -> usize {
        self.num_swaps
    }

    /// A copy of the output mesh.
    pub fn to_mesh(&self) -> TetraMesh {
        self.output.clone()
    }

    fn weld_vertices(&mut self) {
        let d = self.diagonal / self.params.subdivision as f64 * WELD_THRESHOLD;
        let d2 = d * d;
        let mut hash = SpatialHash::new(d);
        let mut welded: Vec<Point3<f64>> = Vec::with_capacity(self.vertices.len());
        let mut old_to_new = Vec::with_capacity(self.vertices.len());
        let mut near = Vec::new();

        for p in &self.vertices {
            near.clear();
            let mut query = Bounds::new(*p, *p);
            query.fatten(d);
            hash.query_bounds(&query, &mut near, usize::MAX);
            let target = near
                .iter()
                .copied()
                .filter(|&i| (welded[i as usize] - p).norm_squared() < d2)
                .min();
            let index = match target {
                Some(i) => i,
                None => {
                    let i = welded.len() as u32;
                    hash.add_point(p, i);
                    welded.push(*p);
                    i
                }
            };
            old_to_new.push(index);
        }

        let merged = self.vertices.len() - welded.len();
        if merged == 0 {
            return;
        }
        self.vertices = welded;
        for triangle in &mut self.triangles {
            *triangle = triangle.map(|v| old_to_new[v as usize]);
        }
        self.triangles.retain(|&[a, b, c]| a != b && b != c && c != a);
        debug!(merged, "welded close vertices");
    }

    fn is_far(&self, v: u32) -> bool {
        v as usize >= self.first_far
    }

    fn corners(&self, v: &[u32; 4]) -> [&Point3<f64>; 4] {
        v.map(|i| &self.vertices[i as usize])
    }

    fn volume(&self, v: [u32; 4]) -> f64 {
        let [p0, p1, p2, p3] = self.corners(&v);
        tetra_volume(p0, p1, p2, p3)
    }

    fn quality(&self, v: [u32; 4]) -> f64 {
        tetra_quality(self.corners(&v))
    }

    fn contains_point(&self, v: [u32; 4], p: &Point3<f64>) -> bool {
        point_in_tetra(self.corners(&v), p)
    }

    /// Append the four enclosing vertices and start from the tetrahedron they span.
    fn add_super_tetra(&mut self) {
        let a = 3.0 * self.diagonal;
        let x = 0.5 * a;
        let y0 = x / 3f64.sqrt();
        let y1 = x * 3f64.sqrt() - y0;
        let z0 = 0.25 * 6f64.sqrt() * a;
        let z1 = a * 6f64.sqrt() / 3.0 - z0;
        let center = self.bounds.center();

        self.first_far = self.vertices.len();
        for offset in [
            Vector3::new(-x, -y0, -z1),
            Vector3::new(x, -y0, -z1),
            Vector3::new(0.0, y1, -z1),
            Vector3::new(0.0, 0.0, z0),
        ] {
            self.vertices.push(center + offset);
        }
        let f = self.first_far as u32;
        self.tetras.clear();
        self.tetras.push(Tetra::new([f, f + 1, f + 2, f + 3]));
    }

    fn insert_vertices(&mut self, progress: &mut dyn ProgressListener) {
        self.add_super_tetra();
        let mut edges = Vec::new();
        let mut skipped = 0;

        for i in 0..self.first_far {
            report_every(progress, i, self.first_far, 0x7f);
            let p = self.vertices[i];
            let Some(t) = self.locate(self.tetras.len() - 1, &p) else {
                skipped += 1;
                continue;
            };
            let coincident = self.tetras[t]
                .vertices
                .iter()
                .any(|&v| self.vertices[v as usize] == p);
            if coincident {
                skipped += 1;
                continue;
            }
            let first_new = self.tetras.len();
            self.retriangulate(t, i as u32);
            self.link_new_tetras(first_new, &mut edges);
        }

        if skipped > 0 {
            debug!(skipped, "vertices not inserted");
        }
    }

    /// Walk from `start` towards `p` and return the live tetrahedron containing it.
    fn locate(&self, start: usize, p: &Point3<f64>) -> Option<usize> {
        let mut t = start;
        for _ in 0..MAX_WALK_STEPS.min(self.tetras.len()) {
            let tetra = &self.tetras[t];
            let [p0, p1, p2, p3] = self.corners(&tetra.vertices);
            let q = p - p0;
            let q0 = p1 - p0;
            let q1 = p2 - p0;
            let q2 = p3 - p0;
            let det = Matrix3::from_columns(&[q0, q1, q2]).determinant();
            let x = Matrix3::from_columns(&[q, q1, q2]).determinant();
            let y = Matrix3::from_columns(&[q0, q, q2]).determinant();
            let z = Matrix3::from_columns(&[q0, q1, q]).determinant();

            let n = &tetra.neighbors;
            let next = if x < 0.0 && n[1].is_some() {
                n[1]
            } else if y < 0.0 && n[2].is_some() {
                n[2]
            } else if z < 0.0 && n[3].is_some() {
                n[3]
            } else if x + y + z > det && n[0].is_some() {
                n[0]
            } else {
                None
            };
            match next {
                Some(n) => t = n as usize,
                None => return Some(t),
            }
        }

        debug!("point location walk exhausted, scanning all tetrahedra");
        self.tetras
            .iter()
            .position(|tetra| !tetra.deleted && self.contains_point(tetra.vertices, p))
    }

    fn in_circumsphere(&mut self, t: usize, p: &Point3<f64>) -> bool {
        let (center, radius_sq) = match self.tetras[t].sphere {
            Some(sphere) => sphere,
            None => {
                let sphere = circumsphere(self.corners(&self.tetras[t].vertices));
                self.tetras[t].sphere = Some(sphere);
                sphere
            }
        };
        (center - p).norm_squared() < radius_sq
    }

    /// Delete the cavity of tetrahedra around `t` whose circumsphere holds
    /// vertex `v` and fan its boundary faces to `v`.
    ///
    /// New tetrahedra are linked to the outside of the cavity only; their
    /// mutual links are set by [`Self::link_new_tetras`].
    fn retriangulate(&mut self, t: usize, v: u32) {
        let p = self.vertices[v as usize];
        self.tetras[t].deleted = true;
        let mut cavity = vec![t];

        while let Some(t) = cavity.pop() {
            for side in 0..4 {
                let neighbor = self.tetras[t].neighbors[side];
                if let Some(n) = neighbor {
                    let n = n as usize;
                    if self.tetras[n].deleted {
                        continue;
                    }
                    if self.in_circumsphere(n, &p) {
                        self.tetras[n].deleted = true;
                        cavity.push(n);
                        continue;
                    }
                }

                let face = FACES[side].map(|k| self.tetras[t].vertices[k]);
                let mut tetra = Tetra::new([v, face[0], face[1], face[2]]);
                tetra.neighbors[0] = neighbor;
                let index = self.tetras.len() as u32;
                if let Some(n) = neighbor {
                    let outside = &mut self.tetras[n as usize];
                    if let Some(slot) = outside.slot_opposite(&face) {
                        outside.neighbors[slot] = Some(index);
                    }
                }
                self.tetras.push(tetra);
            }
        }
    }

    /// Link the tetrahedra created since `first` across the faces they share.
    fn link_new_tetras(&mut self, first: usize, edges: &mut Vec<([u32; 2], u32, usize)>) {
        edges.clear();
        for j in first..self.tetras.len() {
            let v = self.tetras[j].vertices;
            // each face through the new vertex is identified by its opposite edge
            for (a, b, slot) in [(v[2], v[3], 1), (v[3], v[1], 2), (v[1], v[2], 3)] {
                edges.push(([a.min(b), a.max(b)], j as u32, slot));
            }
        }
        edges.sort_unstable_by_key(|e| e.0);
        for shared in edges.chunk_by(|a, b| a.0 == b.0) {
            if let &[(_, t0, s0), (_, t1, s1)] = shared {
                self.tetras[t0 as usize].neighbors[s0] = Some(t1);
                self.tetras[t1 as usize].neighbors[s1] = Some(t0);
            }
        }
    }

    /// Drop deleted tetrahedra and all neighbor links.
    fn compress_tetrahedra(&mut self) {
        self.tetras.retain(|t| !t.deleted);
        for t in &mut self.tetras {
            t.neighbors = [None; 4];
        }
    }

    /// Swap the edges of tetrahedra from `start` on that cross the surface.
    /// Returns the number of swaps.
    fn swap_tetrahedra(&mut self, start: usize, progress: &mut dyn ProgressListener) -> usize {
        let threshold = SWAP_THRESHOLD * self.diagonal / self.params.subdivision as f64;
        let mut edges: Vec<[u32; 2]> = Vec::with_capacity((self.tetras.len() - start) * 6);
        for t in self.tetras[start..].iter().filter(|t| !t.deleted) {
            let v = t.vertices;
            for (a, b) in [(0, 1), (1, 2), (2, 0), (0, 3), (1, 3), (2, 3)] {
                edges.push([v[a].min(v[b]), v[a].max(v[b])]);
            }
        }
        edges.sort_unstable();
        edges.dedup();

        let mut candidates = Vec::new();
        let mut swapped = 0;
        for (k, &[v0, v1]) in edges.iter().enumerate() {
            report_every(progress, k, edges.len(), 0xf);
            if self.is_far(v0) || self.is_far(v1) {
                continue;
            }
            if self.edge_crosses_surface(v0, v1, threshold, &mut candidates)
                && self.swap_edge(v0, v1)
            {
                swapped += 1;
            }
        }
        swapped
    }

    fn edge_crosses_surface(
        &self,
        v0: u32,
        v1: u32,
        threshold: f64,
        candidates: &mut Vec<u32>,
    ) -> bool {
        let a = self.vertices[v0 as usize];
        let b = self.vertices[v1 as usize];
        let edge_bounds = Bounds::from_points([&a, &b]);
        candidates.clear();
        self.hash.query_unique_bounds(&edge_bounds, candidates, usize::MAX);

        candidates.iter().any(|&t| {
            let triangle = self.triangles[t as usize];
            if triangle.contains(&v0) || triangle.contains(&v1) {
                return false;
            }
            let [p0, p1, p2] = triangle.map(|v| self.vertices[v as usize]);
            if !Bounds::from_points([&p0, &p1, &p2]).intersects(&edge_bounds) {
                return false;
            }
            let Some(normal) = (p1 - p0).cross(&(p2 - p0)).try_normalize(0.0) else {
                return false;
            };
            // endpoints grazing the triangle plane do not count
            if normal.dot(&(a - p0)).abs() < threshold || normal.dot(&(b - p0)).abs() < threshold {
                return false;
            }
            matches!(
                ray_triangle(&a, &(b - a), &p0, &p1, &p2),
                Some(hit) if (0.0..=1.0).contains(&hit.t)
            )
        })
    }

    /// Replace the tetrahedra around edge `v0 v1` by a fan over the polygon
    /// of their opposite edges. Returns false and changes nothing when the
    /// ring is open or cannot be fanned without inverted tetrahedra.
    fn swap_edge(&mut self, v0: u32, v1: u32) -> bool {
        let mut around = Vec::new();
        let mut link = Vec::new();
        for (i, t) in self.tetras.iter().enumerate() {
            if t.deleted || !t.contains(v0) || !t.contains(v1) {
                continue;
            }
            around.push(i);
            let [v2, v3] = t.opposite_pair(v0, v1);
            if self.volume([v0, v1, v2, v3]) >= 0.0 {
                link.push([v2, v3]);
            } else {
                link.push([v3, v2]);
            }
        }
        if link.len() < 3 {
            return false;
        }
        let Some(mut ring) = close_ring(link) else {
            return false;
        };

        let mut fan = Vec::with_capacity(2 * ring.len());
        let mut ear_quality = vec![0.0; ring.len()];
        while ring.len() > 3 {
            let num = ring.len();
            for i0 in 0..num {
                let i1 = (i0 + 1) % num;
                let i2 = (i1 + 1) % num;
                ear_quality[i1] = self.quality([ring[i0], ring[i1], ring[i2], v1]);
            }

            let mut best: Option<(usize, f64)> = None;
            for i0 in 0..num {
                let i1 = (i0 + 1) % num;
                let i2 = (i1 + 1) % num;
                let upper = [ring[i0], ring[i1], ring[i2], v1];
                let lower = [ring[i2], ring[i1], ring[i0], v0];
                if self.volume(upper) < 0.0 || self.volume(lower) < 0.0 {
                    continue;
                }
                let ear = (0..num).filter(|&i| i != i0 && i != i1 && i != i2).all(|i| {
                    let p = &self.vertices[ring[i] as usize];
                    !self.contains_point(upper, p) && !self.contains_point(lower, p)
                });
                if !ear {
                    continue;
                }
                let q = (1.0 - ear_quality[i0]) + ear_quality[i1] + (1.0 - ear_quality[i2]);
                if best.is_none_or(|(_, best_q)| q > best_q) {
                    best = Some((i0, q));
                }
            }
            let Some((i0, _)) = best else {
                return false;
            };

            let i1 = (i0 + 1) % num;
            let i2 = (i1 + 1) % num;
            fan.push([ring[i0], ring[i1], ring[i2], v1]);
            fan.push([ring[i2], ring[i1], ring[i0], v0]);
            ring.remove(i1);
        }

        let upper = [ring[0], ring[1], ring[2], v1];
        let lower = [ring[2], ring[1], ring[0], v0];
        if self.volume(upper) < 0.0 || self.volume(lower) < 0.0 {
            return false;
        }
        fan.push(upper);
        fan.push(lower);

        for i in around {
            self.tetras[i].deleted = true;
        }
        self.tetras.extend(fan.into_iter().map(Tetra::new));
        true
    }

    fn remove_outer_tetrahedra(&mut self, progress: &mut dyn ProgressListener) {
        let mut candidates = Vec::new();
        let mut hits = Vec::new();
        let count = self.tetras.len();
        let (mut far, mut outside, mut slivers) = (0, 0, 0);

        for i in 0..count {
            report_every(progress, i, count, 0x7);
            let vertices = self.tetras[i].vertices;
            if vertices.iter().any(|&v| self.is_far(v)) {
                self.tetras[i].deleted = true;
                far += 1;
                continue;
            }
            if self.tetras[i].deleted {
                continue;
            }

            let [p0, p1, p2, p3] = self.corners(&vertices);
            let center = Point3::from((p0.coords + p1.coords + p2.coords + p3.coords) * 0.25);
            if self.inside_votes(&center, &mut candidates, &mut hits) < 3 {
                self.tetras[i].deleted = true;
                outside += 1;
            } else if self.quality(vertices) < MIN_TETRA_QUALITY {
                self.tetras[i].deleted = true;
                slivers += 1;
            }
        }
        debug!(far, outside, slivers, "removed tetrahedra");
    }

    /// Cast both directions of the three axis lines through `origin` and
    /// count the half-rays that cross the surface an odd number of times.
    fn inside_votes(
        &self,
        origin: &Point3<f64>,
        candidates: &mut Vec<u32>,
        hits: &mut Vec<f64>,
    ) -> usize {
        let mut votes = 0;
        for axis in 0..3 {
            let mut ray_bounds = Bounds::new(*origin, *origin);
            ray_bounds.min[axis] = self.bounds.min[axis] - RAY_EPSILON;
            ray_bounds.max[axis] = self.bounds.max[axis] + RAY_EPSILON;
            let dir = Vector3::ith(axis, 1.0);

            candidates.clear();
            self.hash.query_unique_bounds(&ray_bounds, candidates, usize::MAX);
            hits.clear();
            for &t in candidates.iter() {
                let [p0, p1, p2] = self.triangles[t as usize].map(|v| self.vertices[v as usize]);
                if !Bounds::from_points([&p0, &p1, &p2]).intersects(&ray_bounds) {
                    continue;
                }
                if let Some(hit) = ray_triangle(origin, &dir, &p0, &p1, &p2) {
                    hits.push(hit.t);
                }
            }
            if hits.is_empty() {
                continue;
            }
            let negative = hits.iter().filter(|&&t| t < 0.0).count();
            let positive = hits.len() - negative;
            votes += (positive & 1) + (negative & 1);
        }
        votes
    }

    /// Keep only the vertices referenced by a tetrahedron, in order of first use.
    fn compress_vertices(&self) -> TetraMesh {
        let mut remap: Vec<Option<u32>> = vec![None; self.vertices.len()];
        let mut mesh = TetraMesh::default();
        for t in &self.tetras {
            let quad = t.vertices.map(|v| {
                *remap[v as usize].get_or_insert_with(|| {
                    mesh.vertices.push(self.vertices[v as usize]);
                    (mesh.vertices.len() - 1) as u32
                })
            });
            mesh.tetrahedra.push(quad);
        }
        mesh
    }

    #[cfg(test)]
    fn check_neighbors(&self) -> bool {
        self.tetras.iter().enumerate().all(|(i, t)| {
            t.deleted
                || (0..4).all(|slot| match t.neighbors[slot] {
                    None => true,
                    Some(n) => {
                        let other = &self.tetras[n as usize];
                        let face = FACES[slot].map(|k| t.vertices[k]);
                        !other.deleted
                            && other
                                .slot_opposite(&face)
                                .is_some_and(|s| other.neighbors[s] == Some(i as u32))
                    }
                })
        })
    }
}

/// Delaunay tetrahedralization of a point set.
///
/// Tetrahedra reaching outside the enclosing tetrahedron used during
/// construction are dropped, so the result may miss thin slabs along the
/// convex hull. Vertex indices refer to `points`; exact duplicates are skipped.
pub fn delaunay(points: &[Point3<f64>]) -> TetraMesh {
    let bounds = Bounds::from_points(points);
    let mut mesh = TetraMesh {
        vertices: points.to_vec(),
        tetrahedra: Vec::new(),
    };
    if points.len() < 4 || !(bounds.diagonal() > 0.0) {
        return mesh;
    }

    let mut builder = Tetrahedralizer::new(TetraParams::default());
    builder.vertices = points.to_vec();
    builder.diagonal = bounds.diagonal();
    builder.bounds = bounds;
    builder.insert_vertices(&mut |_: u32, _: Option<&str>| {});
    mesh.tetrahedra = builder
        .tetras
        .iter()
        .filter(|t| !t.deleted && !t.vertices.iter().any(|&v| builder.is_far(v)))
        .map(|t| t.vertices)
        .collect();
    mesh
}
