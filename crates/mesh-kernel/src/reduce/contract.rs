//! Mesh contraction along a signed distance field.
//!
//! At finalization the contractor samples the signed distance to its own
//! surface on a uniform grid: cells pierced by axis rays through the
//! triangles get exact distances, fast marching grows the field outward from
//! them, and a parity vote along the three axes decides the sign (positive
//! inside). Every contraction step then moves the vertices up the distance
//! gradient, splits edges longer than 1.5 cells and collapses edges shorter
//! than 0.3 cells, so the surface keeps an even resolution while it shrinks.
//!
//! The field is computed once. Later steps move the surface relative to the
//! original one, so contraction slows down as the surface approaches the
//! medial region of the input.

use super::{ContractParams, MeshReducer};
use crate::error::{KernelError, KernelResult};
use crate::priority_queue::PriorityQueue;
use crate::progress::{HierarchicalProgress, ProgressListener, report_every};
use crate::spatial_hash::SpatialHash;
use crate::tracing_ext::{OperationTimer, log_reduction_result};
use crate::types::{Bounds, TriangleMesh, Vertex};
use nalgebra::{Point3, Vector3};
use std::cmp::Ordering;
use tracing::{debug, trace, warn};

/// Upper bound on contraction steps when no step count is given.
pub const MAX_UNBOUNDED_STEPS: usize = 1000;

/// Larger distance field subdivisions are clamped to this.
pub const MAX_CONTRACT_SUBDIVISION: u32 = 200;

/// Ray offset in cells, keeps rays off grid-aligned vertices and edges.
const RAY_OFFSET: f64 = 0.00017;

/// Samples along a displacement when searching the closest approach to the surface.
const FIND_MIN_STEPS: usize = 20;

#[derive(Debug, Clone, Copy)]
struct Cell {
    /// Distance in cell units; negated outside after the sign pass.
    distance: f64,
    /// Number of axis scans that saw this cell inside.
    inside: u8,
    marked: bool,
    num_cuts: [u8; 3],
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            distance: f64::MAX,
            inside: 0,
            marked: false,
            num_cuts: [0; 3],
        }
    }
}

/// A frontier cell of the fast marching pass.
#[derive(Debug, Clone, Copy)]
struct FrontCell {
    coord: [usize; 3],
    value: f64,
}

impl PartialEq for FrontCell {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl PartialOrd for FrontCell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

/// The four triangles around an edge and the triangle across it.
///
/// For edge `(v0, v1)` of triangle `t`: `adj` shares the edge, `t0` and `t1`
/// are the other neighbors of `t` at `v0` and `v1`, `t2` and `t3` the ones of
/// `adj`.
#[derive(Debug, Clone, Copy, Default)]
struct Butterfly {
    adj: Option<u32>,
    t0: Option<u32>,
    t1: Option<u32>,
    t2: Option<u32>,
    t3: Option<u32>,
}

/// State saved before a contraction step so it can be undone.
struct Snapshot {
    vertices: Vec<Point3<f64>>,
    indices: Vec<u32>,
    neighbors: Vec<Option<u32>>,
}

/// Shrinks a closed mesh toward the inside of its own distance field.
#[derive(Debug, Clone)]
pub struct DistanceFieldContractor {
    vertices: Vec<Point3<f64>>,
    indices: Vec<u32>,
    /// Triangle across edge `(j, j + 1)` of each triangle, at `3 * t + j`.
    neighbors: Vec<Option<u32>>,
    curvatures: Vec<f64>,

    grid: Vec<Cell>,
    num: [usize; 3],
    cell_size: f64,
    origin: Point3<f64>,

    initial_volume: f64,
    current_volume: f64,
    finalized: bool,
}

impl Default for DistanceFieldContractor {
    fn default() -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            neighbors: Vec::new(),
            curvatures: Vec::new(),
            grid: Vec::new(),
            num: [0; 3],
            cell_size: 1.0,
            origin: Point3::origin(),
            initial_volume: 0.0,
            current_volume: 0.0,
            finalized: false,
        }
    }
}

impl DistanceFieldContractor {
    /// Create an empty contractor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything and reopen registration.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Whether [`Self::end_registration`] ran.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Register a vertex and return its index.
    pub fn register_vertex(&mut self, position: Point3<f64>) -> KernelResult<u32> {
        if self.finalized {
            return Err(KernelError::RegistrationClosed {
                operation: "register_vertex",
            }
            .reported());
        }
        self.vertices.push(position);
        Ok((self.vertices.len() - 1) as u32)
    }

    /// Register a triangle. Triangles repeating a vertex are skipped.
    pub fn register_triangle(&mut self, v0: u32, v1: u32, v2: u32) -> KernelResult<()> {
        if self.finalized {
            return Err(KernelError::RegistrationClosed {
                operation: "register_triangle",
            }
            .reported());
        }
        let count = self.vertices.len();
        for (k, &v) in [v0, v1, v2].iter().enumerate() {
            if v as usize >= count {
                let position = self.indices.len() + k;
                return Err(KernelError::index_out_of_range(position, v, count).reported());
            }
        }
        if v0 == v1 || v1 == v2 || v2 == v0 {
            debug!(v0, v1, v2, "skipping degenerate triangle");
            return Ok(());
        }
        self.indices.extend_from_slice(&[v0, v1, v2]);
        Ok(())
    }

    /// Close registration: build adjacency, the signed distance field with
    /// `subdivision` cells along the bounds diagonal, and the initial volume.
    /// Subdivisions above [`MAX_CONTRACT_SUBDIVISION`] are clamped.
    pub fn end_registration(
        &mut self,
        subdivision: u32,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<()> {
        if self.finalized {
            return Err(KernelError::RegistrationClosed {
                operation: "end_registration",
            }
            .reported());
        }
        if subdivision == 0 {
            return Err(
                KernelError::invalid_parameter("subdivision", 0.0, "must be at least 1").reported(),
            );
        }
        if self.indices.is_empty() {
            return Err(KernelError::empty_mesh("no triangles registered").reported());
        }
        let subdivision = if subdivision > MAX_CONTRACT_SUBDIVISION {
            warn!(
                subdivision,
                max = MAX_CONTRACT_SUBDIVISION,
                "subdivision clamped"
            );
            MAX_CONTRACT_SUBDIVISION
        } else {
            subdivision
        };
        let _timer = OperationTimer::with_context(
            "contractor_end_registration",
            self.num_triangles(),
            self.vertices.len(),
        );
        let mut progress = HierarchicalProgress::new(100, progress);

        progress.set_subtask_work(30, Some("Compute Neighbors"));
        self.compute_neighbors();

        let mut bounds = Bounds::from_points(&self.vertices);
        self.cell_size = bounds.diagonal() / subdivision as f64;
        if self.cell_size == 0.0 {
            self.cell_size = 1.0;
        }
        bounds.fatten(2.0 * self.cell_size);
        self.origin = bounds.min;
        let extent = bounds.extent() / self.cell_size;
        self.num = [
            extent.x as usize + 1,
            extent.y as usize + 1,
            extent.z as usize + 1,
        ];
        self.grid = vec![Cell::default(); self.num.iter().product()];
        progress.complete_subtask();

        progress.set_subtask_work(60, Some("Compute Signed Distance Field"));
        self.compute_signed_distance_field();
        progress.complete_subtask();

        progress.set_subtask_work(10, Some("Computing Volume"));
        let (area, volume) = self.area_and_volume();
        self.initial_volume = volume;
        self.current_volume = volume;
        progress.complete_subtask();

        if volume <= 0.0 {
            warn!(volume, "mesh encloses no volume, contraction has no target");
        }
        debug!(
            cells = self.grid.len(),
            cell_size = self.cell_size,
            area,
            volume,
            "distance field ready"
        );
        self.finalized = true;
        Ok(())
    }

    /// Run up to `steps` contraction steps, or until the volume would drop
    /// below `abort_ratio` of the initial volume.
    ///
    /// A step that would cross the ratio is undone, so afterwards
    /// [`Self::volume_ratio`] is at least `abort_ratio`. Returns the number of
    /// steps kept. Without a step count, runs at most [`MAX_UNBOUNDED_STEPS`].
    pub fn contract(
        &mut self,
        steps: Option<usize>,
        abort_ratio: f64,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<usize> {
        if !self.finalized {
            return Err(KernelError::NotFinalized {
                operation: "contract",
            }
            .reported());
        }
        if steps.is_none() && !(abort_ratio > 0.0 && abort_ratio <= 1.0) {
            return Err(KernelError::invalid_parameter(
                "abort_ratio",
                abort_ratio,
                "must be within (0, 1] when steps are unbounded",
            )
            .reported());
        }

        let before = self.num_triangles();
        let _timer = OperationTimer::with_context("contract", before, self.vertices.len());
        let budget = steps.unwrap_or(MAX_UNBOUNDED_STEPS);
        let h = self.cell_size;

        let mut progress = HierarchicalProgress::new(100, progress);
        progress.set_subtask_work(100, Some("Contract"));
        let mut taken = 0;
        while taken < budget {
            report_every(&mut progress, taken, budget, 0);
            let snapshot = self.snapshot();

            self.contraction_step();
            self.subdivide(1.5 * h);
            self.collapse(0.3 * h);
            debug_assert!(self.check_neighbors());

            let (_, volume) = self.area_and_volume();
            if self.initial_volume > 0.0 && volume / self.initial_volume < abort_ratio {
                trace!(volume, "step crosses the abort ratio, undone");
                self.restore(snapshot);
                break;
            }
            self.current_volume = volume;
            taken += 1;
            trace!(step = taken, ratio = self.volume_ratio(), "contraction step");
        }
        progress.complete_subtask();

        log_reduction_result("contract", before, self.num_triangles(), taken);
        debug!(ratio = self.volume_ratio(), "contraction finished");
        Ok(taken)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            vertices: self.vertices.clone(),
            indices: self.indices.clone(),
            neighbors: self.neighbors.clone(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.vertices = snapshot.vertices;
        self.indices = snapshot.indices;
        self.neighbors = snapshot.neighbors;
    }

    /// Push locally double-sided regions apart.
    ///
    /// Around every fold, where a triangle meets a neighbor facing the other
    /// way, the triangles within two cells are gathered. If enough of them
    /// have an opposite partner, the region is treated as two sheets lying on
    /// each other and displaced away from its center of mass, as far as the
    /// distance field allows.
    pub fn expand_border(&mut self) -> KernelResult<()> {
        if !self.finalized {
            return Err(KernelError::NotFinalized {
                operation: "expand_border",
            }
            .reported());
        }
        let radius = 2.0 * self.cell_size;
        let num_tris = self.num_triangles();
        let centers: Vec<Point3<f64>> = (0..num_tris as u32).map(|t| self.center(t)).collect();
        let normals: Vec<Vector3<f64>> =
            (0..num_tris as u32).map(|t| self.unit_normal(t)).collect();

        let mut hash = SpatialHash::new(radius);
        for (t, c) in centers.iter().enumerate() {
            hash.add_point(c, t as u32);
        }

        let mut field = vec![Vector3::zeros(); self.vertices.len()];
        let mut weights = vec![0.0; self.vertices.len()];
        let mut candidates = Vec::new();
        let mut local: Vec<(u32, f64)> = Vec::new();
        let mut expanded = 0;

        for i in 0..num_tris {
            let ci = centers[i];
            let folded = self.neighbors[3 * i..3 * i + 3]
                .iter()
                .flatten()
                .any(|&adj| normals[i].dot(&normals[adj as usize]) < 0.0);
            if !folded {
                continue;
            }

            candidates.clear();
            let mut query = Bounds::new(ci, ci);
            query.fatten(radius);
            hash.query_unique_bounds(&query, &mut candidates, usize::MAX);
            local.clear();
            local.extend(candidates.iter().filter_map(|&t| {
                let dist = (centers[t as usize] - ci).norm();
                (dist <= radius).then_some((t, dist))
            }));

            let mut double_area = 0.0;
            let mut com = Vector3::zeros();
            let mut total_weight = 0.0;
            for &(tj, _) in &local {
                let area = self.cross(tj).norm();
                total_weight += area;
                com += centers[tj as usize].coords * area;
                let nj = normals[tj as usize];
                if local
                    .iter()
                    .any(|&(tk, _)| nj.dot(&normals[tk as usize]) < -0.999)
                {
                    double_area += area;
                }
            }
            if double_area < 0.5 * std::f64::consts::PI * radius * radius {
                continue;
            }
            if total_weight > 0.0 {
                com /= total_weight;
            }

            let Some(dir) = (ci.coords - com).try_normalize(0.0) else {
                continue;
            };
            let reach = dir * 2.0 * self.cell_size;
            let disp = reach * self.find_min(&ci, &reach);

            let max_dist = local.iter().map(|&(_, d)| d).fold(0.0, f64::max);
            for &(tj, dist) in &local {
                let w = if max_dist != 0.0 {
                    1.0 - dist / max_dist
                } else {
                    1.0
                };
                for k in 0..3 {
                    let v = self.indices[3 * tj as usize + k] as usize;
                    field[v] += disp * w * w;
                    weights[v] += w;
                }
            }
            expanded += 1;
        }

        for ((p, f), &w) in self.vertices.iter_mut().zip(&field).zip(&weights) {
            if w != 0.0 {
                *p += f / w;
            }
        }
        debug!(expanded, "border expansion");
        Ok(())
    }

    /// Step along `max_disp` and return the fraction of it that comes
    /// closest to the original surface.
    fn find_min(&self, p: &Point3<f64>, max_disp: &Vector3<f64>) -> f64 {
        let dt = 1.0 / FIND_MIN_STEPS as f64;
        let mut min_dist = self.interpolate_distance(p).abs();
        let mut min_t = 0.0;
        for i in 1..FIND_MIN_STEPS {
            let t = i as f64 * dt;
            let dist = self.interpolate_distance(&(p + max_disp * t)).abs();
            if dist < min_dist {
                min_t = t;
                min_dist = dist;
            }
        }
        min_t
    }

    fn compute_neighbors(&mut self) {
        // (min vertex, max vertex, slot)
        let mut edges: Vec<(u32, u32, u32)> = Vec::with_capacity(self.indices.len());
        for t in 0..self.num_triangles() {
            for j in 0..3 {
                let a = self.indices[3 * t + j];
                let b = self.indices[3 * t + (j + 1) % 3];
                edges.push((a.min(b), a.max(b), (3 * t + j) as u32));
            }
        }
        edges.sort_unstable();

        self.neighbors = vec![None; self.indices.len()];
        let mut non_manifold = 0;
        for run in edges.chunk_by(|a, b| a.0 == b.0 && a.1 == b.1) {
            match run {
                [e0, e1] => {
                    self.neighbors[e0.2 as usize] = Some(e1.2 / 3);
                    self.neighbors[e1.2 as usize] = Some(e0.2 / 3);
                }
                [_] => {}
                _ => non_manifold += 1,
            }
        }
        if non_manifold > 0 {
            debug!(non_manifold, "edges shared by more than two triangles left unlinked");
        }
    }

    fn compute_signed_distance_field(&mut self) {
        for t in 0..self.num_triangles() {
            let p = [0, 1, 2].map(|k| self.vertices[self.indices[3 * t + k] as usize] - self.origin);
            self.stamp_triangle(&p);
        }

        // fast marching from the stamped cells
        let mut front = PriorityQueue::new();
        let [nx, ny, nz] = self.num;
        for x in 0..nx - 1 {
            for y in 0..ny - 1 {
                for z in 0..nz - 1 {
                    let cell = &self.grid[self.cell_index([x, y, z])];
                    if cell.marked {
                        front.push(FrontCell {
                            coord: [x, y, z],
                            value: cell.distance,
                        });
                    }
                }
            }
        }

        while let Some(fc) = front.pop() {
            let i = self.cell_index(fc.coord);
            self.grid[i].marked = true;
            for axis in 0..3 {
                for forward in [false, true] {
                    let mut n = fc.coord;
                    if forward {
                        if n[axis] + 1 >= self.num[axis] {
                            continue;
                        }
                        n[axis] += 1;
                    } else {
                        if n[axis] == 0 {
                            continue;
                        }
                        n[axis] -= 1;
                    }
                    if self.update_distance(n) {
                        front.push(FrontCell {
                            coord: n,
                            value: self.grid[self.cell_index(n)].distance,
                        });
                    }
                }
            }
        }

        self.set_inside_outside();
        for cell in &mut self.grid {
            // majority of the 6 scans
            if cell.inside < 3 {
                cell.distance = -cell.distance;
            }
        }
    }

    /// Record where axis-parallel rays through the grid points pierce the
    /// triangle, with exact distances in the cells around each hit.
    fn stamp_triangle(&mut self, p: &[Vector3<f64>; 3]) {
        let h = self.cell_size;
        let inv_h = 1.0 / h;
        let mut bounds = Bounds::empty();
        for v in p {
            bounds.include(&Point3::from(*v));
        }
        bounds.fatten(0.01 * h);

        let n = (p[1] - p[0]).cross(&(p[2] - p[0]));
        let d = n.dot(&p[0]);
        let num = self.num.map(|n| n as i64);
        let lo = [0, 1, 2].map(|a| ((bounds.min[a] * inv_h).floor() as i64 + 1).max(0));
        let hi = [0, 1, 2].map(|a| ((bounds.max[a] * inv_h).floor() as i64).min(num[a] - 1));

        for dim0 in 0..3 {
            if n[dim0] == 0.0 {
                continue;
            }
            let dim1 = (dim0 + 1) % 3;
            let dim2 = (dim0 + 2) % 3;
            for c1 in lo[dim1]..=hi[dim1] {
                for c2 in lo[dim2]..=hi[dim2] {
                    let axis1 = (c1 as f64 + RAY_OFFSET) * h;
                    let axis2 = (c2 as f64 + RAY_OFFSET) * h;
                    let edge = |a: &Vector3<f64>, b: &Vector3<f64>| {
                        (b[dim1] - a[dim1]) * (axis2 - a[dim2]) - (axis1 - a[dim1]) * (b[dim2] - a[dim2])
                    };
                    let e = [edge(&p[0], &p[1]), edge(&p[1], &p[2]), edge(&p[2], &p[0])];
                    let missed = if n[dim0] > 0.0 {
                        e.iter().any(|&x| x < 0.0)
                    } else {
                        e.iter().any(|&x| x > 0.0)
                    };
                    if missed {
                        continue;
                    }

                    let pos = (d - axis1 * n[dim1] - axis2 * n[dim2]) / n[dim0];
                    let c0 = (pos * inv_h).floor() as i64;
                    if c0 < 0 || c0 >= num[dim0] {
                        continue;
                    }
                    let mut coord = [0usize; 3];
                    coord[dim0] = c0 as usize;
                    coord[dim1] = c1 as usize;
                    coord[dim2] = c2 as usize;

                    let i = self.cell_index(coord);
                    let cell = &mut self.grid[i];
                    cell.num_cuts[dim0] = cell.num_cuts[dim0].wrapping_add(1);
                    let dist = (pos - c0 as f64 * h).abs() * inv_h;
                    if dist < cell.distance {
                        cell.distance = dist;
                        cell.marked = true;
                    }

                    if c0 < num[dim0] - 1 {
                        coord[dim0] += 1;
                        let i = self.cell_index(coord);
                        let next = &mut self.grid[i];
                        if 1.0 - dist < next.distance {
                            next.distance = 1.0 - dist;
                            next.marked = true;
                        }
                    }
                }
            }
        }
    }

    /// Solve the upwind stencil at an unfrozen cell. Returns whether its
    /// distance dropped.
    fn update_distance(&mut self, coord: [usize; 3]) -> bool {
        let i = self.cell_index(coord);
        if self.grid[i].marked {
            return false;
        }

        // a d^2 + b d + c = 0 over the frozen neighbors
        let (mut a, mut b, mut c) = (0.0, 0.0, -1.0);
        for axis in 0..3 {
            let mut min = f64::MAX;
            if coord[axis] > 0 {
                let mut n = coord;
                n[axis] -= 1;
                let cell = &self.grid[self.cell_index(n)];
                if cell.marked {
                    min = cell.distance;
                }
            }
            if coord[axis] + 1 < self.num[axis] {
                let mut n = coord;
                n[axis] += 1;
                let cell = &self.grid[self.cell_index(n)];
                if cell.marked && cell.distance < min {
                    min = cell.distance;
                }
            }
            if min != f64::MAX {
                a += 1.0;
                b -= 2.0 * min;
                c += min * min;
            }
        }
        if a == 0.0 {
            return false;
        }

        // distances grow away from the front: take the larger root
        let disc = (b * b - 4.0 * a * c).max(0.0);
        let distance = (-b + disc.sqrt()) / (2.0 * a);
        if distance < self.grid[i].distance {
            self.grid[i].distance = distance;
            return true;
        }
        false
    }

    /// Parity scans along every axis line, in both directions.
    fn set_inside_outside(&mut self) {
        let num = self.num;
        for dim0 in 0..3 {
            let dim1 = (dim0 + 1) % 3;
            let dim2 = (dim0 + 2) % 3;
            for c1 in 0..num[dim1] {
                for c2 in 0..num[dim2] {
                    let mut coord = [0usize; 3];
                    coord[dim1] = c1;
                    coord[dim2] = c2;

                    let mut inside = false;
                    for c0 in 0..num[dim0] {
                        coord[dim0] = c0;
                        let i = self.cell_index(coord);
                        let cell = &mut self.grid[i];
                        if inside {
                            cell.inside += 1;
                        }
                        if cell.num_cuts[dim0] % 2 == 1 {
                            inside = !inside;
                        }
                    }

                    let mut inside = false;
                    for c0 in (0..num[dim0]).rev() {
                        coord[dim0] = c0;
                        let i = self.cell_index(coord);
                        let cell = &mut self.grid[i];
                        if cell.num_cuts[dim0] % 2 == 1 {
                            inside = !inside;
                        }
                        if inside {
                            cell.inside += 1;
                        }
                    }
                }
            }
        }
    }

    #[inline]
    fn cell_index(&self, [x, y, z]: [usize; 3]) -> usize {
        (z * self.num[1] + y) * self.num[0] + x
    }

    #[inline]
    fn distance(&self, coord: [usize; 3]) -> f64 {
        self.grid[self.cell_index(coord)].distance
    }

    /// Grid cell below `p - shift` per axis, clamped so that `span` more
    /// cells follow it, and the unclamped fractional offset inside it.
    fn locate(&self, p: &Point3<f64>, shift: f64, span: usize) -> ([usize; 3], [f64; 3]) {
        let h = self.cell_size;
        let q = p - self.origin;
        let mut base = [0usize; 3];
        let mut frac = [0.0; 3];
        for a in 0..3 {
            let s = q[a] - shift;
            let i = (s / h).floor();
            frac[a] = (s - h * i) / h;
            let hi = self.num[a].saturating_sub(1 + span) as i64;
            base[a] = (i as i64).max(0).min(hi) as usize;
        }
        (base, frac)
    }

    /// Trilinear interpolation of the signed distance, in cell units.
    fn interpolate_distance(&self, p: &Point3<f64>) -> f64 {
        let (base, d) = self.locate(p, 0.0, 1);
        let mut dist = 0.0;
        for corner in 0..8 {
            let mut coord = base;
            let mut w = 1.0;
            for a in 0..3 {
                if corner >> a & 1 == 1 {
                    coord[a] += 1;
                    w *= d[a];
                } else {
                    w *= 1.0 - d[a];
                }
            }
            dist += w * self.distance(coord);
        }
        dist
    }

    /// Distance gradient at `p`.
    ///
    /// Finite differences live on the centers of the grid edges, so along each
    /// component's own axis the lookup is shifted by half a cell, while the
    /// two other axes interpolate between grid points.
    fn interpolate_gradient(&self, p: &Point3<f64>) -> Vector3<f64> {
        let (base0, d0) = self.locate(p, 0.0, 1);
        let (base2, d2) = self.locate(p, 0.5 * self.cell_size, 2);
        let mut grad = Vector3::zeros();
        for a in 0..3 {
            let b = (a + 1) % 3;
            let c = (a + 2) % 3;
            for ob in 0..2 {
                for oc in 0..2 {
                    let wb = if ob == 1 { d0[b] } else { 1.0 - d0[b] };
                    let wc = if oc == 1 { d0[c] } else { 1.0 - d0[c] };
                    let mut coord = [0usize; 3];
                    coord[b] = base0[b] + ob;
                    coord[c] = base0[c] + oc;
                    let at = |k: usize| {
                        let mut coord = coord;
                        coord[a] = base2[a] + k;
                        self.distance(coord)
                    };
                    let mid = at(1);
                    let lower = mid - at(0);
                    let upper = at(2) - mid;
                    grad[a] += wb * wc * ((1.0 - d2[a]) * lower + d2[a] * upper);
                }
            }
        }
        grad
    }

    /// Signed distance to the registered surface in world units, positive
    /// inside. `None` before finalization.
    pub fn distance_at(&self, p: &Point3<f64>) -> Option<f64> {
        self.finalized
            .then(|| self.interpolate_distance(p) * self.cell_size)
    }

    fn contraction_step(&mut self) {
        self.curvatures.clear();
        self.curvatures.resize(self.vertices.len(), 0.0);
        for t in 0..self.num_triangles() {
            for j in 0..3 {
                let v = self.indices[3 * t + j];
                if self.curvatures[v as usize] == 0.0 {
                    self.curvatures[v as usize] = self.curvature_at(t as u32, v);
                }
            }
        }

        let s = 0.1 * self.cell_size;
        for i in 0..self.vertices.len() {
            let grad = self.interpolate_gradient(&self.vertices[i]);
            // creases move less
            self.vertices[i] += grad * s * (1.0 - self.curvatures[i]);
        }
    }

    /// Half of one minus the smallest dihedral cosine around `v`: 0 on flat
    /// regions, 1 on a fully folded crease.
    fn curvature_at(&self, tri: u32, v: u32) -> f64 {
        let mut min_dot: f64 = 1.0;
        let mut prev = None;
        let mut t = Some(tri);
        for _ in 0..self.num_triangles() {
            let Some(cur) = t else { break };
            let next = self.advance_adj_triangle(v, cur, prev);
            prev = Some(cur);
            t = next;
            let Some(n) = next else { break };
            if n == tri {
                break;
            }
            min_dot = min_dot.min(self.unit_normal(cur).dot(&self.unit_normal(n)));
        }
        (1.0 - min_dot) * 0.5
    }

    /// Split every edge of the current triangles longer than `spacing` at its
    /// midpoint, together with the triangle across it.
    fn subdivide(&mut self, spacing: f64) {
        let min2 = spacing * spacing;
        let num_tris = self.num_triangles() as u32;
        for tri in 0..num_tris {
            for j in 0..3 {
                let base = 3 * tri as usize;
                let k = (j + 1) % 3;
                let v0 = self.indices[base + j];
                let v1 = self.indices[base + k];
                let (p0, p1) = (self.vertices[v0 as usize], self.vertices[v1 as usize]);
                if (p1 - p0).norm_squared() < min2 {
                    continue;
                }
                let Some(v) = self.opposite_vertex(tri, v0, v1) else {
                    continue;
                };
                let adj = self.neighbors[base + j].and_then(|adj| {
                    let w = self.opposite_vertex(adj, v0, v1)?;
                    let slot = self.edge_slot(adj, v1, w)?;
                    Some((adj, w, slot))
                });

                let new_vert = self.vertices.len() as u32;
                self.vertices.push(nalgebra::center(&p0, &p1));
                let new_tri = self.num_triangles() as u32;
                let new_adj = adj.map(|_| new_tri + 1);

                // tri keeps (v0, new, v); new_tri takes (new, v1, v)
                let t1 = self.neighbors[base + k];
                self.indices.extend_from_slice(&[new_vert, v1, v]);
                self.neighbors.extend_from_slice(&[new_adj, t1, Some(tri)]);
                self.replace_vertex(tri, v1, new_vert);
                self.neighbors[base + k] = Some(new_tri);
                if let Some(t1) = t1 {
                    self.replace_neighbor(t1, tri, Some(new_tri));
                }

                if let Some((adj, w, slot)) = adj {
                    // adj keeps (new, v0, w); new_adj takes (new, w, v1)
                    let t3 = self.neighbors[3 * adj as usize + slot];
                    self.indices.extend_from_slice(&[new_vert, w, v1]);
                    self.neighbors.extend_from_slice(&[Some(adj), t3, Some(new_tri)]);
                    self.replace_vertex(adj, v1, new_vert);
                    self.neighbors[3 * adj as usize + slot] = new_adj;
                    if let Some(t3) = t3 {
                        self.replace_neighbor(t3, adj, new_adj);
                    }
                }
            }
        }
    }

    /// Collapse edges shorter than `spacing` to their midpoints where the
    /// topology allows, then drop the removed vertices and triangles.
    fn collapse(&mut self, spacing: f64) {
        let min2 = spacing * spacing;
        let num_tris = self.num_triangles();
        let num_verts = self.vertices.len();
        let mut vertex_removed = vec![false; num_verts];
        let mut triangle_removed = vec![false; num_tris];

        for tri in 0..num_tris {
            if triangle_removed[tri] {
                continue;
            }
            let tri32 = tri as u32;
            for j in 0..3 {
                let v0 = self.indices[3 * tri + j];
                let v1 = self.indices[3 * tri + (j + 1) % 3];
                let (p0, p1) = (self.vertices[v0 as usize], self.vertices[v1 as usize]);
                if (p1 - p0).norm_squared() > min2 {
                    continue;
                }
                if !self.legal_collapse(tri32, v0, v1) {
                    continue;
                }
                let fly = self.butterfly(tri32, v0, v1);
                self.vertices[v0 as usize] = nalgebra::center(&p0, &p1);

                // move the fan of v1 over to v0
                let mut prev = Some(tri32);
                let mut t = fly.t1;
                for _ in 0..num_tris {
                    let Some(cur) = t else { break };
                    self.replace_vertex(cur, v1, v0);
                    t = self.advance_adj_triangle(v1, cur, prev);
                    prev = Some(cur);
                    if t == Some(tri32) {
                        break;
                    }
                }

                // close the gaps left by tri and adj
                if let Some(t0) = fly.t0 {
                    self.replace_neighbor(t0, tri32, fly.t1);
                }
                if let Some(t1) = fly.t1 {
                    self.replace_neighbor(t1, tri32, fly.t0);
                }
                if let Some(adj) = fly.adj {
                    if let Some(t2) = fly.t2 {
                        self.replace_neighbor(t2, adj, fly.t3);
                    }
                    if let Some(t3) = fly.t3 {
                        self.replace_neighbor(t3, adj, fly.t2);
                    }
                    triangle_removed[adj as usize] = true;
                }
                vertex_removed[v1 as usize] = true;
                triangle_removed[tri] = true;
                break;
            }
        }

        // compress
        let mut vertex_map = vec![u32::MAX; num_verts];
        let mut next = 0;
        for i in 0..num_verts {
            if !vertex_removed[i] {
                vertex_map[i] = next as u32;
                self.vertices[next] = self.vertices[i];
                next += 1;
            }
        }
        self.vertices.truncate(next);

        let mut triangle_map = vec![None; num_tris];
        let mut next = 0;
        for i in 0..num_tris {
            if triangle_removed[i] {
                continue;
            }
            triangle_map[i] = Some(next as u32);
            for j in 0..3 {
                self.indices[3 * next + j] = vertex_map[self.indices[3 * i + j] as usize];
                self.neighbors[3 * next + j] = self.neighbors[3 * i + j];
            }
            next += 1;
        }
        self.indices.truncate(3 * next);
        self.neighbors.truncate(3 * next);
        for n in &mut self.neighbors {
            *n = n.and_then(|t| triangle_map[t as usize]);
        }
    }

    fn legal_collapse(&self, tri: u32, v0: u32, v1: u32) -> bool {
        let fly = self.butterfly(tri, v0, v1);
        let cap = self.num_triangles();

        // both end vertices must be surrounded by triangles
        if !self.fan_closes(tri, v0, fly.t0) || !self.fan_closes(tri, v1, fly.t1) {
            return false;
        }

        // a vertex connected to both ends must form a triangle with them
        let Some(mut shared) = self.opposite_vertex(tri, v0, v1) else {
            return false;
        };
        let mut prev = Some(tri);
        let mut t = fly.t1;
        for _ in 0..cap {
            let Some(cur) = t else { break };
            if Some(cur) != fly.t1 {
                let mut prev2 = prev;
                let mut t2 = Some(cur);
                for _ in 0..cap {
                    let Some(c2) = t2 else { break };
                    if self.triangle_contains(c2, v0) {
                        return false;
                    }
                    t2 = self.advance_adj_triangle(shared, c2, prev2);
                    prev2 = Some(c2);
                    if t2 == Some(cur) {
                        break;
                    }
                }
            }
            let Some(next_shared) = self.opposite_vertex(cur, v1, shared) else {
                return false;
            };
            shared = next_shared;
            t = self.advance_adj_triangle(v1, cur, prev);
            prev = Some(cur);
            if t == Some(tri) || t == fly.adj {
                break;
            }
        }

        !self.are_neighbors(fly.t0, fly.t1) && !self.are_neighbors(fly.t2, fly.t3)
    }

    /// Whether walking around `v` from `start` gets back to `tri`.
    fn fan_closes(&self, tri: u32, v: u32, start: Option<u32>) -> bool {
        let mut prev = Some(tri);
        let mut t = start;
        for _ in 0..self.num_triangles() {
            let Some(cur) = t else { return false };
            t = self.advance_adj_triangle(v, cur, prev);
            prev = Some(cur);
            if t == Some(tri) {
                return true;
            }
        }
        false
    }

    fn butterfly(&self, tri: u32, v0: u32, v1: u32) -> Butterfly {
        let mut fly = Butterfly::default();
        for &n in self.neighbors[3 * tri as usize..3 * tri as usize + 3].iter().flatten() {
            let has0 = self.triangle_contains(n, v0);
            let has1 = self.triangle_contains(n, v1);
            match (has0, has1) {
                (true, true) => fly.adj = Some(n),
                (true, false) => fly.t0 = Some(n),
                (false, true) => fly.t1 = Some(n),
                (false, false) => {}
            }
        }
        if let Some(adj) = fly.adj {
            for &n in self.neighbors[3 * adj as usize..3 * adj as usize + 3].iter().flatten() {
                if n == tri {
                    continue;
                }
                if self.triangle_contains(n, v0) {
                    fly.t2 = Some(n);
                } else if self.triangle_contains(n, v1) {
                    fly.t3 = Some(n);
                }
            }
        }
        fly
    }

    /// The last neighbor of `t` other than `prev` that contains `v`.
    fn advance_adj_triangle(&self, v: u32, t: u32, prev: Option<u32>) -> Option<u32> {
        self.neighbors[3 * t as usize..3 * t as usize + 3]
            .iter()
            .rev()
            .flatten()
            .copied()
            .find(|&n| Some(n) != prev && self.triangle_contains(n, v))
    }

    fn are_neighbors(&self, t0: Option<u32>, t1: Option<u32>) -> bool {
        t0.is_some_and(|t0| self.neighbors[3 * t0 as usize..3 * t0 as usize + 3].contains(&t1))
    }

    #[inline]
    fn triangle(&self, t: u32) -> &[u32] {
        &self.indices[3 * t as usize..3 * t as usize + 3]
    }

    #[inline]
    fn triangle_contains(&self, t: u32, v: u32) -> bool {
        self.triangle(t).contains(&v)
    }

    fn opposite_vertex(&self, t: u32, v0: u32, v1: u32) -> Option<u32> {
        self.triangle(t).iter().copied().find(|&v| v != v0 && v != v1)
    }

    /// Slot of the edge between `a` and `b` in triangle `t`.
    fn edge_slot(&self, t: u32, a: u32, b: u32) -> Option<usize> {
        let tri = self.triangle(t);
        (0..3).find(|&j| {
            let (p, q) = (tri[j], tri[(j + 1) % 3]);
            (p == a && q == b) || (p == b && q == a)
        })
    }

    fn replace_vertex(&mut self, t: u32, old: u32, new: u32) {
        for v in &mut self.indices[3 * t as usize..3 * t as usize + 3] {
            if *v == old {
                *v = new;
            }
        }
    }

    fn replace_neighbor(&mut self, t: u32, old: u32, new: Option<u32>) {
        for n in &mut self.neighbors[3 * t as usize..3 * t as usize + 3] {
            if *n == Some(old) {
                *n = new;
            }
        }
    }

    fn cross(&self, t: u32) -> Vector3<f64> {
        let [p0, p1, p2] = [0, 1, 2].map(|k| self.vertices[self.indices[3 * t as usize + k] as usize]);
        (p1 - p0).cross(&(p2 - p0))
    }

    fn unit_normal(&self, t: u32) -> Vector3<f64> {
        self.cross(t).try_normalize(0.0).unwrap_or_else(Vector3::zeros)
    }

    fn center(&self, t: u32) -> Point3<f64> {
        let c = self
            .triangle(t)
            .iter()
            .fold(Vector3::zeros(), |acc, &v| acc + self.vertices[v as usize].coords);
        Point3::from(c / 3.0)
    }

    /// Surface area and signed enclosed volume.
    fn area_and_volume(&self) -> (f64, f64) {
        let mut area = 0.0;
        let mut volume = 0.0;
        for t in 0..self.num_triangles() as u32 {
            let n = self.cross(t);
            area += n.norm();
            volume += n.dot(&self.vertices[self.indices[3 * t as usize] as usize].coords);
        }
        (area / 2.0, volume / 6.0)
    }

    fn num_triangles(&self) -> usize {
        self.indices.len() / 3
    }

    /// Volume enclosed after finalization.
    pub fn initial_volume(&self) -> f64 {
        self.initial_volume
    }

    /// Volume enclosed after the last kept contraction step.
    pub fn current_volume(&self) -> f64 {
        self.current_volume
    }

    /// `current_volume / initial_volume`, 1 when there was no initial volume.
    pub fn volume_ratio(&self) -> f64 {
        if self.initial_volume > 0.0 {
            self.current_volume / self.initial_volume
        } else {
            1.0
        }
    }

    /// Edge length of a distance field cell.
    pub fn cell_size(&self) -> f64 {
        self.cell_size
    }

    /// Check that every neighbor link is mutual and spans a shared edge.
    pub fn check_neighbors(&self) -> bool {
        if self.neighbors.len() != self.indices.len() {
            return false;
        }
        (0..self.num_triangles() as u32).all(|t| {
            (0..3).all(|j| {
                let Some(n) = self.neighbors[3 * t as usize + j] else {
                    return true;
                };
                let tri = self.triangle(t);
                let (a, b) = (tri[j], tri[(j + 1) % 3]);
                self.edge_slot(n, a, b)
                    .is_some_and(|s| self.neighbors[3 * n as usize + s] == Some(t))
            })
        })
    }

    /// Current vertex positions.
    pub fn vertices(&self) -> &[Point3<f64>] {
        &self.vertices
    }

    /// Current triangles as flat index triples.
    pub fn indices(&self) -> &[u32] {
        &self.indices
    }
}

impl MeshReducer for DistanceFieldContractor {
    type Params = ContractParams;

    fn register_vertex(&mut self, position: Point3<f64>) -> KernelResult<u32> {
        DistanceFieldContractor::register_vertex(self, position)
    }

    fn register_triangle(&mut self, v0: u32, v1: u32, v2: u32) -> KernelResult<()> {
        DistanceFieldContractor::register_triangle(self, v0, v1, v2)
    }

    fn end_registration(
        &mut self,
        params: &ContractParams,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<()> {
        params.validate()?;
        DistanceFieldContractor::end_registration(self, params.subdivision, progress)
    }

    fn reduce(
        &mut self,
        params: &ContractParams,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<usize> {
        params.validate()?;
        let steps = self.contract(params.steps, params.abort_ratio, progress)?;
        if params.expand_border {
            self.expand_border()?;
        }
        Ok(steps)
    }

    fn remaining_vertices(&self) -> usize {
        self.vertices.len()
    }

    fn remaining_triangles(&self) -> usize {
        self.num_triangles()
    }

    fn to_mesh(&self) -> TriangleMesh {
        TriangleMesh {
            vertices: self.vertices.iter().map(|&p| Vertex::new(p)).collect(),
            triangles: self
                .indices
                .chunks_exact(3)
                .map(|t| [t[0], t[1], t[2]])
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressRecorder;
    use approx::assert_relative_eq;

    fn contractor_for(mesh: &TriangleMesh, subdivision: u32) -> DistanceFieldContractor {
        let mut contractor = DistanceFieldContractor::new();
        contractor.register_mesh(mesh).unwrap();
        contractor.end_registration(subdivision, None).unwrap();
        contractor
    }

    fn unit_sphere() -> TriangleMesh {
        TriangleMesh::sphere(Point3::origin(), 1.0, 3)
    }

    #[test]
    fn test_neighbors_of_closed_mesh_are_mutual() {
        let cuboid = TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 2.0, 3.0));
        let contractor = contractor_for(&cuboid, 10);
        assert!(contractor.neighbors.iter().all(Option::is_some));
        assert!(contractor.check_neighbors());
        assert_relative_eq!(contractor.initial_volume(), 6.0, epsilon = 1e-9);
    }

    #[test]
    fn test_open_sheet_has_border_slots() {
        let sheet = TriangleMesh::from_parts(
            &[
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(0.0, 1.0, 0.0),
            ],
            &[[0, 1, 2], [0, 2, 3]],
        );
        let contractor = contractor_for(&sheet, 4);
        assert_eq!(contractor.neighbors.iter().flatten().count(), 2);
        assert!(contractor.check_neighbors());
    }

    #[test]
    fn test_huge_subdivision_is_clamped() {
        let bar = TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 0.02, 0.02));
        let contractor = contractor_for(&bar, 50_000);
        let expected = bar.bounds().diagonal() / MAX_CONTRACT_SUBDIVISION as f64;
        assert_relative_eq!(contractor.cell_size(), expected, epsilon = 1e-12);
        // the long axis plus two cells of padding on either side
        let limit = MAX_CONTRACT_SUBDIVISION as usize + 5;
        assert!(contractor.num.iter().all(|&n| n <= limit), "{:?}", contractor.num);
        assert_eq!(contractor.grid.len(), contractor.num.iter().product::<usize>());
    }

    #[test]
    fn test_distance_field_sign() {
        let contractor = contractor_for(&unit_sphere(), 20);
        let h = contractor.cell_size();
        let center = contractor.distance_at(&Point3::origin()).unwrap();
        // the first-order marched depth falls short of the exact 1.0 at the center
        assert!(center > 0.7 && center <= 1.0, "center distance {center}");
        let outside = contractor.distance_at(&Point3::new(1.0 + 1.5 * h, 0.0, 0.0)).unwrap();
        assert!(outside < 0.0, "outside distance {outside}");
        // near the surface the field is close to exact
        let near = contractor.distance_at(&Point3::new(0.0, 0.0, 0.8)).unwrap();
        assert!((near - 0.2).abs() < h, "near distance {near}");
    }

    #[test]
    fn test_gradient_points_inward() {
        let contractor = contractor_for(&unit_sphere(), 20);
        let grad = contractor.interpolate_gradient(&Point3::new(0.9, 0.0, 0.0));
        assert!(grad.x < 0.0);
        assert!(grad.x.abs() > grad.y.abs() && grad.x.abs() > grad.z.abs());
    }

    #[test]
    fn test_subdivide_keeps_volume_and_adjacency() {
        let mut contractor = contractor_for(
            &TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 1.0, 1.0)),
            4,
        );
        contractor.subdivide(0.6);
        assert!(contractor.num_triangles() > 12);
        assert!(contractor.check_neighbors());
        assert!(contractor.neighbors.iter().all(Option::is_some));
        assert!(contractor.to_mesh().border_edges().is_empty());
        let (area, volume) = contractor.area_and_volume();
        assert_relative_eq!(volume, 1.0, epsilon = 1e-9);
        assert_relative_eq!(area, 6.0, epsilon = 1e-9);
    }

    #[test]
    fn test_collapse_keeps_mesh_closed() {
        let mut contractor = contractor_for(&unit_sphere(), 10);
        let before = contractor.num_triangles();
        contractor.collapse(0.3);
        assert!(contractor.num_triangles() < before);
        assert!(contractor.check_neighbors());
        let mesh = contractor.to_mesh();
        assert!(mesh.border_edges().is_empty());
        assert_eq!(mesh.triangle_count() % 2, 0);
        assert!(mesh.triangles.iter().all(|t| (t[0] as usize) < mesh.vertex_count()));
    }

    #[test]
    fn test_contract_shrinks_and_respects_ratio() {
        let mut contractor = contractor_for(&unit_sphere(), 20);
        let steps = contractor.contract(Some(3), 0.5, None).unwrap();
        assert_eq!(steps, 3);
        let ratio = contractor.volume_ratio();
        assert!(ratio < 1.0 && ratio >= 0.5, "ratio {ratio}");
        assert!(contractor.check_neighbors());
        assert!(contractor.to_mesh().border_edges().is_empty());
        for p in contractor.vertices() {
            assert!(p.coords.norm() < 1.0);
        }
    }

    #[test]
    fn test_step_below_ratio_is_undone() {
        let mesh = unit_sphere();
        let mut contractor = contractor_for(&mesh, 20);
        let steps = contractor.contract(None, 0.99, None).unwrap();
        assert_eq!(steps, 0);
        assert_relative_eq!(contractor.volume_ratio(), 1.0);
        assert_eq!(contractor.to_mesh(), mesh);
    }

    #[test]
    fn test_expand_border_keeps_topology() {
        // a flat pillow: two sheets sharing their rim
        let n = 6;
        let mut positions = Vec::new();
        for j in 0..n {
            for i in 0..n {
                positions.push(Point3::new(i as f64, j as f64, 0.0));
            }
        }
        let rim = |i: usize, j: usize| i == 0 || j == 0 || i == n - 1 || j == n - 1;
        let mut bottom = vec![0u32; n * n];
        for j in 0..n {
            for i in 0..n {
                bottom[j * n + i] = if rim(i, j) {
                    (j * n + i) as u32
                } else {
                    positions.push(Point3::new(i as f64, j as f64, 0.0));
                    (positions.len() - 1) as u32
                };
            }
        }
        let mut triangles = Vec::new();
        for j in 0..n - 1 {
            for i in 0..n - 1 {
                let a = j * n + i;
                let (b, c, d) = (a + 1, a + n + 1, a + n);
                triangles.push([a as u32, b as u32, c as u32]);
                triangles.push([a as u32, c as u32, d as u32]);
                triangles.push([bottom[a], bottom[c], bottom[b]]);
                triangles.push([bottom[a], bottom[d], bottom[c]]);
            }
        }
        let pillow = TriangleMesh::from_parts(&positions, &triangles);
        assert!(pillow.border_edges().is_empty());

        let mut contractor = contractor_for(&pillow, 8);
        assert!(contractor.check_neighbors());
        contractor.expand_border().unwrap();
        assert!(contractor.check_neighbors());
        assert_eq!(contractor.vertices().len(), positions.len());
        assert!(contractor.vertices().iter().all(|p| p.coords.iter().all(|c| c.is_finite())));
    }

    #[test]
    fn test_protocol_errors() {
        let mut contractor = DistanceFieldContractor::new();
        assert!(contractor.contract(Some(1), 0.5, None).is_err());
        assert!(contractor.distance_at(&Point3::origin()).is_none());
        assert!(contractor.end_registration(10, None).is_err());
        contractor.register_vertex(Point3::origin()).unwrap();
        assert!(contractor.register_triangle(0, 0, 3).is_err());
        // degenerate, skipped
        contractor.register_triangle(0, 0, 0).unwrap();
        assert!(contractor.end_registration(10, None).is_err());

        let mut contractor = contractor_for(&unit_sphere(), 10);
        assert!(contractor.register_vertex(Point3::origin()).is_err());
        assert!(contractor.end_registration(10, None).is_err());
        assert!(contractor.contract(None, 0.0, None).is_err());
        assert_eq!(contractor.contract(Some(0), 0.5, None).unwrap(), 0);
        contractor.clear();
        assert!(!contractor.is_finalized());
    }

    #[test]
    fn test_reducer_trait_and_progress() {
        let mut contractor = DistanceFieldContractor::new();
        contractor.register_mesh(&unit_sphere()).unwrap();
        let params = ContractParams {
            subdivision: 20,
            ..ContractParams::with_steps(2)
        };
        let mut recorder = ProgressRecorder::new();
        MeshReducer::end_registration(&mut contractor, &params, Some(&mut recorder)).unwrap();
        assert_eq!(recorder.last_percent(), Some(100));
        assert!(recorder.is_monotonic());

        let mut recorder = ProgressRecorder::new();
        let steps = MeshReducer::reduce(&mut contractor, &params, Some(&mut recorder)).unwrap();
        assert_eq!(steps, 2);
        assert_eq!(recorder.last_percent(), Some(100));
        let mesh = MeshReducer::to_mesh(&contractor);
        assert_eq!(mesh.triangle_count(), MeshReducer::remaining_triangles(&contractor));
        assert!(mesh.signed_volume() > 0.0);
    }
}
