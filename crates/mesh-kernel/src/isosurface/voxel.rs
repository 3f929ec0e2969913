//! Marching cubes over a stamped density grid.
//!
//! Every registered triangle raises the density of the grid nodes within one
//! cell width to `1 - distance / width`, keeping the maximum over triangles.
//! A flood fill from the grid boundary then marks every node it cannot reach
//! through low density as inside, so closed input produces a single outer
//! surface instead of a thin double-sided shell.
//!
//! The grid is dense. Its width is the bounds diagonal over the clamped
//! subdivision, so no axis holds more than a few nodes beyond
//! [`MAX_ISO_SUBDIVISION`](super::MAX_ISO_SUBDIVISION).

use super::cube::{CORNER_OFFSETS, case_table, edge_origin};
use super::postprocess::IsoSoup;
use super::{IsoParams, IsoStats, IsosurfaceExtractor, finish_soup};
use crate::error::{KernelError, KernelResult};
use crate::geometry::point_triangle_distance;
use crate::progress::{HierarchicalProgress, ProgressListener, report_every};
use crate::tracing_ext::{OperationTimer, log_mesh_stats};
use crate::types::{Bounds, TriangleMesh};
use nalgebra::Point3;
use tracing::debug;

const ISO_VALUE: f32 = 0.5;

/// Grid margin around the input, in cells.
const MARGIN: f64 = 1.5;

#[derive(Debug, Clone, Copy)]
struct GridNode {
    density: f32,
    vert_refs: [i32; 3],
}

impl Default for GridNode {
    fn default() -> Self {
        Self {
            density: 0.0,
            vert_refs: [-1; 3],
        }
    }
}

/// Grid aligned to integer multiples of the cell width.
struct DensityGrid {
    origin: [i64; 3],
    dims: [usize; 3],
    strides: [usize; 3],
    width: f64,
    nodes: Vec<GridNode>,
    outside: Vec<bool>,
}

impl DensityGrid {
    fn new(bounds: &Bounds, width: f64) -> Self {
        let mut origin = [0i64; 3];
        let mut dims = [0usize; 3];
        for k in 0..3 {
            let lo = (bounds.min[k] / width - MARGIN).floor() as i64;
            let hi = (bounds.max[k] / width + MARGIN).ceil() as i64;
            origin[k] = lo;
            dims[k] = (hi - lo + 1) as usize;
        }
        let strides = [1, dims[0], dims[0] * dims[1]];
        let total = dims[0] * dims[1] * dims[2];
        Self {
            origin,
            dims,
            strides,
            width,
            nodes: vec![GridNode::default(); total],
            outside: vec![false; total],
        }
    }

    fn total(&self) -> usize {
        self.dims[0] * self.dims[1] * self.dims[2]
    }

    /// Nodes within one cell width of some triangle.
    fn touched(&self) -> usize {
        self.nodes.iter().filter(|n| n.density > 0.0).count()
    }

    #[inline]
    fn index(&self, x: usize, y: usize, z: usize) -> usize {
        x + self.strides[1] * y + self.strides[2] * z
    }

    fn coords(&self, i: usize) -> [usize; 3] {
        [
            i % self.dims[0],
            (i / self.dims[0]) % self.dims[1],
            i / self.strides[2],
        ]
    }

    fn position(&self, i: usize) -> Point3<f64> {
        let c = self.coords(i);
        Point3::new(
            (self.origin[0] + c[0] as i64) as f64 * self.width,
            (self.origin[1] + c[1] as i64) as f64 * self.width,
            (self.origin[2] + c[2] as i64) as f64 * self.width,
        )
    }

    /// Node index range covering `[lo, hi]` along axis `k`.
    fn node_range(&self, k: usize, lo: f64, hi: f64) -> (usize, usize) {
        let max = self.dims[k] as i64 - 1;
        let first = ((lo / self.width).ceil() as i64 - self.origin[k]).clamp(0, max);
        let last = ((hi / self.width).floor() as i64 - self.origin[k]).clamp(0, max);
        (first as usize, last as usize)
    }

    fn stamp(&mut self, p: &[Point3<f64>; 3]) {
        let mut bounds = Bounds::from_points(p.iter());
        bounds.fatten(self.width);
        let (x0, x1) = self.node_range(0, bounds.min.x, bounds.max.x);
        let (y0, y1) = self.node_range(1, bounds.min.y, bounds.max.y);
        let (z0, z1) = self.node_range(2, bounds.min.z, bounds.max.z);
        for z in z0..=z1 {
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let i = self.index(x, y, z);
                    let d = point_triangle_distance(&self.position(i), &p[0], &p[1], &p[2]);
                    if d >= self.width {
                        continue;
                    }
                    let density = (1.0 - d / self.width) as f32;
                    let node = &mut self.nodes[i];
                    node.density = node.density.max(density);
                }
            }
        }
    }

    /// Flood the low-density region connected to the grid boundary.
    fn mark_outside(&mut self) {
        let mut stack = vec![0usize];
        while let Some(i) = stack.pop() {
            if self.outside[i] || self.nodes[i].density >= ISO_VALUE {
                continue;
            }
            self.outside[i] = true;
            let c = self.coords(i);
            for k in 0..3 {
                if c[k] > 0 {
                    stack.push(i - self.strides[k]);
                }
                if c[k] + 1 < self.dims[k] {
                    stack.push(i + self.strides[k]);
                }
            }
        }
    }

    /// Density with enclosed empty space counted as solid.
    #[inline]
    fn value(&self, i: usize) -> f32 {
        let density = self.nodes[i].density;
        if !self.outside[i] && density < ISO_VALUE {
            1.0
        } else {
            density
        }
    }

    fn isovertex(&mut self, i: usize, axis: usize, vertices: &mut Vec<Point3<f64>>) -> u32 {
        let existing = self.nodes[i].vert_refs[axis];
        if existing >= 0 {
            return existing as u32;
        }
        let j = i + self.strides[axis];
        let (va, vb) = (self.value(i), self.value(j));
        let t = if va == vb {
            0.5
        } else {
            ((ISO_VALUE - va) / (vb - va)).clamp(0.01, 0.99) as f64
        };
        let (pa, pb) = (self.position(i), self.position(j));
        let nr = vertices.len() as u32;
        vertices.push(pa + (pb - pa) * t);
        self.nodes[i].vert_refs[axis] = nr as i32;
        nr
    }
}

/// Isosurface extractor on a regular density grid (marching cubes).
#[derive(Debug, Clone)]
pub struct VoxelExtractor {
    params: IsoParams,
    bounds: Option<Bounds>,
    triangles: Vec<[Point3<f64>; 3]>,
    mesh: TriangleMesh,
    stats: IsoStats,
}

impl VoxelExtractor {
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

    /// Use a fixed box instead of the bounds of the registered triangles.
    pub fn set_bounds(&mut self, bounds: Bounds) {
        self.bounds = Some(bounds);
    }

    /// Number of registered triangles.
    pub fn num_registered(&self) -> usize {
        self.triangles.len()
    }
}

impl IsosurfaceExtractor for VoxelExtractor {
    fn add_triangle(&mut self, p0: &Point3<f64>, p1: &Point3<f64>, p2: &Point3<f64>) {
        self.triangles.push([*p0, *p1, *p2]);
    }

    fn extract(&mut self, progress: Option<&mut dyn ProgressListener>) -> KernelResult<()> {
        let params = self.params.validated()?;
        if self.triangles.is_empty() {
            return Err(KernelError::empty_mesh("no triangles registered").reported());
        }
        let _timer = OperationTimer::with_context("voxel_isosurface", self.triangles.len(), 0);
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
        let width = diagonal / params.subdivision as f64;
        let mut grid = DensityGrid::new(&bounds, width);

        progress.set_subtask_work(25, Some("Stamp Triangles"));
        let n = self.triangles.len();
        for (i, t) in self.triangles.iter().enumerate() {
            grid.stamp(t);
            report_every(&mut progress, i, n, 0xff);
        }
        stats.cells = grid.touched();
        progress.complete_subtask();

        progress.set_subtask_work(10, Some("Mark Inside"));
        grid.mark_outside();
        progress.complete_subtask();

        progress.set_subtask_work(20, Some("Marching Cubes"));
        let table = case_table();
        let mut vertices = Vec::new();
        let mut triangles = Vec::new();
        let [dx, dy, dz] = grid.dims;
        for z in 0..dz.saturating_sub(1) {
            for y in 0..dy.saturating_sub(1) {
                for x in 0..dx.saturating_sub(1) {
                    let base = grid.index(x, y, z);
                    let mut mask = 0usize;
                    for (c, o) in CORNER_OFFSETS.iter().enumerate() {
                        let i = grid.index(x + o[0] as usize, y + o[1] as usize, z + o[2] as usize);
                        if grid.value(i) >= ISO_VALUE {
                            mask |= 1 << c;
                        }
                    }
                    for local in &table[mask] {
                        let mut tri = [0u32; 3];
                        for (k, &edge) in local.iter().enumerate() {
                            let (o, axis) = edge_origin(edge as usize);
                            let i = base + grid.index(o[0] as usize, o[1] as usize, o[2] as usize);
                            tri[k] = grid.isovertex(i, axis, &mut vertices);
                        }
                        triangles.push(tri);
                    }
                }
            }
            report_every(&mut progress, z, dz, 0x7);
        }
        progress.complete_subtask();
        debug!(
            nodes = grid.total(),
            vertices = vertices.len(),
            triangles = triangles.len(),
            "Marching cubes done"
        );

        let soup = IsoSoup::new(vertices, triangles);
        let mesh = finish_soup(soup, &params, &mut stats, &mut progress);
        log_mesh_stats(&mesh, "voxel isosurface");
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
