//! Edge-collapse simplification with quadric error metrics.
//!
//! Every vertex accumulates the planes of its triangles into a [`Quadric`].
//! An edge's collapse cost is the smallest quadric error found by sampling 11
//! points along it; the edges sit in an [`IndexedHeap`] keyed by that cost.
//! Collapsing an edge merges its second vertex into the first, re-points the
//! edges and triangles of the removed vertex, drops the two triangles around
//! the edge and re-keys every edge touching the survivor.
//!
//! Edges that fail the legality test stay parked behind the heap until the
//! end of the [`QuadricSimplifier::simplify`] call, so a later call can try
//! them again against the changed neighborhood.

use super::{MeshReducer, SimplifyParams, compact_live};
use crate::error::{KernelError, KernelResult};
use crate::priority_queue::IndexedHeap;
use crate::progress::{HierarchicalProgress, ProgressListener, report_every};
use crate::tracing_ext::{OperationTimer, log_reduction_result};
use crate::types::{Bounds, TriangleMesh};
use nalgebra::Point3;
use tracing::{debug, trace};

/// Vertices closer than this fraction of the bounds diagonal are merged.
pub const MERGE_THRESHOLD: f64 = 1e-6;

/// Sample intervals along an edge when searching the cheapest collapse point.
const COST_STEPS: usize = 10;

/// Edges whose summed sample error stays below this collapse for free.
const FLAT_COST_SUM: f64 = 1e-4;

/// Quadric error matrix (4x4 symmetric matrix stored as 10 values).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Quadric {
    // Symmetric 4x4 matrix stored as upper triangle:
    // [a b c d]
    // [  e f g]
    // [    h i]
    // [      j]
    a: f64,
    b: f64,
    c: f64,
    d: f64,
    e: f64,
    f: f64,
    g: f64,
    h: f64,
    i: f64,
    j: f64,
}

impl Quadric {
    /// Quadric of the plane through a triangle; zero for degenerate triangles.
    fn from_triangle(p0: &Point3<f64>, p1: &Point3<f64>, p2: &Point3<f64>) -> Self {
        let n = (p1 - p0).cross(&(p2 - p0));
        let len = n.norm();
        if len == 0.0 {
            return Self::default();
        }
        let n = n / len;
        Self::from_plane(n.x, n.y, n.z, -n.dot(&p0.coords))
    }

    /// Create a quadric from a plane equation (ax + by + cz + d = 0).
    fn from_plane(a: f64, b: f64, c: f64, d: f64) -> Self {
        Self {
            a: a * a,
            b: a * b,
            c: a * c,
            d: a * d,
            e: b * b,
            f: b * c,
            g: b * d,
            h: c * c,
            i: c * d,
            j: d * d,
        }
    }

    /// Evaluate `v^T * Q * v` with `v = [x, y, z, 1]`.
    fn evaluate(&self, p: &Point3<f64>) -> f64 {
        let (x, y, z) = (p.x, p.y, p.z);
        self.a * x * x
            + 2.0 * self.b * x * y
            + 2.0 * self.c * x * z
            + 2.0 * self.d * x
            + self.e * y * y
            + 2.0 * self.f * y * z
            + 2.0 * self.g * y
            + self.h * z * z
            + 2.0 * self.i * z
            + self.j
    }
}

impl std::ops::AddAssign for Quadric {
    fn add_assign(&mut self, other: Quadric) {
        self.a += other.a;
        self.b += other.b;
        self.c += other.c;
        self.d += other.d;
        self.e += other.e;
        self.f += other.f;
        self.g += other.g;
        self.h += other.h;
        self.i += other.i;
        self.j += other.j;
    }
}

impl std::ops::Add for Quadric {
    type Output = Quadric;

    fn add(mut self, other: Quadric) -> Quadric {
        self += other;
        self
    }
}

#[derive(Debug, Clone)]
struct QuadricVertex {
    position: Point3<f64>,
    quadric: Quadric,
    /// Live edges touching this vertex.
    edges: Vec<u32>,
    /// Live triangles touching this vertex.
    triangles: Vec<u32>,
    /// Registered vertices merged into this one, itself included.
    masters: Vec<u32>,
    border: bool,
    deleted: bool,
}

impl QuadricVertex {
    fn new(position: Point3<f64>, index: u32) -> Self {
        Self {
            position,
            quadric: Quadric::default(),
            edges: Vec::new(),
            triangles: Vec::new(),
            masters: vec![index],
            border: false,
            deleted: false,
        }
    }

    fn add_triangle(&mut self, t: u32) {
        if !self.triangles.contains(&t) {
            self.triangles.push(t);
        }
    }

    fn remove_triangle(&mut self, t: u32) {
        if let Some(i) = self.triangles.iter().position(|&x| x == t) {
            self.triangles.swap_remove(i);
        }
    }

    fn remove_edge(&mut self, e: u32) {
        if let Some(i) = self.edges.iter().position(|&x| x == e) {
            self.edges.swap_remove(i);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QuadricTriangle {
    vertices: [u32; 3],
    deleted: bool,
}

impl QuadricTriangle {
    #[inline]
    fn contains(&self, v: u32) -> bool {
        self.vertices.contains(&v)
    }

    fn replace(&mut self, old: u32, new: u32) {
        for v in &mut self.vertices {
            if *v == old {
                *v = new;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct QuadricEdge {
    /// Sorted at creation; the first vertex survives a collapse.
    vertices: [u32; 2],
    cost: f64,
    /// Blend factor from the first to the second vertex of the cheapest point.
    ratio: f64,
    length_sq: f64,
    border: bool,
    deleted: bool,
}

impl QuadricEdge {
    fn new(v0: u32, v1: u32) -> Self {
        Self {
            vertices: [v0.min(v1), v0.max(v1)],
            cost: f64::MAX,
            ratio: -1.0,
            length_sq: 0.0,
            border: false,
            deleted: false,
        }
    }

    #[inline]
    fn other(&self, v: u32) -> u32 {
        if self.vertices[0] == v {
            self.vertices[1]
        } else {
            self.vertices[0]
        }
    }

    fn replace(&mut self, old: u32, new: u32) {
        for v in &mut self.vertices {
            if *v == old {
                *v = new;
            }
        }
    }
}

/// Cheaper edges first; zero-cost ties and equal costs go to the shorter edge.
fn collapses_before(e0: &QuadricEdge, e1: &QuadricEdge) -> bool {
    if e0.cost == 0.0 && e1.cost == 0.0 {
        return e0.length_sq < e1.length_sq;
    }
    if e0.cost != e1.cost {
        return e0.cost < e1.cost;
    }
    e0.length_sq < e1.length_sq
}

fn heap_order(edges: &[QuadricEdge]) -> impl Fn(u32, u32) -> bool + '_ {
    move |a, b| collapses_before(&edges[a as usize], &edges[b as usize])
}

fn lerp(p0: &Point3<f64>, p1: &Point3<f64>, t: f64) -> Point3<f64> {
    Point3::from(p0.coords * (1.0 - t) + p1.coords * t)
}

/// Progressive edge-collapse simplifier.
#[derive(Debug, Clone, Default)]
pub struct QuadricSimplifier {
    vertices: Vec<QuadricVertex>,
    triangles: Vec<QuadricTriangle>,
    edges: Vec<QuadricEdge>,
    heap: IndexedHeap,
    bounds: Bounds,
    num_deleted_vertices: usize,
    num_deleted_triangles: usize,
    finalized: bool,
}

impl QuadricSimplifier {
    /// Create an empty simplifier.
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
        let index = self.vertices.len() as u32;
        self.vertices.push(QuadricVertex::new(position, index));
        self.bounds.include(&position);
        Ok(index)
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
        for (position, &v) in [v0, v1, v2].iter().enumerate() {
            if v as usize >= count {
                let position = self.triangles.len() * 3 + position;
                return Err(KernelError::index_out_of_range(position, v, count).reported());
            }
        }
        if v0 == v1 || v1 == v2 || v2 == v0 {
            debug!(v0, v1, v2, "skipping degenerate triangle");
            return Ok(());
        }
        let t = self.triangles.len() as u32;
        for v in [v0, v1, v2] {
            self.vertices[v as usize].triangles.push(t);
        }
        self.triangles.push(QuadricTriangle {
            vertices: [v0, v1, v2],
            deleted: false,
        });
        Ok(())
    }

    /// Close registration: merge close vertices if asked, build quadrics, the
    /// unique edge set with border flags, and the heap.
    pub fn end_registration(
        &mut self,
        merge_close_vertices: bool,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<()> {
        if self.finalized {
            return Err(KernelError::RegistrationClosed {
                operation: "end_registration",
            }
            .reported());
        }
        let _timer = OperationTimer::with_context(
            "quadric_end_registration",
            self.triangles.len(),
            self.vertices.len(),
        );
        let mut progress = HierarchicalProgress::new(100, progress);

        if merge_close_vertices {
            progress.set_subtask_work(20, Some("Merge Vertices"));
            let merged = self.merge_vertices();
            debug!(merged, "merged close vertices");
            progress.complete_subtask();
        }

        for v in &mut self.vertices {
            if v.triangles.is_empty() && !v.deleted {
                v.deleted = true;
                self.num_deleted_vertices += 1;
            }
        }

        progress.set_subtask_work(20, Some("Init Edge List"));
        let mut raw_edges = Vec::with_capacity(self.triangles.len() * 3);
        for t in self.triangles.iter().filter(|t| !t.deleted) {
            let [i0, i1, i2] = t.vertices;
            let q = Quadric::from_triangle(
                &self.vertices[i0 as usize].position,
                &self.vertices[i1 as usize].position,
                &self.vertices[i2 as usize].position,
            );
            for k in 0..3 {
                self.vertices[t.vertices[k] as usize].quadric += q;
                let edge = QuadricEdge::new(t.vertices[k], t.vertices[(k + 1) % 3]);
                raw_edges.push(edge.vertices);
            }
        }
        progress.complete_subtask();

        progress.set_subtask_work(10, Some("Sort Edges"));
        raw_edges.sort_unstable();
        progress.complete_subtask();

        progress.set_subtask_work(10, Some("Process Edges"));
        self.edges.clear();
        let mut i = 0;
        while i < raw_edges.len() {
            let [v0, v1] = raw_edges[i];
            i += 1;
            let mut border = true;
            while i < raw_edges.len() && raw_edges[i] == [v0, v1] {
                i += 1;
                border = false;
            }
            let mut edge = QuadricEdge::new(v0, v1);
            edge.border = border;
            if border {
                self.vertices[v0 as usize].border = true;
                self.vertices[v1 as usize].border = true;
            }
            self.edges.push(edge);
        }
        progress.complete_subtask();

        progress.set_subtask_work(10, Some("Init Edges"));
        for e in 0..self.edges.len() {
            self.update_cost(e as u32);
            let [v0, v1] = self.edges[e].vertices;
            self.vertices[v0 as usize].edges.push(e as u32);
            self.vertices[v1 as usize].edges.push(e as u32);
        }
        progress.complete_subtask();

        progress.set_subtask_work(-1, Some("Create Heap"));
        let count = self.edges.len() as u32;
        self.heap.build(0..count, heap_order(&self.edges));
        progress.complete_subtask();

        self.num_deleted_triangles = 0;
        self.finalized = true;
        debug!(
            vertices = self.remaining_vertices(),
            triangles = self.remaining_triangles(),
            edges = self.edges.len(),
            "simplifier ready"
        );
        Ok(())
    }

    /// Collapse edges, cheapest first.
    ///
    /// `subdivision > 0` rejects edges longer than `diagonal / subdivision`.
    /// Stops after `max_steps` collapses, when the cheapest edge costs more
    /// than `max_error`, or when no legal collapse is left. Returns the
    /// number of collapses.
    pub fn simplify(
        &mut self,
        subdivision: u32,
        max_steps: Option<usize>,
        max_error: Option<f64>,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<usize> {
        if !self.finalized {
            return Err(KernelError::NotFinalized {
                operation: "simplify",
            }
            .reported());
        }
        if let Some(e) = max_error {
            if !(e >= 0.0) {
                return Err(
                    KernelError::invalid_parameter("max_error", e, "must be non-negative")
                        .reported(),
                );
            }
        }

        let before = self.remaining_triangles();
        let _timer =
            OperationTimer::with_context("quadric_simplify", before, self.remaining_vertices());
        let max_length = if subdivision > 0 {
            self.bounds.diagonal() / subdivision as f64
        } else {
            0.0
        };
        let budget = max_steps.unwrap_or(self.heap.len());

        let mut progress = HierarchicalProgress::new(100, progress);
        progress.set_subtask_work(90, Some("Isomesh simplification"));
        let mut collapsed = 0;
        while max_steps.is_none_or(|m| collapsed < m) {
            report_every(&mut progress, collapsed, budget, 0xff);
            let Some(edge) = self.next_collapse(max_length, max_error) else {
                break;
            };
            self.collapse_edge(edge);
            collapsed += 1;
        }
        progress.complete_subtask();

        progress.set_subtask_work(10, Some("Heap rebuilding"));
        trace!(parked = self.heap.num_deleted(), "reinserting rejected edges");
        let (edges, vertices) = (&self.edges, &self.vertices);
        self.heap.reinsert_deleted(
            |h| {
                let e = &edges[h as usize];
                !e.deleted && e.vertices.iter().all(|&v| !vertices[v as usize].deleted)
            },
            heap_order(edges),
        );
        progress.complete_subtask();
        debug_assert!(self.check_heap());

        log_reduction_result(
            "quadric_simplify",
            before,
            self.remaining_triangles(),
            collapsed,
        );
        Ok(collapsed)
    }

    /// Pop edges until a legal one turns up. Illegal edges with two live
    /// endpoints are parked for re-insertion.
    fn next_collapse(&mut self, max_length: f64, max_error: Option<f64>) -> Option<u32> {
        while let Some(top) = self.heap.peek() {
            let edge = self.edges[top as usize];
            if max_error.is_some_and(|m| edge.cost > m) {
                return None;
            }
            if self.legal_collapse(top, max_length) {
                self.heap.remove(top, false, heap_order(&self.edges));
                return Some(top);
            }
            let [v0, v1] = edge.vertices;
            let park = !self.vertices[v0 as usize].deleted && !self.vertices[v1 as usize].deleted;
            self.heap.remove(top, park, heap_order(&self.edges));
        }
        None
    }

    fn update_cost(&mut self, e: u32) {
        let edge = &mut self.edges[e as usize];
        let qv0 = &self.vertices[edge.vertices[0] as usize];
        let qv1 = &self.vertices[edge.vertices[1] as usize];
        let q = qv0.quadric + qv1.quadric;

        edge.cost = f64::MAX;
        edge.ratio = -1.0;
        edge.length_sq = (qv1.position - qv0.position).norm_squared();
        let mut sum = 0.0;
        for step in 0..=COST_STEPS {
            let ratio = step as f64 / COST_STEPS as f64;
            let cost = q.evaluate(&lerp(&qv0.position, &qv1.position, ratio)).abs();
            sum += cost;
            if cost < edge.cost {
                edge.cost = cost;
                edge.ratio = ratio;
            }
        }
        if sum < FLAT_COST_SUM {
            edge.cost = 0.0;
            edge.ratio = 0.5;
        }
    }

    fn legal_collapse(&self, e: u32, max_length: f64) -> bool {
        let edge = &self.edges[e as usize];
        let [v0, v1] = edge.vertices;
        let qv0 = &self.vertices[v0 as usize];
        let qv1 = &self.vertices[v1 as usize];

        // the border never moves inward
        if qv0.border != qv1.border {
            return false;
        }
        if qv0.deleted || qv1.deleted {
            return false;
        }
        if max_length > 0.0 && (qv1.position - qv0.position).norm_squared() > max_length * max_length
        {
            return false;
        }

        // a vertex connected to both ends must form a triangle with them
        for &e0 in &qv0.edges {
            let v = self.edges[e0 as usize].other(v0);
            let shared = qv1
                .edges
                .iter()
                .any(|&e1| self.edges[e1 as usize].other(v1) == v);
            if !shared {
                continue;
            }
            let has_triangle = qv0.triangles.iter().any(|&t| {
                let t = &self.triangles[t as usize];
                t.contains(v0) && t.contains(v1) && t.contains(v)
            });
            if !has_triangle {
                return false;
            }
        }

        let new_pos = lerp(&qv0.position, &qv1.position, edge.ratio);
        let mut survivor = false;
        for qv in [qv0, qv1] {
            for &t in &qv.triangles {
                let t = &self.triangles[t as usize];
                if t.contains(v0) && t.contains(v1) {
                    continue;
                }
                survivor = true;
                let p = t.vertices.map(|v| self.vertices[v as usize].position);
                let q = t.vertices.map(|v| {
                    if v == v0 || v == v1 {
                        new_pos
                    } else {
                        self.vertices[v as usize].position
                    }
                });
                let n0 = (p[1] - p[0]).cross(&(p[2] - p[0]));
                let n1 = (q[1] - q[0]).cross(&(q[2] - q[0]));
                if n0.dot(&n1) < 0.0 {
                    return false;
                }
            }
        }
        // collapsing the last triangles of a component would erase it
        survivor
    }

    fn collapse_edge(&mut self, e: u32) {
        let edge = self.edges[e as usize];
        let [v0, v1] = edge.vertices;
        let (i0, i1) = (v0 as usize, v1 as usize);
        debug_assert!(!self.vertices[i0].deleted && !self.vertices[i1].deleted);

        self.vertices[i0].position = lerp(
            &self.vertices[i0].position,
            &self.vertices[i1].position,
            edge.ratio,
        );
        let q1 = self.vertices[i1].quadric;
        self.vertices[i0].quadric += q1;

        // hand the edges of v1 over to v0, dropping duplicates
        for ei in std::mem::take(&mut self.vertices[i1].edges) {
            let vi = self.edges[ei as usize].other(v1);
            if vi == v0 {
                continue;
            }
            let duplicate = self.vertices[i0]
                .edges
                .iter()
                .any(|&ej| self.edges[ej as usize].other(v0) == vi);
            if duplicate {
                self.vertices[vi as usize].remove_edge(ei);
                self.edges[ei as usize].deleted = true;
                self.heap.remove(ei, false, heap_order(&self.edges));
            } else {
                self.edges[ei as usize].replace(v1, v0);
                self.vertices[i0].edges.push(ei);
            }
        }

        // drop the collapsed edge, re-key the rest
        let mut k = self.vertices[i0].edges.len();
        while k > 0 {
            k -= 1;
            let ei = self.vertices[i0].edges[k];
            if self.edges[ei as usize].other(v0) == v1 {
                self.vertices[i0].edges.swap_remove(k);
            } else {
                self.update_cost(ei);
                self.heap.update(ei, heap_order(&self.edges));
            }
        }

        let doomed: Vec<u32> = self.vertices[i0]
            .triangles
            .iter()
            .copied()
            .filter(|&t| self.triangles[t as usize].contains(v1))
            .collect();
        for t in doomed {
            self.triangles[t as usize].deleted = true;
            self.num_deleted_triangles += 1;
            for v in self.triangles[t as usize].vertices {
                self.vertices[v as usize].remove_triangle(t);
            }
        }

        for t in std::mem::take(&mut self.vertices[i1].triangles) {
            self.triangles[t as usize].replace(v1, v0);
            self.vertices[i0].triangles.push(t);
        }

        let masters = std::mem::take(&mut self.vertices[i1].masters);
        self.vertices[i0].masters.extend(masters);
        self.vertices[i1].deleted = true;
        self.num_deleted_vertices += 1;
        self.edges[e as usize].deleted = true;
    }

    /// Merge vertices closer than [`MERGE_THRESHOLD`] of the diagonal. Returns
    /// the number of vertices merged away.
    fn merge_vertices(&mut self) -> usize {
        let d = self.bounds.diagonal() * MERGE_THRESHOLD;
        let d2 = d * d;
        let mut order: Vec<u32> = (0..self.vertices.len() as u32).collect();
        order.sort_by(|&a, &b| {
            self.vertices[a as usize]
                .position
                .x
                .total_cmp(&self.vertices[b as usize].position.x)
        });

        let mut merged = 0;
        for a in 0..order.len() {
            let i = order[a];
            if self.vertices[i as usize].deleted {
                continue;
            }
            let pos = self.vertices[i as usize].position;
            let candidates: Vec<u32> = order[a + 1..]
                .iter()
                .copied()
                .take_while(|&j| (self.vertices[j as usize].position.x - pos.x).abs() < d)
                .collect();
            for j in candidates {
                let vj = &self.vertices[j as usize];
                if vj.deleted || (vj.position - pos).norm_squared() >= d2 {
                    continue;
                }
                let triangles = std::mem::take(&mut self.vertices[j as usize].triangles);
                let masters = std::mem::take(&mut self.vertices[j as usize].masters);
                for t in triangles {
                    self.triangles[t as usize].replace(j, i);
                    self.vertices[i as usize].add_triangle(t);
                }
                self.vertices[i as usize].masters.extend(masters);
                self.vertices[j as usize].deleted = true;
                self.num_deleted_vertices += 1;
                merged += 1;
            }
        }

        // triangles with two merged corners are gone
        for t in 0..self.triangles.len() {
            let [a, b, c] = self.triangles[t].vertices;
            if !self.triangles[t].deleted && (a == b || b == c || c == a) {
                self.triangles[t].deleted = true;
                for v in [a, b, c] {
                    self.vertices[v as usize].remove_triangle(t as u32);
                }
            }
        }
        merged
    }

    /// Registered vertices, deleted ones included.
    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    /// Vertices removed by merging, collapsing or because nothing referenced them.
    pub fn num_deleted_vertices(&self) -> usize {
        self.num_deleted_vertices
    }

    /// Live vertices.
    pub fn remaining_vertices(&self) -> usize {
        self.vertices.len() - self.num_deleted_vertices
    }

    /// Live triangles.
    pub fn remaining_triangles(&self) -> usize {
        self.triangles.iter().filter(|t| !t.deleted).count()
    }

    /// Position of a live vertex.
    pub fn vertex_position(&self, v: u32) -> Option<Point3<f64>> {
        self.vertices
            .get(v as usize)
            .filter(|v| !v.deleted)
            .map(|v| v.position)
    }

    /// Vertex indices of a live triangle.
    pub fn triangle(&self, t: usize) -> Option<[u32; 3]> {
        self.triangles
            .get(t)
            .filter(|t| !t.deleted)
            .map(|t| t.vertices)
    }

    /// Index of the live triangle over the three vertices, in any order.
    pub fn triangle_index(&self, v0: u32, v1: u32, v2: u32) -> Option<usize> {
        let qv0 = self.vertices.get(v0 as usize).filter(|v| !v.deleted)?;
        qv0.triangles
            .iter()
            .copied()
            .find(|&t| {
                let t = &self.triangles[t as usize];
                t.contains(v1) && t.contains(v2)
            })
            .map(|t| t as usize)
    }

    /// Registered vertices merged into a live vertex, itself included.
    pub fn masters(&self, v: u32) -> &[u32] {
        self.vertices
            .get(v as usize)
            .filter(|v| !v.deleted)
            .map_or(&[], |v| v.masters.as_slice())
    }

    /// Dense mesh of the live elements and the old-to-new vertex map.
    pub fn compact(&self) -> (TriangleMesh, Vec<Option<u32>>) {
        compact_live(
            self.vertices
                .iter()
                .map(|v| (!v.deleted).then_some(v.position)),
            self.triangles
                .iter()
                .map(|t| (!t.deleted).then_some(t.vertices)),
        )
    }

    /// Master lists of the live vertices in compacted order.
    pub fn master_indices(&self) -> Vec<Vec<u32>> {
        self.vertices
            .iter()
            .filter(|v| !v.deleted)
            .map(|v| v.masters.clone())
            .collect()
    }

    /// Check the heap order and its slot map.
    pub fn check_heap(&self) -> bool {
        self.heap.check_consistency(heap_order(&self.edges))
    }

    /// Check that vertex, edge and triangle references agree with each other.
    pub fn check_topology(&self) -> bool {
        for (i, v) in self.vertices.iter().enumerate() {
            if v.deleted {
                continue;
            }
            let i = i as u32;
            let edges_ok = v.edges.iter().all(|&e| {
                let e = &self.edges[e as usize];
                !e.deleted && e.vertices.contains(&i)
            });
            let triangles_ok = v.triangles.iter().all(|&t| {
                let t = &self.triangles[t as usize];
                !t.deleted && t.contains(i)
            });
            if !edges_ok || !triangles_ok {
                return false;
            }
        }
        let edges_ok = self.edges.iter().enumerate().all(|(i, e)| {
            e.deleted
                || e.vertices.iter().all(|&v| {
                    let v = &self.vertices[v as usize];
                    !v.deleted && v.edges.iter().filter(|&&x| x as usize == i).count() == 1
                })
        });
        let triangles_ok = self.triangles.iter().enumerate().all(|(i, t)| {
            t.deleted
                || t.vertices.iter().all(|&v| {
                    let v = &self.vertices[v as usize];
                    !v.deleted && v.triangles.iter().filter(|&&x| x as usize == i).count() == 1
                })
        });
        edges_ok && triangles_ok
    }
}

impl MeshReducer for QuadricSimplifier {
    type Params = SimplifyParams;

    fn register_vertex(&mut self, position: Point3<f64>) -> KernelResult<u32> {
        QuadricSimplifier::register_vertex(self, position)
    }

    fn register_triangle(&mut self, v0: u32, v1: u32, v2: u32) -> KernelResult<()> {
        QuadricSimplifier::register_triangle(self, v0, v1, v2)
    }

    fn end_registration(
        &mut self,
        params: &SimplifyParams,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<()> {
        QuadricSimplifier::end_registration(self, params.merge_close_vertices, progress)
    }

    fn reduce(
        &mut self,
        params: &SimplifyParams,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<usize> {
        params.validate()?;
        self.simplify(params.subdivision, params.max_steps, params.max_error, progress)
    }

    fn remaining_vertices(&self) -> usize {
        QuadricSimplifier::remaining_vertices(self)
    }

    fn remaining_triangles(&self) -> usize {
        QuadricSimplifier::remaining_triangles(self)
    }

    fn to_mesh(&self) -> TriangleMesh {
        self.compact().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressRecorder;
    use approx::assert_relative_eq;

    /// A 2x2 quad sheet on z = 0 registered twice, the second copy facing down.
    fn double_sided_sheet(simplifier: &mut QuadricSimplifier) {
        for _ in 0..2 {
            for j in 0..3 {
                for i in 0..3 {
                    simplifier
                        .register_vertex(Point3::new(i as f64, j as f64, 0.0))
                        .unwrap();
                }
            }
        }
        for (offset, flip) in [(0, false), (9, true)] {
            for j in 0..2 {
                for i in 0..2 {
                    let a = offset + j * 3 + i;
                    let (b, c, d) = (a + 1, a + 4, a + 3);
                    if flip {
                        simplifier.register_triangle(a, c, b).unwrap();
                        simplifier.register_triangle(a, d, c).unwrap();
                    } else {
                        simplifier.register_triangle(a, b, c).unwrap();
                        simplifier.register_triangle(a, c, d).unwrap();
                    }
                }
            }
        }
    }

    fn sphere() -> TriangleMesh {
        TriangleMesh::sphere(Point3::origin(), 1.0, 2)
    }

    fn simplifier_for(mesh: &TriangleMesh) -> QuadricSimplifier {
        let mut simplifier = QuadricSimplifier::new();
        simplifier.register_mesh(mesh).unwrap();
        simplifier.end_registration(false, None).unwrap();
        simplifier
    }

    #[test]
    fn test_quadric_evaluates_squared_plane_distance() {
        let q = Quadric::from_triangle(
            &Point3::new(0.0, 0.0, 1.0),
            &Point3::new(1.0, 0.0, 1.0),
            &Point3::new(0.0, 1.0, 1.0),
        );
        assert_relative_eq!(q.evaluate(&Point3::new(5.0, -2.0, 3.0)), 4.0, epsilon = 1e-12);
        let sum = q + q;
        assert_relative_eq!(sum.evaluate(&Point3::new(0.0, 0.0, 0.0)), 2.0, epsilon = 1e-12);

        let degenerate = Quadric::from_triangle(
            &Point3::origin(),
            &Point3::new(1.0, 0.0, 0.0),
            &Point3::new(2.0, 0.0, 0.0),
        );
        assert_eq!(degenerate, Quadric::default());
    }

    #[test]
    fn test_flat_double_sheet_converges_to_two_triangles() {
        let mut simplifier = QuadricSimplifier::new();
        double_sided_sheet(&mut simplifier);
        simplifier.end_registration(true, None).unwrap();
        assert_eq!(simplifier.remaining_vertices(), 9);
        assert_eq!(simplifier.remaining_triangles(), 16);

        let collapsed = simplifier.simplify(0, None, Some(0.0), None).unwrap();
        assert_eq!(collapsed, 6);
        assert_eq!(simplifier.remaining_triangles(), 2);
        assert_eq!(simplifier.remaining_vertices(), 3);
        assert!(simplifier.check_heap());
        assert!(simplifier.check_topology());

        let mut masters: Vec<u32> = simplifier.master_indices().concat();
        masters.sort_unstable();
        assert_eq!(masters, (0..18).collect::<Vec<u32>>());

        let (mesh, _) = simplifier.compact();
        assert!(mesh.border_edges().is_empty());
        assert!(mesh.vertices.iter().all(|v| v.position.z == 0.0));

        // nothing left to do
        assert_eq!(simplifier.simplify(0, None, Some(0.0), None).unwrap(), 0);
    }

    #[test]
    fn test_merge_welds_triangle_soup() {
        let cube = TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
        let mut simplifier = QuadricSimplifier::new();
        for (t, &[a, b, c]) in cube.triangles.iter().enumerate() {
            for v in [a, b, c] {
                simplifier
                    .register_vertex(cube.vertices[v as usize].position)
                    .unwrap();
            }
            let base = 3 * t as u32;
            simplifier.register_triangle(base, base + 1, base + 2).unwrap();
        }
        simplifier.end_registration(true, None).unwrap();
        assert_eq!(simplifier.remaining_vertices(), 8);
        assert_eq!(simplifier.remaining_triangles(), 12);
        assert!(simplifier.check_topology());

        let mut masters: Vec<u32> = simplifier.master_indices().concat();
        masters.sort_unstable();
        assert_eq!(masters, (0..36).collect::<Vec<u32>>());
        let (welded, _) = simplifier.compact();
        assert!(welded.border_edges().is_empty());
        assert_relative_eq!(welded.signed_volume(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_closed_mesh_stays_closed() {
        let mesh = sphere();
        assert_eq!(mesh.triangle_count(), 128);
        let mut simplifier = simplifier_for(&mesh);

        let collapsed = simplifier.simplify(0, Some(20), None, None).unwrap();
        assert_eq!(collapsed, 20);
        assert_eq!(simplifier.remaining_triangles(), 128 - 2 * 20);
        assert!(simplifier.check_heap());
        assert!(simplifier.check_topology());

        let (reduced, remap) = simplifier.compact();
        assert!(reduced.border_edges().is_empty());
        assert!(reduced.signed_volume() > 0.0);
        assert_eq!(remap.iter().flatten().count(), reduced.vertex_count());
    }

    #[test]
    fn test_border_vertices_stay_on_border() {
        let mut simplifier = QuadricSimplifier::new();
        for j in 0..4 {
            for i in 0..4 {
                simplifier
                    .register_vertex(Point3::new(i as f64, j as f64, 0.0))
                    .unwrap();
            }
        }
        for j in 0..3 {
            for i in 0..3 {
                let a = j * 4 + i;
                simplifier.register_triangle(a, a + 1, a + 5).unwrap();
                simplifier.register_triangle(a, a + 5, a + 4).unwrap();
            }
        }
        simplifier.end_registration(false, None).unwrap();
        let interior = [5u32, 6, 9, 10];
        simplifier.simplify(0, None, Some(0.0), None).unwrap();
        assert!(simplifier.check_topology());

        // interior vertices only merge among themselves, never onto the rim
        for v in 0..16u32 {
            let masters = simplifier.masters(v);
            if masters.is_empty() {
                continue;
            }
            let inner = masters.iter().filter(|m| interior.contains(m)).count();
            assert!(inner == 0 || inner == masters.len());
        }
        let (mesh, _) = simplifier.compact();
        assert!(!mesh.border_edges().is_empty());
    }

    #[test]
    fn test_length_cap_blocks_long_edges() {
        let mesh = sphere();
        let mut simplifier = simplifier_for(&mesh);
        // diagonal of the sphere bounds is 2 * sqrt(3); no edge is that short
        let collapsed = simplifier.simplify(100, None, None, None).unwrap();
        assert_eq!(collapsed, 0);
        assert_eq!(simplifier.remaining_triangles(), 128);
        assert!(simplifier.check_heap());
    }

    #[test]
    fn test_protocol_errors() {
        let mut simplifier = QuadricSimplifier::new();
        assert!(simplifier.simplify(0, None, None, None).is_err());
        simplifier.register_vertex(Point3::origin()).unwrap();
        assert!(simplifier.register_triangle(0, 1, 2).is_err());

        simplifier.end_registration(false, None).unwrap();
        assert!(simplifier.end_registration(false, None).is_err());
        assert!(simplifier.register_vertex(Point3::origin()).is_err());
        assert!(simplifier.simplify(0, None, Some(-1.0), None).is_err());
        // the unreferenced vertex is dropped
        assert_eq!(simplifier.remaining_vertices(), 0);
        assert_eq!(simplifier.simplify(0, None, None, None).unwrap(), 0);

        simplifier.clear();
        assert!(!simplifier.is_finalized());
    }

    #[test]
    fn test_lookups() {
        let mesh = TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
        let simplifier = simplifier_for(&mesh);
        assert_eq!(simplifier.triangle_index(2, 0, 1), Some(0));
        assert_eq!(simplifier.triangle_index(0, 1, 7), None);
        assert_eq!(simplifier.triangle(1), Some([0, 3, 2]));
        assert_eq!(
            simplifier.vertex_position(6),
            Some(Point3::new(1.0, 1.0, 1.0))
        );
        assert_eq!(simplifier.masters(4), &[4]);
        assert!(simplifier.check_topology());
    }

    #[test]
    fn test_progress_ends_complete() {
        let mesh = sphere();
        let mut recorder = ProgressRecorder::new();
        let mut simplifier = QuadricSimplifier::new();
        simplifier.register_mesh(&mesh).unwrap();
        simplifier
            .end_registration(true, Some(&mut recorder))
            .unwrap();
        assert_eq!(recorder.last_percent(), Some(100));
        assert!(recorder.is_monotonic());

        let mut recorder = ProgressRecorder::new();
        simplifier
            .simplify(0, Some(10), None, Some(&mut recorder))
            .unwrap();
        assert_eq!(recorder.last_percent(), Some(100));
        assert!(recorder.is_monotonic());
        assert!(
            recorder
                .reports
                .iter()
                .any(|p| p.task.as_deref() == Some("Heap rebuilding"))
        );
    }

    #[test]
    fn test_reducer_trait_round_trip() {
        let mesh = sphere();
        let mut simplifier = QuadricSimplifier::new();
        MeshReducer::register_mesh(&mut simplifier, &mesh).unwrap();
        let params = SimplifyParams::with_max_steps(10);
        MeshReducer::end_registration(&mut simplifier, &params, None).unwrap();
        assert_eq!(MeshReducer::reduce(&mut simplifier, &params, None).unwrap(), 10);
        let reduced = MeshReducer::to_mesh(&simplifier);
        assert_eq!(reduced.triangle_count(), 108);
        assert_eq!(reduced.vertex_count(), 66 - 10);
    }
}
