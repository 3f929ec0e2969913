//! Core mesh data types.

use hashbrown::HashMap;
use nalgebra::{Point3, Vector3};

/// A vertex with an optional skinning normal.
#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    /// 3D position.
    pub position: Point3<f64>,

    /// Normal carried along for skinning transfer; the kernel never computes it.
    pub normal: Option<Vector3<f64>>,
}

impl Vertex {
    /// Create a new vertex with only position set.
    #[inline]
    pub fn new(position: Point3<f64>) -> Self {
        Self {
            position,
            normal: None,
        }
    }

    /// Create a vertex from raw coordinates.
    #[inline]
    pub fn from_coords(x: f64, y: f64, z: f64) -> Self {
        Self::new(Point3::new(x, y, z))
    }
}

/// Axis-aligned bounding box.
///
/// A freshly created box is empty (`min > max`) and grows with
/// [`Bounds::include`].
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(
    feature = "pipeline-config",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct Bounds {
    pub min: Point3<f64>,
    pub max: Point3<f64>,
}

impl Default for Bounds {
    fn default() -> Self {
        Self::empty()
    }
}

impl Bounds {
    /// An empty box that includes nothing.
    pub fn empty() -> Self {
        Self {
            min: Point3::new(f64::MAX, f64::MAX, f64::MAX),
            max: Point3::new(-f64::MAX, -f64::MAX, -f64::MAX),
        }
    }

    /// Box spanned by two corners.
    pub fn new(min: Point3<f64>, max: Point3<f64>) -> Self {
        Self { min, max }
    }

    /// Smallest box containing all points.
    pub fn from_points<'a>(points: impl IntoIterator<Item = &'a Point3<f64>>) -> Self {
        let mut bounds = Self::empty();
        for p in points {
            bounds.include(p);
        }
        bounds
    }

    /// Grow the box to contain `p`.
    #[inline]
    pub fn include(&mut self, p: &Point3<f64>) {
        self.min = self.min.inf(p);
        self.max = self.max.sup(p);
    }

    /// Grow the box to contain `other`.
    #[inline]
    pub fn include_bounds(&mut self, other: &Bounds) {
        self.min = self.min.inf(&other.min);
        self.max = self.max.sup(&other.max);
    }

    /// Grow the box by `distance` on every side.
    #[inline]
    pub fn fatten(&mut self, distance: f64) {
        let d = Vector3::new(distance, distance, distance);
        self.min -= d;
        self.max += d;
    }

    /// Whether the box contains no point.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x || self.min.y > self.max.y || self.min.z > self.max.z
    }

    /// Edge lengths of the box, zero when empty.
    pub fn extent(&self) -> Vector3<f64> {
        if self.is_empty() {
            Vector3::zeros()
        } else {
            self.max - self.min
        }
    }

    /// Length of the box diagonal, zero when empty.
    pub fn diagonal(&self) -> f64 {
        self.extent().norm()
    }

    /// Center of the box.
    pub fn center(&self) -> Point3<f64> {
        nalgebra::center(&self.min, &self.max)
    }

    /// Whether the two boxes overlap (touching counts).
    #[inline]
    pub fn intersects(&self, other: &Bounds) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
            && self.min.z <= other.max.z
            && other.min.z <= self.max.z
    }

    /// Whether `p` lies inside or on the box.
    #[inline]
    pub fn contains(&self, p: &Point3<f64>) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }
}

/// A triangle with actual vertex positions.
#[derive(Debug, Clone, Copy)]
pub struct Triangle {
    pub v0: Point3<f64>,
    pub v1: Point3<f64>,
    pub v2: Point3<f64>,
}

impl Triangle {
    /// Create a triangle from its corners.
    #[inline]
    pub fn new(v0: Point3<f64>, v1: Point3<f64>, v2: Point3<f64>) -> Self {
        Self { v0, v1, v2 }
    }

    /// Unnormalized normal (twice the area vector).
    #[inline]
    pub fn normal_unnormalized(&self) -> Vector3<f64> {
        (self.v1 - self.v0).cross(&(self.v2 - self.v0))
    }

    /// Unit normal, or `None` for a degenerate triangle.
    pub fn normal(&self) -> Option<Vector3<f64>> {
        self.normal_unnormalized().try_normalize(f64::EPSILON)
    }

    /// Triangle area.
    pub fn area(&self) -> f64 {
        self.normal_unnormalized().norm() * 0.5
    }

    /// Centroid.
    pub fn center(&self) -> Point3<f64> {
        Point3::from((self.v0.coords + self.v1.coords + self.v2.coords) / 3.0)
    }

    /// Bounding box.
    pub fn bounds(&self) -> Bounds {
        Bounds::from_points([&self.v0, &self.v1, &self.v2])
    }
}

/// A triangle mesh with indexed vertices.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriangleMesh {
    /// Vertex data.
    pub vertices: Vec<Vertex>,

    /// Triangles as indices into the vertex array.
    pub triangles: Vec<[u32; 3]>,
}

impl TriangleMesh {
    /// Create a new empty mesh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mesh from plain positions and triangles.
    pub fn from_parts(positions: &[Point3<f64>], triangles: &[[u32; 3]]) -> Self {
        Self {
            vertices: positions.iter().map(|p| Vertex::new(*p)).collect(),
            triangles: triangles.to_vec(),
        }
    }

    /// Number of vertices in the mesh.
    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of triangles in the mesh.
    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }

    /// Check if mesh is empty (no vertices or triangles).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() || self.triangles.is_empty()
    }

    /// Vertex positions.
    pub fn positions(&self) -> Vec<Point3<f64>> {
        self.vertices.iter().map(|v| v.position).collect()
    }

    /// Axis-aligned bounding box of all vertices.
    pub fn bounds(&self) -> Bounds {
        Bounds::from_points(self.vertices.iter().map(|v| &v.position))
    }

    /// Get a specific triangle by index.
    pub fn triangle(&self, index: usize) -> Option<Triangle> {
        self.triangles.get(index).map(|&[i0, i1, i2]| {
            Triangle::new(
                self.vertices[i0 as usize].position,
                self.vertices[i1 as usize].position,
                self.vertices[i2 as usize].position,
            )
        })
    }

    /// Iterate over triangles with their vertex positions.
    pub fn iter_triangles(&self) -> impl Iterator<Item = Triangle> + '_ {
        self.triangles.iter().map(|&[i0, i1, i2]| {
            Triangle::new(
                self.vertices[i0 as usize].position,
                self.vertices[i1 as usize].position,
                self.vertices[i2 as usize].position,
            )
        })
    }

    /// Edges used by exactly one triangle, as sorted vertex pairs.
    pub fn border_edges(&self) -> Vec<(u32, u32)> {
        let mut counts: HashMap<(u32, u32), u32> = HashMap::new();
        for t in &self.triangles {
            for k in 0..3 {
                let (a, b) = (t[k], t[(k + 1) % 3]);
                *counts.entry((a.min(b), a.max(b))).or_insert(0) += 1;
            }
        }
        let mut border: Vec<(u32, u32)> = counts
            .into_iter()
            .filter(|&(_, n)| n == 1)
            .map(|(e, _)| e)
            .collect();
        border.sort_unstable();
        border
    }

    /// Signed volume enclosed by the triangles.
    pub fn signed_volume(&self) -> f64 {
        self.iter_triangles()
            .map(|t| t.v0.coords.dot(&t.v1.coords.cross(&t.v2.coords)))
            .sum::<f64>()
            / 6.0
    }

    /// Total surface area.
    pub fn surface_area(&self) -> f64 {
        self.iter_triangles().map(|t| t.area()).sum()
    }

    /// Axis-aligned box `[min, max]` as 8 vertices and 12 outward-facing triangles.
    pub fn cuboid(min: Point3<f64>, max: Point3<f64>) -> Self {
        let positions = [
            Point3::new(min.x, min.y, min.z),
            Point3::new(max.x, min.y, min.z),
            Point3::new(max.x, max.y, min.z),
            Point3::new(min.x, max.y, min.z),
            Point3::new(min.x, min.y, max.z),
            Point3::new(max.x, min.y, max.z),
            Point3::new(max.x, max.y, max.z),
            Point3::new(min.x, max.y, max.z),
        ];
        let triangles = [
            [0, 2, 1],
            [0, 3, 2],
            [4, 5, 6],
            [4, 6, 7],
            [0, 1, 5],
            [0, 5, 4],
            [2, 3, 7],
            [2, 7, 6],
            [1, 2, 6],
            [1, 6, 5],
            [0, 4, 7],
            [0, 7, 3],
        ];
        Self::from_parts(&positions, &triangles)
    }

    /// Sphere from an octahedron split `levels` times, outward-facing.
    ///
    /// Has `8 * 4^levels` triangles and `4^levels * 4 + 2` vertices.
    pub fn sphere(center: Point3<f64>, radius: f64, levels: u32) -> Self {
        let mut directions = vec![
            Vector3::x(),
            -Vector3::x(),
            Vector3::y(),
            -Vector3::y(),
            Vector3::z(),
            -Vector3::z(),
        ];
        let mut triangles: Vec<[u32; 3]> = vec![
            [0, 2, 4],
            [2, 1, 4],
            [1, 3, 4],
            [3, 0, 4],
            [2, 0, 5],
            [1, 2, 5],
            [3, 1, 5],
            [0, 3, 5],
        ];
        for _ in 0..levels {
            let mut midpoints: HashMap<(u32, u32), u32> = HashMap::new();
            let mut split = Vec::with_capacity(triangles.len() * 4);
            for t in &triangles {
                let mut mid = [0u32; 3];
                for k in 0..3 {
                    let (a, b) = (t[k], t[(k + 1) % 3]);
                    mid[k] = *midpoints.entry((a.min(b), a.max(b))).or_insert_with(|| {
                        let d = directions[a as usize] + directions[b as usize];
                        directions.push(d.normalize());
                        (directions.len() - 1) as u32
                    });
                }
                split.push([t[0], mid[0], mid[2]]);
                split.push([mid[0], t[1], mid[1]]);
                split.push([mid[2], mid[1], t[2]]);
                split.push([mid[0], mid[1], mid[2]]);
            }
            triangles = split;
        }
        let positions: Vec<Point3<f64>> = directions.iter().map(|d| center + d * radius).collect();
        Self::from_parts(&positions, &triangles)
    }
}

/// A tetrahedral mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TetraMesh {
    /// Vertex positions.
    pub vertices: Vec<Point3<f64>>,

    /// Tetrahedra as 4 vertex indices each.
    pub tetrahedra: Vec<[u32; 4]>,
}

impl TetraMesh {
    /// Sum of absolute tetrahedron volumes.
    pub fn volume(&self) -> f64 {
        self.tetrahedra
            .iter()
            .map(|t| {
                let p = |i: usize| self.vertices[t[i] as usize];
                crate::geometry::tetra_volume(&p(0), &p(1), &p(2), &p(3)).abs()
            })
            .sum()
    }
}
