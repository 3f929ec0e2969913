//! Geometric helpers shared by the extractors, reducers and the tetrahedralizer.
//!
//! None of these predicates are exact. Degenerate input yields a neutral
//! value (no hit, zero volume, a collapsed circumsphere) instead of an error.

use nalgebra::{Matrix3, Point3, Vector3};

/// Result of a ray/triangle intersection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RayHit {
    /// Ray parameter; may be negative (hit behind the origin).
    pub t: f64,
    /// Barycentric coordinate along the first edge.
    pub u: f64,
    /// Barycentric coordinate along the second edge.
    pub v: f64,
}

/// Möller–Trumbore intersection of the line `origin + t * dir` with a triangle.
///
/// Hits on both sides of the origin are reported; callers filter on `t`.
pub fn ray_triangle(
    origin: &Point3<f64>,
    dir: &Vector3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
) -> Option<RayHit> {
    let edge1 = b - a;
    let edge2 = c - a;

    let h = dir.cross(&edge2);
    let det = edge1.dot(&h);

    // Ray is parallel to triangle
    if det.abs() < 1e-12 {
        return None;
    }

    let f = 1.0 / det;
    let s = origin - a;
    let u = f * s.dot(&h);
    if !(0.0..=1.0).contains(&u) {
        return None;
    }

    let q = s.cross(&edge1);
    let v = f * dir.dot(&q);
    if v < 0.0 || u + v > 1.0 {
        return None;
    }

    Some(RayHit {
        t: f * edge2.dot(&q),
        u,
        v,
    })
}

/// Closest point on triangle `abc` to `p`.
pub fn closest_point_on_triangle(
    p: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
) -> Point3<f64> {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return *a;
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return *b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return *c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

/// Distance from `p` to triangle `abc`.
pub fn point_triangle_distance(
    p: &Point3<f64>,
    a: &Point3<f64>,
    b: &Point3<f64>,
    c: &Point3<f64>,
) -> f64 {
    (closest_point_on_triangle(p, a, b, c) - p).norm()
}

/// Signed tetrahedron volume; positive when `p3` lies on the side of
/// `(p1 - p0) x (p2 - p0)`.
#[inline]
pub fn tetra_volume(p0: &Point3<f64>, p1: &Point3<f64>, p2: &Point3<f64>, p3: &Point3<f64>) -> f64 {
    (p1 - p0).cross(&(p2 - p0)).dot(&(p3 - p0)) / 6.0
}

/// Longest of the six tetrahedron edges.
pub fn tetra_longest_edge(p: [&Point3<f64>; 4]) -> f64 {
    let mut max: f64 = 0.0;
    for i in 0..4 {
        for j in (i + 1)..4 {
            max = max.max((p[i] - p[j]).norm_squared());
        }
    }
    max.sqrt()
}

/// Shape quality in `[0, 1]`: 1 for the regular tetrahedron, 0 for a flat one.
pub fn tetra_quality(p: [&Point3<f64>; 4]) -> f64 {
    let e = tetra_longest_edge(p);
    if e == 0.0 {
        return 0.0;
    }
    // regular tetrahedron: vol * 6 * sqrt(2) = e^3
    tetra_volume(p[0], p[1], p[2], p[3]).abs() * 6.0 * std::f64::consts::SQRT_2 / (e * e * e)
}

/// Circumsphere center and squared radius.
///
/// A singular tetrahedron yields its first vertex with radius zero.
pub fn circumsphere(p: [&Point3<f64>; 4]) -> (Point3<f64>, f64) {
    let p0 = p[0];
    let b = p[1] - p0;
    let c = p[2] - p0;
    let d = p[3] - p0;

    let det = b.x * (c.y * d.z - c.z * d.y) - b.y * (c.x * d.z - c.z * d.x)
        + b.z * (c.x * d.y - c.y * d.x);
    if det == 0.0 {
        return (*p0, 0.0);
    }

    let v = (c.cross(&d) * b.dot(&b) + d.cross(&b) * c.dot(&c) + b.cross(&c) * d.dot(&d))
        / (2.0 * det);
    (p0 + v, v.norm_squared())
}

/// Whether `q` lies strictly inside the tetrahedron (either orientation).
pub fn point_in_tetra(p: [&Point3<f64>; 4], q: &Point3<f64>) -> bool {
    let q0 = p[1] - p[0];
    let q1 = p[2] - p[0];
    let q2 = p[3] - p[0];
    let r = q - p[0];

    let mut det = Matrix3::from_columns(&[q0, q1, q2]).determinant();
    let mut x = Matrix3::from_columns(&[r, q1, q2]).determinant();
    let mut y = Matrix3::from_columns(&[q0, r, q2]).determinant();
    let mut z = Matrix3::from_columns(&[q0, q1, r]).determinant();
    if det < 0.0 {
        x = -x;
        y = -y;
        z = -z;
        det = -det;
    }
    if x < 0.0 || y < 0.0 || z < 0.0 {
        return false;
    }
    x + y + z < det
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn unit_tetra() -> [Point3<f64>; 4] {
        [
            Point3::new(0.0, 0.0, 0.0),
            Point3::new(1.0, 0.0, 0.0),
            Point3::new(0.0, 1.0, 0.0),
            Point3::new(0.0, 0.0, 1.0),
        ]
    }

    #[test]
    fn test_ray_hits_both_sides() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let c = Point3::new(0.0, 1.0, 0.0);
        let origin = Point3::new(0.25, 0.25, 1.0);

        let hit = ray_triangle(&origin, &Vector3::new(0.0, 0.0, -1.0), &a, &b, &c);
        assert_relative_eq!(hit.map_or(f64::NAN, |h| h.t), 1.0);

        let behind = ray_triangle(&origin, &Vector3::new(0.0, 0.0, 1.0), &a, &b, &c);
        assert_relative_eq!(behind.map_or(f64::NAN, |h| h.t), -1.0);

        let parallel = ray_triangle(&origin, &Vector3::new(1.0, 0.0, 0.0), &a, &b, &c);
        assert!(parallel.is_none());

        let miss = ray_triangle(
            &Point3::new(2.0, 2.0, 1.0),
            &Vector3::new(0.0, 0.0, -1.0),
            &a,
            &b,
            &c,
        );
        assert!(miss.is_none());
    }

    #[test]
    fn test_closest_point_regions() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(1.0, 0.0, 0.0);
        let c = Point3::new(0.0, 1.0, 0.0);

        let inside = closest_point_on_triangle(&Point3::new(0.2, 0.2, 3.0), &a, &b, &c);
        assert_relative_eq!(inside, Point3::new(0.2, 0.2, 0.0));

        let vertex = closest_point_on_triangle(&Point3::new(-1.0, -1.0, 0.0), &a, &b, &c);
        assert_relative_eq!(vertex, a);

        let edge = point_triangle_distance(&Point3::new(0.5, -2.0, 0.0), &a, &b, &c);
        assert_relative_eq!(edge, 2.0);
    }

    #[test]
    fn test_tetra_measures() {
        let t = unit_tetra();
        let p = [&t[0], &t[1], &t[2], &t[3]];
        assert_relative_eq!(tetra_volume(p[0], p[1], p[2], p[3]), 1.0 / 6.0);
        assert_relative_eq!(tetra_volume(p[1], p[0], p[2], p[3]), -1.0 / 6.0);
        assert_relative_eq!(tetra_longest_edge(p), std::f64::consts::SQRT_2);

        let (center, r2) = circumsphere(p);
        assert_relative_eq!(center, Point3::new(0.5, 0.5, 0.5), epsilon = 1e-12);
        assert_relative_eq!(r2, 0.75, epsilon = 1e-12);

        assert!(point_in_tetra(p, &Point3::new(0.1, 0.1, 0.1)));
        assert!(!point_in_tetra(p, &Point3::new(0.5, 0.5, 0.5)));
    }

    #[test]
    fn test_regular_tetra_quality_is_one() {
        let s = 1.0 / std::f64::consts::SQRT_2;
        let t = [
            Point3::new(1.0, 0.0, -s),
            Point3::new(-1.0, 0.0, -s),
            Point3::new(0.0, 1.0, s),
            Point3::new(0.0, -1.0, s),
        ];
        assert_relative_eq!(tetra_quality([&t[0], &t[1], &t[2], &t[3]]), 1.0, epsilon = 1e-9);

        let flat = [t[0], t[1], t[2], Point3::new(0.0, 0.5, 0.0)];
        let flat_q = tetra_quality([&flat[0], &flat[1], &flat[2], &flat[3]]);
        assert!(flat_q < 1.0);
    }

    #[test]
    fn test_singular_circumsphere_falls_back() {
        let p = Point3::new(1.0, 2.0, 3.0);
        let (center, r2) = circumsphere([&p, &p, &p, &p]);
        assert_eq!(center, p);
        assert_eq!(r2, 0.0);
    }
}
