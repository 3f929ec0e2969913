//! Cube topology and triangulation tables.
//!
//! Corner, edge and face numbering:
//!
//! ```text
//!        7 ------6-------- 6          corners: bit layout of the
//!       /|                /|          offsets in CORNER_OFFSETS
//!     11 7              10 5
//!     /  |              /  |          local vertices 0..12 sit on the
//!    3 -------2------- 2   |          edges, 12..18 on the faces
//!    |   4 ------4-----|-- 5          (-x, +x, -y, +y, -z, +z) and
//!    3  /              1  /           18 at the cell center
//!    | 8               | 9
//!    |/                |/
//!    0 -------0------- 1
//! ```
//!
//! Both tables are derived from one rule instead of being typed in. The
//! corners of a cube carry region labels. On every face, walking the corners
//! counter-clockwise around the outward normal, each label change is a cut.
//! For an interface between labels `lo < hi`, a cut entering `lo` is joined to
//! the next cut leaving it, which yields directed boundary segments; the
//! segments chain into loops that are fanned into triangles whose normals
//! point from `lo` towards `hi`. Faces with more than two cuts either keep the
//! `lo` corners separated (the binary case table) or route every cut through
//! the face vertex (the group templates). Adjacent cells see the same cuts on
//! a shared face and therefore produce matching segments.

use hashbrown::HashMap;
use std::sync::OnceLock;

pub(crate) const CORNER_OFFSETS: [[i32; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

pub(crate) const EDGE_CORNERS: [[usize; 2]; 12] = [
    [0, 1],
    [1, 2],
    [2, 3],
    [3, 0],
    [4, 5],
    [5, 6],
    [6, 7],
    [7, 4],
    [0, 4],
    [1, 5],
    [2, 6],
    [3, 7],
];

/// Face corners, counter-clockwise seen from outside.
pub(crate) const FACE_CORNERS: [[usize; 4]; 6] = [
    [0, 4, 7, 3],
    [1, 2, 6, 5],
    [0, 1, 5, 4],
    [3, 7, 6, 2],
    [0, 3, 2, 1],
    [4, 5, 6, 7],
];

/// `FACE_EDGES[f][i]` joins `FACE_CORNERS[f][i]` and `FACE_CORNERS[f][i + 1]`.
pub(crate) const FACE_EDGES: [[usize; 4]; 6] = [
    [8, 7, 11, 3],
    [1, 10, 5, 9],
    [0, 9, 4, 8],
    [11, 6, 10, 2],
    [3, 2, 1, 0],
    [4, 5, 6, 7],
];

/// The two faces holding each edge, as `[face vertex, other edges...]` pairs.
pub(crate) const EDGE_NEIGHBORS: [[u8; 8]; 12] = [
    [16, 1, 2, 3, 14, 4, 8, 9],
    [16, 0, 2, 3, 13, 5, 9, 10],
    [16, 0, 1, 3, 15, 6, 10, 11],
    [16, 0, 1, 2, 12, 7, 8, 11],
    [17, 5, 6, 7, 14, 0, 8, 9],
    [17, 4, 6, 7, 13, 1, 9, 10],
    [17, 4, 5, 7, 15, 2, 10, 11],
    [17, 4, 5, 6, 12, 3, 8, 11],
    [12, 3, 7, 11, 14, 0, 4, 9],
    [14, 0, 4, 8, 13, 1, 5, 10],
    [13, 1, 5, 9, 15, 2, 6, 11],
    [15, 2, 6, 10, 12, 3, 7, 8],
];

/// Corner neighbors along cube edges, with the edge that joins them.
pub(crate) const CORNER_NEIGHBORS: [[(usize, usize); 3]; 8] = [
    [(1, 0), (3, 3), (4, 8)],
    [(0, 0), (2, 1), (5, 9)],
    [(1, 1), (3, 2), (6, 10)],
    [(0, 3), (2, 2), (7, 11)],
    [(0, 8), (5, 4), (7, 7)],
    [(1, 9), (4, 4), (6, 5)],
    [(2, 10), (5, 5), (7, 6)],
    [(3, 11), (4, 7), (6, 6)],
];

/// Local index of the cell center vertex.
pub(crate) const CENTER_VERTEX: u8 = 18;

/// Number of local vertex slots per cell.
pub(crate) const NUM_LOCAL_VERTICES: usize = 19;

/// Local index of the vertex on face `face`.
#[inline]
pub(crate) fn face_vertex(face: usize) -> u8 {
    12 + face as u8
}

/// Lower corner offset and axis of an edge.
#[inline]
pub(crate) fn edge_origin(edge: usize) -> ([i32; 3], usize) {
    let [a, b] = EDGE_CORNERS[edge];
    let (pa, pb) = (CORNER_OFFSETS[a], CORNER_OFFSETS[b]);
    let axis = (0..3).find(|&k| pa[k] != pb[k]).unwrap_or(0);
    let lower = if pa[axis] < pb[axis] { pa } else { pb };
    (lower, axis)
}

/// How faces with more than two cuts are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AmbiguousFaces {
    /// Keep the corners of the lower label apart; no face vertex.
    SeparateLow,
    /// Route every cut on the face through the face vertex.
    FaceVertex,
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    from: u8,
    to: u8,
}

/// Triangulate the interfaces between the corner regions of one cube.
pub(crate) fn triangulate(labels: &[u8; 8], mode: AmbiguousFaces) -> Vec<[u8; 3]> {
    let mut segments: HashMap<(u8, u8), Vec<Segment>> = HashMap::new();

    for face in 0..6 {
        let corners = FACE_CORNERS[face];
        let edges = FACE_EDGES[face];
        let label = |i: usize| labels[corners[i % 4]];
        let cuts: Vec<usize> = (0..4).filter(|&i| label(i) != label(i + 1)).collect();

        let through_face_vertex = cuts.len() > 2 && mode == AmbiguousFaces::FaceVertex;
        for (k, &i) in cuts.iter().enumerate() {
            let (a, b) = (label(i), label(i + 1));
            let key = (a.min(b), a.max(b));
            let entering = b < a;
            let edge = edges[i] as u8;

            if through_face_vertex {
                let fv = face_vertex(face);
                let segment = if entering {
                    Segment { from: edge, to: fv }
                } else {
                    Segment { from: fv, to: edge }
                };
                segments.entry(key).or_default().push(segment);
            } else if entering {
                let next = cuts[(k + 1) % cuts.len()];
                segments.entry(key).or_default().push(Segment {
                    from: edge,
                    to: edges[next] as u8,
                });
            }
        }
    }

    let mut keys: Vec<(u8, u8)> = segments.keys().copied().collect();
    keys.sort_unstable();

    let mut triangles = Vec::new();
    for key in keys {
        for chain in chain_segments(&segments[&key]) {
            fan_chain(&chain, &mut triangles);
        }
    }
    triangles
}

/// A polyline of local vertices; closed chains repeat nothing at the end.
struct Chain {
    vertices: Vec<u8>,
    closed: bool,
}

fn chain_segments(segments: &[Segment]) -> Vec<Chain> {
    let mut used = vec![false; segments.len()];
    let mut ends = [0u8; NUM_LOCAL_VERTICES];
    for s in segments {
        ends[s.to as usize] += 1;
    }

    let mut chains = Vec::new();
    loop {
        // open chains start where nothing ends
        let start = (0..segments.len())
            .find(|&i| !used[i] && ends[segments[i].from as usize] == 0)
            .or_else(|| (0..segments.len()).find(|&i| !used[i]));
        let Some(start) = start else {
            break;
        };

        let first = segments[start].from;
        let mut vertices = vec![first];
        let mut current = start;
        loop {
            used[current] = true;
            let to = segments[current].to;
            if to == first {
                break;
            }
            vertices.push(to);
            match (0..segments.len()).find(|&i| !used[i] && segments[i].from == to) {
                Some(next) => current = next,
                None => break,
            }
        }
        let closed = segments[current].to == first;
        chains.push(Chain { vertices, closed });
    }
    chains
}

fn fan_chain(chain: &Chain, triangles: &mut Vec<[u8; 3]>) {
    let v = &chain.vertices;
    if chain.closed {
        let mut sorted = v.clone();
        sorted.sort_unstable();
        sorted.dedup();
        let repeats = sorted.len() != v.len();
        if v.len() < 3 {
            return;
        }
        if !repeats {
            for i in 1..v.len() - 1 {
                triangles.push([v[0], v[i], v[i + 1]]);
            }
            return;
        }
        for i in 0..v.len() {
            push_distinct(triangles, [CENTER_VERTEX, v[i], v[(i + 1) % v.len()]]);
        }
    } else {
        for i in 0..v.len().saturating_sub(1) {
            push_distinct(triangles, [CENTER_VERTEX, v[i], v[i + 1]]);
        }
    }
}

fn push_distinct(triangles: &mut Vec<[u8; 3]>, t: [u8; 3]) {
    if t[0] != t[1] && t[1] != t[2] && t[2] != t[0] {
        triangles.push(t);
    }
}

/// Marching-cubes case table indexed by the 8-bit inside mask (bit `i` = corner `i`).
pub(crate) fn case_table() -> &'static [Vec<[u8; 3]>] {
    static TABLE: OnceLock<Vec<Vec<[u8; 3]>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        (0..256usize)
            .map(|mask| {
                let mut labels = [1u8; 8];
                for (i, label) in labels.iter_mut().enumerate() {
                    if mask & (1 << i) != 0 {
                        *label = 0;
                    }
                }
                triangulate(&labels, AmbiguousFaces::SeparateLow)
            })
            .collect()
    })
}

/// Triangle template for a corner group labeling.
///
/// Labels must be numbered in order of first appearance (corner 0 has label 0,
/// the next new label is 1, ...), which is what a flood fill over the corners
/// produces. Every such labeling is tabulated once.
pub(crate) fn group_template(groups: &[u8; 8]) -> &'static [[u8; 3]] {
    static TEMPLATES: OnceLock<HashMap<[u8; 8], Vec<[u8; 3]>>> = OnceLock::new();
    let templates = TEMPLATES.get_or_init(|| {
        let mut templates = HashMap::new();
        let mut labels = [0u8; 8];
        enumerate_labelings(&mut labels, 1, 0, &mut |l| {
            templates.insert(*l, triangulate(l, AmbiguousFaces::FaceVertex));
        });
        templates
    });
    templates.get(groups).map_or(&[], |t| t.as_slice())
}

/// Visit all labelings in first-appearance order (restricted growth strings).
fn enumerate_labelings(
    labels: &mut [u8; 8],
    position: usize,
    max_label: u8,
    visit: &mut impl FnMut(&[u8; 8]),
) {
    if position == 8 {
        visit(labels);
        return;
    }
    for label in 0..=max_label + 1 {
        labels[position] = label;
        enumerate_labelings(labels, position + 1, max_label.max(label), visit);
    }
}

/// Flood-fill corner groups; `cut[e]` blocks cube edge `e`.
pub(crate) fn corner_groups(cut: &[bool; 12]) -> [u8; 8] {
    let mut groups = [u8::MAX; 8];
    let mut next_group = 0u8;
    let mut stack = Vec::with_capacity(8);
    for start in 0..8 {
        if groups[start] != u8::MAX {
            continue;
        }
        stack.push(start);
        while let Some(corner) = stack.pop() {
            if groups[corner] != u8::MAX {
                continue;
            }
            groups[corner] = next_group;
            for &(adj, edge) in &CORNER_NEIGHBORS[corner] {
                if !cut[edge] && groups[adj] == u8::MAX {
                    stack.push(adj);
                }
            }
        }
        next_group += 1;
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    #[test]
    fn test_tables_are_consistent() {
        for (f, corners) in FACE_CORNERS.iter().enumerate() {
            for i in 0..4 {
                let [a, b] = EDGE_CORNERS[FACE_EDGES[f][i]];
                let (c0, c1) = (corners[i], corners[(i + 1) % 4]);
                assert!((a, b) == (c0, c1) || (a, b) == (c1, c0), "face {} edge {}", f, i);
            }
        }
        for (e, neighbors) in EDGE_NEIGHBORS.iter().enumerate() {
            for half in [&neighbors[0..4], &neighbors[4..8]] {
                let face = (half[0] - 12) as usize;
                assert!(FACE_EDGES[face].contains(&e));
                for &other in &half[1..] {
                    assert!(FACE_EDGES[face].contains(&(other as usize)));
                }
            }
        }
        assert_eq!(edge_origin(10), ([1, 1, 0], 2));
        assert_eq!(edge_origin(7), ([0, 0, 1], 1));
    }

    #[test]
    fn test_empty_and_full_cases() {
        let table = case_table();
        assert_eq!(table.len(), 256);
        assert!(table[0].is_empty());
        assert!(table[255].is_empty());
    }

    #[test]
    fn test_single_corner_points_outward() {
        let table = case_table();
        assert_eq!(table[1].len(), 1);
        // the triangle may start at any corner; only its winding is fixed
        let t = table[1][0];
        let first = (0..3).min_by_key(|&k| t[k]).unwrap_or(0);
        assert_eq!(
            [t[first], t[(first + 1) % 3], t[(first + 2) % 3]],
            [0, 3, 8]
        );
        // normal of (e0, e3, e8) midpoints points away from corner 0
        let mid = |e: usize| {
            let [a, b] = EDGE_CORNERS[e];
            let (pa, pb) = (CORNER_OFFSETS[a], CORNER_OFFSETS[b]);
            [
                (pa[0] + pb[0]) as f64 / 2.0,
                (pa[1] + pb[1]) as f64 / 2.0,
                (pa[2] + pb[2]) as f64 / 2.0,
            ]
        };
        let t = table[1][0];
        let (p0, p1, p2) = (mid(t[0] as usize), mid(t[1] as usize), mid(t[2] as usize));
        let u = [p1[0] - p0[0], p1[1] - p0[1], p1[2] - p0[2]];
        let v = [p2[0] - p0[0], p2[1] - p0[1], p2[2] - p0[2]];
        let n = [
            u[1] * v[2] - u[2] * v[1],
            u[2] * v[0] - u[0] * v[2],
            u[0] * v[1] - u[1] * v[0],
        ];
        assert!(n[0] > 0.0 && n[1] > 0.0 && n[2] > 0.0);
    }

    /// Mesh a random binary field with the case table and check that every
    /// directed edge is matched by its reverse exactly once.
    #[test]
    fn test_case_table_is_watertight_and_oriented() {
        const N: i32 = 6;
        let mut seed = 12345u64;
        let mut inside = vec![false; (N * N * N) as usize];
        for x in 1..N - 1 {
            for y in 1..N - 1 {
                for z in 1..N - 1 {
                    seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    inside[(x + N * (y + N * z)) as usize] = (seed >> 33) % 2 == 0;
                }
            }
        }
        let at = |p: [i32; 3]| inside[(p[0] + N * (p[1] + N * p[2])) as usize];

        let mut directed: HashMap<(([i32; 3], usize), ([i32; 3], usize)), u32> = HashMap::new();
        let table = case_table();
        for x in 0..N - 1 {
            for y in 0..N - 1 {
                for z in 0..N - 1 {
                    let mut mask = 0;
                    for (i, o) in CORNER_OFFSETS.iter().enumerate() {
                        if at([x + o[0], y + o[1], z + o[2]]) {
                            mask |= 1 << i;
                        }
                    }
                    let global = |e: u8| {
                        let (o, axis) = edge_origin(e as usize);
                        ([x + o[0], y + o[1], z + o[2]], axis)
                    };
                    for t in &table[mask] {
                        for k in 0..3 {
                            let key = (global(t[k]), global(t[(k + 1) % 3]));
                            *directed.entry(key).or_insert(0) += 1;
                        }
                    }
                }
            }
        }
        assert!(!directed.is_empty());
        for (&(a, b), &count) in &directed {
            assert_eq!(count, 1, "directed edge used twice");
            assert_eq!(directed.get(&(b, a)), Some(&1), "edge without opposite");
        }
    }

    #[test]
    fn test_group_templates() {
        assert!(group_template(&[0; 8]).is_empty());

        let single = group_template(&[0, 1, 1, 1, 1, 1, 1, 1]);
        assert_eq!(single.len(), 1);

        let all_distinct = group_template(&[0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(!all_distinct.is_empty());
        for t in all_distinct {
            assert!(t.iter().all(|&v| (v as usize) < NUM_LOCAL_VERTICES));
            assert!(t[0] != t[1] && t[1] != t[2] && t[0] != t[2]);
        }
        // every face has four cuts, so all face vertices are used
        for face in 0..6 {
            assert!(all_distinct.iter().any(|t| t.contains(&face_vertex(face))));
        }

        // not a first-appearance labeling
        assert!(group_template(&[1, 0, 0, 0, 0, 0, 0, 0]).is_empty());
    }

    #[test]
    fn test_corner_groups_flood_fill() {
        let mut cut = [false; 12];
        assert_eq!(corner_groups(&cut), [0; 8]);

        // isolate corner 6 (edges 5, 6, 10)
        cut[5] = true;
        cut[6] = true;
        cut[10] = true;
        assert_eq!(corner_groups(&cut), [0, 0, 0, 0, 0, 0, 1, 0]);
    }
}
