//! Benchmarks for the mesh kernel stages.
//!
//! Run with: cargo bench -p mesh-kernel
//!
//! To compare against baseline:
//! 1. First run: cargo bench -p mesh-kernel -- --save-baseline main
//! 2. After changes: cargo bench -p mesh-kernel -- --baseline main

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use mesh_kernel::tetra::delaunay;
use mesh_kernel::{
    Bounds, DistanceFieldContractor, GeneralizedExtractor, IsoParams, IsosurfaceExtractor,
    MeshPipeline, QuadricSimplifier, SpatialHash, TetraParams, Tetrahedralizer, TriangleMesh,
    VoxelExtractor,
};
use nalgebra::{Point3, Vector3};

// =============================================================================
// Test Data
// =============================================================================

fn create_sphere(levels: u32) -> TriangleMesh {
    TriangleMesh::sphere(Point3::origin(), 1.0, levels)
}

/// Points on a jittered lattice, deterministic without an RNG.
fn lattice_points(n: usize) -> Vec<Point3<f64>> {
    let side = (n as f64).cbrt().ceil() as usize;
    (0..n)
        .map(|k| {
            let (i, j, l) = (k % side, (k / side) % side, k / (side * side));
            let jitter = ((k * 7919) % 97) as f64 / 970.0;
            Point3::new(
                i as f64 + jitter,
                j as f64 - jitter * 0.5,
                l as f64 + jitter * 0.25,
            )
        })
        .collect()
}

// =============================================================================
// Spatial Hash
// =============================================================================

fn bench_spatial_hash(c: &mut Criterion) {
    let mut group = c.benchmark_group("spatial_hash");

    for &n in &[1_000usize, 10_000] {
        let points = lattice_points(n);
        group.throughput(Throughput::Elements(n as u64));

        group.bench_with_input(BenchmarkId::new("insert", n), &points, |b, points| {
            b.iter(|| {
                let mut hash = SpatialHash::new(1.0);
                for (i, p) in points.iter().enumerate() {
                    hash.add_point(p, i as u32);
                }
                black_box(hash.len())
            })
        });

        let mut hash = SpatialHash::new(1.0);
        for (i, p) in points.iter().enumerate() {
            hash.add_point(p, i as u32);
        }
        group.bench_with_input(BenchmarkId::new("query_bounds", n), &points, |b, points| {
            let mut found = Vec::new();
            b.iter(|| {
                for p in points.iter().step_by(10) {
                    found.clear();
                    let query = Bounds::new(p - Vector3::repeat(1.5), p + Vector3::repeat(1.5));
                    hash.query_unique_bounds(black_box(&query), &mut found, usize::MAX);
                }
                black_box(found.len())
            })
        });
    }

    group.finish();
}

// =============================================================================
// Isosurface Extraction
// =============================================================================

fn bench_isosurface(c: &mut Criterion) {
    let mut group = c.benchmark_group("isosurface");
    group.sample_size(20);

    let sphere = create_sphere(3);
    for &subdivision in &[20u32, 40] {
        group.bench_with_input(
            BenchmarkId::new("voxel", subdivision),
            &subdivision,
            |b, &subdivision| {
                b.iter(|| {
                    let mut extractor = VoxelExtractor::new(IsoParams::with_subdivision(subdivision));
                    extractor.add_mesh(black_box(&sphere));
                    extractor.extract(None).ok();
                    black_box(extractor.mesh().triangle_count())
                })
            },
        );

        group.bench_with_input(
            BenchmarkId::new("generalized", subdivision),
            &subdivision,
            |b, &subdivision| {
                b.iter(|| {
                    let mut extractor =
                        GeneralizedExtractor::new(IsoParams::with_subdivision(subdivision));
                    extractor.add_mesh(black_box(&sphere));
                    extractor.extract(None).ok();
                    black_box(extractor.mesh().triangle_count())
                })
            },
        );
    }

    group.finish();
}

// =============================================================================
// Reduction
// =============================================================================

fn bench_reduction(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduction");
    group.sample_size(20);

    for &levels in &[3u32, 4] {
        let sphere = create_sphere(levels);
        group.throughput(Throughput::Elements(sphere.triangle_count() as u64));

        group.bench_with_input(
            BenchmarkId::new("simplify_half", sphere.triangle_count()),
            &sphere,
            |b, sphere| {
                b.iter(|| {
                    let mut simplifier = QuadricSimplifier::new();
                    for v in &sphere.vertices {
                        simplifier.register_vertex(v.position).ok();
                    }
                    for &[i, j, k] in &sphere.triangles {
                        simplifier.register_triangle(i, j, k).ok();
                    }
                    simplifier.end_registration(false, None).ok();
                    let steps = sphere.vertex_count() / 2;
                    black_box(simplifier.simplify(0, Some(steps), None, None).ok())
                })
            },
        );

        group.bench_with_input(
            BenchmarkId::new("contract", sphere.triangle_count()),
            &sphere,
            |b, sphere| {
                b.iter(|| {
                    let mut contractor = DistanceFieldContractor::new();
                    for v in &sphere.vertices {
                        contractor.register_vertex(v.position).ok();
                    }
                    for &[i, j, k] in &sphere.triangles {
                        contractor.register_triangle(i, j, k).ok();
                    }
                    contractor.end_registration(30, None).ok();
                    black_box(contractor.contract(Some(5), 0.3, None).ok())
                })
            },
        );
    }

    group.finish();
}

// =============================================================================
// Tetrahedralization
// =============================================================================

fn bench_tetrahedralize(c: &mut Criterion) {
    let mut group = c.benchmark_group("tetrahedralize");
    group.sample_size(20);

    for &n in &[500usize, 2_000] {
        let points = lattice_points(n);
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::new("delaunay", n), &points, |b, points| {
            b.iter(|| black_box(delaunay(black_box(points)).tetrahedra.len()))
        });
    }

    for &levels in &[2u32, 3] {
        let sphere = create_sphere(levels);
        group.bench_with_input(
            BenchmarkId::new("surface", sphere.triangle_count()),
            &sphere,
            |b, sphere| {
                b.iter(|| {
                    let mut tetra = Tetrahedralizer::new(TetraParams::with_subdivision(20));
                    tetra.register_mesh(black_box(sphere)).ok();
                    tetra.end_registration(None).ok();
                    black_box(tetra.num_tetrahedra())
                })
            },
        );
    }

    group.finish();
}

// =============================================================================
// Pipeline
// =============================================================================

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");

    let sphere = create_sphere(4);
    let mut vertex_bytes = Vec::new();
    for v in &sphere.vertices {
        for x in v.position.iter() {
            vertex_bytes.extend_from_slice(&(*x as f32).to_le_bytes());
        }
    }
    let index_bytes: Vec<u8> = sphere
        .triangles
        .iter()
        .flatten()
        .flat_map(|i| i.to_le_bytes())
        .collect();

    group.throughput(Throughput::Bytes((vertex_bytes.len() + index_bytes.len()) as u64));
    group.bench_function("set_geometry", |b| {
        b.iter(|| {
            let mut pipeline = MeshPipeline::new();
            pipeline
                .set_geometry(black_box(&vertex_bytes), 12, black_box(&index_bytes), 4, false)
                .ok();
            black_box(pipeline.num_vertices())
        })
    });

    let mut pipeline = MeshPipeline::new();
    pipeline.set_geometry(&vertex_bytes, 12, &index_bytes, 4, false).ok();
    group.bench_function("fix_triangle_orientations", |b| {
        b.iter(|| black_box(pipeline.fix_triangle_orientations().ok()))
    });

    group.finish();
}

// =============================================================================
// Criterion Setup
// =============================================================================

criterion_group!(
    benches,
    bench_spatial_hash,
    bench_isosurface,
    bench_reduction,
    bench_tetrahedralize,
    bench_pipeline,
);

criterion_main!(benches);
