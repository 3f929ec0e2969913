//! End-to-end tests driving the kernel through [`MeshPipeline`].
//!
//! These follow the two authoring paths a simulation tool takes:
//! - cloth: render mesh in, isosurface, simplify, buffers out
//! - soft body: closed surface in, tetrahedra out

use approx::assert_relative_eq;
use mesh_kernel::progress::ProgressRecorder;
use mesh_kernel::{
    ContractParams, DistanceFieldContractor, ErrorCode, IsoParams, IsoVariant,
    IsosurfaceExtractor, MeshPipeline, MeshReducer, QuadricSimplifier, ReducerState,
    SimplifyParams, TetraParams, Tetrahedralizer, TriangleMesh, VoxelExtractor,
};
use nalgebra::Point3;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

// =============================================================================
// Test Mesh Helpers
// =============================================================================

/// Route kernel logs to the test output. RUST_LOG=mesh_kernel=debug for detail.
fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_test_writer().compact())
        .with(EnvFilter::from_default_env())
        .try_init();
}

fn bumpy_sphere(levels: u32) -> TriangleMesh {
    let mut mesh = TriangleMesh::sphere(Point3::origin(), 1.0, levels);
    for (i, v) in mesh.vertices.iter_mut().enumerate() {
        let scale = 1.0 + 0.08 * (i as f64 * 1.3).sin();
        v.position = Point3::from(v.position.coords * scale);
    }
    mesh
}

/// Pack a mesh the way a host application hands it over: `f32` positions
/// padded to `vertex_stride`, `u32` indices.
fn to_buffers(mesh: &TriangleMesh, vertex_stride: usize) -> (Vec<u8>, Vec<u8>) {
    let mut vertices = vec![0u8; mesh.vertex_count() * vertex_stride];
    for (i, v) in mesh.vertices.iter().enumerate() {
        for (k, c) in v.position.coords.iter().enumerate() {
            let o = i * vertex_stride + 4 * k;
            vertices[o..o + 4].copy_from_slice(&(*c as f32).to_le_bytes());
        }
    }
    let indices = mesh
        .triangles
        .iter()
        .flatten()
        .flat_map(|i| i.to_le_bytes())
        .collect();
    (vertices, indices)
}

fn read_u32s(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}

// =============================================================================
// Cloth Path
// =============================================================================

#[test]
fn test_cloth_path_exports_consistent_buffers() {
    init_tracing();
    let sphere = TriangleMesh::sphere(Point3::origin(), 1.0, 2);
    let (vertex_bytes, index_bytes) = to_buffers(&sphere, 16);

    let mut pipeline = MeshPipeline::new();
    pipeline
        .set_geometry(&vertex_bytes, 16, &index_bytes, 4, false)
        .unwrap();
    assert_eq!(pipeline.num_vertices(), sphere.vertex_count());

    pipeline
        .extract_isosurface(IsoVariant::Voxel, &IsoParams::with_subdivision(12), None)
        .unwrap();
    let extracted = pipeline.surface().unwrap().triangle_count();
    assert!(extracted > 0);

    let collapsed = pipeline
        .simplify(&SimplifyParams::for_isosurface(12), None)
        .unwrap();
    assert!(collapsed > 0);
    assert!(pipeline.is_dirty());
    assert!(pipeline.num_indices() < 3 * extracted);

    let num_vertices = pipeline.num_vertices();
    let num_indices = pipeline.num_indices();
    let mut out_vertices = vec![0u8; num_vertices * 12];
    let mut out_indices = vec![0u8; num_indices * 4];
    assert_eq!(pipeline.write_vertices(&mut out_vertices, 0).unwrap(), num_vertices);
    assert_eq!(pipeline.write_indices(&mut out_indices, 0).unwrap(), num_indices);
    assert!(!pipeline.is_dirty());

    let indices = read_u32s(&out_indices);
    assert!(indices.iter().all(|&i| (i as usize) < num_vertices));
    let surface = pipeline.surface().unwrap();
    assert!(surface.border_edges().is_empty());
    assert!(surface.signed_volume() > 0.0);
}

#[test]
fn test_generalized_variant_stays_on_input_faces() {
    let (min, max) = (Point3::new(0.05, 0.07, 0.09), Point3::new(1.05, 1.07, 1.09));
    let mut pipeline = MeshPipeline::from_mesh(&TriangleMesh::cuboid(min, max)).unwrap();
    pipeline
        .extract_isosurface(IsoVariant::Generalized, &IsoParams::with_subdivision(4), None)
        .unwrap();

    let surface = pipeline.surface().unwrap();
    assert!(!surface.is_empty());
    assert!(surface.border_edges().is_empty());
    let eps = 1e-9;
    for v in &surface.vertices {
        let p = v.position;
        let inside = (0..3).all(|k| p[k] >= min[k] - eps && p[k] <= max[k] + eps);
        let on_face = (0..3).any(|k| (p[k] - min[k]).abs() < eps || (p[k] - max[k]).abs() < eps);
        assert!(inside && on_face, "{:?}", p);
    }
}

#[test]
fn test_lossless_simplification_keeps_box_shape() {
    // every vertex of a box is a corner, so no collapse is free
    let mut pipeline = MeshPipeline::from_mesh(&TriangleMesh::cuboid(
        Point3::origin(),
        Point3::new(2.0, 1.0, 1.0),
    ))
    .unwrap();
    assert_eq!(
        pipeline.simplify(&SimplifyParams::lossless(), None).unwrap(),
        0
    );
    assert!(!pipeline.is_dirty());
    let surface = pipeline.surface().unwrap();
    assert_relative_eq!(surface.signed_volume(), 2.0, epsilon = 1e-9);
    assert_eq!(surface.vertex_count(), 8);
}

// =============================================================================
// Soft Body Path
// =============================================================================

#[test]
fn test_soft_body_path_fills_surface_volume() {
    init_tracing();
    let sphere = bumpy_sphere(2);
    let (vertex_bytes, index_bytes) = to_buffers(&sphere, 12);

    let mut pipeline = MeshPipeline::new();
    pipeline
        .set_geometry(&vertex_bytes, 12, &index_bytes, 4, false)
        .unwrap();
    let surface_volume = pipeline.surface().unwrap().signed_volume();

    let mut recorder = ProgressRecorder::new();
    let count = pipeline
        .tetrahedralize(&TetraParams::with_subdivision(10), Some(&mut recorder))
        .unwrap();
    assert!(count > 0);
    assert!(pipeline.is_tetra());
    assert_eq!(pipeline.num_indices(), 4 * count);
    assert_eq!(recorder.last_percent(), Some(100));
    assert!(recorder.is_monotonic());

    let tetra = pipeline.tetra_mesh().unwrap().clone();
    assert_relative_eq!(tetra.volume(), surface_volume, max_relative = 1e-5);

    let mut out = vec![0u8; pipeline.num_indices() * 8];
    assert_eq!(pipeline.write_indices(&mut out, 8).unwrap(), 4 * count);
    let written: Vec<u32> = out
        .chunks_exact(8)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect();
    assert_eq!(written, tetra.tetrahedra.as_flattened());
}

#[test]
fn test_tetra_geometry_rejects_surface_operations() {
    let cube = TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
    let mut pipeline = MeshPipeline::from_mesh(&cube).unwrap();
    pipeline
        .tetrahedralize(&TetraParams::default(), None)
        .unwrap();

    let before = pipeline.num_indices();
    let codes = [
        pipeline.simplify(&SimplifyParams::default(), None).unwrap_err().code(),
        pipeline.contract(&ContractParams::default(), None).unwrap_err().code(),
        pipeline
            .extract_isosurface(IsoVariant::Voxel, &IsoParams::default(), None)
            .unwrap_err()
            .code(),
        pipeline.fix_triangle_orientations().unwrap_err().code(),
    ];
    assert!(codes.iter().all(|&c| c == ErrorCode::WrongMeshKind));
    assert_eq!(pipeline.num_indices(), before);
}

// =============================================================================
// Reducer Hand-Over
// =============================================================================

#[test]
fn test_contract_then_simplify_hands_over_geometry() {
    let sphere = TriangleMesh::sphere(Point3::origin(), 1.0, 3);
    let mut pipeline = MeshPipeline::from_mesh(&sphere).unwrap();

    let params = ContractParams {
        subdivision: 20,
        steps: Some(2),
        abort_ratio: 0.2,
        expand_border: false,
    };
    pipeline.contract(&params, None).unwrap();
    assert_eq!(pipeline.reducer_state(), ReducerState::Contractor);
    let contracted_volume = pipeline.surface().unwrap().signed_volume();
    assert!(contracted_volume <= sphere.signed_volume() + 1e-9);
    assert!(pipeline.master_indices().is_none());

    pipeline
        .simplify(&SimplifyParams::with_max_steps(20), None)
        .unwrap();
    assert_eq!(pipeline.reducer_state(), ReducerState::Simplifier);
    let surface = pipeline.surface().unwrap();
    assert!(surface.border_edges().is_empty());
    assert!(surface.signed_volume() > 0.0);
}

#[test]
fn test_new_geometry_drops_reducer() {
    let sphere = TriangleMesh::sphere(Point3::origin(), 1.0, 2);
    let mut pipeline = MeshPipeline::from_mesh(&sphere).unwrap();
    pipeline
        .simplify(&SimplifyParams::with_max_steps(5), None)
        .unwrap();
    assert_eq!(pipeline.reducer_state(), ReducerState::Simplifier);

    let cube = TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
    pipeline.set_geometry_from(&cube).unwrap();
    assert_eq!(pipeline.reducer_state(), ReducerState::None);
    assert!(!pipeline.is_dirty());
    assert_eq!(pipeline.num_vertices(), 8);
    let masters = pipeline.master_indices().unwrap();
    assert!(masters.iter().enumerate().all(|(i, m)| m == &[i as u32]));
}

// =============================================================================
// Repeatability
// =============================================================================

#[test]
fn test_finalize_is_repeatable() {
    let sphere = bumpy_sphere(2);

    let simplified = || {
        let mut simplifier = QuadricSimplifier::new();
        simplifier.register_mesh(&sphere).unwrap();
        simplifier.end_registration(true, None).unwrap();
        simplifier.simplify(0, Some(40), None, None).unwrap();
        (simplifier.compact().0, simplifier.master_indices())
    };
    assert_eq!(simplified(), simplified());

    let contracted = || {
        let mut contractor = DistanceFieldContractor::new();
        contractor.register_mesh(&sphere).unwrap();
        contractor.end_registration(16, None).unwrap();
        contractor.contract(Some(3), 0.2, None).unwrap();
        contractor.to_mesh()
    };
    assert_eq!(contracted(), contracted());

    let tetrahedralized = || {
        let mut tetrahedralizer = Tetrahedralizer::new(TetraParams::with_subdivision(10));
        tetrahedralizer.register_mesh(&sphere).unwrap();
        tetrahedralizer.end_registration(None).unwrap();
        tetrahedralizer.to_mesh()
    };
    assert_eq!(tetrahedralized(), tetrahedralized());

    let extracted = || {
        let mut extractor = VoxelExtractor::new(IsoParams::with_subdivision(10));
        extractor.add_mesh(&sphere);
        extractor.extract(None).unwrap();
        extractor.mesh().clone()
    };
    assert_eq!(extracted(), extracted());
}

// =============================================================================
// Caller Errors
// =============================================================================

#[test]
fn test_buffer_errors_carry_codes() {
    let cube = TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
    let (vertex_bytes, index_bytes) = to_buffers(&cube, 12);
    let mut pipeline = MeshPipeline::new();

    let err = pipeline
        .set_geometry(&vertex_bytes, 12, &index_bytes, 2, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidStride);
    assert_eq!(err.code().as_str(), "KERN-1001");

    let err = pipeline
        .set_geometry(&vertex_bytes, 12, &index_bytes[..index_bytes.len() - 4], 4, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidIndexCount);

    let err = pipeline
        .set_geometry(&vertex_bytes[..12 * 4], 12, &index_bytes, 4, false)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::IndexOutOfRange);
    assert_eq!(pipeline.num_vertices(), 0);

    pipeline
        .set_geometry(&vertex_bytes, 12, &index_bytes, 4, false)
        .unwrap();
    let mut small = vec![0u8; 8 * 12 - 1];
    let err = pipeline.write_vertices(&mut small, 12).unwrap_err();
    assert_eq!(err.code(), ErrorCode::BufferTooSmall);
    assert!(small.iter().all(|&b| b == 0));
}

#[test]
fn test_invalid_parameters_leave_pipeline_untouched() {
    let sphere = TriangleMesh::sphere(Point3::origin(), 1.0, 1);
    let mut pipeline = MeshPipeline::from_mesh(&sphere).unwrap();

    let err = pipeline
        .extract_isosurface(IsoVariant::Voxel, &IsoParams::with_subdivision(0), None)
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);

    let err = pipeline
        .contract(
            &ContractParams {
                abort_ratio: 1.5,
                ..Default::default()
            },
            None,
        )
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidParameter);

    assert_eq!(pipeline.stages_executed(), 0);
    assert_eq!(pipeline.reducer_state(), ReducerState::None);
    assert_eq!(pipeline.surface().unwrap(), &sphere);
}
