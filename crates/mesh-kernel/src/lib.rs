//! Geometry kernel for authoring cloth and soft-body simulation meshes.
//!
//! The crate turns arbitrary render geometry into meshes a physics solver can
//! use. It provides:
//!
//! - **Isosurface extraction**: re-mesh any triangle soup into closed, manifold
//!   surfaces on a voxel grid ([`isosurface::VoxelExtractor`]) or with exact
//!   crossings on the input triangles ([`isosurface::GeneralizedExtractor`]).
//! - **Reduction**: quadric edge-collapse simplification
//!   ([`reduce::QuadricSimplifier`]) and contraction along a signed distance
//!   field ([`reduce::DistanceFieldContractor`]).
//! - **Tetrahedralization**: constrained Delaunay filling of closed surfaces
//!   ([`tetra::Tetrahedralizer`]).
//! - **Orchestration**: [`pipeline::MeshPipeline`] runs the stages on one
//!   physical mesh and exchanges geometry through strided byte buffers.
//!
//! Everything is single-threaded and synchronous. Long operations report to an
//! optional [`progress::ProgressListener`]; progress never influences control
//! flow.
//!
//! # Quick Start
//!
//! ```
//! use mesh_kernel::isosurface::{IsoParams, IsosurfaceExtractor, VoxelExtractor};
//! use mesh_kernel::reduce::{MeshReducer, QuadricSimplifier, SimplifyParams};
//! use mesh_kernel::TriangleMesh;
//! use nalgebra::Point3;
//!
//! let sphere = TriangleMesh::sphere(Point3::origin(), 1.0, 2);
//!
//! let mut extractor = VoxelExtractor::new(IsoParams::with_subdivision(12));
//! extractor.add_mesh(&sphere);
//! extractor.extract(None).unwrap();
//!
//! let params = SimplifyParams::for_isosurface(12);
//! let mut simplifier = QuadricSimplifier::new();
//! simplifier.register_mesh(extractor.mesh()).unwrap();
//! simplifier.end_registration(params.merge_close_vertices, None).unwrap();
//! simplifier.reduce(&params, None).unwrap();
//! assert!(simplifier.remaining_triangles() <= extractor.mesh().triangle_count());
//! ```
//!
//! # Error Handling
//!
//! Geometric degeneracies are resolved inside the algorithms and never become
//! errors. Caller misuse (bad strides, zero subdivisions, calls out of
//! protocol order) returns a [`KernelError`] with a `KERN-XXXX` code, logs a
//! warning, and leaves the instance untouched.
//!
//! ```
//! use mesh_kernel::pipeline::MeshPipeline;
//! use mesh_kernel::ErrorCode;
//!
//! let mut pipeline = MeshPipeline::new();
//! let err = pipeline.set_geometry(&[0; 24], 8, &[], 4, false).unwrap_err();
//! assert_eq!(err.code(), ErrorCode::InvalidStride);
//! ```
//!
//! # Logging
//!
//! The crate logs through `tracing` and never installs a subscriber. Timings of
//! the long operations are emitted on the `mesh_kernel::timing` target.

mod error;
mod types;

pub mod geometry;
pub mod isosurface;
pub mod pipeline;
pub mod priority_queue;
pub mod progress;
pub mod reduce;
pub mod spatial_hash;
pub mod tetra;
pub mod tracing_ext;

// Re-export core types at crate root
pub use error::{ErrorCode, KernelError, KernelResult, RecoverySuggestion};
pub use types::{Bounds, TetraMesh, Triangle, TriangleMesh, Vertex};

pub use isosurface::{GeneralizedExtractor, IsoParams, IsosurfaceExtractor, VoxelExtractor};
pub use pipeline::{EdgeLengthStats, IsoVariant, MeshPipeline, ReducerState};
pub use priority_queue::{IndexedHeap, PriorityQueue};
pub use progress::{HierarchicalProgress, ProgressListener};
pub use reduce::{
    ContractParams, DistanceFieldContractor, MeshReducer, QuadricSimplifier, SimplifyParams,
};
pub use spatial_hash::SpatialHash;
pub use tetra::{TetraParams, Tetrahedralizer};

// Pipeline serialization (requires pipeline-config feature)
#[cfg(feature = "pipeline-config")]
pub use pipeline::{PipelineConfig, PipelineStep};
