//! Orchestration of the kernel stages on one physical mesh.
//!
//! A [`MeshPipeline`] owns the working geometry and runs the stages in the
//! order a caller needs for one of two products:
//!
//! - Cloth: isosurface extraction, then simplification or contraction, then
//!   export of the triangle buffer.
//! - Soft body: tetrahedralization of the (possibly reduced) surface, then
//!   export of the tetrahedron buffer.
//!
//! At most one reducer owns the live topology. Its edits stay inside the
//! reducer until they are written back, which happens on export and whenever
//! another stage takes over the mesh.
//!
//! Geometry crosses the boundary as byte buffers with caller-chosen strides:
//! positions as three little-endian `f32`, indices as little-endian `u32`.
//!
//! # Example
//!
//! ```
//! use mesh_kernel::pipeline::MeshPipeline;
//! use mesh_kernel::reduce::SimplifyParams;
//! use mesh_kernel::tetra::TetraParams;
//! use mesh_kernel::TriangleMesh;
//! use nalgebra::Point3;
//!
//! let cube = TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
//! let mut pipeline = MeshPipeline::from_mesh(&cube).unwrap();
//! pipeline.simplify(&SimplifyParams::lossless(), None).unwrap();
//! let tets = pipeline.tetrahedralize(&TetraParams::default(), None).unwrap();
//! assert!(tets > 0);
//! assert!(pipeline.is_tetra());
//! ```

use crate::error::{KernelError, KernelResult};
use crate::isosurface::{GeneralizedExtractor, IsoParams, IsosurfaceExtractor, VoxelExtractor};
use crate::progress::{HierarchicalProgress, ProgressListener};
use crate::reduce::{
    ContractParams, DistanceFieldContractor, MeshReducer, QuadricSimplifier, SimplifyParams,
};
use crate::tetra::{TetraParams, Tetrahedralizer};
use crate::tracing_ext::OperationTimer;
use crate::types::{TetraMesh, TriangleMesh, Vertex};
use hashbrown::HashSet;
use nalgebra::Point3;
use tracing::{debug, info};

/// Bytes of one packed position.
pub const VERTEX_SIZE: usize = 12;

/// Bytes of one index.
pub const INDEX_SIZE: usize = 4;

/// Which isosurface extractor to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "pipeline-config",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum IsoVariant {
    /// Density grid with resampled crossings.
    #[default]
    Voxel,
    /// Sparse cubes with exact crossings on the input triangles.
    Generalized,
}

/// Which reducer currently owns the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReducerState {
    /// No reducer is active; the pipeline geometry is authoritative.
    None,
    /// A [`QuadricSimplifier`] is active.
    Simplifier,
    /// A [`DistanceFieldContractor`] is active.
    Contractor,
}

/// Edge length summary of the current geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeLengthStats {
    /// Length of the shortest edge, 0 without primitives.
    pub shortest: f64,
    /// Mean length over all primitive edges, shared edges counted once per primitive.
    pub average: f64,
    /// Every edge is shared by exactly two triangles. Always false for tetrahedra.
    pub closed: bool,
}

#[derive(Debug, Clone)]
enum Geometry {
    Surface(TriangleMesh),
    Tetra(TetraMesh),
}

#[derive(Debug)]
enum Reducer {
    Simplifier(Box<QuadricSimplifier>),
    Contractor(Box<DistanceFieldContractor>),
}

impl Reducer {
    fn remaining_vertices(&self) -> usize {
        match self {
            Reducer::Simplifier(s) => s.remaining_vertices(),
            Reducer::Contractor(c) => c.remaining_vertices(),
        }
    }

    fn remaining_triangles(&self) -> usize {
        match self {
            Reducer::Simplifier(s) => s.remaining_triangles(),
            Reducer::Contractor(c) => c.remaining_triangles(),
        }
    }
}

// =========================================================================
// Pipeline Configuration (Serialization)
// =========================================================================

/// A single step in a pipeline configuration.
#[cfg(feature = "pipeline-config")]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum PipelineStep {
    /// Drop triangles that repeat another triangle's vertex set.
    RemoveDuplicatedTriangles,
    /// Make triangle windings agree across shared edges.
    FixTriangleOrientations,
    /// Replace the surface by its isosurface.
    ExtractIsosurface {
        #[serde(default)]
        variant: IsoVariant,
        #[serde(flatten)]
        params: IsoParams,
    },
    /// Quadric edge-collapse simplification.
    Simplify {
        #[serde(flatten)]
        params: SimplifyParams,
    },
    /// Distance field contraction.
    Contract {
        #[serde(flatten)]
        params: ContractParams,
    },
    /// Turn the surface into tetrahedra.
    Tetrahedralize {
        #[serde(flatten)]
        params: TetraParams,
    },
}

#[cfg(feature = "pipeline-config")]
impl PipelineStep {
    /// Task name reported to progress listeners.
    pub fn task_name(&self) -> &'static str {
        match self {
            PipelineStep::RemoveDuplicatedTriangles => "Remove duplicated triangles",
            PipelineStep::FixTriangleOrientations => "Fix triangle orientations",
            PipelineStep::ExtractIsosurface { .. } => "Extract isosurface",
            PipelineStep::Simplify { .. } => "Simplify",
            PipelineStep::Contract { .. } => "Contract",
            PipelineStep::Tetrahedralize { .. } => "Tetrahedralize",
        }
    }
}

/// A serializable sequence of pipeline steps.
///
/// # Example JSON
///
/// ```json
/// {
///   "name": "cloth",
///   "steps": [
///     { "operation": "extract_isosurface", "variant": "voxel", "subdivision": 40,
///       "bubble_size": 20, "keep_biggest_meshes": 1, "discard_inner_meshes": true },
///     { "operation": "simplify", "subdivision": 40, "max_steps": null,
///       "max_error": null, "merge_close_vertices": true }
///   ]
/// }
/// ```
#[cfg(feature = "pipeline-config")]
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PipelineConfig {
    /// Optional name for this workflow.
    #[serde(default)]
    pub name: Option<String>,
    /// Optional description of what this workflow does.
    #[serde(default)]
    pub description: Option<String>,
    /// The sequence of operations to perform.
    pub steps: Vec<PipelineStep>,
}

#[cfg(feature = "pipeline-config")]
impl PipelineConfig {
    /// Create an empty pipeline configuration.
    pub fn new() -> Self {
        Self {
            name: None,
            description: None,
            steps: Vec::new(),
        }
    }

    /// Create a configuration with a name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new()
        }
    }

    /// Add a step to the configuration.
    pub fn add_step(mut self, step: PipelineStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Set the description.
    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = Some(desc.into());
        self
    }

    /// Load configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or doesn't match the schema.
    pub fn from_json(json_str: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json_str)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Single-layer cloth surface from arbitrary render geometry.
    pub fn preset_cloth(subdivision: u32) -> Self {
        Self::with_name("cloth")
            .description("Single closed surface, simplified to the grid resolution")
            .add_step(PipelineStep::ExtractIsosurface {
                variant: IsoVariant::Voxel,
                params: IsoParams {
                    subdivision,
                    ..IsoParams::single_layer()
                },
            })
            .add_step(PipelineStep::Simplify {
                params: SimplifyParams::for_isosurface(subdivision),
            })
    }

    /// Soft-body tetrahedra from arbitrary render geometry.
    pub fn preset_soft_body(subdivision: u32) -> Self {
        Self::with_name("soft-body")
            .description("Closed surface, simplified, then tetrahedralized")
            .add_step(PipelineStep::ExtractIsosurface {
                variant: IsoVariant::Voxel,
                params: IsoParams {
                    subdivision,
                    ..IsoParams::single_layer()
                },
            })
            .add_step(PipelineStep::Simplify {
                params: SimplifyParams::for_isosurface(subdivision),
            })
            .add_step(PipelineStep::Tetrahedralize {
                params: TetraParams::default(),
            })
    }

    /// Thin cloth shell contracted from a closed surface.
    pub fn preset_thin_shell() -> Self {
        Self::with_name("thin-shell")
            .description("Contract a closed surface towards its medial sheet")
            .add_step(PipelineStep::RemoveDuplicatedTriangles)
            .add_step(PipelineStep::Contract {
                params: ContractParams::thin_shell(),
            })
    }
}

#[cfg(feature = "pipeline-config")]
impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// The physical mesh being authored and the stages run on it.
///
/// Operations that fail return an error and leave the pipeline as it was.
#[derive(Debug)]
pub struct MeshPipeline {
    geometry: Geometry,
    reducer: Option<Reducer>,
    /// The active reducer holds edits not yet in `geometry`.
    dirty: bool,
    /// Source vertices behind each current vertex; None once they are unknown.
    masters: Option<Vec<Vec<u32>>>,
    /// `masters` when the active reducer registered the geometry.
    reducer_masters: Option<Vec<Vec<u32>>>,
    stages_executed: usize,
    operation_log: Vec<String>,
}

impl Default for MeshPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshPipeline {
    /// Start with an empty triangle mesh.
    pub fn new() -> Self {
        Self {
            geometry: Geometry::Surface(TriangleMesh::new()),
            reducer: None,
            dirty: false,
            masters: Some(Vec::new()),
            reducer_masters: None,
            stages_executed: 0,
            operation_log: Vec::new(),
        }
    }

    /// Start with a copy of `mesh`, see [`Self::set_geometry_from`].
    pub fn from_mesh(mesh: &TriangleMesh) -> KernelResult<Self> {
        let mut pipeline = Self::new();
        pipeline.set_geometry_from(mesh)?;
        Ok(pipeline)
    }

    // =========================================================================
    // Geometry Input
    // =========================================================================

    /// Replace the geometry from caller buffers.
    ///
    /// Element counts are the number of whole elements the buffers hold, so
    /// an interleaved buffer may end right after its last position. Triangle
    /// input goes through [`Self::remove_duplicated_triangles`].
    ///
    /// # Errors
    ///
    /// - [`KernelError::InvalidStride`] if a stride cannot hold its element.
    /// - [`KernelError::BufferTooSmall`] if a non-empty buffer holds no whole element.
    /// - [`KernelError::InvalidIndexCount`] if the indices do not form whole primitives.
    /// - [`KernelError::IndexOutOfRange`] if an index has no vertex.
    pub fn set_geometry(
        &mut self,
        vertex_bytes: &[u8],
        vertex_stride: usize,
        index_bytes: &[u8],
        index_stride: usize,
        is_tetra: bool,
    ) -> KernelResult<()> {
        if vertex_stride < VERTEX_SIZE {
            return Err(
                KernelError::invalid_stride("vertex", vertex_stride, VERTEX_SIZE).reported(),
            );
        }
        if index_stride < INDEX_SIZE {
            return Err(KernelError::invalid_stride("index", index_stride, INDEX_SIZE).reported());
        }
        let num_vertices = strided_count("vertex", vertex_bytes.len(), vertex_stride, VERTEX_SIZE)?;
        let num_indices = strided_count("index", index_bytes.len(), index_stride, INDEX_SIZE)?;
        let primitive_size = if is_tetra { 4 } else { 3 };
        if num_indices % primitive_size != 0 {
            return Err(KernelError::InvalidIndexCount {
                count: num_indices,
                primitive_size,
            }
            .reported());
        }

        let positions: Vec<Point3<f64>> = (0..num_vertices)
            .map(|i| {
                let o = i * vertex_stride;
                Point3::new(
                    read_f32(vertex_bytes, o) as f64,
                    read_f32(vertex_bytes, o + 4) as f64,
                    read_f32(vertex_bytes, o + 8) as f64,
                )
            })
            .collect();
        let indices: Vec<u32> = (0..num_indices)
            .map(|i| read_u32(index_bytes, i * index_stride))
            .collect();
        check_indices(&indices, num_vertices)?;

        let geometry = if is_tetra {
            Geometry::Tetra(TetraMesh {
                vertices: positions,
                tetrahedra: indices
                    .chunks_exact(4)
                    .map(|t| [t[0], t[1], t[2], t[3]])
                    .collect(),
            })
        } else {
            Geometry::Surface(TriangleMesh {
                vertices: positions.into_iter().map(Vertex::new).collect(),
                triangles: indices
                    .chunks_exact(3)
                    .map(|t| [t[0], t[1], t[2]])
                    .collect(),
            })
        };
        self.replace_geometry(geometry);
        Ok(())
    }

    /// Replace the geometry by a copy of a triangle mesh.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::IndexOutOfRange`] if a triangle has no vertex.
    pub fn set_geometry_from(&mut self, mesh: &TriangleMesh) -> KernelResult<()> {
        check_indices(mesh.triangles.as_flattened(), mesh.vertices.len())?;
        self.replace_geometry(Geometry::Surface(mesh.clone()));
        Ok(())
    }

    /// Replace the geometry by a copy of a tetrahedral mesh.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::IndexOutOfRange`] if a tetrahedron has no vertex.
    pub fn set_tetra_geometry_from(&mut self, mesh: &TetraMesh) -> KernelResult<()> {
        check_indices(mesh.tetrahedra.as_flattened(), mesh.vertices.len())?;
        self.replace_geometry(Geometry::Tetra(mesh.clone()));
        Ok(())
    }

    fn replace_geometry(&mut self, geometry: Geometry) {
        self.reducer = None;
        self.dirty = false;
        self.reducer_masters = None;
        let (vertices, primitives) = match &geometry {
            Geometry::Surface(mesh) => (mesh.vertex_count(), mesh.triangle_count()),
            Geometry::Tetra(mesh) => (mesh.vertices.len(), mesh.tetrahedra.len()),
        };
        self.masters = Some((0..vertices as u32).map(|v| vec![v]).collect());
        let is_surface = matches!(geometry, Geometry::Surface(_));
        self.geometry = geometry;
        self.log(format!(
            "Set geometry: {} vertices, {} {}",
            vertices,
            primitives,
            if is_surface {
                "triangles"
            } else {
                "tetrahedra"
            }
        ));
        if is_surface {
            let removed = self.dedup_surface();
            if removed > 0 {
                self.log(format!("Removed {} duplicated triangles", removed));
            }
        }
    }

    // =========================================================================
    // Surface Operations
    // =========================================================================

    /// Drop triangles over the same vertex set as an earlier triangle,
    /// whatever their winding. When any were dropped, windings are made
    /// consistent. Returns the number of dropped triangles.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::WrongMeshKind`] for tetrahedral geometry.
    pub fn remove_duplicated_triangles(&mut self) -> KernelResult<usize> {
        self.require_surface("remove_duplicated_triangles")?;
        self.release_reducer();
        let removed = self.dedup_surface();
        self.log(format!("Removed {} duplicated triangles", removed));
        self.stages_executed += 1;
        Ok(removed)
    }

    fn dedup_surface(&mut self) -> usize {
        let Geometry::Surface(mesh) = &mut self.geometry else {
            return 0;
        };
        let removed = remove_duplicates(mesh);
        if removed > 0 {
            let flipped = orient_consistently(mesh);
            debug!(removed, flipped, "duplicated triangles removed");
        }
        removed
    }

    /// Flip triangles so that every manifold edge is traversed in opposite
    /// directions by its two triangles. Each connected patch keeps the
    /// winding of its first triangle. Returns the number of flipped triangles.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::WrongMeshKind`] for tetrahedral geometry.
    pub fn fix_triangle_orientations(&mut self) -> KernelResult<usize> {
        self.require_surface("fix_triangle_orientations")?;
        self.release_reducer();
        let flipped = match &mut self.geometry {
            Geometry::Surface(mesh) => orient_consistently(mesh),
            Geometry::Tetra(_) => 0,
        };
        self.log(format!("Flipped {} triangles", flipped));
        self.stages_executed += 1;
        Ok(flipped)
    }

    /// Shortest and average edge length, and whether the surface is closed.
    pub fn edge_length_stats(&mut self) -> EdgeLengthStats {
        self.write_back();
        match &self.geometry {
            Geometry::Surface(mesh) => surface_edge_stats(mesh),
            Geometry::Tetra(mesh) => tetra_edge_stats(mesh),
        }
    }

    // =========================================================================
    // Stages
    // =========================================================================

    /// Replace the surface by the isosurface of its voxelization.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::WrongMeshKind`] for tetrahedral geometry, and
    /// the extractor's errors for invalid parameters or an empty surface.
    pub fn extract_isosurface(
        &mut self,
        variant: IsoVariant,
        params: &IsoParams,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<()> {
        self.require_surface("extract_isosurface")?;
        self.release_reducer();
        let Geometry::Surface(mesh) = &self.geometry else {
            return Ok(());
        };

        let mut extractor: Box<dyn IsosurfaceExtractor> = match variant {
            IsoVariant::Voxel => Box::new(VoxelExtractor::new(params.clone())),
            IsoVariant::Generalized => Box::new(GeneralizedExtractor::new(params.clone())),
        };
        extractor.add_mesh(mesh);
        extractor.extract(progress)?;

        let surface = extractor.mesh().clone();
        let stats = extractor.stats();
        self.log(format!(
            "Extracted {:?} isosurface: {} triangles in {} groups, {} bubbles removed",
            variant,
            surface.triangle_count(),
            stats.num_groups,
            stats.bubbles_removed
        ));
        self.geometry = Geometry::Surface(surface);
        self.masters = None;
        self.stages_executed += 1;
        Ok(())
    }

    /// Collapse edges of the surface by quadric error.
    ///
    /// The first call builds a [`QuadricSimplifier`] over the current surface;
    /// later calls continue on it. An active contractor is written back and
    /// dropped first. Returns the number of collapses, 0 for an empty surface.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::WrongMeshKind`] for tetrahedral geometry and
    /// [`KernelError::InvalidParameter`] for invalid `params`.
    pub fn simplify(
        &mut self,
        params: &SimplifyParams,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<usize> {
        self.require_surface("simplify")?;
        params.validate()?;
        if self.surface_is_empty() {
            debug!("simplify skipped, surface is empty");
            return Ok(0);
        }

        let mut progress = HierarchicalProgress::new(100, progress);
        if !matches!(self.reducer, Some(Reducer::Simplifier(_))) {
            self.release_reducer();
            progress.set_subtask_work(80, Some("Init simplificator"));
            let simplifier: QuadricSimplifier = self.start_reducer(params, &mut progress)?;
            self.reducer = Some(Reducer::Simplifier(Box::new(simplifier)));
            progress.complete_subtask();
        }

        progress.set_subtask_work(-1, Some("Simplification steps"));
        let steps = match &mut self.reducer {
            Some(Reducer::Simplifier(simplifier)) => {
                simplifier.reduce(params, Some(&mut progress))?
            }
            _ => 0,
        };
        progress.complete_subtask();

        self.dirty |= steps > 0;
        self.log(format!("Simplified with {} edge collapses", steps));
        self.stages_executed += 1;
        Ok(steps)
    }

    /// Contract the surface along its distance field.
    ///
    /// The first call builds a [`DistanceFieldContractor`] over the current
    /// surface; later calls continue on it. An active simplifier is written
    /// back and dropped first. Returns the number of contraction steps, 0 for
    /// an empty surface.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::WrongMeshKind`] for tetrahedral geometry and
    /// [`KernelError::InvalidParameter`] for invalid `params`.
    pub fn contract(
        &mut self,
        params: &ContractParams,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<usize> {
        self.require_surface("contract")?;
        params.validate()?;
        if self.surface_is_empty() {
            debug!("contract skipped, surface is empty");
            return Ok(0);
        }

        let mut progress = HierarchicalProgress::new(100, progress);
        if !matches!(self.reducer, Some(Reducer::Contractor(_))) {
            self.release_reducer();
            progress.set_subtask_work(40, Some("Init contractor"));
            let contractor: DistanceFieldContractor = self.start_reducer(params, &mut progress)?;
            self.reducer = Some(Reducer::Contractor(Box::new(contractor)));
            progress.complete_subtask();
        }

        progress.set_subtask_work(-1, Some("Contraction steps"));
        let (steps, ratio) = match &mut self.reducer {
            Some(Reducer::Contractor(contractor)) => {
                let steps = contractor.reduce(params, Some(&mut progress))?;
                (steps, contractor.volume_ratio())
            }
            _ => (0, 1.0),
        };
        progress.complete_subtask();

        self.dirty |= steps > 0 || params.expand_border;
        self.log(format!("Contracted {} steps, volume ratio {:.3}", steps, ratio));
        self.stages_executed += 1;
        Ok(steps)
    }

    /// Fill the surface with tetrahedra; the geometry becomes tetrahedral.
    /// Returns the number of tetrahedra.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::WrongMeshKind`] for tetrahedral geometry, and
    /// the tetrahedralizer's errors for invalid parameters or an empty surface.
    pub fn tetrahedralize(
        &mut self,
        params: &TetraParams,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<usize> {
        self.require_surface("tetrahedralize")?;
        self.release_reducer();
        let Geometry::Surface(mesh) = &self.geometry else {
            return Ok(0);
        };

        let mut tetrahedralizer = Tetrahedralizer::new(params.clone());
        tetrahedralizer.register_mesh(mesh)?;
        tetrahedralizer.end_registration(progress)?;
        let tetra = tetrahedralizer.to_mesh();

        let count = tetra.tetrahedra.len();
        self.log(format!(
            "Tetrahedralized into {} tetrahedra over {} vertices",
            count,
            tetra.vertices.len()
        ));
        self.geometry = Geometry::Tetra(tetra);
        self.masters = None;
        self.stages_executed += 1;
        Ok(count)
    }

    /// Copy pending reducer edits into the geometry. The reducer stays active.
    pub fn write_back(&mut self) {
        if !self.dirty {
            return;
        }
        self.dirty = false;
        let Some(reducer) = &self.reducer else {
            return;
        };
        let _timer = OperationTimer::new("write_back");
        match reducer {
            Reducer::Simplifier(simplifier) => {
                let (mesh, _) = simplifier.compact();
                self.masters = self.reducer_masters.as_ref().map(|base| {
                    simplifier
                        .master_indices()
                        .iter()
                        .map(|merged| {
                            let mut sources: Vec<u32> = merged
                                .iter()
                                .flat_map(|&m| base.get(m as usize).into_iter().flatten().copied())
                                .collect();
                            sources.sort_unstable();
                            sources
                        })
                        .collect()
                });
                self.geometry = Geometry::Surface(mesh);
            }
            Reducer::Contractor(contractor) => {
                self.geometry = Geometry::Surface(contractor.to_mesh());
                self.masters = None;
            }
        }
        let (vertices, triangles) = self.counts();
        self.log(format!(
            "Wrote back reducer changes: {} vertices, {} triangles",
            vertices, triangles
        ));
    }

    // =========================================================================
    // Output Operations
    // =========================================================================

    /// Write positions as three little-endian `f32` each, `stride` bytes
    /// apart. A stride of 0 packs them. Returns the number of vertices written.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidStride`] or [`KernelError::BufferTooSmall`]
    /// without writing anything.
    pub fn write_vertices(&mut self, out: &mut [u8], stride: usize) -> KernelResult<usize> {
        self.write_back();
        let stride = if stride == 0 { VERTEX_SIZE } else { stride };
        if stride < VERTEX_SIZE {
            return Err(KernelError::invalid_stride("vertex", stride, VERTEX_SIZE).reported());
        }
        let positions: Vec<Point3<f64>> = match &self.geometry {
            Geometry::Surface(mesh) => mesh.positions(),
            Geometry::Tetra(mesh) => mesh.vertices.clone(),
        };
        check_output_len("vertex", out.len(), positions.len(), stride, VERTEX_SIZE)?;
        for (i, p) in positions.iter().enumerate() {
            let o = i * stride;
            for (k, c) in p.coords.iter().enumerate() {
                out[o + 4 * k..o + 4 * k + 4].copy_from_slice(&(*c as f32).to_le_bytes());
            }
        }
        Ok(positions.len())
    }

    /// Write indices as little-endian `u32`, `stride` bytes apart: triples
    /// for triangles, quadruples for tetrahedra. A stride of 0 packs them.
    /// Returns the number of indices written.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidStride`] or [`KernelError::BufferTooSmall`]
    /// without writing anything.
    pub fn write_indices(&mut self, out: &mut [u8], stride: usize) -> KernelResult<usize> {
        self.write_back();
        let stride = if stride == 0 { INDEX_SIZE } else { stride };
        if stride < INDEX_SIZE {
            return Err(KernelError::invalid_stride("index", stride, INDEX_SIZE).reported());
        }
        let indices: &[u32] = match &self.geometry {
            Geometry::Surface(mesh) => mesh.triangles.as_flattened(),
            Geometry::Tetra(mesh) => mesh.tetrahedra.as_flattened(),
        };
        check_output_len("index", out.len(), indices.len(), stride, INDEX_SIZE)?;
        for (i, index) in indices.iter().enumerate() {
            out[i * stride..i * stride + INDEX_SIZE].copy_from_slice(&index.to_le_bytes());
        }
        Ok(indices.len())
    }

    /// Source vertices merged into each current vertex, sorted.
    ///
    /// None after a stage that generates new vertices (isosurface extraction,
    /// contraction, tetrahedralization).
    pub fn master_indices(&mut self) -> Option<&[Vec<u32>]> {
        self.write_back();
        self.masters.as_deref()
    }

    /// The current surface, None for tetrahedral geometry.
    pub fn surface(&mut self) -> Option<&TriangleMesh> {
        self.write_back();
        match &self.geometry {
            Geometry::Surface(mesh) => Some(mesh),
            Geometry::Tetra(_) => None,
        }
    }

    /// The current tetrahedra, None for triangle geometry.
    pub fn tetra_mesh(&self) -> Option<&TetraMesh> {
        match &self.geometry {
            Geometry::Tetra(mesh) => Some(mesh),
            Geometry::Surface(_) => None,
        }
    }

    /// The geometry is tetrahedral.
    pub fn is_tetra(&self) -> bool {
        matches!(self.geometry, Geometry::Tetra(_))
    }

    /// Current vertex count, pending reducer edits included.
    pub fn num_vertices(&self) -> usize {
        self.counts().0
    }

    /// Current index count, pending reducer edits included.
    pub fn num_indices(&self) -> usize {
        match &self.geometry {
            Geometry::Tetra(mesh) => 4 * mesh.tetrahedra.len(),
            Geometry::Surface(_) => 3 * self.counts().1,
        }
    }

    /// Which reducer owns the topology.
    pub fn reducer_state(&self) -> ReducerState {
        match self.reducer {
            None => ReducerState::None,
            Some(Reducer::Simplifier(_)) => ReducerState::Simplifier,
            Some(Reducer::Contractor(_)) => ReducerState::Contractor,
        }
    }

    /// The active reducer holds edits that are not written back yet.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Get the operation log.
    pub fn log_entries(&self) -> &[String] {
        &self.operation_log
    }

    /// Get the number of stages executed.
    pub fn stages_executed(&self) -> usize {
        self.stages_executed
    }

    // =========================================================================
    // Configuration-Based Execution
    // =========================================================================

    /// Run every step of `config` in order, each with an equal share of the
    /// progress range. Stops at the first failing step.
    #[cfg(feature = "pipeline-config")]
    pub fn run_config(
        &mut self,
        config: &PipelineConfig,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<()> {
        if let Some(name) = &config.name {
            self.log(format!("Running pipeline: {}", name));
        }
        let mut progress = HierarchicalProgress::new(config.steps.len().max(1) as i32, progress);
        for step in &config.steps {
            progress.set_subtask_work(1, Some(step.task_name()));
            self.run_step(step, &mut progress)?;
            progress.complete_subtask();
        }
        Ok(())
    }

    #[cfg(feature = "pipeline-config")]
    fn run_step(
        &mut self,
        step: &PipelineStep,
        progress: &mut HierarchicalProgress<'_>,
    ) -> KernelResult<()> {
        match step {
            PipelineStep::RemoveDuplicatedTriangles => {
                self.remove_duplicated_triangles()?;
            }
            PipelineStep::FixTriangleOrientations => {
                self.fix_triangle_orientations()?;
            }
            PipelineStep::ExtractIsosurface { variant, params } => {
                self.extract_isosurface(*variant, params, Some(progress))?;
            }
            PipelineStep::Simplify { params } => {
                self.simplify(params, Some(progress))?;
            }
            PipelineStep::Contract { params } => {
                self.contract(params, Some(progress))?;
            }
            PipelineStep::Tetrahedralize { params } => {
                self.tetrahedralize(params, Some(progress))?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Internal
    // =========================================================================

    fn log(&mut self, message: String) {
        info!(target: "mesh_kernel::pipeline", "{}", message);
        self.operation_log.push(message);
    }

    fn require_surface(&self, operation: &'static str) -> KernelResult<()> {
        match self.geometry {
            Geometry::Surface(_) => Ok(()),
            Geometry::Tetra(_) => Err(KernelError::WrongMeshKind {
                operation,
                expected: "triangle",
            }
            .reported()),
        }
    }

    fn surface_is_empty(&self) -> bool {
        match &self.geometry {
            Geometry::Surface(mesh) => mesh.is_empty(),
            Geometry::Tetra(_) => true,
        }
    }

    /// Vertex and primitive counts, read through a dirty reducer.
    fn counts(&self) -> (usize, usize) {
        match (&self.reducer, &self.geometry) {
            (Some(reducer), Geometry::Surface(_)) if self.dirty => {
                (reducer.remaining_vertices(), reducer.remaining_triangles())
            }
            (_, Geometry::Surface(mesh)) => (mesh.vertex_count(), mesh.triangle_count()),
            (_, Geometry::Tetra(mesh)) => (mesh.vertices.len(), mesh.tetrahedra.len()),
        }
    }

    fn release_reducer(&mut self) {
        self.write_back();
        self.reducer = None;
        self.reducer_masters = None;
    }

    fn start_reducer<R: MeshReducer + Default>(
        &mut self,
        params: &R::Params,
        progress: &mut HierarchicalProgress<'_>,
    ) -> KernelResult<R> {
        let mut reducer = R::default();
        if let Geometry::Surface(mesh) = &self.geometry {
            reducer.register_mesh(mesh)?;
        }
        reducer.end_registration(params, Some(progress))?;
        self.reducer_masters = self.masters.clone();
        Ok(reducer)
    }
}

// =========================================================================
// Buffer Helpers
// =========================================================================

/// Whole elements of `element` bytes in a buffer of `len` bytes at `stride`.
fn strided_count(
    buffer: &'static str,
    len: usize,
    stride: usize,
    element: usize,
) -> KernelResult<usize> {
    match len {
        0 => Ok(0),
        len if len < element => Err(KernelError::buffer_too_small(buffer, len, element).reported()),
        len => Ok((len - element) / stride + 1),
    }
}

fn check_output_len(
    buffer: &'static str,
    len: usize,
    count: usize,
    stride: usize,
    element: usize,
) -> KernelResult<()> {
    let required = match count {
        0 => 0,
        n => (n - 1) * stride + element,
    };
    if len < required {
        return Err(KernelError::buffer_too_small(buffer, len, required).reported());
    }
    Ok(())
}

fn check_indices(indices: &[u32], num_vertices: usize) -> KernelResult<()> {
    match indices
        .iter()
        .position(|&i| i as usize >= num_vertices)
    {
        Some(position) => Err(KernelError::index_out_of_range(
            position,
            indices[position],
            num_vertices,
        )
        .reported()),
        None => Ok(()),
    }
}

fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    f32::from_le_bytes(word)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

// =========================================================================
// Surface Helpers
// =========================================================================

/// Keep the first triangle of every vertex set. Returns the number dropped.
fn remove_duplicates(mesh: &mut TriangleMesh) -> usize {
    let before = mesh.triangles.len();
    let mut seen = HashSet::with_capacity(before);
    mesh.triangles.retain(|t| {
        let mut key = *t;
        key.sort_unstable();
        seen.insert(key)
    });
    before - mesh.triangles.len()
}

/// Neighbor across edge `j` (vertices `j`, `j + 1`) of every triangle.
/// Edges shared by more than two triangles stay unlinked.
fn triangle_neighbors(triangles: &[[u32; 3]]) -> Vec<Option<u32>> {
    let mut edges: Vec<(u32, u32, u32)> = triangles
        .iter()
        .enumerate()
        .flat_map(|(t, tri)| {
            (0..3).map(move |j| {
                let (a, b) = (tri[j], tri[(j + 1) % 3]);
                (a.min(b), a.max(b), 3 * t as u32 + j as u32)
            })
        })
        .collect();
    edges.sort_unstable();

    let mut neighbors = vec![None; 3 * triangles.len()];
    for group in edges.chunk_by(|x, y| (x.0, x.1) == (y.0, y.1)) {
        if let [(_, _, s0), (_, _, s1)] = group {
            neighbors[*s0 as usize] = Some(s1 / 3);
            neighbors[*s1 as usize] = Some(s0 / 3);
        }
    }
    neighbors
}

/// Flood each patch from its first triangle and flip the triangles whose
/// shared edge runs the same way as their already oriented neighbor's.
fn orient_consistently(mesh: &mut TriangleMesh) -> usize {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        Keep,
        Flip,
    }

    let neighbors = triangle_neighbors(&mesh.triangles);
    let triangles = &mesh.triangles;
    let mut marks = vec![Mark::Unvisited; triangles.len()];
    let mut stack = Vec::new();

    for seed in 0..triangles.len() {
        if marks[seed] != Mark::Unvisited {
            continue;
        }
        marks[seed] = Mark::Keep;
        stack.push(seed);
        while let Some(t) = stack.pop() {
            for j in 0..3 {
                let Some(adj) = neighbors[3 * t + j] else {
                    continue;
                };
                let adj = adj as usize;
                if marks[adj] != Mark::Unvisited {
                    continue;
                }
                let (mut a, mut b) = (triangles[t][j], triangles[t][(j + 1) % 3]);
                if marks[t] == Mark::Flip {
                    std::mem::swap(&mut a, &mut b);
                }
                let other = triangles[adj];
                let same_direction = (0..3).any(|k| other[k] == a && other[(k + 1) % 3] == b);
                marks[adj] = if same_direction { Mark::Flip } else { Mark::Keep };
                stack.push(adj);
            }
        }
    }

    let mut flipped = 0;
    for (t, mark) in mesh.triangles.iter_mut().zip(&marks) {
        if *mark == Mark::Flip {
            t.swap(0, 1);
            flipped += 1;
        }
    }
    flipped
}

fn surface_edge_stats(mesh: &TriangleMesh) -> EdgeLengthStats {
    if mesh.triangles.is_empty() {
        return EdgeLengthStats {
            shortest: 0.0,
            average: 0.0,
            closed: false,
        };
    }
    let mut shortest = f64::MAX;
    let mut total = 0.0;
    let mut edges = Vec::with_capacity(3 * mesh.triangles.len());
    for tri in &mesh.triangles {
        for j in 0..3 {
            let (a, b) = (tri[j], tri[(j + 1) % 3]);
            let length = (mesh.vertices[a as usize].position - mesh.vertices[b as usize].position)
                .norm();
            shortest = shortest.min(length);
            total += length;
            edges.push((a.min(b), a.max(b)));
        }
    }
    edges.sort_unstable();
    let closed = edges.chunk_by(|x, y| x == y).all(|group| group.len() == 2);
    EdgeLengthStats {
        shortest,
        average: total / edges.len() as f64,
        closed,
    }
}

fn tetra_edge_stats(mesh: &TetraMesh) -> EdgeLengthStats {
    const EDGES: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
    if mesh.tetrahedra.is_empty() {
        return EdgeLengthStats {
            shortest: 0.0,
            average: 0.0,
            closed: false,
        };
    }
    let mut shortest = f64::MAX;
    let mut total = 0.0;
    for tet in &mesh.tetrahedra {
        for (i, j) in EDGES {
            let length =
                (mesh.vertices[tet[i] as usize] - mesh.vertices[tet[j] as usize]).norm();
            shortest = shortest.min(length);
            total += length;
        }
    }
    EdgeLengthStats {
        shortest,
        average: total / (6 * mesh.tetrahedra.len()) as f64,
        closed: false,
    }
}


#[cfg(all(test, feature = "pipeline-config"))]
mod config_tests {
    use super::*;

    #[test]
    fn test_pipeline_config_builder() {
        let config = PipelineConfig::with_name("test-pipeline")
            .description("A test pipeline")
            .add_step(PipelineStep::FixTriangleOrientations)
            .add_step(PipelineStep::Simplify {
                params: SimplifyParams::lossless(),
            });
        assert_eq!(config.name.as_deref(), Some("test-pipeline"));
        assert_eq!(config.description.as_deref(), Some("A test pipeline"));
        assert_eq!(config.steps.len(), 2);
        assert!(PipelineConfig::default().steps.is_empty());
    }

    #[test]
    fn test_pipeline_config_json_roundtrip() {
        let config = PipelineConfig::preset_soft_body(30);
        let json = config.to_json().unwrap();
        assert!(json.contains("\"operation\": \"extract_isosurface\""));
        assert!(json.contains("\"variant\": \"voxel\""));

        let parsed = PipelineConfig::from_json(&json).unwrap();
        assert_eq!(parsed.name, config.name);
        assert_eq!(parsed.steps.len(), 3);
        match &parsed.steps[0] {
            PipelineStep::ExtractIsosurface { variant, params } => {
                assert_eq!(*variant, IsoVariant::Voxel);
                assert_eq!(params.subdivision, 30);
                assert!(params.discard_inner_meshes);
            }
            other => panic!("unexpected step {:?}", other),
        }
    }

    #[test]
    fn test_pipeline_config_from_handwritten_json() {
        let json = r#"{
            "steps": [
                { "operation": "remove_duplicated_triangles" },
                { "operation": "simplify", "subdivision": 0, "max_steps": 4,
                  "merge_close_vertices": false },
                { "operation": "tetrahedralize", "subdivision": 10 }
            ]
        }"#;
        let config = PipelineConfig::from_json(json).unwrap();
        assert!(config.name.is_none());
        match &config.steps[1] {
            PipelineStep::Simplify { params } => {
                assert_eq!(params.max_steps, Some(4));
                assert_eq!(params.max_error, None);
            }
            other => panic!("unexpected step {:?}", other),
        }

        assert!(PipelineConfig::from_json(r#"{ "steps": [{ "operation": "melt" }] }"#).is_err());
    }

    #[test]
    fn test_run_config_cube_to_tetrahedra() {
        let config = PipelineConfig::with_name("cube")
            .add_step(PipelineStep::Simplify {
                params: SimplifyParams::lossless(),
            })
            .add_step(PipelineStep::Tetrahedralize {
                params: TetraParams::default(),
            });
        let cube = TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
        let mut pipeline = MeshPipeline::from_mesh(&cube).unwrap();
        let mut reports = Vec::new();
        let mut sink = |percent: u32, _task: Option<&str>| reports.push(percent);
        pipeline.run_config(&config, Some(&mut sink)).unwrap();

        assert!(pipeline.is_tetra());
        assert!(pipeline.tetra_mesh().is_some_and(|t| !t.tetrahedra.is_empty()));
        assert_eq!(pipeline.stages_executed(), 2);
        assert_eq!(pipeline.log_entries()[1], "Running pipeline: cube");
        assert_eq!(reports.last(), Some(&100));
        assert!(reports.windows(2).all(|w| w[0] <= w[1]));
    }
}
