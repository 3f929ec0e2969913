//! Mesh reduction.
//!
//! Two reducers share the register/finalize protocol of [`MeshReducer`]:
//!
//! - [`QuadricSimplifier`] collapses edges in order of their quadric error
//!   until a step budget or error bound is hit.
//! - [`DistanceFieldContractor`] moves the surface inward along the gradient
//!   of its own signed distance field, re-meshing to keep edges near one grid
//!   cell long.
//!
//! # Example
//!
//! ```
//! use mesh_kernel::reduce::{MeshReducer, QuadricSimplifier, SimplifyParams};
//! use mesh_kernel::TriangleMesh;
//! use nalgebra::Point3;
//!
//! let cube = TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
//! let mut simplifier = QuadricSimplifier::new();
//! simplifier.register_mesh(&cube).unwrap();
//! let params = SimplifyParams::default();
//! simplifier.end_registration(params.merge_close_vertices, None).unwrap();
//! simplifier.reduce(&params, None).unwrap();
//! assert!(simplifier.to_mesh().border_edges().is_empty());
//! ```

mod contract;
mod quadric;

pub use contract::{DistanceFieldContractor, MAX_CONTRACT_SUBDIVISION, MAX_UNBOUNDED_STEPS};
pub use quadric::{MERGE_THRESHOLD, QuadricSimplifier};

use crate::error::{KernelError, KernelResult};
use crate::progress::ProgressListener;
use crate::types::{TriangleMesh, Vertex};
use nalgebra::Point3;

/// Parameters for quadric edge-collapse simplification.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "pipeline-config",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct SimplifyParams {
    /// Edges longer than `diagonal / subdivision` are never collapsed. 0 disables the cap.
    /// Default: 0
    pub subdivision: u32,
    /// Maximum number of collapses per call. None runs until no legal collapse is left.
    pub max_steps: Option<usize>,
    /// Stop once the cheapest edge costs more than this. None disables the bound.
    pub max_error: Option<f64>,
    /// Merge vertices closer than [`MERGE_THRESHOLD`] of the diagonal before
    /// building edges. Only used when the simplifier is finalized. Default: false
    pub merge_close_vertices: bool,
}

impl Default for SimplifyParams {
    fn default() -> Self {
        Self {
            subdivision: 0,
            max_steps: None,
            max_error: None,
            merge_close_vertices: false,
        }
    }
}

impl SimplifyParams {
    /// Collapse at most `steps` edges.
    pub fn with_max_steps(steps: usize) -> Self {
        Self {
            max_steps: Some(steps),
            ..Default::default()
        }
    }

    /// Only collapse edges that do not change the shape, such as coplanar interiors.
    pub fn lossless() -> Self {
        Self {
            max_error: Some(0.0),
            merge_close_vertices: true,
            ..Default::default()
        }
    }

    /// Simplify a fine isosurface down to edges of about `1 / subdivision` of the diagonal.
    pub fn for_isosurface(subdivision: u32) -> Self {
        Self {
            subdivision,
            merge_close_vertices: true,
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> KernelResult<()> {
        match self.max_error {
            Some(e) if !(e >= 0.0) => Err(KernelError::invalid_parameter(
                "max_error",
                e,
                "must be non-negative",
            )
            .reported()),
            _ => Ok(()),
        }
    }
}

/// Parameters for distance field contraction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "pipeline-config",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct ContractParams {
    /// Grid cells along the bounds diagonal, fixed at finalization and clamped
    /// to [`MAX_CONTRACT_SUBDIVISION`]. Default: 50
    pub subdivision: u32,
    /// Contraction steps per call. None runs until the volume ratio is reached.
    /// Default: Some(10)
    pub steps: Option<usize>,
    /// Stop before the volume drops below this fraction of the initial volume.
    /// Default: 0.5
    pub abort_ratio: f64,
    /// Push folded, double-sided regions apart after contracting. Default: false
    pub expand_border: bool,
}

impl Default for ContractParams {
    fn default() -> Self {
        Self {
            subdivision: 50,
            steps: Some(10),
            abort_ratio: 0.5,
            expand_border: false,
        }
    }
}

impl ContractParams {
    /// Contract until the volume halves or `steps` steps ran.
    pub fn with_steps(steps: usize) -> Self {
        Self {
            steps: Some(steps),
            ..Default::default()
        }
    }

    /// Thin shell for cloth: contract far, then separate the folded sheets.
    pub fn thin_shell() -> Self {
        Self {
            subdivision: 80,
            steps: None,
            abort_ratio: 0.1,
            expand_border: true,
        }
    }

    pub(crate) fn validate(&self) -> KernelResult<()> {
        if self.subdivision == 0 {
            return Err(
                KernelError::invalid_parameter("subdivision", 0.0, "must be at least 1").reported(),
            );
        }
        if !(0.0..=1.0).contains(&self.abort_ratio) {
            return Err(KernelError::invalid_parameter(
                "abort_ratio",
                self.abort_ratio,
                "must be within [0, 1]",
            )
            .reported());
        }
        if self.steps.is_none() && self.abort_ratio <= 0.0 {
            return Err(KernelError::invalid_parameter(
                "abort_ratio",
                self.abort_ratio,
                "must be positive when steps are unbounded",
            )
            .reported());
        }
        Ok(())
    }
}

/// Shared protocol of the reducers.
///
/// Vertices and triangles are registered first, then [`Self::end_registration`]
/// builds the working structures once. [`Self::reduce`] may be called any
/// number of times afterwards; each call continues from the current state.
pub trait MeshReducer {
    /// Per-call parameters.
    type Params;

    /// Register a vertex and return its index.
    fn register_vertex(&mut self, position: Point3<f64>) -> KernelResult<u32>;

    /// Register a triangle over previously registered vertices.
    fn register_triangle(&mut self, v0: u32, v1: u32, v2: u32) -> KernelResult<()>;

    /// Close registration and build adjacency, heaps or fields.
    fn end_registration(
        &mut self,
        params: &Self::Params,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<()>;

    /// Run one reduction pass and return the number of steps taken.
    fn reduce(
        &mut self,
        params: &Self::Params,
        progress: Option<&mut dyn ProgressListener>,
    ) -> KernelResult<usize>;

    /// Live vertices.
    fn remaining_vertices(&self) -> usize;

    /// Live triangles.
    fn remaining_triangles(&self) -> usize;

    /// The current mesh with dense indices.
    fn to_mesh(&self) -> TriangleMesh;

    /// Register every vertex and triangle of `mesh`.
    fn register_mesh(&mut self, mesh: &TriangleMesh) -> KernelResult<()> {
        for v in &mesh.vertices {
            self.register_vertex(v.position)?;
        }
        for &[a, b, c] in &mesh.triangles {
            self.register_triangle(a, b, c)?;
        }
        Ok(())
    }
}

/// Drop dead vertices and triangles, returning the mesh and the old-to-new vertex map.
pub(crate) fn compact_live(
    positions: impl Iterator<Item = Option<Point3<f64>>>,
    triangles: impl Iterator<Item = Option<[u32; 3]>>,
) -> (TriangleMesh, Vec<Option<u32>>) {
    let mut mesh = TriangleMesh::new();
    let remap: Vec<Option<u32>> = positions
        .map(|p| {
            p.map(|p| {
                mesh.vertices.push(Vertex::new(p));
                (mesh.vertices.len() - 1) as u32
            })
        })
        .collect();
    for t in triangles.flatten() {
        let mapped = [
            remap[t[0] as usize],
            remap[t[1] as usize],
            remap[t[2] as usize],
        ];
        if let [Some(a), Some(b), Some(c)] = mapped {
            mesh.triangles.push([a, b, c]);
        }
    }
    (mesh, remap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_validation() {
        assert!(SimplifyParams::default().validate().is_ok());
        let negative = SimplifyParams {
            max_error: Some(-1.0),
            ..Default::default()
        };
        assert!(negative.validate().is_err());

        assert!(ContractParams::default().validate().is_ok());
        assert!(ContractParams::thin_shell().validate().is_ok());
        let unbounded = ContractParams {
            steps: None,
            abort_ratio: 0.0,
            ..Default::default()
        };
        assert!(unbounded.validate().is_err());
        let zero = ContractParams {
            subdivision: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_compact_live_drops_dead_entries() {
        let positions = vec![
            Some(Point3::new(0.0, 0.0, 0.0)),
            None,
            Some(Point3::new(1.0, 0.0, 0.0)),
            Some(Point3::new(0.0, 1.0, 0.0)),
        ];
        let triangles = vec![Some([0, 2, 3]), None, Some([0, 1, 2])];
        let (mesh, remap) = compact_live(positions.into_iter(), triangles.into_iter());
        assert_eq!(remap, vec![Some(0), None, Some(1), Some(2)]);
        assert_eq!(mesh.triangles, vec![[0, 1, 2]]);
    }
}
