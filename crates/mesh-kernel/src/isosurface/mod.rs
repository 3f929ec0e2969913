//! Isosurface extraction from arbitrary triangle soup.
//!
//! Both extractors follow the same protocol: register triangles with
//! [`IsosurfaceExtractor::add_triangle`], then run
//! [`IsosurfaceExtractor::extract`] once. The input may self-intersect, have
//! holes or non-manifold edges; the output is a new, mostly closed surface
//! around it.
//!
//! - [`VoxelExtractor`] stamps a density field on a regular grid and runs
//!   marching cubes over it. Robust, smooths away sharp features.
//! - [`GeneralizedExtractor`] places vertices where grid lines pierce the
//!   input triangles and connects them per cell from the corner regions the
//!   cuts separate. Keeps sharp features, needs more bookkeeping.
//!
//! # Example
//!
//! ```
//! use mesh_kernel::isosurface::{IsoParams, IsosurfaceExtractor, VoxelExtractor};
//! use mesh_kernel::TriangleMesh;
//! use nalgebra::Point3;
//!
//! let cube = TriangleMesh::cuboid(Point3::origin(), Point3::new(1.0, 1.0, 1.0));
//! let mut extractor = VoxelExtractor::new(IsoParams::with_subdivision(4));
//! for t in cube.iter_triangles() {
//!     extractor.add_triangle(&t.v0, &t.v1, &t.v2);
//! }
//! extractor.extract(None).unwrap();
//! assert!(extractor.mesh().border_edges().is_empty());
//! ```

pub(crate) mod cube;
mod generalized;
pub(crate) mod postprocess;
mod voxel;

pub use generalized::GeneralizedExtractor;
pub use voxel::VoxelExtractor;

use crate::error::{KernelError, KernelResult};
use crate::progress::ProgressListener;
use crate::types::TriangleMesh;
use nalgebra::Point3;
use tracing::warn;

/// Largest accepted grid subdivision; larger values are clamped.
pub const MAX_ISO_SUBDIVISION: u32 = 200;

/// Parameters for isosurface extraction.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "pipeline-config",
    derive(serde::Serialize, serde::Deserialize)
)]
pub struct IsoParams {
    /// Number of grid cells along the bounding box diagonal. Default: 50
    pub subdivision: u32,
    /// Components with at most this many triangles are removed. 0 disables. Default: 0
    pub bubble_size: usize,
    /// Keep only this many components, biggest first. 0 keeps all. Default: 0
    pub keep_biggest_meshes: usize,
    /// Remove components enclosed by another component. Default: false
    pub discard_inner_meshes: bool,
}

impl Default for IsoParams {
    fn default() -> Self {
        Self {
            subdivision: 50,
            bubble_size: 0,
            keep_biggest_meshes: 0,
            discard_inner_meshes: false,
        }
    }
}

impl IsoParams {
    /// Default parameters with a given grid subdivision.
    pub fn with_subdivision(subdivision: u32) -> Self {
        Self {
            subdivision,
            ..Default::default()
        }
    }

    /// Coarse grid for previews.
    pub fn fast() -> Self {
        Self {
            subdivision: 20,
            bubble_size: 10,
            ..Default::default()
        }
    }

    /// Fine grid keeping only the outer shell, as used for cloth simulation meshes.
    pub fn single_layer() -> Self {
        Self {
            subdivision: 80,
            bubble_size: 20,
            keep_biggest_meshes: 1,
            discard_inner_meshes: true,
        }
    }

    /// Check the parameters, clamping an oversized subdivision.
    pub(crate) fn validated(&self) -> KernelResult<Self> {
        if self.subdivision == 0 {
            return Err(KernelError::invalid_parameter(
                "subdivision",
                0.0,
                "must be at least 1",
            )
            .reported());
        }
        let mut params = self.clone();
        if params.subdivision > MAX_ISO_SUBDIVISION {
            warn!(
                subdivision = params.subdivision,
                max = MAX_ISO_SUBDIVISION,
                "subdivision clamped"
            );
            params.subdivision = MAX_ISO_SUBDIVISION;
        }
        Ok(params)
    }
}

/// Counters from the post-process passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsoStats {
    /// Connected components in the final mesh.
    pub num_groups: usize,
    /// Components removed as bubbles.
    pub bubbles_removed: usize,
    /// Components removed because they were enclosed by another one.
    pub inner_removed: usize,
    /// Components removed by the keep-biggest filter.
    pub small_removed: usize,
    /// Grid cells that were touched.
    pub cells: usize,
}

/// Common interface of the two extractors.
pub trait IsosurfaceExtractor {
    /// Register one input triangle.
    fn add_triangle(&mut self, p0: &Point3<f64>, p1: &Point3<f64>, p2: &Point3<f64>);

    /// Build the output mesh from everything registered so far.
    ///
    /// Fails without touching the previous result when the parameters are
    /// invalid or nothing was registered.
    fn extract(&mut self, progress: Option<&mut dyn ProgressListener>) -> KernelResult<()>;

    /// The extracted mesh; empty before [`Self::extract`].
    fn mesh(&self) -> &TriangleMesh;

    /// Post-process counters of the last extraction.
    fn stats(&self) -> &IsoStats;

    /// Register every triangle of a mesh.
    fn add_mesh(&mut self, mesh: &TriangleMesh) {
        for t in mesh.iter_triangles() {
            self.add_triangle(&t.v0, &t.v1, &t.v2);
        }
    }
}

/// Run the shared clean-up passes and return the final mesh.
pub(crate) fn finish_soup(
    mut soup: postprocess::IsoSoup,
    params: &IsoParams,
    stats: &mut IsoStats,
    progress: &mut crate::progress::HierarchicalProgress<'_>,
) -> TriangleMesh {
    progress.set_subtask_work(20, Some("Create Neighbor Info"));
    soup.build_neighbors();
    progress.complete_subtask();

    progress.set_subtask_work(10, Some("Remove Bubbles"));
    soup.determine_groups();
    if params.bubble_size > 0 {
        stats.bubbles_removed = soup.remove_bubbles(params.bubble_size);
    }
    if params.discard_inner_meshes {
        stats.inner_removed = soup.discard_inner_groups();
    }
    if params.keep_biggest_meshes > 0 {
        stats.small_removed = soup.keep_biggest_groups(params.keep_biggest_meshes);
    }
    progress.complete_subtask();

    progress.set_subtask_work(10, Some("Fix Orientation"));
    soup.determine_groups();
    soup.fix_orientations();
    stats.num_groups = soup.num_groups();
    progress.complete_subtask();

    progress.set_subtask_work(-1, Some("Compress"));
    let mesh = soup.compress();
    progress.complete_subtask();
    mesh
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_validation() {
        assert!(IsoParams::with_subdivision(0).validated().is_err());
        let clamped = IsoParams::with_subdivision(500).validated();
        assert_eq!(clamped.map(|p| p.subdivision).ok(), Some(MAX_ISO_SUBDIVISION));
        assert_eq!(IsoParams::default().validated().ok(), Some(IsoParams::default()));
    }

    #[test]
    fn test_presets() {
        assert!(IsoParams::single_layer().discard_inner_meshes);
        assert_eq!(IsoParams::single_layer().keep_biggest_meshes, 1);
        assert!(IsoParams::fast().subdivision < IsoParams::default().subdivision);
    }
}
