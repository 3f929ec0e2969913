//! Tracing extensions for kernel operations.
//!
//! Every long-running operation opens an [`OperationTimer`], which enters a
//! `mesh_operation` span for its lifetime and logs the elapsed time when the
//! operation ends. Events logged in between carry the span's fields.
//! Mesh statistics are logged at debug level under the
//! `mesh_kernel::mesh_state` target.
//!
//! The kernel never installs a subscriber. Applications do:
//!
//! ```rust,ignore
//! use tracing_subscriber::{fmt, prelude::*, EnvFilter};
//!
//! tracing_subscriber::registry()
//!     .with(fmt::layer())
//!     .with(EnvFilter::from_default_env())
//!     .init();
//!
//! // RUST_LOG=mesh_kernel=debug for detailed output
//! ```
//!
//! # Log Levels
//!
//! - **WARN**: Parameter misuse, clamped parameters
//! - **INFO**: Operation summaries, timing
//! - **DEBUG**: Intermediate counts, fallbacks taken
//! - **TRACE**: Per-pass details of iterative loops

use crate::{TetraMesh, TriangleMesh};
use std::time::Instant;
use tracing::span::EnteredSpan;
use tracing::{Span, debug, info};

/// A performance timer that logs duration on drop.
///
/// The span stays entered until the timer drops, so keep timers on the stack
/// of the thread that created them.
pub struct OperationTimer {
    name: &'static str,
    start: Instant,
    span: EnteredSpan,
}

impl OperationTimer {
    /// Create a new operation timer.
    pub fn new(name: &'static str) -> Self {
        let span = tracing::info_span!("mesh_operation", operation = name).entered();
        debug!(target: "mesh_kernel::timing", operation = name, "Starting operation");
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Create a timer with primitive and vertex counts attached.
    pub fn with_context(name: &'static str, primitives: usize, vertices: usize) -> Self {
        let span = tracing::info_span!(
            "mesh_operation",
            operation = name,
            primitives = primitives,
            vertices = vertices
        )
        .entered();
        debug!(
            target: "mesh_kernel::timing",
            operation = name,
            primitives = primitives,
            vertices = vertices,
            "Starting operation"
        );
        Self {
            name,
            start: Instant::now(),
            span,
        }
    }

    /// Get the elapsed time.
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Get the span for this timer.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let elapsed_ms = self.elapsed_ms();
        info!(
            target: "mesh_kernel::timing",
            operation = self.name,
            elapsed_ms = format!("{:.2}", elapsed_ms),
            "Operation completed"
        );
    }
}

/// Log triangle mesh statistics at debug level.
pub fn log_mesh_stats(mesh: &TriangleMesh, context: &str) {
    let bounds = mesh.bounds();
    let dims = bounds.extent();

    debug!(
        target: "mesh_kernel::mesh_state",
        context = context,
        vertices = mesh.vertex_count(),
        triangles = mesh.triangle_count(),
        dimensions = format!("{:.3} x {:.3} x {:.3}", dims.x, dims.y, dims.z),
        "Mesh state"
    );
}

/// Log tetrahedral mesh statistics at debug level.
pub fn log_tetra_stats(mesh: &TetraMesh, context: &str) {
    debug!(
        target: "mesh_kernel::mesh_state",
        context = context,
        vertices = mesh.vertices.len(),
        tetrahedra = mesh.tetrahedra.len(),
        "Tetrahedral mesh state"
    );
}

/// Log the outcome of a reduction pass.
pub fn log_reduction_result(operation: &str, before: usize, after: usize, steps: usize) {
    info!(
        target: "mesh_kernel::reduce",
        operation = operation,
        triangles_before = before,
        triangles_after = after,
        steps = steps,
        "Reduction completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_timer() {
        let timer = OperationTimer::with_context("test_operation", 12, 8);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_ms() >= 10.0);
        let _ = timer.span();
    }

    #[test]
    fn test_timer_span_is_current_until_drop() {
        let subscriber = tracing_subscriber::registry();
        tracing::subscriber::with_default(subscriber, || {
            assert!(Span::current().is_none());
            let outer = OperationTimer::new("outer");
            let current = Span::current();
            assert_eq!(current.id(), outer.span().id());
            assert_eq!(current.metadata().map(|m| m.name()), Some("mesh_operation"));
            {
                let inner = OperationTimer::with_context("inner", 1, 3);
                assert_eq!(Span::current().id(), inner.span().id());
            }
            assert_eq!(Span::current().id(), outer.span().id());
            drop(outer);
            assert!(Span::current().is_none());
        });
    }

    #[test]
    fn test_log_stats_on_empty_meshes() {
        log_mesh_stats(&TriangleMesh::new(), "test");
        log_tetra_stats(&TetraMesh::default(), "test");
        log_reduction_result("test", 10, 4, 3);
    }
}
