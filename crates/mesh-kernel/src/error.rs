//! Error types for kernel operations with rich diagnostics.
//!
//! Geometric degeneracies (zero-area triangles, singular matrices, coincident
//! points) never surface here: they are resolved locally by the algorithms.
//! Errors are reserved for caller misuse such as malformed buffers or invalid
//! parameters. An operation that returns an error leaves its instance untouched.
//!
//! # Error Codes
//!
//! Each error has a unique code in the format `KERN-XXXX`:
//! - `KERN-1xxx`: Buffer errors (strides, sizes, index ranges)
//! - `KERN-2xxx`: Parameter and protocol errors
//! - `KERN-3xxx`: Input content errors
//!
//! # Example
//!
//! ```
//! use mesh_kernel::{ErrorCode, KernelError};
//!
//! let err = KernelError::invalid_stride("vertex", 4, 12);
//! assert_eq!(err.code(), ErrorCode::InvalidStride);
//! assert_eq!(err.code().as_str(), "KERN-1001");
//! ```

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

/// Machine-readable error codes for kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // Buffer errors (1xxx)
    /// KERN-1001: Byte stride smaller than the element it must hold
    InvalidStride = 1001,
    /// KERN-1002: Byte buffer shorter than count * stride
    BufferTooSmall = 1002,
    /// KERN-1003: Index count is not a multiple of the primitive size
    InvalidIndexCount = 1003,
    /// KERN-1004: Index references a vertex that does not exist
    IndexOutOfRange = 1004,

    // Parameter and protocol errors (2xxx)
    /// KERN-2001: Numeric parameter outside its valid range
    InvalidParameter = 2001,
    /// KERN-2002: Operation requires a finished registration phase
    NotFinalized = 2002,
    /// KERN-2003: Registration was already finalized
    RegistrationClosed = 2003,
    /// KERN-2004: Operation needs the other kind of mesh
    WrongMeshKind = 2004,

    // Input content errors (3xxx)
    /// KERN-3001: Mesh has no vertices or no primitives
    EmptyMesh = 3001,
}

impl ErrorCode {
    /// Returns the error code as a string in the format `KERN-XXXX`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidStride => "KERN-1001",
            ErrorCode::BufferTooSmall => "KERN-1002",
            ErrorCode::InvalidIndexCount => "KERN-1003",
            ErrorCode::IndexOutOfRange => "KERN-1004",
            ErrorCode::InvalidParameter => "KERN-2001",
            ErrorCode::NotFinalized => "KERN-2002",
            ErrorCode::RegistrationClosed => "KERN-2003",
            ErrorCode::WrongMeshKind => "KERN-2004",
            ErrorCode::EmptyMesh => "KERN-3001",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recovery suggestions for kernel errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoverySuggestion {
    /// Fix the layout description of a caller buffer.
    FixBufferLayout { details: String },
    /// Adjust parameters for the operation.
    AdjustParameters { parameters: Vec<(String, String)> },
    /// Call the named operation first.
    CallFirst { operation: String },
    /// Check the source mesh for issues.
    CheckSourceMesh { checks: Vec<String> },
}

impl std::fmt::Display for RecoverySuggestion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoverySuggestion::FixBufferLayout { details } => {
                write!(f, "Fix the buffer layout: {}", details)
            }
            RecoverySuggestion::AdjustParameters { parameters } => {
                write!(f, "Adjust parameters: ")?;
                for (i, (name, hint)) in parameters.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{} ({})", name, hint)?;
                }
                Ok(())
            }
            RecoverySuggestion::CallFirst { operation } => {
                write!(f, "Call `{}` before this operation", operation)
            }
            RecoverySuggestion::CheckSourceMesh { checks } => {
                write!(f, "Check the source mesh: {}", checks.join(", "))
            }
        }
    }
}

/// Errors that can occur during kernel operations.
#[derive(Debug, Error, Diagnostic)]
pub enum KernelError {
    /// Byte stride cannot hold one element.
    #[error("invalid {buffer} stride: {stride} bytes, element needs at least {required}")]
    #[diagnostic(
        code(kernel::buffer::stride),
        help("The stride is the byte distance between consecutive elements, not the element count")
    )]
    InvalidStride {
        buffer: &'static str,
        stride: usize,
        required: usize,
    },

    /// Byte buffer shorter than declared.
    #[error("{buffer} buffer holds {actual} bytes, {required} required")]
    #[diagnostic(code(kernel::buffer::size))]
    BufferTooSmall {
        buffer: &'static str,
        actual: usize,
        required: usize,
    },

    /// Index count does not match the primitive size.
    #[error("index count {count} is not a multiple of {primitive_size}")]
    #[diagnostic(
        code(kernel::buffer::index_count),
        help("Triangles use 3 indices, tetrahedra use 4")
    )]
    InvalidIndexCount { count: usize, primitive_size: usize },

    /// Index references a vertex that does not exist.
    #[error("index {index} at position {position} exceeds vertex count {vertex_count}")]
    #[diagnostic(code(kernel::buffer::index_range))]
    IndexOutOfRange {
        position: usize,
        index: u32,
        vertex_count: usize,
    },

    /// Numeric parameter outside its valid range.
    #[error("invalid parameter {name} = {value}: {reason}")]
    #[diagnostic(code(kernel::param::invalid))]
    InvalidParameter {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },

    /// Registration phase not finished.
    #[error("{operation} requires a finalized structure")]
    #[diagnostic(
        code(kernel::protocol::not_finalized),
        help("Register all vertices and triangles, then finalize before editing")
    )]
    NotFinalized { operation: &'static str },

    /// Registration already finalized.
    #[error("{operation} is not allowed after finalization")]
    #[diagnostic(
        code(kernel::protocol::closed),
        help("Create a new instance or call `clear` to register a new mesh")
    )]
    RegistrationClosed { operation: &'static str },

    /// Operation applied to the wrong kind of mesh.
    #[error("{operation} needs a {expected} mesh")]
    #[diagnostic(code(kernel::protocol::mesh_kind))]
    WrongMeshKind {
        operation: &'static str,
        expected: &'static str,
    },

    /// Mesh without vertices or primitives.
    #[error("mesh is empty: {details}")]
    #[diagnostic(code(kernel::input::empty))]
    EmptyMesh { details: String },
}

impl KernelError {
    /// Returns the machine-readable error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            KernelError::InvalidStride { .. } => ErrorCode::InvalidStride,
            KernelError::BufferTooSmall { .. } => ErrorCode::BufferTooSmall,
            KernelError::InvalidIndexCount { .. } => ErrorCode::InvalidIndexCount,
            KernelError::IndexOutOfRange { .. } => ErrorCode::IndexOutOfRange,
            KernelError::InvalidParameter { .. } => ErrorCode::InvalidParameter,
            KernelError::NotFinalized { .. } => ErrorCode::NotFinalized,
            KernelError::RegistrationClosed { .. } => ErrorCode::RegistrationClosed,
            KernelError::WrongMeshKind { .. } => ErrorCode::WrongMeshKind,
            KernelError::EmptyMesh { .. } => ErrorCode::EmptyMesh,
        }
    }

    /// Returns a recovery suggestion for this error.
    pub fn recovery_suggestion(&self) -> RecoverySuggestion {
        match self {
            KernelError::InvalidStride {
                buffer, required, ..
            } => RecoverySuggestion::FixBufferLayout {
                details: format!("{} stride must be at least {} bytes", buffer, required),
            },
            KernelError::BufferTooSmall { buffer, .. } => RecoverySuggestion::FixBufferLayout {
                details: format!("pass the full {} buffer", buffer),
            },
            KernelError::InvalidIndexCount { primitive_size, .. } => {
                RecoverySuggestion::FixBufferLayout {
                    details: format!("index count must be a multiple of {}", primitive_size),
                }
            }
            KernelError::IndexOutOfRange { .. } => RecoverySuggestion::CheckSourceMesh {
                checks: vec!["index buffer matches vertex buffer".into()],
            },
            KernelError::InvalidParameter { name, reason, .. } => {
                RecoverySuggestion::AdjustParameters {
                    parameters: vec![(name.to_string(), reason.to_string())],
                }
            }
            KernelError::NotFinalized { .. } => RecoverySuggestion::CallFirst {
                operation: "end_registration".into(),
            },
            KernelError::RegistrationClosed { .. } => RecoverySuggestion::CallFirst {
                operation: "clear".into(),
            },
            KernelError::WrongMeshKind { expected, .. } => RecoverySuggestion::CheckSourceMesh {
                checks: vec![format!("geometry is a {} mesh", expected)],
            },
            KernelError::EmptyMesh { .. } => RecoverySuggestion::CheckSourceMesh {
                checks: vec!["mesh has vertices".into(), "mesh has primitives".into()],
            },
        }
    }

    // Constructor helpers for common error patterns

    /// Create an InvalidStride error.
    pub fn invalid_stride(buffer: &'static str, stride: usize, required: usize) -> Self {
        KernelError::InvalidStride {
            buffer,
            stride,
            required,
        }
    }

    /// Create a BufferTooSmall error.
    pub fn buffer_too_small(buffer: &'static str, actual: usize, required: usize) -> Self {
        KernelError::BufferTooSmall {
            buffer,
            actual,
            required,
        }
    }

    /// Create an InvalidParameter error.
    pub fn invalid_parameter(name: &'static str, value: f64, reason: &'static str) -> Self {
        KernelError::InvalidParameter {
            name,
            value,
            reason,
        }
    }

    /// Create an IndexOutOfRange error.
    pub fn index_out_of_range(position: usize, index: u32, vertex_count: usize) -> Self {
        KernelError::IndexOutOfRange {
            position,
            index,
            vertex_count,
        }
    }

    /// Create an EmptyMesh error.
    pub fn empty_mesh(details: impl Into<String>) -> Self {
        KernelError::EmptyMesh {
            details: details.into(),
        }
    }

    /// Log the error once on the diagnostic channel and hand it back.
    pub(crate) fn reported(self) -> Self {
        tracing::warn!(code = %self.code(), "{}", self);
        self
    }
}
