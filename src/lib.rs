//! Matrix-free evaluation of high-order finite and spectral element operators.
//!
//! An [`Operator`](operator::Operator) evaluates the action of a discretized PDE operator
//! without assembling a global matrix. Its input is gathered into per-element buffers by an
//! [`ElemRestriction`](elem_restriction::ElemRestriction), interpolated to quadrature points
//! by a [`Basis`](basis::Basis), processed pointwise by a [`QFunction`](qfunction::QFunction),
//! and integrated and scattered back in reverse order.
//!
//! Every object is created from a [`Backend`], obtained by resolving a resource string such
//! as `/cpu/self` or `/gpu/sim/ref:block_size=32` against a [`Registry`].
//!
//! ```
//! use matfree::{Registry, TransposeMode};
//!
//! # fn main() -> matfree::Result<()> {
//! let backend = Registry::builtin().resolve("/cpu/self/ref/serial")?;
//! let u = backend.vector_from_slice(&[10.0, 11.0, 12.0, 13.0])?;
//! let e = backend.vector(6)?;
//! let r = backend.elem_restriction(3, 2, 1, 4, &[0, 1, 1, 2, 2, 3])?;
//! r.apply(TransposeMode::NoTranspose, TransposeMode::Transpose, &u, &e)?;
//! assert_eq!(e.to_vec()?, vec![10.0, 11.0, 11.0, 12.0, 12.0, 13.0]);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod basis;
pub mod device;
pub mod elem_restriction;
pub mod gallery;
pub mod operator;
pub mod qfunction;
pub mod registry;
pub mod vector;

mod error;
pub(crate) mod workspace;

#[cfg(feature = "proptest")]
pub mod proptest;

pub use backend::Backend;
pub use error::{Error, Result};
pub use registry::{BackendOptions, Registry};

pub extern crate matfree_quadrature as quadrature;

/// Scalar type of all field data.
pub type Scalar = f64;

/// Maximum number of input fields, and of output fields, of a [`QFunction`](qfunction::QFunction).
pub const MAX_QFUNCTION_FIELDS: usize = 16;

/// Memory space of a field buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemType {
    Host,
    Device,
}

/// How an array handed to a vector is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CopyMode {
    /// The values are copied, the caller keeps the array.
    CopyValues,
    /// The vector takes ownership of the array.
    OwnPointer,
    /// The vector uses the caller's array without owning it.
    UsePointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransposeMode {
    NoTranspose,
    Transpose,
}

impl TransposeMode {
    pub fn is_transpose(&self) -> bool {
        matches!(self, Self::Transpose)
    }
}

/// What a basis computes for a QFunction field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvalMode {
    /// Values are passed through unchanged, the field must be collocated with quadrature points.
    None,
    /// Values interpolated to quadrature points.
    Interp,
    /// Reference gradients at quadrature points.
    Grad,
    /// Quadrature weights.
    Weight,
}

/// Choice of quadrature points for Lagrange bases.
pub use matfree_quadrature::QuadratureKind as QuadMode;

/// Reference element topology of a basis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemTopology {
    Line,
    Triangle,
    Quad,
    Tet,
    Pyramid,
    Prism,
    Hex,
}

impl ElemTopology {
    pub fn dim(&self) -> usize {
        match self {
            Self::Line => 1,
            Self::Triangle | Self::Quad => 2,
            Self::Tet | Self::Pyramid | Self::Prism | Self::Hex => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NormType {
    One,
    Two,
    Max,
}
