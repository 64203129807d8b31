//! Error kinds returned by the fragment population core.

use thiserror::Error;

use crate::types::Datatype;

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed filter syntax or mismatched argument counts.
    #[error("invalid parameter: {0}")]
    Param(String),

    /// Declared and actual element type disagree.
    #[error("type mismatch: {0}")]
    Type(String),

    /// The element type cannot be processed.
    #[error("unsupported element type {0:?}")]
    UnsupportedType(Datatype),

    /// The operation name is not part of the kernel catalog.
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    /// A value or index falls outside a dimension's range.
    #[error("{dimension}: {value} is outside of [{min}, {max}]")]
    Bound {
        dimension: String,
        value: String,
        min: String,
        max: String,
    },

    /// A buffer would not fit in the memory budget.
    #[error("{context}: {required} bytes required, budget is {budget} bytes")]
    Memory {
        context: String,
        required: u64,
        budget: u64,
    },

    /// Reading the source or writing the sink failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: anyhow::Error,
    },

    /// Dimension counts or levels are inconsistent.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl Error {
    pub(crate) fn io<C: Into<String>>(context: C) -> impl FnOnce(anyhow::Error) -> Error {
        let context = context.into();
        move |source| Error::Io { context, source }
    }

    pub(crate) fn bound<V, M>(dimension: &str, value: V, min: M, max: M) -> Error
    where
        V: std::fmt::Display,
        M: std::fmt::Display,
    {
        Error::Bound {
            dimension: dimension.to_string(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }
}
