use thiserror::Error;

use crate::types::TypedFeatureId;

/// Errors surfaced by tile compilation, reading and updating.
#[derive(Debug, Error)]
pub enum TileError {
    /// A proto-GOL or TES stream was truncated or structurally invalid.
    #[error("malformed stream: {0}")]
    MalformedStream(String),
    /// A handle or feature id could not be resolved at fixup or build time.
    #[error("unresolved reference: {0}")]
    UnresolvedRef(String),
    /// A member feature referenced by a relation is missing from the stream.
    #[error("{relation} references missing member {member}")]
    MissingMember {
        relation: TypedFeatureId,
        member: TypedFeatureId,
    },
    /// A placement or geometry invariant was violated; indicates a bug in the
    /// producer of the input (e.g. a node outside its tile's bounds).
    #[error("layout invariant violated: {0}")]
    LayoutInvariant(String),
    /// The length prefix of a tile blob does not match its body size.
    #[error("tile length prefix {prefix} does not match body size {body}")]
    LengthMismatch { prefix: u32, body: u32 },
    /// The trailing checksum of a tile blob does not match its body.
    #[error("tile checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },
    /// A duplicate feature was declared in a single proto stream.
    #[error("duplicate feature {0} in input stream")]
    DuplicateFeature(TypedFeatureId),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenient result alias for all fallible tile operations.
pub type TileResult<T> = Result<T, TileError>;

impl TileError {
    pub(crate) fn malformed(what: impl Into<String>) -> Self {
        Self::MalformedStream(what.into())
    }

    pub(crate) fn unresolved(what: impl Into<String>) -> Self {
        Self::UnresolvedRef(what.into())
    }
}
