use thiserror::Error;

/// All failure modes surfaced by this crate. Parsing never panics on malformed input; every
/// bound violation becomes one of these variants with enough context (offset, method, opcode) to
/// locate the cause without a backtrace.
#[derive(Debug, Error)]
pub enum ClassFileError {
    /// Class file truncated, bad magic, unknown constant-pool tag, or a code offset outside
    /// `[code_start, code_end)`.
    #[error("malformed class file: {reason} (at byte offset {offset})")]
    MalformedInput { reason: String, offset: usize },

    /// The emitter was asked to finalize a method while forward references to a label were
    /// still outstanding.
    #[error("unresolved label in method {method} ({count} forward reference(s) left unpatched)")]
    UnresolvedLabel { method: String, count: usize },

    /// A label's offset was queried before it was resolved, or a label was reused across two
    /// writers.
    #[error("illegal label state: {0}")]
    IllegalState(String),

    /// `jsr`/`ret` was present in a method body while full stack-map frame computation was
    /// requested; the JVM verifier has not accepted subroutines since class file version 51.
    #[error("method {method} uses jsr/ret, which is incompatible with frame computation")]
    UnsupportedConstruct { method: String },

    /// The method body exceeded 65,535 bytes after the resize pass, or a constant-pool index
    /// exceeded `u16::MAX`.
    #[error("{what} overflowed its limit: {actual} > {limit}")]
    OverflowLimit {
        what: &'static str,
        actual: usize,
        limit: usize,
    },

    /// Bubbled up from the underlying `std::io::Read`/`Write` implementation (e.g. a truncated
    /// in-memory cursor).
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ClassFileError>;

impl ClassFileError {
    pub fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        ClassFileError::MalformedInput {
            reason: reason.into(),
            offset,
        }
    }
}
