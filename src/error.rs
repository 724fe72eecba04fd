use thiserror::Error;

/// Errors reported by pool lifecycle and object operations
///
/// Operations that mutate persistent state either complete durably or leave
/// the pool in its prior consistent state; an `Err` never means a torn image.
#[derive(Debug, Error)]
pub enum Error {
    /// A caller-supplied value is out of range (type number, layout length,
    /// null where not allowed)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The pool file does not carry a usable image: bad signature, version,
    /// architecture, checksum, or an unknown incompatible feature
    #[error("invalid pool image: {0}")]
    InvalidImage(String),

    /// A file, mapping, or sync syscall failed; carries the first observed
    /// OS error
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// The persistent heap cannot satisfy the request
    #[error("out of persistent space (requested {0} bytes)")]
    OutOfSpace(usize),

    /// A pool with the same id is already registered in this process
    #[error("pool already open")]
    AlreadyPresent,

    /// The pool was opened (or demoted to) read-only
    #[error("pool is read-only")]
    ReadOnly,
}

impl Error {
    pub(crate) fn inval<S: Into<String>>(msg: S) -> Error {
        Error::InvalidArgument(msg.into())
    }

    pub(crate) fn image<S: Into<String>>(msg: S) -> Error {
        Error::InvalidImage(msg.into())
    }
}
