use thiserror_no_std::Error;

/// The three error kinds a [`Context`](crate::Context) operation can surface.
///
/// Every fallible public operation returns `Result<_, AllocError>`; the
/// backend's error hook is an additional, advisory notification fired
/// before the `Err` is returned (see `Backend::on_error`).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("backend allocation failed while {0}")]
    Backend(&'static str),

    #[error("size computation overflowed while {0}")]
    Overflow(&'static str),

    #[error("structural corruption detected: {0}")]
    Corrupt(&'static str),
}
