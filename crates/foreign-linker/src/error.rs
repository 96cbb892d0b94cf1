#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Binding verification failed: {0}")]
    BindingVerification(String),

    #[error("Signature mismatch: target has type {actual}, signature requires {expected}")]
    SignatureMismatch { expected: String, actual: String },

    #[error("Native call to `{symbol}` failed with code {code}: {message}")]
    NativeCallFailure {
        symbol: String,
        code: i32,
        message: String,
    },

    #[error("Unsupported stub shape: {0}")]
    UnsupportedShape(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Upcall target failed: {0}")]
    UpcallFailure(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
