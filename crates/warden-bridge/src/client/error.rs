//! Client-side error taxonomy.

use crate::routes::RouteError;
use crate::translate::TranslateError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Unary or stream call failed below the HTTP layer.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Dialing a hijack connection failed or timed out.
    #[error("dial failed: {0}")]
    Dial(#[source] std::io::Error),

    #[error("hijack failed: {0}")]
    Hijack(#[from] hyper::Error),

    /// Undecodable frame or unexpected stream shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server answered with a non-success status.
    #[error("server error ({code}): {message}")]
    Remote { code: u16, message: String },

    #[error("unknown handle: {handle}")]
    ContainerNotFound { handle: String },

    /// The process stream reported an error.
    #[error("process error: {0}")]
    Process(String),

    /// Request rejected before any I/O.
    #[error("invalid request: {0}")]
    Validation(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ContainerNotFound { .. })
            || matches!(self, Self::Remote { code: 404, .. })
    }

    /// HTTP status of a remote failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Remote { code, .. } => Some(*code),
            Self::ContainerNotFound { .. } => Some(404),
            _ => None,
        }
    }
}

impl From<RouteError> for Error {
    fn from(err: RouteError) -> Self {
        Self::Validation(err.to_string())
    }
}

impl From<TranslateError> for Error {
    fn from(err: TranslateError) -> Self {
        Self::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
