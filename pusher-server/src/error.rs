//! Error surface of the multiplexer operations. Pump tasks keep returning
//! `&'static str` close reasons; these enums cover everything a client
//! operation can fail with.

use thiserror::Error;

use crate::admin_api::AdminApiError;
use crate::back::BackError;

#[derive(Debug, Error)]
pub enum PusherError {
    /// The operation needs a room back-stream the client does not have yet.
    #[error("client has no back-end room connection")]
    NoBackConnection,

    /// The client referenced a space it never joined.
    #[error("unknown space {requested} (joined spaces: {known:?})")]
    UnknownSpace {
        requested: String,
        known: Vec<String>,
    },

    /// The back has not assigned a user id to this client yet.
    #[error("user id not assigned yet")]
    NoUserId,

    #[error("operation not authorized: {0}")]
    Unauthorized(&'static str),

    #[error("invalid metadata blob: {0}")]
    InvalidMetadata(String),

    #[error(transparent)]
    Back(#[from] BackError),

    #[error(transparent)]
    Admin(#[from] AdminApiError),
}
