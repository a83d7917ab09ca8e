//! Channel-level errors shared by the host listener and the worker runtime.

use std::io;
use std::time::Duration;

use crate::bridge::codec::CodecError;
use crate::launcher::LaunchError;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Handshake did not complete in time. Fatal to this start attempt only.
    #[error("channel not ready after {waited:?}")]
    Timeout { waited: Duration },

    /// Send attempted before the outbound link exists.
    #[error("channel not ready, cannot send {command}")]
    NotReady { command: String },

    #[error("invalid endpoint address '{0}'")]
    InvalidEndpoint(String),

    #[error("startup argument {0} is not set")]
    MissingArgument(&'static str),

    #[error("channel task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("channel i/o error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_not_ready(&self) -> bool {
        matches!(self, Self::NotReady { .. })
    }
}
