use std::{io, time::Duration};

use thiserror::Error;

/// A malformed or unrecognized request line. Never closes the session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("unknown command {0:?}")]
    UnknownVerb(String),

    #[error("{verb} expects {expected} argument(s), got {got}")]
    WrongArity {
        verb: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{verb} has no key specified")]
    MissingKey { verb: &'static str },

    #[error("request is not valid UTF-8")]
    InvalidUtf8,
}

/// Why a session ended abnormally.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no complete line received within {0:?}")]
    Idle(Duration),

    #[error(transparent)]
    Io(#[from] io::Error),
}
