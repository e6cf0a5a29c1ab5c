use couch_core::{ChannelError, SessionError, StoreError};
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    Channel(#[from] ChannelError),
    #[error("state store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unable to determine home directory for the state file")]
    NoHomeDirectory,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
