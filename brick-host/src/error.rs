use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostError {
    #[error("{program} exited with code {exit_code:?}: {stderr}")]
    ProcessExecution {
        program: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("failed to execute {program}: {source}")]
    CommandSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("block device {0} is read-only")]
    BlockDeviceReadOnly(PathBuf),

    #[error("volume path {0} was not removed in time")]
    VolumePathNotRemoved(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// Exit code of a failed external command, if this error carries one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            HostError::ProcessExecution { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// True when this is an execution failure with one of the given codes.
    pub fn has_exit_code(&self, codes: &[i32]) -> bool {
        self.exit_code().is_some_and(|code| codes.contains(&code))
    }
}

pub type Result<T> = std::result::Result<T, HostError>;
