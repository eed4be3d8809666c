use std::{io, path::PathBuf, process};

use thiserror::Error;

/// Broad failure classes. Every class terminates the process when it
/// reaches the binary; owner death of the global lock is not an error and
/// never shows up here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Configuration,
    Format,
    Resource,
    OutOfMemory,
    Lock,
    Assertion,
}

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("{flag} expects a file name")]
    MissingPath { flag: &'static str },
    #[error("incompatible --data/--init options")]
    ConflictingModes,
    #[error("invalid heap settings: {0}")]
    InvalidSettings(&'static str),

    #[error("wrong file format")]
    BadMagic,
    #[error("could not read heap address")]
    TruncatedHeader,

    #[error("file {} already exists", .0.display())]
    AlreadyExists(PathBuf),
    #[error("could not open file {} (did you run --init?)", .0.display())]
    NotFound(PathBuf),
    #[error("mmap failed: {0}")]
    MapFailed(#[source] io::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("could not initialize memory: header needs {needed} bytes, region has {available}")]
    Initialization { needed: usize, available: usize },

    #[error("out of persistent memory ({requested} bytes requested)")]
    OutOfMemory { requested: usize },

    #[error("{op} failed with code {code}")]
    LockFailed { op: &'static str, code: i32 },

    #[error("unsafe operation: global lock is not held")]
    UnsafeOperation,
}

impl HeapError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::MissingPath { .. } | Self::ConflictingModes | Self::InvalidSettings(_) => {
                ErrorClass::Configuration
            }
            Self::BadMagic | Self::TruncatedHeader => ErrorClass::Format,
            Self::AlreadyExists(_)
            | Self::NotFound(_)
            | Self::MapFailed(_)
            | Self::Io(_)
            | Self::Initialization { .. } => ErrorClass::Resource,
            Self::OutOfMemory { .. } => ErrorClass::OutOfMemory,
            Self::LockFailed { .. } => ErrorClass::Lock,
            Self::UnsafeOperation => ErrorClass::Assertion,
        }
    }

    /// Process exit status for this failure. Values are pairwise distinct.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::AlreadyExists(_) => 21,
            Self::MapFailed(_) => 22,
            Self::BadMagic => 23,
            Self::TruncatedHeader => 24,
            Self::NotFound(_) => 25,
            Self::Io(_) => 26,
            Self::Initialization { .. } => 31,
            Self::LockFailed { .. } => 44,
            Self::OutOfMemory { .. } => 45,
            Self::UnsafeOperation => 46,
            Self::MissingPath { .. } => 102,
            Self::ConflictingModes => 103,
            Self::InvalidSettings(_) => 104,
        }
    }
}

/// Abort entry point: reports `err` and terminates the process with its
/// exit status. Nothing in this crate retries after a failure.
pub fn fatal(err: &HeapError) -> ! {
    log::error!("{err}");
    match err.class() {
        ErrorClass::Assertion => eprintln!("INTERNAL ERROR: {err}"),
        ErrorClass::Lock => eprintln!("Internal error: {err}"),
        _ => eprintln!("Error: {err}"),
    }
    process::exit(err.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn every_variant() -> Vec<HeapError> {
        vec![
            HeapError::MissingPath { flag: "--data" },
            HeapError::ConflictingModes,
            HeapError::InvalidSettings("x"),
            HeapError::BadMagic,
            HeapError::TruncatedHeader,
            HeapError::AlreadyExists(PathBuf::from("a")),
            HeapError::NotFound(PathBuf::from("a")),
            HeapError::MapFailed(io::Error::from_raw_os_error(libc::EEXIST)),
            HeapError::Io(io::Error::from(io::ErrorKind::Other)),
            HeapError::Initialization { needed: 2, available: 1 },
            HeapError::OutOfMemory { requested: 8 },
            HeapError::LockFailed { op: "pthread_mutex_lock", code: libc::EINVAL },
            HeapError::UnsafeOperation,
        ]
    }

    #[test]
    fn exit_codes_are_distinct() {
        let errors = every_variant();
        let codes: HashSet<i32> = errors.iter().map(HeapError::exit_code).collect();
        assert_eq!(errors.len(), codes.len());
        assert!(codes.iter().all(|&code| code != 0));
    }

    #[test]
    fn classes() {
        assert_eq!(ErrorClass::Configuration, HeapError::ConflictingModes.class());
        assert_eq!(ErrorClass::Format, HeapError::BadMagic.class());
        assert_eq!(ErrorClass::Resource, HeapError::AlreadyExists(PathBuf::new()).class());
        assert_eq!(ErrorClass::OutOfMemory, HeapError::OutOfMemory { requested: 8 }.class());
        assert_eq!(ErrorClass::Assertion, HeapError::UnsafeOperation.class());
    }
}
