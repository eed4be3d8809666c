//! Startup configuration: where the region lives, how large it is and
//! which of the three modes the heap is opened in.

use std::{ffi::OsString, path::PathBuf};

use clap::{
    Args, Parser,
    error::{ContextKind, ContextValue, ErrorKind},
};

use crate::{error::HeapError, kernel};

/// Virtual address the region is mapped at. Chosen far above any realistic
/// program break so that [`crate::Heap::is_static`] is a single compare.
///
/// Position independent executables get their break next to the image
/// (around `0x5555_5555_0000` on x86_64, `0xaaaa_aaaa_0000` on aarch64), so
/// the base sits between that and the top-down mmap area.
#[cfg(target_arch = "x86_64")]
pub const DEFAULT_BASE_ADDRESS: usize = 0x6000_0000_0000;
#[cfg(target_arch = "aarch64")]
pub const DEFAULT_BASE_ADDRESS: usize = 0xd000_0000_0000;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const DEFAULT_BASE_ADDRESS: usize = 0x0000_0010_0000_0000;

/// 128 GiB. The backing file is sparse so only touched pages cost disk.
pub const DEFAULT_REGION_SIZE: usize = 128 * 1024 * 1024 * 1024;

/// Placement of a new region. A loaded region ignores these and uses the
/// base address recorded in the file and the file's length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSettings {
    pub base_address: usize,
    pub region_size: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            base_address: DEFAULT_BASE_ADDRESS,
            region_size: DEFAULT_REGION_SIZE,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), HeapError> {
        let page_size = kernel::page_size();
        if self.base_address == 0 || self.region_size == 0 {
            return Err(HeapError::InvalidSettings("base address and size must be > 0"));
        }
        if !self.base_address.is_multiple_of(page_size) {
            return Err(HeapError::InvalidSettings("base address must be page aligned"));
        }
        if !self.region_size.is_multiple_of(page_size) {
            return Err(HeapError::InvalidSettings("region size must be a multiple of the page size"));
        }
        if self.base_address.checked_add(self.region_size).is_none() {
            return Err(HeapError::InvalidSettings("region exceeds the address space"));
        }
        Ok(())
    }
}

/// How the heap is brought up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Process-local memory, nothing persisted. The lock only serializes
    /// threads of this process.
    Transient,
    /// Create a new region file. Fails if it exists.
    Create(PathBuf),
    /// Map an existing region file.
    Load(PathBuf),
}

/// Heap flags. Meant to be flattened into the command line of the runtime
/// embedding the heap.
#[derive(Args, Debug, Default, Clone, PartialEq, Eq)]
pub struct HeapArgs {
    /// Create a new persistent heap at PATH (fails if it exists)
    #[arg(long = "init", value_name = "PATH", conflicts_with = "data")]
    pub init: Option<PathBuf>,

    /// Load an existing persistent heap from PATH
    #[arg(long = "data", value_name = "PATH")]
    pub data: Option<PathBuf>,

    /// Size in bytes of a region created with --init
    #[arg(long, value_name = "BYTES", requires = "init")]
    pub region_size: Option<usize>,
}

#[derive(Parser, Debug)]
#[command(no_binary_name = true)]
struct Standalone {
    #[command(flatten)]
    heap: HeapArgs,
}

impl HeapArgs {
    /// Parses heap flags from raw arguments (without the program name).
    pub fn try_from_args<I, T>(args: I) -> Result<Self, HeapError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        match Standalone::try_parse_from(args) {
            Ok(parsed) => Ok(parsed.heap),
            Err(err) => Err(configuration_error(&err)
                .unwrap_or(HeapError::InvalidSettings("unrecognized heap option"))),
        }
    }

    pub fn mode(&self) -> Result<Mode, HeapError> {
        match (&self.init, &self.data) {
            (Some(_), Some(_)) => Err(HeapError::ConflictingModes),
            (Some(path), None) => Ok(Mode::Create(path.clone())),
            (None, Some(path)) => Ok(Mode::Load(path.clone())),
            (None, None) => Ok(Mode::Transient),
        }
    }

    pub fn settings(&self) -> HeapSettings {
        let mut settings = HeapSettings::default();
        self.region_size.inspect(|&val| settings.region_size = val);
        settings
    }
}

/// Translates the clap failures that correspond to heap configuration
/// errors, so they terminate with their own exit status instead of clap's
/// generic usage status. Help/version requests and unrelated usage errors
/// return `None`.
pub fn configuration_error(err: &clap::Error) -> Option<HeapError> {
    match err.kind() {
        ErrorKind::ArgumentConflict => Some(HeapError::ConflictingModes),
        ErrorKind::InvalidValue => match err.get(ContextKind::InvalidArg) {
            Some(ContextValue::String(arg)) if arg.starts_with("--init") => {
                Some(HeapError::MissingPath { flag: "--init" })
            }
            Some(ContextValue::String(arg)) if arg.starts_with("--data") => {
                Some(HeapError::MissingPath { flag: "--data" })
            }
            _ => None,
        },
        // Only `--region-size` requires another heap flag.
        ErrorKind::MissingRequiredArgument => match err.get(ContextKind::InvalidArg) {
            Some(ContextValue::Strings(args)) if args.iter().any(|arg| arg.starts_with("--init")) => {
                Some(HeapError::InvalidSettings("--region-size requires --init"))
            }
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_flags_is_transient() {
        let args = HeapArgs::try_from_args(Vec::<&str>::new()).unwrap();
        assert_eq!(Mode::Transient, args.mode().unwrap());
    }

    #[test]
    fn init_and_data_select_modes() {
        let args = HeapArgs::try_from_args(["--init", "heap.img"]).unwrap();
        assert_eq!(Mode::Create(PathBuf::from("heap.img")), args.mode().unwrap());

        let args = HeapArgs::try_from_args(["--data", "heap.img"]).unwrap();
        assert_eq!(Mode::Load(PathBuf::from("heap.img")), args.mode().unwrap());
    }

    #[test]
    fn conflicting_flags() {
        let err = HeapArgs::try_from_args(["--init", "a", "--data", "b"]).unwrap_err();
        assert!(matches!(err, HeapError::ConflictingModes));

        let args = HeapArgs {
            init: Some("a".into()),
            data: Some("b".into()),
            region_size: None,
        };
        assert!(matches!(args.mode(), Err(HeapError::ConflictingModes)));
    }

    #[test]
    fn flag_without_path() {
        let err = HeapArgs::try_from_args(["--data"]).unwrap_err();
        assert!(matches!(err, HeapError::MissingPath { flag: "--data" }));

        let err = HeapArgs::try_from_args(["--init"]).unwrap_err();
        assert!(matches!(err, HeapError::MissingPath { flag: "--init" }));
        assert_ne!(HeapError::ConflictingModes.exit_code(), err.exit_code());
    }

    #[test]
    fn region_size_without_init() {
        let err = HeapArgs::try_from_args(["--region-size", "4096"]).unwrap_err();
        assert!(
            matches!(err, HeapError::InvalidSettings(msg) if msg.contains("--init")),
            "{err:?}"
        );

        let err = HeapArgs::try_from_args(["--data", "a", "--region-size", "4096"]).unwrap_err();
        assert!(matches!(err, HeapError::InvalidSettings(_)));
        assert_ne!(HeapError::MissingPath { flag: "--init" }.exit_code(), err.exit_code());
    }

    #[test]
    fn region_size_override() {
        let args = HeapArgs::try_from_args(["--init", "a", "--region-size", "1048576"]).unwrap();
        assert_eq!(1 << 20, args.settings().region_size);
        assert_eq!(DEFAULT_BASE_ADDRESS, args.settings().base_address);
    }

    #[test]
    fn settings_validation() {
        assert!(HeapSettings::default().validate().is_ok());

        let unaligned = HeapSettings {
            base_address: DEFAULT_BASE_ADDRESS + 1,
            ..Default::default()
        };
        assert!(matches!(unaligned.validate(), Err(HeapError::InvalidSettings(_))));

        let empty = HeapSettings {
            region_size: 0,
            ..Default::default()
        };
        assert!(empty.validate().is_err());

        let wrapping = HeapSettings {
            base_address: usize::MAX & !0xfff_ffff,
            region_size: 1 << 30,
        };
        assert!(wrapping.validate().is_err());
    }
}
