use std::fmt::{self, Display};
use std::io;

use crate::serde;

/// Problems with the profiler's startup configuration. These are reported
/// before any instrumentation starts.
#[derive(Debug)]
pub enum ConfigError {
    InvalidSerializer(String),

    MissingLogfile,

    MissingNodePlaceholder { logfile: String, nodes: u32 },

    Io { path: String, error: io::Error },
}

impl Display for ConfigError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::InvalidSerializer(kind) => write!(
                formatter,
                "invalid profiling serializer \"{}\", must be \"binary\" or \"ascii\"",
                kind
            ),
            ConfigError::MissingLogfile => formatter.write_str(
                "the binary profiling serializer requires a logfile (--prof-logfile)",
            ),
            ConfigError::MissingNodePlaceholder { logfile, nodes } => write!(
                formatter,
                "profiling logfile \"{}\" has no '%' to substitute the node number into, \
                 but the job runs on {} nodes",
                logfile, nodes
            ),
            ConfigError::Io { path, error } => {
                write!(formatter, "unable to open profiling logfile {}: {}", path, error)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum ProfError {
    Config(ConfigError),

    Io(io::Error),

    Decode(serde::Error),

    BadHeader(String),

    UnknownRecord(u32),

    AlreadyFinalized,
}

impl Display for ProfError {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProfError::Config(err) => Display::fmt(err, formatter),
            ProfError::Io(err) => write!(formatter, "profiling log I/O error: {}", err),
            ProfError::Decode(err) => write!(formatter, "malformed profiling data: {}", err),
            ProfError::BadHeader(reason) => write!(formatter, "bad profiling log header: {}", reason),
            ProfError::UnknownRecord(id) => write!(formatter, "unknown profiling record id {}", id),
            ProfError::AlreadyFinalized => formatter.write_str("profiler was already finalized"),
        }
    }
}

impl std::error::Error for ProfError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProfError::Config(err) => Some(err),
            ProfError::Io(err) => Some(err),
            ProfError::Decode(err) => Some(err),
            ProfError::BadHeader(_) | ProfError::UnknownRecord(_) | ProfError::AlreadyFinalized => {
                None
            }
        }
    }
}

impl From<ConfigError> for ProfError {
    fn from(err: ConfigError) -> Self {
        ProfError::Config(err)
    }
}

impl From<io::Error> for ProfError {
    fn from(err: io::Error) -> Self {
        ProfError::Io(err)
    }
}

impl From<serde::Error> for ProfError {
    fn from(err: serde::Error) -> Self {
        ProfError::Decode(err)
    }
}

impl From<ProfError> for io::Error {
    fn from(err: ProfError) -> Self {
        match err {
            ProfError::Io(err) => err,
            err => io::Error::new(io::ErrorKind::InvalidData, err),
        }
    }
}
