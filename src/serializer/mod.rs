//! Log backends.
//!
//! A [`Serializer`] is one output stream for one node. Records reach it
//! through a [`SerializerGuard`], which holds the backend's lock when the
//! backend needs one.

pub mod ascii;
pub mod binary;

use std::fs::File;
use std::io::{self, BufWriter};

use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;

use crate::config::ProfilerConfig;
use crate::error::ConfigError;
use crate::records::{LogRecord, RecordKind, RecordSink};
use crate::state::NodeID;

pub use ascii::AsciiSerializer;
pub use binary::BinarySerializer;

pub enum Serializer {
    Binary(Mutex<BinarySerializer>),
    Ascii(AsciiSerializer),
}

pub enum SerializerGuard<'a> {
    Binary(MutexGuard<'a, BinarySerializer>),
    Ascii(&'a AsciiSerializer),
}

/// Expands the node placeholder in a logfile template.
pub fn logfile_for_node(template: &str, node: NodeID, total_nodes: u32) -> Result<String, ConfigError> {
    if template.contains('%') {
        Ok(template.replacen('%', &node.to_string(), 1))
    } else if total_nodes > 1 {
        Err(ConfigError::MissingNodePlaceholder {
            logfile: template.to_owned(),
            nodes: total_nodes,
        })
    } else {
        Ok(template.to_owned())
    }
}

impl Serializer {
    pub fn open(
        config: &ProfilerConfig,
        node: NodeID,
        total_nodes: u32,
    ) -> Result<Serializer, ConfigError> {
        match config.serializer.as_str() {
            "binary" => {
                let template = config
                    .logfile
                    .as_deref()
                    .ok_or(ConfigError::MissingLogfile)?;
                let path = logfile_for_node(template, node, total_nodes)?;
                let serializer = File::create(&path)
                    .and_then(|file| BinarySerializer::new(Box::new(BufWriter::new(file))))
                    .map_err(|error| ConfigError::Io {
                        path: path.clone(),
                        error,
                    })?;
                info!("node {} writing profiling log to {}", node, path);
                Ok(Serializer::Binary(Mutex::new(serializer)))
            }
            "ascii" => {
                if let Some(logfile) = &config.logfile {
                    warn!(
                        "ignoring profiling logfile {}: the ascii serializer writes to the logger",
                        logfile
                    );
                }
                Ok(Serializer::Ascii(AsciiSerializer::to_log()))
            }
            other => Err(ConfigError::InvalidSerializer(other.to_owned())),
        }
    }

    pub fn is_thread_safe(&self) -> bool {
        match self {
            Serializer::Binary(_) => false,
            Serializer::Ascii(_) => true,
        }
    }

    /// Exclusive access for non-thread-safe backends, a plain borrow
    /// otherwise.
    pub fn lock(&self) -> SerializerGuard<'_> {
        match self {
            Serializer::Binary(binary) => SerializerGuard::Binary(binary.lock()),
            Serializer::Ascii(ascii) => SerializerGuard::Ascii(ascii),
        }
    }

    pub fn serialize<R: LogRecord + ?Sized>(&self, record: &R) {
        self.lock().serialize(record)
    }

    pub fn finish(&self) -> io::Result<()> {
        match self {
            Serializer::Binary(binary) => binary.lock().finish(),
            Serializer::Ascii(ascii) => ascii.finish(),
        }
    }
}

impl SerializerGuard<'_> {
    pub fn serialize<R: LogRecord + ?Sized>(&mut self, record: &R) {
        record.emit(self)
    }
}

impl RecordSink for SerializerGuard<'_> {
    fn write_as<R: Serialize>(&mut self, kind: RecordKind, record: &R) {
        match self {
            SerializerGuard::Binary(binary) => binary.write_as(kind, record),
            SerializerGuard::Ascii(ascii) => ascii.write_record(kind, record),
        }
    }
}

#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(pub std::sync::Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

#[cfg(test)]
impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::records::{ProcDesc, TaskInfo, WaitInfo};
    use crate::state::{OpID, ProcID, ProcKind};

    #[test]
    fn test_logfile_template() {
        assert_eq!(
            logfile_for_node("prof_%.gz", NodeID(3), 4).unwrap(),
            "prof_3.gz"
        );
        assert_eq!(
            logfile_for_node("prof.gz", NodeID(0), 1).unwrap(),
            "prof.gz"
        );
        assert!(matches!(
            logfile_for_node("prof.gz", NodeID(0), 2),
            Err(ConfigError::MissingNodePlaceholder { nodes: 2, .. })
        ));
    }

    #[test]
    fn test_open_errors() {
        let mut config = ProfilerConfig::default();
        assert!(matches!(
            Serializer::open(&config, NodeID(0), 1),
            Err(ConfigError::MissingLogfile)
        ));

        config.serializer = "xml".to_owned();
        assert!(matches!(
            Serializer::open(&config, NodeID(0), 1),
            Err(ConfigError::InvalidSerializer(kind)) if kind == "xml"
        ));

        config.serializer = "binary".to_owned();
        config.logfile = Some("/nonexistent-dir/prof_%.gz".to_owned());
        assert!(matches!(
            Serializer::open(&config, NodeID(0), 2),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_open_ascii_ignores_logfile() {
        let config = ProfilerConfig {
            serializer: "ascii".to_owned(),
            logfile: Some("ignored.log".to_owned()),
            ..Default::default()
        };
        let serializer = Serializer::open(&config, NodeID(0), 1).unwrap();
        assert!(serializer.is_thread_safe());
        assert!(!std::path::Path::new("ignored.log").exists());
    }

    #[test]
    fn test_open_binary() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProfilerConfig {
            logfile: Some(dir.path().join("prof_%.gz").to_string_lossy().into_owned()),
            ..Default::default()
        };
        let serializer = Serializer::open(&config, NodeID(1), 2).unwrap();
        assert!(!serializer.is_thread_safe());
        serializer.finish().unwrap();
        assert!(dir.path().join("prof_1.gz").exists());
    }

    #[test]
    fn test_guard_emits_subrecords() {
        let buffer = SharedBuffer::default();
        let serializer = Serializer::Ascii(AsciiSerializer::to_writer(Box::new(buffer.clone())));
        let mut guard = serializer.lock();
        guard.serialize(&ProcDesc {
            proc_id: ProcID(0x1d00000000000001),
            kind: ProcKind::CPU,
        });
        guard.serialize(&TaskInfo {
            op_id: OpID(5),
            wait_intervals: vec![WaitInfo::default()],
            ..Default::default()
        });
        drop(guard);
        let text = buffer.text();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "Prof ProcDesc 0x1d00000000000001 2");
        assert!(lines[1].starts_with("Prof TaskInfo 5 "));
        assert!(lines[2].starts_with("Prof TaskWaitInfo 5 "));
    }
}
