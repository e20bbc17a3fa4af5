use std::io::{self, Write};

use log::{error, info};
use parking_lot::Mutex;
use serde::Serialize;

use crate::records::RecordKind;
use crate::serde::ascii;

pub const LOG_TARGET: &str = "legion_prof";

enum Output {
    Log,
    Writer {
        out: Box<dyn Write + Send>,
        error: Option<io::Error>,
    },
}

/// Line oriented text log. Each record becomes one `Prof <Name> <values>`
/// line, emitted atomically, so any number of threads may write at once.
pub struct AsciiSerializer {
    output: Mutex<Output>,
}

impl AsciiSerializer {
    /// Sends lines to the `log` facade under the `legion_prof` target.
    pub fn to_log() -> Self {
        AsciiSerializer {
            output: Mutex::new(Output::Log),
        }
    }

    pub fn to_writer(out: Box<dyn Write + Send>) -> Self {
        AsciiSerializer {
            output: Mutex::new(Output::Writer { out, error: None }),
        }
    }

    pub fn write_record<R: Serialize + ?Sized>(&self, kind: RecordKind, record: &R) {
        let values = match ascii::to_string(record) {
            Ok(values) => values,
            Err(err) => {
                error!("unable to format {} record: {}", kind.name(), err);
                return;
            }
        };
        let mut output = self.output.lock();
        match &mut *output {
            Output::Log => info!(target: LOG_TARGET, "Prof {} {}", kind.name(), values),
            Output::Writer { out, error } => {
                if error.is_some() {
                    return;
                }
                if let Err(err) = writeln!(out, "Prof {} {}", kind.name(), values) {
                    error!("profiling log write failed, dropping further records: {}", err);
                    *error = Some(err);
                }
            }
        }
    }

    pub fn finish(&self) -> io::Result<()> {
        let mut output = self.output.lock();
        match &mut *output {
            Output::Log => {
                log::logger().flush();
                Ok(())
            }
            Output::Writer { out, error } => match error.take() {
                Some(err) => Err(err),
                None => out.flush(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::records::TaskKind;
    use crate::serializer::SharedBuffer;
    use crate::state::TaskID;

    #[test]
    fn test_line_format() {
        let buffer = SharedBuffer::default();
        let serializer = AsciiSerializer::to_writer(Box::new(buffer.clone()));
        let kind = TaskKind {
            task_id: TaskID(7),
            overwrite: true,
            name: "top level".to_owned(),
        };
        serializer.write_record(RecordKind::TaskKind, &kind);
        serializer.finish().unwrap();
        let text = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert_eq!(text, "Prof TaskKind 7 1 top level\n");
    }

    #[test]
    fn test_log_output_does_not_fail() {
        let serializer = AsciiSerializer::to_log();
        serializer.write_record(RecordKind::TaskKind, &TaskKind::default());
        serializer.finish().unwrap();
    }
}
