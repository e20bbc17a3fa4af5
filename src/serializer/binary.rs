use std::io::{self, Write};

use flate2::Compression;
use flate2::write::GzEncoder;
use log::error;
use serde::Serialize;

use crate::records::*;
use crate::serde::binary;
use crate::serde::schema::{RecordFormat, record_format};

pub const FILE_TYPE: &str = "FileType: BinaryLegionProf v: 1.0";

fn format_of<R: WireRecord>() -> crate::serde::Result<RecordFormat> {
    record_format(R::KIND.into(), R::KIND.name(), &R::default())
}

/// Format lines for every record this crate can write, in id order.
pub fn record_formats() -> crate::serde::Result<Vec<RecordFormat>> {
    let mut formats = vec![
        format_of::<MapperName>()?,
        format_of::<MapperCallDesc>()?,
        format_of::<RuntimeCallDesc>()?,
        format_of::<MetaDesc>()?,
        format_of::<OpDesc>()?,
        format_of::<ProcDesc>()?,
        format_of::<MemDesc>()?,
        format_of::<MaxDimDesc>()?,
        format_of::<RuntimeConfig>()?,
        format_of::<MachineDesc>()?,
        format_of::<TaskKind>()?,
        format_of::<TaskVariant>()?,
        format_of::<OperationInstance>()?,
        format_of::<MultiTask>()?,
        format_of::<SliceOwner>()?,
        format_of::<TaskWaitInfo>()?,
        format_of::<MetaWaitInfo>()?,
        format_of::<TaskInfo>()?,
        format_of::<MetaInfo>()?,
        format_of::<CopyInfo>()?,
        format_of::<FillInfo>()?,
        format_of::<InstTimelineInfo>()?,
        format_of::<PartitionInfo>()?,
        format_of::<MessageInfo>()?,
        format_of::<MapperCallInfo>()?,
        format_of::<RuntimeCallInfo>()?,
        format_of::<ApplicationCallInfo>()?,
        record_format(
            RecordKind::ImplicitTaskInfo.into(),
            RecordKind::ImplicitTaskInfo.name(),
            &TaskInfo::default(),
        )?,
        format_of::<GPUTaskInfo>()?,
        format_of::<ProcMemDesc>()?,
        format_of::<CopyInstInfo>()?,
        format_of::<FillInstInfo>()?,
        format_of::<BacktraceDesc>()?,
        format_of::<EventWaitInfo>()?,
        format_of::<EventMergerChunk>()?,
        format_of::<EventTriggerInfo>()?,
        format_of::<EventPoisonInfo>()?,
        format_of::<BarrierArrivalInfo>()?,
        format_of::<ReservationAcquireInfo>()?,
        format_of::<InstanceReadyInfo>()?,
        format_of::<InstanceRedistrictInfo>()?,
        format_of::<CompletionQueueChunk>()?,
        format_of::<ProfTaskInfo>()?,
        format_of::<ZeroTime>()?,
        format_of::<CalibrationErr>()?,
        format_of::<Provenance>()?,
    ];
    formats.sort_by_key(|f| f.id);
    Ok(formats)
}

/// Gzipped binary log. Not thread-safe: callers serialize access through
/// the owning [`super::Serializer`].
///
/// Write failures are latched rather than returned so that recording never
/// blocks on I/O errors; the first one is reported by [`finish`].
///
/// [`finish`]: BinarySerializer::finish
pub struct BinarySerializer {
    writer: GzEncoder<Box<dyn Write + Send>>,
    buffer: Vec<u8>,
    error: Option<io::Error>,
}

impl BinarySerializer {
    pub fn new(output: Box<dyn Write + Send>) -> io::Result<Self> {
        let mut serializer = BinarySerializer {
            writer: GzEncoder::new(output, Compression::default()),
            buffer: Vec::new(),
            error: None,
        };
        serializer.write_header()?;
        Ok(serializer)
    }

    fn write_header(&mut self) -> io::Result<()> {
        let formats = record_formats().map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writeln!(self.writer, "{}", FILE_TYPE)?;
        for format in formats {
            writeln!(self.writer, "{}", format)?;
        }
        writeln!(self.writer)
    }

    fn latch(&mut self, err: io::Error) {
        error!("profiling log write failed, dropping further records: {}", err);
        self.error = Some(err);
    }

    /// Flushes the compressed stream. Returns the first error seen since
    /// the log was opened.
    pub fn finish(&mut self) -> io::Result<()> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        self.writer.try_finish()?;
        self.writer.get_mut().flush()
    }
}

impl RecordSink for BinarySerializer {
    fn write_as<R: Serialize>(&mut self, kind: RecordKind, record: &R) {
        if self.error.is_some() {
            return;
        }
        self.buffer.clear();
        self.buffer.extend_from_slice(&u32::from(kind).to_le_bytes());
        if let Err(err) = binary::to_bytes(record, &mut self.buffer) {
            self.latch(io::Error::new(io::ErrorKind::InvalidData, err));
            return;
        }
        if let Err(err) = self.writer.write_all(&self.buffer) {
            self.latch(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    #[test]
    fn test_formats_unique_and_sorted() {
        let formats = record_formats().unwrap();
        let ids: BTreeSet<_> = formats.iter().map(|f| f.id).collect();
        assert_eq!(ids.len(), formats.len());
        assert!(formats.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn test_task_info_format() {
        let formats = record_formats().unwrap();
        let task = formats.iter().find(|f| f.name == "TaskInfo").unwrap();
        assert_eq!(
            task.to_string(),
            "TaskInfo {id:18, op_id:UniqueID:8, task_id:TaskID:4, variant_id:VariantID:4, \
             proc_id:ProcID:8, create:timestamp_t:8, ready:timestamp_t:8, start:timestamp_t:8, \
             stop:timestamp_t:8, creator:LgEvent:8, critical:LgEvent:8, fevent:LgEvent:8}"
        );
        let proc = formats.iter().find(|f| f.name == "ProcDesc").unwrap();
        assert_eq!(
            proc.to_string(),
            "ProcDesc {id:6, proc_id:ProcID:8, kind:int:4}"
        );
    }

    /// Accepts `remaining` bytes, then fails every write.
    struct FailAfter {
        remaining: usize,
    }

    impl Write for FailAfter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.remaining == 0 {
                return Err(io::Error::other("disk full"));
            }
            let n = buf.len().min(self.remaining);
            self.remaining -= n;
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_error_is_latched() {
        // Room for the gzip header only; the format lines stay buffered in
        // the compressor until real records push output through.
        let mut serializer = BinarySerializer::new(Box::new(FailAfter { remaining: 10 })).unwrap();
        let noisy = InstTimelineInfo {
            name: (0..1 << 20).map(|_| fastrand::alphanumeric()).collect(),
            ..Default::default()
        };
        for _ in 0..8 {
            serializer.write(&noisy);
        }
        assert!(serializer.error.is_some());
        assert!(serializer.finish().is_err());
    }
}
