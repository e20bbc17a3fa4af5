//! Reader for binary profiling logs.
//!
//! A log is a gzipped stream: a text header naming the file type and the
//! layout of every record id, a blank line, then binary frames of a
//! little-endian record id followed by the record's fields.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use log::debug;
use nom::{
    IResult,
    bytes::complete::{tag, take_till1, take_while1},
    character::complete::{i32 as text_i32, u32 as text_u32},
    combinator::map_res,
    multi::{many0, many1},
    number::complete::le_u32,
    sequence::preceded,
};
use serde::Serialize;

use crate::error::ProfError;
use crate::records::*;
use crate::serde::binary;
use crate::serde::schema::RecordFormat;
use crate::serializer::binary::{FILE_TYPE, record_formats};

/// One field of a format line as it appears in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub type_name: String,
    pub size: i32,
}

/// One format line as it appears in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLayout {
    pub id: u32,
    pub name: String,
    pub fields: Vec<FieldLayout>,
}

impl RecordLayout {
    fn matches(&self, known: &RecordFormat) -> bool {
        self.id == known.id
            && self.name == known.name
            && self.fields.len() == known.fields.len()
            && self.fields.iter().zip(&known.fields).all(|(a, b)| {
                a.name == b.name && a.type_name == b.type_name && a.size == b.size
            })
    }
}

macro_rules! records {
    ($($kind:ident => $ty:ty),* $(,)?) => {
        #[derive(Debug, Clone, PartialEq, Serialize)]
        pub enum Record {
            $($kind($ty),)*
        }

        impl Record {
            pub fn kind(&self) -> RecordKind {
                match self {
                    $(Record::$kind(_) => RecordKind::$kind,)*
                }
            }

            fn decode(kind: RecordKind, input: &[u8]) -> crate::serde::Result<(Record, &[u8])> {
                Ok(match kind {
                    $(RecordKind::$kind => {
                        let (record, rest) = binary::from_bytes_partial::<$ty>(input)?;
                        (Record::$kind(record), rest)
                    })*
                })
            }
        }
    };
}

records! {
    MapperName => MapperName,
    MapperCallDesc => MapperCallDesc,
    RuntimeCallDesc => RuntimeCallDesc,
    MetaDesc => MetaDesc,
    OpDesc => OpDesc,
    ProcDesc => ProcDesc,
    MemDesc => MemDesc,
    MaxDimDesc => MaxDimDesc,
    RuntimeConfig => RuntimeConfig,
    MachineDesc => MachineDesc,
    TaskKind => TaskKind,
    TaskVariant => TaskVariant,
    OperationInstance => OperationInstance,
    MultiTask => MultiTask,
    SliceOwner => SliceOwner,
    TaskWaitInfo => TaskWaitInfo,
    MetaWaitInfo => MetaWaitInfo,
    TaskInfo => TaskInfo,
    MetaInfo => MetaInfo,
    CopyInfo => CopyInfo,
    FillInfo => FillInfo,
    InstTimelineInfo => InstTimelineInfo,
    PartitionInfo => PartitionInfo,
    MessageInfo => MessageInfo,
    MapperCallInfo => MapperCallInfo,
    RuntimeCallInfo => RuntimeCallInfo,
    ApplicationCallInfo => ApplicationCallInfo,
    ImplicitTaskInfo => TaskInfo,
    GPUTaskInfo => GPUTaskInfo,
    ProcMemDesc => ProcMemDesc,
    CopyInstInfo => CopyInstInfo,
    FillInstInfo => FillInstInfo,
    BacktraceDesc => BacktraceDesc,
    EventWaitInfo => EventWaitInfo,
    EventMergerInfo => EventMergerChunk,
    EventTriggerInfo => EventTriggerInfo,
    EventPoisonInfo => EventPoisonInfo,
    BarrierArrivalInfo => BarrierArrivalInfo,
    ReservationAcquireInfo => ReservationAcquireInfo,
    InstanceReadyInfo => InstanceReadyInfo,
    InstanceRedistrictInfo => InstanceRedistrictInfo,
    CompletionQueueInfo => CompletionQueueChunk,
    ProfTaskInfo => ProfTaskInfo,
    ZeroTime => ZeroTime,
    CalibrationErr => CalibrationErr,
    Provenance => Provenance,
}

///
/// Text parsers for the log file header
///

#[inline]
fn is_alphanumeric_underscore(chr: u8) -> bool {
    chr.is_ascii_alphanumeric() || chr == b'_'
}

fn newline(input: &[u8]) -> IResult<&[u8], ()> {
    let (input, _) = tag("\n")(input)?;
    Ok((input, ()))
}

fn parse_text_name(input: &[u8]) -> IResult<&[u8], String> {
    map_res(take_while1(is_alphanumeric_underscore), |name: &[u8]| {
        String::from_utf8(name.to_owned())
    })(input)
}

// Type names may contain spaces ("unsigned long long").
fn parse_text_type(input: &[u8]) -> IResult<&[u8], String> {
    map_res(take_till1(|c| c == b':' || c == b'\n'), |name: &[u8]| {
        String::from_utf8(name.to_owned())
    })(input)
}

fn parse_filetype(input: &[u8]) -> IResult<&[u8], ()> {
    let (input, _) = tag(FILE_TYPE)(input)?;
    newline(input)
}

fn parse_field_format(input: &[u8]) -> IResult<&[u8], FieldLayout> {
    let (input, name) = parse_text_name(input)?;
    let (input, _) = tag(":")(input)?;
    let (input, type_name) = parse_text_type(input)?;
    let (input, _) = tag(":")(input)?;
    let (input, size) = text_i32(input)?;
    Ok((
        input,
        FieldLayout {
            name,
            type_name,
            size,
        },
    ))
}

fn parse_record_format(input: &[u8]) -> IResult<&[u8], RecordLayout> {
    let (input, name) = parse_text_name(input)?;
    let (input, _) = tag(" {id:")(input)?;
    let (input, id) = text_u32(input)?;
    let (input, fields) = many0(preceded(tag(", "), parse_field_format))(input)?;
    let (input, _) = tag("}")(input)?;
    let (input, _) = newline(input)?;
    Ok((input, RecordLayout { id, name, fields }))
}

fn parse_header(input: &[u8]) -> IResult<&[u8], Vec<RecordLayout>> {
    let (input, _) = parse_filetype(input)?;
    let (input, layouts) = many1(parse_record_format)(input)?;
    let (input, _) = newline(input)?;
    Ok((input, layouts))
}

/// Checks the header against the layouts this crate decodes. Ids we do
/// not know are tolerated until a frame actually uses one.
fn check_layouts(layouts: &[RecordLayout]) -> Result<(), ProfError> {
    let known = record_formats()?;
    for layout in layouts {
        match known.iter().find(|format| format.id == layout.id) {
            Some(format) if layout.matches(format) => {}
            Some(format) => {
                return Err(ProfError::BadHeader(format!(
                    "record {} has layout \"{:?}\", expected \"{}\"",
                    layout.id, layout, format
                )));
            }
            None => debug!("log declares unknown record {} ({})", layout.id, layout.name),
        }
    }
    Ok(())
}

///
/// Binary frames
///

fn decode_frames(mut input: &[u8]) -> Result<Vec<Record>, ProfError> {
    let mut records = Vec::new();
    while !input.is_empty() {
        let (rest, id) =
            le_u32::<_, nom::error::Error<&[u8]>>(input).map_err(crate::serde::Error::from)?;
        let kind = RecordKind::try_from(id).map_err(|_| ProfError::UnknownRecord(id))?;
        let (record, rest) = Record::decode(kind, rest)?;
        records.push(record);
        input = rest;
    }
    Ok(records)
}

/// Decodes an uncompressed log.
pub fn parse(input: &[u8]) -> Result<(Vec<RecordLayout>, Vec<Record>), ProfError> {
    let (body, layouts) = parse_header(input)
        .map_err(|err| ProfError::BadHeader(format!("{:?}", err.map(|e| e.code))))?;
    check_layouts(&layouts)?;
    let records = decode_frames(body)?;
    Ok((layouts, records))
}

pub fn deserialize<P: AsRef<Path>>(path: P) -> Result<Vec<Record>, ProfError> {
    let mut gz = GzDecoder::new(File::open(path)?);
    let mut s = Vec::<u8>::new();
    gz.read_to_end(&mut s)?;
    let (_, records) = parse(&s)?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    use flate2::Compression;
    use flate2::write::GzEncoder;

    use crate::serializer::{BinarySerializer, SharedBuffer};
    use crate::state::{EventID, NodeID, OpID, ProcID, ProcKind, TaskID, Timestamp, VariantID};

    fn write_log(records: impl FnOnce(&mut BinarySerializer)) -> Vec<u8> {
        let buffer = SharedBuffer::default();
        let mut serializer = BinarySerializer::new(Box::new(buffer.clone())).unwrap();
        records(&mut serializer);
        serializer.finish().unwrap();
        let compressed = buffer.0.lock().clone();
        let mut raw = Vec::new();
        GzDecoder::new(&compressed[..]).read_to_end(&mut raw).unwrap();
        raw
    }

    #[test]
    fn test_header_lists_every_record() {
        let raw = write_log(|_| {});
        let (layouts, records) = parse(&raw).unwrap();
        assert!(records.is_empty());
        assert_eq!(layouts.len(), record_formats().unwrap().len());
        let task = layouts.iter().find(|l| l.name == "TaskInfo").unwrap();
        assert_eq!(task.id, u32::from(RecordKind::TaskInfo));
        assert_eq!(task.fields[0].name, "op_id");
        assert_eq!(task.fields[0].type_name, "UniqueID");
    }

    #[test]
    fn test_read_back_records() {
        let task = TaskInfo {
            op_id: OpID(7),
            task_id: TaskID(3),
            variant_id: VariantID(1),
            proc_id: ProcID::new(NodeID(0), 1),
            create: Timestamp(10),
            ready: Timestamp(20),
            start: Timestamp(30),
            stop: Timestamp(40),
            creator: EventID::NO_EVENT,
            critical: EventID::NO_EVENT,
            fevent: EventID::make_event(NodeID(0), 5, 1),
            wait_intervals: Vec::new(),
        };
        let raw = write_log(|serializer| {
            serializer.write(&ProcDesc {
                proc_id: ProcID::new(NodeID(0), 1),
                kind: ProcKind::GPU,
            });
            serializer.write(&TaskKind {
                task_id: TaskID(3),
                overwrite: false,
                name: "stencil".to_owned(),
            });
            serializer.write(&task);
            serializer.write_as(RecordKind::ImplicitTaskInfo, &task);
        });
        let (_, records) = parse(&raw).unwrap();
        let kinds: Vec<_> = records.iter().map(Record::kind).collect();
        assert_eq!(
            kinds,
            vec![
                RecordKind::ProcDesc,
                RecordKind::TaskKind,
                RecordKind::TaskInfo,
                RecordKind::ImplicitTaskInfo
            ]
        );
        match &records[1] {
            Record::TaskKind(kind) => assert_eq!(kind.name, "stencil"),
            other => panic!("unexpected record {:?}", other),
        }
        assert_eq!(records[2], Record::TaskInfo(task.clone()));
        assert_eq!(records[3], Record::ImplicitTaskInfo(task));
    }

    #[test]
    fn test_rejects_foreign_layout() {
        let raw = write_log(|_| {});
        let text = String::from_utf8_lossy(&raw).replacen("TaskInfo {id:18, op_id:UniqueID", "TaskInfo {id:18, op_id:unsigned", 1);
        assert!(matches!(parse(text.as_bytes()), Err(ProfError::BadHeader(_))));
    }

    #[test]
    fn test_rejects_unknown_frame() {
        let mut raw = write_log(|_| {});
        raw.extend_from_slice(&40u32.to_le_bytes());
        assert!(matches!(parse(&raw), Err(ProfError::UnknownRecord(40))));
    }

    #[test]
    fn test_truncated_frame() {
        let mut raw = write_log(|serializer| {
            serializer.write(&CalibrationErr { calibration_err: 3 });
        });
        raw.truncate(raw.len() - 2);
        assert!(matches!(parse(&raw), Err(ProfError::Decode(_))));
    }

    #[test]
    fn test_deserialize_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prof_0.gz");
        let raw = write_log(|serializer| {
            serializer.write(&ZeroTime { zero_time: 42 });
        });
        let mut gz = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        gz.write_all(&raw).unwrap();
        gz.finish().unwrap();
        let records = deserialize(&path).unwrap();
        assert_eq!(records, vec![Record::ZeroTime(ZeroTime { zero_time: 42 })]);
    }
}
