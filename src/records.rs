//! Typed profiling records and their wire identities.
//!
//! Every record that reaches a log is a flat serde struct implementing
//! [`WireRecord`]. Buffered records that fan out into several wire records
//! (tasks with their waits, copies with their instance pairs, chunked
//! precondition lists) implement [`LogRecord`] by hand.

use std::mem;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::state::{
    BacktraceID, EventID, FieldID, InstID, MapperCallKindID, MapperID, MemID, MemKind, NodeID,
    OpID, ProcID, ProcKind, ProvenanceID, RuntimeCallKindID, TaskID, Timestamp, VariantID,
};

// Record ids are part of the log format: never renumber, only append.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum RecordKind {
    MapperName = 1,
    MapperCallDesc = 2,
    RuntimeCallDesc = 3,
    MetaDesc = 4,
    OpDesc = 5,
    ProcDesc = 6,
    MemDesc = 7,
    MaxDimDesc = 8,
    RuntimeConfig = 9,
    MachineDesc = 10,
    TaskKind = 11,
    TaskVariant = 12,
    OperationInstance = 13,
    MultiTask = 14,
    SliceOwner = 15,
    TaskWaitInfo = 16,
    MetaWaitInfo = 17,
    TaskInfo = 18,
    MetaInfo = 19,
    CopyInfo = 20,
    FillInfo = 21,
    InstTimelineInfo = 22,
    PartitionInfo = 23,
    MessageInfo = 24,
    MapperCallInfo = 25,
    RuntimeCallInfo = 26,
    ApplicationCallInfo = 27,
    ImplicitTaskInfo = 28,
    GPUTaskInfo = 29,
    ProcMemDesc = 30,
    // 31..=46 describe the region tree, which is recorded elsewhere
    CopyInstInfo = 47,
    FillInstInfo = 48,
    BacktraceDesc = 49,
    EventWaitInfo = 50,
    EventMergerInfo = 51,
    EventTriggerInfo = 52,
    EventPoisonInfo = 53,
    BarrierArrivalInfo = 54,
    ReservationAcquireInfo = 55,
    InstanceReadyInfo = 56,
    InstanceRedistrictInfo = 57,
    CompletionQueueInfo = 58,
    ProfTaskInfo = 59,
    ZeroTime = 60,
    CalibrationErr = 61,
    Provenance = 62,
}

impl RecordKind {
    pub const fn name(self) -> &'static str {
        match self {
            RecordKind::MapperName => "MapperName",
            RecordKind::MapperCallDesc => "MapperCallDesc",
            RecordKind::RuntimeCallDesc => "RuntimeCallDesc",
            RecordKind::MetaDesc => "MetaDesc",
            RecordKind::OpDesc => "OpDesc",
            RecordKind::ProcDesc => "ProcDesc",
            RecordKind::MemDesc => "MemDesc",
            RecordKind::MaxDimDesc => "MaxDimDesc",
            RecordKind::RuntimeConfig => "RuntimeConfig",
            RecordKind::MachineDesc => "MachineDesc",
            RecordKind::TaskKind => "TaskKind",
            RecordKind::TaskVariant => "TaskVariant",
            RecordKind::OperationInstance => "OperationInstance",
            RecordKind::MultiTask => "MultiTask",
            RecordKind::SliceOwner => "SliceOwner",
            RecordKind::TaskWaitInfo => "TaskWaitInfo",
            RecordKind::MetaWaitInfo => "MetaWaitInfo",
            RecordKind::TaskInfo => "TaskInfo",
            RecordKind::MetaInfo => "MetaInfo",
            RecordKind::CopyInfo => "CopyInfo",
            RecordKind::FillInfo => "FillInfo",
            RecordKind::InstTimelineInfo => "InstTimelineInfo",
            RecordKind::PartitionInfo => "PartitionInfo",
            RecordKind::MessageInfo => "MessageInfo",
            RecordKind::MapperCallInfo => "MapperCallInfo",
            RecordKind::RuntimeCallInfo => "RuntimeCallInfo",
            RecordKind::ApplicationCallInfo => "ApplicationCallInfo",
            RecordKind::ImplicitTaskInfo => "ImplicitTaskInfo",
            RecordKind::GPUTaskInfo => "GPUTaskInfo",
            RecordKind::ProcMemDesc => "ProcMDesc",
            RecordKind::CopyInstInfo => "CopyInstInfo",
            RecordKind::FillInstInfo => "FillInstInfo",
            RecordKind::BacktraceDesc => "BacktraceDesc",
            RecordKind::EventWaitInfo => "EventWaitInfo",
            RecordKind::EventMergerInfo => "EventMergerInfo",
            RecordKind::EventTriggerInfo => "EventTriggerInfo",
            RecordKind::EventPoisonInfo => "EventPoisonInfo",
            RecordKind::BarrierArrivalInfo => "BarrierArrivalInfo",
            RecordKind::ReservationAcquireInfo => "ReservationAcquireInfo",
            RecordKind::InstanceReadyInfo => "InstanceReadyInfo",
            RecordKind::InstanceRedistrictInfo => "InstanceRedistrictInfo",
            RecordKind::CompletionQueueInfo => "CompletionQueueInfo",
            RecordKind::ProfTaskInfo => "ProfTaskInfo",
            RecordKind::ZeroTime => "ZeroTime",
            RecordKind::CalibrationErr => "CalibrationErr",
            RecordKind::Provenance => "Provenance",
        }
    }
}

/// A flat record with a fixed field layout.
pub trait WireRecord: Serialize + DeserializeOwned + Default {
    const KIND: RecordKind;
}

/// Destination for wire records. Implemented by both log backends and by
/// the in-memory encoder used for remote messages.
pub trait RecordSink {
    fn write_as<R: Serialize>(&mut self, kind: RecordKind, record: &R);

    fn write<R: WireRecord>(&mut self, record: &R) {
        self.write_as(R::KIND, record)
    }
}

/// Anything that can be handed to a serializer.
pub trait LogRecord {
    fn emit<S: RecordSink>(&self, sink: &mut S);
}

/// Bytes a buffered record holds on to until it is drained. The same value
/// is charged when the record is appended and credited when it is written.
pub trait Footprint {
    fn footprint(&self) -> usize {
        mem::size_of_val(self)
    }
}

macro_rules! wire_records {
    ($($ty:ident => $kind:ident),* $(,)?) => {
        $(
            impl WireRecord for $ty {
                const KIND: RecordKind = RecordKind::$kind;
            }
        )*
    };
}

macro_rules! flat_records {
    ($($ty:ident),* $(,)?) => {
        $(
            impl LogRecord for $ty {
                fn emit<S: RecordSink>(&self, sink: &mut S) {
                    sink.write(self)
                }
            }
        )*
    };
}

macro_rules! fixed_footprint {
    ($($ty:ident),* $(,)?) => {
        $(impl Footprint for $ty {})*
    };
}

///
/// Descriptors
///

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperName {
    pub mapper_id: MapperID,
    pub mapper_proc: ProcID,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperCallDesc {
    pub kind: MapperCallKindID,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCallDesc {
    pub kind: RuntimeCallKindID,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaDesc {
    pub kind: VariantID,
    pub message: bool,
    pub ordered_vc: bool,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpDesc {
    pub kind: u32,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaxDimDesc {
    pub max_dim: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub debug: bool,
    pub spy: bool,
    pub gc: bool,
    pub inorder: bool,
    pub safe_mapper: bool,
    pub safe_runtime: bool,
    pub safe_ctrlrepl: bool,
    pub part_checks: bool,
    pub bounds_checks: bool,
    pub resilient: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineDesc {
    pub node_id: NodeID,
    pub num_nodes: u32,
    pub version: u32,
    pub hostname: String,
    pub host_id: u64,
    pub process_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZeroTime {
    pub zero_time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationErr {
    pub calibration_err: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub pid: ProvenanceID,
    pub provenance: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcDesc {
    pub proc_id: ProcID,
    pub kind: ProcKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemDesc {
    pub mem_id: MemID,
    pub kind: MemKind,
    pub capacity: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcMemDesc {
    pub proc_id: ProcID,
    pub mem_id: MemID,
    pub bandwidth: u32,
    pub latency: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskKind {
    pub task_id: TaskID,
    pub overwrite: bool,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskVariant {
    pub task_id: TaskID,
    pub variant_id: VariantID,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktraceDesc {
    pub backtrace_id: BacktraceID,
    pub backtrace: String,
}

///
/// Operation bookkeeping
///

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInstance {
    pub op_id: OpID,
    pub parent_id: OpID,
    pub kind: u32,
    pub provenance: ProvenanceID,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiTask {
    pub op_id: OpID,
    pub task_id: TaskID,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceOwner {
    pub parent_id: OpID,
    pub op_id: OpID,
}

///
/// Timed execution records
///

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitInfo {
    pub wait_start: Timestamp,
    pub wait_ready: Timestamp,
    pub wait_end: Timestamp,
    pub wait_event: EventID,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskWaitInfo {
    pub op_id: OpID,
    pub wait_start: Timestamp,
    pub wait_ready: Timestamp,
    pub wait_end: Timestamp,
    pub wait_event: EventID,
}

impl TaskWaitInfo {
    pub fn new(op_id: OpID, wait: &WaitInfo) -> Self {
        TaskWaitInfo {
            op_id,
            wait_start: wait.wait_start,
            wait_ready: wait.wait_ready,
            wait_end: wait.wait_end,
            wait_event: wait.wait_event,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaWaitInfo {
    pub op_id: OpID,
    pub lg_id: VariantID,
    pub wait_start: Timestamp,
    pub wait_ready: Timestamp,
    pub wait_end: Timestamp,
    pub wait_event: EventID,
}

impl MetaWaitInfo {
    pub fn new(op_id: OpID, lg_id: VariantID, wait: &WaitInfo) -> Self {
        MetaWaitInfo {
            op_id,
            lg_id,
            wait_start: wait.wait_start,
            wait_ready: wait.wait_ready,
            wait_end: wait.wait_end,
            wait_event: wait.wait_event,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub op_id: OpID,
    pub task_id: TaskID,
    pub variant_id: VariantID,
    pub proc_id: ProcID,
    pub create: Timestamp,
    pub ready: Timestamp,
    pub start: Timestamp,
    pub stop: Timestamp,
    pub creator: EventID,
    pub critical: EventID,
    pub fevent: EventID,
    #[serde(skip)]
    pub wait_intervals: Vec<WaitInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GPUTaskInfo {
    pub op_id: OpID,
    pub task_id: TaskID,
    pub variant_id: VariantID,
    pub proc_id: ProcID,
    pub create: Timestamp,
    pub ready: Timestamp,
    pub start: Timestamp,
    pub stop: Timestamp,
    pub gpu_start: Timestamp,
    pub gpu_stop: Timestamp,
    pub creator: EventID,
    pub critical: EventID,
    pub fevent: EventID,
    #[serde(skip)]
    pub wait_intervals: Vec<WaitInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaInfo {
    pub op_id: OpID,
    pub lg_id: VariantID,
    pub proc_id: ProcID,
    pub create: Timestamp,
    pub ready: Timestamp,
    pub start: Timestamp,
    pub stop: Timestamp,
    pub creator: EventID,
    pub critical: EventID,
    pub fevent: EventID,
    #[serde(skip)]
    pub wait_intervals: Vec<WaitInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub op_id: OpID,
    pub lg_id: VariantID,
    pub proc_id: ProcID,
    pub spawn: Timestamp,
    pub create: Timestamp,
    pub ready: Timestamp,
    pub start: Timestamp,
    pub stop: Timestamp,
    pub creator: EventID,
    pub critical: EventID,
    pub fevent: EventID,
    #[serde(skip)]
    pub wait_intervals: Vec<WaitInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyInstInfo {
    pub src: MemID,
    pub dst: MemID,
    pub src_fid: FieldID,
    pub dst_fid: FieldID,
    pub src_inst: InstID,
    pub dst_inst: InstID,
    pub fevent: EventID,
    pub num_hops: u32,
    pub indirect: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyInfo {
    pub op_id: OpID,
    pub size: u64,
    pub create: Timestamp,
    pub ready: Timestamp,
    pub start: Timestamp,
    pub stop: Timestamp,
    pub creator: EventID,
    pub critical: EventID,
    pub fevent: EventID,
    pub collective: u32,
    #[serde(skip)]
    pub inst_infos: Vec<CopyInstInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillInstInfo {
    pub dst: MemID,
    pub fid: FieldID,
    pub dst_inst: InstID,
    pub fevent: EventID,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FillInfo {
    pub op_id: OpID,
    pub size: u64,
    pub create: Timestamp,
    pub ready: Timestamp,
    pub start: Timestamp,
    pub stop: Timestamp,
    pub creator: EventID,
    pub critical: EventID,
    pub fevent: EventID,
    #[serde(skip)]
    pub inst_infos: Vec<FillInstInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstTimelineInfo {
    pub inst_id: InstID,
    pub mem_id: MemID,
    pub size: u64,
    pub op_id: OpID,
    pub create: Timestamp,
    pub ready: Timestamp,
    pub destroy: Timestamp,
    pub creator: EventID,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub op_id: OpID,
    pub part_op: i32,
    pub create: Timestamp,
    pub ready: Timestamp,
    pub start: Timestamp,
    pub stop: Timestamp,
    pub creator: EventID,
    pub critical: EventID,
    pub fevent: EventID,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapperCallInfo {
    pub mapper: MapperID,
    pub mapper_proc: ProcID,
    pub kind: MapperCallKindID,
    pub op_id: OpID,
    pub start: Timestamp,
    pub stop: Timestamp,
    pub proc_id: ProcID,
    pub fevent: EventID,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeCallInfo {
    pub kind: RuntimeCallKindID,
    pub start: Timestamp,
    pub stop: Timestamp,
    pub proc_id: ProcID,
    pub fevent: EventID,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationCallInfo {
    pub pid: ProvenanceID,
    pub start: Timestamp,
    pub stop: Timestamp,
    pub proc_id: ProcID,
    pub fevent: EventID,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfTaskInfo {
    pub proc_id: ProcID,
    pub op_id: OpID,
    pub start: Timestamp,
    pub stop: Timestamp,
    pub creator: EventID,
    pub fevent: EventID,
    pub completion: bool,
}

///
/// Event graph records
///

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventWaitInfo {
    pub proc_id: ProcID,
    pub fevent: EventID,
    pub event: EventID,
    pub backtrace_id: BacktraceID,
}

/// Merged event with an arbitrary number of preconditions. Written as
/// [`EventMergerChunk`]s of four.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventMergerInfo {
    pub result: EventID,
    pub fevent: EventID,
    pub performed: Timestamp,
    pub preconditions: Vec<EventID>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMergerChunk {
    pub result: EventID,
    pub fevent: EventID,
    pub performed: Timestamp,
    pub pre0: EventID,
    pub pre1: EventID,
    pub pre2: EventID,
    pub pre3: EventID,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTriggerInfo {
    pub result: EventID,
    pub fevent: EventID,
    pub precondition: EventID,
    pub performed: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPoisonInfo {
    pub result: EventID,
    pub fevent: EventID,
    pub performed: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierArrivalInfo {
    pub result: EventID,
    pub fevent: EventID,
    pub precondition: EventID,
    pub performed: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationAcquireInfo {
    pub result: EventID,
    pub fevent: EventID,
    pub precondition: EventID,
    pub performed: Timestamp,
    pub reservation: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceReadyInfo {
    pub result: EventID,
    pub precondition: EventID,
    pub unique: EventID,
    pub performed: Timestamp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRedistrictInfo {
    pub result: EventID,
    pub precondition: EventID,
    pub previous: EventID,
    pub next: EventID,
    pub performed: Timestamp,
}

/// Completion queue with an arbitrary number of preconditions. Written as
/// [`CompletionQueueChunk`]s of four.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionQueueInfo {
    pub result: EventID,
    pub fevent: EventID,
    pub performed: Timestamp,
    pub preconditions: Vec<EventID>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionQueueChunk {
    pub result: EventID,
    pub fevent: EventID,
    pub performed: Timestamp,
    pub pre0: EventID,
    pub pre1: EventID,
    pub pre2: EventID,
    pub pre3: EventID,
}

/// A task info written under the implicit-task record id.
pub struct Implicit<'a>(pub &'a TaskInfo);

wire_records! {
    MapperName => MapperName,
    MapperCallDesc => MapperCallDesc,
    RuntimeCallDesc => RuntimeCallDesc,
    MetaDesc => MetaDesc,
    OpDesc => OpDesc,
    MaxDimDesc => MaxDimDesc,
    RuntimeConfig => RuntimeConfig,
    MachineDesc => MachineDesc,
    ZeroTime => ZeroTime,
    CalibrationErr => CalibrationErr,
    Provenance => Provenance,
    ProcDesc => ProcDesc,
    MemDesc => MemDesc,
    ProcMemDesc => ProcMemDesc,
    TaskKind => TaskKind,
    TaskVariant => TaskVariant,
    BacktraceDesc => BacktraceDesc,
    OperationInstance => OperationInstance,
    MultiTask => MultiTask,
    SliceOwner => SliceOwner,
    TaskWaitInfo => TaskWaitInfo,
    MetaWaitInfo => MetaWaitInfo,
    TaskInfo => TaskInfo,
    GPUTaskInfo => GPUTaskInfo,
    MetaInfo => MetaInfo,
    MessageInfo => MessageInfo,
    CopyInfo => CopyInfo,
    CopyInstInfo => CopyInstInfo,
    FillInfo => FillInfo,
    FillInstInfo => FillInstInfo,
    InstTimelineInfo => InstTimelineInfo,
    PartitionInfo => PartitionInfo,
    MapperCallInfo => MapperCallInfo,
    RuntimeCallInfo => RuntimeCallInfo,
    ApplicationCallInfo => ApplicationCallInfo,
    ProfTaskInfo => ProfTaskInfo,
    EventWaitInfo => EventWaitInfo,
    EventMergerChunk => EventMergerInfo,
    EventTriggerInfo => EventTriggerInfo,
    EventPoisonInfo => EventPoisonInfo,
    BarrierArrivalInfo => BarrierArrivalInfo,
    ReservationAcquireInfo => ReservationAcquireInfo,
    InstanceReadyInfo => InstanceReadyInfo,
    InstanceRedistrictInfo => InstanceRedistrictInfo,
    CompletionQueueChunk => CompletionQueueInfo,
}

flat_records! {
    MapperName,
    MapperCallDesc,
    RuntimeCallDesc,
    MetaDesc,
    OpDesc,
    MaxDimDesc,
    RuntimeConfig,
    MachineDesc,
    ZeroTime,
    CalibrationErr,
    Provenance,
    ProcDesc,
    MemDesc,
    ProcMemDesc,
    TaskKind,
    TaskVariant,
    BacktraceDesc,
    OperationInstance,
    MultiTask,
    SliceOwner,
    TaskWaitInfo,
    MetaWaitInfo,
    InstTimelineInfo,
    PartitionInfo,
    MapperCallInfo,
    RuntimeCallInfo,
    ApplicationCallInfo,
    ProfTaskInfo,
    EventWaitInfo,
    EventTriggerInfo,
    EventPoisonInfo,
    BarrierArrivalInfo,
    ReservationAcquireInfo,
    InstanceReadyInfo,
    InstanceRedistrictInfo,
}

fixed_footprint! {
    OperationInstance,
    MultiTask,
    SliceOwner,
    PartitionInfo,
    MapperCallInfo,
    RuntimeCallInfo,
    ApplicationCallInfo,
    ProfTaskInfo,
    EventWaitInfo,
    EventTriggerInfo,
    EventPoisonInfo,
    BarrierArrivalInfo,
    ReservationAcquireInfo,
    InstanceReadyInfo,
    InstanceRedistrictInfo,
}

impl LogRecord for TaskInfo {
    fn emit<S: RecordSink>(&self, sink: &mut S) {
        sink.write(self);
        for wait in &self.wait_intervals {
            sink.write(&TaskWaitInfo::new(self.op_id, wait));
        }
    }
}

impl LogRecord for Implicit<'_> {
    fn emit<S: RecordSink>(&self, sink: &mut S) {
        sink.write_as(RecordKind::ImplicitTaskInfo, self.0);
        for wait in &self.0.wait_intervals {
            sink.write(&TaskWaitInfo::new(self.0.op_id, wait));
        }
    }
}

impl LogRecord for GPUTaskInfo {
    fn emit<S: RecordSink>(&self, sink: &mut S) {
        sink.write(self);
        for wait in &self.wait_intervals {
            sink.write(&TaskWaitInfo::new(self.op_id, wait));
        }
    }
}

impl LogRecord for MetaInfo {
    fn emit<S: RecordSink>(&self, sink: &mut S) {
        sink.write(self);
        for wait in &self.wait_intervals {
            sink.write(&MetaWaitInfo::new(self.op_id, self.lg_id, wait));
        }
    }
}

impl LogRecord for MessageInfo {
    fn emit<S: RecordSink>(&self, sink: &mut S) {
        sink.write(self);
        for wait in &self.wait_intervals {
            sink.write(&MetaWaitInfo::new(self.op_id, self.lg_id, wait));
        }
    }
}

impl LogRecord for CopyInfo {
    fn emit<S: RecordSink>(&self, sink: &mut S) {
        sink.write(self);
        for inst in &self.inst_infos {
            sink.write(inst);
        }
    }
}

impl LogRecord for FillInfo {
    fn emit<S: RecordSink>(&self, sink: &mut S) {
        sink.write(self);
        for inst in &self.inst_infos {
            sink.write(inst);
        }
    }
}

// An empty list still produces one chunk so the result event is logged.
fn precondition_chunks(preconditions: &[EventID]) -> impl Iterator<Item = [EventID; 4]> + '_ {
    let empty = preconditions
        .is_empty()
        .then_some([EventID::NO_EVENT; 4]);
    preconditions
        .chunks(4)
        .map(|chunk| {
            let mut pre = [EventID::NO_EVENT; 4];
            pre[..chunk.len()].copy_from_slice(chunk);
            pre
        })
        .chain(empty)
}

impl LogRecord for EventMergerInfo {
    fn emit<S: RecordSink>(&self, sink: &mut S) {
        for [pre0, pre1, pre2, pre3] in precondition_chunks(&self.preconditions) {
            sink.write(&EventMergerChunk {
                result: self.result,
                fevent: self.fevent,
                performed: self.performed,
                pre0,
                pre1,
                pre2,
                pre3,
            });
        }
    }
}

impl LogRecord for CompletionQueueInfo {
    fn emit<S: RecordSink>(&self, sink: &mut S) {
        for [pre0, pre1, pre2, pre3] in precondition_chunks(&self.preconditions) {
            sink.write(&CompletionQueueChunk {
                result: self.result,
                fevent: self.fevent,
                performed: self.performed,
                pre0,
                pre1,
                pre2,
                pre3,
            });
        }
    }
}

impl Footprint for TaskInfo {
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.wait_intervals.len() * mem::size_of::<WaitInfo>()
    }
}

impl Footprint for GPUTaskInfo {
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.wait_intervals.len() * mem::size_of::<WaitInfo>()
    }
}

impl Footprint for MetaInfo {
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.wait_intervals.len() * mem::size_of::<WaitInfo>()
    }
}

impl Footprint for MessageInfo {
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.wait_intervals.len() * mem::size_of::<WaitInfo>()
    }
}

impl Footprint for CopyInfo {
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.inst_infos.len() * mem::size_of::<CopyInstInfo>()
    }
}

impl Footprint for FillInfo {
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.inst_infos.len() * mem::size_of::<FillInstInfo>()
    }
}

impl Footprint for InstTimelineInfo {
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.name.len() + 1
    }
}

impl Footprint for EventMergerInfo {
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.preconditions.len() * mem::size_of::<EventID>()
    }
}

impl Footprint for CompletionQueueInfo {
    fn footprint(&self) -> usize {
        mem::size_of::<Self>() + self.preconditions.len() * mem::size_of::<EventID>()
    }
}
