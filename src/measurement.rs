//! Correlation tags attached to profiled work and the measurements the
//! runtime hands back when that work completes.

use std::fmt;
use std::sync::Arc;

use log::warn;

use crate::records::WaitInfo;
use crate::state::{EventID, FieldID, InstID, MemID, OpID, ProcID, Timestamp};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ProfilingKind {
    Task,
    Meta,
    Message,
    Copy,
    Fill,
    Inst,
    Partition,
    Arrival,
    Barrier,
}

impl ProfilingKind {
    pub const COUNT: usize = 9;

    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Resolves the unique name of a physical instance touched by a copy or
/// fill. One closure is shared by every response of the request that
/// created it and is dropped with the last of them.
pub trait InstanceNameClosure: fmt::Debug + Send + Sync {
    fn find_instance_name(&self, inst: PhysicalInstance) -> InstID;
}

/// Name table for copies and fills that touch a handful of instances.
#[derive(Debug, Default)]
pub struct SmallNameClosure {
    entries: Vec<(PhysicalInstance, InstID)>,
}

impl SmallNameClosure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_instance_name(&mut self, inst: PhysicalInstance, name: InstID) {
        match self.entries.iter().find(|(i, _)| *i == inst) {
            Some((_, existing)) => debug_assert_eq!(*existing, name),
            None => self.entries.push((inst, name)),
        }
    }
}

impl InstanceNameClosure for SmallNameClosure {
    fn find_instance_name(&self, inst: PhysicalInstance) -> InstID {
        match self.entries.iter().find(|(i, _)| *i == inst) {
            Some((_, name)) => *name,
            None => {
                warn!("no name recorded for instance {:#x}", inst.id);
                InstID::default()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ProfilingExtra {
    None,
    /// Variant of a task, or arrival count of a barrier arrival.
    Id2(u64),
    SpawnTime(Timestamp),
    Closure(Arc<dyn InstanceNameClosure>),
}

impl ProfilingExtra {
    pub fn id2(&self) -> u64 {
        match self {
            ProfilingExtra::Id2(id2) => *id2,
            _ => 0,
        }
    }

    pub fn spawn_time(&self) -> Timestamp {
        match self {
            ProfilingExtra::SpawnTime(time) => *time,
            _ => Timestamp::default(),
        }
    }

    pub fn closure(&self) -> Option<&Arc<dyn InstanceNameClosure>> {
        match self {
            ProfilingExtra::Closure(closure) => Some(closure),
            _ => None,
        }
    }
}

/// Tag carried by a profiling request and returned with its response.
///
/// `id` depends on the kind: the task id for tasks, the meta-task or
/// message id, the collective kind for copies and fills, the unique event
/// of an instance, the partition operation kind, or the barrier itself.
#[derive(Debug, Clone)]
pub struct ProfilingInfo {
    pub kind: ProfilingKind,
    pub op_id: OpID,
    pub id: u64,
    pub extra: ProfilingExtra,
    pub creator: EventID,
    pub critical: EventID,
}

/// All times are nanoseconds on the runtime clock.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct OperationTimeline {
    pub create_time: i64,
    pub ready_time: i64,
    pub start_time: i64,
    pub end_time: i64,
    /// Includes asynchronous work launched by the operation.
    pub complete_time: i64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct OperationTimelineGPU {
    pub start_time: i64,
    pub end_time: i64,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct OperationMemoryUsage {
    pub source: Option<MemID>,
    pub target: MemID,
    pub size: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PhysicalInstance {
    pub id: u64,
    pub location: MemID,
}

/// One batch of instances moved by a copy or written by a fill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyInstanceInfo {
    pub src_insts: Vec<PhysicalInstance>,
    pub dst_insts: Vec<PhysicalInstance>,
    pub src_indirection_inst: Option<PhysicalInstance>,
    pub dst_indirection_inst: Option<PhysicalInstance>,
    pub src_fields: Vec<FieldID>,
    pub dst_fields: Vec<FieldID>,
    pub src_indirection_field: FieldID,
    pub dst_indirection_field: FieldID,
    pub num_hops: u32,
}

impl CopyInstanceInfo {
    pub fn is_indirect(&self) -> bool {
        self.src_indirection_inst.is_some() || self.dst_indirection_inst.is_some()
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct InstanceTimeline {
    pub create_time: i64,
    pub ready_time: i64,
    pub delete_time: i64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct InstanceMemoryUsage {
    pub instance: InstID,
    pub memory: MemID,
    pub bytes: u64,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    CompletedSuccessfully,
    CompletedWithErrors,
    Cancelled,
    Aborted,
}

/// Measurements delivered with a completed request. Anything the runtime
/// could not measure is `None`.
#[derive(Debug, Clone, Default)]
pub struct ProfilingResponse {
    pub timeline: Option<OperationTimeline>,
    pub gpu_timeline: Option<OperationTimelineGPU>,
    pub event_waits: Vec<WaitInfo>,
    pub proc_usage: Option<ProcID>,
    pub mem_usage: Option<OperationMemoryUsage>,
    pub copy_info: Vec<CopyInstanceInfo>,
    pub finish_event: Option<EventID>,
    pub alloc_success: Option<bool>,
    pub inst_timeline: Option<InstanceTimeline>,
    pub inst_usage: Option<InstanceMemoryUsage>,
    pub status: Option<OperationStatus>,
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::state::NodeID;

    #[test]
    fn test_small_closure() {
        let a = PhysicalInstance {
            id: 1,
            location: MemID::new(NodeID(0), 1),
        };
        let b = PhysicalInstance {
            id: 2,
            location: MemID::new(NodeID(0), 1),
        };
        let mut closure = SmallNameClosure::new();
        closure.record_instance_name(a, InstID(10));
        closure.record_instance_name(a, InstID(10));
        closure.record_instance_name(b, InstID(20));
        assert_eq!(closure.entries.len(), 2);
        assert_eq!(closure.find_instance_name(b), InstID(20));
        assert_eq!(
            closure.find_instance_name(PhysicalInstance {
                id: 3,
                location: MemID::default()
            }),
            InstID(0)
        );
    }

    #[test]
    fn test_closure_released_with_last_tag() {
        let closure: Arc<dyn InstanceNameClosure> = Arc::new(SmallNameClosure::new());
        let info = ProfilingInfo {
            kind: ProfilingKind::Copy,
            op_id: OpID(1),
            id: 0,
            extra: ProfilingExtra::Closure(closure.clone()),
            creator: EventID::NO_EVENT,
            critical: EventID::NO_EVENT,
        };
        let responses: Vec<_> = (0..3).map(|_| info.clone()).collect();
        drop(info);
        assert_eq!(Arc::strong_count(&closure), 4);
        drop(responses);
        assert_eq!(Arc::strong_count(&closure), 1);
    }
}
