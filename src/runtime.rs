//! Interfaces to the parts of the runtime the profiler observes but does
//! not own: the machine model, the event system and operation metadata.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;
use std::time::Instant;

use crate::measurement::ProfilingInfo;
use crate::records::RuntimeConfig;
use crate::reduction::{Arrival, ArrivalInfo};
use crate::state::{
    EventID, InstID, MemID, MemKind, NodeID, OpID, ProcID, ProcKind, ProvenanceID, TaskID,
};

/// Nanoseconds since the process-wide profiling epoch.
pub fn current_time_in_nanoseconds() -> i64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    i64::try_from(epoch.elapsed().as_nanos()).unwrap_or(i64::MAX)
}

pub fn current_time_in_microseconds() -> i64 {
    current_time_in_nanoseconds() / 1000
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProcMemAffinity {
    pub p: ProcID,
    pub m: MemID,
    pub bandwidth: u32,
    pub latency: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub hostname: String,
    pub host_id: u64,
    pub process_id: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BarrierState {
    Pending,
    Triggered,
    Poisoned,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct MessageChannel {
    pub ordered: bool,
    /// Channel the profiler uses for its own traffic.
    pub profiling: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProfilerMessageKind {
    EventTrigger,
    EventPoison,
}

pub trait Machine: Send + Sync {
    fn processor_kind(&self, proc: ProcID) -> ProcKind;
    fn memory_kind(&self, mem: MemID) -> MemKind;
    fn memory_capacity(&self, mem: MemID) -> u64;
    fn proc_mem_affinities(&self, proc: ProcID) -> Vec<ProcMemAffinity>;
    fn mem_proc_affinities(&self, mem: MemID) -> Vec<ProcMemAffinity>;
    fn local_processor_count(&self) -> u64;

    fn process_info(&self) -> ProcessInfo {
        ProcessInfo {
            process_id: std::process::id(),
            ..Default::default()
        }
    }
}

pub trait EventSystem: Send + Sync {
    fn create_triggered_event(&self) -> EventID;
    fn barrier_state(&self, barrier: EventID) -> BarrierState;
    /// Reduced arrival data of a triggered barrier generation.
    fn barrier_result(&self, barrier: EventID) -> Option<Arrival>;
    fn arrive(&self, barrier: EventID, count: u32, precondition: EventID, arrival: &ArrivalInfo);
    /// Runs `info` back through the profiler once `precondition` triggers.
    fn spawn_profiling_probe(&self, info: ProfilingInfo, precondition: EventID);
}

pub trait Runtime: Machine + EventSystem {
    fn address_space(&self) -> NodeID;
    fn total_address_spaces(&self) -> u32;
    fn get_unique_operation_id(&self) -> OpID;
    fn generate_dynamic_task_id(&self) -> TaskID;
    fn find_instance_name(&self, inst: InstID) -> Option<String>;
    fn message_channel(&self, message_kind: u32) -> MessageChannel;
    fn send_profiler_message(&self, target: NodeID, kind: ProfilerMessageKind, payload: Vec<u8>);

    fn zero_time(&self) -> i64 {
        0
    }
    fn calibration_error(&self) -> i64 {
        0
    }
    fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            debug: cfg!(debug_assertions),
            ..Default::default()
        }
    }
}

/// What the profiler needs to know about an operation when it is launched.
pub trait Operation {
    fn unique_id(&self) -> OpID;
    /// `None` for operations launched by the top-level task.
    fn parent_id(&self) -> Option<OpID>;
    fn kind(&self) -> u32;
    fn provenance(&self) -> Option<ProvenanceID>;
}

/// Return addresses of a captured stack. Hashing is cheap; symbolization
/// (`Display`) only happens the first time a stack is seen.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Backtrace {
    pcs: Vec<u64>,
}

impl Backtrace {
    pub fn new(pcs: Vec<u64>) -> Self {
        Backtrace { pcs }
    }

    pub fn hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.pcs.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, pc) in self.pcs.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "  [{}] {:#018x}", i, pc)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_monotonic() {
        let a = current_time_in_nanoseconds();
        let b = current_time_in_nanoseconds();
        assert!(a >= 0);
        assert!(b >= a);
    }

    #[test]
    fn test_backtrace_hash_and_display() {
        let a = Backtrace::new(vec![0x10, 0x20]);
        let b = Backtrace::new(vec![0x10, 0x20]);
        let c = Backtrace::new(vec![0x20, 0x10]);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(
            a.to_string(),
            "  [0] 0x0000000000000010\n  [1] 0x0000000000000020"
        );
    }
}
