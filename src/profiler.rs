//! The per-node profiling coordinator.
//!
//! [`LegionProfiler`] owns the output stream and everything that has to be
//! shared between recording contexts: the dedup tables for descriptors, the
//! footprint counter that drives early flushing, and the count of profiling
//! requests still in flight.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::ProfilerConfig;
use crate::counter::OutstandingRequests;
use crate::error::{ConfigError, ProfError};
use crate::instance::RecordingContext;
use crate::measurement::{
    InstanceNameClosure, OperationStatus, ProfilingExtra, ProfilingInfo, ProfilingKind,
    ProfilingResponse,
};
use crate::records::*;
use crate::remote::ProfilerMessage;
use crate::runtime::{Backtrace, Runtime, current_time_in_nanoseconds};
use crate::serializer::{Serializer, SerializerGuard};
use crate::state::{
    BacktraceID, EventID, MAX_PHASES, MapperCallKindID, MapperID, MemID, NodeID, OpID, ProcID,
    ProcKind, ProvenanceID, RuntimeCallKindID, TaskID, Timestamp, VariantID,
};

/// Shared handle to one recording context. The lock is uncontended: only
/// the thread running on the context's processor appends to it, and
/// `finalize` drains it after everything has quiesced.
pub type ContextRef = Arc<Mutex<RecordingContext>>;

const LEGION_PROF_VERSION: u32 = 1;
const MAX_DIM: i32 = 3;
const EXTERNAL_THREAD_NAME: &str = "External Thread";

/// Names the runtime reports once at startup.
#[derive(Debug, Clone, Default)]
pub struct RuntimeDescriptions {
    pub meta_tasks: Vec<String>,
    pub message_kinds: Vec<String>,
    pub operation_kinds: Vec<String>,
}

/// What the caller needs to know after a response has been recorded.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ResponseOutcome {
    pub failed_alloc: bool,
    /// Event the response was attributed to.
    pub fevent: EventID,
}

#[derive(Debug, Copy, Clone)]
struct ExternalThreads {
    proc: ProcID,
    task: TaskID,
}

#[derive(Default)]
struct Tables {
    recorded_processors: Vec<ProcID>,
    recorded_memories: Vec<MemID>,
    backtrace_ids: BTreeMap<u64, BacktraceID>,
    next_backtrace_id: u64,
    // (creator node, barrier index) -> last generation recorded
    recorded_barriers: BTreeMap<(NodeID, u64), u64>,
    // renamed message fevent -> original, and back again once the
    // message has run
    message_fevents: BTreeMap<EventID, EventID>,
    processor_instances: BTreeMap<ProcID, ContextRef>,
}

/// How hard to push a drain once the footprint is over its threshold.
pub fn drain_scale(footprint: usize, threshold: usize) -> f64 {
    if threshold == 0 {
        (1u64 << 20) as f64
    } else {
        let ratio = footprint as f64 / threshold as f64;
        ratio * ratio
    }
}

pub struct LegionProfiler {
    runtime: Arc<dyn Runtime>,
    config: ProfilerConfig,
    serializer: Serializer,
    num_meta_tasks: u32,
    total_memory_footprint: AtomicUsize,
    outstanding: OutstandingRequests,
    tables: RwLock<Tables>,
    instances: Mutex<Vec<ContextRef>>,
    external: OnceLock<ExternalThreads>,
    finalized: AtomicBool,
}

impl LegionProfiler {
    /// Opens this node's log and writes the machine and runtime
    /// descriptors to it.
    pub fn new(
        runtime: Arc<dyn Runtime>,
        config: ProfilerConfig,
        descriptions: &RuntimeDescriptions,
    ) -> Result<Self, ConfigError> {
        let serializer = Serializer::open(
            &config,
            runtime.address_space(),
            runtime.total_address_spaces(),
        )?;
        Ok(Self::with_serializer(runtime, config, descriptions, serializer))
    }

    pub fn with_serializer(
        runtime: Arc<dyn Runtime>,
        config: ProfilerConfig,
        descriptions: &RuntimeDescriptions,
        serializer: Serializer,
    ) -> Self {
        let node = runtime.address_space();
        let total = runtime.total_address_spaces();
        let next_backtrace_id = if node.0 == 0 { total as u64 } else { node.0 };
        let profiler = LegionProfiler {
            num_meta_tasks: descriptions.meta_tasks.len() as u32,
            runtime,
            config,
            serializer,
            total_memory_footprint: AtomicUsize::new(0),
            outstanding: OutstandingRequests::new(),
            tables: RwLock::new(Tables {
                next_backtrace_id,
                ..Default::default()
            }),
            instances: Mutex::new(Vec::new()),
            external: OnceLock::new(),
            finalized: AtomicBool::new(false),
        };
        profiler.write_preamble(descriptions);
        profiler
    }

    fn write_preamble(&self, descriptions: &RuntimeDescriptions) {
        let node = self.runtime.address_space();
        let process = self.runtime.process_info();
        let mut guard = self.serializer.lock();
        guard.serialize(&MachineDesc {
            node_id: node,
            num_nodes: self.runtime.total_address_spaces(),
            version: LEGION_PROF_VERSION,
            hostname: process.hostname,
            host_id: process.host_id,
            process_id: process.process_id,
        });
        guard.serialize(&ZeroTime {
            zero_time: self.runtime.zero_time(),
        });
        for (idx, name) in descriptions.meta_tasks.iter().enumerate() {
            guard.serialize(&MetaDesc {
                kind: VariantID(idx as u32),
                message: false,
                ordered_vc: false,
                name: name.clone(),
            });
        }
        for (idx, name) in descriptions.message_kinds.iter().enumerate() {
            let channel = self.runtime.message_channel(idx as u32);
            guard.serialize(&MetaDesc {
                kind: VariantID(self.num_meta_tasks + idx as u32),
                message: true,
                ordered_vc: channel.ordered,
                name: name.clone(),
            });
        }
        for (kind, name) in descriptions.operation_kinds.iter().enumerate() {
            guard.serialize(&OpDesc {
                kind: kind as u32,
                name: name.clone(),
            });
        }
        guard.serialize(&MaxDimDesc { max_dim: MAX_DIM });
        guard.serialize(&self.runtime.runtime_config());
    }

    pub fn runtime(&self) -> &dyn Runtime {
        &*self.runtime
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn minimum_call_threshold(&self) -> Timestamp {
        self.config.minimum_call_threshold()
    }

    pub fn num_meta_tasks(&self) -> u32 {
        self.num_meta_tasks
    }

    /// Bytes currently buffered across all contexts.
    pub fn footprint(&self) -> usize {
        self.total_memory_footprint.load(Ordering::Acquire)
    }

    pub fn outstanding_requests(&self) -> usize {
        self.outstanding.outstanding()
    }

    ///
    /// Contexts
    ///

    /// Returns the context for `current`, creating it on first use. Threads
    /// that are not running on a processor get a context of their own, as
    /// does every use of an IO processor.
    pub fn find_or_create_profiling_instance(&self, current: Option<ProcID>) -> ContextRef {
        let (proc, external) = match current {
            Some(proc) => (proc, EventID::NO_EVENT),
            None => (
                self.get_implicit_processor(),
                self.runtime.create_triggered_event(),
            ),
        };
        let shared = !external.exists() && self.runtime.processor_kind(proc) != ProcKind::IO;
        if shared {
            if let Some(ctx) = self.tables.read().processor_instances.get(&proc) {
                return ctx.clone();
            }
        }
        if !external.exists() {
            self.record_processor(proc);
        }
        let ctx = Arc::new(Mutex::new(RecordingContext::new(proc, external)));
        if shared {
            match self.tables.write().processor_instances.entry(proc) {
                Entry::Occupied(entry) => return entry.get().clone(),
                Entry::Vacant(entry) => {
                    entry.insert(ctx.clone());
                }
            }
        }
        self.instances.lock().push(ctx.clone());
        ctx
    }

    fn external_threads(&self) -> ExternalThreads {
        *self.external.get_or_init(|| {
            let proc = ProcID::new(
                self.runtime.address_space(),
                self.runtime.local_processor_count(),
            );
            let task = self.runtime.generate_dynamic_task_id();
            let mut tables = self.tables.write();
            if let Err(index) = tables.recorded_processors.binary_search(&proc) {
                tables.recorded_processors.insert(index, proc);
            }
            let mut guard = self.serializer.lock();
            guard.serialize(&ProcDesc {
                proc_id: proc,
                kind: ProcKind::IO,
            });
            guard.serialize(&TaskKind {
                task_id: task,
                overwrite: true,
                name: EXTERNAL_THREAD_NAME.to_owned(),
            });
            guard.serialize(&TaskVariant {
                task_id: task,
                variant_id: VariantID(0),
                name: EXTERNAL_THREAD_NAME.to_owned(),
            });
            debug!("external threads run on {:#x} as task {}", proc.0, task.0);
            ExternalThreads { proc, task }
        })
    }

    /// Processor that external threads are attributed to.
    pub fn get_implicit_processor(&self) -> ProcID {
        self.external_threads().proc
    }

    /// Task id of the implicit task that stands for an external thread's
    /// lifetime. Does not register anything.
    pub fn external_implicit_task(&self) -> TaskID {
        self.external.get().map(|external| external.task).unwrap_or_default()
    }

    ///
    /// Descriptors
    ///

    pub fn register_task_kind(&self, task_id: TaskID, name: &str, overwrite: bool) {
        self.serializer.serialize(&TaskKind {
            task_id,
            overwrite,
            name: name.to_owned(),
        });
    }

    pub fn register_task_variant(&self, task_id: TaskID, variant_id: VariantID, name: &str) {
        self.serializer.serialize(&TaskVariant {
            task_id,
            variant_id,
            name: name.to_owned(),
        });
    }

    pub fn record_mapper_name(&self, mapper_id: MapperID, mapper_proc: ProcID, name: &str) {
        self.serializer.serialize(&MapperName {
            mapper_id,
            mapper_proc,
            name: name.to_owned(),
        });
    }

    pub fn record_mapper_call_kinds(&self, kinds: &[(MapperCallKindID, &str)]) {
        let mut guard = self.serializer.lock();
        for &(kind, name) in kinds {
            guard.serialize(&MapperCallDesc {
                kind,
                name: name.to_owned(),
            });
        }
    }

    pub fn record_runtime_call_kinds(&self, kinds: &[(RuntimeCallKindID, &str)]) {
        let mut guard = self.serializer.lock();
        for &(kind, name) in kinds {
            guard.serialize(&RuntimeCallDesc {
                kind,
                name: name.to_owned(),
            });
        }
    }

    pub fn record_provenance(&self, pid: ProvenanceID, provenance: &str) {
        self.serializer.serialize(&Provenance {
            pid,
            provenance: provenance.to_owned(),
        });
    }

    pub fn record_processor(&self, proc: ProcID) {
        if self
            .tables
            .read()
            .recorded_processors
            .binary_search(&proc)
            .is_ok()
        {
            return;
        }
        let mut tables = self.tables.write();
        let Err(index) = tables.recorded_processors.binary_search(&proc) else {
            return;
        };
        tables.recorded_processors.insert(index, proc);
        let mut guard = self.serializer.lock();
        guard.serialize(&ProcDesc {
            proc_id: proc,
            kind: self.runtime.processor_kind(proc),
        });
        let worklist = self
            .runtime
            .proc_mem_affinities(proc)
            .into_iter()
            .map(|affinity| affinity.m)
            .filter(|m| tables.recorded_memories.binary_search(m).is_err())
            .collect();
        self.record_affinities(&mut tables, &mut guard, worklist);
    }

    pub fn record_memory(&self, mem: MemID) {
        if self
            .tables
            .read()
            .recorded_memories
            .binary_search(&mem)
            .is_ok()
        {
            return;
        }
        let mut tables = self.tables.write();
        if tables.recorded_memories.binary_search(&mem).is_ok() {
            return;
        }
        let mut guard = self.serializer.lock();
        self.record_affinities(&mut tables, &mut guard, vec![mem]);
    }

    /// Describes every memory in `worklist`, every processor that can reach
    /// one of them, and, transitively, the memories those processors can
    /// reach. Each memory is described together with all its affinities.
    fn record_affinities(
        &self,
        tables: &mut Tables,
        guard: &mut SerializerGuard<'_>,
        mut worklist: Vec<MemID>,
    ) {
        while let Some(mem) = worklist.pop() {
            let Err(index) = tables.recorded_memories.binary_search(&mem) else {
                continue;
            };
            tables.recorded_memories.insert(index, mem);
            guard.serialize(&MemDesc {
                mem_id: mem,
                kind: self.runtime.memory_kind(mem),
                capacity: self.runtime.memory_capacity(mem),
            });
            for affinity in self.runtime.mem_proc_affinities(mem) {
                if let Err(index) = tables.recorded_processors.binary_search(&affinity.p) {
                    tables.recorded_processors.insert(index, affinity.p);
                    guard.serialize(&ProcDesc {
                        proc_id: affinity.p,
                        kind: self.runtime.processor_kind(affinity.p),
                    });
                    worklist.extend(
                        self.runtime
                            .proc_mem_affinities(affinity.p)
                            .into_iter()
                            .map(|other| other.m)
                            .filter(|m| tables.recorded_memories.binary_search(m).is_err()),
                    );
                }
                guard.serialize(&ProcMemDesc {
                    proc_id: affinity.p,
                    mem_id: mem,
                    bandwidth: affinity.bandwidth,
                    latency: affinity.latency,
                });
            }
        }
    }

    /// Id for a captured stack, describing it in the log the first time it
    /// is seen. Ids are unique across nodes.
    pub fn find_backtrace_id(&self, backtrace: &Backtrace) -> BacktraceID {
        let hash = backtrace.hash();
        if let Some(&id) = self.tables.read().backtrace_ids.get(&hash) {
            return id;
        }
        // Symbolizing is slow; do it before taking the write lock.
        let text = backtrace.to_string();
        let mut tables = self.tables.write();
        if let Some(&id) = tables.backtrace_ids.get(&hash) {
            return id;
        }
        let id = BacktraceID(tables.next_backtrace_id);
        tables.next_backtrace_id += self.runtime.total_address_spaces() as u64;
        tables.backtrace_ids.insert(hash, id);
        self.serializer.serialize(&BacktraceDesc {
            backtrace_id: id,
            backtrace: text,
        });
        id
    }

    /// Claims every generation of `bar` up to and including its own that
    /// has not been recorded yet. Returns the newest generation recorded
    /// before this call (generation zero if none), or `None` if there is
    /// nothing left to record.
    pub fn update_previous_recorded_barrier(&self, bar: EventID) -> Option<EventID> {
        debug_assert!(bar.exists() && bar.is_barrier());
        let key = (bar.node_id(), bar.barrier_idx());
        let generation = bar.generation();
        if let Some(&recorded) = self.tables.read().recorded_barriers.get(&key) {
            if generation <= recorded {
                return None;
            }
        }
        let mut tables = self.tables.write();
        let recorded = tables.recorded_barriers.get(&key).copied();
        match recorded {
            Some(recorded) if generation <= recorded => None,
            Some(recorded) => {
                // The barrier's generations are exhausted; its index may
                // be reused from generation zero.
                if generation + 1 == MAX_PHASES {
                    tables.recorded_barriers.remove(&key);
                } else {
                    tables.recorded_barriers.insert(key, generation);
                }
                Some(EventID::make_barrier(key.0, key.1, recorded))
            }
            None => {
                if generation + 1 < MAX_PHASES {
                    tables.recorded_barriers.insert(key, generation);
                }
                Some(EventID::make_barrier(key.0, key.1, 0))
            }
        }
    }

    ///
    /// Messages
    ///

    /// Called on the receiving node just before a message handler runs.
    /// The message's finish event was made where it was sent, so the
    /// context's fevent is renamed to a local event for the handler's
    /// duration.
    pub fn increment_outstanding_message_request(&self, ctx: &mut RecordingContext) {
        debug_assert!(ctx.implicit_fevent().exists());
        self.outstanding.increment(ProfilingKind::Message, 1);
        let rename = self.runtime.create_triggered_event();
        let original = ctx.implicit_fevent();
        ctx.set_implicit_fevent(rename);
        self.tables.write().message_fevents.insert(rename, original);
    }

    /// Looks up the other side of a message fevent rename. Without
    /// `remove` the reverse mapping is installed so the response handler
    /// can find the rename from the original.
    pub fn find_message_fevent(&self, fevent: EventID, remove: bool) -> Option<EventID> {
        let mut tables = self.tables.write();
        let result = tables.message_fevents.remove(&fevent)?;
        if !remove {
            tables.message_fevents.insert(result, fevent);
        }
        Some(result)
    }

    pub fn send_profiler_message(&self, target: NodeID, message: &ProfilerMessage) {
        match message.encode() {
            Ok(payload) => self
                .runtime
                .send_profiler_message(target, message.kind(), payload),
            Err(err) => warn!("unable to encode profiler message for node {}: {}", target, err),
        }
    }

    ///
    /// Requests
    ///

    fn submit_request(
        &self,
        ctx: &RecordingContext,
        kind: ProfilingKind,
        op_id: OpID,
        id: u64,
        extra: ProfilingExtra,
        critical: EventID,
        count: usize,
    ) -> ProfilingInfo {
        if count > 0 {
            self.outstanding.increment(kind, count);
        }
        ProfilingInfo {
            kind,
            op_id,
            id,
            extra,
            creator: ctx.implicit_fevent(),
            critical,
        }
    }

    pub fn add_task_request(
        &self,
        ctx: &RecordingContext,
        task_id: TaskID,
        variant_id: VariantID,
        op_id: OpID,
        critical: EventID,
    ) -> ProfilingInfo {
        self.submit_request(
            ctx,
            ProfilingKind::Task,
            op_id,
            task_id.0 as u64,
            ProfilingExtra::Id2(variant_id.0 as u64),
            critical,
            1,
        )
    }

    pub fn add_meta_request(
        &self,
        ctx: &RecordingContext,
        lg_id: VariantID,
        op_id: OpID,
        critical: EventID,
    ) -> ProfilingInfo {
        self.submit_request(
            ctx,
            ProfilingKind::Meta,
            op_id,
            lg_id.0 as u64,
            ProfilingExtra::None,
            critical,
            1,
        )
    }

    /// Not counted here: the receiving node counts the message when it
    /// starts running it.
    pub fn add_message_request(
        &self,
        ctx: &RecordingContext,
        message_kind: u32,
        critical: EventID,
    ) -> ProfilingInfo {
        // The spawn time goes last so it is as close to the send as possible.
        let mut info = self.submit_request(
            ctx,
            ProfilingKind::Message,
            ctx.implicit_provenance(),
            (self.num_meta_tasks + message_kind) as u64,
            ProfilingExtra::None,
            critical,
            0,
        );
        info.extra = ProfilingExtra::SpawnTime(Timestamp::from_ns(current_time_in_nanoseconds()));
        info
    }

    /// One tag answered `count` times; every response shares the closure.
    pub fn add_copy_request(
        &self,
        ctx: &RecordingContext,
        closure: Arc<dyn InstanceNameClosure>,
        op_id: OpID,
        critical: EventID,
        count: usize,
        collective: u32,
    ) -> ProfilingInfo {
        self.submit_request(
            ctx,
            ProfilingKind::Copy,
            op_id,
            collective as u64,
            ProfilingExtra::Closure(closure),
            critical,
            count,
        )
    }

    pub fn add_fill_request(
        &self,
        ctx: &RecordingContext,
        closure: Arc<dyn InstanceNameClosure>,
        op_id: OpID,
        critical: EventID,
        collective: u32,
    ) -> ProfilingInfo {
        self.submit_request(
            ctx,
            ProfilingKind::Fill,
            op_id,
            collective as u64,
            ProfilingExtra::Closure(closure),
            critical,
            1,
        )
    }

    pub fn add_inst_request(
        &self,
        ctx: &RecordingContext,
        op_id: OpID,
        unique_event: EventID,
        critical: EventID,
    ) -> ProfilingInfo {
        self.submit_request(
            ctx,
            ProfilingKind::Inst,
            op_id,
            unique_event.0,
            ProfilingExtra::None,
            critical,
            1,
        )
    }

    pub fn add_partition_request(
        &self,
        ctx: &RecordingContext,
        op_id: OpID,
        part_op: u32,
        critical: EventID,
    ) -> ProfilingInfo {
        self.submit_request(
            ctx,
            ProfilingKind::Partition,
            op_id,
            part_op as u64,
            ProfilingExtra::None,
            critical,
            1,
        )
    }

    /// Arranges to learn when an arrival's precondition actually triggered:
    /// a probe runs once `protected_pre` has, and its ready time is fed into
    /// the barrier's arrival reduction.
    pub fn profile_barrier_arrival(
        &self,
        ctx: &RecordingContext,
        bar: EventID,
        count: u32,
        precondition: EventID,
        protected_pre: EventID,
    ) {
        debug_assert!(precondition.exists());
        let info = self.submit_request(
            ctx,
            ProfilingKind::Arrival,
            ctx.implicit_provenance(),
            bar.0,
            ProfilingExtra::Id2(count as u64),
            precondition,
            1,
        );
        self.runtime.spawn_profiling_probe(info, protected_pre);
    }

    /// Comes back through [`handle_profiling_response`] once `bar` has
    /// triggered, so its arrivals can be recorded then.
    ///
    /// [`handle_profiling_response`]: LegionProfiler::handle_profiling_response
    pub fn profile_barrier_trigger(&self, ctx: &RecordingContext, bar: EventID, uid: OpID) {
        let info = self.submit_request(
            ctx,
            ProfilingKind::Barrier,
            uid,
            bar.0,
            ProfilingExtra::None,
            EventID::NO_EVENT,
            1,
        );
        self.runtime.spawn_profiling_probe(info, bar);
    }

    ///
    /// Responses
    ///

    /// Records the measurements for one request tag into `ctx` and retires
    /// the request.
    pub fn handle_profiling_response(
        &self,
        ctx: &mut RecordingContext,
        info: &ProfilingInfo,
        response: &ProfilingResponse,
    ) -> ResponseOutcome {
        let start = self
            .config
            .self_profile
            .then(|| Timestamp::from_ns(current_time_in_nanoseconds()));
        let mut outcome = ResponseOutcome {
            failed_alloc: false,
            fevent: response.finish_event.unwrap_or_default(),
        };
        match info.kind {
            ProfilingKind::Task | ProfilingKind::Meta | ProfilingKind::Message => {
                // Predicated-away and speculated work never ran anywhere.
                if let Some(proc) = response.proc_usage {
                    ctx.process_proc_desc(self, proc);
                    match info.kind {
                        ProfilingKind::Task => ctx.process_task(self, info, response, proc),
                        ProfilingKind::Meta => ctx.process_meta(self, info, response, proc),
                        _ => ctx.process_message(self, info, response, proc),
                    }
                } else {
                    debug!("{:?} {} did not run", info.kind, info.op_id.0);
                }
            }
            ProfilingKind::Copy | ProfilingKind::Fill => {
                if let Some(usage) = response.mem_usage {
                    if let Some(source) = usage.source {
                        ctx.process_mem_desc(self, source);
                    }
                    ctx.process_mem_desc(self, usage.target);
                    if info.kind == ProfilingKind::Copy {
                        ctx.process_copy(self, info, response, &usage);
                    } else {
                        ctx.process_fill(self, info, response, &usage);
                    }
                } else {
                    debug!("{:?} {} did not run", info.kind, info.op_id.0);
                }
            }
            ProfilingKind::Inst => {
                if response.alloc_success == Some(true) {
                    let (Some(timeline), Some(usage)) = (response.inst_timeline, response.inst_usage)
                    else {
                        panic!(
                            "instance {:#x} was allocated but its timeline or usage was not measured",
                            info.id
                        );
                    };
                    ctx.process_mem_desc(self, usage.memory);
                    ctx.process_inst_timeline(self, info, &usage, &timeline);
                    outcome.fevent = EventID(info.id);
                } else {
                    outcome.failed_alloc = true;
                    outcome.fevent = info.creator;
                }
            }
            ProfilingKind::Partition => ctx.process_partition(self, info, response),
            ProfilingKind::Arrival => match response.timeline {
                Some(timeline) => ctx.process_arrival(self, info, &timeline),
                None => warn!("barrier arrival probe for {} has no timeline", EventID(info.id)),
            },
            ProfilingKind::Barrier => {
                if response.status == Some(OperationStatus::CompletedSuccessfully) {
                    ctx.record_barrier_use(self, EventID(info.id), info.op_id);
                }
            }
        }
        if let Some(start) = start {
            let proc = ctx.local_proc();
            ctx.process_proc_desc(self, proc);
            let stop = Timestamp::from_ns(current_time_in_nanoseconds());
            let implicit = ctx.implicit_fevent();
            if info.kind == ProfilingKind::Inst || response.finish_event.is_some() {
                ctx.record_proftask(self, proc, info.op_id, start, stop, outcome.fevent, implicit, true);
            }
        }
        if self.outstanding.decrement(info.kind, 1) {
            debug!("last outstanding profiling request retired");
        }
        outcome
    }

    /// Adds `diff` bytes to the global footprint. Once over the threshold
    /// the caller pays for it by flushing part of its own backlog, for
    /// longer the further over it is.
    pub fn update_footprint(&self, diff: usize, ctx: &mut RecordingContext) {
        let total = self.total_memory_footprint.fetch_add(diff, Ordering::AcqRel) + diff;
        let threshold = self.config.footprint_threshold;
        if total <= threshold {
            return;
        }
        let over = drain_scale(total, threshold);
        let drained = ctx.dump_inter(&mut self.serializer.lock(), over, self.config.target_latency);
        self.total_memory_footprint.fetch_sub(drained, Ordering::AcqRel);
    }

    /// Waits for every outstanding request and writes out whatever is
    /// still buffered. Every context must be idle by now.
    pub fn finalize(&self) -> Result<(), ProfError> {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return Err(ProfError::AlreadyFinalized);
        }
        self.outstanding.decrement(ProfilingKind::Meta, 1);
        self.serializer.serialize(&CalibrationErr {
            calibration_err: self.runtime.calibration_error(),
        });
        self.outstanding.done().wait();

        let instances = self.instances.lock().clone();
        for ctx in &instances {
            let mut ctx = ctx.lock();
            let drained = ctx.dump_state(self, &mut self.serializer.lock());
            self.total_memory_footprint.fetch_sub(drained, Ordering::AcqRel);
        }
        self.serializer.finish()?;
        info!(
            "node {} finished profiling {} contexts",
            self.runtime.address_space(),
            instances.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    use crate::measurement::{
        InstanceMemoryUsage, InstanceTimeline, OperationTimeline, ProfilingResponse,
        SmallNameClosure,
    };
    use crate::runtime::EventSystem;
    use crate::serializer::{AsciiSerializer, SharedBuffer};
    use crate::sim::LocalRuntime;
    use crate::state::InstID;

    fn ascii_profiler(
        node: NodeID,
        nodes: u32,
        config: ProfilerConfig,
    ) -> (Arc<LocalRuntime>, LegionProfiler, SharedBuffer) {
        let runtime = Arc::new(LocalRuntime::new(node, nodes));
        let buffer = SharedBuffer::default();
        let serializer = Serializer::Ascii(AsciiSerializer::to_writer(Box::new(buffer.clone())));
        let descriptions = RuntimeDescriptions {
            meta_tasks: vec!["Scheduler".to_owned(), "Trigger".to_owned()],
            message_kinds: vec!["Task Message".to_owned()],
            operation_kinds: vec!["Task".to_owned()],
        };
        let profiler =
            LegionProfiler::with_serializer(runtime.clone(), config, &descriptions, serializer);
        (runtime, profiler, buffer)
    }

    fn lines_of<'a>(text: &'a str, name: &str) -> Vec<&'a str> {
        let prefix = format!("Prof {} ", name);
        text.lines().filter(|line| line.starts_with(&prefix)).collect()
    }

    fn task_response(proc: ProcID, finish: EventID) -> ProfilingResponse {
        ProfilingResponse {
            timeline: Some(OperationTimeline {
                create_time: 10,
                ready_time: 20,
                start_time: 30,
                end_time: 40,
                complete_time: 50,
            }),
            proc_usage: Some(proc),
            finish_event: Some(finish),
            ..Default::default()
        }
    }

    #[test]
    fn test_preamble() {
        let (_, profiler, buffer) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        drop(profiler);
        let text = buffer.text();
        assert!(text.starts_with("Prof MachineDesc 0 1 1 "));
        assert_eq!(lines_of(&text, "ZeroTime").len(), 1);
        let metas = lines_of(&text, "MetaDesc");
        assert_eq!(metas.len(), 3);
        assert_eq!(metas[2], "Prof MetaDesc 2 1 0 Task Message");
        assert_eq!(lines_of(&text, "OpDesc"), vec!["Prof OpDesc 0 Task"]);
        assert_eq!(lines_of(&text, "MaxDimDesc"), vec!["Prof MaxDimDesc 3"]);
        assert_eq!(lines_of(&text, "RuntimeConfig").len(), 1);
    }

    #[test]
    fn test_finalize_three_tasks() {
        let (runtime, profiler, buffer) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        let proc = runtime.cpu(0);
        let ctx_ref = profiler.find_or_create_profiling_instance(Some(proc));
        let tags: Vec<_> = {
            let ctx = ctx_ref.lock();
            (0..3)
                .map(|i| profiler.add_task_request(&ctx, TaskID(1), VariantID(2), OpID(i), EventID::NO_EVENT))
                .collect()
        };
        assert_eq!(profiler.outstanding_requests(), 4);
        for tag in &tags {
            let finish = runtime.create_triggered_event();
            profiler.handle_profiling_response(&mut ctx_ref.lock(), tag, &task_response(proc, finish));
        }
        assert_eq!(profiler.outstanding_requests(), 1);

        profiler.finalize().unwrap();
        assert_eq!(profiler.outstanding_requests(), 0);
        assert_eq!(profiler.footprint(), 0);
        let text = buffer.text();
        assert_eq!(lines_of(&text, "TaskInfo").len(), 3);
        assert_eq!(lines_of(&text, "CalibrationErr").len(), 1);
        // the processor was described before its first task
        let proc_desc = text.find("Prof ProcDesc").unwrap();
        assert!(proc_desc < text.find("Prof TaskInfo").unwrap());

        assert!(matches!(profiler.finalize(), Err(ProfError::AlreadyFinalized)));
    }

    #[test]
    fn test_finalize_waits_for_responses() {
        let (runtime, profiler, buffer) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        let proc = runtime.cpu(1);
        let ctx_ref = profiler.find_or_create_profiling_instance(Some(proc));
        let tag = profiler.add_meta_request(&ctx_ref.lock(), VariantID(1), OpID(7), EventID::NO_EVENT);

        thread::scope(|s| {
            let finalizer = s.spawn(|| profiler.finalize());
            let finish = runtime.create_triggered_event();
            profiler.handle_profiling_response(&mut ctx_ref.lock(), &tag, &task_response(proc, finish));
            finalizer.join().unwrap().unwrap();
        });
        assert_eq!(lines_of(&buffer.text(), "MetaInfo").len(), 1);
    }

    #[test]
    fn test_external_thread_context() {
        let (runtime, profiler, buffer) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        let a = profiler.find_or_create_profiling_instance(None);
        let b = profiler.find_or_create_profiling_instance(None);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.lock().local_proc(), profiler.get_implicit_processor());
        assert_ne!(a.lock().implicit_fevent(), b.lock().implicit_fevent());

        let cpu = profiler.find_or_create_profiling_instance(Some(runtime.cpu(0)));
        let again = profiler.find_or_create_profiling_instance(Some(runtime.cpu(0)));
        assert!(Arc::ptr_eq(&cpu, &again));
        let io = profiler.find_or_create_profiling_instance(Some(runtime.io()));
        let io_again = profiler.find_or_create_profiling_instance(Some(runtime.io()));
        assert!(!Arc::ptr_eq(&io, &io_again));

        profiler.finalize().unwrap();
        let text = buffer.text();
        assert_eq!(lines_of(&text, "TaskKind").len(), 1);
        assert!(lines_of(&text, "TaskKind")[0].ends_with(" 1 External Thread"));
        assert_eq!(lines_of(&text, "ImplicitTaskInfo").len(), 2);
    }

    #[test]
    fn test_processor_and_memory_descriptors_once() {
        let (runtime, profiler, buffer) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        profiler.record_processor(runtime.cpu(0));
        profiler.record_processor(runtime.cpu(0));
        profiler.record_processor(runtime.gpu());
        for &mem in runtime.memories() {
            profiler.record_memory(mem);
        }
        let text = buffer.text();
        // every processor and memory reachable from the first cpu
        assert_eq!(lines_of(&text, "ProcDesc").len(), runtime.processors().len());
        assert_eq!(lines_of(&text, "MemDesc").len(), runtime.memories().len());
        assert_eq!(
            lines_of(&text, "ProcMemDesc").len(),
            runtime.processors().len() * runtime.memories().len()
        );
    }

    #[test]
    fn test_backtrace_ids_stride_by_nodes() {
        let (_, profiler, buffer) = ascii_profiler(NodeID(0), 4, ProfilerConfig::default());
        let a = Backtrace::new(vec![1, 2, 3]);
        let b = Backtrace::new(vec![4, 5]);
        assert_eq!(profiler.find_backtrace_id(&a), BacktraceID(4));
        assert_eq!(profiler.find_backtrace_id(&b), BacktraceID(8));
        assert_eq!(profiler.find_backtrace_id(&a), BacktraceID(4));
        assert_eq!(lines_of(&buffer.text(), "BacktraceDesc").len(), 2);

        let (_, profiler, _) = ascii_profiler(NodeID(3), 4, ProfilerConfig::default());
        assert_eq!(profiler.find_backtrace_id(&a), BacktraceID(3));
        assert_eq!(profiler.find_backtrace_id(&b), BacktraceID(7));
    }

    #[test]
    fn test_previous_recorded_barrier() {
        let (_, profiler, _) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        let bar = |generation| EventID::make_barrier(NodeID(1), 5, generation);
        assert_eq!(profiler.update_previous_recorded_barrier(bar(3)), Some(bar(0)));
        assert_eq!(profiler.update_previous_recorded_barrier(bar(2)), None);
        assert_eq!(profiler.update_previous_recorded_barrier(bar(3)), None);
        assert_eq!(profiler.update_previous_recorded_barrier(bar(5)), Some(bar(3)));

        // the last generation frees the index for reuse
        let last = MAX_PHASES - 1;
        assert_eq!(profiler.update_previous_recorded_barrier(bar(last)), Some(bar(5)));
        assert_eq!(profiler.update_previous_recorded_barrier(bar(1)), Some(bar(0)));
    }

    #[test]
    fn test_message_fevent_rename() {
        let (runtime, profiler, _) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        let mut ctx = RecordingContext::new(runtime.cpu(0), EventID::NO_EVENT);
        let original = EventID::make_event(NodeID(1), 40, 1);
        ctx.set_implicit_fevent(original);
        profiler.increment_outstanding_message_request(&mut ctx);
        let rename = ctx.implicit_fevent();
        assert_ne!(rename, original);
        assert_eq!(rename.node_id(), NodeID(0));
        assert_eq!(profiler.outstanding_requests(), 2);

        // the handler finishes and restores the original
        assert_eq!(profiler.find_message_fevent(rename, false), Some(original));
        // the response finds the rename from the original, once
        assert_eq!(profiler.find_message_fevent(original, true), Some(rename));
        assert_eq!(profiler.find_message_fevent(original, true), None);
        assert_eq!(profiler.find_message_fevent(rename, true), None);
    }

    #[test]
    fn test_message_response_uses_rename() {
        let (runtime, profiler, buffer) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        let proc = runtime.cpu(0);
        let ctx_ref = profiler.find_or_create_profiling_instance(Some(proc));
        let mut ctx = ctx_ref.lock();
        let tag = profiler.add_message_request(&ctx, 0, EventID::NO_EVENT);
        assert_eq!(tag.id, 2);
        assert_eq!(profiler.outstanding_requests(), 1);

        let original = EventID::make_event(NodeID(1), 7, 1);
        ctx.set_implicit_fevent(original);
        profiler.increment_outstanding_message_request(&mut ctx);
        let rename = ctx.implicit_fevent();
        assert_eq!(profiler.find_message_fevent(rename, false), Some(original));
        profiler.handle_profiling_response(&mut ctx, &tag, &task_response(proc, original));
        drop(ctx);

        profiler.finalize().unwrap();
        let text = buffer.text();
        let messages = lines_of(&text, "MessageInfo");
        assert_eq!(messages.len(), 1);
        let fields: Vec<&str> = messages[0].split(' ').collect();
        assert_eq!(fields[fields.len() - 1], rename.to_string());
    }

    #[test]
    fn test_profiling_channel_messages_skipped() {
        let (runtime, profiler, _) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        runtime.set_message_channel(0, true, true);
        let proc = runtime.cpu(0);
        let mut ctx = RecordingContext::new(proc, EventID::NO_EVENT);
        let tag = profiler.add_message_request(&ctx, 0, EventID::NO_EVENT);
        ctx.set_implicit_fevent(runtime.create_triggered_event());
        profiler.increment_outstanding_message_request(&mut ctx);
        profiler.handle_profiling_response(&mut ctx, &tag, &task_response(proc, EventID::NO_EVENT));
        assert!(ctx.is_empty());
        assert_eq!(profiler.outstanding_requests(), 1);
    }

    #[test]
    fn test_missing_usage_writes_nothing() {
        let (runtime, profiler, _) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        let mut ctx = RecordingContext::new(runtime.cpu(0), EventID::NO_EVENT);
        let task = profiler.add_task_request(&ctx, TaskID(1), VariantID(1), OpID(1), EventID::NO_EVENT);
        let closure: Arc<dyn InstanceNameClosure> = Arc::new(SmallNameClosure::new());
        let copy = profiler.add_copy_request(&ctx, closure, OpID(2), EventID::NO_EVENT, 2, 0);
        assert_eq!(profiler.outstanding_requests(), 4);
        profiler.handle_profiling_response(&mut ctx, &task, &ProfilingResponse::default());
        profiler.handle_profiling_response(&mut ctx, &copy, &ProfilingResponse::default());
        profiler.handle_profiling_response(&mut ctx, &copy, &ProfilingResponse::default());
        assert!(ctx.is_empty());
        assert_eq!(profiler.outstanding_requests(), 1);
    }

    #[test]
    fn test_failed_allocation() {
        let (runtime, profiler, _) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        let mut ctx = RecordingContext::new(runtime.cpu(0), EventID::NO_EVENT);
        let creator = runtime.create_triggered_event();
        ctx.set_implicit_fevent(creator);
        let unique = runtime.create_triggered_event();
        let tag = profiler.add_inst_request(&ctx, OpID(3), unique, EventID::NO_EVENT);
        let response = ProfilingResponse {
            alloc_success: Some(false),
            ..Default::default()
        };
        let outcome = profiler.handle_profiling_response(&mut ctx, &tag, &response);
        assert!(outcome.failed_alloc);
        assert_eq!(outcome.fevent, creator);
        assert!(ctx.is_empty());
    }

    #[test]
    #[should_panic]
    fn test_allocated_instance_without_timeline_panics() {
        let (runtime, profiler, _) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        let mut ctx = RecordingContext::new(runtime.cpu(0), EventID::NO_EVENT);
        let tag = profiler.add_inst_request(&ctx, OpID(3), EventID(1), EventID::NO_EVENT);
        let response = ProfilingResponse {
            alloc_success: Some(true),
            ..Default::default()
        };
        profiler.handle_profiling_response(&mut ctx, &tag, &response);
    }

    #[test]
    fn test_self_profiling_records_proftask() {
        let config = ProfilerConfig {
            self_profile: true,
            ..Default::default()
        };
        let (runtime, profiler, _) = ascii_profiler(NodeID(0), 1, config);
        let proc = runtime.cpu(0);
        let mut ctx = RecordingContext::new(proc, EventID::NO_EVENT);
        let tag = profiler.add_task_request(&ctx, TaskID(1), VariantID(1), OpID(1), EventID::NO_EVENT);
        let finish = runtime.create_triggered_event();
        profiler.handle_profiling_response(&mut ctx, &tag, &task_response(proc, finish));
        // the task and the profiler's own work handling it
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_drain_scale() {
        assert!((drain_scale(1200, 1000) - 1.44).abs() < 1e-9);
        assert_eq!(drain_scale(5, 0), (1u64 << 20) as f64);
    }

    #[test]
    fn test_backpressure_drains_below_threshold() {
        let config = ProfilerConfig {
            footprint_threshold: 1000,
            target_latency: 100,
            ..Default::default()
        };
        let (runtime, profiler, buffer) = ascii_profiler(NodeID(0), 1, config);
        let mem = runtime.memories()[0];
        let name_len = 1200 - std::mem::size_of::<InstTimelineInfo>() - 1;
        runtime.set_instance_name(InstID(9), "x".repeat(name_len));
        let mut ctx = RecordingContext::new(runtime.cpu(0), EventID::NO_EVENT);
        let tag = profiler.add_inst_request(&ctx, OpID(1), EventID(0x99), EventID::NO_EVENT);
        let response = ProfilingResponse {
            alloc_success: Some(true),
            inst_timeline: Some(InstanceTimeline {
                create_time: 1,
                ready_time: 2,
                delete_time: 3,
            }),
            inst_usage: Some(InstanceMemoryUsage {
                instance: InstID(9),
                memory: mem,
                bytes: 4096,
            }),
            ..Default::default()
        };
        profiler.handle_profiling_response(&mut ctx, &tag, &response);
        assert!(profiler.footprint() <= 1000);
        assert!(ctx.is_empty());
        assert_eq!(lines_of(&buffer.text(), "InstTimelineInfo").len(), 1);
    }

    #[test]
    fn test_zero_threshold_flushes_every_record() {
        let config = ProfilerConfig {
            footprint_threshold: 0,
            ..Default::default()
        };
        let (runtime, profiler, _) = ascii_profiler(NodeID(0), 1, config);
        let mut ctx = RecordingContext::new(runtime.cpu(0), EventID::NO_EVENT);
        for i in 0..10 {
            ctx.record_application_range(&profiler, ProvenanceID(i), Timestamp(0), Timestamp(1));
            assert!(ctx.is_empty());
            assert_eq!(profiler.footprint(), 0);
        }
    }

    #[test]
    fn test_descriptor_registration() {
        let (runtime, profiler, buffer) = ascii_profiler(NodeID(0), 1, ProfilerConfig::default());
        profiler.register_task_kind(TaskID(3), "main", false);
        profiler.register_task_variant(TaskID(3), VariantID(1), "main_cpu");
        profiler.record_mapper_name(MapperID(0), runtime.cpu(0), "default");
        profiler.record_mapper_call_kinds(&[(MapperCallKindID(0), "map_task"), (MapperCallKindID(1), "select_tasks")]);
        profiler.record_runtime_call_kinds(&[(RuntimeCallKindID(0), "begin_task")]);
        profiler.record_provenance(ProvenanceID(1), "main.rs:10");
        let text = buffer.text();
        assert_eq!(lines_of(&text, "TaskKind"), vec!["Prof TaskKind 3 0 main"]);
        assert_eq!(lines_of(&text, "TaskVariant"), vec!["Prof TaskVariant 3 1 main_cpu"]);
        assert_eq!(lines_of(&text, "MapperName").len(), 1);
        assert_eq!(lines_of(&text, "MapperCallDesc").len(), 2);
        assert_eq!(lines_of(&text, "RuntimeCallDesc").len(), 1);
        assert_eq!(lines_of(&text, "Provenance"), vec!["Prof Provenance 1 main.rs:10"]);
    }

    #[test]
    fn test_concurrent_contexts_footprint_quiesces() {
        let config = ProfilerConfig {
            footprint_threshold: 4096,
            target_latency: 1,
            ..Default::default()
        };
        let (runtime, profiler, buffer) = ascii_profiler(NodeID(0), 1, config);
        let procs: Vec<_> = (0..2).map(|i| runtime.cpu(i)).collect();
        thread::scope(|s| {
            for &proc in &procs {
                let profiler = &profiler;
                let runtime = &runtime;
                s.spawn(move || {
                    let ctx_ref = profiler.find_or_create_profiling_instance(Some(proc));
                    for op in 0..200 {
                        let mut ctx = ctx_ref.lock();
                        let tag = profiler.add_task_request(&ctx, TaskID(1), VariantID(1), OpID(op), EventID::NO_EVENT);
                        let finish = runtime.create_triggered_event();
                        profiler.handle_profiling_response(&mut ctx, &tag, &task_response(proc, finish));
                    }
                });
            }
        });
        profiler.finalize().unwrap();
        assert_eq!(profiler.footprint(), 0);
        assert_eq!(lines_of(&buffer.text(), "TaskInfo").len(), 400);
    }
}
