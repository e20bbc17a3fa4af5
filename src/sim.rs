//! An in-process stand-in for the runtime, and a synthetic workload that
//! exercises every kind of record the profiler writes.
//!
//! Each [`LocalRuntime`] is one node: two CPUs, a GPU and an IO processor
//! over a system memory and a framebuffer. Events trigger as soon as they
//! are made. Barriers trigger once their expected arrivals are in.
//! Profiling probes and cross-node messages queue up until the driver
//! delivers them.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::config::ProfilerConfig;
use crate::error::ProfError;
use crate::instance::DetailedProfiler;
use crate::measurement::{
    CopyInstanceInfo, InstanceMemoryUsage, InstanceTimeline, OperationMemoryUsage,
    OperationStatus, OperationTimeline, OperationTimelineGPU, PhysicalInstance, ProfilingInfo,
    ProfilingKind, ProfilingResponse, SmallNameClosure,
};
use crate::profiler::{LegionProfiler, RuntimeDescriptions};
use crate::records::WaitInfo;
use crate::reduction::{Arrival, ArrivalInfo, BarrierArrivalReduction};
use crate::runtime::{
    Backtrace, BarrierState, EventSystem, Machine, MessageChannel, Operation, ProcMemAffinity,
    ProcessInfo, ProfilerMessageKind, Runtime, current_time_in_nanoseconds,
};
use crate::state::{
    EventID, FieldID, InstID, MapperCallKindID, MapperID, MemID, MemKind, NodeID, OpID, ProcID,
    ProcKind, ProvenanceID, RuntimeCallKindID, TaskID, Timestamp, VariantID,
};

const NUM_CPUS: usize = 2;
const SYSTEM_MEMORY_CAPACITY: u64 = 16 << 30;
const FRAMEBUFFER_CAPACITY: u64 = 8 << 30;

#[derive(Debug)]
struct BarrierSlot {
    remaining: AtomicU32,
    arrival: ArrivalInfo,
}

/// A message waiting to be delivered to `target`.
pub type Outgoing = (NodeID, ProfilerMessageKind, Vec<u8>);

pub struct LocalRuntime {
    node: NodeID,
    total_nodes: u32,
    processors: Vec<ProcID>,
    processor_kinds: Vec<ProcKind>,
    memories: Vec<MemID>,
    memory_kinds: Vec<MemKind>,
    next_event: AtomicU64,
    next_barrier: AtomicU64,
    next_op: AtomicU64,
    next_task: AtomicU32,
    // expected arrivals per barrier index
    barrier_arrivals: RwLock<BTreeMap<u64, u32>>,
    // one slot per generation
    barriers: RwLock<BTreeMap<EventID, Arc<BarrierSlot>>>,
    probes: Mutex<VecDeque<(ProfilingInfo, EventID)>>,
    outbox: Mutex<Vec<Outgoing>>,
    instance_names: RwLock<BTreeMap<InstID, String>>,
    channels: RwLock<BTreeMap<u32, MessageChannel>>,
}

impl LocalRuntime {
    pub fn new(node: NodeID, total_nodes: u32) -> Self {
        let mut processors: Vec<_> = (0..NUM_CPUS as u64).map(|i| ProcID::new(node, i)).collect();
        let mut processor_kinds = vec![ProcKind::CPU; NUM_CPUS];
        processors.push(ProcID::new(node, NUM_CPUS as u64));
        processor_kinds.push(ProcKind::GPU);
        processors.push(ProcID::new(node, NUM_CPUS as u64 + 1));
        processor_kinds.push(ProcKind::IO);
        LocalRuntime {
            node,
            total_nodes,
            processors,
            processor_kinds,
            memories: vec![MemID::new(node, 0), MemID::new(node, 1)],
            memory_kinds: vec![MemKind::System, MemKind::Framebuffer],
            next_event: AtomicU64::new(1),
            next_barrier: AtomicU64::new(0),
            next_op: AtomicU64::new(node.0 + 1),
            next_task: AtomicU32::new(1 << 20),
            barrier_arrivals: RwLock::new(BTreeMap::new()),
            barriers: RwLock::new(BTreeMap::new()),
            probes: Mutex::new(VecDeque::new()),
            outbox: Mutex::new(Vec::new()),
            instance_names: RwLock::new(BTreeMap::new()),
            channels: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn node(&self) -> NodeID {
        self.node
    }

    #[cfg(test)]
    pub fn processors(&self) -> &[ProcID] {
        &self.processors
    }

    pub fn memories(&self) -> &[MemID] {
        &self.memories
    }

    pub fn cpu(&self, idx: usize) -> ProcID {
        self.processors[idx % NUM_CPUS]
    }

    pub fn gpu(&self) -> ProcID {
        self.processors[NUM_CPUS]
    }

    #[cfg(test)]
    pub fn io(&self) -> ProcID {
        self.processors[NUM_CPUS + 1]
    }

    /// First generation of a new barrier that triggers after
    /// `expected_arrivals` arrivals per generation.
    pub fn create_barrier(&self, expected_arrivals: u32) -> EventID {
        let idx = self.next_barrier.fetch_add(1, Ordering::Relaxed);
        self.barrier_arrivals.write().insert(idx, expected_arrivals);
        EventID::make_barrier(self.node, idx, 1)
    }

    pub fn set_instance_name(&self, inst: InstID, name: String) {
        self.instance_names.write().insert(inst, name);
    }

    pub fn set_message_channel(&self, message_kind: u32, ordered: bool, profiling: bool) {
        self.channels
            .write()
            .insert(message_kind, MessageChannel { ordered, profiling });
    }

    #[cfg(test)]
    pub fn take_probes(&self) -> Vec<(ProfilingInfo, EventID)> {
        self.probes.lock().drain(..).collect()
    }

    pub fn take_messages(&self) -> Vec<Outgoing> {
        std::mem::take(&mut *self.outbox.lock())
    }

    fn slot(&self, barrier: EventID) -> Arc<BarrierSlot> {
        if let Some(slot) = self.barriers.read().get(&barrier) {
            return slot.clone();
        }
        let expected = self
            .barrier_arrivals
            .read()
            .get(&barrier.barrier_idx())
            .copied()
            .unwrap_or(1);
        self.barriers
            .write()
            .entry(barrier)
            .or_insert_with(|| {
                Arc::new(BarrierSlot {
                    remaining: AtomicU32::new(expected),
                    arrival: ArrivalInfo::identity(),
                })
            })
            .clone()
    }

    fn has_triggered(&self, event: EventID) -> bool {
        !event.is_barrier() || self.barrier_state(event) != BarrierState::Pending
    }

    /// Probes whose precondition has triggered, paired with the response
    /// the runtime would deliver for them. The rest stay queued.
    pub fn ready_probes(&self) -> Vec<(ProfilingInfo, ProfilingResponse)> {
        let mut probes = self.probes.lock();
        let mut ready = Vec::new();
        let mut waiting = VecDeque::new();
        while let Some((info, precondition)) = probes.pop_front() {
            if !self.has_triggered(precondition) {
                waiting.push_back((info, precondition));
                continue;
            }
            let now = current_time_in_nanoseconds();
            let response = match info.kind {
                ProfilingKind::Barrier => ProfilingResponse {
                    status: Some(OperationStatus::CompletedSuccessfully),
                    ..Default::default()
                },
                _ => ProfilingResponse {
                    timeline: Some(OperationTimeline {
                        create_time: now,
                        ready_time: now,
                        start_time: now,
                        end_time: now,
                        complete_time: now,
                    }),
                    ..Default::default()
                },
            };
            ready.push((info, response));
        }
        *probes = waiting;
        ready
    }
}

impl Machine for LocalRuntime {
    fn processor_kind(&self, proc: ProcID) -> ProcKind {
        self.processors
            .iter()
            .position(|&p| p == proc)
            .map(|idx| self.processor_kinds[idx])
            .unwrap_or(ProcKind::IO)
    }

    fn memory_kind(&self, mem: MemID) -> MemKind {
        self.memories
            .iter()
            .position(|&m| m == mem)
            .map(|idx| self.memory_kinds[idx])
            .unwrap_or_default()
    }

    fn memory_capacity(&self, mem: MemID) -> u64 {
        match self.memory_kind(mem) {
            MemKind::System => SYSTEM_MEMORY_CAPACITY,
            MemKind::Framebuffer => FRAMEBUFFER_CAPACITY,
            _ => 0,
        }
    }

    fn proc_mem_affinities(&self, proc: ProcID) -> Vec<ProcMemAffinity> {
        if !self.processors.contains(&proc) {
            return Vec::new();
        }
        self.memories
            .iter()
            .map(|&m| ProcMemAffinity {
                p: proc,
                m,
                bandwidth: 100,
                latency: 5,
            })
            .collect()
    }

    fn mem_proc_affinities(&self, mem: MemID) -> Vec<ProcMemAffinity> {
        if !self.memories.contains(&mem) {
            return Vec::new();
        }
        self.processors
            .iter()
            .map(|&p| ProcMemAffinity {
                p,
                m: mem,
                bandwidth: 100,
                latency: 5,
            })
            .collect()
    }

    fn local_processor_count(&self) -> u64 {
        self.processors.len() as u64
    }

    fn process_info(&self) -> ProcessInfo {
        ProcessInfo {
            hostname: format!("sim{}", self.node.0),
            host_id: self.node.0,
            process_id: std::process::id(),
        }
    }
}

impl EventSystem for LocalRuntime {
    fn create_triggered_event(&self) -> EventID {
        let idx = self.next_event.fetch_add(1, Ordering::Relaxed);
        EventID::make_event(self.node, idx, 1)
    }

    fn barrier_state(&self, barrier: EventID) -> BarrierState {
        match self.barriers.read().get(&barrier) {
            Some(slot) if slot.remaining.load(Ordering::Acquire) == 0 => BarrierState::Triggered,
            _ => BarrierState::Pending,
        }
    }

    fn barrier_result(&self, barrier: EventID) -> Option<Arrival> {
        let slot = self.barriers.read().get(&barrier)?.clone();
        (slot.remaining.load(Ordering::Acquire) == 0).then(|| slot.arrival.snapshot())
    }

    fn arrive(&self, barrier: EventID, count: u32, _precondition: EventID, arrival: &ArrivalInfo) {
        let slot = self.slot(barrier);
        // The payload has to be in before the barrier can be seen to trigger.
        BarrierArrivalReduction::apply_shared(&slot.arrival, arrival);
        let updated = slot
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
                (remaining > 0).then(|| remaining.saturating_sub(count))
            });
        match updated {
            Ok(remaining) if remaining <= count => debug!("barrier {} triggered", barrier),
            Ok(_) => {}
            Err(_) => warn!("arrival on barrier {} after it triggered", barrier),
        }
    }

    fn spawn_profiling_probe(&self, info: ProfilingInfo, precondition: EventID) {
        self.probes.lock().push_back((info, precondition));
    }
}

impl Runtime for LocalRuntime {
    fn address_space(&self) -> NodeID {
        self.node
    }

    fn total_address_spaces(&self) -> u32 {
        self.total_nodes
    }

    fn get_unique_operation_id(&self) -> OpID {
        OpID(self.next_op.fetch_add(self.total_nodes as u64, Ordering::Relaxed))
    }

    fn generate_dynamic_task_id(&self) -> TaskID {
        TaskID(self.next_task.fetch_add(1, Ordering::Relaxed))
    }

    fn find_instance_name(&self, inst: InstID) -> Option<String> {
        self.instance_names.read().get(&inst).cloned()
    }

    fn message_channel(&self, message_kind: u32) -> MessageChannel {
        self.channels
            .read()
            .get(&message_kind)
            .copied()
            .unwrap_or_default()
    }

    fn send_profiler_message(&self, target: NodeID, kind: ProfilerMessageKind, payload: Vec<u8>) {
        self.outbox.lock().push((target, kind, payload));
    }
}

struct SimOperation {
    id: OpID,
    parent: Option<OpID>,
    kind: u32,
    provenance: Option<ProvenanceID>,
}

impl Operation for SimOperation {
    fn unique_id(&self) -> OpID {
        self.id
    }
    fn parent_id(&self) -> Option<OpID> {
        self.parent
    }
    fn kind(&self) -> u32 {
        self.kind
    }
    fn provenance(&self) -> Option<ProvenanceID> {
        self.provenance
    }
}

const MAIN_TASK: TaskID = TaskID(1);
const LEAF_TASK: TaskID = TaskID(2);
const TASK_MESSAGE: u32 = 0;
const RUNTIME_CALL_BEGIN_TASK: RuntimeCallKindID = RuntimeCallKindID(0);
const MAPPER_CALL_MAP_TASK: MapperCallKindID = MapperCallKindID(0);

/// Runtime description shared by every simulated node.
fn descriptions() -> RuntimeDescriptions {
    RuntimeDescriptions {
        meta_tasks: vec![
            "Scheduler".to_owned(),
            "Trigger Task".to_owned(),
            "Deferred Copy".to_owned(),
        ],
        message_kinds: vec!["Task Message".to_owned(), "Profiler Message".to_owned()],
        operation_kinds: vec![
            "Task".to_owned(),
            "Copy".to_owned(),
            "Fill".to_owned(),
            "Partition".to_owned(),
        ],
    }
}

struct Node {
    runtime: Arc<LocalRuntime>,
    profiler: LegionProfiler,
}

impl Node {
    fn new(node: NodeID, total_nodes: u32, config: &ProfilerConfig) -> Result<Self, ProfError> {
        let runtime = Arc::new(LocalRuntime::new(node, total_nodes));
        runtime.set_message_channel(TASK_MESSAGE, true, false);
        runtime.set_message_channel(TASK_MESSAGE + 1, false, true);
        let profiler = LegionProfiler::new(runtime.clone(), config.clone(), &descriptions())?;
        Ok(Node { runtime, profiler })
    }

    fn register(&self) {
        let profiler = &self.profiler;
        profiler.register_task_kind(MAIN_TASK, "main", false);
        profiler.register_task_variant(MAIN_TASK, VariantID(1), "main_cpu");
        profiler.register_task_kind(LEAF_TASK, "leaf", false);
        profiler.register_task_variant(LEAF_TASK, VariantID(1), "leaf_cpu");
        profiler.register_task_variant(LEAF_TASK, VariantID(2), "leaf_gpu");
        profiler.record_mapper_name(MapperID(0), self.runtime.cpu(0), "Default Mapper");
        profiler.record_mapper_call_kinds(&[(MAPPER_CALL_MAP_TASK, "map_task")]);
        profiler.record_runtime_call_kinds(&[(RUNTIME_CALL_BEGIN_TASK, "begin_task")]);
        profiler.record_provenance(ProvenanceID(1), "sim.rs:leaf");
    }

    fn timeline(&self) -> OperationTimeline {
        let start = current_time_in_nanoseconds();
        OperationTimeline {
            create_time: start,
            ready_time: start + 100,
            start_time: start + 200,
            end_time: start + 1_000,
            complete_time: start + 1_200,
        }
    }

    fn run_leaf_tasks(&self, proc: ProcID, parent: OpID, tasks: usize, peer: NodeID) {
        let runtime = &*self.runtime;
        let profiler = &self.profiler;
        let ctx_ref = profiler.find_or_create_profiling_instance(Some(proc));
        let barrier = runtime.create_barrier(1);
        let mut previous = runtime.create_triggered_event();
        for i in 0..tasks {
            let _call = DetailedProfiler::new(profiler, &ctx_ref, RUNTIME_CALL_BEGIN_TASK);
            let mut ctx = ctx_ref.lock();
            let op_id = runtime.get_unique_operation_id();
            ctx.register_operation(
                profiler,
                &SimOperation {
                    id: op_id,
                    parent: Some(parent),
                    kind: 0,
                    provenance: Some(ProvenanceID(1)),
                },
            );
            ctx.set_implicit_provenance(op_id);
            let start = Timestamp::from_ns(current_time_in_nanoseconds());
            ctx.record_mapper_call(
                profiler,
                MapperID(0),
                proc,
                MAPPER_CALL_MAP_TASK,
                op_id,
                start,
                start + Timestamp(2_000),
            );

            let gpu = i % 4 == 3;
            let variant = if gpu { VariantID(2) } else { VariantID(1) };
            let tag = profiler.add_task_request(&ctx, LEAF_TASK, variant, op_id, previous);
            let finish = runtime.create_triggered_event();
            ctx.set_implicit_fevent(finish);
            ctx.record_event_merger(profiler, finish, &[previous, runtime.create_triggered_event()]);

            // Something created on the peer node triggers here.
            let remote = EventID::make_event(peer, 1 << 20 | i as u64, 1);
            ctx.record_event_trigger(profiler, remote, finish);

            let timeline = self.timeline();
            let response = ProfilingResponse {
                timeline: Some(timeline),
                gpu_timeline: gpu.then_some(OperationTimelineGPU {
                    start_time: timeline.start_time + 50,
                    end_time: timeline.end_time,
                }),
                event_waits: vec![WaitInfo {
                    wait_start: Timestamp::from_ns(timeline.start_time + 10),
                    wait_ready: Timestamp::from_ns(timeline.start_time + 20),
                    wait_end: Timestamp::from_ns(timeline.start_time + 30),
                    wait_event: previous,
                }],
                proc_usage: Some(if gpu { runtime.gpu() } else { proc }),
                finish_event: Some(finish),
                ..Default::default()
            };
            profiler.handle_profiling_response(&mut ctx, &tag, &response);
            previous = finish;
        }

        // Every task arrives on the barrier and then waits on it.
        let mut ctx = ctx_ref.lock();
        ctx.set_implicit_fevent(previous);
        if profiler.config().all_critical_arrivals {
            ctx.record_barrier_arrival(profiler, barrier, previous);
        }
        profiler.profile_barrier_arrival(&ctx, barrier, 1, previous, previous);
        ctx.record_event_wait(profiler, barrier, &Backtrace::new(vec![0x1000, 0x2000, proc.0]));
    }

    fn run_data_movement(&self, parent: OpID) {
        let runtime = &*self.runtime;
        let profiler = &self.profiler;
        let ctx_ref = profiler.find_or_create_profiling_instance(Some(runtime.cpu(0)));
        let mut ctx = ctx_ref.lock();
        let [sysmem, fbmem] = [runtime.memories()[0], runtime.memories()[1]];
        let src = PhysicalInstance { id: 1, location: sysmem };
        let dst = PhysicalInstance { id: 2, location: fbmem };

        let mut names = SmallNameClosure::new();
        names.record_instance_name(src, InstID(0x4000_0001));
        names.record_instance_name(dst, InstID(0x4000_0002));
        let closure: Arc<SmallNameClosure> = Arc::new(names);

        let copy_op = runtime.get_unique_operation_id();
        let tag = profiler.add_copy_request(&ctx, closure.clone(), copy_op, EventID::NO_EVENT, 2, 0);
        for hops in 1..=2 {
            let response = ProfilingResponse {
                timeline: Some(self.timeline()),
                mem_usage: Some(OperationMemoryUsage {
                    source: Some(sysmem),
                    target: fbmem,
                    size: 4096,
                }),
                copy_info: vec![CopyInstanceInfo {
                    src_insts: vec![src],
                    dst_insts: vec![dst],
                    src_fields: vec![FieldID(1), FieldID(2)],
                    dst_fields: vec![FieldID(1), FieldID(2)],
                    num_hops: hops,
                    ..Default::default()
                }],
                finish_event: Some(runtime.create_triggered_event()),
                ..Default::default()
            };
            profiler.handle_profiling_response(&mut ctx, &tag, &response);
        }

        let fill_op = runtime.get_unique_operation_id();
        let tag = profiler.add_fill_request(&ctx, closure, fill_op, EventID::NO_EVENT, 0);
        let response = ProfilingResponse {
            timeline: Some(self.timeline()),
            mem_usage: Some(OperationMemoryUsage {
                source: None,
                target: fbmem,
                size: 4096,
            }),
            copy_info: vec![CopyInstanceInfo {
                dst_insts: vec![dst],
                dst_fields: vec![FieldID(1), FieldID(2)],
                ..Default::default()
            }],
            finish_event: Some(runtime.create_triggered_event()),
            ..Default::default()
        };
        profiler.handle_profiling_response(&mut ctx, &tag, &response);

        let unique = runtime.create_triggered_event();
        runtime.set_instance_name(InstID(0x4000_0002), "fb_instance".to_owned());
        let tag = profiler.add_inst_request(&ctx, parent, unique, EventID::NO_EVENT);
        let now = current_time_in_nanoseconds();
        let response = ProfilingResponse {
            alloc_success: Some(true),
            inst_timeline: Some(InstanceTimeline {
                create_time: now,
                ready_time: now + 10,
                delete_time: now + 10_000,
            }),
            inst_usage: Some(InstanceMemoryUsage {
                instance: InstID(0x4000_0002),
                memory: fbmem,
                bytes: 4096,
            }),
            ..Default::default()
        };
        profiler.handle_profiling_response(&mut ctx, &tag, &response);
        let ready = runtime.create_triggered_event();
        ctx.record_instance_ready(profiler, ready, unique, EventID::NO_EVENT);

        let part_op = runtime.get_unique_operation_id();
        let tag = profiler.add_partition_request(&ctx, part_op, 1, EventID::NO_EVENT);
        let response = ProfilingResponse {
            timeline: Some(self.timeline()),
            finish_event: Some(runtime.create_triggered_event()),
            ..Default::default()
        };
        profiler.handle_profiling_response(&mut ctx, &tag, &response);
    }

    /// A task message from the first CPU handled on the second.
    fn run_message(&self) {
        let runtime = &*self.runtime;
        let profiler = &self.profiler;
        let sender = profiler.find_or_create_profiling_instance(Some(runtime.cpu(0)));
        let tag = profiler.add_message_request(&sender.lock(), TASK_MESSAGE, EventID::NO_EVENT);

        let receiver = profiler.find_or_create_profiling_instance(Some(runtime.cpu(1)));
        let mut ctx = receiver.lock();
        let saved = ctx.implicit_fevent();
        let original = runtime.create_triggered_event();
        ctx.set_implicit_fevent(original);
        profiler.increment_outstanding_message_request(&mut ctx);
        let handler_event = runtime.create_triggered_event();
        ctx.record_event_trigger(profiler, handler_event, EventID::NO_EVENT);
        let restored = profiler
            .find_message_fevent(ctx.implicit_fevent(), false)
            .unwrap_or(original);
        ctx.set_implicit_fevent(saved);
        let response = ProfilingResponse {
            timeline: Some(self.timeline()),
            proc_usage: Some(runtime.cpu(1)),
            finish_event: Some(restored),
            ..Default::default()
        };
        profiler.handle_profiling_response(&mut ctx, &tag, &response);
    }

    /// The thread that started the run, outside any processor.
    fn run_external(&self, main_op: OpID) {
        let runtime = &*self.runtime;
        let profiler = &self.profiler;
        let ctx_ref = profiler.find_or_create_profiling_instance(None);
        let mut ctx = ctx_ref.lock();
        let start = Timestamp::from_ns(current_time_in_nanoseconds());
        let waited = runtime.create_triggered_event();
        ctx.begin_external_wait(waited);
        ctx.end_external_wait(waited);
        ctx.record_application_range(
            profiler,
            ProvenanceID(1),
            start,
            Timestamp::from_ns(current_time_in_nanoseconds()),
        );
        let stop = Timestamp::from_ns(current_time_in_nanoseconds());
        let fevent = runtime.create_triggered_event();
        ctx.process_implicit(profiler, main_op, MAIN_TASK, start, stop, Vec::new(), fevent);
    }

    /// Records a synthetic application into this node's profiler.
    fn run(&self, tasks: usize) {
        self.register();
        let main_op = self.runtime.get_unique_operation_id();
        let peer = NodeID((self.runtime.node().0 + 1) % self.runtime.total_address_spaces() as u64);
        self.run_external(main_op);
        (0..NUM_CPUS).into_par_iter().for_each(|i| {
            self.run_leaf_tasks(self.runtime.cpu(i), main_op, tasks, peer);
        });
        self.run_data_movement(main_op);
        self.run_message();
    }

    /// Answers probes until none are left. Returns false if some probe's
    /// precondition can never trigger.
    fn drain_probes(&self) -> bool {
        let ctx_ref = self
            .profiler
            .find_or_create_profiling_instance(Some(self.runtime.cpu(0)));
        loop {
            let ready = self.runtime.ready_probes();
            if ready.is_empty() {
                return self.runtime.probes.lock().is_empty();
            }
            let mut ctx = ctx_ref.lock();
            for (info, response) in &ready {
                self.profiler.handle_profiling_response(&mut ctx, info, response);
            }
        }
    }

    fn deliver(&self, messages: &[Outgoing]) -> Result<(), ProfError> {
        if messages.is_empty() {
            return Ok(());
        }
        let ctx_ref = self
            .profiler
            .find_or_create_profiling_instance(Some(self.runtime.cpu(0)));
        let mut ctx = ctx_ref.lock();
        for (_, kind, payload) in messages {
            self.profiler.handle_profiler_message(&mut ctx, *kind, payload)?;
        }
        Ok(())
    }
}

/// Profiles a synthetic run on `nodes` nodes, writing one log per node.
pub fn simulate(config: &ProfilerConfig, nodes: u32, tasks: usize) -> Result<(), ProfError> {
    let nodes: Vec<Node> = (0..nodes)
        .map(|node| Node::new(NodeID(node as u64), nodes, config))
        .collect::<Result<_, _>>()?;

    nodes.par_iter().for_each(|node| node.run(tasks));

    let mut inboxes: Vec<Vec<Outgoing>> = nodes.iter().map(|_| Vec::new()).collect();
    for node in &nodes {
        for message in node.runtime.take_messages() {
            match inboxes.get_mut(message.0.0 as usize) {
                Some(inbox) => inbox.push(message),
                None => warn!("dropping profiler message for unknown node {}", message.0),
            }
        }
    }
    nodes
        .par_iter()
        .zip(inboxes.par_iter())
        .try_for_each(|(node, inbox)| node.deliver(inbox))?;

    nodes.par_iter().try_for_each(|node| {
        if !node.drain_probes() {
            warn!(
                "node {} has profiling probes that will never run",
                node.runtime.node()
            );
        }
        node.profiler.finalize()
    })?;
    info!("simulated {} nodes", nodes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use nonmax::NonMaxI64;

    use crate::serialize::{Record, deserialize};

    #[test]
    fn test_barrier_triggers_after_expected_arrivals() {
        let runtime = LocalRuntime::new(NodeID(0), 1);
        let bar = runtime.create_barrier(2);
        let arrival = |t| ArrivalInfo::new(t, NonMaxI64::new(t).unwrap(), EventID::NO_EVENT, EventID(t as u64));
        runtime.arrive(bar, 1, EventID::NO_EVENT, &arrival(30));
        assert_eq!(runtime.barrier_state(bar), BarrierState::Pending);
        assert!(runtime.barrier_result(bar).is_none());
        runtime.arrive(bar, 1, EventID::NO_EVENT, &arrival(10));
        assert_eq!(runtime.barrier_state(bar), BarrierState::Triggered);
        let result = runtime.barrier_result(bar).unwrap();
        assert_eq!(result.arrival_time, 30);
        assert_eq!(result.fevent, EventID(30));
        // the next generation is independent
        let next = bar.get_next_phase().unwrap();
        assert_eq!(runtime.barrier_state(next), BarrierState::Pending);
    }

    #[test]
    fn test_ready_probes_wait_for_barrier() {
        let runtime = LocalRuntime::new(NodeID(0), 1);
        let bar = runtime.create_barrier(1);
        let probe = |kind| ProfilingInfo {
            kind,
            op_id: OpID(1),
            id: bar.0,
            extra: crate::measurement::ProfilingExtra::None,
            creator: EventID::NO_EVENT,
            critical: EventID::NO_EVENT,
        };
        runtime.spawn_profiling_probe(probe(ProfilingKind::Barrier), bar);
        runtime.spawn_profiling_probe(probe(ProfilingKind::Arrival), runtime.create_triggered_event());
        let ready = runtime.ready_probes();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0.kind, ProfilingKind::Arrival);
        assert!(ready[0].1.timeline.is_some());

        runtime.arrive(bar, 1, EventID::NO_EVENT, &ArrivalInfo::new(1, NonMaxI64::new(1).unwrap(), EventID::NO_EVENT, EventID(5)));
        let ready = runtime.ready_probes();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].1.status, Some(OperationStatus::CompletedSuccessfully));
        assert!(runtime.take_probes().is_empty());
    }

    #[test]
    fn test_simulate_two_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProfilerConfig {
            logfile: Some(dir.path().join("prof_%.gz").to_string_lossy().into_owned()),
            footprint_threshold: 2048,
            target_latency: 1,
            ..Default::default()
        };
        simulate(&config, 2, 8).unwrap();

        for node in 0..2 {
            let path = dir.path().join(format!("prof_{}.gz", node));
            let records = deserialize(&path).unwrap();
            let count = |pred: fn(&Record) -> bool| records.iter().filter(|r| pred(r)).count();
            assert!(matches!(records[0], Record::MachineDesc(_)));
            assert_eq!(count(|r| matches!(r, Record::TaskInfo(_))), 12);
            assert_eq!(count(|r| matches!(r, Record::GPUTaskInfo(_))), 4);
            assert_eq!(count(|r| matches!(r, Record::ImplicitTaskInfo(_))), 2);
            assert_eq!(count(|r| matches!(r, Record::CopyInfo(_))), 2);
            assert_eq!(count(|r| matches!(r, Record::FillInfo(_))), 1);
            assert_eq!(count(|r| matches!(r, Record::FillInstInfo(_))), 2);
            assert_eq!(count(|r| matches!(r, Record::InstTimelineInfo(_))), 1);
            assert_eq!(count(|r| matches!(r, Record::PartitionInfo(_))), 1);
            assert_eq!(count(|r| matches!(r, Record::MessageInfo(_))), 1);
            // the critical arrival of each barrier, recorded by its wait
            assert_eq!(count(|r| matches!(r, Record::BarrierArrivalInfo(_))), 2);
            // 8 local triggers per cpu, 16 from the peer, 1 from the message handler
            assert_eq!(count(|r| matches!(r, Record::EventTriggerInfo(_))), 16 + 16 + 1);
            assert_eq!(count(|r| matches!(r, Record::CalibrationErr(_))), 1);
            assert_eq!(count(|r| matches!(r, Record::BacktraceDesc(_))), 2);
        }
    }

    #[test]
    fn test_simulate_all_critical_arrivals() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProfilerConfig {
            logfile: Some(dir.path().join("prof_%.gz").to_string_lossy().into_owned()),
            all_critical_arrivals: true,
            ..Default::default()
        };
        simulate(&config, 2, 4).unwrap();

        let records = deserialize(dir.path().join("prof_0.gz")).unwrap();
        let arrivals: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                Record::BarrierArrivalInfo(info) => Some(info),
                _ => None,
            })
            .collect();
        // one arrival per cpu, and no barrier use walks
        assert_eq!(arrivals.len(), NUM_CPUS);
        assert!(arrivals.iter().all(|a| a.result.is_barrier() && a.fevent.exists()));
    }
}
