//! Per-processor recording buffers.
//!
//! A [`RecordingContext`] belongs to one processor, or to one external
//! thread, and is only ever appended to by whoever currently runs there.
//! Every append reports its footprint to the owning [`LegionProfiler`],
//! which may ask the context to flush part of its backlog on the spot.

use std::collections::VecDeque;
use std::mem;

use log::warn;
use nonmax::NonMaxI64;

use crate::measurement::{
    InstanceMemoryUsage, InstanceTimeline, OperationMemoryUsage, OperationTimeline,
    ProfilingInfo, ProfilingResponse,
};
use crate::profiler::{ContextRef, LegionProfiler};
use crate::records::*;
use crate::reduction::ArrivalInfo;
use crate::remote::ProfilerMessage;
use crate::runtime::{
    Backtrace, BarrierState, Operation, current_time_in_microseconds,
    current_time_in_nanoseconds,
};
use crate::state::{
    EventID, InstID, MapperCallKindID, MapperID, MemID, OpID, ProcID, ProvenanceID,
    RuntimeCallKindID, TaskID, Timestamp, VariantID,
};

/// Parent id logged for operations launched by the top-level task.
pub const ROOT_PARENT_ID: OpID = OpID(u64::MAX);

/// Implicit top-level tasks share the task record layout but are written
/// under their own record id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ImplicitTaskInfo(TaskInfo);

impl LogRecord for ImplicitTaskInfo {
    fn emit<S: RecordSink>(&self, sink: &mut S) {
        Implicit(&self.0).emit(sink)
    }
}

impl Footprint for ImplicitTaskInfo {
    fn footprint(&self) -> usize {
        self.0.footprint()
    }
}

fn required<T>(measurement: Option<T>, what: &str, info: &ProfilingInfo) -> T {
    match measurement {
        Some(measurement) => measurement,
        None => panic!(
            "{:?} profiling response for operation {} is missing its {}",
            info.kind, info.op_id.0, what
        ),
    }
}

/// Pops records off the front of `queue` into `sink`. Returns true once
/// `deadline` (in microseconds) has passed.
fn drain_queue<R, S>(
    queue: &mut VecDeque<R>,
    sink: &mut S,
    deadline: Option<i64>,
    drained: &mut usize,
) -> bool
where
    R: LogRecord + Footprint,
    S: RecordSink,
{
    while let Some(record) = queue.pop_front() {
        record.emit(sink);
        *drained += record.footprint();
        if let Some(deadline) = deadline {
            if current_time_in_microseconds() >= deadline {
                return true;
            }
        }
    }
    false
}

macro_rules! drain_queues {
    ($ctx:ident, $sink:ident, $deadline:ident, $drained:ident; $($queue:ident),* $(,)?) => {
        $(
            if drain_queue(&mut $ctx.$queue, $sink, $deadline, &mut $drained) {
                return $drained;
            }
        )*
    };
}

macro_rules! queued_footprint {
    ($ctx:ident; $($queue:ident),* $(,)?) => {
        0 $(+ $ctx.$queue.iter().map(Footprint::footprint).sum::<usize>())*
    };
}

macro_rules! queued_len {
    ($ctx:ident; $($queue:ident),* $(,)?) => {
        0 $(+ $ctx.$queue.len())*
    };
}

#[derive(Debug, Default)]
pub struct RecordingContext {
    local_proc: ProcID,
    external_fevent: EventID,
    external_start: Timestamp,
    implicit_fevent: EventID,
    implicit_provenance: OpID,

    proc_ids: Vec<ProcID>,
    mem_ids: Vec<MemID>,

    operation_instances: VecDeque<OperationInstance>,
    multi_tasks: VecDeque<MultiTask>,
    slice_owners: VecDeque<SliceOwner>,
    task_infos: VecDeque<TaskInfo>,
    implicit_infos: VecDeque<ImplicitTaskInfo>,
    gpu_task_infos: VecDeque<GPUTaskInfo>,
    meta_infos: VecDeque<MetaInfo>,
    message_infos: VecDeque<MessageInfo>,
    fill_infos: VecDeque<FillInfo>,
    copy_infos: VecDeque<CopyInfo>,
    inst_timeline_infos: VecDeque<InstTimelineInfo>,
    partition_infos: VecDeque<PartitionInfo>,
    mapper_call_infos: VecDeque<MapperCallInfo>,
    runtime_call_infos: VecDeque<RuntimeCallInfo>,
    application_call_infos: VecDeque<ApplicationCallInfo>,
    event_wait_infos: VecDeque<EventWaitInfo>,
    event_merger_infos: VecDeque<EventMergerInfo>,
    event_trigger_infos: VecDeque<EventTriggerInfo>,
    event_poison_infos: VecDeque<EventPoisonInfo>,
    barrier_arrival_infos: VecDeque<BarrierArrivalInfo>,
    reservation_acquire_infos: VecDeque<ReservationAcquireInfo>,
    instance_ready_infos: VecDeque<InstanceReadyInfo>,
    instance_redistrict_infos: VecDeque<InstanceRedistrictInfo>,
    completion_queue_infos: VecDeque<CompletionQueueInfo>,
    prof_task_infos: VecDeque<ProfTaskInfo>,

    // Written once, after everything else, by external threads.
    external_wait_infos: Vec<WaitInfo>,
}

impl RecordingContext {
    pub(crate) fn new(local_proc: ProcID, external_fevent: EventID) -> Self {
        let external_start = if external_fevent.exists() {
            Timestamp::from_ns(current_time_in_nanoseconds())
        } else {
            Timestamp::default()
        };
        RecordingContext {
            local_proc,
            external_fevent,
            external_start,
            implicit_fevent: external_fevent,
            ..Default::default()
        }
    }

    pub fn local_proc(&self) -> ProcID {
        self.local_proc
    }

    pub fn is_external_thread(&self) -> bool {
        self.external_fevent.exists()
    }

    /// Finish event of whatever is currently running in this context.
    pub fn implicit_fevent(&self) -> EventID {
        self.implicit_fevent
    }

    pub fn set_implicit_fevent(&mut self, fevent: EventID) {
        self.implicit_fevent = fevent;
    }

    /// Operation currently running in this context.
    pub fn implicit_provenance(&self) -> OpID {
        self.implicit_provenance
    }

    pub fn set_implicit_provenance(&mut self, op_id: OpID) {
        self.implicit_provenance = op_id;
    }

    ///
    /// Operation bookkeeping
    ///

    pub fn register_operation(&mut self, owner: &LegionProfiler, op: &dyn Operation) {
        let inst = OperationInstance {
            op_id: op.unique_id(),
            parent_id: op.parent_id().unwrap_or(ROOT_PARENT_ID),
            kind: op.kind(),
            provenance: op.provenance().unwrap_or_default(),
        };
        let diff = inst.footprint();
        self.operation_instances.push_back(inst);
        owner.update_footprint(diff, self);
    }

    pub fn register_multi_task(&mut self, owner: &LegionProfiler, op: &dyn Operation, task_id: TaskID) {
        let task = MultiTask {
            op_id: op.unique_id(),
            task_id,
        };
        let diff = task.footprint();
        self.multi_tasks.push_back(task);
        owner.update_footprint(diff, self);
    }

    pub fn register_slice_owner(&mut self, owner: &LegionProfiler, parent_id: OpID, op_id: OpID) {
        let slice = SliceOwner { parent_id, op_id };
        let diff = slice.footprint();
        self.slice_owners.push_back(slice);
        owner.update_footprint(diff, self);
    }

    ///
    /// Event graph
    ///

    pub fn record_event_merger(
        &mut self,
        owner: &LegionProfiler,
        result: EventID,
        preconditions: &[EventID],
    ) {
        if owner.config().no_critical_paths {
            return;
        }
        // Merging can hand back one of its inputs; nothing new to record.
        if preconditions.contains(&result) {
            return;
        }
        let performed = Timestamp::from_ns(current_time_in_nanoseconds());
        for &pre in preconditions {
            if pre.is_barrier() {
                self.record_barrier_use(owner, pre, self.implicit_provenance);
            }
        }
        let info = EventMergerInfo {
            result,
            fevent: self.implicit_fevent,
            performed,
            preconditions: preconditions.to_vec(),
        };
        let diff = info.footprint();
        self.event_merger_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    pub fn record_event_trigger(&mut self, owner: &LegionProfiler, result: EventID, pre: EventID) {
        if owner.config().no_critical_paths {
            return;
        }
        let info = EventTriggerInfo {
            result,
            fevent: self.implicit_fevent,
            precondition: pre,
            performed: Timestamp::from_ns(current_time_in_nanoseconds()),
        };
        if pre.is_barrier() {
            self.record_barrier_use(owner, pre, self.implicit_provenance);
        }
        // Let the creator know where its event was triggered, so that a
        // partial load of the logs can still find it.
        let creator = result.node_id();
        if creator != owner.runtime().address_space() {
            owner.send_profiler_message(creator, &ProfilerMessage::EventTrigger(info.clone()));
        }
        let diff = info.footprint();
        self.event_trigger_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    pub fn record_event_poison(&mut self, owner: &LegionProfiler, result: EventID) {
        if owner.config().no_critical_paths {
            return;
        }
        let info = EventPoisonInfo {
            result,
            fevent: self.implicit_fevent,
            performed: Timestamp::from_ns(current_time_in_nanoseconds()),
        };
        let creator = result.node_id();
        if creator != owner.runtime().address_space() {
            owner.send_profiler_message(creator, &ProfilerMessage::EventPoison(info.clone()));
        }
        let diff = info.footprint();
        self.event_poison_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    pub fn record_barrier_arrival(&mut self, owner: &LegionProfiler, result: EventID, pre: EventID) {
        if owner.config().no_critical_paths {
            return;
        }
        debug_assert!(result.is_barrier());
        // Without this flag only the critical arrival is recorded, on use.
        debug_assert!(owner.config().all_critical_arrivals);
        debug_assert!(self.implicit_fevent.exists());
        let info = BarrierArrivalInfo {
            result,
            fevent: self.implicit_fevent,
            precondition: pre,
            performed: Timestamp::from_ns(current_time_in_nanoseconds()),
        };
        if pre.is_barrier() {
            self.record_barrier_use(owner, pre, self.implicit_provenance);
        }
        let diff = info.footprint();
        self.barrier_arrival_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    /// Records the last arrival of every generation of `bar` up to and
    /// including this one that nobody has recorded yet. If the barrier has
    /// not triggered, a probe is left behind to come back when it has.
    pub fn record_barrier_use(&mut self, owner: &LegionProfiler, bar: EventID, uid: OpID) {
        debug_assert!(bar.is_barrier());
        // With every arrival logged the reader can rebuild this itself.
        let config = owner.config();
        if config.no_critical_paths || config.all_critical_arrivals {
            return;
        }
        let runtime = owner.runtime();
        match runtime.barrier_state(bar) {
            BarrierState::Pending => owner.profile_barrier_trigger(self, bar, uid),
            BarrierState::Triggered | BarrierState::Poisoned => {
                let Some(previous) = owner.update_previous_recorded_barrier(bar) else {
                    return;
                };
                let mut barrier = bar;
                while barrier.exists() && barrier != previous {
                    let Some(arrival) = runtime.barrier_result(barrier) else {
                        warn!("barrier {} triggered without an arrival result", barrier);
                        break;
                    };
                    debug_assert!(arrival.fevent.exists());
                    let info = BarrierArrivalInfo {
                        result: barrier,
                        fevent: arrival.fevent,
                        precondition: arrival.precondition,
                        performed: Timestamp::from_ns(arrival.arrival_time),
                    };
                    let diff = info.footprint();
                    self.barrier_arrival_infos.push_back(info);
                    owner.update_footprint(diff, self);
                    barrier = barrier.get_previous_phase();
                }
            }
        }
    }

    pub fn record_reservation_acquire(
        &mut self,
        owner: &LegionProfiler,
        reservation: u64,
        result: EventID,
        precondition: EventID,
    ) {
        if owner.config().no_critical_paths {
            return;
        }
        let info = ReservationAcquireInfo {
            result,
            fevent: self.implicit_fevent,
            precondition,
            performed: Timestamp::from_ns(current_time_in_nanoseconds()),
            reservation,
        };
        if precondition.is_barrier() {
            self.record_barrier_use(owner, precondition, self.implicit_provenance);
        }
        let diff = info.footprint();
        self.reservation_acquire_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    pub fn record_instance_ready(
        &mut self,
        owner: &LegionProfiler,
        result: EventID,
        unique: EventID,
        precondition: EventID,
    ) {
        if owner.config().no_critical_paths {
            return;
        }
        let info = InstanceReadyInfo {
            result,
            precondition,
            unique,
            performed: Timestamp::from_ns(current_time_in_nanoseconds()),
        };
        if precondition.is_barrier() {
            self.record_barrier_use(owner, precondition, self.implicit_provenance);
        }
        let diff = info.footprint();
        self.instance_ready_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    /// Returns the event that now names the redistricted instance. When
    /// the runtime reused the precondition as the result, a fresh event is
    /// made so the two stay distinguishable in the log.
    pub fn record_instance_redistrict(
        &mut self,
        owner: &LegionProfiler,
        result: EventID,
        previous: EventID,
        next: EventID,
        precondition: EventID,
    ) -> EventID {
        if owner.config().no_critical_paths {
            return result;
        }
        let result = if result == precondition {
            owner.runtime().create_triggered_event()
        } else {
            result
        };
        let info = InstanceRedistrictInfo {
            result,
            precondition,
            previous,
            next,
            performed: Timestamp::from_ns(current_time_in_nanoseconds()),
        };
        if precondition.is_barrier() {
            self.record_barrier_use(owner, precondition, self.implicit_provenance);
        }
        let diff = info.footprint();
        self.instance_redistrict_infos.push_back(info);
        owner.update_footprint(diff, self);
        result
    }

    pub fn record_completion_queue_event(
        &mut self,
        owner: &LegionProfiler,
        result: EventID,
        fevent: EventID,
        performed: Timestamp,
        preconditions: &[EventID],
    ) {
        if owner.config().no_critical_paths {
            return;
        }
        if preconditions.contains(&result) {
            return;
        }
        for &pre in preconditions {
            if pre.is_barrier() {
                self.record_barrier_use(owner, pre, self.implicit_provenance);
            }
        }
        let info = CompletionQueueInfo {
            result,
            fevent,
            performed,
            preconditions: preconditions.to_vec(),
        };
        let diff = info.footprint();
        self.completion_queue_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    ///
    /// Profiling responses
    ///

    pub fn process_task(
        &mut self,
        owner: &LegionProfiler,
        info: &ProfilingInfo,
        response: &ProfilingResponse,
        proc: ProcID,
    ) {
        let timeline: OperationTimeline = required(response.timeline, "timeline", info);
        if info.critical.is_barrier() {
            self.record_barrier_use(owner, info.critical, info.op_id);
        }
        let fevent = response.finish_event.unwrap_or_default();
        let task_id = TaskID(info.id as u32);
        let variant_id = VariantID(info.extra.id2() as u32);
        if let Some(gpu) = response.gpu_timeline {
            let task = GPUTaskInfo {
                op_id: info.op_id,
                task_id,
                variant_id,
                proc_id: proc,
                create: Timestamp::from_ns(timeline.create_time),
                ready: Timestamp::from_ns(timeline.ready_time),
                start: Timestamp::from_ns(timeline.start_time),
                stop: Timestamp::from_ns(timeline.end_time),
                gpu_start: Timestamp::from_ns(gpu.start_time),
                gpu_stop: Timestamp::from_ns(gpu.end_time),
                creator: info.creator,
                critical: info.critical,
                fevent,
                wait_intervals: response.event_waits.clone(),
            };
            let diff = task.footprint();
            self.gpu_task_infos.push_back(task);
            owner.update_footprint(diff, self);
        } else {
            let task = TaskInfo {
                op_id: info.op_id,
                task_id,
                variant_id,
                proc_id: proc,
                create: Timestamp::from_ns(timeline.create_time),
                ready: Timestamp::from_ns(timeline.ready_time),
                start: Timestamp::from_ns(timeline.start_time),
                stop: Timestamp::from_ns(timeline.complete_time),
                creator: info.creator,
                critical: info.critical,
                fevent,
                wait_intervals: response.event_waits.clone(),
            };
            let diff = task.footprint();
            self.task_infos.push_back(task);
            owner.update_footprint(diff, self);
        }
    }

    pub fn process_meta(
        &mut self,
        owner: &LegionProfiler,
        info: &ProfilingInfo,
        response: &ProfilingResponse,
        proc: ProcID,
    ) {
        let timeline = required(response.timeline, "timeline", info);
        let meta = MetaInfo {
            op_id: info.op_id,
            lg_id: VariantID(info.id as u32),
            proc_id: proc,
            create: Timestamp::from_ns(timeline.create_time),
            ready: Timestamp::from_ns(timeline.ready_time),
            start: Timestamp::from_ns(timeline.start_time),
            stop: Timestamp::from_ns(timeline.complete_time),
            creator: info.creator,
            critical: info.critical,
            fevent: response.finish_event.unwrap_or_default(),
            wait_intervals: response.event_waits.clone(),
        };
        if info.critical.is_barrier() {
            self.record_barrier_use(owner, info.critical, info.op_id);
        }
        let diff = meta.footprint();
        self.meta_infos.push_back(meta);
        owner.update_footprint(diff, self);
    }

    pub fn process_message(
        &mut self,
        owner: &LegionProfiler,
        info: &ProfilingInfo,
        response: &ProfilingResponse,
        proc: ProcID,
    ) {
        // The profiler's own traffic is only interesting when profiling
        // the profiler.
        let message_kind = (info.id as u32).saturating_sub(owner.num_meta_tasks());
        if owner.runtime().message_channel(message_kind).profiling && !owner.config().self_profile {
            return;
        }
        let timeline = required(response.timeline, "timeline", info);
        // The runtime's finish event was made on the sending node; log the
        // local rename handed out when the message started running.
        let fevent = match response.finish_event {
            Some(original) => owner.find_message_fevent(original, true).unwrap_or_else(|| {
                warn!("message finish event {} was never renamed", original);
                original
            }),
            None => EventID::NO_EVENT,
        };
        let message = MessageInfo {
            op_id: info.op_id,
            lg_id: VariantID(info.id as u32),
            proc_id: proc,
            spawn: info.extra.spawn_time(),
            create: Timestamp::from_ns(timeline.create_time),
            ready: Timestamp::from_ns(timeline.ready_time),
            start: Timestamp::from_ns(timeline.start_time),
            stop: Timestamp::from_ns(timeline.complete_time),
            creator: info.creator,
            critical: info.critical,
            fevent,
            wait_intervals: response.event_waits.clone(),
        };
        if info.critical.is_barrier() {
            self.record_barrier_use(owner, info.critical, info.op_id);
        }
        let diff = message.footprint();
        self.message_infos.push_back(message);
        owner.update_footprint(diff, self);
    }

    pub fn process_copy(
        &mut self,
        owner: &LegionProfiler,
        info: &ProfilingInfo,
        response: &ProfilingResponse,
        usage: &OperationMemoryUsage,
    ) {
        let timeline = required(response.timeline, "timeline", info);
        debug_assert!(!response.copy_info.is_empty());
        let fevent = response.finish_event.unwrap_or_default();
        let closure = info.extra.closure();
        let name = |inst| {
            closure
                .map(|closure| closure.find_instance_name(inst))
                .unwrap_or_default()
        };
        let mut inst_infos = Vec::new();
        for batch in &response.copy_info {
            debug_assert_eq!(batch.src_fields.len(), batch.dst_fields.len());
            if batch.is_indirect() {
                // Gathers and scatters log the indirection first, then every
                // combination of instances and fields they may have touched.
                let mut indirect = CopyInstInfo {
                    fevent,
                    num_hops: batch.num_hops,
                    indirect: true,
                    ..Default::default()
                };
                if let Some(src) = batch.src_indirection_inst {
                    indirect.src = src.location;
                    indirect.src_fid = batch.src_indirection_field;
                    indirect.src_inst = name(src);
                }
                if let Some(dst) = batch.dst_indirection_inst {
                    indirect.dst = dst.location;
                    indirect.dst_fid = batch.dst_indirection_field;
                    indirect.dst_inst = name(dst);
                }
                inst_infos.push(indirect);
                for &src in &batch.src_insts {
                    let src_inst = name(src);
                    for &dst in &batch.dst_insts {
                        let dst_inst = name(dst);
                        for &src_fid in &batch.src_fields {
                            for &dst_fid in &batch.dst_fields {
                                inst_infos.push(CopyInstInfo {
                                    src: src.location,
                                    dst: dst.location,
                                    src_fid,
                                    dst_fid,
                                    src_inst,
                                    dst_inst,
                                    fevent,
                                    num_hops: batch.num_hops,
                                    indirect: false,
                                });
                            }
                        }
                    }
                }
            } else {
                let (Some(&src), Some(&dst)) = (batch.src_insts.first(), batch.dst_insts.first())
                else {
                    continue;
                };
                let (src_inst, dst_inst) = (name(src), name(dst));
                for (&src_fid, &dst_fid) in batch.src_fields.iter().zip(&batch.dst_fields) {
                    inst_infos.push(CopyInstInfo {
                        src: src.location,
                        dst: dst.location,
                        src_fid,
                        dst_fid,
                        src_inst,
                        dst_inst,
                        fevent,
                        num_hops: batch.num_hops,
                        indirect: false,
                    });
                }
            }
        }
        let copy = CopyInfo {
            op_id: info.op_id,
            size: usage.size,
            create: Timestamp::from_ns(timeline.create_time),
            ready: Timestamp::from_ns(timeline.ready_time),
            start: Timestamp::from_ns(timeline.start_time),
            stop: Timestamp::from_ns(timeline.complete_time),
            creator: info.creator,
            critical: info.critical,
            fevent,
            collective: info.id as u32,
            inst_infos,
        };
        if info.critical.is_barrier() {
            self.record_barrier_use(owner, info.critical, info.op_id);
        }
        let diff = copy.footprint();
        self.copy_infos.push_back(copy);
        owner.update_footprint(diff, self);
    }

    pub fn process_fill(
        &mut self,
        owner: &LegionProfiler,
        info: &ProfilingInfo,
        response: &ProfilingResponse,
        usage: &OperationMemoryUsage,
    ) {
        let timeline = required(response.timeline, "timeline", info);
        let fevent = response.finish_event.unwrap_or_default();
        let closure = info.extra.closure();
        let mut inst_infos = Vec::new();
        for batch in &response.copy_info {
            debug_assert!(!batch.dst_fields.is_empty());
            let Some(&dst) = batch.dst_insts.first() else {
                continue;
            };
            let dst_inst = closure
                .map(|closure| closure.find_instance_name(dst))
                .unwrap_or_default();
            inst_infos.extend(batch.dst_fields.iter().map(|&fid| FillInstInfo {
                dst: dst.location,
                fid,
                dst_inst,
                fevent,
            }));
        }
        let fill = FillInfo {
            op_id: info.op_id,
            size: usage.size,
            create: Timestamp::from_ns(timeline.create_time),
            ready: Timestamp::from_ns(timeline.ready_time),
            start: Timestamp::from_ns(timeline.start_time),
            stop: Timestamp::from_ns(timeline.complete_time),
            creator: info.creator,
            critical: info.critical,
            fevent,
            inst_infos,
        };
        if info.critical.is_barrier() {
            self.record_barrier_use(owner, info.critical, info.op_id);
        }
        let diff = fill.footprint();
        self.fill_infos.push_back(fill);
        owner.update_footprint(diff, self);
    }

    pub fn process_inst_timeline(
        &mut self,
        owner: &LegionProfiler,
        info: &ProfilingInfo,
        usage: &InstanceMemoryUsage,
        timeline: &InstanceTimeline,
    ) {
        let timeline_info = InstTimelineInfo {
            inst_id: InstID(info.id),
            mem_id: usage.memory,
            size: usage.bytes,
            op_id: info.op_id,
            create: Timestamp::from_ns(timeline.create_time),
            ready: Timestamp::from_ns(timeline.ready_time),
            destroy: Timestamp::from_ns(timeline.delete_time),
            creator: info.creator,
            name: owner
                .runtime()
                .find_instance_name(usage.instance)
                .unwrap_or_default(),
        };
        let diff = timeline_info.footprint();
        self.inst_timeline_infos.push_back(timeline_info);
        owner.update_footprint(diff, self);
    }

    pub fn process_partition(
        &mut self,
        owner: &LegionProfiler,
        info: &ProfilingInfo,
        response: &ProfilingResponse,
    ) {
        // Partitions computed inline have no finish event and nothing to log.
        let Some(fevent) = response.finish_event.filter(EventID::exists) else {
            return;
        };
        let timeline = required(response.timeline, "timeline", info);
        let partition = PartitionInfo {
            op_id: info.op_id,
            part_op: info.id as i32,
            create: Timestamp::from_ns(timeline.create_time),
            ready: Timestamp::from_ns(timeline.ready_time),
            start: Timestamp::from_ns(timeline.start_time),
            stop: Timestamp::from_ns(timeline.complete_time),
            creator: info.creator,
            critical: info.critical,
            fevent,
        };
        if info.critical.is_barrier() {
            self.record_barrier_use(owner, info.critical, info.op_id);
        }
        let diff = partition.footprint();
        self.partition_infos.push_back(partition);
        owner.update_footprint(diff, self);
    }

    /// The probe task was created when the arrival happened and became
    /// ready when its precondition triggered; arrive on the barrier with
    /// those times so the barrier can pick out its last arrival.
    pub fn process_arrival(
        &mut self,
        owner: &LegionProfiler,
        info: &ProfilingInfo,
        timeline: &OperationTimeline,
    ) {
        let Some(trigger_time) = NonMaxI64::new(timeline.ready_time) else {
            warn!("barrier arrival probe reported an invalid ready time");
            return;
        };
        let arrival = ArrivalInfo::new(timeline.create_time, trigger_time, info.critical, info.creator);
        owner.runtime().arrive(
            EventID(info.id),
            info.extra.id2() as u32,
            info.critical,
            &arrival,
        );
    }

    /// Logs an implicit top-level task that ran on this thread, along with
    /// a wait covering it so the thread shows as blocked meanwhile.
    pub fn process_implicit(
        &mut self,
        owner: &LegionProfiler,
        op_id: OpID,
        task_id: TaskID,
        start: Timestamp,
        stop: Timestamp,
        waits: Vec<WaitInfo>,
        fevent: EventID,
    ) {
        let task = ImplicitTaskInfo(TaskInfo {
            op_id,
            task_id,
            variant_id: VariantID(0),
            proc_id: self.local_proc,
            create: start,
            ready: start,
            start,
            stop,
            creator: EventID::NO_EVENT,
            critical: EventID::NO_EVENT,
            fevent,
            wait_intervals: waits,
        });
        self.external_wait_infos.push(WaitInfo {
            wait_start: start,
            wait_ready: stop,
            wait_end: stop,
            wait_event: fevent,
        });
        let diff = task.footprint();
        self.implicit_infos.push_back(task);
        owner.update_footprint(diff, self);
    }

    pub fn process_mem_desc(&mut self, owner: &LegionProfiler, mem: MemID) {
        if mem == MemID::default() {
            return;
        }
        if let Err(index) = self.mem_ids.binary_search(&mem) {
            self.mem_ids.insert(index, mem);
            owner.record_memory(mem);
        }
    }

    pub fn process_proc_desc(&mut self, owner: &LegionProfiler, proc: ProcID) {
        if let Err(index) = self.proc_ids.binary_search(&proc) {
            self.proc_ids.insert(index, proc);
            owner.record_processor(proc);
        }
    }

    pub fn process_event_trigger(&mut self, owner: &LegionProfiler, info: EventTriggerInfo) {
        let diff = info.footprint();
        self.event_trigger_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    pub fn process_event_poison(&mut self, owner: &LegionProfiler, info: EventPoisonInfo) {
        let diff = info.footprint();
        self.event_poison_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    ///
    /// Calls and waits
    ///

    pub fn record_mapper_call(
        &mut self,
        owner: &LegionProfiler,
        mapper: MapperID,
        mapper_proc: ProcID,
        kind: MapperCallKindID,
        op_id: OpID,
        start: Timestamp,
        stop: Timestamp,
    ) {
        if stop.0.saturating_sub(start.0) < owner.minimum_call_threshold().0 {
            return;
        }
        let info = MapperCallInfo {
            mapper,
            mapper_proc,
            kind,
            op_id,
            start,
            stop,
            proc_id: self.local_proc,
            fevent: self.implicit_fevent,
        };
        let diff = info.footprint();
        self.mapper_call_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    pub fn record_runtime_call(
        &mut self,
        owner: &LegionProfiler,
        kind: RuntimeCallKindID,
        start: Timestamp,
        stop: Timestamp,
    ) {
        if stop.0.saturating_sub(start.0) < owner.minimum_call_threshold().0 {
            return;
        }
        let info = RuntimeCallInfo {
            kind,
            start,
            stop,
            proc_id: self.local_proc,
            fevent: self.implicit_fevent,
        };
        let diff = info.footprint();
        self.runtime_call_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    /// Application ranges are always kept, whatever their length.
    pub fn record_application_range(
        &mut self,
        owner: &LegionProfiler,
        pid: ProvenanceID,
        start: Timestamp,
        stop: Timestamp,
    ) {
        let info = ApplicationCallInfo {
            pid,
            start,
            stop,
            proc_id: self.local_proc,
            fevent: self.implicit_fevent,
        };
        let diff = info.footprint();
        self.application_call_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    pub fn record_event_wait(&mut self, owner: &LegionProfiler, event: EventID, backtrace: &Backtrace) {
        let info = EventWaitInfo {
            proc_id: self.local_proc,
            fevent: self.implicit_fevent,
            event,
            backtrace_id: owner.find_backtrace_id(backtrace),
        };
        if event.is_barrier() {
            self.record_barrier_use(owner, event, self.implicit_provenance);
        }
        let diff = info.footprint();
        self.event_wait_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    // Must not wait on anything: called from inside event waits.
    pub fn begin_external_wait(&mut self, event: EventID) {
        self.external_wait_infos.push(WaitInfo {
            wait_start: Timestamp::from_ns(current_time_in_nanoseconds()),
            wait_event: event,
            ..Default::default()
        });
    }

    pub fn end_external_wait(&mut self, event: EventID) {
        let Some(wait) = self.external_wait_infos.last_mut() else {
            warn!("external wait on {} ended without beginning", event);
            return;
        };
        debug_assert_eq!(wait.wait_event, event);
        wait.wait_ready = Timestamp::from_ns(current_time_in_nanoseconds());
        wait.wait_end = wait.wait_ready;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_proftask(
        &mut self,
        owner: &LegionProfiler,
        proc_id: ProcID,
        op_id: OpID,
        start: Timestamp,
        stop: Timestamp,
        creator: EventID,
        fevent: EventID,
        completion: bool,
    ) {
        let info = ProfTaskInfo {
            proc_id,
            op_id,
            start,
            stop,
            creator,
            fevent,
            completion,
        };
        let diff = info.footprint();
        self.prof_task_infos.push_back(info);
        owner.update_footprint(diff, self);
    }

    ///
    /// Draining
    ///

    fn drain<S: RecordSink>(&mut self, sink: &mut S, deadline: Option<i64>) -> usize {
        let mut drained = 0;
        drain_queues!(self, sink, deadline, drained;
            operation_instances,
            multi_tasks,
            slice_owners,
            task_infos,
            implicit_infos,
            gpu_task_infos,
            meta_infos,
            message_infos,
            fill_infos,
            copy_infos,
            inst_timeline_infos,
            partition_infos,
            mapper_call_infos,
            runtime_call_infos,
            application_call_infos,
            event_wait_infos,
            event_merger_infos,
            event_trigger_infos,
            event_poison_infos,
            barrier_arrival_infos,
            reservation_acquire_infos,
            instance_ready_infos,
            instance_redistrict_infos,
            completion_queue_infos,
            prof_task_infos,
        );
        drained
    }

    /// Writes out everything still buffered and returns the bytes freed.
    /// An external thread also writes the implicit task that covers its
    /// whole lifetime, followed by its waits.
    pub fn dump_state<S: RecordSink>(&mut self, owner: &LegionProfiler, sink: &mut S) -> usize {
        let drained = self.drain(sink, None);
        if self.external_fevent.exists() {
            let task = TaskInfo {
                op_id: owner.runtime().get_unique_operation_id(),
                task_id: owner.external_implicit_task(),
                variant_id: VariantID(0),
                proc_id: self.local_proc,
                create: self.external_start,
                ready: self.external_start,
                start: self.external_start,
                stop: Timestamp::from_ns(current_time_in_nanoseconds()),
                creator: EventID::NO_EVENT,
                critical: EventID::NO_EVENT,
                fevent: self.external_fevent,
                wait_intervals: mem::take(&mut self.external_wait_infos),
            };
            Implicit(&task).emit(sink);
        }
        drained
    }

    /// Writes buffered records in the same order as [`dump_state`] until
    /// `over * target_latency` microseconds have passed, and returns the
    /// bytes freed. At least one record is written if any is buffered.
    ///
    /// [`dump_state`]: RecordingContext::dump_state
    pub fn dump_inter<S: RecordSink>(&mut self, sink: &mut S, over: f64, target_latency: u64) -> usize {
        let budget = (over * target_latency as f64) as i64;
        let deadline = current_time_in_microseconds().saturating_add(budget);
        self.drain(sink, Some(deadline))
    }

    /// Bytes currently buffered, priced the same way as when appended.
    pub fn footprint(&self) -> usize {
        queued_footprint!(self;
            operation_instances,
            multi_tasks,
            slice_owners,
            task_infos,
            implicit_infos,
            gpu_task_infos,
            meta_infos,
            message_infos,
            fill_infos,
            copy_infos,
            inst_timeline_infos,
            partition_infos,
            mapper_call_infos,
            runtime_call_infos,
            application_call_infos,
            event_wait_infos,
            event_merger_infos,
            event_trigger_infos,
            event_poison_infos,
            barrier_arrival_infos,
            reservation_acquire_infos,
            instance_ready_infos,
            instance_redistrict_infos,
            completion_queue_infos,
            prof_task_infos,
        )
    }

    /// Number of buffered records, not counting sub-records.
    pub fn len(&self) -> usize {
        queued_len!(self;
            operation_instances,
            multi_tasks,
            slice_owners,
            task_infos,
            implicit_infos,
            gpu_task_infos,
            meta_infos,
            message_infos,
            fill_infos,
            copy_infos,
            inst_timeline_infos,
            partition_infos,
            mapper_call_infos,
            runtime_call_infos,
            application_call_infos,
            event_wait_infos,
            event_merger_infos,
            event_trigger_infos,
            event_poison_infos,
            barrier_arrival_infos,
            reservation_acquire_infos,
            instance_ready_infos,
            instance_redistrict_infos,
            completion_queue_infos,
            prof_task_infos,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Times a runtime call and records it when dropped.
///
/// Locks the context only on drop, so the caller must not be holding that
/// lock when the guard goes out of scope.
pub struct DetailedProfiler<'a> {
    profiler: &'a LegionProfiler,
    ctx: &'a ContextRef,
    kind: RuntimeCallKindID,
    start: Timestamp,
}

impl<'a> DetailedProfiler<'a> {
    pub fn new(profiler: &'a LegionProfiler, ctx: &'a ContextRef, kind: RuntimeCallKindID) -> Self {
        DetailedProfiler {
            profiler,
            ctx,
            kind,
            start: Timestamp::from_ns(current_time_in_nanoseconds()),
        }
    }
}

impl Drop for DetailedProfiler<'_> {
    fn drop(&mut self) {
        let stop = Timestamp::from_ns(current_time_in_nanoseconds());
        self.ctx
            .lock()
            .record_runtime_call(self.profiler, self.kind, self.start, stop);
    }
}
