//! Event graph facts shipped to the node that created the event.
//!
//! An event triggered or poisoned away from its creator is logged both
//! where it happened and on the creator, so a partial set of logs that
//! includes the creator can still place it.

use crate::error::ProfError;
use crate::instance::RecordingContext;
use crate::profiler::LegionProfiler;
use crate::records::{EventPoisonInfo, EventTriggerInfo};
use crate::runtime::ProfilerMessageKind;
use crate::serde::binary;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfilerMessage {
    EventTrigger(EventTriggerInfo),
    EventPoison(EventPoisonInfo),
}

impl ProfilerMessage {
    pub fn kind(&self) -> ProfilerMessageKind {
        match self {
            ProfilerMessage::EventTrigger(_) => ProfilerMessageKind::EventTrigger,
            ProfilerMessage::EventPoison(_) => ProfilerMessageKind::EventPoison,
        }
    }

    /// Payload in the binary log's field encoding.
    pub fn encode(&self) -> crate::serde::Result<Vec<u8>> {
        let mut payload = Vec::new();
        match self {
            ProfilerMessage::EventTrigger(info) => binary::to_bytes(info, &mut payload)?,
            ProfilerMessage::EventPoison(info) => binary::to_bytes(info, &mut payload)?,
        }
        Ok(payload)
    }

    pub fn decode(kind: ProfilerMessageKind, payload: &[u8]) -> Result<Self, ProfError> {
        Ok(match kind {
            ProfilerMessageKind::EventTrigger => {
                ProfilerMessage::EventTrigger(binary::from_bytes(payload)?)
            }
            ProfilerMessageKind::EventPoison => {
                ProfilerMessage::EventPoison(binary::from_bytes(payload)?)
            }
        })
    }
}

impl LegionProfiler {
    /// Records a fact sent by another node into `ctx`.
    pub fn handle_profiler_message(
        &self,
        ctx: &mut RecordingContext,
        kind: ProfilerMessageKind,
        payload: &[u8],
    ) -> Result<(), ProfError> {
        match ProfilerMessage::decode(kind, payload)? {
            ProfilerMessage::EventTrigger(info) => ctx.process_event_trigger(self, info),
            ProfilerMessage::EventPoison(info) => ctx.process_event_poison(self, info),
        }
        Ok(())
    }
}
