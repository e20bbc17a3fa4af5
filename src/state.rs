use std::fmt;

use derive_more::{Add, From, LowerHex, Sub};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

// Make sure this is up to date with lowlevel.h
#[derive(
    Debug,
    Copy,
    Clone,
    Default,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize,
    Deserialize,
)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum ProcKind {
    GPU = 1,
    #[default]
    CPU = 2,
    Utility = 3,
    IO = 4,
    ProcGroup = 5,
    ProcSet = 6,
    OpenMP = 7,
    Python = 8,
}

// Make sure this is up to date with lowlevel.h
#[derive(
    Debug,
    Copy,
    Clone,
    Default,
    Eq,
    PartialEq,
    PartialOrd,
    Ord,
    IntoPrimitive,
    TryFromPrimitive,
    Serialize,
    Deserialize,
)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum MemKind {
    #[default]
    NoMemKind = 0,
    Global = 1,
    System = 2,
    Registered = 3,
    Socket = 4,
    ZeroCopy = 5,
    Framebuffer = 6,
    Disk = 7,
    HDF5 = 8,
    File = 9,
    L3Cache = 10,
    L2Cache = 11,
    L1Cache = 12,
    GPUManaged = 13,
    GPUDynamic = 14,
}

impl fmt::Display for MemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemKind::ZeroCopy => write!(f, "Zero-Copy"),
            _ => write!(f, "{:?}", self),
        }
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Default,
    Add,
    Sub,
    From,
    Serialize,
    Deserialize,
)]
pub struct Timestamp(pub u64 /* ns */);

impl Timestamp {
    pub const fn from_us(microseconds: u64) -> Timestamp {
        Timestamp(microseconds.saturating_mul(1000))
    }
    pub fn to_us(&self) -> f64 {
        self.0 as f64 / 1000.0
    }
    /// Clock readings are signed; anything before the epoch clamps to zero.
    pub fn from_ns(nanoseconds: i64) -> Timestamp {
        Timestamp(u64::try_from(nanoseconds).unwrap_or(0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Time is stored in nanoseconds. But it is displayed in microseconds.
        let nanoseconds = self.0;
        let divisor = 1000;
        let microseconds = nanoseconds / divisor;
        let remainder = nanoseconds % divisor;
        write!(f, "{}.{:0>3}", microseconds, remainder)
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct NodeID(pub u64);

impl fmt::Display for NodeID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    LowerHex,
    Serialize,
    Deserialize,
)]
pub struct ProcID(pub u64);

impl ProcID {
    // Important: keep this in sync with realm/id.h
    // PROCESSOR:   tag:8 = 0x1d, owner_node:16,   (unused):28, proc_idx: 12
    // owner_node = proc_id[55:40]
    // proc_idx = proc_id[11:0]
    pub const NO_PROC: ProcID = ProcID(0);

    pub fn new(node: NodeID, proc_idx: u64) -> ProcID {
        ProcID((0x1d << 56) | ((node.0 & 0xffff) << 40) | (proc_idx & ((1 << 12) - 1)))
    }
    pub fn exists(&self) -> bool {
        self.0 != 0
    }
    pub fn node_id(&self) -> NodeID {
        NodeID((self.0 >> 40) & ((1 << 16) - 1))
    }
    pub fn proc_in_node(&self) -> u64 {
        (self.0) & ((1 << 12) - 1)
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    LowerHex,
    Serialize,
    Deserialize,
)]
pub struct MemID(pub u64);

impl MemID {
    // Important: keep this in sync with realm/id.h
    // MEMORY:      tag:8 = 0x1e, owner_node:16,   (unused):32, mem_idx: 8
    // owner_node = mem_id[55:40]
    pub fn new(node: NodeID, mem_idx: u64) -> MemID {
        MemID((0x1e << 56) | ((node.0 & 0xffff) << 40) | (mem_idx & ((1 << 8) - 1)))
    }
    pub fn node_id(&self) -> NodeID {
        NodeID((self.0 >> 40) & ((1 << 16) - 1))
    }
    pub fn mem_in_node(&self) -> u64 {
        (self.0) & ((1 << 8) - 1)
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    LowerHex,
    Serialize,
    Deserialize,
)]
pub struct InstID(pub u64);

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    LowerHex,
    Serialize,
    Deserialize,
)]
pub struct EventID(pub u64);

/// Realm limits each barrier to this many generations.
pub const MAX_PHASES: u64 = 1 << 20;

impl EventID {
    // Important: keep this in sync with realm/id.h
    // EVENT:       tag:1 = 0b1, creator_node:16, gen_event_idx: 27, generation: 20
    // creator_node = event_id[62:47]
    // BARRIER:     tag:4 = 0x2, creator_node:16, barrier_idx: 24, generation: 20
    // creator_node = event_id[59:44]
    pub const NO_EVENT: EventID = EventID(0);

    const GENERATION_MASK: u64 = (1 << 20) - 1;

    pub fn make_event(node: NodeID, event_idx: u64, generation: u64) -> EventID {
        EventID(
            (1 << 63)
                | ((node.0 & 0xffff) << 47)
                | ((event_idx & ((1 << 27) - 1)) << 20)
                | (generation & Self::GENERATION_MASK),
        )
    }
    pub fn make_barrier(node: NodeID, barrier_idx: u64, generation: u64) -> EventID {
        EventID(
            (0x2 << 60)
                | ((node.0 & 0xffff) << 44)
                | ((barrier_idx & ((1 << 24) - 1)) << 20)
                | (generation & Self::GENERATION_MASK),
        )
    }

    pub fn exists(&self) -> bool {
        self.0 != 0
    }
    pub fn is_barrier(&self) -> bool {
        (self.0 >> 60) == 0x2
    }
    pub fn node_id(&self) -> NodeID {
        if self.is_barrier() {
            NodeID((self.0 >> 44) & ((1 << 16) - 1))
        } else {
            NodeID((self.0 >> 47) & ((1 << 16) - 1))
        }
    }
    pub fn generation(&self) -> u64 {
        self.0 & Self::GENERATION_MASK
    }
    pub fn barrier_idx(&self) -> u64 {
        debug_assert!(self.is_barrier());
        (self.0 >> 20) & ((1 << 24) - 1)
    }
    /// The same barrier one generation earlier, or `NO_EVENT` before the first.
    pub fn get_previous_phase(&self) -> EventID {
        if self.generation() > 1 {
            EventID(self.0 - 1)
        } else {
            EventID::NO_EVENT
        }
    }
    /// The same barrier one generation later.
    pub fn get_next_phase(&self) -> Option<EventID> {
        if self.generation() + 1 < MAX_PHASES {
            Some(EventID(self.0 + 1))
        } else {
            None
        }
    }
}

impl fmt::Display for EventID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    From,
    Serialize,
    Deserialize,
)]
pub struct OpID(pub u64);

impl OpID {
    pub const ZERO: OpID = OpID(0);
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    From,
    Serialize,
    Deserialize,
)]
pub struct TaskID(pub u32);

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    From,
    Serialize,
    Deserialize,
)]
pub struct VariantID(pub u32);

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    From,
    Serialize,
    Deserialize,
)]
pub struct FieldID(pub u32);

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    From,
    Serialize,
    Deserialize,
)]
pub struct MapperID(pub u32);

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    From,
    Serialize,
    Deserialize,
)]
pub struct MapperCallKindID(pub u32);

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    From,
    Serialize,
    Deserialize,
)]
pub struct RuntimeCallKindID(pub u32);

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    From,
    Serialize,
    Deserialize,
)]
pub struct ProvenanceID(pub u64);

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    From,
    Serialize,
    Deserialize,
)]
pub struct BacktraceID(pub u64);
