//! The Nexus trace message model: every message the parser can produce,
//! plus the small field vocabularies (sync reasons, branch types, ICT
//! event sources) shared with the reconstruction state machine.

/// Message type discriminator. Six bits on the wire, leading every
/// message. The numbering is fixed by the Nexus standard; gaps are
/// TCODEs this decoder recognizes but does not implement (data-read and
/// data-write tracing among them).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TCode {
    DebugStatus = 0,
    DeviceId = 1,
    Ownership = 2,
    DirectBranch = 3,
    IndirectBranch = 4,
    DataWrite = 5,
    DataRead = 6,
    DataAcquisition = 7,
    Error = 8,
    Sync = 9,
    Correction = 10,
    DirectBranchWithSync = 11,
    IndirectBranchWithSync = 12,
    DataWriteWithSync = 13,
    DataReadWithSync = 14,
    Watchpoint = 15,
    OutputPortReplacement = 20,
    InputPortReplacement = 21,
    AuxAccessRead = 22,
    AuxAccessWrite = 23,
    AuxAccessReadNext = 24,
    AuxAccessWriteNext = 25,
    AuxAccessResponse = 26,
    ResourceFull = 27,
    IndirectBranchHistory = 28,
    IndirectBranchHistoryWithSync = 29,
    RepeatBranch = 30,
    RepeatInstruction = 31,
    RepeatInstructionWithSync = 32,
    Correlation = 33,
    Ict = 34,
    IctWithSync = 35,
}

impl TCode {
    /// Maps a raw 6-bit TCODE field to its discriminator, if the value
    /// is one the standard defines.
    pub fn from_raw(raw: u8) -> Option<TCode> {
        use TCode::*;
        Some(match raw {
            0 => DebugStatus,
            1 => DeviceId,
            2 => Ownership,
            3 => DirectBranch,
            4 => IndirectBranch,
            5 => DataWrite,
            6 => DataRead,
            7 => DataAcquisition,
            8 => Error,
            9 => Sync,
            10 => Correction,
            11 => DirectBranchWithSync,
            12 => IndirectBranchWithSync,
            13 => DataWriteWithSync,
            14 => DataReadWithSync,
            15 => Watchpoint,
            20 => OutputPortReplacement,
            21 => InputPortReplacement,
            22 => AuxAccessRead,
            23 => AuxAccessWrite,
            24 => AuxAccessReadNext,
            25 => AuxAccessWriteNext,
            26 => AuxAccessResponse,
            27 => ResourceFull,
            28 => IndirectBranchHistory,
            29 => IndirectBranchHistoryWithSync,
            30 => RepeatBranch,
            31 => RepeatInstruction,
            32 => RepeatInstructionWithSync,
            33 => Correlation,
            34 => Ict,
            35 => IctWithSync,
            _ => return None,
        })
    }
}

/// Why the encoder emitted a synchronizing message. Carried by `Sync`
/// and every `*WithSync` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SyncReason {
    /// External trigger input.
    Evti,
    /// The core left reset.
    ExitReset,
    /// Periodic synchronization (message counter expired).
    TCount,
    /// The core left debug mode.
    ExitDebug,
    /// The instruction counter was about to overflow.
    ICntOverflow,
    /// Tracing was just enabled.
    TraceEnable,
    /// A watchpoint fired.
    Watchpoint,
    /// The trace FIFO overran; messages were lost.
    FifoOverrun,
    /// The core left a powerdown state.
    ExitPowerdown,
    /// Contention on the message infrastructure.
    MessageContention,
    /// Periodic PC sample.
    PcSample,
}

impl SyncReason {
    pub fn from_raw(raw: u8) -> Option<SyncReason> {
        use SyncReason::*;
        Some(match raw {
            0 => Evti,
            1 => ExitReset,
            2 => TCount,
            3 => ExitDebug,
            4 => ICntOverflow,
            5 => TraceEnable,
            6 => Watchpoint,
            7 => FifoOverrun,
            9 => ExitPowerdown,
            11 => MessageContention,
            15 => PcSample,
            _ => return None,
        })
    }
}

/// Classifies the control transfer that produced an indirect-branch
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BType {
    /// An ordinary indirect jump (`jalr` family).
    Indirect,
    /// An exception or interrupt redirected control.
    Exception,
    /// A hardware event (e.g. debug entry) redirected control.
    Hardware,
}

impl BType {
    pub fn from_raw(raw: u8) -> Option<BType> {
        Some(match raw {
            0 => BType::Indirect,
            1 => BType::Exception,
            2 => BType::Hardware,
            _ => return None,
        })
    }
}

/// Event source of an in-circuit-trace message (`cksrc` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum IctReason {
    Control,
    ExtTrigger,
    InferableCall,
    Exception,
    Interrupt,
    Context,
    Watchpoint,
    PcSample,
}

impl IctReason {
    pub fn from_raw(raw: u8) -> Option<IctReason> {
        use IctReason::*;
        Some(match raw {
            0 => Control,
            8 => ExtTrigger,
            9 => InferableCall,
            10 => Exception,
            11 => Interrupt,
            13 => Context,
            14 => Watchpoint,
            15 => PcSample,
            _ => return None,
        })
    }
}

/// The single count a resource-full message reloads. The `rcode` field
/// selects which of the four count kinds ran out encoder-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceFull {
    /// `rcode` 0: instruction count, in half-instruction units.
    ICnt(u32),
    /// `rcode` 1: branch history bits, stop bit at the top.
    History(u64),
    /// `rcode` 8: number of consecutive taken branches.
    TakenCount(u32),
    /// `rcode` 9: number of consecutive not-taken branches.
    NotTakenCount(u32),
}

/// Variant payload of a decoded message.
///
/// Addresses (`u_addr`, `f_addr`, `ckdata`) are stored exactly as they
/// appear on the wire: right-shifted by one because instructions are
/// half-word aligned. The replay left-shifts when forming a PC.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Payload {
    /// An inferable branch was taken (TCODE 3).
    DirectBranch { i_cnt: u32 },

    /// An uninferable branch was taken; `u_addr` is the XOR of the new
    /// PC with the previously reported address (TCODE 4).
    IndirectBranch { b_type: BType, i_cnt: u32, u_addr: u64 },

    /// Periodic or event-driven synchronization carrying a full
    /// absolute address (TCODE 9).
    Sync { sync: SyncReason, i_cnt: u32, f_addr: u64 },

    /// Direct branch promoted to carry a full address (TCODE 11).
    DirectBranchWithSync { sync: SyncReason, i_cnt: u32, f_addr: u64 },

    /// Indirect branch promoted to carry a full address (TCODE 12).
    IndirectBranchWithSync {
        sync: SyncReason,
        b_type: BType,
        i_cnt: u32,
        f_addr: u64,
    },

    /// Indirect branch plus the conditional-branch history accumulated
    /// since the last message (TCODE 28).
    IndirectBranchHistory {
        b_type: BType,
        i_cnt: u32,
        u_addr: u64,
        history: u64,
    },

    /// History variant carrying a full address (TCODE 29).
    IndirectBranchHistoryWithSync {
        sync: SyncReason,
        b_type: BType,
        i_cnt: u32,
        f_addr: u64,
        history: u64,
    },

    /// An encoder-side counter filled up without a natural message
    /// boundary (TCODE 27).
    ResourceFull(ResourceFull),

    /// Trace is stopping or pausing; `history` is present iff
    /// `cdf == 1` (TCODE 33).
    Correlation {
        evcode: u8,
        cdf: u8,
        i_cnt: u32,
        history: Option<u64>,
    },

    /// The encoder dropped messages (FIFO overrun or similar); decoder
    /// state is stale (TCODE 8).
    Error { etype: u8 },

    /// The OS reported a context switch (TCODE 2).
    Ownership { process: u64 },

    /// A write through the auxiliary access port (TCODE 23).
    AuxAccessWrite { addr: u64, data: u64 },

    /// A data-acquisition write, typically an ITC mailbox (TCODE 7).
    DataAcquisition { idtag: u64, data: u64 },

    /// In-circuit-trace event: watchpoints, external triggers,
    /// exceptions, periodic PC samples (TCODE 34). `ckdata[1]` is only
    /// meaningful when `ckdf == 1`.
    Ict {
        cksrc: IctReason,
        ckdf: u8,
        ckdata: [u64; 2],
    },

    /// In-circuit-trace event with full (not XOR-compressed) addresses
    /// (TCODE 35).
    IctWithSync {
        cksrc: IctReason,
        ckdf: u8,
        ckdata: [u64; 2],
    },
}

/// One decoded trace message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NexusMessage {
    /// Source core, from the `src` field (zero on single-core
    /// deployments, where the field has zero width).
    pub core_id: u8,

    /// Raw timestamp field, if the message carried one. Full or
    /// relative interpretation depends on the TCODE; the replay engine
    /// reconstructs absolute time.
    pub timestamp: Option<u64>,

    /// Byte offset of the first slice of this message in the stream.
    pub offset: u64,

    /// Encoded length in bytes (slices).
    pub len: u32,

    pub payload: Payload,
}

impl NexusMessage {
    pub fn tcode(&self) -> TCode {
        match self.payload {
            Payload::DirectBranch { .. } => TCode::DirectBranch,
            Payload::IndirectBranch { .. } => TCode::IndirectBranch,
            Payload::Sync { .. } => TCode::Sync,
            Payload::DirectBranchWithSync { .. } => TCode::DirectBranchWithSync,
            Payload::IndirectBranchWithSync { .. } => TCode::IndirectBranchWithSync,
            Payload::IndirectBranchHistory { .. } => TCode::IndirectBranchHistory,
            Payload::IndirectBranchHistoryWithSync { .. } => TCode::IndirectBranchHistoryWithSync,
            Payload::ResourceFull(..) => TCode::ResourceFull,
            Payload::Correlation { .. } => TCode::Correlation,
            Payload::Error { .. } => TCode::Error,
            Payload::Ownership { .. } => TCode::Ownership,
            Payload::AuxAccessWrite { .. } => TCode::AuxAccessWrite,
            Payload::DataAcquisition { .. } => TCode::DataAcquisition,
            Payload::Ict { .. } => TCode::Ict,
            Payload::IctWithSync { .. } => TCode::IctWithSync,
        }
    }

    /// The full (absolute, right-shifted) address, for message types
    /// that carry one.
    pub fn f_addr(&self) -> Option<u64> {
        match self.payload {
            Payload::Sync { f_addr, .. }
            | Payload::DirectBranchWithSync { f_addr, .. }
            | Payload::IndirectBranchWithSync { f_addr, .. }
            | Payload::IndirectBranchHistoryWithSync { f_addr, .. } => Some(f_addr),
            _ => None,
        }
    }

    /// The XOR-compressed (right-shifted) address, for message types
    /// that carry one.
    pub fn u_addr(&self) -> Option<u64> {
        match self.payload {
            Payload::IndirectBranch { u_addr, .. }
            | Payload::IndirectBranchHistory { u_addr, .. } => Some(u_addr),
            _ => None,
        }
    }

    pub fn sync_reason(&self) -> Option<SyncReason> {
        match self.payload {
            Payload::Sync { sync, .. }
            | Payload::DirectBranchWithSync { sync, .. }
            | Payload::IndirectBranchWithSync { sync, .. }
            | Payload::IndirectBranchHistoryWithSync { sync, .. } => Some(sync),
            _ => None,
        }
    }

    pub fn b_type(&self) -> Option<BType> {
        match self.payload {
            Payload::IndirectBranch { b_type, .. }
            | Payload::IndirectBranchWithSync { b_type, .. }
            | Payload::IndirectBranchHistory { b_type, .. }
            | Payload::IndirectBranchHistoryWithSync { b_type, .. } => Some(b_type),
            _ => None,
        }
    }

    /// True for the message types that load the count engine and hence
    /// release the state machine into instruction replay.
    pub fn has_counts(&self) -> bool {
        matches!(
            self.payload,
            Payload::DirectBranch { .. }
                | Payload::IndirectBranch { .. }
                | Payload::Sync { .. }
                | Payload::DirectBranchWithSync { .. }
                | Payload::IndirectBranchWithSync { .. }
                | Payload::IndirectBranchHistory { .. }
                | Payload::IndirectBranchHistoryWithSync { .. }
                | Payload::ResourceFull(..)
                | Payload::Correlation { .. }
        )
    }

    /// True for `Sync` and every `*WithSync` variant: messages that
    /// carry an absolute address and reset speculative per-core state.
    pub fn is_sync(&self) -> bool {
        matches!(
            self.payload,
            Payload::Sync { .. }
                | Payload::DirectBranchWithSync { .. }
                | Payload::IndirectBranchWithSync { .. }
                | Payload::IndirectBranchHistoryWithSync { .. }
        )
    }

    /// End offset of this message in the stream; what progress
    /// callbacks report as `bytes_processed`.
    pub fn end_offset(&self) -> u64 {
        self.offset + u64::from(self.len)
    }
}
