//! The per-core reconstruction state machine: drives the parser,
//! replays every retired instruction against the program image, and
//! feeds the histogram.
//!
//! A trace stream does not list program counters; it lists *counts*
//! (instructions retired, branch outcomes) anchored by occasional full
//! addresses. Reconstruction walks the program image instruction by
//! instruction, spending those counts, predicting returns with a small
//! address stack, and resolving uninferable targets from the next
//! indirect-branch message. Hardware drops messages under FIFO
//! pressure, so every mid-stream inconsistency re-anchors at the next
//! sync instead of failing the run.

use log::{debug, warn};

use crate::analytics::Analytics;
use crate::count::{CountError, CountKind, Counts, ReturnStack};
use crate::histogram::{FlushHandle, Histogram, HistogramCallback};
use crate::image::InstructionSource;
use crate::inst::{self, DecodedInst, InstKind};
use crate::message::{BType, IctReason, NexusMessage, Payload, TCode};
use crate::parser::{ParserError, SliceParser};
use crate::stream::TraceStream;

/// Most cores a single trace stream can interleave. A deployment
/// constant (four `src` bits), not a protocol limit.
pub const MAX_CORES: usize = 16;

/// Whether the stream reports conditional branches individually (BTM)
/// or as packed history bits (HTM). Streams start as BTM and promote
/// to HTM at the first history-bearing message; encoders vary, so a
/// return that leaves counts pending promotes silently as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    Btm,
    Htm,
}

/// Construction-time configuration. Immutable once the profiler
/// exists.
#[derive(Debug, Clone)]
pub struct ProfilerOptions {
    /// Width of the core-id (`src`) field in every message; zero on
    /// single-core targets.
    pub src_bits: u8,
    /// Width of the timestamp counter, for wrap detection.
    pub ts_bits: u8,
    /// Timestamp clock in Hz; zero if unknown. Only used to convert
    /// reconstructed timestamps for display.
    pub frequency: u32,
}

impl Default for ProfilerOptions {
    fn default() -> ProfilerOptions {
        ProfilerOptions {
            src_bits: 0,
            ts_bits: 40,
            frequency: 0,
        }
    }
}

/// Why `generate_histogram` stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Progress {
    /// The byte queue ran dry mid-stream. Push more bytes (or raise
    /// end-of-data) and call again; decode resumes exactly where it
    /// stopped.
    NeedBytes,
    /// End-of-data reached and every queued byte decoded; the final
    /// callback has fired.
    Done,
}

/// Unrecoverable decode failures. Once returned, the profiler is
/// latched and every further call fails with [`TraceError::Latched`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceError {
    /// The stream contains message types this decoder does not
    /// implement; the capture does not match the decoder
    /// configuration.
    #[error("stream not decodable: {0}")]
    Stream(ParserError),

    /// Count bookkeeping lost agreement with the instruction stream.
    #[error("count sequencing: {0}")]
    Count(#[from] CountError),

    /// A message type arrived in a state that can never legally see
    /// it.
    #[error("message {tcode:?} cannot be retired")]
    UnexpectedRetire { tcode: TCode },

    /// An in-circuit-trace message combined an event source and
    /// `ckdf` the protocol does not define.
    #[error("invalid ICT event {cksrc:?} with ckdf {ckdf}")]
    InvalidIct { cksrc: IctReason, ckdf: u8 },

    /// A previous call already failed.
    #[error("profiler previously failed; create a new one")]
    Latched,
}

/// Call/return classification of one replayed instruction, for
/// analytics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallReturn {
    pub call: bool,
    pub ret: bool,
    pub swap: bool,
    pub exception: bool,
    pub exception_return: bool,
    pub interrupt: bool,
}

impl CallReturn {
    fn any(&self) -> bool {
        *self != CallReturn::default()
    }
}

/// Branch resolution of one replayed instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BranchFlag {
    None,
    /// A conditional branch is pending but the current message has no
    /// outcome for it (an i-cnt-only resource-full ran out first). Not
    /// an error: retire the message and retry under the next one.
    Unknown,
    Taken,
    NotTaken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for a sync-type message to anchor the PC.
    FirstSync,
    /// Anchored; the next count-bearing message starts replay.
    MsgWithCount,
    /// Replaying instructions under the loaded counts.
    NextInstruction,
    /// Counts drained; absorb the pending message's address effect.
    RetireMessage,
    /// Fetch the next count-bearing message mid-trace.
    NextMsg,
    Done,
    Error,
}

struct Core {
    state: State,
    current_pc: Option<u64>,
    last_faddr: u64,
    last_time: u64,
    counts: Counts,
    stack: ReturnStack,
    enter_isr: bool,
}

impl Core {
    fn new() -> Core {
        Core {
            state: State::FirstSync,
            current_pc: None,
            last_faddr: 0,
            last_time: 0,
            counts: Counts::new(),
            stack: ReturnStack::new(),
            enter_isr: false,
        }
    }
}

enum TsKind {
    Full,
    Relative,
}

/// One computed replay step.
struct StepOutcome {
    next: Option<u64>,
    flags: CallReturn,
    branch: BranchFlag,
    inst: DecodedInst,
}

/// Faults inside one replay step. Lookup and decode faults are
/// recoverable (lost sync); count faults are not.
enum StepError {
    Lookup(u64),
    Decode(u64),
    Count(CountError),
}

/// Nexus trace decoder and statistical profiler for one stream.
pub struct Profiler<S: InstructionSource> {
    parser: SliceParser,
    analytics: Analytics,
    image: S,
    options: ProfilerOptions,
    mode: TraceMode,
    cores: Vec<Core>,
    current_core: usize,
    /// The message being processed; `None` requests a fresh read.
    msg: Option<NexusMessage>,
    last_msg_end: u64,
    histogram: Histogram,
    finished: bool,
    latched: bool,
}

impl<S: InstructionSource> Profiler<S> {
    /// `stream` is the decoder's handle; keep a clone for the
    /// producer.
    pub fn new(stream: TraceStream, image: S, options: ProfilerOptions) -> Profiler<S> {
        let mut cores = Vec::with_capacity(MAX_CORES);
        for _ in 0..MAX_CORES {
            cores.push(Core::new());
        }

        Profiler {
            parser: SliceParser::new(stream, options.src_bits),
            analytics: Analytics::new(),
            image,
            options,
            mode: TraceMode::Btm,
            cores,
            current_core: 0,
            msg: None,
            last_msg_end: 0,
            histogram: Histogram::new(),
            finished: false,
            latched: false,
        }
    }

    /// Installs the progress callback; see [`HistogramCallback`].
    pub fn set_histogram_callback(&mut self, callback: HistogramCallback) {
        self.histogram.set_callback(callback);
    }

    /// Handle for out-of-band flush requests; see [`FlushHandle`].
    pub fn flush_handle(&self) -> FlushHandle {
        self.histogram.flush_handle()
    }

    pub fn histogram(&self) -> &std::collections::HashMap<u64, u64> {
        self.histogram.map()
    }

    pub fn instructions_retired(&self) -> u64 {
        self.histogram.instructions_retired()
    }

    pub fn clear_histogram(&mut self) {
        self.histogram.clear();
    }

    pub fn analytics(&self) -> &Analytics {
        &self.analytics
    }

    pub fn trace_mode(&self) -> TraceMode {
        self.mode
    }

    /// The replay PC of `core`, or `None` while it is unresolved or
    /// unanchored.
    pub fn current_pc(&self, core: u8) -> Option<u64> {
        self.cores.get(usize::from(core))?.current_pc
    }

    /// Depth of `core`'s predicted-return-address stack.
    pub fn return_stack_depth(&self, core: u8) -> usize {
        self.cores
            .get(usize::from(core))
            .map(|core| core.stack.depth())
            .unwrap_or(0)
    }

    /// Reconstructed (wrap-adjusted) timestamp of the last stamped
    /// message retired on `core`.
    pub fn last_timestamp(&self, core: u8) -> u64 {
        self.cores
            .get(usize::from(core))
            .map(|core| core.last_time)
            .unwrap_or(0)
    }

    /// Converts a reconstructed timestamp to seconds, if the timestamp
    /// clock frequency is known.
    pub fn seconds(&self, timestamp: u64) -> Option<f64> {
        if self.options.frequency == 0 {
            None
        } else {
            Some(timestamp as f64 / f64::from(self.options.frequency))
        }
    }

    /// Decodes queued bytes and aggregates retired PCs until the queue
    /// runs dry or ends. Call repeatedly as data arrives; the decode
    /// is insensitive to how the stream is fragmented across pushes.
    pub fn generate_histogram(&mut self) -> Result<Progress, TraceError> {
        if self.latched {
            return Err(TraceError::Latched);
        }
        if self.finished {
            return Ok(Progress::Done);
        }

        loop {
            if self.msg.is_none() {
                self.histogram.report_progress(self.last_msg_end);

                match self.read_message() {
                    Ok(true) => {}
                    Ok(false) => return Ok(Progress::NeedBytes),
                    Err(e) => {
                        self.latched = true;
                        self.cores[self.current_core].state = State::Error;
                        return Err(e);
                    }
                }
            }

            if self.finished {
                self.histogram.finish(self.last_msg_end);
                return Ok(Progress::Done);
            }

            if let Some(msg) = self.msg.take() {
                if let Err(e) = self.step(msg) {
                    self.latched = true;
                    self.cores[self.current_core].state = State::Error;
                    return Err(e);
                }
            }
        }
    }

    /// Reads the next message into `self.msg`. `Ok(false)` means the
    /// queue is dry; `self.finished` is set at end-of-data. Malformed
    /// messages and resync gaps reset the affected core and keep
    /// reading.
    fn read_message(&mut self) -> Result<bool, TraceError> {
        loop {
            match self.parser.read_message(&mut self.analytics) {
                Ok(Some(msg)) => {
                    self.last_msg_end = msg.end_offset();
                    self.current_core = usize::from(msg.core_id).min(MAX_CORES - 1);
                    self.promote_mode(&msg);
                    self.msg = Some(msg);
                    return Ok(true);
                }
                Ok(None) => {
                    // Garbage was skipped while re-aligning; whatever
                    // this core thought it knew is stale.
                    debug!("resync gap; re-anchoring core {}", self.current_core);
                    self.reset_core(self.current_core);
                }
                Err(ParserError::NeedBytes) => return Ok(false),
                Err(ParserError::EndOfStream) => {
                    self.finished = true;
                    for core in &mut self.cores {
                        if core.state != State::Error {
                            core.state = State::Done;
                        }
                    }
                    return Ok(true);
                }
                Err(ParserError::Malformed(m)) => {
                    warn!("malformed message ({}); re-anchoring", m);
                    self.reset_core(self.current_core);
                }
                Err(e) => return Err(TraceError::Stream(e)),
            }
        }
    }

    /// BTM→HTM promotion on sight of the first history-bearing
    /// message.
    fn promote_mode(&mut self, msg: &NexusMessage) {
        if self.mode == TraceMode::Htm {
            return;
        }

        let htm = match msg.payload {
            Payload::ResourceFull(..)
            | Payload::IndirectBranchHistory { .. }
            | Payload::IndirectBranchHistoryWithSync { .. } => true,
            Payload::Correlation { cdf, .. } => cdf == 1,
            _ => false,
        };
        if htm {
            debug!("history-bearing message: switching to HTM mode");
            self.mode = TraceMode::Htm;
        }
    }

    fn reset_core(&mut self, core_id: usize) {
        let core = &mut self.cores[core_id];
        core.current_pc = None;
        core.last_faddr = 0;
        core.last_time = 0;
        core.counts.reset();
        core.stack.reset();
        core.enter_isr = false;
        if core.state != State::Done && core.state != State::Error {
            core.state = State::FirstSync;
        }
    }

    /// Dispatches one message against its core's state. Handlers that
    /// keep working on the same message put it back in `self.msg`.
    fn step(&mut self, msg: NexusMessage) -> Result<(), TraceError> {
        match self.cores[self.current_core].state {
            State::FirstSync => self.first_sync(msg),
            State::MsgWithCount => self.msg_with_count(msg),
            State::NextInstruction => self.replay(msg),
            State::RetireMessage => self.retire(msg),
            State::NextMsg => self.next_msg(msg),
            // A message for a finished or failed core is dropped.
            State::Done | State::Error => Ok(()),
        }
    }

    /// Scan for a sync-type message to anchor the PC. Everything else
    /// just keeps the clock warm.
    fn first_sync(&mut self, msg: NexusMessage) -> Result<(), TraceError> {
        match msg.payload {
            _ if msg.is_sync() => {
                self.process_message(&msg)?;
                self.cores[self.current_core].state = State::MsgWithCount;
            }
            Payload::Error { etype } => {
                debug!("error marker (etype {}) while unanchored", etype);
                self.reset_core(self.current_core);
            }
            Payload::IctWithSync { .. } => {
                // Full-address events are safe to absorb before the
                // anchor; they seed `last_faddr` for later XORs.
                self.process_message(&msg)?;
            }
            _ => {
                // No address worth trusting yet; only track time.
                self.apply_relative_ts(&msg);
            }
        }
        Ok(())
    }

    /// Anchored: the first count-bearing message starts the replay.
    fn msg_with_count(&mut self, msg: NexusMessage) -> Result<(), TraceError> {
        match msg.payload {
            _ if msg.has_counts() => {
                let core = &mut self.cores[self.current_core];
                // No counts are valid from before the anchor.
                core.counts.reset();
                core.counts.load(&msg);
                core.state = State::NextInstruction;
                self.msg = Some(msg);
            }
            Payload::Error { .. } => {
                self.reset_core(self.current_core);
            }
            Payload::Ict { .. } | Payload::IctWithSync { .. } => {
                self.process_message(&msg)?;
            }
            _ => {
                self.apply_relative_ts(&msg);
            }
        }
        Ok(())
    }

    /// Mid-trace: load counts from the next count-bearing message.
    /// Unlike [`Self::msg_with_count`], existing counts survive: a
    /// resource-full history refill must not clobber a partially
    /// drained instruction count.
    fn next_msg(&mut self, msg: NexusMessage) -> Result<(), TraceError> {
        match msg.payload {
            _ if msg.has_counts() => {
                let core = &mut self.cores[self.current_core];
                core.counts.load(&msg);
                core.state = State::NextInstruction;
                self.msg = Some(msg);
            }
            Payload::Error { .. } => {
                self.reset_core(self.current_core);
            }
            Payload::Ict { .. } | Payload::IctWithSync { .. } => {
                self.process_message(&msg)?;
            }
            _ => {
                self.apply_relative_ts(&msg);
            }
        }
        Ok(())
    }

    /// Replays instructions under the loaded counts until they drain
    /// or the PC becomes unresolvable.
    fn replay(&mut self, msg: NexusMessage) -> Result<(), TraceError> {
        let tcode = msg.tcode();
        let core_id = self.current_core;

        loop {
            if self.cores[core_id].counts.kind() == CountKind::None {
                self.cores[core_id].state = State::RetireMessage;
                self.msg = Some(msg);
                return Ok(());
            }

            let addr = match self.cores[core_id].current_pc {
                Some(addr) => addr,
                None => {
                    // Counts pending but nowhere to replay from; wait
                    // for the next anchor rather than guessing.
                    debug!("counts pending with unresolved PC; re-anchoring");
                    self.reset_core(core_id);
                    self.msg = Some(msg);
                    return Ok(());
                }
            };

            // Tally before stepping; the duplicate suppression in the
            // histogram makes a retried instruction count once.
            self.histogram.record(addr);

            let outcome = match self.next_pc(addr, tcode) {
                Ok(outcome) => outcome,
                Err(StepError::Lookup(addr)) => {
                    warn!("no instruction at {:#x}; re-anchoring", addr);
                    self.reset_core(core_id);
                    self.msg = Some(msg);
                    return Ok(());
                }
                Err(StepError::Decode(addr)) => {
                    warn!("undecodable instruction at {:#x}; re-anchoring", addr);
                    self.reset_core(core_id);
                    self.msg = Some(msg);
                    return Ok(());
                }
                Err(StepError::Count(e)) => return Err(e.into()),
            };

            self.note_step(core_id, &outcome);

            match outcome.next {
                None if outcome.branch == BranchFlag::Unknown => {
                    // Retire the message and retry this instruction
                    // under the next one.
                    self.cores[core_id].state = State::RetireMessage;
                    self.msg = Some(msg);
                    return Ok(());
                }
                None if self.cores[core_id].counts.kind() != CountKind::None => {
                    // Counts left but the target is unknowable: the
                    // stream lost messages. Re-anchor at the next
                    // sync.
                    debug!(
                        "unresolved PC at {:#x} with counts pending; re-anchoring",
                        addr
                    );
                    self.cores[core_id].state = State::FirstSync;
                    self.msg = Some(msg);
                    return Ok(());
                }
                next => {
                    self.cores[core_id].current_pc = next;
                }
            }
        }
    }

    /// Analytics bookkeeping for one replayed instruction.
    fn note_step(&mut self, core_id: usize, outcome: &StepOutcome) {
        let mut flags = outcome.flags;
        if self.cores[core_id].enter_isr {
            flags.interrupt = true;
            self.cores[core_id].enter_isr = false;
        }

        self.analytics
            .record_instruction(core_id as u8, outcome.inst.size_bits);
        match outcome.branch {
            BranchFlag::Taken => self.analytics.record_branch(core_id as u8, true),
            BranchFlag::NotTaken => self.analytics.record_branch(core_id as u8, false),
            BranchFlag::None | BranchFlag::Unknown => {}
        }
        if flags.any() {
            self.analytics.record_call_return(core_id as u8, flags);
        }
    }

    /// Counts drained: absorb the pending message's address and time
    /// effects, then move on.
    fn retire(&mut self, msg: NexusMessage) -> Result<(), TraceError> {
        match msg.payload {
            Payload::Correlation { .. } => {
                // Trace stops here; the next trace window re-anchors.
                self.apply_relative_ts(&msg);
                self.cores[self.current_core].state = State::FirstSync;
            }
            _ if msg.has_counts() => {
                self.process_message(&msg)?;
                if msg.b_type() == Some(BType::Exception) {
                    self.cores[self.current_core].enter_isr = true;
                }
                self.cores[self.current_core].state = State::NextMsg;
            }
            _ => {
                return Err(TraceError::UnexpectedRetire { tcode: msg.tcode() });
            }
        }
        Ok(())
    }

    /// Applies a message's address and timestamp effects to its core,
    /// the counterpart of loading its counts. Sync-type messages also
    /// clear speculative state.
    fn process_message(&mut self, msg: &NexusMessage) -> Result<(), TraceError> {
        let core = &mut self.cores[self.current_core];

        match msg.payload {
            Payload::DirectBranch { .. }
            | Payload::ResourceFull(..)
            | Payload::Correlation { .. }
            | Payload::Ownership { .. }
            | Payload::AuxAccessWrite { .. }
            | Payload::DataAcquisition { .. } => {
                apply_ts(core, msg, TsKind::Relative, &self.options);
            }
            Payload::Error { .. } => {
                apply_ts(core, msg, TsKind::Relative, &self.options);
                core.last_faddr = 0;
                core.current_pc = None;
            }
            Payload::IndirectBranch { u_addr, .. }
            | Payload::IndirectBranchHistory { u_addr, .. } => {
                apply_ts(core, msg, TsKind::Relative, &self.options);
                core.last_faddr ^= u_addr << 1;
                core.current_pc = Some(core.last_faddr);
            }
            Payload::Sync { f_addr, .. }
            | Payload::DirectBranchWithSync { f_addr, .. }
            | Payload::IndirectBranchWithSync { f_addr, .. }
            | Payload::IndirectBranchHistoryWithSync { f_addr, .. } => {
                apply_ts(core, msg, TsKind::Full, &self.options);
                core.last_faddr = f_addr << 1;
                core.current_pc = Some(core.last_faddr);
                core.stack.reset();
                core.counts.reset();
            }
            Payload::Ict {
                cksrc,
                ckdf,
                ckdata,
            } => {
                apply_ts(core, msg, TsKind::Relative, &self.options);
                apply_ict(core, cksrc, ckdf, ckdata, false)?;
            }
            Payload::IctWithSync {
                cksrc,
                ckdf,
                ckdata,
            } => {
                apply_ts(core, msg, TsKind::Full, &self.options);
                apply_ict(core, cksrc, ckdf, ckdata, true)?;
            }
        }

        Ok(())
    }

    fn apply_relative_ts(&mut self, msg: &NexusMessage) {
        let core = &mut self.cores[self.current_core];
        apply_ts(core, msg, TsKind::Relative, &self.options);
    }

    /// Computes where one instruction at `addr` sends the PC, spending
    /// counts and maintaining the return stack. `tcode` is the message
    /// whose counts are draining: in BTM mode a conditional branch is
    /// taken exactly when it exhausts the count of a direct-branch
    /// message.
    fn next_pc(&mut self, addr: u64, tcode: TCode) -> Result<StepOutcome, StepError> {
        let Profiler {
            cores,
            image,
            mode,
            current_core,
            ..
        } = self;
        let core = &mut cores[*current_core];

        let raw = image
            .instruction_at(addr)
            .ok_or(StepError::Lookup(addr))?;
        let inst = inst::decode(raw, image.arch()).map_err(|_| StepError::Decode(addr))?;

        let size = inst.size_bytes();
        let units = inst.half_units();
        let ret_addr = addr + size;
        let target = (addr as i64).wrapping_add(i64::from(inst.imm)) as u64;

        let mut flags = CallReturn::default();
        let mut branch = BranchFlag::None;

        let mut next = match inst.kind {
            InstKind::Unknown => Some(addr + size),

            InstKind::CJ => Some(target),

            InstKind::Jal | InstKind::CJal => {
                if is_link(inst.rd) {
                    core.stack.push(ret_addr);
                    debug!(
                        "call at {:#x}: pushed {:#x}, depth {}",
                        addr,
                        ret_addr,
                        core.stack.depth()
                    );
                    flags.call = true;
                }
                Some(target)
            }

            InstKind::Jalr => {
                let next = if is_link(inst.rd) {
                    if !is_link(inst.rs1) {
                        core.stack.push(ret_addr);
                        flags.call = true;
                        None
                    } else if inst.rd != inst.rs1 {
                        let popped = core.stack.pop();
                        core.stack.push(ret_addr);
                        flags.swap = true;
                        popped
                    } else {
                        core.stack.push(ret_addr);
                        flags.call = true;
                        None
                    }
                } else if is_link(inst.rs1) {
                    flags.ret = true;
                    core.stack.pop()
                } else {
                    None
                };

                btm_uninferable(mode, core, units, addr, size, flags, next)
            }

            InstKind::CJr => {
                let next = if is_link(inst.rs1) {
                    flags.ret = true;
                    core.stack.pop()
                } else {
                    None
                };

                btm_uninferable(mode, core, units, addr, size, flags, next)
            }

            InstKind::CJalr => {
                let next = if inst.rs1 == 5 {
                    let popped = core.stack.pop();
                    core.stack.push(ret_addr);
                    flags.swap = true;
                    popped
                } else {
                    core.stack.push(ret_addr);
                    flags.call = true;
                    None
                };

                btm_uninferable(mode, core, units, addr, size, flags, next)
            }

            kind if inst.is_branch => {
                debug_assert!(matches!(
                    kind,
                    InstKind::Beq
                        | InstKind::Bne
                        | InstKind::Blt
                        | InstKind::Bge
                        | InstKind::Bltu
                        | InstKind::Bgeu
                        | InstKind::CBeqz
                        | InstKind::CBnez
                ));

                if *mode == TraceMode::Htm {
                    match core.counts.kind() {
                        CountKind::History => {
                            let taken =
                                core.counts.consume_history().map_err(StepError::Count)?;
                            if taken {
                                branch = BranchFlag::Taken;
                                Some(target)
                            } else {
                                branch = BranchFlag::NotTaken;
                                Some(addr + size)
                            }
                        }
                        CountKind::Taken => {
                            core.counts.consume_taken().map_err(StepError::Count)?;
                            branch = BranchFlag::Taken;
                            Some(target)
                        }
                        CountKind::NotTaken => {
                            core.counts.consume_not_taken().map_err(StepError::Count)?;
                            branch = BranchFlag::NotTaken;
                            Some(addr + size)
                        }
                        // Only the instruction count is loaded: the
                        // encoder overflowed before emitting history
                        // for this branch. Retire and retry.
                        CountKind::ICnt | CountKind::None => {
                            branch = BranchFlag::Unknown;
                            None
                        }
                    }
                } else {
                    // BTM: a conditional is taken exactly when it
                    // exhausts a direct-branch message's count.
                    if core.counts.i_cnt() > units as i32 {
                        branch = BranchFlag::NotTaken;
                        Some(addr + size)
                    } else if tcode == TCode::DirectBranch
                        || tcode == TCode::DirectBranchWithSync
                    {
                        branch = BranchFlag::Taken;
                        Some(target)
                    } else {
                        branch = BranchFlag::NotTaken;
                        Some(addr + size)
                    }
                }
            }

            InstKind::Ebreak | InstKind::CEbreak | InstKind::Ecall => {
                flags.exception = true;
                None
            }

            InstKind::Mret | InstKind::Sret | InstKind::Uret => {
                flags.exception_return = true;
                None
            }

            _ => Some(addr + size),
        };

        if branch != BranchFlag::Unknown {
            core.counts
                .consume_i_cnt(units)
                .map_err(StepError::Count)?;
        } else {
            next = None;
        }

        Ok(StepOutcome {
            next,
            flags,
            branch,
            inst,
        })
    }
}

fn is_link(reg: u8) -> bool {
    reg == 1 || reg == 5
}

/// BTM-mode fixups shared by the uninferable jumps (`jalr`, `c.jr`,
/// `c.jalr`).
///
/// A predicted return that leaves counts pending exposes a
/// history-mode encoder: promote. In true BTM the only way counts can
/// remain is a jump to the very next instruction.
fn btm_uninferable(
    mode: &mut TraceMode,
    core: &mut Core,
    units: u32,
    addr: u64,
    size: u64,
    flags: CallReturn,
    next: Option<u64>,
) -> Option<u64> {
    if *mode == TraceMode::Btm
        && (flags.ret || flags.swap)
        && core.counts.i_cnt() > units as i32
    {
        debug!("return with counts pending at {:#x}: switching to HTM mode", addr);
        *mode = TraceMode::Htm;
    }

    if *mode == TraceMode::Btm {
        if core.counts.i_cnt() > units as i32 {
            Some(addr + size)
        } else {
            None
        }
    } else {
        next
    }
}

/// Reconstructs a core's absolute time from a message's raw timestamp
/// field. Full timestamps replace the low bits; relative ones XOR in a
/// delta. Either way a backwards step is a counter wrap.
fn apply_ts(core: &mut Core, msg: &NexusMessage, kind: TsKind, options: &ProfilerOptions) {
    let raw = match msg.timestamp {
        Some(raw) => raw,
        None => return,
    };

    let ts_bits = u32::from(options.ts_bits.min(63));
    let span = 1u64 << ts_bits;
    let last = core.last_time;

    let mut ts = match kind {
        TsKind::Full => raw.wrapping_add(last & !(span - 1)),
        TsKind::Relative => {
            if last != 0 {
                last ^ raw
            } else {
                0
            }
        }
    };

    if ts < last {
        ts += span;
    }

    core.last_time = ts;
}

/// Address bookkeeping for in-circuit-trace events. Full-address
/// (`with-sync`) events replace `last_faddr`; plain ones XOR into it.
/// Which events move the PC depends on the event source: instruction
/// trace markers (control, triggers, watchpoints at `ckdf` 0) must
/// not, because no count says when.
fn apply_ict(
    core: &mut Core,
    cksrc: IctReason,
    ckdf: u8,
    ckdata: [u64; 2],
    full: bool,
) -> Result<(), TraceError> {
    let resolve = |core: &Core, value: u64| {
        if full {
            value << 1
        } else {
            core.last_faddr ^ (value << 1)
        }
    };

    match (cksrc, ckdf) {
        (IctReason::ExtTrigger, 0) | (IctReason::Watchpoint, 0) => {
            core.last_faddr = resolve(core, ckdata[0]);
        }
        (IctReason::ExtTrigger, 1) | (IctReason::Watchpoint, 1) => {
            core.last_faddr = resolve(core, ckdata[0]);
            core.current_pc = Some(core.last_faddr);
        }
        (IctReason::InferableCall, 0) => {
            let pc = resolve(core, ckdata[0]);
            core.current_pc = Some(pc);
            core.last_faddr = pc;
        }
        (IctReason::InferableCall, 1) => {
            let pc = resolve(core, ckdata[0]);
            core.current_pc = Some(pc);
            core.last_faddr = pc ^ (ckdata[1] << 1);
        }
        (IctReason::Exception, 1) | (IctReason::Interrupt, 1) | (IctReason::Context, 1) => {
            core.last_faddr = resolve(core, ckdata[0]);
            core.current_pc = Some(core.last_faddr);
        }
        (IctReason::PcSample, 0) => {
            core.last_faddr = resolve(core, ckdata[0]);
            core.current_pc = Some(core.last_faddr);
        }
        (IctReason::Control, 0) => {
            // Pure control marker; carries no address.
        }
        (IctReason::Control, 1) => {
            core.last_faddr = resolve(core, ckdata[0]);
            core.current_pc = Some(core.last_faddr);
        }
        (cksrc, ckdf) => return Err(TraceError::InvalidIct { cksrc, ckdf }),
    }

    Ok(())
}
