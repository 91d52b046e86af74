//! Count bookkeeping for one core: how many instructions, branch
//! outcomes, or history bits the current trace message still owes the
//! replay loop, plus the predicted-return-address stack.

use log::debug;

use crate::message::{NexusMessage, Payload, ResourceFull};

/// Which count the replay is currently draining. The kinds are
/// prioritized: history bits outrank taken/not-taken runs, which
/// outrank the plain instruction count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountKind {
    None,
    ICnt,
    History,
    Taken,
    NotTaken,
}

/// The count engine asked for a kind of count the current message did
/// not provide; the state machine has violated its own sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CountError {
    #[error("instruction count underflow")]
    ICntUnderflow,
    #[error("no history bits to consume")]
    HistoryExhausted,
    #[error("no taken count to consume")]
    TakenExhausted,
    #[error("no not-taken count to consume")]
    NotTakenExhausted,
}

/// Per-core counts loaded from the most recent count-bearing message.
///
/// `history` keeps its wire encoding: a stop bit above the outcome
/// bits. `hist_bit` indexes the next outcome to consume, walking down
/// from just below the stop bit; negative means drained.
#[derive(Debug, Clone)]
pub struct Counts {
    i_cnt: i32,
    history: u64,
    hist_bit: i32,
    taken: u32,
    not_taken: u32,
}

impl Default for Counts {
    fn default() -> Counts {
        Counts::new()
    }
}

impl Counts {
    pub fn new() -> Counts {
        Counts {
            i_cnt: 0,
            history: 0,
            hist_bit: -1,
            taken: 0,
            not_taken: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = Counts::new();
    }

    /// Loads whichever counts `msg` carries. Fields the message does
    /// not carry are left alone: a resource-full history message, for
    /// example, must not clobber a partially drained `i_cnt`.
    pub fn load(&mut self, msg: &NexusMessage) {
        let (i_cnt, history, taken, not_taken) = match msg.payload {
            Payload::DirectBranch { i_cnt }
            | Payload::IndirectBranch { i_cnt, .. }
            | Payload::Sync { i_cnt, .. }
            | Payload::DirectBranchWithSync { i_cnt, .. }
            | Payload::IndirectBranchWithSync { i_cnt, .. } => (i_cnt, 0, 0, 0),
            Payload::IndirectBranchHistory { i_cnt, history, .. }
            | Payload::IndirectBranchHistoryWithSync { i_cnt, history, .. } => {
                (i_cnt, history, 0, 0)
            }
            Payload::ResourceFull(ResourceFull::ICnt(i_cnt)) => (i_cnt, 0, 0, 0),
            Payload::ResourceFull(ResourceFull::History(history)) => (0, history, 0, 0),
            Payload::ResourceFull(ResourceFull::TakenCount(n)) => (0, 0, n, 0),
            Payload::ResourceFull(ResourceFull::NotTakenCount(n)) => (0, 0, 0, n),
            Payload::Correlation { i_cnt, history, .. } => (i_cnt, history.unwrap_or(0), 0, 0),
            _ => return,
        };

        if i_cnt != 0 {
            self.i_cnt = i_cnt as i32;
        }
        // A history of exactly 1 is just the stop bit: zero outcomes.
        if history > 1 {
            self.history = history;
            self.hist_bit = 62 - history.leading_zeros() as i32;
        }
        if taken != 0 {
            self.taken = taken;
        }
        if not_taken != 0 {
            self.not_taken = not_taken;
        }
    }

    pub fn kind(&self) -> CountKind {
        if self.hist_bit >= 0 {
            CountKind::History
        } else if self.taken > 0 {
            CountKind::Taken
        } else if self.not_taken > 0 {
            CountKind::NotTaken
        } else if self.i_cnt > 0 {
            CountKind::ICnt
        } else {
            CountKind::None
        }
    }

    /// Remaining half-instruction units.
    pub fn i_cnt(&self) -> i32 {
        self.i_cnt
    }

    /// Consumes `units` half-instruction units and returns the
    /// remainder. Going negative means the encoder and decoder have
    /// lost agreement on instruction sizes.
    pub fn consume_i_cnt(&mut self, units: u32) -> Result<i32, CountError> {
        self.i_cnt -= units as i32;
        if self.i_cnt < 0 {
            return Err(CountError::ICntUnderflow);
        }
        Ok(self.i_cnt)
    }

    /// Pops the next branch outcome from the history: true = taken.
    pub fn consume_history(&mut self) -> Result<bool, CountError> {
        if self.hist_bit < 0 {
            return Err(CountError::HistoryExhausted);
        }
        let taken = self.history & (1u64 << self.hist_bit) != 0;
        self.hist_bit -= 1;
        Ok(taken)
    }

    pub fn consume_taken(&mut self) -> Result<(), CountError> {
        if self.taken == 0 {
            return Err(CountError::TakenExhausted);
        }
        self.taken -= 1;
        Ok(())
    }

    pub fn consume_not_taken(&mut self) -> Result<(), CountError> {
        if self.not_taken == 0 {
            return Err(CountError::NotTakenExhausted);
        }
        self.not_taken -= 1;
        Ok(())
    }
}

/// Return-address prediction stack. The depth bound is a policy knob,
/// not a correctness requirement; a deeper-than-bound call chain
/// silently sheds the excess pushes and the affected returns come back
/// unresolved, to be fixed up by the next indirect-branch message.
pub const RETURN_STACK_DEPTH: usize = 2048;

#[derive(Debug, Clone, Default)]
pub struct ReturnStack {
    slots: Vec<u64>,
}

impl ReturnStack {
    pub fn new() -> ReturnStack {
        ReturnStack::default()
    }

    pub fn reset(&mut self) {
        self.slots.clear();
    }

    pub fn push(&mut self, addr: u64) {
        if self.slots.len() >= RETURN_STACK_DEPTH {
            debug!("return stack full; dropping push of {:#x}", addr);
            return;
        }
        self.slots.push(addr);
    }

    pub fn pop(&mut self) -> Option<u64> {
        self.slots.pop()
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }
}
