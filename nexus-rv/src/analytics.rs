//! Stream statistics gathered while decoding: message and bit counts
//! per TCODE and per core, plus retirement-side tallies fed back by the
//! replay engine. Useful for judging encoder efficiency and for sanity
//! checks on captures; nothing here affects reconstruction.

use crate::message::{NexusMessage, TCode};
use crate::replay::MAX_CORES;

/// Bit-level accounting for one decoded message, reported by the
/// parser alongside the message itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageBits {
    /// Total encoded size, including MSEO framing.
    pub total: u32,
    /// Framing overhead: two MSEO bits per slice.
    pub mseo: u32,
    /// Width of the timestamp field, zero if absent.
    pub timestamp: u32,
    /// Combined width of address fields (`u_addr`, `f_addr`, `ckdata`).
    pub address: u32,
}

#[derive(Debug, Clone, Copy)]
struct CoreStats {
    num_msgs: u32,
    total_bits: u32,
    mseo_bits: u32,
    ts_bits: u32,
    addr_bits: u32,
    max_msg_bits: u32,
    min_msg_bits: u32,

    per_tcode: [u32; 36],

    num_inst: u32,
    num_inst16: u32,
    num_inst32: u32,
    num_branches: u32,
    num_taken: u32,
    num_not_taken: u32,
    num_calls: u32,
    num_returns: u32,
    num_swaps: u32,
    num_exceptions: u32,
    num_exception_returns: u32,
}

impl Default for CoreStats {
    fn default() -> CoreStats {
        CoreStats {
            num_msgs: 0,
            total_bits: 0,
            mseo_bits: 0,
            ts_bits: 0,
            addr_bits: 0,
            max_msg_bits: 0,
            min_msg_bits: 0,
            per_tcode: [0; 36],
            num_inst: 0,
            num_inst16: 0,
            num_inst32: 0,
            num_branches: 0,
            num_taken: 0,
            num_not_taken: 0,
            num_calls: 0,
            num_returns: 0,
            num_swaps: 0,
            num_exceptions: 0,
            num_exception_returns: 0,
        }
    }
}

/// Running statistics over every message and retired instruction seen
/// since construction.
#[derive(Debug, Default)]
pub struct Analytics {
    cores: Vec<CoreStats>,
    num_msgs: u32,
    total_bits: u32,
}

impl Analytics {
    pub fn new() -> Analytics {
        Analytics {
            cores: vec![CoreStats::default(); MAX_CORES],
            ..Analytics::default()
        }
    }

    pub(crate) fn record_message(&mut self, msg: &NexusMessage, bits: MessageBits) {
        self.num_msgs += 1;
        self.total_bits += bits.total;

        let core = match self.cores.get_mut(usize::from(msg.core_id)) {
            Some(core) => core,
            None => return,
        };

        core.num_msgs += 1;
        core.total_bits += bits.total;
        core.mseo_bits += bits.mseo;
        core.ts_bits += bits.timestamp;
        core.addr_bits += bits.address;
        core.max_msg_bits = core.max_msg_bits.max(bits.total);
        core.min_msg_bits = if core.min_msg_bits == 0 {
            bits.total
        } else {
            core.min_msg_bits.min(bits.total)
        };

        core.per_tcode[msg.tcode() as usize] += 1;
    }

    pub(crate) fn record_instruction(&mut self, core_id: u8, size_bits: u32) {
        if let Some(core) = self.cores.get_mut(usize::from(core_id)) {
            core.num_inst += 1;
            match size_bits {
                16 => core.num_inst16 += 1,
                _ => core.num_inst32 += 1,
            }
        }
    }

    pub(crate) fn record_branch(&mut self, core_id: u8, taken: bool) {
        if let Some(core) = self.cores.get_mut(usize::from(core_id)) {
            core.num_branches += 1;
            if taken {
                core.num_taken += 1;
            } else {
                core.num_not_taken += 1;
            }
        }
    }

    pub(crate) fn record_call_return(&mut self, core_id: u8, flags: crate::replay::CallReturn) {
        if let Some(core) = self.cores.get_mut(usize::from(core_id)) {
            if flags.call {
                core.num_calls += 1;
            }
            if flags.ret {
                core.num_returns += 1;
            }
            if flags.swap {
                core.num_swaps += 1;
            }
            if flags.exception {
                core.num_exceptions += 1;
            }
            if flags.exception_return {
                core.num_exception_returns += 1;
            }
        }
    }

    /// Total messages decoded across all cores.
    pub fn num_messages(&self) -> u32 {
        self.num_msgs
    }

    /// Total encoded bits decoded across all cores.
    pub fn num_bits(&self) -> u32 {
        self.total_bits
    }

    /// Renders a per-core summary. Cores that produced no messages are
    /// omitted.
    pub fn report(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "trace messages: {}, encoded bits: {}",
            self.num_msgs, self.total_bits
        );

        for (id, core) in self.cores.iter().enumerate() {
            if core.num_msgs == 0 {
                continue;
            }

            let _ = writeln!(out, "core {}:", id);
            let _ = writeln!(
                out,
                "  messages: {} (bits: {}, mseo: {}, timestamp: {}, address: {}, min/max: {}/{})",
                core.num_msgs,
                core.total_bits,
                core.mseo_bits,
                core.ts_bits,
                core.addr_bits,
                core.min_msg_bits,
                core.max_msg_bits,
            );
            let _ = writeln!(
                out,
                "  instructions: {} (16-bit: {}, 32-bit: {})",
                core.num_inst, core.num_inst16, core.num_inst32,
            );
            let _ = writeln!(
                out,
                "  branches: {} (taken: {}, not taken: {}), calls: {}, returns: {}, swaps: {}, exceptions: {}, exception returns: {}",
                core.num_branches,
                core.num_taken,
                core.num_not_taken,
                core.num_calls,
                core.num_returns,
                core.num_swaps,
                core.num_exceptions,
                core.num_exception_returns,
            );

            for tcode in TCODES_OF_INTEREST {
                let n = core.per_tcode[*tcode as usize];
                if n != 0 {
                    let _ = writeln!(out, "  {:?}: {}", tcode, n);
                }
            }
        }

        out
    }
}

const TCODES_OF_INTEREST: &[TCode] = &[
    TCode::DirectBranch,
    TCode::IndirectBranch,
    TCode::Sync,
    TCode::DirectBranchWithSync,
    TCode::IndirectBranchWithSync,
    TCode::IndirectBranchHistory,
    TCode::IndirectBranchHistoryWithSync,
    TCode::ResourceFull,
    TCode::Correlation,
    TCode::Error,
    TCode::Ownership,
    TCode::AuxAccessWrite,
    TCode::DataAcquisition,
    TCode::Ict,
    TCode::IctWithSync,
];