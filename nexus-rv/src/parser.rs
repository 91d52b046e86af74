//! Bit-level decode of the Nexus wire format.
//!
//! Every byte of the stream is a *slice*: six data bits in the high
//! part and a two-bit MSEO trailer in the low part. The trailer frames
//! both variable-length fields (`0b01`) and whole messages (`0b11`).
//! Data bits accumulate little-endian: the first slice holds the least
//! significant six bits of the message, and the six-bit TCODE therefore
//! occupies exactly the first slice.
//!
//! The parser never blocks. When the byte queue runs dry mid-message
//! it parks the partial slice buffer and reports
//! [`ParserError::NeedBytes`]; the next call resumes where it left
//! off, so a stream may be pushed in arbitrary fragments without
//! changing the decode.

use bitvec::prelude::*;

use crate::analytics::{Analytics, MessageBits};
use crate::message::{
    BType, IctReason, NexusMessage, Payload, ResourceFull, SyncReason, TCode,
};
use crate::stream::{Fetch, TraceStream};

const MSEO_NORMAL: u8 = 0b00;
const MSEO_VAR_END: u8 = 0b01;
const MSEO_END: u8 = 0b11;

const SLICE_DATA_BITS: usize = 6;

/// A message failed to decode. The stream itself stays usable: the
/// parser has already consumed (or will skip to) the next message
/// boundary, and the caller is expected to re-anchor on the next sync.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedMessage {
    /// A slice used the reserved MSEO value `0b10`.
    #[error("reserved MSEO sequence in slice {0:#04x}")]
    ReservedMseo(u8),

    /// A fixed-width field ran past a field or message boundary.
    #[error("fixed field of {width} bits overran the message")]
    TruncatedField { width: u32 },

    /// A variable-length field was expected but the message ended.
    #[error("variable field missing; message exhausted")]
    MissingField,

    /// Slices remained after the last permitted field.
    #[error("trailing field after timestamp")]
    TrailingField,

    /// A field carried a value outside its vocabulary.
    #[error("invalid {field} value {value}")]
    BadFieldValue { field: &'static str, value: u8 },
}

/// Control-flow outcomes of a parse attempt that are not messages.
/// `NeedBytes` and `EndOfStream` are flow signals; the two TCODE
/// variants are fatal by contract (the encoder configuration does not
/// match the decoder).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParserError {
    /// The byte queue is dry and end-of-data has not been signalled.
    #[error("need more trace bytes")]
    NeedBytes,

    /// The byte queue is dry and end-of-data was signalled. A partial
    /// message in flight is discarded.
    #[error("end of trace stream")]
    EndOfStream,

    /// Recoverable decode failure; see [`MalformedMessage`].
    #[error("malformed message: {0}")]
    Malformed(#[from] MalformedMessage),

    /// A TCODE this decoder recognizes but does not implement
    /// (data-read/data-write tracing among them).
    #[error("unsupported TCODE {0:?}")]
    UnsupportedTcode(TCode),

    /// A TCODE value the standard does not define.
    #[error("undefined TCODE value {0}")]
    UndefinedTcode(u8),
}

/// Streaming Nexus message parser.
pub struct SliceParser {
    stream: TraceStream,
    src_bits: u8,

    /// False while skipping to the next message boundary after a
    /// framing error.
    synced: bool,

    /// Slices of the in-flight message.
    slices: Vec<u8>,

    /// Stream offset of the next byte to fetch.
    offset: u64,

    /// Stream offset of the first slice of the in-flight message.
    msg_start: u64,
}

/// Result of draining one message's worth of slices from the queue.
enum Collected {
    Message,
    /// Bytes were discarded while re-aligning on a message boundary.
    Discarded,
}

impl SliceParser {
    /// `src_bits` is the deployment-configured width of the core-id
    /// field (zero on single-core targets).
    pub fn new(stream: TraceStream, src_bits: u8) -> SliceParser {
        SliceParser {
            stream,
            src_bits,
            synced: true,
            slices: Vec::with_capacity(32),
            offset: 0,
            msg_start: 0,
        }
    }

    /// Total bytes consumed from the stream so far.
    pub fn bytes_consumed(&self) -> u64 {
        self.offset
    }

    /// Decodes the next complete message from the stream.
    ///
    /// `Ok(None)` means bytes were discarded while re-aligning after a
    /// framing error; the caller should treat its reconstruction state
    /// as stale and wait for a sync.
    pub fn read_message(
        &mut self,
        analytics: &mut Analytics,
    ) -> Result<Option<NexusMessage>, ParserError> {
        match self.collect()? {
            Collected::Discarded => {
                self.slices.clear();
                return Ok(None);
            }
            Collected::Message => {}
        }

        let result = self.decode();
        self.slices.clear();

        match result {
            Ok((msg, bits)) => {
                analytics.record_message(&msg, bits);
                Ok(Some(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Pulls bytes until a slice with an end-of-message trailer
    /// arrives. Partial progress survives a dry queue.
    fn collect(&mut self) -> Result<Collected, ParserError> {
        loop {
            let byte = match self.stream.fetch() {
                Fetch::Byte(byte) => byte,
                Fetch::Empty => return Err(ParserError::NeedBytes),
                Fetch::EndOfData => return Err(ParserError::EndOfStream),
            };

            if self.slices.is_empty() {
                self.msg_start = self.offset;
            }
            self.offset += 1;

            if !self.synced {
                // Skipping garbage: alignment returns at the first
                // end-of-message trailer.
                if byte & 0b11 == MSEO_END {
                    self.synced = true;
                    return Ok(Collected::Discarded);
                }
                continue;
            }

            match byte & 0b11 {
                MSEO_NORMAL | MSEO_VAR_END => self.slices.push(byte),
                MSEO_END => {
                    self.slices.push(byte);
                    return Ok(Collected::Message);
                }
                _ => {
                    self.synced = false;
                    self.slices.clear();
                    return Err(MalformedMessage::ReservedMseo(byte).into());
                }
            }
        }
    }

    /// Decodes the collected slices into a message.
    fn decode(&mut self) -> Result<(NexusMessage, MessageBits), ParserError> {
        let mut bits: BitVec<u8, Lsb0> = BitVec::with_capacity(self.slices.len() * SLICE_DATA_BITS);
        let mut marks = Vec::new();

        for slice in &self.slices {
            let data = slice >> 2;
            for i in 0..SLICE_DATA_BITS {
                bits.push((data >> i) & 1 == 1);
            }
            match slice & 0b11 {
                MSEO_VAR_END | MSEO_END => marks.push(bits.len()),
                _ => {}
            }
        }

        let mut cursor = FieldCursor {
            bits: &bits,
            marks: &marks,
            next_mark: 0,
            pos: 0,
        };

        let raw_tcode = cursor.fixed(6)? as u8;
        let tcode = TCode::from_raw(raw_tcode).ok_or(ParserError::UndefinedTcode(raw_tcode))?;

        let core_id = if self.src_bits > 0 {
            cursor.fixed(u32::from(self.src_bits))? as u8
        } else {
            0
        };

        let mut stats = FieldStats::default();
        let payload = decode_payload(tcode, &mut cursor, &mut stats)?;

        // Whatever follows the last required field is the optional
        // timestamp; anything after that is an encoding error.
        let timestamp = if cursor.at_end() {
            None
        } else {
            let ts = cursor.var()?;
            stats.ts_bits = ts.width;
            Some(ts.value)
        };
        if !cursor.at_end() {
            return Err(MalformedMessage::TrailingField.into());
        }

        let len = self.slices.len() as u32;
        let msg = NexusMessage {
            core_id,
            timestamp,
            offset: self.msg_start,
            len,
            payload,
        };
        let bits = MessageBits {
            total: len * 8,
            mseo: len * 2,
            timestamp: stats.ts_bits,
            address: stats.addr_bits,
        };

        Ok((msg, bits))
    }
}

#[derive(Default)]
struct FieldStats {
    ts_bits: u32,
    addr_bits: u32,
}

/// A decoded variable-length field.
struct VarField {
    value: u64,
    width: u32,
}

/// Walks the stripped data bits of one message. Fixed fields advance
/// by exact bit counts; variable fields run to the next MSEO mark and
/// leave the cursor slice-aligned, as the standard requires.
struct FieldCursor<'a> {
    bits: &'a BitSlice<u8, Lsb0>,
    marks: &'a [usize],
    next_mark: usize,
    pos: usize,
}

impl FieldCursor<'_> {
    fn fixed(&mut self, width: u32) -> Result<u64, MalformedMessage> {
        let end = self.pos + width as usize;
        let limit = self
            .marks
            .get(self.next_mark)
            .copied()
            .unwrap_or(self.bits.len());
        if end > limit {
            return Err(MalformedMessage::TruncatedField { width });
        }

        let value = self.bits[self.pos..end].load_le::<u64>();
        self.pos = end;
        Ok(value)
    }

    fn var(&mut self) -> Result<VarField, MalformedMessage> {
        let end = match self.marks.get(self.next_mark) {
            Some(&mark) if mark > self.pos => mark,
            _ => return Err(MalformedMessage::MissingField),
        };
        self.next_mark += 1;

        // Values wider than a u64 cannot occur in a conforming stream;
        // keep the low bits rather than panicking on a hostile one.
        let load_end = end.min(self.pos + 64);
        let value = self.bits[self.pos..load_end].load_le::<u64>();
        let width = (end - self.pos) as u32;
        self.pos = end;

        Ok(VarField { value, width })
    }

    /// True once the end-of-message mark has been consumed.
    fn at_end(&self) -> bool {
        self.next_mark >= self.marks.len()
    }
}

fn decode_payload(
    tcode: TCode,
    cur: &mut FieldCursor,
    stats: &mut FieldStats,
) -> Result<Payload, ParserError> {
    let payload = match tcode {
        TCode::DirectBranch => Payload::DirectBranch {
            i_cnt: cur.var()?.value as u32,
        },
        TCode::IndirectBranch => {
            let b_type = b_type(cur.fixed(2)? as u8)?;
            let i_cnt = cur.var()?.value as u32;
            let u_addr = addr(cur.var()?, stats);
            Payload::IndirectBranch {
                b_type,
                i_cnt,
                u_addr,
            }
        }
        TCode::Sync => {
            let sync = sync_reason(cur.fixed(4)? as u8)?;
            let i_cnt = cur.var()?.value as u32;
            let f_addr = addr(cur.var()?, stats);
            Payload::Sync {
                sync,
                i_cnt,
                f_addr,
            }
        }
        TCode::DirectBranchWithSync => {
            let sync = sync_reason(cur.fixed(4)? as u8)?;
            let i_cnt = cur.var()?.value as u32;
            let f_addr = addr(cur.var()?, stats);
            Payload::DirectBranchWithSync {
                sync,
                i_cnt,
                f_addr,
            }
        }
        TCode::IndirectBranchWithSync => {
            let sync = sync_reason(cur.fixed(4)? as u8)?;
            let b_type = b_type(cur.fixed(2)? as u8)?;
            let i_cnt = cur.var()?.value as u32;
            let f_addr = addr(cur.var()?, stats);
            Payload::IndirectBranchWithSync {
                sync,
                b_type,
                i_cnt,
                f_addr,
            }
        }
        TCode::IndirectBranchHistory => {
            let b_type = b_type(cur.fixed(2)? as u8)?;
            let i_cnt = cur.var()?.value as u32;
            let u_addr = addr(cur.var()?, stats);
            let history = cur.var()?.value;
            Payload::IndirectBranchHistory {
                b_type,
                i_cnt,
                u_addr,
                history,
            }
        }
        TCode::IndirectBranchHistoryWithSync => {
            let sync = sync_reason(cur.fixed(4)? as u8)?;
            let b_type = b_type(cur.fixed(2)? as u8)?;
            let i_cnt = cur.var()?.value as u32;
            let f_addr = addr(cur.var()?, stats);
            let history = cur.var()?.value;
            Payload::IndirectBranchHistoryWithSync {
                sync,
                b_type,
                i_cnt,
                f_addr,
                history,
            }
        }
        TCode::ResourceFull => {
            let rcode = cur.fixed(4)? as u8;
            let data = cur.var()?.value;
            Payload::ResourceFull(match rcode {
                0 => ResourceFull::ICnt(data as u32),
                1 => ResourceFull::History(data),
                8 => ResourceFull::TakenCount(data as u32),
                9 => ResourceFull::NotTakenCount(data as u32),
                value => {
                    return Err(MalformedMessage::BadFieldValue {
                        field: "rcode",
                        value,
                    }
                    .into())
                }
            })
        }
        TCode::Correlation => {
            let evcode = cur.fixed(4)? as u8;
            let cdf = cur.fixed(2)? as u8;
            let i_cnt = cur.var()?.value as u32;
            let history = match cdf {
                0 => None,
                1 => Some(cur.var()?.value),
                value => {
                    return Err(MalformedMessage::BadFieldValue {
                        field: "cdf",
                        value,
                    }
                    .into())
                }
            };
            Payload::Correlation {
                evcode,
                cdf,
                i_cnt,
                history,
            }
        }
        TCode::Error => Payload::Error {
            etype: cur.var()?.value as u8,
        },
        TCode::Ownership => Payload::Ownership {
            process: cur.var()?.value,
        },
        TCode::AuxAccessWrite => {
            let addr = cur.var()?.value;
            let data = cur.var()?.value;
            Payload::AuxAccessWrite { addr, data }
        }
        TCode::DataAcquisition => {
            let idtag = cur.var()?.value;
            let data = cur.var()?.value;
            Payload::DataAcquisition { idtag, data }
        }
        TCode::Ict | TCode::IctWithSync => {
            let cksrc_raw = cur.fixed(4)? as u8;
            let cksrc = IctReason::from_raw(cksrc_raw).ok_or(MalformedMessage::BadFieldValue {
                field: "cksrc",
                value: cksrc_raw,
            })?;
            let ckdf = cur.fixed(2)? as u8;
            if ckdf > 1 {
                return Err(MalformedMessage::BadFieldValue {
                    field: "ckdf",
                    value: ckdf,
                }
                .into());
            }

            let mut ckdata = [0u64; 2];
            for slot in ckdata.iter_mut().take(usize::from(ckdf) + 1) {
                *slot = addr(cur.var()?, stats);
            }

            if tcode == TCode::Ict {
                Payload::Ict {
                    cksrc,
                    ckdf,
                    ckdata,
                }
            } else {
                Payload::IctWithSync {
                    cksrc,
                    ckdf,
                    ckdata,
                }
            }
        }
        unsupported => return Err(ParserError::UnsupportedTcode(unsupported)),
    };

    Ok(payload)
}

fn addr(field: VarField, stats: &mut FieldStats) -> u64 {
    stats.addr_bits += field.width;
    field.value
}

fn sync_reason(raw: u8) -> Result<SyncReason, MalformedMessage> {
    SyncReason::from_raw(raw).ok_or(MalformedMessage::BadFieldValue {
        field: "sync",
        value: raw,
    })
}

fn b_type(raw: u8) -> Result<BType, MalformedMessage> {
    BType::from_raw(raw).ok_or(MalformedMessage::BadFieldValue {
        field: "b_type",
        value: raw,
    })
}
