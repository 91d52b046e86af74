//! A decoder and statistical profiler for the IEEE-ISTO 5001 (*Nexus*)
//! trace protocol as emitted by RISC-V trace encoders. Any references
//! in this code base refer to that standard.
//!
//! A debug probe pushes the raw capture bytes into a [`TraceStream`];
//! the [`Profiler`] parses them into [`NexusMessage`]s, replays every
//! retired program counter against the traced program (supplied
//! through the [`InstructionSource`] seam), and aggregates the PCs
//! into a running histogram with periodic progress callbacks.
//!
//! Common abbreviations:
//!
//! - TCODE: message type discriminator;
//! - MSEO: the two framing bits trailing every byte;
//! - BTM / HTM: branch vs. history trace messaging;
//! - `i_cnt`: retired half-instruction count;
//! - `f_addr` / `u_addr`: full vs. XOR-compressed instruction address.
//!
//! Usage:
//! ```
//! use nexus_rv::{MemoryImage, Arch, Profiler, ProfilerOptions, Progress, TraceStream};
//!
//! let stream = TraceStream::new();
//! let image = MemoryImage::new(0x1000, vec![/* traced .text bytes */], Arch::Rv64);
//! # let captured_bytes: Vec<u8> = vec![0b000011_00, 0b000010_11];
//!
//! let mut profiler = Profiler::new(stream.clone(), image, ProfilerOptions::default());
//! stream.push(&captured_bytes).unwrap();
//! stream.set_end_of_data();
//!
//! while profiler.generate_histogram().unwrap() != Progress::Done {
//!     // push more bytes
//! }
//! for (addr, count) in profiler.histogram() {
//!     println!("{:#x}: {}", addr, count);
//! }
//! ```
#[deny(rustdoc::broken_intra_doc_links)]
mod analytics;
mod count;
mod histogram;
mod image;
mod inst;
mod message;
mod parser;
mod replay;
mod stream;

pub use analytics::{Analytics, MessageBits};
pub use count::{CountError, CountKind, Counts, ReturnStack, RETURN_STACK_DEPTH};
pub use histogram::{FlushHandle, HistogramCallback, UPDATE_INTERVAL};
pub use image::{InstructionSource, MemoryImage};
pub use inst::{decode, Arch, DecodedInst, InstKind, UnsupportedEncoding};
pub use message::{
    BType, IctReason, NexusMessage, Payload, ResourceFull, SyncReason, TCode,
};
pub use parser::{MalformedMessage, ParserError, SliceParser};
pub use replay::{
    CallReturn, Profiler, ProfilerOptions, Progress, TraceError, TraceMode, MAX_CORES,
};
pub use stream::{StreamError, TraceStream};
