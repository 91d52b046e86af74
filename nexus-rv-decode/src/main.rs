use std::fs::File;
use std::io::Read;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use nexus_rv::{
    Analytics, Arch, MemoryImage, ParserError, Profiler, ProfilerOptions, Progress, SliceParser,
    TraceStream,
};
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "A decoder and statistical profiler for IEEE-ISTO 5001 (Nexus) RISC-V trace streams. Decodes a raw capture into trace messages, or, given the traced program's text, reconstructs every retired PC and prints an instruction-address histogram."
)]
struct Opt {
    #[structopt(
        long = "--src-bits",
        default_value = "0",
        help = "Width of the core-id field in every message."
    )]
    src_bits: u8,

    #[structopt(
        long = "--ts-bits",
        default_value = "40",
        help = "Width of the target's timestamp counter."
    )]
    ts_bits: u8,

    #[structopt(
        long = "--freq",
        default_value = "0",
        help = "Timestamp clock in Hz; 0 if unknown."
    )]
    freq: u32,

    #[structopt(
        long = "--histogram",
        requires("image"),
        help = "Profile instead of dumping messages."
    )]
    histogram: bool,

    #[structopt(
        long = "--image",
        parse(from_os_str),
        help = "Flat binary of the traced program's text (objcopy -O binary)."
    )]
    image: Option<PathBuf>,

    #[structopt(
        long = "--base",
        default_value = "0",
        parse(try_from_str = parse_addr),
        help = "Load address of the image."
    )]
    base: u64,

    #[structopt(long = "--rv32", help = "Decode the image as RV32 (default RV64).")]
    rv32: bool,

    #[structopt(
        long = "--top",
        default_value = "20",
        help = "Histogram rows to print."
    )]
    top: usize,

    #[structopt(long = "--analytics", help = "Print stream statistics at the end.")]
    analytics: bool,

    #[structopt(name = "FILE", parse(from_os_str), help = "Raw Nexus trace capture.")]
    file: PathBuf,
}

fn parse_addr(s: &str) -> Result<u64, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let mut capture = Vec::new();
    File::open(&opt.file)
        .context("failed to open capture file")?
        .read_to_end(&mut capture)
        .context("failed to read capture file")?;

    if opt.histogram {
        profile(&opt, &capture)
    } else {
        dump(&opt, &capture)
    }
}

/// Decodes the capture and prints one line per message.
fn dump(opt: &Opt, capture: &[u8]) -> Result<()> {
    let stream = TraceStream::new();
    stream.push(capture).context("empty capture")?;
    stream.set_end_of_data();

    let mut parser = SliceParser::new(stream, opt.src_bits);
    let mut analytics = Analytics::new();

    loop {
        match parser.read_message(&mut analytics) {
            Ok(Some(msg)) => println!("{:?}", msg),
            Ok(None) => eprintln!("... skipped bytes while re-aligning"),
            Err(ParserError::EndOfStream) => break,
            Err(ParserError::NeedBytes) => unreachable!("end of data was signalled"),
            Err(ParserError::Malformed(m)) => eprintln!("malformed message: {}", m),
            Err(e) => return Err(e).context("capture is not decodable"),
        }
    }

    if opt.analytics {
        print!("{}", analytics.report());
    }

    Ok(())
}

/// Replays the capture against the program image and prints the
/// hottest addresses.
fn profile(opt: &Opt, capture: &[u8]) -> Result<()> {
    let image_path = opt.image.as_ref().expect("structopt enforces --image");
    let mut text = Vec::new();
    File::open(image_path)
        .context("failed to open program image")?
        .read_to_end(&mut text)
        .context("failed to read program image")?;
    if text.is_empty() {
        bail!("program image is empty");
    }

    let arch = if opt.rv32 { Arch::Rv32 } else { Arch::Rv64 };
    let image = MemoryImage::new(opt.base, text, arch);

    let stream = TraceStream::new();
    let mut profiler = Profiler::new(
        stream.clone(),
        image,
        ProfilerOptions {
            src_bits: opt.src_bits,
            ts_bits: opt.ts_bits,
            frequency: opt.freq,
        },
    );

    profiler.set_histogram_callback(Box::new(|_, bytes, instructions| {
        eprintln!(
            "... {} instructions retired ({} bytes processed)",
            instructions, bytes
        );
    }));

    // Feed the capture in probe-sized chunks; the decoder is
    // indifferent to fragmentation.
    for chunk in capture.chunks(4096) {
        stream.push(chunk).context("empty capture")?;
        match profiler.generate_histogram()? {
            Progress::NeedBytes => {}
            Progress::Done => break,
        }
    }
    stream.set_end_of_data();
    while profiler.generate_histogram()? != Progress::Done {}

    let mut rows: Vec<(u64, u64)> = profiler
        .histogram()
        .iter()
        .map(|(&addr, &count)| (addr, count))
        .collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let total = profiler.instructions_retired();
    println!("instructions retired: {}", total);
    if let Some(seconds) = profiler.seconds(profiler.last_timestamp(0)) {
        println!("trace time: {:.6}s", seconds);
    }
    for (addr, count) in rows.iter().take(opt.top) {
        println!(
            "{:#012x}  {:>12}  {:6.2}%",
            addr,
            count,
            *count as f64 * 100.0 / total.max(1) as f64
        );
    }

    if opt.analytics {
        print!("{}", profiler.analytics().report());
    }

    Ok(())
}
