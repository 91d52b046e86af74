//! End-to-end reconstruction tests: hand-encoded Nexus byte streams
//! replayed against small synthetic program images.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nexus_rv::{
    Arch, InstructionSource, Profiler, ProfilerOptions, Progress, TraceMode, TraceStream,
};

// ---------------------------------------------------------------------
// Wire-format encoder: packs (fixed, var) fields into MSEO-framed
// slices exactly as a Nexus encoder would.

#[derive(Clone, Copy)]
enum Field {
    Fixed(u32, u64),
    Var(u64),
}

fn encode_with_src(tcode: u8, src: Option<(u8, u8)>, fields: &[Field]) -> Vec<u8> {
    let mut bits: Vec<bool> = Vec::new();
    let mut var_ends: Vec<usize> = Vec::new();

    let push_fixed = |bits: &mut Vec<bool>, width: u32, value: u64| {
        for i in 0..width {
            bits.push((value >> i) & 1 == 1);
        }
    };

    push_fixed(&mut bits, 6, u64::from(tcode));
    if let Some((width, core)) = src {
        push_fixed(&mut bits, u32::from(width), u64::from(core));
    }

    for field in fields {
        match *field {
            Field::Fixed(width, value) => push_fixed(&mut bits, width, value),
            Field::Var(value) => {
                let width = (64 - value.leading_zeros()).max(1);
                push_fixed(&mut bits, width, value);
                while bits.len() % 6 != 0 {
                    bits.push(false);
                }
                var_ends.push(bits.len() / 6 - 1);
            }
        }
    }

    assert!(
        bits.len() % 6 == 0,
        "a message must end with a variable-length field"
    );

    let slices = bits.len() / 6;
    (0..slices)
        .map(|s| {
            let mut data = 0u8;
            for i in 0..6 {
                if bits[s * 6 + i] {
                    data |= 1 << i;
                }
            }
            let mseo = if s == slices - 1 {
                0b11
            } else if var_ends.contains(&s) {
                0b01
            } else {
                0b00
            };
            data << 2 | mseo
        })
        .collect()
}

fn encode(tcode: u8, fields: &[Field]) -> Vec<u8> {
    encode_with_src(tcode, None, fields)
}

const TRACE_ENABLE: u64 = 5;

fn sync(i_cnt: u64, f_addr: u64) -> Vec<u8> {
    encode(
        9,
        &[
            Field::Fixed(4, TRACE_ENABLE),
            Field::Var(i_cnt),
            Field::Var(f_addr >> 1),
        ],
    )
}

fn sync_ts(i_cnt: u64, f_addr: u64, ts: u64) -> Vec<u8> {
    encode(
        9,
        &[
            Field::Fixed(4, TRACE_ENABLE),
            Field::Var(i_cnt),
            Field::Var(f_addr >> 1),
            Field::Var(ts),
        ],
    )
}

fn direct_branch(i_cnt: u64) -> Vec<u8> {
    encode(3, &[Field::Var(i_cnt)])
}

fn direct_branch_ts(i_cnt: u64, ts: u64) -> Vec<u8> {
    encode(3, &[Field::Var(i_cnt), Field::Var(ts)])
}

fn direct_branch_ws(i_cnt: u64, f_addr: u64) -> Vec<u8> {
    encode(
        11,
        &[
            Field::Fixed(4, TRACE_ENABLE),
            Field::Var(i_cnt),
            Field::Var(f_addr >> 1),
        ],
    )
}

fn indirect_branch(i_cnt: u64, u_addr_wire: u64) -> Vec<u8> {
    encode(
        4,
        &[
            Field::Fixed(2, 0), // BType::Indirect
            Field::Var(i_cnt),
            Field::Var(u_addr_wire),
        ],
    )
}

fn indirect_branch_history(i_cnt: u64, u_addr_wire: u64, history: u64) -> Vec<u8> {
    encode(
        28,
        &[
            Field::Fixed(2, 0),
            Field::Var(i_cnt),
            Field::Var(u_addr_wire),
            Field::Var(history),
        ],
    )
}

fn resource_full(rcode: u64, data: u64) -> Vec<u8> {
    encode(27, &[Field::Fixed(4, rcode), Field::Var(data)])
}

fn correlation_with_history(i_cnt: u64, history: u64) -> Vec<u8> {
    encode(
        33,
        &[
            Field::Fixed(4, 0), // evcode
            Field::Fixed(2, 1), // cdf: history present
            Field::Var(i_cnt),
            Field::Var(history),
        ],
    )
}

fn error_marker(etype: u64) -> Vec<u8> {
    encode(8, &[Field::Var(etype)])
}

fn ict_ws_pc_sample(pc: u64) -> Vec<u8> {
    encode(
        35,
        &[
            Field::Fixed(4, 15), // cksrc: PC sample
            Field::Fixed(2, 0),
            Field::Var(pc >> 1),
        ],
    )
}

/// XOR-compressed target, as the encoder computes it.
fn u_addr(last_faddr: u64, target: u64) -> u64 {
    (last_faddr ^ target) >> 1
}

// ---------------------------------------------------------------------
// Instruction assembly and the synthetic program image.

const C_NOP: u32 = 0x0001;

fn jal(rd: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 20) & 1) << 31
        | ((imm >> 1) & 0x3ff) << 21
        | ((imm >> 11) & 1) << 20
        | ((imm >> 12) & 0xff) << 12
        | rd << 7
        | 0b110_1111
}

fn jalr(rd: u32, rs1: u32) -> u32 {
    rs1 << 15 | rd << 7 | 0b110_0111
}

fn beq(imm: i32) -> u32 {
    let imm = imm as u32;
    ((imm >> 12) & 1) << 31
        | ((imm >> 5) & 0x3f) << 25
        | ((imm >> 1) & 0xf) << 8
        | ((imm >> 11) & 1) << 7
        | 0b110_0011
}

struct TestImage {
    arch: Arch,
    insts: HashMap<u64, u32>,
    /// Address range answered with `c.nop` when not in `insts`.
    nops: Option<(u64, u64)>,
}

impl TestImage {
    fn new() -> TestImage {
        TestImage {
            arch: Arch::Rv64,
            insts: HashMap::new(),
            nops: None,
        }
    }

    fn put(mut self, addr: u64, raw: u32) -> TestImage {
        self.insts.insert(addr, raw);
        self
    }

    fn nops(mut self, start: u64, end: u64) -> TestImage {
        self.nops = Some((start, end));
        self
    }
}

impl InstructionSource for TestImage {
    fn arch(&self) -> Arch {
        self.arch
    }

    fn instruction_at(&self, addr: u64) -> Option<u32> {
        if let Some(&raw) = self.insts.get(&addr) {
            return Some(raw);
        }
        match self.nops {
            Some((start, end)) if addr >= start && addr < end => Some(C_NOP),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------
// Harness.

fn run(image: TestImage, messages: &[Vec<u8>]) -> Profiler<TestImage> {
    run_with_options(image, messages, ProfilerOptions::default())
}

fn run_with_options(
    image: TestImage,
    messages: &[Vec<u8>],
    options: ProfilerOptions,
) -> Profiler<TestImage> {
    let stream = TraceStream::new();
    let mut profiler = Profiler::new(stream.clone(), image, options);

    for msg in messages {
        stream.push(msg).unwrap();
    }
    stream.set_end_of_data();

    assert_eq!(profiler.generate_histogram().unwrap(), Progress::Done);
    profiler
}

fn histogram_of(profiler: &Profiler<TestImage>) -> HashMap<u64, u64> {
    profiler.histogram().clone()
}

macro_rules! histogram {
    ($($addr:expr => $count:expr),* $(,)?) => {{
        let mut map = HashMap::new();
        $(map.insert($addr as u64, $count as u64);)*
        map
    }};
}

// ---------------------------------------------------------------------
// Scenarios.

#[test]
fn sync_anchor_then_direct_branch() {
    // Four compressed nops at 0x1000, then a call; the direct-branch
    // message's count (six half-units) drains exactly at the jal.
    let image = TestImage::new()
        .nops(0x1000, 0x1008)
        .put(0x1008, jal(1, 0xf8));

    let profiler = run(image, &[sync(0, 0x1000), direct_branch(6)]);

    assert_eq!(
        histogram_of(&profiler),
        histogram! {
            0x1000 => 1, 0x1002 => 1, 0x1004 => 1, 0x1006 => 1, 0x1008 => 1,
        }
    );
    // The call landed and its return slot is predicted.
    assert_eq!(profiler.current_pc(0), Some(0x1100));
    assert_eq!(profiler.return_stack_depth(0), 1);
    assert_eq!(profiler.instructions_retired(), 5);
}

#[test]
fn with_sync_clears_speculative_state() {
    let image = TestImage::new()
        .nops(0x1000, 0x1008)
        .put(0x1008, jal(1, 0xf8));

    let profiler = run(
        image,
        &[
            sync(0, 0x1000),
            direct_branch(6),
            direct_branch_ws(0, 0x1100),
        ],
    );

    // The with-sync retirement re-anchors the PC and empties the
    // return stack.
    assert_eq!(profiler.current_pc(0), Some(0x1100));
    assert_eq!(profiler.return_stack_depth(0), 0);
}

#[test]
fn history_bits_steer_conditional_branches() {
    // Branch chain: taken, taken, not taken, taken; then an
    // uninferable jump resolved by the history message's address.
    let image = TestImage::new()
        .put(0x2000, beq(0x10))
        .put(0x2010, beq(0x10))
        .put(0x2020, beq(0x10))
        .put(0x2024, beq(0x10))
        .put(0x2034, jalr(0, 6));

    // Stop bit, then outcomes oldest-first: 1, 1, 0, 1.
    let history = 0b11101;
    let profiler = run(
        image,
        &[
            sync(0, 0x2000),
            indirect_branch_history(10, u_addr(0x2000, 0x3000), history),
        ],
    );

    assert_eq!(
        histogram_of(&profiler),
        histogram! {
            0x2000 => 1, 0x2010 => 1, 0x2020 => 1, 0x2024 => 1, 0x2034 => 1,
        }
    );
    assert_eq!(profiler.current_pc(0), Some(0x3000));
    assert_eq!(profiler.trace_mode(), TraceMode::Htm);
}

#[test]
fn return_address_prediction_resolves_returns() {
    // call at 0x4000 -> 0x4100; callee runs one nop and returns
    // through jalr x0, ra. In HTM mode the return target comes off the
    // stack; the indirect-branch message merely confirms it.
    let image = TestImage::new()
        .put(0x4000, jal(1, 0x100))
        .put(0x4100, C_NOP)
        .put(0x4102, jalr(0, 1));

    let profiler = run(
        image,
        &[
            sync(0, 0x4000),
            resource_full(0, 2), // i-cnt refill; also promotes to HTM
            indirect_branch(3, u_addr(0x4000, 0x4004)),
        ],
    );

    assert_eq!(
        histogram_of(&profiler),
        histogram! { 0x4000 => 1, 0x4100 => 1, 0x4102 => 1 }
    );
    assert_eq!(profiler.current_pc(0), Some(0x4004));
    assert_eq!(profiler.return_stack_depth(0), 0);
}

#[test]
fn btm_resolves_conditionals_by_count_exhaustion() {
    // In BTM mode a conditional is taken exactly when it exhausts a
    // direct-branch message's count.
    let image = TestImage::new()
        .put(0x5000, beq(0x10))
        .put(0x5010, beq(0x10))
        .nops(0x5020, 0x5030);

    let profiler = run(
        image,
        &[
            sync(0, 0x5000),
            direct_branch(2), // drains at the first branch: taken
            correlation_with_history(2, 0b11),
            direct_branch(5), // after correlation: ignored until resync
        ],
    );

    // The correlation message carried one history bit (taken) for the
    // second branch, and promoted the stream to HTM.
    assert_eq!(
        histogram_of(&profiler),
        histogram! { 0x5000 => 1, 0x5010 => 1 }
    );
    assert_eq!(profiler.current_pc(0), Some(0x5020));
    assert_eq!(profiler.trace_mode(), TraceMode::Htm);
}

#[test]
fn error_marker_reanchors_without_phantom_instructions() {
    let image = TestImage::new().nops(0x6000, 0x6010).put(0x7000, C_NOP);

    let profiler = run(
        image,
        &[
            sync(0, 0x6000),
            direct_branch(1),
            error_marker(3),
            direct_branch(4), // unanchored: must produce nothing
            direct_branch_ws(0, 0x7000),
            direct_branch(1),
        ],
    );

    // Nothing between the error marker and the re-anchor is counted.
    assert_eq!(
        histogram_of(&profiler),
        histogram! { 0x6000 => 1, 0x7000 => 1 }
    );
}

#[test]
fn icnt_overflow_defers_branch_to_history_refill() {
    // A resource-full i-cnt message drains at a conditional branch
    // with no outcome available; the branch must wait, unretired, for
    // the history refill.
    let image = TestImage::new()
        .put(0x8000, C_NOP)
        .put(0x8002, beq(0x10))
        .put(0x8012, C_NOP);

    let profiler = run(
        image,
        &[
            sync(0, 0x8000),
            resource_full(0, 4),    // i-cnt only
            resource_full(1, 0b11), // history: one taken bit
        ],
    );

    assert_eq!(
        histogram_of(&profiler),
        histogram! { 0x8000 => 1, 0x8002 => 1, 0x8012 => 1 }
    );
    assert_eq!(profiler.instructions_retired(), 3);
    assert_eq!(profiler.current_pc(0), Some(0x8014));
}

#[test]
fn timestamps_reconstruct_monotonically() {
    let image = TestImage::new().nops(0x1000, 0x1010);

    let profiler = run(
        image,
        &[
            sync_ts(0, 0x1000, 100),
            // Relative stamp: 100 ^ 8 = 108.
            direct_branch_ts(1, 100 ^ 108),
        ],
    );

    assert_eq!(profiler.last_timestamp(0), 108);
}

#[test]
fn ict_events_are_consumed_in_place() {
    let image = TestImage::new().put(0x1000, C_NOP);

    // A PC-sample event before the anchor must not start replay or
    // pollute the histogram.
    let profiler = run(
        image,
        &[ict_ws_pc_sample(0x9000), sync(0, 0x1000), direct_branch(1)],
    );

    assert_eq!(histogram_of(&profiler), histogram! { 0x1000 => 1 });
}

#[test]
fn cores_reconstruct_independently() {
    let image = TestImage::new().nops(0x1000, 0x1010).nops(0x2000, 0x2010);

    let stream = TraceStream::new();
    let mut profiler = Profiler::new(
        stream.clone(),
        image,
        ProfilerOptions {
            src_bits: 2,
            ..ProfilerOptions::default()
        },
    );

    let src = |core| Some((2u8, core));
    for msg in [
        encode_with_src(
            9,
            src(0),
            &[
                Field::Fixed(4, TRACE_ENABLE),
                Field::Var(0),
                Field::Var(0x1000 >> 1),
            ],
        ),
        encode_with_src(
            9,
            src(1),
            &[
                Field::Fixed(4, TRACE_ENABLE),
                Field::Var(0),
                Field::Var(0x2000 >> 1),
            ],
        ),
        encode_with_src(3, src(0), &[Field::Var(2)]),
        encode_with_src(3, src(1), &[Field::Var(1)]),
    ]
    .iter()
    {
        stream.push(msg).unwrap();
    }
    stream.set_end_of_data();

    assert_eq!(profiler.generate_histogram().unwrap(), Progress::Done);
    assert_eq!(profiler.current_pc(0), Some(0x1004));
    assert_eq!(profiler.current_pc(1), Some(0x2002));
    assert_eq!(
        profiler.histogram().clone(),
        histogram! { 0x1000 => 1, 0x1002 => 1, 0x2000 => 1 }
    );
}

#[test]
fn histogram_total_matches_reported_instructions() {
    let image = TestImage::new()
        .nops(0x2000, 0x2100)
        .put(0x2020, beq(0x20));

    let profiler = run(
        image,
        &[
            sync(0, 0x2000),
            direct_branch(0x12), // drains at the branch: taken to 0x2040
            direct_branch(8),
        ],
    );

    let sum: u64 = profiler.histogram().values().sum();
    assert_eq!(sum, profiler.instructions_retired());
}

#[test]
fn identical_streams_yield_identical_histograms() {
    let image = || {
        TestImage::new()
            .nops(0x1000, 0x1008)
            .put(0x1008, jal(1, 0xf8))
            .nops(0x1100, 0x1120)
    };
    let messages = [sync(0, 0x1000), direct_branch(6), direct_branch(4)];

    let first = run(image(), &messages);
    let second = run(image(), &messages);

    assert_eq!(histogram_of(&first), histogram_of(&second));
    assert_eq!(
        first.instructions_retired(),
        second.instructions_retired()
    );
}

#[test]
fn any_byte_split_decodes_identically() {
    let image = || {
        TestImage::new()
            .put(0x4000, jal(1, 0x100))
            .put(0x4100, C_NOP)
            .put(0x4102, jalr(0, 1))
    };
    let messages = [
        sync(0, 0x4000),
        resource_full(0, 2),
        indirect_branch(3, u_addr(0x4000, 0x4004)),
    ];
    let whole: Vec<u8> = messages.concat();

    let reference = run(image(), &messages);

    for split in 1..whole.len() {
        let stream = TraceStream::new();
        let mut profiler = Profiler::new(stream.clone(), image(), ProfilerOptions::default());

        stream.push(&whole[..split]).unwrap();
        // Either outcome is legal here depending on where the split
        // falls; only the end state matters.
        let _ = profiler.generate_histogram().unwrap();

        stream.push(&whole[split..]).unwrap();
        stream.set_end_of_data();
        while profiler.generate_histogram().unwrap() != Progress::Done {}

        assert_eq!(
            histogram_of(&profiler),
            histogram_of(&reference),
            "split at byte {}",
            split
        );
    }
}

#[test]
fn progress_callbacks_fire_on_interval_and_completion() {
    // A tight loop: 2046 nops and a backwards jal per lap, one
    // direct-branch message per lap.
    const LAPS: u64 = 1222;
    const UNITS_PER_LAP: u64 = 2048;
    const INSTS_PER_LAP: u64 = 2047;

    let image = TestImage::new()
        .nops(0x10000, 0x10ffc)
        .put(0x10ffc, jal(0, -0xffc));

    let stream = TraceStream::new();
    let mut profiler = Profiler::new(stream.clone(), image, ProfilerOptions::default());

    let calls: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&calls);
    profiler.set_histogram_callback(Box::new(move |_, bytes, instructions| {
        observed.lock().unwrap().push((bytes, instructions));
    }));

    let mut total_bytes = 0u64;
    for msg in std::iter::once(sync(0, 0x10000))
        .chain((0..LAPS).map(|_| direct_branch(UNITS_PER_LAP)))
    {
        total_bytes += msg.len() as u64;
        stream.push(&msg).unwrap();
    }
    stream.set_end_of_data();

    assert_eq!(profiler.generate_histogram().unwrap(), Progress::Done);

    let total_insts = LAPS * INSTS_PER_LAP;
    assert_eq!(profiler.instructions_retired(), total_insts);

    let calls = calls.lock().unwrap();
    // Two interval callbacks (crossing 1M and 2M) plus the final one.
    assert_eq!(calls.len(), 3, "callbacks: {:?}", *calls);
    assert!(calls[0].1 > 1_000_000 && calls[0].1 < 2_000_000);
    assert!(calls[1].1 > 2_000_000 && calls[1].1 < total_insts);
    assert_eq!(*calls.last().unwrap(), (total_bytes, total_insts));

    let sum: u64 = profiler.histogram().values().sum();
    assert_eq!(sum, total_insts);
}

#[test]
fn flush_offset_forces_a_callback() {
    let image = TestImage::new().nops(0x1000, 0x1100);

    let stream = TraceStream::new();
    let mut profiler = Profiler::new(stream.clone(), image, ProfilerOptions::default());

    let calls: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&calls);
    profiler.set_histogram_callback(Box::new(move |_, bytes, _| {
        observed.lock().unwrap().push(bytes);
    }));

    let first = sync(0, 0x1000);
    let second = direct_branch(4);
    let boundary = first.len() as u64;
    profiler.flush_handle().request_flush_at(boundary);

    stream.push(&first).unwrap();
    stream.push(&second).unwrap();
    let _ = profiler.generate_histogram().unwrap();

    // The flush fires once decoding passes the requested offset, and
    // keeps firing at message boundaries until rearmed or finished.
    assert!(calls.lock().unwrap().iter().any(|&b| b >= boundary));

    stream.set_end_of_data();
    while profiler.generate_histogram().unwrap() != Progress::Done {}
}
