//! Classification of RISC-V instructions, as far as trace
//! reconstruction needs it: control transfers and everything else.
//!
//! Only the encodings that can change the PC non-sequentially are
//! named; any other instruction decodes to [`InstKind::Unknown`] with
//! its correct size. RV32 and RV64 need separate compressed tables
//! because a few quadrant-1 encodings alias (`c.jal` on RV32 is
//! `c.addiw` on RV64).

use bitmatch::bitmatch;

/// Target register width, from the ELF class of the traced image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Rv32,
    Rv64,
}

/// Control-transfer classification of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstKind {
    /// Anything that falls through to the next instruction.
    Unknown,
    Jal,
    Jalr,
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    CJ,
    CJal,
    CJr,
    CJalr,
    CBeqz,
    CBnez,
    Ebreak,
    CEbreak,
    Ecall,
    Mret,
    Sret,
    Uret,
}

/// A classified instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInst {
    pub kind: InstKind,
    /// Encoded size in bits: 16 or 32.
    pub size_bits: u32,
    /// Source register (`jalr`/`c.jr`/`c.jalr` base, branch operand).
    pub rs1: u8,
    /// Destination (link) register.
    pub rd: u8,
    /// Branch/jump displacement in bytes, sign-extended.
    pub imm: i32,
    /// True for the six conditional branches and their compressed
    /// forms.
    pub is_branch: bool,
}

impl DecodedInst {
    /// Encoded size in bytes.
    pub fn size_bytes(&self) -> u64 {
        u64::from(self.size_bits) / 8
    }

    /// Size in half-instruction units, the currency of `i_cnt`.
    pub fn half_units(&self) -> u32 {
        self.size_bits / 16
    }

    fn other(size_bits: u32) -> DecodedInst {
        DecodedInst {
            kind: InstKind::Unknown,
            size_bits,
            rs1: 0,
            rd: 0,
            imm: 0,
            is_branch: false,
        }
    }
}

/// The encoding is longer than 32 bits (48-bit and wider formats),
/// which this decoder does not model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cannot classify encoding {0:#010x}: wider than 32 bits")]
pub struct UnsupportedEncoding(pub u32);

/// Classifies the instruction whose first (lowest-addressed) bits are
/// in the low half of `raw`.
pub fn decode(raw: u32, arch: Arch) -> Result<DecodedInst, UnsupportedEncoding> {
    if raw & 0b11 != 0b11 {
        return Ok(match arch {
            Arch::Rv32 => decode_rv32_compressed(raw as u16),
            Arch::Rv64 => decode_rv64_compressed(raw as u16),
        });
    }
    if raw & 0b11100 == 0b11100 {
        return Err(UnsupportedEncoding(raw));
    }
    Ok(decode_full(raw))
}

fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// 32-bit encodings; identical on RV32 and RV64 for every kind this
/// decoder distinguishes.
#[bitmatch]
fn decode_full(raw: u32) -> DecodedInst {
    let mut inst = DecodedInst::other(32);

    #[bitmatch]
    match raw {
        // jal: J-type scramble imm[20|10:1|11|19:12]
        "abbb_bbbb_bbbc_dddd_dddd_eeee_e110_1111" => {
            inst.kind = InstKind::Jal;
            inst.rd = e as u8;
            inst.imm = sign_extend((a << 20) | (d << 12) | (c << 11) | (b << 1), 21);
        }
        // jalr: I-type
        "aaaa_aaaa_aaaa_bbbb_b000_cccc_c110_0111" => {
            inst.kind = InstKind::Jalr;
            inst.rs1 = b as u8;
            inst.rd = c as u8;
            inst.imm = sign_extend(a, 12);
        }
        // conditional branches: B-type scramble imm[12|10:5] ... imm[4:1|11]
        "abbb_bbb?_????_dddd_dfff_eeee_g110_0011" => {
            inst.kind = match f {
                0b000 => InstKind::Beq,
                0b001 => InstKind::Bne,
                0b100 => InstKind::Blt,
                0b101 => InstKind::Bge,
                0b110 => InstKind::Bltu,
                0b111 => InstKind::Bgeu,
                _ => return inst,
            };
            inst.rs1 = d as u8;
            inst.imm = sign_extend((a << 12) | (g << 11) | (b << 5) | (e << 1), 13);
            inst.is_branch = true;
        }
        "0000_0000_0000_0000_0000_0000_0111_0011" => inst.kind = InstKind::Ecall,
        "0000_0000_0001_0000_0000_0000_0111_0011" => inst.kind = InstKind::Ebreak,
        "0011_0000_0010_0000_0000_0000_0111_0011" => inst.kind = InstKind::Mret,
        "0001_0000_0010_0000_0000_0000_0111_0011" => inst.kind = InstKind::Sret,
        "0000_0000_0010_0000_0000_0000_0111_0011" => inst.kind = InstKind::Uret,
        "????_????_????_????_????_????_????_????" => {}
    }

    inst
}

// c.jal lives in quadrant 1 on RV32 only; everything else matches the
// RV64 table.
#[bitmatch]
fn decode_rv32_compressed(raw: u16) -> DecodedInst {
    #[bitmatch]
    match raw {
        "001a_bccd_efgg_gh01" => DecodedInst {
            kind: InstKind::CJal,
            size_bits: 16,
            rs1: 0,
            rd: 1, // link is architectural, not encoded
            imm: cj_imm(a, b, c, d, e, f, g, h),
            is_branch: false,
        },
        "????_????_????_????" => decode_rv64_compressed(raw),
    }
}

#[bitmatch]
fn decode_rv64_compressed(raw: u16) -> DecodedInst {
    let mut inst = DecodedInst::other(16);

    #[bitmatch]
    match raw {
        // c.j: CJ-type scramble imm[11|4|9:8|10|6|7|3:1|5]
        "101a_bccd_efgg_gh01" => {
            inst.kind = InstKind::CJ;
            inst.imm = cj_imm(a, b, c, d, e, f, g, h);
        }
        // c.beqz / c.bnez: CB-type scramble imm[8|4:3] rs1' imm[7:6|2:1|5]
        "11sa_bbcc_cdde_ef01" => {
            inst.kind = if s == 0 { InstKind::CBeqz } else { InstKind::CBnez };
            inst.rs1 = 8 + c as u8;
            inst.imm = sign_extend(
                (u32::from(a) << 8)
                    | (u32::from(d) << 6)
                    | (u32::from(f) << 5)
                    | (u32::from(b) << 3)
                    | (u32::from(e) << 1),
                9,
            );
            inst.is_branch = true;
        }
        // quadrant 2, funct3 100: c.jr / c.jalr / c.ebreak / c.mv / c.add
        "100a_bbbb_bccc_cc10" => {
            let (link_bit, rs1, rs2) = (a, b as u8, c as u8);
            if rs2 == 0 {
                match (link_bit, rs1) {
                    (0, 0) => {} // reserved
                    (0, _) => {
                        inst.kind = InstKind::CJr;
                        inst.rs1 = rs1;
                    }
                    (_, 0) => inst.kind = InstKind::CEbreak,
                    (_, _) => {
                        inst.kind = InstKind::CJalr;
                        inst.rs1 = rs1;
                        inst.rd = 1;
                    }
                }
            }
            // rs2 != 0 is c.mv / c.add: sequential
        }
        "????_????_????_????" => {}
    }

    inst
}

#[allow(clippy::too_many_arguments)]
fn cj_imm(a: u16, b: u16, c: u16, d: u16, e: u16, f: u16, g: u16, h: u16) -> i32 {
    sign_extend(
        (u32::from(a) << 11)
            | (u32::from(d) << 10)
            | (u32::from(c) << 8)
            | (u32::from(f) << 7)
            | (u32::from(e) << 6)
            | (u32::from(h) << 5)
            | (u32::from(b) << 4)
            | (u32::from(g) << 1),
        12,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kindof(raw: u32, arch: Arch) -> InstKind {
        decode(raw, arch).unwrap().kind
    }

    #[test]
    fn jal_forward() {
        let inst = decode(0x1000_00ef, Arch::Rv64).unwrap(); // jal ra, +0x100
        assert_eq!(inst.kind, InstKind::Jal);
        assert_eq!(inst.rd, 1);
        assert_eq!(inst.imm, 0x100);
        assert_eq!(inst.size_bits, 32);
        assert!(!inst.is_branch);
    }

    #[test]
    fn jalr_ret_idiom() {
        let inst = decode(0x0000_8067, Arch::Rv64).unwrap(); // jalr x0, ra, 0
        assert_eq!(inst.kind, InstKind::Jalr);
        assert_eq!(inst.rd, 0);
        assert_eq!(inst.rs1, 1);

        let inst = decode(0x0003_00e7, Arch::Rv64).unwrap(); // jalr ra, t1, 0
        assert_eq!(inst.rd, 1);
        assert_eq!(inst.rs1, 6);
    }

    #[test]
    fn branch_displacements() {
        let fwd = decode(0x0000_0863, Arch::Rv64).unwrap(); // beq x0, x0, +16
        assert_eq!(fwd.kind, InstKind::Beq);
        assert_eq!(fwd.imm, 16);
        assert!(fwd.is_branch);

        let back = decode(0xfe00_08e3, Arch::Rv64).unwrap(); // beq x0, x0, -16
        assert_eq!(back.kind, InstKind::Beq);
        assert_eq!(back.imm, -16);
    }

    #[test]
    fn compressed_jumps() {
        let inst = decode(0xa005, Arch::Rv64).unwrap(); // c.j +32
        assert_eq!(inst.kind, InstKind::CJ);
        assert_eq!(inst.imm, 32);
        assert_eq!(inst.size_bits, 16);

        let inst = decode(0x8082, Arch::Rv64).unwrap(); // c.jr ra
        assert_eq!(inst.kind, InstKind::CJr);
        assert_eq!(inst.rs1, 1);

        let inst = decode(0x9282, Arch::Rv64).unwrap(); // c.jalr t0
        assert_eq!(inst.kind, InstKind::CJalr);
        assert_eq!(inst.rs1, 5);
        assert_eq!(inst.rd, 1);

        assert_eq!(kindof(0x9002, Arch::Rv64), InstKind::CEbreak);
    }

    #[test]
    fn compressed_branches() {
        let inst = decode(0xc401, Arch::Rv64).unwrap(); // c.beqz s0, +8
        assert_eq!(inst.kind, InstKind::CBeqz);
        assert_eq!(inst.rs1, 8);
        assert_eq!(inst.imm, 8);
        assert!(inst.is_branch);
    }

    #[test]
    fn cjal_aliases_addiw() {
        // The same halfword is c.jal -2 on RV32 and c.addiw on RV64.
        let rv32 = decode(0x3ffd, Arch::Rv32).unwrap();
        assert_eq!(rv32.kind, InstKind::CJal);
        assert_eq!(rv32.imm, -2);
        assert_eq!(rv32.rd, 1);

        assert_eq!(kindof(0x3ffd, Arch::Rv64), InstKind::Unknown);
    }

    #[test]
    fn system_instructions() {
        assert_eq!(kindof(0x0000_0073, Arch::Rv64), InstKind::Ecall);
        assert_eq!(kindof(0x0010_0073, Arch::Rv64), InstKind::Ebreak);
        assert_eq!(kindof(0x3020_0073, Arch::Rv64), InstKind::Mret);
        assert_eq!(kindof(0x1020_0073, Arch::Rv32), InstKind::Sret);
        assert_eq!(kindof(0x0020_0073, Arch::Rv32), InstKind::Uret);
    }

    #[test]
    fn plain_instructions_are_sized_only() {
        let add = decode(0x00b5_0533, Arch::Rv64).unwrap(); // add a0, a0, a1
        assert_eq!(add.kind, InstKind::Unknown);
        assert_eq!(add.size_bits, 32);

        let cnop = decode(0x0001, Arch::Rv64).unwrap(); // c.nop
        assert_eq!(cnop.kind, InstKind::Unknown);
        assert_eq!(cnop.size_bits, 16);
    }

    #[test]
    fn wide_encodings_are_rejected() {
        assert!(decode(0x0000_001f, Arch::Rv64).is_err()); // 48-bit prefix
    }
}
