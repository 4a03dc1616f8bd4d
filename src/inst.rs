use anyhow::{anyhow, Result};

use crate::cpu::{CpuState, Decode, REG_NAMES};
use crate::memory::{Memory, ReadKind};

/// Operand layout of an instruction, per the RISC-V base formats.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Kind {
    I,
    U,
    S,
    J,
    B,
    R,
    N,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum Op {
    Lui,
    Auipc,
    Jal,
    Jalr,
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    Lb,
    Lh,
    Lw,
    Lbu,
    Lhu,
    Sb,
    Sh,
    Sw,
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
    Slli,
    Srli,
    Srai,
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
    Fence,
    Ecall,
    Ebreak,
    Inv,
}

/// What a retired instruction did to the simulation beyond updating state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Outcome {
    Normal,
    /// `ebreak`: the guest asked to stop, with `gpr[a0]` as the exit code.
    Halt { code: u32 },
}

struct Pattern {
    mask: u32,
    value: u32,
    name: &'static str,
    kind: Kind,
    op: Op,
}

const OPCODE: u32 = 0x0000_007f;
const FUNCT3: u32 = 0x0000_707f;
const FUNCT7: u32 = 0xfe00_707f;
const EXACT: u32 = 0xffff_ffff;

macro_rules! pat {
    ($mask:expr, $value:expr, $name:expr, $kind:ident, $op:ident) => {
        Pattern {
            mask: $mask,
            value: $value,
            name: $name,
            kind: Kind::$kind,
            op: Op::$op,
        }
    };
}

/// The RV32IM decode table, scanned in order; the first match wins and the
/// final catch-all row is the invalid-instruction fault. The shift rows
/// match on funct7, so encodings with bit 25 set fall through to the
/// catch-all and fault.
static PATTERNS: &[Pattern] = &[
    pat!(OPCODE, 0x0000_0037, "lui", U, Lui),
    pat!(OPCODE, 0x0000_0017, "auipc", U, Auipc),
    pat!(OPCODE, 0x0000_006f, "jal", J, Jal),
    pat!(FUNCT3, 0x0000_0067, "jalr", I, Jalr),
    pat!(FUNCT3, 0x0000_0063, "beq", B, Beq),
    pat!(FUNCT3, 0x0000_1063, "bne", B, Bne),
    pat!(FUNCT3, 0x0000_4063, "blt", B, Blt),
    pat!(FUNCT3, 0x0000_5063, "bge", B, Bge),
    pat!(FUNCT3, 0x0000_6063, "bltu", B, Bltu),
    pat!(FUNCT3, 0x0000_7063, "bgeu", B, Bgeu),
    pat!(FUNCT3, 0x0000_0003, "lb", I, Lb),
    pat!(FUNCT3, 0x0000_1003, "lh", I, Lh),
    pat!(FUNCT3, 0x0000_2003, "lw", I, Lw),
    pat!(FUNCT3, 0x0000_4003, "lbu", I, Lbu),
    pat!(FUNCT3, 0x0000_5003, "lhu", I, Lhu),
    pat!(FUNCT3, 0x0000_0023, "sb", S, Sb),
    pat!(FUNCT3, 0x0000_1023, "sh", S, Sh),
    pat!(FUNCT3, 0x0000_2023, "sw", S, Sw),
    pat!(FUNCT3, 0x0000_0013, "addi", I, Addi),
    pat!(FUNCT3, 0x0000_2013, "slti", I, Slti),
    pat!(FUNCT3, 0x0000_3013, "sltiu", I, Sltiu),
    pat!(FUNCT3, 0x0000_4013, "xori", I, Xori),
    pat!(FUNCT3, 0x0000_6013, "ori", I, Ori),
    pat!(FUNCT3, 0x0000_7013, "andi", I, Andi),
    pat!(FUNCT7, 0x0000_1013, "slli", I, Slli),
    pat!(FUNCT7, 0x0000_5013, "srli", I, Srli),
    pat!(FUNCT7, 0x4000_5013, "srai", I, Srai),
    pat!(FUNCT7, 0x0000_0033, "add", R, Add),
    pat!(FUNCT7, 0x4000_0033, "sub", R, Sub),
    pat!(FUNCT7, 0x0000_1033, "sll", R, Sll),
    pat!(FUNCT7, 0x0000_2033, "slt", R, Slt),
    pat!(FUNCT7, 0x0000_3033, "sltu", R, Sltu),
    pat!(FUNCT7, 0x0000_4033, "xor", R, Xor),
    pat!(FUNCT7, 0x0000_5033, "srl", R, Srl),
    pat!(FUNCT7, 0x4000_5033, "sra", R, Sra),
    pat!(FUNCT7, 0x0000_6033, "or", R, Or),
    pat!(FUNCT7, 0x0000_7033, "and", R, And),
    pat!(FUNCT7, 0x0200_0033, "mul", R, Mul),
    pat!(FUNCT7, 0x0200_1033, "mulh", R, Mulh),
    pat!(FUNCT7, 0x0200_2033, "mulhsu", R, Mulhsu),
    pat!(FUNCT7, 0x0200_3033, "mulhu", R, Mulhu),
    pat!(FUNCT7, 0x0200_4033, "div", R, Div),
    pat!(FUNCT7, 0x0200_5033, "divu", R, Divu),
    pat!(FUNCT7, 0x0200_6033, "rem", R, Rem),
    pat!(FUNCT7, 0x0200_7033, "remu", R, Remu),
    pat!(FUNCT3, 0x0000_000f, "fence", N, Fence),
    pat!(EXACT, 0x0000_0073, "ecall", N, Ecall),
    pat!(EXACT, 0x0010_0073, "ebreak", N, Ebreak),
    pat!(0, 0, "inv", N, Inv),
];

fn bits(x: u32, hi: u32, lo: u32) -> u32 {
    (x >> lo) & ((1 << (hi - lo + 1)) - 1)
}

fn imm_i(inst: u32) -> u32 {
    ((inst as i32) >> 20) as u32
}

fn imm_u(inst: u32) -> u32 {
    inst & 0xffff_f000
}

fn imm_s(inst: u32) -> u32 {
    ((((inst as i32) >> 25) << 5) as u32) | bits(inst, 11, 7)
}

fn imm_b(inst: u32) -> u32 {
    ((((inst as i32) >> 31) << 12) as u32)
        | (bits(inst, 30, 25) << 5)
        | (bits(inst, 11, 8) << 1)
        | (bits(inst, 7, 7) << 11)
}

fn imm_j(inst: u32) -> u32 {
    ((((inst as i32) >> 31) << 20) as u32)
        | (bits(inst, 30, 21) << 1)
        | (bits(inst, 19, 12) << 12)
        | (bits(inst, 20, 20) << 11)
}

/// Decode and execute the instruction word in `s`, updating `cpu` and `mem`.
///
/// On entry `s.pc`/`s.snpc`/`s.inst` are set by the fetcher; this sets
/// `s.dnpc` (defaulting to fall-through) and the disassembly text.
pub(crate) fn exec(s: &mut Decode, cpu: &mut CpuState, mem: &mut Memory) -> Result<Outcome> {
    let inst = s.inst;
    s.dnpc = s.snpc;

    let pat = PATTERNS
        .iter()
        .find(|p| inst & p.mask == p.value)
        .expect("decode table ends with a catch-all");

    let rd = bits(inst, 11, 7) as usize;
    let rs1 = bits(inst, 19, 15) as usize;
    let rs2 = bits(inst, 24, 20) as usize;
    let src1 = cpu.gpr[rs1];
    let src2 = cpu.gpr[rs2];
    let imm = match pat.kind {
        Kind::I => imm_i(inst),
        Kind::U => imm_u(inst),
        Kind::S => imm_s(inst),
        Kind::B => imm_b(inst),
        Kind::J => imm_j(inst),
        Kind::R | Kind::N => 0,
    };

    s.disasm = disassemble(pat, inst, s.pc, rd, rs1, rs2, imm);
    log::trace!("{:#010x}: {}", s.pc, s.disasm);

    let mut outcome = Outcome::Normal;

    match pat.op {
        Op::Lui => cpu.gpr[rd] = imm,
        Op::Auipc => cpu.gpr[rd] = s.pc.wrapping_add(imm),
        Op::Jal => {
            cpu.gpr[rd] = s.pc.wrapping_add(4);
            s.dnpc = s.pc.wrapping_add(imm);
        }
        Op::Jalr => {
            let link = s.pc.wrapping_add(4);
            s.dnpc = src1.wrapping_add(imm) & !1;
            cpu.gpr[rd] = link;
        }

        Op::Beq => branch(s, imm, src1 == src2),
        Op::Bne => branch(s, imm, src1 != src2),
        Op::Blt => branch(s, imm, (src1 as i32) < (src2 as i32)),
        Op::Bge => branch(s, imm, (src1 as i32) >= (src2 as i32)),
        Op::Bltu => branch(s, imm, src1 < src2),
        Op::Bgeu => branch(s, imm, src1 >= src2),

        Op::Lb => {
            let val = mem.read(src1.wrapping_add(imm), 1, ReadKind::Data)?;
            cpu.gpr[rd] = val as u8 as i8 as i32 as u32;
        }
        Op::Lh => {
            let val = mem.read(src1.wrapping_add(imm), 2, ReadKind::Data)?;
            cpu.gpr[rd] = val as u16 as i16 as i32 as u32;
        }
        Op::Lw => cpu.gpr[rd] = mem.read(src1.wrapping_add(imm), 4, ReadKind::Data)?,
        Op::Lbu => cpu.gpr[rd] = mem.read(src1.wrapping_add(imm), 1, ReadKind::Data)?,
        Op::Lhu => cpu.gpr[rd] = mem.read(src1.wrapping_add(imm), 2, ReadKind::Data)?,

        Op::Sb => mem.write(src1.wrapping_add(imm), 1, src2 & 0xff)?,
        Op::Sh => mem.write(src1.wrapping_add(imm), 2, src2 & 0xffff)?,
        Op::Sw => mem.write(src1.wrapping_add(imm), 4, src2)?,

        Op::Addi => cpu.gpr[rd] = src1.wrapping_add(imm),
        Op::Slti => cpu.gpr[rd] = ((src1 as i32) < (imm as i32)) as u32,
        Op::Sltiu => cpu.gpr[rd] = (src1 < imm) as u32,
        Op::Xori => cpu.gpr[rd] = src1 ^ imm,
        Op::Ori => cpu.gpr[rd] = src1 | imm,
        Op::Andi => cpu.gpr[rd] = src1 & imm,
        Op::Slli => cpu.gpr[rd] = src1 << (imm & 0x1f),
        Op::Srli => cpu.gpr[rd] = src1 >> (imm & 0x1f),
        Op::Srai => cpu.gpr[rd] = ((src1 as i32) >> (imm & 0x1f)) as u32,

        Op::Add => cpu.gpr[rd] = src1.wrapping_add(src2),
        Op::Sub => cpu.gpr[rd] = src1.wrapping_sub(src2),
        Op::Sll => cpu.gpr[rd] = src1 << (src2 & 0x1f),
        Op::Slt => cpu.gpr[rd] = ((src1 as i32) < (src2 as i32)) as u32,
        Op::Sltu => cpu.gpr[rd] = (src1 < src2) as u32,
        Op::Xor => cpu.gpr[rd] = src1 ^ src2,
        Op::Srl => cpu.gpr[rd] = src1 >> (src2 & 0x1f),
        Op::Sra => cpu.gpr[rd] = ((src1 as i32) >> (src2 & 0x1f)) as u32,
        Op::Or => cpu.gpr[rd] = src1 | src2,
        Op::And => cpu.gpr[rd] = src1 & src2,

        Op::Mul => cpu.gpr[rd] = src1.wrapping_mul(src2),
        Op::Mulh => {
            let prod = (src1 as i32 as i64) * (src2 as i32 as i64);
            cpu.gpr[rd] = (prod >> 32) as u32;
        }
        Op::Mulhsu => {
            let prod = (src1 as i32 as i64).wrapping_mul(src2 as i64);
            cpu.gpr[rd] = (prod >> 32) as u32;
        }
        Op::Mulhu => {
            let prod = (src1 as u64) * (src2 as u64);
            cpu.gpr[rd] = (prod >> 32) as u32;
        }
        Op::Div => {
            let (a, b) = (src1 as i32, src2 as i32);
            cpu.gpr[rd] = if b == 0 {
                u32::MAX
            } else {
                a.wrapping_div(b) as u32
            };
        }
        Op::Divu => cpu.gpr[rd] = if src2 == 0 { u32::MAX } else { src1 / src2 },
        Op::Rem => {
            let (a, b) = (src1 as i32, src2 as i32);
            cpu.gpr[rd] = if b == 0 { src1 } else { a.wrapping_rem(b) as u32 };
        }
        Op::Remu => cpu.gpr[rd] = if src2 == 0 { src1 } else { src1 % src2 },

        // Single hart, strongly ordered host memory: nothing to order.
        Op::Fence => {}
        Op::Ecall => {
            return Err(anyhow!(
                "ecall at pc = {:#010x}: environment calls are not supported",
                s.pc
            ));
        }
        Op::Ebreak => outcome = Outcome::Halt { code: cpu.gpr[10] },
        Op::Inv => {
            return Err(anyhow!(
                "invalid instruction {:#010x} at pc = {:#010x}",
                inst,
                s.pc
            ));
        }
    }

    // The generic write path above may have targeted x0.
    cpu.gpr[0] = 0;

    Ok(outcome)
}

fn branch(s: &mut Decode, imm: u32, taken: bool) {
    if taken {
        s.dnpc = s.pc.wrapping_add(imm);
    }
}

fn disassemble(pat: &Pattern, inst: u32, pc: u32, rd: usize, rs1: usize, rs2: usize, imm: u32) -> String {
    let name = pat.name;

    match pat.op {
        Op::Lui | Op::Auipc => format!("{} {}, {:#x}", name, REG_NAMES[rd], imm >> 12),
        Op::Jal => format!("{} {}, {:#x}", name, REG_NAMES[rd], pc.wrapping_add(imm)),
        Op::Jalr | Op::Lb | Op::Lh | Op::Lw | Op::Lbu | Op::Lhu => format!(
            "{} {}, {}({})",
            name, REG_NAMES[rd], imm as i32, REG_NAMES[rs1]
        ),
        Op::Beq | Op::Bne | Op::Blt | Op::Bge | Op::Bltu | Op::Bgeu => format!(
            "{} {}, {}, {:#x}",
            name,
            REG_NAMES[rs1],
            REG_NAMES[rs2],
            pc.wrapping_add(imm)
        ),
        Op::Sb | Op::Sh | Op::Sw => format!(
            "{} {}, {}({})",
            name, REG_NAMES[rs2], imm as i32, REG_NAMES[rs1]
        ),
        Op::Slli | Op::Srli | Op::Srai => format!(
            "{} {}, {}, {}",
            name,
            REG_NAMES[rd],
            REG_NAMES[rs1],
            imm & 0x1f
        ),
        Op::Addi | Op::Slti | Op::Sltiu | Op::Xori | Op::Ori | Op::Andi => format!(
            "{} {}, {}, {}",
            name,
            REG_NAMES[rd],
            REG_NAMES[rs1],
            imm as i32
        ),
        Op::Fence | Op::Ecall | Op::Ebreak => name.to_string(),
        Op::Inv => format!(".word {:#010x}", inst),
        // Everything else is a plain R-type.
        _ => format!(
            "{} {}, {}, {}",
            name, REG_NAMES[rd], REG_NAMES[rs1], REG_NAMES[rs2]
        ),
    }
}
