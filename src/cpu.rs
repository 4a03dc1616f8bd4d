use std::io::{self, Write};

use crate::memory::MBASE;

/// Symbolic register names in architectural (index) order.
pub const REG_NAMES: [&str; 32] = [
    "$0", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4", "a5",
    "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5",
    "t6",
];

// The dump groups the argument registers ahead of the saved registers.
const DISPLAY_ORDER: [&str; 32] = [
    "$0", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7",
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4", "t5",
    "t6",
];

/// Resolve a symbolic register name to its index. Accepts both the `$0`
/// spelling from the name table and the bare `0` left after the expression
/// tokenizer strips the `$` sigil.
pub fn reg_index(name: &str) -> Option<usize> {
    REG_NAMES
        .iter()
        .position(|&r| r == name || r.trim_start_matches('$') == name)
}

/// Architectural state: 32 general-purpose registers and the program
/// counter. `gpr[0]` reads as zero at every instruction boundary; the
/// execute path re-zeroes it after each instruction body.
pub struct CpuState {
    pub gpr: [u32; 32],
    pub pc: u32,
}

impl CpuState {
    pub fn new() -> Self {
        Self {
            gpr: [0; 32],
            pc: MBASE,
        }
    }

    pub fn dump_to(&self, w: &mut impl Write) -> io::Result<()> {
        writeln!(w, "[ pc]: {:#010x}", self.pc)?;

        for row in DISPLAY_ORDER.chunks(4) {
            let cells: Vec<String> = row
                .iter()
                .map(|name| {
                    let idx = reg_index(name).expect("display table names a real register");
                    format!("[{:>3}]: {:#010x}", name, self.gpr[idx])
                })
                .collect();
            writeln!(w, "{}", cells.join(" | "))?;
        }

        Ok(())
    }

    pub fn dump(&self) {
        let _ = self.dump_to(&mut io::stdout());
    }
}

/// Per-instruction decode context. `snpc` is the static next PC (set by the
/// fetcher), `dnpc` the dynamic next PC (overridden by jumps and taken
/// branches). Lives for exactly one retirement.
pub struct Decode {
    pub pc: u32,
    pub snpc: u32,
    pub dnpc: u32,
    pub inst: u32,
    pub disasm: String,
}

impl Decode {
    pub fn new(pc: u32) -> Self {
        Self {
            pc,
            snpc: pc,
            dnpc: pc,
            inst: 0,
            disasm: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_index_spellings() {
        assert_eq!(reg_index("$0"), Some(0));
        assert_eq!(reg_index("0"), Some(0));
        assert_eq!(reg_index("ra"), Some(1));
        assert_eq!(reg_index("a0"), Some(10));
        assert_eq!(reg_index("s2"), Some(18));
        assert_eq!(reg_index("s11"), Some(27));
        assert_eq!(reg_index("t6"), Some(31));
        assert_eq!(reg_index("pc"), None);
        assert_eq!(reg_index("x1"), None);
    }

    #[test]
    fn test_dump_layout() {
        let mut cpu = CpuState::new();
        cpu.gpr[10] = 0x1234; // a0
        cpu.gpr[8] = 0xbeef; // s0

        let mut buf = Vec::new();
        cpu.dump_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        // One line for the pc, then 32 registers in rows of four.
        assert_eq!(lines.len(), 1 + 8);
        assert_eq!(lines[0], "[ pc]: 0x80000000");
        assert!(lines[3].contains("[ a0]: 0x00001234"));
        assert!(lines[5].contains("[ s0]: 0x0000beef"));
    }
}
