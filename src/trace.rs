use std::fs::File;
use std::io::{self, BufWriter, Write};

use anyhow::{Context, Result};
use serde::Serialize;

/// Number of slots in each trace ring.
pub const RING_DEPTH: usize = 11;

const EMPTY_SLOT: &str = "empty...... ";

/// A bounded circular log of rendered text lines.
///
/// Each slot owns its line; pushing into an occupied slot discards the
/// previous owner. The cursor always points at the next slot to overwrite,
/// which is also the oldest entry once the ring has wrapped.
pub struct TraceRing {
    slots: Vec<Option<String>>,
    cursor: usize,
}

impl TraceRing {
    pub fn new() -> Self {
        Self {
            slots: vec![None; RING_DEPTH],
            cursor: 0,
        }
    }

    /// Overwrite the slot at the cursor and advance.
    pub fn push(&mut self, line: String) {
        self.slots[self.cursor] = Some(line);
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    /// Write every slot to `w`, oldest first. The newest entry carries a
    /// ` ---> ` prefix; slots that were never filled print a sentinel.
    pub fn dump_to(&self, w: &mut impl Write) -> io::Result<()> {
        for i in 0..self.slots.len() {
            let slot = &self.slots[(self.cursor + i) % self.slots.len()];
            let line = slot.as_deref().unwrap_or(EMPTY_SLOT);
            if i == self.slots.len() - 1 {
                writeln!(w, " ---> {}", line)?;
            } else {
                writeln!(w, "      {}", line)?;
            }
        }

        Ok(())
    }

    pub fn dump(&self) {
        // Stdout writes only fail on a broken pipe; nothing useful to report.
        let _ = self.dump_to(&mut io::stdout());
    }
}

/// A single retired instruction, as recorded by the trace sink.
#[derive(Debug, Serialize)]
pub struct Step {
    pub pc: u32,
    pub inst: u32,
    pub disasm: String,
}

/// Render a step the way the instruction ring logs it: address, the raw
/// bytes most-significant first, then the disassembly.
pub fn render_line(step: &Step) -> String {
    let b = step.inst.to_le_bytes();
    format!(
        "{:#010x}: [{:02x} {:02x} {:02x} {:02x}]        {}",
        step.pc, b[3], b[2], b[1], b[0], step.disasm
    )
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TraceFormat {
    Text,
    Json,
}

/// Writes one record per retired instruction to a file, either as the
/// plain ring line or as a JSON object per line.
pub struct TraceSink {
    out: BufWriter<File>,
    format: TraceFormat,
}

impl TraceSink {
    pub fn create(path: &str, format: TraceFormat) -> Result<Self> {
        let file =
            File::create(path).with_context(|| format!("failed to create trace file {}", path))?;

        Ok(Self {
            out: BufWriter::new(file),
            format,
        })
    }

    pub fn record(&mut self, step: &Step) -> Result<()> {
        match self.format {
            TraceFormat::Text => writeln!(self.out, "{}", render_line(step))?,
            TraceFormat::Json => {
                serde_json::to_writer(&mut self.out, step)?;
                self.out.write_all(b"\n")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dumped(ring: &TraceRing) -> Vec<String> {
        let mut buf = Vec::new();
        ring.dump_to(&mut buf).unwrap();
        String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_empty_ring_dump() {
        let ring = TraceRing::new();
        let lines = dumped(&ring);

        assert_eq!(lines.len(), RING_DEPTH);
        assert!(lines.iter().all(|l| l.contains(EMPTY_SLOT)));
        assert!(lines.last().unwrap().starts_with(" ---> "));
    }

    #[test]
    fn test_dump_is_oldest_first_with_newest_marked() {
        let mut ring = TraceRing::new();
        for i in 0..RING_DEPTH + 3 {
            ring.push(format!("line {}", i));
        }

        let lines = dumped(&ring);
        assert_eq!(lines.len(), RING_DEPTH);

        // Entries 0..=2 were overwritten; the oldest survivor is entry 3.
        assert_eq!(lines[0], "      line 3");
        assert_eq!(
            *lines.last().unwrap(),
            format!(" ---> line {}", RING_DEPTH + 2)
        );
    }

    #[test]
    fn test_partial_ring_keeps_sentinels() {
        let mut ring = TraceRing::new();
        ring.push("only".into());

        let lines = dumped(&ring);
        assert_eq!(lines.iter().filter(|l| l.contains("only")).count(), 1);
        assert_eq!(
            lines.iter().filter(|l| l.contains(EMPTY_SLOT)).count(),
            RING_DEPTH - 1
        );
    }

    #[test]
    fn test_render_line_byte_order() {
        let step = Step {
            pc: 0x8000_0000,
            inst: 0x0010_0073,
            disasm: "ebreak".into(),
        };

        assert_eq!(
            render_line(&step),
            "0x80000000: [00 10 00 73]        ebreak"
        );
    }

    #[test]
    fn test_step_json_record() {
        let step = Step {
            pc: 0x8000_0004,
            inst: 0x0050_0513,
            disasm: "addi a0, $0, 5".into(),
        };

        let json = serde_json::to_string(&step).unwrap();
        assert_eq!(
            json,
            r#"{"pc":2147483652,"inst":5244179,"disasm":"addi a0, $0, 5"}"#
        );
    }
}
