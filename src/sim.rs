use std::time::Instant;

use anyhow::{Context, Result};

use crate::cpu::{CpuState, Decode};
use crate::expr::Evaluator;
use crate::inst::{self, Outcome};
use crate::memory::{Memory, ReadKind};
use crate::trace::{render_line, Step, TraceRing, TraceSink};
use crate::watchpoint::WatchpointPool;

/// Runs shorter than this echo every retired instruction to stdout, which
/// is what you want under `si`.
const MAX_INST_TO_PRINT: u64 = 10;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum State {
    Running,
    Stop,
    End { halt_pc: u32, halt_ret: u32 },
    Abort { halt_pc: u32 },
    Quit,
}

/// Differential-testing seam. The reference simulator on the other side is
/// an external collaborator; the driver only reports each retirement.
pub trait DiffTest {
    fn step(&mut self, pc: u32, dnpc: u32);
}

/// The simulator: architectural state, guest memory, the driver state
/// machine and the per-retirement bookkeeping hooks.
pub struct Simulator {
    pub cpu: CpuState,
    pub mem: Memory,
    pub state: State,
    pub eval: Evaluator,
    pub watchpoints: WatchpointPool,
    nr_guest_inst: u64,
    timer_us: u64,
    itrace: TraceRing,
    sink: Option<TraceSink>,
    difftest: Option<Box<dyn DiffTest>>,
    print_step: bool,
}

impl Simulator {
    pub fn new(mem: Memory) -> Self {
        Self {
            cpu: CpuState::new(),
            mem,
            state: State::Stop,
            eval: Evaluator::new(),
            watchpoints: WatchpointPool::new(),
            nr_guest_inst: 0,
            timer_us: 0,
            itrace: TraceRing::new(),
            sink: None,
            difftest: None,
            print_step: false,
        }
    }

    pub fn set_trace_sink(&mut self, sink: TraceSink) {
        self.sink = Some(sink);
    }

    pub fn set_difftest(&mut self, difftest: Box<dyn DiffTest>) {
        self.difftest = Some(difftest);
    }

    pub fn nr_guest_inst(&self) -> u64 {
        self.nr_guest_inst
    }

    /// Run up to `n` instructions; `u64::MAX` means run until something
    /// stops the simulation.
    pub fn cpu_exec(&mut self, n: u64) {
        self.print_step = n < MAX_INST_TO_PRINT;

        match self.state {
            State::End { .. } | State::Abort { .. } => {
                println!(
                    "Program execution has ended. To restart the program, exit remu and run again."
                );
                return;
            }
            _ => self.state = State::Running,
        }

        let start = Instant::now();
        self.execute(n);
        self.timer_us += start.elapsed().as_micros() as u64;

        match self.state {
            State::Running => self.state = State::Stop,
            State::Stop => {}
            State::End { halt_pc, halt_ret } => {
                let verdict = if halt_ret == 0 {
                    "HIT GOOD TRAP"
                } else {
                    "HIT BAD TRAP"
                };
                println!("remu: {} at pc = {:#010x}", verdict, halt_pc);
                self.statistic();
            }
            State::Abort { halt_pc } => {
                println!("remu: ABORT at pc = {:#010x}", halt_pc);
                self.statistic();
            }
            State::Quit => self.statistic(),
        }
    }

    fn execute(&mut self, n: u64) {
        let mut remaining = n;

        while remaining > 0 {
            remaining -= 1;

            if let Err(e) = self.exec_once() {
                // Fatal to the run: out-of-bound access, invalid
                // instruction or an environment call.
                println!("{:#}", e);
                self.cpu.dump();
                self.state = State::Abort {
                    halt_pc: self.cpu.pc,
                };
                break;
            }

            self.nr_guest_inst += 1;

            if self.state == State::Running {
                if let Some(id) = self.watchpoints.check(&self.eval, &self.cpu) {
                    println!(
                        "Hit watchpoint {}: {}",
                        id,
                        self.watchpoints.expr(id).unwrap_or("")
                    );
                    self.state = State::Stop;
                }
            }

            if self.state != State::Running {
                break;
            }

            self.mem.update_device();
        }
    }

    /// One retirement: fetch, decode, execute, commit `dnpc`, then feed the
    /// bookkeeping hooks (ring, echo, sink, difftest).
    fn exec_once(&mut self) -> Result<()> {
        let mut s = Decode::new(self.cpu.pc);

        let word = self
            .mem
            .read(s.snpc, 4, ReadKind::Fetch)
            .with_context(|| format!("at pc = {:#010x}", s.pc))?;
        s.inst = word;
        s.snpc = s.snpc.wrapping_add(4);

        let outcome = inst::exec(&mut s, &mut self.cpu, &mut self.mem)
            .with_context(|| format!("at pc = {:#010x}", s.pc))?;

        self.cpu.pc = s.dnpc;

        if let Outcome::Halt { code } = outcome {
            self.state = State::End {
                halt_pc: s.pc,
                halt_ret: code,
            };
        }

        let step = Step {
            pc: s.pc,
            inst: s.inst,
            disasm: s.disasm,
        };
        let line = render_line(&step);

        if self.print_step {
            println!("{}", line);
        }
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.record(&step) {
                log::warn!("trace sink write failed: {:#}", e);
            }
        }
        self.itrace.push(line);

        if let Some(difftest) = self.difftest.as_mut() {
            difftest.step(step.pc, self.cpu.pc);
        }

        Ok(())
    }

    /// Host time, retirement count and simulation frequency; dumps the
    /// instruction ring after an abort or a bad trap.
    pub fn statistic(&self) {
        println!("host time spent = {} us", self.timer_us);
        println!("total guest instructions = {}", self.nr_guest_inst);
        if self.timer_us > 0 {
            println!(
                "simulation frequency = {} inst/s",
                self.nr_guest_inst * 1_000_000 / self.timer_us
            );
        } else {
            println!("Finish running in less than 1 us and can not calculate the simulation frequency");
        }

        let bad = match self.state {
            State::Abort { .. } => true,
            State::End { halt_ret, .. } => halt_ret != 0,
            _ => false,
        };
        if bad {
            self.itrace.dump();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MBASE;

    fn load_words(sim: &mut Simulator, words: &[u32]) {
        let mut bytes = Vec::with_capacity(words.len() * 4);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        sim.mem.load(MBASE, &bytes).unwrap();
    }

    fn simulator_with(words: &[u32]) -> Simulator {
        let mut sim = Simulator::new(Memory::new(false));
        load_words(&mut sim, words);
        sim
    }

    #[test]
    fn test_exec_once_advances_pc_and_counts() {
        // addi a0, $0, 5
        let mut sim = simulator_with(&[0x0050_0513, 0x0010_0073]);

        sim.cpu_exec(1);
        assert_eq!(sim.cpu.pc, MBASE + 4);
        assert_eq!(sim.cpu.gpr[10], 5);
        assert_eq!(sim.nr_guest_inst(), 1);
        assert_eq!(sim.state, State::Stop);
    }

    #[test]
    fn test_ebreak_classifies_by_a0() {
        // addi a0, $0, 0; ebreak
        let mut sim = simulator_with(&[0x0000_0513, 0x0010_0073]);
        sim.cpu_exec(u64::MAX);
        assert_eq!(
            sim.state,
            State::End {
                halt_pc: MBASE + 4,
                halt_ret: 0
            }
        );
        assert_eq!(sim.nr_guest_inst(), 2);

        // addi a0, $0, 5; ebreak
        let mut sim = simulator_with(&[0x0050_0513, 0x0010_0073]);
        sim.cpu_exec(u64::MAX);
        assert_eq!(
            sim.state,
            State::End {
                halt_pc: MBASE + 4,
                halt_ret: 5
            }
        );
    }

    #[test]
    fn test_exec_after_end_is_rejected() {
        let mut sim = simulator_with(&[0x0000_0513, 0x0010_0073]);

        sim.cpu_exec(u64::MAX);
        let retired = sim.nr_guest_inst();
        sim.cpu_exec(1);
        assert_eq!(sim.nr_guest_inst(), retired);
        assert!(matches!(sim.state, State::End { .. }));
    }

    #[test]
    fn test_invalid_instruction_aborts() {
        let mut sim = simulator_with(&[0xffff_ffff]);

        sim.cpu_exec(u64::MAX);
        assert_eq!(sim.state, State::Abort { halt_pc: MBASE });
        assert_eq!(sim.nr_guest_inst(), 0);
    }

    #[test]
    fn test_jump_out_of_pmem_aborts() {
        // jalr $0, 0($0): jumps to address 0, whose fetch is out of bound.
        let mut sim = simulator_with(&[0x0000_0067]);

        sim.cpu_exec(u64::MAX);
        assert!(matches!(sim.state, State::Abort { .. }));
    }

    #[test]
    fn test_watchpoint_stops_at_the_tripping_retirement() {
        // addi a0, $0, 5; ebreak
        let mut sim = simulator_with(&[0x0050_0513, 0x0010_0073]);
        sim.watchpoints.add("$a0 == 5".into()).unwrap();

        sim.cpu_exec(u64::MAX);
        assert_eq!(sim.state, State::Stop);
        assert_eq!(sim.nr_guest_inst(), 1);
        assert_eq!(sim.cpu.pc, MBASE + 4);

        // Continuing runs into the ebreak.
        sim.cpu_exec(u64::MAX);
        assert_eq!(
            sim.state,
            State::End {
                halt_pc: MBASE + 4,
                halt_ret: 5
            }
        );
    }

    struct Recorder(std::rc::Rc<std::cell::RefCell<Vec<(u32, u32)>>>);

    impl DiffTest for Recorder {
        fn step(&mut self, pc: u32, dnpc: u32) {
            self.0.borrow_mut().push((pc, dnpc));
        }
    }

    #[test]
    fn test_difftest_hook_sees_every_retirement() {
        let log = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut sim = simulator_with(&[0x0000_0513, 0x0010_0073]);
        sim.set_difftest(Box::new(Recorder(log.clone())));

        sim.cpu_exec(u64::MAX);
        assert_eq!(
            *log.borrow(),
            vec![(MBASE, MBASE + 4), (MBASE + 4, MBASE + 8)]
        );
    }
}
