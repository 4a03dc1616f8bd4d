use std::io::{self, BufRead, Write};

use anyhow::Result;

use crate::memory::ReadKind;
use crate::sim::{Simulator, State};
use crate::watchpoint::NR_WP;

const CMD_TABLE: &[(&str, &str)] = &[
    ("help", "Display information about all supported commands"),
    ("c", "Continue the execution of the program"),
    ("q", "Exit remu"),
    ("si", "Execute N instructions in a single step, eg: si [N](default:1)"),
    ("x", "Scan N bytes of memory from EXPR, eg: x 10 0x80000000"),
    ("p", "Evaluate the expression, eg: p $a0 + 1"),
    ("w", "Add a watchpoint, eg: w $a0 == 5"),
    ("d", "Delete a watchpoint, eg: d 2"),
    ("info", "Show registers or watchpoints, eg: info r/w"),
];

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Status {
    Continue,
    Quit,
}

/// The interactive debugger front-end: reads a command line, dispatches it
/// against the simulator, and loops until `q` or end of input.
pub struct Monitor {
    sim: Simulator,
    batch: bool,
}

impl Monitor {
    pub fn new(sim: Simulator, batch: bool) -> Self {
        Self { sim, batch }
    }

    pub fn sim(&self) -> &Simulator {
        &self.sim
    }

    pub fn run(&mut self) -> Result<()> {
        if self.batch {
            self.sim.cpu_exec(u64::MAX);
            return Ok(());
        }

        let stdin = io::stdin();
        loop {
            print!("(remu) ");
            io::stdout().flush()?;

            let mut line = String::new();
            if stdin.lock().read_line(&mut line)? == 0 {
                break;
            }
            if self.dispatch(line.trim()) == Status::Quit {
                break;
            }
        }

        Ok(())
    }

    /// Execute one command line. The first word selects the command; the
    /// rest is handed to the command as its argument string.
    pub fn dispatch(&mut self, line: &str) -> Status {
        let mut parts = line.splitn(2, char::is_whitespace);
        let cmd = match parts.next() {
            Some(c) if !c.is_empty() => c,
            _ => return Status::Continue,
        };
        let args = parts.next().map(str::trim).filter(|a| !a.is_empty());

        match cmd {
            "help" => self.cmd_help(args),
            "c" => self.sim.cpu_exec(u64::MAX),
            "si" => self.cmd_si(args),
            "info" => self.cmd_info(args),
            "x" => self.cmd_x(args),
            "p" => self.cmd_p(args),
            "w" => self.cmd_w(args),
            "d" => self.cmd_d(args),
            "q" => {
                self.sim.state = State::Quit;
                return Status::Quit;
            }
            _ => println!("Unknown command '{}'", cmd),
        }

        Status::Continue
    }

    fn cmd_help(&self, args: Option<&str>) {
        match args {
            None => {
                for (name, desc) in CMD_TABLE {
                    println!("{} - {}", name, desc);
                }
            }
            Some(name) => match CMD_TABLE.iter().find(|(n, _)| *n == name) {
                Some((n, d)) => println!("{} - {}", n, d),
                None => println!("Unknown command '{}'", name),
            },
        }
    }

    fn cmd_si(&mut self, args: Option<&str>) {
        let n = match args {
            None => 1,
            Some(a) => match a.parse::<u64>() {
                Ok(n) if n > 0 => n,
                _ => {
                    println!("illegal input, eg: si [N](default:1)");
                    return;
                }
            },
        };

        self.sim.cpu_exec(n);
        self.sim.cpu.dump();
    }

    fn cmd_info(&mut self, args: Option<&str>) {
        match args {
            Some("r") => self.sim.cpu.dump(),
            Some("w") => self.sim.watchpoints.dump(),
            _ => println!("illegal input, eg: info r/w"),
        }
    }

    fn cmd_x(&mut self, args: Option<&str>) {
        let usage = "illegal input, eg: x 10 0x80000000";

        let (count, expr) = match args.and_then(|a| {
            let mut parts = a.splitn(2, char::is_whitespace);
            let n = parts.next()?.parse::<u32>().ok()?;
            Some((n, parts.next()?.trim().to_string()))
        }) {
            Some(pair) => pair,
            None => {
                println!("{}", usage);
                return;
            }
        };

        let mut addr = match self.sim.eval.eval(&expr, &self.sim.cpu) {
            Ok(val) => val as u32,
            Err(e) => {
                println!("{:#}", e);
                return;
            }
        };

        // N is in bytes: enough words to cover it, plus one more.
        for _ in 0..(count + 3) / 4 + 1 {
            match self.sim.mem.read(addr, 4, ReadKind::Data) {
                Ok(val) => println!("[{:#010x}] {:#010x}", addr, val),
                Err(e) => {
                    // Out-of-bound scans are fatal, like any other
                    // out-of-bound access: the ring is already dumped.
                    println!("{:#}", e);
                    self.sim.cpu.dump();
                    self.sim.state = State::Abort {
                        halt_pc: self.sim.cpu.pc,
                    };
                    return;
                }
            }
            addr = addr.wrapping_add(4);
        }
    }

    fn cmd_p(&mut self, args: Option<&str>) {
        let expr = match args {
            Some(e) => e,
            None => {
                println!("illegal input, eg: p $a0 + 1");
                return;
            }
        };

        match self.sim.eval.eval(expr, &self.sim.cpu) {
            Ok(val) => println!("{} ({:#010x})", val, val as u32),
            Err(e) => println!("{:#}", e),
        }
    }

    fn cmd_w(&mut self, args: Option<&str>) {
        let expr = match args {
            Some(e) => e,
            None => {
                println!("illegal input, eg: w $a0 == 5");
                return;
            }
        };

        // Reject syntax errors up front instead of warning on every
        // retirement later.
        if let Err(e) = self.sim.eval.eval(expr, &self.sim.cpu) {
            println!("{:#}", e);
            return;
        }

        match self.sim.watchpoints.add(expr.to_string()) {
            Some(id) => println!("Watchpoint {}: {}", id, expr),
            None => println!("Cannot add watchpoint: all {} slots are in use", NR_WP),
        }
    }

    fn cmd_d(&mut self, args: Option<&str>) {
        let id = match args.and_then(|a| a.parse::<usize>().ok()) {
            Some(id) => id,
            None => {
                println!("illegal input, eg: d 2");
                return;
            }
        };

        if !self.sim.watchpoints.remove(id) {
            println!("No watchpoint number {}.", id);
        }
    }
}
