use anyhow::{Context, Result};
use clap::{App, Arg};

use std::fs;
use std::process;

use remu::memory::{Memory, MBASE};
use remu::monitor::Monitor;
use remu::sim::{Simulator, State};
use remu::trace::{TraceFormat, TraceSink};

/// Loaded when no image is given: store a byte, load it back, trap.
const DEFAULT_IMAGE: [u32; 5] = [
    0x8000_02b7, // lui t0, 0x80000
    0x0002_8823, // sb $0, 16(t0)
    0x0102_c503, // lbu a0, 16(t0)
    0x0010_0073, // ebreak
    0xdead_beef,
];

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("batch")
                .help("Run the loaded image to completion and exit")
                .short("b")
                .long("batch"),
        )
        .arg(
            Arg::with_name("mem-random")
                .help("Fill guest memory with pseudo-random words")
                .long("mem-random"),
        )
        .arg(
            Arg::with_name("trace")
                .help("Write a record of every retired instruction to FILE")
                .short("t")
                .long("trace")
                .takes_value(true)
                .value_name("FILE"),
        )
        .arg(
            Arg::with_name("trace-format")
                .help("The trace record format to use")
                .short("F")
                .long("format")
                .takes_value(true)
                .possible_values(&["text", "json"])
                .default_value("text"),
        )
        .arg(
            Arg::with_name("image")
                .help("Raw binary loaded at the base of guest memory")
                .index(1),
        )
}

fn run() -> Result<i32> {
    let matches = app().get_matches();

    let mut mem = Memory::new(matches.is_present("mem-random"));
    match matches.value_of("image") {
        Some(path) => {
            let image =
                fs::read(path).with_context(|| format!("failed to read image {}", path))?;
            mem.load(MBASE, &image)?;
            log::info!("loaded {} bytes from {}", image.len(), path);
        }
        None => {
            log::info!("no image given, running the built-in default image");
            let mut bytes = Vec::with_capacity(DEFAULT_IMAGE.len() * 4);
            for word in &DEFAULT_IMAGE {
                bytes.extend_from_slice(&word.to_le_bytes());
            }
            mem.load(MBASE, &bytes)?;
        }
    }

    let mut sim = Simulator::new(mem);
    if let Some(path) = matches.value_of("trace") {
        let format = match matches.value_of("trace-format").unwrap() {
            "json" => TraceFormat::Json,
            _ => TraceFormat::Text,
        };
        sim.set_trace_sink(TraceSink::create(path, format)?);
    }

    let mut monitor = Monitor::new(sim, matches.is_present("batch"));
    monitor.run()?;

    // A clean exit is either the operator quitting or a good trap.
    let good = match monitor.sim().state {
        State::Quit => true,
        State::End { halt_ret, .. } => halt_ret == 0,
        _ => false,
    };

    Ok(if good { 0 } else { 1 })
}

fn main() {
    env_logger::init();

    process::exit(match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Fatal: {:#}", e);
            1
        }
    });
}
