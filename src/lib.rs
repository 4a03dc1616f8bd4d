//! A small RV32IM instruction-set simulator with an interactive debugger.
//!
//! The [`sim::Simulator`] owns the architectural state, guest memory and
//! the per-retirement bookkeeping; the [`monitor::Monitor`] drives it from
//! a gdb-flavored command line.

pub mod cpu;
pub mod expr;
pub mod inst;
pub mod memory;
pub mod monitor;
pub mod sim;
pub mod trace;
pub mod watchpoint;
