//! TCG Plugins - Instruction-level instrumentation
//!
//! Plugins built on [`tcg_plugin_api`]:
//!
//! * `sca-hw` reports the Hamming-weight leakage of every executed
//!   instruction as `cpu=<i>, hw_leakage=<v>` lines
//! * `stoptrigger` ends emulation after an instruction count or on reaching
//!   an address, optionally saving a snapshot first
//! * `skipinsn` skips exactly one instruction
//! * `execlog` logs the start address of every executed translation block
//!
//! [`registers`] and [`hamming`] hold the register diffing machinery
//! `sca-hw` is built from.

pub mod hamming;
pub mod plugins;
pub mod registers;

pub use plugins::{ExecLog, LeakageRecord, ScaHw, SkipInsn, StopTrigger, StopTriggerConfig};
pub use registers::{RegisterSnapshot, RegisterTrack};
