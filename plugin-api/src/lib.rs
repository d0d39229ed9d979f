//! TCG Plugin API - Instrumentation substrate for dynamic binary translators
//!
//! This crate defines the contract between instrumentation plugins and the
//! host runtime that translates and executes guest code.
//!
//! # Overview
//!
//! * [`api`] - the [`Plugin`] trait, translation-block hook registration,
//!   and the [`VcpuContext`] services a callback may use
//! * [`vcpu`] - a growable, lock-protected per-vCPU state table
//! * [`scoreboard`] - per-vCPU counters updated inline by the runtime
//! * [`insn`] - address-keyed instruction records shared across vCPUs
//! * [`args`] - parsing helpers for `key=value` plugin options
//! * [`sim`] - a deterministic simulated runtime to drive plugins
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tcg_plugin_api::sim::{Op, Program, SimConfig, SimRuntime};
//! use tcg_plugin_api::{Plugin, TranslationBlock};
//!
//! struct Nothing;
//!
//! impl Plugin for Nothing {
//!     fn name(&self) -> &'static str {
//!         "nothing"
//!     }
//!
//!     fn tb_trans(&self, _tb: &mut TranslationBlock) {}
//! }
//!
//! let program = Program::new(0x1000)
//!     .register("r0", 8)
//!     .insn(4, Op::MovImm { dst: 0, imm: 42 })
//!     .insn(1, Op::Halt);
//!
//! let report = SimRuntime::new(&program, Arc::new(Nothing), SimConfig::default())
//!     .unwrap()
//!     .run();
//! println!("Retired {:?} instructions", report.retired);
//! ```

pub mod api;
pub mod args;
pub mod error;
pub mod insn;
pub mod scoreboard;
pub mod sim;
pub mod vcpu;

pub use api::{
    CondOp, Disposition, ExecCallback, InlineOp, InsnHandle, InsnHook, InstallInfo, Payload, Plugin,
    RegisterAccess, RegisterDescriptor, RegisterHandle, TbInsn, TranslationBlock, VcpuContext,
};
pub use error::{ConfigError, HostError, ProgramError};
pub use insn::{InsnRecord, InsnTable};
pub use scoreboard::Scoreboard;
pub use vcpu::{VcpuIndex, VcpuTable};
