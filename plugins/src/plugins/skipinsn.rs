//! Skip one instruction
//!
//! Option `icount=<n>`: when the `n`-th instruction (counting from zero,
//! across all vCPUs) is about to execute, the PC is moved past it and the
//! translation block is left, so the instruction never commits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tcg_plugin_api::args::{require_value, split_option};
use tcg_plugin_api::{
    ConfigError, Disposition, ExecCallback, InstallInfo, InsnTable, Payload, Plugin, RegisterAccess,
    TranslationBlock, VcpuContext,
};

/// The `skipinsn` plugin
#[derive(Debug)]
pub struct SkipInsn {
    icount: u64,
    executed: Arc<AtomicU64>,
    insns: InsnTable,
}

impl SkipInsn {
    /// Install the plugin; `icount` is mandatory and decimal
    pub fn install(args: &[String], _info: &InstallInfo) -> Result<Self, ConfigError> {
        let mut icount = None;
        for opt in args {
            match split_option(opt) {
                ("icount", value) => {
                    let value = require_value("icount", value)?;
                    let invalid = || ConfigError::InvalidNumber {
                        key: "icount".to_string(),
                        value: value.to_string(),
                    };
                    if !value.chars().all(|c| c.is_ascii_digit()) {
                        return Err(invalid());
                    }
                    icount = Some(value.parse::<u64>().map_err(|_| invalid())?);
                }
                _ => return Err(ConfigError::UnknownOption(opt.clone())),
            }
        }

        let icount = icount.ok_or(ConfigError::MissingOption("icount"))?;
        tracing::info!("Installing skipinsn, skipping instruction #{}", icount);

        Ok(Self {
            icount,
            executed: Arc::new(AtomicU64::new(0)),
            insns: InsnTable::new(),
        })
    }

    /// Instructions counted so far, across all vCPUs
    pub fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    /// Distinct instructions seen at translation time
    pub fn insns(&self) -> &InsnTable {
        &self.insns
    }

    fn exec_callback(&self) -> ExecCallback {
        let icount = self.icount;
        let executed = self.executed.clone();
        Arc::new(move |ctx: &mut dyn VcpuContext, payload: &Payload| {
            let Payload::Insn(insn) = payload else {
                panic!("skipinsn callback registered with payload {:?}", payload);
            };

            if executed.fetch_add(1, Ordering::Relaxed) != icount {
                return Disposition::Continue;
            }
            executed.fetch_add(1, Ordering::Relaxed);

            ctx.outs(&format!("skipping instruction at address {:#x}\n", insn.vaddr));
            let pc = insn.next_vaddr();
            ctx.set_pc(pc);
            ctx.outs(&format!("pc has been set to {:#x}\n", pc));
            Disposition::ExitTb
        })
    }
}

impl Plugin for SkipInsn {
    fn name(&self) -> &'static str {
        "skipinsn"
    }

    fn tb_trans(&self, tb: &mut TranslationBlock) {
        let cb = self.exec_callback();
        for i in 0..tb.n_insns() {
            let Some(mut insn) = tb.insn(i) else {
                continue;
            };
            let record = self.insns.get_or_insert(insn.vaddr(), insn.size());
            insn.register_exec_cb(cb.clone(), RegisterAccess::None, Payload::Insn(record));
        }
    }

    fn atexit(&self) {
        tracing::info!(
            "skipinsn: {} instructions counted, {} distinct addresses",
            self.executed(),
            self.insns.len()
        );
    }
}
