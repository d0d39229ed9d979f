//! Log executed translation blocks
//!
//! Each execution of a translation block writes its start address to the
//! sink as 8 raw little-endian bytes. No options.

use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;
use tcg_plugin_api::args::split_option;
use tcg_plugin_api::{
    ConfigError, Disposition, ExecCallback, InstallInfo, Payload, Plugin, RegisterAccess, TranslationBlock,
    VcpuContext,
};

/// The `execlog` plugin
pub struct ExecLog<W: Write + Send> {
    sink: Arc<Mutex<W>>,
}

impl ExecLog<io::Stderr> {
    /// Install the plugin writing to standard error
    pub fn install(args: &[String], _info: &InstallInfo) -> Result<Self, ConfigError> {
        if let Some(opt) = args.first() {
            let (key, _) = split_option(opt);
            return Err(ConfigError::UnknownOption(key.to_string()));
        }
        Ok(Self::with_sink(io::stderr()))
    }
}

impl<W: Write + Send + 'static> ExecLog<W> {
    /// Log into an arbitrary writer
    pub fn with_sink(sink: W) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    /// Shared handle to the sink
    pub fn sink(&self) -> Arc<Mutex<W>> {
        self.sink.clone()
    }

    fn exec_callback(&self) -> ExecCallback {
        let sink = self.sink.clone();
        Arc::new(move |_: &mut dyn VcpuContext, payload: &Payload| {
            if let Payload::Vaddr(vaddr) = payload {
                if let Err(err) = sink.lock().write_all(&vaddr.to_le_bytes()) {
                    tracing::warn!("Dropping execlog entry for {:#x}: {}", vaddr, err);
                }
            }
            Disposition::Continue
        })
    }
}

impl<W: Write + Send + 'static> Plugin for ExecLog<W> {
    fn name(&self) -> &'static str {
        "execlog"
    }

    fn tb_trans(&self, tb: &mut TranslationBlock) {
        if let Some(mut insn) = tb.insn(0) {
            let vaddr = insn.vaddr();
            insn.register_exec_cb(self.exec_callback(), RegisterAccess::None, Payload::Vaddr(vaddr));
        }
    }

    fn atexit(&self) {
        if let Err(err) = self.sink.lock().flush() {
            tracing::warn!("Flushing execlog sink failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcg_plugin_api::sim::{Op, Outcome, Program, SimConfig, SimRuntime};

    #[test]
    fn test_logs_every_block_execution() {
        // Two iterations: the entry block runs the first one, the block at 0x14 the second
        let program = Program::new(0x10).register("r0", 8).insn(4, Op::MovImm { dst: 0, imm: 2 });
        let top = program.next_vaddr();
        let program = program
            .insn(4, Op::AddImm { dst: 0, imm: u64::MAX })
            .insn(4, Op::Jnz { reg: 0, target: top })
            .insn(4, Op::Halt);

        let plugin = Arc::new(ExecLog::with_sink(Vec::new()));
        let report = SimRuntime::new(&program, plugin.clone(), SimConfig::default())
            .unwrap()
            .run();
        assert_eq!(report.outcome, Outcome::Completed);

        let sink = plugin.sink();
        let bytes = sink.lock();
        let addrs: Vec<u64> = bytes
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
            .collect();
        assert_eq!(bytes.len() % 8, 0, "Entries are 8 bytes each");
        assert_eq!(addrs, vec![0x10, 0x14, 0x1c]);
    }

    #[test]
    fn test_rejects_options() {
        assert!(ExecLog::install(&["x=1".to_string()], &SimConfig::default().install_info()).is_err());
    }
}
