//! Stop emulation at an address or after an instruction count
//!
//! Options:
//!
//! * `icount=<n>[:<code>]` - exit with `code` once a vCPU executes its
//!   `n+1`-th instrumented instruction
//! * `addr=<vaddr>[:<code>]` - exit with `code` when `vaddr` is reached;
//!   may be repeated
//! * `savevm=<name>` - save a snapshot named `name` before exiting
//!
//! With `savevm`, exiting is a two-step affair. The first trigger only
//! leaves the current translation block so that the CPU state of the
//! triggering instruction is synchronized; re-entering the block hits the
//! same trigger again, which then saves the snapshot and exits.
//!
//! When an address trigger and the count trigger are both eligible on the
//! same instruction, the address trigger wins: its hook is registered
//! first.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tcg_plugin_api::args::{parse_positive, parse_u64, require_value, split_exit_code, split_option};
use tcg_plugin_api::{
    CondOp, ConfigError, Disposition, ExecCallback, InlineOp, InstallInfo, Payload, Plugin, RegisterAccess,
    Scoreboard, TranslationBlock, VcpuContext, VcpuIndex, VcpuTable,
};

/// Instruction count limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcountLimit {
    pub limit: u64,
    pub exit_code: i32,
}

impl IcountLimit {
    /// Scoreboard value at which the trigger fires
    ///
    /// `None` for `u64::MAX`: a 64-bit counter can never exceed it.
    pub fn threshold(&self) -> Option<u64> {
        self.limit.checked_add(1)
    }
}

/// Parsed plugin options, immutable once installed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopTriggerConfig {
    pub icount: Option<IcountLimit>,
    /// Trigger address to exit code
    pub addrs: HashMap<u64, i32>,
    pub snapshot: Option<String>,
}

impl StopTriggerConfig {
    /// Parse `key=value` options
    ///
    /// Keys may come in any order; repeated `addr` entries accumulate and a
    /// repeated `icount` or `savevm` replaces the earlier one.
    pub fn parse(args: &[String]) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for opt in args {
            let (key, value) = split_option(opt);
            match key {
                "icount" => {
                    let value = require_value(key, value)?;
                    let (count, exit_code) = split_exit_code(key, value)?;
                    let limit = parse_positive(key, count)?;
                    config.icount = Some(IcountLimit { limit, exit_code });
                }
                "addr" => {
                    let value = require_value(key, value)?;
                    let (vaddr, exit_code) = split_exit_code(key, value)?;
                    config.addrs.insert(parse_u64(key, vaddr)?, exit_code);
                }
                "savevm" => {
                    config.snapshot = Some(require_value(key, value)?.to_string());
                }
                _ => return Err(ConfigError::UnknownOption(opt.clone())),
            }
        }

        if config.icount.is_none() && config.addrs.is_empty() {
            return Err(ConfigError::MissingTrigger);
        }
        Ok(config)
    }
}

/// Exit protocol phase of one vCPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExitPhase {
    #[default]
    Running,
    /// Left the translation block, snapshot pending
    TbExitRequested,
    /// Snapshot taken, about to exit
    StateSaved,
    Terminated,
}

/// Next action the controller must perform on a trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitStep {
    /// Leave the translation block and wait for re-entry
    RequestTbExit,
    /// Save the named snapshot, then terminate
    SaveAndTerminate(String),
    /// Terminate right away
    Terminate,
}

/// Per-vCPU exit state machine
///
/// `Running -> TbExitRequested -> StateSaved -> Terminated` when a snapshot
/// is configured, `Running -> Terminated` otherwise.
#[derive(Debug, Clone, Default)]
pub struct ExitMachine {
    phase: ExitPhase,
}

impl ExitMachine {
    /// Current phase
    pub fn phase(&self) -> ExitPhase {
        self.phase
    }

    /// Advance on a trigger and say what to do
    pub fn trigger(&mut self, snapshot: Option<&str>) -> ExitStep {
        match (self.phase, snapshot) {
            (ExitPhase::Running, Some(_)) => {
                self.phase = ExitPhase::TbExitRequested;
                ExitStep::RequestTbExit
            }
            (ExitPhase::TbExitRequested, Some(name)) => {
                self.phase = ExitPhase::StateSaved;
                ExitStep::SaveAndTerminate(name.to_string())
            }
            _ => {
                self.phase = ExitPhase::Terminated;
                ExitStep::Terminate
            }
        }
    }

    /// Record that the process is going away
    pub fn terminate(&mut self) {
        self.phase = ExitPhase::Terminated;
    }
}

struct Shared {
    config: StopTriggerConfig,
    phases: VcpuTable<Mutex<ExitMachine>>,
}

impl Shared {
    /// Drive the exit protocol for a trigger that fired with `message`
    fn fire(&self, ctx: &mut dyn VcpuContext, message: String, exit_code: i32) -> Disposition {
        let machine = self.phases.ensure(ctx.vcpu_index(), Mutex::default);
        let mut machine = machine.lock();

        match machine.trigger(self.config.snapshot.as_deref()) {
            ExitStep::RequestTbExit => {
                ctx.outs(&message);
                if let Some(name) = &self.config.snapshot {
                    ctx.outs(&format!(
                        "translation block exit requested, snapshot '{}' pending\n",
                        name
                    ));
                }
                Disposition::ExitTb
            }
            ExitStep::SaveAndTerminate(name) => {
                match ctx.savevm(&name) {
                    Ok(()) => ctx.outs(&format!("machine state saved into snapshot '{}' !\n", name)),
                    Err(err) => {
                        tracing::error!("Saving snapshot '{}' failed: {}", name, err);
                        ctx.outs(&format!("failed to save snapshot '{}': {}\n", name, err));
                    }
                }
                machine.terminate();
                Disposition::Exit(exit_code)
            }
            ExitStep::Terminate => {
                ctx.outs(&message);
                Disposition::Exit(exit_code)
            }
        }
    }
}

/// The `stoptrigger` plugin
pub struct StopTrigger {
    shared: Arc<Shared>,
    insn_count: Arc<Scoreboard>,
}

impl StopTrigger {
    /// Install the plugin from its options
    pub fn install(args: &[String], info: &InstallInfo) -> Result<Self, ConfigError> {
        let config = StopTriggerConfig::parse(args)?;
        tracing::info!(
            "Installing stoptrigger: icount={:?}, {} address trigger(s), snapshot={:?}",
            config.icount,
            config.addrs.len(),
            config.snapshot
        );
        if config.icount.is_some_and(|icount| icount.threshold().is_none()) {
            tracing::warn!("icount limit {} can never be exceeded, count trigger disabled", u64::MAX);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                phases: VcpuTable::with_capacity(info.expected_vcpus()),
            }),
            insn_count: Arc::new(Scoreboard::new()),
        })
    }

    /// Parsed configuration
    pub fn config(&self) -> &StopTriggerConfig {
        &self.shared.config
    }

    /// Instructions counted so far on `vcpu`
    pub fn insn_count(&self, vcpu: VcpuIndex) -> u64 {
        self.insn_count.get(vcpu)
    }

    /// Exit phase of `vcpu`
    pub fn phase(&self, vcpu: VcpuIndex) -> ExitPhase {
        self.shared
            .phases
            .lookup(vcpu)
            .map_or(ExitPhase::Running, |machine| machine.lock().phase())
    }

    fn icount_reached(&self) -> ExecCallback {
        let shared = self.shared.clone();
        Arc::new(move |ctx: &mut dyn VcpuContext, payload: &Payload| {
            let vaddr = match payload {
                Payload::Vaddr(vaddr) => *vaddr,
                other => panic!("icount trigger registered with payload {:?}", other),
            };
            let Some(icount) = shared.config.icount else {
                panic!("icount trigger fired without an icount limit");
            };
            let message = format!("icount reached at {:#x}, exiting\n", vaddr);
            shared.fire(ctx, message, icount.exit_code)
        })
    }

    fn address_reached(&self) -> ExecCallback {
        let shared = self.shared.clone();
        Arc::new(move |ctx: &mut dyn VcpuContext, payload: &Payload| {
            let (vaddr, exit_code) = match payload {
                Payload::Trigger { vaddr, exit_code } => (*vaddr, *exit_code),
                other => panic!("address trigger registered with payload {:?}", other),
            };
            let message = format!("{:#x} reached, exiting\n", vaddr);
            shared.fire(ctx, message, exit_code)
        })
    }
}

impl Plugin for StopTrigger {
    fn name(&self) -> &'static str {
        "stoptrigger"
    }

    fn tb_trans(&self, tb: &mut TranslationBlock) {
        let config = &self.shared.config;
        let address_cb = (!config.addrs.is_empty()).then(|| self.address_reached());
        let icount_cb = config
            .icount
            .and_then(|icount| icount.threshold())
            .map(|threshold| (threshold, self.icount_reached()));

        for i in 0..tb.n_insns() {
            let Some(mut insn) = tb.insn(i) else {
                continue;
            };
            let vaddr = insn.vaddr();

            if let (Some(cb), Some(&exit_code)) = (&address_cb, config.addrs.get(&vaddr)) {
                tracing::debug!("Arming address trigger at {:#x}", vaddr);
                insn.register_exec_cb(
                    cb.clone(),
                    RegisterAccess::None,
                    Payload::Trigger { vaddr, exit_code },
                );
            }

            if let Some((threshold, cb)) = &icount_cb {
                insn.register_exec_inline_per_vcpu(InlineOp::AddU64, self.insn_count.clone(), 1);
                insn.register_exec_cond_cb(
                    cb.clone(),
                    RegisterAccess::None,
                    CondOp::Ge,
                    self.insn_count.clone(),
                    *threshold,
                    Payload::Vaddr(vaddr),
                );
            }
        }
    }
}
