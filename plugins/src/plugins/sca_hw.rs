//! Hamming-weight side-channel leakage on written registers
//!
//! Every executed instruction is charged with the Hamming weight of the
//! registers it changed. Registers can only be diffed once an instruction
//! has committed, which in a before-execution callback model means at the
//! start of the next callback on the same vCPU. Each callback therefore
//! reports the previous instruction and marks its own as pending.
//!
//! The last instruction executed on a vCPU has no successor and is never
//! reported.

use crate::registers::RegisterSnapshot;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tcg_plugin_api::args::split_option;
use tcg_plugin_api::{
    ConfigError, Disposition, ExecCallback, InstallInfo, Payload, Plugin, RegisterAccess, TranslationBlock,
    VcpuContext, VcpuIndex, VcpuTable,
};

/// Per-vCPU leakage state
#[derive(Debug)]
pub struct CpuLeakage {
    /// vCPU whose instruction is waiting to be diffed, if any
    pub last_cpu_index: Option<VcpuIndex>,
    pub registers: RegisterSnapshot,
    /// Records emitted so far
    pub reported: u64,
    /// Sum of all reported leakage
    pub total: u64,
}

impl CpuLeakage {
    fn new(ctx: &dyn VcpuContext) -> Self {
        Self {
            last_cpu_index: None,
            registers: RegisterSnapshot::initialize(ctx),
            reported: 0,
            total: 0,
        }
    }

    /// Finish the pending instruction, if any, and mark `cpu_index` pending
    pub fn step(&mut self, cpu_index: VcpuIndex, ctx: &dyn VcpuContext) -> Option<LeakageRecord> {
        let record = self.last_cpu_index.map(|cpu| {
            let hw_leakage = self.registers.diff(ctx);
            self.reported += 1;
            self.total += hw_leakage;
            LeakageRecord { cpu, hw_leakage }
        });

        self.last_cpu_index = Some(cpu_index);
        record
    }
}

/// Leakage of one retired instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakageRecord {
    pub cpu: VcpuIndex,
    pub hw_leakage: u64,
}

impl fmt::Display for LeakageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={}, hw_leakage={}", self.cpu, self.hw_leakage)
    }
}

/// The `sca-hw` plugin
#[derive(Debug)]
pub struct ScaHw {
    cpus: Arc<VcpuTable<Mutex<CpuLeakage>>>,
}

impl ScaHw {
    /// Install the plugin; it takes no options
    pub fn install(args: &[String], info: &InstallInfo) -> Result<Self, ConfigError> {
        if let Some(opt) = args.first() {
            let (key, _) = split_option(opt);
            return Err(ConfigError::UnknownOption(key.to_string()));
        }

        tracing::info!("Installing sca-hw for {} expected vCPU(s)", info.expected_vcpus());
        Ok(Self {
            cpus: Arc::new(VcpuTable::with_capacity(info.expected_vcpus())),
        })
    }

    /// Leakage state of a vCPU, once initialized
    pub fn cpu(&self, index: VcpuIndex) -> Option<Arc<Mutex<CpuLeakage>>> {
        self.cpus.lookup(index)
    }

    fn exec_callback(&self) -> ExecCallback {
        let cpus = self.cpus.clone();
        Arc::new(move |ctx: &mut dyn VcpuContext, _: &Payload| {
            let cpu_index = ctx.vcpu_index();
            let Some(cpu) = cpus.lookup(cpu_index) else {
                panic!("instruction executed on uninitialized vCPU {}", cpu_index);
            };

            let record = cpu.lock().step(cpu_index, ctx);
            if let Some(record) = record {
                ctx.outs(&format!("{}\n", record));
            }
            Disposition::Continue
        })
    }
}

impl Plugin for ScaHw {
    fn name(&self) -> &'static str {
        "sca-hw"
    }

    fn vcpu_init(&self, ctx: &mut dyn VcpuContext) {
        let index = ctx.vcpu_index();
        let ctx: &dyn VcpuContext = ctx;
        self.cpus.ensure(index, || Mutex::new(CpuLeakage::new(ctx)));
    }

    fn tb_trans(&self, tb: &mut TranslationBlock) {
        let cb = self.exec_callback();
        for i in 0..tb.n_insns() {
            if let Some(mut insn) = tb.insn(i) {
                insn.register_exec_cb(cb.clone(), RegisterAccess::Read, Payload::None);
            }
        }
    }

    fn atexit(&self) {
        for (index, cpu) in self.cpus.entries() {
            let cpu = cpu.lock();
            tracing::info!(
                "vCPU {}: {} leakage records, total hw_leakage={}",
                index,
                cpu.reported,
                cpu.total
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::tests::FakeCpu;
    use tcg_plugin_api::sim::{Op, Outcome, Program, Scheduling, SimConfig, SimRuntime};

    fn install() -> Arc<ScaHw> {
        Arc::new(ScaHw::install(&[], &SimConfig::default().install_info()).unwrap())
    }

    fn records(output: &str) -> Vec<(u32, u64)> {
        output
            .lines()
            .map(|line| {
                let (cpu, leakage) = line
                    .strip_prefix("cpu=")
                    .and_then(|rest| rest.split_once(", hw_leakage="))
                    .unwrap_or_else(|| panic!("malformed record: {}", line));
                (cpu.parse().unwrap(), leakage.parse().unwrap())
            })
            .collect()
    }

    #[test]
    fn test_first_step_reports_nothing() {
        let mut cpu = FakeCpu::new(vec![vec![0x00]]);
        let mut state = CpuLeakage::new(&cpu);

        assert_eq!(state.step(0, &cpu), None, "Nothing to diff against yet");
        cpu.regs[0] = vec![0xff];
        assert_eq!(
            state.step(0, &cpu),
            Some(LeakageRecord { cpu: 0, hw_leakage: 8 })
        );
        assert_eq!(
            state.step(0, &cpu),
            Some(LeakageRecord { cpu: 0, hw_leakage: 0 })
        );
        assert_eq!(state.reported, 2);
        assert_eq!(state.total, 8);
    }

    #[test]
    fn test_record_format() {
        let record = LeakageRecord { cpu: 2, hw_leakage: 17 };
        assert_eq!(record.to_string(), "cpu=2, hw_leakage=17");
    }

    #[test]
    fn test_rejects_options() {
        let err = ScaHw::install(&["verbose=1".to_string()], &SimConfig::default().install_info())
            .unwrap_err();
        assert_eq!(err, ConfigError::UnknownOption("verbose".to_string()));
    }

    #[test]
    fn test_one_record_per_instruction_with_successor() {
        let program = Program::new(0x1000)
            .register("r0", 8)
            .register("r1", 8)
            .insn(4, Op::MovImm { dst: 0, imm: 0xff })
            .insn(4, Op::MovImm { dst: 1, imm: 0x0f })
            .insn(4, Op::Mov { dst: 1, src: 1 })
            .insn(4, Op::Xor { dst: 0, src: 0 })
            .insn(1, Op::Halt);

        let plugin = install();
        let report = SimRuntime::new(&program, plugin.clone(), SimConfig::default())
            .unwrap()
            .run();

        assert_eq!(report.outcome, Outcome::Completed);
        // 5 instructions observed, the halt has no successor
        assert_eq!(
            records(&report.output),
            vec![(0, 8), (0, 4), (0, 0), (0, 0)],
            "Leakage should be the weight of each instruction's written value"
        );

        let cpu = plugin.cpu(0).unwrap();
        assert_eq!(cpu.lock().total, 12);
    }

    #[test]
    fn test_record_count_matches_loop_length() {
        let program = Program::new(0).register("r0", 4).insn(4, Op::MovImm { dst: 0, imm: 6 });
        let top = program.next_vaddr();
        let program = program
            .insn(4, Op::AddImm { dst: 0, imm: u64::MAX })
            .insn(4, Op::Jnz { reg: 0, target: top })
            .insn(4, Op::Halt);

        let report = SimRuntime::new(&program, install(), SimConfig::default())
            .unwrap()
            .run();

        let observed = report.retired[0];
        assert_eq!(observed, 14);
        assert_eq!(
            report.lines().count() as u64,
            observed - 1,
            "Every instruction but the last should be reported"
        );
    }

    #[test]
    fn test_interleaved_vcpus_keep_their_own_pending_insn() {
        // Two blocks: [mov r0=3, jmp] and [mov r0=1, halt]
        let program = Program::new(0)
            .register("r0", 8)
            .insn(4, Op::MovImm { dst: 0, imm: 3 })
            .insn(4, Op::Jmp { target: 0x8 })
            .insn(4, Op::MovImm { dst: 0, imm: 1 })
            .insn(4, Op::Halt);

        let config = SimConfig {
            vcpus: 2,
            system_emulation: true,
            ..SimConfig::default()
        };
        let plugin = Arc::new(ScaHw::install(&[], &config.install_info()).unwrap());
        let report = SimRuntime::new(&program, plugin.clone(), config).unwrap().run();

        assert_eq!(report.outcome, Outcome::Completed);
        // Round robin hands each vCPU one block per turn
        assert_eq!(
            records(&report.output),
            vec![(0, 2), (1, 2), (0, 0), (0, 1), (1, 0), (1, 1)],
            "Each record should charge the previous instruction of the same vCPU"
        );
        for index in 0..2 {
            let cpu = plugin.cpu(index).unwrap();
            let cpu = cpu.lock();
            assert_eq!(cpu.reported, 3);
            assert_eq!(cpu.total, 3);
            assert_eq!(cpu.last_cpu_index, Some(index), "The halt stays pending");
        }
    }

    #[test]
    fn test_threaded_vcpus_report_independently() {
        let program = Program::new(0)
            .register("r0", 8)
            .insn(4, Op::MovImm { dst: 0, imm: 1 })
            .insn(4, Op::MovImm { dst: 0, imm: 3 })
            .insn(4, Op::Halt);

        let config = SimConfig {
            vcpus: 3,
            scheduling: Scheduling::Threaded,
            system_emulation: true,
            ..SimConfig::default()
        };
        let plugin = Arc::new(ScaHw::install(&[], &config.install_info()).unwrap());
        let report = SimRuntime::new(&program, plugin.clone(), config).unwrap().run();

        let mut records = records(&report.output);
        records.sort();
        assert_eq!(records, vec![(0, 1), (0, 2), (1, 1), (1, 2), (2, 1), (2, 2)]);
        for index in 0..3 {
            assert_eq!(plugin.cpu(index).unwrap().lock().reported, 2);
        }
    }
}
