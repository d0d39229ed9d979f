//! Simulated host runtime
//!
//! A small deterministic stand-in for a dynamic binary translator. It
//! decodes a [`Program`] into translation blocks, hands each new block to
//! the plugin for instrumentation, and then runs the registered hooks
//! before every instruction exactly the way a real translator would:
//!
//! * inline scoreboard operations are applied without calling the plugin
//! * conditional callbacks run only when their predicate holds
//! * [`Disposition::ExitTb`] abandons the block before the instruction
//!   commits, and execution resumes at the current (or overridden) PC,
//!   which re-runs the hooks of the same instruction
//! * [`Disposition::Exit`] stops every vCPU
//!
//! The guest ISA only exists to make registers change and control flow
//! loop; it is not meant to model a real architecture.

use crate::api::{
    Disposition, ExecCallback, InlineOp, InsnHook, InstallInfo, Payload, Plugin, RegisterAccess,
    RegisterDescriptor, RegisterHandle, TbInsn, TranslationBlock, VcpuContext,
};
use crate::error::{HostError, ProgramError};
use crate::vcpu::VcpuIndex;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A register of the simulated machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSpec {
    pub name: String,
    /// Width in bytes
    pub width: usize,
}

/// Guest operations understood by the simulated runtime
///
/// Register operands are indices into [`Program::registers`]. Values wider
/// than 8 bytes only use their low 8 bytes as an operand; writes clear the
/// rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Op {
    Nop,
    MovImm { dst: usize, imm: u64 },
    Mov { dst: usize, src: usize },
    Add { dst: usize, src: usize },
    AddImm { dst: usize, imm: u64 },
    Xor { dst: usize, src: usize },
    Jmp { target: u64 },
    /// Branch to `target` when `reg` is non-zero
    Jnz { reg: usize, target: u64 },
    Halt,
}

impl Op {
    /// Control flow ends a translation block
    fn ends_block(&self) -> bool {
        matches!(self, Op::Jmp { .. } | Op::Jnz { .. } | Op::Halt)
    }

    fn registers(&self) -> Vec<usize> {
        match *self {
            Op::MovImm { dst, .. } | Op::AddImm { dst, .. } => vec![dst],
            Op::Mov { dst, src } | Op::Add { dst, src } | Op::Xor { dst, src } => vec![dst, src],
            Op::Jnz { reg, .. } => vec![reg],
            Op::Nop | Op::Jmp { .. } | Op::Halt => Vec::new(),
        }
    }
}

/// One guest instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub vaddr: u64,
    /// Length in bytes
    pub size: usize,
    pub op: Op,
}

/// Guest program: register file layout and code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    /// Address every vCPU starts at
    pub entry: u64,
    pub registers: Vec<RegisterSpec>,
    pub code: Vec<Instruction>,
}

impl Program {
    /// Empty program starting at `entry`
    pub fn new(entry: u64) -> Self {
        Self {
            entry,
            registers: Vec::new(),
            code: Vec::new(),
        }
    }

    /// Declare a register
    pub fn register(mut self, name: impl Into<String>, width: usize) -> Self {
        self.registers.push(RegisterSpec {
            name: name.into(),
            width,
        });
        self
    }

    /// Append an instruction right after the previous one
    pub fn insn(mut self, size: usize, op: Op) -> Self {
        let vaddr = self
            .code
            .last()
            .map_or(self.entry, |last| last.vaddr + last.size as u64);
        self.code.push(Instruction { vaddr, size, op });
        self
    }

    /// Address the next appended instruction will get
    pub fn next_vaddr(&self) -> u64 {
        self.code
            .last()
            .map_or(self.entry, |last| last.vaddr + last.size as u64)
    }

    fn validate(&self) -> Result<BTreeMap<u64, Instruction>, ProgramError> {
        if let Some(reg) = self.registers.iter().find(|reg| reg.width == 0) {
            return Err(ProgramError::ZeroWidth(reg.name.clone()));
        }

        let mut code = BTreeMap::new();
        for insn in &self.code {
            if insn.size == 0 {
                return Err(ProgramError::ZeroSize(insn.vaddr));
            }
            if let Some(&reg) = insn
                .op
                .registers()
                .iter()
                .find(|&&reg| reg >= self.registers.len())
            {
                return Err(ProgramError::InvalidRegister {
                    vaddr: insn.vaddr,
                    reg,
                    count: self.registers.len(),
                });
            }
            if code.insert(insn.vaddr, *insn).is_some() {
                return Err(ProgramError::DuplicateAddress(insn.vaddr));
            }
        }

        if !code.contains_key(&self.entry) {
            return Err(ProgramError::MissingEntry(self.entry));
        }
        Ok(code)
    }
}

/// How vCPUs are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheduling {
    /// All vCPUs on the calling thread, one translation block per turn
    #[default]
    RoundRobin,
    /// One native thread per vCPU
    Threaded,
}

/// Runtime configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    pub vcpus: usize,
    pub scheduling: Scheduling,
    /// Upper bound on instructions per translation block
    pub max_tb_insns: usize,
    /// Stop a vCPU after this many instruction executions, committed or not
    pub max_insns: Option<u64>,
    pub system_emulation: bool,
}

impl SimConfig {
    /// What a plugin learns about this machine at install time
    pub fn install_info(&self) -> InstallInfo {
        InstallInfo {
            system_emulation: self.system_emulation,
            max_vcpus: self.vcpus,
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            scheduling: Scheduling::RoundRobin,
            max_tb_insns: 16,
            max_insns: Some(1_000_000),
            system_emulation: false,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every vCPU halted
    Completed,
    /// A plugin requested termination
    Exited(i32),
    /// A vCPU hit `max_insns`
    StepLimit,
}

/// Register contents inside a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterValue {
    pub name: String,
    /// Little-endian bytes, hex encoded
    pub value: String,
}

/// Architectural state of one vCPU inside a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcpuSnapshot {
    pub index: VcpuIndex,
    pub pc: u64,
    pub halted: bool,
    pub registers: Vec<RegisterValue>,
}

/// Full machine state saved by `savevm`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub vcpus: Vec<VcpuSnapshot>,
}

/// Result of [`SimRuntime::run`]
#[derive(Debug, Clone)]
pub struct RunReport {
    pub outcome: Outcome,
    /// Everything plugins emitted through `outs`; empty when the runtime
    /// streamed it into a sink instead
    pub output: String,
    pub snapshots: Vec<Snapshot>,
    /// Committed instructions per vCPU
    pub retired: Vec<u64>,
    /// Number of translation blocks handed to the plugin
    pub translations: usize,
}

impl RunReport {
    /// Plugin output, line by line
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.output.lines()
    }

    /// Process exit status the run corresponds to
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::Exited(code) => code,
            Outcome::Completed | Outcome::StepLimit => 0,
        }
    }
}

#[derive(Debug)]
struct CachedBlock {
    tb: TranslationBlock,
    ops: Vec<Op>,
}

#[derive(Debug, Clone)]
struct SimVcpu {
    index: VcpuIndex,
    pc: u64,
    regs: Vec<Vec<u8>>,
    halted: bool,
    retired: u64,
    steps: u64,
    pc_override: Option<u64>,
}

impl SimVcpu {
    fn new(index: VcpuIndex, entry: u64, registers: &[RegisterDescriptor]) -> Self {
        Self {
            index,
            pc: entry,
            regs: registers.iter().map(|reg| vec![0; reg.width]).collect(),
            halted: false,
            retired: 0,
            steps: 0,
            pc_override: None,
        }
    }

    fn read(&self, reg: usize) -> u64 {
        let mut bytes = [0u8; 8];
        let value = &self.regs[reg];
        let len = value.len().min(8);
        bytes[..len].copy_from_slice(&value[..len]);
        u64::from_le_bytes(bytes)
    }

    fn write(&mut self, reg: usize, value: u64) {
        let target = &mut self.regs[reg];
        let bytes = value.to_le_bytes();
        for (i, byte) in target.iter_mut().enumerate() {
            *byte = bytes.get(i).copied().unwrap_or(0);
        }
    }

    /// Commit `op`; returns true when the vCPU halted
    fn commit(&mut self, vaddr: u64, size: usize, op: Op) -> bool {
        self.retired += 1;
        self.pc = vaddr.wrapping_add(size as u64);
        match op {
            Op::Nop => {}
            Op::MovImm { dst, imm } => self.write(dst, imm),
            Op::Mov { dst, src } => self.write(dst, self.read(src)),
            Op::Add { dst, src } => self.write(dst, self.read(dst).wrapping_add(self.read(src))),
            Op::AddImm { dst, imm } => self.write(dst, self.read(dst).wrapping_add(imm)),
            Op::Xor { dst, src } => self.write(dst, self.read(dst) ^ self.read(src)),
            Op::Jmp { target } => self.pc = target,
            Op::Jnz { reg, target } => {
                if self.read(reg) != 0 {
                    self.pc = target;
                }
            }
            Op::Halt => {
                self.halted = true;
                return true;
            }
        }
        false
    }
}

enum TbExit {
    Next,
    Halted,
    Stop,
    StepLimit,
}

/// Callback-facing view of one vCPU
struct SimContext<'a> {
    machine: &'a SimRuntime,
    vcpu: &'a mut SimVcpu,
    access: RegisterAccess,
}

impl VcpuContext for SimContext<'_> {
    fn vcpu_index(&self) -> VcpuIndex {
        self.vcpu.index
    }

    fn registers(&self) -> Vec<RegisterDescriptor> {
        self.machine.registers.clone()
    }

    fn read_register(&self, handle: RegisterHandle, buf: &mut Vec<u8>) -> Result<usize, HostError> {
        if self.access != RegisterAccess::Read {
            return Err(HostError::RegistersNotReadable);
        }
        let value = self
            .vcpu
            .regs
            .get(handle.0)
            .ok_or(HostError::UnknownRegister(handle.0))?;
        buf.clear();
        buf.extend_from_slice(value);
        Ok(value.len())
    }

    fn set_pc(&mut self, pc: u64) {
        self.vcpu.pc_override = Some(pc);
    }

    fn savevm(&mut self, name: &str) -> Result<(), HostError> {
        self.machine.savevm(name, self.vcpu)
    }

    fn outs(&mut self, msg: &str) {
        self.machine.output.lock().write(msg);
    }
}

/// Destination of plugin output
enum OutputSink {
    /// Kept in memory and handed back in [`RunReport::output`]
    Capture(String),
    /// Written through as it is produced
    Stream(Box<dyn Write + Send>),
}

impl OutputSink {
    fn write(&mut self, msg: &str) {
        match self {
            OutputSink::Capture(buf) => buf.push_str(msg),
            OutputSink::Stream(sink) => {
                if let Err(err) = sink.write_all(msg.as_bytes()) {
                    tracing::warn!("Dropping plugin output: {}", err);
                }
            }
        }
    }

    fn finish(self) -> String {
        match self {
            OutputSink::Capture(buf) => buf,
            OutputSink::Stream(mut sink) => {
                if let Err(err) = sink.flush() {
                    tracing::warn!("Flushing plugin output failed: {}", err);
                }
                String::new()
            }
        }
    }
}

/// Deterministic host runtime driving one plugin over one program
pub struct SimRuntime {
    code: BTreeMap<u64, Instruction>,
    entry: u64,
    registers: Vec<RegisterDescriptor>,
    plugin: Arc<dyn Plugin>,
    config: SimConfig,
    tb_cache: RwLock<HashMap<u64, Arc<CachedBlock>>>,
    translations: AtomicUsize,
    stop: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    output: Mutex<OutputSink>,
    snapshots: Mutex<Vec<Snapshot>>,
    published: Mutex<Vec<VcpuSnapshot>>,
}

impl SimRuntime {
    /// Validate `program` and prepare a machine for it
    pub fn new(program: &Program, plugin: Arc<dyn Plugin>, config: SimConfig) -> Result<Self, ProgramError> {
        if config.vcpus == 0 {
            return Err(ProgramError::NoVcpus);
        }
        let code = program.validate()?;
        let registers: Vec<RegisterDescriptor> = program
            .registers
            .iter()
            .enumerate()
            .map(|(i, reg)| RegisterDescriptor {
                handle: RegisterHandle(i),
                name: reg.name.clone(),
                width: reg.width,
            })
            .collect();

        let published = (0..config.vcpus)
            .map(|i| SimVcpu::new(i as VcpuIndex, program.entry, &registers))
            .map(|vcpu| vcpu_snapshot(&vcpu, &registers))
            .collect();

        Ok(Self {
            code,
            entry: program.entry,
            registers,
            plugin,
            config,
            tb_cache: RwLock::new(HashMap::new()),
            translations: AtomicUsize::new(0),
            stop: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            output: Mutex::new(OutputSink::Capture(String::new())),
            snapshots: Mutex::new(Vec::new()),
            published: Mutex::new(published),
        })
    }

    /// Stream plugin output into `sink` instead of keeping it in memory
    pub fn with_output(self, sink: impl Write + Send + 'static) -> Self {
        *self.output.lock() = OutputSink::Stream(Box::new(sink));
        self
    }

    /// Run until every vCPU halts, a plugin exits, or a step limit hits
    pub fn run(self) -> RunReport {
        tracing::info!(
            "Running plugin '{}' on {} vCPU(s), {:?} scheduling",
            self.plugin.name(),
            self.config.vcpus,
            self.config.scheduling
        );

        let (retired, step_limited) = match self.config.scheduling {
            Scheduling::RoundRobin => self.run_round_robin(),
            Scheduling::Threaded => self.run_threaded(),
        };

        self.plugin.atexit();

        let exit_code = *self.exit_code.lock();
        let outcome = match exit_code {
            Some(code) => Outcome::Exited(code),
            None if step_limited => Outcome::StepLimit,
            None => Outcome::Completed,
        };

        tracing::info!(
            "Run finished: {:?}, {} instructions retired",
            outcome,
            retired.iter().sum::<u64>()
        );

        RunReport {
            outcome,
            output: self.output.into_inner().finish(),
            snapshots: self.snapshots.into_inner(),
            retired,
            translations: self.translations.load(Ordering::Relaxed),
        }
    }

    fn run_round_robin(&self) -> (Vec<u64>, bool) {
        let mut vcpus: Vec<SimVcpu> = (0..self.config.vcpus)
            .map(|i| self.new_vcpu(i as VcpuIndex))
            .collect();
        for vcpu in &mut vcpus {
            self.init_vcpu(vcpu);
        }

        let mut step_limited = false;
        'outer: loop {
            let mut active = false;
            for vcpu in vcpus.iter_mut().filter(|vcpu| !vcpu.halted) {
                active = true;
                let exit = self.exec_tb(vcpu);
                self.publish(vcpu);
                match exit {
                    TbExit::Next | TbExit::Halted => {}
                    TbExit::StepLimit => {
                        step_limited = true;
                        vcpu.halted = true;
                    }
                    TbExit::Stop => break 'outer,
                }
            }
            if !active {
                break;
            }
        }

        (vcpus.iter().map(|vcpu| vcpu.retired).collect(), step_limited)
    }

    fn run_threaded(&self) -> (Vec<u64>, bool) {
        let results: Vec<(u64, bool)> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..self.config.vcpus)
                .map(|i| {
                    scope.spawn(move || {
                        let mut vcpu = self.new_vcpu(i as VcpuIndex);
                        self.init_vcpu(&mut vcpu);
                        let mut step_limited = false;
                        while !vcpu.halted {
                            let exit = self.exec_tb(&mut vcpu);
                            self.publish(&vcpu);
                            match exit {
                                TbExit::Next | TbExit::Halted => {}
                                TbExit::StepLimit => {
                                    step_limited = true;
                                    break;
                                }
                                TbExit::Stop => break,
                            }
                        }
                        (vcpu.retired, step_limited)
                    })
                })
                .collect();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                .collect()
        });

        let step_limited = results.iter().any(|&(_, limited)| limited);
        (results.into_iter().map(|(retired, _)| retired).collect(), step_limited)
    }

    fn new_vcpu(&self, index: VcpuIndex) -> SimVcpu {
        SimVcpu::new(index, self.entry, &self.registers)
    }

    fn init_vcpu(&self, vcpu: &mut SimVcpu) {
        tracing::debug!("Initializing vCPU {}", vcpu.index);
        let mut ctx = SimContext {
            machine: self,
            vcpu,
            access: RegisterAccess::Read,
        };
        self.plugin.vcpu_init(&mut ctx);
    }

    fn publish(&self, vcpu: &SimVcpu) {
        self.published.lock()[vcpu.index as usize] = vcpu_snapshot(vcpu, &self.registers);
    }

    fn savevm(&self, name: &str, live: &SimVcpu) -> Result<(), HostError> {
        let mut vcpus = self.published.lock().clone();
        let slot = vcpus.get_mut(live.index as usize).ok_or_else(|| HostError::Snapshot {
            name: name.to_string(),
            reason: format!("vCPU {} is not part of this machine", live.index),
        })?;
        *slot = vcpu_snapshot(live, &self.registers);

        tracing::info!("Saving machine state into snapshot '{}' (pc={:#x})", name, live.pc);
        self.snapshots.lock().push(Snapshot {
            name: name.to_string(),
            vcpus,
        });
        Ok(())
    }

    fn request_exit(&self, code: i32) {
        self.exit_code.lock().get_or_insert(code);
        self.stop.store(true, Ordering::Release);
    }

    fn translate(&self, pc: u64) -> Option<Arc<CachedBlock>> {
        if let Some(block) = self.tb_cache.read().get(&pc) {
            return Some(block.clone());
        }

        let mut insns = Vec::new();
        let mut ops = Vec::new();
        let mut vaddr = pc;
        while insns.len() < self.config.max_tb_insns.max(1) {
            let Some(insn) = self.code.get(&vaddr) else {
                break;
            };
            insns.push((insn.vaddr, insn.size));
            ops.push(insn.op);
            if insn.op.ends_block() {
                break;
            }
            vaddr = insn.vaddr.wrapping_add(insn.size as u64);
        }

        if insns.is_empty() {
            return None;
        }

        let mut tb = TranslationBlock::new(insns);
        self.plugin.tb_trans(&mut tb);
        self.translations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Translated block at {:#x} with {} instructions", pc, tb.n_insns());

        let block = Arc::new(CachedBlock { tb, ops });
        Some(self.tb_cache.write().entry(pc).or_insert(block).clone())
    }

    fn exec_tb(&self, vcpu: &mut SimVcpu) -> TbExit {
        let Some(block) = self.translate(vcpu.pc) else {
            tracing::warn!("vCPU {} fetched from unmapped address {:#x}, halting", vcpu.index, vcpu.pc);
            vcpu.halted = true;
            return TbExit::Halted;
        };

        for (insn, &op) in block.tb.insns().iter().zip(&block.ops) {
            if self.stop.load(Ordering::Acquire) {
                return TbExit::Stop;
            }
            if self.config.max_insns.is_some_and(|limit| vcpu.steps >= limit) {
                tracing::warn!("vCPU {} reached the instruction limit", vcpu.index);
                return TbExit::StepLimit;
            }
            vcpu.steps += 1;

            match self.run_hooks(vcpu, insn) {
                Disposition::Continue => {}
                Disposition::ExitTb => {
                    vcpu.pc = vcpu.pc_override.take().unwrap_or(insn.vaddr);
                    return TbExit::Next;
                }
                Disposition::Exit(code) => {
                    tracing::info!("vCPU {} requested exit with code {}", vcpu.index, code);
                    self.request_exit(code);
                    return TbExit::Stop;
                }
            }

            if let Some(pc) = vcpu.pc_override.take() {
                vcpu.pc = pc;
                return TbExit::Next;
            }

            if vcpu.commit(insn.vaddr, insn.size, op) {
                return TbExit::Halted;
            }
        }

        TbExit::Next
    }

    fn run_hooks(&self, vcpu: &mut SimVcpu, insn: &TbInsn) -> Disposition {
        for hook in &insn.hooks {
            let disposition = match hook {
                InsnHook::Inline { op, scoreboard, imm } => {
                    match op {
                        InlineOp::AddU64 => {
                            scoreboard.add(vcpu.index, *imm);
                        }
                        InlineOp::StoreU64 => scoreboard.store(vcpu.index, *imm),
                    }
                    Disposition::Continue
                }
                InsnHook::Callback { cb, access, payload } => self.call(vcpu, cb, *access, payload),
                InsnHook::Conditional {
                    cb,
                    access,
                    cond,
                    scoreboard,
                    imm,
                    payload,
                } => {
                    if cond.eval(scoreboard.get(vcpu.index), *imm) {
                        self.call(vcpu, cb, *access, payload)
                    } else {
                        Disposition::Continue
                    }
                }
            };

            if disposition != Disposition::Continue {
                return disposition;
            }
        }
        Disposition::Continue
    }

    fn call(&self, vcpu: &mut SimVcpu, cb: &ExecCallback, access: RegisterAccess, payload: &Payload) -> Disposition {
        let mut ctx = SimContext {
            machine: self,
            vcpu,
            access,
        };
        cb(&mut ctx, payload)
    }
}

fn vcpu_snapshot(vcpu: &SimVcpu, registers: &[RegisterDescriptor]) -> VcpuSnapshot {
    VcpuSnapshot {
        index: vcpu.index,
        pc: vcpu.pc,
        halted: vcpu.halted,
        registers: registers
            .iter()
            .zip(&vcpu.regs)
            .map(|(desc, value)| RegisterValue {
                name: desc.name.clone(),
                value: hex::encode(value),
            })
            .collect(),
    }
}
