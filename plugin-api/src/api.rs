//! Instrumentation callback contract between plugins and the host runtime
//!
//! The host calls [`Plugin::tb_trans`] once per newly translated block.
//! The plugin inspects the block's instructions and attaches hooks to them
//! through [`InsnHandle`]. At execution time the host runs those hooks, in
//! registration order, before each instruction commits.

use crate::error::HostError;
use crate::insn::InsnRecord;
use crate::scoreboard::Scoreboard;
use crate::vcpu::VcpuIndex;
use std::fmt;
use std::sync::Arc;

/// Opaque handle naming one register of a vCPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegisterHandle(pub usize);

/// A register exposed by the host runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDescriptor {
    /// Handle used for reads
    pub handle: RegisterHandle,
    /// Architectural name, for diagnostics only
    pub name: String,
    /// Fixed width in bytes
    pub width: usize,
}

/// Static information passed to a plugin at install time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstallInfo {
    /// True for full-system emulation, false for user mode
    pub system_emulation: bool,
    /// Maximum number of vCPUs, known only in system emulation
    pub max_vcpus: usize,
}

impl InstallInfo {
    /// Number of vCPU slots worth reserving up front
    pub fn expected_vcpus(&self) -> usize {
        if self.system_emulation {
            self.max_vcpus
        } else {
            1
        }
    }
}

/// Whether a callback needs to read registers
///
/// Lets the runtime skip making register state available for callbacks
/// that do not look at it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterAccess {
    #[default]
    None,
    Read,
}

/// Operation performed inline by the runtime on a scoreboard entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineOp {
    /// Add the immediate to the counter
    AddU64,
    /// Overwrite the counter with the immediate
    StoreU64,
}

/// Predicate evaluated by the runtime before calling a conditional callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondOp {
    Always,
    Never,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CondOp {
    /// Evaluate `counter <op> imm`
    pub fn eval(self, counter: u64, imm: u64) -> bool {
        match self {
            CondOp::Always => true,
            CondOp::Never => false,
            CondOp::Eq => counter == imm,
            CondOp::Ne => counter != imm,
            CondOp::Lt => counter < imm,
            CondOp::Le => counter <= imm,
            CondOp::Gt => counter > imm,
            CondOp::Ge => counter >= imm,
        }
    }
}

/// User data attached to a callback at registration time
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Payload {
    #[default]
    None,
    /// Shared instruction metadata
    Insn(Arc<InsnRecord>),
    /// Address of the instrumented instruction
    Vaddr(u64),
    /// Address trigger resolved at translation time
    Trigger { vaddr: u64, exit_code: i32 },
}

/// What the runtime should do once a callback returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Disposition {
    /// Keep executing
    #[default]
    Continue,
    /// Leave the current translation block before this instruction
    /// commits; execution resumes at the current PC (or at the PC set by
    /// [`VcpuContext::set_pc`])
    ExitTb,
    /// Terminate emulation with the given exit code
    Exit(i32),
}

/// Services the runtime offers to a callback running on one vCPU
pub trait VcpuContext {
    /// Index of the vCPU this callback runs on
    fn vcpu_index(&self) -> VcpuIndex;

    /// Every readable register, in a stable order
    fn registers(&self) -> Vec<RegisterDescriptor>;

    /// Replace the contents of `buf` with the current bytes of a register
    ///
    /// Returns the number of bytes written.
    fn read_register(&self, handle: RegisterHandle, buf: &mut Vec<u8>) -> Result<usize, HostError>;

    /// Redirect execution; takes effect when the current instruction's
    /// hooks have run, and the instruction itself does not commit
    fn set_pc(&mut self, pc: u64);

    /// Persist a named snapshot of the whole machine
    fn savevm(&mut self, name: &str) -> Result<(), HostError>;

    /// Emit plugin output
    fn outs(&mut self, msg: &str);
}

/// Execution-time callback
pub type ExecCallback = Arc<dyn Fn(&mut dyn VcpuContext, &Payload) -> Disposition + Send + Sync>;

/// One hook attached to an instruction
#[derive(Clone)]
pub enum InsnHook {
    Callback {
        cb: ExecCallback,
        access: RegisterAccess,
        payload: Payload,
    },
    Inline {
        op: InlineOp,
        scoreboard: Arc<Scoreboard>,
        imm: u64,
    },
    Conditional {
        cb: ExecCallback,
        access: RegisterAccess,
        cond: CondOp,
        scoreboard: Arc<Scoreboard>,
        imm: u64,
        payload: Payload,
    },
}

impl fmt::Debug for InsnHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsnHook::Callback { access, payload, .. } => f
                .debug_struct("Callback")
                .field("access", access)
                .field("payload", payload)
                .finish(),
            InsnHook::Inline { op, imm, .. } => {
                f.debug_struct("Inline").field("op", op).field("imm", imm).finish()
            }
            InsnHook::Conditional {
                access,
                cond,
                imm,
                payload,
                ..
            } => f
                .debug_struct("Conditional")
                .field("access", access)
                .field("cond", cond)
                .field("imm", imm)
                .field("payload", payload)
                .finish(),
        }
    }
}

/// An instruction of a translation block, with its registered hooks
#[derive(Debug, Clone)]
pub struct TbInsn {
    /// Guest virtual address
    pub vaddr: u64,
    /// Length in bytes
    pub size: usize,
    /// Hooks in registration order
    pub hooks: Vec<InsnHook>,
}

impl TbInsn {
    /// Instruction without any hooks
    pub fn new(vaddr: u64, size: usize) -> Self {
        Self {
            vaddr,
            size,
            hooks: Vec::new(),
        }
    }
}

/// A newly translated block as seen by a plugin
#[derive(Debug, Clone, Default)]
pub struct TranslationBlock {
    insns: Vec<TbInsn>,
}

impl TranslationBlock {
    /// Build a block from `(vaddr, size)` pairs in execution order
    pub fn new(insns: impl IntoIterator<Item = (u64, usize)>) -> Self {
        Self {
            insns: insns
                .into_iter()
                .map(|(vaddr, size)| TbInsn::new(vaddr, size))
                .collect(),
        }
    }

    /// Address of the first instruction
    pub fn vaddr(&self) -> Option<u64> {
        self.insns.first().map(|insn| insn.vaddr)
    }

    /// Number of instructions
    pub fn n_insns(&self) -> usize {
        self.insns.len()
    }

    /// Handle to the `index`-th instruction, for hook registration
    pub fn insn(&mut self, index: usize) -> Option<InsnHandle<'_>> {
        self.insns.get_mut(index).map(|insn| InsnHandle { insn })
    }

    /// Instructions with their hooks, as the runtime executes them
    pub fn insns(&self) -> &[TbInsn] {
        &self.insns
    }
}

/// Registration handle for one instruction
#[derive(Debug)]
pub struct InsnHandle<'a> {
    insn: &'a mut TbInsn,
}

impl InsnHandle<'_> {
    /// Guest virtual address of the instruction
    pub fn vaddr(&self) -> u64 {
        self.insn.vaddr
    }

    /// Length of the instruction in bytes
    pub fn size(&self) -> usize {
        self.insn.size
    }

    /// Call `cb` every time the instruction executes
    pub fn register_exec_cb(&mut self, cb: ExecCallback, access: RegisterAccess, payload: Payload) {
        self.insn.hooks.push(InsnHook::Callback { cb, access, payload });
    }

    /// Apply `op` with `imm` to the executing vCPU's scoreboard entry
    pub fn register_exec_inline_per_vcpu(&mut self, op: InlineOp, scoreboard: Arc<Scoreboard>, imm: u64) {
        self.insn.hooks.push(InsnHook::Inline { op, scoreboard, imm });
    }

    /// Call `cb` only when `cond` holds between the executing vCPU's
    /// scoreboard entry and `imm`
    pub fn register_exec_cond_cb(
        &mut self,
        cb: ExecCallback,
        access: RegisterAccess,
        cond: CondOp,
        scoreboard: Arc<Scoreboard>,
        imm: u64,
        payload: Payload,
    ) {
        self.insn.hooks.push(InsnHook::Conditional {
            cb,
            access,
            cond,
            scoreboard,
            imm,
            payload,
        });
    }
}

/// A loadable instrumentation plugin
pub trait Plugin: Send + Sync {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    /// Called once per vCPU before it executes anything
    fn vcpu_init(&self, _ctx: &mut dyn VcpuContext) {}

    /// Called once per newly translated block
    fn tb_trans(&self, tb: &mut TranslationBlock);

    /// Called when emulation ends, naturally or through an exit
    fn atexit(&self) {}
}
