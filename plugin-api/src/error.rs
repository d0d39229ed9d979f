//! Error types shared by plugins and host runtimes

use thiserror::Error;

/// Setup-time failure while parsing plugin options
///
/// Returned from a plugin's `install` function. A plugin that fails to
/// install registers no instrumentation at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Option key not understood by the plugin
    #[error("option parsing failed: {0}")]
    UnknownOption(String),

    /// Option given without a `=value` part
    #[error("option '{0}' requires a value")]
    MissingValue(String),

    /// Token that does not parse as an unsigned integer
    #[error("{key} parsing failed: '{value}' is not a valid number")]
    InvalidNumber { key: String, value: String },

    /// Count that must be strictly positive
    #[error("{key} parsing failed: '{value}' must be a positive integer")]
    NotPositive { key: String, value: String },

    /// Exit code outside the `i32` range
    #[error("{key} parsing failed: exit code '{value}' is out of range")]
    ExitCodeOutOfRange { key: String, value: String },

    /// Neither a count limit nor an address trigger was configured
    #[error("'icount' or 'addr' argument missing")]
    MissingTrigger,

    /// A mandatory option was not supplied
    #[error("'{0}' should be specified")]
    MissingOption(&'static str),
}

/// Failure of a host runtime primitive invoked from a callback
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// Register read from a callback registered without register access
    #[error("registers are not readable from this callback")]
    RegistersNotReadable,

    /// Handle that does not name a register of this vCPU
    #[error("unknown register handle {0}")]
    UnknownRegister(usize),

    /// The machine state could not be persisted
    #[error("snapshot '{name}' failed: {reason}")]
    Snapshot { name: String, reason: String },
}

/// Program description rejected by the simulated runtime
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    /// No instruction at the entry point
    #[error("no instruction at entry point {0:#x}")]
    MissingEntry(u64),

    /// Two instructions share an address
    #[error("duplicate instruction at {0:#x}")]
    DuplicateAddress(u64),

    /// Instruction with a zero length
    #[error("instruction at {0:#x} has zero size")]
    ZeroSize(u64),

    /// Register declared with a zero width
    #[error("register '{0}' has zero width")]
    ZeroWidth(String),

    /// Operand naming a register that does not exist
    #[error("instruction at {vaddr:#x} uses register {reg}, but only {count} are declared")]
    InvalidRegister { vaddr: u64, reg: usize, count: usize },

    /// Machine configured without any vCPU
    #[error("at least one vCPU is required")]
    NoVcpus,
}
