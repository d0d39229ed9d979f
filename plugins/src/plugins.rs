//! Instrumentation plugins
//!
//! Each plugin exposes an `install` constructor taking its `key=value`
//! options and implements [`tcg_plugin_api::Plugin`].

pub mod execlog;
pub mod sca_hw;
pub mod skipinsn;
pub mod stoptrigger;

pub use execlog::ExecLog;
pub use sca_hw::{LeakageRecord, ScaHw};
pub use skipinsn::SkipInsn;
pub use stoptrigger::{StopTrigger, StopTriggerConfig};
