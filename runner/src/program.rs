//! Guest program files
//!
//! Programs are stored as JSON documents mirroring
//! [`tcg_plugin_api::sim::Program`]:
//!
//! ```json
//! {
//!   "entry": 4096,
//!   "registers": [{ "name": "r0", "width": 8 }],
//!   "code": [
//!     { "vaddr": 4096, "size": 4, "op": { "kind": "mov_imm", "dst": 0, "imm": 1 } },
//!     { "vaddr": 4100, "size": 4, "op": { "kind": "halt" } }
//!   ]
//! }
//! ```

use anyhow::Context;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tcg_plugin_api::sim::Program;

use crate::Result;

/// Load a program description from a JSON file
///
/// Only the document shape is checked here; the runtime validates
/// addresses and register operands when the machine is built.
pub fn load_program(path: impl AsRef<Path>) -> Result<Program> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Failed to open program file: {:?}", path))?;
    let reader = BufReader::new(file);

    let program: Program = serde_json::from_reader(reader)
        .with_context(|| format!("Failed to parse program from {:?}", path))?;

    tracing::debug!(
        "Loaded program from {:?}: entry={:#x}, {} instructions, {} registers",
        path,
        program.entry,
        program.code.len(),
        program.registers.len()
    );
    Ok(program)
}
