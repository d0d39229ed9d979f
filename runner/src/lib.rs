//! TCG Runner - Drive instrumentation plugins over guest programs
//!
//! This crate connects program loading, plugin installation, and the
//! simulated runtime into a high-level API, and persists the snapshots a
//! run produced.

pub mod program;

pub use program::load_program;

use anyhow::{bail, Context};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tcg_plugin_api::sim::{RunReport, Scheduling, SimConfig, SimRuntime, Snapshot};
use tcg_plugin_api::{InstallInfo, Plugin};
use tcg_plugins::{ExecLog, ScaHw, SkipInsn, StopTrigger};

/// Result type for runner operations
pub type Result<T> = anyhow::Result<T>;

/// Names accepted by [`load_plugin`]
pub const PLUGINS: &[&str] = &["sca-hw", "stoptrigger", "skipinsn", "execlog"];

/// Install the plugin called `name` with its `key=value` options
pub fn load_plugin(name: &str, args: &[String], info: &InstallInfo) -> Result<Arc<dyn Plugin>> {
    let plugin: Arc<dyn Plugin> = match name {
        "sca-hw" => Arc::new(ScaHw::install(args, info).context("Failed to install sca-hw")?),
        "stoptrigger" => Arc::new(StopTrigger::install(args, info).context("Failed to install stoptrigger")?),
        "skipinsn" => Arc::new(SkipInsn::install(args, info).context("Failed to install skipinsn")?),
        "execlog" => Arc::new(ExecLog::install(args, info).context("Failed to install execlog")?),
        other => bail!("Unknown plugin '{}', expected one of: {}", other, PLUGINS.join(", ")),
    };

    tracing::debug!("Installed plugin '{}' with {} option(s)", name, args.len());
    Ok(plugin)
}

/// Everything needed for one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// JSON program file
    pub program: PathBuf,
    pub plugin: String,
    /// Plugin options, `key=value`
    pub args: Vec<String>,
    pub vcpus: usize,
    pub scheduling: Scheduling,
    /// Per-vCPU execution budget
    pub max_insns: Option<u64>,
    pub system_emulation: bool,
    /// Where snapshots are written, if anywhere
    pub snapshot_dir: Option<PathBuf>,
}

impl RunOptions {
    /// Run `plugin` over `program` with default machine settings
    pub fn new(program: impl Into<PathBuf>, plugin: impl Into<String>) -> Self {
        let defaults = SimConfig::default();
        Self {
            program: program.into(),
            plugin: plugin.into(),
            args: Vec::new(),
            vcpus: defaults.vcpus,
            scheduling: defaults.scheduling,
            max_insns: defaults.max_insns,
            system_emulation: defaults.system_emulation,
            snapshot_dir: None,
        }
    }

    /// Machine configuration these options describe
    pub fn sim_config(&self) -> SimConfig {
        SimConfig {
            vcpus: self.vcpus,
            scheduling: self.scheduling,
            max_insns: self.max_insns,
            system_emulation: self.system_emulation,
            ..SimConfig::default()
        }
    }
}

/// High-level API: load, instrument, and run a program
///
/// Plugin output is collected into [`RunReport::output`]. Snapshots are
/// written to [`RunOptions::snapshot_dir`] when it is set.
pub fn run(options: &RunOptions) -> Result<RunReport> {
    execute(options, |runtime| runtime)
}

/// Like [`run`], but plugin output is written to `sink` as it is produced
pub fn run_with_output(options: &RunOptions, sink: impl Write + Send + 'static) -> Result<RunReport> {
    execute(options, |runtime| runtime.with_output(sink))
}

fn execute(options: &RunOptions, setup: impl FnOnce(SimRuntime) -> SimRuntime) -> Result<RunReport> {
    let program = load_program(&options.program)?;
    let config = options.sim_config();

    let plugin = load_plugin(&options.plugin, &options.args, &config.install_info())?;
    let runtime = SimRuntime::new(&program, plugin, config)
        .with_context(|| format!("Invalid program {:?}", options.program))?;

    let report = setup(runtime).run();
    tracing::info!(
        "Run finished: {:?}, retired={:?}, {} translation(s), {} snapshot(s)",
        report.outcome,
        report.retired,
        report.translations,
        report.snapshots.len()
    );

    if let Some(dir) = &options.snapshot_dir {
        save_snapshots(dir, &report)?;
    }
    Ok(report)
}

/// Write every snapshot of `report` into `dir` as `<name>.json`
pub fn save_snapshots(dir: &Path, report: &RunReport) -> Result<Vec<PathBuf>> {
    if report.snapshots.is_empty() {
        return Ok(Vec::new());
    }

    fs::create_dir_all(dir).with_context(|| format!("Failed to create snapshot directory {:?}", dir))?;
    tracing::info!("Saving {} snapshot(s) to {:?}", report.snapshots.len(), dir);

    report
        .snapshots
        .iter()
        .map(|snapshot| save_snapshot(dir, snapshot))
        .collect()
}

fn save_snapshot(dir: &Path, snapshot: &Snapshot) -> Result<PathBuf> {
    if snapshot.name.is_empty() || snapshot.name.contains(['/', '\\']) || snapshot.name.starts_with('.') {
        bail!("Snapshot name '{}' is not a valid file name", snapshot.name);
    }

    let path = dir.join(format!("{}.json", snapshot.name));
    let file = File::create(&path).with_context(|| format!("Failed to create snapshot file: {:?}", path))?;
    let writer = BufWriter::new(file);

    serde_json::to_writer_pretty(writer, snapshot)
        .with_context(|| format!("Failed to serialize snapshot to {:?}", path))?;

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcg_plugin_api::sim::{Op, Outcome, Program};
    use tcg_plugin_api::ConfigError;

    fn write_program(dir: &Path, program: &Program) -> PathBuf {
        let path = dir.join("program.json");
        fs::write(&path, serde_json::to_vec_pretty(program).unwrap()).unwrap();
        path
    }

    fn counter_program() -> Program {
        (1..=6)
            .fold(Program::new(0x1000).register("r0", 8).register("r1", 8), |program, i| {
                program.insn(4, Op::MovImm { dst: i % 2, imm: i as u64 })
            })
            .insn(4, Op::Halt)
    }

    #[test]
    fn test_load_plugin_registry() {
        let info = SimConfig::default().install_info();
        for name in PLUGINS {
            let args: Vec<String> = match *name {
                "stoptrigger" => vec!["icount=1".to_string()],
                "skipinsn" => vec!["icount=0".to_string()],
                _ => Vec::new(),
            };
            let plugin = load_plugin(name, &args, &info).unwrap();
            assert_eq!(plugin.name(), *name, "Registry should hand out the plugin it was asked for");
        }
    }

    #[test]
    fn test_load_plugin_errors() {
        let info = SimConfig::default().install_info();

        let unknown = load_plugin("cache", &[], &info).err().unwrap();
        assert!(unknown.to_string().contains("Unknown plugin 'cache'"));

        let missing = load_plugin("stoptrigger", &[], &info).err().unwrap();
        assert_eq!(
            missing.downcast_ref::<ConfigError>(),
            Some(&ConfigError::MissingTrigger),
            "Configuration errors should stay inspectable"
        );
    }

    #[test]
    fn test_run_sca_hw() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = RunOptions::new(write_program(dir.path(), &counter_program()), "sca-hw");
        options.snapshot_dir = Some(dir.path().join("snapshots"));

        let report = run(&options).unwrap();
        assert_eq!(report.outcome, Outcome::Completed);
        assert_eq!(report.exit_code(), 0);
        // 6 movs then halt: weights of 1..=6
        let leakage: Vec<&str> = report.lines().collect();
        assert_eq!(
            leakage,
            vec![
                "cpu=0, hw_leakage=1",
                "cpu=0, hw_leakage=1",
                "cpu=0, hw_leakage=2",
                "cpu=0, hw_leakage=1",
                "cpu=0, hw_leakage=2",
                "cpu=0, hw_leakage=2",
            ]
        );
        assert!(!dir.path().join("snapshots").exists(), "No snapshots, no directory");
    }

    #[test]
    fn test_run_stoptrigger_persists_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let snapshots = dir.path().join("snapshots");
        let mut options = RunOptions::new(write_program(dir.path(), &counter_program()), "stoptrigger");
        options.args = vec!["icount=2:7".to_string(), "savevm=halfway".to_string()];
        options.snapshot_dir = Some(snapshots.clone());

        let report = run(&options).unwrap();
        assert_eq!(report.exit_code(), 7);

        let file = File::open(snapshots.join("halfway.json")).unwrap();
        let snapshot: Snapshot = serde_json::from_reader(file).unwrap();
        assert_eq!(snapshot, report.snapshots[0], "Saved file should match the in-memory snapshot");
        assert_eq!(snapshot.vcpus[0].pc, 0x1008);
        // Two instructions committed: r1=1 then r0=2
        assert_eq!(snapshot.vcpus[0].registers[0].value, "0200000000000000");
        assert_eq!(snapshot.vcpus[0].registers[1].value, "0100000000000000");
    }

    #[test]
    fn test_run_with_output_streams_records() {
        let dir = tempfile::tempdir().unwrap();
        let out_path = dir.path().join("leakage.txt");
        let options = RunOptions::new(write_program(dir.path(), &counter_program()), "sca-hw");

        let sink = BufWriter::new(File::create(&out_path).unwrap());
        let report = run_with_output(&options, sink).unwrap();

        assert_eq!(report.outcome, Outcome::Completed);
        assert!(report.output.is_empty(), "Streamed records should not be held in the report");
        let written = fs::read_to_string(&out_path).unwrap();
        assert_eq!(written.lines().count(), 6);
        assert!(written.starts_with("cpu=0, hw_leakage=1\n"));
    }

    #[test]
    fn test_run_rejects_invalid_program() {
        let dir = tempfile::tempdir().unwrap();
        let program = Program::new(0x10).register("r0", 8).insn(4, Op::Mov { dst: 0, src: 3 });
        let options = RunOptions::new(write_program(dir.path(), &program), "sca-hw");

        let err = run(&options).unwrap_err();
        assert!(format!("{:#}", err).contains("uses register 3"));
    }

    #[test]
    fn test_save_snapshot_rejects_path_names() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = Snapshot {
            name: "../escape".to_string(),
            vcpus: Vec::new(),
        };
        assert!(save_snapshot(dir.path(), &snapshot).is_err());
    }
}
