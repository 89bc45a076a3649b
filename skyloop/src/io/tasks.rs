//! External task abstraction for the map-maker and the cube assembler.
//!
//! The [`TaskRunner`] trait decouples the iteration driver from process
//! spawning. Tests use scripted runners that record requests and fake the
//! tools' file side effects without spawning anything.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::config::{ToolCommand, ToolConfig};
use crate::io::process::run_command;

/// Which external tool a request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    MakeMap,
    Paste,
}

/// One external task invocation.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    pub kind: TaskKind,
    /// Short name used in logs, e.g. `makemap-3`.
    pub label: String,
    /// Program plus leading arguments, before environment expansion.
    pub command: ToolCommand,
    /// `key=value` parameters and any free-form extras, in order.
    pub args: Vec<String>,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Where captured stdout/stderr is written.
    pub log_path: PathBuf,
}

impl TaskRequest {
    /// Values of every `key=` parameter, in command-line order.
    pub fn arg_values(&self, key: &str) -> Vec<&str> {
        self.args
            .iter()
            .filter_map(|arg| arg.split_once('='))
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
            .collect()
    }

    /// First value of `key=`, if present.
    pub fn arg_value(&self, key: &str) -> Option<&str> {
        self.arg_values(key).into_iter().next()
    }

    /// The command line as a human would type it.
    pub fn display_command(&self) -> String {
        let mut words = self.command.command.clone();
        words.extend(self.args.iter().cloned());
        words.join(" ")
    }
}

/// Raised when an external task ran but reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailedError {
    pub label: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl fmt::Display for TaskFailedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timed_out {
            return write!(f, "{} timed out", self.label);
        }
        match self.exit_code {
            Some(code) => write!(f, "{} failed with exit status {code}", self.label),
            None => write!(f, "{} was terminated by a signal", self.label),
        }
    }
}

impl std::error::Error for TaskFailedError {}

/// Abstraction over task execution backends.
pub trait TaskRunner {
    /// Run the task to completion. Returns an error if it cannot be started
    /// or does not succeed.
    fn run(&self, request: &TaskRequest) -> Result<()>;
}

/// Runner that spawns the real Starlink tasks and blocks until they exit.
pub struct StarlinkTaskRunner {
    pub timeout: Option<Duration>,
    pub output_limit_bytes: usize,
}

impl StarlinkTaskRunner {
    pub fn from_config(cfg: &ToolConfig) -> Self {
        Self {
            timeout: cfg.timeout(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

impl TaskRunner for StarlinkTaskRunner {
    #[instrument(skip_all, fields(label = %request.label))]
    fn run(&self, request: &TaskRequest) -> Result<()> {
        let words = request.command.resolve()?;
        let (program, leading) = words
            .split_first()
            .ok_or_else(|| anyhow!("{} has an empty command", request.label))?;

        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(&request.args)
            .current_dir(&request.workdir);
        for (key, value) in &request.env {
            cmd.env(key, value);
        }

        let output = run_command(cmd, self.timeout, self.output_limit_bytes)
            .with_context(|| format!("run {}", request.label))?;

        write_task_log(&request.log_path, &output.render_log(&request.label))?;
        for line in output.stdout.text().lines() {
            debug!("{line}");
        }

        if !output.succeeded() {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "task failed");
            return Err(TaskFailedError {
                label: request.label.clone(),
                exit_code: output.status.code(),
                timed_out: output.timed_out,
            }
            .into());
        }

        info!(log = %request.log_path.display(), "task completed");
        Ok(())
    }
}

fn write_task_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create task log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write task log {}", path.display()))
}

/// Parameters forwarded unchanged to every map-maker invocation.
#[derive(Debug, Clone, Default)]
pub struct ForwardedArgs {
    pub pixsize: Option<f64>,
    /// The caller's alignment reference, passed alongside any sky estimate.
    pub reference: Option<PathBuf>,
    pub mask2: Option<PathBuf>,
    pub mask3: Option<PathBuf>,
    pub extra: Vec<String>,
}

/// Inputs for one map-maker invocation.
#[derive(Debug, Clone)]
pub struct MakemapArgs<'a> {
    /// Indirection file listing the time-series inputs.
    pub input_list: &'a Path,
    pub out: &'a Path,
    /// Overlay file for this phase.
    pub config: &'a Path,
    /// The previous iteration's map, absent on iteration 1.
    pub sky_estimate: Option<&'a Path>,
    pub forwarded: &'a ForwardedArgs,
}

/// Build the map-maker parameter list.
pub fn makemap_args(args: &MakemapArgs<'_>) -> Vec<String> {
    let mut out = vec![
        format!("in=^{}", args.input_list.display()),
        format!("out={}", args.out.display()),
        "method=iter".to_string(),
        format!("config=^{}", args.config.display()),
    ];
    if let Some(map) = args.sky_estimate {
        out.push(format!("ref={}", map.display()));
    }
    if let Some(pixsize) = args.forwarded.pixsize {
        out.push(format!("pixsize={pixsize}"));
    }
    if let Some(reference) = &args.forwarded.reference {
        out.push(format!("ref={}", reference.display()));
    }
    if let Some(mask2) = &args.forwarded.mask2 {
        out.push(format!("mask2={}", mask2.display()));
    }
    if let Some(mask3) = &args.forwarded.mask3 {
        out.push(format!("mask3={}", mask3.display()));
    }
    out.extend(args.forwarded.extra.iter().cloned());
    out
}

/// Build the cube assembler parameter list: stack the listed maps along a new third axis.
pub fn paste_args(maps_list: &Path, cube: &Path) -> Vec<String> {
    vec![
        format!("in=^{}", maps_list.display()),
        format!("out={}", cube.display()),
        "shift=[0,0,1]".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(args: Vec<String>) -> TaskRequest {
        TaskRequest {
            kind: TaskKind::MakeMap,
            label: "makemap-1".to_string(),
            command: ToolCommand::new(["makemap"]),
            args,
            workdir: PathBuf::from("."),
            env: Vec::new(),
            log_path: PathBuf::from("makemap-1.log"),
        }
    }

    #[test]
    fn makemap_args_include_forwarded_parameters_in_order() {
        let forwarded = ForwardedArgs {
            pixsize: Some(4.0),
            reference: Some(PathBuf::from("grid")),
            mask2: Some(PathBuf::from("m2")),
            mask3: None,
            extra: vec!["system=icrs".to_string()],
        };
        let args = makemap_args(&MakemapArgs {
            input_list: Path::new("/s/groups/in.lis"),
            out: Path::new("/s/map_0002"),
            config: Path::new("/s/conf1"),
            sky_estimate: Some(Path::new("/s/map_0001")),
            forwarded: &forwarded,
        });
        assert_eq!(
            args,
            vec![
                "in=^/s/groups/in.lis",
                "out=/s/map_0002",
                "method=iter",
                "config=^/s/conf1",
                "ref=/s/map_0001",
                "pixsize=4",
                "ref=grid",
                "mask2=m2",
                "system=icrs",
            ]
        );
    }

    #[test]
    fn makemap_args_omit_unset_parameters() {
        let forwarded = ForwardedArgs::default();
        let args = makemap_args(&MakemapArgs {
            input_list: Path::new("in.lis"),
            out: Path::new("out"),
            config: Path::new("conf0"),
            sky_estimate: None,
            forwarded: &forwarded,
        });
        assert_eq!(args.len(), 4);
        let req = request(args);
        assert_eq!(req.arg_value("ref"), None);
        assert_eq!(req.arg_value("config"), Some("^conf0"));
    }

    #[test]
    fn paste_args_stack_along_third_axis() {
        let args = paste_args(Path::new("maps.lis"), Path::new("cube"));
        assert_eq!(args, vec!["in=^maps.lis", "out=cube", "shift=[0,0,1]"]);
    }

    #[test]
    fn display_command_joins_program_and_args() {
        let req = request(vec!["in=^a".to_string(), "out=b".to_string()]);
        assert_eq!(req.display_command(), "makemap in=^a out=b");
    }

    #[test]
    fn task_failed_error_reports_status() {
        let err = TaskFailedError {
            label: "makemap-2".to_string(),
            exit_code: Some(1),
            timed_out: false,
        };
        assert_eq!(err.to_string(), "makemap-2 failed with exit status 1");
    }

    #[cfg(unix)]
    #[test]
    fn starlink_runner_reports_failure_and_writes_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = StarlinkTaskRunner {
            timeout: None,
            output_limit_bytes: 1024,
        };
        let mut req = request(vec!["echo hello; exit 2".to_string()]);
        req.command = ToolCommand::new(["sh", "-c"]);
        req.workdir = temp.path().to_path_buf();
        req.log_path = temp.path().join("logs").join("makemap-1.log");

        let err = runner.run(&req).expect_err("non-zero exit");
        let failed = err.downcast_ref::<TaskFailedError>().expect("typed error");
        assert_eq!(failed.exit_code, Some(2));
        let log = fs::read_to_string(&req.log_path).expect("log");
        assert!(log.contains("hello"));
    }
}
