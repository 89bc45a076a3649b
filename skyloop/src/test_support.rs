//! Test-only helpers: a scripted task runner and throwaway workspaces.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::core::overlay::{BaseConfig, parse_settings};
use crate::core::types::{NdfGroup, PipelineParams};
use crate::io::artifacts::expand_group;
use crate::io::config::{ToolCommand, ToolConfig};
use crate::io::tasks::{TaskFailedError, TaskKind, TaskRequest, TaskRunner};

/// One task as the runner saw it, with its inputs read at call time.
///
/// Group and config files live in the scratch area, which is usually gone
/// by the time a test inspects the run.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub request: TaskRequest,
    /// Members of every `key=^list` argument, keyed by lower-cased `key`.
    pub groups: BTreeMap<String, Vec<PathBuf>>,
    /// Overlay text passed through `config=^file`, for map-maker tasks.
    pub config: Option<String>,
}

impl RecordedCall {
    /// Members of the group passed as `key`; empty if there was none.
    pub fn group(&self, key: &str) -> &[PathBuf] {
        self.groups.get(key).map(Vec::as_slice).unwrap_or_default()
    }
}

/// Task runner that records requests and fakes the tools' file side effects.
///
/// Every task writes `<out>.sdf`. A map-maker task whose overlay sets
/// `exportclean=1` also writes the configured cleaned and EXT exports into
/// its working directory. Call `fail_at` (1-indexed, counting every task)
/// fails with a non-zero exit status instead.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    calls: RefCell<Vec<RecordedCall>>,
    fail_at: Option<usize>,
    cleaned_exports: Vec<String>,
    ext_exports: Vec<String>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self {
            cleaned_exports: vec![
                "s8a20121020_00012_0003_con_res_cln.sdf".to_string(),
                "s8b20121020_00012_0003_con_res_cln.sdf".to_string(),
            ],
            ext_exports: vec!["s8a20121020_00012_0003_con_ext.sdf".to_string()],
            ..Self::default()
        }
    }

    pub fn failing_at(call: usize) -> Self {
        Self {
            fail_at: Some(call),
            ..Self::new()
        }
    }

    pub fn with_exports(mut self, cleaned: &[&str], ext: &[&str]) -> Self {
        self.cleaned_exports = cleaned.iter().map(|name| name.to_string()).collect();
        self.ext_exports = ext.iter().map(|name| name.to_string()).collect();
        self
    }

    /// Tool config with placeholder commands; nothing is ever spawned.
    pub fn tools() -> ToolConfig {
        ToolConfig {
            makemap: ToolCommand::new(["makemap"]),
            paste: ToolCommand::new(["paste"]),
            ..ToolConfig::default()
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.borrow().clone()
    }

    pub fn makemap_calls(&self) -> Vec<RecordedCall> {
        self.calls_of(TaskKind::MakeMap)
    }

    pub fn paste_calls(&self) -> Vec<RecordedCall> {
        self.calls_of(TaskKind::Paste)
    }

    pub fn requests(&self) -> Vec<TaskRequest> {
        self.calls.borrow().iter().map(|call| call.request.clone()).collect()
    }

    pub fn makemap_requests(&self) -> Vec<TaskRequest> {
        self.makemap_calls().into_iter().map(|call| call.request).collect()
    }

    pub fn paste_requests(&self) -> Vec<TaskRequest> {
        self.paste_calls().into_iter().map(|call| call.request).collect()
    }

    /// Overlay text each map-maker task was given, in call order.
    pub fn configs_seen(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| call.config.clone())
            .collect()
    }

    fn calls_of(&self, kind: TaskKind) -> Vec<RecordedCall> {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call.request.kind == kind)
            .cloned()
            .collect()
    }

    fn record(&self, request: &TaskRequest) -> Result<RecordedCall> {
        let mut groups = BTreeMap::new();
        let mut config = None;
        for arg in &request.args {
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };
            if !value.starts_with('^') {
                continue;
            }
            let key = key.to_ascii_lowercase();
            if key == "config" {
                let path = value.trim_start_matches('^');
                config = Some(fs::read_to_string(path).with_context(|| format!("read {path}"))?);
            } else {
                let members = expand_group(&[value])?;
                groups.insert(key, members.iter().map(Path::to_path_buf).collect());
            }
        }
        Ok(RecordedCall {
            request: request.clone(),
            groups,
            config,
        })
    }

    fn export(&self, request: &TaskRequest) -> Result<()> {
        for name in self.cleaned_exports.iter().chain(&self.ext_exports) {
            let path = request.workdir.join(name);
            fs::write(&path, "exported").with_context(|| format!("write {}", path.display()))?;
        }
        Ok(())
    }
}

impl TaskRunner for ScriptedRunner {
    fn run(&self, request: &TaskRequest) -> Result<()> {
        let recorded = self.record(request)?;
        let exports_clean = recorded.config.as_deref().is_some_and(|text| {
            parse_settings(text)
                .iter()
                .rev()
                .find(|(key, _)| key == "exportclean")
                .is_some_and(|(_, value)| value == "1")
        });
        let call = {
            let mut calls = self.calls.borrow_mut();
            calls.push(recorded);
            calls.len()
        };

        if self.fail_at == Some(call) {
            return Err(TaskFailedError {
                label: request.label.clone(),
                exit_code: Some(1),
                timed_out: false,
            }
            .into());
        }

        if let Some(out) = request.arg_value("out") {
            let path = format!("{out}.sdf");
            fs::write(&path, request.label.as_bytes()).with_context(|| format!("write {path}"))?;
        }
        if exports_clean {
            self.export(request)?;
        }
        Ok(())
    }
}

/// Temp directory tree for one pipeline test:
/// `raw/` inputs, `work/` working directory, `scratch/` scratch parent.
pub struct TestWorkspace {
    root: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let root = tempfile::tempdir().context("tempdir")?;
        for dir in ["raw", "work", "scratch"] {
            fs::create_dir_all(root.path().join(dir)).with_context(|| format!("create {dir}"))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn workdir(&self) -> PathBuf {
        self.root().join("work")
    }

    pub fn scratch_parent(&self) -> PathBuf {
        self.root().join("scratch")
    }

    /// The final output map (without suffix).
    pub fn out(&self) -> PathBuf {
        self.root().join("out")
    }

    /// Create `count` raw time-series files and return them as a group.
    pub fn raw_inputs(&self, count: usize) -> Result<NdfGroup> {
        (1..=count)
            .map(|i| {
                let path = self
                    .root()
                    .join("raw")
                    .join(format!("s8a20121020_00012_{i:04}.sdf"));
                fs::write(&path, "raw").with_context(|| format!("write {}", path.display()))?;
                Ok(path)
            })
            .collect()
    }

    /// Parameters for a run over `inputs` fresh raw files.
    pub fn params(&self, inputs: usize, niter: u32) -> Result<PipelineParams> {
        let mut params = PipelineParams::new(self.raw_inputs(inputs)?, self.out(), self.workdir());
        params.niter = niter;
        params.config = BaseConfig::new("^dimmconfig.lis");
        params.scratch_parent = Some(self.scratch_parent());
        Ok(params)
    }

    /// Scratch areas currently present under the scratch parent.
    pub fn scratch_dirs(&self) -> Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(self.scratch_parent()).context("read scratch parent")? {
            dirs.push(entry.context("scratch entry")?.path());
        }
        dirs.sort();
        Ok(dirs)
    }
}
