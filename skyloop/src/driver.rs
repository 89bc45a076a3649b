//! Orchestration for one inside-out map-making run.
//!
//! Runs the map-maker once per iteration, feeding each output map back in as
//! the next iteration's sky estimate. Iteration 1 cleans the raw data and
//! exports the cleaned time-series and EXT model; later iterations reuse them.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument};

use crate::core::overlay::{ConfigLayer, Phase};
use crate::core::pattern::FilePattern;
use crate::core::plan::{InputSource, IterationStep, plan_iterations};
use crate::core::types::{MapArtifact, NdfGroup, ParamError, PipelineParams};
use crate::io::artifacts::{
    ExportPatterns, ReconciledArtifacts, capture_snapshot, ensure_ndf_exists, reconcile,
};
use crate::io::config::{ToolCommand, ToolConfig};
use crate::io::iteration_log::{IterationRecord, write_record};
use crate::io::scratch::ScratchArea;
use crate::io::tasks::{
    ForwardedArgs, MakemapArgs, TaskKind, TaskRequest, TaskRunner, makemap_args, paste_args,
};

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    /// The final output map.
    pub output: PathBuf,
    /// Every iteration's map, in iteration order. The last entry is `output`.
    pub history: Vec<MapArtifact>,
    /// The itermap cube, when one was requested.
    pub itermap: Option<PathBuf>,
    /// The scratch area, when it was retained.
    pub retained: Option<PathBuf>,
    /// Number of map-maker invocations.
    pub invocations: u32,
}

/// Run the whole pipeline: overlays, iterations, optional itermap cube, cleanup.
///
/// Parameters are checked before anything is created. The first failing
/// task aborts the run; the scratch area is then released according to the
/// retention flag and no cube is assembled.
#[instrument(skip_all, fields(niter = params.niter))]
pub fn run_pipeline<R: TaskRunner>(
    params: &PipelineParams,
    tools: &ToolConfig,
    runner: &R,
) -> Result<PipelineOutcome> {
    params.validate()?;
    check_inputs_exist(params)?;
    let patterns = ExportPatterns {
        cleaned: FilePattern::new(&tools.cleaned_pattern)?,
        ext: FilePattern::new(&tools.ext_pattern)?,
    };

    let mut scratch = match &params.scratch_parent {
        Some(parent) => ScratchArea::create_in(parent, params.retain)?,
        None => ScratchArea::create(params.retain)?,
    };
    info!(
        scratch = %scratch.path().display(),
        inputs = params.input.len(),
        "starting inside-out map-making"
    );

    // Taken before the first invocation so older files with the same names
    // are left alone afterwards.
    let before = capture_snapshot(&params.workdir, &patterns.cleaned)
        .context("snapshot working directory")?;
    debug!(preexisting = before.len(), "working directory snapshot");

    let mut overlays = Overlays::new(ConfigLayer::first(&params.config), &scratch)?;
    let raw_list = scratch.write_group("in", &params.input)?;
    let forwarded = ForwardedArgs {
        pixsize: params.pixsize,
        reference: params.reference.clone(),
        mask2: params.mask2.clone(),
        mask3: params.mask3.clone(),
        extra: params.extra.clone(),
    };

    let mut history: Vec<MapArtifact> = Vec::new();
    let mut cleaned_list: Option<PathBuf> = None;

    for step in plan_iterations(params.niter) {
        info!("Iteration {}...", step.iter);
        let output = if step.writes_final {
            MapArtifact::final_output(params.out.clone())
        } else {
            scratch.allocate_map()
        };
        let config = overlays.path_for(step.phase, &scratch)?;
        let input_list = match step.input {
            InputSource::Raw => raw_list.clone(),
            InputSource::Cleaned => cleaned_list
                .clone()
                .ok_or_else(|| anyhow!("cleaned time-series were not captured"))?,
        };
        let sky_estimate = if step.uses_previous_map {
            let previous = history
                .last()
                .ok_or_else(|| anyhow!("iteration {} has no previous map", step.iter))?;
            Some(previous.path.clone())
        } else {
            None
        };

        run_iteration(
            runner,
            &IterationTask {
                params,
                tools,
                scratch: &scratch,
                step,
                input_list: &input_list,
                config: &config,
                sky_estimate: sky_estimate.as_deref(),
                output: &output,
                forwarded: &forwarded,
            },
        )?;
        history.push(output);

        if step.phase == Phase::First {
            let artifacts = reconcile(&params.workdir, &scratch.cleaned_dir(), &before, &patterns)
                .context("capture first-iteration exports")?;
            cleaned_list = Some(write_cleaned_group(&scratch, &artifacts)?);
        }
    }

    let invocations = u32::try_from(history.len()).context("iteration count")?;
    let itermap = match &params.itermap {
        Some(cube) => {
            assemble_itermap(runner, params, tools, &scratch, &history, cube)?;
            Some(cube.clone())
        }
        None => None,
    };

    let retained = scratch.finish()?;
    if let Some(path) = &retained {
        info!("Retaining temporary files in {}", path.display());
    }

    Ok(PipelineOutcome {
        output: params.out.clone(),
        history,
        itermap,
        retained,
        invocations,
    })
}

/// Existence checks for everything the tools will read.
pub fn check_inputs_exist(params: &PipelineParams) -> Result<(), ParamError> {
    if !params.workdir.is_dir() {
        return Err(ParamError::new(format!(
            "working directory {} does not exist",
            params.workdir.display()
        )));
    }
    for member in params.input.iter() {
        ensure_ndf_exists("input", member)?;
    }
    let optional = [
        ("ref", &params.reference),
        ("mask2", &params.mask2),
        ("mask3", &params.mask3),
    ];
    for (what, path) in optional {
        if let Some(path) = path {
            ensure_ndf_exists(what, path)?;
        }
    }
    Ok(())
}

/// The phase overlays, materialised on first use.
///
/// A single-iteration run only ever writes the first-phase overlay.
struct Overlays {
    first: ConfigLayer,
    first_path: PathBuf,
    recurring: Option<(ConfigLayer, PathBuf)>,
    last: Option<PathBuf>,
}

impl Overlays {
    fn new(first: ConfigLayer, scratch: &ScratchArea) -> Result<Self> {
        // The first layer's parent is the user's base text, written verbatim.
        let first_path = scratch.write_config(Phase::First, &first.render(""))?;
        Ok(Self {
            first,
            first_path,
            recurring: None,
            last: None,
        })
    }

    fn path_for(&mut self, phase: Phase, scratch: &ScratchArea) -> Result<PathBuf> {
        match phase {
            Phase::First => Ok(self.first_path.clone()),
            Phase::Recurring => Ok(self.recurring(scratch)?.1.clone()),
            Phase::Last => {
                if let Some(path) = &self.last {
                    return Ok(path.clone());
                }
                let (recurring, recurring_path) = self.recurring(scratch)?;
                let layer = ConfigLayer::last(recurring);
                let path =
                    scratch.write_config(Phase::Last, &layer.render(&include(recurring_path)))?;
                self.last = Some(path.clone());
                Ok(path)
            }
        }
    }

    fn recurring(&mut self, scratch: &ScratchArea) -> Result<&(ConfigLayer, PathBuf)> {
        let entry = match self.recurring.take() {
            Some(entry) => entry,
            None => {
                let layer = ConfigLayer::recurring(&self.first);
                let path = scratch
                    .write_config(Phase::Recurring, &layer.render(&include(&self.first_path)))?;
                (layer, path)
            }
        };
        Ok(self.recurring.insert(entry))
    }
}

fn include(path: &Path) -> String {
    format!("^{}", path.display())
}

struct IterationTask<'a> {
    params: &'a PipelineParams,
    tools: &'a ToolConfig,
    scratch: &'a ScratchArea,
    step: IterationStep,
    input_list: &'a Path,
    config: &'a Path,
    sky_estimate: Option<&'a Path>,
    output: &'a MapArtifact,
    forwarded: &'a ForwardedArgs,
}

fn run_iteration<R: TaskRunner>(runner: &R, task: &IterationTask<'_>) -> Result<()> {
    let args = makemap_args(&MakemapArgs {
        input_list: task.input_list,
        out: &task.output.path,
        config: task.config,
        sky_estimate: task.sky_estimate,
        forwarded: task.forwarded,
    });
    let request = task_request(
        TaskKind::MakeMap,
        format!("makemap-{}", task.step.iter),
        &task.tools.makemap,
        args,
        task.params,
        task.scratch,
    );

    let started_at = Utc::now();
    let start = Instant::now();
    invoke(runner, &request)?;
    let ended_at = Utc::now();

    write_record(
        &task.scratch.iterations_dir(),
        &IterationRecord {
            iter: task.step.iter,
            phase: task.step.phase,
            config: task.config.to_path_buf(),
            input: task.input_list.to_path_buf(),
            sky_estimate: task.sky_estimate.map(Path::to_path_buf),
            output: task.output.path.clone(),
            is_final: task.output.is_final,
            started_at: started_at.to_rfc3339(),
            ended_at: ended_at.to_rfc3339(),
            duration_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        },
    )?;
    Ok(())
}

fn write_cleaned_group(scratch: &ScratchArea, artifacts: &ReconciledArtifacts) -> Result<PathBuf> {
    debug!(
        relocated = artifacts.relocated.len(),
        ext = artifacts.ext.len(),
        "first-iteration exports reconciled"
    );
    scratch.write_group("cleaned", &artifacts.cleaned)
}

fn assemble_itermap<R: TaskRunner>(
    runner: &R,
    params: &PipelineParams,
    tools: &ToolConfig,
    scratch: &ScratchArea,
    history: &[MapArtifact],
    cube: &Path,
) -> Result<()> {
    info!("Creating output itermap cube {}...", cube.display());
    let maps: NdfGroup = history.iter().map(|map| map.path.clone()).collect();
    let list = scratch.write_group("itermap", &maps)?;
    let request = task_request(
        TaskKind::Paste,
        "paste".to_string(),
        &tools.paste,
        paste_args(&list, cube),
        params,
        scratch,
    );
    invoke(runner, &request)
}

fn task_request(
    kind: TaskKind,
    label: String,
    command: &ToolCommand,
    args: Vec<String>,
    params: &PipelineParams,
    scratch: &ScratchArea,
) -> TaskRequest {
    let env = params
        .msg_filter
        .iter()
        .map(|filter| ("MSG_FILTER".to_string(), filter.clone()))
        .collect();
    TaskRequest {
        kind,
        log_path: scratch.logs_dir().join(format!("{label}.log")),
        label,
        command: command.clone(),
        args,
        workdir: params.workdir.clone(),
        env,
    }
}

fn invoke<R: TaskRunner>(runner: &R, request: &TaskRequest) -> Result<()> {
    debug!(">>> {}", request.display_command());
    runner.run(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::overlay::BaseConfig;
    use crate::test_support::{ScriptedRunner, TestWorkspace};
    use std::fs;

    #[test]
    fn single_iteration_writes_final_output_and_only_first_overlay() {
        let ws = TestWorkspace::new().expect("workspace");
        let mut params = ws.params(3, 1).expect("params");
        params.retain = true;
        let runner = ScriptedRunner::new();

        let outcome = run_pipeline(&params, &ScriptedRunner::tools(), &runner).expect("run");
        let scratch = outcome.retained.clone().expect("retained");
        assert!(scratch.join("conf0").is_file());
        assert!(!scratch.join("conf1").exists());
        assert!(!scratch.join("conf2").exists());

        let calls = runner.makemap_requests();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].arg_value("out"), Some(ws.out().to_str().expect("utf8")));
        assert!(calls[0].arg_value("config").expect("config").ends_with("conf0"));
        assert_eq!(outcome.invocations, 1);
        assert_eq!(outcome.history, vec![MapArtifact::final_output(ws.out())]);
        assert!(runner.configs_seen().iter().all(|text| !text.contains("importsky")));
    }

    #[test]
    fn overlays_are_written_lazily_and_chain_to_their_parents() {
        let ws = TestWorkspace::new().expect("workspace");
        let mut params = ws.params(1, 2).expect("params");
        params.config = BaseConfig::new("numiter=50");
        params.retain = true;
        let runner = ScriptedRunner::new();

        let outcome = run_pipeline(&params, &ScriptedRunner::tools(), &runner).expect("run");
        let scratch = outcome.retained.expect("retained");

        let conf0 = fs::read_to_string(scratch.join("conf0")).expect("conf0");
        assert!(conf0.starts_with("numiter=50\nnumiter=1\n"));
        let conf2 = fs::read_to_string(scratch.join("conf2")).expect("conf2");
        assert!(conf2.starts_with(&format!("^{}\n", scratch.join("conf1").display())));
        assert!(conf2.contains("com.zero_notlast=1\n"));
        let conf1 = fs::read_to_string(scratch.join("conf1")).expect("conf1");
        assert!(conf1.starts_with(&format!("^{}\n", scratch.join("conf0").display())));
    }

    #[test]
    fn missing_mask_is_a_parameter_error() {
        let ws = TestWorkspace::new().expect("workspace");
        let mut params = ws.params(2, 3).expect("params");
        params.mask2 = Some(ws.root().join("no_such_mask"));
        let runner = ScriptedRunner::new();

        let err = run_pipeline(&params, &ScriptedRunner::tools(), &runner).expect_err("invalid");
        assert!(err.downcast_ref::<ParamError>().is_some());
        assert!(runner.requests().is_empty());
        assert!(ws.scratch_dirs().expect("list").is_empty());
    }

    #[test]
    fn msg_filter_is_passed_through_environment() {
        let ws = TestWorkspace::new().expect("workspace");
        let mut params = ws.params(1, 1).expect("params");
        params.msg_filter = Some("quiet".to_string());
        let runner = ScriptedRunner::new();

        run_pipeline(&params, &ScriptedRunner::tools(), &runner).expect("run");
        let calls = runner.requests();
        assert_eq!(
            calls[0].env,
            vec![("MSG_FILTER".to_string(), "quiet".to_string())]
        );
    }
}
