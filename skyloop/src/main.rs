//! Inside-out map-making driver.
//!
//! Makes a map from raw time-series data by running the map-maker once per
//! iteration, each run starting from the map made by the previous one.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use skyloop::core::overlay::BaseConfig;
use skyloop::core::types::{
    DEFAULT_CONFIG, DEFAULT_ITERATIONS, ParamError, PipelineParams, split_extra,
};
use skyloop::driver::run_pipeline;
use skyloop::exit_codes;
use skyloop::io::artifacts::expand_group;
use skyloop::io::config::{DEFAULT_CONFIG_FILE, load_config};
use skyloop::io::tasks::StarlinkTaskRunner;
use skyloop::logging::{self, InfoLevel};

#[derive(Debug, Parser)]
#[command(
    name = "skyloop",
    version,
    about = "Make a map using the inside-out iterative algorithm"
)]
struct Cli {
    /// Raw time-series data. An entry `^file` reads one path per line from `file`.
    #[arg(required = true, value_name = "IN")]
    input: Vec<String>,

    /// Output map.
    #[arg(long)]
    out: PathBuf,

    /// Number of iterations (1-1000). There is no convergence test.
    #[arg(long, default_value_t = DEFAULT_ITERATIONS)]
    niter: u32,

    /// Pixel size in arcsec, used for both axes. Defaults to the map-maker's choice.
    #[arg(long)]
    pixsize: Option<f64>,

    /// Map-maker tuning parameters: `^file` or literal `key=value,...` text.
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: String,

    /// 3D cube to create holding the maps from all iterations.
    #[arg(long)]
    itermap: Option<PathBuf>,

    /// Reference defining the output grid on the first iteration.
    #[arg(long = "ref", value_name = "REF")]
    reference: Option<PathBuf>,

    /// Second external mask.
    #[arg(long)]
    mask2: Option<PathBuf>,

    /// Third external mask.
    #[arg(long)]
    mask3: Option<PathBuf>,

    /// Extra map-maker options appended to every invocation.
    #[arg(long, allow_hyphen_values = true)]
    extra: Option<String>,

    /// Keep the temporary directory and report where it is.
    #[arg(long)]
    retain: bool,

    /// Screen verbosity.
    #[arg(long, value_enum, ignore_case = true, default_value_t = InfoLevel::Progress)]
    ilevel: InfoLevel,

    /// Log file verbosity.
    #[arg(long, value_enum, ignore_case = true, default_value_t = InfoLevel::Atask)]
    glevel: InfoLevel,

    /// Log file, written unless `--glevel none`.
    #[arg(long, default_value = "skyloop.log")]
    logfile: PathBuf,

    /// Message filter for the external tasks (passed as `MSG_FILTER`).
    #[arg(long)]
    msg_filter: Option<String>,

    /// Tool configuration file; defaults apply when it does not exist.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    tool_config: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    let code = match run(&cli) {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{:#}", err);
            if err.downcast_ref::<ParamError>().is_some() {
                exit_codes::INVALID
            } else {
                exit_codes::FAILED
            }
        }
    };
    std::process::exit(code);
}

fn run(cli: &Cli) -> Result<()> {
    logging::init(cli.ilevel, Some((&cli.logfile, cli.glevel)))?;
    let tools = load_config(&cli.tool_config)?;
    let params = build_params(cli)?;
    let runner = StarlinkTaskRunner::from_config(&tools);

    let outcome = run_pipeline(&params, &tools, &runner)?;
    info!(
        output = %outcome.output.display(),
        iterations = outcome.invocations,
        "map complete"
    );
    Ok(())
}

fn build_params(cli: &Cli) -> Result<PipelineParams> {
    let input = expand_group(cli.input.as_slice())?;
    let workdir = std::env::current_dir().context("current directory")?;
    let mut params = PipelineParams::new(input, cli.out.clone(), workdir);
    params.niter = cli.niter;
    params.pixsize = cli.pixsize;
    params.config = BaseConfig::new(cli.config.clone());
    params.itermap = cli.itermap.clone();
    params.reference = cli.reference.clone();
    params.mask2 = cli.mask2.clone();
    params.mask3 = cli.mask3.clone();
    params.extra = match &cli.extra {
        Some(text) => split_extra(text)?,
        None => Vec::new(),
    };
    params.retain = cli.retain;
    params.msg_filter = cli.msg_filter.clone();
    Ok(params)
}
