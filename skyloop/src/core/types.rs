//! Shared deterministic types for the inside-out pipeline.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::overlay::BaseConfig;

pub const MIN_ITERATIONS: u32 = 1;
pub const MAX_ITERATIONS: u32 = 1000;
pub const DEFAULT_ITERATIONS: u32 = 10;
pub const MIN_PIXSIZE: f64 = 0.01;
pub const MAX_PIXSIZE: f64 = 1000.0;
pub const DEFAULT_CONFIG: &str = "^$STARLINK_DIR/share/smurf/dimmconfig.lis";

/// A map written by one map-maker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapArtifact {
    /// Name the external tools use to refer to the map.
    pub path: PathBuf,
    /// `true` for the user's output map, `false` for a scratch slot.
    pub is_final: bool,
}

impl MapArtifact {
    pub fn scratch(path: PathBuf) -> Self {
        Self {
            path,
            is_final: false,
        }
    }

    pub fn final_output(path: PathBuf) -> Self {
        Self {
            path,
            is_final: true,
        }
    }
}

/// An ordered group of data units passed to a tool as one parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NdfGroup {
    members: Vec<PathBuf>,
}

impl NdfGroup {
    pub fn new(members: Vec<PathBuf>) -> Self {
        Self { members }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.members.iter().map(PathBuf::as_path)
    }

    /// One member per line, as read by the tools' `^file` indirection.
    pub fn to_list(&self) -> String {
        let mut out = String::new();
        for member in &self.members {
            out.push_str(&member.display().to_string());
            out.push('\n');
        }
        out
    }
}

impl FromIterator<PathBuf> for NdfGroup {
    fn from_iter<I: IntoIterator<Item = PathBuf>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Raised when user parameters are rejected before any tool runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamError {
    pub message: String,
}

impl ParamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid parameter: {}", self.message)
    }
}

impl std::error::Error for ParamError {}

/// Everything the user asks of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineParams {
    pub input: NdfGroup,
    pub out: PathBuf,
    pub niter: u32,
    pub pixsize: Option<f64>,
    pub config: BaseConfig,
    pub itermap: Option<PathBuf>,
    pub reference: Option<PathBuf>,
    pub mask2: Option<PathBuf>,
    pub mask3: Option<PathBuf>,
    pub extra: Vec<String>,
    pub retain: bool,
    /// Passed to every task through the `MSG_FILTER` environment variable.
    pub msg_filter: Option<String>,
    /// Shared directory the map-maker runs in and drops side-effect files into.
    pub workdir: PathBuf,
    /// Parent of the scratch area; the system temp dir when `None`.
    pub scratch_parent: Option<PathBuf>,
}

impl PipelineParams {
    pub fn new(input: NdfGroup, out: PathBuf, workdir: PathBuf) -> Self {
        Self {
            input,
            out,
            niter: DEFAULT_ITERATIONS,
            pixsize: None,
            config: BaseConfig::new(DEFAULT_CONFIG),
            itermap: None,
            reference: None,
            mask2: None,
            mask3: None,
            extra: Vec::new(),
            retain: false,
            msg_filter: None,
            workdir,
            scratch_parent: None,
        }
    }

    /// Range and consistency checks that need no filesystem access.
    pub fn validate(&self) -> Result<(), ParamError> {
        if !(MIN_ITERATIONS..=MAX_ITERATIONS).contains(&self.niter) {
            return Err(ParamError::new(format!(
                "niter must be between {MIN_ITERATIONS} and {MAX_ITERATIONS}, got {}",
                self.niter
            )));
        }
        if let Some(pixsize) = self.pixsize
            && !(pixsize.is_finite() && (MIN_PIXSIZE..=MAX_PIXSIZE).contains(&pixsize))
        {
            return Err(ParamError::new(format!(
                "pixsize must be between {MIN_PIXSIZE} and {MAX_PIXSIZE} arcsec, got {pixsize}"
            )));
        }
        if self.input.is_empty() {
            return Err(ParamError::new("no input time-series data supplied"));
        }
        if self.out.as_os_str().is_empty() {
            return Err(ParamError::new("output map name is empty"));
        }
        if self.config.directive().is_empty() {
            return Err(ParamError::new("config is empty"));
        }
        if self.itermap.as_deref() == Some(self.out.as_path()) {
            return Err(ParamError::new(
                "itermap cube must differ from the output map",
            ));
        }
        Ok(())
    }
}

/// Split free-form extra arguments on whitespace, keeping quoted runs together.
pub fn split_extra(text: &str) -> Result<Vec<String>, ParamError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for ch in text.chars() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => current.push(ch),
            None if ch == '\'' || ch == '"' => {
                quote = Some(ch);
                in_word = true;
            }
            None if ch.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(ch);
                in_word = true;
            }
        }
    }
    if let Some(open) = quote {
        return Err(ParamError::new(format!(
            "unterminated {open} quote in extra arguments"
        )));
    }
    if in_word {
        args.push(current);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(niter: u32) -> PipelineParams {
        let mut params = PipelineParams::new(
            NdfGroup::new(vec![PathBuf::from("s8a_0001.sdf")]),
            PathBuf::from("out"),
            PathBuf::from("."),
        );
        params.niter = niter;
        params
    }

    #[test]
    fn accepts_iteration_bounds() {
        assert!(params(1).validate().is_ok());
        assert!(params(1000).validate().is_ok());
    }

    #[test]
    fn rejects_iterations_out_of_range() {
        assert!(params(0).validate().is_err());
        let err = params(1001).validate().expect_err("too many");
        assert!(err.to_string().contains("niter"));
    }

    #[test]
    fn rejects_pixsize_out_of_range() {
        let mut p = params(3);
        p.pixsize = Some(0.0);
        assert!(p.validate().is_err());
        p.pixsize = Some(1000.5);
        assert!(p.validate().is_err());
        p.pixsize = Some(f64::NAN);
        assert!(p.validate().is_err());
        p.pixsize = Some(4.0);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn rejects_empty_input_group() {
        let mut p = params(3);
        p.input = NdfGroup::default();
        let err = p.validate().expect_err("empty");
        assert!(err.message.contains("no input"));
    }

    #[test]
    fn rejects_itermap_equal_to_output() {
        let mut p = params(3);
        p.itermap = Some(PathBuf::from("out"));
        assert!(p.validate().is_err());
    }

    #[test]
    fn group_list_has_one_member_per_line() {
        let group: NdfGroup = ["a.sdf", "b.sdf"].iter().map(PathBuf::from).collect();
        assert_eq!(group.len(), 2);
        assert_eq!(group.to_list(), "a.sdf\nb.sdf\n");
    }

    #[test]
    fn split_extra_respects_quotes() {
        let args = split_extra("  system=icrs  fts_port='8D 4'  \"a b\"c ").expect("split");
        assert_eq!(args, vec!["system=icrs", "fts_port=8D 4", "a bc"]);
    }

    #[test]
    fn split_extra_rejects_unterminated_quote() {
        assert!(split_extra("ref='oops").is_err());
        assert!(split_extra("").expect("empty").is_empty());
    }
}
