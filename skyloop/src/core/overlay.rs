//! Layered map-maker configuration overlays.
//!
//! Each phase of the inside-out loop runs the map-maker with its own overlay.
//! An overlay is written as "include the parent, then literal `key=value`
//! lines"; the map-maker resolves the include chain itself when it reads the
//! file. [`ConfigLayer::flatten`] resolves the same chain in memory so the
//! effective settings can be inspected without running the tool.

use std::collections::BTreeMap;

use serde::Serialize;

/// Phase of the inside-out loop. Every phase has its own overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Iteration 1: cleans the raw data and exports the cleaned data and EXT model.
    First,
    /// Iterations 2..N-1: start from the previous map and the cleaned data.
    Recurring,
    /// Iteration N (N >= 2): like recurring, but masking may take effect.
    Last,
}

impl Phase {
    /// File name of the overlay materialised for this phase.
    pub fn file_name(self) -> &'static str {
        match self {
            Phase::First => "conf0",
            Phase::Recurring => "conf1",
            Phase::Last => "conf2",
        }
    }
}

/// Model components whose masking is normally suppressed on the last iteration.
pub const MASKED_MODELS: [&str; 3] = ["ast", "flt", "com"];

/// Secondary map products that make no sense for a single-iteration run.
pub const SECONDARY_PRODUCTS: [&str; 5] = ["itermap", "bolomap", "shortmap", "flagmap", "sampcube"];

/// The user-supplied tuning configuration every overlay ultimately inherits.
///
/// Either an include of a file (`^path`) or literal comma/newline separated
/// `key=value` text. The text is passed to the map-maker verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseConfig {
    raw: String,
}

impl BaseConfig {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Text written as the first line of the first-phase overlay.
    pub fn directive(&self) -> &str {
        self.raw.trim()
    }

    pub fn is_include(&self) -> bool {
        self.directive().starts_with('^')
    }

    /// Literal settings carried by the base text. Included files are opaque
    /// here and contribute nothing.
    pub fn literal_settings(&self) -> Vec<(String, String)> {
        if self.is_include() {
            return Vec::new();
        }
        parse_settings(self.directive())
    }
}

/// Parse `key=value` entries separated by commas or newlines.
///
/// Keys are case-insensitive and normalised to lower case. Include lines and
/// entries without `=` are skipped.
pub fn parse_settings(text: &str) -> Vec<(String, String)> {
    text.split([',', '\n'])
        .map(str::trim)
        .filter(|entry| !entry.is_empty() && !entry.starts_with('^') && !entry.starts_with('#'))
        .filter_map(|entry| entry.split_once('='))
        .map(|(key, value)| (key.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Parent {
    Base(BaseConfig),
    Layer(Box<ConfigLayer>),
}

/// One overlay: a parent plus the keys this phase forces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigLayer {
    phase: Phase,
    parent: Parent,
    overrides: Vec<(String, String)>,
}

impl ConfigLayer {
    /// Overlay for iteration 1, inheriting the user's base configuration.
    pub fn first(base: &BaseConfig) -> Self {
        let mut overrides = vec![setting("numiter", "1")];
        overrides.extend(SECONDARY_PRODUCTS.iter().map(|key| setting(key, "0")));
        overrides.push(setting("noi.calcfirst", "1"));
        overrides.push(setting("exportndf", "ext"));
        overrides.push(setting("noexportsetbad", "1"));
        overrides.push(setting("exportclean", "1"));
        overrides.extend(zero_notlast("0"));
        Self {
            phase: Phase::First,
            parent: Parent::Base(base.clone()),
            overrides,
        }
    }

    /// Overlay for iterations 2..N-1, inheriting the first-phase overlay.
    pub fn recurring(first: &ConfigLayer) -> Self {
        Self {
            phase: Phase::Recurring,
            parent: Parent::Layer(Box::new(first.clone())),
            overrides: vec![
                setting("exportndf", "0"),
                setting("exportclean", "0"),
                setting("doclean", "0"),
                setting("importsky", "ref"),
                setting("ext.import", "1"),
            ],
        }
    }

    /// Overlay for the final iteration, inheriting the recurring overlay.
    pub fn last(recurring: &ConfigLayer) -> Self {
        Self {
            phase: Phase::Last,
            parent: Parent::Layer(Box::new(recurring.clone())),
            overrides: zero_notlast("1"),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Keys forced by this layer alone, in the order they are written.
    pub fn overrides(&self) -> &[(String, String)] {
        &self.overrides
    }

    /// Render the overlay file. `parent_ref` is the include line for the
    /// parent layer (`^path`); it is ignored when the parent is the base
    /// configuration, whose own text is written instead.
    pub fn render(&self, parent_ref: &str) -> String {
        let mut out = String::new();
        match &self.parent {
            Parent::Base(base) => out.push_str(base.directive()),
            Parent::Layer(_) => out.push_str(parent_ref),
        }
        out.push('\n');
        for (key, value) in &self.overrides {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Resolve the whole chain into one key/value set. Later layers win.
    pub fn flatten(&self) -> BTreeMap<String, String> {
        let mut resolved = match &self.parent {
            Parent::Base(base) => base.literal_settings().into_iter().collect(),
            Parent::Layer(parent) => parent.flatten(),
        };
        for (key, value) in &self.overrides {
            resolved.insert(key.clone(), value.clone());
        }
        resolved
    }
}

fn setting(key: &str, value: &str) -> (String, String) {
    (key.to_string(), value.to_string())
}

fn zero_notlast(value: &str) -> Vec<(String, String)> {
    MASKED_MODELS
        .iter()
        .map(|model| setting(&format!("{model}.zero_notlast"), value))
        .collect()
}
