//! Shell-style file name patterns for the artifacts the map-maker drops into
//! its working directory.

use anyhow::{Context, Result};
use regex::Regex;

/// A compiled `*`/`?` wildcard pattern matched against bare file names.
#[derive(Debug, Clone)]
pub struct FilePattern {
    regex: Regex,
}

impl FilePattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        for ch in pattern.chars() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');
        let regex =
            Regex::new(&expr).with_context(|| format!("compile file pattern {pattern:?}"))?;
        Ok(Self { regex })
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.regex.is_match(file_name)
    }
}
