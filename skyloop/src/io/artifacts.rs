//! Filesystem side of artifact handling: input groups, working-directory
//! snapshots, and relocation of the files the map-maker leaves behind.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::core::pattern::FilePattern;
use crate::core::reconcile::{Snapshot, select_produced};
use crate::core::types::{NdfGroup, ParamError};

const NDF_SUFFIX: &str = "sdf";

/// Expand group arguments. An argument starting with `^` names a text file
/// listing one member per line; blank lines and `#` comments are skipped.
/// Relative members of a list file are resolved against the file's directory.
/// A list file that cannot be read is a [`ParamError`].
pub fn expand_group<S: AsRef<str>>(args: &[S]) -> Result<NdfGroup> {
    let mut members = Vec::new();
    for arg in args {
        let arg = arg.as_ref().trim();
        if arg.is_empty() {
            continue;
        }
        let Some(list) = arg.strip_prefix('^') else {
            members.push(PathBuf::from(arg));
            continue;
        };
        let list = Path::new(list);
        let contents = fs::read_to_string(list).map_err(|err| {
            ParamError::new(format!("cannot read group file {}: {err}", list.display()))
        })?;
        let base = list.parent().unwrap_or_else(|| Path::new(""));
        for line in contents.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let member = Path::new(line);
            if member.is_absolute() {
                members.push(member.to_path_buf());
            } else {
                members.push(base.join(member));
            }
        }
    }
    Ok(NdfGroup::new(members))
}

/// Whether a data unit exists, given with or without its `.sdf` suffix.
pub fn ndf_exists(path: &Path) -> bool {
    if path.exists() {
        return true;
    }
    if path.extension().is_some_and(|ext| ext == NDF_SUFFIX) {
        return false;
    }
    let mut with_suffix = path.as_os_str().to_owned();
    with_suffix.push(".");
    with_suffix.push(NDF_SUFFIX);
    Path::new(&with_suffix).exists()
}

/// Fail with a [`ParamError`] naming `what` if `path` does not exist.
pub fn ensure_ndf_exists(what: &str, path: &Path) -> Result<(), ParamError> {
    if ndf_exists(path) {
        Ok(())
    } else {
        Err(ParamError::new(format!(
            "{what} {} does not exist",
            path.display()
        )))
    }
}

/// Record every file in `dir` whose name matches `pattern`, with its modification time.
pub fn capture_snapshot(dir: &Path, pattern: &FilePattern) -> Result<Snapshot> {
    let mut entries = BTreeMap::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !pattern.matches(name) {
            continue;
        }
        let meta = entry
            .metadata()
            .with_context(|| format!("stat {}", entry.path().display()))?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta
            .modified()
            .with_context(|| format!("modification time of {}", entry.path().display()))?;
        entries.insert(entry.path(), modified);
    }
    Ok(Snapshot::new(entries))
}

/// Files matching `pattern` directly inside `dir`, in name order.
pub fn resolve_group(dir: &Path, pattern: &FilePattern) -> Result<NdfGroup> {
    let snapshot = capture_snapshot(dir, pattern)?;
    Ok(snapshot.iter().map(|(path, _)| path.to_path_buf()).collect())
}

/// Move `path` into `dest_dir`, keeping its file name. Falls back to
/// copy-and-delete when a rename crosses filesystems.
pub fn move_into(path: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .with_context(|| format!("{} has no file name", path.display()))?;
    let dest = dest_dir.join(name);
    if fs::rename(path, &dest).is_err() {
        fs::copy(path, &dest)
            .with_context(|| format!("copy {} to {}", path.display(), dest.display()))?;
        fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
    }
    Ok(dest)
}

/// Working-directory artifacts captured after the first iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciledArtifacts {
    /// Files this run produced, at their new location in the scratch area.
    pub relocated: Vec<PathBuf>,
    /// Cleaned time-series inside the scratch area.
    pub cleaned: NdfGroup,
    /// EXT model files; they stay in the working directory where the
    /// map-maker looks for them on later iterations.
    pub ext: NdfGroup,
}

/// Patterns naming the map-maker's working-directory exports.
#[derive(Debug, Clone)]
pub struct ExportPatterns {
    pub cleaned: FilePattern,
    pub ext: FilePattern,
}

/// Move cleaned time-series produced since `before` from `workdir` into
/// `scratch_dir`, then resolve the cleaned and EXT groups.
///
/// Finding nothing is not an error here; later invocations will fail for
/// lack of input if the map-maker really exported nothing.
pub fn reconcile(
    workdir: &Path,
    scratch_dir: &Path,
    before: &Snapshot,
    patterns: &ExportPatterns,
) -> Result<ReconciledArtifacts> {
    let after = capture_snapshot(workdir, &patterns.cleaned)?;
    let produced = select_produced(before, &after);
    let skipped = after.len() - produced.len();
    debug!(
        produced = produced.len(),
        skipped, "reconciling cleaned time-series"
    );

    let mut relocated = Vec::with_capacity(produced.len());
    for path in &produced {
        relocated.push(move_into(path, scratch_dir)?);
    }

    let cleaned = resolve_group(scratch_dir, &patterns.cleaned)?;
    let ext = resolve_group(workdir, &patterns.ext)?;
    info!(
        cleaned = cleaned.len(),
        ext = ext.len(),
        "captured first-iteration exports"
    );
    Ok(ReconciledArtifacts {
        relocated,
        cleaned,
        ext,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::{Duration, SystemTime};

    fn patterns() -> ExportPatterns {
        ExportPatterns {
            cleaned: FilePattern::new("s*_con_res_cln.sdf").expect("pattern"),
            ext: FilePattern::new("s*_con_ext.sdf").expect("pattern"),
        }
    }

    fn touch_at(path: &Path, secs: u64) {
        let file = File::create(path).expect("create");
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
            .expect("set mtime");
    }

    #[test]
    fn snapshot_only_records_matching_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        touch_at(&temp.path().join("s8a_0001_con_res_cln.sdf"), 10);
        touch_at(&temp.path().join("other.sdf"), 10);
        fs::create_dir(temp.path().join("s8_dir_con_res_cln.sdf")).expect("mkdir");

        let snapshot = capture_snapshot(temp.path(), &patterns().cleaned).expect("snapshot");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(
            snapshot.get(&temp.path().join("s8a_0001_con_res_cln.sdf")),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(10))
        );
    }

    #[test]
    fn reconcile_moves_new_and_rewritten_files_only() {
        let work = tempfile::tempdir().expect("work");
        let scratch = tempfile::tempdir().expect("scratch");
        let a = work.path().join("s8a_con_res_cln.sdf");
        let b = work.path().join("s8b_con_res_cln.sdf");
        touch_at(&a, 100);
        touch_at(&b, 100);
        let before = capture_snapshot(work.path(), &patterns().cleaned).expect("before");

        touch_at(&a, 200);
        touch_at(&work.path().join("s8c_con_res_cln.sdf"), 300);
        touch_at(&work.path().join("s8c_con_ext.sdf"), 300);

        let result = reconcile(work.path(), scratch.path(), &before, &patterns()).expect("ok");
        let moved: Vec<_> = result
            .relocated
            .iter()
            .map(|p| p.file_name().expect("name").to_string_lossy().into_owned())
            .collect();
        assert_eq!(moved, vec!["s8a_con_res_cln.sdf", "s8c_con_res_cln.sdf"]);
        assert!(b.exists(), "pre-existing file must stay in place");
        assert!(!a.exists());
        assert_eq!(result.cleaned.len(), 2);
        assert_eq!(result.ext.len(), 1);
        assert!(work.path().join("s8c_con_ext.sdf").exists());
    }

    #[test]
    fn reconcile_with_no_exports_is_not_an_error() {
        let work = tempfile::tempdir().expect("work");
        let scratch = tempfile::tempdir().expect("scratch");
        let before = capture_snapshot(work.path(), &patterns().cleaned).expect("before");
        let result = reconcile(work.path(), scratch.path(), &before, &patterns()).expect("ok");
        assert_eq!(result, ReconciledArtifacts::default());
    }

    #[test]
    fn expand_group_reads_indirection_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let list = temp.path().join("in.lis");
        fs::write(&list, "# raw data\ns8a_0001.sdf\n\n/abs/s8b_0001.sdf\n").expect("write");
        let arg = format!("^{}", list.display());

        let group = expand_group(&["s4a_0001.sdf", arg.as_str()]).expect("expand");
        let members: Vec<&Path> = group.iter().collect();
        assert_eq!(
            members,
            vec![
                Path::new("s4a_0001.sdf"),
                temp.path().join("s8a_0001.sdf").as_path(),
                Path::new("/abs/s8b_0001.sdf"),
            ]
        );
    }

    #[test]
    fn unreadable_group_file_is_a_parameter_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let arg = format!("^{}", temp.path().join("missing.lis").display());
        let err = expand_group(&[arg]).expect_err("missing list");
        let param = err.downcast_ref::<ParamError>().expect("parameter error");
        assert!(param.to_string().contains("missing.lis"));
    }

    #[test]
    fn ndf_exists_accepts_missing_suffix() {
        let temp = tempfile::tempdir().expect("tempdir");
        File::create(temp.path().join("mask.sdf")).expect("create");
        assert!(ndf_exists(&temp.path().join("mask")));
        assert!(ndf_exists(&temp.path().join("mask.sdf")));
        assert!(!ndf_exists(&temp.path().join("other")));
        assert!(ensure_ndf_exists("mask2", &temp.path().join("other")).is_err());
    }
}
