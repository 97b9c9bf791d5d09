//! Test file discovery for `cov`.
//!
//! Patterns are globs relative to the working directory. Plain paths without
//! glob characters match themselves, and directories match everything below
//! them. `node_modules`, `fixtures` and hidden directories are never walked.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;

const SKIPPED_DIRS: [&str; 2] = ["node_modules", "fixtures"];

/// Expands `patterns` under `cwd` into a sorted, deduplicated list of
/// relative file paths.
pub fn expand(cwd: &Path, patterns: &[String]) -> Result<Vec<String>> {
    if patterns.is_empty() {
        return Ok(Vec::new());
    }
    let matcher = build_globset(patterns)?;

    let walker = WalkBuilder::new(cwd)
        .standard_filters(false)
        .hidden(true)
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            entry.depth() == 0 || !SKIPPED_DIRS.contains(&name.as_ref())
        })
        .build();

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("failed to walk {}", cwd.display()))?;
        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(cwd) else {
            continue;
        };
        if matcher.is_match(relative) {
            files.push(to_slash(relative));
        }
    }
    files.sort();
    files.dedup();
    Ok(files)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        for expanded in expand_pattern(pattern) {
            let glob = GlobBuilder::new(&expanded)
                .literal_separator(true)
                .build()
                .with_context(|| format!("invalid test pattern {}", pattern))?;
            builder.add(glob);
        }
    }
    Ok(builder.build()?)
}

fn expand_pattern(pattern: &str) -> Vec<String> {
    let pattern = pattern.trim_start_matches("./");
    let trimmed = pattern.trim_end_matches('/');
    let has_glob = pattern.contains('*') || pattern.contains('?') || pattern.contains('[');
    if has_glob {
        vec![pattern.to_string()]
    } else {
        vec![trimmed.to_string(), format!("{}/**", trimmed)]
    }
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Splits a comma separated list, as used by `TESTS` and `COV_EXCLUDES`.
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn resolve_from(cwd: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        cwd.join(path)
    }
}
