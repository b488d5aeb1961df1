//! File name helpers.

use std::path::{Path, PathBuf};

/// Characters that are invalid in Windows filenames.
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Windows reserved filenames (case-insensitive).
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Make a file name safe on every platform.
///
/// Invalid and control characters become `_` (runs collapse to one),
/// leading and trailing spaces and dots are dropped and reserved device
/// names get a `_` prefix. Returns `None` when nothing usable is left.
pub fn sanitize_filename(input: &str) -> Option<String> {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_control() || INVALID_CHARS.contains(&c) {
            if !result.ends_with('_') {
                result.push('_');
            }
        } else {
            result.push(c);
        }
    }

    let trimmed = result.trim_matches(|c| c == ' ' || c == '.');
    if trimmed.is_empty() || trimmed.chars().all(|c| c == '_') {
        return None;
    }

    let stem = trimmed.split('.').next().unwrap_or(trimmed).to_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        return Some(format!("_{trimmed}"));
    }
    Some(trimmed.to_string())
}

/// Split `archive.tar.gz` into `("archive.tar", Some("gz"))`.
fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

/// First path in `dir` named `name`, `stem_1.ext`, `stem_2.ext`, ... that
/// neither exists on disk nor is reported by `is_taken`.
pub fn unique_path(dir: &Path, name: &str, is_taken: impl Fn(&Path) -> bool) -> PathBuf {
    let free = |path: &Path| !path.exists() && !is_taken(path);
    let candidate = dir.join(name);
    if free(candidate.as_path()) {
        return candidate;
    }

    let (stem, ext) = split_extension(name);
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem}_{n}.{ext}")),
            None => dir.join(format!("{stem}_{n}")),
        })
        .find(|path| free(path.as_path()))
        .unwrap_or(candidate)
}
