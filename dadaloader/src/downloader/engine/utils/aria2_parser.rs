//! aria2 console output parsing.
//!
//! With `--summary-interval` aria2 prints one summary per second:
//!
//! ```text
//! [#2089b0 1.0MiB/2.0MiB(50%) CN:16 DL:100KiB ETA:10s]
//! ```
//!
//! All functions are pure; malformed tokens are logged at debug level and
//! contribute nothing to the sample.

use tracing::debug;

use crate::downloader::engine::{EngineNotice, ParsedLine, ProgressSample};
use crate::{Error, Result};

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;
const TIB: u64 = 1 << 40;

/// Parse an aria2 size token such as `512KiB`, `1.9GiB` or `2048`.
///
/// Fractions are truncated to whole bytes.
pub fn parse_size(token: &str) -> Option<u64> {
    let token = token.trim();
    let (number, multiplier) = [("TiB", TIB), ("GiB", GIB), ("MiB", MIB), ("KiB", KIB)]
        .into_iter()
        .find_map(|(suffix, mult)| token.strip_suffix(suffix).map(|n| (n, mult)))
        .or_else(|| token.strip_suffix('B').map(|n| (n, 1)))
        .unwrap_or((token, 1));

    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as u64)
}

/// Parse an aria2 ETA token (`15s`, `38m`, `1h38m7s`, `ETA:5s]`) to seconds.
///
/// Missing segments count as zero; a malformed token yields 0.
pub fn parse_eta(token: &str) -> u64 {
    let raw = token.trim();
    let text = raw.strip_prefix("ETA:").unwrap_or(raw);
    let text = text.trim_end_matches(']');
    let text = text.strip_suffix('s').unwrap_or(text);

    match parse_eta_segments(text) {
        Some(secs) => secs,
        None => {
            debug!(token = raw, "Unparseable ETA token");
            0
        }
    }
}

fn parse_eta_segments(text: &str) -> Option<u64> {
    let mut rest = text;
    let mut total = 0u64;

    for (unit, secs) in [('h', 3600u64), ('m', 60u64)] {
        if let Some((value, tail)) = rest.split_once(unit) {
            total = total.checked_add(parse_segment(value)?.checked_mul(secs)?)?;
            rest = tail;
        }
    }

    total.checked_add(parse_segment(rest)?)
}

fn parse_segment(value: &str) -> Option<u64> {
    if value.is_empty() {
        return Some(0);
    }
    value.parse().ok()
}

/// Whether the line is an aria2 progress summary.
pub fn is_progress_line(line: &str) -> bool {
    line.contains("CN:") && line.contains("ETA:")
}

/// Parse a progress summary line.
///
/// Returns `None` when the line lacks the summary markers. Individual bad
/// tokens are skipped.
pub fn parse_progress(line: &str) -> Option<ProgressSample> {
    if !is_progress_line(line) {
        return None;
    }

    let mut sample = ProgressSample::default();
    for raw in line.split_whitespace() {
        let token = raw.trim_matches(|c| c == '[' || c == ']');

        if let Some(speed) = token.strip_prefix("DL:") {
            match parse_size(speed) {
                Some(bytes) => sample.speed_bytes_per_sec = bytes,
                None => debug!(token, "Unparseable speed token"),
            }
        } else if token.starts_with("ETA:") {
            sample.eta_secs = parse_eta(token);
        } else if token.contains('/') && token.contains('(') {
            match parse_transfer(token) {
                Ok((downloaded, total)) => {
                    sample.downloaded_bytes = downloaded;
                    sample.total_bytes = total;
                }
                Err(e) => debug!("{}", e),
            }
        }
    }

    Some(sample)
}

/// `1.0MiB/2.0MiB(50%)` to `(downloaded, total)`.
fn parse_transfer(token: &str) -> Result<(u64, u64)> {
    let invalid = || Error::Parse(format!("unparseable transfer token '{token}'"));
    let sizes = token.split_once('(').map_or(token, |(sizes, _)| sizes);
    let (downloaded, total) = sizes.split_once('/').ok_or_else(invalid)?;
    match (parse_size(downloaded), parse_size(total)) {
        (Some(downloaded), Some(total)) => Ok((downloaded, total)),
        _ => Err(invalid()),
    }
}

/// Recognize notices aria2 prints outside the summaries.
pub fn parse_notice(line: &str) -> Option<EngineNotice> {
    if let Some((_, path)) = line.split_once("Download complete: ") {
        return Some(EngineNotice::Completed(path.trim().to_string()));
    }

    if line.contains("Exception:") || line.contains("errorCode=") || line.contains("[ERROR]") {
        return Some(EngineNotice::Error(line.trim().to_string()));
    }

    None
}

/// Classify one output record.
pub fn parse_line(line: &str) -> ParsedLine {
    if let Some(sample) = parse_progress(line) {
        return ParsedLine::Progress(sample);
    }
    match parse_notice(line) {
        Some(notice) => ParsedLine::Notice(notice),
        None => ParsedLine::None,
    }
}
