//! Semantic version canonicalization, ordering, and range containment.
//!
//! Versions arrive with inconsistent prefixes: database entries use bare
//! semver (`1.2.3`), module metadata uses `v1.2.3`, and toolchain stamps use
//! `go1.2.3`. Everything is canonicalized to a common `v`-prefixed form
//! before comparing.

use crate::osv::{AffectsRange, RangeEvent, RangeKind};
use ::semver::{Prerelease, Version};
use std::cmp::Ordering;

/// Canonicalize a version to the `v`-prefixed form, so that bare versions,
/// versions prefixed with `v`, and versions prefixed with `go` compare equal.
pub fn canonicalize_prefix(v: &str) -> String {
    let bare = strip_prefix(v);
    format!("v{bare}")
}

fn strip_prefix(v: &str) -> &str {
    if let Some(rest) = v.strip_prefix("go") {
        rest
    } else if let Some(rest) = v.strip_prefix('v') {
        rest
    } else {
        v
    }
}

/// Leniently parse a possibly-prefixed version. Missing minor/patch
/// components are zero-filled; build metadata is ignored.
pub fn parse(v: &str) -> Option<Version> {
    let bare = strip_prefix(v);
    let bare = bare.split('+').next().unwrap_or(bare);
    let (nums, pre) = match bare.split_once('-') {
        Some((n, p)) => (n, Some(p)),
        None => (bare, None),
    };
    let mut parts = [0u64; 3];
    let mut count = 0;
    for piece in nums.split('.') {
        if count == 3 {
            return None;
        }
        parts[count] = piece.parse().ok()?;
        count += 1;
    }
    if count == 0 {
        return None;
    }
    let mut version = Version::new(parts[0], parts[1], parts[2]);
    if let Some(p) = pre {
        version.pre = Prerelease::new(p).ok()?;
    }
    Some(version)
}

/// Compare two version strings after canonicalization. Unparsable versions
/// fall back to lexical comparison so the order stays total.
pub fn compare(a: &str, b: &str) -> Ordering {
    match (parse(a), parse(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        _ => strip_prefix(a).cmp(strip_prefix(b)),
    }
}

/// Check whether a version is valid under the lenient grammar.
pub fn is_valid(v: &str) -> bool {
    parse(v).is_some()
}

/// Report whether any range in `affected` contains version `v`.
///
/// An empty list implies all versions are affected. If no semver range is
/// present we likewise assume all versions are affected.
pub fn affects_semver(affected: &[AffectsRange], v: &str) -> bool {
    if affected.is_empty() {
        return true;
    }
    let mut semver_range_present = false;
    for range in affected {
        if range.kind != RangeKind::Semver {
            continue;
        }
        semver_range_present = true;
        if contains_semver(range, v) {
            return true;
        }
    }
    !semver_range_present
}

/// Check if version `v` is in the range encoded by `range`. If `range` is
/// not a semver range, returns false.
///
/// Assumes that events in a range are non-overlapping and that the beginning
/// of time is encoded with `introduced = "0"`.
pub fn contains_semver(range: &AffectsRange, v: &str) -> bool {
    if range.kind != RangeKind::Semver {
        return false;
    }
    if range.events.is_empty() {
        return true;
    }

    // Sort events by version. The beginning-of-time event, if present,
    // always comes first.
    let is_zero = |e: &RangeEvent| matches!(e, RangeEvent::Introduced(x) if x == "0");
    let mut events = range.events.clone();
    events.sort_by(|a, b| match (is_zero(a), is_zero(b)) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => compare(a.version(), b.version()),
    });

    let mut affected = false;
    for event in &events {
        match event {
            RangeEvent::Introduced(intro) if !affected => {
                affected = intro == "0" || compare(v, intro) != Ordering::Less;
            }
            RangeEvent::Fixed(fixed) if affected => {
                affected = compare(v, fixed) == Ordering::Less;
            }
            _ => {}
        }
    }
    affected
}

/// The latest `fixed` version across all semver ranges, under semver
/// ordering. Returns `None` when no fix is recorded.
pub fn latest_fixed(ranges: &[AffectsRange]) -> Option<String> {
    let mut latest: Option<String> = None;
    for range in ranges {
        if range.kind != RangeKind::Semver {
            continue;
        }
        for event in &range.events {
            if let RangeEvent::Fixed(fixed) = event {
                match &latest {
                    Some(cur) if compare(fixed, cur) != Ordering::Greater => {}
                    _ => latest = Some(fixed.clone()),
                }
            }
        }
    }
    latest
}

/// Derive a module pseudo-version from a toolchain stamp, e.g.
/// `go1.18.1` becomes `v1.18.1`. Development stamps like `devel +abcdef`
/// yield `None`.
pub fn semver_from_go_version(stamp: &str) -> Option<String> {
    let rest = stamp.strip_prefix("go")?;
    if !rest.chars().next()?.is_ascii_digit() {
        return None;
    }
    // Keep digits, dots, and a pre-release suffix such as "rc1" or "beta2".
    let numeric: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    if !is_valid(&numeric) {
        return None;
    }
    let suffix = &rest[numeric.len()..];
    if suffix.is_empty() {
        Some(format!("v{numeric}"))
    } else if suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
        Some(format!("v{numeric}-{suffix}"))
    } else {
        None
    }
}
