//! Category registry & analyzer (spec.md §3, §4.2).

pub mod registry;

use regex::Regex;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SystemKind {
    Pve,
    Pbs,
    Common,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Normal,
    Staged,
    Export,
}

#[derive(Debug, Clone)]
pub struct Category {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub kind: SystemKind,
    /// Ordered list of archive-path globs. A pattern ending with `/`
    /// matches recursively; otherwise it is an exact (normalized) match.
    pub paths: &'static [&'static str],
    pub export_only: bool,
}

#[derive(Debug, Clone)]
pub struct AnalyzedCategory {
    pub category: Category,
    pub is_available: bool,
}

/// Normalize an archive entry path to the `./…`-prefixed convention so
/// `./etc/hosts` and `etc/hosts` compare equal.
pub fn normalize_entry(path: &str) -> String {
    let trimmed = path.trim_start_matches("./");
    format!("./{trimmed}")
}

/// Match a single archive entry against one category path pattern. A `*`
/// in a pattern stands for one path component (it never crosses `/`), the
/// same as a shell glob — e.g. `etc/pve/nodes/*/host.fw` matches
/// `etc/pve/nodes/node1/host.fw` but not `etc/pve/nodes/node1/sub/host.fw`.
pub fn path_matches_pattern(entry: &str, pattern: &str) -> bool {
    let entry_n = normalize_entry(entry);
    let pattern_n = normalize_entry(pattern);
    let dir = pattern_n.strip_suffix('/');
    let base = dir.unwrap_or(pattern_n.as_str());

    if base.contains('*') {
        return glob_match(&entry_n, base);
    }

    if let Some(dir) = dir {
        entry_n == dir || entry_n.starts_with(&format!("{dir}/"))
    } else {
        entry_n == pattern_n || entry_n.starts_with(&format!("{pattern_n}/"))
    }
}

/// Expand a single-`*`-per-component glob into an anchored regex and test
/// it against `entry`, allowing the entry to also be a child of the match
/// (same "exact or prefix" rule `path_matches_pattern` applies elsewhere).
fn glob_match(entry: &str, pattern: &str) -> bool {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^/]*");
    let re = Regex::new(&format!("^{body}(?:$|/.*)$")).expect("category glob pattern is valid");
    re.is_match(entry)
}

pub fn path_matches_category(entry: &str, cat: &Category) -> bool {
    cat.paths.iter().any(|p| path_matches_pattern(entry, p))
}

/// Dedup paths across a set of categories, preserving first-seen order.
pub fn selected_paths(cats: &[Category]) -> Vec<&'static str> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for c in cats {
        for p in c.paths {
            if seen.insert(*p) {
                out.push(*p);
            }
        }
    }
    out
}
