//! Regex classification of command output.
//!
//! Each output chunk is classified independently against the active
//! [`crate::TimeoutProfile`]'s pattern lists. Error patterns always win over
//! progress patterns; anything unmatched is neutral activity.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use regex_lite::Regex;
use serde::Serialize;

use crate::command::clamp_chars;
use crate::timeout::TimeoutProfile;

const MATCH_EXCERPT_MAX_CHARS: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputClass {
    Error,
    Progress,
    Neutral,
}

/// Which pattern matched and the line it matched on, clamped for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternHit {
    pub pattern: String,
    pub matched_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Error(PatternHit),
    Progress(PatternHit),
    Neutral,
}

impl Classification {
    pub fn class(&self) -> OutputClass {
        match self {
            Classification::Error(_) => OutputClass::Error,
            Classification::Progress(_) => OutputClass::Progress,
            Classification::Neutral => OutputClass::Neutral,
        }
    }

    pub fn hit(&self) -> Option<&PatternHit> {
        match self {
            Classification::Error(hit) | Classification::Progress(hit) => Some(hit),
            Classification::Neutral => None,
        }
    }
}

/// Pattern lists compiled once per profile. Invalid pattern strings are
/// reported and skipped at compile time, so classification never fails.
#[derive(Debug)]
pub struct CompiledPatterns {
    error: Vec<(String, Regex)>,
    progress: Vec<(String, Regex)>,
}

impl CompiledPatterns {
    fn compile(error_patterns: &[String], progress_patterns: &[String]) -> Self {
        Self {
            error: compile_list("error", error_patterns),
            progress: compile_list("progress", progress_patterns),
        }
    }

    pub fn classify(&self, chunk: &str) -> Classification {
        if let Some(hit) = first_hit(&self.error, chunk) {
            return Classification::Error(hit);
        }
        if let Some(hit) = first_hit(&self.progress, chunk) {
            return Classification::Progress(hit);
        }
        Classification::Neutral
    }

    pub fn is_empty(&self) -> bool {
        self.error.is_empty() && self.progress.is_empty()
    }
}

fn compile_list(role: &str, patterns: &[String]) -> Vec<(String, Regex)> {
    patterns
        .iter()
        .filter_map(|pattern| match Regex::new(pattern) {
            Ok(regex) => Some((pattern.clone(), regex)),
            Err(err) => {
                tracing::warn!("skipping invalid {role} pattern {pattern:?}: {err}");
                None
            }
        })
        .collect()
}

fn first_hit(list: &[(String, Regex)], chunk: &str) -> Option<PatternHit> {
    for (pattern, regex) in list {
        if let Some(found) = regex.find(chunk) {
            // Report the whole line containing the match.
            let start = chunk[..found.start()].rfind('\n').map_or(0, |i| i + 1);
            let end = chunk[found.end()..]
                .find('\n')
                .map_or(chunk.len(), |i| found.end() + i);
            let line = chunk[start..end].trim_end_matches('\r');
            return Some(PatternHit {
                pattern: pattern.clone(),
                matched_text: clamp_chars(line, MATCH_EXCERPT_MAX_CHARS),
            });
        }
    }
    None
}

/// Shared cache of compiled pattern sets, keyed by profile identity so
/// repeated commands with the same profile never recompile their regexes.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: Mutex<HashMap<u64, Arc<CompiledPatterns>>>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compiled_for(&self, profile: &TimeoutProfile) -> Arc<CompiledPatterns> {
        let mut compiled = self
            .compiled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        compiled
            .entry(profile.id())
            .or_insert_with(|| {
                Arc::new(CompiledPatterns::compile(
                    profile.error_patterns(),
                    profile.progress_patterns(),
                ))
            })
            .clone()
    }
}
