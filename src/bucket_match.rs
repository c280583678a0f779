//! `BucketMatch`: an anchored (process_regex, vmo_regex) pair with a
//! per-instance match cache, plus the JSON rule-list parser (§4.3).

use std::collections::HashMap;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::capture::{Koid, Process};

/// A single classification rule: VMOs belonging to a process matching
/// `process_regex`, and whose own name matches `vmo_regex`, are attributed
/// to `name`.
pub struct BucketMatch {
    name: String,
    event_code: Option<i64>,
    match_all_processes: bool,
    process_regex: Option<Regex>,
    match_all_vmos: bool,
    vmo_regex: Option<Regex>,
    process_cache: HashMap<Koid, bool>,
    vmo_cache: HashMap<String, bool>,
}

/// Failure taxonomy for the bucket-rule config boundary (§7): either the
/// file isn't valid JSON in the expected shape, or one of its regexes
/// doesn't compile.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("rule list is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rule {name:?} has an invalid regex: {source}")]
    InvalidRegex {
        name: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Deserialize)]
struct RawRule {
    name: String,
    process: String,
    vmo: String,
    event_code: Option<i64>,
}

impl BucketMatch {
    /// Builds a rule. An empty pattern or the literal `".*"` is recognized
    /// here as "match anything" and short-circuits `process_match`/`vmo_match`
    /// without ever touching the regex engine or the cache.
    pub fn new(
        name: impl Into<String>,
        process: &str,
        vmo: &str,
        event_code: Option<i64>,
    ) -> Result<Self, regex::Error> {
        let match_all_processes = is_match_all(process);
        let process_regex = if match_all_processes {
            None
        } else {
            Some(anchored(process)?)
        };
        let match_all_vmos = is_match_all(vmo);
        let vmo_regex = if match_all_vmos { None } else { Some(anchored(vmo)?) };

        Ok(Self {
            name: name.into(),
            event_code,
            match_all_processes,
            process_regex,
            match_all_vmos,
            vmo_regex,
            process_cache: HashMap::new(),
            vmo_cache: HashMap::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn event_code(&self) -> Option<i64> {
        self.event_code
    }

    /// Cached by koid (not name) so that two processes sharing a name are
    /// evaluated and cached independently, and lookup stays O(1) on a fixed-
    /// size key (§9, Open Question 2 — do not switch this to name-keying).
    pub fn process_match(&mut self, process: &Process) -> bool {
        if self.match_all_processes {
            return true;
        }
        if let Some(&cached) = self.process_cache.get(&process.koid) {
            return cached;
        }
        let regex = self.process_regex.as_ref().expect("checked by match_all_processes");
        let matched = regex.is_match(&process.name);
        self.process_cache.insert(process.koid, matched);
        matched
    }

    pub fn vmo_match(&mut self, vmo_name: &str) -> bool {
        if self.match_all_vmos {
            return true;
        }
        if let Some(&cached) = self.vmo_cache.get(vmo_name) {
            return cached;
        }
        let regex = self.vmo_regex.as_ref().expect("checked by match_all_vmos");
        let matched = regex.is_match(vmo_name);
        self.vmo_cache.insert(vmo_name.to_string(), matched);
        matched
    }
}

fn is_match_all(pattern: &str) -> bool {
    pattern.is_empty() || pattern == ".*"
}

/// Wraps a rule pattern so matches are implicitly full-match, as the spec
/// requires, without the caller needing to hand-anchor every pattern.
fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{pattern})$"))
}

/// Parses a JSON array of `{name, process, vmo, event_code?}` objects into
/// an ordered rule list. Order is preserved from the source — it is part of
/// the configuration contract (first-match-wins in the digester).
pub fn parse_rules(json: &str) -> Result<Vec<BucketMatch>, ConfigError> {
    let raw: Vec<RawRule> = serde_json::from_str(json)?;
    raw.into_iter()
        .map(|rule| {
            BucketMatch::new(rule.name.clone(), &rule.process, &rule.vmo, rule.event_code)
                .map_err(|source| ConfigError::InvalidRegex { name: rule.name, source })
        })
        .collect()
}

/// The rule list this engine ships with, matching the reference
/// implementation's default taxonomy, extended with event codes so the
/// metrics forwarder can report bucket usage without a separate mapping
/// table. Rule order is significant (§4.5) and preserved verbatim.
pub fn default_rules() -> Vec<BucketMatch> {
    const DEFAULTS: &[(&str, &str, &str)] = &[
        ("ZBI Buffer", ".*", "zbi-decompressed"),
        ("Graphics", ".*", "magma_create_buffer"),
        ("Video Buffer", "devhost:sys", "Sysmem.*"),
        ("Fshost", "fshost", ".*"),
        ("Minfs", ".*minfs", ".*"),
        ("Blobfs", ".*blobfs", ".*"),
        ("Flutter", r"io\.flutter\..*", ".*"),
        ("Web", "web_engine_exe:.*|chromium.cmx", ".*"),
        ("Scenic", "scenic.cmx", ".*"),
        ("Amlogic", "devhost:pdev:05:00:f", ".*"),
        ("Netstack", "netstack.cmx", ".*"),
        ("Pkgfs", "pkgfs", ".*"),
        ("Archivist", "archivist.cmx", ".*"),
        ("Cobalt", "cobalt.cmx", ".*"),
    ];
    DEFAULTS
        .iter()
        .enumerate()
        .map(|(i, (name, process, vmo))| {
            BucketMatch::new(*name, process, vmo, Some(i as i64 + 1))
                .expect("default rules are known-good regexes")
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(koid: Koid, name: &str) -> Process {
        Process { koid, name: name.to_string(), vmos: Vec::new() }
    }

    #[test]
    fn match_all_short_circuits_without_caching() {
        let mut bucket = BucketMatch::new("All", ".*", "", None).unwrap();
        assert!(bucket.process_match(&process(1, "anything")));
        assert!(bucket.vmo_match("anything"));
        assert!(bucket.process_cache.is_empty());
        assert!(bucket.vmo_cache.is_empty());
    }

    #[test]
    fn process_match_is_koid_keyed() {
        let mut bucket = BucketMatch::new("B", "p1", ".*", None).unwrap();
        let a = process(1, "p1");
        let b = process(2, "p1");
        assert!(bucket.process_match(&a));
        assert!(bucket.process_match(&b));
        assert_eq!(bucket.process_cache.len(), 2);
    }

    #[test]
    fn cache_idempotence() {
        let mut bucket = BucketMatch::new("B", "p1", "v1", None).unwrap();
        let p = process(1, "p1");
        let first = bucket.process_match(&p);
        for _ in 0..5 {
            assert_eq!(bucket.process_match(&p), first);
        }
        let first_vmo = bucket.vmo_match("v1");
        for _ in 0..5 {
            assert_eq!(bucket.vmo_match("v1"), first_vmo);
        }
    }

    #[test]
    fn parse_rules_preserves_order() {
        let json = r#"[
            {"name":"ContiguousPool","process":"driver_host:.*","vmo":"SysmemContiguousPool","event_code":1},
            {"name":"Blobfs","process":".*blobfs","vmo":".*","event_code":2}
        ]"#;
        let rules = parse_rules(json).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name(), "ContiguousPool");
        assert_eq!(rules[1].name(), "Blobfs");
        assert_eq!(rules[0].event_code(), Some(1));
    }

    #[test]
    fn parse_rules_rejects_missing_field() {
        let json = r#"[{"name":"X","process":".*"}]"#;
        assert!(parse_rules(json).is_err());
    }

    #[test]
    fn parse_rules_rejects_non_array() {
        let json = r#"{"name":"X"}"#;
        assert!(parse_rules(json).is_err());
    }
}
