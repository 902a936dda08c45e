// SPDX-License-Identifier: MIT OR Apache-2.0
//! bp-semantic
#![deny(unsafe_code)]
//!
//! Single-pass static analysis of authored script source: service
//! references, module requires, ranked keywords, top-level symbols, and a
//! coarse tag classification. Indexes are derived per script and rolled up
//! into an aggregated summary; callers key the result by `(contextId,
//! contextVersion)` and rebuild only when the version changes.

use bp_core::{ScriptEntry, SemanticEntry, SemanticIndex, SemanticSummary};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// English filler words and core Lua keywords excluded from keyword ranking.
const STOPWORDS: &[&str] = &[
    "and", "or", "the", "a", "an", "to", "for", "of", "in", "on", "with", "is", "are", "was",
    "were", "be", "this", "that", "then", "else", "do", "does", "did", "if", "elseif", "end",
    "local", "function", "return", "true", "false", "nil", "game", "script", "self",
];

static GET_SERVICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"GetService\s*\(\s*"([^"]+)"\s*\)"#).unwrap());
static REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"require\s*\(([^)]*)\)").unwrap());
static FUNCTION_DEF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:local\s+)?function\s+([A-Za-z_][A-Za-z0-9_.:]*)\s*\(").unwrap());
static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap());

/// Tunables gating how much source the analyzer will look at.
#[derive(Debug, Clone, Copy)]
pub struct SemanticConfig {
    /// Scripts whose source exceeds this byte count are skipped entirely.
    pub max_source_bytes: u64,
    /// Maximum ranked keywords kept per script.
    pub max_keywords: usize,
    /// Maximum top-level symbols kept per script.
    pub max_symbols: usize,
}

impl Default for SemanticConfig {
    fn default() -> Self {
        Self {
            max_source_bytes: 200_000,
            max_keywords: 20,
            max_symbols: 40,
        }
    }
}

/// Analyze every script in `scripts`, skipping those without source or over
/// the size cap, and roll the results into a [`SemanticIndex`].
pub fn build_index(scripts: &[ScriptEntry], config: SemanticConfig) -> SemanticIndex {
    let mut entries = std::collections::BTreeMap::new();
    let mut tag_counts: HashMap<String, usize> = HashMap::new();
    let mut service_counts: HashMap<String, usize> = HashMap::new();
    let mut total_requires = 0usize;
    let mut total_symbols = 0usize;

    for script in scripts {
        let Some(source) = &script.source else {
            continue;
        };
        if source.len() as u64 > config.max_source_bytes {
            continue;
        }
        let entry = analyze_one(script, source, config);
        for tag in &entry.tags {
            *tag_counts.entry(tag.clone()).or_insert(0) += 1;
        }
        for service in &entry.services {
            *service_counts.entry(service.clone()).or_insert(0) += 1;
        }
        total_requires += entry.requires.len();
        total_symbols += entry.symbols.len();
        entries.insert(script.path.clone(), entry);
    }

    let summary = SemanticSummary {
        script_count: entries.len(),
        tag_counts,
        service_counts,
        total_requires,
        total_symbols,
    };

    SemanticIndex { entries, summary }
}

fn analyze_one(script: &ScriptEntry, source: &str, config: SemanticConfig) -> SemanticEntry {
    let services = extract_captures(&GET_SERVICE_RE, source);
    let requires = extract_captures(&REQUIRE_RE, source);
    let (symbols, symbol_lines) = extract_symbols(source, config.max_symbols);
    let keywords = extract_keywords(source, config.max_keywords);
    let tags = classify_tags(&script.path, &script.class_name, &services);
    let (fingerprint, _lossy) = script.fingerprint();

    SemanticEntry {
        path: script.path.clone(),
        tags,
        services,
        requires,
        keywords,
        symbols,
        symbol_lines,
        line_count: source.lines().count() as u32,
        fingerprint,
    }
}

fn extract_captures(re: &Regex, source: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for caps in re.captures_iter(source) {
        if let Some(m) = caps.get(1) {
            let text = m.as_str().trim().to_string();
            if seen.insert(text.clone()) {
                out.push(text);
            }
        }
    }
    out
}

fn extract_symbols(source: &str, max_symbols: usize) -> (Vec<String>, Vec<u32>) {
    let mut names = Vec::new();
    let mut lines = Vec::new();
    for (idx, line) in source.lines().enumerate() {
        if names.len() >= max_symbols {
            break;
        }
        if let Some(caps) = FUNCTION_DEF_RE.captures(line) {
            names.push(caps[1].to_string());
            lines.push((idx + 1) as u32);
        }
    }
    (names, lines)
}

fn extract_keywords(source: &str, max_keywords: usize) -> Vec<String> {
    let stopwords: HashSet<&str> = STOPWORDS.iter().copied().collect();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for m in IDENTIFIER_RE.find_iter(source) {
        let word = m.as_str();
        if word.len() < 3 {
            continue;
        }
        let lower = word.to_ascii_lowercase();
        if stopwords.contains(lower.as_str()) {
            continue;
        }
        *counts.entry(lower).or_insert(0) += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(max_keywords).map(|(w, _)| w).collect()
}

fn classify_tags(path: &str, class_name: &str, services: &[String]) -> Vec<String> {
    let mut tags = Vec::new();
    let lower_path = path.to_ascii_lowercase();
    if lower_path.contains("serverscript") || lower_path.contains("/server/") {
        tags.push("server".to_string());
    }
    if lower_path.contains("localscript") || lower_path.contains("/client/") {
        tags.push("client".to_string());
    }
    if lower_path.contains("/ui/") || class_name.eq_ignore_ascii_case("ScreenGui") {
        tags.push("ui".to_string());
    }
    if lower_path.contains("/shared/") || lower_path.contains("replicatedstorage") {
        tags.push("shared".to_string());
    }
    if lower_path.contains("serverstorage") {
        tags.push("server_storage".to_string());
    }
    for service in services {
        match service.as_str() {
            "DataStoreService" => tags.push("datastore".to_string()),
            "MarketplaceService" => tags.push("commerce".to_string()),
            _ => {}
        }
    }
    tags.sort();
    tags.dedup();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(path: &str, class_name: &str, source: &str) -> ScriptEntry {
        ScriptEntry {
            path: path.to_string(),
            class_name: class_name.to_string(),
            sha1: None,
            bytes: None,
            source: Some(source.to_string()),
            source_truncated: None,
            source_omitted_reason: None,
        }
    }

    #[test]
    fn extracts_services_and_requires() {
        let src = r#"
            local DataStoreService = game:GetService("DataStoreService")
            local Utils = require(game.ReplicatedStorage.Utils)
        "#;
        let entry = analyze_one(&script("game/ServerScriptService/S", "Script", src), src, SemanticConfig::default());
        assert_eq!(entry.services, vec!["DataStoreService".to_string()]);
        assert!(entry.requires.iter().any(|r| r.contains("Utils")));
        assert!(entry.tags.contains(&"datastore".to_string()));
    }

    #[test]
    fn extracts_top_level_function_symbols_with_line_numbers() {
        let src = "local function helper()\nend\n\nfunction main()\nend\n";
        let (symbols, lines) = extract_symbols(src, 40);
        assert_eq!(symbols, vec!["helper".to_string(), "main".to_string()]);
        assert_eq!(lines, vec![1, 4]);
    }

    #[test]
    fn keywords_exclude_stopwords_and_short_tokens() {
        let src = "local function main() local inventoryCount = 1 return inventoryCount end";
        let keywords = extract_keywords(src, 20);
        assert!(keywords.contains(&"inventorycount".to_string()));
        assert!(!keywords.contains(&"local".to_string()));
        assert!(!keywords.contains(&"end".to_string()));
    }

    #[test]
    fn build_index_skips_scripts_without_source_or_over_cap() {
        let mut missing = script("game/A", "Script", "x");
        missing.source = None;
        let mut oversized = script("game/B", "Script", "y".repeat(10));
        let index = build_index(
            &[missing, oversized.clone()],
            SemanticConfig {
                max_source_bytes: 5,
                ..Default::default()
            },
        );
        assert_eq!(index.summary.script_count, 0);
        let _ = oversized;
    }

    #[test]
    fn build_index_aggregates_tag_and_service_counts() {
        let src = r#"game:GetService("MarketplaceService")"#;
        let s1 = script("game/ServerScriptService/A", "Script", src);
        let s2 = script("game/ServerScriptService/B", "Script", src);
        let index = build_index(&[s1, s2], SemanticConfig::default());
        assert_eq!(index.summary.script_count, 2);
        assert_eq!(index.summary.service_counts.get("MarketplaceService"), Some(&2));
        assert_eq!(index.summary.tag_counts.get("commerce"), Some(&2));
    }

    #[test]
    fn classifies_client_and_shared_tags_from_path() {
        let tags = classify_tags("game/ReplicatedStorage/Shared/Util", "ModuleScript", &[]);
        assert!(tags.contains(&"shared".to_string()));
    }
}
