//! Script Cache & Domain Matcher
//!
//! Holds the scripts most recently pushed by the server and the index from
//! domain pattern to scripts. Every push replaces both wholesale: a new
//! snapshot is built off to the side and swapped in, so a reader sees either
//! the old set or the new one, never a mix.

use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connection::protocol::ScriptPayload;

/// Tags that mark a script as runnable while the user is idle
const IDLE_TAGS: &[&str] = &["idle", "idle_eligible", "idle-eligible"];

/// A script pushed by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptDefinition {
    pub script_id: String,
    /// Ordered, from the `|`-delimited `domainPattern` field
    pub domain_patterns: Vec<String>,
    pub content: String,
    pub description: Option<String>,
    pub task_type: Option<String>,
    pub tags: Vec<String>,
}

impl ScriptDefinition {
    pub fn is_idle_eligible(&self) -> bool {
        self.tags
            .iter()
            .any(|tag| IDLE_TAGS.iter().any(|idle| tag.eq_ignore_ascii_case(idle)))
    }
}

impl From<ScriptPayload> for ScriptDefinition {
    fn from(payload: ScriptPayload) -> Self {
        let domain_patterns = payload
            .domain_pattern
            .split('|')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();

        Self {
            script_id: payload.script_id,
            domain_patterns,
            content: payload.script_content,
            description: payload.description,
            task_type: payload.task_type,
            tags: payload.tags,
        }
    }
}

/// Compile a glob-like domain pattern (`*.example.com`) into a hostname
/// matcher. The match may occur anywhere in the hostname and is
/// case-sensitive.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&regex::escape(pattern).replace(r"\*", ".*"))
}

/// Extract the hostname from a page URL
pub fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

struct DomainEntry {
    pattern: String,
    matcher: Regex,
    scripts: Vec<Arc<ScriptDefinition>>,
}

/// Immutable view of one push
#[derive(Default)]
pub struct CacheSnapshot {
    scripts: Vec<Arc<ScriptDefinition>>,
    by_id: HashMap<String, usize>,
    index: Vec<DomainEntry>,
}

impl CacheSnapshot {
    fn build(definitions: Vec<ScriptDefinition>) -> Self {
        let mut scripts: Vec<Arc<ScriptDefinition>> = Vec::with_capacity(definitions.len());
        let mut by_id = HashMap::new();

        for definition in definitions {
            match by_id.get(&definition.script_id) {
                Some(&pos) => {
                    warn!(script_id = %definition.script_id, "Duplicate script id in push, keeping the later definition");
                    scripts[pos] = Arc::new(definition);
                }
                None => {
                    by_id.insert(definition.script_id.clone(), scripts.len());
                    scripts.push(Arc::new(definition));
                }
            }
        }

        let mut index: Vec<DomainEntry> = Vec::new();
        for script in &scripts {
            for pattern in &script.domain_patterns {
                if let Some(entry) = index.iter_mut().find(|e| &e.pattern == pattern) {
                    entry.scripts.push(script.clone());
                    continue;
                }

                match compile_pattern(pattern) {
                    Ok(matcher) => index.push(DomainEntry {
                        pattern: pattern.clone(),
                        matcher,
                        scripts: vec![script.clone()],
                    }),
                    Err(e) => {
                        warn!(pattern = %pattern, script_id = %script.script_id, error = %e, "Skipping invalid domain pattern");
                    }
                }
            }
        }

        Self { scripts, by_id, index }
    }

    pub fn get(&self, script_id: &str) -> Option<Arc<ScriptDefinition>> {
        self.by_id.get(script_id).map(|&pos| self.scripts[pos].clone())
    }

    /// Scripts of the first pattern (in insertion order) that matches `hostname`
    pub fn match_host(&self, hostname: &str) -> Vec<Arc<ScriptDefinition>> {
        self.index
            .iter()
            .find(|entry| entry.matcher.is_match(hostname))
            .map(|entry| {
                debug!(hostname, pattern = %entry.pattern, "Domain pattern matched");
                entry.scripts.clone()
            })
            .unwrap_or_default()
    }

    pub fn idle_eligible(&self) -> Vec<Arc<ScriptDefinition>> {
        self.scripts.iter().filter(|s| s.is_idle_eligible()).cloned().collect()
    }

    pub fn script_ids(&self) -> Vec<String> {
        self.scripts.iter().map(|s| s.script_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

/// Owner of the current script snapshot
#[derive(Default)]
pub struct ScriptCache {
    current: Arc<CacheSnapshot>,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cache and the domain index with the pushed scripts
    pub fn apply_push(&mut self, scripts: Vec<ScriptDefinition>) {
        let snapshot = CacheSnapshot::build(scripts);
        info!(
            scripts = snapshot.len(),
            patterns = snapshot.index.len(),
            "Script cache replaced"
        );
        self.current = Arc::new(snapshot);
    }

    /// The current snapshot, unaffected by later pushes
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.current.clone()
    }

    pub fn get(&self, script_id: &str) -> Option<Arc<ScriptDefinition>> {
        self.current.get(script_id)
    }

    pub fn match_host(&self, hostname: &str) -> Vec<Arc<ScriptDefinition>> {
        self.current.match_host(hostname)
    }

    pub fn idle_eligible(&self) -> Vec<Arc<ScriptDefinition>> {
        self.current.idle_eligible()
    }

    pub fn script_ids(&self) -> Vec<String> {
        self.current.script_ids()
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(id: &str, pattern: &str) -> ScriptDefinition {
        ScriptDefinition {
            script_id: id.to_string(),
            domain_patterns: pattern.split('|').map(str::to_string).collect(),
            content: format!("return '{}';", id),
            description: None,
            task_type: None,
            tags: vec![],
        }
    }

    fn ids(scripts: &[Arc<ScriptDefinition>]) -> Vec<&str> {
        scripts.iter().map(|s| s.script_id.as_str()).collect()
    }

    #[test]
    fn test_wildcard_subdomain_scenario() {
        let mut cache = ScriptCache::new();
        cache.apply_push(vec![script("s1", "*.example.com")]);

        assert_eq!(ids(&cache.match_host("shop.example.com")), vec!["s1"]);
        assert!(cache.match_host("example.org").is_empty());
    }

    #[test]
    fn test_first_matching_pattern_wins() {
        let mut cache = ScriptCache::new();
        cache.apply_push(vec![
            script("broad", "*.example.com"),
            script("narrow", "shop.example.com"),
        ]);

        // Both patterns match; only the first registered one counts
        assert_eq!(ids(&cache.match_host("shop.example.com")), vec!["broad"]);
    }

    #[test]
    fn test_scripts_sharing_a_pattern_are_all_returned() {
        let mut cache = ScriptCache::new();
        cache.apply_push(vec![script("a", "news.test"), script("b", "blog.test|news.test")]);

        assert_eq!(ids(&cache.match_host("news.test")), vec!["a", "b"]);
        assert_eq!(ids(&cache.match_host("blog.test")), vec!["b"]);
    }

    #[test]
    fn test_push_replaces_cache_wholesale() {
        let mut cache = ScriptCache::new();
        cache.apply_push(vec![script("old", "old.test"), script("kept", "kept.test")]);
        cache.apply_push(vec![script("kept", "kept.test")]);

        assert!(cache.get("old").is_none());
        assert!(cache.match_host("old.test").is_empty());
        assert_eq!(ids(&cache.match_host("kept.test")), vec!["kept"]);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_old_snapshot_is_unaffected_by_push() {
        let mut cache = ScriptCache::new();
        cache.apply_push(vec![script("s1", "a.test")]);
        let before = cache.snapshot();
        cache.apply_push(vec![]);

        assert_eq!(before.len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_dots_are_literal_and_match_is_unanchored() {
        let mut cache = ScriptCache::new();
        cache.apply_push(vec![script("s1", "example.com")]);

        assert!(cache.match_host("examplexcom").is_empty());
        assert_eq!(ids(&cache.match_host("shop.example.com")), vec!["s1"]);
        assert_eq!(ids(&cache.match_host("example.com.evil.org")), vec!["s1"]);
        assert!(cache.match_host("EXAMPLE.com").is_empty());
    }

    #[test]
    fn test_wildcard_needs_a_subdomain() {
        let mut cache = ScriptCache::new();
        cache.apply_push(vec![script("s1", "*.example.com")]);
        assert!(cache.match_host("example.com").is_empty());
    }

    #[test]
    fn test_duplicate_script_ids_keep_later_definition() {
        let mut cache = ScriptCache::new();
        cache.apply_push(vec![script("dup", "first.test"), script("dup", "second.test")]);

        assert_eq!(cache.len(), 1);
        assert!(cache.match_host("first.test").is_empty());
        assert_eq!(ids(&cache.match_host("second.test")), vec!["dup"]);
    }

    #[test]
    fn test_idle_eligible_tags() {
        let mut idle = script("idle", "a.test");
        idle.tags = vec!["Idle-Eligible".to_string()];
        let mut plain = script("plain", "b.test");
        plain.tags = vec!["product".to_string()];

        let mut cache = ScriptCache::new();
        cache.apply_push(vec![idle, plain]);
        assert_eq!(ids(&cache.idle_eligible()), vec!["idle"]);
    }

    #[test]
    fn test_payload_conversion_splits_patterns() {
        let payload = ScriptPayload {
            script_id: "s1".to_string(),
            domain_pattern: " a.test | *.b.test ||".to_string(),
            script_content: "x".to_string(),
            description: Some("demo".to_string()),
            task_type: None,
            tags: vec![],
        };
        let definition = ScriptDefinition::from(payload);
        assert_eq!(definition.domain_patterns, vec!["a.test", "*.b.test"]);
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("https://shop.example.com/a?b=1").as_deref(), Some("shop.example.com"));
        assert_eq!(host_of("not a url"), None);
    }
}
