//! Repository registry and URL validation
//!
//! The registry maps the catalogue of known component names to canonical
//! repository URLs. The validator rewrites LLM-produced URLs onto canonical
//! forms and drops those that cannot be reached.

use crate::config::RegistryConfig;
use crate::error::Result;
use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

fn url_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"https?://[^\s<>()\[\]{}"']+"#).unwrap())
}

/// Catalogue of component names and their canonical repositories
#[derive(Debug, Clone)]
pub struct RepoRegistry {
    host: String,
    canonical_owner: String,
    /// component name -> repository name
    components: HashMap<String, String>,
}

impl RepoRegistry {
    pub fn from_config(config: &RegistryConfig) -> Self {
        Self {
            host: config.host.clone(),
            canonical_owner: config.canonical_owner.clone(),
            components: config
                .components
                .iter()
                .map(|(component, repo)| (component.to_lowercase(), repo.clone()))
                .collect(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Canonical URL for a catalogued component
    pub fn canonical_url(&self, component: &str) -> Option<String> {
        self.components.get(&component.to_lowercase()).map(|repo| {
            format!("https://{}/{}/{}", self.host, self.canonical_owner, repo)
        })
    }

    /// Whether a repository path segment names a catalogued component
    pub fn component_for_repo(&self, repo: &str) -> Option<&str> {
        let lower = repo.to_lowercase();
        self.components
            .iter()
            .find(|(component, canonical_repo)| {
                **component == lower || canonical_repo.to_lowercase() == lower
            })
            .map(|(component, _)| component.as_str())
    }

    /// Registry rendering handed to the prompt assembler
    pub fn snapshot(&self) -> String {
        let mut lines: Vec<String> = self
            .components
            .iter()
            .map(|(component, repo)| {
                format!(
                    "- {component}: https://{}/{}/{}",
                    self.host, self.canonical_owner, repo
                )
            })
            .collect();
        lines.sort();
        lines.join("\n")
    }
}

struct CachedProbe {
    reachable: bool,
    probed_at: Instant,
}

/// Canonicalizes and validates URLs appearing in answers
pub struct UrlValidator {
    registry: RepoRegistry,
    client: reqwest::Client,
    trusted_domains: Vec<String>,
    probe_timeout: Duration,
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, CachedProbe>>,
}

impl UrlValidator {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_secs))
            .build()?;

        Ok(Self {
            registry: RepoRegistry::from_config(config),
            client,
            trusted_domains: config.trusted_domains.clone(),
            probe_timeout: Duration::from_secs(config.probe_timeout_secs),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &RepoRegistry {
        &self.registry
    }

    /// Rewrite a URL onto its canonical form.
    ///
    /// Fixes a wrong owner for catalogued components and collapses mono-repo
    /// tree paths onto the separate-repository shape. Idempotent: canonical
    /// input comes back unchanged.
    pub fn canonicalize(&self, url: &str) -> String {
        let Some((host, segments)) = split_url(url) else {
            return url.to_string();
        };

        if !host.eq_ignore_ascii_case(&self.registry.host) || segments.len() < 2 {
            return url.to_string();
        }

        let owner = segments[0];
        let repo = segments[1];

        // Mono-repo tree path: /{owner}/{monorepo}/tree/{branch}/{component}
        if segments.len() >= 5 && segments[2] == "tree" {
            if let Some(component) = self.registry.component_for_repo(segments[4]) {
                if let Some(canonical) = self.registry.canonical_url(component) {
                    return canonical;
                }
            }
        }

        // Wrong owner for a catalogued component repository.
        if let Some(component) = self.registry.component_for_repo(repo) {
            if !owner.eq_ignore_ascii_case(&self.registry.canonical_owner) {
                if let Some(canonical) = self.registry.canonical_url(component) {
                    let tail = segments[2..].join("/");
                    return if tail.is_empty() {
                        canonical
                    } else {
                        format!("{canonical}/{tail}")
                    };
                }
            }
        }

        url.to_string()
    }

    fn is_trusted(&self, url: &str) -> bool {
        let Some((host, _)) = split_url(url) else {
            return false;
        };
        self.trusted_domains
            .iter()
            .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
    }

    /// Check whether a URL answers a HEAD (or GET) within the timeout.
    ///
    /// Trusted domains short-circuit to true; results are cached with a TTL.
    pub async fn reachable(&self, url: &str) -> bool {
        if self.is_trusted(url) {
            return true;
        }

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(url) {
                if entry.probed_at.elapsed() < self.cache_ttl {
                    return entry.reachable;
                }
            }
        }

        let reachable = self.probe(url).await;

        // Short-held write; unreachable outcomes are cached too.
        let mut cache = self.cache.write().await;
        cache.insert(
            url.to_string(),
            CachedProbe {
                reachable,
                probed_at: Instant::now(),
            },
        );

        reachable
    }

    async fn probe(&self, url: &str) -> bool {
        let head = tokio::time::timeout(self.probe_timeout, self.client.head(url).send()).await;

        match head {
            Ok(Ok(response)) if response.status().is_success() => return true,
            Ok(Ok(response))
                if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED
                    || response.status() == reqwest::StatusCode::NOT_IMPLEMENTED =>
            {
                // Fall through to GET below.
            }
            Ok(Ok(response)) => {
                debug!("HEAD {} returned {}", url, response.status());
                return false;
            }
            Ok(Err(e)) => {
                debug!("HEAD {} failed: {}", url, e);
                return false;
            }
            Err(_) => {
                warn!("HEAD {} timed out", url);
                return false;
            }
        }

        match tokio::time::timeout(self.probe_timeout, self.client.get(url).send()).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }

    /// Scan text for URL tokens, canonicalize each, and drop tokens whose
    /// canonical form is unreachable.
    pub async fn rewrite_text(&self, text: &str) -> String {
        let mut result = String::with_capacity(text.len());
        let mut last_end = 0;

        for token in url_token_re().find_iter(text) {
            result.push_str(&text[last_end..token.start()]);
            last_end = token.end();

            // Trailing sentence punctuation belongs to the prose.
            let raw = token.as_str();
            let trimmed = raw.trim_end_matches(['.', ',', ';', ':', '!', '?']);
            let punctuation = &raw[trimmed.len()..];

            let canonical = self.canonicalize(trimmed);
            if self.reachable(&canonical).await {
                result.push_str(&canonical);
            } else {
                debug!("Dropping unreachable URL {}", canonical);
            }
            result.push_str(punctuation);
        }

        result.push_str(&text[last_end..]);
        result
    }
}

/// Split a URL into host and path segments, without a parser dependency
fn split_url(url: &str) -> Option<(&str, Vec<&str>)> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let mut parts = rest.splitn(2, '/');
    let host = parts.next()?;
    let segments = parts
        .next()
        .map(|path| {
            path.split('/')
                .filter(|segment| !segment.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Some((host, segments))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_config() -> RegistryConfig {
        let mut components = HashMap::new();
        components.insert("alpha".to_string(), "alpha".to_string());
        components.insert("gateway".to_string(), "platform-gateway".to_string());
        RegistryConfig {
            host: "github.com".to_string(),
            canonical_owner: "ORG".to_string(),
            components,
            trusted_domains: vec!["docs.example.com".to_string()],
            probe_timeout_secs: 1,
            cache_ttl_secs: 600,
        }
    }

    fn validator() -> UrlValidator {
        UrlValidator::new(&registry_config()).unwrap()
    }

    #[test]
    fn test_wrong_owner_is_rewritten() {
        let validator = validator();
        assert_eq!(
            validator.canonicalize("https://github.com/WRONG/alpha"),
            "https://github.com/ORG/alpha"
        );
        // Paths below the repository survive the rewrite.
        assert_eq!(
            validator.canonicalize("https://github.com/WRONG/alpha/blob/main/README.md"),
            "https://github.com/ORG/alpha/blob/main/README.md"
        );
    }

    #[test]
    fn test_monorepo_tree_path_is_collapsed() {
        let validator = validator();
        assert_eq!(
            validator.canonicalize("https://github.com/other/platform/tree/main/gateway"),
            "https://github.com/ORG/platform-gateway"
        );
    }

    #[test]
    fn test_canonicalize_is_idempotent() {
        let validator = validator();
        for url in [
            "https://github.com/WRONG/alpha",
            "https://github.com/other/platform/tree/main/gateway",
            "https://github.com/ORG/alpha",
            "https://unrelated.org/a/b",
            "not a url",
        ] {
            let once = validator.canonicalize(url);
            let twice = validator.canonicalize(&once);
            assert_eq!(once, twice, "canonicalize not idempotent for {url}");
        }
    }

    #[test]
    fn test_unknown_component_untouched() {
        let validator = validator();
        assert_eq!(
            validator.canonicalize("https://github.com/someone/unrelated"),
            "https://github.com/someone/unrelated"
        );
    }

    #[test]
    fn test_registry_snapshot_lists_components() {
        let registry = RepoRegistry::from_config(&registry_config());
        let snapshot = registry.snapshot();
        assert!(snapshot.contains("- alpha: https://github.com/ORG/alpha"));
        assert!(snapshot.contains("- gateway: https://github.com/ORG/platform-gateway"));
    }

    #[tokio::test]
    async fn test_trusted_domain_short_circuits() {
        let validator = validator();
        assert!(validator.reachable("https://docs.example.com/guide").await);
        assert!(
            validator
                .reachable("https://sub.docs.example.com/page")
                .await
        );
    }

    #[tokio::test]
    async fn test_unreachable_is_cached() {
        let validator = validator();
        // Nothing listens here; both calls resolve false, the second from cache.
        let url = "http://127.0.0.1:1/nope";
        assert!(!validator.reachable(url).await);
        let start = Instant::now();
        assert!(!validator.reachable(url).await);
        assert!(start.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_rewrite_text_drops_unreachable_and_keeps_prose() {
        let mut config = registry_config();
        config.trusted_domains = vec!["github.com".to_string()];
        let validator = UrlValidator::new(&config).unwrap();

        let text = "See https://github.com/WRONG/alpha. Broken: http://127.0.0.1:1/x, done.";
        let rewritten = validator.rewrite_text(text).await;

        assert!(rewritten.contains("https://github.com/ORG/alpha."));
        assert!(!rewritten.contains("127.0.0.1"));
        assert!(rewritten.ends_with(", done."));
    }
}
