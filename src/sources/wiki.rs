//! Wiki fetcher: BFS crawl for public wikis, git clone for private ones

use super::git::map_status;
use super::{source_id_for, DocumentRef, RawDocument, SourceFetcher, SourceSpec, SourceType};
use crate::chunker::content_sha;
use crate::config::SourcesConfig;
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use regex::Regex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

fn href_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)href\s*=\s*["']([^"'#]+)["']"#).unwrap())
}

/// Fetcher for wiki pages and the linked pages they reference
pub struct WikiFetcher {
    client: reqwest::Client,
    config: SourcesConfig,
    /// Page bodies gathered during enumeration, served by `fetch`
    cache: Mutex<HashMap<String, Vec<u8>>>,
}

impl WikiFetcher {
    pub fn new(config: SourcesConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("docpilot/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            config,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Canonical form used for the shared visited set
    fn canonical_url(url: &str) -> String {
        let trimmed = url.split('#').next().unwrap_or(url);
        trimmed.trim_end_matches('/').to_lowercase()
    }

    fn resolve_link(base: &str, href: &str) -> Option<String> {
        if href.starts_with("http://") || href.starts_with("https://") {
            return Some(href.to_string());
        }
        if href.starts_with("mailto:") || href.starts_with("javascript:") {
            return None;
        }
        // Root-relative links resolve against the wiki origin.
        if let Some(rest) = href.strip_prefix('/') {
            let origin: String = base
                .splitn(4, '/')
                .take(3)
                .collect::<Vec<_>>()
                .join("/");
            return Some(format!("{origin}/{rest}"));
        }
        Some(format!("{}/{}", base.trim_end_matches('/'), href))
    }

    async fn get_page(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status, &response, url).into());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    /// BFS crawl from the wiki root, collecting wiki pages and outbound links
    async fn crawl(&self, root: &str) -> Result<Vec<DocumentRef>> {
        let mut refs = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut outbound: Vec<String> = Vec::new();
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();

        let root_host = Self::canonical_url(root);
        queue.push_back((root.to_string(), 0));
        visited.insert(root_host.clone());

        let mut cache = self.cache.lock().await;

        while let Some((url, depth)) = queue.pop_front() {
            if refs.len() >= self.config.max_crawl_pages {
                warn!("Wiki crawl stopped at {} pages", refs.len());
                break;
            }

            let body = match self.get_page(&url).await {
                Ok(body) => body,
                Err(err) => {
                    debug!("Skipping wiki page {}: {}", url, err);
                    continue;
                }
            };

            let html = String::from_utf8_lossy(&body).into_owned();
            let canonical = Self::canonical_url(&url);
            cache.insert(canonical.clone(), body);

            refs.push(DocumentRef {
                path: canonical.clone(),
                sha: content_sha(html.as_bytes()),
                size: Some(html.len() as u64),
                url: url.clone(),
            });

            if depth >= self.config.max_crawl_depth {
                continue;
            }

            for capture in href_re().captures_iter(&html) {
                let Some(link) = Self::resolve_link(&url, &capture[1]) else {
                    continue;
                };
                let canonical_link = Self::canonical_url(&link);
                if !visited.insert(canonical_link.clone()) {
                    continue;
                }
                if canonical_link.starts_with(&root_host) {
                    queue.push_back((link, depth + 1));
                } else {
                    outbound.push(link);
                }
            }
        }

        drop(cache);

        // Linked pages are capped separately; 0 means unlimited.
        let linked_limit = if self.config.max_linked_pages == 0 {
            outbound.len()
        } else {
            self.config.max_linked_pages.min(outbound.len())
        };
        let linked = self.fetch_linked(&outbound[..linked_limit]).await;
        refs.extend(linked);

        Ok(refs)
    }

    /// Bounded parallel fan-out over outbound links
    async fn fetch_linked(&self, urls: &[String]) -> Vec<DocumentRef> {
        let mut refs = Vec::new();

        for batch in urls.chunks(self.config.linked_fetch_concurrency.max(1)) {
            let futures: Vec<_> = batch.iter().map(|url| self.get_page(url)).collect();
            let bodies = futures::future::join_all(futures).await;

            let mut cache = self.cache.lock().await;
            for (url, body) in batch.iter().zip(bodies) {
                match body {
                    Ok(body) => {
                        let canonical = Self::canonical_url(url);
                        let sha = content_sha(&body);
                        let size = body.len() as u64;
                        cache.insert(canonical.clone(), body);
                        refs.push(DocumentRef {
                            path: canonical,
                            sha,
                            size: Some(size),
                            url: url.clone(),
                        });
                    }
                    Err(err) => debug!("Skipping linked page {}: {}", url, err),
                }
            }
        }

        refs
    }

    /// Clone the wiki repository with a token-bearing URL, list its markdown
    /// files, then remove the clone.
    async fn list_private(&self, spec: &SourceSpec) -> Result<Vec<DocumentRef>> {
        let token = self
            .config
            .api_token
            .as_ref()
            .ok_or_else(|| FetchError::AuthRequired("private wiki clone".to_string()))?;

        let host = self
            .config
            .web_base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let clone_url = format!(
            "https://x-access-token:{}@{}/{}/{}.wiki.git",
            token, host, spec.owner, spec.repository
        );

        let clone_dir = std::env::temp_dir().join(format!("docpilot-wiki-{}", uuid::Uuid::new_v4()));

        let output = tokio::process::Command::new("git")
            .arg("clone")
            .arg("--depth")
            .arg("1")
            .arg(&clone_url)
            .arg(&clone_dir)
            .output()
            .await
            .map_err(|e| FetchError::Transient(format!("git clone failed to start: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_dir_all(&clone_dir).await;
            if stderr.contains("Authentication") || stderr.contains("denied") {
                return Err(FetchError::AuthRequired(format!(
                    "{}/{}.wiki",
                    spec.owner, spec.repository
                ))
                .into());
            }
            return Err(FetchError::Transient(format!("git clone failed: {stderr}")).into());
        }

        let result = self.collect_clone(spec, &clone_dir).await;
        let _ = tokio::fs::remove_dir_all(&clone_dir).await;
        result
    }

    async fn collect_clone(&self, spec: &SourceSpec, dir: &Path) -> Result<Vec<DocumentRef>> {
        let mut refs = Vec::new();
        let mut stack: Vec<PathBuf> = vec![dir.to_path_buf()];
        let mut cache = self.cache.lock().await;

        while let Some(current) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&current).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().into_owned();

                if path.is_dir() {
                    if name != ".git" {
                        stack.push(path);
                    }
                    continue;
                }
                if !name.to_lowercase().ends_with(".md") {
                    continue;
                }

                let bytes = tokio::fs::read(&path).await?;
                let relative = path
                    .strip_prefix(dir)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .into_owned();
                let page = relative.trim_end_matches(".md").to_string();
                let url = format!(
                    "{}/{}/{}/wiki/{}",
                    self.config.web_base_url.trim_end_matches('/'),
                    spec.owner,
                    spec.repository,
                    page
                );

                // The file sha is a hash of the content, not the git blob sha.
                let sha = content_sha(&bytes);
                let cache_key = format!("{}/{}:{}", spec.owner, spec.repository, relative);
                cache.insert(cache_key.clone(), bytes);

                refs.push(DocumentRef {
                    path: cache_key,
                    sha,
                    size: None,
                    url,
                });
            }
        }

        info!(
            "Listed {} wiki pages from clone of {}/{}.wiki",
            refs.len(),
            spec.owner,
            spec.repository
        );
        Ok(refs)
    }
}

#[async_trait]
impl SourceFetcher for WikiFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::WikiPage
    }

    async fn list(&self, spec: &SourceSpec) -> Result<Vec<DocumentRef>> {
        if spec.private_wiki {
            return self.list_private(spec).await;
        }

        let root = spec.wiki_url.as_ref().ok_or_else(|| {
            crate::error::AssistantError::Config("wiki_url required for public wiki".to_string())
        })?;
        self.crawl(root).await
    }

    async fn fetch(&self, spec: &SourceSpec, doc: &DocumentRef) -> Result<RawDocument> {
        let cached = {
            let cache = self.cache.lock().await;
            cache.get(&doc.path).cloned()
        };

        let raw_bytes = match cached {
            Some(bytes) => bytes,
            // Cache misses (e.g. fetch long after listing) refetch by URL.
            None => self.get_page(&doc.url).await?,
        };

        // A linked page is any document outside the wiki root.
        let source_type = if spec
            .wiki_url
            .as_deref()
            .map(|root| doc.path.starts_with(&Self::canonical_url(root)))
            .unwrap_or(true)
        {
            SourceType::WikiPage
        } else {
            SourceType::LinkedPage
        };

        let sha = if doc.sha.is_empty() {
            content_sha(&raw_bytes)
        } else {
            doc.sha.clone()
        };

        let mut extra = HashMap::new();
        let wiki_name = doc
            .path
            .rsplit('/')
            .next()
            .unwrap_or(&doc.path)
            .to_string();
        extra.insert("wiki_name".to_string(), wiki_name);

        Ok(RawDocument {
            source_id: source_id_for(source_type, &spec.owner, &spec.repository, &doc.path),
            source_type,
            path: doc.path.clone(),
            raw_bytes,
            sha,
            fetched_at: chrono::Utc::now(),
            repository: spec.repository.clone(),
            owner: spec.owner.clone(),
            url: doc.url.clone(),
            extra,
        })
    }
}
