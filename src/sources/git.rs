//! Git-tree fetcher for Markdown and API-definition files

use super::{source_id_for, DocumentRef, RawDocument, SourceFetcher, SourceSpec, SourceType};
use crate::config::SourcesConfig;
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("docpilot/", env!("CARGO_PKG_VERSION"));

/// Path fragments that mark a YAML/JSON file as an API definition
const API_DEF_MARKERS: &[&str] = &[
    "openapi",
    "swagger",
    "api",
    "spec",
    "specification",
    "rest",
    "graphql",
    "grpc",
];

/// Which file class a registered fetcher instance lists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitFileFilter {
    Markdown,
    ApiDef,
}

impl GitFileFilter {
    fn accepts(&self, path: &str) -> bool {
        let lower = path.to_lowercase();
        match self {
            Self::Markdown => lower.ends_with(".md"),
            Self::ApiDef => {
                let has_ext = lower.ends_with(".yaml")
                    || lower.ends_with(".yml")
                    || lower.ends_with(".json");
                has_ext && API_DEF_MARKERS.iter().any(|marker| lower.contains(marker))
            }
        }
    }
}

/// Fetcher over the Git hosting REST API
///
/// Lists the full repository tree in one call where the API supports it and
/// falls back to a bounded recursive contents walk otherwise.
pub struct GitTreeFetcher {
    client: reqwest::Client,
    config: SourcesConfig,
    filter: GitFileFilter,
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeEntry>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ContentsEntry {
    path: String,
    sha: String,
    size: u64,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct FileContent {
    content: String,
    encoding: String,
    sha: String,
}

impl GitTreeFetcher {
    pub fn new(config: SourcesConfig, filter: GitFileFilter) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            config,
            filter,
        })
    }

    fn api_url(&self, tail: &str) -> String {
        format!("{}/{}", self.config.api_base_url.trim_end_matches('/'), tail)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| FetchError::Transient(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(map_status(status, &response, url).into());
        }

        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::Malformed(e.to_string()).into())
    }

    async fn resolve_branch(&self, spec: &SourceSpec) -> Result<String> {
        if let Some(branch) = &spec.branch {
            return Ok(branch.clone());
        }
        let url = self.api_url(&format!("repos/{}/{}", spec.owner, spec.repository));
        let info: RepoInfo = self.get_json(&url).await?;
        Ok(info.default_branch)
    }

    fn document_url(&self, spec: &SourceSpec, branch: &str, path: &str) -> String {
        format!(
            "{}/{}/{}/blob/{}/{}",
            self.config.web_base_url.trim_end_matches('/'),
            spec.owner,
            spec.repository,
            branch,
            path
        )
    }

    fn to_ref(&self, spec: &SourceSpec, branch: &str, path: String, sha: String, size: Option<u64>) -> DocumentRef {
        let url = self.document_url(spec, branch, &path);
        DocumentRef {
            path,
            sha,
            size,
            url,
        }
    }

    /// One-call listing of the whole repository tree
    async fn list_via_tree(&self, spec: &SourceSpec, branch: &str) -> Result<Vec<DocumentRef>> {
        let url = self.api_url(&format!(
            "repos/{}/{}/git/trees/{}?recursive=1",
            spec.owner, spec.repository, branch
        ));
        let tree: TreeResponse = self.get_json(&url).await?;

        if tree.truncated {
            warn!(
                "Tree listing for {}/{} was truncated by the API",
                spec.owner, spec.repository
            );
        }

        let refs = tree
            .tree
            .into_iter()
            .filter(|entry| entry.kind == "blob" && self.filter.accepts(&entry.path))
            .filter(|entry| match entry.size {
                Some(size) => size <= self.config.max_file_bytes,
                None => true,
            })
            .map(|entry| self.to_ref(spec, branch, entry.path, entry.sha, entry.size))
            .collect();

        Ok(refs)
    }

    /// Depth-limited recursive contents walk, used when the tree API fails
    async fn list_via_walk(&self, spec: &SourceSpec, branch: &str) -> Result<Vec<DocumentRef>> {
        let mut refs = Vec::new();
        let mut visited_files = 0usize;
        let mut stack: Vec<(String, u32)> = vec![(String::new(), 0)];

        while let Some((dir, depth)) = stack.pop() {
            if depth > self.config.max_walk_depth {
                continue;
            }
            if visited_files >= self.config.max_walk_files {
                warn!(
                    "Walk of {}/{} stopped at {} files",
                    spec.owner, spec.repository, visited_files
                );
                break;
            }

            let url = self.api_url(&format!(
                "repos/{}/{}/contents/{}?ref={}",
                spec.owner, spec.repository, dir, branch
            ));
            let entries: Vec<ContentsEntry> = self.get_json(&url).await?;

            for entry in entries {
                match entry.kind.as_str() {
                    "dir" => stack.push((entry.path, depth + 1)),
                    "file" => {
                        visited_files += 1;
                        if self.filter.accepts(&entry.path)
                            && entry.size <= self.config.max_file_bytes
                        {
                            refs.push(self.to_ref(
                                spec,
                                branch,
                                entry.path,
                                entry.sha,
                                Some(entry.size),
                            ));
                        }
                        if visited_files >= self.config.max_walk_files {
                            break;
                        }
                    }
                    _ => {}
                }
            }

            tokio::time::sleep(Duration::from_millis(self.config.walk_delay_ms)).await;
        }

        Ok(refs)
    }
}

/// Map an error status to a typed fetch error
pub(crate) fn map_status(
    status: reqwest::StatusCode,
    response: &reqwest::Response,
    url: &str,
) -> FetchError {
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);

    let rate_limit_exhausted = response
        .headers()
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == "0")
        .unwrap_or(false);

    match status.as_u16() {
        404 => FetchError::NotFound(url.to_string()),
        401 => FetchError::AuthRequired(url.to_string()),
        403 if rate_limit_exhausted => FetchError::RateLimited { retry_after },
        403 => FetchError::AuthRequired(url.to_string()),
        429 => FetchError::RateLimited { retry_after },
        _ => FetchError::Transient(format!("{status} for {url}")),
    }
}

#[async_trait]
impl SourceFetcher for GitTreeFetcher {
    fn source_type(&self) -> SourceType {
        match self.filter {
            GitFileFilter::Markdown => SourceType::GitMarkdown,
            GitFileFilter::ApiDef => SourceType::GitApiDef,
        }
    }

    async fn list(&self, spec: &SourceSpec) -> Result<Vec<DocumentRef>> {
        let branch = self.resolve_branch(spec).await?;

        match self.list_via_tree(spec, &branch).await {
            Ok(refs) => {
                info!(
                    "Listed {} {} files in {}/{} via tree API",
                    refs.len(),
                    self.source_type(),
                    spec.owner,
                    spec.repository
                );
                Ok(refs)
            }
            Err(err) if !matches!(err, crate::error::AssistantError::Fetch(FetchError::NotFound(_))) => Err(err),
            Err(_) => {
                debug!(
                    "Tree API unavailable for {}/{}, falling back to contents walk",
                    spec.owner, spec.repository
                );
                self.list_via_walk(spec, &branch).await
            }
        }
    }

    async fn fetch(&self, spec: &SourceSpec, doc: &DocumentRef) -> Result<RawDocument> {
        if let Some(size) = doc.size {
            let limit = self.config.max_file_bytes;
            if size > limit {
                return Err(FetchError::TooLarge { size, limit }.into());
            }
        }

        let branch = self.resolve_branch(spec).await?;
        let url = self.api_url(&format!(
            "repos/{}/{}/contents/{}?ref={}",
            spec.owner, spec.repository, doc.path, branch
        ));
        let file: FileContent = self.get_json(&url).await?;

        if file.encoding != "base64" {
            return Err(FetchError::Malformed(format!(
                "unexpected encoding {} for {}",
                file.encoding, doc.path
            ))
            .into());
        }

        let cleaned: String = file.content.chars().filter(|c| !c.is_whitespace()).collect();
        let raw_bytes = base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|e| FetchError::Malformed(e.to_string()))?;

        let source_type = self.source_type();
        Ok(RawDocument {
            source_id: source_id_for(source_type, &spec.owner, &spec.repository, &doc.path),
            source_type,
            path: doc.path.clone(),
            raw_bytes,
            sha: file.sha,
            fetched_at: chrono::Utc::now(),
            repository: spec.repository.clone(),
            owner: spec.owner.clone(),
            url: doc.url.clone(),
            extra: Default::default(),
        })
    }
}
