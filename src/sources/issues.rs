//! Issue fetcher: one document per issue, comments concatenated

use super::git::map_status;
use super::{source_id_for, DocumentRef, RawDocument, SourceFetcher, SourceSpec, SourceType};
use crate::chunker::content_sha;
use crate::config::SourcesConfig;
use crate::error::{FetchError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

const PAGE_SIZE: u32 = 100;

/// Fetcher over the issues REST API
pub struct IssueFetcher {
    client: reqwest::Client,
    config: SourcesConfig,
}

#[derive(Debug, Deserialize)]
struct IssueSummary {
    number: u64,
    updated_at: String,
    html_url: String,
    /// Present on pull requests, which are excluded
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct IssueDetail {
    number: u64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    state: String,
    html_url: String,
}

#[derive(Debug, Deserialize)]
struct IssueComment {
    #[serde(default)]
    body: Option<String>,
    user: Option<CommentUser>,
}

#[derive(Debug, Deserialize)]
struct CommentUser {
    login: String,
}

impl IssueFetcher {
    pub fn new(config: SourcesConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("docpilot/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, config })
    }

    fn api_url(&self, tail: &str) -> String {
        format!("{}/{}", self.config.api_base_url.trim_end_matches('/'), tail)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.config.api_token {
            request = request.bearer_auth(token);
        }

        let response = request
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

    fn list_url(&self, spec: &SourceSpec, page: u32) -> String {
        let mut url = self.api_url(&format!(
            "repos/{}/{}/issues?per_page={}&page={}",
            spec.owner, spec.repository, PAGE_SIZE, page
        ));
        if let Some(state) = &spec.state {
            url.push_str(&format!("&state={state}"));
        }
        if !spec.labels.is_empty() {
            url.push_str(&format!("&labels={}", spec.labels.join(",")));
        }
        if let Some(since) = &spec.since {
            url.push_str(&format!("&since={}", since.to_rfc3339()));
        }
        url
    }

    async fn comments(&self, spec: &SourceSpec, number: u64) -> Result<Vec<IssueComment>> {
        let mut all = Vec::new();
        for page in 1..=self.config.max_comment_pages {
            let url = self.api_url(&format!(
                "repos/{}/{}/issues/{}/comments?per_page={}&page={}",
                spec.owner, spec.repository, number, PAGE_SIZE, page
            ));
            let batch: Vec<IssueComment> = self.get_json(&url).await?;
            let len = batch.len();
            all.extend(batch);
            if len < PAGE_SIZE as usize {
                break;
            }
        }
        Ok(all)
    }

    /// Issue text: title, body, and comments with explicit delimiters
    fn render(detail: &IssueDetail, comments: &[IssueComment]) -> String {
        let mut text = format!("Issue #{}: {}\n\n", detail.number, detail.title);
        text.push_str(detail.body.as_deref().unwrap_or("(no description)"));

        for comment in comments {
            text.push_str("\n\n---\n\n");
            if let Some(user) = &comment.user {
                text.push_str(&format!("Comment by {}:\n", user.login));
            }
            text.push_str(comment.body.as_deref().unwrap_or(""));
        }

        text
    }
}

#[async_trait]
impl SourceFetcher for IssueFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::Issue
    }

    async fn list(&self, spec: &SourceSpec) -> Result<Vec<DocumentRef>> {
        let mut refs = Vec::new();

        for page in 1.. {
            let url = self.list_url(spec, page);
            let batch: Vec<IssueSummary> = self.get_json(&url).await?;
            let len = batch.len();

            for issue in batch {
                if issue.pull_request.is_some() {
                    continue;
                }
                // The change marker only needs to move when the issue does;
                // number plus updated_at is enough for dedup.
                let sha = content_sha(format!("{}:{}", issue.number, issue.updated_at).as_bytes());
                refs.push(DocumentRef {
                    path: format!("issues/{}", issue.number),
                    sha,
                    size: None,
                    url: issue.html_url,
                });
            }

            if len < PAGE_SIZE as usize {
                break;
            }
        }

        info!(
            "Listed {} issues for {}/{}",
            refs.len(),
            spec.owner,
            spec.repository
        );
        Ok(refs)
    }

    async fn fetch(&self, spec: &SourceSpec, doc: &DocumentRef) -> Result<RawDocument> {
        let number: u64 = doc
            .path
            .strip_prefix("issues/")
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| FetchError::Malformed(format!("bad issue path {}", doc.path)))?;

        let url = self.api_url(&format!(
            "repos/{}/{}/issues/{}",
            spec.owner, spec.repository, number
        ));
        let detail: IssueDetail = self.get_json(&url).await?;
        let comments = self.comments(spec, number).await?;
        debug!("Issue #{} has {} comments", number, comments.len());

        let text = Self::render(&detail, &comments);

        let mut extra = HashMap::new();
        extra.insert("issue_number".to_string(), detail.number.to_string());
        extra.insert("issue_state".to_string(), detail.state.clone());

        Ok(RawDocument {
            source_id: source_id_for(SourceType::Issue, &spec.owner, &spec.repository, &doc.path),
            source_type: SourceType::Issue,
            path: doc.path.clone(),
            raw_bytes: text.into_bytes(),
            sha: doc.sha.clone(),
            fetched_at: chrono::Utc::now(),
            repository: spec.repository.clone(),
            owner: spec.owner.clone(),
            url: detail.html_url,
            extra,
        })
    }
}
