//! Content normalization: raw source bytes to plain or markdown text

use crate::sources::SourceType;
use regex::Regex;
use std::sync::OnceLock;

fn markdown_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").unwrap())
}

fn html_img_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<img\b[^>]*/?>").unwrap())
}

fn reference_image_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Reference-style image definitions: [id]: url "title"
    RE.get_or_init(|| {
        Regex::new(r#"(?m)^\s*\[[^\]]+\]:\s+\S+\.(?:png|jpe?g|gif|svg|webp)\b.*$"#).unwrap()
    })
}

fn html_tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]*>").unwrap())
}

/// File type recorded in chunk metadata, derived from the path
pub fn file_type_for_path(path: &str) -> &'static str {
    let lower = path.to_lowercase();
    if lower.ends_with(".md") || lower.ends_with(".markdown") {
        "markdown"
    } else if lower.ends_with(".yaml") || lower.ends_with(".yml") {
        "yaml"
    } else if lower.ends_with(".json") {
        "json"
    } else if lower.ends_with(".html") || lower.ends_with(".htm") {
        "html"
    } else {
        "text"
    }
}

/// Normalize raw bytes for a source type into plain/markdown text
pub fn extract(raw_bytes: &[u8], source_type: SourceType) -> String {
    let text = String::from_utf8_lossy(raw_bytes);

    match source_type {
        SourceType::GitMarkdown => strip_images(&text),
        SourceType::WikiPage | SourceType::LinkedPage => html_to_markdown(&text),
        // API definitions stay as plain text; YAML/JSON is not re-serialized.
        SourceType::GitApiDef => text.into_owned(),
        // Issues arrive pre-concatenated; diagram summaries are already text.
        SourceType::Issue | SourceType::DiagramSummary => text.into_owned(),
    }
}

/// Remove embedded images from markdown text
pub fn strip_images(markdown: &str) -> String {
    let text = markdown_image_re().replace_all(markdown, "");
    let text = html_img_re().replace_all(&text, "");
    let text = reference_image_re().replace_all(&text, "");
    text.into_owned()
}

/// Reduce HTML to markdown-ish plain text
pub fn html_to_markdown(html: &str) -> String {
    // Drop script and style bodies before stripping tags.
    static BLOCK_RE: OnceLock<Regex> = OnceLock::new();
    let block_re = BLOCK_RE.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").unwrap()
    });

    let text = block_re.replace_all(html, " ");
    let text = html_img_re().replace_all(&text, "");
    let text = html_tag_re().replace_all(&text, " ");

    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    text.lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
