//! URL extraction: find image references in document text.
//!
//! Three recognisers, picked by [`DocumentFormat`]:
//!
//! | Format   | Recognised                                                     |
//! |----------|----------------------------------------------------------------|
//! | Plain    | bare `http(s)://…` URLs whose path ends in an image extension  |
//! | Markdown | `![alt](url)` / `![alt](<url> "title")` plus everything Markup |
//! | Markup   | `<img src / data-src / data-original>` and `background-image`  |
//!
//! Hits from every recogniser are merged by byte offset, so the output is
//! ordered by first occurrence in the text regardless of which rule found a
//! URL. Malformed markup is skipped, never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Image file extensions recognised in bare URLs (lower-case).
pub const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "bmp", "webp"];

/// A bare absolute URL token: printable ASCII only, so a URL written straight
/// into CJK prose ends where the prose resumes. Validation happens after the
/// match since the regex engine has no look-around.
static BARE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)https?://[\x21-\x7E&&[^<>"'{}|\\^`\[\]()]]+"#).unwrap()
});

static MD_IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"!\[[^\]]*\]\(\s*<?([^)\s>]+)>?(?:\s+["'][^"']*["'])?\s*\)"#).unwrap()
});

static IMG_TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());

static IMG_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\b(?:data-src|data-original|src)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
        .unwrap()
});

static BG_IMAGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)background-image\s*:\s*url\(\s*["']?([^"')\s]+)["']?\s*\)"#).unwrap()
});

/// Image type guessed from the URL alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatHint {
    Jpg,
    Png,
    Gif,
    Bmp,
    Webp,
    Unknown,
}

impl FormatHint {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => FormatHint::Jpg,
            "png" => FormatHint::Png,
            "gif" => FormatHint::Gif,
            "bmp" => FormatHint::Bmp,
            "webp" => FormatHint::Webp,
            _ => FormatHint::Unknown,
        }
    }

    /// Guess from the path extension, then from a `wx_fmt` query parameter
    /// (WeChat CDN URLs carry the format there instead of in the path).
    pub fn from_url(url: &str) -> Self {
        let Some(parsed) = parse_http_url(url) else {
            return FormatHint::Unknown;
        };
        if let Some(ext) = path_extension(&parsed) {
            let hint = FormatHint::from_extension(&ext);
            if hint != FormatHint::Unknown {
                return hint;
            }
        }
        parsed
            .query_pairs()
            .find(|(k, _)| k == "wx_fmt")
            .map(|(_, v)| FormatHint::from_extension(&v))
            .unwrap_or(FormatHint::Unknown)
    }

    /// File extension for artifacts of this type.
    pub fn extension(self) -> Option<&'static str> {
        match self {
            FormatHint::Jpg => Some("jpg"),
            FormatHint::Png => Some("png"),
            FormatHint::Gif => Some("gif"),
            FormatHint::Bmp => Some("bmp"),
            FormatHint::Webp => Some("webp"),
            FormatHint::Unknown => None,
        }
    }
}

/// One extracted image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UrlRecord {
    /// The URL exactly as written in the document.
    pub original_url: String,
    pub format_hint: FormatHint,
}

impl UrlRecord {
    pub fn new(url: impl Into<String>) -> Self {
        let original_url = url.into();
        let format_hint = FormatHint::from_url(&original_url);
        Self {
            original_url,
            format_hint,
        }
    }
}

/// How a document's text is scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentFormat {
    Plain,
    Markdown,
    Markup,
}

impl DocumentFormat {
    /// Format for a path's extension; `None` for anything unsupported.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "txt" => Some(DocumentFormat::Plain),
            "md" | "markdown" => Some(DocumentFormat::Markdown),
            "html" | "htm" => Some(DocumentFormat::Markup),
            _ => None,
        }
    }
}

/// Extract image URLs from `text`, in order of first occurrence, without
/// duplicates.
pub fn extract_urls(text: &str, format: DocumentFormat) -> Vec<UrlRecord> {
    let mut hits: Vec<(usize, String)> = Vec::new();
    match format {
        DocumentFormat::Plain => scan_bare_urls(text, &mut hits),
        DocumentFormat::Markdown => {
            scan_markdown_images(text, &mut hits);
            scan_markup(text, &mut hits);
        }
        DocumentFormat::Markup => scan_markup(text, &mut hits),
    }
    hits.sort_by_key(|(pos, _)| *pos);

    let mut seen = HashSet::new();
    hits.into_iter()
        .filter(|(_, url)| seen.insert(url.clone()))
        .map(|(_, url)| UrlRecord::new(url))
        .collect()
}

fn scan_bare_urls(text: &str, hits: &mut Vec<(usize, String)>) {
    for m in BARE_URL_RE.find_iter(text) {
        let token = m
            .as_str()
            .trim_end_matches(|c: char| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'));
        let Some(parsed) = parse_http_url(token) else {
            continue;
        };
        // `a.png.html` and `a.png/b` fail here: the path must *end* in the extension.
        let ok = path_extension(&parsed)
            .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()))
            .unwrap_or(false);
        if ok {
            hits.push((m.start(), token.to_string()));
        }
    }
}

fn scan_markdown_images(text: &str, hits: &mut Vec<(usize, String)>) {
    for caps in MD_IMAGE_RE.captures_iter(text) {
        if let Some(g) = caps.get(1) {
            if let Some(url) = clean_candidate(g.as_str()) {
                hits.push((g.start(), url));
            }
        }
    }
}

fn scan_markup(text: &str, hits: &mut Vec<(usize, String)>) {
    for tag in IMG_TAG_RE.find_iter(text) {
        for caps in IMG_ATTR_RE.captures_iter(tag.as_str()) {
            let value = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3));
            if let Some(v) = value {
                if let Some(url) = clean_candidate(v.as_str()) {
                    hits.push((tag.start() + v.start(), url));
                }
            }
        }
    }
    for caps in BG_IMAGE_RE.captures_iter(text) {
        if let Some(g) = caps.get(1) {
            if let Some(url) = clean_candidate(g.as_str()) {
                hits.push((g.start(), url));
            }
        }
    }
}

/// Strip wrapping whitespace, angle brackets and quotes; keep only absolute
/// HTTP(S) URLs.
fn clean_candidate(raw: &str) -> Option<String> {
    let url = raw
        .trim()
        .trim_matches(|c: char| matches!(c, '<' | '>' | '"' | '\''))
        .trim();
    parse_http_url(url).map(|_| url.to_string())
}

/// Parse `url` (with `&amp;` decoded) and accept only http/https with a host.
fn parse_http_url(url: &str) -> Option<Url> {
    let parsed = Url::parse(&url.replace("&amp;", "&")).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    if parsed.host_str().map_or(true, str::is_empty) {
        return None;
    }
    Some(parsed)
}

fn path_extension(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}

/// Render records as the newline-delimited URL list file.
pub fn render_url_list(records: &[UrlRecord]) -> String {
    let mut out = String::new();
    for r in records {
        out.push_str(&r.original_url);
        out.push('\n');
    }
    out
}

/// Parse a URL list file. Blank lines and `#` comments are skipped, as are
/// lines that are not absolute HTTP(S) URLs. Duplicates keep their first
/// position.
pub fn parse_url_list(text: &str) -> Vec<UrlRecord> {
    let mut seen = HashSet::new();
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter(|l| parse_http_url(l).is_some())
        .filter(|l| seen.insert(l.to_string()))
        .map(UrlRecord::new)
        .collect()
}
