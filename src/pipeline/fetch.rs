//! Fetch stage: download one image URL to the artifact directory.
//!
//! Each attempt streams the body into memory with a running size check,
//! sniffs the magic bytes, then writes the artifact atomically. The whole
//! attempt is retried under the run's [`crate::retry::RetryPolicy`], so a
//! transient failure halfway through the body starts over cleanly.
//!
//! Artifact names are deterministic per URL:
//! `<sanitised-stem>-<sha256(url)[..12]>.<ext>`. Reruns overwrite the same
//! file instead of accumulating copies.

use crate::config::RehostConfig;
use crate::error::{ItemError, RehostError};
use crate::output::FetchResult;
use crate::persist;
use crate::pipeline::extract::{FormatHint, UrlRecord};
use futures::StreamExt;
use image::ImageFormat;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const MAX_STEM_LEN: usize = 48;

/// Build the HTTP client used for image downloads.
pub fn build_client(config: &RehostConfig) -> Result<reqwest::Client, RehostError> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.fetch_timeout_secs))
        .user_agent(config.user_agent.clone())
        .build()
        .map_err(|e| RehostError::Internal(format!("Failed to build HTTP client: {e}")))
}

/// The URL actually requested: HTML-escaped ampersands are decoded, the
/// record keeps the document's literal text.
pub fn request_url(original: &str) -> String {
    original.replace("&amp;", "&")
}

/// Deterministic artifact path for `record` inside `download_dir`.
pub fn artifact_path(download_dir: &Path, record: &UrlRecord, sniffed: FormatHint) -> PathBuf {
    let url = request_url(&record.original_url);
    let stem = Url::parse(&url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .map(|last| match last.rsplit_once('.') {
            Some((stem, _)) => stem.to_string(),
            None => last,
        })
        .map(|s| sanitise_stem(&s))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "image".to_string());

    let digest = hex::encode(Sha256::digest(record.original_url.as_bytes()));
    let ext = record
        .format_hint
        .extension()
        .or_else(|| sniffed.extension())
        .unwrap_or("jpg");

    download_dir.join(format!("{}-{}.{}", stem, &digest[..12], ext))
}

fn sanitise_stem(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(MAX_STEM_LEN)
        .collect::<String>()
        .trim_matches('_')
        .to_string()
}

/// Map sniffed bytes onto an accepted format.
fn sniff(bytes: &[u8]) -> Result<FormatHint, ItemError> {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Jpeg) => Ok(FormatHint::Jpg),
        Ok(ImageFormat::Png) => Ok(FormatHint::Png),
        Ok(ImageFormat::Gif) => Ok(FormatHint::Gif),
        Ok(ImageFormat::Bmp) => Ok(FormatHint::Bmp),
        Ok(ImageFormat::WebP) => Ok(FormatHint::Webp),
        Ok(other) => Err(ItemError::Format {
            detail: format!("{other:?} images are not accepted"),
        }),
        Err(_) => Err(ItemError::Format {
            detail: "content is not a recognised image".into(),
        }),
    }
}

/// Width and height from the image header, when readable.
fn read_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

struct Fetched {
    path: PathBuf,
    size: u64,
    dimensions: Option<(u32, u32)>,
}

/// Fetch one record, retrying transient failures.
pub async fn fetch_one(
    client: &reqwest::Client,
    record: &UrlRecord,
    config: &RehostConfig,
) -> FetchResult {
    let label = format!("fetch {}", record.original_url);
    let (outcome, attempts) = config
        .retry
        .run(&label, |_| attempt(client, record, config))
        .await;

    match outcome {
        Ok(f) => {
            debug!(
                "Fetched {} ({} bytes) -> {}",
                record.original_url,
                f.size,
                f.path.display()
            );
            FetchResult {
                original_url: record.original_url.clone(),
                local_path: Some(f.path),
                byte_size: Some(f.size),
                dimensions: f.dimensions,
                attempts,
                resumed: false,
                error: None,
            }
        }
        Err(e) => FetchResult::failed(record.original_url.clone(), e, attempts),
    }
}

async fn attempt(
    client: &reqwest::Client,
    record: &UrlRecord,
    config: &RehostConfig,
) -> Result<Fetched, ItemError> {
    let limit = config.max_image_bytes;
    let response = client
        .get(request_url(&record.original_url))
        .send()
        .await
        .map_err(|e| ItemError::from_reqwest(&e))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ItemError::from_status(status));
    }

    if let Some(ct) = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        let ct = ct.to_ascii_lowercase();
        if !ct.starts_with("image/") && !ct.starts_with("application/octet-stream") {
            return Err(ItemError::permanent(format!(
                "unexpected content type '{ct}'"
            )));
        }
    }

    if let Some(len) = response.content_length() {
        if len > limit {
            return Err(ItemError::SizeExceeded { size: len, limit });
        }
    }

    let mut body: Vec<u8> = Vec::new();
    let mut chunks = response.bytes_stream();
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| ItemError::transient(format!("body read failed: {e}")))?;
        let size = (body.len() + chunk.len()) as u64;
        if size > limit {
            return Err(ItemError::SizeExceeded { size, limit });
        }
        body.extend_from_slice(&chunk);
    }

    if body.is_empty() {
        return Err(ItemError::permanent("empty response body"));
    }

    let sniffed = sniff(&body)?;
    let dimensions = read_dimensions(&body);
    let path = artifact_path(&config.download_dir, record, sniffed);
    let size = body.len() as u64;

    persist::write_atomic(&path, body)
        .await
        .map_err(|e| ItemError::io(&e))?;

    Ok(Fetched {
        path,
        size,
        dimensions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::retry::{Backoff, RetryPolicy};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbImage::new(3, 2);
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    fn test_config(dir: &Path) -> RehostConfig {
        RehostConfig::builder()
            .download_dir(dir)
            .retry_policy(RetryPolicy {
                max_attempts: 3,
                backoff: Backoff::Fixed(Duration::ZERO),
            })
            .build()
            .unwrap()
    }

    #[test]
    fn artifact_path_is_deterministic() {
        let rec = UrlRecord::new("https://x.com/img/My Photo!.PNG?w=1");
        let a = artifact_path(Path::new("dl"), &rec, FormatHint::Png);
        let b = artifact_path(Path::new("dl"), &rec, FormatHint::Png);
        assert_eq!(a, b);
        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("My_20Photo"), "got {name}");
        assert!(name.ends_with(".png"));

        let other = artifact_path(Path::new("dl"), &UrlRecord::new("https://y.com/img/My Photo!.PNG"), FormatHint::Png);
        assert_ne!(a, other);
    }

    #[test]
    fn artifact_path_falls_back_to_sniffed_extension() {
        let rec = UrlRecord::new("https://x.com/media/12345");
        let p = artifact_path(Path::new("dl"), &rec, FormatHint::Gif);
        assert!(p.to_string_lossy().ends_with(".gif"));
        assert!(p.file_name().unwrap().to_string_lossy().starts_with("12345-"));
    }

    #[test]
    fn sniff_rejects_non_images() {
        assert_eq!(sniff(b"GIF89a......").unwrap(), FormatHint::Gif);
        assert_eq!(
            sniff(b"<html><body>nope</body></html>").unwrap_err().kind(),
            ErrorKind::FormatUnsupported
        );
    }

    #[test]
    fn request_url_decodes_entities() {
        assert_eq!(request_url("http://a.com/x.png?a=1&amp;b=2"), "http://a.com/x.png?a=1&b=2");
    }

    #[tokio::test]
    async fn fetch_writes_artifact_and_dimensions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(png_bytes()),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let client = build_client(&config).unwrap();
        let rec = UrlRecord::new(format!("{}/a.png", server.uri()));

        let result = fetch_one(&client, &rec, &config).await;
        assert!(result.is_ok(), "{:?}", result.error);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.dimensions, Some((3, 2)));
        let path = result.local_path.unwrap();
        assert!(path.starts_with(dir.path()));
        assert_eq!(std::fs::read(path).unwrap(), png_bytes());
    }

    #[tokio::test]
    async fn not_found_is_permanent_and_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing.png"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let client = build_client(&config).unwrap();
        let rec = UrlRecord::new(format!("{}/missing.png", server.uri()));

        let result = fetch_one(&client, &rec, &config).await;
        assert_eq!(result.error.unwrap().kind(), ErrorKind::NetworkPermanent);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn server_error_is_retried_up_to_limit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky.png"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let client = build_client(&config).unwrap();
        let rec = UrlRecord::new(format!("{}/flaky.png", server.uri()));

        let result = fetch_one(&client, &rec, &config).await;
        assert_eq!(result.error.unwrap().kind(), ErrorKind::NetworkTransient);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn html_content_type_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/login.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html; charset=utf-8")
                    .set_body_string("<html>login</html>"),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let client = build_client(&config).unwrap();
        let rec = UrlRecord::new(format!("{}/login.png", server.uri()));

        let result = fetch_one(&client, &rec, &config).await;
        assert_eq!(result.error.unwrap().kind(), ErrorKind::NetworkPermanent);
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn oversized_body_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/big.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "image/png")
                    .set_body_bytes(png_bytes()),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let config = RehostConfig::builder()
            .download_dir(dir.path())
            .max_image_bytes(10)
            .build()
            .unwrap();
        let client = build_client(&config).unwrap();
        let rec = UrlRecord::new(format!("{}/big.png", server.uri()));

        let result = fetch_one(&client, &rec, &config).await;
        assert_eq!(result.error.unwrap().kind(), ErrorKind::SizeExceeded);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn non_image_bytes_are_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fake.png"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "application/octet-stream")
                    .set_body_bytes(b"definitely not an image".to_vec()),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let client = build_client(&config).unwrap();
        let rec = UrlRecord::new(format!("{}/fake.png", server.uri()));

        let result = fetch_one(&client, &rec, &config).await;
        assert_eq!(result.error.unwrap().kind(), ErrorKind::FormatUnsupported);
    }
}
