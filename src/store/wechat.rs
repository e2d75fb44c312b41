//! WeChat Official Account media store.
//!
//! Endpoints used:
//!
//! | Call                | Endpoint                               | Returns      |
//! |---------------------|----------------------------------------|--------------|
//! | credential exchange | `GET  /cgi-bin/token`                  | access_token |
//! | permanent upload    | `POST /cgi-bin/media/uploadimg`        | `url`        |
//! | temporary upload    | `POST /cgi-bin/media/upload?type=image`| `media_id`   |
//!
//! WeChat reports most failures as HTTP 200 with an `errcode` body, so the
//! body is classified rather than the status alone.

use super::{Credentials, MediaPayload, MediaStore, RemoteAsset, Session, UploadMode};
use crate::error::ItemError;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Production API host.
pub const DEFAULT_API_BASE: &str = "https://api.weixin.qq.com";

/// CDN prefix for temporary media, which the API does not return a URL for.
const TEMP_MEDIA_CDN: &str = "https://mmbiz.qpic.cn/mmbiz_jpg";

/// Refresh margin subtracted from the advertised token lifetime.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 300;

/// `uploadimg` accepts images up to 1 MiB.
pub const PERMANENT_IMAGE_LIMIT: u64 = 1024 * 1024;

/// Temporary image media accepts up to 10 MiB.
pub const TEMPORARY_IMAGE_LIMIT: u64 = 10 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    errcode: Option<i64>,
    errmsg: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    url: Option<String>,
    media_id: Option<String>,
    errcode: Option<i64>,
    errmsg: Option<String>,
}

/// [`MediaStore`] backed by the WeChat Official Account API.
pub struct WeChatStore {
    client: reqwest::Client,
    api_base: String,
    permanent_limit: u64,
    temporary_limit: u64,
}

impl WeChatStore {
    /// `client` should carry the per-request upload timeout.
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            api_base: DEFAULT_API_BASE.to_string(),
            permanent_limit: PERMANENT_IMAGE_LIMIT,
            temporary_limit: TEMPORARY_IMAGE_LIMIT,
        }
    }

    /// Point at a different host (used by tests against a mock server).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the size limit for both modes.
    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.permanent_limit = bytes;
        self.temporary_limit = bytes;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }
}

/// Map a WeChat `errcode` onto an item error.
fn classify_errcode(code: i64, msg: &str, payload_size: u64, limit: u64) -> ItemError {
    let detail = format!("errcode {code}: {msg}");
    match code {
        40001 | 40002 | 40013 | 40014 | 40125 | 40164 | 41001 | 41002 | 41004 | 42001 => {
            ItemError::Auth { detail }
        }
        -1 | 45009 | 45011 => ItemError::Transient { detail },
        40006 | 40009 => ItemError::SizeExceeded {
            size: payload_size,
            limit,
        },
        40004 | 40005 | 40113 => ItemError::Format { detail },
        _ => ItemError::Permanent { detail },
    }
}

#[async_trait]
impl MediaStore for WeChatStore {
    fn name(&self) -> &str {
        "wechat"
    }

    fn identity(&self) -> String {
        format!("wechat:{}", self.api_base)
    }

    fn max_upload_bytes(&self, mode: UploadMode) -> u64 {
        match mode {
            UploadMode::Permanent => self.permanent_limit,
            UploadMode::Temporary => self.temporary_limit,
        }
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<Session, ItemError> {
        if credentials.is_empty() {
            return Err(ItemError::Auth {
                detail: "app id and secret must both be set".into(),
            });
        }
        info!("Requesting WeChat access token for app {}", credentials.app_id);

        let response = self
            .client
            .get(self.endpoint("/cgi-bin/token"))
            .query(&[
                ("grant_type", "client_credential"),
                ("appid", credentials.app_id.as_str()),
                ("secret", credentials.secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| ItemError::from_reqwest(&e))?;

        if !response.status().is_success() {
            return Err(ItemError::from_status(response.status()));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ItemError::transient(format!("token response unreadable: {e}")))?;

        match body.access_token {
            Some(token) if !token.is_empty() => {
                let lifetime = body.expires_in.unwrap_or(7200);
                debug!("WeChat access token valid for {}s", lifetime);
                Ok(Session {
                    token,
                    expires_at: Some(
                        Instant::now()
                            + Duration::from_secs(lifetime.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS)),
                    ),
                })
            }
            _ => {
                let code = body.errcode.unwrap_or(-1);
                let msg = body.errmsg.unwrap_or_else(|| "no access_token in response".into());
                // A busy system (-1) is worth retrying; anything else is a credential problem.
                if code == -1 {
                    Err(ItemError::transient(format!("errcode {code}: {msg}")))
                } else {
                    Err(ItemError::Auth {
                        detail: format!("errcode {code}: {msg}"),
                    })
                }
            }
        }
    }

    async fn upload(
        &self,
        session: &Session,
        payload: MediaPayload,
        mode: UploadMode,
    ) -> Result<RemoteAsset, ItemError> {
        if let Some(expires_at) = session.expires_at {
            if Instant::now() >= expires_at {
                return Err(ItemError::Auth {
                    detail: "access token expired during run".into(),
                });
            }
        }

        let size = payload.bytes.len() as u64;
        let file_name = payload.file_name.clone();
        let part = Part::bytes(payload.bytes)
            .file_name(payload.file_name)
            .mime_str(payload.content_type)
            .map_err(|e| ItemError::permanent(format!("invalid content type: {e}")))?;
        let form = Form::new().part("media", part);

        let request = match mode {
            UploadMode::Permanent => self
                .client
                .post(self.endpoint("/cgi-bin/media/uploadimg"))
                .query(&[("access_token", session.token.as_str())]),
            UploadMode::Temporary => self
                .client
                .post(self.endpoint("/cgi-bin/media/upload"))
                .query(&[("access_token", session.token.as_str()), ("type", "image")]),
        };

        let response = request
            .multipart(form)
            .send()
            .await
            .map_err(|e| ItemError::from_reqwest(&e))?;

        if !response.status().is_success() {
            return Err(ItemError::from_status(response.status()));
        }

        let body: UploadResponse = response
            .json()
            .await
            .map_err(|e| ItemError::transient(format!("upload response unreadable: {e}")))?;

        if let Some(code) = body.errcode.filter(|c| *c != 0) {
            let msg = body.errmsg.unwrap_or_default();
            return Err(classify_errcode(code, &msg, size, self.max_upload_bytes(mode)));
        }

        let asset = match mode {
            UploadMode::Permanent => {
                let url = body
                    .url
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| ItemError::permanent("uploadimg response has no url"))?;
                RemoteAsset {
                    remote_id: body.media_id.unwrap_or_else(|| url.clone()),
                    remote_url: url,
                }
            }
            UploadMode::Temporary => {
                let media_id = body
                    .media_id
                    .filter(|m| !m.is_empty())
                    .ok_or_else(|| ItemError::permanent("upload response has no media_id"))?;
                RemoteAsset {
                    remote_url: body
                        .url
                        .filter(|u| !u.is_empty())
                        .unwrap_or_else(|| format!("{TEMP_MEDIA_CDN}/{media_id}/0")),
                    remote_id: media_id,
                }
            }
        };

        debug!("Uploaded {} -> {}", file_name, asset.remote_url);
        Ok(asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> WeChatStore {
        WeChatStore::new(reqwest::Client::new()).with_api_base(server.uri())
    }

    fn png_payload() -> MediaPayload {
        MediaPayload {
            file_name: "logo-abc.png".into(),
            content_type: "image/png",
            bytes: vec![0x89, b'P', b'N', b'G'],
        }
    }

    #[test]
    fn errcode_classification() {
        assert_eq!(classify_errcode(42001, "expired", 1, 2).kind(), ErrorKind::AuthFailure);
        assert_eq!(classify_errcode(-1, "busy", 1, 2).kind(), ErrorKind::NetworkTransient);
        assert_eq!(classify_errcode(40009, "too big", 9, 2), ItemError::SizeExceeded { size: 9, limit: 2 });
        assert_eq!(classify_errcode(40005, "bad type", 1, 2).kind(), ErrorKind::FormatUnsupported);
        assert_eq!(classify_errcode(99999, "??", 1, 2).kind(), ErrorKind::NetworkPermanent);
    }

    #[test]
    fn limits_depend_on_mode() {
        let store = WeChatStore::new(reqwest::Client::new());
        assert_eq!(store.max_upload_bytes(UploadMode::Permanent), PERMANENT_IMAGE_LIMIT);
        assert_eq!(store.max_upload_bytes(UploadMode::Temporary), TEMPORARY_IMAGE_LIMIT);
        let store = store.with_max_upload_bytes(42);
        assert_eq!(store.max_upload_bytes(UploadMode::Permanent), 42);
    }

    #[tokio::test]
    async fn authenticate_returns_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/token"))
            .and(query_param("appid", "wx1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "TOKEN",
                "expires_in": 7200
            })))
            .mount(&server)
            .await;

        let session = store_for(&server)
            .authenticate(&Credentials::new("wx1", "s"))
            .await
            .unwrap();
        assert_eq!(session.token, "TOKEN");
        assert!(session.expires_at.is_some());
    }

    #[tokio::test]
    async fn authenticate_rejected_is_auth_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/cgi-bin/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 40125,
                "errmsg": "invalid appsecret"
            })))
            .mount(&server)
            .await;

        let err = store_for(&server)
            .authenticate(&Credentials::new("wx1", "bad"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
    }

    #[tokio::test]
    async fn permanent_upload_uses_uploadimg_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/media/uploadimg"))
            .and(query_param("access_token", "T"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "url": "http://mmbiz.qpic.cn/mmbiz_png/abc/0"
            })))
            .mount(&server)
            .await;

        let session = Session {
            token: "T".into(),
            expires_at: None,
        };
        let asset = store_for(&server)
            .upload(&session, png_payload(), UploadMode::Permanent)
            .await
            .unwrap();
        assert_eq!(asset.remote_url, "http://mmbiz.qpic.cn/mmbiz_png/abc/0");
    }

    #[tokio::test]
    async fn temporary_upload_derives_cdn_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/media/upload"))
            .and(query_param("type", "image"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "type": "image",
                "media_id": "MEDIA42",
                "created_at": 1700000000
            })))
            .mount(&server)
            .await;

        let session = Session {
            token: "T".into(),
            expires_at: None,
        };
        let asset = store_for(&server)
            .upload(&session, png_payload(), UploadMode::Temporary)
            .await
            .unwrap();
        assert_eq!(asset.remote_id, "MEDIA42");
        assert_eq!(asset.remote_url, "https://mmbiz.qpic.cn/mmbiz_jpg/MEDIA42/0");
    }

    #[tokio::test]
    async fn expired_token_errcode_is_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/media/uploadimg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "errcode": 42001,
                "errmsg": "access_token expired"
            })))
            .mount(&server)
            .await;

        let session = Session {
            token: "T".into(),
            expires_at: None,
        };
        let err = store_for(&server)
            .upload(&session, png_payload(), UploadMode::Permanent)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthFailure);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/cgi-bin/media/uploadimg"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let session = Session {
            token: "T".into(),
            expires_at: None,
        };
        let err = store_for(&server)
            .upload(&session, png_payload(), UploadMode::Permanent)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NetworkTransient);
    }
}
