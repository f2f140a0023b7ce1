//! Camera-cloud provider over the GoPro media API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, LOCATION, REFERER, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use url::Url;

use super::error::{AuthFailure, ProviderError};
use super::responses::{DownloadResponse, MediaEntry, SearchResponse};
use super::session::{SessionMaterial, ACCESS_TOKEN_COOKIE};
use super::{AuthContext, CatalogPage, DownloadTarget, MediaProvider, PageToken, RawMediaRecord};

pub const DEFAULT_BASE_URL: &str = "https://api.gopro.com";
pub const PROVIDER_ID: &str = "gopro";
/// The search endpoint rejects larger pages.
pub const MAX_PAGE_SIZE: u32 = 100;

const MEDIA_ACCEPT: &str = "application/vnd.gopro.jk.media+json; version=2.0.0";
const ACCEPT_LANGUAGE_VALUE: &str = "en-US,en;q=0.9";
const REFERER_VALUE: &str = "https://gopro.com/";
const SOURCE_LABEL: &str = "source";

pub struct GoProProvider {
    client: Client,
    /// Same settings as `client` but never follows redirects; used for the
    /// second resolution step.
    resolver: Client,
    base_url: Url,
}

impl std::fmt::Debug for GoProProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoProProvider")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl GoProProvider {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, ProviderError> {
        let base_url = Url::parse(base_url).map_err(|e| ProviderError::InvalidUrl {
            url: base_url.to_string(),
            message: e.to_string(),
        })?;
        let build_err = |e: reqwest::Error| ProviderError::Http {
            url: base_url.to_string(),
            source: e,
        };
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(build_err)?;
        let resolver = Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(build_err)?;
        Ok(Self {
            client,
            resolver,
            base_url,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ProviderError::InvalidUrl {
                url: self.base_url.to_string(),
                message: "base URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder, auth: &AuthContext) -> RequestBuilder {
        builder
            .header(COOKIE, &auth.cookie_header)
            .header(USER_AGENT, &auth.user_agent)
            .header(ACCEPT, MEDIA_ACCEPT)
            .header(ACCEPT_LANGUAGE, ACCEPT_LANGUAGE_VALUE)
            .header(REFERER, REFERER_VALUE)
    }

    fn same_origin(&self, url: &Url) -> bool {
        url.host_str() == self.base_url.host_str() && url.port_or_known_default() == self.base_url.port_or_known_default()
    }
}

async fn send(builder: RequestBuilder, url: &str) -> Result<Response, ProviderError> {
    builder.send().await.map_err(|e| ProviderError::Http {
        url: url.to_string(),
        source: e,
    })
}

/// Check the status and decode the JSON body.
async fn read_json<T: DeserializeOwned>(response: Response, url: &str) -> Result<T, ProviderError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ProviderError::from_status(status.as_u16(), url));
    }
    let body = response.bytes().await.map_err(|e| ProviderError::Http {
        url: url.to_string(),
        source: e,
    })?;
    serde_json::from_slice(&body).map_err(|e| ProviderError::InvalidResponse {
        url: url.to_string(),
        message: e.to_string(),
    })
}

/// CloudFront signed URLs carry their expiry as `Expires=<unix seconds>`.
fn expiry_from_url(url: &Url) -> Option<DateTime<Utc>> {
    url.query_pairs()
        .find(|(k, _)| k.eq_ignore_ascii_case("expires"))
        .and_then(|(_, v)| v.parse::<i64>().ok())
        .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
}

impl From<MediaEntry> for RawMediaRecord {
    fn from(entry: MediaEntry) -> Self {
        Self {
            size_bytes: entry.size_bytes(),
            duration_ms: entry.duration_ms(),
            captured_at: entry.captured_at(),
            filename: entry.filename,
            id: entry.id,
        }
    }
}

#[async_trait]
impl MediaProvider for GoProProvider {
    fn provider_id(&self) -> &str {
        PROVIDER_ID
    }

    async fn authenticate(&self, material: &SessionMaterial) -> Result<AuthContext, ProviderError> {
        if material
            .cookie(ACCESS_TOKEN_COOKIE)
            .map_or(true, |v| v.trim().is_empty())
        {
            return Err(ProviderError::Auth {
                kind: AuthFailure::Invalid,
                message: format!("session material has no {} cookie", ACCESS_TOKEN_COOKIE),
            });
        }
        Ok(AuthContext {
            provider_id: PROVIDER_ID.to_string(),
            cookie_header: material.cookie_header(),
            user_agent: material.user_agent().to_string(),
            degraded: false,
        })
    }

    async fn list_page(
        &self,
        auth: &AuthContext,
        cursor: Option<&PageToken>,
        page_size: u32,
    ) -> Result<CatalogPage, ProviderError> {
        let url = self.endpoint(&["media", "search"])?;
        let url_str = url.to_string();
        let page = match cursor {
            Some(token) => token
                .as_str()
                .parse::<u32>()
                .map_err(|_| ProviderError::InvalidResponse {
                    url: url_str.clone(),
                    message: format!("unrecognised cursor '{}'", token),
                })?,
            None => 1,
        };
        let per_page = page_size.clamp(1, MAX_PAGE_SIZE);

        let request = self
            .authorized(self.client.get(url), auth)
            .query(&[("page", page), ("per_page", per_page)]);
        let response = send(request, &url_str).await?;
        let body: SearchResponse = read_json(response, &url_str).await?;

        let items: Vec<RawMediaRecord> = body
            .embedded
            .media
            .into_iter()
            .map(RawMediaRecord::from)
            .collect();

        let current = body
            .pages
            .as_ref()
            .and_then(|p| p.current_page)
            .unwrap_or(page);
        let has_more = match body.pages.as_ref().and_then(|p| p.total_pages) {
            Some(total_pages) => current < total_pages && !items.is_empty(),
            // No page descriptor: a full page suggests there is another one.
            None => items.len() >= per_page as usize,
        };
        let next_cursor = has_more.then(|| PageToken::new((current + 1).to_string()));
        let total_hint = body.pages.as_ref().and_then(|p| p.total_items);

        tracing::debug!(
            page = current,
            items = items.len(),
            has_next = next_cursor.is_some(),
            "Fetched catalog page"
        );

        Ok(CatalogPage {
            items,
            next_cursor,
            total_hint,
        })
    }

    async fn resolve_download(
        &self,
        auth: &AuthContext,
        media_id: &str,
    ) -> Result<DownloadTarget, ProviderError> {
        // Step 1: item detail names a reference URL for the source file.
        let detail_url = self.endpoint(&["media", media_id, "download"])?;
        let detail_str = detail_url.to_string();
        let response = send(self.authorized(self.client.get(detail_url), auth), &detail_str).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(media_id.to_string()));
        }
        let detail: DownloadResponse = read_json(response, &detail_str).await?;
        let reference = detail
            .reference_url(SOURCE_LABEL)
            .ok_or_else(|| ProviderError::InvalidResponse {
                url: detail_str.clone(),
                message: "item detail lists no downloadable file".to_string(),
            })?;
        let reference = self
            .base_url
            .join(reference)
            .map_err(|e| ProviderError::InvalidUrl {
                url: reference.to_string(),
                message: e.to_string(),
            })?;

        // Step 2: the reference redirects to a transient pre-signed URL.
        let reference_str = reference.to_string();
        let request = if self.same_origin(&reference) {
            self.authorized(self.resolver.get(reference.clone()), auth)
        } else {
            self.resolver
                .get(reference.clone())
                .header(USER_AGENT, &auth.user_agent)
        };
        let response = send(request, &reference_str).await?;
        let status = response.status();
        let final_url = if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| ProviderError::InvalidResponse {
                    url: reference_str.clone(),
                    message: format!("HTTP {} without Location header", status.as_u16()),
                })?;
            reference.join(location).map_err(|e| ProviderError::InvalidUrl {
                url: location.to_string(),
                message: e.to_string(),
            })?
        } else if status.is_success() {
            reference
        } else {
            return Err(ProviderError::from_status(status.as_u16(), &reference_str));
        };

        tracing::debug!(media_id, host = final_url.host_str().unwrap_or(""), "Resolved download URL");

        Ok(DownloadTarget {
            expires_at: expiry_from_url(&final_url),
            requires_auth_header: self.same_origin(&final_url),
            url: final_url.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn material() -> SessionMaterial {
        SessionMaterial::from_cookie_header(
            "gp_access_token=tok; gp_user_id=u1",
            Some("test-agent".into()),
            None,
        )
    }

    async fn setup() -> (MockServer, GoProProvider, AuthContext) {
        let server = MockServer::start().await;
        let provider = GoProProvider::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let auth = provider.authenticate(&material()).await.unwrap();
        (server, provider, auth)
    }

    #[tokio::test]
    async fn test_authenticate_requires_access_token() {
        let provider = GoProProvider::new(DEFAULT_BASE_URL, Duration::from_secs(5)).unwrap();
        let material = SessionMaterial::from_cookie_header("gp_user_id=u1", None, None);
        let err = provider.authenticate(&material).await.unwrap_err();
        assert_eq!(err.auth_failure(), Some(AuthFailure::Invalid));
    }

    #[tokio::test]
    async fn test_list_page_sends_session_headers_and_parses_page() {
        let (server, provider, auth) = setup().await;
        Mock::given(method("GET"))
            .and(path("/media/search"))
            .and(query_param("page", "1"))
            .and(query_param("per_page", "100"))
            .and(header("cookie", "gp_access_token=tok; gp_user_id=u1"))
            .and(header("user-agent", "test-agent"))
            .and(header("accept", MEDIA_ACCEPT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_embedded": {"media": [
                    {"id": "m1", "filename": "GH010001.MP4", "file_size": 2048, "source_duration": "1500"},
                    {"id": "m2", "filename": "PXL_1.mp4", "file_size": null}
                ]},
                "_pages": {"current_page": 1, "total_pages": 3, "total_items": 250}
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let page = provider.list_page(&auth, None, 500).await.unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].size_bytes, Some(2048));
        assert_eq!(page.items[0].duration_ms, Some(1500));
        assert_eq!(page.items[1].size_bytes, None);
        assert_eq!(page.next_cursor, Some(PageToken::new("2")));
        assert_eq!(page.total_hint, Some(250));
    }

    #[tokio::test]
    async fn test_list_page_last_page_has_no_cursor() {
        let (server, provider, auth) = setup().await;
        Mock::given(method("GET"))
            .and(path("/media/search"))
            .and(query_param("page", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_embedded": {"media": [{"id": "m9", "filename": "GOPR0009.JPG"}]},
                "_pages": {"current_page": 3, "total_pages": 3}
            })))
            .mount(&server)
            .await;

        let cursor = PageToken::new("3");
        let page = provider.list_page(&auth, Some(&cursor), 100).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_list_page_unauthorized_is_expired() {
        let (server, provider, auth) = setup().await;
        Mock::given(method("GET"))
            .and(path("/media/search"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let err = provider.list_page(&auth, None, 1).await.unwrap_err();
        assert_eq!(err.auth_failure(), Some(AuthFailure::Expired));
    }

    #[tokio::test]
    async fn test_list_page_server_error_is_retryable() {
        let (server, provider, auth) = setup().await;
        Mock::given(method("GET"))
            .and(path("/media/search"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider.list_page(&auth, None, 1).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_list_page_malformed_body_is_permanent() {
        let (server, provider, auth) = setup().await;
        Mock::given(method("GET"))
            .and(path("/media/search"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let err = provider.list_page(&auth, None, 1).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_list_page_rejects_foreign_cursor() {
        let (_server, provider, auth) = setup().await;
        let cursor = PageToken::new("p2");
        let err = provider.list_page(&auth, Some(&cursor), 1).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_resolve_download_follows_reference_redirect() {
        let (server, provider, auth) = setup().await;
        Mock::given(method("GET"))
            .and(path("/media/m1/download"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "filename": "GH010001.MP4",
                "_embedded": {
                    "files": [],
                    "variations": [
                        {"label": "proxy", "url": format!("{}/ref/m1-proxy", server.uri())},
                        {"label": "source", "url": format!("{}/ref/m1", server.uri())}
                    ]
                }
            })))
            .mount(&server)
            .await;
        let signed = "https://cdn.example.net/v/m1.mp4?Expires=1700000000&Signature=abc";
        Mock::given(method("GET"))
            .and(path("/ref/m1"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", signed))
            .mount(&server)
            .await;

        let target = provider.resolve_download(&auth, "m1").await.unwrap();
        assert_eq!(target.url, signed);
        assert!(!target.requires_auth_header);
        assert_eq!(
            target.expires_at,
            Utc.timestamp_opt(1_700_000_000, 0).single()
        );
    }

    #[tokio::test]
    async fn test_resolve_download_direct_reference() {
        let (server, provider, auth) = setup().await;
        Mock::given(method("GET"))
            .and(path("/media/m2/download"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_embedded": {"files": [{"url": "/files/m2.mp4"}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/files/m2.mp4"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4]))
            .mount(&server)
            .await;

        let target = provider.resolve_download(&auth, "m2").await.unwrap();
        assert_eq!(target.url, format!("{}/files/m2.mp4", server.uri()));
        assert!(target.requires_auth_header);
        assert!(target.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_resolve_download_missing_item() {
        let (server, provider, auth) = setup().await;
        Mock::given(method("GET"))
            .and(path("/media/gone/download"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = provider.resolve_download(&auth, "gone").await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(ref id) if id == "gone"));
    }

    #[tokio::test]
    async fn test_resolve_download_without_files_is_invalid() {
        let (server, provider, auth) = setup().await;
        Mock::given(method("GET"))
            .and(path("/media/m3/download"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"_embedded": {}})))
            .mount(&server)
            .await;

        let err = provider.resolve_download(&auth, "m3").await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[test]
    fn test_expiry_from_url() {
        let url = Url::parse("https://cdn/x?Signature=s&Expires=1700000000").unwrap();
        assert_eq!(expiry_from_url(&url), Utc.timestamp_opt(1_700_000_000, 0).single());
        let url = Url::parse("https://cdn/x?Signature=s").unwrap();
        assert_eq!(expiry_from_url(&url), None);
    }
}
