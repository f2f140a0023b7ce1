//! Typed session material for cookie-authenticated providers.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::error::SessionError;

/// Cookie carrying the bearer token. Required for any request.
pub const ACCESS_TOKEN_COOKIE: &str = "gp_access_token";
/// Cookie carrying the account id.
pub const USER_ID_COOKIE: &str = "gp_user_id";

/// Browser-like UA used when the secret does not carry one.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// On-disk shape of the secret. Matches what the credential seeding tool
/// writes.
#[derive(Debug, Deserialize)]
struct SecretFile {
    cookies: String,
    #[serde(rename = "user-agent", default)]
    user_agent: Option<String>,
    #[serde(default)]
    last_updated: Option<String>,
}

/// Named cookies plus the user agent they were captured with.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionMaterial {
    cookies: BTreeMap<String, String>,
    user_agent: String,
    issued_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for SessionMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMaterial")
            .field("cookies", &self.cookies.keys().collect::<Vec<_>>())
            .field("user_agent", &self.user_agent)
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

impl SessionMaterial {
    /// Parse a raw `Cookie` header (`a=1; b=2`). Fragments that do not parse
    /// as a cookie pair are skipped.
    pub fn from_cookie_header(
        header: &str,
        user_agent: Option<String>,
        issued_at: Option<DateTime<Utc>>,
    ) -> Self {
        let cookies = header
            .split(';')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .filter_map(|part| match cookie::Cookie::parse(part) {
                Ok(c) => Some((c.name().to_string(), c.value().to_string())),
                Err(e) => {
                    tracing::debug!("Skipping unparseable cookie fragment: {}", e);
                    None
                }
            })
            .collect();
        Self {
            cookies,
            user_agent: user_agent
                .filter(|ua| !ua.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            issued_at,
        }
    }

    /// Parse the JSON secret (`cookies`, `user-agent`, `last_updated`).
    pub fn from_secret_json(json: &str) -> Result<Self, SessionError> {
        let secret: SecretFile = serde_json::from_str(json)?;
        let issued_at = secret
            .last_updated
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| {
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| SessionError::Timestamp(s.to_string()))
            })
            .transpose()?;
        let material = Self::from_cookie_header(&secret.cookies, secret.user_agent, issued_at);
        if material.cookies.is_empty() {
            return Err(SessionError::NoCookies);
        }
        Ok(material)
    }

    /// Read and parse the secret file at `path`.
    pub async fn load(path: &Path) -> Result<Self, SessionError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SessionError::Read {
                path: path.to_path_buf(),
                source: e,
            })?;
        Self::from_secret_json(&contents)
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn cookie_count(&self) -> usize {
        self.cookies.len()
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        self.issued_at
    }

    /// Render back into a `Cookie` request header.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// The reduced set that is known to be sufficient for read-only listing.
    ///
    /// Returns `None` when either required cookie is missing, or when the
    /// material already is the minimal set.
    pub fn minimal(&self) -> Option<Self> {
        let token = self.cookies.get(ACCESS_TOKEN_COOKIE)?;
        let user = self.cookies.get(USER_ID_COOKIE)?;
        if self.cookies.len() == 2 {
            return None;
        }
        let cookies = BTreeMap::from([
            (ACCESS_TOKEN_COOKIE.to_string(), token.clone()),
            (USER_ID_COOKIE.to_string(), user.clone()),
        ]);
        Some(Self {
            cookies,
            user_agent: self.user_agent.clone(),
            issued_at: self.issued_at,
        })
    }

    /// Age relative to `now`, if the issue time is known. Never negative.
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.issued_at
            .map(|issued| (now - issued).max(chrono::Duration::zero()))
    }
}
