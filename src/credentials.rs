//! Credential validator: probes the provider with the session material
//! before anything else runs.
//!
//! The probe is a one-item listing. Outcomes:
//! - accepted and younger than the warning age: `Valid`
//! - accepted but older: `Stale` (soft; the run goes on and an alert is raised)
//! - rejected, but the minimal cookie subset is accepted: `Valid` + `degraded`
//! - rejected outright: `Expired` (hard gate)
//! - the provider could not be reached: `Unknown`

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::provider::{AuthContext, MediaProvider, ProviderError, SessionMaterial};
use crate::retry::{self, RetryAction, RetryError, RetryPolicy};

pub const DEFAULT_STALE_AFTER_DAYS: i64 = 20;

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Age past which accepted credentials are reported as stale.
    pub stale_after: chrono::Duration,
    pub retry: RetryPolicy,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            stale_after: chrono::Duration::days(DEFAULT_STALE_AFTER_DAYS),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Valid,
    Stale,
    Expired,
    Unknown,
}

impl Validity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::Stale => "stale",
            Self::Expired => "expired",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Validity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialState {
    pub issued_at: Option<DateTime<Utc>>,
    pub last_validated_at: Option<DateTime<Utc>>,
    pub validity: Validity,
    /// Only the minimal cookie subset authenticated.
    pub degraded: bool,
}

impl CredentialState {
    /// Whether listing may proceed.
    pub fn permits_listing(&self) -> bool {
        matches!(self.validity, Validity::Valid | Validity::Stale)
    }
}

/// Result of one validation.
#[derive(Debug)]
pub struct CredentialReport {
    pub state: CredentialState,
    /// Present whenever listing is permitted.
    pub auth: Option<AuthContext>,
    pub age: Option<chrono::Duration>,
    /// Why validation did not succeed.
    pub failure: Option<String>,
}

pub struct CredentialValidator<P: ?Sized> {
    provider: Arc<P>,
    config: ValidatorConfig,
    clock: Arc<dyn Clock>,
}

impl<P: MediaProvider + ?Sized> CredentialValidator<P> {
    pub fn new(provider: Arc<P>, config: ValidatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            provider,
            config,
            clock,
        }
    }

    pub async fn validate(&self, material: &SessionMaterial) -> CredentialReport {
        let now = self.clock.now();
        let age = material.age(now);

        let rejection = match self.probe(material).await {
            Ok(auth) => return self.accepted(material, auth, age, now, false),
            Err(e) if is_auth_rejection(&e) => e,
            Err(e) => {
                tracing::error!(error = %e, "Credential probe could not reach the provider");
                return self.failed(material, Validity::Unknown, age, e.to_string());
            }
        };

        if let Some(minimal) = material.minimal() {
            tracing::warn!(
                cookies = material.cookie_count(),
                "Full credential set rejected, retrying with the minimal subset"
            );
            match self.probe(&minimal).await {
                Ok(mut auth) => {
                    auth.degraded = true;
                    return self.accepted(material, auth, age, now, true);
                }
                Err(e) if !is_auth_rejection(&e) => {
                    return self.failed(material, Validity::Unknown, age, e.to_string());
                }
                Err(_) => {}
            }
        }

        tracing::error!(error = %rejection, "Credentials rejected by provider");
        self.failed(material, Validity::Expired, age, rejection.to_string())
    }

    /// Authenticate and read a single item.
    async fn probe(
        &self,
        material: &SessionMaterial,
    ) -> Result<AuthContext, RetryError<ProviderError>> {
        retry::retry_with_backoff(
            &self.config.retry,
            "credential probe",
            |e: &ProviderError| RetryAction::from_retryable(e.is_retryable()),
            || async {
                let auth = self.provider.authenticate(material).await?;
                self.provider.list_page(&auth, None, 1).await?;
                Ok::<_, ProviderError>(auth)
            },
        )
        .await
    }

    fn accepted(
        &self,
        material: &SessionMaterial,
        auth: AuthContext,
        age: Option<chrono::Duration>,
        now: DateTime<Utc>,
        degraded: bool,
    ) -> CredentialReport {
        let stale = age.is_some_and(|a| a > self.config.stale_after);
        let validity = if stale { Validity::Stale } else { Validity::Valid };
        match (validity, age) {
            (Validity::Stale, Some(a)) => tracing::warn!(
                age_days = a.num_days(),
                threshold_days = self.config.stale_after.num_days(),
                "Credentials are getting old; refresh them soon"
            ),
            _ => tracing::info!(
                degraded,
                age_days = age.map(|a| a.num_days()),
                "Credentials valid"
            ),
        }
        CredentialReport {
            state: CredentialState {
                issued_at: material.issued_at(),
                last_validated_at: Some(now),
                validity,
                degraded,
            },
            auth: Some(auth),
            age,
            failure: None,
        }
    }

    fn failed(
        &self,
        material: &SessionMaterial,
        validity: Validity,
        age: Option<chrono::Duration>,
        failure: String,
    ) -> CredentialReport {
        CredentialReport {
            state: CredentialState {
                issued_at: material.issued_at(),
                last_validated_at: None,
                validity,
                degraded: false,
            },
            auth: None,
            age,
            failure: Some(failure),
        }
    }
}

fn is_auth_rejection(e: &RetryError<ProviderError>) -> bool {
    match e {
        RetryError::Permanent { error, .. } => error.auth_failure().is_some(),
        RetryError::Exhausted { .. } => false,
    }
}
