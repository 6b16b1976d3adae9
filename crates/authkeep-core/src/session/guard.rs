use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::machine::SessionPhase;
use super::manager::SessionManager;

/// Whether a protected view may render, and where to go if not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct AccessDecision {
    pub allowed: bool,
    pub redirect_target: Option<String>,
}

impl AccessDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            redirect_target: None,
        }
    }

    /// Startup is still resolving; render a loading indicator and ask again.
    pub fn loading() -> Self {
        Self {
            allowed: false,
            redirect_target: None,
        }
    }

    pub fn redirect(target: impl Into<String>) -> Self {
        Self {
            allowed: false,
            redirect_target: Some(target.into()),
        }
    }

    pub fn is_loading(&self) -> bool {
        !self.allowed && self.redirect_target.is_none()
    }
}

/// Gate for protected views.
pub struct GuardedAccess {
    session: Arc<SessionManager>,
    fallback: String,
}

impl GuardedAccess {
    /// Redirects to the configured sign-in route.
    pub fn new(session: Arc<SessionManager>) -> Self {
        let fallback = session.config().sign_in_route.clone();
        Self { session, fallback }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = fallback.into();
        self
    }

    pub fn fallback(&self) -> &str {
        &self.fallback
    }

    /// Decide access. An authenticated phase alone is not enough: the caller
    /// proceeds only if a valid token can be produced right now, refreshing
    /// if needed.
    pub async fn can_proceed(&self) -> AccessDecision {
        match self.session.state().phase {
            SessionPhase::Uninitialized | SessionPhase::Initializing => AccessDecision::loading(),
            SessionPhase::Authenticated => match self.session.tokens().get_valid_token().await {
                Some(_) => AccessDecision::allow(),
                None => {
                    debug!(target = %self.fallback, "No valid token, redirecting");
                    AccessDecision::redirect(&self.fallback)
                }
            },
            SessionPhase::Unauthenticated | SessionPhase::Error => {
                AccessDecision::redirect(&self.fallback)
            }
        }
    }
}
