use serde::Serialize;

/// Coarse authentication phase observed by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum SessionPhase {
    Uninitialized,
    Initializing,
    Authenticated,
    Unauthenticated,
    Error,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Uninitialized => "uninitialized",
            SessionPhase::Initializing => "initializing",
            SessionPhase::Authenticated => "authenticated",
            SessionPhase::Unauthenticated => "unauthenticated",
            SessionPhase::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Set only in the `Error` phase
    pub error_message: Option<String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::in_phase(SessionPhase::Uninitialized)
    }

    fn in_phase(phase: SessionPhase) -> Self {
        Self {
            phase,
            error_message: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            phase: SessionPhase::Error,
            error_message: Some(message),
        }
    }

    /// Startup has finished one way or another
    pub fn is_settled(&self) -> bool {
        !matches!(
            self.phase,
            SessionPhase::Uninitialized | SessionPhase::Initializing
        )
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase == SessionPhase::Authenticated
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    InitializationStarted,
    /// Startup found stored credentials and obtained a valid token
    ProbeSucceeded,
    ProbeFailed,
    InitializationTimedOut,
    SignedIn,
    SignedOut,
    RefreshFailed,
    /// Unexpected failure outside the normal sign-in/refresh paths
    Failed(String),
}

/// Pure transition function. Pairs not listed leave the state unchanged,
/// which is how late probe results are discarded after a timeout.
pub fn transition(state: &SessionState, event: SessionEvent) -> SessionState {
    use SessionEvent as E;
    use SessionPhase as P;

    match (state.phase, event) {
        (_, E::Failed(message)) => SessionState::error(message),
        (_, E::SignedIn) => SessionState::in_phase(P::Authenticated),
        (_, E::SignedOut) => SessionState::in_phase(P::Unauthenticated),

        (P::Uninitialized, E::InitializationStarted) => SessionState::in_phase(P::Initializing),
        (P::Initializing, E::ProbeSucceeded) => SessionState::in_phase(P::Authenticated),
        (P::Initializing, E::ProbeFailed | E::InitializationTimedOut) => {
            SessionState::in_phase(P::Unauthenticated)
        }

        (P::Authenticated, E::RefreshFailed) => SessionState::in_phase(P::Unauthenticated),

        _ => state.clone(),
    }
}
