//! Client-side ASP session state.
//!
//! Pure protocol bookkeeping for the media server's side of the
//! handshake: capabilities received, sessions negotiated, legacy mode.
//! The transport itself lives in [`crate::ws_client`]; keeping the
//! state separate keeps the handshake testable without a socket.

use std::collections::HashMap;

use voxbridge_asp::{
    timestamp_now, AspMessage, AudioConfig, Capabilities, NegotiatedConfig, SessionStatus,
    VadConfig,
};

use crate::error::MediaError;

/// One negotiated client session.
#[derive(Debug, Clone)]
pub struct AspClientSession {
    pub session_id: String,
    pub call_id: Option<String>,

    /// Effective configuration. `None` only in legacy mode, where the
    /// client's defaults apply unchanged.
    pub negotiated: Option<NegotiatedConfig>,

    pub legacy_mode: bool,
}

/// Protocol state for one client connection.
#[derive(Debug, Default)]
pub struct AspClientHandler {
    server_capabilities: Option<Capabilities>,
    legacy_mode: bool,
    sessions: HashMap<String, AspClientSession>,
}

impl AspClientHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the server's capability announcement.
    pub fn record_capabilities(&mut self, capabilities: Capabilities) {
        tracing::info!(
            version = %capabilities.version,
            sample_rates = ?capabilities.supported_sample_rates,
            features = ?capabilities.features,
            "Received server capabilities"
        );
        self.server_capabilities = Some(capabilities);
        self.legacy_mode = false;
    }

    /// Switch to legacy mode (no capabilities within the timeout).
    pub fn enter_legacy_mode(&mut self) {
        tracing::warn!("No capabilities from server, assuming legacy mode");
        self.legacy_mode = true;
    }

    #[must_use]
    pub const fn is_legacy(&self) -> bool {
        self.legacy_mode
    }

    #[must_use]
    pub const fn server_capabilities(&self) -> Option<&Capabilities> {
        self.server_capabilities.as_ref()
    }

    #[must_use]
    pub fn session(&self, session_id: &str) -> Option<&AspClientSession> {
        self.sessions.get(session_id)
    }

    /// Build the `session.start` for a call.
    ///
    /// In legacy mode no configuration is attached — the session runs
    /// on defaults rather than risking a handshake the server cannot
    /// parse.
    #[must_use]
    pub fn build_session_start(
        &self,
        session_id: &str,
        call_id: &str,
        audio: &AudioConfig,
        vad: &VadConfig,
    ) -> AspMessage {
        AspMessage::SessionStart {
            session_id: session_id.to_string(),
            call_id: Some(call_id.to_string()),
            audio: (!self.legacy_mode).then_some(*audio),
            vad: (!self.legacy_mode).then(|| vad.clone()),
            metadata: None,
            timestamp: timestamp_now(),
        }
    }

    /// Apply a `session.started` answer.
    ///
    /// On accept the negotiated configuration is stored against the
    /// session; any adjustments the server made are logged. Rejection
    /// fails the session.
    pub fn process_session_started(
        &mut self,
        msg: &AspMessage,
        call_id: Option<String>,
    ) -> Result<AspClientSession, MediaError> {
        let AspMessage::SessionStarted {
            session_id,
            status,
            negotiated,
            errors,
            ..
        } = msg
        else {
            return Err(MediaError::SendFailed {
                destination: "asp".to_string(),
                reason: format!("expected session.started, got {}", msg.type_name()),
            });
        };

        if !status.is_accepted() {
            if let Some(errors) = errors {
                for err in errors {
                    tracing::warn!(
                        session = %session_id,
                        code = err.code,
                        message = %err.message,
                        "Session rejected by server"
                    );
                }
            }
            return Err(MediaError::SessionRejected(session_id.clone()));
        }

        if let Some(negotiated) = negotiated {
            for adj in &negotiated.adjustments {
                tracing::info!(
                    session = %session_id,
                    field = %adj.field,
                    requested = %adj.requested,
                    applied = %adj.applied,
                    "Server adjusted session parameter"
                );
            }
        }

        let session = AspClientSession {
            session_id: session_id.clone(),
            call_id,
            negotiated: negotiated.clone(),
            legacy_mode: self.legacy_mode,
        };
        self.sessions.insert(session_id.clone(), session.clone());

        tracing::info!(
            session = %session_id,
            status = ?status,
            legacy = self.legacy_mode,
            "ASP session established"
        );
        Ok(session)
    }

    /// Apply a `session.updated` answer (VAD-only renegotiation).
    pub fn process_session_updated(&mut self, msg: &AspMessage) -> Result<(), MediaError> {
        let AspMessage::SessionUpdated {
            session_id,
            status,
            negotiated,
            ..
        } = msg
        else {
            return Ok(());
        };

        if *status == SessionStatus::Rejected {
            tracing::warn!(session = %session_id, "Session update rejected");
            return Err(MediaError::SessionRejected(session_id.clone()));
        }

        if let Some(session) = self.sessions.get_mut(session_id) {
            session.negotiated = negotiated.clone();
            tracing::info!(session = %session_id, "Session configuration updated");
        }
        Ok(())
    }

    /// Build the fire-and-forget `session.end`.
    #[must_use]
    pub fn build_session_end(&self, session_id: &str, reason: &str) -> AspMessage {
        AspMessage::SessionEnd {
            session_id: session_id.to_string(),
            reason: Some(reason.to_string()),
            timestamp: timestamp_now(),
        }
    }

    /// Drop a session from local state.
    pub fn remove_session(&mut self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Forget everything tied to the connection (transport dropped).
    ///
    /// Sessions do not survive reconnects — there is no protocol-level
    /// resume — but legacy detection is also reset so the next
    /// connection re-probes capabilities.
    pub fn reset(&mut self) {
        self.sessions.clear();
        self.server_capabilities = None;
        self.legacy_mode = false;
    }
}
