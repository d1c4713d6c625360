//! Per-panel streaming session state machine.
//!
//! Single authority over "is a generation in flight". Every transport
//! callback is correlated through the request id minted by [`StreamSession::open`];
//! events carrying any other id are stale and must be dropped, which is
//! the only defense against a superseded stream's late callbacks
//! corrupting the next session.

use tokio_util::sync::CancellationToken;

use crate::auth::Route;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Sending,
    Streaming,
    /// A terminal stream event was accepted but transcript cleanup has
    /// not finished. Completed synchronously by [`StreamSession::settle`]
    /// inside the same event handler, so `can_send` is false only for
    /// the duration of that handler.
    Settling,
}

/// Correlation handles for one opened stream.
pub struct OpenedStream {
    pub rid: u64,
    pub cancel_token: CancellationToken,
    pub group_key: String,
}

/// Strict mutex over one generation at a time for the whole panel.
pub struct StreamSession {
    status: SessionStatus,
    active_request_id: Option<u64>,
    next_request_id: u64,
    cancel_token: Option<CancellationToken>,
    group_key: Option<String>,
    route: Option<Route>,
}

impl Default for StreamSession {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSession {
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Idle,
            active_request_id: None,
            next_request_id: 1,
            cancel_token: None,
            group_key: None,
            route: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Pure projection: true iff nothing is in flight.
    pub fn can_send(&self) -> bool {
        self.status == SessionStatus::Idle
    }

    /// Route recorded at `send` time, for diagnostics.
    pub fn route(&self) -> Option<&Route> {
        self.route.as_ref()
    }

    pub fn group_key(&self) -> Option<&str> {
        self.group_key.as_deref()
    }

    /// True iff `rid` belongs to the currently active request.
    pub fn is_current(&self, rid: u64) -> bool {
        self.active_request_id == Some(rid)
    }

    /// Begin a generation. Returns false (and changes nothing) while a
    /// request is active; callers gate on [`Self::can_send`]. The
    /// request id is not allocated here but in [`Self::open`].
    pub fn send(&mut self, route: Route) -> bool {
        if !self.can_send() {
            return false;
        }
        self.status = SessionStatus::Sending;
        self.route = Some(route);
        true
    }

    /// Allocate a fresh request id and abort handle for the generation
    /// begun by [`Self::send`]. Ids are monotonic and never reused for
    /// the process lifetime.
    pub fn open(&mut self) -> Option<OpenedStream> {
        if self.status != SessionStatus::Sending {
            return None;
        }
        let rid = self.next_request_id;
        self.next_request_id += 1;

        let token = CancellationToken::new();
        let group_key = format!("gen-{rid}");

        self.active_request_id = Some(rid);
        self.cancel_token = Some(token.clone());
        self.group_key = Some(group_key.clone());
        self.status = SessionStatus::Streaming;

        Some(OpenedStream {
            rid,
            cancel_token: token,
            group_key,
        })
    }

    /// Liveness tick for an arriving chunk. Returns whether the chunk
    /// belongs to the active stream; content merging is the store's
    /// job, not ours.
    pub fn delta(&mut self, rid: u64) -> bool {
        self.is_current(rid) && self.status == SessionStatus::Streaming
    }

    /// Accept stream completion. Returns false for stale ids.
    pub fn done(&mut self, rid: u64) -> bool {
        if !self.is_current(rid) || self.status != SessionStatus::Streaming {
            return false;
        }
        self.status = SessionStatus::Settling;
        true
    }

    /// Accept a transport-reported failure. A provided stale id is
    /// dropped; `None` means the failure is not correlated (always
    /// accepted while streaming).
    pub fn fail(&mut self, rid: Option<u64>) -> bool {
        if let Some(rid) = rid {
            if !self.is_current(rid) {
                return false;
            }
        }
        if self.status != SessionStatus::Streaming {
            return false;
        }
        self.status = SessionStatus::Settling;
        true
    }

    /// Complete terminal-event cleanup and return to idle.
    pub fn settle(&mut self) {
        if self.status == SessionStatus::Settling {
            self.reset();
        }
    }

    /// Abort whatever is in flight. Always allowed; a no-op from idle.
    /// Returns whether an active request was torn down. This is the
    /// only transition triggered by the user rather than the transport.
    pub fn cancel(&mut self) -> bool {
        if self.status == SessionStatus::Idle {
            return false;
        }
        if let Some(token) = &self.cancel_token {
            token.cancel();
        }
        self.reset();
        true
    }

    fn reset(&mut self) {
        self.status = SessionStatus::Idle;
        self.active_request_id = None;
        self.cancel_token = None;
        self.group_key = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Provider;

    fn route() -> Route {
        Route::new(Provider::OpenAi, "gpt-4o-mini")
    }

    fn open_session(session: &mut StreamSession) -> OpenedStream {
        assert!(session.send(route()));
        session.open().expect("open after send")
    }

    #[test]
    fn request_ids_start_at_one_and_climb() {
        let mut session = StreamSession::new();
        let first = open_session(&mut session);
        assert_eq!(first.rid, 1);
        assert!(session.done(first.rid));
        session.settle();

        let second = open_session(&mut session);
        assert_eq!(second.rid, 2);
    }

    #[test]
    fn send_is_rejected_while_active() {
        let mut session = StreamSession::new();
        let _opened = open_session(&mut session);
        assert!(!session.can_send());
        assert!(!session.send(route()));
        assert_eq!(session.status(), SessionStatus::Streaming);
    }

    #[test]
    fn open_requires_prior_send() {
        let mut session = StreamSession::new();
        assert!(session.open().is_none());
    }

    #[test]
    fn stale_events_are_dropped() {
        let mut session = StreamSession::new();
        let first = open_session(&mut session);
        assert!(session.cancel());

        let second = open_session(&mut session);
        assert!(!session.delta(first.rid));
        assert!(!session.done(first.rid));
        assert!(!session.fail(Some(first.rid)));
        assert!(session.delta(second.rid));
    }

    #[test]
    fn done_settles_back_to_idle() {
        let mut session = StreamSession::new();
        let opened = open_session(&mut session);
        assert!(session.done(opened.rid));
        assert_eq!(session.status(), SessionStatus::Settling);
        assert!(!session.can_send());
        session.settle();
        assert!(session.can_send());
        assert!(!session.is_current(opened.rid));
    }

    #[test]
    fn duplicate_terminal_events_are_ignored() {
        let mut session = StreamSession::new();
        let opened = open_session(&mut session);
        assert!(session.done(opened.rid));
        assert!(!session.done(opened.rid));
        assert!(!session.fail(Some(opened.rid)));
    }

    #[test]
    fn cancel_aborts_the_token_and_idles() {
        let mut session = StreamSession::new();
        let opened = open_session(&mut session);
        assert!(session.cancel());
        assert!(opened.cancel_token.is_cancelled());
        assert!(session.can_send());
    }

    #[test]
    fn cancel_from_idle_is_a_no_op() {
        let mut session = StreamSession::new();
        assert!(!session.cancel());
        assert!(session.can_send());
    }

    #[test]
    fn uncorrelated_fail_is_accepted_only_while_streaming() {
        let mut session = StreamSession::new();
        assert!(!session.fail(None));
        let _opened = open_session(&mut session);
        assert!(session.fail(None));
    }

    #[test]
    fn group_key_is_scoped_to_the_open_request() {
        let mut session = StreamSession::new();
        let opened = open_session(&mut session);
        assert_eq!(session.group_key(), Some(opened.group_key.as_str()));
        assert!(session.done(opened.rid));
        session.settle();
        assert!(session.group_key().is_none());
    }
}
