//! One chat panel: the composer-facing surface that ties the message
//! store, the session state machine, the transport, and persistence
//! together.
//!
//! Every stream event is processed in a single synchronous handler so
//! the transcript mutation and the session transition either both
//! happen or neither does; a transcript can never be left with a
//! forever-streaming entry because one half was skipped.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use crate::auth::{KeyBag, Route};
use crate::core::chat_stream::{StreamEvent, StreamScope, StreamTransport};
use crate::core::classify::{classify, CancelReason, ErrorPresentation, ErrorReport};
use crate::core::config::Config;
use crate::core::message::{ChatMessage, MessageId, MessageStore};
use crate::core::persistence::DebouncedSaver;
use crate::core::request::{build_request, BuildError, BuildInputs, SamplingOverrides};
use crate::core::session::StreamSession;

/// Correlation handles returned to the caller on a successful submit.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub rid: u64,
    pub user_id: Option<MessageId>,
    pub assistant_id: MessageId,
    pub group_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    /// A generation is already in flight; the UI should have disabled
    /// the send affordance.
    Busy,
    /// Retry was requested with no prior user prompt to replay.
    NothingToRetry,
    Build(BuildError),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitError::Busy => write!(f, "A response is already being generated"),
            SubmitError::NothingToRetry => write!(f, "No previous message to retry"),
            SubmitError::Build(e) => write!(f, "{e}"),
        }
    }
}

impl StdError for SubmitError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            SubmitError::Build(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BuildError> for SubmitError {
    fn from(e: BuildError) -> Self {
        SubmitError::Build(e)
    }
}

pub struct ChatPanel {
    store: MessageStore,
    session: StreamSession,
    config: Config,
    keys: KeyBag,
    transport: Box<dyn StreamTransport>,
    saver: Option<DebouncedSaver>,
    overrides: SamplingOverrides,
    /// Assistant placeholder the active stream is feeding.
    active_assistant: Option<MessageId>,
    last_user_prompt: Option<String>,
    last_failure: Option<ErrorPresentation>,
}

impl ChatPanel {
    pub fn new(config: Config, keys: KeyBag, transport: Box<dyn StreamTransport>) -> Self {
        Self {
            store: MessageStore::new(),
            session: StreamSession::new(),
            config,
            keys,
            transport,
            saver: None,
            overrides: SamplingOverrides::default(),
            active_assistant: None,
            last_user_prompt: None,
            last_failure: None,
        }
    }

    pub fn with_saver(mut self, saver: DebouncedSaver) -> Self {
        self.saver = Some(saver);
        self
    }

    pub fn can_send(&self) -> bool {
        self.session.can_send()
    }

    pub fn messages(&self) -> Arc<Vec<ChatMessage>> {
        self.store.snapshot()
    }

    /// Most recent classified terminal failure, for the retry and
    /// key-editor affordances. Cleared on the next submit.
    pub fn last_failure(&self) -> Option<&ErrorPresentation> {
        self.last_failure.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn set_sampling_overrides(&mut self, overrides: SamplingOverrides) {
        self.overrides = overrides;
    }

    /// Restore a persisted transcript. Any streaming flags left over
    /// from an interrupted run are closed out first.
    pub fn restore_history(&mut self, messages: Vec<ChatMessage>) {
        self.store.replace_all(messages);
        self.store.finalize_latest_streaming_assistant(None);
    }

    /// Mirror the draft to storage, debounced.
    pub fn update_draft(&mut self, text: &str) {
        if let Some(saver) = &self.saver {
            saver.save_draft_debounced(text);
        }
    }

    /// Validate, record the turn, open the session, and hand the
    /// request to the transport. Builder failures are reported before
    /// any state changes: the session never leaves idle and no
    /// transcript entry appears.
    pub fn submit(&mut self, draft: &str, route: Route) -> Result<SubmitReceipt, SubmitError> {
        if !self.session.can_send() {
            return Err(SubmitError::Busy);
        }
        let request = self.build(draft, &route)?;
        let prompt = request.prompt.clone();
        let receipt = self.start_generation(request, route, true)?;
        self.last_user_prompt = Some(prompt);
        if let Some(saver) = &self.saver {
            saver.save_draft_debounced("");
        }
        Ok(receipt)
    }

    /// Re-stream the last user prompt over the given route. The
    /// trailing assistant turn (failed or finalized) is dropped and a
    /// fresh placeholder takes its place; no new user turn is added.
    pub fn retry_last(&mut self, route: Route) -> Result<SubmitReceipt, SubmitError> {
        if !self.session.can_send() {
            return Err(SubmitError::Busy);
        }
        let prompt = self
            .last_user_prompt
            .clone()
            .ok_or(SubmitError::NothingToRetry)?;
        let request = self.build(&prompt, &route)?;
        self.store.remove_trailing_assistant();
        self.start_generation(request, route, false)
    }

    fn build(
        &self,
        draft: &str,
        route: &Route,
    ) -> Result<crate::api::StreamRequest, SubmitError> {
        let request = build_request(BuildInputs {
            draft,
            route,
            config: &self.config,
            keys: &self.keys,
            overrides: &self.overrides,
            system_prompt_override: None,
        })?;
        Ok(request)
    }

    fn start_generation(
        &mut self,
        request: crate::api::StreamRequest,
        route: Route,
        append_user: bool,
    ) -> Result<SubmitReceipt, SubmitError> {
        self.last_failure = None;
        if !self.session.send(route.clone()) {
            return Err(SubmitError::Busy);
        }

        let user_id = append_user.then(|| self.store.append_user(&request.prompt, &route));
        let assistant_id = self.store.append_assistant_placeholder(&route);

        // send() left the session in Sending, so open() cannot refuse.
        let Some(opened) = self.session.open() else {
            self.session.cancel();
            return Err(SubmitError::Busy);
        };
        self.active_assistant = Some(assistant_id);

        tracing::debug!(
            rid = opened.rid,
            provider = route.provider.id(),
            model = %route.model,
            "opening stream"
        );
        self.transport.start_streaming(
            request,
            StreamScope {
                group_key: opened.group_key.clone(),
                cancel_token: opened.cancel_token.clone(),
                stream_id: opened.rid,
            },
        );
        self.persist_history();

        Ok(SubmitReceipt {
            rid: opened.rid,
            user_id,
            assistant_id,
            group_key: opened.group_key,
        })
    }

    /// Single synchronous handler for every transport event. Events
    /// carrying a stale request id are dropped unconditionally; the
    /// return value says whether the event was applied, so callers
    /// echoing the stream can suppress stale chunks too.
    pub fn handle_event(&mut self, event: StreamEvent, rid: u64) -> bool {
        if !self.session.is_current(rid) {
            tracing::debug!(rid, "dropping stale stream event");
            return false;
        }
        match event {
            StreamEvent::Delta(chunk) => {
                if !self.session.delta(rid) {
                    return false;
                }
                if let Some(id) = self.active_assistant {
                    self.store.merge_assistant_delta(id, &chunk);
                }
                true
            }
            StreamEvent::Completed { .. } => {
                if !self.session.done(rid) {
                    return false;
                }
                match self.active_assistant.take() {
                    Some(id) => self.store.finalize_assistant(id),
                    None => self.store.finalize_latest_streaming_assistant(None),
                }
                self.session.settle();
                self.persist_history();
                true
            }
            StreamEvent::Errored(report) => {
                if !self.session.fail(Some(rid)) {
                    return false;
                }
                let verdict = classify(&report);
                match self.active_assistant.take() {
                    Some(id) => self.store.set_error_on_assistant(id, &verdict.display_text),
                    None => self
                        .store
                        .finalize_latest_streaming_assistant(Some(&verdict.display_text)),
                }
                self.last_failure = Some(verdict);
                self.session.settle();
                self.persist_history();
                true
            }
        }
    }

    /// User- or teardown-initiated cancellation. Aborts the signal
    /// handed to the transport and closes the streaming placeholder
    /// with a cancellation notice; the transport's own late `aborted`
    /// report is then stale and gets dropped. Idempotent from idle.
    ///
    /// The reason becomes the report detail and selects the
    /// cancellation sub-reason, so callers pass the canonical
    /// substrings (`user_abort`, `closed_flag`, `idle_timeout`,
    /// `open_timeout`).
    pub fn cancel(&mut self, reason: &str) {
        if !self.session.cancel() {
            return;
        }
        let report = ErrorReport::aborted(reason);
        let verdict = classify(&report);
        self.store
            .finalize_latest_streaming_assistant(Some(&verdict.display_text));
        self.active_assistant = None;
        self.last_failure = Some(verdict);
        self.persist_history();
    }

    /// Empty the transcript and the draft together.
    pub fn clear_all(&mut self) {
        self.cancel(CancelReason::USER_ABORT_DETAIL);
        self.store.clear_all();
        self.active_assistant = None;
        self.last_user_prompt = None;
        self.last_failure = None;
        if let Some(saver) = &self.saver {
            saver.save_draft_debounced("");
            saver.save_history_debounced(Vec::new());
        }
    }

    fn persist_history(&self) {
        if let Some(saver) = &self.saver {
            saver.save_history_debounced(self.store.snapshot().as_ref().clone());
        }
    }

    #[cfg(test)]
    pub(crate) fn streaming_count(&self) -> usize {
        self.store.streaming_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Provider;
    use crate::core::classify::ErrorClass;
    use crate::core::message::Role;

    fn route() -> Route {
        Route::new(Provider::OpenAi, "gpt-4o-mini")
    }

    struct NullTransport;

    impl StreamTransport for NullTransport {
        fn start_streaming(
            &self,
            _request: crate::api::StreamRequest,
            scope: StreamScope,
        ) -> crate::core::chat_stream::StreamHandle {
            crate::core::chat_stream::StreamHandle {
                op_token: scope.stream_id,
                group_key: scope.group_key,
                cancel: scope.cancel_token,
            }
        }

        fn abort_streaming(&self, _reason: &str) {}
    }

    fn test_panel() -> ChatPanel {
        let mut keys = KeyBag::new();
        keys.set_runtime_key(Provider::OpenAi, "sk-test");
        ChatPanel::new(Config::default(), keys, Box::new(NullTransport))
    }

    #[test]
    fn submit_then_stream_to_completion() {
        let mut panel = test_panel();
        assert!(panel.can_send());

        let receipt = panel.submit("hello", route()).expect("submit");
        assert_eq!(receipt.rid, 1);
        assert!(!panel.can_send());

        let messages = panel.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello");
        assert!(messages[1].is_streaming);

        panel.handle_event(StreamEvent::Delta("Hi".to_string()), receipt.rid);
        panel.handle_event(StreamEvent::Delta(" there".to_string()), receipt.rid);
        panel.handle_event(
            StreamEvent::Completed {
                full_text: "Hi there".to_string(),
            },
            receipt.rid,
        );

        let messages = panel.messages();
        assert_eq!(messages[1].content, "Hi there");
        assert!(!messages[1].is_streaming);
        assert!(messages[1].error.is_none());
        assert!(panel.can_send());
    }

    #[test]
    fn at_most_one_message_streams_at_a_time() {
        let mut panel = test_panel();
        let receipt = panel.submit("first", route()).expect("submit");
        assert_eq!(panel.streaming_count(), 1);

        assert_eq!(
            panel.submit("second", route()).unwrap_err(),
            SubmitError::Busy
        );
        assert_eq!(panel.streaming_count(), 1);

        panel.handle_event(
            StreamEvent::Completed {
                full_text: String::new(),
            },
            receipt.rid,
        );
        assert_eq!(panel.streaming_count(), 0);

        panel.submit("second", route()).expect("submit after done");
        assert_eq!(panel.streaming_count(), 1);
    }

    #[test]
    fn stale_delta_cannot_touch_the_new_session() {
        let mut panel = test_panel();
        let first = panel.submit("one", route()).expect("submit");
        panel.cancel(CancelReason::USER_ABORT_DETAIL);

        let second = panel.submit("two", route()).expect("submit");
        assert_eq!(second.rid, 2);

        panel.handle_event(StreamEvent::Delta("ghost".to_string()), first.rid);
        let messages = panel.messages();
        let live = messages
            .iter()
            .find(|m| m.id == second.assistant_id)
            .expect("placeholder");
        assert_eq!(live.content, "");
        assert!(live.is_streaming);
    }

    #[test]
    fn cancel_closes_the_placeholder_and_reopens_send() {
        let mut panel = test_panel();
        let receipt = panel.submit("hello", route()).expect("submit");
        panel.handle_event(StreamEvent::Delta("partial".to_string()), receipt.rid);

        panel.cancel(CancelReason::USER_ABORT_DETAIL);
        assert!(panel.can_send());

        let messages = panel.messages();
        let assistant = messages.last().expect("assistant");
        assert!(!assistant.is_streaming);
        assert_eq!(assistant.content, "partial");
        assert!(assistant.error.is_some());
        assert_eq!(
            panel.last_failure().expect("failure").class,
            ErrorClass::Cancelled(CancelReason::UserAbort)
        );

        // Late chunk from the aborted stream is a no-op.
        panel.handle_event(StreamEvent::Delta("late chunk".to_string()), receipt.rid);
        assert_eq!(panel.messages().last().expect("assistant").content, "partial");
    }

    #[test]
    fn cancel_from_idle_is_idempotent() {
        let mut panel = test_panel();
        panel.cancel(CancelReason::USER_ABORT_DETAIL);
        assert!(panel.can_send());
        assert!(panel.last_failure().is_none());
    }

    #[test]
    fn cancel_reason_selects_the_cancellation_sub_reason() {
        let cases = [
            ("closed_flag", CancelReason::ClosedFlag),
            ("idle_timeout", CancelReason::IdleTimeout),
            ("open_timeout", CancelReason::OpenTimeout),
            (CancelReason::USER_ABORT_DETAIL, CancelReason::UserAbort),
        ];
        for (reason, expected) in cases {
            let mut panel = test_panel();
            panel.submit("hello", route()).expect("submit");
            panel.cancel(reason);
            assert_eq!(
                panel.last_failure().expect("failure").class,
                ErrorClass::Cancelled(expected),
                "reason {reason:?}"
            );
        }
    }

    #[test]
    fn handle_event_reports_whether_the_event_applied() {
        let mut panel = test_panel();
        let first = panel.submit("one", route()).expect("submit");
        assert!(panel.handle_event(StreamEvent::Delta("Hi".to_string()), first.rid));

        panel.cancel(CancelReason::USER_ABORT_DETAIL);
        assert!(!panel.handle_event(StreamEvent::Delta("ghost".to_string()), first.rid));
        assert!(!panel.handle_event(
            StreamEvent::Completed {
                full_text: String::new(),
            },
            first.rid,
        ));

        let second = panel.submit("two", route()).expect("submit");
        assert!(panel.handle_event(
            StreamEvent::Completed {
                full_text: String::new(),
            },
            second.rid,
        ));
    }

    #[test]
    fn transport_failure_is_classified_onto_the_message() {
        let mut panel = test_panel();
        let receipt = panel.submit("hello", route()).expect("submit");

        panel.handle_event(
            StreamEvent::Errored(ErrorReport::from_status(429)),
            receipt.rid,
        );

        assert!(panel.can_send());
        let messages = panel.messages();
        let assistant = messages.last().expect("assistant");
        assert!(!assistant.is_streaming);
        assert!(assistant.error.is_some());

        let failure = panel.last_failure().expect("failure");
        assert_eq!(failure.class, ErrorClass::RateLimited);
        assert!(failure.show_retry);
    }

    #[test]
    fn builder_failure_leaves_session_and_transcript_untouched() {
        let mut panel = test_panel();

        assert_eq!(
            panel.submit("   ", route()).unwrap_err(),
            SubmitError::Build(BuildError::EmptyPrompt)
        );
        let missing = panel.submit("hi", Route::new(Provider::Gemini, "gemini-2.0-flash"));
        assert_eq!(
            missing.unwrap_err(),
            SubmitError::Build(BuildError::MissingKey(Provider::Gemini))
        );

        assert!(panel.can_send());
        assert!(panel.messages().is_empty());
    }

    #[test]
    fn retry_replays_the_last_prompt_without_a_new_user_turn() {
        let mut panel = test_panel();
        let first = panel.submit("hello", route()).expect("submit");
        panel.handle_event(
            StreamEvent::Errored(ErrorReport::from_status(500)),
            first.rid,
        );

        let retry = panel.retry_last(route()).expect("retry");
        assert_eq!(retry.user_id, None);

        let messages = panel.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "hello");
        let placeholder = messages.last().expect("placeholder");
        assert!(placeholder.is_streaming);
        assert!(placeholder.error.is_none());

        panel.handle_event(
            StreamEvent::Completed {
                full_text: String::new(),
            },
            retry.rid,
        );
        assert!(panel.can_send());
    }

    #[test]
    fn retry_without_history_is_rejected() {
        let mut panel = test_panel();
        assert_eq!(
            panel.retry_last(route()).unwrap_err(),
            SubmitError::NothingToRetry
        );
    }

    #[test]
    fn clear_all_empties_the_transcript() {
        let mut panel = test_panel();
        let receipt = panel.submit("hello", route()).expect("submit");
        panel.handle_event(
            StreamEvent::Completed {
                full_text: String::new(),
            },
            receipt.rid,
        );

        panel.clear_all();
        assert!(panel.messages().is_empty());
        assert!(panel.can_send());
    }

    #[test]
    fn restore_history_closes_interrupted_streams() {
        let mut panel = test_panel();
        let receipt = panel.submit("hello", route()).expect("submit");
        panel.handle_event(StreamEvent::Delta("par".to_string()), receipt.rid);
        let interrupted = panel.messages().as_ref().clone();
        assert!(interrupted.iter().any(|m| m.is_streaming));

        let mut fresh = test_panel();
        fresh.restore_history(interrupted);
        assert_eq!(fresh.streaming_count(), 0);
        assert_eq!(fresh.messages().len(), 2);
    }
}
