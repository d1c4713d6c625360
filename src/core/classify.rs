//! Maps heterogeneous transport failures into a closed taxonomy and a
//! user-facing decision: what text to show, whether to offer a retry,
//! and whether to open the key editor.
//!
//! Classification is a strict priority list, first match wins. A report
//! carrying both a 429 status and an `aborted` code classifies by
//! whichever rule comes first, so reordering the checks is a behavior
//! change, not a refactor.

use std::fmt;

/// Failure as reported by the transport, before classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorReport {
    pub code: Option<String>,
    pub status: Option<u16>,
    pub detail: Option<String>,
    pub user_message: Option<String>,
}

impl ErrorReport {
    pub fn from_code(code: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            ..Self::default()
        }
    }

    pub fn from_status(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn aborted(detail: impl Into<String>) -> Self {
        Self {
            code: Some("aborted".to_string()),
            detail: Some(detail.into()),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = Some(message.into());
        self
    }
}

/// Why a stream was cancelled, recovered from the report's detail text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    OpenTimeout,
    UserAbort,
    IdleTimeout,
    AbortError,
    ClosedFlag,
}

impl CancelReason {
    pub const USER_ABORT_DETAIL: &'static str = "user_abort";

    fn from_detail(detail: Option<&str>) -> Self {
        let Some(detail) = detail else {
            return CancelReason::AbortError;
        };
        if detail.contains("open_timeout") {
            CancelReason::OpenTimeout
        } else if detail.contains("user_abort") {
            CancelReason::UserAbort
        } else if detail.contains("idle_timeout") {
            CancelReason::IdleTimeout
        } else if detail.contains("closed_flag") {
            CancelReason::ClosedFlag
        } else {
            CancelReason::AbortError
        }
    }

    fn display_text(self) -> &'static str {
        match self {
            CancelReason::OpenTimeout => "Cancelled: the connection took too long to open.",
            CancelReason::UserAbort => "Generation stopped.",
            CancelReason::IdleTimeout => "Cancelled: the stream went quiet for too long.",
            CancelReason::AbortError => "Generation was aborted.",
            CancelReason::ClosedFlag => "Cancelled: the panel was closed.",
        }
    }
}

/// Closed failure taxonomy. Builder-level `MissingKey` short-circuits
/// before any network attempt and never reaches the transport, so it
/// lives with the builder errors, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    RateLimited,
    Timeout,
    Cancelled(CancelReason),
    Server,
    Network,
    InvalidRequest,
    Unknown,
}

/// Classifier verdict consumed by the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorPresentation {
    pub class: ErrorClass,
    pub display_text: String,
    pub show_retry: bool,
    pub show_key_editor: bool,
}

impl fmt::Display for ErrorPresentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_text)
    }
}

fn code_is(report: &ErrorReport, candidates: &[&str]) -> bool {
    report
        .code
        .as_deref()
        .map(|code| {
            let code = code.to_ascii_lowercase();
            candidates.iter().any(|c| code == *c)
        })
        .unwrap_or(false)
}

fn status_is(report: &ErrorReport, candidates: &[u16]) -> bool {
    report
        .status
        .map(|status| candidates.contains(&status))
        .unwrap_or(false)
}

fn with_detail(base: &str, report: &ErrorReport) -> String {
    match &report.user_message {
        Some(message) if !message.trim().is_empty() => {
            format!("{base} ({})", message.trim())
        }
        _ => base.to_string(),
    }
}

/// Classify a transport failure. Deterministic: the same report always
/// resolves to the same branch.
pub fn classify(report: &ErrorReport) -> ErrorPresentation {
    // Rule 1: authentication / permission.
    if status_is(report, &[401, 403]) || code_is(report, &["auth", "permission"]) {
        return ErrorPresentation {
            class: ErrorClass::Auth,
            display_text: with_detail(
                "Authentication failed. Check the API key for this provider.",
                report,
            ),
            show_retry: false,
            show_key_editor: true,
        };
    }

    // Rule 2: rate limiting.
    if code_is(report, &["rate_limit", "rate_limit_exceeded"]) || status_is(report, &[429]) {
        return ErrorPresentation {
            class: ErrorClass::RateLimited,
            display_text: with_detail("Rate limited by the provider. Try again shortly.", report),
            show_retry: true,
            show_key_editor: false,
        };
    }

    // Rule 3: timeouts.
    if code_is(report, &["timeout"]) {
        return ErrorPresentation {
            class: ErrorClass::Timeout,
            display_text: with_detail("The request timed out.", report),
            show_retry: true,
            show_key_editor: false,
        };
    }

    // Rule 4: cancellation. Terminal, not retryable.
    if code_is(report, &["aborted", "cancelled"]) {
        let reason = CancelReason::from_detail(report.detail.as_deref());
        return ErrorPresentation {
            class: ErrorClass::Cancelled(reason),
            display_text: reason.display_text().to_string(),
            show_retry: false,
            show_key_editor: false,
        };
    }

    // Rule 5: server-side failures.
    if report.status.map(|s| s >= 500).unwrap_or(false) || code_is(report, &["http_5xx", "server"])
    {
        return ErrorPresentation {
            class: ErrorClass::Server,
            display_text: with_detail("The provider reported a server error.", report),
            show_retry: true,
            show_key_editor: false,
        };
    }

    // Rule 6: network failures.
    if code_is(report, &["network"]) {
        return ErrorPresentation {
            class: ErrorClass::Network,
            display_text: with_detail("Network error while contacting the provider.", report),
            show_retry: true,
            show_key_editor: false,
        };
    }

    // Rule 7: any other client error.
    if report.status.map(|s| s >= 400).unwrap_or(false) {
        return ErrorPresentation {
            class: ErrorClass::InvalidRequest,
            display_text: with_detail("The provider rejected the request.", report),
            show_retry: false,
            show_key_editor: true,
        };
    }

    // Rule 8: everything else.
    ErrorPresentation {
        class: ErrorClass::Unknown,
        display_text: with_detail("Something went wrong while generating a response.", report),
        show_retry: false,
        show_key_editor: false,
    }
}
