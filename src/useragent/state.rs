use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Detailed call lifecycle. `Ended` and `Error` are terminal; everything
/// between `OutgoingProgress` and `Ending` counts as an active call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    OutgoingInit,
    OutgoingProgress,
    OutgoingRinging,
    IncomingReceived,
    Connected,
    StreamsRunning,
    Pausing,
    Paused,
    Resuming,
    Ending,
    Ended,
    Error,
}

impl CallState {
    pub fn is_call_active(&self) -> bool {
        matches!(
            self,
            CallState::OutgoingProgress
                | CallState::OutgoingRinging
                | CallState::IncomingReceived
                | CallState::Connected
                | CallState::StreamsRunning
                | CallState::Pausing
                | CallState::Paused
                | CallState::Resuming
                | CallState::Ending
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Error)
    }

    /// States in which queued DTMF digits may drain.
    pub fn can_send_dtmf(&self) -> bool {
        matches!(self, CallState::Connected | CallState::StreamsRunning)
    }

    /// The transition graph. Anything not listed here is a bug in the
    /// caller and is rejected.
    pub fn can_transition_to(&self, to: CallState) -> bool {
        use CallState::*;
        matches!(
            (*self, to),
            (Idle, OutgoingInit)
                | (Idle, IncomingReceived)
                | (OutgoingInit, OutgoingProgress)
                | (OutgoingInit, OutgoingRinging)
                | (OutgoingInit, Connected)
                | (OutgoingInit, Ending)
                | (OutgoingInit, Error)
                | (OutgoingProgress, OutgoingRinging)
                | (OutgoingProgress, Connected)
                | (OutgoingProgress, Ending)
                | (OutgoingProgress, Error)
                | (OutgoingRinging, Connected)
                | (OutgoingRinging, Ending)
                | (OutgoingRinging, Error)
                | (IncomingReceived, Connected)
                | (IncomingReceived, Ending)
                | (IncomingReceived, Error)
                | (Connected, StreamsRunning)
                | (Connected, Pausing)
                | (Connected, Ending)
                | (Connected, Error)
                | (StreamsRunning, Pausing)
                | (StreamsRunning, Ending)
                | (StreamsRunning, Error)
                | (Pausing, Paused)
                | (Pausing, Ending)
                | (Pausing, Error)
                | (Paused, Resuming)
                | (Paused, Ending)
                | (Paused, Error)
                | (Resuming, StreamsRunning)
                | (Resuming, Ending)
                | (Resuming, Error)
                | (Ending, Ended)
                | (Ending, Error)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Idle => "IDLE",
            CallState::OutgoingInit => "OUTGOING_INIT",
            CallState::OutgoingProgress => "OUTGOING_PROGRESS",
            CallState::OutgoingRinging => "OUTGOING_RINGING",
            CallState::IncomingReceived => "INCOMING_RECEIVED",
            CallState::Connected => "CONNECTED",
            CallState::StreamsRunning => "STREAMS_RUNNING",
            CallState::Pausing => "PAUSING",
            CallState::Paused => "PAUSED",
            CallState::Resuming => "RESUMING",
            CallState::Ending => "ENDING",
            CallState::Ended => "ENDED",
            CallState::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

/// Local-hold bookkeeping: unknown until the first hold/resume round
/// settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldState {
    Unknown,
    LocalHold,
    NotOnHold,
}

/// Why a call failed or ended, distilled from SIP codes and transport
/// events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallErrorReason {
    None,
    Busy,
    Declined,
    NotFound,
    TemporarilyUnavailable,
    RequestTimeout,
    Forbidden,
    ServerError,
    ServiceUnavailable,
    NetworkError,
    AuthenticationFailed,
    IncompatibleMedia,
    CancelledLocal,
    NormalTermination,
    Unknown,
}

impl CallErrorReason {
    /// Classify a final SIP status. Unlisted codes fall back by class:
    /// 4xx declined-family, 5xx server error, 6xx busy-family.
    pub fn from_status(status: &rsip::StatusCode) -> Self {
        match status.code() {
            486 | 600 => CallErrorReason::Busy,
            603 => CallErrorReason::Declined,
            404 => CallErrorReason::NotFound,
            480 => CallErrorReason::TemporarilyUnavailable,
            408 => CallErrorReason::RequestTimeout,
            403 => CallErrorReason::Forbidden,
            503 => CallErrorReason::ServiceUnavailable,
            401 | 407 => CallErrorReason::AuthenticationFailed,
            488 => CallErrorReason::IncompatibleMedia,
            487 => CallErrorReason::CancelledLocal,
            code if (500..600).contains(&code) => CallErrorReason::ServerError,
            code if (600..700).contains(&code) => CallErrorReason::Busy,
            code if (400..500).contains(&code) => CallErrorReason::Declined,
            _ => CallErrorReason::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CallErrorReason::None => "no error",
            CallErrorReason::Busy => "the remote party is busy",
            CallErrorReason::Declined => "the call was declined",
            CallErrorReason::NotFound => "the destination was not found",
            CallErrorReason::TemporarilyUnavailable => "the destination is temporarily unavailable",
            CallErrorReason::RequestTimeout => "the request timed out",
            CallErrorReason::Forbidden => "the request was forbidden",
            CallErrorReason::ServerError => "the server failed to process the request",
            CallErrorReason::ServiceUnavailable => "the service is unavailable",
            CallErrorReason::NetworkError => "the network connection was lost",
            CallErrorReason::AuthenticationFailed => "authentication failed",
            CallErrorReason::IncompatibleMedia => "the media offer was not acceptable",
            CallErrorReason::CancelledLocal => "the call was cancelled",
            CallErrorReason::NormalTermination => "the call ended normally",
            CallErrorReason::Unknown => "unknown error",
        }
    }
}

impl std::fmt::Display for CallErrorReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallErrorReason::None => "NONE",
            CallErrorReason::Busy => "BUSY",
            CallErrorReason::Declined => "DECLINED",
            CallErrorReason::NotFound => "NOT_FOUND",
            CallErrorReason::TemporarilyUnavailable => "TEMPORARILY_UNAVAILABLE",
            CallErrorReason::RequestTimeout => "REQUEST_TIMEOUT",
            CallErrorReason::Forbidden => "FORBIDDEN",
            CallErrorReason::ServerError => "SERVER_ERROR",
            CallErrorReason::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            CallErrorReason::NetworkError => "NETWORK_ERROR",
            CallErrorReason::AuthenticationFailed => "AUTHENTICATION_FAILED",
            CallErrorReason::IncompatibleMedia => "INCOMPATIBLE_MEDIA",
            CallErrorReason::CancelledLocal => "CANCELLED_LOCAL",
            CallErrorReason::NormalTermination => "NORMAL_TERMINATION",
            CallErrorReason::Unknown => "UNKNOWN",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Missed,
    Declined,
    Aborted,
}

/// Immutable call snapshot, swapped whole through the observable so
/// readers always see a consistent record.
#[derive(Debug, Clone)]
pub struct CallStateInfo {
    pub call_id: String,
    pub direction: CallDirection,
    pub state: CallState,
    pub remote_uri: String,
    pub remote_display_name: Option<String>,
    pub hold: HoldState,
    pub error_reason: CallErrorReason,
    pub last_sip_code: Option<u16>,
    pub last_sip_phrase: Option<String>,
    /// Epoch milliseconds at call creation.
    pub start_time_ms: u64,
    pub streams_started_at: Option<Instant>,
    pub ended_at: Option<Instant>,
    /// Monotonic stamp of the last transition.
    pub changed_at: Instant,
}

impl CallStateInfo {
    pub fn idle() -> Self {
        CallStateInfo {
            call_id: String::new(),
            direction: CallDirection::Outgoing,
            state: CallState::Idle,
            remote_uri: String::new(),
            remote_display_name: None,
            hold: HoldState::Unknown,
            error_reason: CallErrorReason::None,
            last_sip_code: None,
            last_sip_phrase: None,
            start_time_ms: 0,
            streams_started_at: None,
            ended_at: None,
            changed_at: Instant::now(),
        }
    }

    /// Wall-clock time spent with streams running, frozen at call end.
    pub fn duration(&self) -> Duration {
        match (self.streams_started_at, self.ended_at) {
            (Some(started), Some(ended)) => ended.saturating_duration_since(started),
            (Some(started), None) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// One immutable call-log record, emitted when a call reaches a terminal
/// state.
#[derive(Debug, Clone)]
pub struct CallLogEntry {
    pub id: String,
    pub direction: CallDirection,
    pub to: String,
    pub from: String,
    pub contact: String,
    pub start_time_ms: u64,
    pub duration_secs: u64,
    pub outcome: CallOutcome,
    pub local_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_set_matches_lifecycle() {
        assert!(!CallState::Idle.is_call_active());
        assert!(!CallState::OutgoingInit.is_call_active());
        assert!(CallState::OutgoingProgress.is_call_active());
        assert!(CallState::Ending.is_call_active());
        assert!(!CallState::Ended.is_call_active());
        assert!(CallState::Ended.is_terminal());
        assert!(CallState::Error.is_terminal());
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        use CallState::*;
        for to in [
            Idle,
            OutgoingInit,
            OutgoingProgress,
            OutgoingRinging,
            IncomingReceived,
            Connected,
            StreamsRunning,
            Pausing,
            Paused,
            Resuming,
            Ending,
            Ended,
            Error,
        ] {
            assert!(!Ended.can_transition_to(to), "ENDED -> {} allowed", to);
            assert!(!Error.can_transition_to(to), "ERROR -> {} allowed", to);
        }
    }

    #[test]
    fn test_happy_path_edges_exist() {
        use CallState::*;
        let path = [
            Idle,
            OutgoingInit,
            OutgoingProgress,
            OutgoingRinging,
            Connected,
            StreamsRunning,
            Pausing,
            Paused,
            Resuming,
            StreamsRunning,
            Ending,
            Ended,
        ];
        for pair in path.windows(2) {
            assert!(
                pair[0].can_transition_to(pair[1]),
                "{} -> {} missing",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_unlisted_edges_are_rejected() {
        use CallState::*;
        assert!(!Idle.can_transition_to(Connected));
        assert!(!StreamsRunning.can_transition_to(OutgoingRinging));
        assert!(!Paused.can_transition_to(StreamsRunning));
        assert!(!Ending.can_transition_to(Connected));
    }

    #[test]
    fn test_status_classification() {
        use rsip::StatusCode;
        assert_eq!(
            CallErrorReason::from_status(&StatusCode::BusyHere),
            CallErrorReason::Busy
        );
        assert_eq!(
            CallErrorReason::from_status(&StatusCode::Decline),
            CallErrorReason::Declined
        );
        assert_eq!(
            CallErrorReason::from_status(&StatusCode::RequestTerminated),
            CallErrorReason::CancelledLocal
        );
        // unlisted codes classify by class
        assert_eq!(
            CallErrorReason::from_status(&StatusCode::try_from(599u16).expect("code")),
            CallErrorReason::ServerError
        );
        assert_eq!(
            CallErrorReason::from_status(&StatusCode::try_from(489u16).expect("code")),
            CallErrorReason::Declined
        );
    }
}
