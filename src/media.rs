use crate::Result;
use std::time::Duration;

/// Whether an SDP string is an offer or the answer to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Connection state of the media plane, mirrored from the peer
/// connection underneath.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Events the embedder forwards from its media engine into
/// [`crate::UserAgent::media_event`].
#[derive(Debug, Clone)]
pub enum MediaEvent {
    ConnectionState(MediaConnectionState),
    RemoteTrackAdded,
}

/// Contract the signaling core expects from the external media engine.
/// SDP strings cross this boundary verbatim; the core never interprets
/// them beyond the direction attribute.
#[async_trait::async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_offer(&self) -> Result<String>;

    async fn create_answer(&self, remote_sdp: &str) -> Result<String>;

    async fn set_remote_description(&self, sdp: &str, kind: SdpKind) -> Result<()>;

    async fn set_audio_enabled(&self, enabled: bool);

    async fn set_muted(&self, muted: bool);

    /// Insert an in-band RTP telephone-event (RFC 2833) for the digit.
    async fn send_dtmf(&self, digit: char, duration: Duration) -> Result<()>;

    async fn dispose(&self);
}

/// Media engine that produces a static offer/answer and swallows
/// everything else. Used by tests and by signaling-only embedders.
#[derive(Default)]
pub struct NullMediaEngine;

#[async_trait::async_trait]
impl MediaEngine for NullMediaEngine {
    async fn create_offer(&self) -> Result<String> {
        Ok("v=0\r\n\
            o=- 0 0 IN IP4 127.0.0.1\r\n\
            s=-\r\n\
            c=IN IP4 127.0.0.1\r\n\
            t=0 0\r\n\
            m=audio 4000 RTP/AVP 0\r\n\
            a=sendrecv\r\n"
            .to_string())
    }

    async fn create_answer(&self, _remote_sdp: &str) -> Result<String> {
        Ok("v=0\r\n\
            o=- 1 1 IN IP4 127.0.0.1\r\n\
            s=-\r\n\
            c=IN IP4 127.0.0.1\r\n\
            t=0 0\r\n\
            m=audio 4002 RTP/AVP 0\r\n\
            a=sendrecv\r\n"
            .to_string())
    }

    async fn set_remote_description(&self, _sdp: &str, _kind: SdpKind) -> Result<()> {
        Ok(())
    }

    async fn set_audio_enabled(&self, _enabled: bool) {}

    async fn set_muted(&self, _muted: bool) {}

    async fn send_dtmf(&self, _digit: char, _duration: Duration) -> Result<()> {
        Ok(())
    }

    async fn dispose(&self) {}
}
