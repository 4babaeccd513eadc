use crate::transport::connection::{KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE};
use crate::Result;
use bytes::{Buf, BytesMut};
use rsip::SipMessage;
use tokio_util::codec::{Decoder, Encoder};

const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Frames SIP messages on a reliable byte stream. A frame is the header
/// section up to the blank line plus `Content-Length` body octets; bare
/// CRLF pairs are keepalive frames and surface as `Error::Keepalive` so
/// the reader can pong them without involving the parser.
pub struct SipCodec {
    max_size: usize,
}

impl SipCodec {
    pub fn new() -> Self {
        Self {
            max_size: MAX_SIP_MESSAGE_SIZE,
        }
    }
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Content-Length of the header section, if present and well-formed.
fn content_length(headers: &str) -> Option<usize> {
    for line in headers.split("\r\n") {
        let (name, value) = match line.split_once(':') {
            Some(pair) => pair,
            None => continue,
        };
        let name = name.trim();
        if name.eq_ignore_ascii_case("Content-Length") || name == "l" {
            return value.trim().parse().ok();
        }
    }
    None
}

impl Decoder for SipCodec {
    type Item = SipMessage;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() >= 4 && &src[0..4] == KEEPALIVE_REQUEST {
            src.advance(4);
            return Err(crate::Error::Keepalive);
        }

        if src.len() >= 2 && &src[0..2] == KEEPALIVE_RESPONSE {
            src.advance(2);
            return Err(crate::Error::Keepalive);
        }

        let data = match std::str::from_utf8(&src[..]) {
            Ok(s) => s,
            Err(_) => {
                if src.len() > self.max_size {
                    src.clear();
                    return Err(crate::Error::Error("SIP message too large".to_string()));
                }
                return Ok(None);
            }
        };

        let header_end = match data.find("\r\n\r\n") {
            Some(pos) => pos + 4,
            None => {
                if src.len() > self.max_size {
                    src.clear();
                    return Err(crate::Error::Error("SIP message too large".to_string()));
                }
                return Ok(None);
            }
        };

        let body_len = content_length(&data[..header_end]).unwrap_or(0);
        let frame_len = header_end + body_len;
        if frame_len > self.max_size {
            src.clear();
            return Err(crate::Error::Error("SIP message too large".to_string()));
        }
        if src.len() < frame_len {
            return Ok(None);
        }

        match SipMessage::try_from(&data[..frame_len]) {
            Ok(msg) => {
                src.advance(frame_len);
                Ok(Some(msg))
            }
            Err(e) => {
                // Skip past the broken frame so one bad message cannot
                // wedge the connection.
                src.advance(frame_len);
                Err(crate::Error::Error(format!(
                    "failed to parse SIP message: {}",
                    e
                )))
            }
        }
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        let data = item.to_string();
        dst.extend_from_slice(data.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INVITE: &str = "INVITE sip:bob@ex.test SIP/2.0\r\n\
        Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bKtest\r\n\
        From: <sip:alice@ex.test>;tag=abc\r\n\
        To: <sip:bob@ex.test>\r\n\
        Call-ID: codec-test\r\n\
        CSeq: 1 INVITE\r\n\
        Content-Length: 5\r\n\
        \r\n\
        v=0\r\n";

    #[test]
    fn decode_waits_for_full_body() {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::from(&INVITE.as_bytes()[..INVITE.len() - 2]);
        assert!(matches!(codec.decode(&mut buf), Ok(None)));

        buf.extend_from_slice(b"\r\n");
        let msg = codec.decode(&mut buf).expect("decode").expect("message");
        assert!(matches!(msg, SipMessage::Request(_)));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_round_trips_verbatim() {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::from(INVITE.as_bytes());
        let msg = codec.decode(&mut buf).expect("decode").expect("message");
        assert_eq!(msg.to_string(), INVITE);
    }

    #[test]
    fn keepalive_frames_are_flagged() {
        let mut codec = SipCodec::new();
        let mut buf = BytesMut::from(&b"\r\n\r\n"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(crate::Error::Keepalive)
        ));
        assert!(buf.is_empty());
    }
}
