//! The media engine owns SDP; this module only peeks at the few lines
//! the signaling core needs: the connection address for diagnostics and
//! the direction attribute for hold handling. Everything else passes
//! through verbatim.

/// Media flow direction, as carried in `a=` attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_attr(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    fn from_attr(attr: &str) -> Option<Self> {
        match attr {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }

    /// A peer sending `sendonly` or `inactive` has put us on hold.
    pub fn is_hold(&self) -> bool {
        matches!(self, MediaDirection::SendOnly | MediaDirection::Inactive)
    }
}

fn lines(sdp: &str) -> impl Iterator<Item = &str> {
    sdp.split('\n').map(|l| l.trim_end_matches('\r'))
}

/// First direction attribute found, session level or media level.
/// Absence means sendrecv per RFC 3264.
pub fn direction(sdp: &str) -> MediaDirection {
    for line in lines(sdp) {
        if let Some(attr) = line.strip_prefix("a=") {
            if let Some(dir) = MediaDirection::from_attr(attr.trim()) {
                return dir;
            }
        }
    }
    MediaDirection::SendRecv
}

/// Connection address from the first `c=` line, for diagnostics only.
pub fn connection_address(sdp: &str) -> Option<String> {
    for line in lines(sdp) {
        if let Some(value) = line.strip_prefix("c=") {
            return value.split_whitespace().nth(2).map(|s| s.to_string());
        }
    }
    None
}

/// Rewrite every direction attribute to `dir`, appending one at the end
/// when the offer carried none. The rest of the SDP is preserved
/// byte-for-byte.
pub fn with_direction(sdp: &str, dir: MediaDirection) -> String {
    let mut out = String::with_capacity(sdp.len() + 16);
    let mut rewrote = false;
    for line in sdp.split_inclusive('\n') {
        let bare = line.trim_end_matches(['\r', '\n']);
        let is_direction = bare
            .strip_prefix("a=")
            .and_then(|attr| MediaDirection::from_attr(attr.trim()))
            .is_some();
        if is_direction {
            out.push_str("a=");
            out.push_str(dir.as_attr());
            out.push_str("\r\n");
            rewrote = true;
        } else {
            out.push_str(line);
        }
    }
    if !rewrote {
        if !out.ends_with('\n') && !out.is_empty() {
            out.push_str("\r\n");
        }
        out.push_str("a=");
        out.push_str(dir.as_attr());
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\r\n\
        o=- 46742 46742 IN IP4 192.0.2.10\r\n\
        s=-\r\n\
        c=IN IP4 192.0.2.10\r\n\
        t=0 0\r\n\
        m=audio 49170 RTP/AVP 0\r\n\
        a=sendrecv\r\n";

    #[test]
    fn test_direction_defaults_to_sendrecv() {
        assert_eq!(direction("v=0\r\n"), MediaDirection::SendRecv);
        assert_eq!(
            direction("v=0\r\na=sendonly\r\n"),
            MediaDirection::SendOnly
        );
        assert!(MediaDirection::Inactive.is_hold());
        assert!(!MediaDirection::RecvOnly.is_hold());
    }

    #[test]
    fn test_connection_address() {
        assert_eq!(connection_address(OFFER).as_deref(), Some("192.0.2.10"));
        assert_eq!(connection_address("v=0\r\n"), None);
    }

    #[test]
    fn test_with_direction_rewrites_in_place() {
        let held = with_direction(OFFER, MediaDirection::SendOnly);
        assert!(held.contains("a=sendonly\r\n"));
        assert!(!held.contains("a=sendrecv"));
        // everything else untouched
        assert!(held.contains("m=audio 49170 RTP/AVP 0\r\n"));

        let resumed = with_direction(&held, MediaDirection::SendRecv);
        assert_eq!(resumed, OFFER);
    }

    #[test]
    fn test_with_direction_appends_when_absent() {
        let sdp = "v=0\r\nm=audio 49170 RTP/AVP 0\r\n";
        let held = with_direction(sdp, MediaDirection::Inactive);
        assert!(held.ends_with("a=inactive\r\n"));
        assert_eq!(direction(&held), MediaDirection::Inactive);
    }
}
