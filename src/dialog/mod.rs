use crate::{Error, Result};
use rsip::prelude::{HeadersExt, UntypedHeader};

pub mod authenticate;
pub mod dialog;
pub mod registration;

#[cfg(test)]
mod tests;

/// Identifies a dialog per RFC 3261: Call-ID plus the two tags. The
/// to-tag is empty while the dialog is still early.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: String,
    pub from_tag: String,
    pub to_tag: String,
}

impl TryFrom<&rsip::Request> for DialogId {
    type Error = crate::Error;

    fn try_from(request: &rsip::Request) -> Result<Self> {
        let call_id = request.call_id_header()?.value().to_string();
        let from_tag = match request.from_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => return Err(Error::Error("from tag not found".to_string())),
        };
        let to_tag = match request.to_header()?.tag()? {
            Some(tag) => tag.value().to_string(),
            None => String::new(),
        };
        Ok(DialogId {
            call_id,
            from_tag,
            to_tag,
        })
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.from_tag, self.to_tag)
    }
}

/// Pull the URI out of a Contact header value, tolerating display names
/// and parameters outside the angle brackets.
pub(crate) fn extract_uri_from_contact(value: &str) -> Result<rsip::Uri> {
    let value = value.trim();
    let raw = match (value.find('<'), value.find('>')) {
        (Some(start), Some(end)) if start < end => &value[start + 1..end],
        _ => value.split(';').next().unwrap_or(value),
    };
    rsip::Uri::try_from(raw).map_err(Into::into)
}

#[cfg(test)]
mod contact_tests {
    use super::extract_uri_from_contact;

    #[test]
    fn test_extract_uri_from_contact() {
        let uri = extract_uri_from_contact("\"Bob\" <sip:bob@ex.test:5060;transport=tcp>;expires=60")
            .expect("uri");
        assert_eq!(uri.host_with_port.to_string(), "ex.test:5060");

        let uri = extract_uri_from_contact("sip:bob@ex.test;expires=60").expect("uri");
        assert_eq!(uri.user(), Some("bob"));
    }
}
