use std::sync::Arc;

use rsip::{
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    Header, Method, Response, SipMessage, StatusCode,
};
use tracing::{debug, info};

use super::authenticate::{handle_client_authenticate, AuthCache, Credential};
use crate::transaction::{endpoint::EndpointInnerRef, make_call_id, make_tag};
use crate::transport::SipAddr;
use crate::Result;

/// Drives a single REGISTER round for one account: build the request,
/// answer at most one digest challenge, hand back the final response.
/// The from-tag and CSeq survive across rounds so refreshes stay within
/// one registration "dialog" as far as the registrar is concerned.
pub struct Registration {
    pub last_seq: u32,
    pub from_tag: rsip::param::Tag,
    pub endpoint: EndpointInnerRef,
    pub credential: Option<Credential>,
    pub auth_cache: Arc<AuthCache>,
}

impl Registration {
    pub fn new(
        endpoint: EndpointInnerRef,
        credential: Option<Credential>,
        auth_cache: Arc<AuthCache>,
    ) -> Self {
        Self {
            last_seq: 0,
            from_tag: make_tag(),
            endpoint,
            credential,
            auth_cache,
        }
    }

    /// One REGISTER round. `expires` of zero clears the binding.
    pub async fn register(
        &mut self,
        aor: &rsip::Uri,
        contact: rsip::typed::Contact,
        edge: &SipAddr,
        expires: u32,
    ) -> Result<Response> {
        self.last_seq += 1;

        let domain = aor.host_with_port.host.to_string();
        let recipient = rsip::Uri {
            scheme: aor.scheme.clone(),
            host_with_port: aor.host_with_port.clone(),
            ..Default::default()
        };

        let to = rsip::typed::To {
            display_name: None,
            uri: aor.clone(),
            params: vec![],
        };
        let from = rsip::typed::From {
            display_name: None,
            uri: aor.clone(),
            params: vec![],
        }
        .with_tag(self.from_tag.clone());

        let via = self.endpoint.get_via(Some(edge.clone()))?;
        let mut request = self.endpoint.make_request(
            Method::Register,
            recipient,
            via,
            from,
            to,
            make_call_id(&domain),
            self.last_seq,
        );
        request.headers.unique_push(contact.into());
        request
            .headers
            .unique_push(Header::Expires(expires.to_string().into()));
        request
            .headers
            .unique_push(Header::ContentLength(0.into()));

        let key = crate::transaction::key::TransactionKey::from_request(&request)?;
        let mut tx = crate::transaction::transaction::Transaction::new_client(
            key,
            request,
            self.endpoint.clone(),
            None,
        );
        tx.destination = Some(edge.clone());
        tx.send().await?;

        let mut auth_sent = false;
        while let Some(msg) = tx.receive().await {
            match msg {
                SipMessage::Response(resp) => match resp.status_code {
                    StatusCode::Trying => continue,
                    StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                        if auth_sent {
                            info!("challenge repeated after credentials sent: {}", resp.status_code);
                            return Ok(resp);
                        }
                        match &self.credential {
                            Some(cred) => {
                                self.last_seq += 1;
                                tx = handle_client_authenticate(
                                    self.last_seq,
                                    &tx,
                                    resp,
                                    cred,
                                    &self.auth_cache,
                                )?;
                                tx.send().await?;
                                auth_sent = true;
                                continue;
                            }
                            None => {
                                info!("challenge received without credentials");
                                return Ok(resp);
                            }
                        }
                    }
                    _ => {
                        debug!("registration round done: {}", resp.status_code);
                        return Ok(resp);
                    }
                },
                _ => break,
            }
        }
        Err(crate::Error::RegistrationError(
            "registration transaction terminated without a final response".to_string(),
        ))
    }
}

/// Expiry the server actually granted: Contact expires parameter first,
/// then the Expires header, then what we asked for.
pub fn granted_expires(resp: &Response, fallback: u32) -> u32 {
    if let Ok(contact) = resp.contact_header() {
        if let Ok(typed) = contact.typed() {
            if let Some(expires) = typed.expires() {
                if let Ok(seconds) = expires.seconds() {
                    return seconds;
                }
            }
        }
    }
    for header in resp.headers.iter() {
        if let Header::Expires(e) = header {
            if let Ok(seconds) = e.value().trim().parse() {
                return seconds;
            }
        }
    }
    fallback
}
