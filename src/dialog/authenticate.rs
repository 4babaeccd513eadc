use crate::transaction::key::TransactionKey;
use crate::transaction::transaction::Transaction;
use crate::transaction::{make_via_branch, random_text, CNONCE_LEN};
use crate::Result;
use rsip::headers::auth::AuthQop;
use rsip::prelude::{HasHeaders, HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::services::DigestGenerator;
use rsip::typed::{Authorization, ProxyAuthorization};
use rsip::{Header, Param, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

struct CachedChallenge {
    nonce: String,
    nc: u32,
}

/// Per-account digest state. The nc counter increments per
/// (realm, nonce) pair; a fresh nonce (e.g. after `stale=true`) resets
/// it. The cache outlives registrations so re-registering reuses the
/// counter rather than replaying nc=1.
#[derive(Default)]
pub struct AuthCache {
    entries: Mutex<HashMap<String, CachedChallenge>>,
}

impl AuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next nonce-count for the given challenge.
    pub fn next_nc(&self, realm: &str, nonce: &str) -> u32 {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(realm) {
            Some(cached) if cached.nonce == nonce => {
                cached.nc += 1;
                cached.nc
            }
            _ => {
                entries.insert(
                    realm.to_string(),
                    CachedChallenge {
                        nonce: nonce.to_string(),
                        nc: 1,
                    },
                );
                1
            }
        }
    }
}

fn challenge_from_response(resp: &Response) -> Result<rsip::typed::WwwAuthenticate> {
    if let Some(h) = resp.www_authenticate_header() {
        return h.typed().map_err(Into::into);
    }
    for header in resp.headers().iter() {
        if let Header::ProxyAuthenticate(h) = header {
            // same grammar as WWW-Authenticate
            return rsip::headers::WwwAuthenticate::from(h.value().to_string())
                .typed()
                .map_err(Into::into);
        }
    }
    Err(crate::Error::Error(
        "challenge response without authenticate header".to_string(),
    ))
}

/// Build the authenticated retry for a 401/407: fresh branch, bumped
/// CSeq, digest response computed over the original method and URI.
/// Callers enforce the retry-once rule.
pub fn handle_client_authenticate(
    new_seq: u32,
    tx: &Transaction,
    resp: Response,
    cred: &Credential,
    cache: &AuthCache,
) -> Result<Transaction> {
    let challenge = challenge_from_response(&resp)?;
    let is_proxy = resp.status_code == StatusCode::ProxyAuthenticationRequired;

    let mut new_req = tx.original.clone();
    new_req.cseq_header_mut()?.mut_seq(new_seq)?;

    let nc = cache.next_nc(challenge.realm.as_str(), challenge.nonce.as_str());
    let auth_qop = challenge.qop.as_ref().map(|_| AuthQop::Auth {
        cnonce: random_text(CNONCE_LEN),
        nc: nc as u8,
    });

    let generator = DigestGenerator {
        username: cred.username.as_str(),
        password: cred.password.as_str(),
        algorithm: challenge.algorithm.unwrap_or_default(),
        nonce: challenge.nonce.as_str(),
        method: &tx.original.method,
        qop: auth_qop.as_ref(),
        uri: &tx.original.uri,
        realm: challenge.realm.as_str(),
    };

    let auth = Authorization {
        scheme: challenge.scheme,
        username: cred.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: tx.original.uri.clone(),
        response: generator.compute(),
        algorithm: challenge.algorithm,
        opaque: challenge.opaque,
        qop: auth_qop,
    };

    // retire the old branch so the retry is its own transaction
    if let Ok(via) = new_req.via_header()?.typed() {
        let mut via = via;
        via.params.retain(|p| !matches!(p, Param::Branch(_)));
        via.params.push(make_via_branch());
        new_req.headers_mut().unique_push(Header::Via(via.into()));
    }

    new_req.headers_mut().retain(|h| {
        !matches!(
            h,
            Header::Authorization(_) | Header::ProxyAuthorization(_)
        )
    });
    if is_proxy {
        new_req
            .headers_mut()
            .unique_push(ProxyAuthorization(auth).into());
    } else {
        new_req.headers_mut().unique_push(auth.into());
    }

    debug!(nc, realm = %challenge.realm, "retrying request with digest credentials");

    let key = TransactionKey::from_request(&new_req)?;
    let mut new_tx =
        Transaction::new_client(key, new_req, tx.endpoint_inner.clone(), tx.connection.clone());
    new_tx.destination = tx.destination.clone();
    Ok(new_tx)
}
