use crate::Result;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionRole {
    Client,
    Server,
}

/// Matches responses and retransmissions to their transaction: Via
/// branch plus CSeq (method, number) plus Call-ID. ACKs are keyed as
/// INVITE so an ACK to a non-2xx final lands on the INVITE server
/// transaction that is waiting for it; an ACK to a 2xx carries a fresh
/// branch and matches nothing here by design of RFC 3261.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionKey {
    pub branch: String,
    pub method: rsip::Method,
    pub cseq: u32,
    pub call_id: String,
}

impl Hash for TransactionKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.branch.hash(state);
        self.method.to_string().hash(state);
        self.cseq.hash(state);
        self.call_id.hash(state);
    }
}

impl std::fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}/{} ({})",
            self.call_id, self.method, self.cseq, self.branch
        )
    }
}

fn normalize_method(method: &rsip::Method) -> rsip::Method {
    match method {
        rsip::Method::Ack => rsip::Method::Invite,
        other => other.clone(),
    }
}

impl TransactionKey {
    pub fn from_request(req: &rsip::Request) -> Result<Self> {
        let via = req.via_header()?.typed()?;
        let branch = via
            .branch()
            .ok_or_else(|| crate::Error::Error("via branch missing".to_string()))?
            .to_string();
        Ok(TransactionKey {
            branch,
            method: normalize_method(&req.method),
            cseq: req.cseq_header()?.seq()?,
            call_id: req.call_id_header()?.value().to_string(),
        })
    }

    pub fn from_response(resp: &rsip::Response) -> Result<Self> {
        let via = resp.via_header()?.typed()?;
        let branch = via
            .branch()
            .ok_or_else(|| crate::Error::Error("via branch missing".to_string()))?
            .to_string();
        let cseq = resp.cseq_header()?;
        Ok(TransactionKey {
            branch,
            method: normalize_method(&cseq.method()?),
            cseq: cseq.seq()?,
            call_id: resp.call_id_header()?.value().to_string(),
        })
    }
}
