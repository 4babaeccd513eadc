use super::{
    authenticate::{handle_client_authenticate, AuthCache, Credential},
    extract_uri_from_contact, DialogId,
};
use crate::transaction::{
    endpoint::EndpointInnerRef,
    key::{TransactionKey, TransactionRole},
    transaction::Transaction,
};
use crate::transport::SipAddr;
use crate::Result;
use rsip::{
    headers::Route,
    message::HasHeaders,
    prelude::{HeadersExt, ToTypedHeader, UntypedHeader},
    typed::{CSeq, Contact},
    Header, Method, Param, Request, Response, SipMessage, StatusCode, StatusCodeKind,
};
use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dialog bookkeeping shared by both call directions: stable local tag,
/// learned remote tag, per-direction CSeq counters, the route set and
/// remote target, and the INVITE that created it (kept verbatim for
/// CANCEL and ACK construction).
pub struct DialogInner {
    pub role: TransactionRole,
    pub cancel_token: CancellationToken,
    pub id: Mutex<DialogId>,

    pub local_seq: AtomicU32,
    pub remote_seq: AtomicU32,

    pub from: rsip::typed::From,
    pub to: Mutex<rsip::typed::To>,

    pub local_contact: Option<rsip::Uri>,
    pub remote_uri: Mutex<rsip::Uri>,
    pub remote_contact: Mutex<Option<rsip::headers::Contact>>,

    pub credential: Option<Credential>,
    pub auth_cache: Arc<AuthCache>,
    pub route_set: Mutex<Vec<Route>>,

    /// The signaling edge this dialog's requests are sent to.
    pub destination: SipAddr,

    pub(crate) endpoint: EndpointInnerRef,
    pub(crate) initial_request: Request,
}

pub type DialogInnerRef = Arc<DialogInner>;

impl DialogInner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: TransactionRole,
        id: DialogId,
        initial_request: Request,
        endpoint: EndpointInnerRef,
        credential: Option<Credential>,
        auth_cache: Arc<AuthCache>,
        local_contact: Option<rsip::Uri>,
        destination: SipAddr,
    ) -> Result<Self> {
        let cseq = initial_request.cseq_header()?.seq()?;

        let remote_uri = match role {
            TransactionRole::Client => initial_request.uri.clone(),
            TransactionRole::Server => {
                extract_uri_from_contact(initial_request.contact_header()?.value())?
            }
        };

        let from = initial_request.from_header()?.typed()?;
        let mut to = initial_request.to_header()?.typed()?;
        if role == TransactionRole::Server
            && !to.params.iter().any(|p| matches!(p, Param::Tag(_)))
        {
            to = to.with_tag(id.to_tag.clone().into());
        }

        // UAS route set comes from the INVITE as-is; the UAC learns its
        // (reversed) route set from the dialog-creating response
        let mut route_set = vec![];
        if role == TransactionRole::Server {
            for h in initial_request.headers.iter() {
                if let Header::RecordRoute(rr) = h {
                    route_set.push(Route::from(rr.value().to_string()));
                }
            }
        }

        let (local_seq, remote_seq) = match role {
            TransactionRole::Client => (cseq, 0),
            TransactionRole::Server => (0, cseq),
        };

        Ok(Self {
            role,
            cancel_token: CancellationToken::new(),
            id: Mutex::new(id),
            local_seq: AtomicU32::new(local_seq),
            remote_seq: AtomicU32::new(remote_seq),
            from,
            to: Mutex::new(to),
            local_contact,
            remote_uri: Mutex::new(remote_uri),
            remote_contact: Mutex::new(None),
            credential,
            auth_cache,
            route_set: Mutex::new(route_set),
            destination,
            endpoint,
            initial_request,
        })
    }

    pub fn id(&self) -> DialogId {
        self.id.lock().unwrap().clone()
    }

    pub fn get_local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Relaxed)
    }

    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The remote tag becomes stable with the first tagged response (UAC)
    /// or is set by us (UAS); later updates with the same tag are no-ops.
    pub fn update_remote_tag(&self, tag: &str) {
        self.id.lock().unwrap().to_tag = tag.to_string();
        let mut to = self.to.lock().unwrap();
        *to = to.clone().with_tag(tag.into());
    }

    /// Reject stale in-dialog requests; remote CSeq must not go
    /// backwards.
    pub fn check_remote_seq(&self, request: &Request) -> Result<bool> {
        let cseq = request.cseq_header()?.seq()?;
        let remote_seq = self.remote_seq.load(Ordering::Relaxed);
        if remote_seq > 0 && cseq < remote_seq {
            return Ok(false);
        }
        self.remote_seq.store(cseq, Ordering::Relaxed);
        Ok(true)
    }

    /// In-dialog request: routed to the remote target through the
    /// captured route set, From/To mirrored by role.
    pub fn make_request(
        &self,
        method: Method,
        cseq: Option<u32>,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<Request> {
        let mut headers = headers.unwrap_or_default();
        let cseq_header = CSeq {
            seq: cseq.unwrap_or_else(|| self.increment_local_seq()),
            method,
        };

        let via = self.endpoint.get_via(Some(self.destination.clone()))?;
        headers.push(Header::Via(via.into()));
        headers.push(Header::CallId(
            self.id.lock().unwrap().call_id.clone().into(),
        ));

        let to = self.to.lock().unwrap().clone().untyped().value().to_string();
        let from = self.from.clone().untyped().value().to_string();
        match self.role {
            TransactionRole::Client => {
                headers.push(Header::From(from.into()));
                headers.push(Header::To(to.into()));
            }
            TransactionRole::Server => {
                headers.push(Header::From(to.into()));
                headers.push(Header::To(from.into()));
            }
        }
        headers.push(Header::CSeq(cseq_header.into()));
        headers.push(Header::UserAgent(self.endpoint.user_agent.clone().into()));

        if let Some(c) = self.local_contact.as_ref() {
            headers.push(Contact::from(c.clone()).into());
        }

        {
            let route_set = self.route_set.lock().unwrap();
            headers.extend(route_set.iter().cloned().map(Header::Route));
        }
        headers.push(Header::MaxForwards(70.into()));
        headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));

        Ok(Request {
            method,
            uri: self.remote_uri.lock().unwrap().clone(),
            headers: headers.into(),
            body: body.unwrap_or_default(),
            version: rsip::Version::V2,
        })
    }

    /// Response to an in-dialog (or dialog-creating) request. Adds the
    /// local tag to To on everything but 100 Trying.
    pub fn make_response(
        &self,
        request: &Request,
        status: StatusCode,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut resp_headers = rsip::Headers::default();

        for header in request.headers.iter() {
            match header {
                Header::Via(via) => resp_headers.push(Header::Via(via.clone())),
                Header::From(from) => resp_headers.push(Header::From(from.clone())),
                Header::To(to) => {
                    let mut to = match to.clone().typed() {
                        Ok(to) => to,
                        Err(e) => {
                            info!("error parsing to header: {}", e);
                            continue;
                        }
                    };
                    if status != StatusCode::Trying
                        && !to.params.iter().any(|p| matches!(p, Param::Tag(_)))
                    {
                        to.params.push(Param::Tag(
                            self.id.lock().unwrap().to_tag.clone().into(),
                        ));
                    }
                    resp_headers.push(Header::To(to.into()));
                }
                Header::CSeq(cseq) => resp_headers.push(Header::CSeq(cseq.clone())),
                Header::CallId(call_id) => resp_headers.push(Header::CallId(call_id.clone())),
                Header::RecordRoute(rr) => resp_headers.push(Header::RecordRoute(rr.clone())),
                _ => {}
            }
        }

        if let Some(c) = self.local_contact.as_ref() {
            resp_headers.push(Contact::from(c.clone()).into());
        }

        if let Some(headers) = headers {
            for header in headers {
                resp_headers.unique_push(header);
            }
        }

        resp_headers.retain(|h| !matches!(h, Header::ContentLength(_)));
        resp_headers.push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        resp_headers.unique_push(Header::UserAgent(self.endpoint.user_agent.clone().into()));

        Response {
            status_code: status,
            headers: resp_headers,
            body: body.unwrap_or_default(),
            version: request.version().clone(),
        }
    }

    /// ACK for a 2xx: its own transaction on the route set, CSeq number
    /// of the INVITE with method ACK.
    pub fn make_ack(&self) -> Result<Request> {
        let cseq = self.initial_request.cseq_header()?.seq()?;
        self.make_request(Method::Ack, Some(cseq), None, None)
    }

    /// CANCEL mirrors the INVITE: same branch, same CSeq number, no body.
    pub fn make_cancel(&self) -> Result<Request> {
        let mut cancel = self.initial_request.clone();
        cancel.method = Method::Cancel;
        cancel
            .cseq_header_mut()?
            .mut_seq(self.initial_request.cseq_header()?.seq()?)?
            .mut_method(Method::Cancel)?;
        cancel
            .headers_mut()
            .retain(|h| !matches!(h, Header::ContentLength(_) | Header::ContentType(_)));
        cancel
            .headers_mut()
            .unique_push(Header::ContentLength(0.into()));
        cancel.body = vec![];
        Ok(cancel)
    }

    /// Capture dialog state from the 2xx that confirms a UAC dialog:
    /// remote target from Contact, route set from Record-Route reversed.
    pub fn apply_confirming_response(&self, resp: &Response) -> Result<()> {
        if let Ok(Some(tag)) = resp.to_header()?.tag() {
            self.update_remote_tag(tag.value());
        }

        if let Ok(contact) = resp.contact_header() {
            if let Ok(uri) = extract_uri_from_contact(contact.value()) {
                *self.remote_uri.lock().unwrap() = uri;
            }
            self.remote_contact.lock().unwrap().replace(contact.clone());
        }

        let mut route_set = Vec::new();
        for header in resp.headers.iter() {
            if let Header::RecordRoute(rr) = header {
                route_set.push(Route::from(rr.value().to_string()));
            }
        }
        route_set.reverse();
        *self.route_set.lock().unwrap() = route_set;
        Ok(())
    }

    /// Send a request on the edge connection without waiting for any
    /// response (ACKs).
    pub async fn send_direct(&self, request: Request) -> Result<()> {
        let connection = self.endpoint.transport_layer.lookup(&self.destination)?;
        connection.send(request.into()).await
    }

    /// ACK the 2xx that confirmed this dialog.
    pub async fn send_ack(&self) -> Result<()> {
        let ack = self.make_ack()?;
        self.send_direct(ack).await
    }

    pub fn client_transaction(&self, request: Request) -> Result<Transaction> {
        let key = TransactionKey::from_request(&request)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
        tx.destination = Some(self.destination.clone());
        Ok(tx)
    }

    /// Drive an in-dialog request (BYE, INFO, CANCEL, re-INVITE) to its
    /// final response, with the single authenticated retry. Returns
    /// `None` when the transport died before a final response arrived.
    /// Callers ACK a 2xx to a re-INVITE themselves.
    pub async fn do_request(&self, request: Request) -> Result<Option<Response>> {
        let method = request.method().to_owned();
        let mut tx = self.client_transaction(request)?;

        match tx.send().await {
            Ok(_) => {
                debug!(id = %self.id(), %method, "request sent");
            }
            Err(e) => {
                warn!(id = %self.id(), %method, "failed to send request: {}", e);
                return Err(e);
            }
        }

        let mut auth_sent = false;
        while let Some(msg) = tx.receive().await {
            match msg {
                SipMessage::Response(resp) => {
                    if resp.status_code.kind() == StatusCodeKind::Provisional {
                        continue;
                    }
                    if matches!(
                        resp.status_code,
                        StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
                    ) {
                        if auth_sent {
                            info!(id = %self.id(), "challenge repeated after credentials sent");
                            return Ok(Some(resp));
                        }
                        auth_sent = true;
                        match &self.credential {
                            Some(cred) => {
                                let new_seq = match method {
                                    Method::Cancel => self.get_local_seq(),
                                    _ => self.increment_local_seq(),
                                };
                                tx = handle_client_authenticate(
                                    new_seq,
                                    &tx,
                                    resp,
                                    cred,
                                    &self.auth_cache,
                                )?;
                                tx.send().await?;
                                continue;
                            }
                            None => {
                                info!(id = %self.id(), "challenge received without credentials");
                                return Ok(Some(resp));
                            }
                        }
                    }
                    debug!(id = %self.id(), %method, "request done: {}", resp.status_code);
                    return Ok(Some(resp));
                }
                _ => break,
            }
        }
        Ok(None)
    }
}
