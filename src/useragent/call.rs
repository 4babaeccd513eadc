use super::account::{AccountConfig, AccountKey};
use super::dtmf::{DtmfDispatcher, DtmfQueueStatus};
use super::state::{
    epoch_ms, CallDirection, CallErrorReason, CallLogEntry, CallOutcome, CallState, CallStateInfo,
    HoldState,
};
use crate::config::UserAgentConfig;
use crate::dialog::authenticate::{handle_client_authenticate, AuthCache};
use crate::dialog::dialog::{DialogInner, DialogInnerRef};
use crate::dialog::DialogId;
use crate::media::{MediaConnectionState, MediaEngine, MediaEvent, SdpKind};
use crate::sdp::{self, MediaDirection};
use crate::transaction::endpoint::{allow_header, EndpointInnerRef};
use crate::transaction::key::TransactionRole;
use crate::transaction::transaction::Transaction;
use crate::transaction::{make_call_id, make_tag};
use crate::Result;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use rsip::{Header, Method, SipMessage, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Local operations on a call, queued behind the session's event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallAction {
    Accept,
    Decline,
    Hangup,
    Hold,
    Resume,
}

/// Everything a call session reacts to, strictly in arrival order.
pub(crate) enum SessionEvent {
    Action(CallAction),
    /// An in-dialog server transaction routed here by Call-ID.
    ServerRequest(Transaction),
    /// ACK to one of our 2xx responses; absorbed.
    Ack(rsip::Request),
    Media(MediaEvent),
    /// A hold/resume re-INVITE subtask finished.
    ReinviteDone {
        hold: bool,
        resp: Option<rsip::Response>,
    },
    /// The BYE subtask finished (successfully or not).
    ByeDone,
    TransportClosed,
}

pub(crate) struct CallHandle {
    pub call_id: String,
    pub account: AccountKey,
    pub direction: CallDirection,
    pub events: UnboundedSender<SessionEvent>,
    pub dtmf: Arc<DtmfDispatcher>,
}

/// The only shared mutable structure between tasks; its lock is held
/// only across the map operation itself.
#[derive(Default)]
pub(crate) struct CallStore {
    calls: RwLock<HashMap<String, Arc<CallHandle>>>,
}

impl CallStore {
    pub fn insert(&self, handle: Arc<CallHandle>) -> Result<()> {
        let mut calls = self.calls.write().unwrap();
        if calls.contains_key(&handle.call_id) {
            return Err(crate::Error::CallError(format!(
                "call already exists: {}",
                handle.call_id
            )));
        }
        calls.insert(handle.call_id.clone(), handle);
        Ok(())
    }

    pub fn remove(&self, call_id: &str) -> Option<Arc<CallHandle>> {
        self.calls.write().unwrap().remove(call_id)
    }

    pub fn get(&self, call_id: &str) -> Option<Arc<CallHandle>> {
        self.calls.read().unwrap().get(call_id).cloned()
    }

    pub fn all(&self) -> Vec<Arc<CallHandle>> {
        self.calls.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.calls.read().unwrap().len()
    }
}

/// Observable sinks shared by every session.
pub(crate) struct Publisher {
    pub call_state: watch::Sender<Arc<CallStateInfo>>,
    pub transition: watch::Sender<String>,
    pub dtmf_status: Arc<watch::Sender<DtmfQueueStatus>>,
    pub call_log: UnboundedSender<CallLogEntry>,
}

/// Everything a session needs from the surrounding agent.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub endpoint: EndpointInnerRef,
    pub config: UserAgentConfig,
    pub media: Arc<dyn MediaEngine>,
    pub publisher: Arc<Publisher>,
    pub store: Arc<CallStore>,
    pub account: AccountConfig,
    pub auth_cache: Arc<AuthCache>,
}

/// One call: consumes its event queue plus (for outgoing calls) the
/// INVITE transaction, drives the detailed state machine, and publishes
/// snapshots. Slow signaling (BYE, re-INVITE) runs in subtasks that post
/// completion events back, so the machine never suspends mid-transition.
pub(crate) struct CallSession {
    ctx: SessionContext,
    info: CallStateInfo,
    dialog: Option<DialogInnerRef>,
    dtmf: Arc<DtmfDispatcher>,
    dtmf_drainer: Option<CancellationToken>,
    events_tx: UnboundedSender<SessionEvent>,
    invite_server_tx: Option<Transaction>,
    local_sdp: Option<String>,
    remote_sdp: Option<String>,
    auth_sent: bool,
    connected_once: bool,
    declined_locally: bool,
    cancel_requested: bool,
}

impl CallSession {
    fn new(
        ctx: SessionContext,
        call_id: String,
        direction: CallDirection,
        remote_uri: String,
        remote_display_name: Option<String>,
        dtmf: Arc<DtmfDispatcher>,
        events_tx: UnboundedSender<SessionEvent>,
    ) -> Self {
        let info = CallStateInfo {
            call_id,
            direction,
            state: CallState::Idle,
            remote_uri,
            remote_display_name,
            hold: HoldState::Unknown,
            error_reason: CallErrorReason::None,
            last_sip_code: None,
            last_sip_phrase: None,
            start_time_ms: epoch_ms(),
            streams_started_at: None,
            ended_at: None,
            changed_at: Instant::now(),
        };
        CallSession {
            ctx,
            info,
            dialog: None,
            dtmf,
            dtmf_drainer: None,
            events_tx,
            invite_server_tx: None,
            local_sdp: None,
            remote_sdp: None,
            auth_sent: false,
            connected_once: false,
            declined_locally: false,
            cancel_requested: false,
        }
    }

    /// Place a call: create the handle, insert it into the store, spawn
    /// the session task.
    pub(crate) fn spawn_outgoing(
        ctx: SessionContext,
        destination: rsip::Uri,
    ) -> Result<Arc<CallHandle>> {
        let call_id = make_call_id(&ctx.account.domain).value().to_string();
        let (events_tx, events_rx) = unbounded_channel();
        let dtmf = DtmfDispatcher::new(
            ctx.media.clone(),
            ctx.config.dtmf_inter_digit_gap,
            ctx.publisher.dtmf_status.clone(),
        );
        let handle = Arc::new(CallHandle {
            call_id: call_id.clone(),
            account: ctx.account.key(),
            direction: CallDirection::Outgoing,
            events: events_tx.clone(),
            dtmf: dtmf.clone(),
        });
        ctx.store.insert(handle.clone())?;

        let session = CallSession::new(
            ctx,
            call_id,
            CallDirection::Outgoing,
            destination.to_string(),
            None,
            dtmf,
            events_tx,
        );
        tokio::spawn(session.run_outgoing(events_rx, destination));
        Ok(handle)
    }

    /// Take over an inbound INVITE transaction as a new incoming call.
    pub(crate) fn spawn_incoming(ctx: SessionContext, tx: Transaction) -> Result<Arc<CallHandle>> {
        let call_id = tx.original.call_id_header()?.value().to_string();

        let mut dialog_id = DialogId::try_from(&tx.original)?;
        dialog_id.to_tag = make_tag().to_string();

        let remote = tx.original.from_header()?.typed()?;
        let remote_uri = remote.uri.to_string();
        let remote_display_name = remote.display_name.as_ref().map(|d| d.to_string());

        let dialog = Arc::new(DialogInner::new(
            TransactionRole::Server,
            dialog_id,
            tx.original.clone(),
            ctx.endpoint.clone(),
            Some(ctx.account.credential()),
            ctx.auth_cache.clone(),
            Some(ctx.account.contact(false).uri),
            ctx.account.edge.clone(),
        )?);

        let (events_tx, events_rx) = unbounded_channel();
        let dtmf = DtmfDispatcher::new(
            ctx.media.clone(),
            ctx.config.dtmf_inter_digit_gap,
            ctx.publisher.dtmf_status.clone(),
        );
        dtmf.set_dialog(dialog.clone());

        let handle = Arc::new(CallHandle {
            call_id: call_id.clone(),
            account: ctx.account.key(),
            direction: CallDirection::Incoming,
            events: events_tx.clone(),
            dtmf: dtmf.clone(),
        });
        ctx.store.insert(handle.clone())?;

        let mut session = CallSession::new(
            ctx,
            call_id,
            CallDirection::Incoming,
            remote_uri,
            remote_display_name,
            dtmf,
            events_tx,
        );
        session.remote_sdp = Some(String::from_utf8_lossy(&tx.original.body).to_string());
        session.dialog = Some(dialog);
        session.invite_server_tx = Some(tx);
        tokio::spawn(session.run_incoming(events_rx));
        Ok(handle)
    }

    // ---- outgoing -----------------------------------------------------

    async fn run_outgoing(
        mut self,
        mut events: UnboundedReceiver<SessionEvent>,
        destination: rsip::Uri,
    ) {
        self.transition(CallState::OutgoingInit, None, None);

        let mut invite_tx = match self.start_outgoing(&destination).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(call_id = %self.info.call_id, "failed to start call: {}", e);
                self.fail(CallErrorReason::NetworkError, None);
                self.finish().await;
                self.linger(&mut events).await;
                return;
            }
        };
        let mut invite_done = false;

        loop {
            select! {
                msg = invite_tx.receive(), if !invite_done => {
                    match msg {
                        Some(SipMessage::Response(resp)) => {
                            self.on_invite_response(resp, &mut invite_tx, &mut invite_done).await;
                        }
                        Some(SipMessage::Request(_)) => {}
                        None => {
                            invite_done = true;
                            if !self.info.state.is_terminal() {
                                match self.info.state {
                                    CallState::Ending => {
                                        self.transition(CallState::Ended, None, None);
                                    }
                                    state if !state.can_send_dtmf() => {
                                        // transaction died before any final
                                        self.fail(CallErrorReason::NetworkError, None);
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                }
                ev = events.recv() => {
                    match ev {
                        Some(ev) => self.on_event(ev).await,
                        None => break,
                    }
                }
            }
            if self.info.state.is_terminal() {
                break;
            }
        }
        self.finish().await;
        self.linger(&mut events).await;
    }

    async fn start_outgoing(&mut self, destination: &rsip::Uri) -> Result<Transaction> {
        let offer = self.ctx.media.create_offer().await?;
        self.local_sdp = Some(offer.clone());

        let invite = self.build_invite(destination, &offer)?;
        let dialog_id = DialogId::try_from(&invite)?;
        let dialog = Arc::new(DialogInner::new(
            TransactionRole::Client,
            dialog_id,
            invite.clone(),
            self.ctx.endpoint.clone(),
            Some(self.ctx.account.credential()),
            self.ctx.auth_cache.clone(),
            Some(self.ctx.account.contact(false).uri),
            self.ctx.account.edge.clone(),
        )?);
        self.dtmf.set_dialog(dialog.clone());
        self.dialog = Some(dialog.clone());

        let mut tx = dialog.client_transaction(invite)?;
        tx.send().await?;
        Ok(tx)
    }

    fn build_invite(&self, destination: &rsip::Uri, offer: &str) -> Result<rsip::Request> {
        let account = &self.ctx.account;
        let via = self.ctx.endpoint.get_via(Some(account.edge.clone()))?;
        let from = rsip::typed::From {
            display_name: account.display_name.clone().map(Into::into),
            uri: account.aor()?,
            params: vec![],
        }
        .with_tag(make_tag());
        let to = rsip::typed::To {
            display_name: None,
            uri: destination.clone(),
            params: vec![],
        };

        let mut request = self.ctx.endpoint.make_request(
            Method::Invite,
            destination.clone(),
            via,
            from,
            to,
            self.info.call_id.clone().into(),
            1,
        );
        request.headers.unique_push(account.contact(false).into());
        request.headers.unique_push(allow_header());
        request
            .headers
            .unique_push(Header::ContentType("application/sdp".into()));
        request
            .headers
            .unique_push(Header::ContentLength((offer.len() as u32).into()));
        request.body = offer.as_bytes().to_vec();
        Ok(request)
    }

    async fn on_invite_response(
        &mut self,
        resp: rsip::Response,
        invite_tx: &mut Transaction,
        invite_done: &mut bool,
    ) {
        let dialog = match self.dialog.clone() {
            Some(dialog) => dialog,
            None => return,
        };
        match resp.status_code {
            StatusCode::Trying => {
                self.transition(CallState::OutgoingProgress, Some(&resp), None);
            }
            StatusCode::Ringing | StatusCode::SessionProgress => {
                if let Ok(Some(tag)) = resp.to_header().and_then(|to| to.tag()) {
                    dialog.update_remote_tag(tag.value());
                }
                self.transition(CallState::OutgoingRinging, Some(&resp), None);
            }
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired => {
                if self.auth_sent {
                    *invite_done = true;
                    self.fail(CallErrorReason::AuthenticationFailed, Some(&resp));
                    return;
                }
                self.auth_sent = true;
                let retried = handle_client_authenticate(
                    dialog.increment_local_seq(),
                    invite_tx,
                    resp,
                    &self.ctx.account.credential(),
                    &self.ctx.auth_cache,
                );
                match retried {
                    Ok(mut tx) => {
                        if let Err(e) = tx.send().await {
                            warn!(call_id = %self.info.call_id, "auth retry send failed: {}", e);
                            *invite_done = true;
                            self.fail(CallErrorReason::NetworkError, None);
                            return;
                        }
                        *invite_tx = tx;
                    }
                    Err(e) => {
                        warn!(call_id = %self.info.call_id, "auth retry failed: {}", e);
                        *invite_done = true;
                        self.fail(CallErrorReason::AuthenticationFailed, None);
                    }
                }
            }
            StatusCode::OK => {
                *invite_done = true;
                if let Err(e) = dialog.apply_confirming_response(&resp) {
                    warn!(call_id = %self.info.call_id, "bad 200 to INVITE: {}", e);
                }
                dialog.send_ack().await.ok();

                if self.cancel_requested {
                    // glare: our CANCEL lost the race, ACK then BYE
                    info!(call_id = %self.info.call_id, "200 OK raced local CANCEL, sending BYE");
                    self.spawn_bye();
                    return;
                }

                let answer = String::from_utf8_lossy(&resp.body).to_string();
                self.remote_sdp = Some(answer.clone());
                self.ctx
                    .media
                    .set_remote_description(&answer, SdpKind::Answer)
                    .await
                    .ok();
                if let Some(address) = sdp::connection_address(&answer) {
                    debug!(call_id = %self.info.call_id, "remote media address: {}", address);
                }
                self.connected_once = true;
                self.transition(CallState::Connected, Some(&resp), None);
            }
            StatusCode::RequestTerminated if self.cancel_requested => {
                // the expected 487 confirming our CANCEL
                *invite_done = true;
                self.info.last_sip_code = Some(resp.status_code.code());
                self.info.last_sip_phrase = Some(resp.status_code.to_string());
                self.info.error_reason = CallErrorReason::CancelledLocal;
                self.transition(CallState::Ended, None, None);
            }
            _ if resp.status_code.code() >= 300 => {
                *invite_done = true;
                if self.info.state == CallState::Ending {
                    // already tearing down; any final closes the call
                    self.transition(CallState::Ended, Some(&resp), None);
                } else {
                    let reason = CallErrorReason::from_status(&resp.status_code);
                    self.fail(reason, Some(&resp));
                }
            }
            _ => {}
        }
    }

    // ---- incoming -----------------------------------------------------

    async fn run_incoming(mut self, mut events: UnboundedReceiver<SessionEvent>) {
        let dialog = match self.dialog.clone() {
            Some(dialog) => dialog,
            None => return,
        };
        // 100 to quench retransmissions, then ring
        if let Some(tx) = self.invite_server_tx.as_mut() {
            let trying = dialog.make_response(&tx.original, StatusCode::Trying, None, None);
            tx.respond(trying).await.ok();
            let ringing = dialog.make_response(&tx.original, StatusCode::Ringing, None, None);
            tx.respond(ringing).await.ok();
        }
        self.transition(CallState::IncomingReceived, None, None);

        loop {
            match events.recv().await {
                Some(ev) => self.on_event(ev).await,
                None => break,
            }
            if self.info.state.is_terminal() {
                break;
            }
        }
        self.finish().await;
        self.linger(&mut events).await;
    }

    async fn on_accept(&mut self) {
        if self.info.state != CallState::IncomingReceived {
            return;
        }
        let dialog = match self.dialog.clone() {
            Some(dialog) => dialog,
            None => return,
        };
        let offer = self.remote_sdp.clone().unwrap_or_default();
        self.ctx
            .media
            .set_remote_description(&offer, SdpKind::Offer)
            .await
            .ok();
        let answer = match self.ctx.media.create_answer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(call_id = %self.info.call_id, "media rejected offer: {}", e);
                if let Some(mut tx) = self.invite_server_tx.take() {
                    let resp = dialog.make_response(
                        &tx.original,
                        StatusCode::NotAcceptableHere,
                        None,
                        None,
                    );
                    tx.respond(resp).await.ok();
                }
                self.fail(CallErrorReason::IncompatibleMedia, None);
                return;
            }
        };
        self.local_sdp = Some(answer.clone());

        if let Some(mut tx) = self.invite_server_tx.take() {
            let headers = vec![Header::ContentType("application/sdp".into())];
            let resp = dialog.make_response(
                &tx.original,
                StatusCode::OK,
                Some(headers),
                Some(answer.into_bytes()),
            );
            match tx.respond(resp).await {
                Ok(_) => {
                    self.connected_once = true;
                    self.transition(CallState::Connected, None, None);
                }
                Err(e) => {
                    warn!(call_id = %self.info.call_id, "failed to answer call: {}", e);
                    self.fail(CallErrorReason::NetworkError, None);
                }
            }
        }
    }

    async fn on_decline(&mut self) {
        if self.info.state != CallState::IncomingReceived {
            return;
        }
        let dialog = match self.dialog.clone() {
            Some(dialog) => dialog,
            None => return,
        };
        self.declined_locally = true;
        if let Some(mut tx) = self.invite_server_tx.take() {
            let resp = dialog.make_response(&tx.original, StatusCode::Decline, None, None);
            tx.respond(resp).await.ok();
        }
        self.info.last_sip_code = Some(603);
        self.info.last_sip_phrase = Some(StatusCode::Decline.to_string());
        self.info.error_reason = CallErrorReason::Declined;
        self.transition(CallState::Ending, None, None);
        self.transition(CallState::Ended, None, None);
    }

    // ---- shared event handling ----------------------------------------

    async fn on_event(&mut self, ev: SessionEvent) {
        match ev {
            SessionEvent::Action(CallAction::Accept) => self.on_accept().await,
            SessionEvent::Action(CallAction::Decline) => self.on_decline().await,
            SessionEvent::Action(CallAction::Hangup) => self.on_hangup().await,
            SessionEvent::Action(CallAction::Hold) => self.on_hold_action(true).await,
            SessionEvent::Action(CallAction::Resume) => self.on_hold_action(false).await,
            SessionEvent::ServerRequest(tx) => self.on_server_request(tx).await,
            SessionEvent::Ack(_) => {
                debug!(call_id = %self.info.call_id, "ACK absorbed");
            }
            SessionEvent::Media(ev) => self.on_media(ev).await,
            SessionEvent::ReinviteDone { hold, resp } => self.on_reinvite_done(hold, resp).await,
            SessionEvent::ByeDone => {
                if self.info.state == CallState::Ending {
                    self.transition(CallState::Ended, None, None);
                }
            }
            SessionEvent::TransportClosed => {
                if !self.info.state.is_terminal() {
                    self.fail(CallErrorReason::NetworkError, None);
                }
            }
        }
    }

    async fn on_hangup(&mut self) {
        match self.info.state {
            CallState::IncomingReceived => self.on_decline().await,
            CallState::OutgoingInit
            | CallState::OutgoingProgress
            | CallState::OutgoingRinging => {
                self.cancel_requested = true;
                self.transition(CallState::Ending, None, None);
                if let Some(dialog) = self.dialog.clone() {
                    tokio::spawn(async move {
                        match dialog.make_cancel() {
                            Ok(cancel) => {
                                dialog.do_request(cancel).await.ok();
                            }
                            Err(e) => warn!("failed to build CANCEL: {}", e),
                        }
                    });
                }
            }
            CallState::Connected
            | CallState::StreamsRunning
            | CallState::Pausing
            | CallState::Paused
            | CallState::Resuming => {
                self.info.error_reason = CallErrorReason::NormalTermination;
                self.transition(CallState::Ending, None, None);
                self.spawn_bye();
            }
            _ => {}
        }
    }

    fn spawn_bye(&self) {
        let dialog = match self.dialog.clone() {
            Some(dialog) => dialog,
            None => return,
        };
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            match dialog.make_request(Method::Bye, None, None, None) {
                Ok(bye) => {
                    dialog.do_request(bye).await.ok();
                }
                Err(e) => warn!("failed to build BYE: {}", e),
            }
            events.send(SessionEvent::ByeDone).ok();
        });
    }

    async fn on_server_request(&mut self, mut tx: Transaction) {
        let method = tx.original.method.clone();
        let dialog = match self.dialog.clone() {
            Some(dialog) => dialog,
            None => {
                tx.reply(StatusCode::CallTransactionDoesNotExist).await.ok();
                return;
            }
        };

        if matches!(method, Method::Bye | Method::Info | Method::Invite | Method::Options) {
            match dialog.check_remote_seq(&tx.original) {
                Ok(true) => {}
                _ => {
                    info!(call_id = %self.info.call_id, "stale {} dropped", method);
                    tx.reply(StatusCode::ServerInternalError).await.ok();
                    return;
                }
            }
        }

        match method {
            Method::Bye => {
                let resp = dialog.make_response(&tx.original, StatusCode::OK, None, None);
                tx.respond(resp).await.ok();
                if !self.info.state.is_terminal() {
                    self.info.error_reason = CallErrorReason::NormalTermination;
                    self.transition(CallState::Ending, None, None);
                    self.transition(CallState::Ended, None, None);
                }
            }
            Method::Cancel => {
                tx.reply(StatusCode::OK).await.ok();
                if let Some(mut invite_tx) = self.invite_server_tx.take() {
                    let resp = dialog.make_response(
                        &invite_tx.original,
                        StatusCode::RequestTerminated,
                        None,
                        None,
                    );
                    invite_tx.respond(resp).await.ok();
                }
                if self.info.state == CallState::IncomingReceived {
                    self.info.error_reason = CallErrorReason::NormalTermination;
                    self.transition(CallState::Ending, None, None);
                    self.transition(CallState::Ended, None, None);
                }
            }
            Method::Info => {
                debug!(call_id = %self.info.call_id, "INFO received");
                tx.reply(StatusCode::OK).await.ok();
            }
            Method::Options => {
                tx.reply_with(StatusCode::OK, Some(vec![allow_header()]), None)
                    .await
                    .ok();
            }
            Method::Invite => self.on_remote_reinvite(tx).await,
            _ => {
                tx.reply(StatusCode::MethodNotAllowed).await.ok();
            }
        }
    }

    /// Remote re-INVITE: answer it and mirror hold/resume transitions
    /// from the offered media direction.
    async fn on_remote_reinvite(&mut self, mut tx: Transaction) {
        if !matches!(
            self.info.state,
            CallState::Connected | CallState::StreamsRunning | CallState::Paused
        ) {
            tx.reply(StatusCode::ServerInternalError).await.ok();
            return;
        }
        let dialog = match self.dialog.clone() {
            Some(dialog) => dialog,
            None => return,
        };
        let offer = String::from_utf8_lossy(&tx.original.body).to_string();
        let dir = sdp::direction(&offer);
        self.remote_sdp = Some(offer.clone());
        self.ctx
            .media
            .set_remote_description(&offer, SdpKind::Offer)
            .await
            .ok();

        let answer = match self.ctx.media.create_answer(&offer).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(call_id = %self.info.call_id, "media rejected re-INVITE: {}", e);
                let resp =
                    dialog.make_response(&tx.original, StatusCode::NotAcceptableHere, None, None);
                tx.respond(resp).await.ok();
                return;
            }
        };
        let answer = if dir.is_hold() {
            sdp::with_direction(&answer, MediaDirection::RecvOnly)
        } else {
            answer
        };

        let headers = vec![Header::ContentType("application/sdp".into())];
        let resp = dialog.make_response(
            &tx.original,
            StatusCode::OK,
            Some(headers),
            Some(answer.into_bytes()),
        );
        tx.respond(resp).await.ok();

        if dir.is_hold() {
            if matches!(
                self.info.state,
                CallState::Connected | CallState::StreamsRunning
            ) {
                info!(call_id = %self.info.call_id, "remote hold");
                self.transition(CallState::Pausing, None, None);
                self.transition(CallState::Paused, None, None);
            }
        } else if self.info.state == CallState::Paused {
            info!(call_id = %self.info.call_id, "remote resume");
            self.transition(CallState::Resuming, None, None);
            self.transition(CallState::StreamsRunning, None, None);
        }
    }

    async fn on_hold_action(&mut self, hold: bool) {
        let dialog = match self.dialog.clone() {
            Some(dialog) => dialog,
            None => return,
        };
        let eligible = if hold {
            matches!(
                self.info.state,
                CallState::Connected | CallState::StreamsRunning
            )
        } else {
            self.info.state == CallState::Paused
        };
        if !eligible {
            debug!(call_id = %self.info.call_id, hold, "hold action ignored in {}", self.info.state);
            return;
        }

        self.transition(
            if hold {
                CallState::Pausing
            } else {
                CallState::Resuming
            },
            None,
            None,
        );

        let direction = if hold {
            MediaDirection::SendOnly
        } else {
            MediaDirection::SendRecv
        };
        let sdp = sdp::with_direction(self.local_sdp.as_deref().unwrap_or(""), direction);
        self.local_sdp = Some(sdp.clone());
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let headers = vec![Header::ContentType("application/sdp".into())];
            let resp = match dialog.make_request(
                Method::Invite,
                None,
                Some(headers),
                Some(sdp.into_bytes()),
            ) {
                Ok(reinvite) => dialog.do_request(reinvite).await.ok().flatten(),
                Err(e) => {
                    warn!("failed to build re-INVITE: {}", e);
                    None
                }
            };
            if let Some(resp) = resp.as_ref() {
                if resp.status_code == StatusCode::OK {
                    // a 2xx to re-INVITE needs its own ACK at that CSeq
                    if let Ok(cseq) = resp.cseq_header().and_then(|c| c.seq().map_err(Into::into)) {
                        if let Ok(ack) = dialog.make_request(Method::Ack, Some(cseq), None, None) {
                            dialog.send_direct(ack).await.ok();
                        }
                    }
                }
            }
            events.send(SessionEvent::ReinviteDone { hold, resp }).ok();
        });
    }

    async fn on_reinvite_done(&mut self, hold: bool, resp: Option<rsip::Response>) {
        let ok = resp
            .as_ref()
            .map(|r| r.status_code == StatusCode::OK)
            .unwrap_or(false);
        if ok {
            if hold && self.info.state == CallState::Pausing {
                self.ctx.media.set_audio_enabled(false).await;
                self.info.hold = HoldState::LocalHold;
                self.transition(CallState::Paused, resp.as_ref(), None);
            } else if !hold && self.info.state == CallState::Resuming {
                self.ctx.media.set_audio_enabled(true).await;
                self.info.hold = HoldState::NotOnHold;
                self.transition(CallState::StreamsRunning, resp.as_ref(), None);
            }
            return;
        }
        if self.info.state.is_terminal() || self.info.state == CallState::Ending {
            return;
        }
        let reason = resp
            .as_ref()
            .map(|r| CallErrorReason::from_status(&r.status_code))
            .unwrap_or(CallErrorReason::NetworkError);
        warn!(call_id = %self.info.call_id, hold, "re-INVITE failed");
        self.fail(reason, resp.as_ref());
    }

    async fn on_media(&mut self, ev: MediaEvent) {
        match ev {
            MediaEvent::ConnectionState(MediaConnectionState::Connected) => {
                if self.info.state == CallState::Connected {
                    self.transition(CallState::StreamsRunning, None, None);
                }
            }
            MediaEvent::ConnectionState(MediaConnectionState::Failed) => {
                if self.info.state.is_call_active() && self.info.state != CallState::Ending {
                    self.fail(CallErrorReason::NetworkError, None);
                }
            }
            MediaEvent::ConnectionState(state) => {
                debug!(call_id = %self.info.call_id, "media connection state: {:?}", state);
            }
            MediaEvent::RemoteTrackAdded => {
                debug!(call_id = %self.info.call_id, "remote track added");
            }
        }
    }

    // ---- state plumbing ----------------------------------------------

    fn fail(&mut self, reason: CallErrorReason, resp: Option<&rsip::Response>) {
        self.info.error_reason = reason;
        self.transition(CallState::Error, resp, None);
    }

    fn transition(
        &mut self,
        to: CallState,
        resp: Option<&rsip::Response>,
        reason: Option<CallErrorReason>,
    ) {
        let from = self.info.state;
        if !from.can_transition_to(to) {
            warn!(
                call_id = %self.info.call_id,
                "rejected transition {} -> {}", from, to
            );
            return;
        }
        if let Some(resp) = resp {
            self.info.last_sip_code = Some(resp.status_code.code());
            self.info.last_sip_phrase = Some(resp.status_code.to_string());
        }
        if let Some(reason) = reason {
            self.info.error_reason = reason;
        }
        self.info.state = to;
        self.info.changed_at = Instant::now();
        if to == CallState::StreamsRunning && self.info.streams_started_at.is_none() {
            self.info.streams_started_at = Some(Instant::now());
        }
        if to.is_terminal() {
            self.info.ended_at = Some(Instant::now());
        }

        let label = format!("{}→{} ({})", from, to, self.info.error_reason);
        info!(call_id = %self.info.call_id, "call state {}", label);
        self.ctx.publisher.transition.send(label).ok();
        self.ctx
            .publisher
            .call_state
            .send(Arc::new(self.info.clone()))
            .ok();

        if to.can_send_dtmf() {
            self.start_dtmf_drainer();
        } else {
            self.stop_dtmf_drainer();
        }
    }

    fn start_dtmf_drainer(&mut self) {
        if self.dtmf_drainer.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        self.dtmf_drainer = Some(cancel.clone());
        tokio::spawn(self.dtmf.clone().drain(cancel));
    }

    fn stop_dtmf_drainer(&mut self) {
        if let Some(cancel) = self.dtmf_drainer.take() {
            cancel.cancel();
        }
    }

    /// Terminal housekeeping: emit the log entry, stop the drainer,
    /// release the media plane.
    async fn finish(&mut self) {
        self.stop_dtmf_drainer();
        self.emit_call_log();
        if let Some(dialog) = &self.dialog {
            dialog.cancel_token.cancel();
        }
        self.ctx.media.dispose().await;
    }

    fn emit_call_log(&self) {
        let duration = self.info.duration();
        let outcome = if self.declined_locally {
            CallOutcome::Declined
        } else if self.info.direction == CallDirection::Incoming && !self.connected_once {
            CallOutcome::Missed
        } else if self.info.error_reason == CallErrorReason::NormalTermination
            && duration.as_secs() > 0
        {
            CallOutcome::Success
        } else {
            CallOutcome::Aborted
        };

        let aor = self
            .ctx
            .account
            .aor()
            .map(|uri| uri.to_string())
            .unwrap_or_default();
        let (from, to) = match self.info.direction {
            CallDirection::Outgoing => (aor, self.info.remote_uri.clone()),
            CallDirection::Incoming => (self.info.remote_uri.clone(), aor),
        };
        let contact = self
            .dialog
            .as_ref()
            .and_then(|d| d.remote_contact.lock().unwrap().as_ref().map(|c| c.value().to_string()))
            .unwrap_or_default();

        let entry = CallLogEntry {
            id: self.info.call_id.clone(),
            direction: self.info.direction,
            to,
            from,
            contact,
            start_time_ms: self.info.start_time_ms,
            duration_secs: duration.as_secs(),
            outcome,
            local_address: self.ctx.account.edge.to_string(),
        };
        self.ctx.publisher.call_log.send(entry).ok();
    }

    /// Keep the call in the store for a grace window after the terminal
    /// state so late BYE/ACK retransmissions land somewhere sensible.
    async fn linger(&mut self, events: &mut UnboundedReceiver<SessionEvent>) {
        let deadline = tokio::time::sleep(self.ctx.config.terminal_linger);
        tokio::pin!(deadline);
        loop {
            select! {
                _ = &mut deadline => break,
                ev = events.recv() => match ev {
                    Some(SessionEvent::ServerRequest(mut tx)) => {
                        match tx.original.method {
                            Method::Bye => {
                                tx.reply(StatusCode::OK).await.ok();
                            }
                            _ => {
                                tx.reply(StatusCode::CallTransactionDoesNotExist).await.ok();
                            }
                        }
                    }
                    Some(_) => {}
                    None => break,
                }
            }
        }
        self.ctx.store.remove(&self.info.call_id);
        debug!(call_id = %self.info.call_id, "call removed from store");
    }
}
