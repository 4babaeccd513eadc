use crate::config::UserAgentConfig;
use crate::dialog::authenticate::AuthCache;
use crate::media::{MediaEngine, MediaEvent, NullMediaEngine};
use crate::transaction::endpoint::{
    allow_header, Endpoint, EndpointBuilder, EndpointEvent, EndpointEventReceiver,
};
use crate::transport::{SipAddr, TransportLayer};
use crate::Result;
use rsip::prelude::{HeadersExt, UntypedHeader};
use rsip::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod account;
pub mod call;
pub mod dtmf;
pub mod state;

#[cfg(test)]
mod tests;

use account::{
    AccountConfig, AccountControl, AccountHandle, AccountKey, AccountTask, RegistrationSnapshot,
    RegistryHub,
};
use call::{CallAction, CallHandle, CallSession, CallStore, Publisher, SessionContext, SessionEvent};
use dtmf::{DtmfMode, DtmfQueueStatus, DtmfRequest};
use state::{CallLogEntry, CallStateInfo};

/// Application lifecycle events routed to the registration manager and
/// the call machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEvent {
    Foreground,
    Background,
    WillTerminate,
    DataAvailable,
    DataUnavailable,
}

pub struct UserAgentBuilder {
    config: UserAgentConfig,
    media: Option<Arc<dyn MediaEngine>>,
    transport_layer: Option<TransportLayer>,
    cancel_token: Option<CancellationToken>,
}

impl Default for UserAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UserAgentBuilder {
    pub fn new() -> Self {
        UserAgentBuilder {
            config: UserAgentConfig::default(),
            media: None,
            transport_layer: None,
            cancel_token: None,
        }
    }

    pub fn with_config(mut self, config: UserAgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_media_engine(mut self, media: Arc<dyn MediaEngine>) -> Self {
        self.media.replace(media);
        self
    }

    pub fn with_transport_layer(mut self, transport_layer: TransportLayer) -> Self {
        self.transport_layer.replace(transport_layer);
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn build(mut self) -> UserAgent {
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .take()
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));

        let endpoint = EndpointBuilder::new()
            .with_user_agent(&self.config.user_agent)
            .with_transport_layer(transport_layer)
            .with_cancel_token(cancel_token.child_token())
            .with_timeouts(self.config.invite_timeout, self.config.request_timeout)
            .build();
        let endpoint_events = endpoint.take_events();

        let (registry, registration_rx) = RegistryHub::new();
        let (call_state_tx, call_state_rx) = watch::channel(Arc::new(CallStateInfo::idle()));
        let (transition_tx, transition_rx) = watch::channel(String::new());
        let (dtmf_status_tx, dtmf_status_rx) = watch::channel(DtmfQueueStatus::default());
        let (call_log_tx, call_log_rx) = unbounded_channel();

        let publisher = Arc::new(Publisher {
            call_state: call_state_tx,
            transition: transition_tx,
            dtmf_status: Arc::new(dtmf_status_tx),
            call_log: call_log_tx,
        });

        UserAgent {
            inner: Arc::new(UserAgentInner {
                config: self.config,
                media: self.media.unwrap_or_else(|| Arc::new(NullMediaEngine)),
                endpoint,
                accounts: Mutex::new(HashMap::new()),
                auth_caches: Mutex::new(HashMap::new()),
                registry,
                store: Arc::new(CallStore::default()),
                publisher,
                current_call: Mutex::new(None),
                registration_rx,
                call_state_rx,
                transition_rx,
                dtmf_status_rx,
                call_log_rx: Mutex::new(Some(call_log_rx)),
                endpoint_events: Mutex::new(Some(endpoint_events)),
                cancel_token,
            }),
        }
    }
}

pub(crate) struct UserAgentInner {
    pub config: UserAgentConfig,
    pub media: Arc<dyn MediaEngine>,
    pub endpoint: Endpoint,
    accounts: Mutex<HashMap<AccountKey, AccountHandle>>,
    /// Digest state survives unregister/register cycles.
    auth_caches: Mutex<HashMap<AccountKey, Arc<AuthCache>>>,
    registry: Arc<RegistryHub>,
    store: Arc<CallStore>,
    publisher: Arc<Publisher>,
    current_call: Mutex<Option<String>>,
    registration_rx: watch::Receiver<RegistrationSnapshot>,
    call_state_rx: watch::Receiver<Arc<CallStateInfo>>,
    transition_rx: watch::Receiver<String>,
    dtmf_status_rx: watch::Receiver<DtmfQueueStatus>,
    call_log_rx: Mutex<Option<UnboundedReceiver<CallLogEntry>>>,
    endpoint_events: Mutex<Option<EndpointEventReceiver>>,
    cancel_token: CancellationToken,
}

/// The embeddable SIP user agent: multi-account registration, one call
/// machine per Call-ID, DTMF dispatch, lifecycle handling, and
/// replace-latest observables for the UI.
#[derive(Clone)]
pub struct UserAgent {
    inner: Arc<UserAgentInner>,
}

impl UserAgent {
    /// Run the protocol engine and the dispatch loop until shutdown.
    pub async fn serve(&self) {
        let events = self
            .inner
            .endpoint_events
            .lock()
            .unwrap()
            .take()
            .expect("user agent already serving");

        let registry = self.inner.registry.clone();
        let coalescer_cancel = self.inner.cancel_token.child_token();
        tokio::spawn(registry.coalesce_loop(coalescer_cancel));

        select! {
            _ = self.inner.cancel_token.cancelled() => {
                info!("user agent cancelled");
            }
            _ = self.inner.endpoint.serve() => {}
            _ = self.dispatch(events) => {}
        }
        info!("user agent stopped");
    }

    async fn dispatch(&self, mut events: EndpointEventReceiver) {
        while let Some(event) = events.recv().await {
            match event {
                EndpointEvent::Request(tx) => self.on_request(tx).await,
                EndpointEvent::Ack(req) => {
                    if let Ok(call_id) = req.call_id_header() {
                        if let Some(handle) = self.inner.store.get(call_id.value()) {
                            handle.events.send(SessionEvent::Ack(req)).ok();
                        }
                    }
                }
                EndpointEvent::TransportClosed(addr) => self.on_transport_closed(addr),
            }
        }
    }

    async fn on_request(&self, mut tx: crate::transaction::transaction::Transaction) {
        let call_id = match tx.original.call_id_header() {
            Ok(header) => header.value().to_string(),
            Err(e) => {
                warn!("request without Call-ID: {}", e);
                return;
            }
        };

        if let Some(handle) = self.inner.store.get(&call_id) {
            handle.events.send(SessionEvent::ServerRequest(tx)).ok();
            return;
        }

        match tx.original.method {
            rsip::Method::Invite => {
                if let Err(e) = self.start_incoming(tx) {
                    warn!("failed to take incoming call: {}", e);
                }
            }
            rsip::Method::Options => {
                tx.reply_with(StatusCode::OK, Some(vec![allow_header()]), None)
                    .await
                    .ok();
            }
            _ => {
                debug!("{} outside any dialog", tx.original.method);
                tx.reply(StatusCode::CallTransactionDoesNotExist).await.ok();
            }
        }
    }

    fn start_incoming(&self, tx: crate::transaction::transaction::Transaction) -> Result<()> {
        let account = self.account_for_invite(&tx.original).ok_or_else(|| {
            crate::Error::CallError("no account for incoming INVITE".to_string())
        })?;
        let ctx = self.session_context(account)?;
        let handle = CallSession::spawn_incoming(ctx, tx)?;
        self.inner
            .current_call
            .lock()
            .unwrap()
            .replace(handle.call_id.clone());
        Ok(())
    }

    /// Pick the owning account for an inbound INVITE by its To user and
    /// domain, falling back to the only account when just one exists.
    fn account_for_invite(&self, request: &rsip::Request) -> Option<AccountConfig> {
        let accounts = self.inner.accounts.lock().unwrap();
        if let Ok(to) = request.to_header() {
            if let Ok(uri) = to.uri() {
                let user = uri.user().unwrap_or_default().to_string();
                let domain = uri.host_with_port.host.to_string();
                let key = AccountKey::new(user, domain);
                if let Some(handle) = accounts.get(&key) {
                    return Some(handle.config.clone());
                }
            }
        }
        if accounts.len() == 1 {
            return accounts.values().next().map(|h| h.config.clone());
        }
        None
    }

    fn on_transport_closed(&self, addr: SipAddr) {
        warn!("signaling connection lost: {}", addr);
        for handle in self.inner.store.all() {
            handle.events.send(SessionEvent::TransportClosed).ok();
        }
        let accounts = self.inner.accounts.lock().unwrap();
        for handle in accounts.values() {
            if handle.config.edge == addr {
                self.inner
                    .registry
                    .set(&handle.config.key(), account::RegistrationState::Failed);
                handle.control.send(AccountControl::Reregister).ok();
            }
        }
    }

    fn session_context(&self, account: AccountConfig) -> Result<SessionContext> {
        let auth_cache = self.auth_cache(&account.key());
        Ok(SessionContext {
            endpoint: self.inner.endpoint.inner.clone(),
            config: self.inner.config.clone(),
            media: self.inner.media.clone(),
            publisher: self.inner.publisher.clone(),
            store: self.inner.store.clone(),
            account,
            auth_cache,
        })
    }

    fn auth_cache(&self, key: &AccountKey) -> Arc<AuthCache> {
        self.inner
            .auth_caches
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AuthCache::new()))
            .clone()
    }

    // ---- accounts -----------------------------------------------------

    /// Register an account and start its refresh loop.
    pub fn register_account(&self, config: AccountConfig) -> Result<()> {
        let key = config.key();
        let mut accounts = self.inner.accounts.lock().unwrap();
        if accounts.contains_key(&key) {
            return Err(crate::Error::RegistrationError(format!(
                "account already registered: {}",
                key
            )));
        }

        let auth_cache = self.auth_cache(&key);
        let (control_tx, control_rx) = unbounded_channel();
        let task = AccountTask {
            config: config.clone(),
            ua_config: self.inner.config.clone(),
            endpoint: self.inner.endpoint.inner.clone(),
            registry: self.inner.registry.clone(),
            auth_cache,
            control: control_rx,
            cancel: self.inner.cancel_token.child_token(),
        };
        accounts.insert(
            key.clone(),
            AccountHandle {
                config,
                control: control_tx,
            },
        );
        drop(accounts);

        self.inner
            .registry
            .set(&key, account::RegistrationState::None);
        tokio::spawn(task.run());
        info!(account = %key, "account registered");
        Ok(())
    }

    /// Clear the binding (REGISTER with Expires: 0) and stop the loop.
    /// The digest cache survives for the next registration.
    pub fn unregister_account(&self, key: &AccountKey) -> Result<()> {
        let handle = self.inner.accounts.lock().unwrap().remove(key);
        match handle {
            Some(handle) => {
                handle.control.send(AccountControl::Unregister).ok();
                Ok(())
            }
            None => Err(crate::Error::RegistrationError(format!(
                "account not registered: {}",
                key
            ))),
        }
    }

    // ---- calls --------------------------------------------------------

    /// Place a call from the given account; returns the new Call-ID.
    pub async fn make_call(&self, from: &AccountKey, destination: &str) -> Result<String> {
        let account = self
            .inner
            .accounts
            .lock()
            .unwrap()
            .get(from)
            .map(|h| h.config.clone())
            .ok_or_else(|| {
                crate::Error::CallError(format!("account not registered: {}", from))
            })?;

        let destination = if destination.contains(':') {
            destination.to_string()
        } else {
            format!("sip:{}", destination)
        };
        let destination = rsip::Uri::try_from(destination)?;

        let ctx = self.session_context(account)?;
        let handle = CallSession::spawn_outgoing(ctx, destination)?;
        let call_id = handle.call_id.clone();
        self.inner
            .current_call
            .lock()
            .unwrap()
            .replace(call_id.clone());
        Ok(call_id)
    }

    fn current_call(&self) -> Option<Arc<CallHandle>> {
        let call_id = self.inner.current_call.lock().unwrap().clone()?;
        self.inner.store.get(&call_id)
    }

    fn send_action(&self, action: CallAction) -> Result<()> {
        match self.current_call() {
            Some(handle) => {
                handle.events.send(SessionEvent::Action(action))?;
                Ok(())
            }
            None => Err(crate::Error::CallError("no active call".to_string())),
        }
    }

    pub fn accept(&self) -> Result<()> {
        self.send_action(CallAction::Accept)
    }

    pub fn decline(&self) -> Result<()> {
        self.send_action(CallAction::Decline)
    }

    pub fn hangup(&self) -> Result<()> {
        self.send_action(CallAction::Hangup)
    }

    pub fn hold(&self) -> Result<()> {
        self.send_action(CallAction::Hold)
    }

    pub fn resume(&self) -> Result<()> {
        self.send_action(CallAction::Resume)
    }

    /// Queue a DTMF digit on the active call.
    pub fn send_dtmf(
        &self,
        digit: char,
        duration: Option<Duration>,
        mode: Option<DtmfMode>,
    ) -> Result<()> {
        let handle = self
            .current_call()
            .ok_or_else(|| crate::Error::CallError("no active call".to_string()))?;
        handle.dtmf.enqueue(DtmfRequest {
            digit,
            duration: duration.unwrap_or(self.inner.config.dtmf_duration),
            mode: mode.unwrap_or(self.inner.config.dtmf_mode),
        })
    }

    /// Forward a media-engine event to the owning call.
    pub fn media_event(&self, call_id: &str, event: MediaEvent) {
        if let Some(handle) = self.inner.store.get(call_id) {
            handle.events.send(SessionEvent::Media(event)).ok();
        }
    }

    // ---- lifecycle ----------------------------------------------------

    pub fn set_app_state(&self, event: AppEvent) {
        info!("app state: {:?}", event);
        match event {
            AppEvent::Foreground => self.broadcast_control(AccountControl::ExitPush),
            AppEvent::Background => self.broadcast_control(AccountControl::EnterPush),
            AppEvent::DataAvailable => self.broadcast_control(AccountControl::Reregister),
            AppEvent::DataUnavailable => {
                self.inner
                    .registry
                    .set_all(account::RegistrationState::Failed);
            }
            AppEvent::WillTerminate => {
                let ua = self.clone();
                tokio::spawn(async move { ua.shutdown().await });
            }
        }
    }

    fn broadcast_control(&self, control: AccountControl) {
        let accounts = self.inner.accounts.lock().unwrap();
        for handle in accounts.values() {
            handle.control.send(control).ok();
        }
    }

    /// Best-effort teardown: BYE active calls within the shutdown bound,
    /// clear registrations, close transports, cancel every task.
    pub async fn shutdown(&self) {
        info!("user agent shutting down");
        for handle in self.inner.store.all() {
            handle
                .events
                .send(SessionEvent::Action(CallAction::Hangup))
                .ok();
        }
        let deadline = tokio::time::Instant::now() + self.inner.config.shutdown_timeout;
        while self.inner.store.len() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let keys: Vec<AccountKey> = self
            .inner
            .accounts
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        for key in keys {
            self.unregister_account(&key).ok();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        self.inner.cancel_token.cancel();
        self.inner.endpoint.inner.transport_layer.close_all().await;
    }

    // ---- observables --------------------------------------------------

    /// Per-account registration states plus the aggregated summary,
    /// coalesced to one emission per 50 ms burst.
    pub fn registration_states(&self) -> watch::Receiver<RegistrationSnapshot> {
        self.inner.registration_rx.clone()
    }

    /// Latest call snapshot (state, codes, reason, timing).
    pub fn call_state(&self) -> watch::Receiver<Arc<CallStateInfo>> {
        self.inner.call_state_rx.clone()
    }

    /// Same stream as [`UserAgent::call_state`]; named accessor for
    /// consumers that track the detailed lifecycle rather than a
    /// coarse in-call flag.
    pub fn detailed_call_state(&self) -> watch::Receiver<Arc<CallStateInfo>> {
        self.inner.call_state_rx.clone()
    }

    /// `"FROM→TO (reason)"` labels, one per transition.
    pub fn last_state_transition(&self) -> watch::Receiver<String> {
        self.inner.transition_rx.clone()
    }

    pub fn dtmf_queue_status(&self) -> watch::Receiver<DtmfQueueStatus> {
        self.inner.dtmf_status_rx.clone()
    }

    /// Wall-clock time the current call has spent with streams running.
    pub fn call_duration(&self) -> Duration {
        self.inner.call_state_rx.borrow().duration()
    }

    /// Call-log entries for external persistence; may be taken once.
    pub fn take_call_log(&self) -> UnboundedReceiver<CallLogEntry> {
        self.inner
            .call_log_rx
            .lock()
            .unwrap()
            .take()
            .expect("call log already taken")
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.cancel_token.clone()
    }
}
