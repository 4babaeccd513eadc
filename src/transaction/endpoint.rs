use super::key::TransactionKey;
use super::timer::TimerQueue;
use super::transaction::Transaction;
use super::{TransactionEvent, TransactionEventSender};
use crate::transport::{SipAddr, TransportEvent, TransportLayer, TransportReceiver};
use crate::Result;
use rsip::SipMessage;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{select, sync::mpsc::unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const USER_AGENT: &str = concat!("sipua/", env!("CARGO_PKG_VERSION"));
const TIMER_INTERVAL: Duration = Duration::from_millis(20);
const DEFAULT_INVITE_TIMEOUT: Duration = Duration::from_secs(180);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(32);

pub const ALLOWED_METHODS: &[rsip::Method] = &[
    rsip::Method::Invite,
    rsip::Method::Ack,
    rsip::Method::Bye,
    rsip::Method::Cancel,
    rsip::Method::Register,
    rsip::Method::Options,
    rsip::Method::Info,
];

/// `Allow` header advertising the methods this agent understands.
pub fn allow_header() -> rsip::Header {
    let allowed = ALLOWED_METHODS
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    rsip::Header::Allow(allowed.into())
}

/// What the dispatch loop hands up to the user-agent layer.
pub enum EndpointEvent {
    /// A new server transaction (INVITE, BYE, CANCEL, INFO, OPTIONS, ...).
    Request(Transaction),
    /// An ACK to a 2xx: its own transaction per RFC 3261, absorbed at the
    /// dialog it belongs to.
    Ack(rsip::Request),
    /// A connection went away; in-flight transactions on it have already
    /// been failed.
    TransportClosed(SipAddr),
}

pub type EndpointEventReceiver = tokio::sync::mpsc::UnboundedReceiver<EndpointEvent>;
pub type EndpointEventSender = tokio::sync::mpsc::UnboundedSender<EndpointEvent>;

pub struct EndpointInner {
    pub user_agent: String,
    pub invite_timeout: Duration,
    pub request_timeout: Duration,
    pub timers: TimerQueue<TransactionKey>,
    pub transport_layer: TransportLayer,
    pub cancel_token: CancellationToken,
    transactions: Mutex<HashMap<TransactionKey, TransactionEventSender>>,
    event_sender: EndpointEventSender,
    timer_interval: Duration,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

pub struct EndpointBuilder {
    user_agent: String,
    transport_layer: Option<TransportLayer>,
    cancel_token: Option<CancellationToken>,
    timer_interval: Option<Duration>,
    invite_timeout: Duration,
    request_timeout: Duration,
}

/// The protocol engine: owns the transport layer, matches inbound
/// messages to transactions, pumps timers, and surfaces everything else
/// through `EndpointEvent`s.
pub struct Endpoint {
    pub inner: EndpointInnerRef,
    event_receiver: Mutex<Option<EndpointEventReceiver>>,
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: USER_AGENT.to_string(),
            transport_layer: None,
            cancel_token: None,
            timer_interval: None,
            invite_timeout: DEFAULT_INVITE_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_user_agent(&mut self, user_agent: &str) -> &mut Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_transport_layer(&mut self, transport_layer: TransportLayer) -> &mut Self {
        self.transport_layer.replace(transport_layer);
        self
    }

    pub fn with_cancel_token(&mut self, cancel_token: CancellationToken) -> &mut Self {
        self.cancel_token.replace(cancel_token);
        self
    }

    pub fn with_timer_interval(&mut self, timer_interval: Duration) -> &mut Self {
        self.timer_interval.replace(timer_interval);
        self
    }

    pub fn with_timeouts(&mut self, invite: Duration, request: Duration) -> &mut Self {
        self.invite_timeout = invite;
        self.request_timeout = request;
        self
    }

    pub fn build(&mut self) -> Endpoint {
        let cancel_token = self.cancel_token.take().unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .take()
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        let (event_sender, event_receiver) = unbounded_channel();

        let inner = Arc::new(EndpointInner {
            user_agent: self.user_agent.clone(),
            invite_timeout: self.invite_timeout,
            request_timeout: self.request_timeout,
            timers: TimerQueue::new(),
            transport_layer,
            cancel_token,
            transactions: Mutex::new(HashMap::new()),
            event_sender,
            timer_interval: self.timer_interval.unwrap_or(TIMER_INTERVAL),
        });

        Endpoint {
            inner,
            event_receiver: Mutex::new(Some(event_receiver)),
        }
    }
}

impl Endpoint {
    /// Run the dispatch and timer loops until cancelled.
    pub async fn serve(&self) {
        let (transport_sender, transport_receiver) = unbounded_channel();
        self.inner.transport_layer.serve(transport_sender);

        select! {
            _ = self.inner.cancel_token.cancelled() => {
                info!("endpoint cancelled");
            }
            _ = self.inner.process_timers() => {}
            _ = self.inner.dispatch(transport_receiver) => {}
        }
        info!("endpoint shutdown");
    }

    pub fn shutdown(&self) {
        info!("endpoint shutdown requested");
        self.inner.cancel_token.cancel();
    }

    pub fn client_transaction(&self, request: rsip::Request) -> Result<Transaction> {
        let key = TransactionKey::from_request(&request)?;
        Ok(Transaction::new_client(
            key,
            request,
            self.inner.clone(),
            None,
        ))
    }

    /// The event stream for the user-agent layer; may be taken once.
    pub fn take_events(&self) -> EndpointEventReceiver {
        self.event_receiver
            .lock()
            .unwrap()
            .take()
            .expect("endpoint events already taken")
    }
}

impl EndpointInner {
    pub fn transaction_timeout(&self, method: &rsip::Method) -> Duration {
        match method {
            rsip::Method::Invite => self.invite_timeout,
            _ => self.request_timeout,
        }
    }

    pub fn attach_transaction(&self, key: &TransactionKey, tu_sender: TransactionEventSender) {
        self.transactions
            .lock()
            .unwrap()
            .insert(key.clone(), tu_sender);
    }

    pub fn detach_transaction(&self, key: &TransactionKey) {
        self.transactions.lock().unwrap().remove(key);
    }

    async fn process_timers(&self) {
        while !self.cancel_token.is_cancelled() {
            for key in self.timers.due(Instant::now()) {
                let sender = self.transactions.lock().unwrap().get(&key).cloned();
                if let Some(sender) = sender {
                    if sender.send(TransactionEvent::Timeout).is_err() {
                        self.detach_transaction(&key);
                    }
                }
            }
            tokio::time::sleep(self.timer_interval).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, mut receiver: TransportReceiver) {
        while let Some(event) = receiver.recv().await {
            match event {
                TransportEvent::Incoming(msg, connection, from) => {
                    if let Err(e) = self.on_incoming(msg, connection, &from) {
                        warn!("error dispatching message from {}: {}", from, e);
                    }
                }
                TransportEvent::New(connection) => {
                    debug!("new connection: {}", connection);
                }
                TransportEvent::Closed(connection) => {
                    let addr = connection.get_addr().clone();
                    let senders = self
                        .transactions
                        .lock()
                        .unwrap()
                        .values()
                        .cloned()
                        .collect::<Vec<_>>();
                    for sender in senders {
                        sender
                            .send(TransactionEvent::TransportClosed(addr.clone()))
                            .ok();
                    }
                    self.event_sender
                        .send(EndpointEvent::TransportClosed(addr))
                        .ok();
                }
            }
        }
    }

    fn on_incoming(
        self: &Arc<Self>,
        msg: SipMessage,
        connection: crate::transport::SipConnection,
        from: &SipAddr,
    ) -> Result<()> {
        match msg {
            SipMessage::Request(req) => {
                let key = TransactionKey::from_request(&req)?;
                let existing = self.transactions.lock().unwrap().get(&key).cloned();
                if let Some(sender) = existing {
                    sender
                        .send(TransactionEvent::Received(
                            req.into(),
                            Some(connection),
                        ))
                        .ok();
                    return Ok(());
                }
                if req.method == rsip::Method::Ack {
                    // ACK to a 2xx: no transaction to match, the owning
                    // dialog absorbs it
                    self.event_sender.send(EndpointEvent::Ack(req)).ok();
                    return Ok(());
                }
                let tx = Transaction::new_server(key, req, self.clone(), connection);
                self.event_sender.send(EndpointEvent::Request(tx)).ok();
            }
            SipMessage::Response(resp) => {
                let key = TransactionKey::from_response(&resp)?;
                let existing = self.transactions.lock().unwrap().get(&key).cloned();
                match existing {
                    Some(sender) => {
                        sender
                            .send(TransactionEvent::Received(
                                resp.into(),
                                Some(connection),
                            ))
                            .ok();
                    }
                    None => {
                        debug!(%key, "dropping response without transaction from {}", from);
                    }
                }
            }
        }
        Ok(())
    }
}
