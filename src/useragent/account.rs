use crate::config::UserAgentConfig;
use crate::dialog::authenticate::{AuthCache, Credential};
use crate::dialog::registration::{granted_expires, Registration};
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transport::{tcp::TcpConnection, SipAddr};
use crate::Result;
use rand::Rng;
use rsip::{Param, StatusCode};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Emission gap for the aggregated registration observable.
const SUMMARY_COALESCE: Duration = Duration::from_millis(50);
/// Floor for the refresh sleep when the server grants a tiny expiry.
const MIN_REFRESH: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountKey {
    pub user: String,
    pub domain: String,
}

impl AccountKey {
    pub fn new(user: impl Into<String>, domain: impl Into<String>) -> Self {
        AccountKey {
            user: user.into(),
            domain: domain.into(),
        }
    }
}

impl std::fmt::Display for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.domain)
    }
}

/// Push-gateway contact parameters, carried on the Contact URI while in
/// push mode so the server can wake the device.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub provider: String,
    pub prid: String,
    pub param: String,
}

#[derive(Clone)]
pub struct AccountConfig {
    pub user: String,
    pub domain: String,
    pub password: String,
    pub display_name: Option<String>,
    /// The signaling edge this account connects to.
    pub edge: SipAddr,
    /// Registration lifetime to request; `None` uses the agent default.
    pub expires: Option<u32>,
    pub push: Option<PushConfig>,
}

impl AccountConfig {
    pub fn key(&self) -> AccountKey {
        AccountKey::new(self.user.clone(), self.domain.clone())
    }

    pub fn aor(&self) -> Result<rsip::Uri> {
        rsip::Uri::try_from(format!("sip:{}@{}", self.user, self.domain)).map_err(Into::into)
    }

    pub fn credential(&self) -> Credential {
        Credential {
            username: self.user.clone(),
            password: self.password.clone(),
        }
    }

    /// Contact URI bound to the edge connection; push mode decorates it
    /// with the pn-* parameters.
    pub fn contact(&self, push_mode: bool) -> rsip::typed::Contact {
        let mut uri = rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            auth: Some(rsip::auth::Auth {
                user: self.user.clone(),
                password: None,
            }),
            host_with_port: self.edge.addr.clone(),
            ..Default::default()
        };
        uri.params.push(Param::Transport(
            self.edge
                .transport
                .unwrap_or(rsip::transport::Transport::Tcp),
        ));
        if push_mode {
            if let Some(push) = &self.push {
                for (name, value) in [
                    ("pn-provider", &push.provider),
                    ("pn-prid", &push.prid),
                    ("pn-param", &push.param),
                ] {
                    uri.params.push(Param::Other(
                        rsip::param::OtherParam::new(name),
                        Some(rsip::param::OtherParamValue::new(value.clone())),
                    ));
                }
            }
        }
        rsip::typed::Contact {
            display_name: self.display_name.clone().map(Into::into),
            uri,
            params: vec![],
        }
    }
}

/// Registration lifecycle per account. `InProgress` is the first
/// REGISTER of a cycle, `Progress` a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    None,
    Progress,
    InProgress,
    Ok,
    Failed,
    Cleared,
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RegistrationState::None => "NONE",
            RegistrationState::Progress => "PROGRESS",
            RegistrationState::InProgress => "IN_PROGRESS",
            RegistrationState::Ok => "OK",
            RegistrationState::Failed => "FAILED",
            RegistrationState::Cleared => "CLEARED",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum AccountControl {
    /// Re-register now (reconnect nudge, push-mode flip already applied).
    Reregister,
    EnterPush,
    ExitPush,
    Unregister,
}

pub(crate) struct AccountHandle {
    pub config: AccountConfig,
    pub control: UnboundedSender<AccountControl>,
}

/// The aggregated registration observable.
#[derive(Debug, Clone, Default)]
pub struct RegistrationSnapshot {
    pub states: HashMap<AccountKey, RegistrationState>,
    /// e.g. `"3/4 registered"`.
    pub summary: String,
}

impl RegistrationSnapshot {
    fn from_states(states: HashMap<AccountKey, RegistrationState>) -> Self {
        let registered = states
            .values()
            .filter(|s| **s == RegistrationState::Ok)
            .count();
        let summary = format!("{}/{} registered", registered, states.len());
        RegistrationSnapshot { states, summary }
    }
}

/// Collects per-account state updates and publishes a coalesced
/// snapshot: at most one emission per 50 ms burst.
pub(crate) struct RegistryHub {
    states: Mutex<HashMap<AccountKey, RegistrationState>>,
    dirty: Notify,
    tx: watch::Sender<RegistrationSnapshot>,
}

impl RegistryHub {
    pub fn new() -> (Arc<Self>, watch::Receiver<RegistrationSnapshot>) {
        let (tx, rx) = watch::channel(RegistrationSnapshot::default());
        (
            Arc::new(RegistryHub {
                states: Mutex::new(HashMap::new()),
                dirty: Notify::new(),
                tx,
            }),
            rx,
        )
    }

    pub fn set(&self, key: &AccountKey, state: RegistrationState) {
        info!(account = %key, %state, "registration state");
        self.states.lock().unwrap().insert(key.clone(), state);
        self.dirty.notify_one();
    }

    pub fn get(&self, key: &AccountKey) -> Option<RegistrationState> {
        self.states.lock().unwrap().get(key).copied()
    }

    pub fn set_all(&self, state: RegistrationState) {
        let mut states = self.states.lock().unwrap();
        for value in states.values_mut() {
            *value = state;
        }
        drop(states);
        self.dirty.notify_one();
    }

    pub async fn coalesce_loop(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            select! {
                _ = cancel.cancelled() => break,
                _ = self.dirty.notified() => {}
            }
            tokio::time::sleep(SUMMARY_COALESCE).await;
            let snapshot = RegistrationSnapshot::from_states(self.states.lock().unwrap().clone());
            self.tx.send(snapshot).ok();
        }
    }
}

/// Cooperative registration loop for one account: register, refresh
/// ahead of expiry, back off on failure, flip contacts on push-mode
/// changes, clear on unregister. REGISTERs are serialized by
/// construction; the loop never has two in flight.
pub(crate) struct AccountTask {
    pub config: AccountConfig,
    pub ua_config: UserAgentConfig,
    pub endpoint: EndpointInnerRef,
    pub registry: Arc<RegistryHub>,
    pub auth_cache: Arc<AuthCache>,
    pub control: UnboundedReceiver<AccountControl>,
    pub cancel: CancellationToken,
}

fn jitter(base: Duration) -> Duration {
    let factor = rand::rng().random_range(0.8..1.2);
    base.mul_f64(factor)
}

/// Refresh lead time: `granted - max(30 s, granted / 10)`, floored so a
/// pathologically short grant still refreshes instead of spinning.
fn refresh_after(granted: u32) -> Duration {
    let lead = 30.max(granted / 10);
    let refresh = granted.saturating_sub(lead) as u64;
    Duration::from_secs(refresh).max(MIN_REFRESH)
}

impl AccountTask {
    pub async fn run(mut self) {
        let key = self.config.key();
        let expires = self
            .config
            .expires
            .unwrap_or(self.ua_config.register_expires);
        let aor = match self.config.aor() {
            Ok(aor) => aor,
            Err(e) => {
                warn!(account = %key, "invalid account AOR: {}", e);
                self.registry.set(&key, RegistrationState::Failed);
                return;
            }
        };

        let mut registration = Registration::new(
            self.endpoint.clone(),
            Some(self.config.credential()),
            self.auth_cache.clone(),
        );
        let mut push_mode = false;
        let mut first = true;
        let mut backoff = self.ua_config.register_retry_base;

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.registry.set(
                &key,
                if first {
                    RegistrationState::InProgress
                } else {
                    RegistrationState::Progress
                },
            );

            let contact = self.config.contact(push_mode);
            let result = match self.ensure_connection().await {
                Ok(()) => {
                    registration
                        .register(&aor, contact, &self.config.edge, expires)
                        .await
                }
                Err(e) => Err(e),
            };

            let wait = match result {
                Ok(resp) if resp.status_code == StatusCode::OK => {
                    first = false;
                    backoff = self.ua_config.register_retry_base;
                    self.registry.set(&key, RegistrationState::Ok);
                    let granted = granted_expires(&resp, expires);
                    refresh_after(granted)
                }
                Ok(resp) => {
                    warn!(account = %key, "registration failed: {}", resp.status_code);
                    self.registry.set(&key, RegistrationState::Failed);
                    let wait = jitter(backoff);
                    backoff = (backoff * 2).min(self.ua_config.register_retry_cap);
                    wait
                }
                Err(e) => {
                    warn!(account = %key, "registration error: {}", e);
                    self.registry.set(&key, RegistrationState::Failed);
                    let wait = jitter(backoff);
                    backoff = (backoff * 2).min(self.ua_config.register_retry_cap);
                    wait
                }
            };

            select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
                ctrl = self.control.recv() => {
                    match ctrl {
                        Some(AccountControl::Reregister) => {}
                        Some(AccountControl::EnterPush) => {
                            if self.config.push.is_some() {
                                push_mode = true;
                            }
                        }
                        Some(AccountControl::ExitPush) => push_mode = false,
                        Some(AccountControl::Unregister) | None => {
                            self.unregister(&mut registration, &aor, &key, push_mode).await;
                            return;
                        }
                    }
                    // mode changes and nudges re-register immediately;
                    // the pending refresh sleep is abandoned here
                }
            }
        }

        self.unregister(&mut registration, &aor, &key, push_mode)
            .await;
    }

    /// Re-dial the edge when its connection is gone. Channel transports
    /// are provisioned externally and only looked up.
    async fn ensure_connection(&self) -> Result<()> {
        if self
            .endpoint
            .transport_layer
            .get_connection(&self.config.edge)
            .is_some()
        {
            return Ok(());
        }
        match self.config.edge.transport {
            Some(rsip::transport::Transport::Tcp) => {
                let connection = TcpConnection::connect(
                    &self.config.edge,
                    Some(self.cancel.child_token()),
                    Some(self.ua_config.transport_write_timeout),
                )
                .await?;
                self.endpoint.transport_layer.add_connection(connection.into());
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn unregister(
        &self,
        registration: &mut Registration,
        aor: &rsip::Uri,
        key: &AccountKey,
        push_mode: bool,
    ) {
        let contact = self.config.contact(push_mode);
        match registration
            .register(aor, contact, &self.config.edge, 0)
            .await
        {
            Ok(resp) if resp.status_code == StatusCode::OK => {
                self.registry.set(key, RegistrationState::Cleared);
            }
            Ok(resp) => {
                warn!(account = %key, "unregister failed: {}", resp.status_code);
                self.registry.set(key, RegistrationState::Failed);
            }
            Err(e) => {
                warn!(account = %key, "unregister error: {}", e);
                self.registry.set(key, RegistrationState::Failed);
            }
        }
    }
}
