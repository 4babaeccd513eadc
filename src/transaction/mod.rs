use crate::transport::{SipAddr, SipConnection};
use rsip::SipMessage;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

pub mod endpoint;
pub mod key;
pub mod message;
pub mod timer;
pub mod transaction;
pub use endpoint::{Endpoint, EndpointBuilder};
#[cfg(test)]
mod tests;

pub const TO_TAG_LEN: usize = 8;
pub const BRANCH_LEN: usize = 12;
pub const CNONCE_LEN: usize = 8;
pub const CALL_ID_LEN: usize = 22;

/// Transaction lifecycle over a reliable transport. Without
/// retransmission timers the machine reduces to: request sent/received
/// (`Trying`), provisional seen (`Proceeding`), final seen (`Completed`),
/// ACK seen for server INVITE (`Confirmed`), gone (`Terminated`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Calling,
    Trying,
    Proceeding,
    Completed,
    Confirmed,
    Terminated,
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionState::Calling => "Calling",
            TransactionState::Trying => "Trying",
            TransactionState::Proceeding => "Proceeding",
            TransactionState::Completed => "Completed",
            TransactionState::Confirmed => "Confirmed",
            TransactionState::Terminated => "Terminated",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    ClientInvite,
    ClientNonInvite,
    ServerInvite,
    ServerNonInvite,
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransactionType::ClientInvite => "ClientInvite",
            TransactionType::ClientNonInvite => "ClientNonInvite",
            TransactionType::ServerInvite => "ServerInvite",
            TransactionType::ServerNonInvite => "ServerNonInvite",
        };
        write!(f, "{}", name)
    }
}

/// Events delivered to a transaction by the endpoint dispatch loop.
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    /// The final-response timer fired.
    Timeout,
    /// The connection carrying this transaction went away.
    TransportClosed(SipAddr),
    Terminate,
}

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;

pub fn make_via_branch() -> rsip::Param {
    rsip::Param::Branch(format!("z9hG4bK{}", random_text(BRANCH_LEN)).into())
}

pub fn make_call_id(domain: &str) -> rsip::headers::CallId {
    format!("{}@{}", random_text(CALL_ID_LEN), domain).into()
}

pub fn make_tag() -> rsip::param::Tag {
    random_text(TO_TAG_LEN).into()
}

pub fn random_text(count: usize) -> String {
    use rand::Rng;
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(count)
        .map(char::from)
        .collect::<String>()
}
