use super::{channel::ChannelConnection, sip_addr::SipAddr, stream::StreamConnection, tcp::TcpConnection};
use crate::Result;
use rsip::SipMessage;
use std::fmt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// Events surfaced by the transport layer to the protocol engine.
#[derive(Debug)]
pub enum TransportEvent {
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// A live signaling connection. Both variants are reliable message
/// transports; the channel variant exists so tests can stand in for the
/// network.
#[derive(Clone, Debug)]
pub enum SipConnection {
    Tcp(TcpConnection),
    Channel(ChannelConnection),
}

impl SipConnection {
    /// Reliable transports need no retransmission timers.
    pub fn is_reliable(&self) -> bool {
        true
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Tcp(transport) => transport.get_addr(),
            SipConnection::Channel(transport) => transport.get_addr(),
        }
    }

    pub async fn send(&self, msg: SipMessage) -> Result<()> {
        debug!("sending to {}:\n{}", self.get_addr(), msg);
        match self {
            SipConnection::Tcp(transport) => transport.send_message(msg).await,
            SipConnection::Channel(transport) => transport.send(msg).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Tcp(transport) => transport.serve_loop(sender).await,
            SipConnection::Channel(transport) => transport.serve_loop(sender).await,
        }
    }

    pub async fn close(&self) -> Result<()> {
        match self {
            SipConnection::Tcp(transport) => StreamConnection::close(transport).await,
            SipConnection::Channel(transport) => transport.close().await,
        }
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipConnection::Tcp(t) => write!(f, "{}", t),
            SipConnection::Channel(t) => write!(f, "{}", t),
        }
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(connection: TcpConnection) -> Self {
        SipConnection::Tcp(connection)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(connection: ChannelConnection) -> Self {
        SipConnection::Channel(connection)
    }
}
