use crate::{
    transport::{
        connection::{TransportReceiver, TransportSender},
        SipAddr, SipConnection, TransportEvent,
    },
    Result,
};
use std::sync::{Arc, Mutex};

struct ChannelInner {
    incoming: Mutex<Option<TransportReceiver>>,
    outgoing: TransportSender,
    addr: SipAddr,
}

/// In-memory twin of a stream connection. Tests wire two of these
/// back-to-back to script an edge without sockets.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

impl ChannelConnection {
    pub async fn create_connection(
        incoming: TransportReceiver,
        outgoing: TransportSender,
        addr: SipAddr,
    ) -> Result<Self> {
        Ok(ChannelConnection {
            inner: Arc::new(ChannelInner {
                incoming: Mutex::new(Some(incoming)),
                outgoing,
                addr,
            }),
        })
    }

    pub async fn send(&self, msg: rsip::SipMessage) -> Result<()> {
        let transport = SipConnection::Channel(self.clone());
        let source = self.get_addr().clone();
        self.inner
            .outgoing
            .send(TransportEvent::Incoming(msg, transport, source))
            .map_err(|e| e.into())
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let incoming = self.inner.incoming.lock().unwrap().take();
        let mut incoming = match incoming {
            Some(incoming) => incoming,
            None => {
                return Err(crate::Error::TransportError(
                    "serve_loop called twice".to_string(),
                    self.inner.addr.clone(),
                ))
            }
        };
        while let Some(event) = incoming.recv().await {
            sender.send(event)?;
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Display for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CHANNEL {}", self.inner.addr)
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CHANNEL {}", self.inner.addr)
    }
}
