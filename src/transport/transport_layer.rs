use super::{
    connection::{TransportSender, TransportEvent},
    SipAddr, SipConnection,
};
use crate::Result;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Default)]
struct TransportLayerInner {
    cancel_token: CancellationToken,
    connections: Arc<Mutex<HashMap<SipAddr, SipConnection>>>,
    sender: Mutex<Option<TransportSender>>,
}

/// Registry of the persistent edge connections, keyed by the edge
/// address each account is configured with. Connections added after the
/// endpoint started are served immediately.
#[derive(Clone, Default)]
pub struct TransportLayer {
    inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self {
            inner: Arc::new(TransportLayerInner {
                cancel_token,
                connections: Arc::new(Mutex::new(HashMap::new())),
                sender: Mutex::new(None),
            }),
        }
    }

    /// Register a connection and, once the endpoint is serving, start its
    /// read loop.
    pub fn add_connection(&self, connection: SipConnection) {
        self.inner
            .connections
            .lock()
            .unwrap()
            .insert(connection.get_addr().to_owned(), connection.clone());
        let sender = self.inner.sender.lock().unwrap().clone();
        if let Some(sender) = sender {
            self.inner.spawn_serve(connection, sender);
        }
    }

    pub fn del_connection(&self, addr: &SipAddr) {
        self.inner.connections.lock().unwrap().remove(addr);
    }

    pub fn get_connection(&self, addr: &SipAddr) -> Option<SipConnection> {
        self.inner.connections.lock().unwrap().get(addr).cloned()
    }

    /// Resolve the connection for a request URI: exact edge match first,
    /// otherwise the sole connection if only one exists.
    pub fn lookup(&self, addr: &SipAddr) -> Result<SipConnection> {
        let connections = self.inner.connections.lock().unwrap();
        if let Some(connection) = connections.get(addr) {
            return Ok(connection.clone());
        }
        if connections.len() == 1 {
            if let Some(connection) = connections.values().next() {
                return Ok(connection.clone());
            }
        }
        Err(crate::Error::TransportError(
            "no connection for target".to_string(),
            addr.to_owned(),
        ))
    }

    pub fn get_addrs(&self) -> Vec<SipAddr> {
        self.inner
            .connections
            .lock()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    }

    /// Start read loops for every registered connection and remember the
    /// sender for connections added later.
    pub fn serve(&self, sender: TransportSender) {
        self.inner.sender.lock().unwrap().replace(sender.clone());
        let connections = self
            .inner
            .connections
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for connection in connections {
            self.inner.spawn_serve(connection, sender.clone());
        }
    }

    pub async fn close_all(&self) {
        let connections = self
            .inner
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, c)| c)
            .collect::<Vec<_>>();
        for connection in connections {
            connection.close().await.ok();
        }
    }
}

impl TransportLayerInner {
    fn spawn_serve(&self, connection: SipConnection, sender: TransportSender) {
        let sub_token = self.cancel_token.child_token();
        let connections = self.connections.clone();
        tokio::spawn(async move {
            info!("serving connection: {}", connection);
            select! {
                _ = sub_token.cancelled() => {}
                _ = connection.serve_loop(sender.clone()) => {}
            }
            connections.lock().unwrap().remove(connection.get_addr());
            warn!("connection closed: {}", connection.get_addr());
            sender.send(TransportEvent::Closed(connection)).ok();
        });
    }
}
