use crate::{
    transport::{
        codec::SipCodec,
        connection::{TransportSender, KEEPALIVE_RESPONSE},
        SipAddr, SipConnection, TransportEvent,
    },
    Result,
};
use bytes::BytesMut;
use rsip::SipMessage;
use std::time::Duration;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// A stream transport: read/write a full-duplex byte stream as framed SIP
/// messages.
#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync + 'static {
    fn get_addr(&self) -> &SipAddr;

    async fn send_message(&self, msg: SipMessage) -> Result<()>;

    async fn send_raw(&self, data: &[u8]) -> Result<()>;

    async fn serve_loop(&self, sender: TransportSender) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Shared state between the read and write halves of a stream transport.
pub struct StreamConnectionInner<R, W> {
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    read_half: Mutex<Option<R>>,
    write_half: Mutex<W>,
    write_timeout: Duration,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        local_addr: SipAddr,
        remote_addr: SipAddr,
        read_half: R,
        write_half: W,
        write_timeout: Duration,
    ) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
            write_timeout,
        }
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.send_raw(msg.to_string().as_bytes()).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        let mut lock = self.write_half.lock().await;
        let write = async {
            lock.write_all(data).await?;
            lock.flush().await?;
            Ok::<_, crate::Error>(())
        };
        tokio::time::timeout(self.write_timeout, write)
            .await
            .map_err(|_| {
                crate::Error::TransportError(
                    "write timed out".to_string(),
                    self.remote_addr.clone(),
                )
            })?
    }

    /// Read frames until the peer closes or an unrecoverable error occurs.
    /// Malformed frames are dropped and counted against the peer in the
    /// log only; keepalive requests are answered inline.
    pub async fn serve_loop(
        &self,
        sender: TransportSender,
        connection: SipConnection,
    ) -> Result<()> {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(half) => half,
            None => {
                return Err(crate::Error::TransportError(
                    "serve_loop called twice".to_string(),
                    self.remote_addr.clone(),
                ))
            }
        };

        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(4096);
        let mut read_buf = [0u8; 4096];

        loop {
            match read_half.read(&mut read_buf).await {
                Ok(0) => {
                    debug!("connection closed by peer: {}", self.remote_addr);
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&read_buf[0..n]);
                    loop {
                        match codec.decode(&mut buffer) {
                            Ok(Some(msg)) => {
                                sender.send(TransportEvent::Incoming(
                                    msg,
                                    connection.clone(),
                                    self.remote_addr.clone(),
                                ))?;
                            }
                            Ok(None) => break,
                            Err(crate::Error::Keepalive) => {
                                self.send_raw(KEEPALIVE_RESPONSE).await.ok();
                            }
                            Err(e) => {
                                warn!("dropping malformed frame from {}: {}", self.remote_addr, e);
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("read error from {}: {}", self.remote_addr, e);
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut lock = self.write_half.lock().await;
        lock.shutdown().await.ok();
        Ok(())
    }
}
