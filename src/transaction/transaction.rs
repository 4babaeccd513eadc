use super::endpoint::EndpointInnerRef;
use super::key::TransactionKey;
use super::{
    TransactionEvent, TransactionEventReceiver, TransactionEventSender, TransactionState,
    TransactionType,
};
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use rsip::prelude::{HasHeaders, HeadersExt};
use rsip::{Method, Request, Response, SipMessage, StatusCode};
use tokio::sync::mpsc::unbounded_channel;
use tracing::trace;

/// A single client or server transaction. Client transactions are
/// created by callers and driven with `send` / `receive`; server
/// transactions are created by the endpoint dispatch loop and answered
/// with `respond` / `reply`.
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub state: TransactionState,
    /// Where to send the request when it differs from the request URI
    /// (in-dialog requests routed through a Route set).
    pub destination: Option<SipAddr>,
    pub connection: Option<SipConnection>,
    pub last_response: Option<Response>,
    pub(crate) endpoint_inner: EndpointInnerRef,
    pub(crate) tu_sender: TransactionEventSender,
    tu_receiver: TransactionEventReceiver,
    timeout_timer: Option<u64>,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        connection: Option<SipConnection>,
        endpoint_inner: EndpointInnerRef,
    ) -> Self {
        let (tu_sender, tu_receiver) = unbounded_channel();
        Self {
            transaction_type,
            key,
            original,
            state: TransactionState::Calling,
            destination: None,
            connection,
            last_response: None,
            endpoint_inner,
            tu_sender,
            tu_receiver,
            timeout_timer: None,
        }
    }

    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Transaction::new(tx_type, key, original, connection, endpoint_inner)
    }

    pub fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: SipConnection,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        let tx = Transaction::new(tx_type, key, original, Some(connection), endpoint_inner);
        tx.endpoint_inner
            .attach_transaction(&tx.key, tx.tu_sender.clone());
        tx
    }

    pub fn is_client(&self) -> bool {
        matches!(
            self.transaction_type,
            TransactionType::ClientInvite | TransactionType::ClientNonInvite
        )
    }

    /// Send the client request and arm the final-response timer.
    pub async fn send(&mut self) -> Result<()> {
        if !self.is_client() {
            return Err(Error::TransactionError(
                "send is only valid for client transactions".to_string(),
                self.key.clone(),
            ));
        }

        if self.connection.is_none() {
            let target = match &self.destination {
                Some(addr) => addr.clone(),
                None => SipAddr::try_from(&self.original.uri)?,
            };
            let connection = self.endpoint_inner.transport_layer.lookup(&target)?;
            self.connection.replace(connection);
        }

        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no connection found".to_string(),
            self.key.clone(),
        ))?;

        connection.send(self.original.to_owned().into()).await?;
        self.endpoint_inner
            .attach_transaction(&self.key, self.tu_sender.clone());
        self.transition(TransactionState::Trying);

        let timeout = self
            .endpoint_inner
            .transaction_timeout(&self.original.method);
        let timer = self
            .endpoint_inner
            .timers
            .schedule(timeout, self.key.clone());
        self.timeout_timer.replace(timer);
        Ok(())
    }

    /// Send a server response.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if self.is_client() {
            return Err(Error::TransactionError(
                "respond is only valid for server transactions".to_string(),
                self.key.clone(),
            ));
        }

        let connection = self.connection.as_ref().ok_or(Error::TransactionError(
            "no connection found".to_string(),
            self.key.clone(),
        ))?;

        connection.send(response.to_owned().into()).await?;
        match response.status_code.kind() {
            rsip::StatusCodeKind::Provisional => {
                self.transition(TransactionState::Proceeding);
            }
            _ => {
                self.last_response.replace(response);
                match self.transaction_type {
                    TransactionType::ServerInvite => {
                        self.transition(TransactionState::Completed);
                    }
                    _ => {
                        self.transition(TransactionState::Terminated);
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn reply(&mut self, status: StatusCode) -> Result<()> {
        self.reply_with(status, None, None).await
    }

    pub async fn reply_with(
        &mut self,
        status: StatusCode,
        headers: Option<Vec<rsip::Header>>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        let response = self
            .endpoint_inner
            .make_response(&self.original, status, headers, body);
        self.respond(response).await
    }

    /// Next message for the transaction user: responses for client
    /// transactions, the ACK for a server INVITE final. `None` means the
    /// transaction is finished (terminated, cancelled, or its transport
    /// is gone).
    pub async fn receive(&mut self) -> Option<SipMessage> {
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(msg, _connection) => {
                    let msg = match msg {
                        SipMessage::Request(req) => self.on_received_request(req),
                        SipMessage::Response(resp) => self.on_received_response(resp),
                    };
                    if let Some(msg) = msg {
                        return Some(msg);
                    }
                }
                TransactionEvent::Timeout => {
                    self.on_timeout().ok();
                }
                TransactionEvent::TransportClosed(addr) => {
                    let mine = self
                        .connection
                        .as_ref()
                        .map(|c| c.get_addr() == &addr)
                        .unwrap_or(true);
                    if mine {
                        self.transition(TransactionState::Terminated);
                        return None;
                    }
                }
                TransactionEvent::Terminate => {
                    self.transition(TransactionState::Terminated);
                    return None;
                }
            }
        }
        None
    }

    fn on_received_request(&mut self, req: Request) -> Option<SipMessage> {
        if self.is_client() {
            return None;
        }
        match self.state {
            TransactionState::Completed if req.method == Method::Ack => {
                self.transition(TransactionState::Confirmed);
                self.transition(TransactionState::Terminated);
                Some(SipMessage::Request(req))
            }
            // reliable transport: request retransmissions are not expected
            _ => None,
        }
    }

    fn on_received_response(&mut self, resp: Response) -> Option<SipMessage> {
        if !self.is_client() {
            return None;
        }
        match resp.status_code.kind() {
            rsip::StatusCodeKind::Provisional => {
                if self.state == TransactionState::Trying {
                    self.transition(TransactionState::Proceeding);
                }
                Some(SipMessage::Response(resp))
            }
            _ => {
                self.timeout_timer
                    .take()
                    .map(|id| self.endpoint_inner.timers.cancel(id));
                self.last_response.replace(resp.clone());
                match self.transaction_type {
                    TransactionType::ClientInvite => {
                        // the transaction layer ACKs non-2xx finals; an
                        // ACK to a 2xx belongs to the dialog
                        if resp.status_code.kind() != rsip::StatusCodeKind::Successful {
                            self.ack_final_failure(&resp);
                        }
                        self.transition(TransactionState::Completed);
                    }
                    _ => {
                        self.transition(TransactionState::Terminated);
                    }
                }
                Some(SipMessage::Response(resp))
            }
        }
    }

    /// ACK for a non-2xx final: same branch and CSeq number as the
    /// INVITE, To copied from the response so it carries the tag.
    fn ack_final_failure(&self, resp: &Response) {
        let mut ack = self.original.clone();
        ack.method = Method::Ack;
        let built = ack
            .cseq_header_mut()
            .and_then(|cseq| cseq.mut_method(Method::Ack));
        if built.is_err() {
            return;
        }
        if let Ok(to) = resp.to_header() {
            ack.headers_mut().unique_push(rsip::Header::To(to.clone()));
        }
        ack.headers_mut().retain(|h| {
            !matches!(
                h,
                rsip::Header::ContentType(_) | rsip::Header::ContentLength(_)
            )
        });
        ack.headers_mut()
            .unique_push(rsip::Header::ContentLength(0.into()));
        ack.body = vec![];

        if let Some(connection) = self.connection.clone() {
            tokio::spawn(async move {
                connection.send(ack.into()).await.ok();
            });
        }
    }

    /// Surface the timeout as a locally generated 408 so callers see one
    /// uniform failure path.
    fn on_timeout(&mut self) -> Result<()> {
        if matches!(
            self.state,
            TransactionState::Completed | TransactionState::Terminated
        ) {
            return Ok(());
        }
        let timeout_response =
            self.endpoint_inner
                .make_response(&self.original, StatusCode::RequestTimeout, None, None);
        self.tu_sender
            .send(TransactionEvent::Received(timeout_response.into(), None))
            .map_err(|e| Error::TransactionError(e.to_string(), self.key.clone()))
    }

    fn transition(&mut self, state: TransactionState) {
        if self.state == state {
            return;
        }
        trace!("{} transition: {} -> {}", self.key, self.state, state);
        self.state = state;
        if state == TransactionState::Terminated {
            self.cleanup();
        }
    }

    fn cleanup(&mut self) {
        self.timeout_timer
            .take()
            .map(|id| self.endpoint_inner.timers.cancel(id));
        self.endpoint_inner.detach_transaction(&self.key);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
    }
}
