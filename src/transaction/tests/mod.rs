use crate::transaction::endpoint::{Endpoint, EndpointBuilder};
use crate::transport::{
    channel::ChannelConnection, SipAddr, SipConnection, TransportEvent, TransportLayer,
    TransportSender,
};
use crate::Result;
use rsip::prelude::{HeadersExt, ToTypedHeader};
use rsip::{Header, SipMessage, StatusCode};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

pub(crate) struct TestEdge {
    pub endpoint: Arc<Endpoint>,
    pub connection: SipConnection,
    /// Messages the endpoint sent towards the edge.
    pub outbound: UnboundedReceiver<TransportEvent>,
    /// Feed for messages the edge sends back.
    pub inbound: TransportSender,
    pub addr: SipAddr,
}

impl TestEdge {
    pub fn reply(&self, req: &rsip::Request, status: StatusCode, to_tag: Option<&str>) {
        let mut headers = req.headers.clone();
        headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::CSeq(_)
            )
        });
        if let Some(tag) = to_tag {
            if let Ok(to) = req.to_header() {
                if let Ok(typed) = to.typed() {
                    headers.unique_push(Header::To(typed.with_tag(tag.into()).into()));
                }
            }
        }
        headers.unique_push(Header::ContentLength(0.into()));
        let resp = rsip::Response {
            status_code: status,
            version: rsip::Version::V2,
            headers,
            body: vec![],
        };
        self.inbound
            .send(TransportEvent::Incoming(
                resp.into(),
                self.connection.clone(),
                self.addr.clone(),
            ))
            .expect("inject response");
    }

    pub async fn next_request(&mut self) -> rsip::Request {
        match self.outbound.recv().await {
            Some(TransportEvent::Incoming(SipMessage::Request(req), _, _)) => req,
            other => panic!("expected outbound request, got {:?}", other),
        }
    }
}

pub(crate) async fn test_edge(invite_timeout: Duration, request_timeout: Duration) -> TestEdge {
    let token = CancellationToken::new();
    let transport_layer = TransportLayer::new(token.child_token());

    let addr = SipAddr::tcp("edge.ex.test", 5060);

    let (inbound_tx, inbound_rx) = unbounded_channel();
    let (outbound_tx, outbound_rx) = unbounded_channel();
    let connection = ChannelConnection::create_connection(inbound_rx, outbound_tx, addr.clone())
        .await
        .expect("channel connection");
    let connection = SipConnection::Channel(connection);
    transport_layer.add_connection(connection.clone());

    let endpoint = Arc::new(
        EndpointBuilder::new()
            .with_user_agent("sipua-test")
            .with_cancel_token(token)
            .with_transport_layer(transport_layer)
            .with_timer_interval(Duration::from_millis(5))
            .with_timeouts(invite_timeout, request_timeout)
            .build(),
    );
    let serve_ref = endpoint.clone();
    tokio::spawn(async move { serve_ref.serve().await });

    TestEdge {
        endpoint,
        connection,
        outbound: outbound_rx,
        inbound: inbound_tx,
        addr,
    }
}

fn make_register() -> Result<rsip::Request> {
    use rsip::headers::*;
    Ok(rsip::Request {
        method: rsip::Method::Register,
        uri: rsip::Uri::try_from("sip:ex.test")?,
        headers: vec![
            Via::new("SIP/2.0/TCP edge.ex.test:5060;branch=z9hG4bKtxtest1").into(),
            CSeq::new("1 REGISTER").into(),
            From::new("<sip:alice@ex.test>;tag=txfrom").into(),
            To::new("<sip:alice@ex.test>").into(),
            CallId::new("tx-test@ex.test").into(),
            ContentLength::new("0").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    })
}

#[tokio::test]
async fn test_client_transaction_receives_final() -> Result<()> {
    let mut edge = test_edge(Duration::from_secs(5), Duration::from_secs(5)).await;

    let mut tx = edge.endpoint.client_transaction(make_register()?)?;
    tx.send().await?;

    let sent = edge.next_request().await;
    assert_eq!(sent.method, rsip::Method::Register);

    edge.reply(&sent, StatusCode::Trying, None);
    edge.reply(&sent, StatusCode::OK, None);

    let mut saw_ok = false;
    while let Some(msg) = tx.receive().await {
        if let SipMessage::Response(resp) = msg {
            if resp.status_code == StatusCode::OK {
                saw_ok = true;
                break;
            }
        }
    }
    assert!(saw_ok);
    Ok(())
}

#[tokio::test]
async fn test_client_transaction_times_out_as_408() -> Result<()> {
    let mut edge = test_edge(Duration::from_millis(50), Duration::from_millis(50)).await;

    let mut tx = edge.endpoint.client_transaction(make_register()?)?;
    tx.send().await?;
    let _ = edge.next_request().await;

    match tx.receive().await {
        Some(SipMessage::Response(resp)) => {
            assert_eq!(resp.status_code, StatusCode::RequestTimeout);
        }
        other => panic!("expected timeout response, got {:?}", other.map(|m| m.to_string())),
    }
    Ok(())
}

#[tokio::test]
async fn test_transport_close_fails_in_flight_transactions() -> Result<()> {
    let mut edge = test_edge(Duration::from_secs(5), Duration::from_secs(5)).await;

    let mut tx = edge.endpoint.client_transaction(make_register()?)?;
    tx.send().await?;
    let _ = edge.next_request().await;

    edge.inbound
        .send(TransportEvent::Closed(edge.connection.clone()))
        .expect("inject close");

    assert!(tx.receive().await.is_none());
    Ok(())
}
