use crate::transport::{
    channel::ChannelConnection, SipAddr, SipConnection, TransportEvent, TransportLayer,
};
use crate::Result;
use rsip::prelude::UntypedHeader;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;

fn test_addr(port: u16) -> SipAddr {
    SipAddr::tcp("edge.ex.test", port)
}

#[tokio::test]
async fn test_lookup_prefers_exact_match() -> Result<()> {
    let layer = TransportLayer::new(CancellationToken::new());
    let addr = test_addr(5060);
    assert!(layer.lookup(&addr).is_err());

    let (_incoming_tx, incoming_rx) = unbounded_channel();
    let (outgoing_tx, _outgoing_rx) = unbounded_channel();
    let conn = ChannelConnection::create_connection(incoming_rx, outgoing_tx, addr.clone()).await?;
    layer.add_connection(conn.into());

    let found = layer.lookup(&addr)?;
    assert_eq!(found.get_addr(), &addr);

    // a different edge address falls back to the only live connection
    let other = test_addr(5061);
    let found = layer.lookup(&other)?;
    assert_eq!(found.get_addr(), &addr);
    Ok(())
}

#[tokio::test]
async fn test_channel_round_trip() -> Result<()> {
    let addr = test_addr(5060);
    let (incoming_tx, incoming_rx) = unbounded_channel();
    let (outgoing_tx, mut outgoing_rx) = unbounded_channel();
    let conn = ChannelConnection::create_connection(incoming_rx, outgoing_tx, addr.clone()).await?;

    let register = rsip::message::Request {
        method: rsip::Method::Register,
        uri: rsip::Uri::try_from("sip:ex.test")?,
        headers: vec![
            rsip::headers::Via::new("SIP/2.0/TCP edge.ex.test;branch=z9hG4bKtest").into(),
            rsip::headers::CSeq::new("1 REGISTER").into(),
            rsip::headers::From::new("<sip:alice@ex.test>;tag=a1").into(),
            rsip::headers::To::new("<sip:alice@ex.test>").into(),
            rsip::headers::CallId::new("transport-test").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: Default::default(),
    };

    conn.send(register.clone().into()).await?;
    match outgoing_rx.recv().await {
        Some(TransportEvent::Incoming(msg, SipConnection::Channel(_), from)) => {
            assert_eq!(from, addr);
            assert_eq!(msg.to_string(), rsip::SipMessage::from(register).to_string());
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // events injected by the peer flow through serve_loop
    let (layer_tx, mut layer_rx) = unbounded_channel();
    let serve_conn = conn.clone();
    tokio::spawn(async move { serve_conn.serve_loop(layer_tx).await });
    drop(incoming_tx);
    assert!(layer_rx.recv().await.is_none());
    Ok(())
}
