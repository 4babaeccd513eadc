use super::authenticate::AuthCache;
use super::dialog::DialogInner;
use super::DialogId;
use crate::transaction::endpoint::EndpointBuilder;
use crate::transaction::key::TransactionRole;
use crate::transport::SipAddr;
use crate::Result;
use rsip::headers::*;
use rsip::prelude::{HeadersExt, ToTypedHeader, UntypedHeader};
use std::sync::Arc;

fn edge_addr() -> SipAddr {
    SipAddr::tcp("edge.ex.test", 5060)
}

fn invite(from_tag: &str, call_id: &str) -> rsip::Request {
    rsip::Request {
        method: rsip::Method::Invite,
        uri: rsip::Uri::try_from("sip:bob@ex.test").expect("uri"),
        headers: vec![
            Via::new("SIP/2.0/TCP edge.ex.test:5060;branch=z9hG4bKdlgtest").into(),
            CSeq::new("1 INVITE").into(),
            From::new(format!("<sip:alice@ex.test>;tag={}", from_tag)).into(),
            To::new("<sip:bob@ex.test>").into(),
            CallId::new(call_id).into(),
            Contact::new("<sip:alice@edge.ex.test:5060>").into(),
            MaxForwards::new("70").into(),
            ContentLength::new("0").into(),
        ]
        .into(),
        version: rsip::Version::V2,
        body: vec![],
    }
}

fn client_dialog(call_id: &str) -> Result<DialogInner> {
    let endpoint = EndpointBuilder::new().build();
    let id = DialogId {
        call_id: call_id.to_string(),
        from_tag: "alice-tag".to_string(),
        to_tag: String::new(),
    };
    DialogInner::new(
        TransactionRole::Client,
        id,
        invite("alice-tag", call_id),
        endpoint.inner.clone(),
        None,
        Arc::new(AuthCache::new()),
        Some(rsip::Uri::try_from("sip:alice@edge.ex.test:5060").expect("uri")),
        edge_addr(),
    )
}

#[test]
fn test_local_cseq_is_monotonic() -> Result<()> {
    let dialog = client_dialog("cseq-test")?;
    let first = dialog.get_local_seq();
    let second = dialog.increment_local_seq();
    let third = dialog.increment_local_seq();
    assert!(first < second && second < third);

    let bye = dialog.make_request(rsip::Method::Bye, None, None, None)?;
    assert_eq!(bye.cseq_header()?.seq()?, third + 1);
    Ok(())
}

#[test]
fn test_from_tag_is_stable_across_remote_updates() -> Result<()> {
    let dialog = client_dialog("tag-test")?;
    let from_before = dialog.from.clone().untyped().value().to_string();

    dialog.update_remote_tag("bob-tag-1");
    dialog.update_remote_tag("bob-tag-1");
    let from_after = dialog.from.clone().untyped().value().to_string();

    assert_eq!(from_before, from_after);
    assert_eq!(dialog.id().to_tag, "bob-tag-1");
    Ok(())
}

#[test]
fn test_cancel_mirrors_invite_branch_and_cseq() -> Result<()> {
    let dialog = client_dialog("cancel-test")?;
    let cancel = dialog.make_cancel()?;

    assert_eq!(cancel.method, rsip::Method::Cancel);
    assert_eq!(
        cancel.via_header()?.typed()?.branch().map(|b| b.to_string()),
        dialog
            .initial_request
            .via_header()?
            .typed()?
            .branch()
            .map(|b| b.to_string()),
    );
    let cseq = cancel.cseq_header()?;
    assert_eq!(cseq.seq()?, 1);
    assert_eq!(cseq.method()?, rsip::Method::Cancel);
    assert!(cancel.body.is_empty());
    Ok(())
}

#[test]
fn test_ack_reuses_invite_cseq_number() -> Result<()> {
    let dialog = client_dialog("ack-test")?;
    dialog.increment_local_seq();

    let ack = dialog.make_ack()?;
    let cseq = ack.cseq_header()?;
    assert_eq!(cseq.seq()?, 1);
    assert_eq!(cseq.method()?, rsip::Method::Ack);
    Ok(())
}

#[test]
fn test_confirming_response_reverses_route_set() -> Result<()> {
    let dialog = client_dialog("route-test")?;

    let resp = rsip::Response {
        status_code: rsip::StatusCode::OK,
        version: rsip::Version::V2,
        headers: vec![
            Via::new("SIP/2.0/TCP edge.ex.test:5060;branch=z9hG4bKdlgtest").into(),
            CSeq::new("1 INVITE").into(),
            From::new("<sip:alice@ex.test>;tag=alice-tag").into(),
            To::new("<sip:bob@ex.test>;tag=bob-tag").into(),
            CallId::new("route-test").into(),
            Contact::new("<sip:bob@host.ex.test:5070>").into(),
            RecordRoute::new("<sip:p1.ex.test;lr>").into(),
            RecordRoute::new("<sip:p2.ex.test;lr>").into(),
        ]
        .into(),
        body: vec![],
    };

    dialog.apply_confirming_response(&resp)?;

    let routes = dialog.route_set.lock().unwrap().clone();
    assert_eq!(routes.len(), 2);
    assert!(routes[0].value().contains("p2.ex.test"));
    assert!(routes[1].value().contains("p1.ex.test"));

    assert_eq!(
        dialog.remote_uri.lock().unwrap().host_with_port.to_string(),
        "host.ex.test:5070"
    );
    assert_eq!(dialog.id().to_tag, "bob-tag");

    // subsequent in-dialog requests carry the learned route set
    let bye = dialog.make_request(rsip::Method::Bye, None, None, None)?;
    let route_headers: Vec<_> = bye
        .headers
        .iter()
        .filter(|h| matches!(h, rsip::Header::Route(_)))
        .collect();
    assert_eq!(route_headers.len(), 2);
    Ok(())
}
