use super::{endpoint::EndpointInner, make_via_branch};
use crate::transport::SipAddr;
use crate::Result;
use rsip::{Header, Request, Response, StatusCode};

impl EndpointInner {
    /// Via for a fresh out-of-dialog request, stamped with a new branch.
    pub fn get_via(&self, addr: Option<SipAddr>) -> Result<rsip::typed::Via> {
        let addr = match addr {
            Some(addr) => addr,
            None => self
                .transport_layer
                .get_addrs()
                .into_iter()
                .next()
                .ok_or_else(|| crate::Error::Error("no transport available".to_string()))?,
        };
        Ok(rsip::typed::Via {
            version: rsip::Version::V2,
            transport: addr.transport.unwrap_or(rsip::transport::Transport::Tcp),
            uri: rsip::Uri {
                host_with_port: addr.addr,
                ..Default::default()
            },
            params: vec![make_via_branch()],
        })
    }

    pub fn make_request(
        &self,
        method: rsip::Method,
        req_uri: rsip::Uri,
        via: rsip::typed::Via,
        from: rsip::typed::From,
        to: rsip::typed::To,
        call_id: rsip::headers::CallId,
        seq: u32,
    ) -> rsip::Request {
        let headers = vec![
            Header::Via(via.into()),
            Header::CallId(call_id),
            Header::From(from.into()),
            Header::To(to.into()),
            Header::CSeq(rsip::typed::CSeq { seq, method }.into()),
            Header::MaxForwards(70.into()),
            Header::UserAgent(self.user_agent.clone().into()),
        ];
        rsip::Request {
            method,
            uri: req_uri,
            headers: headers.into(),
            body: vec![],
            version: rsip::Version::V2,
        }
    }

    pub fn make_response(
        &self,
        req: &Request,
        status_code: StatusCode,
        headers: Option<Vec<Header>>,
        body: Option<Vec<u8>>,
    ) -> Response {
        let mut resp_headers = req.headers.clone();
        resp_headers.retain(|h| {
            matches!(
                h,
                Header::Via(_)
                    | Header::CallId(_)
                    | Header::From(_)
                    | Header::To(_)
                    | Header::CSeq(_)
                    | Header::RecordRoute(_)
            )
        });
        resp_headers.unique_push(Header::UserAgent(self.user_agent.clone().into()));
        if let Some(headers) = headers {
            for header in headers {
                resp_headers.unique_push(header);
            }
        }
        resp_headers.unique_push(Header::ContentLength(
            body.as_ref().map_or(0u32, |b| b.len() as u32).into(),
        ));
        Response {
            status_code,
            version: req.version().clone(),
            headers: resp_headers,
            body: body.unwrap_or_default(),
        }
    }
}
