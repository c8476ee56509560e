use crate::controller::SharedController;
use crate::error::Error;
use crate::service::ClientContext;
use crate::zone::{ResourceRequest, ResourceResponse};
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use std::net::{Ipv4Addr, Ipv6Addr};
use tracing::{debug, error};
use trust_dns_proto::op::{Edns, Header, MessageType, OpCode, ResponseCode};
use trust_dns_proto::rr::rdata::opt::{EdnsCode, EdnsOption};
use trust_dns_proto::rr::rdata::TXT;
use trust_dns_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use trust_dns_server::authority::MessageResponseBuilder;
use trust_dns_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};

const VERSION: &str = concat!("rabbitdns ", env!("CARGO_PKG_VERSION"));

/// EDNS client subnet address families ([RFC 7871 §6](https://www.rfc-editor.org/rfc/rfc7871#section-6)).
const FAMILY_IPV4: u16 = 1;
const FAMILY_IPV6: u16 = 2;

#[derive(Clone)]
pub struct Handler {
    controller: SharedController,
    server_id: Option<String>,
}

/// Decode the payload of an EDNS client subnet option into the network it announces.
///
/// Returns `None` for malformed options and unknown families.
#[must_use]
pub fn parse_client_subnet(data: &[u8]) -> Option<IpNetwork> {
    if data.len() < 4 {
        return None;
    }
    let (header, address) = data.split_at(4);
    let family = u16::from_be_bytes([header[0], header[1]]);
    let source_prefix = header[2];
    match family {
        FAMILY_IPV4 => {
            let mut octets = [0_u8; 4];
            octets.get_mut(..address.len())?.copy_from_slice(address);
            Ipv4Network::new(Ipv4Addr::from(octets), source_prefix)
                .ok()
                .map(IpNetwork::V4)
        }
        FAMILY_IPV6 => {
            let mut octets = [0_u8; 16];
            octets.get_mut(..address.len())?.copy_from_slice(address);
            Ipv6Network::new(Ipv6Addr::from(octets), source_prefix)
                .ok()
                .map(IpNetwork::V6)
        }
        _ => None,
    }
}

fn client_subnets(edns: Option<&Edns>) -> Vec<IpNetwork> {
    match edns.and_then(|edns| edns.option(EdnsCode::Subnet)) {
        Some(EdnsOption::Unknown(_, data)) => parse_client_subnet(data).into_iter().collect(),
        _ => Vec::new(),
    }
}

impl Handler {
    pub(super) fn new(controller: SharedController, server_id: Option<String>) -> Self {
        Handler {
            controller,
            server_id,
        }
    }

    async fn dispatch_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response: R,
    ) -> Result<ResponseInfo, Error> {
        // If it isn't a query, return NOTIMPL.
        if request.op_code() != OpCode::Query || request.message_type() != MessageType::Query {
            return self.send_error(request, response, ResponseCode::NotImp).await;
        }

        match request.query().query_class() {
            DNSClass::IN => self.handle_request_in(request, response).await,
            DNSClass::CH => self.handle_request_chaos(request, response).await,
            _ => self.send_error(request, response, ResponseCode::NotImp).await,
        }
    }

    async fn handle_request_in<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> Result<ResponseInfo, Error> {
        let query = request.query();
        let resource_request = ResourceRequest {
            qname: query.name().into(),
            qtype: query.query_type(),
            client: ClientContext {
                source: request.src().ip(),
                subnets: client_subnets(request.edns()),
            },
        };
        debug!(
            qname = %resource_request.qname,
            qtype = %resource_request.qtype,
            src = %request.src(),
            "query"
        );

        match self.controller.get_resource(&resource_request).await {
            Ok(resource) => self.send_resource(request, response_handle, resource).await,
            Err(err) => {
                error!(
                    qname = %resource_request.qname,
                    qtype = %resource_request.qtype,
                    %err,
                    "failed to resolve"
                );
                self.send_error(request, response_handle, ResponseCode::ServFail)
                    .await
            }
        }
    }

    /// Server identity queries: `version.bind`, `hostname.bind` and their `.server` aliases.
    async fn handle_request_chaos<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> Result<ResponseInfo, Error> {
        let query = request.query();
        let name: Name = query.name().into();
        let value = match name.to_lowercase().to_string().as_str() {
            "version.bind." | "version.server." => VERSION.to_string(),
            "hostname.bind." | "id.server." => match &self.server_id {
                Some(server_id) => server_id.clone(),
                None => {
                    return self
                        .send_error(request, response_handle, ResponseCode::Refused)
                        .await
                }
            },
            _ => {
                return self
                    .send_error(request, response_handle, ResponseCode::NXDomain)
                    .await
            }
        };

        let mut resource = ResourceResponse {
            authoritative: true,
            ..ResourceResponse::default()
        };
        if matches!(query.query_type(), RecordType::TXT | RecordType::ANY) {
            let mut record = Record::from_rdata(name, 0, RData::TXT(TXT::new(vec![value])));
            record.set_dns_class(DNSClass::CH);
            resource.answer.push(record);
        }
        self.send_resource(request, response_handle, resource).await
    }

    async fn send_resource<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        resource: ResourceResponse,
    ) -> Result<ResponseInfo, Error> {
        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(resource.authoritative);
        header.set_response_code(resource.rcode);
        let builder = MessageResponseBuilder::from_message_request(request);
        let response = builder.build(
            header,
            resource.answer.iter(),
            resource.authority.iter(),
            &[],
            resource.additional.iter(),
        );
        Ok(response_handle.send_response(response).await?)
    }

    async fn send_error<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        rcode: ResponseCode,
    ) -> Result<ResponseInfo, Error> {
        let response = MessageResponseBuilder::from_message_request(request);
        Ok(response_handle
            .send_response(response.error_msg(request.header(), rcode))
            .await?)
    }
}

#[async_trait::async_trait]
impl RequestHandler for Handler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match self.dispatch_request(request, response_handle).await {
            Ok(info) => info,
            Err(error) => {
                error!("error in RequestHandler: {:?}", error);
                let mut header = Header::new();
                header.set_response_code(ResponseCode::ServFail);
                header.into()
            }
        }
    }
}
