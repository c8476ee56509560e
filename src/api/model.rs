use crate::zone::ResourceResponse;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use trust_dns_proto::rr::Record;

fn default_type() -> String {
    "A".to_string()
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub(super) struct ResolveQuery {
    pub name: String,
    #[serde(rename = "type", default = "default_type")]
    pub rtype: String,
    /// Resolve as if asked from this address instead of the API client's.
    pub client: Option<IpAddr>,
    /// Resolve as if the query carried this client subnet option.
    pub subnet: Option<IpNetwork>,
}

#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub(super) struct ResolveResult {
    pub rcode: String,
    pub authoritative: bool,
    pub answer: Vec<String>,
    pub authority: Vec<String>,
    pub additional: Vec<String>,
}

fn presentation(records: &[Record]) -> Vec<String> {
    records.iter().map(ToString::to_string).collect()
}

impl From<ResourceResponse> for ResolveResult {
    fn from(response: ResourceResponse) -> Self {
        ResolveResult {
            rcode: format!("{:?}", response.rcode),
            authoritative: response.authoritative,
            answer: presentation(&response.answer),
            authority: presentation(&response.authority),
            additional: presentation(&response.additional),
        }
    }
}
