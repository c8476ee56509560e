//! Per-zone record storage and answer construction.

use crate::error::Error;
use crate::service::ServiceResolver;
use crate::tree::{self, LabelTree, NodeId};
use crate::zone::parser::ParsedRecord;
use crate::zone::{ResourceRequest, ResourceResponse};
use std::collections::HashMap;
use tracing::debug;
use trust_dns_proto::op::ResponseCode;
use trust_dns_proto::rr::{DNSClass, Name, RData, Record, RecordType};

/// DNAME ([RFC 6672](https://www.rfc-editor.org/rfc/rfc6672)) is carried as opaque data.
pub const DNAME: RecordType = RecordType::Unknown(39);

/// The private dynamic record type (`DYNA` in master files).
pub const DYNA: RecordType = RecordType::Unknown(0xFF17);

/// Hop budget shared by CNAME, DNAME and wildcard chasing for a single query.
pub const CHASE_BUDGET: u8 = 10;

/// A placeholder answered at query time by a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DynamicRecord {
    pub service: String,
    /// The record type the service answers with, fixed when the zone is loaded.
    pub rtype: RecordType,
    pub ttl: u32,
    pub class: DNSClass,
}

#[derive(Debug, Clone)]
pub struct RecordNode {
    owner: Option<Name>,
    authoritative: bool,
    rrsets: HashMap<RecordType, Vec<Record>>,
    dname: Option<Name>,
    dynamic: Vec<DynamicRecord>,
}

impl Default for RecordNode {
    fn default() -> Self {
        RecordNode {
            owner: None,
            authoritative: true,
            rrsets: HashMap::new(),
            dname: None,
            dynamic: Vec::new(),
        }
    }
}

impl RecordNode {
    fn rrset(&self, rtype: RecordType) -> Option<&Vec<Record>> {
        self.rrsets.get(&rtype).filter(|set| !set.is_empty())
    }

    fn is_empty(&self) -> bool {
        self.rrsets.is_empty() && self.dynamic.is_empty()
    }
}

/// The records of one zone, indexed by owner name.
///
/// Records of a type keep the order they were inserted in; answers never reorder them.
#[derive(Debug, Clone)]
pub struct RecordTree {
    origin: Name,
    origin_labels: Vec<String>,
    tree: LabelTree<RecordNode>,
}

impl RecordTree {
    #[must_use]
    pub fn new(origin: Name) -> Self {
        let origin_labels = tree::labels(&origin);
        RecordTree {
            origin,
            origin_labels,
            tree: LabelTree::new(),
        }
    }

    /// Builds and verifies a tree from parsed master file records. `service_type` maps the
    /// service named by each dynamic record to the record type it answers with.
    ///
    /// # Errors
    ///
    /// Returns the first insertion or [verification](Self::finish) error.
    pub fn build<F>(
        origin: Name,
        records: Vec<ParsedRecord>,
        mut service_type: F,
    ) -> Result<Self, Error>
    where
        F: FnMut(&str) -> Result<RecordType, Error>,
    {
        let mut tree = RecordTree::new(origin);
        for record in records {
            match record {
                ParsedRecord::Static(record) => tree.insert(record)?,
                ParsedRecord::Dname { record, target } => tree.insert_dname(record, target)?,
                ParsedRecord::Dynamic {
                    owner,
                    ttl,
                    class,
                    service,
                } => {
                    let rtype = service_type(&service)?;
                    tree.insert_dynamic(
                        &owner,
                        DynamicRecord {
                            service,
                            rtype,
                            ttl,
                            class,
                        },
                    )?;
                }
            }
        }
        tree.finish()?;
        Ok(tree)
    }

    #[must_use]
    pub fn origin(&self) -> &Name {
        &self.origin
    }

    fn node_for(&mut self, owner: &Name) -> Result<&mut RecordNode, Error> {
        if !self.origin.zone_of(owner) {
            return Err(Error::OutOfZone(owner.clone()));
        }
        let id = self.tree.insert(&tree::labels(owner));
        let node = self.tree.get_mut(id);
        node.owner.get_or_insert_with(|| owner.clone());
        Ok(node)
    }

    /// Appends a static record to the RRset of its owner and type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfZone`] if the owner isn't inside this zone.
    pub fn insert(&mut self, record: Record) -> Result<(), Error> {
        let node = self.node_for(record.name())?;
        node.rrsets.entry(record.rr_type()).or_default().push(record);
        Ok(())
    }

    /// Appends a DNAME record, remembering its target for substitution.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfZone`] if the owner isn't inside this zone.
    pub fn insert_dname(&mut self, record: Record, target: Name) -> Result<(), Error> {
        let node = self.node_for(record.name())?;
        node.dname.get_or_insert(target);
        node.rrsets.entry(DNAME).or_default().push(record);
        Ok(())
    }

    /// Adds a dynamic placeholder at `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfZone`] if the owner isn't inside this zone.
    pub fn insert_dynamic(&mut self, owner: &Name, dynamic: DynamicRecord) -> Result<(), Error> {
        self.node_for(owner)?.dynamic.push(dynamic);
        Ok(())
    }

    /// Marks delegated names as non-authoritative and checks the zone invariants: one SOA and at
    /// least one NS at the apex, CNAMEs alone at their name, and DNAMEs without names below them.
    ///
    /// # Errors
    ///
    /// Returns the first invariant found to be violated.
    pub fn finish(&mut self) -> Result<(), Error> {
        let apex = self
            .tree
            .lookup(&self.origin_labels)
            .filter(|&apex| !self.tree.get(apex).is_empty())
            .ok_or(Error::EmptyApex)?;

        let apex_node = self.tree.get(apex);
        match apex_node.rrset(RecordType::SOA).map(Vec::len) {
            None => return Err(Error::MissingSOA),
            Some(1) => {}
            Some(_) => return Err(Error::DuplicateSOA),
        }
        if apex_node.rrset(RecordType::NS).is_none() {
            return Err(Error::MissingApexNS);
        }

        for id in self.tree.path(&self.origin_labels) {
            if id != apex {
                self.tree.get_mut(id).authoritative = false;
            }
        }
        let below_apex = self.tree.descendants(apex);
        let cuts: Vec<NodeId> = below_apex
            .iter()
            .copied()
            .filter(|&id| self.tree.get(id).rrset(RecordType::NS).is_some())
            .collect();
        for cut in cuts {
            self.tree.get_mut(cut).authoritative = false;
            for id in self.tree.descendants(cut) {
                self.tree.get_mut(id).authoritative = false;
            }
        }

        for id in std::iter::once(apex).chain(below_apex) {
            self.verify_node(id)?;
        }
        Ok(())
    }

    fn verify_node(&self, id: NodeId) -> Result<(), Error> {
        let node = self.tree.get(id);
        let owner = || node.owner.clone().unwrap_or_else(Name::root);

        if let Some(cnames) = node.rrset(RecordType::CNAME) {
            if cnames.len() > 1 {
                return Err(Error::DuplicateCNAME(owner()));
            }
            let others = node
                .rrsets
                .keys()
                .any(|&rtype| rtype != RecordType::CNAME && rtype != DNAME);
            if others || !node.dynamic.is_empty() {
                return Err(Error::CNAMEConflict(owner()));
            }
        }
        if let Some(dnames) = node.rrset(DNAME) {
            if dnames.len() > 1 {
                return Err(Error::DuplicateDNAME(owner()));
            }
            if self.tree.has_children(id) {
                return Err(Error::DNAMEHasChildren(owner()));
            }
        }
        for (i, dynamic) in node.dynamic.iter().enumerate() {
            if node.dynamic[..i].iter().any(|d| d.rtype == dynamic.rtype) {
                return Err(Error::DuplicateDynamic(owner()));
            }
        }
        Ok(())
    }

    /// The records of `rtype` owned by exactly `name`.
    #[must_use]
    pub fn records(&self, name: &Name, rtype: RecordType) -> Option<&[Record]> {
        let id = self.tree.lookup(&tree::labels(name))?;
        self.tree.get(id).rrset(rtype).map(Vec::as_slice)
    }

    /// Names of the services referenced by dynamic records, without duplicates.
    #[must_use]
    pub fn services(&self) -> Vec<String> {
        let mut services: Vec<String> = self
            .tree
            .iter()
            .flat_map(|(_, node)| node.dynamic.iter().map(|d| d.service.clone()))
            .collect();
        services.sort();
        services.dedup();
        services
    }

    /// Answers `request` from this zone, resolving dynamic records through `services`.
    ///
    /// CNAME, DNAME and wildcard chasing share a budget of [`CHASE_BUDGET`] hops; running out
    /// returns whatever was collected so far.
    ///
    /// # Errors
    ///
    /// Fails when a dynamic record can't be resolved, or a delegation has no zone cut.
    pub fn resolve(
        &self,
        request: &ResourceRequest,
        services: &dyn ServiceResolver,
    ) -> Result<ResourceResponse, Error> {
        let mut response = ResourceResponse::default();
        self.chase(
            &mut response,
            request,
            services,
            &request.qname,
            CHASE_BUDGET,
            None,
        )?;
        Ok(response)
    }

    fn chase(
        &self,
        response: &mut ResourceResponse,
        request: &ResourceRequest,
        services: &dyn ServiceResolver,
        sname: &Name,
        budget: u8,
        wildcard_for: Option<&Name>,
    ) -> Result<(), Error> {
        if budget == 0 {
            debug!(qname = %request.qname, "chase budget exhausted");
            return Ok(());
        }
        if !self.origin.zone_of(sname) {
            return Ok(());
        }

        let labels = tree::labels(sname);
        let (id, depth) = self.tree.closest(&labels);
        let exact = depth == labels.len();
        let node = self.tree.get(id);
        let qtype = request.qtype;

        let parent_side_ds = exact && qtype == RecordType::DS && self.is_cut(id);
        if !node.authoritative && !parent_side_ds {
            return self.refer(response, id);
        }
        response.authoritative = true;

        if exact {
            response.rcode = ResponseCode::NoError;
            let rename = |record: &Record| {
                let mut record = record.clone();
                if let Some(owner) = wildcard_for {
                    record.set_name(owner.clone());
                }
                record
            };

            if let Some(rrset) = node.rrset(qtype) {
                response.answer.extend(rrset.iter().map(rename));
                return Ok(());
            }
            if let Some(cname) = node.rrset(RecordType::CNAME).and_then(|set| set.first()) {
                response.answer.push(rename(cname));
                if let Some(RData::CNAME(target)) = cname.data() {
                    return self.chase(response, request, services, target, budget - 1, None);
                }
                return Ok(());
            }
            if let Some(dynamic) = node.dynamic.iter().find(|d| d.rtype == qtype) {
                let owner = wildcard_for.unwrap_or(sname);
                let resolved = services.resolve(&dynamic.service, qtype, &request.client)?;
                response.answer.extend(resolved.into_iter().map(|rdata| {
                    let mut record = Record::from_rdata(owner.clone(), dynamic.ttl, rdata);
                    record.set_dns_class(dynamic.class);
                    record
                }));
                return Ok(());
            }
            self.negative(response, ResponseCode::NoError);
            return Ok(());
        }

        if let (Some(target), Some(dname)) = (&node.dname, node.rrset(DNAME)) {
            let dname = &dname[0];
            let prefix = labels.len() - depth;
            let substituted = Name::from_labels(sname.iter().take(prefix).chain(target.iter()))?;
            let mut cname = Record::from_rdata(
                sname.clone(),
                dname.ttl(),
                RData::CNAME(substituted.clone()),
            );
            cname.set_dns_class(dname.dns_class());
            response.answer.push(dname.clone());
            response.answer.push(cname);
            return self.chase(response, request, services, &substituted, budget - 1, None);
        }

        if wildcard_for.is_none() {
            let wildcard =
                Name::from_labels(std::iter::once(&b"*"[..]).chain(sname.iter().skip(1)))?;
            return self.chase(
                response,
                request,
                services,
                &wildcard,
                budget - 1,
                Some(sname),
            );
        }

        self.negative(response, ResponseCode::NXDomain);
        Ok(())
    }

    fn is_cut(&self, id: NodeId) -> bool {
        !self.tree.get(id).authoritative
            && self
                .tree
                .parent(id)
                .is_some_and(|parent| self.tree.get(parent).authoritative)
    }

    /// Walks up from a non-authoritative node to the delegation point above it.
    fn zone_cut(&self, id: NodeId) -> Option<NodeId> {
        let mut current = id;
        if self.tree.get(current).authoritative {
            return None;
        }
        loop {
            let parent = self.tree.parent(current)?;
            if self.tree.get(parent).authoritative {
                return Some(current);
            }
            current = parent;
        }
    }

    fn refer(&self, response: &mut ResourceResponse, id: NodeId) -> Result<(), Error> {
        let cut = self.zone_cut(id).ok_or(Error::ZoneCutNotFound)?;
        let node = self.tree.get(cut);
        response.authoritative = false;
        response.rcode = ResponseCode::NoError;

        if let Some(ns) = node.rrset(RecordType::NS) {
            response.authority.extend(ns.iter().cloned());
            for target in ns.iter().filter_map(|record| match record.data() {
                Some(RData::NS(target)) => Some(target),
                _ => None,
            }) {
                if !self.origin.zone_of(target) {
                    continue;
                }
                for rtype in [RecordType::A, RecordType::AAAA] {
                    if let Some(glue) = self.records(target, rtype) {
                        response.additional.extend(glue.iter().cloned());
                    }
                }
            }
        }
        if let Some(ds) = node.rrset(RecordType::DS) {
            response.authority.extend(ds.iter().cloned());
        }
        Ok(())
    }

    fn negative(&self, response: &mut ResourceResponse, rcode: ResponseCode) {
        response.rcode = rcode;
        if let Some(soa) = self.records(&self.origin, RecordType::SOA) {
            response.authority.extend(soa.iter().cloned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ClientContext;
    use crate::zone::parser;
    use std::net::{IpAddr, Ipv4Addr};
    use std::str::FromStr;

    struct FixedServices;

    impl ServiceResolver for FixedServices {
        fn resolve(
            &self,
            service: &str,
            rtype: RecordType,
            _client: &ClientContext,
        ) -> Result<Vec<RData>, Error> {
            match (service, rtype) {
                ("service1", RecordType::A) => Ok(vec![RData::A(Ipv4Addr::new(192, 168, 0, 1))]),
                _ => Err(Error::ServiceUndefined(service.to_string())),
            }
        }
    }

    const APEX: &str = "$ORIGIN example.jp.\n\
                        $TTL 3600\n\
                        @ IN SOA ns.example.jp. root.example.jp. 1 3600 900 86400 900\n\
                        @ IN NS ns.example.jp.\n\
                        ns IN A 127.0.0.1\n";

    fn name(text: &str) -> Name {
        Name::from_str(text).unwrap()
    }

    fn zone(body: &str) -> Result<RecordTree, Error> {
        let text = format!("{APEX}{body}");
        let records = parser::parse(&text, &name("example.jp."))?;
        RecordTree::build(name("example.jp."), records, |service| match service {
            "service1" => Ok(RecordType::A),
            other => Err(Error::ServiceUndefined(other.to_string())),
        })
    }

    fn query(tree: &RecordTree, qname: &str, qtype: RecordType) -> ResourceResponse {
        let request = ResourceRequest {
            qname: name(qname),
            qtype,
            client: ClientContext::new(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        };
        tree.resolve(&request, &FixedServices).unwrap()
    }

    fn a(record: &Record) -> Ipv4Addr {
        match record.data() {
            Some(RData::A(addr)) => *addr,
            other => panic!("not an A record: {other:?}"),
        }
    }

    #[test]
    fn exact_match_keeps_rrset_order() {
        let tree = zone("www IN A 192.0.2.3\nwww IN A 192.0.2.1\nwww IN A 192.0.2.2\n").unwrap();
        let response = query(&tree, "www.example.jp.", RecordType::A);
        assert!(response.authoritative);
        assert_eq!(response.rcode, ResponseCode::NoError);
        let addrs: Vec<Ipv4Addr> = response.answer.iter().map(a).collect();
        assert_eq!(
            addrs,
            vec![
                Ipv4Addr::new(192, 0, 2, 3),
                Ipv4Addr::new(192, 0, 2, 1),
                Ipv4Addr::new(192, 0, 2, 2)
            ]
        );
    }

    #[test]
    fn dynamic_record_is_answered_by_the_service() {
        let tree = zone("www 300 IN DYNA service1\n").unwrap();
        let response = query(&tree, "www.example.jp.", RecordType::A);
        assert_eq!(response.answer.len(), 1);
        let record = &response.answer[0];
        assert_eq!(record.name(), &name("www.example.jp."));
        assert_eq!(record.rr_type(), RecordType::A);
        assert_eq!(record.ttl(), 300);
        assert_eq!(a(record), Ipv4Addr::new(192, 168, 0, 1));

        let aaaa = query(&tree, "www.example.jp.", RecordType::AAAA);
        assert!(aaaa.answer.is_empty());
        assert_eq!(aaaa.rcode, ResponseCode::NoError);
        assert_eq!(aaaa.authority[0].rr_type(), RecordType::SOA);
    }

    #[test]
    fn wildcard_answers_rewrite_the_owner() {
        let tree = zone("* IN A 1.2.3.4\n").unwrap();
        let response = query(&tree, "foo.example.jp.", RecordType::A);
        assert_eq!(response.answer.len(), 1);
        assert_eq!(response.answer[0].name(), &name("foo.example.jp."));
        assert_eq!(a(&response.answer[0]), Ipv4Addr::new(1, 2, 3, 4));
    }

    #[test]
    fn wildcard_only_applies_at_the_same_depth() {
        let tree = zone("* IN A 1.2.3.4\n").unwrap();
        let response = query(&tree, "a.b.example.jp.", RecordType::A);
        assert!(response.answer.is_empty());
        assert_eq!(response.rcode, ResponseCode::NXDomain);
    }

    #[test]
    fn cname_is_chased_inside_the_zone() {
        let tree = zone("a IN CNAME b.example.jp.\nb IN A 1.1.1.1\n").unwrap();
        let response = query(&tree, "a.example.jp.", RecordType::A);
        assert_eq!(response.answer.len(), 2);
        assert_eq!(response.answer[0].rr_type(), RecordType::CNAME);
        assert_eq!(response.answer[1].name(), &name("b.example.jp."));
        assert_eq!(a(&response.answer[1]), Ipv4Addr::new(1, 1, 1, 1));
    }

    #[test]
    fn cname_loops_stop_at_the_budget() {
        let tree = zone("a IN CNAME b.example.jp.\nb IN CNAME a.example.jp.\n").unwrap();
        let response = query(&tree, "a.example.jp.", RecordType::A);
        assert_eq!(response.answer.len(), usize::from(CHASE_BUDGET));
    }

    #[test]
    fn cname_out_of_zone_ends_the_chase() {
        let tree = zone("a IN CNAME www.example.com.\n").unwrap();
        let response = query(&tree, "a.example.jp.", RecordType::A);
        assert_eq!(response.answer.len(), 1);
        assert_eq!(response.rcode, ResponseCode::NoError);
    }

    #[test]
    fn dname_synthesizes_a_cname() {
        let tree = zone("old IN DNAME new.example.jp.\nwww.new IN A 192.0.2.9\n").unwrap();
        let response = query(&tree, "www.old.example.jp.", RecordType::A);
        assert_eq!(response.answer.len(), 3);
        assert_eq!(response.answer[0].rr_type(), DNAME);
        assert_eq!(response.answer[1].name(), &name("www.old.example.jp."));
        assert_eq!(
            response.answer[1].data(),
            Some(&RData::CNAME(name("www.new.example.jp.")))
        );
        assert_eq!(a(&response.answer[2]), Ipv4Addr::new(192, 0, 2, 9));
    }

    #[test]
    fn delegation_returns_a_referral_with_glue() {
        let tree = zone(
            "sub IN NS ns1.sub.example.jp.\n\
             sub IN DS 60485 5 1 2BB183AF5F22588179A53B0A98631FAD1A292118\n\
             ns1.sub IN A 192.0.2.53\n",
        )
        .unwrap();
        let response = query(&tree, "deep.sub.example.jp.", RecordType::A);
        assert!(!response.authoritative);
        assert!(response.answer.is_empty());
        assert_eq!(response.authority.len(), 2);
        assert_eq!(response.authority[0].rr_type(), RecordType::NS);
        assert_eq!(response.authority[1].rr_type(), RecordType::DS);
        assert_eq!(response.additional.len(), 1);
        assert_eq!(a(&response.additional[0]), Ipv4Addr::new(192, 0, 2, 53));

        let ds = query(&tree, "sub.example.jp.", RecordType::DS);
        assert!(ds.authoritative);
        assert_eq!(ds.answer.len(), 1);
    }

    #[test]
    fn missing_names_and_types() {
        let tree = zone("www IN A 192.0.2.1\na.b IN A 192.0.2.2\n").unwrap();

        let nxdomain = query(&tree, "nope.example.jp.", RecordType::A);
        assert_eq!(nxdomain.rcode, ResponseCode::NXDomain);
        assert!(nxdomain.authoritative);
        assert_eq!(nxdomain.authority[0].rr_type(), RecordType::SOA);

        let nodata = query(&tree, "www.example.jp.", RecordType::MX);
        assert_eq!(nodata.rcode, ResponseCode::NoError);
        assert!(nodata.answer.is_empty());

        let empty_non_terminal = query(&tree, "b.example.jp.", RecordType::A);
        assert_eq!(empty_non_terminal.rcode, ResponseCode::NoError);
    }

    #[test]
    fn invariants_are_enforced() {
        let cases: [(&str, fn(&Error) -> bool); 5] = [
            ("x IN CNAME a.example.jp.\nx IN CNAME b.example.jp.\n", |e| {
                matches!(e, Error::DuplicateCNAME(_))
            }),
            ("x IN CNAME a.example.jp.\nx IN A 192.0.2.1\n", |e| {
                matches!(e, Error::CNAMEConflict(_))
            }),
            ("x IN CNAME a.example.jp.\nx IN DYNA service1\n", |e| {
                matches!(e, Error::CNAMEConflict(_))
            }),
            ("x IN DNAME a.example.jp.\nx IN DNAME b.example.jp.\n", |e| {
                matches!(e, Error::DuplicateDNAME(_))
            }),
            ("x IN DNAME a.example.jp.\ny.x IN A 192.0.2.1\n", |e| {
                matches!(e, Error::DNAMEHasChildren(_))
            }),
        ];
        for (body, check) in cases {
            let err = zone(body).unwrap_err();
            assert!(check(&err), "unexpected error {err:?} for {body:?}");
        }
        assert!(zone("x IN CNAME a.example.jp.\nx IN DNAME b.example.jp.\n").is_ok());
    }

    #[test]
    fn apex_requirements() {
        let origin = name("example.jp.");
        let build = |text: &str| {
            let records = parser::parse(text, &origin).unwrap();
            RecordTree::build(origin.clone(), records, |_| Ok(RecordType::A))
        };
        assert!(matches!(
            build("www IN A 192.0.2.1\n"),
            Err(Error::EmptyApex)
        ));
        assert!(matches!(
            build("@ IN NS ns.example.jp.\n"),
            Err(Error::MissingSOA)
        ));
        assert!(matches!(
            build(
                "@ IN SOA ns root 1 2 3 4 5\n@ IN SOA ns root 2 2 3 4 5\n@ IN NS ns.example.jp.\n"
            ),
            Err(Error::DuplicateSOA)
        ));
        assert!(matches!(
            build("@ IN SOA ns root 1 2 3 4 5\n"),
            Err(Error::MissingApexNS)
        ));
        assert!(matches!(
            build("@ IN SOA ns root 1 2 3 4 5\n@ IN NS ns\nwww.example.com. IN A 192.0.2.1\n"),
            Err(Error::OutOfZone(_))
        ));
    }

    #[test]
    fn undefined_services_reject_the_zone() {
        assert!(matches!(
            zone("www IN DYNA missing\n"),
            Err(Error::ServiceUndefined(_))
        ));
        assert_eq!(
            zone("www IN DYNA service1\napi IN DYNA service1\n")
                .unwrap()
                .services(),
            vec!["service1".to_string()]
        );
    }
}
