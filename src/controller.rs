//! The single coordinator of zones, services and monitors.
//!
//! A reconciliation pass runs with the [`Managers`] lock held throughout, in dependency order:
//! monitors, services, zones, then removals in the reverse order. At the end of the pass an
//! immutable [`View`] is published. Queries only ever clone the current view's [`Arc`], so a slow
//! pass never blocks them.

use crate::backend::{DynBackend, LoadFailure};
use crate::error::Error;
use crate::geo::GeoDatabase;
use crate::monitor::{EntryStatus, MonitorManager};
use crate::service::{ServiceManager, ServiceStatus, ServiceTable};
use crate::zone::{ResourceRequest, ResourceResponse, ZoneIndex, ZoneManager, ZoneStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Managers {
    pub monitors: MonitorManager,
    pub services: ServiceManager,
    pub zones: ZoneManager,
}

/// What the query path sees.
#[derive(Debug, Clone, Default)]
pub struct View {
    pub zones: ZoneIndex,
    pub services: ServiceTable,
}

pub type SharedController = Arc<Controller>;

pub struct Controller {
    backends: Vec<DynBackend>,
    managers: Mutex<Managers>,
    view: RwLock<Arc<View>>,
}

/// Log the units a reconciliation pass couldn't load.
pub fn log_failures(failures: &[LoadFailure]) {
    for failure in failures {
        warn!(
            kind = %failure.kind,
            name = failure.name,
            error = %failure.error,
            "failed to load"
        );
    }
}

impl Controller {
    #[must_use]
    pub fn new(backends: Vec<DynBackend>, geo: Arc<GeoDatabase>) -> Self {
        Controller {
            backends,
            managers: Mutex::new(Managers {
                monitors: MonitorManager::new(),
                services: ServiceManager::new(geo),
                zones: ZoneManager::new(),
            }),
            view: RwLock::new(Arc::new(View::default())),
        }
    }

    /// Run one full reconciliation pass and publish the result. Units that fail to load are
    /// returned; their previous versions stay in effect.
    pub async fn reconcile(&self) -> Vec<LoadFailure> {
        let mut managers = self.managers.lock().await;
        let Managers {
            monitors,
            services,
            zones,
        } = &mut *managers;

        monitors.snapshot_statuses();
        let mut failures = monitors.reconcile(&self.backends).await;
        failures.extend(services.reconcile(&self.backends, monitors).await);
        failures.extend(zones.reconcile(&self.backends, services).await);

        zones.prune(services);
        services.prune(monitors).await;
        monitors.prune();

        let view = Arc::new(View {
            zones: zones.index(),
            services: services.table(),
        });
        *self.view.write().await = view;
        debug!(failures = failures.len(), "reconciliation pass finished");
        failures
    }

    /// The most recently published view.
    pub async fn view(&self) -> Arc<View> {
        self.view.read().await.clone()
    }

    /// Answer a query from the zone responsible for its name. Names outside every zone are
    /// refused.
    ///
    /// # Errors
    ///
    /// Returns resolution errors, which the DNS layer answers with SERVFAIL.
    pub async fn get_resource(&self, request: &ResourceRequest) -> Result<ResourceResponse, Error> {
        let view = self.view().await;
        match view.zones.find_zone(&request.qname) {
            None => Ok(ResourceResponse::refused()),
            Some(zone) => zone.records.resolve(request, &view.services),
        }
    }

    /// Reconcile every `period` until the returned token is cancelled. Probe loops are stopped on
    /// cancellation.
    pub fn spawn(self: &Arc<Self>, period: Duration) -> CancellationToken {
        let cancel = CancellationToken::new();
        let controller = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(
                interval_secs = period.as_secs(),
                "reconciliation task started"
            );
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => log_failures(&controller.reconcile().await),
                }
            }
            controller.managers.lock().await.monitors.shutdown().await;
            info!("reconciliation task stopped");
        });
        cancel
    }

    pub async fn zone_statuses(&self) -> Vec<ZoneStatus> {
        self.managers.lock().await.zones.statuses()
    }

    pub async fn service_statuses(&self) -> Vec<ServiceStatus> {
        self.managers.lock().await.services.statuses()
    }

    pub async fn monitor_statuses(&self) -> Vec<EntryStatus> {
        self.managers.lock().await.monitors.statuses()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, Kind};
    use crate::service::ClientContext;
    use std::net::{IpAddr, Ipv4Addr};
    use std::str::FromStr;
    use trust_dns_proto::op::ResponseCode;
    use trust_dns_proto::rr::{Name, RData, RecordType};

    const SERVICE: &str =
        "rrtype: A\nservice: { type: static, endpoints: [ { address: 192.168.0.1 } ] }\n";
    const ZONE: &str = "$ORIGIN example.jp.\n\
                        @ 3600 IN SOA ns root 1 3600 900 86400 900\n\
                        @ 3600 IN NS ns\n\
                        ns 3600 IN A 127.0.0.1\n\
                        www 300 IN DYNA service1\n";

    fn make_request(qname: &str, qtype: RecordType) -> ResourceRequest {
        ResourceRequest {
            qname: Name::from_str(qname).unwrap(),
            qtype,
            client: ClientContext::new(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        }
    }

    async fn make_controller() -> (Arc<InMemoryBackend>, Arc<Controller>) {
        let backend = Arc::new(InMemoryBackend::new());
        backend.put(Kind::Service, "service1", SERVICE).await;
        backend.put(Kind::Zone, "example.jp", ZONE).await;
        let controller = Controller::new(vec![backend.clone()], Arc::new(GeoDatabase::empty()));
        (backend, Arc::new(controller))
    }

    #[tokio::test]
    async fn nothing_is_served_before_the_first_pass() {
        let (_backend, controller) = make_controller().await;
        let response = controller
            .get_resource(&make_request("www.example.jp.", RecordType::A))
            .await
            .unwrap();
        assert_eq!(response.rcode, ResponseCode::Refused);
    }

    #[tokio::test]
    async fn dynamic_records_resolve_end_to_end() {
        let (_backend, controller) = make_controller().await;
        assert!(controller.reconcile().await.is_empty());

        let response = controller
            .get_resource(&make_request("www.example.jp.", RecordType::A))
            .await
            .unwrap();
        assert!(response.authoritative);
        assert_eq!(response.answer.len(), 1);
        let record = &response.answer[0];
        assert_eq!(record.name(), &Name::from_str("www.example.jp.").unwrap());
        assert_eq!(record.rr_type(), RecordType::A);
        assert_eq!(record.data(), Some(&RData::A(Ipv4Addr::new(192, 168, 0, 1))));

        let refused = controller
            .get_resource(&make_request("www.example.com.", RecordType::A))
            .await
            .unwrap();
        assert_eq!(refused.rcode, ResponseCode::Refused);

        assert_eq!(controller.zone_statuses().await.len(), 1);
        assert_eq!(controller.service_statuses().await[0].zones, vec!["example.jp."]);
        assert!(controller.monitor_statuses().await.is_empty());
    }

    #[tokio::test]
    async fn service_removal_waits_for_its_zones() {
        let (backend, controller) = make_controller().await;
        controller.reconcile().await;

        backend.remove(Kind::Service, "service1").await;
        controller.reconcile().await;
        let response = controller
            .get_resource(&make_request("www.example.jp.", RecordType::A))
            .await
            .unwrap();
        assert_eq!(response.answer.len(), 1);

        backend.remove(Kind::Zone, "example.jp").await;
        controller.reconcile().await;
        assert!(controller.service_statuses().await.is_empty());
        assert!(controller.view().await.zones.zones().next().is_none());
    }

    #[tokio::test]
    async fn periodic_reconciliation_picks_up_changes() {
        let (backend, controller) = make_controller().await;
        let cancel = controller.spawn(Duration::from_millis(20));

        let request = make_request("www.example.jp.", RecordType::A);
        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.get_resource(&request).await.unwrap().answer.is_empty()
            && Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            controller.get_resource(&request).await.unwrap().answer.len(),
            1
        );

        backend
            .put(
                Kind::Service,
                "service1",
                "rrtype: A\nservice: { type: static, endpoints: [ { address: 192.168.0.2 } ] }\n",
            )
            .await;
        let expected = RData::A(Ipv4Addr::new(192, 168, 0, 2));
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let response = controller.get_resource(&request).await.unwrap();
            if response.answer[0].data() == Some(&expected) || Instant::now() >= deadline {
                assert_eq!(response.answer[0].data(), Some(&expected));
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
    }
}
