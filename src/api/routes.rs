use crate::api::api_error::APIError;
use crate::api::model::{ResolveQuery, ResolveResult};
use crate::api::server::AppState;
use crate::error::Error;
use crate::monitor::EntryStatus;
use crate::service::{ClientContext, ServiceStatus};
use crate::zone::{ResourceRequest, ZoneStatus};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::str::FromStr;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use trust_dns_proto::rr::{Name, RecordType};

pub(super) fn new(state: AppState) -> Router {
    Router::new()
        .route("/healthcheck", get(health_check))
        .route("/zones", get(zones))
        .route("/zones/:origin", get(zone))
        .route("/services", get(services))
        .route("/monitors", get(monitors))
        .route("/resolve", get(resolve))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.api_timeout))
        .with_state(state)
}

#[allow(clippy::unused_async)]
async fn health_check() -> impl IntoResponse {
    Json(json!({"ok":"healthy"}))
}

async fn zones(State(state): State<AppState>) -> Json<Vec<ZoneStatus>> {
    Json(state.controller.zone_statuses().await)
}

async fn zone(
    State(state): State<AppState>,
    Path(origin): Path<String>,
) -> Result<Json<ZoneStatus>, APIError> {
    let mut wanted = Name::from_str(&origin).map_err(Error::from)?;
    wanted.set_fqdn(true);
    let wanted = wanted.to_lowercase().to_string();
    state
        .controller
        .zone_statuses()
        .await
        .into_iter()
        .find(|status| status.origin == wanted)
        .map(Json)
        .ok_or_else(|| {
            Error::NotFound {
                kind: "zone",
                name: origin,
            }
            .into()
        })
}

async fn services(State(state): State<AppState>) -> Json<Vec<ServiceStatus>> {
    Json(state.controller.service_statuses().await)
}

async fn monitors(State(state): State<AppState>) -> Json<Vec<EntryStatus>> {
    Json(state.controller.monitor_statuses().await)
}

async fn resolve(
    State(state): State<AppState>,
    ConnectInfo(client_addr): ConnectInfo<SocketAddr>,
    Query(query): Query<ResolveQuery>,
) -> Result<Json<ResolveResult>, APIError> {
    let mut qname = Name::from_str(&query.name).map_err(Error::from)?;
    qname.set_fqdn(true);
    let request = ResourceRequest {
        qname,
        qtype: RecordType::from_str(&query.rtype.to_ascii_uppercase()).map_err(Error::from)?,
        client: ClientContext {
            source: query.client.unwrap_or_else(|| client_addr.ip()),
            subnets: query.subnet.into_iter().collect(),
        },
    };
    tracing::debug!(
        "resolving {} {} for {}",
        request.qname,
        request.qtype,
        request.client.source
    );
    let response = state.controller.get_resource(&request).await?;
    Ok(Json(response.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryBackend, Kind};
    use crate::controller::Controller;
    use crate::geo::{GeoDatabase, GeoRecord};
    use hyper::{Client, StatusCode};
    use serde_json::Value;
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::Arc;
    use std::time::Duration;

    const SERVICE: &str = "rrtype: A\n\
                           service:\n\
                           \x20 type: geolocation\n\
                           \x20 locations:\n\
                           \x20   JP: { type: static, endpoints: [ { address: 192.0.2.81 } ] }\n\
                           \x20   DEFAULT: { type: static, endpoints: [ { address: 198.51.100.1 } ] }\n";
    const ZONE: &str = "@ IN SOA ns root 1 3600 900 86400 900\n\
                        @ IN NS ns\n\
                        ns IN A 127.0.0.1\n\
                        www IN DYNA service1\n";

    async fn serve() -> SocketAddr {
        let backend = Arc::new(InMemoryBackend::new());
        backend.put(Kind::Service, "service1", SERVICE).await;
        backend.put(Kind::Zone, "example.jp", ZONE).await;
        let geo = GeoDatabase::from_records(vec![GeoRecord {
            network: "10.81.0.0/16".parse().unwrap(),
            continent: Some("AS".to_string()),
            country: Some("JP".to_string()),
            subdivisions: vec![],
        }]);
        let controller = Arc::new(Controller::new(vec![backend], Arc::new(geo)));
        assert!(controller.reconcile().await.is_empty());

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let router = new(AppState {
            controller,
            api_timeout: Duration::from_secs(5),
        });
        let server = axum::Server::from_tcp(listener)
            .unwrap()
            .serve(router.into_make_service_with_connect_info::<SocketAddr>());
        tokio::spawn(server);
        addr
    }

    async fn get_json(addr: SocketAddr, path: &str) -> (StatusCode, Value) {
        let response = Client::new()
            .get(format!("http://{addr}{path}").parse().unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn status_endpoints() {
        let addr = serve().await;

        let (status, body) = get_json(addr, "/healthcheck").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": "healthy"}));

        let (status, body) = get_json(addr, "/zones").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["origin"], "example.jp.");
        assert_eq!(body[0]["valid"], true);
        assert_eq!(body[0]["services"], json!(["service1"]));

        let (status, body) = get_json(addr, "/zones/Example.JP").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["origin"], "example.jp.");

        let (status, _) = get_json(addr, "/zones/example.com").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = get_json(addr, "/services").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "service1");
        assert_eq!(body[0]["rrtype"], "A");
        assert_eq!(body[0]["endpoints"].as_array().unwrap().len(), 2);

        let (status, body) = get_json(addr, "/monitors").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn resolve_endpoint() {
        let addr = serve().await;

        let (status, body) = get_json(addr, "/resolve?name=www.example.jp").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["authoritative"], true);
        let answer = body["answer"][0].as_str().unwrap();
        assert!(answer.contains("198.51.100.1"), "{answer}");

        let (_, body) = get_json(addr, "/resolve?name=www.example.jp&client=10.81.0.1").await;
        let answer = body["answer"][0].as_str().unwrap();
        assert!(answer.contains("192.0.2.81"), "{answer}");

        let (_, body) = get_json(addr, "/resolve?name=www.example.jp&subnet=10.81.3.0/24").await;
        let answer = body["answer"][0].as_str().unwrap();
        assert!(answer.contains("192.0.2.81"), "{answer}");

        let (status, body) = get_json(addr, "/resolve?name=www.example.jp&type=AAAA").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rcode"], "NoError");
        assert_eq!(body["answer"], json!([]));

        let (status, _) = get_json(addr, "/resolve?name=www.example.jp&type=NOPE").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = get_json(addr, "/resolve?name=www.example.com").await;
        assert_eq!(body["rcode"], "Refused");
    }
}
