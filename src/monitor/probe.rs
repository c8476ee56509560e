use crate::monitor::config::Probe;
use hyper::header::HOST;
use hyper::{Body, Client, Request};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

impl Probe {
    /// Run the check once against `addr`, giving up after `timeout`. Failures are expected and
    /// only ever logged at debug.
    pub async fn check(&self, addr: IpAddr, timeout: Duration) -> bool {
        match self {
            Probe::Tcp { port } => {
                let target = SocketAddr::new(addr, *port);
                match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
                    Ok(Ok(_)) => true,
                    Ok(Err(err)) => {
                        debug!(%target, %err, "tcp probe failed");
                        false
                    }
                    Err(_) => {
                        debug!(%target, "tcp probe timed out");
                        false
                    }
                }
            }
            Probe::Http {
                port,
                path,
                host,
                expect_status,
            } => {
                let target = SocketAddr::new(addr, *port);
                let request = Request::get(format!("http://{target}{path}"))
                    .header(HOST, host.clone().unwrap_or_else(|| target.to_string()))
                    .body(Body::empty());
                let request = match request {
                    Ok(request) => request,
                    Err(err) => {
                        debug!(%target, %err, "invalid http probe request");
                        return false;
                    }
                };
                let client = Client::new();
                match tokio::time::timeout(timeout, client.request(request)).await {
                    Ok(Ok(response)) => {
                        let status = response.status();
                        let success = match expect_status {
                            Some(expected) => status.as_u16() == *expected,
                            None => status.is_success(),
                        };
                        if !success {
                            debug!(%target, %status, "http probe got unexpected status");
                        }
                        success
                    }
                    Ok(Err(err)) => {
                        debug!(%target, %err, "http probe failed");
                        false
                    }
                    Err(_) => {
                        debug!(%target, "http probe timed out");
                        false
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;
    use std::net::{Ipv4Addr, TcpListener};

    const TIMEOUT: Duration = Duration::from_secs(2);
    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// Serve a small router on an ephemeral loopback port.
    fn serve(router: Router) -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = axum::Server::from_tcp(listener)
            .unwrap()
            .serve(router.into_make_service());
        tokio::spawn(server);
        port
    }

    #[tokio::test]
    async fn tcp_probe() {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(Probe::Tcp { port }.check(LOCALHOST, TIMEOUT).await);

        drop(listener);
        assert!(!Probe::Tcp { port }.check(LOCALHOST, TIMEOUT).await);
    }

    #[tokio::test]
    async fn http_probe_statuses() {
        let port = serve(
            Router::new()
                .route("/health", get(|| async { "ok" }))
                .route("/teapot", get(|| async { StatusCode::IM_A_TEAPOT })),
        );
        let probe = |path: &str, expect_status| Probe::Http {
            port,
            path: path.to_string(),
            host: Some("www.example.jp".to_string()),
            expect_status,
        };

        assert!(probe("/health", None).check(LOCALHOST, TIMEOUT).await);
        assert!(!probe("/missing", None).check(LOCALHOST, TIMEOUT).await);
        assert!(!probe("/teapot", None).check(LOCALHOST, TIMEOUT).await);
        assert!(probe("/teapot", Some(418)).check(LOCALHOST, TIMEOUT).await);
    }
}
