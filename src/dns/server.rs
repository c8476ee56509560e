use crate::config::Config;
use crate::controller::SharedController;
use crate::dns::handlers::Handler;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use trust_dns_server::ServerFuture;

/// Bind the configured UDP and TCP addresses and serve DNS from `controller`.
///
/// # Errors
///
/// Returns an error if either address can't be bound.
pub async fn new(
    config: &Config,
    controller: SharedController,
) -> anyhow::Result<ServerFuture<Handler>> {
    let udp_socket = UdpSocket::bind(config.dns_udp_bind_addr).await?;
    let tcp_listener = TcpListener::bind(config.dns_tcp_bind_addr).await?;
    Ok(from_sockets(
        controller,
        config.server_id.clone(),
        udp_socket,
        tcp_listener,
        config.dns_tcp_timeout,
    ))
}

/// Serve DNS from `controller` on already bound sockets.
pub fn from_sockets(
    controller: SharedController,
    server_id: Option<String>,
    udp_socket: UdpSocket,
    tcp_listener: TcpListener,
    tcp_timeout: Duration,
) -> ServerFuture<Handler> {
    let dns_handler = Handler::new(controller, server_id);
    let mut dns_server = ServerFuture::new(dns_handler);
    dns_server.register_socket(udp_socket);
    dns_server.register_listener(tcp_listener, tcp_timeout);
    dns_server
}
