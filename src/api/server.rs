use crate::api::routes;
use crate::config::Config;
use crate::controller::SharedController;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Clone)]
pub(super) struct AppState {
    pub controller: SharedController,
    pub api_timeout: Duration,
}

pub fn new(
    config: &Config,
    controller: SharedController,
) -> impl Future<Output = hyper::Result<()>> {
    axum::Server::bind(&config.api_bind_addr).serve(
        routes::new(AppState {
            controller,
            api_timeout: config.api_timeout,
        })
        .into_make_service_with_connect_info::<SocketAddr>(),
    )
}
