use crate::control::api::{
    create_source, delete_source, delete_template, get_metrics, get_status, get_template,
    list_sources, post_reload, put_aggregation, put_filters, update_source,
};
use crate::control::ControlPlane;
use axum::{
    routing::{get, post, put},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Start the control API server used by the external CLI.
pub async fn start_server(
    listen_addr: SocketAddr,
    control: Arc<ControlPlane>,
) -> Result<(), std::io::Error> {
    let app = Router::new()
        .route("/control/status", get(get_status))
        .route("/control/metrics", get(get_metrics))
        .route("/control/reload", post(post_reload))
        .route("/control/sources", get(list_sources).post(create_source))
        .route(
            "/control/sources/:id",
            put(update_source).delete(delete_source),
        )
        .route(
            "/control/sources/:id/template",
            get(get_template).delete(delete_template),
        )
        .route("/control/sources/:id/filters", put(put_filters))
        .route("/control/sources/:id/aggregation", put(put_aggregation))
        .layer(TraceLayer::new_for_http())
        .with_state(control);

    info!(addr = %listen_addr, "Starting control API server");

    let listener = TcpListener::bind(listen_addr).await?;
    axum::serve(listener, app).await
}
