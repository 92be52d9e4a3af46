use std::sync::Arc;

use shiftgate::config::GateConfig;
use shiftgate::context::AuthContext;
use shiftgate::gate::policy::RouteTable;
use shiftgate::identity::provider::PushIdentityProvider;
use shiftgate::profile::api::HttpProfileApi;
use shiftgate::routes;
use shiftgate::store::{FileStore, LocalStore, MemoryStore};

// One visitor, one event loop.
#[tokio::main(flavor = "current_thread")]
async fn main() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let config = GateConfig::from_env().expect("invalid gate configuration");
    let route_table = match &config.route_table_path {
        Some(path) => RouteTable::load(path).expect("route table load failed"),
        None => RouteTable::marketplace(&config.paths),
    };
    let store: Arc<dyn LocalStore> = match &config.local_store_path {
        Some(path) => Arc::new(FileStore::open(path.clone())),
        None => Arc::new(MemoryStore::new()),
    };
    let api = Arc::new(HttpProfileApi::new(&config.profile_api).expect("profile API client build failed"));
    let identity = Arc::new(PushIdentityProvider::new());
    let port = config.port;

    let auth = AuthContext::init(config, route_table, identity.clone(), api, store).await;

    let app = routes::app(routes::AppState::new(auth.clone(), identity));
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "shiftgate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("server failed");

    auth.shutdown();
}
