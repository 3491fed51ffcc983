use crate::config::Config;
use crate::registry::PeerRegistry;
use crate::router::Router;
use crate::server::ServerState;
use crate::session::SessionContext;
use crate::state::SharedState;
use crate::status::StatusFacade;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    if let Some(ref command) = std::env::args().nth(1) {
        if command == "config-init" {
            return handle_config_init();
        }
        return Err(format!("unknown command: {command}").into());
    }

    let config = Config::load()?;

    let state = Arc::new(SharedState::new());
    let registry = Arc::new(PeerRegistry::new());
    let router = Arc::new(Router::new(
        registry.clone(),
        state.clone(),
        config.relay.delivery_timeout(),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_state = Arc::new(ServerState {
        router: router.clone(),
        status: StatusFacade::new(state, registry.clone()),
        sessions: Arc::new(SessionContext {
            registry: registry.clone(),
            router,
            settings: config.relay.session_settings(),
            shutdown: shutdown_rx.clone(),
        }),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown: ctrl-c");
            let _ = shutdown_tx.send(true);
            registry.close_all();
        }
    });

    crate::server::start(
        addr,
        server_state,
        &config.http,
        &config.server.ws_path,
        shutdown_rx,
    )
    .await?;

    tracing::info!("hub stopped");
    Ok(())
}

fn handle_config_init() -> Result<(), Box<dyn std::error::Error>> {
    let path = Config::default_path();
    Config::write_default(&path)?;
    println!("Wrote default config to {}", path.display());
    Ok(())
}
