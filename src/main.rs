use std::{net::SocketAddr, process};

use panelcache::{
    application::error::AppError,
    cache::{CacheCore, CacheLayerState},
    config,
    infra::{
        admin_client::AdminClient,
        error::InfraError,
        http::{self, AdminState, ProxyState},
        telemetry,
    },
};
use tokio::{net::TcpListener, signal, try_join};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Clear(args) => run_clear(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let core = CacheCore::from_config(settings.cache.clone())?;
    let compaction = core
        .index()
        .spawn_compaction(settings.cache.compaction_interval());

    info!(
        target = "panelcache::serve",
        public_addr = %settings.server.public_addr,
        admin_addr = %settings.server.admin_addr,
        upstream = %settings.upstream.url,
        store = core.store().name(),
        enabled = settings.cache.enabled,
        "Starting panelcache"
    );

    let result = serve_http(&settings, core).await;

    compaction.abort();
    let _ = compaction.await;

    result
}

async fn serve_http(settings: &config::Settings, core: CacheCore) -> Result<(), AppError> {
    let proxy = ProxyState::new(&settings.upstream)?;
    let public_router = http::build_proxy_router(proxy, CacheLayerState::new(&core));
    let admin_router = http::build_admin_router(AdminState { cache: core });

    let public_listener = bind(settings.server.public_addr).await?;
    let admin_listener = bind(settings.server.admin_addr).await?;

    let public_server = axum::serve(public_listener, public_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());
    let admin_server = axum::serve(admin_listener, admin_router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    try_join!(public_server, admin_server).map_err(InfraError::Serve)?;

    info!(target = "panelcache::serve", "Shutdown complete");
    Ok(())
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, InfraError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| InfraError::bind(addr, source))
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
}

async fn run_clear(settings: config::Settings, args: config::ClearArgs) -> Result<(), AppError> {
    let client = AdminClient::new(settings.server.admin_url.clone())?;
    let summary = client.clear(args.target).await?;
    info!(
        target = "panelcache::clear",
        selector = %summary.target,
        removed = summary.removed,
        "Cache cleared"
    );
    println!("Cleared {} entries ({})", summary.removed, summary.target);
    Ok(())
}
