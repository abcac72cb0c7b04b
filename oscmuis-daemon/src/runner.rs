use oscmuis_core::config::AppConfig;
use oscmuis_core::network::NetworkModeController;
use oscmuis_core::osc::{OscDispatcher, UdpTransport};
use oscmuis_core::portal::Portal;
use oscmuis_core::scheduler::Scheduler;
use oscmuis_core::settings::FileStore;
use oscmuis_core::traits::WifiRadio;
use oscmuis_core::web_server::{self, AppState};
use std::sync::Arc;
use tokio::sync::watch;

// 编译时必须且只能选择一个无线电后端
const BACKEND_COUNT: usize =
    cfg!(feature = "backend_mock") as usize + cfg!(feature = "backend_nmcli") as usize;
const _: () = assert!(
    BACKEND_COUNT == 1,
    "Select exactly ONE backend feature (backend_mock or backend_nmcli)."
);

#[cfg(feature = "backend_mock")]
fn create_radio(_config: &AppConfig) -> anyhow::Result<Arc<dyn WifiRadio>> {
    use oscmuis_core::backends::mock::MockBackend;
    tracing::info!("🚀 Using Mock Backend");
    Ok(Arc::new(MockBackend::new()))
}

#[cfg(feature = "backend_nmcli")]
fn create_radio(config: &AppConfig) -> anyhow::Result<Arc<dyn WifiRadio>> {
    use oscmuis_core::backends::nmcli::NmcliBackend;
    tracing::info!(
        ap = %config.ap.interface,
        station = %config.station.interface,
        "🚀 Using nmcli Backend"
    );
    Ok(Arc::new(NmcliBackend::new(&config.ap, &config.station)?))
}

/// Wires the components together and serves until Ctrl-C.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store = Arc::new(FileStore::new(config.storage.dir.clone()));
    let radio = create_radio(&config)?;

    let controller = Arc::new(
        NetworkModeController::new(radio, store.clone(), config.ap.clone(), config.connect)
            .with_portal_labels(&config.portal.title, &config.portal.subtitle),
    );
    let dispatcher = Arc::new(OscDispatcher::new(
        store,
        controller.clone(),
        Arc::new(UdpTransport::new()),
    ));
    let portal = Portal::new()
        .with_provider(controller.clone())
        .with_provider(dispatcher.clone());

    controller.begin().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(
        controller.clone(),
        dispatcher.clone(),
        config.scheduler.tick,
        config.scheduler.test_trigger_id,
    )
    .spawn(shutdown_rx);

    let state = Arc::new(AppState {
        controller,
        dispatcher,
        portal,
        test_trigger_id: config.scheduler.test_trigger_id,
    });
    let server = web_server::start_web_server(state, config.portal.bind_addr);

    tokio::select! {
        result = server => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    scheduler.await?;
    Ok(())
}
