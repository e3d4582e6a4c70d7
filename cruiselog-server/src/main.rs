use clap::Parser;
use cruiselog_server::{
    control::{run_console, ControlSurface},
    load_fleet,
    orchestrator::{failures, Orchestrator},
    sink::{DefaultSinkFactory, JsonlStore},
    web::Web,
    Cli, VERSION,
};
use log::{info, warn};
use miette::{IntoDiagnostic, Result};
use std::{convert::Infallible, net::SocketAddr, sync::Arc, time::Duration};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    let config_path = args.config_path();
    info!("cruiselog {} loading {}", VERSION, config_path.display());
    let fleet = load_fleet(&config_path).into_diagnostic()?;
    let initial_mode = args
        .mode
        .clone()
        .unwrap_or_else(|| fleet.default_mode.to_string());

    let store = Arc::new(JsonlStore::new(fleet.database.dir.clone()));
    let orchestrator = Orchestrator::new(
        fleet,
        Arc::new(DefaultSinkFactory::new(store)),
        args.bind,
    );

    let outcome = orchestrator
        .apply_global_mode(&initial_mode)
        .await
        .into_diagnostic()?;
    for (id, error) in failures(&outcome) {
        warn!("{}: not logging: {}", id, error);
    }

    let (surface, handle) = ControlSurface::new(orchestrator.clone());

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("Fleet", move |s: SubsystemHandle| async move {
            s.on_shutdown_requested().await;
            for (id, error) in failures(&orchestrator.shutdown().await) {
                warn!("{}: did not stop cleanly: {}", id, error);
            }
            Ok::<(), Infallible>(())
        }));
        s.start(SubsystemBuilder::new("Control", |s| surface.run(s)));

        if !args.no_stdin {
            let handle = handle.clone();
            s.start(SubsystemBuilder::new("Console", |s| run_console(handle, s)));
        }
        if !args.no_http {
            let addr = SocketAddr::new(args.bind, args.port);
            s.start(SubsystemBuilder::new("Webserver", move |s| Web::new(handle).run(s, addr)));
        }
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .map_err(Into::into)
}
