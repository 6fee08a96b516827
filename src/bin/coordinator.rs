#[macro_use]
extern crate log;

use std::{process, sync::Arc};

use clap::{App, Arg};
use tokio::{signal::ctrl_c, sync::watch};

use fl_coordinator::{
    api,
    common::Weights,
    coordinator::{Coordinator, CoordinatorService, HeartbeatMonitor, ParticipantRegistry},
    settings::Settings,
    store::load_weights,
};

#[tokio::main]
async fn main() {
    let matches = App::new("coordinator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Federated learning coordinator")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .required(true)
                .help("Path to the config file"),
        )
        .get_matches();
    // UNWRAP_SAFE: the argument is required
    let config_file = matches.value_of("config").unwrap();

    let settings = Settings::new(config_file).unwrap_or_else(|err| {
        eprintln!("Problem parsing configuration file: {}", err);
        process::exit(1);
    });

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(settings.log_level.as_str()),
    )
    .init();

    _main(settings).await;
}

async fn _main(settings: Settings) {
    let stores = settings.stores();
    let Settings {
        api,
        federated_learning,
        heartbeat,
        ..
    } = settings;

    let global_weights: Weights = match &federated_learning.initial_weights {
        Some(path) => load_weights(path).await.unwrap_or_else(|err| {
            error!(
                "failed to load the initial weights from {}: {}",
                path.display(),
                err
            );
            process::exit(1);
        }),
        None => Weights::new(),
    };

    let participants = Arc::new(ParticipantRegistry::new(
        heartbeat.time(),
        heartbeat.timeout(),
    ));
    let coordinator = Coordinator::new(
        federated_learning.coordinator_config(),
        federated_learning.aggregation.into_aggregator(),
        federated_learning.selection.into_selector(),
        participants.clone(),
        global_weights,
    )
    .unwrap_or_else(|err| {
        error!("{}", err);
        process::exit(1);
    });

    let (service, handle) = CoordinatorService::new(coordinator, stores);
    let service_task_handle = tokio::spawn(service.run());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let monitor = HeartbeatMonitor::new(participants, handle.clone(), shutdown_rx);
    let monitor_task_handle = tokio::spawn(monitor.run());

    let shutdown = async {
        match ctrl_c().await {
            Ok(()) => info!("shutting down: received SIGINT"),
            Err(e) => error!("shutting down: error while waiting for SIGINT: {}", e),
        }
    };

    // Run the API until SIGINT, then stop the heartbeat monitor. The
    // service stops once the last handle is dropped.
    match api::serve(api.bind_address, api.max_body_size, handle, shutdown).await {
        Ok(()) => {}
        Err(e) => error!("failed to start the HTTP server: {}", e),
    }
    let _ = shutdown_tx.send(true);

    if let Err(e) = monitor_task_handle.await {
        error!("heartbeat monitor task failed: {}", e);
    }
    if let Err(e) = service_task_handle.await {
        error!("coordinator service task failed: {}", e);
    }
}
