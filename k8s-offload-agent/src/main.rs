use std::{error::Error, process::exit, sync::Arc, time::Duration};

use kube::Client;
use log::info;
use tokio::join;

use crate::{
    compute::{http::HttpComputeService, mock::MockComputeService, ComputeService},
    config::OperatorConfig,
    metrics::Metrics,
    operator::{context::ReconcilerContext, main_operator},
    tunnel::TunnelRegistry,
    webhook::start_webhook_server,
};

mod compute;
mod config;
mod helpers;
mod metrics;
mod operator;
mod tunnel;
mod webhook;

const METRICS_REPORT_INTERVAL_SECS: u64 = 300;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    configure_logger();

    let config = get_config();
    let client = create_client().await;
    let compute = create_compute_service(&config);
    let metrics = Arc::new(Metrics::default());

    let context = Arc::new(ReconcilerContext {
        client,
        config: config.clone(),
        compute,
        tunnels: TunnelRegistry::default(),
        metrics: metrics.clone(),
    });

    tokio::spawn(report_metrics(metrics.clone()));

    join!(
        main_operator(context),
        start_webhook_server(config, metrics)
    );

    Ok(())
}

async fn report_metrics(metrics: Arc<Metrics>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(METRICS_REPORT_INTERVAL_SECS));
    ticker.tick().await;

    loop {
        ticker.tick().await;
        info!("Counters: {}", metrics.snapshot());
    }
}

fn create_compute_service(config: &OperatorConfig) -> Arc<dyn ComputeService> {
    if config.mock {
        info!("Running against the mock compute service");
        return Arc::new(MockComputeService::default());
    }

    match HttpComputeService::new(config) {
        Ok(service) => Arc::new(service),
        Err(error) => {
            log::error!("Couldn't create the compute service client! {error:?}");
            exit(8)
        }
    }
}

async fn create_client() -> Client {
    match Client::try_default().await {
        Ok(client) => client,
        Err(error) => {
            log::error!("Couldn't create client! {error:?}");
            exit(6)
        }
    }
}

fn get_config() -> OperatorConfig {
    match OperatorConfig::from_env() {
        Ok(config) => config,
        Err(error) => {
            log::error!("Couldn't retrieve operator configuration! {error:?}");
            exit(7)
        }
    }
}

fn configure_logger() {
    env_logger::builder()
        .default_format()
        .format_module_path(false)
        .filter_level(log::LevelFilter::Info)
        .init()
}
