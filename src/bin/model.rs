use std::{path::PathBuf, process, sync::Arc, time::Duration};

use structopt::StructOpt;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::FmtSubscriber;
use zkbio::{
    extractor::CommandExtractor,
    net::node::{Outbox, ServiceNode},
    proof::SnarkBackend,
    services::ModelService,
    settings::ModelSettings,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "Model")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = ModelSettings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let ModelSettings {
        node: node_settings,
        transport: transport_settings,
        log: log_settings,
        extractor: extractor_settings,
        snark: snark_settings,
        similarity: similarity_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let extractor = CommandExtractor::new(
        extractor_settings.command(),
        extractor_settings.workdir.clone(),
        Duration::from_secs(extractor_settings.timeout_secs),
    );
    let backend = SnarkBackend::new(snark_settings);
    let transport = transport_settings.into();
    let outbox = Outbox::new(node_settings.public_address(), transport);
    let service = ModelService::new(
        extractor,
        backend,
        outbox,
        similarity_settings.threshold,
        extractor_settings.dimensions,
    );

    let node = ServiceNode::bind(node_settings.bind_address, transport)
        .await
        .unwrap_or_else(|err| {
            eprintln!("failed to bind {}: {}", node_settings.bind_address, err);
            process::exit(1);
        });
    info!("model service ready");

    tokio::select! {
        _ = node.serve(Arc::new(service)) => {
            warn!("shutting down: node terminated");
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
