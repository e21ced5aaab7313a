use std::{path::PathBuf, process, sync::Arc, time::Duration};

use structopt::StructOpt;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;
use zkbio::{
    net::node::{Outbox, ServiceNode},
    proof::SnarkBackend,
    services::{bootstrap, ServerService},
    settings::ServerSettings,
    storage::redis,
};

#[derive(Debug, StructOpt)]
#[structopt(name = "Server")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = ServerSettings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(1);
    });
    let ServerSettings {
        node: node_settings,
        transport: transport_settings,
        log: log_settings,
        redis: redis_settings,
        snark: snark_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let backend = SnarkBackend::new(snark_settings);
    let url = redis_settings.url;
    let connect = || redis::Client::new(url.clone());
    let retry_delay = Duration::from_secs(redis_settings.retry_delay_secs);

    // nothing is accepted before the store is ready and the trusted setup is persisted
    let store = tokio::select! {
        store = bootstrap(connect, retry_delay, &backend) => match store {
            Ok(store) => store,
            Err(err) => {
                error!("{}", err);
                process::exit(1);
            }
        },
        _ = signal::ctrl_c() => {
            info!("shutting down");
            return;
        }
    };

    let transport = transport_settings.into();
    let outbox = Outbox::new(node_settings.public_address(), transport);
    let service = ServerService::new(store, backend, outbox);

    let node = ServiceNode::bind(node_settings.bind_address, transport)
        .await
        .unwrap_or_else(|err| {
            error!("failed to bind {}: {}", node_settings.bind_address, err);
            process::exit(1);
        });
    info!("server service ready");

    tokio::select! {
        _ = node.serve(Arc::new(service)) => {
            warn!("shutting down: node terminated");
        }
        _ = signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
