use std::{path::PathBuf, process, sync::Arc, time::Duration};

use structopt::StructOpt;
use tokio::{fs, signal};
use tracing::{error, info, warn};
use tracing_subscriber::FmtSubscriber;
use zkbio::{
    net::node::{Outbox, ServiceNode},
    services::{Peers, UserService},
    settings::{PhotoSettings, UserSettings},
};

const AUTHENTICATED: i32 = 0;
const ERROR: i32 = 1;
const REJECTED: i32 = 2;

#[derive(Debug, StructOpt)]
#[structopt(name = "User")]
struct Opt {
    /// Path of the configuration file
    #[structopt(short, parse(from_os_str))]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();

    let settings = UserSettings::new(opt.config_path).unwrap_or_else(|err| {
        eprintln!("{}", err);
        process::exit(ERROR);
    });
    let UserSettings {
        node: node_settings,
        transport: transport_settings,
        log: log_settings,
        peers: peer_settings,
        photos: photo_settings,
        saga: saga_settings,
    } = settings;

    let _fmt_subscriber = FmtSubscriber::builder()
        .with_env_filter(log_settings.filter)
        .with_ansi(true)
        .init();

    let transport = transport_settings.into();
    let outbox = Outbox::new(node_settings.public_address(), transport);
    let peers = Peers {
        model: peer_settings.model,
        server: peer_settings.server,
    };
    let user = Arc::new(UserService::new(
        outbox,
        peers,
        Duration::from_secs(saga_settings.timeout_secs),
    ));

    let node = ServiceNode::bind(node_settings.bind_address, transport)
        .await
        .unwrap_or_else(|err| {
            error!("failed to bind {}: {}", node_settings.bind_address, err);
            process::exit(ERROR);
        });
    tokio::spawn(node.serve(user.clone()));

    let code = tokio::select! {
        code = run(&user, &photo_settings, saga_settings.authentication_delay_secs) => code,
        _ = signal::ctrl_c() => {
            info!("shutting down");
            ERROR
        }
    };
    process::exit(code);
}

/// Registers, waits, authenticates and maps the outcome to an exit code.
async fn run(user: &UserService, photos: &PhotoSettings, delay_secs: u64) -> i32 {
    let registration = &photos.registration;
    let photo = match fs::read(registration).await {
        Ok(photo) => photo,
        Err(err) => {
            error!("failed to read {}: {}", registration.display(), err);
            return ERROR;
        }
    };
    match user.register(&photo).await {
        Ok(id) => println!("REGISTERED {}", id),
        Err(err) => {
            println!("ERROR {}", err);
            return ERROR;
        }
    }

    tokio::time::sleep(Duration::from_secs(delay_secs)).await;

    let authentication = &photos.authentication;
    let photo = match fs::read(authentication).await {
        Ok(photo) => photo,
        Err(err) => {
            error!("failed to read {}: {}", authentication.display(), err);
            return ERROR;
        }
    };
    match user.authenticate(&photo).await {
        Ok(result) if result.authenticated => {
            println!("AUTHENTICATED at {}", result.timestamp.unwrap_or_default());
            AUTHENTICATED
        }
        Ok(result) => {
            let reason = result.reason.unwrap_or_default();
            match result.details {
                Some(details) => println!("REJECTED {}: {}", reason, details),
                None => println!("REJECTED {}", reason),
            }
            REJECTED
        }
        Err(err) => {
            warn!("authentication failed: {}", err);
            println!("ERROR {}", err);
            ERROR
        }
    }
}
