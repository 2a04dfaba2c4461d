#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;

mod keys;
mod node_config;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Error};
use porc::core::relay::destination::{DestinationConnector, NoDestination, TcpDestination};
use porc::core::relay::{Relay, RelayContext};
use porc::crypto::*;
use tokio::net::TcpListener;
use tokio::runtime;
use tokio_util::sync::CancellationToken;
#[cfg(unix)]
use syslog::Facility;

use crate::keys::relay_keys;
use crate::node_config::*;

/// Run a future with the runtime specified by config.
fn run<F>(future: F, threads: Threads) -> Result<(), Error>
    where F: Future<Output = Result<(), Error>>
{
    let runtime = match threads {
        Threads::N(0) => return Err(anyhow!("Number of threads must be positive")),
        Threads::N(1) => runtime::Builder::new_current_thread()
            .enable_all()
            .build(),
        Threads::N(n) => runtime::Builder::new_multi_thread()
            .worker_threads(n as usize)
            .enable_all()
            .build(),
        // builder will detect number of cores automatically
        Threads::Auto => runtime::Builder::new_multi_thread()
            .enable_all()
            .build(),
    }.context("Failed to create runtime")?;

    runtime.block_on(future)
}

fn init_logger(log_type: LogType) -> Result<(), Error> {
    match log_type {
        LogType::Stderr => {
            let env = env_logger::Env::default()
                .filter_or("RUST_LOG", "info");
            env_logger::Builder::from_env(env)
                .try_init()
                .context("Failed to initialize stderr logger")?;
        },
        LogType::Stdout => {
            let env = env_logger::Env::default()
                .filter_or("RUST_LOG", "info");
            env_logger::Builder::from_env(env)
                .target(env_logger::fmt::Target::Stdout)
                .try_init()
                .context("Failed to initialize stdout logger")?;
        },
        #[cfg(unix)]
        LogType::Syslog => {
            syslog::init(Facility::LOG_USER, log::LevelFilter::Info, None)
                .map_err(|e| anyhow!("Failed to initialize syslog backend: {}", e))?;
        },
        #[cfg(not(unix))]
        LogType::Syslog => {
            return Err(anyhow!("Syslog is not supported on this platform"));
        },
        LogType::None => { },
    }
    Ok(())
}

async fn run_relay(config: NodeConfig, sk: SecretKey) -> Result<(), Error> {
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(&addr).await
        .with_context(|| format!("Failed to bind TCP listener on {}", addr))?;

    let connector: Arc<dyn DestinationConnector> = match config.destination {
        Some(destination) => {
            info!("Delivering circuit data to {}", destination);
            Arc::new(TcpDestination::new(destination))
        },
        None => {
            warn!("No destination is set, circuits can only be extended through this relay");
            Arc::new(NoDestination)
        },
    };
    let context = RelayContext::new(sk).with_connections_limit(config.connections_limit);
    let relay = Relay::new(context, connector);

    let shutdown = CancellationToken::new();
    let relay_future = relay.run(listener, shutdown.clone());
    tokio::pin!(relay_future);

    info!("Running relay on {}", addr);

    tokio::select! {
        res = &mut relay_future => return res.context("Relay stopped"),
        res = tokio::signal::ctrl_c() => res.context("Failed to listen for ctrl-c")?,
    }

    info!("Shutting down");
    shutdown.cancel();
    relay_future.await.context("Relay stopped")
}

fn run_node(config: NodeConfig) -> Result<(), Error> {
    init_logger(config.log_type)?;

    for key in config.unused.keys() {
        warn!("Unused configuration key: {:?}", key);
    }

    let (pk, sk) = relay_keys(config.sk.as_ref(), config.keys_file.as_deref())?;

    if config.sk_passed_as_arg {
        warn!("You should not pass the secret key via arguments due to \
               security reasons. Use the environment variable instead");
    }

    info!("Relay public key: {}", hex::encode(pk.as_bytes()).to_uppercase());

    let threads = config.threads;
    run(run_relay(config, sk), threads)
}

fn main() {
    let action = match cli_parse() {
        Ok(action) => action,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        },
    };

    match action {
        Action::DerivePk(pk) => println!("{}", hex::encode(pk.as_bytes()).to_uppercase()),
        Action::Run(config) => {
            let log_enabled = config.log_type != LogType::None;
            if let Err(e) = run_node(config) {
                if log_enabled && log::max_level() != log::LevelFilter::Off {
                    error!("{:#}", e);
                } else {
                    eprintln!("Error: {:#}", e);
                }
                std::process::exit(1);
            }
        },
    }
}
