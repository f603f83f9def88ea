use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use api::{start_api, ApiContext};
use clap::Parser;
use config::{ConfigurationFactory, EnvironmentServiceConfigController};
use deploy::{
    template::TemplateDeployer,
    wait::{HttpDependencyWaiter, WaitArgs},
};
use kube::Client;
use metrics::Metrics;
use negotiator_core::{kube::DefaultKubeClient, status::MemoryStatusStore, tracer::init_tracer};
use pwd::DefaultPasswordGenerator;
use renderer::LiquidRenderer;
use template::DefaultTemplateLoader;
use tracing::{debug, info};

// Consts

const DEFAULT_LOG_FILTER: &str = "negotiator_core=info,negotiator=info,warn";

// Main

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracer(args.log_filter, args.log_json)?;
    let kube = Client::try_default().await?;
    let kube = Arc::new(DefaultKubeClient::new(kube));
    let store = Arc::new(MemoryStatusStore::new());
    let loader = Arc::new(DefaultTemplateLoader::new(args.templates_dir));
    let renderer = Arc::new(LiquidRenderer::new()?);
    let factory = ConfigurationFactory::new(
        kube.clone(),
        loader.clone(),
        Arc::new(DefaultPasswordGenerator::new()),
        store.clone(),
        renderer.clone(),
    );
    let configurator = EnvironmentServiceConfigController::new(factory, kube.clone(), store.clone());
    debug!("configuration controller created");
    let deployer = TemplateDeployer::new(kube.clone(), loader, args.public_url, renderer);
    let waiter = HttpDependencyWaiter::new(WaitArgs {
        max_poll_interval: Duration::from_millis(args.dependency_max_poll_interval),
        poll_interval: Duration::from_millis(args.dependency_poll_interval),
        timeout: Duration::from_secs(args.dependency_timeout),
    })?;
    let ctx = ApiContext {
        configurator,
        deployer,
        kube,
        metrics: Metrics::new()?,
        retriever: store,
        waiter,
    };
    info!("negotiator started");
    start_api(args.bind_addr, ctx).await
}

// Mods

mod api;
mod config;
mod deploy;
mod err;
mod metrics;
mod pwd;
mod renderer;
mod template;

// Args

#[derive(Clone, Debug, Eq, Parser, PartialEq)]
#[command(version)]
struct Args {
    #[arg(
        long,
        env,
        default_value = "0.0.0.0:8080",
        long_help = "Address to bind the HTTP server to"
    )]
    bind_addr: SocketAddr,
    #[arg(
        long,
        env,
        default_value_t = 10_000,
        long_help = "Maximum number of milliseconds between two polls of a dependency"
    )]
    dependency_max_poll_interval: u64,
    #[arg(
        long,
        env,
        default_value_t = 1_000,
        long_help = "Number of milliseconds before polling a dependency again, doubled after each poll"
    )]
    dependency_poll_interval: u64,
    #[arg(
        long,
        env,
        default_value_t = 300,
        long_help = "Number of seconds to wait for dependencies to be ready"
    )]
    dependency_timeout: u64,
    #[arg(
        long,
        env,
        default_value = DEFAULT_LOG_FILTER,
        long_help = "Log filter (https://docs.rs/tracing-subscriber/latest/tracing_subscriber/filter/struct.EnvFilter.html#directives)"
    )]
    log_filter: String,
    #[arg(long, env, long_help = "Log in JSON format")]
    log_json: bool,
    #[arg(
        long,
        env,
        default_value = "http://localhost:8080",
        long_help = "Public URL of this server, used to build dependency watch URLs"
    )]
    public_url: String,
    #[arg(
        long,
        env,
        long_help = "Directory containing templates (<name>.yaml.liquid), bundled job templates are used as fallback"
    )]
    templates_dir: Option<PathBuf>,
}

// Tests
