//! Main entry point for CLI command to start the gateway.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;
use typegate::axum_factory::main_router;
use typegate::configuration::generate_config_schema;
use typegate::configuration::LogFormat;
use typegate::Configuration;
use typegate::Engine;
use typegate::EnvSecrets;
use typegate::SecretStore;

/// Options for the gateway
#[derive(Parser, Debug)]
#[clap(name = "typegate", about = "Typegraph federation gateway")]
struct Opt {
    /// Configuration location relative to the working directory.
    #[clap(short, long = "config", env = "TYPEGATE_CONFIG_PATH")]
    config_path: Option<PathBuf>,

    /// Log filter, overriding the configured one.
    #[clap(long = "log", env = "TYPEGATE_LOG")]
    log_level: Option<String>,

    /// Prints the configuration schema.
    #[clap(long)]
    schema: bool,
}

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(rt_main())
}

async fn rt_main() -> Result<()> {
    let opt = Opt::parse();

    if opt.schema {
        let schema = generate_config_schema();
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let current_directory = std::env::current_dir()?;
    let (configuration, base) = match &opt.config_path {
        Some(path) => {
            let path = current_directory.join(path);
            let configuration = Configuration::read(&path)?;
            let base = path
                .parent()
                .map(|parent| parent.to_path_buf())
                .unwrap_or_else(|| current_directory.clone());
            (configuration, base)
        }
        None => (Configuration::default(), current_directory),
    };

    let filter = opt
        .log_level
        .as_deref()
        .unwrap_or(&configuration.telemetry.filter);
    let builder = tracing_subscriber::fmt::fmt()
        .with_env_filter(EnvFilter::try_new(filter).context("could not parse log configuration")?);
    match configuration.telemetry.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    let typegraphs = configuration.load_typegraphs(&base)?;
    ensure!(
        !typegraphs.is_empty(),
        "no typegraph to serve, list them under `typegraphs` in the configuration"
    );
    let mut names = HashSet::new();
    let mut engines = Vec::with_capacity(typegraphs.len());
    for typegraph in typegraphs {
        let name = typegraph.name().to_string();
        ensure!(names.insert(name.clone()), "typegraph {name} is listed twice");
        let secrets = EnvSecrets::new(configuration.secrets.prefix.clone(), name.as_str());
        let engine = Engine::builder()
            .typegraph(typegraph)
            .secrets(Arc::new(secrets) as Arc<dyn SecretStore>)
            .execution(configuration.execution.clone())
            .build()
            .with_context(|| format!("could not load typegraph {name}"))?;
        engines.push(Arc::new(engine));
    }

    let router = main_router(engines);
    let listener = tokio::net::TcpListener::bind(configuration.server.listen)
        .await
        .with_context(|| format!("could not listen on {}", configuration.server.listen))?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "could not listen for shutdown signal");
        }
    })
    .await?;
    tracing::info!("Stopped");
    Ok(())
}
