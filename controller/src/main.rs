//! The kubeforge controller binary.

use std::{net::SocketAddr, path::PathBuf};

use is_terminal::IsTerminal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use kubeforge::{
    CONTROLLER_NAME, Error, Result,
    builder::{DEFAULT_WORKERS, ReconcilerBuilder},
    http::Introspection,
};

fn main() {
    use clap::{Arg, Command, ValueHint, crate_name, crate_version};
    use std::process;
    let cmd = Command::new(crate_name!())
        .version(crate_version!())
        .about("materialize kubernetes objects from Overlay resources")
        .subcommand_required(true)
        .subcommands([Command::new("run").about("run the overlay controller").args([
            Arg::new("kubernetes_config")
                .long("kubernetesConfig")
                .env("KUBEFORGE_KUBERNETES_CONFIG")
                .value_hint(ValueHint::FilePath)
                .help("path to the kubernetes configuration file (optional)"),
            Arg::new("kubernetes_address")
                .long("kubernetesAddress")
                .env("KUBEFORGE_KUBERNETES_ADDRESS")
                .help("address of the kubernetes API server (optional)"),
            Arg::new("source_configuration")
                .long("sourceConfiguration")
                .env("KUBEFORGE_SOURCE_CONFIGURATION")
                .value_hint(ValueHint::FilePath)
                .default_value("/opt/kubeforge/sourceConfiguration.yaml")
                .help("path to the source configuration file"),
            Arg::new("namespace_filter")
                .long("namespaceFilter")
                .env("KUBEFORGE_NAMESPACE_FILTER")
                .default_value("default")
                .help("namespace to monitor"),
            Arg::new("controller_name")
                .long("controllerName")
                .env("KUBEFORGE_CONTROLLER_NAME")
                .default_value(CONTROLLER_NAME)
                .help("name of the controller"),
            Arg::new("metrics_server_port")
                .long("metricsServerPort")
                .env("KUBEFORGE_METRICS_SERVER_PORT")
                .default_value("8080")
                .help("introspection server port for readyz, healthz, and metrics"),
        ])]);

    if let Err(e) = match cmd.get_matches().subcommand() {
        Some(("run", m)) => match Args::try_from(m) {
            Ok(args) => startup(args),
            Err(e) => Err(e),
        },
        _ => unreachable!(),
    } {
        eprintln!("{e}");
        process::exit(1);
    }
}

struct Args {
    controller_name: String,
    kubernetes_config: Option<PathBuf>,
    kubernetes_address: Option<String>,
    source_configuration: PathBuf,
    namespace_filter: Option<String>,
    metrics_port: u16,
}

impl TryFrom<&clap::ArgMatches> for Args {
    type Error = Error;

    fn try_from(m: &clap::ArgMatches) -> Result<Self> {
        let metrics_port = m
            .get_one::<String>("metrics_server_port")
            .expect("defaulted")
            .parse::<u16>()
            .map_err(|err| Error::Config(format!("invalid metrics server port: {err}")))?;
        Ok(Self {
            controller_name: m
                .get_one::<String>("controller_name")
                .expect("defaulted")
                .clone(),
            kubernetes_config: m.get_one::<String>("kubernetes_config").map(PathBuf::from),
            kubernetes_address: m.get_one::<String>("kubernetes_address").cloned(),
            source_configuration: m
                .get_one::<String>("source_configuration")
                .expect("defaulted")
                .into(),
            namespace_filter: m
                .get_one::<String>("namespace_filter")
                .filter(|ns| !ns.is_empty())
                .cloned(),
            metrics_port,
        })
    }
}

fn startup(args: Args) -> Result<()> {
    use tokio::{runtime, signal};
    use tracing_subscriber::{filter::EnvFilter, prelude::*};

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info"))?;
    let collector = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(if std::io::stdout().is_terminal() {
            Some(tracing_subscriber::fmt::layer())
        } else {
            None
        })
        .with(if std::io::stdout().is_terminal() {
            None
        } else {
            Some(tracing_subscriber::fmt::layer().json())
        });
    tracing::subscriber::set_global_default(collector)?;

    let introspection = Introspection::new()?;
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let token = CancellationToken::new();

    {
        let stop = token.clone();
        rt.handle().spawn(async move {
            let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(err) => {
                    error!("error installing SIGTERM handler: {err}");
                    stop.cancel();
                    return;
                }
            };
            tokio::select! {
                res = signal::ctrl_c() => {
                    if let Err(err) = res {
                        error!("error reading shutdown signal: {err}");
                    }
                }
                _ = terminate.recv() => {}
            }
            stop.cancel();
        });
    }
    {
        let server = introspection.clone();
        let cancel = token.clone();
        let addr = SocketAddr::from(([0, 0, 0, 0], args.metrics_port));
        rt.handle().spawn(async move {
            if let Err(err) = server.serve(addr, cancel).await {
                error!("introspection server failed: {err}");
            }
        });
    }
    rt.block_on(run(args, &introspection, token))
}

async fn run(args: Args, introspection: &Introspection, token: CancellationToken) -> Result<()> {
    let mut builder = ReconcilerBuilder::new()
        .controller_name(&args.controller_name)
        .working_context(token)
        .working_workers(DEFAULT_WORKERS)
        .source_configuration(&args.source_configuration)
        .update_readyz(introspection.update_readyz())
        .update_healthz(introspection.update_healthz());
    if let Some(namespace) = &args.namespace_filter {
        builder = builder.namespace_filter(namespace);
    }
    if let Some(path) = &args.kubernetes_config {
        builder = builder.kubernetes_config(path);
    }
    if let Some(address) = &args.kubernetes_address {
        builder = builder.kubernetes_address(address);
    }

    let reconciler = builder.build().await?;
    info!(controller = %args.controller_name, "controller initialized");
    reconciler.run().await
}
