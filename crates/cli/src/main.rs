//! kidle - idle the scalable resources backing Kubernetes services
//!
//! Idling discovers the scalable resources (such as deployments and
//! replication controllers) associated with a series of services by
//! examining the endpoints of each service. Each service is then marked as
//! idled, the associated resources are recorded on it, and the resources
//! are scaled down to zero replicas. Upon receiving network traffic, a
//! separate control loop wakes the services back up by scaling the recorded
//! resources to their previous scale.

mod config;
mod output;
mod select;

use anyhow::{bail, Result};
use clap::Parser;
use idler_lib::{IdleOrchestrator, KubeStore};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use select::Selection;

/// Idle scalable resources
#[derive(Parser)]
#[command(name = "kidle")]
#[command(author, version, about = "Idle the scalable resources backing Kubernetes services")]
pub struct Cli {
    /// Names of the services (endpoints objects) to idle
    pub services: Vec<String>,

    /// File containing a newline-delimited list of services to idle; "-" reads standard input
    #[arg(long)]
    pub resource_names_file: Option<String>,

    /// Selector (label query) to use to select services
    #[arg(long, short = 'l')]
    pub selector: Option<String>,

    /// Select all services in the namespace
    #[arg(long)]
    pub all: bool,

    /// Select services across all namespaces
    #[arg(long)]
    pub all_namespaces: bool,

    /// Namespace to operate in (defaults to the kubeconfig context namespace)
    #[arg(long, short = 'n')]
    pub namespace: Option<String>,

    /// Path to kubeconfig file (uses default if not specified)
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Only print the annotations that would be written, without annotating or idling anything
    #[arg(long)]
    pub dry_run: bool,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    // the names file is a plain list of services, so it excludes the other
    // selection mechanisms
    if cli.resource_names_file.is_some()
        && (cli.selector.is_some() || cli.all || !cli.services.is_empty())
    {
        bail!("resource names, selectors, and the all flag may not be specified if a filename is specified");
    }

    let names = match &cli.resource_names_file {
        Some(path) => {
            let names = select::read_service_names(path)?;
            if names.is_empty() {
                bail!("no services listed in {path}");
            }
            names
        }
        None => cli.services.clone(),
    };

    if names.is_empty() && cli.selector.is_none() && !cli.all {
        bail!("you must specify at least one service to idle, a selector, or --all");
    }

    let (client, default_namespace) = config::client(cli.kubeconfig.as_deref()).await?;
    let namespace = cli.namespace.clone().unwrap_or(default_namespace);

    let selection = Selection {
        names,
        selector: cli.selector.clone(),
        all: cli.all,
        all_namespaces: cli.all_namespaces,
    };
    let (endpoints, mut had_error) =
        select::gather_endpoints(&client, &namespace, &selection).await?;

    if endpoints.is_empty() {
        if had_error {
            std::process::exit(1);
        }
        output::print_warning("no services selected");
        return Ok(());
    }

    let store = KubeStore::new(client);
    let report = IdleOrchestrator::new(&store, cli.dry_run)
        .run(&endpoints)
        .await?;
    output::print_report(&report);
    had_error |= report.had_error;

    if had_error {
        std::process::exit(1);
    }
    Ok(())
}
