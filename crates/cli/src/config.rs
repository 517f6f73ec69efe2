//! Kubernetes client construction for the CLI

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

/// Build a client, plus the namespace the current context defaults to.
pub async fn client(kubeconfig: Option<&str>) -> Result<(Client, String)> {
    let config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig from {path}"))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
        None => Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    let namespace = config.default_namespace.clone();
    let client = Client::try_from(config).context("Failed to create Kubernetes client")?;

    Ok((client, namespace))
}
