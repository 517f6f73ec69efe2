//! Endpoint selection
//!
//! Services can be picked by explicit name, a label selector, --all, or a
//! newline-delimited names file (with "-" for standard input).

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::{Api, ListParams};
use kube::Client;
use tracing::debug;

use crate::output::print_error;

/// How the user picked the services to idle.
pub struct Selection {
    pub names: Vec<String>,
    pub selector: Option<String>,
    pub all: bool,
    pub all_namespaces: bool,
}

/// Load service names from a file, or standard input when the path is "-".
/// Blank lines are skipped.
pub fn read_service_names(path: &str) -> Result<Vec<String>> {
    let reader: Box<dyn Read> = if path == "-" {
        Box::new(io::stdin())
    } else {
        Box::new(File::open(path).with_context(|| format!("Failed to open {path}"))?)
    };

    let mut names = Vec::new();
    for line in BufReader::new(reader).lines() {
        let line = line.context("Failed to read service names")?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        names.push(trimmed.to_string());
    }

    Ok(names)
}

/// Fetch the Endpoints objects for a selection. A named service that does
/// not exist is reported and skipped; the second return value flags that a
/// per-resource failure occurred.
pub async fn gather_endpoints(
    client: &Client,
    namespace: &str,
    selection: &Selection,
) -> Result<(Vec<Endpoints>, bool)> {
    let api: Api<Endpoints> = Api::namespaced(client.clone(), namespace);
    let mut endpoints = Vec::new();
    let mut had_error = false;

    for name in &selection.names {
        let found = api
            .get_opt(name)
            .await
            .with_context(|| format!("Failed to fetch endpoints {namespace}/{name}"))?;
        match found {
            Some(found) => endpoints.push(found),
            None => {
                print_error(&format!("endpoints \"{namespace}/{name}\" not found"));
                had_error = true;
            }
        }
    }

    if selection.selector.is_some() || selection.all {
        let list_api: Api<Endpoints> = if selection.all_namespaces {
            Api::all(client.clone())
        } else {
            api
        };
        let mut params = ListParams::default();
        if let Some(selector) = &selection.selector {
            params = params.labels(selector);
        }
        let listed = list_api
            .list(&params)
            .await
            .context("Failed to list endpoints")?;
        debug!(count = listed.items.len(), "listed endpoints");
        endpoints.extend(listed.items);
    }

    Ok((endpoints, had_error))
}
