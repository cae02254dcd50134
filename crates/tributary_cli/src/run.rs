//! The sync run: credentials, resources, dispatcher.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use tributary::api::verify_credentials;
use tributary::{
    ApiClientOptions, DedupError, Dispatcher, Downloader, EventSource, HttpApiClient, JsonlSink,
    MemorySink, Request, Resource, ResourceBundle, ResourceConfig, Sink, StandardResource,
};

use crate::Cli;
use crate::config::Config;

/// Cheap listing used to check credentials before any sync work.
const PROBE_PATH: &str = "/v1/charges";

/// Build the resources to register: standalone resources download their own
/// events, resources naming a bundle are grouped into one [`ResourceBundle`].
///
/// Registration order follows the first appearance of each resource or bundle.
pub fn build_resources(
    configs: &[ResourceConfig],
    downloader: &Downloader,
) -> Result<Vec<Arc<dyn Resource>>, DedupError> {
    enum Slot {
        Standalone(ResourceConfig),
        Bundle(String),
    }

    let mut slots = Vec::new();
    let mut bundles: BTreeMap<String, Vec<ResourceConfig>> = BTreeMap::new();
    for config in configs {
        match &config.bundle {
            Some(name) => {
                let members = bundles.entry(name.clone()).or_default();
                if members.is_empty() {
                    slots.push(Slot::Bundle(name.clone()));
                }
                members.push(config.clone());
            }
            None => slots.push(Slot::Standalone(config.clone())),
        }
    }

    let mut resources: Vec<Arc<dyn Resource>> = Vec::with_capacity(slots.len());
    for slot in slots {
        match slot {
            Slot::Standalone(config) => {
                resources.push(Arc::new(StandardResource::new(
                    config,
                    downloader.clone(),
                    EventSource::Own,
                )?));
            }
            Slot::Bundle(name) => {
                let mut bundle = ResourceBundle::new(name.as_str(), downloader.clone());
                for config in bundles.remove(&name).unwrap_or_default() {
                    bundle = bundle.with_member(Arc::new(StandardResource::new(
                        config,
                        downloader.clone(),
                        EventSource::Bundle,
                    )?));
                }
                resources.push(Arc::new(bundle));
            }
        }
    }
    Ok(resources)
}

/// Run one sync with the loaded configuration.
pub async fn handle_run(cli: &Cli, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let Some(secret) = config.secret() else {
        return Err("no credentials found: set api.secret or TRIBUTARY_API_SECRET".into());
    };
    if config.resources.is_empty() {
        tracing::warn!("No resources configured; nothing to sync");
    }

    let options = ApiClientOptions {
        base_url: config.api.url.clone(),
        secret: secret.to_string(),
        api_version: Some(config.api.version.clone()),
        max_rps: (config.api.rps > 0).then_some(config.api.rps),
    };
    let client = Arc::new(HttpApiClient::with_reqwest(
        options,
        Duration::from_secs(config.api.timeout),
    )?);

    let probe = Request::new(PROBE_PATH).with_query("limit", "1");
    if let Err(e) = verify_credentials(client.as_ref(), &probe).await {
        if e.is_auth_related() {
            return Err("invalid credentials".into());
        }
        return Err(format!("credential check failed: {e}").into());
    }

    let sink: Arc<dyn Sink> = if cli.dry_run {
        tracing::info!("Dry run: records and run state are kept in memory");
        Arc::new(MemorySink::new())
    } else {
        let dir = cli
            .output
            .clone()
            .or_else(|| config.output_dir())
            .ok_or("could not determine an output directory; set sink.dir or --output")?;
        Arc::new(JsonlSink::create(dir).await?)
    };

    let downloader = Downloader::new(client);
    let mut dispatcher = Dispatcher::new(sink);
    for resource in build_resources(&config.resources, &downloader)? {
        dispatcher.register(resource);
    }

    let result = dispatcher.run().await;
    dispatcher.close();
    let report = result?;

    println!(
        "Synced {} resource(s): {} record(s) written ({} run started {})",
        report.resources,
        report.upserted,
        if report.incremental { "incremental" } else { "full" },
        report.started_at.to_rfc3339_opts(SecondsFormat::Secs, true),
    );
    Ok(())
}
