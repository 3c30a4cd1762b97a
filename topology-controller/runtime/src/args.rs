use crate::{index, k8s, sink::HttpMetadataSink};
use anyhow::Result;
use clap::Parser;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "topology", about = "A topology metadata controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "topology=info,warn",
        env = "TOPOLOGY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Invalidation debounce window, in milliseconds.
    #[clap(long, default_value = "1000")]
    debounce_ms: u64,

    /// Port the per-node agent accepts reports on.
    #[clap(long, default_value = "55555")]
    agent_port: u16,

    /// Main-container environment variable carrying a pod's identity.
    #[clap(long, default_value = "POD_IDENTITY")]
    identity_env: String,

    /// Cluster segment of the node agent's service identity.
    #[clap(long, default_value = "system")]
    agent_cluster: String,

    /// Sector segment of the node agent's service identity.
    #[clap(long, default_value = "main")]
    agent_sector: String,

    /// Service segment of the node agent's service identity.
    #[clap(long, default_value = "agent")]
    agent_service: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            debounce_ms,
            agent_port,
            identity_env,
            agent_cluster,
            agent_sector,
            agent_service,
        } = self;

        let config = index::Config {
            debounce: Duration::from_millis(debounce_ms),
            agent_cluster,
            agent_sector,
            agent_service,
            identity_env,
        };

        let mut prom = <Registry>::default();
        let metrics =
            index::metrics::Metrics::register(prom.sub_registry_with_prefix("topology_index"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let sink = Arc::new(HttpMetadataSink::new(agent_port));
        let (index, wakes) = index::Controller::shared(config, metrics, sink);

        // Drain debounce expirations into recomputation passes.
        tokio::spawn(index::process_wakes(index.clone(), wakes).instrument(info_span!("wakes")));

        let selector = format!("{}=true", k8s::labels::MANAGED);
        let pods = runtime.watch_all::<k8s::Pod>(watcher::Config::default().labels(&selector));
        tokio::spawn(kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")));

        let definitions = runtime.watch_all::<k8s::MeshService>(watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), definitions)
                .instrument(info_span!("meshservices")),
        );

        info!("Topology controller running");
        runtime.run().await?;

        index.write().shutdown();
        Ok(())
    }
}
