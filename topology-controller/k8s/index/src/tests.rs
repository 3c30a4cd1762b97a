use crate::{metrics::Metrics, Config, Controller, Scope, ServiceId, SharedIndex, Wake};
use kubert::index::IndexNamespacedResource;
use maplit::btreemap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use topology_controller_core::{MetadataSink, PodReport};
use topology_controller_k8s_api::{
    self as k8s, labels, ClusterProvidedEndpoint, ConsumedEndpoint, Isolation, MeshServiceSpec,
    ProvidedEndpoint,
};

struct TestConfig {
    index: SharedIndex,
    wakes: mpsc::UnboundedReceiver<Wake>,
    sink: Arc<RecordingSink>,
    metrics: Metrics,
    _tracing: tracing::subscriber::DefaultGuard,
}

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<(String, Vec<PodReport>)>>,
}

impl MetadataSink for RecordingSink {
    fn publish(&self, agent_address: &str, reports: Vec<PodReport>) {
        self.published
            .lock()
            .push((agent_address.to_string(), reports));
    }
}

impl RecordingSink {
    fn take(&self) -> Vec<(String, Vec<PodReport>)> {
        std::mem::take(&mut *self.published.lock())
    }

    /// The most recent report published for a pod, with the agent address it went to.
    fn last_report_for(&self, uid: &str) -> Option<(String, PodReport)> {
        self.published
            .lock()
            .iter()
            .rev()
            .find_map(|(address, reports)| {
                reports
                    .iter()
                    .find(|report| report.id == uid)
                    .map(|report| (address.clone(), report.clone()))
            })
    }
}

impl TestConfig {
    fn new() -> Self {
        let _tracing = init_tracing();
        let sink = Arc::new(RecordingSink::default());
        let metrics = Metrics::default();
        let config = Config {
            debounce: Duration::ZERO,
            ..Config::default()
        };
        let (index, wakes) = Controller::shared(config, metrics.clone(), sink.clone());
        Self {
            index,
            wakes,
            sink,
            metrics,
            _tracing,
        }
    }

    fn apply_pod(&self, pod: k8s::Pod) {
        self.index.write().apply(pod);
    }

    fn delete_pod(&self, ns: &str, name: &str) {
        IndexNamespacedResource::<k8s::Pod>::delete(
            &mut *self.index.write(),
            ns.to_string(),
            name.to_string(),
        );
    }

    fn apply_definition(&self, definition: k8s::MeshService) {
        self.index.write().apply(definition);
    }

    fn delete_definition(&self, ns: &str, name: &str) {
        IndexNamespacedResource::<k8s::MeshService>::delete(
            &mut *self.index.write(),
            ns.to_string(),
            name.to_string(),
        );
    }

    /// Drains scheduled wakes until the queues go quiet.
    async fn settle(&mut self) {
        loop {
            match tokio::time::timeout(Duration::from_millis(100), self.wakes.recv()).await {
                Ok(Some(wake)) => self.index.write().process_wake(wake),
                Ok(None) | Err(_) => return,
            }
        }
    }
}

fn init_tracing() -> tracing::subscriber::DefaultGuard {
    tracing::subscriber::set_default(
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .finish(),
    )
}

#[allow(clippy::too_many_arguments)]
fn mk_pod(
    ns: &str,
    name: &str,
    uid: &str,
    service: (&str, &str, &str),
    deployment: Option<&str>,
    node: Option<&str>,
    ip: Option<&str>,
    identity: Option<&str>,
    ports: &[(&str, i32)],
) -> k8s::Pod {
    let mut pod_labels = btreemap! {
        labels::MANAGED.to_string() => "true".to_string(),
        labels::CLUSTER.to_string() => service.0.to_string(),
        labels::SECTOR.to_string() => service.1.to_string(),
        labels::SERVICE.to_string() => service.2.to_string(),
        labels::NAME.to_string() => "main".to_string(),
    };
    if let Some(deployment) = deployment {
        pod_labels.insert(labels::DEPLOYMENT.to_string(), deployment.to_string());
    }

    let env = identity.map(|identity| {
        vec![k8s::EnvVar {
            name: "POD_IDENTITY".to_string(),
            value: Some(identity.to_string()),
            ..Default::default()
        }]
    });
    let container_ports = (!ports.is_empty()).then(|| {
        ports
            .iter()
            .map(|(name, port)| k8s::ContainerPort {
                name: Some(name.to_string()),
                container_port: *port,
                ..Default::default()
            })
            .collect()
    });

    k8s::Pod {
        metadata: k8s::ObjectMeta {
            namespace: Some(ns.to_string()),
            name: Some(name.to_string()),
            uid: Some(uid.to_string()),
            labels: Some(pod_labels),
            ..Default::default()
        },
        spec: Some(k8s::PodSpec {
            node_name: node.map(String::from),
            containers: vec![k8s::Container {
                name: "main".to_string(),
                env,
                ports: container_ports,
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: Some(k8s::PodStatus {
            phase: Some("Running".to_string()),
            pod_ip: ip.map(String::from),
            ..Default::default()
        }),
    }
}

fn mk_agent_pod(ns: &str, name: &str, uid: &str, node: &str, ip: &str) -> k8s::Pod {
    mk_pod(
        ns,
        name,
        uid,
        ("system", "main", "agent"),
        None,
        Some(node),
        Some(ip),
        Some(name),
        &[],
    )
}

fn mk_definition(
    ns: &str,
    name: &str,
    service: (&str, &str, &str),
    deployment: Option<&str>,
    spec: MeshServiceSpec,
) -> k8s::MeshService {
    let mut definition = k8s::MeshService::new(name, spec);
    let mut definition_labels = btreemap! {
        labels::CLUSTER.to_string() => service.0.to_string(),
        labels::SECTOR.to_string() => service.1.to_string(),
        labels::SERVICE.to_string() => service.2.to_string(),
    };
    if let Some(deployment) = deployment {
        definition_labels.insert(labels::DEPLOYMENT.to_string(), deployment.to_string());
    }
    definition.metadata.namespace = Some(ns.to_string());
    definition.metadata.labels = Some(definition_labels);
    definition
}

fn provided_http() -> BTreeMap<String, ProvidedEndpoint> {
    btreemap! {
        "http".to_string() => ProvidedEndpoint {
            protocol: Some("rest".to_string()),
            network_protocol: None,
        },
    }
}

fn consumed(target: &str, endpoint: &str, isolation: Isolation) -> BTreeMap<String, ConsumedEndpoint> {
    btreemap! {
        "upstream".to_string() => ConsumedEndpoint {
            target_id: target.to_string(),
            endpoint: endpoint.to_string(),
            isolation,
        },
    }
}

#[tokio::test]
async fn pod_report_reaches_node_agent() {
    let mut test = TestConfig::new();

    test.apply_pod(mk_agent_pod("ns", "agent-a", "agent-1", "n1", "10.0.0.1"));
    test.apply_definition(mk_definition(
        "ns",
        "web",
        ("alpha", "main", "web"),
        None,
        MeshServiceSpec {
            provided: provided_http(),
            ..Default::default()
        },
    ));
    test.apply_pod(mk_pod(
        "ns",
        "web-a",
        "web-1",
        ("alpha", "main", "web"),
        None,
        Some("n1"),
        Some("10.0.0.10"),
        Some("web-0"),
        &[("http", 8080)],
    ));
    test.settle().await;

    let (address, report) = test
        .sink
        .last_report_for("web-1")
        .expect("the pod must have reported");
    assert_eq!(address, "10.0.0.1", "reports go to the node's agent");
    let endpoint = report
        .metadata
        .endpoints
        .get("http")
        .expect("declared port must surface as an endpoint");
    assert_eq!(endpoint.port, 8080);
    assert_eq!(endpoint.protocol.as_deref(), Some("rest"));
    assert_eq!(endpoint.address.as_deref(), Some("10.0.0.10"));
}

#[tokio::test]
async fn report_skipped_when_node_has_no_agent() {
    let mut test = TestConfig::new();

    test.apply_definition(mk_definition(
        "ns",
        "web",
        ("alpha", "main", "web"),
        None,
        MeshServiceSpec {
            provided: provided_http(),
            ..Default::default()
        },
    ));
    test.apply_pod(mk_pod(
        "ns",
        "web-a",
        "web-1",
        ("alpha", "main", "web"),
        None,
        Some("n1"),
        Some("10.0.0.10"),
        Some("web-0"),
        &[("http", 8080)],
    ));
    test.settle().await;

    assert!(test.sink.take().is_empty());
    assert!(test.metrics.reports_skipped.get() > 0);
}

#[tokio::test]
async fn publish_resumes_when_an_agent_is_elected() {
    let mut test = TestConfig::new();

    test.apply_definition(mk_definition(
        "ns",
        "web",
        ("alpha", "main", "web"),
        None,
        MeshServiceSpec {
            provided: provided_http(),
            ..Default::default()
        },
    ));
    test.apply_pod(mk_pod(
        "ns",
        "web-a",
        "web-1",
        ("alpha", "main", "web"),
        None,
        Some("n1"),
        Some("10.0.0.10"),
        Some("web-0"),
        &[("http", 8080)],
    ));
    test.settle().await;

    assert!(
        test.sink.take().is_empty(),
        "nothing publishes before the node has an agent"
    );

    test.apply_pod(mk_agent_pod("ns", "agent-a", "agent-1", "n1", "10.0.0.1"));
    test.settle().await;

    let (address, report) = test
        .sink
        .last_report_for("web-1")
        .expect("election must re-publish the node's pods");
    assert_eq!(address, "10.0.0.1");
    let endpoint = report
        .metadata
        .endpoints
        .get("http")
        .expect("declared port must surface as an endpoint");
    assert_eq!(endpoint.port, 8080);
}

#[tokio::test]
async fn agent_failover_promotes_standby() {
    let mut test = TestConfig::new();

    test.apply_pod(mk_agent_pod("ns", "agent-a", "agent-1", "n1", "10.0.0.1"));
    test.apply_pod(mk_agent_pod("ns", "agent-b", "agent-2", "n1", "10.0.0.2"));
    test.apply_pod(mk_pod(
        "ns",
        "web-a",
        "web-1",
        ("alpha", "main", "web"),
        None,
        Some("n1"),
        Some("10.0.0.10"),
        Some("web-0"),
        &[],
    ));
    test.settle().await;

    let (address, _) = test.sink.last_report_for("web-1").expect("initial report");
    assert_eq!(address, "10.0.0.1", "the lowest-uid candidate is elected");
    test.sink.take();

    test.delete_pod("ns", "agent-a");
    test.settle().await;

    let (address, _) = test
        .sink
        .last_report_for("web-1")
        .expect("failover must re-publish the node's pods");
    assert_eq!(address, "10.0.0.2");
}

#[tokio::test]
async fn consumer_resolves_provider_peers() {
    let mut test = TestConfig::new();

    test.apply_pod(mk_agent_pod("ns", "agent-a", "agent-1", "n1", "10.0.0.1"));
    test.apply_definition(mk_definition(
        "ns",
        "web",
        ("alpha", "main", "web"),
        None,
        MeshServiceSpec {
            provided: provided_http(),
            ..Default::default()
        },
    ));
    test.apply_definition(mk_definition(
        "ns",
        "gateway",
        ("alpha", "main", "gateway"),
        None,
        MeshServiceSpec {
            consumed: consumed("service://alpha-main-web", "http", Isolation::Shared),
            ..Default::default()
        },
    ));
    test.apply_pod(mk_pod(
        "ns",
        "web-a",
        "web-1",
        ("alpha", "main", "web"),
        None,
        Some("n1"),
        Some("10.0.0.10"),
        Some("web-0"),
        &[("http", 8080)],
    ));
    test.apply_pod(mk_pod(
        "ns",
        "gateway-a",
        "gw-1",
        ("alpha", "main", "gateway"),
        None,
        Some("n1"),
        Some("10.0.0.20"),
        Some("gateway-0"),
        &[],
    ));
    test.settle().await;

    let (_, report) = test.sink.last_report_for("gw-1").expect("consumer report");
    let view = report
        .metadata
        .peers
        .get("service://alpha-main-web-http")
        .expect("consumed binding must appear in peers");
    assert_eq!(view["web-0"]["port"], 8080);
    assert_eq!(view["web-0"]["address"], "10.0.0.10");
}

#[tokio::test]
async fn instance_isolation_narrows_peers_to_the_node() {
    let mut test = TestConfig::new();

    test.apply_pod(mk_agent_pod("ns", "agent-a", "agent-1", "n1", "10.0.0.1"));
    test.apply_pod(mk_agent_pod("ns", "agent-b", "agent-2", "n2", "10.0.0.2"));
    test.apply_definition(mk_definition(
        "ns",
        "cache",
        ("alpha", "main", "cache"),
        None,
        MeshServiceSpec {
            provided: provided_http(),
            ..Default::default()
        },
    ));
    test.apply_definition(mk_definition(
        "ns",
        "web",
        ("alpha", "main", "web"),
        None,
        MeshServiceSpec {
            consumed: consumed("service://alpha-main-cache", "http", Isolation::Instance),
            ..Default::default()
        },
    ));
    for (name, uid, node, ip, identity) in [
        ("cache-a", "cache-1", "n1", "10.0.1.1", "cache-0"),
        ("cache-b", "cache-2", "n2", "10.0.1.2", "cache-1"),
    ] {
        test.apply_pod(mk_pod(
            "ns",
            name,
            uid,
            ("alpha", "main", "cache"),
            None,
            Some(node),
            Some(ip),
            Some(identity),
            &[("http", 9000)],
        ));
    }
    test.apply_pod(mk_pod(
        "ns",
        "web-a",
        "web-1",
        ("alpha", "main", "web"),
        None,
        Some("n1"),
        Some("10.0.0.10"),
        Some("web-0"),
        &[],
    ));
    test.settle().await;

    let (_, report) = test.sink.last_report_for("web-1").expect("consumer report");
    let view = report
        .metadata
        .peers
        .get("service://alpha-main-cache-http")
        .expect("consumed binding must appear in peers");
    let peers = view.as_object().expect("peer view is an object");
    assert!(peers.contains_key("cache-0"), "own-node peer is visible");
    assert!(
        !peers.contains_key("cache-1"),
        "peers on other nodes are hidden under instance isolation"
    );
}

#[tokio::test]
async fn cluster_target_resolves_through_advertised_names() {
    let mut test = TestConfig::new();

    test.apply_pod(mk_agent_pod("ns", "agent-a", "agent-1", "n1", "10.0.0.1"));
    test.apply_definition(mk_definition(
        "ns",
        "gateway",
        ("alpha", "main", "gateway"),
        None,
        MeshServiceSpec {
            provided: provided_http(),
            cluster_provided: btreemap! {
                "ingress".to_string() => ClusterProvidedEndpoint {
                    target_endpoint: "http".to_string(),
                },
            },
            ..Default::default()
        },
    ));
    test.apply_definition(mk_definition(
        "ns",
        "web",
        ("beta", "main", "web"),
        None,
        MeshServiceSpec {
            consumed: consumed("cluster://alpha", "ingress", Isolation::Shared),
            ..Default::default()
        },
    ));
    test.apply_pod(mk_pod(
        "ns",
        "gateway-a",
        "gw-1",
        ("alpha", "main", "gateway"),
        None,
        Some("n1"),
        Some("10.0.0.30"),
        Some("gateway-0"),
        &[("http", 8443)],
    ));
    test.apply_pod(mk_pod(
        "ns",
        "web-a",
        "web-1",
        ("beta", "main", "web"),
        None,
        Some("n1"),
        Some("10.0.0.10"),
        Some("web-0"),
        &[],
    ));
    test.settle().await;

    let (_, report) = test.sink.last_report_for("web-1").expect("consumer report");
    let view = report
        .metadata
        .peers
        .get("cluster://alpha-ingress")
        .expect("cluster binding must appear in peers");
    assert_eq!(view["gateway-0"]["port"], 8443);
    assert_eq!(view["gateway-0"]["address"], "10.0.0.30");
}

#[tokio::test]
async fn named_scope_falls_back_to_common_providers() {
    let mut test = TestConfig::new();

    test.apply_pod(mk_agent_pod("ns", "agent-a", "agent-1", "n1", "10.0.0.1"));
    // The provider lives in the common scope; the consumer is scoped to "blue".
    test.apply_definition(mk_definition(
        "ns",
        "db",
        ("alpha", "main", "db"),
        None,
        MeshServiceSpec {
            provided: provided_http(),
            ..Default::default()
        },
    ));
    test.apply_definition(mk_definition(
        "ns",
        "web",
        ("alpha", "main", "web"),
        Some("blue"),
        MeshServiceSpec {
            consumed: consumed("service://alpha-main-db", "http", Isolation::Shared),
            ..Default::default()
        },
    ));
    test.apply_pod(mk_pod(
        "ns",
        "db-a",
        "db-1",
        ("alpha", "main", "db"),
        None,
        Some("n1"),
        Some("10.0.2.1"),
        Some("db-0"),
        &[("http", 5432)],
    ));
    test.apply_pod(mk_pod(
        "ns",
        "web-a",
        "web-1",
        ("alpha", "main", "web"),
        Some("blue"),
        Some("n1"),
        Some("10.0.0.10"),
        Some("web-0"),
        &[],
    ));
    test.settle().await;

    let (_, report) = test.sink.last_report_for("web-1").expect("consumer report");
    let view = report
        .metadata
        .peers
        .get("service://alpha-main-db-http")
        .expect("consumed binding must appear in peers");
    assert_eq!(view["db-0"]["port"], 5432);
}

#[tokio::test]
async fn replacement_pod_survives_stale_deletion() {
    let mut test = TestConfig::new();

    test.apply_pod(mk_pod(
        "ns",
        "web-a",
        "web-1",
        ("alpha", "main", "web"),
        None,
        Some("n1"),
        Some("10.0.0.10"),
        Some("web-0"),
        &[],
    ));
    // The replacement claims the same identity before the old pod's deletion arrives.
    test.apply_pod(mk_pod(
        "ns",
        "web-b",
        "web-2",
        ("alpha", "main", "web"),
        None,
        Some("n1"),
        Some("10.0.0.11"),
        Some("web-0"),
        &[],
    ));
    test.delete_pod("ns", "web-a");
    test.settle().await;

    let index = test.index.read();
    let service = index
        .deployment(&Scope::Common)
        .and_then(|dep| dep.services.get(&ServiceId::new("alpha", "main", "web")))
        .expect("service exists");
    assert_eq!(
        service.pods.get("web-0").map(String::as_str),
        Some("web-2"),
        "the stale deletion must not evict the replacement"
    );
}

#[tokio::test]
async fn definition_removal_retracts_consumption() {
    let mut test = TestConfig::new();

    test.apply_definition(mk_definition(
        "ns",
        "web",
        ("alpha", "main", "web"),
        None,
        MeshServiceSpec {
            consumed: consumed("service://alpha-main-db", "http", Isolation::Shared),
            ..Default::default()
        },
    ));
    test.settle().await;
    {
        let index = test.index.read();
        let service = index
            .deployment(&Scope::Common)
            .and_then(|dep| dep.services.get(&ServiceId::new("alpha", "main", "web")))
            .expect("service exists");
        assert!(service.defined);
        assert_eq!(service.consumer_handles.len(), 1);
    }

    test.delete_definition("ns", "web");
    test.settle().await;

    let index = test.index.read();
    let service = index
        .deployment(&Scope::Common)
        .and_then(|dep| dep.services.get(&ServiceId::new("alpha", "main", "web")))
        .expect("service persists after its definition is removed");
    assert!(!service.defined);
    assert!(service.consumed.is_empty());
    assert!(
        service.consumer_handles.is_empty(),
        "retracted consumption must release its handlers"
    );
}

#[tokio::test]
async fn unmanaged_pods_are_ignored() {
    let mut test = TestConfig::new();

    let mut pod = mk_pod(
        "ns",
        "web-a",
        "web-1",
        ("alpha", "main", "web"),
        None,
        Some("n1"),
        Some("10.0.0.10"),
        Some("web-0"),
        &[],
    );
    if let Some(pod_labels) = pod.metadata.labels.as_mut() {
        pod_labels.remove(labels::MANAGED);
    }
    test.apply_pod(pod);
    test.settle().await;

    let index = test.index.read();
    assert!(index.pod_routes.is_empty());
    assert!(index.infra.pods.is_empty());
}
