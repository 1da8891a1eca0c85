//! Builds the clusters of a proxy from the registry, the destination policies
//! and the mesh config.
//!
//! Bad input is never fatal: a service or a policy that can't be turned into
//! clusters is skipped and reported as a [`Diagnostic`], and everything else
//! is still generated.

use crate::cluster::{
    CircuitBreakers, Cluster, ClusterName, ClusterSet, DiscoveryType, Feature, Host,
    OutlierDetection, Thresholds, MIXER_CLUSTER,
};
use crate::errors::{Diagnostic, SkipReason};
use crate::mesh::MeshConfig;
use crate::policy::{render_labels, CircuitBreakerPolicy, DestinationPolicy};
use crate::registry::{Port, RegistrySnapshot, Resolution, Service};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// The outcome of a generation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub clusters: ClusterSet,
    pub diagnostics: Vec<Diagnostic>,
}

pub fn generate(
    snapshot: &RegistrySnapshot,
    policies: &[DestinationPolicy],
    mesh: &MeshConfig,
) -> ClusterSet {
    generate_report(snapshot, policies, mesh).clusters
}

#[tracing::instrument(skip_all, fields(services = snapshot.services.len(), policies = policies.len()))]
pub fn generate_report(
    snapshot: &RegistrySnapshot,
    policies: &[DestinationPolicy],
    mesh: &MeshConfig,
) -> Generation {
    let mut diagnostics = Vec::new();
    let services = valid_services(snapshot, &mut diagnostics);

    let mut clusters = Vec::new();
    clusters.extend(inbound_clusters(snapshot, mesh));
    for service in services.values() {
        clusters.extend(
            service
                .ports
                .iter()
                .map(|port| outbound_cluster(service, port, mesh)),
        );
    }
    clusters.extend(override_clusters(&services, policies, mesh, &mut diagnostics));
    clusters.push(mixer_cluster(mesh));

    for diagnostic in &diagnostics {
        warn!("skipped: {}", diagnostic);
    }

    let clusters = ClusterSet::new(clusters);
    debug!(clusters = clusters.len(), "generated clusters");
    Generation {
        clusters,
        diagnostics,
    }
}

// Services that can be turned into clusters, by hostname.
fn valid_services<'a>(
    snapshot: &'a RegistrySnapshot,
    diagnostics: &mut Vec<Diagnostic>,
) -> BTreeMap<&'a str, &'a Service> {
    let mut services = BTreeMap::new();
    for service in &snapshot.services {
        if service.ports.is_empty() {
            diagnostics.push(Diagnostic::new(&service.hostname, SkipReason::NoPorts));
            continue;
        }
        if !is_name_part(&service.hostname) {
            diagnostics.push(Diagnostic::new(
                &service.hostname,
                SkipReason::InvalidHostname,
            ));
            continue;
        }
        if services.contains_key(service.hostname.as_str()) {
            diagnostics.push(Diagnostic::new(
                &service.hostname,
                SkipReason::DuplicateHostname,
            ));
            continue;
        }
        if let Some(port) = service.ports.iter().find(|port| !is_name_part(&port.key())) {
            diagnostics.push(Diagnostic::new(
                &service.hostname,
                SkipReason::InvalidPortName(port.key()),
            ));
            continue;
        }
        let mut keys = HashSet::new();
        if let Some(port) = service.ports.iter().find(|port| !keys.insert(port.key())) {
            diagnostics.push(Diagnostic::new(
                &service.hostname,
                SkipReason::DuplicatePortName(port.key()),
            ));
            continue;
        }
        services.insert(service.hostname.as_str(), service);
    }
    services
}

// Outbound names join their parts with `|`, so a part must be nonempty
// and free of it to parse back.
fn is_name_part(part: &str) -> bool {
    !part.is_empty() && !part.contains('|')
}

fn inbound_clusters(snapshot: &RegistrySnapshot, mesh: &MeshConfig) -> Vec<Cluster> {
    // One cluster per local port, HTTP/2 if any instance on it speaks it.
    let mut ports: BTreeMap<u16, bool> = BTreeMap::new();
    for instance in &snapshot.instances {
        *ports.entry(instance.endpoint.port).or_default() |=
            instance.service_port.protocol.is_http2();
    }

    ports
        .into_iter()
        .map(|(port, http2)| {
            let mut cluster = Cluster::new(
                ClusterName::inbound(port),
                DiscoveryType::Static,
                mesh.connect_timeout_ms(),
            );
            cluster
                .hosts
                .push(Host::tcp(SocketAddr::new(mesh.inbound_address, port)));
            cluster.features = http2.then_some(Feature::Http2);
            cluster
        })
        .collect()
}

fn outbound_cluster(service: &Service, port: &Port, mesh: &MeshConfig) -> Cluster {
    let discovery_type = match service.resolution {
        Resolution::ClusterLocal => DiscoveryType::Sds,
        Resolution::Dns => DiscoveryType::StrictDns,
        Resolution::Static => DiscoveryType::Static,
    };
    let mut cluster = Cluster::new(
        ClusterName::outbound(&service.hostname, port.key()),
        discovery_type,
        mesh.connect_timeout_ms(),
    );
    cluster.service_name = Some(format!("{}|{}", service.hostname, port.key()));
    cluster.hosts = hosts(service, port, &BTreeMap::new());
    cluster.features = port.protocol.is_http2().then_some(Feature::Http2);
    cluster
}

fn hosts(service: &Service, port: &Port, labels: &BTreeMap<String, String>) -> Vec<Host> {
    match service.resolution {
        Resolution::ClusterLocal => Vec::new(),
        Resolution::Dns => vec![Host::tcp(format!("{}:{}", service.hostname, port.port))],
        Resolution::Static => service
            .endpoints
            .iter()
            .filter(|endpoint| endpoint.has_labels(labels))
            .map(|endpoint| Host::tcp(SocketAddr::new(endpoint.address, endpoint.target_port(port))))
            .collect(),
    }
}

fn override_clusters(
    services: &BTreeMap<&str, &Service>,
    policies: &[DestinationPolicy],
    mesh: &MeshConfig,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<Cluster> {
    let mut clusters = Vec::new();
    let mut names = HashSet::new();

    for policy in policies {
        let skip = |reason| Diagnostic::new(&policy.destination, reason);

        if policy.labels.is_empty() {
            diagnostics.push(skip(SkipReason::EmptyLabels));
            continue;
        }
        let Some(service) = services.get(policy.destination.as_str()) else {
            diagnostics.push(skip(SkipReason::UnknownDestination(
                policy.destination.clone(),
            )));
            continue;
        };
        let tag = policy.effective_tag();
        if !is_name_part(&tag) {
            diagnostics.push(skip(SkipReason::InvalidTag(tag)));
            continue;
        }
        let ports: Vec<&Port> = match &policy.port {
            Some(selector) => service.ports.iter().filter(|p| selector.matches(p)).collect(),
            None => service.ports.iter().collect(),
        };
        if ports.is_empty() {
            let port = policy
                .port
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            diagnostics.push(skip(SkipReason::UnknownPort(port)));
            continue;
        }

        for port in ports {
            let cluster = override_cluster(service, port, policy, &tag, mesh);
            let name = cluster.name.to_string();
            if !names.insert(name.clone()) {
                diagnostics.push(skip(SkipReason::DuplicateTag(name)));
                continue;
            }
            clusters.push(cluster);
        }
    }
    clusters
}

fn override_cluster(
    service: &Service,
    port: &Port,
    policy: &DestinationPolicy,
    tag: &str,
    mesh: &MeshConfig,
) -> Cluster {
    let default_policy = CircuitBreakerPolicy::default();
    let cb = policy.circuit_breaker.as_ref().unwrap_or(&default_policy);

    let mut cluster = outbound_cluster(service, port, mesh);
    cluster.name = cluster.name.with_tag(tag);
    cluster.service_name = Some(format!(
        "{}|{}|{}",
        service.hostname,
        port.key(),
        render_labels(&policy.labels)
    ));
    cluster.hosts = hosts(service, port, &policy.labels);
    cluster.lb_type = policy.load_balancing.unwrap_or_default();
    cluster.max_requests_per_connection = cb.http_max_requests_per_connection;
    cluster.circuit_breakers = Some(CircuitBreakers {
        default: Thresholds {
            max_connections: Some(cb.max_connections),
            max_pending_requests: Some(cb.http_max_pending_requests),
            max_requests: Some(cb.http_max_requests),
            max_retries: Some(cb.http_max_retries),
        },
    });
    cluster.outlier_detection = Some(OutlierDetection {
        consecutive_5xx: Some(cb.http_consecutive_errors),
        interval_ms: Some(millis(cb.http_detection_interval)),
        base_ejection_time_ms: Some(millis(cb.sleep_window)),
        max_ejection_percent: Some(cb.http_max_ejection_percent),
    });
    cluster
}

fn mixer_cluster(mesh: &MeshConfig) -> Cluster {
    let mut cluster = Cluster::new(
        ClusterName::Fixed(MIXER_CLUSTER.to_string()),
        DiscoveryType::StrictDns,
        mesh.connect_timeout_ms(),
    );
    cluster.hosts.push(Host::tcp(&mesh.mixer_address));
    cluster.features = Some(Feature::Http2);
    cluster.circuit_breakers = Some(CircuitBreakers {
        default: Thresholds {
            max_pending_requests: Some(10_000),
            max_requests: Some(10_000),
            ..Default::default()
        },
    });
    cluster
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LbType;
    use crate::policy::PortSelector;
    use crate::registry::{Endpoint, Protocol, ServiceInstance, StaticEndpoint};
    use std::net::IpAddr;

    fn instance(port: u16) -> ServiceInstance {
        ServiceInstance {
            hostname: "hello.default.svc.cluster.local".to_string(),
            endpoint: Endpoint {
                address: "10.0.0.5".parse().unwrap(),
                port,
            },
            service_port: Port::new("http", port, Protocol::Http),
        }
    }

    fn static_endpoint(address: &str, version: &str) -> StaticEndpoint {
        StaticEndpoint {
            address: address.parse().unwrap(),
            ports: BTreeMap::new(),
            labels: BTreeMap::from([("version".to_string(), version.to_string())]),
        }
    }

    #[test]
    fn inbound_ports_without_policies() {
        let snapshot = RegistrySnapshot {
            services: Vec::new(),
            instances: [1081, 1090, 1100, 1110, 3333, 80, 9999]
                .into_iter()
                .map(instance)
                .collect(),
        };
        let clusters = generate(&snapshot, &[], &MeshConfig::default());

        let inbound: Vec<&Cluster> = clusters.iter().filter(|c| c.name.is_inbound()).collect();
        assert_eq!(inbound.len(), 7);
        assert_eq!(
            inbound
                .iter()
                .map(|c| c.name.to_string())
                .collect::<Vec<_>>(),
            vec!["in.1081", "in.1090", "in.1100", "in.1110", "in.3333", "in.80", "in.9999"]
        );
        for cluster in inbound {
            assert_eq!(cluster.discovery_type, DiscoveryType::Static);
            assert_eq!(cluster.lb_type, LbType::RoundRobin);
            assert!(cluster.service_name.is_none());
            let ClusterName::Inbound { port } = cluster.name else {
                unreachable!()
            };
            assert_eq!(cluster.hosts, vec![Host::tcp(format!("127.0.0.1:{port}"))]);
        }
        assert_eq!(clusters.names().last().unwrap(), "mixer_server");
    }

    #[test]
    fn one_outbound_cluster_per_port() {
        let snapshot = RegistrySnapshot {
            services: vec![Service::new(
                "hello.default.svc.cluster.local",
                vec![
                    Port::new("http", 80, Protocol::Http),
                    Port::new("grpc", 90, Protocol::Grpc),
                    Port::new("", 3306, Protocol::Tcp),
                ],
            )],
            instances: Vec::new(),
        };
        let clusters = generate(&snapshot, &[], &MeshConfig::default());
        assert_eq!(
            clusters.names(),
            vec![
                "mixer_server",
                "out.hello.default.svc.cluster.local|3306",
                "out.hello.default.svc.cluster.local|grpc",
                "out.hello.default.svc.cluster.local|http",
            ]
        );
        let grpc = clusters
            .get("out.hello.default.svc.cluster.local|grpc")
            .unwrap();
        assert_eq!(grpc.discovery_type, DiscoveryType::Sds);
        assert!(grpc.hosts.is_empty());
        assert_eq!(grpc.features, Some(Feature::Http2));
        assert_eq!(
            grpc.service_name.as_deref(),
            Some("hello.default.svc.cluster.local|grpc")
        );
    }

    #[test]
    fn dns_and_static_resolution() {
        let snapshot = RegistrySnapshot {
            services: vec![
                Service::new("google.com", vec![Port::new("https", 443, Protocol::Https)])
                    .resolved_by_dns(),
                Service::new("payments.external", vec![Port::new("http", 8080, Protocol::Http)])
                    .with_static_endpoints(vec![
                        StaticEndpoint {
                            ports: BTreeMap::from([("http".to_string(), 18080)]),
                            ..static_endpoint("10.1.0.1", "v1")
                        },
                        static_endpoint("10.1.0.2", "v2"),
                    ]),
            ],
            instances: Vec::new(),
        };
        let clusters = generate(&snapshot, &[], &MeshConfig::default());

        let google = clusters.get("out.google.com|https").unwrap();
        assert_eq!(google.discovery_type, DiscoveryType::StrictDns);
        assert_eq!(google.hosts, vec![Host::tcp("google.com:443")]);

        let payments = clusters.get("out.payments.external|http").unwrap();
        assert_eq!(payments.discovery_type, DiscoveryType::Static);
        assert_eq!(
            payments.hosts,
            vec![Host::tcp("10.1.0.1:18080"), Host::tcp("10.1.0.2:8080")]
        );
    }

    #[test]
    fn override_cluster_carries_policy() {
        let snapshot = RegistrySnapshot {
            services: vec![Service::new(
                "payments.external",
                vec![
                    Port::new("http", 8080, Protocol::Http),
                    Port::new("admin", 9000, Protocol::Http),
                ],
            )
            .with_static_endpoints(vec![
                static_endpoint("10.1.0.1", "v1"),
                static_endpoint("10.1.0.2", "v2"),
            ])],
            instances: Vec::new(),
        };
        let policy = DestinationPolicy::new("payments.external", [("version", "v2")])
            .on_port(PortSelector::Name("http".to_string()))
            .load_balancing(LbType::Random)
            .circuit_breaker(CircuitBreakerPolicy {
                max_connections: 100,
                http_max_requests_per_connection: Some(10),
                sleep_window: Duration::from_secs(15),
                ..Default::default()
            });

        let clusters = generate(&snapshot, &[policy], &MeshConfig::default());
        assert!(clusters.get("out.payments.external|admin|version=v2").is_none());

        let cluster = clusters.get("out.payments.external|http|version=v2").unwrap();
        assert!(cluster.name.is_override());
        assert_eq!(
            cluster.service_name.as_deref(),
            Some("payments.external|http|version=v2")
        );
        assert_eq!(cluster.hosts, vec![Host::tcp("10.1.0.2:8080")]);
        assert_eq!(cluster.lb_type, LbType::Random);
        assert_eq!(cluster.max_requests_per_connection, Some(10));
        assert_eq!(
            cluster.circuit_breakers,
            Some(CircuitBreakers {
                default: Thresholds {
                    max_connections: Some(100),
                    max_pending_requests: Some(1024),
                    max_requests: Some(1024),
                    max_retries: Some(3),
                }
            })
        );
        assert_eq!(
            cluster.outlier_detection,
            Some(OutlierDetection {
                consecutive_5xx: Some(5),
                interval_ms: Some(10_000),
                base_ejection_time_ms: Some(15_000),
                max_ejection_percent: Some(10),
            })
        );
    }

    #[test]
    fn override_clusters_always_have_breakers_and_outlier_detection() {
        let snapshot = RegistrySnapshot {
            services: vec![Service::new(
                "world.default.svc.cluster.local",
                vec![
                    Port::new("http", 80, Protocol::Http),
                    Port::new("grpc", 90, Protocol::Grpc),
                ],
            )],
            instances: Vec::new(),
        };
        let policies = vec![DestinationPolicy::new(
            "world.default.svc.cluster.local",
            [("version", "v1")],
        )
        .tagged("v1")];

        let clusters = generate(&snapshot, &policies, &MeshConfig::default());
        let overrides: Vec<&Cluster> = clusters.iter().filter(|c| c.name.is_override()).collect();
        assert_eq!(overrides.len(), 2);
        for cluster in overrides {
            assert!(cluster.circuit_breakers.is_some());
            assert!(cluster.outlier_detection.is_some());
            assert_eq!(cluster.max_requests_per_connection, None);
        }
        let base = clusters.get("out.world.default.svc.cluster.local|http").unwrap();
        assert!(base.circuit_breakers.is_none());
        assert!(base.outlier_detection.is_none());
    }

    #[test]
    fn skips_bad_input_with_diagnostics() {
        let hello = Service::new(
            "hello.default.svc.cluster.local",
            vec![Port::new("http", 80, Protocol::Http)],
        );
        let snapshot = RegistrySnapshot {
            services: vec![
                hello.clone(),
                Service::new("empty.default.svc.cluster.local", Vec::new()),
                hello.clone(),
                Service::new(
                    "twice.default.svc.cluster.local",
                    vec![
                        Port::new("http", 80, Protocol::Http),
                        Port::new("http", 8080, Protocol::Http),
                    ],
                ),
            ],
            instances: Vec::new(),
        };
        let no_labels: [(&str, &str); 0] = [];
        let policies = vec![
            DestinationPolicy::new("hello.default.svc.cluster.local", no_labels),
            DestinationPolicy::new("nowhere.default.svc.cluster.local", [("a", "b")]),
            DestinationPolicy::new("hello.default.svc.cluster.local", [("a", "b")])
                .on_port(PortSelector::Number(9090)),
            DestinationPolicy::new("hello.default.svc.cluster.local", [("a", "b")])
                .tagged("a|b"),
            DestinationPolicy::new("hello.default.svc.cluster.local", [("a", "b")]),
            DestinationPolicy::new("hello.default.svc.cluster.local", [("a", "b")]),
        ];

        let generation = generate_report(&snapshot, &policies, &MeshConfig::default());
        assert_eq!(
            generation.clusters.names(),
            vec![
                "mixer_server",
                "out.hello.default.svc.cluster.local|http",
                "out.hello.default.svc.cluster.local|http|a=b",
            ]
        );
        let reasons: Vec<SkipReason> = generation
            .diagnostics
            .into_iter()
            .map(|d| d.reason)
            .collect();
        assert_eq!(
            reasons,
            vec![
                SkipReason::NoPorts,
                SkipReason::DuplicateHostname,
                SkipReason::DuplicatePortName("http".to_string()),
                SkipReason::EmptyLabels,
                SkipReason::UnknownDestination("nowhere.default.svc.cluster.local".to_string()),
                SkipReason::UnknownPort("9090".to_string()),
                SkipReason::InvalidTag("a|b".to_string()),
                SkipReason::DuplicateTag(
                    "out.hello.default.svc.cluster.local|http|a=b".to_string()
                ),
            ]
        );
    }

    #[test]
    fn skips_names_that_would_not_parse_back() {
        let snapshot = RegistrySnapshot {
            services: vec![
                Service::new("", vec![Port::new("http", 80, Protocol::Http)]),
                Service::new("a|b.svc", vec![Port::new("http", 80, Protocol::Http)]),
                Service::new(
                    "piped.default.svc.cluster.local",
                    vec![Port::new("http|v1", 80, Protocol::Http)],
                ),
                Service::new(
                    "hello.default.svc.cluster.local",
                    vec![Port::new("http", 80, Protocol::Http)],
                ),
            ],
            instances: Vec::new(),
        };
        let policies = vec![
            DestinationPolicy::new("hello.default.svc.cluster.local", [("version", "v1")])
                .tagged(""),
        ];

        let generation = generate_report(&snapshot, &policies, &MeshConfig::default());
        assert_eq!(
            generation.clusters.names(),
            vec!["mixer_server", "out.hello.default.svc.cluster.local|http"]
        );
        let reasons: Vec<SkipReason> = generation
            .diagnostics
            .into_iter()
            .map(|d| d.reason)
            .collect();
        assert_eq!(
            reasons,
            vec![
                SkipReason::InvalidHostname,
                SkipReason::InvalidHostname,
                SkipReason::InvalidPortName("http|v1".to_string()),
                SkipReason::InvalidTag(String::new()),
            ]
        );
        for cluster in generation.clusters.iter() {
            assert_eq!(cluster.name.to_string().parse::<ClusterName>().unwrap(), cluster.name);
        }
    }

    #[test]
    fn mixer_cluster_is_always_present() {
        let mesh = MeshConfig {
            connect_timeout: Duration::from_millis(250),
            mixer_address: "mixer.local:9091".to_string(),
            inbound_address: IpAddr::from([127, 0, 0, 1]),
        };
        let clusters = generate(&RegistrySnapshot::default(), &[], &mesh);
        assert_eq!(clusters.len(), 1);

        let mixer = clusters.get(MIXER_CLUSTER).unwrap();
        assert_eq!(mixer.discovery_type, DiscoveryType::StrictDns);
        assert_eq!(mixer.connect_timeout_ms, 250);
        assert_eq!(mixer.hosts, vec![Host::tcp("mixer.local:9091")]);
        assert_eq!(mixer.features, Some(Feature::Http2));
        assert_eq!(
            mixer.circuit_breakers.as_ref().unwrap().default.max_requests,
            Some(10_000)
        );
    }
}
