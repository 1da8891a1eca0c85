//! Cluster discovery configuration for the proxies of a service mesh.
//!
//! The clusters of a proxy are a pure function of three inputs: a snapshot
//! of the service registry, the destination policies and the mesh config.
//!
//! - Every port of every service gets an outbound cluster, `out.{host}|{port}`.
//! - Every port a local service instance listens on gets an inbound
//!   cluster, `in.{port}`.
//! - Every destination policy adds an override cluster per selected port,
//!   `out.{host}|{port}|{tag}`, with circuit breakers and outlier detection.
//! - The `mixer_server` cluster is always there.
//!
//! ```
//! use cds::mesh::MeshConfig;
//! use cds::policy::DestinationPolicy;
//! use cds::registry::{Port, Protocol, RegistrySnapshot, Service};
//!
//! let snapshot = RegistrySnapshot {
//!     services: vec![Service::new(
//!         "reviews.default.svc.cluster.local",
//!         vec![Port::new("http", 9080, Protocol::Http)],
//!     )],
//!     instances: vec![],
//! };
//! let policies = vec![
//!     DestinationPolicy::new("reviews.default.svc.cluster.local", [("version", "v2")]),
//! ];
//!
//! let clusters = cds::generate(&snapshot, &policies, &MeshConfig::default());
//! assert_eq!(
//!     clusters.names(),
//!     vec![
//!         "mixer_server",
//!         "out.reviews.default.svc.cluster.local|http",
//!         "out.reviews.default.svc.cluster.local|http|version=v2",
//!     ]
//! );
//! ```
//!
//! The output is sorted by cluster name, so generating twice from the same
//! inputs gives the same document.

#![deny(clippy::all, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

pub mod cluster;
pub mod errors;
pub mod generator;
pub mod mesh;
pub mod policy;
pub mod registry;

pub use generator::{generate, generate_report, Generation};
