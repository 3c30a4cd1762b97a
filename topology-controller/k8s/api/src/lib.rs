#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;
mod mesh_service;

pub use self::mesh_service::{
    ClusterProvidedEndpoint, ConsumedEndpoint, Isolation, MeshService, MeshServiceSpec,
    ProvidedEndpoint,
};
pub use k8s_openapi::api::{
    self,
    core::v1::{Container, ContainerPort, EnvVar, Pod, PodSpec, PodStatus},
};
pub use kube::api::{ObjectMeta, ResourceExt};
