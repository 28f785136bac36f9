//! Kubernetes deployment backend.
//!
//! Each managed deployment maps onto one `apps/v1` Deployment with a single
//! `worker` container. Labels and annotations are carried over as is; the pod
//! selector is the managed-by marker plus the queue id label.

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleet_model::{labels, LabelSelector, ManagedDeployment, ReplicaSpec};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector as PodSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, DeploymentBackend};

/// Name of the worker container in every pod.
pub const WORKER_CONTAINER: &str = "worker";

/// Worker deployments in one namespace of a Kubernetes cluster.
#[derive(Clone)]
pub struct KubernetesBackend {
    api: Api<Deployment>,
    namespace: String,
}

impl std::fmt::Debug for KubernetesBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubernetesBackend")
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl KubernetesBackend {
    /// Connects with the in-cluster service account, or the local kubeconfig
    /// outside a cluster.
    pub async fn connect(namespace: &str) -> Result<Self, BackendError> {
        let client = Client::try_default()
            .await
            .map_err(|e| BackendError::Unavailable(format!("kubernetes client: {e}")))?;
        info!(namespace, "Connected to Kubernetes");
        Ok(Self::new(client, namespace))
    }

    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

#[async_trait]
impl DeploymentBackend for KubernetesBackend {
    async fn list_managed(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<ManagedDeployment>, BackendError> {
        let params = ListParams::default().labels(&selector.to_string());
        let list = self
            .api
            .list(&params)
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        let mut out = Vec::with_capacity(list.items.len());
        for deployment in &list.items {
            match from_deployment(deployment) {
                Some(managed) => out.push(managed),
                None => warn!(
                    namespace = %self.namespace,
                    "Skipping deployment without a name"
                ),
            }
        }
        debug!(namespace = %self.namespace, count = out.len(), "Listed managed deployments");
        Ok(out)
    }

    async fn create(&self, deployment: &ManagedDeployment) -> Result<(), BackendError> {
        self.api
            .create(&PostParams::default(), &to_deployment(deployment))
            .await
            .map_err(|e| api_error(&deployment.name, e))?;
        Ok(())
    }

    async fn update(&self, deployment: &ManagedDeployment) -> Result<(), BackendError> {
        self.api
            .replace(&deployment.name, &PostParams::default(), &to_deployment(deployment))
            .await
            .map_err(|e| api_error(&deployment.name, e))?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), BackendError> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(name, "Deployment already gone");
                Ok(())
            }
            Err(e) => Err(api_error(name, e)),
        }
    }
}

fn api_error(name: &str, error: kube::Error) -> BackendError {
    match error {
        kube::Error::Api(response) if response.code == 409 => {
            BackendError::AlreadyExists(name.to_string())
        }
        kube::Error::Api(response) if response.code == 404 => BackendError::NotFound(name.to_string()),
        other => BackendError::Unavailable(format!("{name}: {other}")),
    }
}

/// Labels that tie the pods to their deployment.
fn pod_selector(deployment: &ManagedDeployment) -> BTreeMap<String, String> {
    deployment
        .labels
        .iter()
        .filter(|(key, _)| key.as_str() == labels::MANAGED_BY || key.as_str() == labels::QUEUE_ID)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Renders the cluster object for a managed deployment.
pub fn to_deployment(deployment: &ManagedDeployment) -> Deployment {
    let spec = &deployment.replica_spec;
    let env = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..EnvVar::default()
        })
        .collect();

    Deployment {
        metadata: ObjectMeta {
            name: Some(deployment.name.clone()),
            labels: Some(deployment.labels.clone()),
            annotations: Some(deployment.annotations.clone()),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(i32::try_from(spec.replicas).unwrap_or(i32::MAX)),
            selector: PodSelector {
                match_labels: Some(pod_selector(deployment)),
                ..PodSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(deployment.labels.clone()),
                    annotations: Some(deployment.annotations.clone()),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: WORKER_CONTAINER.to_string(),
                        image: Some(spec.image.clone()),
                        env: Some(env),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

/// Reads a cluster object back. `None` when it has no name.
pub fn from_deployment(deployment: &Deployment) -> Option<ManagedDeployment> {
    let name = deployment.metadata.name.clone()?;
    let spec = deployment.spec.as_ref();

    let container = spec
        .and_then(|s| s.template.spec.as_ref())
        .and_then(|pod| {
            pod.containers
                .iter()
                .find(|c| c.name == WORKER_CONTAINER)
                .or_else(|| pod.containers.first())
        });

    let env = container
        .and_then(|c| c.env.as_ref())
        .map(|vars| {
            vars.iter()
                .filter_map(|var| Some((var.name.clone(), var.value.clone()?)))
                .collect()
        })
        .unwrap_or_default();

    Some(ManagedDeployment {
        name,
        labels: deployment.metadata.labels.clone().unwrap_or_default(),
        annotations: deployment.metadata.annotations.clone().unwrap_or_default(),
        replica_spec: ReplicaSpec {
            // The API server defaults a missing count to one.
            replicas: spec
                .and_then(|s| s.replicas)
                .map_or(1, |r| u32::try_from(r).unwrap_or(0)),
            image: container.and_then(|c| c.image.clone()).unwrap_or_default(),
            env,
        },
    })
}
