use crate::errors::{is_not_found, ApiError};
use async_trait::async_trait;
use either::Either;
use k8s_openapi::api::core::v1::{Event, Node, Pod};
use kube::api::{Patch, PatchParams, PostParams};
use kube::core::response::Status;
use kube::{Api, Client, Config};
use log::{debug, info};
use result::Result;
use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use term_colors::*;
use tokio::sync::Mutex;

/// The ClientProvider owns the Kubernetes configuration of the executor and
/// hands out authenticated clients derived from it.
///
/// There are two flavors. The root client is what every informer and every
/// housekeeping call (delete, patch) runs as. When user impersonation is
/// enabled, pod submission instead runs as the submitting user so that the
/// API server's own RBAC and quota enforcement apply to the user rather than
/// to the executor's service account. Impersonated clients are constructed
/// lazily and cached per user for the life of the process.
pub struct ClientProvider {
    config: Config,
    namespace: String,
    impersonate: bool,
    root: Client,
    impersonated: Mutex<HashMap<String, Client>>,
}

impl ClientProvider {
    /// Infers the Kubernetes configuration from the environment (in-cluster
    /// service account or local kubeconfig), constructs the root client, and
    /// performs one round trip to prove that the API server is actually
    /// reachable. A missing or unreachable cluster is terminal for the whole
    /// process, so callers are expected to exit non-zero on an Err from here.
    pub async fn connect(namespace: &str, impersonate: bool) -> Result<ClientProvider> {
        let config = Config::infer()
            .await
            .map_err(|err| ApiError::from(kube::Error::from(err)))?;
        let root = Client::try_from(config.clone()).map_err(ApiError::from)?;
        let version = root.apiserver_version().await.map_err(ApiError::from)?;
        info!(
            "Connected to the Kubernetes API server, version {}",
            cyan(format!("{}.{}", version.major, version.minor))
        );
        Ok(ClientProvider {
            config,
            namespace: namespace.to_string(),
            impersonate,
            root,
            impersonated: Mutex::new(HashMap::new()),
        })
    }

    /// The root client. Informers and housekeeping calls run as this identity.
    pub fn client(&self) -> Client {
        self.root.clone()
    }

    /// The namespace that all batch pods live in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// A pod API bound to the batch namespace, as the root identity.
    pub fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.root.clone(), &self.namespace)
    }

    /// A cluster wide node API. Nodes are not namespaced.
    pub fn nodes(&self) -> Api<Node> {
        Api::all(self.root.clone())
    }

    /// A cluster-event API bound to the batch namespace. These are the
    /// `kubectl describe` style events that the progress monitor mines for
    /// stuck-pod diagnostics, not the executor's own lifecycle events.
    pub fn events(&self) -> Api<Event> {
        Api::namespaced(self.root.clone(), &self.namespace)
    }

    /// Returns the client that a submission on behalf of `owner` must use. With
    /// impersonation disabled (or no owner attached to the job) this is simply
    /// the root client.
    pub async fn user_client(&self, owner: Option<&str>) -> Result<Client> {
        let owner = match owner {
            Some(owner) if self.impersonate => owner,
            _ => return Ok(self.root.clone()),
        };
        let mut cache = self.impersonated.lock().await;
        if let Some(client) = cache.get(owner) {
            return Ok(client.clone());
        }
        debug!("Building an impersonation client for {}", cyan(owner));
        let mut config = self.config.clone();
        config.auth_info.impersonate = Some(owner.to_string());
        let client = Client::try_from(config).map_err(ApiError::from)?;
        cache.insert(owner.to_string(), client.clone());
        Ok(client)
    }
}

/// PodApi is the single seam through which anything in the executor WRITES to
/// the cluster. The Cluster Context consumes this trait rather than a concrete
/// client so that every contract around submission, annotation, and deletion
/// can be exercised against a recording fake.
#[async_trait]
pub trait PodApi: Send + Sync {
    /// Create the pod, optionally as the impersonated owner. The returned pod
    /// is the API server's enriched copy (uid, resource version, and so on).
    async fn create(&self, owner: Option<&str>, pod: &Pod) -> Result<Pod>;

    /// Merge-patch annotations onto the named pod. Merge patches are idempotent
    /// by construction; re-applying the same annotations is a no-op.
    async fn annotate(&self, name: &str, annotations: BTreeMap<String, String>) -> Result<Pod>;

    /// Delete the named pod. A NotFound from the API server is returned as
    /// `Right(Status)` because an already-gone pod is exactly the outcome the
    /// caller wanted. All other failures are genuine errors.
    async fn delete(&self, name: &str) -> Result<Either<Pod, Status>>;
}

#[async_trait]
impl PodApi for ClientProvider {
    async fn create(&self, owner: Option<&str>, pod: &Pod) -> Result<Pod> {
        let client = self.user_client(owner).await?;
        let api: Api<Pod> = Api::namespaced(client, &self.namespace);
        Ok(api
            .create(&PostParams::default(), pod)
            .await
            .map_err(ApiError::from)?)
    }

    async fn annotate(&self, name: &str, annotations: BTreeMap<String, String>) -> Result<Pod> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": annotations,
            }
        });
        Ok(self
            .pods()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(ApiError::from)?)
    }

    async fn delete(&self, name: &str) -> Result<Either<Pod, Status>> {
        Ok(self
            .pods()
            .delete(name, &Default::default())
            .await
            .or_else(|err| {
                if is_not_found(&err) {
                    Ok(Either::Right(Status {
                        status: "Success".to_string(),
                        message: "".to_string(),
                        reason: "NotFound".to_string(),
                        details: None,
                        code: 404,
                    }))
                } else {
                    Err(err)
                }
            })
            .map_err(ApiError::from)?)
    }
}
