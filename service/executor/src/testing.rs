//! Shared test doubles. The important one is [FakePodApi], a recording
//! implementation of the cluster write seam with programmable reactions, which
//! is what lets every submission and deletion contract run without a cluster.

use async_trait::async_trait;
use either::Either;
use error::StringError;
use k8s_openapi::api::core::v1::Pod;
use k8s::PodApi;
use kube::core::response::Status;
use result::Result;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Create(String),
    Annotate(String),
    Delete(String),
}

#[derive(Debug, Clone, Copy)]
pub enum DeleteReaction {
    Succeed,
    NotFound,
    Fail,
}

pub struct FakePodApi {
    pub actions: Mutex<Vec<Action>>,
    pub create_failure: Mutex<Option<String>>,
    pub delete_reaction: Mutex<DeleteReaction>,
}

impl FakePodApi {
    pub fn new() -> FakePodApi {
        FakePodApi {
            actions: Mutex::new(Vec::new()),
            create_failure: Mutex::new(None),
            delete_reaction: Mutex::new(DeleteReaction::Succeed),
        }
    }

    pub async fn taken(&self) -> Vec<Action> {
        self.actions.lock().await.clone()
    }

    pub async fn delete_count(&self) -> usize {
        self.actions
            .lock()
            .await
            .iter()
            .filter(|action| matches!(action, Action::Delete(_)))
            .count()
    }

    pub async fn react_to_deletes(&self, reaction: DeleteReaction) {
        *self.delete_reaction.lock().await = reaction;
    }

    pub async fn fail_creates(&self, reason: &str) {
        *self.create_failure.lock().await = Some(reason.to_string());
    }
}

#[async_trait]
impl PodApi for FakePodApi {
    async fn create(&self, _owner: Option<&str>, pod: &Pod) -> Result<Pod> {
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.actions.lock().await.push(Action::Create(name));
        if let Some(reason) = self.create_failure.lock().await.clone() {
            return Err(StringError::from(reason).into());
        }
        let mut created = pod.clone();
        if created.metadata.uid.is_none() {
            created.metadata.uid = Some(format!(
                "uid-{}",
                created.metadata.name.as_deref().unwrap_or("anonymous")
            ));
        }
        Ok(created)
    }

    async fn annotate(&self, name: &str, _annotations: BTreeMap<String, String>) -> Result<Pod> {
        self.actions
            .lock()
            .await
            .push(Action::Annotate(name.to_string()));
        Ok(Pod::default())
    }

    async fn delete(&self, name: &str) -> Result<Either<Pod, Status>> {
        self.actions
            .lock()
            .await
            .push(Action::Delete(name.to_string()));
        match *self.delete_reaction.lock().await {
            DeleteReaction::Succeed => Ok(Either::Left(Pod::default())),
            DeleteReaction::NotFound => Ok(Either::Right(Status {
                status: "Success".to_string(),
                message: "".to_string(),
                reason: "NotFound".to_string(),
                details: None,
                code: 404,
            })),
            DeleteReaction::Fail => {
                Err(StringError::from("the API server is on a lunch break").into())
            }
        }
    }
}

/// A minimal batch pod for tests: both mandatory labels, the routing
/// annotations, a uid, and a phase.
pub fn batch_pod(job_id: &str, name: &str, phase: &str) -> Pod {
    serde_json::from_value(serde_json::json!({
        "metadata": {
            "name": name,
            "uid": format!("uid-{}", name),
            "labels": { "job_id": job_id, "pod_number": "0" },
            "annotations": { "queue": "test-queue", "job_set_id": "test-set" }
        },
        "status": { "phase": phase }
    }))
    .unwrap()
}
