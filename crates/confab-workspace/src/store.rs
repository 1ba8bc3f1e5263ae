//! The KV-backed side of a workspace: request/response channels, registered
//! services and remote processes, and client action queues.

use std::sync::Arc;

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use confab_core::{
    ChannelId, ProcessName, ProcessUri, RemoteProcessSecret, RemoteServiceSecret, ServiceId,
    Workspace,
};
use confab_kv::{KvStore, EXP_TEN_MINUTES, EXP_WORKDAY};
use confab_process::{ToolDefinition, WorkspaceContext};

use crate::requests::{ClientAction, WorkspaceRequest, WorkspaceResponse, WorkspaceStream, WrappedRequest};
use crate::WorkspaceError;

const KEY_MAPPING_PROCESS: &str = "remote:bysecret:process:";
const KEY_MAPPING_SERVICE: &str = "remote:bysecret:service:";

/// A service registered for remote interaction (client tools, pollers).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredService {
    pub workspace: Workspace,
    pub service_id: ServiceId,
    pub tools: Vec<ToolDefinition>,
    pub secret_key: RemoteServiceSecret,
    pub created_at: DateTime<Utc>,
}

/// A process whose holder may push progress and a result via its secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredProcess {
    pub process_uri: ProcessUri,
    pub secret_key: RemoteProcessSecret,
    pub name: ProcessName,
    pub created_at: DateTime<Utc>,
    pub arguments_schema: Option<Value>,
}

/// KV facade for one workspace.
#[derive(Clone)]
pub struct WorkspaceStore {
    kv: KvStore,
    workspace: Workspace,
}

impl WorkspaceStore {
    pub fn new(kv: KvStore, workspace: Workspace) -> Self {
        Self { kv, workspace }
    }

    fn key_request(&self) -> String {
        format!("workspace:{}:request", self.workspace.as_kv_path())
    }

    fn key_response(&self, channel_id: &ChannelId) -> String {
        format!(
            "workspace:{}:response:{}",
            self.workspace.as_kv_path(),
            channel_id
        )
    }

    fn key_actions(&self, service_id: &ServiceId) -> String {
        format!(
            "workspace:{}:actions:{}",
            self.workspace.as_kv_path(),
            service_id
        )
    }

    ///
    /// Channels
    ///

    /// Client side: push a request, then stream responses until the close
    /// sentinel (or raise the error sentinel).
    pub fn send_request(
        &self,
        request: WorkspaceRequest,
        recv_timeout: u64,
    ) -> impl Stream<Item = Result<WorkspaceResponse, WorkspaceError>> + '_ {
        try_stream! {
            let channel_id = ChannelId::generate();
            let wrapped = WrappedRequest {
                channel_id: channel_id.clone(),
                request,
            };
            self.kv
                .lpush(&self.key_request(), &wrapped, EXP_TEN_MINUTES)
                .await?;

            let key_response = self.key_response(&channel_id);
            loop {
                let next: Option<WorkspaceStream> =
                    self.kv.brpop(&key_response, recv_timeout).await?;
                match next {
                    None => {
                        // Blocking pops return early during shutdown.
                        confab_core::shutdown::assert_is_alive()?;
                        continue;
                    }
                    Some(WorkspaceStream::Close) => break,
                    Some(WorkspaceStream::Error { error }) => {
                        Err(WorkspaceError::Stream(error))?;
                    }
                    Some(WorkspaceStream::Value { value }) => yield value,
                }
            }
        }
    }

    /// Supervisor side: pop the next request and open its response channel.
    ///
    /// The returned sender feeds a background pump that pushes each item onto
    /// the per-channel KV list and stops after the close sentinel.
    pub async fn recv_request(
        &self,
        context: &Arc<WorkspaceContext>,
        recv_timeout: u64,
    ) -> Result<Option<(WorkspaceRequest, mpsc::Sender<WorkspaceStream>)>, WorkspaceError> {
        let wrapped: Option<WrappedRequest> =
            self.kv.brpop(&self.key_request(), recv_timeout).await?;
        let Some(wrapped) = wrapped else {
            return Ok(None);
        };

        let (tx, mut rx) = mpsc::channel::<WorkspaceStream>(16);
        let kv = self.kv.clone();
        let key_response = self.key_response(&wrapped.channel_id);
        context.spawn_task(async move {
            while let Some(item) = rx.recv().await {
                let is_close = matches!(item, WorkspaceStream::Close);
                if let Err(err) = kv.lpush(&key_response, &item, EXP_TEN_MINUTES).await {
                    debug!(error = %err, "dropping response: channel push failed");
                }
                if is_close {
                    break;
                }
            }
        });
        Ok(Some((wrapped.request, tx)))
    }

    ///
    /// Registered services
    ///

    pub async fn register_service(
        &self,
        service_id: &ServiceId,
        tools: Vec<ToolDefinition>,
    ) -> Result<RemoteServiceSecret, WorkspaceError> {
        let key_service = self.key_service_info(service_id);
        if self.kv.exists(&key_service).await? {
            return Err(WorkspaceError::BadRequest(format!(
                "duplicate service '{service_id}'"
            )));
        }

        let secret_key = RemoteServiceSecret::generate();
        let registered = RegisteredService {
            workspace: self.workspace.clone(),
            service_id: service_id.clone(),
            tools,
            secret_key: secret_key.clone(),
            created_at: Utc::now(),
        };

        let key_mapping = format!("{}{}", KEY_MAPPING_SERVICE, secret_key);
        let key_members = format!("remote:{}:service", self.workspace.as_kv_path());
        let mapping = (self.workspace.clone(), service_id.clone());

        self.kv.sadd(&key_members, &service_id.to_string()).await?;
        self.kv.expire(&key_members, EXP_WORKDAY).await?;
        self.kv
            .set_one(&key_mapping, &mapping, Some(EXP_WORKDAY))
            .await?;
        self.kv
            .set_one(&key_service, &registered, Some(EXP_WORKDAY))
            .await?;
        Ok(secret_key)
    }

    pub async fn resolve_service(
        &self,
        service_id: &ServiceId,
    ) -> Result<RegisteredService, WorkspaceError> {
        self.kv
            .get::<RegisteredService>(&self.key_service_info(service_id))
            .await?
            .ok_or_else(|| WorkspaceError::ServiceNotFound(service_id.to_string()))
    }

    fn key_service_info(&self, service_id: &ServiceId) -> String {
        format!("remote:{}:service:{}", self.workspace.as_kv_path(), service_id)
    }

    ///
    /// Client actions
    ///

    pub async fn send_action(
        &self,
        service_id: &ServiceId,
        action: &ClientAction,
    ) -> Result<(), WorkspaceError> {
        self.kv
            .rpush(&self.key_actions(service_id), action, EXP_WORKDAY)
            .await?;
        Ok(())
    }

    pub async fn recv_action(
        &self,
        service_id: &ServiceId,
        timeout_secs: u64,
    ) -> Result<Option<ClientAction>, WorkspaceError> {
        Ok(self
            .kv
            .blpop(&self.key_actions(service_id), timeout_secs)
            .await?)
    }

    ///
    /// Remote processes
    ///

    /// Register a process for remote updates; the returned secret grants the
    /// holder permission to push progress and the result.
    pub async fn register_process(
        &self,
        process_uri: &ProcessUri,
        name: &ProcessName,
        arguments_schema: Option<Value>,
    ) -> Result<RemoteProcessSecret, WorkspaceError> {
        let secret_key = RemoteProcessSecret::generate();
        let registered = RegisteredProcess {
            process_uri: process_uri.clone(),
            secret_key: secret_key.clone(),
            name: name.clone(),
            created_at: Utc::now(),
            arguments_schema,
        };
        let key = format!("{}{}", KEY_MAPPING_PROCESS, secret_key);
        self.kv.set_one(&key, &registered, Some(EXP_WORKDAY)).await?;
        Ok(secret_key)
    }
}

/// Resolve a remote service secret into its workspace and service id.
pub async fn resolve_service_secret(
    kv: &KvStore,
    secret: &RemoteServiceSecret,
) -> Result<(Workspace, ServiceId), WorkspaceError> {
    let key = format!("{}{}", KEY_MAPPING_SERVICE, secret);
    kv.get::<(Workspace, ServiceId)>(&key)
        .await?
        .ok_or_else(|| WorkspaceError::ServiceNotFound(secret.to_string()))
}

/// Poll the action queue of the service a secret belongs to.
pub async fn recv_action_by_secret(
    kv: &KvStore,
    secret: &RemoteServiceSecret,
    timeout_secs: u64,
) -> Result<Option<ClientAction>, WorkspaceError> {
    let (workspace, service_id) = resolve_service_secret(kv, secret).await?;
    WorkspaceStore::new(kv.clone(), workspace)
        .recv_action(&service_id, timeout_secs)
        .await
}

/// Resolve a remote process secret into its registration.
pub async fn resolve_process_secret(
    kv: &KvStore,
    secret: &RemoteProcessSecret,
) -> Result<RegisteredProcess, WorkspaceError> {
    let key = format!("{}{}", KEY_MAPPING_PROCESS, secret);
    kv.get::<RegisteredProcess>(&key)
        .await?
        .ok_or(WorkspaceError::ProcessSecretNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> WorkspaceStore {
        WorkspaceStore::new(
            KvStore::memory(),
            "ndw://internal/default-unit-test".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn service_registration_and_secret_resolution() {
        let store = store();
        let service_id: ServiceId = "svc-client-reply-abc".parse().unwrap();
        let secret = store.register_service(&service_id, Vec::new()).await.unwrap();

        let registered = store.resolve_service(&service_id).await.unwrap();
        assert_eq!(registered.service_id, service_id);

        let (workspace, resolved_id) = resolve_service_secret(&store.kv, &secret).await.unwrap();
        assert_eq!(workspace, store.workspace);
        assert_eq!(resolved_id, service_id);

        // Duplicate registration is rejected.
        assert!(store.register_service(&service_id, Vec::new()).await.is_err());
    }

    #[tokio::test]
    async fn actions_queue_in_order() {
        let store = store();
        let service_id: ServiceId = "svc-client-reply-abc".parse().unwrap();

        for name in ["first", "second"] {
            store
                .send_action(
                    &service_id,
                    &ClientAction {
                        secret: None,
                        name: name.to_string(),
                        arguments: serde_json::Map::new(),
                    },
                )
                .await
                .unwrap();
        }

        let first = store.recv_action(&service_id, 1).await.unwrap().unwrap();
        let second = store.recv_action(&service_id, 1).await.unwrap().unwrap();
        assert_eq!(first.name, "first");
        assert_eq!(second.name, "second");
    }

    #[tokio::test]
    async fn process_secret_round_trip() {
        let store = store();
        let uri = ProcessUri::stub("1");
        let secret = store
            .register_process(&uri, &"echo".parse().unwrap(), None)
            .await
            .unwrap();
        let registered = resolve_process_secret(&store.kv, &secret).await.unwrap();
        assert_eq!(registered.process_uri, uri);

        let missing = RemoteProcessSecret::generate();
        assert!(resolve_process_secret(&store.kv, &missing).await.is_err());
    }
}
