//! Low-level thread persistence over the KV store.

use std::collections::HashMap;
use std::sync::Mutex;

use confab_core::{Scope, ThreadUri, Workspace};
use confab_kv::{KvStore, EXP_MONTH};

use crate::types::{ThreadInfo, ThreadMessage};
use crate::ThreadError;

const KEY_THREAD_INFO: &str = "thread:info:";
const KEY_THREAD_MESSAGES: &str = "thread:messages:";
const KEY_THREAD_INDEX: &str = "thread:index:";

/// Thread persistence for one workspace. Every method maps closely to a KV
/// operation; orchestration lives in the domain layer.
pub struct ThreadService {
    kv: KvStore,
    workspace: Workspace,
    cache_info: Mutex<HashMap<ThreadUri, ThreadInfo>>,
    cache_messages: Mutex<HashMap<ThreadUri, Vec<ThreadMessage>>>,
}

impl ThreadService {
    pub fn new(workspace: Workspace, kv: KvStore) -> Self {
        Self {
            kv,
            workspace,
            cache_info: Mutex::new(HashMap::new()),
            cache_messages: Mutex::new(HashMap::new()),
        }
    }

    /// Same-workspace threads are always visible; internal-scope threads are
    /// readable from anywhere.
    pub fn is_allowed(&self, uri: &ThreadUri) -> bool {
        uri.workspace == self.workspace || uri.workspace.scope == Scope::Internal
    }

    fn assert_allowed(&self, uri: &ThreadUri) -> Result<(), ThreadError> {
        if self.is_allowed(uri) {
            Ok(())
        } else {
            Err(ThreadError::NotFound(uri.clone()))
        }
    }

    pub async fn list_threads(&self) -> Result<Vec<ThreadInfo>, ThreadError> {
        let uris = self.list_thread_uris().await?;
        let keys: Vec<String> = uris
            .iter()
            .map(|uri| format!("{}{}", KEY_THREAD_INFO, uri.as_kv_path()))
            .collect();
        let infos: Vec<ThreadInfo> = self.kv.mget(&keys).await?;
        let mut cache = self.cache_info.lock().unwrap();
        for info in &infos {
            cache.insert(info.uri.clone(), info.clone());
        }
        Ok(infos)
    }

    /// Load thread metadata, creating the thread when it does not exist yet
    /// (`missing_ok`).
    pub async fn load_info(
        &self,
        uri: &ThreadUri,
        missing_ok: bool,
        use_cache: bool,
    ) -> Result<ThreadInfo, ThreadError> {
        self.assert_allowed(uri)?;
        if use_cache {
            if let Some(info) = self.cache_info.lock().unwrap().get(uri) {
                return Ok(info.clone());
            }
        }
        if let Some(info) = self.get_info(uri).await? {
            return Ok(info);
        }

        if missing_ok {
            let info = ThreadInfo::new(uri.clone());
            self.save_info(&info).await?;
            Ok(info)
        } else {
            Err(ThreadError::NotFound(uri.clone()))
        }
    }

    pub async fn load_messages(
        &self,
        uri: &ThreadUri,
        use_cache: bool,
    ) -> Result<Vec<ThreadMessage>, ThreadError> {
        self.assert_allowed(uri)?;
        if use_cache {
            if let Some(messages) = self.cache_messages.lock().unwrap().get(uri) {
                return Ok(messages.clone());
            }
        }

        let key = format!("{}{}", KEY_THREAD_MESSAGES, uri.as_kv_path());
        let messages: Vec<ThreadMessage> = self.kv.lrange(&key, 0, -1).await?;
        self.cache_messages
            .lock()
            .unwrap()
            .insert(uri.clone(), messages.clone());
        Ok(messages)
    }

    pub async fn push_message(
        &self,
        uri: &ThreadUri,
        message: ThreadMessage,
    ) -> Result<(), ThreadError> {
        self.assert_allowed(uri)?;

        let mut info = self.load_info(uri, true, false).await?;
        info.touch();

        let key = format!("{}{}", KEY_THREAD_MESSAGES, uri.as_kv_path());
        self.kv.rpush(&key, &message, EXP_MONTH).await?;
        self.save_info(&info).await?;

        if let Some(cached) = self.cache_messages.lock().unwrap().get_mut(uri) {
            cached.push(message);
        }
        Ok(())
    }

    async fn get_info(&self, uri: &ThreadUri) -> Result<Option<ThreadInfo>, ThreadError> {
        let key = format!("{}{}", KEY_THREAD_INFO, uri.as_kv_path());
        let info: Option<ThreadInfo> = self.kv.get(&key).await?;
        if let Some(info) = &info {
            self.cache_info
                .lock()
                .unwrap()
                .insert(uri.clone(), info.clone());
        }
        Ok(info)
    }

    async fn save_info(&self, info: &ThreadInfo) -> Result<(), ThreadError> {
        self.cache_info
            .lock()
            .unwrap()
            .insert(info.uri.clone(), info.clone());

        let key_info = format!("{}{}", KEY_THREAD_INFO, info.uri.as_kv_path());
        let key_index = format!("{}{}", KEY_THREAD_INDEX, self.workspace.as_kv_path());
        self.kv.set_one(&key_info, info, Some(EXP_MONTH)).await?;
        self.kv.sadd(&key_index, &info.uri.to_string()).await?;
        self.kv.expire(&key_index, EXP_MONTH).await?;
        Ok(())
    }

    async fn list_thread_uris(&self) -> Result<Vec<ThreadUri>, ThreadError> {
        let key = format!("{}{}", KEY_THREAD_INDEX, self.workspace.as_kv_path());
        let members: Vec<String> = self.kv.smembers(&key).await?;
        Ok(members
            .iter()
            .filter_map(|value| value.parse::<ThreadUri>().ok())
            .filter(|uri| uri.workspace == self.workspace)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use confab_core::UserId;

    fn service() -> ThreadService {
        ThreadService::new(
            "ndw://internal/default-unit-test".parse().unwrap(),
            KvStore::memory(),
        )
    }

    fn uri(suffix: &str) -> ThreadUri {
        format!("nkt://internal/default-unit-test/thread-9e7xc0000123456789abcde{suffix}")
            .parse()
            .unwrap()
    }

    #[tokio::test]
    async fn push_and_load_round_trip() {
        let service = service();
        let uri = uri("0");

        service
            .push_message(&uri, ThreadMessage::user(UserId::generate(), "one"))
            .await
            .unwrap();
        service
            .push_message(&uri, ThreadMessage::user(UserId::generate(), "two"))
            .await
            .unwrap();

        let messages = service.load_messages(&uri, false).await.unwrap();
        assert_eq!(messages.len(), 2);

        let info = service.load_info(&uri, false, false).await.unwrap();
        assert_eq!(info.message_count, 2);
    }

    #[tokio::test]
    async fn foreign_workspace_threads_are_hidden() {
        let service = service();
        let foreign: ThreadUri =
            "nkt://personal-54916b77-a320-4496-a8f6-f4ce7ab46fc8/default/thread-9e7xc0000123456789abcdef"
                .parse()
                .unwrap();
        assert!(matches!(
            service.load_messages(&foreign, false).await,
            Err(ThreadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn index_tracks_workspace_threads() {
        let service = service();
        service
            .push_message(&uri("1"), ThreadMessage::user(UserId::generate(), "x"))
            .await
            .unwrap();
        service
            .push_message(&uri("2"), ThreadMessage::user(UserId::generate(), "y"))
            .await
            .unwrap();

        let infos = service.list_threads().await.unwrap();
        assert_eq!(infos.len(), 2);
    }
}
