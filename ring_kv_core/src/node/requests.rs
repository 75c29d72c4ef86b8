//! Client command handling on a storage node.

use super::{NodeCore, PutOutcome, StorageNode};
use crate::hash::KeyHash;
use crate::metrics::MetricsCollector;
use crate::protocol::{ClientRequest, ClientResponse, CoordAction, DELETE_SENTINEL};
use tracing::error;

impl StorageNode {
    pub async fn handle_client(&self, request: ClientRequest) -> ClientResponse {
        match request {
            ClientRequest::Get { key } => self.get(key).await,
            ClientRequest::Put { key, value } => self.put(key, value).await,
            ClientRequest::KeyRange => match self.metadata().await {
                Some(ring) if !ring.is_empty() => ClientResponse::KeyRangeSuccess {
                    ranges: ring.to_keyrange(),
                },
                _ => ClientResponse::KeyRangeError,
            },
            ClientRequest::KeyRangeRead => match self.metadata().await {
                Some(ring) if !ring.is_empty() => ClientResponse::KeyRangeReadSuccess {
                    ranges: ring.to_keyrange_read(),
                },
                _ => ClientResponse::KeyRangeError,
            },
            ClientRequest::Stats => match serde_json::to_string(&self.metrics.snapshot()) {
                Ok(json) => ClientResponse::Stats { json },
                Err(e) => ClientResponse::failed(e.to_string()),
            },
        }
    }

    async fn get(&self, key: String) -> ClientResponse {
        MetricsCollector::incr(&self.metrics.gets);
        let mut core = self.core.lock().await;
        if !core.lifecycle.serves_clients() {
            return ClientResponse::ServerStopped;
        }

        if !core.owns(&self.id, &key) {
            if let Some(answer) = self.replica_read(&core, &key) {
                return answer;
            }
            return self.not_responsible(&core);
        }

        match core.get(&key).await {
            Ok(Some(value)) => ClientResponse::GetSuccess { key, value },
            Ok(None) => ClientResponse::GetError { key },
            Err(e) => {
                error!("GET {} failed: {}", key, e);
                ClientResponse::GetError { key }
            }
        }
    }

    /// Serve a get from replica data when the key falls in this node's
    /// read range and replica reads are enabled.
    fn replica_read(&self, core: &NodeCore, key: &str) -> Option<ClientResponse> {
        if !self.config.node.serve_replica_reads {
            return None;
        }
        let ring = core.metadata.as_ref()?;
        let read_range = ring.read_range(&self.id)?;
        if !read_range.contains(KeyHash::of(key)) {
            return None;
        }
        Some(match core.replicas.get_owned(ring, key) {
            Some(value) => ClientResponse::GetSuccess {
                key: key.to_string(),
                value: value.clone(),
            },
            None => ClientResponse::GetError {
                key: key.to_string(),
            },
        })
    }

    async fn put(&self, key: String, value: String) -> ClientResponse {
        let mut core = self.core.lock().await;
        if !core.lifecycle.serves_clients() {
            return ClientResponse::ServerStopped;
        }
        if core.write_lock {
            MetricsCollector::incr(&self.metrics.write_lock_rejections);
            return ClientResponse::ServerWriteLock;
        }
        if !core.owns(&self.id, &key) {
            return self.not_responsible(&core);
        }

        if value == DELETE_SENTINEL {
            MetricsCollector::incr(&self.metrics.deletes);
            return match core.delete(&key).await {
                Ok(true) => {
                    self.replication.replicate(CoordAction::Delete, &key, None);
                    ClientResponse::DeleteSuccess { key }
                }
                Ok(false) => ClientResponse::DeleteError { key },
                Err(e) => {
                    error!("DELETE {} failed: {}", key, e);
                    ClientResponse::DeleteError { key }
                }
            };
        }

        MetricsCollector::incr(&self.metrics.puts);
        match core.put(key.clone(), value.clone()).await {
            Ok(PutOutcome::Inserted) => {
                self.replication.replicate(CoordAction::Put, &key, Some(&value));
                ClientResponse::PutSuccess { key, value }
            }
            Ok(PutOutcome::Updated) => {
                self.replication.replicate(CoordAction::Update, &key, Some(&value));
                ClientResponse::PutUpdate { key, value }
            }
            Err(e) => {
                error!("PUT {} failed: {}", key, e);
                ClientResponse::PutError { key, value }
            }
        }
    }

    fn not_responsible(&self, core: &NodeCore) -> ClientResponse {
        MetricsCollector::incr(&self.metrics.not_responsible);
        ClientResponse::ServerNotResponsible {
            metadata: core
                .metadata
                .as_ref()
                .map(|ring| ring.to_keyrange())
                .unwrap_or_default(),
        }
    }
}
