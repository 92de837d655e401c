use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, Txn, TxnOp, TxnOpResponse,
    TxnResponse, WatchOptions, WatchResponse,
};
use futures::{StreamExt, stream};
use log::debug;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::api::store::{ObjectStore, RawObject, StoreError, StoreEvent, StoreEventStream};
use crate::protocol::config::XlineConfig;

/// like etcd, k:{prefix}/persistentvolumeclaims/claim_name v:yaml file of claim
/// k:{prefix}/storageclasses/class_name v:yaml file of class, and so on per kind
#[derive(Clone)]
pub struct XlineStore {
    client: Arc<RwLock<Client>>,
    prefix: String,
}

impl XlineStore {
    pub async fn new(cfg: &XlineConfig) -> Result<Self, StoreError> {
        let options = match (&cfg.username, &cfg.password) {
            (Some(user), Some(password)) => {
                Some(ConnectOptions::new().with_user(user.clone(), password.clone()))
            }
            _ => None,
        };
        let client = Client::connect(&cfg.endpoints, options).await?;
        Ok(Self {
            client: Arc::new(RwLock::new(client)),
            prefix: cfg.prefix.trim_end_matches('/').to_string(),
        })
    }

    fn kind_prefix(&self, kind: &str) -> String {
        format!("{}/{kind}/", self.prefix)
    }

    fn key(&self, kind: &str, name: &str) -> String {
        format!("{}/{kind}/{name}", self.prefix)
    }

    /// Runs a guarded write. On failure the `or_else` branch fetched the key,
    /// which tells a stale revision apart from a deleted object.
    async fn guarded(
        &self,
        kind: &'static str,
        name: &str,
        txn: Txn,
    ) -> Result<TxnResponse, StoreError> {
        let resp = {
            let mut client = self.client.write().await;
            client.txn(txn).await?
        };
        if resp.succeeded() {
            return Ok(resp);
        }
        let exists = resp.op_responses().iter().any(|op| match op {
            TxnOpResponse::Get(get) => !get.kvs().is_empty(),
            _ => false,
        });
        if exists {
            Err(StoreError::conflict(kind, name))
        } else {
            Err(StoreError::not_found(kind, name))
        }
    }
}

#[async_trait]
impl ObjectStore for XlineStore {
    async fn get(&self, kind: &'static str, name: &str) -> Result<Option<RawObject>, StoreError> {
        let key = self.key(kind, name);
        let mut client = self.client.write().await;
        let resp = client.get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| RawObject {
            name: name.to_string(),
            value: String::from_utf8_lossy(kv.value()).to_string(),
            revision: kv.mod_revision(),
        }))
    }

    async fn list(&self, kind: &'static str) -> Result<(Vec<RawObject>, i64), StoreError> {
        let key_prefix = self.kind_prefix(kind);
        let mut client = self.client.write().await;
        let resp = client
            .get(key_prefix.clone(), Some(GetOptions::new().with_prefix()))
            .await?;
        let rev = resp.header().map(|h| h.revision()).unwrap_or(0);
        let items = resp
            .kvs()
            .iter()
            .map(|kv| RawObject {
                name: String::from_utf8_lossy(kv.key()).replace(&key_prefix, ""),
                value: String::from_utf8_lossy(kv.value()).to_string(),
                revision: kv.mod_revision(),
            })
            .collect();
        Ok((items, rev))
    }

    async fn create(
        &self,
        kind: &'static str,
        name: &str,
        value: String,
    ) -> Result<i64, StoreError> {
        let key = self.key(kind, name);
        let txn = Txn::new()
            .when([Compare::version(key.clone(), CompareOp::Equal, 0)])
            .and_then([TxnOp::put(key.clone(), value, None)])
            .or_else([TxnOp::get(key, None)]);
        match self.guarded(kind, name, txn).await {
            Ok(resp) => Ok(resp.header().map(|h| h.revision()).unwrap_or(0)),
            // the key exists, which for a create is the conflict itself
            Err(StoreError::NotFound { .. }) => Err(StoreError::conflict(kind, name)),
            Err(e) => Err(e),
        }
    }

    async fn update(
        &self,
        kind: &'static str,
        name: &str,
        value: String,
        expected_revision: i64,
    ) -> Result<i64, StoreError> {
        let key = self.key(kind, name);
        let txn = Txn::new()
            .when([Compare::mod_revision(
                key.clone(),
                CompareOp::Equal,
                expected_revision,
            )])
            .and_then([TxnOp::put(key.clone(), value, None)])
            .or_else([TxnOp::get(key, None)]);
        let resp = self.guarded(kind, name, txn).await?;
        Ok(resp.header().map(|h| h.revision()).unwrap_or(0))
    }

    async fn delete(
        &self,
        kind: &'static str,
        name: &str,
        expected_revision: Option<i64>,
    ) -> Result<(), StoreError> {
        let key = self.key(kind, name);
        // a missing key has mod_revision 0, so the revision guard also
        // fails for objects deleted in the meantime
        let guard = match expected_revision {
            Some(rev) => Compare::mod_revision(key.clone(), CompareOp::Equal, rev),
            None => Compare::version(key.clone(), CompareOp::Greater, 0),
        };
        let txn = Txn::new()
            .when([guard])
            .and_then([TxnOp::delete(key.clone(), None)])
            .or_else([TxnOp::get(key, None)]);
        self.guarded(kind, name, txn).await?;
        Ok(())
    }

    async fn watch(&self, kind: &'static str, since: i64) -> Result<StoreEventStream, StoreError> {
        let key_prefix = self.kind_prefix(kind);
        let opts = WatchOptions::new()
            .with_prefix()
            .with_start_revision(since);
        let (watcher, stream) = {
            let mut client = self.client.write().await;
            client.watch(key_prefix.clone(), Some(opts)).await?
        };
        debug!("watching {key_prefix} from revision {since}");

        let events = stream.flat_map(move |resp| {
            // dropping the watcher cancels the server side watch
            let _keep_alive = &watcher;
            stream::iter(convert_watch_response(kind, &key_prefix, resp))
        });
        Ok(events.boxed())
    }
}

fn convert_watch_response(
    kind: &'static str,
    key_prefix: &str,
    resp: Result<WatchResponse, etcd_client::Error>,
) -> Vec<Result<StoreEvent, StoreError>> {
    let resp = match resp {
        Ok(resp) => resp,
        Err(e) => return vec![Err(e.into())],
    };
    if resp.canceled() {
        if resp.compact_revision() > 0 {
            return vec![Err(StoreError::Compacted(resp.compact_revision()))];
        }
        return vec![Err(StoreError::WatchClosed)];
    }
    resp.events()
        .iter()
        .filter_map(|ev| {
            let kv = ev.kv()?;
            let name = String::from_utf8_lossy(kv.key()).replace(key_prefix, "");
            let value = match ev.event_type() {
                EventType::Put => Some(String::from_utf8_lossy(kv.value()).to_string()),
                EventType::Delete => None,
            };
            Some(Ok(StoreEvent {
                kind,
                name,
                revision: kv.mod_revision(),
                value,
            }))
        })
        .collect()
}
