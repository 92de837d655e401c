use async_trait::async_trait;
use futures::stream::BoxStream;
use tonic::Code;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("conflicting write to {kind}/{name}")]
    Conflict { kind: &'static str, name: String },
    #[error("{kind}/{name} not found")]
    NotFound { kind: &'static str, name: String },
    #[error("required revision {0} has been compacted")]
    Compacted(i64),
    #[error("watch channel closed")]
    WatchClosed,
    #[error(transparent)]
    Object(#[from] common::ObjectError),
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
}

impl From<etcd_client::Error> for StoreError {
    fn from(e: etcd_client::Error) -> Self {
        if let etcd_client::Error::GRpcStatus(status) = &e
            && status.code() == Code::OutOfRange
            && status
                .message()
                .contains("required revision has been compacted")
        {
            return StoreError::Compacted(0);
        }
        StoreError::Xline(Box::new(e))
    }
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub(crate) fn conflict(kind: &'static str, name: &str) -> Self {
        StoreError::Conflict {
            kind,
            name: name.to_string(),
        }
    }

    pub(crate) fn not_found(kind: &'static str, name: &str) -> Self {
        StoreError::NotFound {
            kind,
            name: name.to_string(),
        }
    }
}

/// A stored value together with the revision it was last modified at.
#[derive(Debug, Clone, PartialEq)]
pub struct RawObject {
    pub name: String,
    pub value: String,
    pub revision: i64,
}

/// A single change observed on a kind. `value` is `None` for deletions.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub kind: &'static str,
    pub name: String,
    pub revision: i64,
    pub value: Option<String>,
}

pub type StoreEventStream = BoxStream<'static, Result<StoreEvent, StoreError>>;

/// Versioned key-value storage for cluster objects.
///
/// Every write is a compare-and-swap: `create` only succeeds if the key is
/// absent, `update` and guarded `delete` only if the key still sits at the
/// expected revision. Anything else is reported as [`StoreError::Conflict`]
/// (or [`StoreError::NotFound`] when the key vanished) and never applied.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, kind: &'static str, name: &str) -> Result<Option<RawObject>, StoreError>;

    /// All objects of a kind plus the store revision the listing reflects.
    async fn list(&self, kind: &'static str) -> Result<(Vec<RawObject>, i64), StoreError>;

    async fn create(&self, kind: &'static str, name: &str, value: String)
    -> Result<i64, StoreError>;

    async fn update(
        &self,
        kind: &'static str,
        name: &str,
        value: String,
        expected_revision: i64,
    ) -> Result<i64, StoreError>;

    async fn delete(
        &self,
        kind: &'static str,
        name: &str,
        expected_revision: Option<i64>,
    ) -> Result<(), StoreError>;

    /// Changes on `kind` with revision `>= since`. The stream ends or yields
    /// an error when the underlying watch breaks; callers re-list and resume.
    async fn watch(&self, kind: &'static str, since: i64) -> Result<StoreEventStream, StoreError>;
}
