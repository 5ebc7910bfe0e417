//! Request and certificate stores.
//!
//! The protocol core talks to storage through these traits so a durable
//! backend can be plugged in; the in-memory implementations here are the
//! default and the test substrate. Operations are linearizable per
//! request id.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use namecert_core::{Certificate, Name, RequestId, RequestState};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("request id already exists")]
    Duplicate,

    #[error("no such request")]
    NotFound,

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// One record per live request, keyed by request id.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Insert a fresh record; a colliding id is rejected.
    async fn create(&self, state: RequestState) -> Result<(), StoreError>;

    async fn get(&self, id: &RequestId) -> Result<Option<RequestState>, StoreError>;

    /// Replace an existing record. Idempotent on identical state.
    async fn update(&self, state: RequestState) -> Result<(), StoreError>;

    async fn delete(&self, id: &RequestId) -> Result<(), StoreError>;

    /// Ids whose challenge lifetime elapsed, or whose terminal grace
    /// window has passed.
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<RequestId>, StoreError>;
}

/// Issued certificates, keyed by certificate name.
#[async_trait]
pub trait CertStore: Send + Sync {
    async fn insert(&self, cert: Certificate) -> Result<(), StoreError>;

    async fn get(&self, name: &Name) -> Result<Option<Certificate>, StoreError>;

    async fn mark_revoked(&self, name: &Name) -> Result<(), StoreError>;

    async fn is_revoked(&self, name: &Name) -> Result<bool, StoreError>;
}

/// Default in-memory request store. A single mutex over the map gives
/// per-id linearizability.
pub struct MemoryRequestStore {
    records: Mutex<HashMap<RequestId, RequestState>>,
    terminal_grace: Duration,
}

impl MemoryRequestStore {
    pub fn new(terminal_grace: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            terminal_grace,
        }
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl RequestStore for MemoryRequestStore {
    async fn create(&self, state: RequestState) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&state.request_id) {
            return Err(StoreError::Duplicate);
        }
        records.insert(state.request_id, state);
        Ok(())
    }

    async fn get(&self, id: &RequestId) -> Result<Option<RequestState>, StoreError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn update(&self, state: RequestState) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;
        if !records.contains_key(&state.request_id) {
            return Err(StoreError::NotFound);
        }
        records.insert(state.request_id, state);
        Ok(())
    }

    async fn delete(&self, id: &RequestId) -> Result<(), StoreError> {
        self.records.lock().await.remove(id);
        Ok(())
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<RequestId>, StoreError> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|state| state.is_reapable(now, self.terminal_grace))
            .map(|state| state.request_id)
            .collect())
    }
}

/// Default in-memory certificate store.
#[derive(Default)]
pub struct MemoryCertStore {
    certs: Mutex<HashMap<Name, Certificate>>,
    revoked: Mutex<HashSet<Name>>,
}

impl MemoryCertStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CertStore for MemoryCertStore {
    async fn insert(&self, cert: Certificate) -> Result<(), StoreError> {
        self.certs.lock().await.insert(cert.name().clone(), cert);
        Ok(())
    }

    async fn get(&self, name: &Name) -> Result<Option<Certificate>, StoreError> {
        Ok(self.certs.lock().await.get(name).cloned())
    }

    async fn mark_revoked(&self, name: &Name) -> Result<(), StoreError> {
        self.revoked.lock().await.insert(name.clone());
        Ok(())
    }

    async fn is_revoked(&self, name: &Name) -> Result<bool, StoreError> {
        Ok(self.revoked.lock().await.contains(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use namecert_core::cert;
    use namecert_core::crypto::SessionKey;
    use namecert_core::packet::ValidityPeriod;
    use namecert_core::{KeyPair, RequestType, Status};

    fn state(id: u8, created_at: DateTime<Utc>) -> RequestState {
        let key = KeyPair::generate();
        let cert = cert::self_signed(
            &key,
            &Name::parse("/edu/site/alice").unwrap(),
            ValidityPeriod::new(created_at, created_at + Duration::days(30)),
        );
        RequestState::new(
            RequestId::from_bytes([id; 8]),
            Name::parse("/edu/site").unwrap(),
            RequestType::New,
            cert,
            SessionKey::from_bytes([0; 16]),
            created_at,
        )
    }

    fn t0() -> DateTime<Utc> {
        "2026-01-01T00:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn create_rejects_duplicate_id() {
        let store = MemoryRequestStore::new(Duration::seconds(60));
        store.create(state(1, t0())).await.unwrap();
        assert_eq!(store.create(state(1, t0())).await, Err(StoreError::Duplicate));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn update_requires_existing_record() {
        let store = MemoryRequestStore::new(Duration::seconds(60));
        assert_eq!(store.update(state(1, t0())).await, Err(StoreError::NotFound));

        store.create(state(1, t0())).await.unwrap();
        let mut updated = store
            .get(&RequestId::from_bytes([1; 8]))
            .await
            .unwrap()
            .unwrap();
        updated.status = Status::Failure;
        updated.mark_terminal(t0());
        store.update(updated).await.unwrap();

        let reread = store
            .get(&RequestId::from_bytes([1; 8]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reread.status, Status::Failure);
    }

    #[tokio::test]
    async fn list_expired_honors_terminal_grace() {
        let store = MemoryRequestStore::new(Duration::seconds(60));
        let mut terminal = state(1, t0());
        terminal.status = Status::Failure;
        terminal.mark_terminal(t0());
        store.create(terminal).await.unwrap();
        store.create(state(2, t0())).await.unwrap();

        // Within grace: nothing to reap.
        let expired = store.list_expired(t0() + Duration::seconds(30)).await.unwrap();
        assert!(expired.is_empty());

        // Past grace: only the terminal record.
        let expired = store.list_expired(t0() + Duration::seconds(61)).await.unwrap();
        assert_eq!(expired, vec![RequestId::from_bytes([1; 8])]);
    }

    #[tokio::test]
    async fn cert_store_roundtrip_and_revocation() {
        let store = MemoryCertStore::new();
        let key = KeyPair::generate();
        let cert = cert::self_signed(
            &key,
            &Name::parse("/edu/site/alice").unwrap(),
            ValidityPeriod::new(t0(), t0() + Duration::days(30)),
        );
        let name = cert.name().clone();

        store.insert(cert.clone()).await.unwrap();
        assert_eq!(store.get(&name).await.unwrap(), Some(cert));
        assert!(!store.is_revoked(&name).await.unwrap());

        store.mark_revoked(&name).await.unwrap();
        assert!(store.is_revoked(&name).await.unwrap());
    }
}
