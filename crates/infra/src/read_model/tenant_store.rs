//! Tenant-scoped key/value storage for read models.
//!
//! Read models are disposable: every row can be rebuilt from the event
//! store, so the contract is a plain keyed upsert with a per-tenant wipe for
//! rebuilds. Implementations must never let one tenant's rows leak into
//! another tenant's reads.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, RwLock};

use fakturo_core::TenantId;

pub trait TenantStore<K, V>: Send + Sync {
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V>;
    fn upsert(&self, tenant_id: TenantId, key: K, value: V);
    fn list(&self, tenant_id: TenantId) -> Vec<V>;
    /// Drop every row the tenant owns. Used before a projection rebuild.
    fn clear_tenant(&self, tenant_id: TenantId);
}

impl<K, V, S> TenantStore<K, V> for Arc<S>
where
    S: TenantStore<K, V> + ?Sized,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V> {
        (**self).get(tenant_id, key)
    }

    fn upsert(&self, tenant_id: TenantId, key: K, value: V) {
        (**self).upsert(tenant_id, key, value)
    }

    fn list(&self, tenant_id: TenantId) -> Vec<V> {
        (**self).list(tenant_id)
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        (**self).clear_tenant(tenant_id)
    }
}

/// In-memory [`TenantStore`] for tests and single-process runs.
#[derive(Debug)]
pub struct InMemoryTenantStore<K, V> {
    rows: RwLock<HashMap<(TenantId, K), V>>,
}

impl<K, V> InMemoryTenantStore<K, V> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Default for InMemoryTenantStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> TenantStore<K, V> for InMemoryTenantStore<K, V>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get(&self, tenant_id: TenantId, key: &K) -> Option<V> {
        let rows = self.rows.read().ok()?;
        rows.get(&(tenant_id, key.clone())).cloned()
    }

    fn upsert(&self, tenant_id: TenantId, key: K, value: V) {
        if let Ok(mut rows) = self.rows.write() {
            rows.insert((tenant_id, key), value);
        }
    }

    fn list(&self, tenant_id: TenantId) -> Vec<V> {
        let rows = match self.rows.read() {
            Ok(rows) => rows,
            Err(_) => return vec![],
        };
        rows.iter()
            .filter_map(|((t, _), v)| (*t == tenant_id).then(|| v.clone()))
            .collect()
    }

    fn clear_tenant(&self, tenant_id: TenantId) {
        if let Ok(mut rows) = self.rows.write() {
            rows.retain(|(t, _), _| *t != tenant_id);
        }
    }
}
