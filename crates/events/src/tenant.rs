use fakturo_core::TenantId;

use crate::EventEnvelope;

/// Helper trait for tenant-scoped messages.
///
/// Marks types carrying an owning tenant, so infrastructure components can
/// pin themselves to one tenant or filter messages in subscription loops.
/// `EventEnvelope` implements it; other message types opt in as needed.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl<E> TenantScoped for EventEnvelope<E> {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id()
    }
}
