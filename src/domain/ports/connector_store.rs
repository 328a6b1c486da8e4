//! Connector and aggregator-instance lookup port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{AggregatorInstance, Connector, ConnectorType, FieldMapping};

/// Tenant-scoped reads over connectors, aggregator instances and stored
/// field mappings. All misses are `NotFound`; cross-tenant reads behave as
/// misses.
#[async_trait]
pub trait ConnectorStore: Send + Sync {
    async fn aggregator_instance_get(
        &self,
        id: &str,
        tenant_id: &str,
    ) -> DomainResult<AggregatorInstance>;

    async fn field_mapping_get(&self, id: &str, tenant_id: &str) -> DomainResult<FieldMapping>;

    /// Candidate connectors for an authentication handshake.
    async fn connectors_for_tenant(
        &self,
        tenant_id: &str,
        connector_type: ConnectorType,
    ) -> DomainResult<Vec<Connector>>;
}
