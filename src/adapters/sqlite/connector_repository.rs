//! SQLite implementation of the ConnectorStore, plus the provisioning
//! writes used when tenants register connectors and instances.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AggregatorInstance, Connector, ConnectorType, FieldMapping};
use crate::domain::ports::ConnectorStore;

use super::parse_datetime;

#[derive(Clone)]
pub struct SqliteConnectorStore {
    pool: SqlitePool,
}

impl SqliteConnectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert_connector(&self, connector: &Connector) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO connectors (id, tenant_id, name, connector_type, api_key_hash, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&connector.id)
        .bind(&connector.tenant_id)
        .bind(&connector.name)
        .bind(connector.connector_type.to_string())
        .bind(&connector.api_key_hash)
        .bind(connector.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_instance(&self, instance: &AggregatorInstance) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO aggregator_instances
                 (id, tenant_id, name, capabilities_json, credential_ref, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&instance.id)
        .bind(&instance.tenant_id)
        .bind(&instance.name)
        .bind(serde_json::to_string(&instance.capabilities)?)
        .bind(&instance.credential_ref)
        .bind(instance.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_mapping(&self, mapping: &FieldMapping) -> DomainResult<()> {
        sqlx::query(
            "INSERT INTO field_mappings (id, tenant_id, name, rules_json)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&mapping.id)
        .bind(&mapping.tenant_id)
        .bind(&mapping.name)
        .bind(serde_json::to_string(&mapping.rules)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ConnectorStore for SqliteConnectorStore {
    async fn aggregator_instance_get(
        &self,
        id: &str,
        tenant_id: &str,
    ) -> DomainResult<AggregatorInstance> {
        let row: Option<InstanceRow> = sqlx::query_as(
            "SELECT id, tenant_id, name, capabilities_json, credential_ref, created_at
             FROM aggregator_instances WHERE id = ? AND tenant_id = ?",
        )
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or_else(|| DomainError::InstanceNotFound(id.to_string()))?.try_into_instance()
    }

    async fn field_mapping_get(&self, id: &str, tenant_id: &str) -> DomainResult<FieldMapping> {
        let row: Option<(String, String, String, String)> = sqlx::query_as(
            "SELECT id, tenant_id, name, rules_json
             FROM field_mappings WHERE id = ? AND tenant_id = ?",
        )
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let (id, tenant_id, name, rules_json) =
            row.ok_or_else(|| DomainError::MappingNotFound(id.to_string()))?;
        Ok(FieldMapping { id, tenant_id, name, rules: serde_json::from_str(&rules_json)? })
    }

    async fn connectors_for_tenant(
        &self,
        tenant_id: &str,
        connector_type: ConnectorType,
    ) -> DomainResult<Vec<Connector>> {
        let rows: Vec<ConnectorRow> = sqlx::query_as(
            "SELECT id, tenant_id, name, connector_type, api_key_hash, created_at
             FROM connectors WHERE tenant_id = ? AND connector_type = ?",
        )
        .bind(tenant_id)
        .bind(connector_type.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ConnectorRow::try_into_connector).collect()
    }
}

#[derive(sqlx::FromRow)]
struct ConnectorRow {
    id: String,
    tenant_id: String,
    name: String,
    connector_type: String,
    api_key_hash: String,
    created_at: String,
}

impl ConnectorRow {
    fn try_into_connector(self) -> DomainResult<Connector> {
        Ok(Connector {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            connector_type: self
                .connector_type
                .parse()
                .map_err(DomainError::Serialization)?,
            api_key_hash: self.api_key_hash,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    tenant_id: String,
    name: String,
    capabilities_json: String,
    credential_ref: Option<String>,
    created_at: String,
}

impl InstanceRow {
    fn try_into_instance(self) -> DomainResult<AggregatorInstance> {
        Ok(AggregatorInstance {
            id: self.id,
            tenant_id: self.tenant_id,
            name: self.name,
            capabilities: serde_json::from_str(&self.capabilities_json)?,
            credential_ref: self.credential_ref,
            created_at: parse_datetime(&self.created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::create_migrated_test_pool;
    use crate::domain::models::{FieldMappingRule, FieldTransform};
    use chrono::Utc;

    async fn store() -> SqliteConnectorStore {
        SqliteConnectorStore::new(create_migrated_test_pool().await.unwrap())
    }

    #[tokio::test]
    async fn instance_lookup_is_tenant_scoped() {
        let store = store().await;
        store
            .insert_instance(&AggregatorInstance {
                id: "agg-1".to_string(),
                tenant_id: "t1".to_string(),
                name: "warehouse".to_string(),
                capabilities: vec!["read".to_string(), "write".to_string()],
                credential_ref: Some("cred-9".to_string()),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let instance = store.aggregator_instance_get("agg-1", "t1").await.unwrap();
        assert!(instance.can_write());
        assert_eq!(instance.credential_ref.as_deref(), Some("cred-9"));

        assert!(matches!(
            store.aggregator_instance_get("agg-1", "other").await,
            Err(DomainError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn connectors_filter_by_type() {
        let store = store().await;
        for (id, ty) in [("c1", ConnectorType::Mini), ("c2", ConnectorType::Cloud)] {
            store
                .insert_connector(&Connector {
                    id: id.to_string(),
                    tenant_id: "t1".to_string(),
                    name: id.to_string(),
                    connector_type: ty,
                    api_key_hash: "hash".to_string(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let minis = store.connectors_for_tenant("t1", ConnectorType::Mini).await.unwrap();
        assert_eq!(minis.len(), 1);
        assert_eq!(minis[0].id, "c1");
    }

    #[tokio::test]
    async fn field_mapping_rules_round_trip() {
        let store = store().await;
        store
            .insert_mapping(&FieldMapping {
                id: "map-1".to_string(),
                tenant_id: "t1".to_string(),
                name: "normalise".to_string(),
                rules: vec![FieldMappingRule {
                    source_field: "email".to_string(),
                    target_field: "email".to_string(),
                    transform: FieldTransform::Lowercase,
                    format: None,
                }],
            })
            .await
            .unwrap();

        let mapping = store.field_mapping_get("map-1", "t1").await.unwrap();
        assert_eq!(mapping.rules.len(), 1);
        assert_eq!(mapping.rules[0].transform, FieldTransform::Lowercase);
    }
}
