//! Built-in activity handlers.
//!
//! One handler per activity kind. Handlers never panic: every failure is a
//! `HandlerError` whose `retryable` flag drives the orchestrator. Outputs
//! are stored verbatim; source kinds wrap rows in an envelope carrying
//! `_sourceMetadata` for downstream loads.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::domain::errors::{codes, HandlerError};
use crate::domain::models::{
    CloudConnectorSinkConfig, CloudConnectorSourceConfig, EngineConfig, ExtractConfig,
    FieldMapping, FilterConfig, JoinConfig, JoinType, LoadConfig, MiniConnectorSourceConfig,
    SourceMetadata, TransformConfig,
};
use crate::domain::ports::{
    ConnectorDriver, ConnectorStore, DriverError, DriverTarget, ExpressionSandbox, LoadOutcome,
    LoadRequest, QueryRequest,
};
use crate::services::gateway::{AgentGateway, CommandContext};

pub type HandlerResult = Result<Value, HandlerError>;

/// Key under which source envelopes carry their table metadata.
pub const SOURCE_METADATA_KEY: &str = "_sourceMetadata";

/// Per-kind timeouts, converted from the engine configuration.
#[derive(Debug, Clone)]
pub struct HandlerTimeouts {
    pub activity: Duration,
    pub load: Duration,
    pub sandbox: Duration,
}

impl From<&EngineConfig> for HandlerTimeouts {
    fn from(config: &EngineConfig) -> Self {
        Self {
            activity: Duration::from_secs(config.activity_timeout_secs),
            load: Duration::from_secs(config.load_timeout_secs),
            sandbox: Duration::from_secs(config.sandbox_timeout_secs),
        }
    }
}

pub struct ActivityHandlers {
    connectors: Arc<dyn ConnectorStore>,
    driver: Arc<dyn ConnectorDriver>,
    sandbox: Arc<dyn ExpressionSandbox>,
    gateway: Arc<AgentGateway>,
    timeouts: HandlerTimeouts,
}

impl ActivityHandlers {
    pub fn new(
        connectors: Arc<dyn ConnectorStore>,
        driver: Arc<dyn ConnectorDriver>,
        sandbox: Arc<dyn ExpressionSandbox>,
        gateway: Arc<AgentGateway>,
        timeouts: HandlerTimeouts,
    ) -> Self {
        Self { connectors, driver, sandbox, gateway, timeouts }
    }

    // ========================================================================
    // extract
    // ========================================================================

    #[instrument(skip(self, cfg), fields(table = %cfg.table))]
    pub async fn extract(&self, tenant_id: &str, cfg: &ExtractConfig) -> HandlerResult {
        let instance = self
            .connectors
            .aggregator_instance_get(&cfg.aggregator_instance_id, tenant_id)
            .await
            .map_err(|e| HandlerError::permanent(codes::EXTRACT_ERROR, e.to_string()))?;

        let request = QueryRequest {
            target: DriverTarget::Instance(instance),
            table: cfg.table.clone(),
            columns: cfg.columns.clone(),
            where_clause: cfg.where_clause.clone(),
            limit: cfg.limit,
            order_by: cfg.order_by.clone(),
        };

        let result = tokio::time::timeout(self.timeouts.activity, self.driver.query(request))
            .await
            .map_err(|_| query_timeout(self.timeouts.activity))?
            .map_err(|e| driver_error(codes::EXTRACT_ERROR, &e))?;

        Ok(source_envelope(
            result.rows,
            result.columns.clone(),
            Some(SourceMetadata { table_name: cfg.table.clone(), columns: result.columns }),
        ))
    }

    // ========================================================================
    // transform
    // ========================================================================

    /// Evaluate user code over the first dependency's rows. Any sandbox
    /// error is permanent: re-running the same code on the same input
    /// cannot succeed.
    pub async fn transform(&self, cfg: &TransformConfig, input: Option<&Value>) -> HandlerResult {
        let rows = input.map(unwrap_rows).unwrap_or_default();

        self.sandbox
            .evaluate(&cfg.code, json!({ "data": rows }), self.timeouts.sandbox)
            .await
            .map_err(|e| HandlerError::permanent(codes::TRANSFORM_ERROR, e.to_string()))
    }

    // ========================================================================
    // filter
    // ========================================================================

    /// The condition either returns the filtered array itself, or acts as a
    /// row-wise boolean predicate. Both are supported: a non-array result
    /// falls back to per-row evaluation with a `row` binding.
    pub async fn filter(&self, cfg: &FilterConfig, input: &Value) -> HandlerResult {
        let rows = unwrap_rows(input);
        let input_count = rows.len();

        let whole = self
            .sandbox
            .evaluate(&cfg.condition, json!({ "data": rows }), self.timeouts.sandbox)
            .await
            .map_err(|e| HandlerError::permanent(codes::FILTER_ERROR, e.to_string()))?;

        let filtered = match whole {
            Value::Array(filtered) => filtered,
            _ => {
                let mut kept = Vec::new();
                for row in rows {
                    let verdict = self
                        .sandbox
                        .evaluate(
                            &cfg.condition,
                            json!({ "row": row.clone() }),
                            self.timeouts.sandbox,
                        )
                        .await
                        .map_err(|e| {
                            HandlerError::permanent(codes::FILTER_ERROR, e.to_string())
                        })?;
                    if verdict == Value::Bool(true) {
                        kept.push(row);
                    }
                }
                kept
            }
        };

        let kept = filtered.len();
        Ok(json!({
            "data": filtered,
            "rowCount": kept,
            "rowsFiltered": input_count.saturating_sub(kept),
        }))
    }

    // ========================================================================
    // join
    // ========================================================================

    /// Hash join: multi-map on the right side, then a pass over the left.
    /// Output rows are `{..left, ..right}`; unmatched rows on the outer
    /// sides carry only their own columns.
    pub fn join(&self, cfg: &JoinConfig, left: &Value, right: &Value) -> HandlerResult {
        let left_rows = unwrap_rows(left);
        let right_rows = unwrap_rows(right);
        let right_key = cfg.right_key.as_deref().unwrap_or(&cfg.join_key);

        let mut right_index: std::collections::HashMap<String, Vec<usize>> =
            std::collections::HashMap::new();
        for (i, row) in right_rows.iter().enumerate() {
            if let Some(key) = composite_key(row, right_key) {
                right_index.entry(key).or_default().push(i);
            }
        }

        let mut out = Vec::new();
        let mut right_matched = vec![false; right_rows.len()];

        for left_row in &left_rows {
            let matches = composite_key(left_row, &cfg.join_key)
                .and_then(|key| right_index.get(&key))
                .map(Vec::as_slice)
                .unwrap_or(&[]);

            if matches.is_empty() {
                if matches!(cfg.join_type, JoinType::Left | JoinType::Full) {
                    out.push(left_row.clone());
                }
                continue;
            }

            for &i in matches {
                right_matched[i] = true;
                out.push(merge_rows(left_row, &right_rows[i]));
            }
        }

        if matches!(cfg.join_type, JoinType::Right | JoinType::Full) {
            for (i, row) in right_rows.iter().enumerate() {
                if !right_matched[i] {
                    out.push(row.clone());
                }
            }
        }

        // An inner/right join keeps only matched left rows; for a pure
        // right join the pass above already emitted the matched pairs.
        let count = out.len();
        Ok(json!({ "data": out, "rowCount": count }))
    }

    // ========================================================================
    // load
    // ========================================================================

    /// Mapping rules -> column renames -> batched writes through the
    /// driver. Any failed row makes the whole activity fail with a
    /// non-retryable partial-failure error.
    #[instrument(skip(self, cfg, input))]
    pub async fn load(
        &self,
        tenant_id: &str,
        cfg: &LoadConfig,
        input: Option<&Value>,
        table: Option<&str>,
        partial_failure_code: &str,
    ) -> HandlerResult {
        let rows = input.map(unwrap_rows).unwrap_or_default();
        let rows_processed = rows.len();

        let Some(table) = table else {
            return Err(HandlerError::permanent(codes::LOAD_ERROR, "table required"));
        };

        let target = match (&cfg.aggregator_instance_id, &cfg.sdk_id) {
            (Some(instance_id), _) => {
                let instance = self
                    .connectors
                    .aggregator_instance_get(instance_id, tenant_id)
                    .await
                    .map_err(|e| HandlerError::permanent(codes::LOAD_ERROR, e.to_string()))?;
                DriverTarget::Instance(instance)
            }
            (None, Some(sdk_id)) => DriverTarget::Sdk { sdk_id: sdk_id.clone() },
            (None, None) => {
                return Err(HandlerError::permanent(
                    codes::LOAD_ERROR,
                    "load requires aggregatorInstanceId or sdkId",
                ));
            }
        };

        let mapping = match &cfg.mapping_id {
            Some(mapping_id) => Some(
                self.connectors
                    .field_mapping_get(mapping_id, tenant_id)
                    .await
                    .map_err(|e| HandlerError::permanent(codes::LOAD_ERROR, e.to_string()))?,
            ),
            None => None,
        };

        let mut warnings: Vec<String> = Vec::new();
        let mut rows_failed: u64 = 0;
        let mut prepared = Vec::with_capacity(rows.len());

        for (i, row) in rows.into_iter().enumerate() {
            let mapped = match &mapping {
                Some(mapping) => match apply_mapping_rules(&row, mapping) {
                    Ok(mapped) => mapped,
                    Err(msg) => {
                        rows_failed += 1;
                        warnings.push(format!("row {i}: {msg}"));
                        continue;
                    }
                },
                None => row,
            };
            prepared.push(apply_column_mappings(mapped, cfg.column_mappings.as_ref()));
        }

        let mut rows_loaded: u64 = 0;
        for batch in prepared.chunks(cfg.batch_size().max(1)) {
            let request = LoadRequest {
                target: target.clone(),
                table: table.to_string(),
                mode: cfg.mode,
                conflict_key: cfg.conflict_key.clone(),
                conflict_resolution: cfg.conflict_resolution,
                rows: batch.to_vec(),
            };

            let outcome: LoadOutcome =
                tokio::time::timeout(self.timeouts.load, self.driver.load(request))
                    .await
                    .map_err(|_| query_timeout(self.timeouts.load))?
                    .map_err(|e| driver_error(codes::LOAD_ERROR, &e))?;

            rows_loaded += outcome.loaded;
            rows_failed += outcome.failed;
            warnings.extend(outcome.warnings);
        }

        if rows_failed > 0 {
            let err = HandlerError::permanent(
                partial_failure_code,
                format!("{rows_failed} of {rows_processed} rows failed to load"),
            )
            .with_details(json!({
                "rowsProcessed": rows_processed,
                "rowsLoaded": rows_loaded,
                "rowsFailed": rows_failed,
                "warnings": warnings,
            }));
            return Err(err);
        }

        debug!(rows_processed, rows_loaded, "load completed");
        Ok(json!({
            "rowsProcessed": rows_processed,
            "rowsLoaded": rows_loaded,
            "rowsFailed": 0,
            "warnings": warnings,
        }))
    }

    // ========================================================================
    // mini-connector-source
    // ========================================================================

    /// Run a query on a remote mini connector over the agent channel and
    /// wait for the correlated response.
    #[instrument(skip(self, cfg), fields(connector_id = %cfg.connector_id))]
    pub async fn mini_connector_source(
        &self,
        tenant_id: &str,
        execution_id: Uuid,
        activity_id: &str,
        cfg: &MiniConnectorSourceConfig,
    ) -> HandlerResult {
        let payload = json!({
            "database": cfg.database,
            "table": cfg.table,
            "columns": cfg.columns,
            "where": cfg.where_clause,
            "limit": cfg.limit,
        });

        let response = self
            .gateway
            .dispatch_and_wait(
                tenant_id,
                "query",
                payload,
                Some(&cfg.connector_id),
                CommandContext {
                    execution_id: Some(execution_id.to_string()),
                    activity_id: Some(activity_id.to_string()),
                },
                Some(self.timeouts.activity),
            )
            .await
            .map_err(|e| match e {
                crate::domain::errors::GatewayError::CommandTimeout => {
                    HandlerError::retryable(codes::TIMEOUT, "Command timed out")
                }
                other => HandlerError::permanent(codes::EXTRACT_ERROR, other.to_string()),
            })?;

        if let Some(message) = agent_error_message(&response) {
            return Err(HandlerError::permanent(codes::EXTRACT_ERROR, message));
        }

        let rows = match response.get("data") {
            Some(Value::Array(rows)) => rows.clone(),
            Some(other) => unwrap_rows(other),
            None => unwrap_rows(&response),
        };
        let columns = response
            .get("columns")
            .and_then(Value::as_array)
            .map(|cols| {
                cols.iter().filter_map(Value::as_str).map(str::to_string).collect::<Vec<_>>()
            })
            .unwrap_or_else(|| cfg.columns.clone());

        Ok(source_envelope(
            rows,
            columns.clone(),
            Some(SourceMetadata { table_name: cfg.table.clone(), columns }),
        ))
    }

    // ========================================================================
    // cloud-connector-source / cloud-connector-sink
    // ========================================================================

    pub async fn cloud_connector_source(
        &self,
        cfg: &CloudConnectorSourceConfig,
    ) -> HandlerResult {
        let table = cfg.table.clone().unwrap_or_default();
        let request = QueryRequest {
            target: DriverTarget::Sdk { sdk_id: cfg.sdk_id.clone() },
            table: table.clone(),
            columns: cfg.columns.clone(),
            where_clause: cfg.where_clause.clone(),
            limit: cfg.limit,
            order_by: None,
        };

        let result = tokio::time::timeout(self.timeouts.activity, self.driver.query(request))
            .await
            .map_err(|_| query_timeout(self.timeouts.activity))?
            .map_err(|e| driver_error(codes::SDK_EXTRACT_ERROR, &e))?;

        let metadata = (!table.is_empty())
            .then(|| SourceMetadata { table_name: table, columns: result.columns.clone() });
        Ok(source_envelope(result.rows, result.columns, metadata))
    }

    pub async fn cloud_connector_sink(
        &self,
        tenant_id: &str,
        cfg: &CloudConnectorSinkConfig,
        input: Option<&Value>,
        table: Option<&str>,
    ) -> HandlerResult {
        let load_cfg = LoadConfig {
            aggregator_instance_id: None,
            sdk_id: Some(cfg.sdk_id.clone()),
            table: cfg.table.clone(),
            mode: cfg.mode,
            conflict_key: None,
            conflict_resolution: None,
            column_mappings: None,
            mapping_id: None,
            batch_size: cfg.batch_size,
            source_metadata: None,
        };
        self.load(tenant_id, &load_cfg, input, table, codes::SDK_LOAD_PARTIAL_FAILURE).await
    }
}

// ============================================================================
// Envelope and row helpers
// ============================================================================

/// Rows from a handler output: a bare array, a `{data: [...]}` envelope, or
/// anything else wrapped as a single-element array.
pub fn unwrap_rows(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(rows) => rows.clone(),
        Value::Object(map) => match map.get("data") {
            Some(Value::Array(rows)) => rows.clone(),
            _ => vec![value.clone()],
        },
        other => vec![other.clone()],
    }
}

/// Standard envelope produced by source kinds.
pub fn source_envelope(
    rows: Vec<Value>,
    columns: Vec<String>,
    metadata: Option<SourceMetadata>,
) -> Value {
    let count = rows.len();
    let mut envelope = json!({
        "data": rows,
        "rowCount": count,
        "columns": columns,
    });
    if let Some(metadata) = metadata {
        envelope[SOURCE_METADATA_KEY] = serde_json::to_value(metadata).unwrap_or(Value::Null);
    }
    envelope
}

/// Read the source metadata out of an upstream envelope, if present.
pub fn envelope_source_metadata(value: &Value) -> Option<SourceMetadata> {
    serde_json::from_value(value.get(SOURCE_METADATA_KEY)?.clone()).ok()
}

/// Composite key for a row: the key spec names one column or several
/// comma-separated columns; values are coerced to strings and joined with
/// `|`. `None` when any named column is missing.
fn composite_key(row: &Value, key_spec: &str) -> Option<String> {
    let mut parts = Vec::new();
    for column in key_spec.split(',').map(str::trim) {
        let value = row.get(column)?;
        if value.is_null() {
            return None;
        }
        parts.push(coerce_to_string(value));
    }
    Some(parts.join("|"))
}

fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `{..left, ..right}`; right-side columns win on collision.
fn merge_rows(left: &Value, right: &Value) -> Value {
    let mut merged = match left {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    if let Value::Object(map) = right {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}

/// Apply stored mapping rules to one row. Unmapped fields pass through;
/// a source field consumed by a rename is dropped.
fn apply_mapping_rules(row: &Value, mapping: &FieldMapping) -> Result<Value, String> {
    let Value::Object(source) = row else {
        return Err("row is not an object".to_string());
    };

    let mut out = source.clone();
    for rule in &mapping.rules {
        let Some(value) = source.get(&rule.source_field) else { continue };
        let transformed = rule
            .transform
            .apply(value, rule.format.as_deref())
            .map_err(|e| format!("field \"{}\": {e}", rule.source_field))?;
        if rule.target_field != rule.source_field {
            out.remove(&rule.source_field);
        }
        out.insert(rule.target_field.clone(), transformed);
    }
    Ok(Value::Object(out))
}

/// Source -> destination column renames from the activity config.
fn apply_column_mappings(
    row: Value,
    mappings: Option<&std::collections::HashMap<String, String>>,
) -> Value {
    let Some(mappings) = mappings else { return row };
    let Value::Object(mut map) = row else { return row };

    for (source, destination) in mappings {
        if let Some(value) = map.remove(source) {
            map.insert(destination.clone(), value);
        }
    }
    Value::Object(map)
}

fn agent_error_message(response: &Value) -> Option<String> {
    let top = response.get("error");
    let nested = response.get("data").and_then(|d| d.get("error"));
    top.or(nested).map(|e| match e {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn driver_error(fallback_code: &str, err: &DriverError) -> HandlerError {
    if codes::is_transient(&err.class) {
        HandlerError::retryable(err.class.clone(), err.message.clone())
    } else {
        HandlerError::permanent(fallback_code, err.message.clone())
    }
}

fn query_timeout(timeout: Duration) -> HandlerError {
    HandlerError::retryable(codes::TIMEOUT, format!("timed out after {}s", timeout.as_secs()))
}
