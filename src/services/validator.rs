//! Workflow definition validation, normalisation, and content hashing.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::instrument;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Activity, ActivityConfig, Step, WorkflowDefinition};
use crate::domain::ports::ConnectorStore;

/// Outcome of validating a definition. All failing rules contribute; the
/// validator never stops at the first error.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub activities_checked: usize,
    pub aggregators_verified: Vec<String>,
}

impl ValidationReport {
    fn error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    fn warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Joined error list for `DomainError::Validation`.
    pub fn error_summary(&self) -> String {
        self.errors.join("; ")
    }
}

/// Structural, semantic and capability checks over workflow definitions.
pub struct DagValidator {
    connectors: Arc<dyn ConnectorStore>,
}

impl DagValidator {
    pub fn new(connectors: Arc<dyn ConnectorStore>) -> Self {
        Self { connectors }
    }

    /// Apply every validation rule in order and collect the findings.
    #[instrument(skip(self, definition))]
    pub async fn validate(
        &self,
        tenant_id: &str,
        definition: &WorkflowDefinition,
    ) -> ValidationReport {
        let mut report = ValidationReport {
            activities_checked: definition.activities.len(),
            ..ValidationReport::default()
        };

        check_unique_ids(definition, &mut report);
        check_references(definition, &mut report);
        check_cycles(&definition.steps, &mut report);
        check_activity_configs(definition, &mut report);
        self.check_resources(tenant_id, definition, &mut report).await;
        check_schedule(definition, &mut report);

        report.valid = report.errors.is_empty();
        report
    }

    /// Rule 6: referenced aggregator instances must exist and belong to the
    /// tenant; a load against an instance without the `write` capability is
    /// a warning.
    async fn check_resources(
        &self,
        tenant_id: &str,
        definition: &WorkflowDefinition,
        report: &mut ValidationReport,
    ) {
        let mut seen: HashSet<&str> = HashSet::new();

        for activity in &definition.activities {
            let (instance_id, is_load) = match &activity.config {
                ActivityConfig::Extract(cfg) => (Some(cfg.aggregator_instance_id.as_str()), false),
                ActivityConfig::Load(cfg) => (cfg.aggregator_instance_id.as_deref(), true),
                _ => (None, false),
            };
            let Some(instance_id) = instance_id else { continue };

            match self.connectors.aggregator_instance_get(instance_id, tenant_id).await {
                Ok(instance) => {
                    if seen.insert(instance_id) {
                        report.aggregators_verified.push(instance_id.to_string());
                    }
                    if is_load && !instance.can_write() {
                        report.warning(format!(
                            "Activity \"{}\" loads into instance \"{}\" which does not declare the write capability",
                            activity.id, instance_id
                        ));
                    }
                }
                Err(_) => {
                    report.error(format!(
                        "Activity \"{}\" references unknown aggregator instance \"{}\"",
                        activity.id, instance_id
                    ));
                }
            }
        }
    }
}

/// Rule 1: ids unique within their sequence.
fn check_unique_ids(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    let mut activity_ids = HashSet::new();
    for activity in &definition.activities {
        if activity.id.is_empty() {
            report.error("Activity with empty id");
        } else if !activity_ids.insert(activity.id.as_str()) {
            report.error(format!("Duplicate activity id \"{}\"", activity.id));
        }
    }

    let mut step_ids = HashSet::new();
    for step in &definition.steps {
        if step.id.is_empty() {
            report.error("Step with empty id");
        } else if !step_ids.insert(step.id.as_str()) {
            report.error(format!("Duplicate step id \"{}\"", step.id));
        }
    }
}

/// Rules 2 and 3: step -> activity and dependsOn -> step references.
fn check_references(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    let activity_ids: HashSet<&str> =
        definition.activities.iter().map(|a| a.id.as_str()).collect();
    let step_ids: HashSet<&str> = definition.steps.iter().map(|s| s.id.as_str()).collect();

    let mut referenced: HashSet<&str> = HashSet::new();
    for step in &definition.steps {
        if activity_ids.contains(step.activity_id.as_str()) {
            referenced.insert(step.activity_id.as_str());
        } else {
            report.error(format!(
                "Step \"{}\" references unknown activity \"{}\"",
                step.id, step.activity_id
            ));
        }

        for dep in &step.depends_on {
            if dep == &step.id {
                report.error(format!("Step \"{}\" depends on itself", step.id));
            } else if !step_ids.contains(dep.as_str()) {
                report.error(format!(
                    "Step \"{}\" depends on unknown step \"{}\"",
                    step.id, dep
                ));
            }
        }
    }

    // Draft authoring is tolerant of unused activities.
    for activity in &definition.activities {
        if !referenced.contains(activity.id.as_str()) {
            report.warning(format!("Activity \"{}\" is not referenced by any step", activity.id));
        }
    }
}

/// Rule 4: DFS colouring over the dependency edges; the first back-edge
/// names the step where recursion closed.
fn check_cycles(steps: &[Step], report: &mut ValidationReport) {
    let by_id: HashMap<&str, &Step> = steps.iter().map(|s| (s.id.as_str(), s)).collect();
    let mut visited: HashSet<&str> = HashSet::new();
    let mut stack: HashSet<&str> = HashSet::new();

    fn dfs<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a Step>,
        visited: &mut HashSet<&'a str>,
        stack: &mut HashSet<&'a str>,
    ) -> Option<&'a str> {
        if stack.contains(id) {
            return Some(id);
        }
        if !visited.insert(id) {
            return None;
        }
        stack.insert(id);
        if let Some(step) = by_id.get(id) {
            for dep in &step.depends_on {
                if let Some(closed_at) = dfs(dep.as_str(), by_id, visited, stack) {
                    return Some(closed_at);
                }
            }
        }
        stack.remove(id);
        None
    }

    for step in steps {
        if let Some(closed_at) = dfs(step.id.as_str(), &by_id, &mut visited, &mut stack) {
            report.error(format!("Circular dependency detected involving step \"{closed_at}\""));
            return;
        }
    }
}

/// Rule 5: kind-specific semantic checks. Shape errors are caught at parse
/// time by the tagged config enum; these cover fields serde cannot see.
fn check_activity_configs(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    let activity_ids: HashSet<&str> =
        definition.activities.iter().map(|a| a.id.as_str()).collect();

    for activity in &definition.activities {
        match &activity.config {
            ActivityConfig::Extract(cfg) => {
                if cfg.table.is_empty() {
                    report.error(format!("Extract activity \"{}\" has an empty table", activity.id));
                }
            }
            ActivityConfig::Transform(cfg) => {
                if cfg.code.trim().is_empty() {
                    report.error(format!("Transform activity \"{}\" has no code", activity.id));
                }
            }
            ActivityConfig::Load(cfg) => {
                if cfg.aggregator_instance_id.is_none() && cfg.sdk_id.is_none() {
                    report.error(format!(
                        "Load activity \"{}\" needs aggregatorInstanceId or sdkId",
                        activity.id
                    ));
                }
                if cfg.batch_size == Some(0) {
                    report.error(format!("Load activity \"{}\" has batchSize 0", activity.id));
                }
            }
            ActivityConfig::Filter(cfg) => {
                if cfg.condition.trim().is_empty() {
                    report.error(format!("Filter activity \"{}\" has no condition", activity.id));
                }
                if let Some(input) = &cfg.input_activity_id {
                    if !activity_ids.contains(input.as_str()) {
                        report.error(format!(
                            "Filter activity \"{}\" references unknown activity \"{input}\"",
                            activity.id
                        ));
                    }
                }
            }
            ActivityConfig::Join(cfg) => {
                for side in [&cfg.left_activity_id, &cfg.right_activity_id] {
                    if !activity_ids.contains(side.as_str()) {
                        report.error(format!(
                            "Join activity \"{}\" references unknown activity \"{side}\"",
                            activity.id
                        ));
                    }
                }
                if cfg.join_key.trim().is_empty() {
                    report.error(format!("Join activity \"{}\" has an empty joinKey", activity.id));
                }
            }
            ActivityConfig::MiniConnectorSource(cfg) => {
                if cfg.connector_id.is_empty() {
                    report.error(format!(
                        "Mini-connector activity \"{}\" has an empty connectorId",
                        activity.id
                    ));
                }
                if cfg.table.is_empty() {
                    report.error(format!(
                        "Mini-connector activity \"{}\" has an empty table",
                        activity.id
                    ));
                }
            }
            ActivityConfig::CloudConnectorSource(cfg) => {
                if cfg.sdk_id.is_empty() {
                    report.error(format!(
                        "Cloud-connector activity \"{}\" has an empty sdkId",
                        activity.id
                    ));
                }
            }
            ActivityConfig::CloudConnectorSink(cfg) => {
                if cfg.sdk_id.is_empty() {
                    report.error(format!(
                        "Cloud-connector activity \"{}\" has an empty sdkId",
                        activity.id
                    ));
                }
            }
        }
    }
}

/// Rule 7: a present cron expression must have 5 or 6 fields.
fn check_schedule(definition: &WorkflowDefinition, report: &mut ValidationReport) {
    if let Some(schedule) = &definition.schedule {
        let fields = schedule.split_whitespace().count();
        if !(fields == 5 || fields == 6) {
            report.error(format!(
                "Schedule \"{schedule}\" must have 5 or 6 whitespace-separated fields, found {fields}"
            ));
        }
    }
}

/// Deterministic best-effort repair of authoring mistakes, applied on
/// create and on new versions before validation and hashing.
pub fn normalize(definition: &mut WorkflowDefinition) {
    if definition.steps.is_empty() {
        definition.steps = synthesize_steps(&definition.activities);
        return;
    }

    // Rewrite dependsOn entries that name an activity to the step that owns
    // that activity.
    let step_ids: HashSet<String> = definition.steps.iter().map(|s| s.id.clone()).collect();
    let owner_of_activity: HashMap<String, String> = definition
        .steps
        .iter()
        .map(|s| (s.activity_id.clone(), s.id.clone()))
        .collect();

    for step in &mut definition.steps {
        for dep in &mut step.depends_on {
            if !step_ids.contains(dep) {
                if let Some(owner) = owner_of_activity.get(dep) {
                    *dep = owner.clone();
                }
            }
        }
    }
}

/// One step per activity, `step-<activityId>` with a numeric suffix on
/// collision.
fn synthesize_steps(activities: &[Activity]) -> Vec<Step> {
    let mut used: HashSet<String> = HashSet::new();
    activities
        .iter()
        .map(|activity| {
            let base = format!("step-{}", activity.id);
            let mut id = base.clone();
            let mut n = 2;
            while !used.insert(id.clone()) {
                id = format!("{base}-{n}");
                n += 1;
            }
            Step { id, activity_id: activity.id.clone(), depends_on: vec![] }
        })
        .collect()
}

/// Serialise with keys in lexicographic order and no insignificant
/// whitespace. The hash is a function of the definition bytes alone.
pub fn canonical_json(definition: &WorkflowDefinition) -> DomainResult<String> {
    let value = serde_json::to_value(definition)?;
    Ok(serde_json::to_string(&sort_keys(value))?)
}

/// SHA-256 hex digest over the canonical form.
pub fn content_hash(definition: &WorkflowDefinition) -> DomainResult<String> {
    let canonical = canonical_json(definition)?;
    let digest = Sha256::digest(canonical.as_bytes());
    Ok(format!("{digest:x}"))
}

fn sort_keys(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<String, serde_json::Value> =
                map.into_iter().map(|(k, v)| (k, sort_keys(v))).collect();
            serde_json::Value::Object(sorted.into_iter().collect())
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sort_keys).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::{DomainError, DomainResult};
    use crate::domain::models::{
        AggregatorInstance, Connector, ConnectorType, ExtractConfig, FieldMapping, LoadConfig,
        LoadMode,
    };
    use async_trait::async_trait;

    struct FakeConnectorStore {
        instances: Vec<AggregatorInstance>,
    }

    #[async_trait]
    impl ConnectorStore for FakeConnectorStore {
        async fn aggregator_instance_get(
            &self,
            id: &str,
            tenant_id: &str,
        ) -> DomainResult<AggregatorInstance> {
            self.instances
                .iter()
                .find(|i| i.id == id && i.tenant_id == tenant_id)
                .cloned()
                .ok_or_else(|| DomainError::InstanceNotFound(id.to_string()))
        }

        async fn field_mapping_get(&self, id: &str, _tenant_id: &str) -> DomainResult<FieldMapping> {
            Err(DomainError::MappingNotFound(id.to_string()))
        }

        async fn connectors_for_tenant(
            &self,
            _tenant_id: &str,
            _connector_type: ConnectorType,
        ) -> DomainResult<Vec<Connector>> {
            Ok(vec![])
        }
    }

    fn validator_with(instances: Vec<AggregatorInstance>) -> DagValidator {
        DagValidator::new(std::sync::Arc::new(FakeConnectorStore { instances }))
    }

    fn instance(id: &str, tenant: &str, capabilities: &[&str]) -> AggregatorInstance {
        AggregatorInstance {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            name: id.to_string(),
            capabilities: capabilities.iter().map(|c| (*c).to_string()).collect(),
            credential_ref: None,
            created_at: chrono::Utc::now(),
        }
    }

    fn extract_activity(id: &str, instance_id: &str) -> Activity {
        Activity {
            id: id.to_string(),
            name: id.to_string(),
            retry_max: None,
            config: ActivityConfig::Extract(ExtractConfig {
                aggregator_instance_id: instance_id.to_string(),
                table: "users".to_string(),
                columns: vec!["id".to_string()],
                where_clause: None,
                limit: None,
                order_by: None,
            }),
        }
    }

    fn load_activity(id: &str, instance_id: &str) -> Activity {
        Activity {
            id: id.to_string(),
            name: id.to_string(),
            retry_max: None,
            config: ActivityConfig::Load(LoadConfig {
                aggregator_instance_id: Some(instance_id.to_string()),
                sdk_id: None,
                table: Some("users_norm".to_string()),
                mode: LoadMode::Insert,
                conflict_key: None,
                conflict_resolution: None,
                column_mappings: None,
                mapping_id: None,
                batch_size: None,
                source_metadata: None,
            }),
        }
    }

    fn step(id: &str, activity: &str, deps: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            activity_id: activity.to_string(),
            depends_on: deps.iter().map(|d| (*d).to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn valid_linear_definition_passes() {
        let validator = validator_with(vec![instance("agg", "t1", &["read", "write"])]);
        let def = WorkflowDefinition {
            activities: vec![extract_activity("e1", "agg"), load_activity("l1", "agg")],
            steps: vec![step("s1", "e1", &[]), step("s2", "l1", &["s1"])],
            schedule: None,
        };

        let report = validator.validate("t1", &def).await;
        assert!(report.valid, "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
        assert_eq!(report.activities_checked, 2);
        assert_eq!(report.aggregators_verified, vec!["agg".to_string()]);
    }

    #[tokio::test]
    async fn cycle_is_reported_with_closing_step() {
        let validator = validator_with(vec![instance("agg", "t1", &["read"])]);
        let def = WorkflowDefinition {
            activities: vec![extract_activity("e1", "agg"), extract_activity("e2", "agg")],
            steps: vec![step("s1", "e1", &["s2"]), step("s2", "e2", &["s1"])],
            schedule: None,
        };

        let report = validator.validate("t1", &def).await;
        assert!(!report.valid);
        assert!(
            report.errors.iter().any(|e| e
                == "Circular dependency detected involving step \"s1\""
                || e == "Circular dependency detected involving step \"s2\""),
            "errors: {:?}",
            report.errors
        );
    }

    #[tokio::test]
    async fn all_failing_rules_contribute_errors() {
        let validator = validator_with(vec![]);
        let def = WorkflowDefinition {
            activities: vec![extract_activity("e1", "missing"), extract_activity("e1", "missing")],
            steps: vec![step("s1", "ghost", &["nowhere"])],
            schedule: Some("* *".to_string()),
        };

        let report = validator.validate("t1", &def).await;
        assert!(!report.valid);
        // Duplicate id, unknown activity, unknown dependsOn, unknown
        // instance, bad schedule: nothing short-circuits.
        assert!(report.errors.len() >= 5, "errors: {:?}", report.errors);
    }

    #[tokio::test]
    async fn unreferenced_activity_is_a_warning_not_an_error() {
        let validator = validator_with(vec![instance("agg", "t1", &["read"])]);
        let def = WorkflowDefinition {
            activities: vec![extract_activity("e1", "agg"), extract_activity("e2", "agg")],
            steps: vec![step("s1", "e1", &[])],
            schedule: None,
        };

        let report = validator.validate("t1", &def).await;
        assert!(report.valid);
        assert!(report.warnings.iter().any(|w| w.contains("\"e2\"")));
    }

    #[tokio::test]
    async fn load_without_write_capability_warns() {
        let validator = validator_with(vec![instance("agg", "t1", &["read"])]);
        let def = WorkflowDefinition {
            activities: vec![load_activity("l1", "agg")],
            steps: vec![step("s1", "l1", &[])],
            schedule: None,
        };

        let report = validator.validate("t1", &def).await;
        assert!(report.valid);
        assert!(report.warnings.iter().any(|w| w.contains("write capability")));
    }

    #[tokio::test]
    async fn cross_tenant_instance_is_an_error() {
        let validator = validator_with(vec![instance("agg", "other-tenant", &["read"])]);
        let def = WorkflowDefinition {
            activities: vec![extract_activity("e1", "agg")],
            steps: vec![step("s1", "e1", &[])],
            schedule: None,
        };

        let report = validator.validate("t1", &def).await;
        assert!(!report.valid);
    }

    #[tokio::test]
    async fn six_field_cron_is_accepted() {
        let validator = validator_with(vec![instance("agg", "t1", &["read"])]);
        let def = WorkflowDefinition {
            activities: vec![extract_activity("e1", "agg")],
            steps: vec![step("s1", "e1", &[])],
            schedule: Some("0 0 * * * *".to_string()),
        };

        let report = validator.validate("t1", &def).await;
        assert!(report.valid, "errors: {:?}", report.errors);
    }

    #[test]
    fn normalize_synthesises_steps_for_empty_dag() {
        let mut def = WorkflowDefinition {
            activities: vec![extract_activity("e1", "agg"), extract_activity("e2", "agg")],
            steps: vec![],
            schedule: None,
        };
        normalize(&mut def);

        assert_eq!(def.steps.len(), 2);
        assert_eq!(def.steps[0].id, "step-e1");
        assert_eq!(def.steps[1].id, "step-e2");
        assert!(def.steps.iter().all(|s| s.depends_on.is_empty()));
    }

    #[test]
    fn normalize_rewrites_activity_ids_in_depends_on() {
        let mut def = WorkflowDefinition {
            activities: vec![extract_activity("e1", "agg"), extract_activity("e2", "agg")],
            steps: vec![step("s1", "e1", &[]), step("s2", "e2", &["e1"])],
            schedule: None,
        };
        normalize(&mut def);

        assert_eq!(def.steps[1].depends_on, vec!["s1".to_string()]);
    }

    #[test]
    fn content_hash_is_deterministic() {
        let def = WorkflowDefinition {
            activities: vec![extract_activity("e1", "agg")],
            steps: vec![step("s1", "e1", &[])],
            schedule: None,
        };

        let h1 = content_hash(&def).unwrap();
        let h2 = content_hash(&def).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn canonical_json_sorts_keys_and_strips_whitespace() {
        let def = WorkflowDefinition {
            activities: vec![extract_activity("e1", "agg")],
            steps: vec![step("s1", "e1", &[])],
            schedule: None,
        };

        let canonical = canonical_json(&def).unwrap();
        assert!(!canonical.contains(' '));
        let activities_pos = canonical.find("\"activities\"").unwrap();
        let steps_pos = canonical.find("\"steps\"").unwrap();
        assert!(activities_pos < steps_pos);
    }

    #[test]
    fn hash_changes_when_definition_changes() {
        let def_a = WorkflowDefinition {
            activities: vec![extract_activity("e1", "agg")],
            steps: vec![step("s1", "e1", &[])],
            schedule: None,
        };
        let mut def_b = def_a.clone();
        def_b.steps.push(step("s2", "e1", &["s1"]));

        assert_ne!(content_hash(&def_a).unwrap(), content_hash(&def_b).unwrap());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        fn acyclic_steps(n: usize) -> Vec<Step> {
            // Edges only point to earlier steps, so the graph is a DAG by
            // construction.
            (0..n)
                .map(|i| Step {
                    id: format!("s{i}"),
                    activity_id: format!("a{i}"),
                    depends_on: (0..i).map(|j| format!("s{j}")).collect(),
                })
                .collect()
        }

        proptest! {
            #[test]
            fn dense_dags_are_never_reported_cyclic(n in 1usize..12) {
                let mut report = ValidationReport::default();
                check_cycles(&acyclic_steps(n), &mut report);
                prop_assert!(report.errors.is_empty());
            }

            #[test]
            fn any_back_edge_is_reported(n in 2usize..12, from in 0usize..12, to in 0usize..12) {
                let from = from % n;
                let to = to % n;
                prop_assume!(from < to);

                let mut steps = acyclic_steps(n);
                // Close a cycle: an earlier step now depends on a later one.
                steps[from].depends_on.push(format!("s{to}"));

                let mut report = ValidationReport::default();
                check_cycles(&steps, &mut report);
                prop_assert_eq!(report.errors.len(), 1);
                prop_assert!(report.errors[0].starts_with("Circular dependency detected"));
            }
        }
    }
}
