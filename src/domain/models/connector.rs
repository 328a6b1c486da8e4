//! Connectors, aggregator instances, and stored field-mapping rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of connector a tenant has registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectorType {
    /// On-premise mini connector reached over the agent channel.
    Mini,
    /// Cloud connector driven by a generated SDK.
    Cloud,
}

impl std::fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Mini => "MINI",
            Self::Cloud => "CLOUD",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ConnectorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MINI" => Ok(Self::Mini),
            "CLOUD" => Ok(Self::Cloud),
            other => Err(format!("Unknown connector type: {other}")),
        }
    }
}

/// A tenant-owned connector. `api_key_hash` is a bcrypt digest of the full
/// `vmc_...` key; the plaintext is never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub connector_type: ConnectorType,
    pub api_key_hash: String,
    pub created_at: DateTime<Utc>,
}

/// A credentialed handle to an external data system. Credentials live in
/// the secret store and are referenced by `credential_ref` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorInstance {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    /// Declared capabilities, e.g. `read`, `write`.
    pub capabilities: Vec<String>,
    pub credential_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl AggregatorInstance {
    pub fn can_write(&self) -> bool {
        self.capabilities.iter().any(|c| c == "write")
    }
}

/// Value transform applied by a field-mapping rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldTransform {
    Uppercase,
    Lowercase,
    StringToNumber,
    NumberToString,
    BooleanToString,
    JsonStringify,
    JsonParse,
    DateFormat,
    NumberFormat,
    Direct,
}

/// One rule of a stored mapping: read `source_field`, transform, write
/// `target_field`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMappingRule {
    pub source_field: String,
    pub target_field: String,
    pub transform: FieldTransform,
    /// Format string for `date-format` / `number-format`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// A named, tenant-owned set of field-mapping rules referenced by load
/// activities via `mappingId`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub rules: Vec<FieldMappingRule>,
}

impl FieldTransform {
    /// Apply the transform to a single value. Returns an error string when
    /// the value cannot be converted; callers decide whether that fails the
    /// row or the whole batch.
    pub fn apply(
        self,
        value: &serde_json::Value,
        format: Option<&str>,
    ) -> Result<serde_json::Value, String> {
        use serde_json::Value;

        match self {
            Self::Direct => Ok(value.clone()),
            Self::Uppercase => match value {
                Value::String(s) => Ok(Value::String(s.to_uppercase())),
                other => Ok(Value::String(stringify(other).to_uppercase())),
            },
            Self::Lowercase => match value {
                Value::String(s) => Ok(Value::String(s.to_lowercase())),
                other => Ok(Value::String(stringify(other).to_lowercase())),
            },
            Self::StringToNumber => match value {
                Value::Number(n) => Ok(Value::Number(n.clone())),
                Value::String(s) => {
                    let parsed: f64 = s
                        .trim()
                        .parse()
                        .map_err(|_| format!("cannot parse \"{s}\" as a number"))?;
                    serde_json::Number::from_f64(parsed)
                        .map(Value::Number)
                        .ok_or_else(|| format!("\"{s}\" is not a finite number"))
                }
                other => Err(format!("cannot convert {} to a number", kind_of(other))),
            },
            Self::NumberToString => match value {
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::String(s) => Ok(Value::String(s.clone())),
                other => Err(format!("cannot convert {} to a string", kind_of(other))),
            },
            Self::BooleanToString => match value {
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                other => Err(format!("cannot convert {} to a boolean string", kind_of(other))),
            },
            Self::JsonStringify => serde_json::to_string(value)
                .map(Value::String)
                .map_err(|e| e.to_string()),
            Self::JsonParse => match value {
                Value::String(s) => serde_json::from_str(s)
                    .map_err(|e| format!("invalid JSON in field: {e}")),
                other => Ok(other.clone()),
            },
            Self::DateFormat => match value {
                Value::String(s) => {
                    let parsed = chrono::DateTime::parse_from_rfc3339(s)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .ok()
                        .or_else(|| {
                            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                                .ok()
                                .and_then(|d| d.and_hms_opt(0, 0, 0))
                                .map(|dt| dt.and_utc())
                        })
                        .ok_or_else(|| format!("cannot parse \"{s}\" as a date"))?;
                    let fmt = format.unwrap_or("%Y-%m-%d");
                    Ok(Value::String(parsed.format(fmt).to_string()))
                }
                other => Err(format!("cannot date-format {}", kind_of(other))),
            },
            Self::NumberFormat => match value {
                Value::Number(n) => {
                    let digits: usize = format.and_then(|f| f.parse().ok()).unwrap_or(2);
                    let f = n.as_f64().ok_or_else(|| "number out of range".to_string())?;
                    Ok(Value::String(std::format!("{f:.digits$}")))
                }
                other => Err(format!("cannot number-format {}", kind_of(other))),
            },
        }
    }
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn kind_of(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
