//! Protocol payload types shared by the Sentinel broker and Worker client.

use serde::de;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use url::form_urlencoded;

// ============================================================================
// Canonical Enums (used across all crates)
// ============================================================================

/// Canonical job identifier across the system.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// A job id of zero is reserved for messages not scoped to any job
    /// (e.g. IDENTIFY, DEPLOY, PREPARE_ENV).
    pub const fn is_unscoped(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<JobId> for u64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl TryFrom<i64> for JobId {
    type Error = JobIdError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u64::try_from(value)
            .map(JobId)
            .map_err(|_| JobIdError::Negative(value))
    }
}

impl TryFrom<JobId> for i64 {
    type Error = JobIdError;

    fn try_from(value: JobId) -> Result<Self, Self::Error> {
        i64::try_from(value.0).map_err(|_| JobIdError::TooLarge(value.0))
    }
}

impl FromStr for JobId {
    type Err = JobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(JobId).map_err(JobIdError::Parse)
    }
}

/// Error constructing a [`JobId`] from another integer representation.
#[derive(Debug, Error)]
pub enum JobIdError {
    #[error("job id cannot be negative: {0}")]
    Negative(i64),
    #[error("job id does not fit in i64: {0}")]
    TooLarge(u64),
    #[error("invalid job id: {0}")]
    Parse(#[from] std::num::ParseIntError),
}

/// How a sink writer treats an existing target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SinkMode {
    #[default]
    Append,
    Overwrite,
    Upsert,
}

impl SinkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkMode::Append => "append",
            SinkMode::Overwrite => "overwrite",
            SinkMode::Upsert => "upsert",
        }
    }
}

impl fmt::Display for SinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SinkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "append" => Ok(SinkMode::Append),
            "overwrite" => Ok(SinkMode::Overwrite),
            "upsert" => Ok(SinkMode::Upsert),
            other => Err(format!("Invalid sink mode: '{}'", other)),
        }
    }
}

// ============================================================================
// Processing Status (ProcessingJob lifecycle, spec §3)
// ============================================================================

/// `ProcessingJob` lifecycle. Transitions: `QUEUED -> RUNNING -> {COMPLETED, FAILED}`.
/// A `FAILED` job with a retryable classification is re-enqueued as a sibling
/// `QUEUED` row rather than mutated in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    #[default]
    Queued,
    Running,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub const ALL: &'static [ProcessingStatus] = &[
        ProcessingStatus::Queued,
        ProcessingStatus::Running,
        ProcessingStatus::Completed,
        ProcessingStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Queued => "QUEUED",
            ProcessingStatus::Running => "RUNNING",
            ProcessingStatus::Completed => "COMPLETED",
            ProcessingStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(ProcessingStatus::Queued),
            "RUNNING" => Ok(ProcessingStatus::Running),
            "COMPLETED" => Ok(ProcessingStatus::Completed),
            "FAILED" => Ok(ProcessingStatus::Failed),
            _ => Err(format!("Invalid processing status: '{}'", s)),
        }
    }
}

// ============================================================================
// Plugin Status (PluginManifest lifecycle, spec §3)
// ============================================================================

/// `PluginManifest` lifecycle. `REJECTED`/`FAILED` are terminal; all other
/// transitions are monotonic (`PENDING -> STAGING -> ACTIVE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginStatus {
    #[default]
    Pending,
    Staging,
    Active,
    Rejected,
    Failed,
}

impl PluginStatus {
    pub const ALL: &'static [PluginStatus] = &[
        PluginStatus::Pending,
        PluginStatus::Staging,
        PluginStatus::Active,
        PluginStatus::Rejected,
        PluginStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginStatus::Pending => "PENDING",
            PluginStatus::Staging => "STAGING",
            PluginStatus::Active => "ACTIVE",
            PluginStatus::Rejected => "REJECTED",
            PluginStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PluginStatus::Rejected | PluginStatus::Failed)
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PluginStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(PluginStatus::Pending),
            "STAGING" => Ok(PluginStatus::Staging),
            "ACTIVE" => Ok(PluginStatus::Active),
            "REJECTED" => Ok(PluginStatus::Rejected),
            "FAILED" => Ok(PluginStatus::Failed),
            _ => Err(format!("Invalid plugin status: '{}'", s)),
        }
    }
}

// ============================================================================
// Worker Status (broker-local ConnectedWorker state machine, spec §4.4)
// ============================================================================

/// `ConnectedWorker` state machine:
/// `UNKNOWN -> IDENTIFIED -> IDLE <-> BUSY`, any state `-> DEAD` on disconnect
/// or heartbeat timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    #[default]
    Unknown,
    Identified,
    Idle,
    Busy,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Unknown => "UNKNOWN",
            WorkerStatus::Identified => "IDENTIFIED",
            WorkerStatus::Idle => "IDLE",
            WorkerStatus::Busy => "BUSY",
            WorkerStatus::Dead => "DEAD",
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, WorkerStatus::Idle)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Data Types (Canonical Definition)
// ============================================================================

/// Canonical column data type, used to describe sink schemas and diagnose
/// schema mismatches. The core never encodes values of this type itself —
/// batches are produced and serialized by the external tabular library the
/// guest links against; this enum only *describes* columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum DataType {
    Null,
    Boolean,
    Int64,
    Float64,
    Date,
    Timestamp,
    Time,
    Duration,
    #[default]
    String,
    Binary,
    Decimal { precision: u8, scale: u8 },
    TimestampTz { tz: String },
    List { item: Box<DataType> },
    Struct { fields: Vec<StructField> },
}

/// A field within a Struct type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StructField {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub nullable: bool,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DataTypeRepr {
    Shorthand(String),
    Object(DataTypeObject),
}

#[derive(Debug, Deserialize)]
struct DataTypeObject {
    pub kind: String,
    #[serde(default)]
    pub precision: Option<u8>,
    #[serde(default)]
    pub scale: Option<u8>,
    #[serde(default)]
    pub tz: Option<String>,
    #[serde(default)]
    pub item: Option<Box<DataType>>,
    #[serde(default)]
    pub fields: Option<Vec<StructField>>,
}

impl Serialize for DataType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            DataType::Null => serializer.serialize_str("null"),
            DataType::Boolean => serializer.serialize_str("boolean"),
            DataType::Int64 => serializer.serialize_str("int64"),
            DataType::Float64 => serializer.serialize_str("float64"),
            DataType::Date => serializer.serialize_str("date"),
            DataType::Timestamp => serializer.serialize_str("timestamp"),
            DataType::Time => serializer.serialize_str("time"),
            DataType::Duration => serializer.serialize_str("duration"),
            DataType::String => serializer.serialize_str("string"),
            DataType::Binary => serializer.serialize_str("binary"),
            DataType::Decimal { precision, scale } => {
                let mut map = serializer.serialize_map(Some(3))?;
                map.serialize_entry("kind", "decimal")?;
                map.serialize_entry("precision", precision)?;
                map.serialize_entry("scale", scale)?;
                map.end()
            }
            DataType::TimestampTz { tz } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("kind", "timestamp_tz")?;
                map.serialize_entry("tz", tz)?;
                map.end()
            }
            DataType::List { item } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("kind", "list")?;
                map.serialize_entry("item", item)?;
                map.end()
            }
            DataType::Struct { fields } => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("kind", "struct")?;
                map.serialize_entry("fields", fields)?;
                map.end()
            }
        }
    }
}

impl DataType {
    fn from_repr(repr: DataTypeRepr) -> Result<Self, String> {
        match repr {
            DataTypeRepr::Shorthand(s) => s.parse(),
            DataTypeRepr::Object(obj) => match obj.kind.as_str() {
                "decimal" => Ok(DataType::Decimal {
                    precision: obj.precision.ok_or("decimal requires 'precision'")?,
                    scale: obj.scale.ok_or("decimal requires 'scale'")?,
                }),
                "timestamp_tz" => Ok(DataType::TimestampTz {
                    tz: obj.tz.ok_or("timestamp_tz requires 'tz'")?,
                }),
                "list" => Ok(DataType::List {
                    item: obj.item.ok_or("list requires 'item'")?,
                }),
                "struct" => Ok(DataType::Struct {
                    fields: obj.fields.ok_or("struct requires 'fields'")?,
                }),
                other => Err(format!("Unknown composite data type kind: '{}'", other)),
            },
        }
    }
}

impl<'de> Deserialize<'de> for DataType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let repr = DataTypeRepr::deserialize(deserializer)?;
        DataType::from_repr(repr).map_err(de::Error::custom)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Null => write!(f, "null"),
            DataType::Boolean => write!(f, "boolean"),
            DataType::Int64 => write!(f, "int64"),
            DataType::Float64 => write!(f, "float64"),
            DataType::Date => write!(f, "date"),
            DataType::Timestamp => write!(f, "timestamp"),
            DataType::Time => write!(f, "time"),
            DataType::Duration => write!(f, "duration"),
            DataType::String => write!(f, "string"),
            DataType::Binary => write!(f, "binary"),
            DataType::Decimal { precision, scale } => write!(f, "decimal({precision},{scale})"),
            DataType::TimestampTz { tz } => write!(f, "timestamp_tz({tz})"),
            DataType::List { item } => write!(f, "list<{item}>"),
            DataType::Struct { fields } => {
                write!(f, "struct<")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name, field.data_type)?;
                }
                write!(f, ">")
            }
        }
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "null" => Ok(DataType::Null),
            "boolean" | "bool" => Ok(DataType::Boolean),
            "int64" | "integer" | "int" => Ok(DataType::Int64),
            "float64" | "float" | "double" => Ok(DataType::Float64),
            "date" => Ok(DataType::Date),
            "timestamp" | "datetime" => Ok(DataType::Timestamp),
            "time" => Ok(DataType::Time),
            "duration" => Ok(DataType::Duration),
            "string" | "str" | "text" => Ok(DataType::String),
            "binary" | "bytes" => Ok(DataType::Binary),
            other => Err(format!("Unknown data type shorthand: '{}'", other)),
        }
    }
}

// ============================================================================
// Sink configuration (part of OpCode.DISPATCH payload)
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuarantineConfig {
    pub allow_quarantine: bool,
    pub max_quarantine_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_quarantine_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_dir: Option<String>,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            allow_quarantine: false,
            max_quarantine_pct: 10.0,
            max_quarantine_count: None,
            quarantine_dir: None,
        }
    }
}

/// Configuration for a single named output ("topic") a dispatched job writes to.
/// Derived from `TopicConfig` by the routing projector (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SinkConfig {
    pub topic: String,
    pub uri: String,
    #[serde(default)]
    pub mode: SinkMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_config: Option<QuarantineConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDefinition>,
}

/// Typed schema definition for an output, used for schema-mismatch diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaDefinition {
    pub columns: Vec<SchemaColumnSpec>,
}

/// A single expected column within a [`SchemaDefinition`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: DataType,
    #[serde(default)]
    pub nullable: bool,
}

/// Supported sink URI schemes (job-level). Sink *implementations* are an
/// external collaborator; only URI parsing lives in the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkScheme {
    Parquet,
    Csv,
    Relational,
    File,
}

impl SinkScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            SinkScheme::Parquet => "parquet",
            SinkScheme::Csv => "csv",
            SinkScheme::Relational => "relational",
            SinkScheme::File => "file",
        }
    }
}

impl FromStr for SinkScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "parquet" => Ok(SinkScheme::Parquet),
            "csv" => Ok(SinkScheme::Csv),
            "relational" => Ok(SinkScheme::Relational),
            "file" => Ok(SinkScheme::File),
            other => Err(format!("Unsupported sink scheme: '{}'", other)),
        }
    }
}

/// Parsed sink URI used for local validation before handing off to a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSinkUri {
    pub scheme: SinkScheme,
    pub path: PathBuf,
    pub query: HashMap<String, String>,
    pub original: String,
}

impl ParsedSinkUri {
    pub fn parse(uri: &str) -> Result<Self, String> {
        let (scheme_str, rest) = uri
            .split_once("://")
            .ok_or_else(|| format!("Sink URI '{}' is missing scheme delimiter", uri))?;
        let scheme = SinkScheme::from_str(scheme_str)?;

        let (path_part, query_part) = rest.split_once('?').unwrap_or((rest, ""));
        if path_part.is_empty() {
            return Err(format!("Sink URI '{}' is missing a path", uri));
        }

        let mut query = HashMap::new();
        if !query_part.is_empty() {
            for (k, v) in form_urlencoded::parse(query_part.as_bytes()) {
                query.insert(k.into_owned(), v.into_owned());
            }
        }

        Ok(Self {
            scheme,
            path: PathBuf::from(path_part),
            query,
            original: uri.to_string(),
        })
    }
}

// ============================================================================
// OpCode.DISPATCH (Sentinel -> Worker)
// ============================================================================

/// Payload for OpCode.DISPATCH.
/// Sentinel -> Worker: "process this file, stream batches to these sinks."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchCommand {
    pub plugin_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parser_version: Option<String>,
    pub file_path: String,
    pub file_version_id: i64,
    pub sinks: Vec<SinkConfig>,
    /// SHA256 of the lockfile content. None means "runs without an isolated
    /// environment" (spec §3 PluginManifest.environment_hash).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_hash: Option<String>,
    /// Plugin source, required so the worker can spawn the guest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_code: Option<String>,
    pub artifact_hash: String,
}

// ============================================================================
// OpCode.CONCLUDE (Worker -> Sentinel)
// ============================================================================

/// Job completion status reported by the worker over CONCLUDE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Success,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Aborted => "ABORTED",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Success)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            "ABORTED" => Ok(JobStatus::Aborted),
            _ => Err(format!("Invalid job status: '{}'", s)),
        }
    }
}

/// A single produced output artifact (one per topic written).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArtifactRef {
    pub topic: String,
    pub uri: String,
}

/// Payload for OpCode.CONCLUDE.
/// Worker -> Sentinel: "job finished, here is the receipt."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReceipt {
    pub status: JobStatus,
    /// e.g. {"rows": 1500, "bytes": 42000}
    pub metrics: HashMap<String, i64>,
    pub artifacts: Vec<ArtifactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Whether a FAILED job should be retried (spec §7 error taxonomy).
    #[serde(default)]
    pub retryable: bool,
}

// ============================================================================
// OpCode.IDENTIFY (Worker -> Sentinel)
// ============================================================================

/// Payload for OpCode.IDENTIFY. Sent once immediately after connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifyPayload {
    pub capabilities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

// ============================================================================
// OpCode.HEARTBEAT (Worker -> Sentinel)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeartbeatStatus {
    Idle,
    Busy,
}

impl HeartbeatStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, HeartbeatStatus::Idle)
    }
}

/// Payload for OpCode.HEARTBEAT.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub status: HeartbeatStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<JobId>,
}

// ============================================================================
// OpCode.ERR (Bidirectional)
// ============================================================================

/// Payload for OpCode.ERR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

// ============================================================================
// Artifact Deployment (OpCode.DEPLOY)
// ============================================================================

/// Payload for OpCode.DEPLOY.
/// Publisher-client -> Sentinel: "deploy this artifact to the registry."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployCommand {
    pub plugin_name: String,
    pub version: String,
    pub source_code: String,
    pub lockfile_content: String,
    pub artifact_hash: String,
    pub signature: String,
    pub publisher_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publisher_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_identity_oid: Option<String>,
}

/// Response to a DEPLOY command, carried in a CONCLUDE or ERR frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manifest_id: Option<i64>,
}

// ============================================================================
// Eager environment provisioning (OpCode.PREPARE_ENV / ENV_READY)
// ============================================================================

/// Payload for OpCode.PREPARE_ENV.
/// Sentinel -> Worker: materialize this environment ahead of dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepareEnvCommand {
    pub env_hash: String,
    pub lockfile_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub python_version: Option<String>,
}

/// Payload for OpCode.ENV_READY.
/// Worker -> Sentinel: environment is materialized (or was already cached).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvReadyPayload {
    pub env_hash: String,
    pub interpreter_path: String,
    pub cached: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_roundtrips_through_i64() {
        let id = JobId::new(42);
        let as_i64: i64 = id.try_into().unwrap();
        let back: JobId = as_i64.try_into().unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn processing_status_round_trips() {
        for status in ProcessingStatus::ALL {
            let s = status.as_str();
            assert_eq!(s.parse::<ProcessingStatus>().unwrap(), *status);
        }
    }

    #[test]
    fn plugin_status_round_trips() {
        for status in PluginStatus::ALL {
            let s = status.as_str();
            assert_eq!(s.parse::<PluginStatus>().unwrap(), *status);
        }
    }

    #[test]
    fn data_type_shorthand_round_trips() {
        for (shorthand, expected) in [
            ("boolean", DataType::Boolean),
            ("int64", DataType::Int64),
            ("string", DataType::String),
        ] {
            let json = serde_json::to_string(&expected).unwrap();
            assert_eq!(json, format!("\"{}\"", shorthand));
            let parsed: DataType = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, expected);
        }
    }

    #[test]
    fn data_type_decimal_round_trips() {
        let dt = DataType::Decimal {
            precision: 18,
            scale: 2,
        };
        let json = serde_json::to_string(&dt).unwrap();
        let parsed: DataType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, dt);
    }

    #[test]
    fn parsed_sink_uri_extracts_query() {
        let parsed = ParsedSinkUri::parse("parquet://./out/?compression=zstd").unwrap();
        assert_eq!(parsed.scheme, SinkScheme::Parquet);
        assert_eq!(parsed.query.get("compression").map(String::as_str), Some("zstd"));
    }
}
