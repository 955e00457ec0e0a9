use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The universal-schema category an entity descriptor migrates into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TargetType {
    Organization,
    Practitioner,
    Patient,
    PatientPractitionerLink,
    ClinicalEntry,
    EntryAttribute,
    EntryState,
}

impl TargetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Organization => "Organization",
            TargetType::Practitioner => "Practitioner",
            TargetType::Patient => "Patient",
            TargetType::PatientPractitionerLink => "PatientPractitionerLink",
            TargetType::ClinicalEntry => "ClinicalEntry",
            TargetType::EntryAttribute => "EntryAttribute",
            TargetType::EntryState => "EntryState",
        }
    }
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // Legacy mapping files still use the pre-rename names.
        match value {
            "Organization" | "Clinic" => Ok(TargetType::Organization),
            "Practitioner" => Ok(TargetType::Practitioner),
            "Patient" => Ok(TargetType::Patient),
            "PatientPractitionerLink" | "PatientPractitioner" => {
                Ok(TargetType::PatientPractitionerLink)
            }
            "ClinicalEntry" | "Entry" => Ok(TargetType::ClinicalEntry),
            "EntryAttribute" => Ok(TargetType::EntryAttribute),
            "EntryState" => Ok(TargetType::EntryState),
            other => Err(format!("unrecognized target type '{other}'")),
        }
    }
}

/// Identifies one logical entity of a run: its category plus, for entry
/// level entities, the classifying code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKey {
    Organization,
    Practitioner,
    Patient,
    PatientPractitionerLink,
    ClinicalEntry(String),
    EntryAttribute(String),
    EntryState(String),
}

impl EntityKey {
    pub fn target_type(&self) -> TargetType {
        match self {
            EntityKey::Organization => TargetType::Organization,
            EntityKey::Practitioner => TargetType::Practitioner,
            EntityKey::Patient => TargetType::Patient,
            EntityKey::PatientPractitionerLink => TargetType::PatientPractitionerLink,
            EntityKey::ClinicalEntry(_) => TargetType::ClinicalEntry,
            EntityKey::EntryAttribute(_) => TargetType::EntryAttribute,
            EntityKey::EntryState(_) => TargetType::EntryState,
        }
    }

    /// Entry code an attribute belongs to: the leading `.`-separated
    /// segment of the attribute code (`009.002` -> `009`).
    pub fn attribute_entry_code(attribute_code: &str) -> &str {
        attribute_code
            .split('.')
            .next()
            .unwrap_or(attribute_code)
    }

    /// Name used for the staging table: `etl_` plus the slug with every
    /// non-alphanumeric character folded to `_`.
    pub fn staging_table(&self) -> String {
        let slug: String = self
            .to_string()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("etl_{slug}")
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Organization => f.write_str("organization"),
            EntityKey::Practitioner => f.write_str("practitioner"),
            EntityKey::Patient => f.write_str("patient"),
            EntityKey::PatientPractitionerLink => f.write_str("patient-practitioner"),
            EntityKey::ClinicalEntry(code) => write!(f, "entry-{code}"),
            EntityKey::EntryAttribute(code) => write!(f, "entry-attribute-{code}"),
            EntityKey::EntryState(code) => write!(f, "entry-state-{code}"),
        }
    }
}

/// Name of a node in the task graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKey {
    Start,
    Create(EntityKey),
    Transfer(EntityKey),
    Load(EntityKey),
    Sync(EntityKey),
    Export(EntityKey),
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKey::Start => f.write_str("start"),
            TaskKey::Create(entity) => write!(f, "create-{entity}"),
            TaskKey::Transfer(entity) => write!(f, "transfer-{entity}"),
            TaskKey::Load(entity) => write!(f, "load-{entity}"),
            TaskKey::Sync(entity) => write!(f, "sync-{entity}"),
            TaskKey::Export(entity) => write!(f, "export-{entity}"),
        }
    }
}

/// A single column value moving between source and target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// CSV rendering; NULL is written as `\N`.
    pub fn csv_field(&self) -> Cow<'_, str> {
        match self {
            SqlValue::Null => Cow::Borrowed("\\N"),
            SqlValue::Integer(v) => Cow::Owned(v.to_string()),
            SqlValue::Real(v) => Cow::Owned(v.to_string()),
            SqlValue::Text(v) => Cow::Borrowed(v.as_str()),
            SqlValue::Blob(v) => String::from_utf8_lossy(v),
        }
    }

    /// Inverse of [`SqlValue::csv_field`]: `\N` reads back as NULL, anything
    /// else as text.
    pub fn from_csv_field(field: &str) -> Self {
        match field {
            "\\N" => SqlValue::Null,
            other => SqlValue::Text(other.to_string()),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

pub type Row = Vec<SqlValue>;

/// One page of an extraction query, already rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub sql: String,
    /// Index of the transfer cursor issuing the request.
    pub cursor: usize,
    pub offset: usize,
    pub limit: usize,
}

/// A parameterized statement for the target.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub text: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            params: Vec::new(),
        }
    }
}

/// Parameters of one target-side merge call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    pub target_type: TargetType,
    pub staging_table: String,
    pub source_table: Option<String>,
    pub attribute_code: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeSummary {
    pub affected_rows: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    pub pages: usize,
    pub rows_fetched: usize,
    pub rows_written: usize,
    pub batches: usize,
}

impl TransferStats {
    pub fn absorb(&mut self, other: TransferStats) {
        self.pages += other.pages;
        self.rows_fetched += other.rows_fetched;
        self.rows_written += other.rows_written;
        self.batches += other.batches;
    }
}

/// What a finished task produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskOutcome {
    Started,
    Created { table: String },
    Transferred(TransferStats),
    Synced(MergeSummary),
    Exported { path: String, stats: TransferStats },
    Loaded { path: String, stats: TransferStats },
}

pub(crate) fn elapsed_secs(elapsed: Duration) -> f64 {
    (elapsed.as_millis() as f64) / 1000.0
}
