//! Core data model: schema items, attribute details, and extraction jobs.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// =============================================================================
// SCHEMA
// =============================================================================

/// Value type of a schema attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    /// Free-form text.
    Text,
    /// Numeric value.
    Number,
    /// One of a closed (but growable) set of allowed values.
    Select,
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttributeType::Text => "text",
            AttributeType::Number => "number",
            AttributeType::Select => "select",
        };
        f.write_str(s)
    }
}

/// A single attribute definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaItem {
    /// Stable identifier, unique within a schema snapshot.
    pub key: String,
    /// Display name.
    pub label: String,
    #[serde(rename = "type")]
    pub attribute_type: AttributeType,
    /// Ordered allowed values (only meaningful for `select`).
    #[serde(default)]
    pub allowed_values: Vec<String>,
    #[serde(default)]
    pub required: bool,
}

impl SchemaItem {
    pub fn text(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            attribute_type: AttributeType::Text,
            allowed_values: Vec::new(),
            required: false,
        }
    }

    pub fn number(key: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            attribute_type: AttributeType::Number,
            ..Self::text(key, label)
        }
    }

    pub fn select<I, S>(key: impl Into<String>, label: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            attribute_type: AttributeType::Select,
            allowed_values: values.into_iter().map(Into::into).collect(),
            ..Self::text(key, label)
        }
    }

    /// Mark this item as required.
    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn is_select(&self) -> bool {
        self.attribute_type == AttributeType::Select
    }

    /// Case-insensitive lookup of an allowed value, returning its canonical
    /// spelling.
    pub fn canonical_value(&self, value: &str) -> Option<&str> {
        let needle = value.trim();
        self.allowed_values
            .iter()
            .find(|v| v.eq_ignore_ascii_case(needle))
            .map(String::as_str)
    }
}

// =============================================================================
// ATTRIBUTES
// =============================================================================

/// Value bound into the dataset for one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SchemaValue {
    Number(f64),
    Text(String),
}

impl SchemaValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SchemaValue::Text(s) => Some(s),
            SchemaValue::Number(_) => None,
        }
    }
}

impl fmt::Display for SchemaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaValue::Number(n) => write!(f, "{}", n),
            SchemaValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for SchemaValue {
    fn from(s: &str) -> Self {
        SchemaValue::Text(s.to_string())
    }
}

impl From<String> for SchemaValue {
    fn from(s: String) -> Self {
        SchemaValue::Text(s)
    }
}

impl From<f64> for SchemaValue {
    fn from(n: f64) -> Self {
        SchemaValue::Number(n)
    }
}

/// Extracted (or user-edited) detail for one attribute of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeDetail {
    pub schema_value: Option<SchemaValue>,
    /// Literal value the extractor observed.
    pub raw_value: Option<String>,
    #[serde(default)]
    pub is_new_discovery: bool,
    #[serde(default)]
    pub visual_confidence: u8,
    #[serde(default)]
    pub mapping_confidence: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

impl AttributeDetail {
    /// Detail produced by an explicit user edit.
    ///
    /// The observed raw value and reasoning of the previous detail are kept
    /// for reference; confidences become 100 and the discovery flag clears.
    pub fn user_override(value: SchemaValue, previous: Option<&AttributeDetail>) -> Self {
        Self {
            schema_value: Some(value),
            raw_value: previous.and_then(|p| p.raw_value.clone()),
            is_new_discovery: false,
            visual_confidence: 100,
            mapping_confidence: 100,
            reasoning: previous.and_then(|p| p.reasoning.clone()),
        }
    }
}

/// Attribute values of a job keyed by schema key.
pub type AttributeMap = BTreeMap<String, Option<AttributeDetail>>;

/// All-null attribute map keyed by every item of `schema`.
pub fn empty_attributes(schema: &[SchemaItem]) -> AttributeMap {
    schema.iter().map(|item| (item.key.clone(), None)).collect()
}

/// Whether `attributes` has exactly the key set of `schema`.
pub fn keys_match(attributes: &AttributeMap, schema: &[SchemaItem]) -> bool {
    attributes.len() == schema.len() && schema.iter().all(|i| attributes.contains_key(&i.key))
}

// =============================================================================
// RESOURCES
// =============================================================================

/// Handle to an ephemeral preview resource held by the resource registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceRef(Uuid);

impl ResourceRef {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ResourceRef {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "res-{}", self.0)
    }
}

impl From<Uuid> for ResourceRef {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

// =============================================================================
// JOBS
// =============================================================================

/// Lifecycle status of an extraction job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Extracting,
    Done,
    Error,
}

impl JobStatus {
    /// Done and Error only change through explicit re-extraction.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Extracting)
                | (Extracting, Done)
                | (Extracting, Error)
                | (Done, Pending)
                | (Error, Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Extracting => "extracting",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        };
        f.pad(s)
    }
}

/// Validated result of one extraction call.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutput {
    pub attributes: AttributeMap,
    pub tokens_used: u64,
    pub model_used: String,
    pub processing_time_ms: u64,
}

/// One image's extraction lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: Uuid,
    /// Original filename, for display and search only.
    pub source_name: String,
    pub preview_resource_ref: Option<ResourceRef>,
    pub status: JobStatus,
    pub attributes: AttributeMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a Pending job whose attributes are keyed by `schema`.
    pub fn new(
        source_name: impl Into<String>,
        preview_resource_ref: Option<ResourceRef>,
        schema: &[SchemaItem],
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            source_name: source_name.into(),
            preview_resource_ref,
            status: JobStatus::Pending,
            attributes: empty_attributes(schema),
            error: None,
            tokens_used: None,
            model_used: None,
            processing_time_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `to`, failing with [`Error::InvalidTransition`] if the state
    /// machine does not allow it.
    pub fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Pending → Extracting.
    pub fn begin_extraction(&mut self) -> Result<()> {
        self.transition(JobStatus::Extracting)
    }

    /// Extracting → Done, recording the validated attribute set and metadata.
    pub fn complete(&mut self, output: ExtractionOutput) -> Result<()> {
        self.transition(JobStatus::Done)?;
        self.attributes = output.attributes;
        self.tokens_used = Some(output.tokens_used);
        self.model_used = Some(output.model_used);
        self.processing_time_ms = Some(output.processing_time_ms);
        self.error = None;
        Ok(())
    }

    /// Extracting → Error. Attributes from the previous attempt are kept as
    /// last-known-good.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Error)?;
        self.error = Some(message.into());
        Ok(())
    }

    /// Done/Error → Pending with an all-null attribute map for `schema`.
    pub fn reset_for_reextraction(&mut self, schema: &[SchemaItem]) -> Result<()> {
        self.transition(JobStatus::Pending)?;
        self.attributes = empty_attributes(schema);
        self.error = None;
        self.tokens_used = None;
        self.model_used = None;
        self.processing_time_ms = None;
        Ok(())
    }

    /// Apply a user edit to one attribute.
    pub fn apply_override(&mut self, key: &str, value: SchemaValue) -> Result<()> {
        let slot = self
            .attributes
            .get_mut(key)
            .ok_or_else(|| Error::UnknownKey(key.to_string()))?;
        *slot = Some(AttributeDetail::user_override(value, slot.as_ref()));
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Bring the attribute key set in line with `schema`: missing keys become
    /// null, keys no longer in the schema are dropped. Returns whether
    /// anything changed.
    pub fn reconcile_keys(&mut self, schema: &[SchemaItem]) -> bool {
        if keys_match(&self.attributes, schema) {
            return false;
        }
        let mut reconciled = empty_attributes(schema);
        for (key, slot) in reconciled.iter_mut() {
            if let Some(existing) = self.attributes.remove(key) {
                *slot = existing;
            }
        }
        self.attributes = reconciled;
        true
    }

    /// Case-insensitive match against the filename and every bound value.
    pub fn matches_query(&self, query: &str) -> bool {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return true;
        }
        if self.source_name.to_lowercase().contains(&needle) {
            return true;
        }
        self.attributes
            .values()
            .flatten()
            .filter_map(|d| d.schema_value.as_ref())
            .any(|v| v.to_string().to_lowercase().contains(&needle))
    }
}

// =============================================================================
// DATASET VIEWS
// =============================================================================

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DatasetStats {
    pub pending: usize,
    pub extracting: usize,
    pub done: usize,
    pub error: usize,
}

impl DatasetStats {
    pub fn total(&self) -> usize {
        self.pending + self.extracting + self.done + self.error
    }

    pub fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Extracting => self.extracting += 1,
            JobStatus::Done => self.done += 1,
            JobStatus::Error => self.error += 1,
        }
    }
}

/// Read-only snapshot for an external tabular formatter: the active schema
/// and every Done job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSnapshot {
    pub schema: Vec<SchemaItem>,
    pub rows: Vec<Job>,
    pub generated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<SchemaItem> {
        vec![
            SchemaItem::select("color", "Color", ["RED", "BLUE"]),
            SchemaItem::text("material", "Material"),
            SchemaItem::number("weight", "Weight"),
        ]
    }

    fn output(schema: &[SchemaItem]) -> ExtractionOutput {
        let mut attributes = empty_attributes(schema);
        attributes.insert(
            "color".to_string(),
            Some(AttributeDetail {
                schema_value: Some("RED".into()),
                raw_value: Some("crimson".to_string()),
                is_new_discovery: false,
                visual_confidence: 80,
                mapping_confidence: 70,
                reasoning: None,
            }),
        );
        ExtractionOutput {
            attributes,
            tokens_used: 420,
            model_used: "vision-1".to_string(),
            processing_time_ms: 1200,
        }
    }

    #[test]
    fn test_new_job_has_schema_keys() {
        let schema = schema();
        let job = Job::new("shirt.jpg", None, &schema);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(keys_match(&job.attributes, &schema));
        assert!(job.attributes.values().all(Option::is_none));
    }

    #[test]
    fn test_valid_transitions() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Extracting));
        assert!(Extracting.can_transition_to(Done));
        assert!(Extracting.can_transition_to(Error));
        assert!(Done.can_transition_to(Pending));
        assert!(Error.can_transition_to(Pending));
    }

    #[test]
    fn test_invalid_transitions() {
        use JobStatus::*;
        let all = [Pending, Extracting, Done, Error];
        let allowed = [
            (Pending, Extracting),
            (Extracting, Done),
            (Extracting, Error),
            (Done, Pending),
            (Error, Pending),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_transition_rejects_pending_to_done() {
        let mut job = Job::new("a.jpg", None, &schema());
        let err = job.complete(output(&schema())).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Done
            }
        ));
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_complete_records_metadata() {
        let schema = schema();
        let mut job = Job::new("a.jpg", None, &schema);
        job.begin_extraction().unwrap();
        job.complete(output(&schema)).unwrap();

        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.tokens_used, Some(420));
        assert_eq!(job.model_used.as_deref(), Some("vision-1"));
        assert_eq!(job.processing_time_ms, Some(1200));
        assert!(job.error.is_none());
    }

    #[test]
    fn test_fail_preserves_previous_attributes() {
        let schema = schema();
        let mut job = Job::new("a.jpg", None, &schema);
        job.begin_extraction().unwrap();
        job.complete(output(&schema)).unwrap();
        let before = job.attributes.clone();

        // Re-extraction resets, so simulate a failed attempt on a job that
        // carries attributes by failing straight from Extracting.
        job.status = JobStatus::Extracting;
        job.fail("boom").unwrap();

        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert_eq!(job.attributes, before);
    }

    #[test]
    fn test_reset_for_reextraction_uses_current_schema() {
        let schema = schema();
        let mut job = Job::new("a.jpg", None, &schema);
        job.begin_extraction().unwrap();
        job.fail("timeout").unwrap();

        let mut grown = schema.clone();
        grown.push(SchemaItem::text("brand", "Brand"));
        job.reset_for_reextraction(&grown).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_none());
        assert!(keys_match(&job.attributes, &grown));
        assert!(job.attributes.values().all(Option::is_none));
    }

    #[test]
    fn test_reset_rejected_while_extracting() {
        let mut job = Job::new("a.jpg", None, &schema());
        job.begin_extraction().unwrap();
        assert!(job.reset_for_reextraction(&schema()).is_err());
    }

    #[test]
    fn test_apply_override_sets_full_confidence() {
        let schema = schema();
        let mut job = Job::new("a.jpg", None, &schema);
        job.begin_extraction().unwrap();
        job.complete(output(&schema)).unwrap();

        job.apply_override("color", "BLUE".into()).unwrap();
        let detail = job.attributes["color"].as_ref().unwrap();
        assert_eq!(detail.schema_value, Some("BLUE".into()));
        assert_eq!(detail.raw_value.as_deref(), Some("crimson"));
        assert_eq!(detail.visual_confidence, 100);
        assert_eq!(detail.mapping_confidence, 100);
        assert!(!detail.is_new_discovery);
    }

    #[test]
    fn test_apply_override_unknown_key() {
        let mut job = Job::new("a.jpg", None, &schema());
        let err = job.apply_override("size", "XL".into()).unwrap_err();
        assert!(matches!(err, Error::UnknownKey(k) if k == "size"));
    }

    #[test]
    fn test_reconcile_keys() {
        let schema = schema();
        let mut job = Job::new("a.jpg", None, &schema);
        job.attributes.remove("weight");
        job.attributes.insert("legacy".to_string(), None);

        assert!(job.reconcile_keys(&schema));
        assert!(keys_match(&job.attributes, &schema));
        assert!(!job.reconcile_keys(&schema));
    }

    #[test]
    fn test_matches_query() {
        let schema = schema();
        let mut job = Job::new("Summer-Dress.JPG", None, &schema);
        job.apply_override("color", "RED".into()).unwrap();

        assert!(job.matches_query("dress"));
        assert!(job.matches_query("red"));
        assert!(job.matches_query(""));
        assert!(!job.matches_query("wool"));
    }

    #[test]
    fn test_canonical_value_case_insensitive() {
        let item = SchemaItem::select("color", "Color", ["RED", "Navy Blue"]);
        assert_eq!(item.canonical_value("red"), Some("RED"));
        assert_eq!(item.canonical_value(" navy blue "), Some("Navy Blue"));
        assert_eq!(item.canonical_value("teal"), None);
    }

    #[test]
    fn test_job_serialization_camel_case() {
        let job = Job::new("a.jpg", Some(ResourceRef::new()), &schema());
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["sourceName"], "a.jpg");
        assert_eq!(json["status"], "pending");
        assert!(json["previewResourceRef"].is_string());
        assert!(json.get("error").is_none());

        let back: Job = serde_json::from_value(json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_schema_value_untagged() {
        let n: SchemaValue = serde_json::from_str("12.5").unwrap();
        assert_eq!(n, SchemaValue::Number(12.5));
        let s: SchemaValue = serde_json::from_str("\"RED\"").unwrap();
        assert_eq!(s, SchemaValue::Text("RED".to_string()));
    }

    #[test]
    fn test_dataset_stats() {
        let mut stats = DatasetStats::default();
        stats.record(JobStatus::Done);
        stats.record(JobStatus::Done);
        stats.record(JobStatus::Error);
        assert_eq!(stats.done, 2);
        assert_eq!(stats.error, 1);
        assert_eq!(stats.total(), 3);
    }
}
