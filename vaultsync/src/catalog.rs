use crate::errors::{MigrationError, Result};
use crate::models::{EntityKey, TargetType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

pub const OFFSET_PLACEHOLDER: &str = "{offset}";
pub const LIMIT_PLACEHOLDER: &str = "{limit}";

/// One entry of the entity catalog: what to extract and where it lands.
///
/// `target_type` is kept as written so that an unknown value is reported
/// by the graph builder together with the descriptor it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDescriptor {
    #[serde(alias = "target")]
    pub target_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_table: Option<String>,
    pub query: String,
}

impl EntityDescriptor {
    pub fn new(target_type: TargetType, query: impl Into<String>) -> Self {
        Self {
            target_type: target_type.as_str().to_string(),
            entry_id: None,
            attribute_id: None,
            entry_name: None,
            source_table: None,
            query: query.into(),
        }
    }

    pub fn with_entry_id(mut self, entry_id: impl Into<String>) -> Self {
        self.entry_id = Some(entry_id.into());
        self
    }

    pub fn with_attribute_id(mut self, attribute_id: impl Into<String>) -> Self {
        self.attribute_id = Some(attribute_id.into());
        self
    }

    pub fn with_source_table(mut self, source_table: impl Into<String>) -> Self {
        self.source_table = Some(source_table.into());
        self
    }

    fn describe(&self, index: usize) -> String {
        match &self.source_table {
            Some(table) => format!(
                "descriptor #{index} (target '{}', source table '{table}')",
                self.target_type
            ),
            None => format!("descriptor #{index} (target '{}')", self.target_type),
        }
    }

    fn required_code(&self, index: usize, code: &Option<String>, field: &str) -> Result<String> {
        match code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => Ok(code.to_string()),
            _ => Err(MigrationError::Config(format!(
                "{} requires '{field}'",
                self.describe(index)
            ))),
        }
    }

    /// Resolves the descriptor at position `index` into its typed key.
    pub fn entity_key(&self, index: usize) -> Result<EntityKey> {
        let target_type: TargetType = self.target_type.parse().map_err(|reason| {
            MigrationError::Config(format!("{}: {reason}", self.describe(index)))
        })?;

        let key = match target_type {
            TargetType::Organization => EntityKey::Organization,
            TargetType::Practitioner => EntityKey::Practitioner,
            TargetType::Patient => EntityKey::Patient,
            TargetType::PatientPractitionerLink => EntityKey::PatientPractitionerLink,
            TargetType::ClinicalEntry => {
                EntityKey::ClinicalEntry(self.required_code(index, &self.entry_id, "entryId")?)
            }
            TargetType::EntryState => {
                EntityKey::EntryState(self.required_code(index, &self.entry_id, "entryId")?)
            }
            TargetType::EntryAttribute => EntityKey::EntryAttribute(self.required_code(
                index,
                &self.attribute_id,
                "attributeId",
            )?),
        };
        Ok(key)
    }

    fn check_query(&self, index: usize) -> Result<()> {
        for placeholder in [OFFSET_PLACEHOLDER, LIMIT_PLACEHOLDER] {
            if !self.query.contains(placeholder) {
                return Err(MigrationError::Config(format!(
                    "{}: query is missing the {placeholder} placeholder",
                    self.describe(index)
                )));
            }
        }
        Ok(())
    }
}

/// A descriptor paired with its resolved key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntity {
    pub key: EntityKey,
    pub descriptor: EntityDescriptor,
}

/// The ordered list of entity descriptors driving a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityCatalog {
    descriptors: Vec<EntityDescriptor>,
}

impl EntityCatalog {
    pub fn new(descriptors: Vec<EntityDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            MigrationError::Config(format!(
                "failed to read catalog '{}': {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&raw)
    }

    pub fn descriptors(&self) -> &[EntityDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Resolves every descriptor, failing on the first invalid one.
    ///
    /// Nothing is returned unless the whole catalog is valid: known target
    /// types, required codes present, both paging placeholders present and
    /// no entity listed twice, and no two entities sharing a staging table.
    pub fn resolve(&self) -> Result<Vec<ResolvedEntity>> {
        let mut seen = BTreeSet::new();
        let mut tables: BTreeMap<String, EntityKey> = BTreeMap::new();
        let mut resolved = Vec::with_capacity(self.descriptors.len());

        for (index, descriptor) in self.descriptors.iter().enumerate() {
            let key = descriptor.entity_key(index)?;
            descriptor.check_query(index)?;
            if !seen.insert(key.clone()) {
                return Err(MigrationError::Config(format!(
                    "{}: entity '{key}' is listed more than once",
                    descriptor.describe(index)
                )));
            }
            if let Some(other) = tables.insert(key.staging_table(), key.clone()) {
                return Err(MigrationError::Config(format!(
                    "{}: entity '{key}' and '{other}' share staging table '{}'",
                    descriptor.describe(index),
                    key.staging_table()
                )));
            }
            resolved.push(ResolvedEntity {
                key,
                descriptor: descriptor.clone(),
            });
        }

        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGED: &str = "SELECT 1 LIMIT {offset}, {limit}";

    #[test]
    fn test_load_legacy_mapping_json() {
        let raw = r#"[
            {"target": "Clinic", "query": "select 1 limit {offset}, {limit}"},
            {"targetType": "Entry", "entryId": "001", "sourceTable": "demographic",
             "query": "select 2 limit {offset}, {limit}"},
            {"target": "EntryAttribute", "attributeId": "001.002", "entryName": "Address",
             "query": "select 3 limit {offset}, {limit}"}
        ]"#;
        let dir = tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        std::fs::write(&path, raw).unwrap();

        let catalog = EntityCatalog::from_path(&path).unwrap();
        assert_eq!(catalog.len(), 3);

        let resolved = catalog.resolve().unwrap();
        let keys: Vec<_> = resolved.iter().map(|r| r.key.clone()).collect();
        assert_eq!(
            keys,
            vec![
                EntityKey::Organization,
                EntityKey::ClinicalEntry("001".into()),
                EntityKey::EntryAttribute("001.002".into()),
            ]
        );
        assert_eq!(
            resolved[1].descriptor.source_table.as_deref(),
            Some("demographic")
        );
    }

    #[test]
    fn test_unknown_target_names_descriptor() {
        let catalog = EntityCatalog::new(vec![
            EntityDescriptor::new(TargetType::Organization, PAGED),
            EntityDescriptor {
                target_type: "Invoice".into(),
                source_table: Some("billing".into()),
                ..EntityDescriptor::new(TargetType::Patient, PAGED)
            },
        ]);

        let err = catalog.resolve().unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, MigrationError::Config(_)));
        assert!(message.contains("descriptor #1"));
        assert!(message.contains("Invoice"));
        assert!(message.contains("billing"));
    }

    #[test]
    fn test_missing_codes_and_placeholders_rejected() {
        let no_entry = EntityCatalog::new(vec![EntityDescriptor::new(
            TargetType::ClinicalEntry,
            PAGED,
        )]);
        assert!(no_entry.resolve().unwrap_err().to_string().contains("entryId"));

        let no_limit = EntityCatalog::new(vec![EntityDescriptor::new(
            TargetType::Patient,
            "SELECT 1 OFFSET {offset}",
        )]);
        assert!(no_limit.resolve().unwrap_err().to_string().contains("{limit}"));
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let catalog = EntityCatalog::new(vec![
            EntityDescriptor::new(TargetType::Patient, PAGED),
            EntityDescriptor::new(TargetType::Patient, PAGED),
        ]);
        assert!(catalog.resolve().unwrap_err().to_string().contains("more than once"));
    }

    #[test]
    fn test_colliding_staging_tables_rejected() {
        let catalog = EntityCatalog::new(vec![
            EntityDescriptor::new(TargetType::ClinicalEntry, PAGED).with_entry_id("001"),
            EntityDescriptor::new(TargetType::EntryAttribute, PAGED).with_attribute_id("001.002"),
            EntityDescriptor::new(TargetType::EntryAttribute, PAGED).with_attribute_id("001_002"),
        ]);
        let message = catalog.resolve().unwrap_err().to_string();
        assert!(message.contains("etl_entry_attribute_001_002"), "{message}");
        assert!(message.contains("descriptor #2"), "{message}");
    }
}
