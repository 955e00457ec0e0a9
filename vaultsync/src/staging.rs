//! Staging table layouts and the multi-row insert builder.

use crate::errors::{MigrationError, Result};
use crate::models::{EntityKey, Row, Statement, TargetType};

/// Upper bound on bound parameters in one statement (SQLite's
/// `SQLITE_MAX_VARIABLE_NUMBER` in the bundled build).
pub const MAX_STATEMENT_PARAMS: usize = 32_766;

/// Column set of a staging table, in extraction order.
pub fn staging_columns(target_type: TargetType) -> &'static [&'static str] {
    match target_type {
        TargetType::Organization => &["name", "external_reference", "source_id", "source_reference"],
        TargetType::Practitioner => &[
            "organization_id",
            "name",
            "identifier",
            "identifier_type",
            "source_id",
            "source_reference",
        ],
        TargetType::Patient => &["organization_id", "source_id", "source_reference"],
        TargetType::PatientPractitionerLink => &[
            "patient_id",
            "practitioner_id",
            "source_id",
            "source_reference",
        ],
        TargetType::ClinicalEntry => &["patient_id", "source_id"],
        TargetType::EntryAttribute => &[
            "entry_id",
            "code_system",
            "code_value",
            "text_value",
            "date_value",
            "source_id",
            "effective_date",
            "source_reference",
        ],
        TargetType::EntryState => &["entry_id", "state", "effective_date", "source_reference"],
    }
}

/// The staging relation of one entity for the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    pub table: String,
    pub columns: &'static [&'static str],
}

impl StagingLayout {
    pub fn for_entity(entity: &EntityKey) -> Self {
        Self {
            table: entity.staging_table(),
            columns: staging_columns(entity.target_type()),
        }
    }

    /// Statements that recreate the table empty. Columns are untyped and
    /// carry no constraints: staging accepts whatever the source returns.
    pub fn create_statements(&self) -> Vec<Statement> {
        vec![
            Statement::new(format!("DROP TABLE IF EXISTS {}", self.table)),
            Statement::new(format!(
                "CREATE TABLE {} ({})",
                self.table,
                self.columns.join(", ")
            )),
        ]
    }

    /// Most rows one insert statement can carry without exceeding
    /// [`MAX_STATEMENT_PARAMS`].
    pub fn rows_per_statement(&self) -> usize {
        (MAX_STATEMENT_PARAMS / self.columns.len().max(1)).max(1)
    }

    /// Builds one `INSERT ... VALUES (..), (..)` for `rows`, flattening
    /// every row into its own tuple with one numbered placeholder per value.
    pub fn insert_statement(&self, rows: &[Row]) -> Result<Statement> {
        let width = self.columns.len();
        let mut params = Vec::with_capacity(rows.len() * width);
        let mut tuples = Vec::with_capacity(rows.len());

        for row in rows {
            if row.len() != width {
                return Err(MigrationError::RowShape {
                    table: self.table.clone(),
                    expected: width,
                    found: row.len(),
                });
            }
            let mut placeholders = Vec::with_capacity(width);
            for value in row {
                params.push(value.clone());
                placeholders.push(format!("?{}", params.len()));
            }
            tuples.push(format!("({})", placeholders.join(", ")));
        }

        Ok(Statement {
            text: format!(
                "INSERT INTO {} ({}) VALUES {}",
                self.table,
                self.columns.join(", "),
                tuples.join(", ")
            ),
            params,
        })
    }
}
