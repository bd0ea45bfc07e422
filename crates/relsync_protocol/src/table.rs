//! Table definitions.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::Timestamp;
use crate::value::{ColumnValue, PrimaryKey, Row};
use serde::{Deserialize, Serialize};

/// Checks that `name` is a plain identifier (`[A-Za-z0-9_]+`).
///
/// Table and column names are interpolated into SQL by store adapters, so
/// anything else is rejected when configuration is loaded.
pub fn validate_identifier(name: &str) -> ProtocolResult<()> {
    if !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        Ok(())
    } else {
        Err(ProtocolError::InvalidIdentifier(name.to_string()))
    }
}

/// How changes are detected for a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeDetection {
    /// Rows carry a monotonically increasing version or timestamp column.
    VersionColumn(String),
    /// Rows are compared by content hash against the last synced hash.
    ContentHash,
}

/// Defines how one table is synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Table name.
    pub name: String,
    /// Primary key columns, in key order.
    pub primary_key: Vec<String>,
    /// Change detection strategy.
    pub detection: ChangeDetection,
    /// Resolver policy override for this table.
    pub resolver: Option<String>,
}

impl TableSpec {
    /// Creates a spec that detects changes through a version column.
    pub fn versioned(
        name: impl Into<String>,
        primary_key: &[&str],
        version_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            detection: ChangeDetection::VersionColumn(version_column.into()),
            resolver: None,
        }
    }

    /// Creates a spec that detects changes by content hash.
    pub fn hashed(name: impl Into<String>, primary_key: &[&str]) -> Self {
        Self {
            name: name.into(),
            primary_key: primary_key.iter().map(|c| c.to_string()).collect(),
            detection: ChangeDetection::ContentHash,
            resolver: None,
        }
    }

    /// Sets a per-table resolver override.
    pub fn with_resolver(mut self, resolver: impl Into<String>) -> Self {
        self.resolver = Some(resolver.into());
        self
    }

    /// Returns the version column, if any.
    pub fn version_column(&self) -> Option<&str> {
        match &self.detection {
            ChangeDetection::VersionColumn(column) => Some(column),
            ChangeDetection::ContentHash => None,
        }
    }

    /// Validates every identifier in the spec.
    pub fn validate(&self) -> ProtocolResult<()> {
        validate_identifier(&self.name)?;
        if self.primary_key.is_empty() {
            return Err(ProtocolError::MissingColumn {
                table: self.name.clone(),
                column: "<primary key>".into(),
            });
        }
        for column in &self.primary_key {
            validate_identifier(column)?;
        }
        if let Some(column) = self.version_column() {
            validate_identifier(column)?;
        }
        Ok(())
    }

    /// Extracts the primary key of a row.
    pub fn primary_key_of(&self, row: &Row) -> ProtocolResult<PrimaryKey> {
        self.primary_key
            .iter()
            .map(|column| {
                row.get(column)
                    .cloned()
                    .ok_or_else(|| ProtocolError::MissingColumn {
                        table: self.name.clone(),
                        column: column.clone(),
                    })
            })
            .collect::<ProtocolResult<Vec<ColumnValue>>>()
            .map(PrimaryKey)
    }

    /// Reads the version column of a row.
    ///
    /// Returns `Ok(None)` for content-hash tables.
    pub fn version_of(&self, row: &Row) -> ProtocolResult<Option<Timestamp>> {
        let Some(column) = self.version_column() else {
            return Ok(None);
        };
        match row.get(column) {
            Some(ColumnValue::Integer(v)) => Ok(Some(*v)),
            Some(_) => Err(ProtocolError::InvalidVersion {
                table: self.name.clone(),
                column: column.to_string(),
            }),
            None => Err(ProtocolError::MissingColumn {
                table: self.name.clone(),
                column: column.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(validate_identifier("scripts").is_ok());
        assert!(validate_identifier("audit_log_2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("bad name").is_err());
        assert!(validate_identifier("x\"; DROP TABLE y; --").is_err());
    }

    #[test]
    fn spec_validation() {
        assert!(TableSpec::versioned("t", &["id"], "updated_at").validate().is_ok());
        assert!(TableSpec::hashed("t", &[]).validate().is_err());
        assert!(TableSpec::versioned("t", &["id"], "up-dated").validate().is_err());
    }

    #[test]
    fn key_and_version_extraction() {
        let spec = TableSpec::versioned("t", &["a", "b"], "v");
        let mut row = Row::new();
        row.insert("a".into(), ColumnValue::Integer(1));
        row.insert("b".into(), ColumnValue::Text("x".into()));
        row.insert("v".into(), ColumnValue::Integer(42));

        let key = spec.primary_key_of(&row).unwrap();
        assert_eq!(key.parts().len(), 2);
        assert_eq!(spec.version_of(&row).unwrap(), Some(42));

        row.insert("v".into(), ColumnValue::Text("late".into()));
        assert!(matches!(
            spec.version_of(&row),
            Err(ProtocolError::InvalidVersion { .. })
        ));

        row.remove("b");
        assert!(matches!(
            spec.primary_key_of(&row),
            Err(ProtocolError::MissingColumn { .. })
        ));
    }

    #[test]
    fn hashed_tables_have_no_version() {
        let spec = TableSpec::hashed("t", &["id"]);
        assert_eq!(spec.version_of(&Row::new()).unwrap(), None);
    }
}
