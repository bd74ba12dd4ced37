//! Synchronous admission checks applied to every row before it enters a
//! bucket.
//!
//! A row rejected here is "dirty": it is reported straight back to the caller
//! and never reaches a bucket, a batch, or the result callback.

use hashbrown::HashMap;

use crate::{
    config::WriterConfig,
    row::{ColumnUpdate, PrimaryKeyType, RowChange, RowChangeKind},
};

/// The reason a row was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("table name must not be empty")]
    EmptyTableName,

    #[error("row for table '{table}' has no primary key columns")]
    MissingPrimaryKey { table: String },

    #[error("column names must not be empty")]
    EmptyColumnName,

    #[error("update for table '{table}' contains no column updates")]
    EmptyUpdate { table: String },

    #[error("row has {count} attribute columns, more than the limit of {max}")]
    TooManyAttributeColumns { count: usize, max: usize },

    #[error("attribute column '{column}' is {size} bytes, more than the limit of {max}")]
    AttributeColumnTooLarge {
        column: String,
        size: usize,
        max: usize,
    },

    #[error("primary key column '{column}' is {size} bytes, more than the limit of {max}")]
    PrimaryKeyColumnTooLarge {
        column: String,
        size: usize,
        max: usize,
    },

    #[error("row is {size} bytes, more than the batch limit of {max}")]
    RowTooLarge { size: usize, max: usize },

    #[error("attribute column '{column}' has the same name as a primary key column")]
    ColumnNameCollision { column: String },

    #[error("no schema is registered for table '{table}'")]
    UnknownTable { table: String },

    #[error("primary key of table '{table}' does not match its schema: {reason}")]
    SchemaMismatch { table: String, reason: String },
}

/// A snapshot of a table's primary key layout, captured when the writer is
/// built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    table_name: String,
    primary_key: Vec<(String, PrimaryKeyType)>,
}

impl TableSchema {
    pub fn new<N>(
        table_name: impl Into<String>,
        primary_key: impl IntoIterator<Item = (N, PrimaryKeyType)>,
    ) -> Self
    where
        N: Into<String>,
    {
        Self {
            table_name: table_name.into(),
            primary_key: primary_key
                .into_iter()
                .map(|(n, t)| (n.into(), t))
                .collect(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn primary_key(&self) -> &[(String, PrimaryKeyType)] {
        &self.primary_key
    }

    fn check(&self, row: &RowChange) -> Result<(), String> {
        let got = row.primary_key().columns();
        if got.len() != self.primary_key.len() {
            return Err(format!(
                "expected {} primary key columns, got {}",
                self.primary_key.len(),
                got.len()
            ));
        }

        for ((want_name, want_type), got) in self.primary_key.iter().zip(got) {
            if *want_name != got.name {
                return Err(format!(
                    "expected primary key column '{want_name}', got '{}'",
                    got.name
                ));
            }
            if *want_type != got.value.value_type() {
                return Err(format!(
                    "primary key column '{want_name}' should be {want_type}, got {}",
                    got.value.value_type()
                ));
            }
        }

        Ok(())
    }
}

/// Size and count limits a single row must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLimits {
    pub max_attribute_columns: usize,
    pub max_attribute_column_size: usize,
    pub max_primary_key_column_size: usize,
    pub max_row_size: usize,
}

impl From<&WriterConfig> for RowLimits {
    fn from(config: &WriterConfig) -> Self {
        Self {
            max_attribute_columns: config.max_attribute_columns,
            max_attribute_column_size: config.max_attribute_column_size,
            max_primary_key_column_size: config.max_primary_key_column_size,
            max_row_size: config.max_batch_bytes,
        }
    }
}

/// Validates rows against the configured [`RowLimits`] and any registered
/// [`TableSchema`].
///
/// When no schema is registered every table name is accepted. Once at least
/// one schema is registered, rows for other tables are rejected.
#[derive(Debug, Clone)]
pub struct RowValidator {
    limits: RowLimits,
    schemas: HashMap<String, TableSchema>,
}

impl RowValidator {
    pub fn new(limits: RowLimits, schemas: impl IntoIterator<Item = TableSchema>) -> Self {
        Self {
            limits,
            schemas: schemas
                .into_iter()
                .map(|s| (s.table_name.clone(), s))
                .collect(),
        }
    }

    pub fn limits(&self) -> RowLimits {
        self.limits
    }

    /// Accept `row`, or return the first reason it cannot be written.
    pub fn validate(&self, row: &RowChange) -> Result<(), ValidationError> {
        let table = row.table_name();
        if table.is_empty() {
            return Err(ValidationError::EmptyTableName);
        }

        let pk = row.primary_key();
        if pk.is_empty() {
            return Err(ValidationError::MissingPrimaryKey {
                table: table.to_string(),
            });
        }

        if !self.schemas.is_empty() {
            let schema = self
                .schemas
                .get(table)
                .ok_or_else(|| ValidationError::UnknownTable {
                    table: table.to_string(),
                })?;
            schema
                .check(row)
                .map_err(|reason| ValidationError::SchemaMismatch {
                    table: table.to_string(),
                    reason,
                })?;
        }

        for c in pk.columns() {
            if c.name.is_empty() {
                return Err(ValidationError::EmptyColumnName);
            }
            let size = c.value.data_size();
            if size > self.limits.max_primary_key_column_size {
                return Err(ValidationError::PrimaryKeyColumnTooLarge {
                    column: c.name.clone(),
                    size,
                    max: self.limits.max_primary_key_column_size,
                });
            }
        }

        let count = row.attribute_count();
        if count > self.limits.max_attribute_columns {
            return Err(ValidationError::TooManyAttributeColumns {
                count,
                max: self.limits.max_attribute_columns,
            });
        }

        match row.kind() {
            RowChangeKind::Put { columns } => {
                for c in columns {
                    self.check_attribute(row, &c.name, c.value.data_size())?;
                }
            }
            RowChangeKind::Update { updates } => {
                if updates.is_empty() {
                    return Err(ValidationError::EmptyUpdate {
                        table: table.to_string(),
                    });
                }
                for u in updates {
                    let size = match u {
                        ColumnUpdate::Put(c) => c.value.data_size(),
                        ColumnUpdate::Delete { .. } => 0,
                    };
                    self.check_attribute(row, u.name(), size)?;
                }
            }
            RowChangeKind::Delete => {}
        }

        let size = row.data_size();
        if size > self.limits.max_row_size {
            return Err(ValidationError::RowTooLarge {
                size,
                max: self.limits.max_row_size,
            });
        }

        Ok(())
    }

    fn check_attribute(
        &self,
        row: &RowChange,
        name: &str,
        value_size: usize,
    ) -> Result<(), ValidationError> {
        if name.is_empty() {
            return Err(ValidationError::EmptyColumnName);
        }
        if row.primary_key().contains_column(name) {
            return Err(ValidationError::ColumnNameCollision {
                column: name.to_string(),
            });
        }
        if value_size > self.limits.max_attribute_column_size {
            return Err(ValidationError::AttributeColumnTooLarge {
                column: name.to_string(),
                size: value_size,
                max: self.limits.max_attribute_column_size,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::row::PrimaryKey;

    fn limits() -> RowLimits {
        RowLimits {
            max_attribute_columns: 3,
            max_attribute_column_size: 16,
            max_primary_key_column_size: 8,
            max_row_size: 64,
        }
    }

    fn validator() -> RowValidator {
        RowValidator::new(limits(), [])
    }

    fn pk(id: i64) -> PrimaryKey {
        PrimaryKey::new([("id", id)])
    }

    #[test]
    fn test_accepts_valid_rows() {
        let v = validator();
        v.validate(&RowChange::put("t", pk(1)).with_column("a", 1_i64))
            .unwrap();
        v.validate(&RowChange::update("t", pk(1)).with_column_delete("a", None))
            .unwrap();
        v.validate(&RowChange::delete("t", pk(1))).unwrap();
    }

    #[test]
    fn test_empty_table_and_key() {
        let v = validator();
        assert_matches!(
            v.validate(&RowChange::put("", pk(1))),
            Err(ValidationError::EmptyTableName)
        );
        assert_matches!(
            v.validate(&RowChange::put("t", PrimaryKey::default())),
            Err(ValidationError::MissingPrimaryKey { table }) if table == "t"
        );
    }

    #[test]
    fn test_too_many_attribute_columns() {
        let row = (0..4).fold(RowChange::put("t", pk(1)), |row, i| {
            row.with_column(format!("c{i}"), i as i64)
        });
        assert_matches!(
            validator().validate(&row),
            Err(ValidationError::TooManyAttributeColumns { count: 4, max: 3 })
        );
    }

    #[test]
    fn test_oversized_columns() {
        let v = validator();
        assert_matches!(
            v.validate(&RowChange::put("t", pk(1)).with_column("a", "x".repeat(17))),
            Err(ValidationError::AttributeColumnTooLarge { column, size: 17, max: 16 }) if column == "a"
        );
        assert_matches!(
            v.validate(&RowChange::put("t", PrimaryKey::new([("id", "123456789")]))),
            Err(ValidationError::PrimaryKeyColumnTooLarge { size: 9, max: 8, .. })
        );
    }

    #[test]
    fn test_row_too_large() {
        let row = RowChange::put("t", pk(1))
            .with_column("aaaaaaaaaaaaaaaa", "x".repeat(16))
            .with_column("bbbbbbbbbbbbbbbb", "x".repeat(16));
        // pk: 2 + 8, columns: 2 * (16 + 16)
        assert_matches!(
            validator().validate(&row),
            Err(ValidationError::RowTooLarge { size: 74, max: 64 })
        );
    }

    #[test]
    fn test_column_collides_with_primary_key() {
        assert_matches!(
            validator().validate(&RowChange::put("t", pk(1)).with_column("id", 2_i64)),
            Err(ValidationError::ColumnNameCollision { column }) if column == "id"
        );
        assert_matches!(
            validator().validate(&RowChange::update("t", pk(1)).with_column_delete("id", None)),
            Err(ValidationError::ColumnNameCollision { .. })
        );
    }

    #[test]
    fn test_empty_update_and_names() {
        let v = validator();
        assert_matches!(
            v.validate(&RowChange::update("t", pk(1))),
            Err(ValidationError::EmptyUpdate { .. })
        );
        assert_matches!(
            v.validate(&RowChange::put("t", pk(1)).with_column("", 1_i64)),
            Err(ValidationError::EmptyColumnName)
        );
    }

    #[test]
    fn test_schema_checks() {
        let v = RowValidator::new(
            limits(),
            [TableSchema::new(
                "orders",
                [("region", PrimaryKeyType::String), ("id", PrimaryKeyType::Integer)],
            )],
        );

        v.validate(&RowChange::put(
            "orders",
            PrimaryKey::new([
                ("region", crate::row::PrimaryKeyValue::from("eu")),
                ("id", crate::row::PrimaryKeyValue::from(1_i64)),
            ]),
        ))
        .unwrap();

        assert_matches!(
            v.validate(&RowChange::put("users", pk(1))),
            Err(ValidationError::UnknownTable { table }) if table == "users"
        );
        assert_matches!(
            v.validate(&RowChange::put("orders", pk(1))),
            Err(ValidationError::SchemaMismatch { .. })
        );
        assert_matches!(
            v.validate(&RowChange::put(
                "orders",
                PrimaryKey::new([("region", 1_i64), ("id", 1_i64)])
            )),
            Err(ValidationError::SchemaMismatch { reason, .. }) if reason.contains("should be string")
        );
    }
}
