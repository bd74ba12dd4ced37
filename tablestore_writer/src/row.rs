//! The row mutations accepted by the writer.
//!
//! A [`RowChange`] targets exactly one row of one table, addressed by its
//! [`PrimaryKey`]. Once handed to the writer it is wrapped in an [`Arc`] and
//! never mutated again.
//!
//! [`Arc`]: std::sync::Arc

use std::fmt::Display;

use bytes::Bytes;

/// Size accounted for an explicit column version timestamp.
const TIMESTAMP_SIZE: usize = 8;

/// The type of a primary key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimaryKeyType {
    Integer,
    String,
    Binary,
}

impl Display for PrimaryKeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer => f.write_str("integer"),
            Self::String => f.write_str("string"),
            Self::Binary => f.write_str("binary"),
        }
    }
}

/// The value of a single primary key column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PrimaryKeyValue {
    Integer(i64),
    String(String),
    Binary(Bytes),
}

impl PrimaryKeyValue {
    /// The [`PrimaryKeyType`] of this value.
    pub fn value_type(&self) -> PrimaryKeyType {
        match self {
            Self::Integer(_) => PrimaryKeyType::Integer,
            Self::String(_) => PrimaryKeyType::String,
            Self::Binary(_) => PrimaryKeyType::Binary,
        }
    }

    /// The number of bytes this value occupies on the wire.
    pub fn data_size(&self) -> usize {
        match self {
            Self::Integer(_) => 8,
            Self::String(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }
}

impl From<i64> for PrimaryKeyValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<&str> for PrimaryKeyValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for PrimaryKeyValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Bytes> for PrimaryKeyValue {
    fn from(v: Bytes) -> Self {
        Self::Binary(v)
    }
}

/// A named primary key column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrimaryKeyColumn {
    pub name: String,
    pub value: PrimaryKeyValue,
}

impl PrimaryKeyColumn {
    pub fn data_size(&self) -> usize {
        self.name.len() + self.value.data_size()
    }
}

/// The ordered set of primary key columns identifying a row.
///
/// The first column is the partition key of the row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct PrimaryKey {
    columns: Vec<PrimaryKeyColumn>,
}

impl PrimaryKey {
    /// Build a [`PrimaryKey`] from `(name, value)` pairs, in key order.
    pub fn new<N, V>(columns: impl IntoIterator<Item = (N, V)>) -> Self
    where
        N: Into<String>,
        V: Into<PrimaryKeyValue>,
    {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, value)| PrimaryKeyColumn {
                    name: name.into(),
                    value: value.into(),
                })
                .collect(),
        }
    }

    pub fn columns(&self) -> &[PrimaryKeyColumn] {
        &self.columns
    }

    /// The partition key column, if the key is non-empty.
    pub fn partition_key(&self) -> Option<&PrimaryKeyColumn> {
        self.columns.first()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn data_size(&self) -> usize {
        self.columns.iter().map(PrimaryKeyColumn::data_size).sum()
    }
}

impl Display for PrimaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[")?;
        for (i, c) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match &c.value {
                PrimaryKeyValue::Integer(v) => write!(f, "{}={v}", c.name)?,
                PrimaryKeyValue::String(v) => write!(f, "{}={v:?}", c.name)?,
                PrimaryKeyValue::Binary(v) => write!(f, "{}=<{} bytes>", c.name, v.len())?,
            }
        }
        f.write_str("]")
    }
}

/// The value of an attribute column.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Integer(i64),
    Double(f64),
    Boolean(bool),
    String(String),
    Binary(Bytes),
}

impl ColumnValue {
    pub fn data_size(&self) -> usize {
        match self {
            Self::Integer(_) | Self::Double(_) => 8,
            Self::Boolean(_) => 1,
            Self::String(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Bytes> for ColumnValue {
    fn from(v: Bytes) -> Self {
        Self::Binary(v)
    }
}

/// An attribute column with an optional explicit version timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub value: ColumnValue,
    pub timestamp: Option<i64>,
}

impl Column {
    pub fn new(name: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            timestamp: None,
        }
    }

    pub fn with_timestamp(self, timestamp: i64) -> Self {
        Self {
            timestamp: Some(timestamp),
            ..self
        }
    }

    pub fn data_size(&self) -> usize {
        self.name.len()
            + self.value.data_size()
            + self.timestamp.map(|_| TIMESTAMP_SIZE).unwrap_or_default()
    }
}

/// A single column operation within an update.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnUpdate {
    /// Write (or overwrite) the column.
    Put(Column),
    /// Delete one version of the column, or every version if no timestamp is
    /// given.
    Delete { name: String, timestamp: Option<i64> },
}

impl ColumnUpdate {
    pub fn name(&self) -> &str {
        match self {
            Self::Put(c) => &c.name,
            Self::Delete { name, .. } => name,
        }
    }

    /// The value size of a column update.
    ///
    /// For a value-less column delete operation, just the column name and
    /// version are accounted for.
    pub fn data_size(&self) -> usize {
        match self {
            Self::Put(c) => c.data_size(),
            Self::Delete { name, timestamp } => {
                name.len() + timestamp.map(|_| TIMESTAMP_SIZE).unwrap_or_default()
            }
        }
    }
}

/// The existence precondition the remote store evaluates before applying a
/// row change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RowExistenceExpectation {
    #[default]
    Ignore,
    ExpectExist,
    ExpectNotExist,
}

/// What a [`RowChange`] does to its row.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChangeKind {
    /// Replace the whole row with `columns`.
    Put { columns: Vec<Column> },
    /// Apply `updates` to the existing row, creating it if absent.
    Update { updates: Vec<ColumnUpdate> },
    /// Delete the row.
    Delete,
}

/// A change to a single row of a single table.
#[derive(Debug, Clone, PartialEq)]
pub struct RowChange {
    table_name: String,
    primary_key: PrimaryKey,
    kind: RowChangeKind,
    condition: RowExistenceExpectation,
}

impl RowChange {
    /// Construct a row put with no attribute columns.
    pub fn put(table_name: impl Into<String>, primary_key: PrimaryKey) -> Self {
        Self::new(table_name, primary_key, RowChangeKind::Put { columns: vec![] })
    }

    /// Construct a row update with no column updates.
    pub fn update(table_name: impl Into<String>, primary_key: PrimaryKey) -> Self {
        Self::new(
            table_name,
            primary_key,
            RowChangeKind::Update { updates: vec![] },
        )
    }

    /// Construct a row delete.
    pub fn delete(table_name: impl Into<String>, primary_key: PrimaryKey) -> Self {
        Self::new(table_name, primary_key, RowChangeKind::Delete)
    }

    pub fn new(
        table_name: impl Into<String>,
        primary_key: PrimaryKey,
        kind: RowChangeKind,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            primary_key,
            kind,
            condition: RowExistenceExpectation::default(),
        }
    }

    /// Add an attribute column.
    ///
    /// On a put the column is written as part of the row, on an update it
    /// becomes a [`ColumnUpdate::Put`]. Columns added to a delete are ignored.
    pub fn with_column(mut self, name: impl Into<String>, value: impl Into<ColumnValue>) -> Self {
        let column = Column::new(name, value);
        match &mut self.kind {
            RowChangeKind::Put { columns } => columns.push(column),
            RowChangeKind::Update { updates } => updates.push(ColumnUpdate::Put(column)),
            RowChangeKind::Delete => {}
        }
        self
    }

    /// Add a column delete to an update. Has no effect on other kinds.
    pub fn with_column_delete(mut self, name: impl Into<String>, timestamp: Option<i64>) -> Self {
        if let RowChangeKind::Update { updates } = &mut self.kind {
            updates.push(ColumnUpdate::Delete {
                name: name.into(),
                timestamp,
            });
        }
        self
    }

    pub fn with_condition(self, condition: RowExistenceExpectation) -> Self {
        Self { condition, ..self }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    pub fn kind(&self) -> &RowChangeKind {
        &self.kind
    }

    pub fn condition(&self) -> RowExistenceExpectation {
        self.condition
    }

    /// Names of the attribute columns this change touches, in order.
    pub fn attribute_names(&self) -> Box<dyn Iterator<Item = &str> + '_> {
        match &self.kind {
            RowChangeKind::Put { columns } => Box::new(columns.iter().map(|c| c.name.as_str())),
            RowChangeKind::Update { updates } => Box::new(updates.iter().map(|u| u.name())),
            RowChangeKind::Delete => Box::new(std::iter::empty()),
        }
    }

    /// The number of attribute columns this change touches.
    pub fn attribute_count(&self) -> usize {
        match &self.kind {
            RowChangeKind::Put { columns } => columns.len(),
            RowChangeKind::Update { updates } => updates.len(),
            RowChangeKind::Delete => 0,
        }
    }

    /// Primary key plus attribute columns.
    pub fn column_count(&self) -> usize {
        self.primary_key.len() + self.attribute_count()
    }

    /// The approximate serialised size of this change: the sum of every
    /// column's name and value size.
    pub fn data_size(&self) -> usize {
        let attributes: usize = match &self.kind {
            RowChangeKind::Put { columns } => columns.iter().map(Column::data_size).sum(),
            RowChangeKind::Update { updates } => updates.iter().map(ColumnUpdate::data_size).sum(),
            RowChangeKind::Delete => 0,
        };
        self.primary_key.data_size() + attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_size() {
        let row = RowChange::put("t", PrimaryKey::new([("pk", 42_i64)]))
            .with_column("name", "bananas")
            .with_column("on", true);

        // pk: 2 + 8, name: 4 + 7, on: 2 + 1
        assert_eq!(row.data_size(), 24);
        assert_eq!(row.attribute_count(), 2);
        assert_eq!(row.column_count(), 3);
    }

    #[test]
    fn test_update_size_accounts_for_versions() {
        let row = RowChange::update("t", PrimaryKey::new([("pk", "a")]))
            .with_column("v", 1_i64)
            .with_column_delete("old", Some(12))
            .with_column_delete("older", None);

        // pk: 2 + 1, v: 1 + 8, old: 3 + 8, older: 5
        assert_eq!(row.data_size(), 28);
        assert_eq!(
            row.attribute_names().collect::<Vec<_>>(),
            ["v", "old", "older"]
        );
    }

    #[test]
    fn test_delete_ignores_columns() {
        let row = RowChange::delete("t", PrimaryKey::new([("pk", 1_i64)])).with_column("v", 1_i64);
        assert_eq!(row.attribute_count(), 0);
        assert_eq!(row.kind(), &RowChangeKind::Delete);
    }

    #[test]
    fn test_primary_key_display() {
        let pk = PrimaryKey::new([
            ("region", PrimaryKeyValue::from("eu")),
            ("id", PrimaryKeyValue::from(7_i64)),
            ("blob", PrimaryKeyValue::from(Bytes::from_static(b"abc"))),
        ]);
        assert_eq!(pk.to_string(), r#"[region="eu", id=7, blob=<3 bytes>]"#);
        assert_eq!(pk.partition_key().map(|c| c.name.as_str()), Some("region"));
    }
}
