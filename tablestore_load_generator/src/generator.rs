//! Random row changes for driving a writer.

use rand::{Rng, RngCore, distributions::Alphanumeric};
use tablestore_writer::{ColumnValue, PrimaryKey, PrimaryKeyValue, RowChange};

/// Number of distinct partition key values rows are spread over.
const PARTITIONS: u64 = 16;

/// The shape of the rows a producer generates.
#[derive(Debug, Clone)]
pub(crate) struct RowGenerator {
    table: String,
    key_cardinality: u64,
    attribute_columns: usize,
    value_size: usize,
    update_ratio: f64,
    delete_ratio: f64,
}

impl RowGenerator {
    pub(crate) fn new(
        table: impl Into<String>,
        key_cardinality: u64,
        attribute_columns: usize,
        value_size: usize,
    ) -> Self {
        Self {
            table: table.into(),
            key_cardinality: key_cardinality.max(1),
            attribute_columns,
            value_size,
            update_ratio: 0.0,
            delete_ratio: 0.0,
        }
    }

    /// Generate updates and deletes alongside puts. Whatever the two ratios
    /// leave over is puts.
    pub(crate) fn with_mix(self, update_ratio: f64, delete_ratio: f64) -> Self {
        Self {
            update_ratio: update_ratio.clamp(0.0, 1.0),
            delete_ratio: delete_ratio.clamp(0.0, 1.0 - update_ratio.clamp(0.0, 1.0)),
            ..self
        }
    }

    pub(crate) fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn next_row(&self, rng: &mut impl RngCore) -> RowChange {
        let id = rng.gen_range(0..self.key_cardinality);
        let primary_key = PrimaryKey::new([
            ("partition", PrimaryKeyValue::from(format!("p{:02}", id % PARTITIONS))),
            ("id", PrimaryKeyValue::Integer(id as i64)),
        ]);

        let roll: f64 = rng.r#gen();
        if roll < self.delete_ratio {
            return RowChange::delete(&self.table, primary_key);
        }

        if roll < self.delete_ratio + self.update_ratio {
            let mut row = RowChange::update(&self.table, primary_key)
                .with_column("updated", rng.r#gen::<bool>());
            for i in 0..self.attribute_columns {
                if rng.r#gen::<bool>() {
                    row = row.with_column(format!("col{i}"), self.value(i, rng));
                } else {
                    row = row.with_column_delete(format!("col{i}"), None);
                }
            }
            return row;
        }

        let mut row = RowChange::put(&self.table, primary_key);
        for i in 0..self.attribute_columns {
            row = row.with_column(format!("col{i}"), self.value(i, rng));
        }
        row
    }

    fn value(&self, column: usize, rng: &mut impl RngCore) -> ColumnValue {
        match column % 3 {
            0 => rng.gen_range(0..i64::MAX).into(),
            1 => rng.r#gen::<f64>().into(),
            _ => rng
                .sample_iter(&Alphanumeric)
                .take(self.value_size)
                .map(char::from)
                .collect::<String>()
                .into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};
    use tablestore_writer::{
        RowChangeKind, WriterConfig,
        validator::{RowLimits, RowValidator},
    };

    use super::*;

    #[test]
    fn test_puts_only_by_default() {
        let generator = RowGenerator::new("load", 10, 3, 8);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let row = generator.next_row(&mut rng);
            assert_eq!(row.table_name(), "load");
            assert!(matches!(row.kind(), RowChangeKind::Put { .. }));
            assert_eq!(row.attribute_count(), 3);
        }
    }

    #[test]
    fn test_mix_produces_valid_rows() {
        let generator = RowGenerator::new("load", 10, 4, 8).with_mix(0.3, 0.3);
        let validator = RowValidator::new(RowLimits::from(&WriterConfig::default()), []);
        let mut rng = StdRng::seed_from_u64(7);

        let mut kinds = [0_usize; 3];
        for _ in 0..1_000 {
            let row = generator.next_row(&mut rng);
            validator.validate(&row).unwrap();
            match row.kind() {
                RowChangeKind::Put { .. } => kinds[0] += 1,
                RowChangeKind::Update { .. } => kinds[1] += 1,
                RowChangeKind::Delete => kinds[2] += 1,
            }
        }
        assert!(kinds.iter().all(|&n| n > 0), "{kinds:?}");
    }
}
