//! Clustering-key model: the ordered set of columns by which a stage's output
//! is sorted and/or partitioned for a downstream consumer.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Sort direction for one clustering-key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// One column of a clustering key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyColumn {
    pub name: String,
    pub direction: SortDirection,
}

impl KeyColumn {
    pub fn ascending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// Ordered clustering key for a stage's output.
///
/// The first `bucket_by_count` columns only group rows into buckets; sorting
/// applies to the remaining columns. A key is sortable when at least one
/// column past the bucketing prefix exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterBy {
    columns: Vec<KeyColumn>,
    bucket_by_count: usize,
}

impl ClusterBy {
    pub fn new(columns: Vec<KeyColumn>, bucket_by_count: usize) -> Self {
        debug_assert!(bucket_by_count <= columns.len());
        Self {
            columns,
            bucket_by_count,
        }
    }

    /// Key with no columns at all. Not sortable; shuffles degrade to mixing.
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            bucket_by_count: 0,
        }
    }

    pub fn columns(&self) -> &[KeyColumn] {
        &self.columns
    }

    pub fn bucket_by_count(&self) -> usize {
        self.bucket_by_count
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Whether output can be meaningfully sorted by this key.
    pub fn sortable(&self) -> bool {
        self.bucket_by_count < self.columns.len()
    }

    /// Compare two key rows column-by-column, honoring per-column direction.
    ///
    /// Rows shorter than the key compare as if padded with nulls.
    pub fn compare(&self, a: &KeyRow, b: &KeyRow) -> Ordering {
        for (i, col) in self.columns.iter().enumerate() {
            let left = a.values().get(i).unwrap_or(&KeyValue::Null);
            let right = b.values().get(i).unwrap_or(&KeyValue::Null);
            let ord = match col.direction {
                SortDirection::Ascending => left.cmp(right),
                SortDirection::Descending => right.cmp(left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// One scalar value of a clustering-key row.
///
/// Values have a total order so key rows can back boundary computation:
/// null sorts first, then integers, then floats, then strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyValue {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
}

impl KeyValue {
    fn type_rank(&self) -> u8 {
        match self {
            KeyValue::Null => 0,
            KeyValue::Int(_) => 1,
            KeyValue::Float(_) => 2,
            KeyValue::Str(_) => 3,
        }
    }

    /// Approximate retained size, used for sketch byte accounting.
    pub fn estimated_bytes(&self) -> usize {
        match self {
            KeyValue::Null => 1,
            KeyValue::Int(_) => 8,
            KeyValue::Float(_) => 8,
            KeyValue::Str(s) => s.len(),
        }
    }
}

impl PartialEq for KeyValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyValue {}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Null, KeyValue::Null) => Ordering::Equal,
            (KeyValue::Int(a), KeyValue::Int(b)) => a.cmp(b),
            (KeyValue::Float(a), KeyValue::Float(b)) => a.total_cmp(b),
            (KeyValue::Str(a), KeyValue::Str(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

/// One observed clustering-key row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyRow(Vec<KeyValue>);

impl KeyRow {
    pub fn new(values: Vec<KeyValue>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[KeyValue] {
        &self.0
    }

    /// Approximate retained size, used for sketch byte accounting.
    pub fn estimated_bytes(&self) -> usize {
        // Vec header plus per-value payloads.
        24 + self.0.iter().map(KeyValue::estimated_bytes).sum::<usize>()
    }
}

impl From<Vec<KeyValue>> for KeyRow {
    fn from(values: Vec<KeyValue>) -> Self {
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(v: i64) -> KeyRow {
        KeyRow::new(vec![KeyValue::Int(v)])
    }

    #[test]
    fn empty_key_is_not_sortable() {
        let key = ClusterBy::empty();
        assert!(key.is_empty());
        assert!(!key.sortable());
    }

    #[test]
    fn bucket_only_key_is_not_sortable() {
        let key = ClusterBy::new(vec![KeyColumn::ascending("k")], 1);
        assert!(!key.is_empty());
        assert!(!key.sortable());
    }

    #[test]
    fn compare_honors_descending_direction() {
        let asc = ClusterBy::new(vec![KeyColumn::ascending("k")], 0);
        let desc = ClusterBy::new(vec![KeyColumn::descending("k")], 0);
        assert_eq!(asc.compare(&row(1), &row(2)), Ordering::Less);
        assert_eq!(desc.compare(&row(1), &row(2)), Ordering::Greater);
    }

    #[test]
    fn compare_breaks_ties_on_later_columns() {
        let key = ClusterBy::new(
            vec![KeyColumn::ascending("a"), KeyColumn::ascending("b")],
            0,
        );
        let ab = KeyRow::new(vec![KeyValue::Int(1), KeyValue::Str("x".to_string())]);
        let ac = KeyRow::new(vec![KeyValue::Int(1), KeyValue::Str("y".to_string())]);
        assert_eq!(key.compare(&ab, &ac), Ordering::Less);
        assert_eq!(key.compare(&ab, &ab), Ordering::Equal);
    }

    #[test]
    fn null_sorts_before_values() {
        assert!(KeyValue::Null < KeyValue::Int(i64::MIN));
        assert!(KeyValue::Int(i64::MAX) < KeyValue::Float(f64::NEG_INFINITY));
    }
}
