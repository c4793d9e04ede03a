use std::cmp::Ordering;
use std::sync::Arc;

use logscope_types::LogItem;

use super::expr::Field;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

/// Order of a query result: one field plus direction
///
/// Ties are always broken by ascending item id, so the order is total and
/// paging through a static result never repeats or skips rows.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SortSpec {
    pub field: Field,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn new(field: Field, direction: SortDirection) -> Self {
        Self { field, direction }
    }

    pub fn ascending(field: Field) -> Self {
        Self::new(field, SortDirection::Ascending)
    }

    pub fn descending(field: Field) -> Self {
        Self::new(field, SortDirection::Descending)
    }

    /// Sort items in place
    pub fn sort(&self, items: &mut Vec<Arc<LogItem>>) {
        if self.field == Field::Id {
            // Ids are unique, no key extraction needed
            match self.direction {
                SortDirection::Ascending => items.sort_unstable_by_key(|i| i.id),
                SortDirection::Descending => items.sort_unstable_by(|a, b| b.id.cmp(&a.id)),
            }
            return;
        }

        let mut keyed: Vec<_> = items
            .iter()
            .enumerate()
            .map(|(n, item)| (self.field.project(item), item.id, n))
            .collect();
        keyed.sort_unstable_by(|(a, a_id, _), (b, b_id, _)| {
            let ordering = match self.direction {
                SortDirection::Ascending => a.total_cmp(b),
                SortDirection::Descending => b.total_cmp(a),
            };
            ordering.then(a_id.cmp(b_id))
        });

        let sorted: Vec<_> = keyed.iter().map(|(_, _, n)| Arc::clone(&items[*n])).collect();
        drop(keyed);
        *items = sorted;
    }

    /// Compare two items under this order
    pub fn compare(&self, a: &LogItem, b: &LogItem) -> Ordering {
        let (ka, kb) = (self.field.project(a), self.field.project(b));
        let ordering = match self.direction {
            SortDirection::Ascending => ka.total_cmp(&kb),
            SortDirection::Descending => kb.total_cmp(&ka),
        };
        ordering.then(a.id.cmp(&b.id))
    }
}

impl Default for SortSpec {
    /// Ascending timestamp
    fn default() -> Self {
        Self::ascending(Field::Timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Projection;
    use chrono::{TimeZone, Utc};
    use logscope_types::{FileId, LogEvent, LogLevel, PropertyValue, ScalarValue};

    fn item(id: u64, secs: i64, count: Option<i64>) -> Arc<LogItem> {
        let mut event = LogEvent::new(Utc.timestamp_opt(secs, 0).unwrap(), LogLevel::Information, "x");
        if let Some(count) = count {
            event = event.with_property("Count", PropertyValue::Scalar(ScalarValue::Int(count)));
        }
        Arc::new(LogItem::new(id, FileId(0), event))
    }

    fn ids(items: &[Arc<LogItem>]) -> Vec<u64> {
        items.iter().map(|i| i.id).collect()
    }

    #[test]
    fn test_ties_broken_by_id() {
        let mut items = vec![item(3, 10, None), item(1, 10, None), item(2, 5, None), item(0, 10, None)];
        SortSpec::default().sort(&mut items);
        assert_eq!(ids(&items), vec![2, 0, 1, 3]);

        SortSpec::descending(Field::Timestamp).sort(&mut items);
        assert_eq!(ids(&items), vec![0, 1, 3, 2]);
    }

    #[test]
    fn test_nulls_sort_first() {
        let mut items = vec![item(0, 0, Some(5)), item(1, 0, None), item(2, 0, Some(-1))];
        SortSpec::ascending(Field::property("Count", Projection::Integer)).sort(&mut items);
        assert_eq!(ids(&items), vec![1, 2, 0]);
    }

    #[test]
    fn test_compare_matches_sort() {
        let spec = SortSpec::descending(Field::Timestamp);
        let (a, b) = (item(0, 1, None), item(1, 2, None));
        assert_eq!(spec.compare(&a, &b), Ordering::Greater);
    }
}
