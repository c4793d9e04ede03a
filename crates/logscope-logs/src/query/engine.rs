use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use logscope_types::LogItem;

use crate::context::{ContextId, ContextSlot, ContextState, View};
use crate::error::{EngineError, Result};
use crate::store::{CANCEL_CHECK_INTERVAL, LogStore};

use super::expr::Expr;
use super::sort::SortSpec;

/// Parameters of a paged query
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryRequest {
    pub skip: usize,
    /// `None` returns everything after `skip`
    pub take: Option<usize>,
    /// `None` means ascending timestamp
    pub sort: Option<SortSpec>,
    /// `None` matches every item
    pub filter: Option<Expr>,
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub fn take(mut self, take: usize) -> Self {
        self.take = Some(take);
        self
    }

    pub fn sort(mut self, sort: SortSpec) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn filter(mut self, filter: Option<Expr>) -> Self {
        self.filter = filter;
        self
    }
}

/// One page of a query result
#[derive(Clone, Debug)]
pub struct QueryPage {
    pub items: Vec<Arc<LogItem>>,
    /// Number of items matching the filter, regardless of paging
    pub total_count: usize,
}

impl LogStore {
    /// Filter, sort and page the store through a view context
    ///
    /// The filtered count is recomputed only when the filter differs from the
    /// context's previous query or a store mutation marked the context stale.
    pub fn query(
        &self,
        request: &QueryRequest,
        context: ContextId,
        cancel: &CancellationToken,
    ) -> Result<QueryPage> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let slot = self.contexts().slot(context)?;
        let mut state = slot.state.lock();
        let sort = request.sort.clone().unwrap_or_default();
        self.refresh_view(&slot, &mut state, request.filter.as_ref(), sort, cancel)?;

        let Some(view) = state.view.as_ref() else {
            return Err(EngineError::Cancelled);
        };
        let total_count = view.items.len();
        let items = view
            .items
            .iter()
            .skip(request.skip)
            .take(request.take.unwrap_or(usize::MAX))
            .cloned()
            .collect();

        Ok(QueryPage { items, total_count })
    }

    /// Item at a position of the context's current view
    pub fn find_by_index(&self, index: usize, context: ContextId) -> Result<Option<Arc<LogItem>>> {
        self.with_view(context, |view| view.items.get(index).cloned())
    }

    /// Locate an item by id in the context's current view
    ///
    /// If the id is not in the view and `exact` is false, falls back to the
    /// item nearest to `timestamp`.
    pub fn find_by_id_and_timestamp(
        &self,
        id: u64,
        timestamp: DateTime<Utc>,
        exact: bool,
        context: ContextId,
    ) -> Result<Option<(usize, Arc<LogItem>)>> {
        self.with_view(context, |view| {
            if let Some(found) = view
                .items
                .iter()
                .position(|item| item.id == id)
                .map(|n| (n, Arc::clone(&view.items[n])))
            {
                return Some(found);
            }
            if exact { None } else { nearest(view, timestamp) }
        })
    }

    /// Locate an item by timestamp in the context's current view
    ///
    /// With `exact`, only an item with exactly this timestamp matches (the one
    /// with the lowest id if several do); otherwise the item with the smallest
    /// distance to `timestamp` is returned, ties broken by lower id.
    pub fn find_by_timestamp(
        &self,
        timestamp: DateTime<Utc>,
        exact: bool,
        context: ContextId,
    ) -> Result<Option<(usize, Arc<LogItem>)>> {
        self.with_view(context, |view| {
            if exact {
                view.items
                    .iter()
                    .enumerate()
                    .filter(|(_, item)| item.timestamp() == timestamp)
                    .min_by_key(|(_, item)| item.id)
                    .map(|(n, item)| (n, Arc::clone(item)))
            } else {
                nearest(view, timestamp)
            }
        })
    }

    /// Run `f` against the context's view, rebuilding it with the last used
    /// filter and sort if a mutation made it stale
    fn with_view<T>(&self, context: ContextId, f: impl FnOnce(&View) -> Option<T>) -> Result<Option<T>> {
        let slot = self.contexts().slot(context)?;
        let mut state = slot.state.lock();
        let filter = state.filter.clone();
        let sort = state.sort.clone();
        self.refresh_view(&slot, &mut state, filter.as_ref(), sort, &CancellationToken::new())?;
        Ok(state.view.as_ref().and_then(f))
    }

    fn refresh_view(
        &self,
        slot: &ContextSlot,
        state: &mut ContextState,
        filter: Option<&Expr>,
        sort: SortSpec,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let stale = slot.take_stale();
        if stale || state.view.is_none() || state.filter.as_ref() != filter {
            state.filter = filter.cloned();
            state.view = None;

            let items = self.filtered_items(filter, cancel)?;
            slot.record_recount();
            trace!(count = items.len(), stale, "Recomputed filtered count");
            state.view = Some(View {
                items,
                sorted_by: None,
            });
        }

        state.sort = sort;
        if let Some(view) = state.view.as_mut()
            && view.sorted_by.as_ref() != Some(&state.sort)
        {
            state.sort.sort(&mut view.items);
            view.sorted_by = Some(state.sort.clone());
        }
        Ok(())
    }

    fn filtered_items(&self, filter: Option<&Expr>, cancel: &CancellationToken) -> Result<Vec<Arc<LogItem>>> {
        let inner = self.read();
        let Some(filter) = filter else {
            return Ok(inner.items.clone());
        };

        let mut items = Vec::new();
        for (n, item) in inner.items.iter().enumerate() {
            if n % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if filter.matches(item) {
                items.push(Arc::clone(item));
            }
        }
        Ok(items)
    }
}

fn nearest(view: &View, timestamp: DateTime<Utc>) -> Option<(usize, Arc<LogItem>)> {
    view.items
        .iter()
        .enumerate()
        .min_by_key(|(_, item)| ((item.timestamp() - timestamp).abs(), item.id))
        .map(|(n, item)| (n, Arc::clone(item)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{CompareOp, Field, Literal, Projection, parse_filter};
    use chrono::TimeZone;
    use logscope_types::{LogEvent, LogLevel, PropertyValue};
    use std::path::Path;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn store_with(events: &[(i64, LogLevel, &str)]) -> LogStore {
        let store = LogStore::new();
        let file = store.register_file(Path::new("a.clef"));
        for (secs, level, app) in events {
            store.append(
                file,
                LogEvent::new(ts(*secs), *level, "m").with_property("App", PropertyValue::string(*app)),
            );
        }
        store
    }

    fn sample() -> LogStore {
        store_with(&[
            (30, LogLevel::Error, "A"),
            (10, LogLevel::Information, "B"),
            (20, LogLevel::Warning, "A"),
            (10, LogLevel::Debug, "A"),
            (40, LogLevel::Error, "B"),
        ])
    }

    fn ids(page: &QueryPage) -> Vec<u64> {
        page.items.iter().map(|i| i.id).collect()
    }

    #[test]
    fn test_default_sort_is_timestamp_then_id() {
        let store = sample();
        let ctx = store.open_context();
        let page = store.query(&QueryRequest::new(), ctx, &CancellationToken::new()).unwrap();
        assert_eq!(ids(&page), vec![1, 3, 2, 0, 4]);
        assert_eq!(page.total_count, 5);
    }

    #[test]
    fn test_filter_and_paging() {
        let store = sample();
        let ctx = store.open_context();
        let filter = parse_filter(r#"it["s:App"] == "A""#).unwrap();
        let cancel = CancellationToken::new();

        let page = store
            .query(&QueryRequest::new().filter(filter.clone()).skip(1).take(1), ctx, &cancel)
            .unwrap();
        assert_eq!(ids(&page), vec![2]);
        assert_eq!(page.total_count, 3);

        let past_end = store
            .query(&QueryRequest::new().filter(filter).skip(10).take(5), ctx, &cancel)
            .unwrap();
        assert!(past_end.items.is_empty());
        assert_eq!(past_end.total_count, 3);
    }

    #[test]
    fn test_paging_reproduces_total_order() {
        let store = store_with(&[(5, LogLevel::Debug, "A"); 23]);
        let ctx = store.open_context();
        let cancel = CancellationToken::new();
        let sort = SortSpec::descending(Field::Level);

        let mut seen = Vec::new();
        for k in 0..6 {
            let page = store
                .query(&QueryRequest::new().sort(sort.clone()).skip(k * 4).take(4), ctx, &cancel)
                .unwrap();
            seen.extend(ids(&page));
        }
        assert_eq!(seen, (0..23).collect::<Vec<_>>());
    }

    #[test]
    fn test_count_recomputed_once_per_filter() {
        let store = sample();
        let ctx = store.open_context();
        let cancel = CancellationToken::new();
        let errors = Some(Expr::level_in([LogLevel::Error]));

        for skip in 0..3 {
            let request = QueryRequest::new().filter(errors.clone()).skip(skip);
            store.query(&request, ctx, &cancel).unwrap();
        }
        assert_eq!(store.context_info(ctx).unwrap().recounts, 1);

        // Sorting differently reuses the count
        let request = QueryRequest::new()
            .filter(errors.clone())
            .sort(SortSpec::descending(Field::Id));
        store.query(&request, ctx, &cancel).unwrap();
        assert_eq!(store.context_info(ctx).unwrap().recounts, 1);

        store.query(&QueryRequest::new(), ctx, &cancel).unwrap();
        assert_eq!(store.context_info(ctx).unwrap().recounts, 2);
    }

    #[test]
    fn test_mutation_marks_contexts_stale() {
        let store = sample();
        let a = store.open_context();
        let b = store.open_context();
        let cancel = CancellationToken::new();
        let errors = QueryRequest::new().filter(Some(Expr::level_in([LogLevel::Error])));

        assert_eq!(store.query(&errors, a, &cancel).unwrap().total_count, 2);
        assert_eq!(store.query(&QueryRequest::new(), b, &cancel).unwrap().total_count, 5);
        assert_eq!(store.context_info(a).unwrap().filtered_count, Some(2));

        let file = store.files()[0].id;
        store.append(file, LogEvent::new(ts(50), LogLevel::Error, "late"));
        assert_eq!(store.context_info(a).unwrap().filtered_count, None);
        assert_eq!(store.context_info(b).unwrap().filtered_count, None);

        assert_eq!(store.query(&errors, a, &cancel).unwrap().total_count, 3);
        assert_eq!(store.query(&QueryRequest::new(), b, &cancel).unwrap().total_count, 6);
        assert_eq!(store.context_info(a).unwrap().recounts, 2);
    }

    #[test]
    fn test_contexts_are_independent() {
        let store = sample();
        let a = store.open_context();
        let b = store.open_context();
        let cancel = CancellationToken::new();

        let by_id_desc = QueryRequest::new().sort(SortSpec::descending(Field::Id));
        let only_b = QueryRequest::new().filter(Some(Expr::property_equals("App", Some("B"))));

        let page_a = store.query(&by_id_desc, a, &cancel).unwrap();
        let page_b = store.query(&only_b, b, &cancel).unwrap();
        store.close_context(b).unwrap();

        assert_eq!(ids(&page_a), vec![4, 3, 2, 1, 0]);
        assert_eq!(ids(&page_b), vec![1, 4]);
        assert_eq!(store.find_by_index(0, a).unwrap().map(|i| i.id), Some(4));
        assert!(matches!(
            store.query(&only_b, b, &cancel),
            Err(EngineError::InvalidContext(_))
        ));
    }

    #[test]
    fn test_cancelled_query() {
        let store = sample();
        let ctx = store.open_context();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            store.query(&QueryRequest::new(), ctx, &cancel),
            Err(EngineError::Cancelled)
        ));
    }

    #[test]
    fn test_find_by_timestamp() {
        let store = sample();
        let ctx = store.open_context();
        store.query(&QueryRequest::new(), ctx, &CancellationToken::new()).unwrap();

        // Two items at t=10, lowest id wins
        let (index, item) = store.find_by_timestamp(ts(10), true, ctx).unwrap().unwrap();
        assert_eq!((index, item.id), (0, 1));
        assert!(store.find_by_timestamp(ts(12), true, ctx).unwrap().is_none());

        // 25 is equally far from 20 (id 2) and 30 (id 0)
        let (_, item) = store.find_by_timestamp(ts(25), false, ctx).unwrap().unwrap();
        assert_eq!(item.id, 0);
        let (index, item) = store.find_by_timestamp(ts(38), false, ctx).unwrap().unwrap();
        assert_eq!((index, item.id), (4, 4));
    }

    #[test]
    fn test_find_by_id_uses_context_view() {
        let store = sample();
        let ctx = store.open_context();
        let only_a = QueryRequest::new().filter(Some(Expr::compare(
            Field::property("App", Projection::String),
            CompareOp::Eq,
            Literal::string("A"),
        )));
        store.query(&only_a, ctx, &CancellationToken::new()).unwrap();

        let (index, item) = store.find_by_id_and_timestamp(2, ts(20), true, ctx).unwrap().unwrap();
        assert_eq!((index, item.id), (1, 2));

        // Id 4 is filtered out of this view
        assert!(store.find_by_id_and_timestamp(4, ts(40), true, ctx).unwrap().is_none());
        let (_, item) = store.find_by_id_and_timestamp(4, ts(40), false, ctx).unwrap().unwrap();
        assert_eq!(item.id, 0);
    }
}
