//! Watermark-driven page fetching.

use crate::errors::StoreError;
use crate::store::{Eligibility, EnrichmentStore, MasterRecord, PageQuery};

/// One fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Records in ascending key order.
    pub records: Vec<MasterRecord>,
    /// Key of the last record; the watermark once the page is reconciled.
    pub last_id: i64,
}

impl Page {
    /// Number of records on the page.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the page holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Result of asking the cursor for the next page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorStep {
    /// A non-empty page.
    Page(Page),
    /// No eligible rows remain after the watermark.
    Exhausted,
    /// The record budget is used up; nothing was fetched.
    BudgetReached,
}

/// Reads pages of eligible records strictly after a watermark.
///
/// The cursor holds no position of its own; the caller threads the watermark
/// and the processed count through each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCursor {
    eligibility: Eligibility,
    page_size: usize,
    max_records: Option<u64>,
}

impl BatchCursor {
    /// Creates a cursor. A page size of zero is treated as one.
    #[must_use]
    pub fn new(eligibility: Eligibility, page_size: usize) -> Self {
        Self {
            eligibility,
            page_size: page_size.max(1),
            max_records: None,
        }
    }

    /// Caps the total number of records fetched across the run.
    #[must_use]
    pub const fn with_budget(mut self, max_records: Option<u64>) -> Self {
        self.max_records = max_records;
        self
    }

    /// The missing-attribute predicate.
    #[must_use]
    pub const fn eligibility(&self) -> Eligibility {
        self.eligibility
    }

    /// Rows to request given `processed` rows so far: `min(page, budget left)`.
    ///
    /// `None` once the budget is used up.
    #[must_use]
    pub fn limit(&self, processed: u64) -> Option<usize> {
        match self.max_records {
            None => Some(self.page_size),
            Some(max) if processed >= max => None,
            Some(max) => {
                let remaining = usize::try_from(max - processed).unwrap_or(usize::MAX);
                Some(self.page_size.min(remaining))
            }
        }
    }

    /// The query for the next page, if the budget allows one.
    #[must_use]
    pub fn query(&self, watermark: i64, processed: u64) -> Option<PageQuery> {
        self.limit(processed).map(|limit| PageQuery {
            after: watermark,
            limit,
            eligibility: self.eligibility,
        })
    }

    /// Fetches the next page after `watermark`.
    pub async fn next_page<S>(
        &self,
        store: &S,
        watermark: i64,
        processed: u64,
    ) -> Result<CursorStep, StoreError>
    where
        S: EnrichmentStore + ?Sized,
    {
        let Some(query) = self.query(watermark, processed) else {
            return Ok(CursorStep::BudgetReached);
        };

        let records = store.fetch_page(query).await?;
        check_order(&records, watermark, query.limit)?;

        match records.last() {
            None => Ok(CursorStep::Exhausted),
            Some(last) => {
                let last_id = last.id;
                Ok(CursorStep::Page(Page { records, last_id }))
            }
        }
    }
}

fn check_order(records: &[MasterRecord], watermark: i64, limit: usize) -> Result<(), StoreError> {
    if records.len() > limit {
        return Err(StoreError::Integrity(format!(
            "store returned {} rows for a limit of {limit}",
            records.len()
        )));
    }
    let mut previous = watermark;
    for record in records {
        if record.id <= previous {
            return Err(StoreError::Integrity(format!(
                "page not strictly ascending after {watermark}: {} follows {previous}",
                record.id
            )));
        }
        previous = record.id;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, MockEnrichmentStore};
    use pretty_assertions::assert_eq;

    fn store(n: i64) -> InMemoryStore {
        InMemoryStore::with_records(
            (1..=n).map(|id| MasterRecord::new(id, "Name", "Surname", Some("9704201234083"))),
        )
    }

    #[test]
    fn test_limit_is_min_of_page_and_budget() {
        let cursor = BatchCursor::new(Eligibility::MissingBirthDate, 100);
        assert_eq!(cursor.limit(5_000), Some(100));

        let cursor = cursor.with_budget(Some(250));
        assert_eq!(cursor.limit(0), Some(100));
        assert_eq!(cursor.limit(200), Some(50));
        assert_eq!(cursor.limit(250), None);
        assert_eq!(cursor.limit(300), None);

        let zero = BatchCursor::new(Eligibility::MissingBirthDate, 100).with_budget(Some(0));
        assert_eq!(zero.limit(0), None);
    }

    #[tokio::test]
    async fn test_walks_pages_until_exhausted() {
        let store = store(5);
        let cursor = BatchCursor::new(Eligibility::MissingBirthDate, 2);

        let mut watermark = 0;
        let mut pages = Vec::new();
        loop {
            match cursor.next_page(&store, watermark, 0).await.unwrap() {
                CursorStep::Page(page) => {
                    watermark = page.last_id;
                    pages.push(page.records.iter().map(|r| r.id).collect::<Vec<_>>());
                }
                CursorStep::Exhausted => break,
                CursorStep::BudgetReached => unreachable!(),
            }
        }
        assert_eq!(pages, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test]
    async fn test_budget_reached_without_fetch() {
        let store = store(5);
        let cursor = BatchCursor::new(Eligibility::MissingBirthDate, 2).with_budget(Some(3));

        let step = cursor.next_page(&store, 2, 2).await.unwrap();
        let CursorStep::Page(page) = step else {
            panic!("expected a page");
        };
        assert_eq!(page.len(), 1);
        assert_eq!(page.last_id, 3);

        assert_eq!(
            cursor.next_page(&store, 3, 3).await.unwrap(),
            CursorStep::BudgetReached
        );
        assert_eq!(store.calls().fetches, vec![2]);
    }

    #[tokio::test]
    async fn test_same_watermark_same_page() {
        let store = store(6);
        let cursor = BatchCursor::new(Eligibility::MissingBirthDate, 3);
        let first = cursor.next_page(&store, 3, 0).await.unwrap();
        let again = cursor.next_page(&store, 3, 0).await.unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_rejects_out_of_order_page() {
        let mut store = MockEnrichmentStore::new();
        store.expect_fetch_page().times(1).returning(|_| {
            Ok(vec![
                MasterRecord::new(5, "A", "B", None),
                MasterRecord::new(4, "A", "B", None),
            ])
        });

        let cursor = BatchCursor::new(Eligibility::MissingBirthDate, 10);
        let err = cursor.next_page(&store, 0, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }
}
