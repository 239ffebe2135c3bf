//! Page window and total count of a query.

use crate::error::{PersistenceError, PersistenceResult};
use serde::Serialize;

/// One-based page window; `total_count` is filled by query execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PagingInfo {
    page_size: u32,
    page: u32,
    total_count: u64,
}

impl PagingInfo {
    pub fn new(page_size: u32, page: u32) -> PersistenceResult<Self> {
        if page_size == 0 || page == 0 {
            return Err(PersistenceError::InvalidQuery(format!(
                "page size and page must be positive, got {page_size} and {page}"
            )));
        }
        Ok(Self {
            page_size,
            page,
            total_count: 0,
        })
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }

    pub fn total_count(&self) -> u64 {
        self.total_count
    }

    pub(crate) fn set_total_count(&mut self, total_count: u64) {
        self.total_count = total_count;
    }

    pub fn page_count(&self) -> u64 {
        self.total_count.div_ceil(u64::from(self.page_size))
    }

    pub fn is_last_page(&self) -> bool {
        u64::from(self.page) >= self.page_count()
    }
}

#[cfg(test)]
mod tests {
    use super::PagingInfo;

    #[test]
    fn offset_and_page_count_follow_page_size() {
        let mut paging = PagingInfo::new(7, 2).unwrap();
        paging.set_total_count(8);
        assert_eq!(paging.offset(), 7);
        assert_eq!(paging.page_count(), 2);
        assert!(paging.is_last_page());
    }

    #[test]
    fn zero_page_size_is_rejected() {
        assert!(PagingInfo::new(0, 1).is_err());
        assert!(PagingInfo::new(5, 0).is_err());
    }
}
