//! Service layer
//!
//! One service per operation family. Every entry point takes the
//! authenticated [`crate::models::User`] and runs the permission gate
//! before touching data; writes go through the unit-of-work so events are
//! only published after commit.

pub mod dataset_service;
pub mod exploration_service;
pub mod query_service;
pub mod ref_service;
pub mod sampling_service;
pub mod sql_service;

pub use dataset_service::DatasetService;
pub use exploration_service::ExplorationService;
pub use query_service::QueryService;
pub use ref_service::RefService;
pub use sampling_service::SamplingService;
pub use sql_service::SqlService;

use crate::error::{DomainError, DomainResult};

/// Validate and clamp a pagination request: negative values are rejected,
/// an oversized limit is clamped to the cap (the one placement where the
/// service clamps instead of rejecting).
pub fn page_bounds(offset: i64, limit: i64, cap: i64) -> DomainResult<(i64, i64)> {
    if offset < 0 {
        return Err(DomainError::Validation("offset must not be negative".into()));
    }
    if limit < 0 {
        return Err(DomainError::Validation("limit must not be negative".into()));
    }
    Ok((offset, limit.min(cap)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_bounds_clamps_limit() {
        let (offset, limit) = page_bounds(10, 5000, 1000).unwrap();
        assert_eq!(offset, 10);
        assert_eq!(limit, 1000);
    }

    #[test]
    fn test_page_bounds_rejects_negative() {
        assert!(matches!(
            page_bounds(-1, 10, 1000),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            page_bounds(0, -10, 1000),
            Err(DomainError::Validation(_))
        ));
    }

    #[test]
    fn test_page_bounds_passes_in_range_values() {
        let (offset, limit) = page_bounds(0, 100, 1000).unwrap();
        assert_eq!((offset, limit), (0, 100));
    }
}
