//! Keyed TTL caching for read-only API results.
//!
//! This module provides the `TtlCache` for memoizing successful reads, one
//! instance per data domain. Entries expire after the domain's TTL and every
//! write to a domain clears that domain's cache.
//!
//! Data domains and their default TTLs:
//! - Messaging: 1 minute (unread counts change quickly)
//! - Attendance: 2 minutes
//! - Analytics, Grades, Parent: 5 minutes
//! - Reference (subjects, classes): 10 minutes

pub mod key;
pub mod ttl;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use key::QueryParams;
pub use ttl::{CacheEntry, TtlCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheDomain {
    Analytics,
    Attendance,
    Grades,
    Messaging,
    Parent,
    Reference,
}

impl CacheDomain {
    pub const ALL: [CacheDomain; 6] = [
        CacheDomain::Analytics,
        CacheDomain::Attendance,
        CacheDomain::Grades,
        CacheDomain::Messaging,
        CacheDomain::Parent,
        CacheDomain::Reference,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CacheDomain::Analytics => "analytics",
            CacheDomain::Attendance => "attendance",
            CacheDomain::Grades => "grades",
            CacheDomain::Messaging => "messaging",
            CacheDomain::Parent => "parent",
            CacheDomain::Reference => "reference",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        let secs = match self {
            CacheDomain::Messaging => 60,
            CacheDomain::Attendance => 120,
            CacheDomain::Analytics | CacheDomain::Grades | CacheDomain::Parent => 300,
            CacheDomain::Reference => 600,
        };
        Duration::from_secs(secs)
    }

    /// Pick the domain an API path belongs to
    pub fn for_path(path: &str) -> Self {
        let path = path.trim_start_matches('/');
        if path.starts_with("messages") {
            CacheDomain::Messaging
        } else if path.starts_with("attendance") {
            CacheDomain::Attendance
        } else if path.starts_with("academics/analytics") {
            CacheDomain::Analytics
        } else if path.starts_with("academics/grades") {
            CacheDomain::Grades
        } else if path.starts_with("parents") {
            CacheDomain::Parent
        } else {
            CacheDomain::Reference
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_path() {
        assert_eq!(CacheDomain::for_path("/messages/unread_count/"), CacheDomain::Messaging);
        assert_eq!(CacheDomain::for_path("attendance/summary/"), CacheDomain::Attendance);
        assert_eq!(
            CacheDomain::for_path("/academics/grades/statistics/"),
            CacheDomain::Grades
        );
        assert_eq!(CacheDomain::for_path("/academics/subjects/"), CacheDomain::Reference);
    }

    #[test]
    fn test_default_ttls() {
        assert_eq!(CacheDomain::Messaging.default_ttl(), Duration::from_secs(60));
        assert_eq!(CacheDomain::Attendance.default_ttl(), Duration::from_secs(120));
        assert!(CacheDomain::ALL.iter().all(|d| !d.default_ttl().is_zero()));
    }
}
