//! Deterministic destination selection.
//!
//! Given the site catalog and a rule's filter, produce the ordered list of
//! candidate destinations for one file: most capacity remaining first,
//! then higher administrative priority, then lexical site id. The same
//! inputs always yield the same order.

use std::collections::BTreeSet;

use datagrid_core::rule::SiteFilter;
use datagrid_core::site::{SiteCatalog, SiteId};

/// Ordered candidate destinations for a file of `size_bytes`.
///
/// A site qualifies when it is available, matches the rule's filter, has
/// room for the file, and is not in `excluded` (sites already holding or
/// receiving a counted replica, or cooling down after a permanent
/// failure).
pub fn rank_destinations(
    catalog: &SiteCatalog,
    filter: &SiteFilter,
    size_bytes: u64,
    excluded: &BTreeSet<SiteId>,
) -> Vec<SiteId> {
    let mut candidates: Vec<_> = catalog
        .sites()
        .filter(|s| {
            s.available && filter.matches(s) && s.fits(size_bytes) && !excluded.contains(&s.id)
        })
        .collect();
    candidates.sort_by(|a, b| {
        b.capacity_remaining()
            .cmp(&a.capacity_remaining())
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates.into_iter().map(|s| s.id.clone()).collect()
}
