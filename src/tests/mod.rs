//! Crate-internal test suites that don't belong to any single module.

mod acts_like_map;
