//! Application wiring: the cache runtime and the storefront's rule set.

pub mod error;
pub mod rules;
pub mod runtime;
