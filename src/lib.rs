//! Cache policy, invalidation and preloading engine for the event photo
//! storefront.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
