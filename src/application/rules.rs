//! Invalidation rules of the storefront.

use crate::cache::{CacheError, InvalidationManager, KeyPattern, Priority, RuleOptions};

pub const EVENTS_MODIFIED: &str = "eventos_modified";
pub const CHOREOGRAPHIES_MODIFIED: &str = "coreografias_modified";
pub const PHOTOS_MODIFIED: &str = "fotos_modified";
pub const PHOTOS_UPLOADED: &str = "fotos_uploaded";
pub const METADATA_MODIFIED: &str = "metadata_modified";

fn globs(sources: &[&str]) -> Result<Vec<KeyPattern>, CacheError> {
    sources.iter().map(|source| KeyPattern::glob(source)).collect()
}

/// Register the default rule set on `manager`.
pub fn register_default_rules(manager: &InvalidationManager) -> Result<(), CacheError> {
    manager.register_rule(
        EVENTS_MODIFIED,
        globs(&["eventos*", "coreografias*"])?,
        RuleOptions::default().debounce_ms(300),
    );
    manager.register_rule(
        CHOREOGRAPHIES_MODIFIED,
        globs(&["coreografias*", "fotos*"])?,
        RuleOptions::default().debounce_ms(300),
    );
    manager.register_rule(
        PHOTOS_MODIFIED,
        globs(&["fotos*", "thumbnails*"])?,
        RuleOptions::default().debounce_ms(200),
    );
    // Uploads only matter when something was actually uploaded.
    manager.register_rule(
        PHOTOS_UPLOADED,
        globs(&["fotos*", "thumbnails*", "metadata*"])?,
        RuleOptions::default()
            .debounce_ms(100)
            .priority(Priority::High)
            .when(|metadata| metadata["count"].as_u64().is_some_and(|count| count > 0)),
    );
    manager.register_rule(
        METADATA_MODIFIED,
        globs(&["metadata*"])?,
        RuleOptions::default()
            .debounce_ms(1000)
            .priority(Priority::Low),
    );
    Ok(())
}
