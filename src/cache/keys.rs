//! Cache key definitions.
//!
//! `ResourceKey` addresses a single cached resource; `KeyPattern` addresses a
//! family of them for invalidation.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::CacheError;

/// Class of fetched data with its own freshness policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    Events,
    Choreographies,
    Photos,
    PhotosInfinite,
    Thumbnails,
    Metadata,
    Batch,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Events,
        Category::Choreographies,
        Category::Photos,
        Category::PhotosInfinite,
        Category::Thumbnails,
        Category::Metadata,
        Category::Batch,
    ];

    /// Token used as the first segment of a key's string form.
    pub fn token(self) -> &'static str {
        match self {
            Category::Events => "eventos",
            Category::Choreographies => "coreografias",
            Category::Photos => "fotos",
            Category::PhotosInfinite => "fotos-infinite",
            Category::Thumbnails => "thumbnails",
            Category::Metadata => "metadata",
            Category::Batch => "batch",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

impl FromStr for Category {
    type Err = CacheError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.token() == value)
            .ok_or_else(|| CacheError::UnknownCategoryToken(value.to_string()))
    }
}

/// A primitive key parameter, compared by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Bool(bool),
    Str(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(value) => write!(f, "{value}"),
            ParamValue::Bool(value) => write!(f, "{value}"),
            ParamValue::Str(value) => f.write_str(value),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Str(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Str(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

impl From<u32> for ParamValue {
    fn from(value: u32) -> Self {
        ParamValue::Int(i64::from(value))
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

/// Structured identifier of one cached resource.
///
/// Equality is order-sensitive over the params.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    category: Category,
    params: Vec<ParamValue>,
}

impl ResourceKey {
    pub fn new<I, P>(category: Category, params: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ParamValue>,
    {
        Self {
            category,
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    pub fn events() -> Self {
        Self::new(Category::Events, Vec::<ParamValue>::new())
    }

    pub fn choreographies(event: &str) -> Self {
        Self::new(Category::Choreographies, [event])
    }

    pub fn photos(event: &str, choreography: &str) -> Self {
        Self::new(Category::Photos, [event, choreography])
    }

    pub fn photos_page(event: &str, choreography: &str, page: u32) -> Self {
        Self::new(
            Category::PhotosInfinite,
            [
                ParamValue::from(event),
                ParamValue::from(choreography),
                ParamValue::from(page),
            ],
        )
    }

    pub fn thumbnails(event: &str, choreography: &str) -> Self {
        Self::new(Category::Thumbnails, [event, choreography])
    }

    pub fn metadata(event: &str) -> Self {
        Self::new(Category::Metadata, [event])
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn params(&self) -> &[ParamValue] {
        &self.params
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.category.token())?;
        for param in &self.params {
            write!(f, "_{param}")?;
        }
        Ok(())
    }
}

/// Matches one positional parameter of a structured pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ParamMatcher {
    Exact(ParamValue),
    Any,
}

impl ParamMatcher {
    fn matches(&self, value: &ParamValue) -> bool {
        match self {
            ParamMatcher::Exact(expected) => expected == value,
            ParamMatcher::Any => true,
        }
    }
}

impl From<ParamValue> for ParamMatcher {
    fn from(value: ParamValue) -> Self {
        ParamMatcher::Exact(value)
    }
}

impl From<&str> for ParamMatcher {
    fn from(value: &str) -> Self {
        ParamMatcher::Exact(value.into())
    }
}

impl From<i64> for ParamMatcher {
    fn from(value: i64) -> Self {
        ParamMatcher::Exact(value.into())
    }
}

/// Glob over a key's string form. `*` matches any substring.
#[derive(Debug, Clone)]
pub struct Glob {
    source: String,
    regex: Regex,
}

impl Glob {
    pub fn new(source: &str) -> Result<Self, CacheError> {
        let body = source
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{body}$")).map_err(|err| CacheError::InvalidPattern {
            pattern: source.to_string(),
            reason: err.to_string(),
        })?;

        Ok(Self {
            source: source.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn has_wildcard(&self) -> bool {
        self.source.contains('*')
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }
}

impl PartialEq for Glob {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Glob {}

impl Hash for Glob {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

/// Addresses a family of cache keys for invalidation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyPattern {
    /// Exactly one key.
    Exact(ResourceKey),
    /// Keys of `category` whose leading params satisfy `params`; trailing
    /// params are unconstrained.
    Structured {
        category: Category,
        params: Vec<ParamMatcher>,
    },
    /// Glob over the key's string form.
    Glob(Glob),
}

impl KeyPattern {
    pub fn exact(key: ResourceKey) -> Self {
        KeyPattern::Exact(key)
    }

    /// Every key of a category.
    pub fn category(category: Category) -> Self {
        KeyPattern::Structured {
            category,
            params: Vec::new(),
        }
    }

    pub fn structured<I>(category: Category, params: I) -> Self
    where
        I: IntoIterator<Item = ParamMatcher>,
    {
        KeyPattern::Structured {
            category,
            params: params.into_iter().collect(),
        }
    }

    pub fn glob(source: &str) -> Result<Self, CacheError> {
        Glob::new(source).map(KeyPattern::Glob)
    }

    /// A pattern matches more than one key unless it is exact or a glob
    /// without any `*`.
    pub fn is_wildcard(&self) -> bool {
        match self {
            KeyPattern::Exact(_) => false,
            KeyPattern::Structured { .. } => true,
            KeyPattern::Glob(glob) => glob.has_wildcard(),
        }
    }

    pub fn matches(&self, key: &ResourceKey) -> bool {
        match self {
            KeyPattern::Exact(expected) => expected == key,
            KeyPattern::Structured { category, params } => {
                *category == key.category()
                    && params.len() <= key.params().len()
                    && params
                        .iter()
                        .zip(key.params())
                        .all(|(matcher, value)| matcher.matches(value))
            }
            KeyPattern::Glob(glob) => glob.is_match(&key.to_string()),
        }
    }
}

impl From<ResourceKey> for KeyPattern {
    fn from(key: ResourceKey) -> Self {
        KeyPattern::Exact(key)
    }
}

impl FromStr for KeyPattern {
    type Err = CacheError;

    /// Parses the string form used by ad-hoc invalidation. Text without `*`
    /// matches exactly one key string.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        KeyPattern::glob(value)
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPattern::Exact(key) => write!(f, "{key}"),
            KeyPattern::Structured { category, params } => {
                f.write_str(category.token())?;
                for matcher in params {
                    match matcher {
                        ParamMatcher::Exact(value) => write!(f, "_{value}")?,
                        ParamMatcher::Any => f.write_str("_*")?,
                    }
                }
                f.write_str("*")
            }
            KeyPattern::Glob(glob) => f.write_str(glob.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn key_equality_is_order_sensitive() {
        let a = ResourceKey::photos("EventoX", "CoreoY");
        let b = ResourceKey::photos("EventoX", "CoreoY");
        let swapped = ResourceKey::photos("CoreoY", "EventoX");

        assert_eq!(a, b);
        assert_ne!(a, swapped);
        assert_ne!(a, ResourceKey::thumbnails("EventoX", "CoreoY"));
    }

    #[test]
    fn params_compare_by_value_and_type() {
        let numeric = ResourceKey::new(Category::Metadata, [12i64]);
        let text = ResourceKey::new(Category::Metadata, ["12"]);
        assert_ne!(numeric, text);
        assert_eq!(numeric.to_string(), text.to_string());
    }

    #[test]
    fn string_form_joins_params() {
        assert_eq!(
            ResourceKey::photos("EventoX", "CoreoY").to_string(),
            "fotos_EventoX_CoreoY"
        );
        assert_eq!(ResourceKey::events().to_string(), "eventos");
        assert_eq!(
            ResourceKey::photos_page("EventoX", "CoreoY", 2).to_string(),
            "fotos-infinite_EventoX_CoreoY_2"
        );
    }

    #[test]
    fn glob_prefix_matches_family() {
        let pattern = KeyPattern::glob("fotos*").expect("valid glob");

        assert!(pattern.matches(&ResourceKey::photos("EventoX", "CoreoY")));
        assert!(pattern.matches(&ResourceKey::new(Category::PhotosInfinite, ["EventoX"])));
        assert!(!pattern.matches(&ResourceKey::new(Category::Thumbnails, ["EventoX"])));
        assert!(pattern.is_wildcard());
    }

    #[test]
    fn glob_is_case_sensitive_and_anchored() {
        let pattern = KeyPattern::glob("fotos_*_CoreoY").expect("valid glob");

        assert!(pattern.matches(&ResourceKey::photos("EventoX", "CoreoY")));
        assert!(!pattern.matches(&ResourceKey::photos("EventoX", "coreoy")));
        assert!(!pattern.matches(&ResourceKey::thumbnails("EventoX", "CoreoY")));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let pattern = KeyPattern::glob("fotos_Evento.X*").expect("valid glob");

        assert!(pattern.matches(&ResourceKey::photos("Evento.X", "CoreoY")));
        assert!(!pattern.matches(&ResourceKey::photos("EventoZX", "CoreoY")));
    }

    #[test]
    fn literal_text_parses_to_non_wildcard_pattern() {
        let pattern: KeyPattern = "fotos_EventoX_CoreoY".parse().expect("valid pattern");

        assert!(!pattern.is_wildcard());
        assert!(pattern.matches(&ResourceKey::photos("EventoX", "CoreoY")));
        assert!(!pattern.matches(&ResourceKey::photos("EventoX", "CoreoZ")));
    }

    #[test]
    fn structured_pattern_matches_leading_params() {
        let pattern = KeyPattern::structured(
            Category::Photos,
            [ParamMatcher::from("EventoX"), ParamMatcher::Any],
        );

        assert!(pattern.matches(&ResourceKey::photos("EventoX", "CoreoY")));
        assert!(!pattern.matches(&ResourceKey::photos("EventoZ", "CoreoY")));
        assert!(!pattern.matches(&ResourceKey::new(Category::Photos, ["EventoX"])));
        assert!(!pattern.matches(&ResourceKey::thumbnails("EventoX", "CoreoY")));
    }

    #[test]
    fn category_pattern_covers_every_key_of_category() {
        let pattern = KeyPattern::category(Category::Photos);

        assert!(pattern.matches(&ResourceKey::photos("A", "B")));
        assert!(pattern.matches(&ResourceKey::new(Category::Photos, Vec::<ParamValue>::new())));
        assert!(!pattern.matches(&ResourceKey::photos_page("A", "B", 1)));
        assert_eq!(pattern.to_string(), "fotos*");
    }

    #[test]
    fn patterns_hash_by_source() {
        let mut set = HashSet::new();
        set.insert(KeyPattern::glob("fotos*").expect("valid glob"));
        set.insert(KeyPattern::glob("fotos*").expect("valid glob"));
        set.insert(KeyPattern::exact(ResourceKey::events()));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn category_tokens_round_trip() {
        for category in Category::ALL {
            let parsed: Category = category.token().parse().expect("known token");
            assert_eq!(parsed, category);
        }
        assert!("videos".parse::<Category>().is_err());
    }
}
