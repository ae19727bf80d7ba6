use chrono::{DateTime, SecondsFormat, Utc};
use itertools::Itertools;
use sha2::{Digest, Sha256};
use std::borrow::Cow;

/// Marker used in place of a timestamp when a collection has no members.
pub const EMPTY_COLLECTION: &str = "empty";

/// Marker used in place of the template digest when no template was provided.
pub const NO_TEMPLATE: &str = "-";

/// Identifies a rendered view and the state of the data it was rendered from.
///
/// Freshness comes from the key: include the `updated_at` timestamp of every record the view
/// displays (or the [`CacheKey::max_updated_at`] of a collection) and the template source, and a
/// change to any of them results in a different key, and therefore a cache miss.
///
/// ```
/// # use errand::cache::key::CacheKey;
/// # use chrono::{TimeZone, Utc};
/// let updated_at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
/// let key = CacheKey::new("orders/show")
///     .part(7)
///     .updated_at(updated_at);
/// assert_eq!(
///     key.effective("errand"),
///     "errand/views/orders%2Fshow/-/7/2024-01-02T03:04:05.000000Z"
/// );
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub struct CacheKey {
    view: String,
    parts: Vec<String>,
    template_digest: Option<String>,
}

impl CacheKey {
    pub fn new(view: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            parts: Default::default(),
            template_digest: None,
        }
    }

    pub fn part(mut self, part: impl ToString) -> Self {
        self.parts.push(part.to_string());
        self
    }

    pub fn updated_at(self, updated_at: DateTime<Utc>) -> Self {
        self.part(updated_at.to_rfc3339_opts(SecondsFormat::Micros, true))
    }

    /// Add the most recent of the given timestamps, for example the `updated_at` of every member
    /// of a collection. An empty collection adds [`EMPTY_COLLECTION`].
    pub fn max_updated_at<I>(self, updated_at: I) -> Self
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        match updated_at.into_iter().max() {
            Some(max) => self.updated_at(max),
            None => self.part(EMPTY_COLLECTION),
        }
    }

    /// Include a digest of the template's source so that changing the template invalidates
    /// previously rendered entries.
    pub fn template(mut self, source: impl AsRef<[u8]>) -> Self {
        self.template_digest = Some(format!("{:x}", Sha256::digest(source.as_ref())));
        self
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn template_digest(&self) -> Option<&str> {
        self.template_digest.as_deref()
    }

    /// The key used to store the entry in a [`crate::cache::CacheBackend`]:
    /// `{namespace}/views/{view}/{template digest}/{part}/{part}...`
    ///
    /// `%` and `/` in the view and parts are percent-encoded, so every segment of the key maps
    /// back to exactly one view or part.
    pub fn effective(&self, namespace: &str) -> String {
        let digest = self.template_digest().unwrap_or(NO_TEMPLATE);
        [
            Cow::Borrowed(namespace),
            Cow::Borrowed("views"),
            escape(&self.view),
            Cow::Borrowed(digest),
        ]
        .into_iter()
        .chain(self.parts.iter().map(|part| escape(part)))
        .join("/")
    }
}

fn escape(segment: &str) -> Cow<'_, str> {
    if segment.contains(['%', '/']) {
        Cow::Owned(segment.replace('%', "%25").replace('/', "%2F"))
    } else {
        Cow::Borrowed(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};
    use rstest::{fixture, rstest};

    #[fixture]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn updated_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
    }

    #[rstest]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn effective_key(updated_at: DateTime<Utc>) {
        let key = CacheKey::new("orders/index")
            .part("page-1")
            .updated_at(updated_at);

        insta::assert_snapshot!(key.effective("app"), @"app/views/orders%2Findex/-/page-1/2024-01-02T03:04:05.000000Z");
    }

    #[rstest]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn timestamps_change_the_key(updated_at: DateTime<Utc>) {
        let a = CacheKey::new("orders/show").part(7).updated_at(updated_at);
        let b = CacheKey::new("orders/show")
            .part(7)
            .updated_at(updated_at + TimeDelta::microseconds(1));

        assert_ne!(a.effective("app"), b.effective("app"));
    }

    #[rstest]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn max_updated_at(updated_at: DateTime<Utc>) {
        let later = updated_at + TimeDelta::hours(1);
        let key = CacheKey::new("orders/index").max_updated_at([updated_at, later, updated_at]);

        assert_eq!(key, CacheKey::new("orders/index").updated_at(later));
    }

    #[test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn max_updated_at_empty() {
        let key = CacheKey::new("orders/index").max_updated_at(Vec::new());
        assert_eq!(key.parts(), [EMPTY_COLLECTION]);
    }

    #[rstest]
    #[case(CacheKey::new("orders").part("a/b"), CacheKey::new("orders").part("a").part("b"))]
    #[case(CacheKey::new("orders/a").part("b"), CacheKey::new("orders").part("a").part("b"))]
    #[case(CacheKey::new("orders").part("a%2Fb"), CacheKey::new("orders").part("a/b"))]
    #[case(CacheKey::new("orders").part("-"), CacheKey::new("orders"))]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn distinct_keys_do_not_collide(#[case] a: CacheKey, #[case] b: CacheKey) {
        assert_ne!(a, b);
        assert_ne!(a.effective("app"), b.effective("app"));
    }

    #[test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn escaped_segments() {
        let key = CacheKey::new("orders/show").part("a/b").part("100%");
        insta::assert_snapshot!(key.effective("app"), @"app/views/orders%2Fshow/-/a%2Fb/100%25");
    }

    #[test]
    #[cfg_attr(coverage_nightly, coverage(off))]
    fn template_digest() {
        let key = CacheKey::new("orders/show").template("<p>{{ order.id }}</p>");
        let other = CacheKey::new("orders/show").template("<p>{{ order.total }}</p>");

        let digest = key.template_digest().unwrap();
        assert_eq!(digest.len(), 64);
        assert_ne!(key.effective("app"), other.effective("app"));
        assert_eq!(
            key.effective("app"),
            format!("app/views/orders%2Fshow/{digest}")
        );
    }
}
