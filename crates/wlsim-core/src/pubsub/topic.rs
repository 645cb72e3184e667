// ── Hierarchical topics ──
//
// A topic is an ordered list of segments. Segments are kept separate so a
// segment that itself contains a dot or colon (a MAC address, say) can
// never be confused with a deeper level.

use serde::Serialize;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Topic(Vec<String>);

impl Topic {
    /// The empty topic. Subscribing to it matches every message.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// This topic extended by one segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// This topic extended by all segments of `suffix`.
    pub fn join(&self, suffix: &Topic) -> Self {
        let mut segments = self.0.clone();
        segments.extend(suffix.0.iter().cloned());
        Self(segments)
    }

    /// True if `self` equals `other` or is an ancestor of it.
    pub fn is_prefix_of(&self, other: &Topic) -> bool {
        other.0.starts_with(&self.0)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

impl FromStr for Topic {
    type Err = Infallible;

    /// Dotted shorthand: `"a.b.c"`. Empty segments are skipped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s.split('.').filter(|seg| !seg.is_empty())))
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self::new(s.split('.').filter(|seg| !seg.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_relation() {
        let ab = Topic::from("a.b");
        assert!(ab.is_prefix_of(&Topic::from("a.b.c")));
        assert!(ab.is_prefix_of(&ab));
        assert!(!ab.is_prefix_of(&Topic::from("a.x")));
        assert!(!ab.is_prefix_of(&Topic::from("a")));
        assert!(Topic::root().is_prefix_of(&ab));
    }

    #[test]
    fn segments_with_separators_stay_whole() {
        let topic = Topic::new(["aa:bb:cc:dd:ee:ff", "ServiceAPRun"]);
        assert_eq!(topic.len(), 2);
        assert!(!Topic::from("aa").is_prefix_of(&topic));
    }

    #[test]
    fn child_and_join() {
        let base = Topic::from("dev");
        assert_eq!(base.child("svc"), Topic::from("dev.svc"));
        assert_eq!(base.join(&Topic::from("x.y")).to_string(), "dev.x.y");
    }
}
