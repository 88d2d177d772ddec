//! Position addressing for the activity tree.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of an activity within a workflow version's tree.
///
/// A position is the dot-joined path of 1-based ordinals from the root to the
/// activity: the second child of the first top-level activity sits at
/// `"1.2"`. Positions are what make replay deterministic: as long as workflow
/// code creates activities in the same order on every tick, each logical step
/// resolves to the same position and therefore the same persisted row.
///
/// Children produced by loops or fan-outs share positions across iterations;
/// the iteration number disambiguates them (see
/// [`ActivityInstanceKey`](crate::runtime::ActivityInstanceKey)).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Position(String);

impl Position {
    /// The root position, parent of all top-level activities.
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Parse a position from its string form (e.g. `"1.2.1"`).
    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            return Some(Self::root());
        }
        if s.split('.').all(|seg| {
            !seg.is_empty() && seg.chars().all(|c| c.is_ascii_digit()) && !seg.starts_with('0')
        }) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    /// The position of this position's `ordinal`-th child (1-based).
    pub fn child(&self, ordinal: u32) -> Self {
        if self.0.is_empty() {
            Self(ordinal.to_string())
        } else {
            Self(format!("{}.{}", self.0, ordinal))
        }
    }

    /// The parent position, found by trimming the last segment.
    ///
    /// Returns `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        match self.0.rfind('.') {
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => Some(Self::root()),
        }
    }

    /// Ordinal of this position among its siblings (1-based).
    pub fn ordinal(&self) -> Option<u32> {
        self.0.rsplit('.').next().and_then(|s| s.parse().ok())
    }

    /// Nesting depth; the root has depth 0.
    pub fn depth(&self) -> usize {
        if self.0.is_empty() {
            0
        } else {
            self.0.split('.').count()
        }
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_and_parent() {
        let root = Position::root();
        let first = root.child(1);
        let nested = first.child(2).child(1);

        assert_eq!(first.as_str(), "1");
        assert_eq!(nested.as_str(), "1.2.1");
        assert_eq!(nested.parent().unwrap().as_str(), "1.2");
        assert_eq!(first.parent().unwrap(), Position::root());
        assert_eq!(root.parent(), None);
    }

    #[test]
    fn test_ordinal_and_depth() {
        let pos = Position::root().child(3).child(7);
        assert_eq!(pos.ordinal(), Some(7));
        assert_eq!(pos.depth(), 2);
        assert_eq!(Position::root().depth(), 0);
    }

    #[test]
    fn test_parse() {
        assert_eq!(Position::parse("1.2.1").unwrap().as_str(), "1.2.1");
        assert_eq!(Position::parse("").unwrap(), Position::root());
        assert!(Position::parse("1..2").is_none());
        assert!(Position::parse("a.b").is_none());
        assert!(Position::parse("01").is_none());
    }

    #[test]
    fn test_serde_transparent() {
        let pos = Position::root().child(1).child(4);
        let json = serde_json::to_string(&pos).unwrap();
        assert_eq!(json, "\"1.4\"");

        let parsed: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, pos);
    }
}
