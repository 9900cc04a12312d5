use std::{collections::HashSet, fmt};

use itertools::{EitherOrBoth, Itertools};
use serde::Serialize;

use crate::{change::Field, persist::StoreError};

/// Version numbers start at 1 and grow by exactly one per appended entry.
pub fn next_version(latest: Option<i32>) -> i32 {
    latest.map_or(1, |latest| latest + 1)
}

/// A line position that exists on both sides of a diff but holds different text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModifiedLine {
    pub field: Field,
    /// 1-based
    pub line: usize,
}

impl fmt::Display for ModifiedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} line {}", self.field, self.line)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VersionDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<ModifiedLine>,
}

impl VersionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Title and content of one side of a diff.
pub struct DiffSide<'a> {
    pub title: &'a str,
    pub content: &'a str,
}

/// Line-oriented comparison of two versions, title and content handled independently.
pub fn diff_versions(source: DiffSide<'_>, target: DiffSide<'_>) -> VersionDiff {
    let mut diff = VersionDiff::default();
    diff_field(Field::Title, source.title, target.title, &mut diff);
    diff_field(Field::Content, source.content, target.content, &mut diff);
    diff
}

fn diff_field(field: Field, source: &str, target: &str, diff: &mut VersionDiff) {
    let source_lines: Vec<&str> = source.split('\n').collect();
    let target_lines: Vec<&str> = target.split('\n').collect();
    let source_set: HashSet<&str> = source_lines.iter().copied().collect();
    let target_set: HashSet<&str> = target_lines.iter().copied().collect();

    diff.added.extend(
        target_lines
            .iter()
            .filter(|line| !source_set.contains(*line))
            .map(|line| line.to_string()),
    );
    diff.removed.extend(
        source_lines
            .iter()
            .filter(|line| !target_set.contains(*line))
            .map(|line| line.to_string()),
    );
    for (idx, pair) in source_lines.iter().zip_longest(target_lines.iter()).enumerate() {
        if let EitherOrBoth::Both(before, after) = pair
            && before != after
        {
            diff.modified.push(ModifiedLine {
                field,
                line: idx + 1,
            });
        }
    }
}

/// Validated `from`/`to` pair for a diff request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionQuery {
    pub from: i32,
    pub to: i32,
}

impl VersionQuery {
    /// Rejects non-numeric input before anything is looked up.
    pub fn parse(from: &str, to: &str) -> Result<Self, StoreError> {
        Ok(Self {
            from: parse_version_number(from)?,
            to: parse_version_number(to)?,
        })
    }
}

pub fn parse_version_number(raw: &str) -> Result<i32, StoreError> {
    raw.trim()
        .parse::<i32>()
        .map_err(|_| StoreError::BadRequest(format!("version must be a number, got {raw:?}")))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn side<'a>(title: &'a str, content: &'a str) -> DiffSide<'a> {
        DiffSide { title, content }
    }

    #[test]
    fn test_numbering_starts_at_one_and_increments() {
        assert_eq!(next_version(None), 1);
        assert_eq!(next_version(Some(3)), 4);
    }

    #[test]
    fn test_title_change_is_a_line_level_replace() {
        let diff = diff_versions(side("Hello", "body"), side("Hello World", "body"));
        assert_eq!(diff.added, vec!["Hello World"]);
        assert_eq!(diff.removed, vec!["Hello"]);
        assert_eq!(
            diff.modified,
            vec![ModifiedLine {
                field: Field::Title,
                line: 1
            }]
        );
    }

    #[test]
    fn test_appended_lines_are_added_but_not_modified() {
        let diff = diff_versions(side("T", "one\ntwo"), side("T", "one\ntwo\nthree"));
        assert_eq!(diff.added, vec!["three"]);
        assert!(diff.removed.is_empty());
        assert!(diff.modified.is_empty());
    }

    #[test]
    fn test_modified_positions_are_one_based_per_field() {
        let diff = diff_versions(side("T", "a\nb\nc"), side("T", "a\nB\nc"));
        assert_eq!(diff.added, vec!["B"]);
        assert_eq!(diff.removed, vec!["b"]);
        assert_eq!(diff.modified.len(), 1);
        assert_eq!(diff.modified[0].to_string(), "content line 2");
    }

    #[test]
    fn test_identical_versions_have_empty_diff() {
        assert!(diff_versions(side("T", "x\ny"), side("T", "x\ny")).is_empty());
    }

    #[test]
    fn test_non_numeric_query_is_a_bad_request() {
        assert_eq!(VersionQuery::parse("1", "2").unwrap(), VersionQuery { from: 1, to: 2 });
        let err = VersionQuery::parse("one", "2").unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(_)), "wrong error type: {err:#?}");
    }
}
