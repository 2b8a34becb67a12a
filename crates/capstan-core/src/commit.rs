//! Commit model: identifiers, conventional-commit parsing, ordered ranges.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Commit identifier (lowercase hex, as produced by the source provider).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitId(String);

impl CommitId {
    /// Wrap a commit hash, normalizing to lowercase.
    pub fn new(hash: impl Into<String>) -> Self {
        CommitId(hash.into().to_ascii_lowercase())
    }

    /// Full hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 10 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..10.min(self.0.len())]
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A commit message parsed against the conventional-commit grammar.
///
/// Messages that do not match the grammar are kept verbatim as
/// `Unparseable`; whether that is an error depends on the bump policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitMessage {
    Conventional(ConventionalCommit),
    Unparseable(String),
}

/// Structured form of a conventional commit message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConventionalCommit {
    /// Commit type (`feat`, `fix`, `chore`, ...), lowercased.
    pub type_tag: String,

    /// Optional scope from `type(scope): ...`.
    pub scope: Option<String>,

    /// Breaking-change marker: `!` after the type/scope, or a
    /// `BREAKING CHANGE` footer.
    pub breaking: bool,

    /// Description (the remainder of the subject line).
    pub description: String,

    /// Free-form body paragraphs, if any.
    pub body: Option<String>,

    /// Trailing `Key: value` footers in declaration order.
    pub footers: Vec<(String, String)>,
}

/// A single commit in a range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub message: CommitMessage,
}

/// Ordered, immutable commit sequence between a base and a target ref.
///
/// Commits are ordered oldest to newest, as supplied by the source provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRange {
    pub base: Option<CommitId>,
    pub target: CommitId,
    commits: Vec<Commit>,
}

impl CommitRange {
    /// Build a range from raw (id, message) pairs, parsing each message.
    pub fn parse(
        base: Option<CommitId>,
        target: CommitId,
        raw: Vec<(CommitId, String)>,
    ) -> Self {
        let parser = MessageParser::new();
        let commits = raw
            .into_iter()
            .map(|(id, message)| Commit {
                id,
                message: parser.parse(&message),
            })
            .collect();
        CommitRange {
            base,
            target,
            commits,
        }
    }

    /// Range with no commits (base == target).
    pub fn empty(target: CommitId) -> Self {
        CommitRange {
            base: Some(target.clone()),
            target,
            commits: Vec::new(),
        }
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }
}

const BREAKING_KEYS: [&str; 2] = ["BREAKING CHANGE", "BREAKING-CHANGE"];

/// Parser for the conventional-commit grammar.
///
/// Grammar: `type(scope)!: description`, optional body paragraphs, and an
/// optional trailing footer paragraph of `Key: value` lines.
pub struct MessageParser {
    header: Regex,
    footer: Regex,
}

impl Default for MessageParser {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageParser {
    pub fn new() -> Self {
        let header = Regex::new(
            r"^(?P<type>[A-Za-z][A-Za-z0-9]*)(?:\((?P<scope>[^()]+)\))?(?P<breaking>!)?: +(?P<desc>\S.*)$",
        )
        .expect("header grammar is a valid regex");
        let footer = Regex::new(
            r"^(?P<key>BREAKING CHANGE|BREAKING-CHANGE|[A-Za-z][A-Za-z0-9-]*)(?:: +| +#)(?P<value>.+)$",
        )
        .expect("footer grammar is a valid regex");
        MessageParser { header, footer }
    }

    /// Parse a full commit message; non-matching messages become `Unparseable`.
    pub fn parse(&self, raw: &str) -> CommitMessage {
        let mut lines = raw.lines();
        let subject = match lines.next() {
            Some(s) => s.trim_end(),
            None => return CommitMessage::Unparseable(raw.to_string()),
        };

        let caps = match self.header.captures(subject) {
            Some(caps) => caps,
            None => return CommitMessage::Unparseable(raw.to_string()),
        };

        let rest: Vec<&str> = lines.collect();
        let (body, footers) = self.split_body_footers(&rest);

        let breaking = caps.name("breaking").is_some()
            || footers
                .iter()
                .any(|(key, _)| BREAKING_KEYS.contains(&key.as_str()));

        CommitMessage::Conventional(ConventionalCommit {
            type_tag: caps["type"].to_ascii_lowercase(),
            scope: caps.name("scope").map(|m| m.as_str().to_string()),
            breaking,
            description: caps["desc"].to_string(),
            body,
            footers,
        })
    }

    /// Split trailing lines into body paragraphs and a footer paragraph.
    ///
    /// The footer paragraph is the last paragraph, and only counts when every
    /// line in it matches the footer grammar.
    fn split_body_footers(&self, lines: &[&str]) -> (Option<String>, Vec<(String, String)>) {
        let trimmed: Vec<&str> = {
            let mut v = lines.to_vec();
            while v.first().is_some_and(|l| l.trim().is_empty()) {
                v.remove(0);
            }
            while v.last().is_some_and(|l| l.trim().is_empty()) {
                v.pop();
            }
            v
        };
        if trimmed.is_empty() {
            return (None, Vec::new());
        }

        // Last paragraph starts after the last blank line.
        let para_start = trimmed
            .iter()
            .rposition(|l| l.trim().is_empty())
            .map(|i| i + 1)
            .unwrap_or(0);
        let last_para = &trimmed[para_start..];

        let footers: Option<Vec<(String, String)>> = last_para
            .iter()
            .map(|line| {
                self.footer.captures(line).map(|caps| {
                    (caps["key"].to_string(), caps["value"].trim().to_string())
                })
            })
            .collect();

        match footers {
            Some(footers) if !footers.is_empty() => {
                let body_lines = if para_start == 0 {
                    &[] as &[&str]
                } else {
                    &trimmed[..para_start - 1]
                };
                let body = join_body(body_lines);
                (body, footers)
            }
            _ => (join_body(&trimmed), Vec::new()),
        }
    }
}

fn join_body(lines: &[&str]) -> Option<String> {
    let text = lines.join("\n").trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> CommitMessage {
        MessageParser::new().parse(raw)
    }

    fn conventional(raw: &str) -> ConventionalCommit {
        match parse(raw) {
            CommitMessage::Conventional(c) => c,
            CommitMessage::Unparseable(raw) => panic!("message did not parse: {raw}"),
        }
    }

    #[test]
    fn test_commit_id_short_and_lowercase() {
        let id = CommitId::new("ABCDEF0123456789abcdef0123456789abcdef01");
        assert_eq!(id.short(), "abcdef0123");
        assert_eq!(id.as_str().len(), 40);
    }

    #[test]
    fn test_parse_plain_fix() {
        let c = conventional("fix: handle empty input");
        assert_eq!(c.type_tag, "fix");
        assert_eq!(c.description, "handle empty input");
        assert!(!c.breaking);
        assert!(c.scope.is_none());
        assert!(c.footers.is_empty());
    }

    #[test]
    fn test_parse_scope_and_bang() {
        let c = conventional("feat(parser)!: drop the legacy grammar");
        assert_eq!(c.type_tag, "feat");
        assert_eq!(c.scope.as_deref(), Some("parser"));
        assert!(c.breaking);
    }

    #[test]
    fn test_parse_breaking_change_footer() {
        let c = conventional(
            "feat: new config layout\n\nRewrites the loader.\n\nBREAKING CHANGE: old keys are rejected",
        );
        assert!(c.breaking);
        assert_eq!(c.body.as_deref(), Some("Rewrites the loader."));
        assert_eq!(c.footers.len(), 1);
        assert_eq!(c.footers[0].0, "BREAKING CHANGE");
    }

    #[test]
    fn test_parse_ordered_footers() {
        let c = conventional(
            "chore: release prep\n\nReviewed-by: A\nRefs: #42",
        );
        assert_eq!(
            c.footers,
            vec![
                ("Reviewed-by".to_string(), "A".to_string()),
                ("Refs".to_string(), "#42".to_string()),
            ]
        );
    }

    #[test]
    fn test_unparseable_keeps_raw_message() {
        let raw = "update stuff";
        match parse(raw) {
            CommitMessage::Unparseable(kept) => assert_eq!(kept, raw),
            other => panic!("expected unparseable, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_space_after_colon_is_unparseable() {
        assert!(matches!(
            parse("fix:no space"),
            CommitMessage::Unparseable(_)
        ));
    }

    #[test]
    fn test_range_parse_preserves_order() {
        let range = CommitRange::parse(
            Some(CommitId::new("aaa")),
            CommitId::new("ccc"),
            vec![
                (CommitId::new("bbb"), "fix: first".to_string()),
                (CommitId::new("ccc"), "feat: second".to_string()),
            ],
        );
        assert_eq!(range.len(), 2);
        assert_eq!(range.commits()[0].id.as_str(), "bbb");
        assert_eq!(range.commits()[1].id.as_str(), "ccc");
    }

    #[test]
    fn test_empty_range() {
        let range = CommitRange::empty(CommitId::new("abc"));
        assert!(range.is_empty());
        assert_eq!(range.base, Some(CommitId::new("abc")));
    }

    #[test]
    fn test_range_serde_roundtrip() {
        let range = CommitRange::parse(
            None,
            CommitId::new("fff"),
            vec![(CommitId::new("fff"), "feat!: breaking".to_string())],
        );
        let json = serde_json::to_string(&range).expect("serialize");
        let back: CommitRange = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(range, back);
    }
}
