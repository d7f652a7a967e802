//! Builder output markers.
//!
//! The external builder signals a feature outcome by emitting one of three
//! marker tokens anywhere in its captured output:
//! - `<promise>FEATURE_COMPLETE:<id></promise>`
//! - `<promise>BLOCKED:<id>:<reason></promise>`
//! - `<promise>STUCK:<id></promise>`
//!
//! Exactly one terminal marker should appear per invocation; when multiple
//! appear, the first one in text order wins.
//!
//! A `BLOCKED` reason of the form `<question> options=A|B[|C...]` is a
//! decision-shaped blocker: the worker raises it as an answerable decision
//! instead of blocking the feature outright.

use regex::Regex;
use std::sync::LazyLock;

static TERMINAL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<promise>\s*(FEATURE_COMPLETE|BLOCKED|STUCK):([A-Za-z0-9._-]+)(?::([^<]*))?\s*</promise>")
        .unwrap()
});

static DECISION_REASON_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.+?)\s+options=([^|]+(?:\|[^|]+)+)\s*$").unwrap());

/// A terminal outcome parsed from builder output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalSignal {
    Complete { feature: String },
    Blocked { feature: String, reason: String },
    Stuck { feature: String },
}

impl TerminalSignal {
    pub fn feature(&self) -> &str {
        match self {
            Self::Complete { feature }
            | Self::Blocked { feature, .. }
            | Self::Stuck { feature } => feature,
        }
    }
}

/// Find the first terminal marker in the text, if any.
pub fn first_terminal(text: &str) -> Option<TerminalSignal> {
    TERMINAL_REGEX.captures(text).and_then(signal_from_capture)
}

/// Find the first terminal marker addressed to the given feature, ignoring
/// markers that name other features.
pub fn first_terminal_for(text: &str, feature_id: &str) -> Option<TerminalSignal> {
    TERMINAL_REGEX
        .captures_iter(text)
        .filter_map(signal_from_capture)
        .find(|signal| signal.feature() == feature_id)
}

fn signal_from_capture(cap: regex::Captures<'_>) -> Option<TerminalSignal> {
    let feature = cap[2].to_string();
    match &cap[1] {
        "FEATURE_COMPLETE" => Some(TerminalSignal::Complete { feature }),
        "BLOCKED" => {
            let reason = cap
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "no reason given".to_string());
            Some(TerminalSignal::Blocked { feature, reason })
        }
        "STUCK" => Some(TerminalSignal::Stuck { feature }),
        _ => None,
    }
}

/// A blocker reason that asks a question with enumerated options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionPrompt {
    pub question: String,
    pub options: Vec<String>,
}

/// Parse a blocker reason into a decision prompt, if it matches the
/// `<question> options=A|B` pattern with at least two options.
pub fn parse_decision_reason(reason: &str) -> Option<DecisionPrompt> {
    let cap = DECISION_REASON_REGEX.captures(reason.trim())?;
    let question = cap[1].trim().to_string();
    let options: Vec<String> = cap[2]
        .split('|')
        .map(|o| o.trim().to_string())
        .filter(|o| !o.is_empty())
        .collect();
    if question.is_empty() || options.len() < 2 {
        return None;
    }
    Some(DecisionPrompt { question, options })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete() {
        let signal = first_terminal("work done <promise>FEATURE_COMPLETE:auth</promise> bye");
        assert_eq!(
            signal,
            Some(TerminalSignal::Complete {
                feature: "auth".into()
            })
        );
    }

    #[test]
    fn test_parse_blocked_with_reason() {
        let signal =
            first_terminal("<promise>BLOCKED:auth:Need the OAuth client secret</promise>");
        assert_eq!(
            signal,
            Some(TerminalSignal::Blocked {
                feature: "auth".into(),
                reason: "Need the OAuth client secret".into()
            })
        );
    }

    #[test]
    fn test_parse_blocked_without_reason() {
        let signal = first_terminal("<promise>BLOCKED:auth</promise>");
        assert_eq!(
            signal,
            Some(TerminalSignal::Blocked {
                feature: "auth".into(),
                reason: "no reason given".into()
            })
        );
    }

    #[test]
    fn test_parse_stuck() {
        let signal = first_terminal("<promise>STUCK:db-schema</promise>");
        assert_eq!(
            signal,
            Some(TerminalSignal::Stuck {
                feature: "db-schema".into()
            })
        );
    }

    #[test]
    fn test_first_marker_wins() {
        let text = r#"
            <promise>BLOCKED:auth:first one</promise>
            <promise>FEATURE_COMPLETE:auth</promise>
        "#;
        let signal = first_terminal(text).unwrap();
        assert!(matches!(signal, TerminalSignal::Blocked { .. }));
    }

    #[test]
    fn test_whitespace_inside_tag_tolerated() {
        let signal = first_terminal("<promise> FEATURE_COMPLETE:auth </promise>");
        assert_eq!(
            signal,
            Some(TerminalSignal::Complete {
                feature: "auth".into()
            })
        );
    }

    #[test]
    fn test_no_marker() {
        assert_eq!(first_terminal("Just working along, no outcome yet."), None);
        assert_eq!(first_terminal("<promise>PHASE DONE</promise>"), None);
    }

    #[test]
    fn test_feature_accessor() {
        let signal = first_terminal("<promise>STUCK:x</promise>").unwrap();
        assert_eq!(signal.feature(), "x");
    }

    #[test]
    fn test_first_terminal_for_skips_other_features() {
        let text = r#"
            <promise>FEATURE_COMPLETE:other</promise>
            <promise>FEATURE_COMPLETE:mine</promise>
        "#;
        assert_eq!(
            first_terminal_for(text, "mine"),
            Some(TerminalSignal::Complete {
                feature: "mine".into()
            })
        );
        assert_eq!(first_terminal_for(text, "absent"), None);
    }

    #[test]
    fn test_decision_reason_parsed() {
        let prompt =
            parse_decision_reason("Which auth scheme should we use? options=JWT|Sessions").unwrap();
        assert_eq!(prompt.question, "Which auth scheme should we use?");
        assert_eq!(prompt.options, vec!["JWT", "Sessions"]);
    }

    #[test]
    fn test_decision_reason_three_options_with_spaces() {
        let prompt =
            parse_decision_reason("Pick a database options=Postgres | SQLite | MySQL").unwrap();
        assert_eq!(prompt.options, vec!["Postgres", "SQLite", "MySQL"]);
    }

    #[test]
    fn test_plain_reason_is_not_a_decision() {
        assert_eq!(parse_decision_reason("Need the OAuth client secret"), None);
        // A single option is not a decision either.
        assert_eq!(parse_decision_reason("Pick one options=OnlyChoice"), None);
    }
}
