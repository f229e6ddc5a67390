//! Parse assistant text into an ordered action list.
//!
//! Every fenced code block is one action. A block whose trimmed body is exactly
//! an emittable primitive name (`DONE`, `FAIL`, `WAIT`) is a control signal;
//! anything else is a command for the session.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::Primitive;

static FENCE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)```(.*?)```").unwrap());

static LANG_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_+.-]+$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Command(String),
    Signal(Primitive),
}

impl Action {
    /// Source text as recorded in the trajectory.
    pub fn source(&self) -> &str {
        match self {
            Action::Command(code) => code,
            Action::Signal(primitive) => primitive.as_str(),
        }
    }
}

pub fn parse_actions(text: &str) -> Vec<Action> {
    FENCE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .filter_map(|inner| block_action(inner.as_str()))
        .collect()
}

fn block_action(inner: &str) -> Option<Action> {
    let (tag, body) = match inner.split_once('\n') {
        Some((first, rest)) if LANG_TAG.is_match(first.trim()) => (Some(first.trim()), rest),
        Some((first, rest)) if first.trim().is_empty() => (None, rest),
        _ => (None, inner),
    };
    let body = body.trim();
    if body.is_empty() {
        // "```DONE\n```" reads the signal as a language tag.
        return tag.and_then(signal);
    }
    Some(signal(body).unwrap_or_else(|| Action::Command(body.to_string())))
}

fn signal(word: &str) -> Option<Action> {
    let primitive = word.parse::<Primitive>().ok()?;
    Primitive::EMITTABLE
        .contains(&primitive)
        .then_some(Action::Signal(primitive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_blocks_yields_no_actions() {
        assert!(parse_actions("I think we are done.").is_empty());
    }

    #[test]
    fn language_tag_is_dropped() {
        let actions = parse_actions("Let me open it.\n```python\nopen 1abc\n```");
        assert_eq!(actions, vec![Action::Command("open 1abc".to_string())]);
    }

    #[test]
    fn primitive_block_is_a_signal() {
        let actions = parse_actions("```\nDONE\n```");
        assert_eq!(actions, vec![Action::Signal(Primitive::Done)]);
        let inline = parse_actions("```WAIT```");
        assert_eq!(inline, vec![Action::Signal(Primitive::Wait)]);
        let tagged = parse_actions("```FAIL\n```");
        assert_eq!(tagged, vec![Action::Signal(Primitive::Fail)]);
    }

    #[test]
    fn timeout_is_not_emittable() {
        let actions = parse_actions("```\nTIMEOUT\n```");
        assert_eq!(actions, vec![Action::Command("TIMEOUT".to_string())]);
    }

    #[test]
    fn blocks_keep_their_order() {
        let text = "```\ncolor red\n```\nthen\n```bash\nsave out.pdb\n```\n```\nDONE\n```";
        let actions = parse_actions(text);
        let sources: Vec<&str> = actions.iter().map(Action::source).collect();
        assert_eq!(sources, vec!["color red", "save out.pdb", "DONE"]);
    }

    #[test]
    fn empty_block_is_skipped() {
        assert!(parse_actions("```\n\n```").is_empty());
    }
}
