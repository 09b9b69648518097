//! Channel-control actions decided by the model.
//!
//! The system prompt teaches the LLM to close a reply with an inline
//! marker when the caller should be handed off: `[transfer:target]` or
//! `[hangup]`. The marker is stripped before synthesis so it is never
//! spoken, and relayed to the media bridge as a `call.action`.

use voxbridge_asp::CallAction;

/// A parsed action request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallActionRequest {
    pub action: CallAction,
    pub target: Option<String>,
    pub reason: Option<String>,
}

/// Extract an action marker from a model reply.
///
/// Returns the reply with the marker removed, plus the request if one
/// was present. Only the first marker counts.
#[must_use]
pub fn parse_call_action(text: &str) -> (String, Option<CallActionRequest>) {
    if let Some(start) = text.find("[transfer:") {
        if let Some(len) = text[start..].find(']') {
            let target = text[start + "[transfer:".len()..start + len].trim().to_string();
            let cleaned = strip_range(text, start, start + len + 1);
            if !target.is_empty() {
                return (
                    cleaned,
                    Some(CallActionRequest {
                        action: CallAction::Transfer,
                        target: Some(target),
                        reason: Some("agent requested transfer".to_string()),
                    }),
                );
            }
            return (cleaned, None);
        }
    }

    if let Some(start) = text.find("[hangup]") {
        let cleaned = strip_range(text, start, start + "[hangup]".len());
        return (
            cleaned,
            Some(CallActionRequest {
                action: CallAction::Hangup,
                target: None,
                reason: Some("agent ended the call".to_string()),
            }),
        );
    }

    (text.to_string(), None)
}

/// Remove any action marker, keeping only speakable text.
#[must_use]
pub fn strip_markers(text: &str) -> String {
    parse_call_action(text).0
}

fn strip_range(text: &str, start: usize, end: usize) -> String {
    let mut cleaned = String::with_capacity(text.len());
    cleaned.push_str(&text[..start]);
    cleaned.push_str(&text[end..]);
    cleaned.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_has_no_action() {
        let (text, action) = parse_call_action("Happy to help with that.");
        assert_eq!(text, "Happy to help with that.");
        assert_eq!(action, None);
    }

    #[test]
    fn transfer_marker_is_parsed_and_stripped() {
        let (text, action) =
            parse_call_action("Let me connect you to a person. [transfer:support,100]");
        assert_eq!(text, "Let me connect you to a person.");
        let action = action.unwrap();
        assert_eq!(action.action, CallAction::Transfer);
        assert_eq!(action.target.as_deref(), Some("support,100"));
    }

    #[test]
    fn hangup_marker_is_parsed_and_stripped() {
        let (text, action) = parse_call_action("Goodbye! [hangup]");
        assert_eq!(text, "Goodbye!");
        assert_eq!(action.unwrap().action, CallAction::Hangup);
    }

    #[test]
    fn empty_transfer_target_is_ignored() {
        let (text, action) = parse_call_action("Hold on. [transfer:]");
        assert_eq!(text, "Hold on.");
        assert_eq!(action, None);
    }
}
