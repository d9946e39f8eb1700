//! Gateway commands typed at the synthetic contact or into the room.
//!
//! A message body starting with `#` is a command; everything else is
//! published as a status. Unknown or malformed commands never reach the
//! remote service.

use crate::session::DisplayMode;

/// Usage text for `#help` and for unknown commands.
pub const HELP_TEXT: &str = "Commands: #help, #mode [single|multi|chatroom], \
#follow <name>, #unfollow <name>. Anything else is posted as a status; \
messages to a buddy contact are sent as direct messages.";

/// A parsed gateway command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCommand {
    Help,
    /// Bare `#mode`: report the current mode.
    ShowMode,
    SetMode(DisplayMode),
    Follow(String),
    Unfollow(String),
    /// Recognized shape, unusable arguments. Carries the user-facing reason.
    Invalid(String),
}

/// Parse a `#`-prefixed message body.
///
/// Returns `None` when the body is not a command at all.
pub fn parse(body: &str) -> Option<UserCommand> {
    let trimmed = body.trim();
    let rest = trimmed.strip_prefix('#')?;

    let mut words = rest.split_whitespace();
    let verb = words.next().unwrap_or_default().to_ascii_lowercase();
    let arg = words.next();

    let command = match verb.as_str() {
        "help" => UserCommand::Help,
        "mode" => match arg {
            None => UserCommand::ShowMode,
            Some(name) => match DisplayMode::parse(name) {
                Some(mode) => UserCommand::SetMode(mode),
                None => UserCommand::Invalid(format!(
                    "unknown mode '{name}'; expected single, multi or chatroom"
                )),
            },
        },
        "follow" => match arg {
            Some(name) => UserCommand::Follow(name.trim_start_matches('@').to_string()),
            None => UserCommand::Invalid("usage: #follow <name>".to_string()),
        },
        "unfollow" => match arg {
            Some(name) => UserCommand::Unfollow(name.trim_start_matches('@').to_string()),
            None => UserCommand::Invalid("usage: #unfollow <name>".to_string()),
        },
        other => UserCommand::Invalid(format!("unknown command '#{other}'; try #help")),
    };

    Some(command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse("hello world"), None);
        assert_eq!(parse("  leading spaces"), None);
        assert_eq!(parse(""), None);
    }

    #[test]
    fn help_and_mode_queries_parse() {
        assert_eq!(parse("#help"), Some(UserCommand::Help));
        assert_eq!(parse("#mode"), Some(UserCommand::ShowMode));
        assert_eq!(parse(" #HELP "), Some(UserCommand::Help));
    }

    #[test]
    fn mode_arguments_parse_or_report() {
        assert_eq!(
            parse("#mode chatroom"),
            Some(UserCommand::SetMode(DisplayMode::Chatroom))
        );
        assert!(matches!(parse("#mode sideways"), Some(UserCommand::Invalid(_))));
    }

    #[test]
    fn follow_strips_the_at_sign() {
        assert_eq!(parse("#follow @carol"), Some(UserCommand::Follow("carol".to_string())));
        assert_eq!(parse("#unfollow bob"), Some(UserCommand::Unfollow("bob".to_string())));
        assert!(matches!(parse("#follow"), Some(UserCommand::Invalid(_))));
    }

    #[test]
    fn unknown_verbs_are_invalid() {
        assert!(matches!(parse("#frobnicate"), Some(UserCommand::Invalid(_))));
    }
}
