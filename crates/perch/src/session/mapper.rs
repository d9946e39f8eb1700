//! Pure translation from remote payloads to outbound link commands.
//!
//! No IO and no session mutation happens here. The engine hands in a
//! [`DeliveryContext`] snapshot plus a remote result and sends whatever
//! comes back; cursor values returned here are persisted by the engine
//! before the commands are dispatched.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use perch_link_protocol::{LinkCommand, error_kinds};

use crate::remote::{ApiError, DirectMessage, RemoteUser, Status};
use crate::session::DisplayMode;
use crate::session::roster::{self, roster_key};

/// Immutable view of the session fields the mapper needs.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryContext<'a> {
    /// Messaging-network address of the session owner.
    pub user: &'a str,
    pub mode: DisplayMode,
    /// The synthetic gateway contact.
    pub self_contact: &'a str,
    /// Joined room, when the session is in chatroom mode.
    pub room: Option<&'a str>,
    /// Legacy naming scheme: roster keys keep their original casing.
    pub legacy: bool,
}

// ============================================================================
// Poll results
// ============================================================================

/// Map a timeline page to delivery commands.
///
/// Statuses are delivered oldest to newest by id regardless of the order
/// the remote returned them in. The second element is the highest id seen,
/// `None` for an empty page.
pub fn map_timeline(ctx: DeliveryContext<'_>, mut statuses: Vec<Status>) -> (Vec<LinkCommand>, Option<u64>) {
    statuses.sort_by_key(|status| status.id);
    let cursor = statuses.last().map(|status| status.id);

    let commands = statuses
        .into_iter()
        .map(|status| deliver_status(ctx, status))
        .collect();

    (commands, cursor)
}

fn deliver_status(ctx: DeliveryContext<'_>, status: Status) -> LinkCommand {
    let author = status.author.screen_name;
    match (ctx.mode, ctx.room) {
        (DisplayMode::MultiContact, _) => LinkCommand::DeliverMessage {
            user: ctx.user.to_string(),
            from: roster_key(&author, ctx.legacy),
            body: status.text,
            room: None,
            timestamp: status.created_at,
        },
        (DisplayMode::Chatroom, Some(room)) => LinkCommand::DeliverMessage {
            user: ctx.user.to_string(),
            from: author,
            body: status.text,
            room: Some(room.to_string()),
            timestamp: status.created_at,
        },
        // Single-contact, or chatroom before the room is joined.
        _ => LinkCommand::DeliverMessage {
            user: ctx.user.to_string(),
            from: ctx.self_contact.to_string(),
            body: format!("{author}: {}", status.text),
            room: None,
            timestamp: status.created_at,
        },
    }
}

/// Map a direct-message page to delivery commands.
///
/// Direct messages are always private, never room traffic: in multi-contact
/// mode they arrive from the sender's contact, otherwise through the
/// synthetic contact with the sender named inline. Same ordering and cursor
/// rule as [`map_timeline`].
pub fn map_direct_messages(
    ctx: DeliveryContext<'_>,
    mut messages: Vec<DirectMessage>,
) -> (Vec<LinkCommand>, Option<u64>) {
    messages.sort_by_key(|message| message.id);
    let cursor = messages.last().map(|message| message.id);

    let commands = messages
        .into_iter()
        .map(|message| {
            let sender = message.sender.screen_name;
            match ctx.mode {
                DisplayMode::MultiContact => LinkCommand::DeliverMessage {
                    user: ctx.user.to_string(),
                    from: roster_key(&sender, ctx.legacy),
                    body: message.text,
                    room: None,
                    timestamp: message.created_at,
                },
                _ => LinkCommand::DeliverMessage {
                    user: ctx.user.to_string(),
                    from: ctx.self_contact.to_string(),
                    body: format!("Direct message from {sender}: {}", message.text),
                    room: None,
                    timestamp: message.created_at,
                },
            }
        })
        .collect();

    (commands, cursor)
}

// ============================================================================
// Roster changes
// ============================================================================

/// Commands for a confirmed follow: mode-appropriate contact establishment
/// plus a textual confirmation.
pub fn map_follow(ctx: DeliveryContext<'_>, account: &RemoteUser) -> Vec<LinkCommand> {
    let mut commands = roster::establish(ctx.user, ctx.mode, ctx.room, account, ctx.legacy);
    commands.push(notice(ctx, format!("Now following {}", account.screen_name)));
    commands
}

/// Commands for a confirmed unfollow.
pub fn map_unfollow(ctx: DeliveryContext<'_>, account: &RemoteUser) -> Vec<LinkCommand> {
    let key = roster_key(&account.screen_name, ctx.legacy);
    let mut commands = roster::retire(ctx.user, ctx.mode, ctx.room, &key);
    commands.push(notice(ctx, format!("Stopped following {}", account.screen_name)));
    commands
}

// ============================================================================
// Profile cards
// ============================================================================

/// Profile-card reply for a vcard request.
///
/// Every request gets exactly one reply carrying the request id it came in
/// with; a failed avatar fetch still answers, just without the image.
pub fn map_avatar(
    user: &str,
    request_id: u32,
    target: &str,
    full_name: Option<&str>,
    avatar: Option<&[u8]>,
) -> LinkCommand {
    LinkCommand::Vcard {
        user: user.to_string(),
        request_id,
        legacy_name: target.to_string(),
        full_name: full_name.unwrap_or(target).to_string(),
        avatar: avatar.map(|bytes| BASE64.encode(bytes)),
    }
}

// ============================================================================
// Errors and notices
// ============================================================================

/// Map a remote failure to a user-visible diagnostic. Never silent.
pub fn map_error(user: &str, context: &str, error: &ApiError) -> LinkCommand {
    let kind = if error.is_auth() {
        error_kinds::AUTH
    } else {
        error_kinds::API
    };
    LinkCommand::error(user, kind, format!("{context}: {error}"))
}

/// Informational text through the synthetic contact.
pub fn notice(ctx: DeliveryContext<'_>, text: impl Into<String>) -> LinkCommand {
    LinkCommand::DeliverMessage {
        user: ctx.user.to_string(),
        from: ctx.self_contact.to_string(),
        body: text.into(),
        room: None,
        timestamp: None,
    }
}
