//! Roster reconciliation between local contact state and the remote
//! following list.
//!
//! Pure planning only. The engine applies a [`RosterPlan`] by updating its
//! own bookkeeping and sending the commands produced here; nothing in this
//! module performs IO.

use std::collections::HashSet;

use perch_link_protocol::LinkCommand;

use crate::remote::RemoteUser;
use crate::session::DisplayMode;

/// Default roster group contacts are filed under on the messaging side.
pub const ROSTER_GROUP: &str = "Perch";

/// Canonical roster key for a remote account name.
///
/// Modern messaging addresses are case-insensitive, so keys are lowercased
/// to keep `Alice` and `alice` from becoming two contacts. Sessions marked
/// with the legacy naming scheme keep the original casing their client
/// registered with.
pub fn roster_key(screen_name: &str, legacy: bool) -> String {
    if legacy {
        screen_name.to_string()
    } else {
        screen_name.to_lowercase()
    }
}

/// Additions and removals needed to make local contacts mirror the remote
/// following list.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RosterPlan {
    /// Accounts followed remotely but missing locally.
    pub add: Vec<RemoteUser>,
    /// Roster keys present locally but no longer followed remotely.
    pub remove: Vec<String>,
}

impl RosterPlan {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Compute the symmetric difference between local buddy keys and the
/// remote following list.
///
/// Output order is deterministic: additions keep the remote list's order,
/// removals are sorted.
pub fn reconcile(local: &HashSet<String>, remote: &[RemoteUser], legacy: bool) -> RosterPlan {
    let mut remote_keys = HashSet::with_capacity(remote.len());
    let mut add = Vec::new();

    for account in remote {
        let key = roster_key(&account.screen_name, legacy);
        if !local.contains(&key) {
            add.push(account.clone());
        }
        remote_keys.insert(key);
    }

    let mut remove: Vec<String> = local.difference(&remote_keys).cloned().collect();
    remove.sort();

    RosterPlan { add, remove }
}

/// Commands that establish one newly followed account in the current mode.
///
/// `SingleContact` emits nothing: content attribution is inline and the
/// synthetic contact already exists.
pub fn establish(
    user: &str,
    mode: DisplayMode,
    room: Option<&str>,
    account: &RemoteUser,
    legacy: bool,
) -> Vec<LinkCommand> {
    match mode {
        DisplayMode::SingleContact => Vec::new(),
        DisplayMode::MultiContact => {
            let key = roster_key(&account.screen_name, legacy);
            vec![
                LinkCommand::RosterAdd {
                    user: user.to_string(),
                    buddy: key.clone(),
                    alias: account.name.clone(),
                    group: Some(ROSTER_GROUP.to_string()),
                },
                LinkCommand::Presence {
                    user: user.to_string(),
                    buddy: key,
                    online: true,
                    status_message: None,
                },
            ]
        }
        DisplayMode::Chatroom => match room {
            Some(room) => vec![LinkCommand::Participant {
                user: user.to_string(),
                room: room.to_string(),
                nickname: account.screen_name.clone(),
                online: true,
            }],
            None => Vec::new(),
        },
    }
}

/// Commands that retire one contact (by roster key) in the current mode.
pub fn retire(user: &str, mode: DisplayMode, room: Option<&str>, key: &str) -> Vec<LinkCommand> {
    match mode {
        DisplayMode::SingleContact => Vec::new(),
        DisplayMode::MultiContact => vec![LinkCommand::RosterRemove {
            user: user.to_string(),
            buddy: key.to_string(),
        }],
        DisplayMode::Chatroom => match room {
            Some(room) => vec![LinkCommand::Participant {
                user: user.to_string(),
                room: room.to_string(),
                nickname: key.to_string(),
                online: false,
            }],
            None => Vec::new(),
        },
    }
}

/// Commands that clear every contact of the current mode.
///
/// A mode switch sends these for the old mode before establishing the new
/// one, so no duplicate or orphaned entries survive the switch.
pub fn teardown(
    user: &str,
    mode: DisplayMode,
    room: Option<&str>,
    buddy_keys: impl IntoIterator<Item = String>,
) -> Vec<LinkCommand> {
    let mut keys: Vec<String> = buddy_keys.into_iter().collect();
    keys.sort();

    let mut commands = Vec::new();
    for key in keys {
        commands.extend(retire(user, mode, room, &key));
    }
    commands
}

/// Commands pushed once at connect.
///
/// The synthetic gateway contact is the control surface in every mode, so
/// it is always present and online.
pub fn connect_commands(user: &str, self_contact: &str) -> Vec<LinkCommand> {
    vec![
        LinkCommand::RosterAdd {
            user: user.to_string(),
            buddy: self_contact.to_string(),
            alias: self_contact.to_string(),
            group: Some(ROSTER_GROUP.to_string()),
        },
        LinkCommand::Presence {
            user: user.to_string(),
            buddy: self_contact.to_string(),
            online: true,
            status_message: None,
        },
    ]
}
