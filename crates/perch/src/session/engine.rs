//! The session engine: a single actor task owning every session.
//!
//! All session state lives behind one mpsc channel. The transport link, the
//! poll timers and finished worker jobs all feed [`EngineCommand`]s into the
//! same loop, so session mutation is single-threaded by construction and
//! needs no locks. Remote calls never run here; they are submitted to the
//! worker pool and come back as [`RemoteOutcome`] completions tagged with
//! the user they belong to.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use perch_link_protocol::{LinkCommand, LinkEvent, error_kinds};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::pool::WorkerPool;
use crate::remote::{
    AccessGrant, ApiResult, Credentials, DirectMessage, RemoteApi, RemoteHandle, RemoteUser,
    RequestToken, Status,
};
use crate::session::command::{self, HELP_TEXT, UserCommand};
use crate::session::events::{
    COMMAND_CAPACITY, EngineCommand, RemoteEvent, RemoteOutcome, SessionSummary,
};
use crate::session::handle::EngineHandle;
use crate::session::mapper::{self, DeliveryContext};
use crate::session::roster::{self, roster_key};
use crate::session::state::{ConnectionState, CursorKind, DisplayMode};
use crate::store::{UserRecord, UserStore};

const SHUTDOWN_REASON: &str = "gateway shutting down";

// ============================================================================
// Session
// ============================================================================

/// Everything the engine tracks for one logged-in user.
///
/// Created by a login event, mutated only on the engine task, destroyed by
/// logout, auth revocation or shutdown. `handle` is `Some` exactly while
/// `state` is `Connected`.
struct Session {
    /// Messaging-network identity, the registry key.
    user_id: String,
    /// Remote-service account name the user registered with. Doubles as the
    /// synthetic gateway contact.
    legacy_name: String,
    /// Deprecated naming scheme: roster keys keep their original casing.
    legacy_scheme: bool,
    screen_name: Option<String>,
    profile: Option<RemoteUser>,
    avatar: Option<Vec<u8>>,
    handle: Option<RemoteHandle>,
    state: ConnectionState,
    status_cursor: u64,
    dm_cursor: u64,
    nickname: String,
    buddies: HashSet<String>,
    buddy_profiles: HashMap<String, RemoteUser>,
    buddy_avatars: HashMap<String, Vec<u8>>,
    mode: DisplayMode,
    /// Joined chatroom, when in chatroom mode.
    room: Option<String>,
    /// Held during the PIN wait.
    request_token: Option<RequestToken>,
    /// Stored credentials awaiting verification at login.
    pending_credentials: Option<Credentials>,
    pin_exchange_inflight: bool,
    /// At most one outstanding fetch per poll pipeline.
    poll_inflight: [bool; 2],
    /// Cursor values whose last write failed; retried at the next write.
    dirty_cursors: [bool; 2],
    connected_at: Option<DateTime<Utc>>,
}

impl Session {
    fn new(
        user_id: String,
        legacy_name: String,
        record: &UserRecord,
        default_mode: DisplayMode,
    ) -> Self {
        Session {
            user_id,
            nickname: legacy_name.clone(),
            legacy_name,
            legacy_scheme: record.legacy_scheme,
            screen_name: record.screen_name.clone(),
            profile: None,
            avatar: None,
            handle: None,
            state: ConnectionState::New,
            status_cursor: record.status_cursor,
            dm_cursor: record.dm_cursor,
            buddies: HashSet::new(),
            buddy_profiles: HashMap::new(),
            buddy_avatars: HashMap::new(),
            mode: record.mode.unwrap_or(default_mode),
            room: None,
            request_token: None,
            pending_credentials: None,
            pin_exchange_inflight: false,
            poll_inflight: [false; 2],
            dirty_cursors: [false; 2],
            connected_at: None,
        }
    }

    fn delivery(&self) -> DeliveryContext<'_> {
        DeliveryContext {
            user: &self.user_id,
            mode: self.mode,
            self_contact: &self.legacy_name,
            room: self.room.as_deref(),
            legacy: self.legacy_scheme,
        }
    }

    fn cursor(&self, kind: CursorKind) -> u64 {
        match kind {
            CursorKind::Status => self.status_cursor,
            CursorKind::DirectMessage => self.dm_cursor,
        }
    }

    /// Advance a cursor. Cursors never move backwards.
    fn advance_cursor(&mut self, kind: CursorKind, id: u64) {
        let slot = match kind {
            CursorKind::Status => &mut self.status_cursor,
            CursorKind::DirectMessage => &mut self.dm_cursor,
        };
        *slot = (*slot).max(id);
    }

    /// Roster key of the synthetic gateway contact.
    fn self_key(&self) -> String {
        roster_key(&self.legacy_name, self.legacy_scheme)
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            user: self.user_id.clone(),
            screen_name: self.screen_name.clone(),
            state: self.state,
            mode: self.mode,
            buddies: self.buddies.len(),
            status_cursor: self.status_cursor,
            dm_cursor: self.dm_cursor,
            connected_at: self.connected_at,
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Dependencies handed to [`Engine::spawn`].
pub struct EngineConfig {
    pub store: Arc<dyn UserStore>,
    pub api: Arc<dyn RemoteApi>,
    pub pool: WorkerPool,
    /// Commands for the transport link's write half.
    pub outbound: mpsc::Sender<LinkCommand>,
    /// Mode for users with no persisted preference.
    pub default_mode: DisplayMode,
    /// Room name suggested when switching to chatroom mode.
    pub chatroom_name: String,
}

/// The actor. Owns the session registry; lives on its own task.
pub struct Engine {
    sessions: HashMap<String, Session>,
    store: Arc<dyn UserStore>,
    api: Arc<dyn RemoteApi>,
    pool: WorkerPool,
    outbound: mpsc::Sender<LinkCommand>,
    /// Workers post their completions back through this sender.
    self_tx: mpsc::Sender<EngineCommand>,
    default_mode: DisplayMode,
    chatroom_name: String,
}

impl Engine {
    /// Start the engine task. Returns the cloneable command front and the
    /// task handle to await on shutdown.
    pub fn spawn(
        config: EngineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);

        let engine = Engine {
            sessions: HashMap::new(),
            store: config.store,
            api: config.api,
            pool: config.pool,
            outbound: config.outbound,
            self_tx: tx.clone(),
            default_mode: config.default_mode,
            chatroom_name: config.chatroom_name,
        };

        let handle = EngineHandle::new(tx);
        let join = tokio::spawn(engine.command_loop(rx, shutdown));
        (handle, join)
    }

    async fn command_loop(
        mut self,
        mut rx: mpsc::Receiver<EngineCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Session engine started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped shutdown sender means the daemon driver is
                    // gone; treat it the same as an explicit stop.
                    if changed.is_err() || *shutdown.borrow() {
                        self.disconnect_all(SHUTDOWN_REASON).await;
                        break;
                    }
                }
                command = rx.recv() => match command {
                    Some(EngineCommand::Shutdown { reply }) => {
                        self.disconnect_all(SHUTDOWN_REASON).await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.disconnect_all(SHUTDOWN_REASON).await;
                        break;
                    }
                }
            }
        }
        info!("Session engine stopped");
    }

    async fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::Link(event) => self.handle_link(event).await,
            EngineCommand::PollTick { kind } => self.handle_poll_tick(kind).await,
            EngineCommand::Remote(event) => self.handle_remote(event).await,
            EngineCommand::Sessions { reply } => {
                let mut summaries: Vec<SessionSummary> =
                    self.sessions.values().map(Session::summary).collect();
                summaries.sort_by(|a, b| a.user.cmp(&b.user));
                let _ = reply.send(summaries);
            }
            // Handled in the loop so it can break.
            EngineCommand::Shutdown { .. } => {}
        }
    }

    // ------------------------------------------------------------------------
    // Link events
    // ------------------------------------------------------------------------

    async fn handle_link(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Login {
                user,
                legacy_name,
                password,
            } => self.handle_login(user, legacy_name, password).await,
            LinkEvent::Logout { user } => self.disconnect_session(&user, "logged out").await,
            LinkEvent::SendMessage { user, target, body } => {
                self.handle_send_message(user, target, body).await
            }
            LinkEvent::BuddyAdded { user, buddy } => self.handle_buddy_added(&user, &buddy).await,
            LinkEvent::BuddyRemoved { user, buddy } => {
                self.handle_buddy_removed(&user, &buddy).await
            }
            LinkEvent::VcardRequest {
                user,
                target,
                request_id,
            } => self.handle_vcard_request(user, target, request_id).await,
            LinkEvent::JoinRoom {
                user,
                room,
                nickname,
            } => self.handle_join_room(user, room, nickname).await,
            LinkEvent::LeaveRoom { user, room } => self.handle_leave_room(&user, &room).await,
        }
    }

    async fn handle_login(&mut self, user: String, legacy_name: String, password: Option<String>) {
        if let Some(session) = self.sessions.get(&user) {
            match session.state {
                ConnectionState::AwaitingPin => {
                    let pin = password.map(|p| p.trim().to_string()).filter(|p| !p.is_empty());
                    match pin {
                        Some(pin) => self.complete_authentication(&user, pin).await,
                        None => {
                            if let Some(url) =
                                session.request_token.as_ref().map(|t| t.authorize_url.clone())
                            {
                                Self::notify(
                                    &self.outbound,
                                    session,
                                    format!(
                                        "Visit {url} and reply with the PIN to finish signing in."
                                    ),
                                );
                            }
                        }
                    }
                }
                ConnectionState::Connected => {
                    Self::send(&self.outbound, LinkCommand::Connected { user });
                }
                _ => debug!(user = %user, "Login while sign-in already in progress, ignoring"),
            }
            return;
        }

        let record = match self.store.record(&user).await {
            Ok(record) => record,
            Err(error) => {
                warn!(user = %user, %error, "User record unavailable, starting from defaults");
                UserRecord::default()
            }
        };

        let mut session = Session::new(user.clone(), legacy_name, &record, self.default_mode);
        let stored = record.credentials();
        info!(
            user = %user,
            legacy_name = %session.legacy_name,
            stored_credentials = stored.is_some(),
            "Session created"
        );

        match stored {
            Some(credentials) => {
                session.pending_credentials = Some(credentials.clone());
                self.sessions.insert(user.clone(), session);
                let api = Arc::clone(&self.api);
                self.spawn_job(&user, "verify", async move {
                    RemoteOutcome::Verify(api.verify(&credentials).await)
                });
            }
            None => {
                self.sessions.insert(user.clone(), session);
                self.begin_authentication(&user);
            }
        }
    }

    async fn handle_send_message(&mut self, user: String, target: String, body: String) {
        let Some(session) = self.sessions.get_mut(&user) else {
            Self::send(
                &self.outbound,
                LinkCommand::error(&user, error_kinds::NOT_CONNECTED, "not signed in"),
            );
            return;
        };

        match session.state {
            // Whatever the user types while a PIN is pending is the PIN.
            ConnectionState::AwaitingPin => {
                let pin = body.trim().to_string();
                self.complete_authentication(&user, pin).await;
                return;
            }
            ConnectionState::Connected => {}
            _ => {
                Self::send(
                    &self.outbound,
                    LinkCommand::error(&user, error_kinds::NOT_CONNECTED, "sign-in in progress"),
                );
                return;
            }
        }

        let target_key = roster_key(&target, session.legacy_scheme);
        let to_room =
            session.mode == DisplayMode::Chatroom && session.room.as_deref() == Some(target.as_str());
        let to_gateway = to_room || target_key == session.self_key();

        if to_gateway {
            if let Some(parsed) = command::parse(&body) {
                self.run_user_command(&user, parsed).await;
                return;
            }
            let Some(handle) = session.handle.clone() else {
                return;
            };
            self.spawn_job(&user, "post_status", async move {
                RemoteOutcome::Posted(handle.post_status(&body).await)
            });
        } else {
            let Some(handle) = session.handle.clone() else {
                return;
            };
            // Use the canonical screen name when the contact is known.
            let to = session
                .buddy_profiles
                .get(&target_key)
                .map(|profile| profile.screen_name.clone())
                .unwrap_or(target);
            self.spawn_job(&user, "send_direct_message", async move {
                RemoteOutcome::DmSent(handle.send_direct_message(&to, &body).await)
            });
        }
    }

    async fn run_user_command(&mut self, user: &str, parsed: UserCommand) {
        match parsed {
            UserCommand::Help => {
                if let Some(session) = self.sessions.get(user) {
                    Self::notify(&self.outbound, session, HELP_TEXT);
                }
            }
            UserCommand::ShowMode => {
                if let Some(session) = self.sessions.get(user) {
                    let text = format!("Current mode: {}.", session.mode);
                    Self::notify(&self.outbound, session, text);
                }
            }
            UserCommand::SetMode(mode) => self.switch_mode(user, mode).await,
            UserCommand::Follow(name) => {
                let Some(handle) = self.connected_handle(user) else {
                    return;
                };
                self.spawn_job(user, "follow", async move {
                    RemoteOutcome::Followed(handle.follow(&name).await)
                });
            }
            UserCommand::Unfollow(name) => {
                let Some(handle) = self.connected_handle(user) else {
                    return;
                };
                self.spawn_job(user, "unfollow", async move {
                    RemoteOutcome::Unfollowed(handle.unfollow(&name).await)
                });
            }
            UserCommand::Invalid(message) => {
                Self::send(
                    &self.outbound,
                    LinkCommand::error(user, error_kinds::COMMAND, message),
                );
            }
        }
    }

    async fn handle_buddy_added(&mut self, user: &str, buddy: &str) {
        let Some(session) = self.sessions.get(user) else {
            return;
        };
        if roster_key(buddy, session.legacy_scheme) == session.self_key() {
            return;
        }
        let Some(handle) = self.connected_handle(user) else {
            debug!(user = %user, buddy, "Buddy added while not connected, ignoring");
            return;
        };
        let name = buddy.trim_start_matches('@').to_string();
        self.spawn_job(user, "follow", async move {
            RemoteOutcome::Followed(handle.follow(&name).await)
        });
    }

    async fn handle_buddy_removed(&mut self, user: &str, buddy: &str) {
        let Some(session) = self.sessions.get(user) else {
            return;
        };
        if roster_key(buddy, session.legacy_scheme) == session.self_key() {
            return;
        }
        let Some(handle) = self.connected_handle(user) else {
            debug!(user = %user, buddy, "Buddy removed while not connected, ignoring");
            return;
        };
        let name = buddy.trim_start_matches('@').to_string();
        self.spawn_job(user, "unfollow", async move {
            RemoteOutcome::Unfollowed(handle.unfollow(&name).await)
        });
    }

    async fn handle_vcard_request(&mut self, user: String, target: String, request_id: u32) {
        let Some(session) = self.sessions.get(&user) else {
            // The request must not dangle even without a session.
            Self::send(
                &self.outbound,
                mapper::map_avatar(&user, request_id, &target, None, None),
            );
            return;
        };

        let key = roster_key(&target, session.legacy_scheme);
        let is_self = key == session.self_key();

        let full_name = if is_self {
            session
                .profile
                .as_ref()
                .map(|profile| profile.name.clone())
                .or_else(|| session.screen_name.clone())
        } else {
            session.buddy_profiles.get(&key).map(|profile| profile.name.clone())
        };

        let cached = if is_self {
            session.avatar.clone()
        } else {
            session.buddy_avatars.get(&key).cloned()
        };
        if let Some(bytes) = cached {
            Self::send(
                &self.outbound,
                mapper::map_avatar(&user, request_id, &target, full_name.as_deref(), Some(&bytes)),
            );
            return;
        }

        let url = if is_self {
            session.profile.as_ref().and_then(|profile| profile.avatar_url.clone())
        } else {
            session
                .buddy_profiles
                .get(&key)
                .and_then(|profile| profile.avatar_url.clone())
        };
        match url {
            Some(url) => {
                let api = Arc::clone(&self.api);
                self.spawn_job(&user, "avatar", async move {
                    RemoteOutcome::Avatar {
                        request_id,
                        target,
                        result: api.avatar(&url).await,
                    }
                });
            }
            // No image known; answer with names only.
            None => Self::send(
                &self.outbound,
                mapper::map_avatar(&user, request_id, &target, full_name.as_deref(), None),
            ),
        }
    }

    async fn handle_join_room(&mut self, user: String, room: String, nickname: String) {
        let Some(session) = self.sessions.get_mut(&user) else {
            Self::send(
                &self.outbound,
                LinkCommand::error(&user, error_kinds::NOT_CONNECTED, "not signed in"),
            );
            return;
        };
        session.nickname = nickname;

        if session.mode != DisplayMode::Chatroom {
            self.switch_mode(&user, DisplayMode::Chatroom).await;
        }

        let Some(session) = self.sessions.get_mut(&user) else {
            return;
        };
        let mut commands = Vec::new();
        if let Some(previous) = session.room.take() {
            if previous != room {
                let keys: Vec<String> = session.buddies.iter().cloned().collect();
                commands.extend(roster::teardown(
                    &user,
                    DisplayMode::Chatroom,
                    Some(&previous),
                    keys,
                ));
            }
        }
        session.room = Some(room.clone());
        info!(user = %user, room = %room, "Joined room");

        let legacy = session.legacy_scheme;
        let mut accounts: Vec<RemoteUser> = session.buddy_profiles.values().cloned().collect();
        accounts.sort_by(|a, b| a.screen_name.cmp(&b.screen_name));
        for account in &accounts {
            commands.extend(roster::establish(
                &user,
                DisplayMode::Chatroom,
                Some(&room),
                account,
                legacy,
            ));
        }
        Self::send_all(&self.outbound, commands);
    }

    async fn handle_leave_room(&mut self, user: &str, room: &str) {
        let Some(session) = self.sessions.get_mut(user) else {
            return;
        };
        if session.mode != DisplayMode::Chatroom || session.room.as_deref() != Some(room) {
            debug!(user = %user, room, "Leave for a room the session is not in, ignoring");
            return;
        }
        // The transport already dropped the occupants with the room itself.
        session.room = None;
        info!(user = %user, room, "Left room");
        self.switch_mode(user, DisplayMode::SingleContact).await;
    }

    // ------------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------------

    /// Start the PIN flow: fetch a request token on the pool. The session
    /// stays `New` until the token arrives.
    fn begin_authentication(&self, user: &str) {
        let Some(session) = self.sessions.get(user) else {
            return;
        };
        if session.handle.is_some() {
            debug!(user = %user, "Authentication requested on a connected session, ignoring");
            return;
        }
        let api = Arc::clone(&self.api);
        self.spawn_job(user, "request_token", async move {
            RemoteOutcome::RequestToken(api.request_token().await)
        });
    }

    /// Exchange a PIN for an access token. Submissions are serialized: a
    /// second PIN while one is outstanding is turned away.
    async fn complete_authentication(&mut self, user: &str, pin: String) {
        let Some(session) = self.sessions.get_mut(user) else {
            return;
        };
        if session.state != ConnectionState::AwaitingPin {
            Self::send(
                &self.outbound,
                LinkCommand::error(user, error_kinds::AUTH, "no authorization in progress"),
            );
            return;
        }
        if pin.is_empty() {
            Self::send(
                &self.outbound,
                LinkCommand::error(user, error_kinds::AUTH, "empty PIN"),
            );
            return;
        }
        if session.pin_exchange_inflight {
            Self::notify(
                &self.outbound,
                session,
                "Still checking the previous PIN, hold on.",
            );
            return;
        }
        let Some(request) = session.request_token.clone() else {
            Self::send(
                &self.outbound,
                LinkCommand::error(
                    user,
                    error_kinds::AUTH,
                    "no pending authorization; log in again to restart",
                ),
            );
            return;
        };

        session.pin_exchange_inflight = true;
        let api = Arc::clone(&self.api);
        self.spawn_job(user, "exchange_pin", async move {
            RemoteOutcome::PinExchange(api.exchange_pin(&request, &pin).await)
        });
    }

    /// Bind credentials to the session and enter `Connected`. Shared by the
    /// PIN flow and the stored-credential login path.
    async fn connect_session(
        &mut self,
        user: &str,
        credentials: Credentials,
        screen_name: Option<String>,
    ) {
        let handle = RemoteHandle::new(Arc::clone(&self.api), credentials.clone());
        let need_profile;
        {
            let Some(session) = self.sessions.get_mut(user) else {
                return;
            };
            let next = match session.state.transition(ConnectionState::Connected) {
                Ok(next) => next,
                Err(error) => {
                    warn!(user = %user, %error, "Refusing connect");
                    return;
                }
            };

            // Persisting first means a crash before the flip replays the
            // auth flow instead of losing the token.
            if let Err(error) = self.store.set_credentials(user, &credentials).await {
                warn!(user = %user, %error, "Failed to persist credentials");
                Self::send(
                    &self.outbound,
                    LinkCommand::error(
                        user,
                        error_kinds::STORAGE,
                        "credentials could not be saved; you may need to authorize again after a restart",
                    ),
                );
            }
            if let Some(name) = screen_name.as_deref() {
                if let Err(error) = self.store.set_screen_name(user, name).await {
                    warn!(user = %user, %error, "Failed to persist screen name");
                }
            }

            session.state = next;
            session.handle = Some(handle.clone());
            session.request_token = None;
            session.pending_credentials = None;
            session.pin_exchange_inflight = false;
            session.connected_at = Some(Utc::now());
            if screen_name.is_some() {
                session.screen_name = screen_name;
            }
            need_profile = session.profile.is_none();
            info!(user = %user, mode = %session.mode, "Session connected");

            let mut commands = vec![LinkCommand::Connected {
                user: user.to_string(),
            }];
            commands.extend(roster::connect_commands(user, &session.legacy_name));
            Self::send_all(&self.outbound, commands);
        }

        if need_profile {
            let verify_handle = handle.clone();
            self.spawn_job(user, "verify", async move {
                RemoteOutcome::Verify(verify_handle.verify().await)
            });
        }
        self.spawn_job(user, "friends", async move {
            RemoteOutcome::Friends(handle.friends().await)
        });
    }

    // ------------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------------

    async fn handle_poll_tick(&mut self, kind: CursorKind) {
        let mut due = Vec::new();
        for session in self.sessions.values_mut() {
            // Eligibility is decided here, at submission time, not when the
            // timer fired.
            if session.state != ConnectionState::Connected {
                continue;
            }
            if session.poll_inflight[kind.index()] {
                debug!(user = %session.user_id, kind = %kind, "Poll still in flight, skipping");
                continue;
            }
            let Some(handle) = session.handle.clone() else {
                continue;
            };
            session.poll_inflight[kind.index()] = true;
            let since = match session.cursor(kind) {
                0 => None,
                cursor => Some(cursor),
            };
            due.push((session.user_id.clone(), handle, since));
        }

        for (user, handle, since) in due {
            match kind {
                CursorKind::Status => self.spawn_job(&user, "poll_timeline", async move {
                    RemoteOutcome::Timeline(handle.home_timeline(since).await)
                }),
                CursorKind::DirectMessage => {
                    self.spawn_job(&user, "poll_direct_messages", async move {
                        RemoteOutcome::DirectMessages(handle.direct_messages(since).await)
                    })
                }
            }
        }
    }

    async fn on_timeline(&mut self, user: &str, result: ApiResult<Vec<Status>>) {
        let kind = CursorKind::Status;
        let Some(session) = self.sessions.get_mut(user) else {
            return;
        };
        session.poll_inflight[kind.index()] = false;
        if session.state != ConnectionState::Connected {
            debug!(user = %user, kind = %kind, "Poll result for a non-connected session, discarding");
            return;
        }

        match result {
            Ok(page) => {
                let previous = session.cursor(kind);
                let fresh: Vec<Status> =
                    page.into_iter().filter(|status| status.id > previous).collect();
                let (commands, advanced) = mapper::map_timeline(session.delivery(), fresh);
                if let Some(id) = advanced {
                    session.advance_cursor(kind, id);
                }
                let need_persist = advanced.is_some() || session.dirty_cursors[kind.index()];
                if need_persist {
                    self.persist_cursor(user, kind).await;
                }
                Self::send_all(&self.outbound, commands);
            }
            Err(error) if error.is_auth() => {
                Self::send(&self.outbound, mapper::map_error(user, "timeline poll", &error));
                self.disconnect_session(user, "authorization revoked").await;
            }
            Err(error) => {
                warn!(user = %user, kind = %kind, %error, "Poll failed, skipping this cycle");
            }
        }
    }

    async fn on_direct_messages(&mut self, user: &str, result: ApiResult<Vec<DirectMessage>>) {
        let kind = CursorKind::DirectMessage;
        let Some(session) = self.sessions.get_mut(user) else {
            return;
        };
        session.poll_inflight[kind.index()] = false;
        if session.state != ConnectionState::Connected {
            debug!(user = %user, kind = %kind, "Poll result for a non-connected session, discarding");
            return;
        }

        match result {
            Ok(page) => {
                let previous = session.cursor(kind);
                let fresh: Vec<DirectMessage> =
                    page.into_iter().filter(|message| message.id > previous).collect();
                let (commands, advanced) = mapper::map_direct_messages(session.delivery(), fresh);
                if let Some(id) = advanced {
                    session.advance_cursor(kind, id);
                }
                let need_persist = advanced.is_some() || session.dirty_cursors[kind.index()];
                if need_persist {
                    self.persist_cursor(user, kind).await;
                }
                Self::send_all(&self.outbound, commands);
            }
            Err(error) if error.is_auth() => {
                Self::send(
                    &self.outbound,
                    mapper::map_error(user, "direct message poll", &error),
                );
                self.disconnect_session(user, "authorization revoked").await;
            }
            Err(error) => {
                warn!(user = %user, kind = %kind, %error, "Poll failed, skipping this cycle");
            }
        }
    }

    /// Write a cursor through to the store. A failure marks it dirty so the
    /// next write retries; the value itself is never rolled back.
    async fn persist_cursor(&mut self, user: &str, kind: CursorKind) {
        let Some(session) = self.sessions.get_mut(user) else {
            return;
        };
        let value = session.cursor(kind);
        match self.store.set_cursor(user, kind, value).await {
            Ok(()) => session.dirty_cursors[kind.index()] = false,
            Err(error) => {
                session.dirty_cursors[kind.index()] = true;
                warn!(user = %user, kind = %kind, %error, "Cursor write failed, will retry");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Remote completions
    // ------------------------------------------------------------------------

    async fn handle_remote(&mut self, event: RemoteEvent) {
        let RemoteEvent { user, outcome } = event;
        if !self.sessions.contains_key(&user) {
            // The session logged out while the job ran.
            debug!(user = %user, job = outcome.label(), "Discarding completion for a session that is gone");
            return;
        }

        match outcome {
            RemoteOutcome::RequestToken(result) => self.on_request_token(&user, result).await,
            RemoteOutcome::PinExchange(result) => self.on_pin_exchange(&user, result).await,
            RemoteOutcome::Verify(result) => self.on_verify(&user, result).await,
            RemoteOutcome::Timeline(result) => self.on_timeline(&user, result).await,
            RemoteOutcome::DirectMessages(result) => self.on_direct_messages(&user, result).await,
            RemoteOutcome::Posted(result) => self.on_posted(&user, result).await,
            RemoteOutcome::DmSent(result) => self.on_dm_sent(&user, result).await,
            RemoteOutcome::Followed(result) => self.on_followed(&user, result).await,
            RemoteOutcome::Unfollowed(result) => self.on_unfollowed(&user, result).await,
            RemoteOutcome::Friends(result) => self.on_friends(&user, result).await,
            RemoteOutcome::Avatar {
                request_id,
                target,
                result,
            } => self.on_avatar(&user, request_id, target, result).await,
        }
    }

    async fn on_request_token(&mut self, user: &str, result: ApiResult<RequestToken>) {
        match result {
            Ok(token) => {
                let Some(session) = self.sessions.get_mut(user) else {
                    return;
                };
                if session.state != ConnectionState::New {
                    debug!(user = %user, state = %session.state, "Stale request token, discarding");
                    return;
                }
                match session.state.transition(ConnectionState::AwaitingPin) {
                    Ok(next) => session.state = next,
                    Err(error) => {
                        warn!(user = %user, %error, "Request token arrived in a bad state");
                        return;
                    }
                }
                let url = token.authorize_url.clone();
                session.request_token = Some(token);
                info!(user = %user, "Awaiting PIN");
                Self::notify(
                    &self.outbound,
                    session,
                    format!("Visit {url} and reply with the PIN to finish signing in."),
                );
            }
            Err(error) => {
                warn!(user = %user, %error, "Request token fetch failed");
                Self::send(
                    &self.outbound,
                    LinkCommand::error(
                        user,
                        error_kinds::AUTH,
                        format!("could not start authorization: {error}; log in again to retry"),
                    ),
                );
                // Drop the session so the retry the message asks for is
                // possible; a login on an existing entry is ignored.
                self.disconnect_session(user, "authorization could not be started")
                    .await;
            }
        }
    }

    async fn on_pin_exchange(&mut self, user: &str, result: ApiResult<AccessGrant>) {
        let Some(session) = self.sessions.get_mut(user) else {
            return;
        };
        session.pin_exchange_inflight = false;
        if session.state != ConnectionState::AwaitingPin {
            // A second exchange resolved after the first already connected.
            debug!(user = %user, state = %session.state, "Stale PIN exchange, discarding");
            return;
        }

        match result {
            Ok(grant) => {
                self.connect_session(user, grant.credentials, grant.screen_name)
                    .await;
            }
            Err(error) => {
                info!(user = %user, %error, "PIN rejected");
                Self::send(
                    &self.outbound,
                    LinkCommand::error(user, error_kinds::AUTH, format!("PIN rejected: {error}")),
                );
            }
        }
    }

    async fn on_verify(&mut self, user: &str, result: ApiResult<RemoteUser>) {
        let Some(session) = self.sessions.get_mut(user) else {
            return;
        };
        match session.state {
            // Stored-credential login.
            ConnectionState::New => match result {
                Ok(profile) => {
                    let Some(credentials) = session.pending_credentials.take() else {
                        warn!(user = %user, "Verify succeeded without pending credentials");
                        return;
                    };
                    let screen_name = Some(profile.screen_name.clone());
                    session.profile = Some(profile);
                    self.connect_session(user, credentials, screen_name).await;
                }
                Err(error) => {
                    Self::send(&self.outbound, mapper::map_error(user, "sign-in", &error));
                    self.disconnect_session(user, "stored credentials rejected")
                        .await;
                }
            },
            // Post-connect profile refresh.
            ConnectionState::Connected => match result {
                Ok(profile) => {
                    session.screen_name = Some(profile.screen_name.clone());
                    session.profile = Some(profile);
                    let name = session.screen_name.clone();
                    if let Some(name) = name {
                        if let Err(error) = self.store.set_screen_name(user, &name).await {
                            warn!(user = %user, %error, "Failed to persist screen name");
                        }
                    }
                }
                Err(error) if error.is_auth() => {
                    Self::send(&self.outbound, mapper::map_error(user, "profile", &error));
                    self.disconnect_session(user, "authorization revoked").await;
                }
                Err(error) => {
                    warn!(user = %user, %error, "Profile refresh failed");
                }
            },
            _ => debug!(user = %user, state = %session.state, "Stale verify result, discarding"),
        }
    }

    async fn on_posted(&mut self, user: &str, result: ApiResult<Status>) {
        match result {
            Ok(status) => {
                let Some(session) = self.sessions.get_mut(user) else {
                    return;
                };
                // Skip the echo: the next poll starts past our own status.
                session.advance_cursor(CursorKind::Status, status.id);
                self.persist_cursor(user, CursorKind::Status).await;
                if let Some(session) = self.sessions.get(user) {
                    Self::notify(&self.outbound, session, "Status posted.");
                }
            }
            Err(error) => {
                Self::send(&self.outbound, mapper::map_error(user, "post", &error));
                if error.is_auth() {
                    self.disconnect_session(user, "authorization revoked").await;
                }
            }
        }
    }

    async fn on_dm_sent(&mut self, user: &str, result: ApiResult<DirectMessage>) {
        match result {
            Ok(message) => {
                debug!(user = %user, id = message.id, "Direct message sent");
            }
            Err(error) => {
                Self::send(
                    &self.outbound,
                    mapper::map_error(user, "direct message", &error),
                );
                if error.is_auth() {
                    self.disconnect_session(user, "authorization revoked").await;
                }
            }
        }
    }

    async fn on_followed(&mut self, user: &str, result: ApiResult<RemoteUser>) {
        match result {
            Ok(account) => {
                let Some(session) = self.sessions.get_mut(user) else {
                    return;
                };
                let key = roster_key(&account.screen_name, session.legacy_scheme);
                session.buddies.insert(key.clone());
                session.buddy_profiles.insert(key, account.clone());
                info!(user = %user, buddy = %account.screen_name, "Now following");
                let commands = mapper::map_follow(session.delivery(), &account);
                Self::send_all(&self.outbound, commands);
            }
            Err(error) => {
                Self::send(&self.outbound, mapper::map_error(user, "follow", &error));
                if error.is_auth() {
                    self.disconnect_session(user, "authorization revoked").await;
                }
            }
        }
    }

    async fn on_unfollowed(&mut self, user: &str, result: ApiResult<RemoteUser>) {
        match result {
            Ok(account) => {
                let Some(session) = self.sessions.get_mut(user) else {
                    return;
                };
                let key = roster_key(&account.screen_name, session.legacy_scheme);
                session.buddies.remove(&key);
                session.buddy_profiles.remove(&key);
                session.buddy_avatars.remove(&key);
                info!(user = %user, buddy = %account.screen_name, "Stopped following");
                let commands = mapper::map_unfollow(session.delivery(), &account);
                Self::send_all(&self.outbound, commands);
            }
            Err(error) => {
                Self::send(&self.outbound, mapper::map_error(user, "unfollow", &error));
                if error.is_auth() {
                    self.disconnect_session(user, "authorization revoked").await;
                }
            }
        }
    }

    async fn on_friends(&mut self, user: &str, result: ApiResult<Vec<RemoteUser>>) {
        match result {
            Ok(following) => {
                let Some(session) = self.sessions.get_mut(user) else {
                    return;
                };
                let legacy = session.legacy_scheme;
                let mode = session.mode;
                let room = session.room.clone();
                let plan = roster::reconcile(&session.buddies, &following, legacy);
                if plan.is_empty() {
                    return;
                }
                info!(
                    user = %user,
                    added = plan.add.len(),
                    removed = plan.remove.len(),
                    "Roster reconciled"
                );

                let mut commands = Vec::new();
                for key in &plan.remove {
                    session.buddies.remove(key);
                    session.buddy_profiles.remove(key);
                    session.buddy_avatars.remove(key);
                    commands.extend(roster::retire(user, mode, room.as_deref(), key));
                }
                for account in &plan.add {
                    let key = roster_key(&account.screen_name, legacy);
                    session.buddies.insert(key.clone());
                    session.buddy_profiles.insert(key, account.clone());
                    commands.extend(roster::establish(
                        user,
                        mode,
                        room.as_deref(),
                        account,
                        legacy,
                    ));
                }
                Self::send_all(&self.outbound, commands);
            }
            Err(error) => {
                warn!(user = %user, %error, "Following list fetch failed");
                if error.is_auth() {
                    Self::send(&self.outbound, mapper::map_error(user, "roster", &error));
                    self.disconnect_session(user, "authorization revoked").await;
                }
            }
        }
    }

    async fn on_avatar(
        &mut self,
        user: &str,
        request_id: u32,
        target: String,
        result: ApiResult<Vec<u8>>,
    ) {
        let Some(session) = self.sessions.get_mut(user) else {
            return;
        };
        let key = roster_key(&target, session.legacy_scheme);
        let is_self = key == session.self_key();
        let full_name = if is_self {
            session
                .profile
                .as_ref()
                .map(|profile| profile.name.clone())
                .or_else(|| session.screen_name.clone())
        } else {
            session.buddy_profiles.get(&key).map(|profile| profile.name.clone())
        };

        match result {
            Ok(bytes) => {
                if is_self {
                    session.avatar = Some(bytes.clone());
                } else {
                    session.buddy_avatars.insert(key, bytes.clone());
                }
                Self::send(
                    &self.outbound,
                    mapper::map_avatar(user, request_id, &target, full_name.as_deref(), Some(&bytes)),
                );
            }
            Err(error) => {
                warn!(user = %user, target = %target, %error, "Avatar fetch failed");
                // The reply still goes out, just without the image.
                Self::send(
                    &self.outbound,
                    mapper::map_avatar(user, request_id, &target, full_name.as_deref(), None),
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Mode switching and teardown
    // ------------------------------------------------------------------------

    /// Change display mode: clear the old mode's contacts first, then
    /// establish the new mode's, then persist the choice.
    async fn switch_mode(&mut self, user: &str, mode: DisplayMode) {
        let Some(session) = self.sessions.get_mut(user) else {
            return;
        };
        if session.mode == mode {
            let text = format!("Already in {} mode.", session.mode);
            Self::notify(&self.outbound, session, text);
            return;
        }

        let previous = session.mode;
        let legacy = session.legacy_scheme;
        let old_room = session.room.clone();
        let keys: Vec<String> = session.buddies.iter().cloned().collect();
        let mut commands = roster::teardown(user, previous, old_room.as_deref(), keys);

        session.mode = mode;
        if previous == DisplayMode::Chatroom {
            session.room = None;
        }
        info!(user = %user, from = %previous, to = %mode, "Display mode changed");

        let room = session.room.clone();
        let mut accounts: Vec<RemoteUser> = session.buddy_profiles.values().cloned().collect();
        accounts.sort_by(|a, b| a.screen_name.cmp(&b.screen_name));
        for account in &accounts {
            commands.extend(roster::establish(user, mode, room.as_deref(), account, legacy));
        }

        let text = match mode {
            DisplayMode::Chatroom => format!(
                "Mode set to chatroom. Join the {} room to read the timeline there.",
                self.chatroom_name
            ),
            other => format!("Mode set to {other}."),
        };
        commands.push(mapper::notice(session.delivery(), text));
        Self::send_all(&self.outbound, commands);

        if let Err(error) = self.store.set_mode(user, mode).await {
            warn!(user = %user, %error, "Failed to persist display mode");
        }
    }

    /// Remove the session and tell the transport. Terminal.
    async fn disconnect_session(&mut self, user: &str, reason: &str) {
        let Some(mut session) = self.sessions.remove(user) else {
            return;
        };
        match session.state.transition(ConnectionState::Disconnected) {
            Ok(next) => session.state = next,
            Err(error) => warn!(user = %user, %error, "Disconnect from a bad state"),
        }
        session.handle = None;
        self.flush_dirty_cursors(user, &session).await;
        info!(user = %user, reason, "Session disconnected");
        Self::send(
            &self.outbound,
            LinkCommand::Disconnected {
                user: user.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    async fn disconnect_all(&mut self, reason: &str) {
        let users: Vec<String> = self.sessions.keys().cloned().collect();
        for user in users {
            self.disconnect_session(&user, reason).await;
        }
    }

    /// Last-chance retry for cursor writes that failed earlier.
    async fn flush_dirty_cursors(&self, user: &str, session: &Session) {
        for kind in CursorKind::ALL {
            if !session.dirty_cursors[kind.index()] {
                continue;
            }
            if let Err(error) = self.store.set_cursor(user, kind, session.cursor(kind)).await {
                warn!(user = %user, kind = %kind, %error, "Cursor lost, messages may repeat after restart");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------------

    fn connected_handle(&self, user: &str) -> Option<RemoteHandle> {
        self.sessions.get(user).and_then(|session| session.handle.clone())
    }

    /// Run a remote call on the pool; its outcome comes back as an
    /// `EngineCommand::Remote` for this user.
    fn spawn_job<F>(&self, user: &str, job: &'static str, fut: F)
    where
        F: Future<Output = RemoteOutcome> + Send + 'static,
    {
        let tx = self.self_tx.clone();
        let user = user.to_string();
        self.pool.submit(job, async move {
            let outcome = fut.await;
            if tx
                .send(EngineCommand::Remote(RemoteEvent { user, outcome }))
                .await
                .is_err()
            {
                debug!("Engine stopped before a completion could be delivered");
            }
        });
    }

    fn notify(outbound: &mpsc::Sender<LinkCommand>, session: &Session, text: impl Into<String>) {
        Self::send(outbound, mapper::notice(session.delivery(), text));
    }

    fn send_all(outbound: &mpsc::Sender<LinkCommand>, commands: Vec<LinkCommand>) {
        for command in commands {
            Self::send(outbound, command);
        }
    }

    /// Queue one command for the link writer. When the link is down and the
    /// buffer is full the command is dropped, not blocked on.
    fn send(outbound: &mpsc::Sender<LinkCommand>, command: LinkCommand) {
        if let Err(error) = outbound.try_send(command) {
            warn!(%error, "Dropping outbound link command");
        }
    }
}
