#![allow(dead_code)]
//! Shared harness for session-engine integration tests: a scripted remote
//! service, a real file store in a temp directory and a running engine with
//! its outbound link channel captured.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use perch::pool::WorkerPool;
use perch::remote::{
    AccessGrant, ApiResult, Credentials, DirectMessage, RemoteApi, RemoteUser, RequestToken,
    Status,
};
use perch::session::{
    DisplayMode, Engine, EngineConfig, EngineHandle, OUTBOUND_CAPACITY, SessionSummary,
};
use perch::store::{FileUserStore, UserStore};
use perch_link_protocol::{LinkCommand, LinkEvent};

pub const USER: &str = "alice@example.org";
pub const SELF_CONTACT: &str = "perchuser";

// ============================================================================
// Scripted remote service
// ============================================================================

/// Per-method response queues. An empty queue answers with a benign default,
/// so tests only script the calls they actually care about.
#[derive(Default)]
pub struct Script {
    pub request_tokens: VecDeque<ApiResult<RequestToken>>,
    pub pin_exchanges: VecDeque<ApiResult<AccessGrant>>,
    pub verifies: VecDeque<ApiResult<RemoteUser>>,
    pub timelines: VecDeque<ApiResult<Vec<Status>>>,
    pub direct_messages: VecDeque<ApiResult<Vec<DirectMessage>>>,
    pub posts: VecDeque<ApiResult<Status>>,
    pub dm_sends: VecDeque<ApiResult<DirectMessage>>,
    pub follows: VecDeque<ApiResult<RemoteUser>>,
    pub unfollows: VecDeque<ApiResult<RemoteUser>>,
    pub friends: VecDeque<ApiResult<Vec<RemoteUser>>>,
    pub avatars: VecDeque<ApiResult<Vec<u8>>>,
    /// Park PIN exchanges until [`ScriptedApi::release_pin_exchange`].
    pub hold_pin_exchange: bool,
    /// Park timeline fetches until [`ScriptedApi::release_timeline`].
    pub hold_timeline: bool,
}

/// What the engine actually asked the remote for.
#[derive(Debug, Default, Clone)]
pub struct Calls {
    pub request_tokens: usize,
    pub pins: Vec<String>,
    pub verifies: usize,
    pub timeline_since: Vec<Option<u64>>,
    pub dm_since: Vec<Option<u64>>,
    pub posted: Vec<String>,
    pub dms: Vec<(String, String)>,
    pub follows: Vec<String>,
    pub unfollows: Vec<String>,
    pub avatars: usize,
}

/// `RemoteApi` test double driven by [`Script`] queues.
#[derive(Default)]
pub struct ScriptedApi {
    script: Mutex<Script>,
    calls: Mutex<Calls>,
    pin_release: Notify,
    timeline_release: Notify,
}

impl ScriptedApi {
    pub fn script(&self, configure: impl FnOnce(&mut Script)) {
        configure(&mut self.script.lock().unwrap());
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().unwrap().clone()
    }

    pub fn release_pin_exchange(&self) {
        self.pin_release.notify_one();
    }

    pub fn release_timeline(&self) {
        self.timeline_release.notify_one();
    }
}

#[async_trait]
impl RemoteApi for ScriptedApi {
    async fn request_token(&self) -> ApiResult<RequestToken> {
        self.calls.lock().unwrap().request_tokens += 1;
        let scripted = self.script.lock().unwrap().request_tokens.pop_front();
        scripted.unwrap_or_else(|| Ok(request_token()))
    }

    async fn exchange_pin(&self, _request: &RequestToken, pin: &str) -> ApiResult<AccessGrant> {
        self.calls.lock().unwrap().pins.push(pin.to_string());
        let (scripted, hold) = {
            let mut script = self.script.lock().unwrap();
            (script.pin_exchanges.pop_front(), script.hold_pin_exchange)
        };
        if hold {
            self.pin_release.notified().await;
        }
        scripted.unwrap_or_else(|| Ok(grant()))
    }

    async fn verify(&self, _credentials: &Credentials) -> ApiResult<RemoteUser> {
        self.calls.lock().unwrap().verifies += 1;
        let scripted = self.script.lock().unwrap().verifies.pop_front();
        scripted.unwrap_or_else(|| Ok(profile()))
    }

    async fn home_timeline(
        &self,
        _credentials: &Credentials,
        since_id: Option<u64>,
    ) -> ApiResult<Vec<Status>> {
        self.calls.lock().unwrap().timeline_since.push(since_id);
        let (scripted, hold) = {
            let mut script = self.script.lock().unwrap();
            (script.timelines.pop_front(), script.hold_timeline)
        };
        if hold {
            self.timeline_release.notified().await;
        }
        scripted.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn direct_messages(
        &self,
        _credentials: &Credentials,
        since_id: Option<u64>,
    ) -> ApiResult<Vec<DirectMessage>> {
        self.calls.lock().unwrap().dm_since.push(since_id);
        let scripted = self.script.lock().unwrap().direct_messages.pop_front();
        scripted.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn post_status(&self, _credentials: &Credentials, text: &str) -> ApiResult<Status> {
        self.calls.lock().unwrap().posted.push(text.to_string());
        let scripted = self.script.lock().unwrap().posts.pop_front();
        scripted.unwrap_or_else(|| Ok(status(1, SELF_CONTACT, text)))
    }

    async fn send_direct_message(
        &self,
        _credentials: &Credentials,
        to: &str,
        text: &str,
    ) -> ApiResult<DirectMessage> {
        self.calls
            .lock()
            .unwrap()
            .dms
            .push((to.to_string(), text.to_string()));
        let scripted = self.script.lock().unwrap().dm_sends.pop_front();
        scripted.unwrap_or_else(|| Ok(direct_message(1, SELF_CONTACT, text)))
    }

    async fn follow(&self, _credentials: &Credentials, screen_name: &str) -> ApiResult<RemoteUser> {
        self.calls.lock().unwrap().follows.push(screen_name.to_string());
        let scripted = self.script.lock().unwrap().follows.pop_front();
        scripted.unwrap_or_else(|| Ok(account(1, screen_name)))
    }

    async fn unfollow(
        &self,
        _credentials: &Credentials,
        screen_name: &str,
    ) -> ApiResult<RemoteUser> {
        self.calls.lock().unwrap().unfollows.push(screen_name.to_string());
        let scripted = self.script.lock().unwrap().unfollows.pop_front();
        scripted.unwrap_or_else(|| Ok(account(1, screen_name)))
    }

    async fn friends(&self, _credentials: &Credentials) -> ApiResult<Vec<RemoteUser>> {
        let scripted = self.script.lock().unwrap().friends.pop_front();
        scripted.unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn avatar(&self, _url: &str) -> ApiResult<Vec<u8>> {
        self.calls.lock().unwrap().avatars += 1;
        let scripted = self.script.lock().unwrap().avatars.pop_front();
        scripted.unwrap_or_else(|| Ok(b"avatar-bytes".to_vec()))
    }
}

// ============================================================================
// Running gateway
// ============================================================================

/// One engine instance wired to a scripted remote and a real file store.
pub struct Gateway {
    pub api: Arc<ScriptedApi>,
    pub store: Arc<FileUserStore>,
    pub engine: EngineHandle,
    pub outbound: mpsc::Receiver<LinkCommand>,
    pub shutdown: watch::Sender<bool>,
    pub engine_task: JoinHandle<()>,
    _store_dir: TempDir,
}

pub fn spawn_gateway(default_mode: DisplayMode) -> Gateway {
    let store_dir = TempDir::new().unwrap();
    let api = Arc::new(ScriptedApi::default());
    let store = Arc::new(FileUserStore::new(store_dir.path().join("users")));
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (engine, engine_task) = Engine::spawn(
        EngineConfig {
            store: store.clone(),
            api: api.clone(),
            pool: WorkerPool::new(4),
            outbound: outbound_tx,
            default_mode,
            chatroom_name: "#timeline".to_string(),
        },
        shutdown_rx,
    );

    Gateway {
        api,
        store,
        engine,
        outbound: outbound_rx,
        shutdown: shutdown_tx,
        engine_task,
        _store_dir: store_dir,
    }
}

impl Gateway {
    /// Next outbound link command; panics when none arrives in time.
    pub async fn recv(&mut self) -> LinkCommand {
        timeout(Duration::from_secs(5), self.outbound.recv())
            .await
            .expect("timed out waiting for a link command")
            .expect("outbound channel closed")
    }

    /// Wait until everything submitted so far has been handled: a short
    /// pause for worker completions to land, then a round trip through the
    /// engine task.
    pub async fn settle(&self) {
        sleep(Duration::from_millis(100)).await;
        let _ = self.engine.sessions().await;
    }

    pub async fn expect_silence(&mut self) {
        self.settle().await;
        match self.outbound.try_recv() {
            Err(TryRecvError::Empty) => {}
            other => panic!("expected no link command, got {other:?}"),
        }
    }

    pub async fn summaries(&self) -> Vec<SessionSummary> {
        self.engine.sessions().await.expect("engine stopped")
    }

    /// Sign `USER` in with stored credentials and consume the connect burst.
    pub async fn connect(&mut self) {
        self.store.set_credentials(USER, &credentials()).await.unwrap();
        self.engine.link_event(login(USER, SELF_CONTACT)).await.unwrap();
        assert_eq!(
            self.recv().await,
            LinkCommand::Connected {
                user: USER.to_string()
            }
        );
        assert_eq!(self.recv().await, roster_add(USER, SELF_CONTACT, SELF_CONTACT));
        assert_eq!(self.recv().await, presence_online(USER, SELF_CONTACT));
        self.settle().await;
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn account(id: u64, screen_name: &str) -> RemoteUser {
    RemoteUser {
        id,
        screen_name: screen_name.to_string(),
        name: screen_name.to_string(),
        avatar_url: None,
    }
}

/// The account `SELF_CONTACT` belongs to, as `verify` reports it.
pub fn profile() -> RemoteUser {
    RemoteUser {
        id: 7,
        screen_name: SELF_CONTACT.to_string(),
        name: "Perch User".to_string(),
        avatar_url: None,
    }
}

pub fn status(id: u64, author: &str, text: &str) -> Status {
    Status {
        id,
        text: text.to_string(),
        author: account(1, author),
        created_at: None,
    }
}

pub fn direct_message(id: u64, sender: &str, text: &str) -> DirectMessage {
    DirectMessage {
        id,
        text: text.to_string(),
        sender: account(1, sender),
        created_at: None,
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        token: "access-token".to_string(),
        secret: "access-secret".to_string(),
    }
}

pub fn request_token() -> RequestToken {
    RequestToken {
        token: "req-token".to_string(),
        secret: "req-secret".to_string(),
        authorize_url: "https://remote.example/oauth/authorize?oauth_token=req-token".to_string(),
    }
}

pub fn grant() -> AccessGrant {
    AccessGrant {
        credentials: credentials(),
        screen_name: Some(SELF_CONTACT.to_string()),
    }
}

// ============================================================================
// Events and expected commands
// ============================================================================

pub fn login(user: &str, legacy_name: &str) -> LinkEvent {
    LinkEvent::Login {
        user: user.to_string(),
        legacy_name: legacy_name.to_string(),
        password: None,
    }
}

pub fn login_with_pin(user: &str, legacy_name: &str, pin: &str) -> LinkEvent {
    LinkEvent::Login {
        user: user.to_string(),
        legacy_name: legacy_name.to_string(),
        password: Some(pin.to_string()),
    }
}

pub fn message(user: &str, target: &str, body: &str) -> LinkEvent {
    LinkEvent::SendMessage {
        user: user.to_string(),
        target: target.to_string(),
        body: body.to_string(),
    }
}

pub fn roster_add(user: &str, buddy: &str, alias: &str) -> LinkCommand {
    LinkCommand::RosterAdd {
        user: user.to_string(),
        buddy: buddy.to_string(),
        alias: alias.to_string(),
        group: Some("Perch".to_string()),
    }
}

pub fn presence_online(user: &str, buddy: &str) -> LinkCommand {
    LinkCommand::Presence {
        user: user.to_string(),
        buddy: buddy.to_string(),
        online: true,
        status_message: None,
    }
}

pub fn roster_remove(user: &str, buddy: &str) -> LinkCommand {
    LinkCommand::RosterRemove {
        user: user.to_string(),
        buddy: buddy.to_string(),
    }
}

/// Unwrap a message delivered through the synthetic gateway contact and
/// return its body. Notices and single-contact content both arrive this way.
pub fn from_gateway_contact(command: LinkCommand) -> String {
    match command {
        LinkCommand::DeliverMessage {
            user,
            from,
            body,
            room,
            ..
        } => {
            assert_eq!(user, USER);
            assert_eq!(from, SELF_CONTACT);
            assert!(room.is_none(), "gateway-contact traffic is never room traffic");
            body
        }
        other => panic!("expected a message from the gateway contact, got {other:?}"),
    }
}

/// Unwrap an error command into its kind and message.
pub fn error_parts(command: LinkCommand) -> (String, String) {
    match command {
        LinkCommand::Error { kind, message, .. } => (kind, message),
        other => panic!("expected an error command, got {other:?}"),
    }
}
