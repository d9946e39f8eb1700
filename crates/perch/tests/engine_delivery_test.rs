//! Integration tests for the content side of the session engine: polling
//! and cursors, display modes, user commands, roster edits and profile
//! cards.

mod common;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use common::*;
use perch::remote::{ApiError, RemoteUser};
use perch::session::{CursorKind, DisplayMode};
use perch::store::UserStore;
use perch_link_protocol::{LinkCommand, LinkEvent, error_kinds};

// ============================================================================
// Polling and cursors
// ============================================================================

#[tokio::test]
async fn timeline_pages_deliver_oldest_first_and_persist_the_cursor_first() {
    let mut gw = spawn_gateway(DisplayMode::SingleContact);
    gw.connect().await;
    gw.api.script(|s| {
        s.timelines.push_back(Ok(vec![
            status(5, "carol", "five"),
            status(7, "carol", "seven"),
            status(6, "carol", "six"),
        ]));
    });

    gw.engine.poll_tick(CursorKind::Status).await.unwrap();

    assert_eq!(from_gateway_contact(gw.recv().await), "carol: five");
    // The cursor hits the store before the first delivery goes out, so a
    // crash between the two repeats nothing.
    assert_eq!(gw.store.cursor(USER, CursorKind::Status).await.unwrap(), 7);
    assert_eq!(from_gateway_contact(gw.recv().await), "carol: six");
    assert_eq!(from_gateway_contact(gw.recv().await), "carol: seven");

    assert_eq!(gw.summaries().await[0].status_cursor, 7);
    assert_eq!(gw.api.calls().timeline_since, vec![None]);
}

#[tokio::test]
async fn a_re_sent_page_is_never_delivered_twice() {
    let mut gw = spawn_gateway(DisplayMode::SingleContact);
    gw.connect().await;
    gw.api.script(|s| {
        s.timelines
            .push_back(Ok(vec![status(5, "carol", "five"), status(7, "carol", "seven")]));
        s.timelines.push_back(Ok(Vec::new()));
        // A confused remote repeats items at or below the cursor.
        s.timelines
            .push_back(Ok(vec![status(6, "carol", "six"), status(7, "carol", "seven")]));
    });

    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    assert_eq!(from_gateway_contact(gw.recv().await), "carol: five");
    assert_eq!(from_gateway_contact(gw.recv().await), "carol: seven");
    gw.settle().await;

    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    gw.expect_silence().await;

    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    gw.expect_silence().await;

    assert_eq!(gw.api.calls().timeline_since, vec![None, Some(7), Some(7)]);
    assert_eq!(gw.store.cursor(USER, CursorKind::Status).await.unwrap(), 7);
}

#[tokio::test]
async fn direct_messages_advance_their_own_cursor() {
    let mut gw = spawn_gateway(DisplayMode::SingleContact);
    gw.connect().await;
    gw.api.script(|s| {
        s.direct_messages.push_back(Ok(vec![
            direct_message(12, "bob", "psst"),
            direct_message(9, "bob", "first"),
        ]));
    });

    gw.engine.poll_tick(CursorKind::DirectMessage).await.unwrap();

    assert_eq!(
        from_gateway_contact(gw.recv().await),
        "Direct message from bob: first"
    );
    assert_eq!(
        from_gateway_contact(gw.recv().await),
        "Direct message from bob: psst"
    );

    assert_eq!(gw.store.cursor(USER, CursorKind::DirectMessage).await.unwrap(), 12);
    assert_eq!(gw.store.cursor(USER, CursorKind::Status).await.unwrap(), 0);
    assert_eq!(gw.api.calls().dm_since, vec![None]);
}

#[tokio::test]
async fn auth_revocation_during_a_poll_disconnects_the_session() {
    let mut gw = spawn_gateway(DisplayMode::SingleContact);
    gw.connect().await;
    gw.api.script(|s| {
        s.timelines
            .push_back(Err(ApiError::Unauthorized("token revoked".to_string())));
    });

    gw.engine.poll_tick(CursorKind::Status).await.unwrap();

    let (kind, msg) = error_parts(gw.recv().await);
    assert_eq!(kind, error_kinds::AUTH);
    assert!(msg.contains("timeline poll"), "{msg}");
    match gw.recv().await {
        LinkCommand::Disconnected { user, reason } => {
            assert_eq!(user, USER);
            assert_eq!(reason, "authorization revoked");
        }
        other => panic!("expected disconnected, got {other:?}"),
    }
    assert!(gw.summaries().await.is_empty());

    // Later ticks no longer poll for this user.
    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    gw.expect_silence().await;
    assert_eq!(gw.api.calls().timeline_since.len(), 1);
}

#[tokio::test]
async fn a_rate_limited_poll_skips_the_cycle_quietly() {
    let mut gw = spawn_gateway(DisplayMode::SingleContact);
    gw.connect().await;
    gw.api.script(|s| {
        s.timelines.push_back(Err(ApiError::RateLimited));
        s.timelines.push_back(Ok(vec![status(3, "carol", "later")]));
    });

    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    gw.expect_silence().await;
    assert_eq!(gw.summaries().await.len(), 1, "rate limiting is not a disconnect");

    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    assert_eq!(from_gateway_contact(gw.recv().await), "carol: later");
    assert_eq!(gw.store.cursor(USER, CursorKind::Status).await.unwrap(), 3);
}

#[tokio::test]
async fn a_slow_poll_is_skipped_not_duplicated() {
    let mut gw = spawn_gateway(DisplayMode::SingleContact);
    gw.connect().await;
    gw.api.script(|s| {
        s.hold_timeline = true;
        s.timelines.push_back(Ok(vec![status(3, "carol", "hi")]));
    });

    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    gw.settle().await;
    assert_eq!(gw.api.calls().timeline_since.len(), 1);

    // The next tick finds the fetch still in flight and stays away.
    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    gw.settle().await;
    assert_eq!(gw.api.calls().timeline_since.len(), 1);

    gw.api.release_timeline();
    assert_eq!(from_gateway_contact(gw.recv().await), "carol: hi");

    // With the slot free again the next tick goes out.
    gw.api.script(|s| s.hold_timeline = false);
    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    gw.settle().await;
    assert_eq!(gw.api.calls().timeline_since, vec![None, Some(3)]);
}

#[tokio::test]
async fn poll_completions_after_logout_are_discarded() {
    let mut gw = spawn_gateway(DisplayMode::SingleContact);
    gw.connect().await;
    gw.api.script(|s| {
        s.hold_timeline = true;
        s.timelines.push_back(Ok(vec![status(8, "carol", "late")]));
    });

    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    gw.settle().await;
    assert_eq!(gw.api.calls().timeline_since.len(), 1);

    gw.engine
        .link_event(LinkEvent::Logout {
            user: USER.to_string(),
        })
        .await
        .unwrap();
    match gw.recv().await {
        LinkCommand::Disconnected { user, reason } => {
            assert_eq!(user, USER);
            assert_eq!(reason, "logged out");
        }
        other => panic!("expected disconnected, got {other:?}"),
    }
    assert!(gw.summaries().await.is_empty());

    // The fetch finishes for a session that no longer exists.
    gw.api.release_timeline();
    gw.expect_silence().await;
    assert_eq!(gw.store.cursor(USER, CursorKind::Status).await.unwrap(), 0);
}

// ============================================================================
// Display modes
// ============================================================================

#[tokio::test]
async fn multi_contact_login_populates_the_roster() {
    let mut gw = spawn_gateway(DisplayMode::MultiContact);
    gw.api.script(|s| {
        s.friends
            .push_back(Ok(vec![account(1, "alice"), account(2, "bob")]));
    });
    gw.connect().await;

    assert_eq!(gw.recv().await, roster_add(USER, "alice", "alice"));
    assert_eq!(gw.recv().await, presence_online(USER, "alice"));
    assert_eq!(gw.recv().await, roster_add(USER, "bob", "bob"));
    assert_eq!(gw.recv().await, presence_online(USER, "bob"));

    let summaries = gw.summaries().await;
    assert_eq!(summaries[0].mode, DisplayMode::MultiContact);
    assert_eq!(summaries[0].buddies, 2);

    // Content arrives from the author's own contact, not the gateway one.
    gw.api
        .script(|s| s.timelines.push_back(Ok(vec![status(4, "alice", "hello")])));
    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    match gw.recv().await {
        LinkCommand::DeliverMessage { from, body, room, .. } => {
            assert_eq!(from, "alice");
            assert_eq!(body, "hello");
            assert!(room.is_none());
        }
        other => panic!("expected a delivery, got {other:?}"),
    }
}

#[tokio::test]
async fn switching_to_single_contact_clears_the_roster_first() {
    let mut gw = spawn_gateway(DisplayMode::MultiContact);
    gw.api.script(|s| {
        s.friends
            .push_back(Ok(vec![account(1, "alice"), account(2, "bob")]));
    });
    gw.connect().await;
    for _ in 0..4 {
        let _ = gw.recv().await; // roster population
    }

    gw.engine
        .link_event(message(USER, SELF_CONTACT, "#mode single"))
        .await
        .unwrap();

    // Old contacts go away before the new mode says anything.
    assert_eq!(gw.recv().await, roster_remove(USER, "alice"));
    assert_eq!(gw.recv().await, roster_remove(USER, "bob"));
    assert_eq!(from_gateway_contact(gw.recv().await), "Mode set to single.");

    gw.settle().await;
    let record = gw.store.record(USER).await.unwrap();
    assert_eq!(record.mode, Some(DisplayMode::SingleContact));

    // Content now funnels through the synthetic contact.
    gw.api
        .script(|s| s.timelines.push_back(Ok(vec![status(4, "alice", "hello")])));
    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    assert_eq!(from_gateway_contact(gw.recv().await), "alice: hello");

    gw.engine.link_event(message(USER, SELF_CONTACT, "#mode")).await.unwrap();
    assert_eq!(from_gateway_contact(gw.recv().await), "Current mode: single.");
}

#[tokio::test]
async fn chatroom_mode_delivers_into_the_joined_room() {
    let mut gw = spawn_gateway(DisplayMode::Chatroom);
    gw.api
        .script(|s| s.friends.push_back(Ok(vec![account(1, "carol")])));
    gw.connect().await;

    gw.engine
        .link_event(LinkEvent::JoinRoom {
            user: USER.to_string(),
            room: "#timeline".to_string(),
            nickname: "alice".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(
        gw.recv().await,
        LinkCommand::Participant {
            user: USER.to_string(),
            room: "#timeline".to_string(),
            nickname: "carol".to_string(),
            online: true,
        }
    );

    gw.api
        .script(|s| s.timelines.push_back(Ok(vec![status(2, "carol", "chirp")])));
    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    match gw.recv().await {
        LinkCommand::DeliverMessage { from, body, room, .. } => {
            assert_eq!(from, "carol");
            assert_eq!(body, "chirp");
            assert_eq!(room.as_deref(), Some("#timeline"));
        }
        other => panic!("expected a room delivery, got {other:?}"),
    }

    // Direct messages stay private even in chatroom mode.
    gw.api.script(|s| {
        s.direct_messages
            .push_back(Ok(vec![direct_message(5, "bob", "psst")]));
    });
    gw.engine.poll_tick(CursorKind::DirectMessage).await.unwrap();
    assert_eq!(
        from_gateway_contact(gw.recv().await),
        "Direct message from bob: psst"
    );
}

#[tokio::test]
async fn leaving_the_room_falls_back_to_single_contact() {
    let mut gw = spawn_gateway(DisplayMode::Chatroom);
    gw.connect().await;

    gw.engine
        .link_event(LinkEvent::JoinRoom {
            user: USER.to_string(),
            room: "#timeline".to_string(),
            nickname: "alice".to_string(),
        })
        .await
        .unwrap();
    gw.settle().await;

    gw.engine
        .link_event(LinkEvent::LeaveRoom {
            user: USER.to_string(),
            room: "#timeline".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(from_gateway_contact(gw.recv().await), "Mode set to single.");
    gw.settle().await;
    let record = gw.store.record(USER).await.unwrap();
    assert_eq!(record.mode, Some(DisplayMode::SingleContact));
    assert_eq!(gw.summaries().await[0].mode, DisplayMode::SingleContact);
}

// ============================================================================
// Messaging and commands
// ============================================================================

#[tokio::test]
async fn gateway_messages_post_statuses_and_suppress_the_echo() {
    let mut gw = spawn_gateway(DisplayMode::SingleContact);
    gw.connect().await;
    gw.api
        .script(|s| s.posts.push_back(Ok(status(99, SELF_CONTACT, "hello world"))));

    gw.engine
        .link_event(message(USER, SELF_CONTACT, "hello world"))
        .await
        .unwrap();

    assert_eq!(from_gateway_contact(gw.recv().await), "Status posted.");
    assert_eq!(gw.api.calls().posted, vec!["hello world"]);
    // The cursor moved past our own status so the next poll won't echo it.
    assert_eq!(gw.store.cursor(USER, CursorKind::Status).await.unwrap(), 99);

    gw.engine.poll_tick(CursorKind::Status).await.unwrap();
    gw.settle().await;
    assert_eq!(gw.api.calls().timeline_since, vec![Some(99)]);

    // A failed post reports and leaves the session alone.
    gw.api.script(|s| s.posts.push_back(Err(ApiError::RateLimited)));
    gw.engine.link_event(message(USER, SELF_CONTACT, "again")).await.unwrap();
    let (kind, msg) = error_parts(gw.recv().await);
    assert_eq!(kind, error_kinds::API);
    assert!(msg.contains("post"), "{msg}");
    assert_eq!(gw.summaries().await.len(), 1);
}

#[tokio::test]
async fn buddy_messages_go_out_as_direct_messages() {
    let mut gw = spawn_gateway(DisplayMode::MultiContact);
    gw.api
        .script(|s| s.friends.push_back(Ok(vec![account(1, "Carol")])));
    gw.connect().await;
    assert_eq!(gw.recv().await, roster_add(USER, "carol", "Carol"));
    assert_eq!(gw.recv().await, presence_online(USER, "carol"));

    // The roster key is lowercase; the wire call uses the canonical name.
    gw.engine.link_event(message(USER, "carol", "hi there")).await.unwrap();
    gw.expect_silence().await;
    assert_eq!(
        gw.api.calls().dms,
        vec![("Carol".to_string(), "hi there".to_string())]
    );

    gw.api.script(|s| {
        s.dm_sends.push_back(Err(ApiError::Status {
            status: 503,
            message: "over capacity".to_string(),
        }));
    });
    gw.engine.link_event(message(USER, "carol", "again")).await.unwrap();
    let (kind, msg) = error_parts(gw.recv().await);
    assert_eq!(kind, error_kinds::API);
    assert!(msg.contains("direct message"), "{msg}");
}

#[tokio::test]
async fn commands_are_answered_locally() {
    let mut gw = spawn_gateway(DisplayMode::SingleContact);
    gw.connect().await;

    gw.engine.link_event(message(USER, SELF_CONTACT, "#help")).await.unwrap();
    let body = from_gateway_contact(gw.recv().await);
    assert!(body.contains("#mode [single|multi|chatroom]"), "{body}");
    assert!(body.contains("#follow"), "{body}");

    gw.engine
        .link_event(message(USER, SELF_CONTACT, "#frobnicate"))
        .await
        .unwrap();
    let (kind, msg) = error_parts(gw.recv().await);
    assert_eq!(kind, error_kinds::COMMAND);
    assert!(msg.contains("#frobnicate"), "{msg}");

    gw.engine
        .link_event(message(USER, SELF_CONTACT, "#mode sideways"))
        .await
        .unwrap();
    let (kind, msg) = error_parts(gw.recv().await);
    assert_eq!(kind, error_kinds::COMMAND);
    assert!(msg.contains("sideways"), "{msg}");

    gw.engine.link_event(message(USER, SELF_CONTACT, "#follow")).await.unwrap();
    let (kind, msg) = error_parts(gw.recv().await);
    assert_eq!(kind, error_kinds::COMMAND);
    assert!(msg.contains("usage"), "{msg}");

    // None of it reached the remote.
    let calls = gw.api.calls();
    assert!(calls.posted.is_empty());
    assert!(calls.follows.is_empty());
}

#[tokio::test]
async fn follow_and_unfollow_commands_update_the_roster() {
    let mut gw = spawn_gateway(DisplayMode::MultiContact);
    gw.connect().await;
    gw.api.script(|s| s.follows.push_back(Ok(account(3, "Dora"))));

    gw.engine
        .link_event(message(USER, SELF_CONTACT, "#follow @dora"))
        .await
        .unwrap();

    assert_eq!(gw.recv().await, roster_add(USER, "dora", "Dora"));
    assert_eq!(gw.recv().await, presence_online(USER, "dora"));
    assert_eq!(from_gateway_contact(gw.recv().await), "Now following Dora");
    assert_eq!(gw.api.calls().follows, vec!["dora"]);
    assert_eq!(gw.summaries().await[0].buddies, 1);

    gw.api.script(|s| s.unfollows.push_back(Ok(account(3, "Dora"))));
    gw.engine
        .link_event(message(USER, SELF_CONTACT, "#unfollow dora"))
        .await
        .unwrap();

    assert_eq!(gw.recv().await, roster_remove(USER, "dora"));
    assert_eq!(from_gateway_contact(gw.recv().await), "Stopped following Dora");
    assert_eq!(gw.summaries().await[0].buddies, 0);
}

#[tokio::test]
async fn client_roster_edits_follow_and_unfollow() {
    let mut gw = spawn_gateway(DisplayMode::MultiContact);
    gw.connect().await;

    gw.engine
        .link_event(LinkEvent::BuddyAdded {
            user: USER.to_string(),
            buddy: "@Ed".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(gw.recv().await, roster_add(USER, "ed", "Ed"));
    assert_eq!(gw.recv().await, presence_online(USER, "ed"));
    assert_eq!(from_gateway_contact(gw.recv().await), "Now following Ed");
    assert_eq!(gw.api.calls().follows, vec!["Ed"]);

    // Adding the gateway contact itself is not a follow.
    gw.engine
        .link_event(LinkEvent::BuddyAdded {
            user: USER.to_string(),
            buddy: SELF_CONTACT.to_string(),
        })
        .await
        .unwrap();
    gw.expect_silence().await;
    assert_eq!(gw.api.calls().follows, vec!["Ed"]);

    gw.engine
        .link_event(LinkEvent::BuddyRemoved {
            user: USER.to_string(),
            buddy: "ed".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(gw.recv().await, roster_remove(USER, "ed"));
    assert_eq!(from_gateway_contact(gw.recv().await), "Stopped following ed");
    assert_eq!(gw.api.calls().unfollows, vec!["ed"]);
}

// ============================================================================
// Profile cards
// ============================================================================

#[tokio::test]
async fn profile_card_requests_always_get_a_reply() {
    let mut gw = spawn_gateway(DisplayMode::SingleContact);
    gw.api.script(|s| {
        s.friends.push_back(Ok(vec![RemoteUser {
            id: 2,
            screen_name: "carol".to_string(),
            name: "Carol C".to_string(),
            avatar_url: Some("https://remote.example/avatars/carol.png".to_string()),
        }]));
    });
    gw.connect().await;

    // Own card: profile known, no image.
    gw.engine
        .link_event(LinkEvent::VcardRequest {
            user: USER.to_string(),
            target: SELF_CONTACT.to_string(),
            request_id: 41,
        })
        .await
        .unwrap();
    assert_eq!(
        gw.recv().await,
        LinkCommand::Vcard {
            user: USER.to_string(),
            request_id: 41,
            legacy_name: SELF_CONTACT.to_string(),
            full_name: "Perch User".to_string(),
            avatar: None,
        }
    );

    // A buddy card fetches the avatar.
    gw.engine
        .link_event(LinkEvent::VcardRequest {
            user: USER.to_string(),
            target: "Carol".to_string(),
            request_id: 42,
        })
        .await
        .unwrap();
    assert_eq!(
        gw.recv().await,
        LinkCommand::Vcard {
            user: USER.to_string(),
            request_id: 42,
            legacy_name: "Carol".to_string(),
            full_name: "Carol C".to_string(),
            avatar: Some(BASE64.encode(b"avatar-bytes")),
        }
    );

    // The second request is served from the cache.
    gw.engine
        .link_event(LinkEvent::VcardRequest {
            user: USER.to_string(),
            target: "carol".to_string(),
            request_id: 43,
        })
        .await
        .unwrap();
    match gw.recv().await {
        LinkCommand::Vcard { request_id, avatar, .. } => {
            assert_eq!(request_id, 43);
            assert_eq!(avatar.as_deref(), Some(BASE64.encode(b"avatar-bytes").as_str()));
        }
        other => panic!("expected a vcard, got {other:?}"),
    }
    assert_eq!(gw.api.calls().avatars, 1, "second answer came from the cache");

    // Even a user with no session gets an answer.
    gw.engine
        .link_event(LinkEvent::VcardRequest {
            user: "stranger@example.org".to_string(),
            target: "whoever".to_string(),
            request_id: 9,
        })
        .await
        .unwrap();
    assert_eq!(
        gw.recv().await,
        LinkCommand::Vcard {
            user: "stranger@example.org".to_string(),
            request_id: 9,
            legacy_name: "whoever".to_string(),
            full_name: "whoever".to_string(),
            avatar: None,
        }
    );
}
