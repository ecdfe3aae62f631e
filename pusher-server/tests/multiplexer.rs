//! Integration suite for the session multiplexer, driven against
//! channel-backed fake back-ends and a fake admin service. Every case builds
//! a fresh multiplexer and disposes it explicitly.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use protocol::{
    AdminMessage, BanMessage, ChatMemberData, EmbeddableState, FieldMask, MemberData,
    PlayGlobalMessage, PlayerDetails, RoomBroadcast, RoomInFrame, RoomOutFrame, ServerMessage,
    SpaceFilter, SpaceFilterKind, SpaceReadFrame, SpaceUser, SpaceWriteFrame, ZoneFrame,
};

use pusher_server::admin_api::{AdminApi, AdminApiError};
use pusher_server::back::{
    BackClient, BackError, BackendDirectory, RoomStream, SpaceStream, StreamItem, ZoneStream,
};
use pusher_server::batch::BatchSettings;
use pusher_server::client::{ClientIdentity, ClientSession, Outbound};
use pusher_server::embeddable::EmbeddableChecker;
use pusher_server::error::PusherError;
use pusher_server::multiplexer::{MultiplexerSettings, SessionMultiplexer};

// ----- fakes ----------------------------------------------------------------

/// Far ends of the streams a fake back handed out, for driving and asserting.
#[derive(Default)]
struct FakeBackState {
    space_connects: AtomicUsize,
    room_streams: Mutex<Vec<RoomEndpoints>>,
    space_endpoints: Mutex<Vec<SpaceEndpoints>>,
    zone_rooms: StdMutex<Vec<String>>,
    room_broadcasts: StdMutex<Vec<(String, RoomBroadcast)>>,
    bans: StdMutex<Vec<BanMessage>>,
    user_messages: StdMutex<Vec<AdminMessage>>,
}

struct RoomEndpoints {
    from_pusher: mpsc::Receiver<RoomInFrame>,
    #[allow(dead_code)]
    to_pusher: mpsc::Sender<StreamItem<RoomOutFrame>>,
}

struct SpaceEndpoints {
    from_pusher: mpsc::Receiver<SpaceWriteFrame>,
    to_pusher: mpsc::Sender<StreamItem<SpaceReadFrame>>,
}

struct FakeBack {
    state: Arc<FakeBackState>,
}

#[async_trait]
impl BackClient for FakeBack {
    async fn join_room(&self) -> Result<RoomStream, BackError> {
        let (to_back, from_pusher) = mpsc::channel(64);
        let (to_pusher, from_back) = mpsc::channel(64);
        self.state.room_streams.lock().await.push(RoomEndpoints {
            from_pusher,
            to_pusher,
        });
        Ok(RoomStream { to_back, from_back })
    }

    async fn watch_zone(&self, room_url: &str) -> Result<ZoneStream, BackError> {
        self.state
            .zone_rooms
            .lock()
            .unwrap()
            .push(room_url.to_string());
        let (_to_pusher, frames) = mpsc::channel::<StreamItem<ZoneFrame>>(64);
        // The sender is dropped; the zone feed stays silent for these tests.
        Ok(ZoneStream { frames })
    }

    async fn watch_space(&self) -> Result<SpaceStream, BackError> {
        self.state.space_connects.fetch_add(1, Ordering::SeqCst);
        let (to_back, from_pusher) = mpsc::channel(64);
        let (to_pusher, from_back) = mpsc::channel(64);
        self.state
            .space_endpoints
            .lock()
            .await
            .push(SpaceEndpoints {
                from_pusher,
                to_pusher,
            });
        Ok(SpaceStream { to_back, from_back })
    }

    async fn send_admin_message(&self, message: AdminMessage) -> Result<(), BackError> {
        self.state.user_messages.lock().unwrap().push(message);
        Ok(())
    }

    async fn ban(&self, ban: BanMessage) -> Result<(), BackError> {
        self.state.bans.lock().unwrap().push(ban);
        Ok(())
    }

    async fn send_admin_message_to_room(
        &self,
        room_url: &str,
        broadcast: RoomBroadcast,
    ) -> Result<(), BackError> {
        self.state
            .room_broadcasts
            .lock()
            .unwrap()
            .push((room_url.to_string(), broadcast));
        Ok(())
    }
}

#[derive(Default)]
struct FakeAdmin {
    same_world_rooms: StdMutex<Vec<String>>,
    chat_id_updates: StdMutex<Vec<(String, String)>>,
    tags: StdMutex<Vec<String>>,
    fail_tags: StdMutex<bool>,
}

#[async_trait]
impl AdminApi for FakeAdmin {
    async fn report_player(
        &self,
        _reported_uuid: &str,
        _comment: &str,
        _reporter_uuid: &str,
        _room_url: &str,
    ) -> Result<(), AdminApiError> {
        Ok(())
    }

    async fn ban_user_by_uuid(
        &self,
        _uuid: &str,
        _room_url: &str,
        _name: &str,
        _message: &str,
    ) -> Result<(), AdminApiError> {
        Ok(())
    }

    async fn get_tags_list(&self, _room_url: &str) -> Result<Vec<String>, AdminApiError> {
        if *self.fail_tags.lock().unwrap() {
            return Err(AdminApiError::Status { status: 500 });
        }
        Ok(self.tags.lock().unwrap().clone())
    }

    async fn get_url_rooms_from_same_world(
        &self,
        _room_url: &str,
    ) -> Result<Vec<String>, AdminApiError> {
        Ok(self.same_world_rooms.lock().unwrap().clone())
    }

    async fn search_members(
        &self,
        _room_url: &str,
        _query: &str,
    ) -> Result<(Vec<MemberData>, u32), AdminApiError> {
        Ok((Vec::new(), 0))
    }

    async fn search_tags(
        &self,
        _room_url: &str,
        _query: &str,
    ) -> Result<Vec<String>, AdminApiError> {
        Ok(Vec::new())
    }

    async fn get_member(&self, uuid: &str) -> Result<MemberData, AdminApiError> {
        Ok(MemberData {
            uuid: uuid.to_string(),
            name: "member".into(),
            email: None,
        })
    }

    async fn get_world_chat_members(
        &self,
        _room_url: &str,
        _search: &str,
    ) -> Result<(Vec<ChatMemberData>, u32), AdminApiError> {
        Ok((Vec::new(), 0))
    }

    async fn update_chat_id(&self, uuid: &str, chat_id: &str) -> Result<(), AdminApiError> {
        self.chat_id_updates
            .lock()
            .unwrap()
            .push((uuid.to_string(), chat_id.to_string()));
        Ok(())
    }

    async fn refresh_oauth_token(&self, token: &str) -> Result<String, AdminApiError> {
        Ok(format!("{token}-refreshed"))
    }
}

// ----- harness --------------------------------------------------------------

struct Harness {
    mux: Arc<SessionMultiplexer>,
    back: Arc<FakeBackState>,
    admin: Arc<FakeAdmin>,
}

/// One fake back (every key hashes to back 0) plus a fake admin service.
fn harness() -> Harness {
    let back = Arc::new(FakeBackState::default());
    let admin = Arc::new(FakeAdmin::default());
    let backs: Vec<Arc<dyn BackClient>> = vec![Arc::new(FakeBack {
        state: back.clone(),
    })];
    let mux = SessionMultiplexer::new(
        BackendDirectory::new(backs).unwrap(),
        admin.clone(),
        EmbeddableChecker::new(vec!["allowlisted.example".into()]),
        MultiplexerSettings::default(),
    );
    Harness { mux, back, admin }
}

fn client_in(room: &str, name: &str, tags: &[&str]) -> (Arc<ClientSession>, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(256);
    let client = ClientSession::new(
        ClientIdentity {
            room_id: room.to_string(),
            uuid: format!("uuid-{name}"),
            name: name.to_string(),
            ip_address: "10.0.0.1".into(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..ClientIdentity::default()
        },
        tx,
        BatchSettings::default(),
    );
    (client, rx)
}

/// Lets the spawned pumps run; the runtime is single-threaded in tests.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

fn frames(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Ok(outbound) = rx.try_recv() {
        if let Outbound::Frame(frame) = outbound {
            out.push(frame);
        }
    }
    out
}

async fn collect_space_writes(endpoint: &mut SpaceEndpoints) -> Vec<SpaceWriteFrame> {
    let mut out = Vec::new();
    while let Ok(frame) = endpoint.from_pusher.try_recv() {
        out.push(frame);
    }
    out
}

// ----- scenarios ------------------------------------------------------------

#[tokio::test]
async fn two_clients_share_one_room() {
    let h = harness();
    let (a, _a_rx) = client_in("room/x", "a", &[]);
    let (b, _b_rx) = client_in("room/x", "b", &[]);

    h.mux.handle_join_room(&a).await.unwrap();
    h.mux.handle_join_room(&b).await.unwrap();
    assert_eq!(h.mux.room_population("room/x").await, Some(2));

    // One join announcement per client went downstream.
    let mut streams = h.back.room_streams.lock().await;
    assert_eq!(streams.len(), 2);
    for endpoint in streams.iter_mut() {
        let first = endpoint.from_pusher.try_recv().unwrap();
        assert!(matches!(first, RoomInFrame::JoinRoom(ref join) if join.room_url == "room/x"));
    }
    drop(streams);

    // Closing one client keeps the room alive for the other.
    h.mux.handle_disconnect(&a).await;
    assert_eq!(h.mux.room_population("room/x").await, Some(1));

    h.mux.handle_disconnect(&b).await;
    assert_eq!(h.mux.room_population("room/x").await, None);

    h.mux.close().await;
}

#[tokio::test]
async fn concurrent_joins_create_the_room_once() {
    let h = harness();
    let (a, _a_rx) = client_in("room/x", "a", &[]);
    let (b, _b_rx) = client_in("room/x", "b", &[]);

    let (ra, rb) = tokio::join!(h.mux.handle_join_room(&a), h.mux.handle_join_room(&b));
    ra.unwrap();
    rb.unwrap();

    assert_eq!(h.mux.room_population("room/x").await, Some(2));
    // Exactly one zone feed means exactly one room was created.
    assert_eq!(h.back.zone_rooms.lock().unwrap().len(), 1);

    h.mux.close().await;
}

#[tokio::test]
async fn spaces_on_one_back_share_a_single_stream() {
    let h = harness();
    let (a, _a_rx) = client_in("room/x", "a", &[]);
    let (b, _b_rx) = client_in("room/x", "b", &[]);

    let (ra, rb) = tokio::join!(
        h.mux.handle_join_space(&a, "space/s1", ""),
        h.mux.handle_join_space(&b, "space/s2", "")
    );
    ra.unwrap();
    rb.unwrap();

    // One connection, two join announcements.
    assert_eq!(h.back.space_connects.load(Ordering::SeqCst), 1);
    let mut endpoints = h.back.space_endpoints.lock().await;
    let writes = collect_space_writes(&mut endpoints[0]).await;
    let joins: Vec<&SpaceWriteFrame> = writes
        .iter()
        .filter(|w| matches!(w, SpaceWriteFrame::JoinSpace { .. }))
        .collect();
    assert_eq!(joins.len(), 2);
    drop(endpoints);

    h.mux.close().await;
}

#[tokio::test(start_paused = true)]
async fn a_silent_back_expires_the_ping_watchdog() {
    let h = harness();
    let (a, _a_rx) = client_in("room/x", "a", &[]);
    h.mux.handle_join_space(&a, "space/s", "").await.unwrap();
    assert!(h.mux.has_space_stream(0).await);

    // A ping inside the window answers with a pong and rearms the watchdog.
    tokio::time::advance(Duration::from_secs(30)).await;
    {
        let endpoints = h.back.space_endpoints.lock().await;
        endpoints[0]
            .to_pusher
            .send(Ok(SpaceReadFrame::Ping))
            .await
            .unwrap();
    }
    settle().await;
    {
        let mut endpoints = h.back.space_endpoints.lock().await;
        let writes = collect_space_writes(&mut endpoints[0]).await;
        assert!(writes.iter().any(|w| matches!(w, SpaceWriteFrame::Pong)));
    }
    tokio::time::advance(Duration::from_secs(45)).await;
    settle().await;
    // 75 s total, but the ping at 30 s pushed the deadline to 90 s.
    assert!(h.mux.has_space_stream(0).await);

    tokio::time::advance(Duration::from_secs(61)).await;
    settle().await;

    assert!(!h.mux.has_space_stream(0).await);
    assert_eq!(h.mux.space_watcher_count("space/s").await, None);
    // The client's own space list was scrubbed as well.
    assert!(a.data.lock().await.spaces.is_empty());

    h.mux.close().await;
}

#[tokio::test]
async fn filtered_update_from_the_back_surfaces_as_an_add() {
    let h = harness();
    let (a, mut a_rx) = client_in("room/x", "a", &[]);
    h.mux.handle_join_space(&a, "space/s", "").await.unwrap();
    h.mux
        .handle_add_space_filter(
            &a,
            "space/s",
            SpaceFilter {
                name: "guides".into(),
                kind: SpaceFilterKind::ByRole("guide".into()),
            },
        )
        .await
        .unwrap();
    frames(&mut a_rx); // metadata snapshot etc.

    let send = |frame: SpaceReadFrame| {
        let h = &h;
        async move {
            let endpoints = h.back.space_endpoints.lock().await;
            endpoints[0].to_pusher.send(Ok(frame)).await.unwrap();
        }
    };

    let user = |id: i32, role: &str| SpaceUser {
        id,
        uuid: format!("u-{id}"),
        name: format!("user-{id}"),
        role: role.into(),
        ..SpaceUser::default()
    };

    send(SpaceReadFrame::AddSpaceUser {
        space_name: "space/s".into(),
        user: user(1, "guide"),
    })
    .await;
    send(SpaceReadFrame::AddSpaceUser {
        space_name: "space/s".into(),
        user: user(2, "guest"),
    })
    .await;
    settle().await;
    let received = frames(&mut a_rx);
    assert_eq!(received.len(), 1, "only the guide is visible: {received:?}");

    send(SpaceReadFrame::UpdateSpaceUser {
        space_name: "space/s".into(),
        user: user(2, "guide"),
        mask: FieldMask::new(["role"]),
    })
    .await;
    settle().await;

    let received = frames(&mut a_rx);
    assert_eq!(received.len(), 1);
    assert!(
        matches!(
            &received[0],
            ServerMessage::SpaceUserAdded { user, .. } if user.id == 2
        ),
        "a previously invisible user surfaces as an add: {received:?}"
    );

    h.mux.close().await;
}

#[tokio::test]
async fn player_details_diff_broadcasts_only_changed_fields() {
    let h = harness();
    let (a, _a_rx) = client_in("room/x", "a", &[]);
    h.mux.handle_join_room(&a).await.unwrap();
    h.mux.handle_join_space(&a, "space/s1", "").await.unwrap();
    h.mux.handle_join_space(&a, "space/s2", "").await.unwrap();
    {
        let mut data = a.data.lock().await;
        data.space_user.availability_status = 1;
        data.space_user.chat_id = "old".into();
    }
    {
        // Discard the join-time traffic.
        let mut endpoints = h.back.space_endpoints.lock().await;
        collect_space_writes(&mut endpoints[0]).await;
    }

    h.mux
        .handle_set_player_details(
            &a,
            PlayerDetails {
                availability_status: 1,
                chat_id: "new".into(),
                outline_color: None,
            },
        )
        .await
        .unwrap();
    settle().await;

    let mut endpoints = h.back.space_endpoints.lock().await;
    let writes = collect_space_writes(&mut endpoints[0]).await;
    let updates: Vec<_> = writes
        .iter()
        .filter_map(|w| match w {
            SpaceWriteFrame::UpdateSpaceUser { space_name, user, mask } => {
                Some((space_name.clone(), user.clone(), mask.clone()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), 2, "one update per joined space");
    for (_, user, mask) in &updates {
        assert_eq!(mask.paths, vec!["chatID".to_string()]);
        assert_eq!(user.chat_id, "new");
    }
    drop(endpoints);

    // The chat id change was persisted through the admin service.
    let chat_updates = h.admin.chat_id_updates.lock().unwrap().clone();
    assert_eq!(chat_updates, vec![("uuid-a".to_string(), "new".to_string())]);

    // Repeating identical details produces no further updates.
    h.mux
        .handle_set_player_details(
            &a,
            PlayerDetails {
                availability_status: 1,
                chat_id: "new".into(),
                outline_color: None,
            },
        )
        .await
        .unwrap();
    let mut endpoints = h.back.space_endpoints.lock().await;
    let writes = collect_space_writes(&mut endpoints[0]).await;
    assert!(writes.is_empty());

    h.mux.close().await;
}

#[tokio::test]
async fn world_broadcast_reaches_every_room_once() {
    let h = harness();
    *h.admin.same_world_rooms.lock().unwrap() =
        vec!["room/r1".into(), "room/r2".into(), "room/r3".into()];
    let (admin_client, _rx) = client_in("room/r1", "boss", &["admin"]);

    h.mux
        .emit_play_global_message(
            &admin_client,
            PlayGlobalMessage {
                kind: "text".into(),
                content: "maintenance in 5 minutes".into(),
                broadcast_to_world: true,
            },
        )
        .await
        .unwrap();

    let broadcasts = h.back.room_broadcasts.lock().unwrap().clone();
    let mut rooms: Vec<String> = broadcasts.iter().map(|(room, _)| room.clone()).collect();
    rooms.sort();
    assert_eq!(rooms, vec!["room/r1", "room/r2", "room/r3"]);
    assert!(
        broadcasts
            .iter()
            .all(|(_, b)| b.content == "maintenance in 5 minutes")
    );

    h.mux.close().await;
}

#[tokio::test]
async fn global_broadcast_requires_the_admin_tag() {
    let h = harness();
    let (pleb, _rx) = client_in("room/r1", "pleb", &[]);
    let result = h
        .mux
        .emit_play_global_message(
            &pleb,
            PlayGlobalMessage {
                kind: "text".into(),
                content: "hi".into(),
                broadcast_to_world: false,
            },
        )
        .await;
    assert!(matches!(result, Err(PusherError::Unauthorized(_))));
    assert!(h.back.room_broadcasts.lock().unwrap().is_empty());

    // Bans from non-admins are rejected silently.
    h.mux
        .handle_ban_user(&pleb, "uuid-x", "X", "bye")
        .await
        .unwrap();
    assert!(h.back.bans.lock().unwrap().is_empty());

    h.mux.close().await;
}

// ----- lifecycle invariants -------------------------------------------------

#[tokio::test]
async fn leaving_the_last_space_disposes_the_shared_stream() {
    let h = harness();
    let (a, _a_rx) = client_in("room/x", "a", &[]);
    let (b, _b_rx) = client_in("room/x", "b", &[]);

    h.mux.handle_join_space(&a, "space/s1", "").await.unwrap();
    h.mux.handle_join_space(&b, "space/s2", "").await.unwrap();
    assert!(h.mux.has_space_stream(0).await);

    h.mux.handle_leave_space(&a, "space/s1").await.unwrap();
    // One space still references back 0; the stream survives.
    assert!(h.mux.has_space_stream(0).await);
    assert_eq!(h.mux.space_watcher_count("space/s1").await, None);

    h.mux.handle_leave_space(&b, "space/s2").await.unwrap();
    assert!(!h.mux.has_space_stream(0).await);

    // The back was told about both departures.
    let mut endpoints = h.back.space_endpoints.lock().await;
    let writes = collect_space_writes(&mut endpoints[0]).await;
    let leaves = writes
        .iter()
        .filter(|w| matches!(w, SpaceWriteFrame::LeaveSpace { .. }))
        .count();
    assert_eq!(leaves, 2);

    h.mux.close().await;
}

#[tokio::test]
async fn watcher_and_space_list_stay_bidirectional() {
    let h = harness();
    let (a, _a_rx) = client_in("room/x", "a", &[]);

    h.mux.handle_join_space(&a, "space/s", "alias").await.unwrap();
    assert_eq!(h.mux.space_watcher_count("space/s").await, Some(1));
    {
        let data = a.data.lock().await;
        assert_eq!(data.spaces.len(), 1);
        assert_eq!(data.spaces[0].name, "space/s");
        assert_eq!(data.spaces[0].local_name, "alias");
    }

    h.mux.leave_spaces(&a).await;
    assert_eq!(h.mux.space_watcher_count("space/s").await, None);
    assert!(a.data.lock().await.spaces.is_empty());

    h.mux.close().await;
}

#[tokio::test]
async fn disconnect_cleans_room_spaces_and_runs_once() {
    let h = harness();
    let (a, _a_rx) = client_in("room/x", "a", &[]);
    h.mux.handle_join_room(&a).await.unwrap();
    h.mux.handle_join_space(&a, "space/s", "").await.unwrap();

    h.mux.handle_disconnect(&a).await;
    assert_eq!(h.mux.room_population("room/x").await, None);
    assert_eq!(h.mux.space_watcher_count("space/s").await, None);
    assert!(!h.mux.has_space_stream(0).await);
    assert!(a.is_disconnecting());

    // The teardown is idempotent.
    h.mux.handle_disconnect(&a).await;

    h.mux.close().await;
}

#[tokio::test]
async fn operations_on_unknown_spaces_list_the_known_ones() {
    let h = harness();
    let (a, _a_rx) = client_in("room/x", "a", &[]);
    a.assign_user_id(7);
    h.mux.handle_join_space(&a, "space/known", "").await.unwrap();

    let result = h
        .mux
        .handle_public_event(&a, "space/unknown", "\"hello\"".into())
        .await;
    match result {
        Err(PusherError::UnknownSpace { requested, known }) => {
            assert_eq!(requested, "space/unknown");
            assert_eq!(known, vec!["space/known".to_string()]);
        }
        other => panic!("expected UnknownSpace, got {other:?}"),
    }

    h.mux.close().await;
}

#[tokio::test]
async fn events_without_a_user_id_are_rejected() {
    let h = harness();
    let (a, _a_rx) = client_in("room/x", "a", &[]);
    h.mux.handle_join_space(&a, "space/s", "").await.unwrap();

    let result = h.mux.handle_public_event(&a, "space/s", "\"hi\"".into()).await;
    assert!(matches!(result, Err(PusherError::NoUserId)));

    h.mux.close().await;
}

#[tokio::test]
async fn kick_for_an_unknown_space_is_relayed_blind() {
    let h = harness();
    let (a, _a_rx) = client_in("room/x", "a", &[]);
    let (b, _b_rx) = client_in("room/x", "b", &[]);
    // Somebody else's space keeps a stream to back 0 open.
    h.mux.handle_join_space(&b, "space/other", "").await.unwrap();

    h.mux.handle_kick_off(&a, "space/remote", 42).await.unwrap();

    let mut endpoints = h.back.space_endpoints.lock().await;
    let writes = collect_space_writes(&mut endpoints[0]).await;
    assert!(writes.iter().any(|w| matches!(
        w,
        SpaceWriteFrame::KickOffUser { space_name, user_id: 42 } if space_name == "space/remote"
    )));

    h.mux.close().await;
}

#[tokio::test]
async fn invalid_metadata_from_the_back_is_dropped() {
    let h = harness();
    let (a, mut a_rx) = client_in("room/x", "a", &[]);
    h.mux.handle_join_space(&a, "space/s", "").await.unwrap();
    frames(&mut a_rx);

    {
        let endpoints = h.back.space_endpoints.lock().await;
        endpoints[0]
            .to_pusher
            .send(Ok(SpaceReadFrame::UpdateSpaceMetadata {
                space_name: "space/s".into(),
                metadata: "not json at all".into(),
            }))
            .await
            .unwrap();
        endpoints[0]
            .to_pusher
            .send(Ok(SpaceReadFrame::UpdateSpaceMetadata {
                space_name: "space/s".into(),
                metadata: r#"{"topic":"rust"}"#.into(),
            }))
            .await
            .unwrap();
    }
    settle().await;

    // The bad blob was dropped, the stream survived, the good one landed.
    let received = frames(&mut a_rx);
    assert_eq!(received.len(), 1);
    assert!(matches!(
        &received[0],
        ServerMessage::SpaceMetadataUpdated { metadata, .. } if metadata.contains("rust")
    ));

    h.mux.close().await;
}

#[tokio::test]
async fn queries_answer_with_degraded_or_error_payloads() {
    let h = harness();
    let (a, mut a_rx) = client_in("room/x", "a", &[]);

    *h.admin.fail_tags.lock().unwrap() = true;
    h.mux
        .handle_query(&a, 1, protocol::QueryKind::RoomTags)
        .await;
    // The tag list degrades to empty instead of erroring.
    let received = frames(&mut a_rx);
    assert!(matches!(
        &received[0],
        ServerMessage::Answer {
            id: 1,
            payload: protocol::AnswerPayload::Tags { tags }
        } if tags.is_empty()
    ));

    h.mux
        .handle_query(
            &a,
            2,
            protocol::QueryKind::EmbeddableWebsite {
                url: "https://allowlisted.example/page".into(),
            },
        )
        .await;
    let received = frames(&mut a_rx);
    assert!(matches!(
        &received[0],
        ServerMessage::Answer {
            id: 2,
            payload: protocol::AnswerPayload::EmbeddableWebsite {
                state: EmbeddableState::Embeddable,
                ..
            }
        }
    ));

    h.mux.close().await;
}

#[tokio::test]
async fn join_space_delivers_the_metadata_snapshot() {
    let h = harness();
    let (a, mut a_rx) = client_in("room/x", "a", &[]);
    h.mux.handle_join_space(&a, "space/s", "").await.unwrap();
    {
        let endpoints = h.back.space_endpoints.lock().await;
        endpoints[0]
            .to_pusher
            .send(Ok(SpaceReadFrame::UpdateSpaceMetadata {
                space_name: "space/s".into(),
                metadata: r#"{"topic":"rust"}"#.into(),
            }))
            .await
            .unwrap();
    }
    settle().await;
    frames(&mut a_rx);

    // A later joiner of the same space sees the accumulated metadata.
    let (b, mut b_rx) = client_in("room/x", "b", &[]);
    h.mux.handle_join_space(&b, "space/s", "").await.unwrap();
    let received = frames(&mut b_rx);
    let snapshot = received.iter().find_map(|frame| match frame {
        ServerMessage::SpaceMetadataUpdated { metadata, .. } => Some(metadata.clone()),
        _ => None,
    });
    let snapshot = snapshot.expect("metadata snapshot on join");
    let parsed: HashMap<String, serde_json::Value> = serde_json::from_str(&snapshot).unwrap();
    assert_eq!(parsed["topic"], "rust");

    h.mux.close().await;
}
