//! Per-space state: the user mirror, the metadata map, the watcher set and
//! the per-client filters deciding which mutations each watcher sees.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

use protocol::{
    FieldMask, PrivateSpaceEvent, PublicSpaceEvent, ServerMessage, SpaceFilter, SpaceUser,
    SpaceWriteFrame, filters_admit,
};

use crate::back::BackError;
use crate::client::ClientSession;

struct Watcher {
    client: Arc<ClientSession>,
    /// The alias this client joined the space under; used in every frame
    /// sent back to it.
    local_name: String,
    filters: Vec<SpaceFilter>,
}

#[derive(Default)]
struct SpaceInner {
    users: HashMap<i32, SpaceUser>,
    metadata: HashMap<String, Value>,
    watchers: HashMap<u64, Watcher>,
}

pub struct Space {
    name: String,
    back_id: usize,
    to_back: mpsc::Sender<SpaceWriteFrame>,
    inner: Mutex<SpaceInner>,
}

impl Space {
    pub fn new(name: &str, back_id: usize, to_back: mpsc::Sender<SpaceWriteFrame>) -> Arc<Self> {
        Arc::new(Space {
            name: name.to_string(),
            back_id,
            to_back,
            inner: Mutex::new(SpaceInner::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn back_id(&self) -> usize {
        self.back_id
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.watchers.is_empty()
    }

    pub async fn user_count(&self) -> usize {
        self.inner.lock().await.users.len()
    }

    pub async fn watcher_count(&self) -> usize {
        self.inner.lock().await.watchers.len()
    }

    /// Serialized snapshot of the current metadata, sent to joining clients.
    pub async fn metadata_snapshot(&self) -> String {
        let inner = self.inner.lock().await;
        serde_json::to_string(&inner.metadata).unwrap_or_else(|_| "{}".into())
    }

    pub async fn add_client_watcher(
        &self,
        client: Arc<ClientSession>,
        local_name: &str,
        filters: Vec<SpaceFilter>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.watchers.insert(
            client.session_id,
            Watcher {
                client,
                local_name: local_name.to_string(),
                filters,
            },
        );
    }

    pub async fn remove_client_watcher(&self, client: &ClientSession) {
        let mut inner = self.inner.lock().await;
        inner.watchers.remove(&client.session_id);
    }

    /// Removes every watcher at once; used when the space is evicted after a
    /// back-stream loss so the client mirrors can be scrubbed.
    pub async fn drain_watchers(&self) -> Vec<Arc<ClientSession>> {
        let mut inner = self.inner.lock().await;
        inner
            .watchers
            .drain()
            .map(|(_, watcher)| watcher.client)
            .collect()
    }

    /// Unicast to one watcher, bypassing filters.
    pub async fn notify_me(&self, client: &ClientSession, message: ServerMessage) {
        if self.inner.lock().await.watchers.contains_key(&client.session_id) {
            client.send(message);
        }
    }

    /// Client-originated registration. The first local registration also
    /// announces the user to the back.
    pub async fn add_user(&self, user: SpaceUser, client: &ClientSession) -> Result<(), BackError> {
        let first_registration = {
            let mut inner = self.inner.lock().await;
            let known = inner.users.contains_key(&user.id);
            if inner.users.get(&user.id) != Some(&user) {
                fan_out_add(&inner, &user);
                inner.users.insert(user.id, user.clone());
            }
            !known
        };
        if first_registration {
            tracing::debug!(space = self.name, client = client.uuid, "First registration of a space user.");
            self.to_back
                .send(SpaceWriteFrame::AddSpaceUser {
                    space_name: self.name.clone(),
                    user,
                })
                .await
                .map_err(|_| BackError::StreamClosed)?;
        }
        Ok(())
    }

    /// Client-originated update: forward to the back, mirror locally.
    pub async fn update_user(&self, user: SpaceUser, mask: FieldMask) -> Result<(), BackError> {
        self.to_back
            .send(SpaceWriteFrame::UpdateSpaceUser {
                space_name: self.name.clone(),
                user: user.clone(),
                mask: mask.clone(),
            })
            .await
            .map_err(|_| BackError::StreamClosed)?;
        self.local_update_user(user, mask).await;
        Ok(())
    }

    /// Client-originated removal: forward to the back, mirror locally.
    pub async fn remove_user(&self, user_id: i32) -> Result<(), BackError> {
        self.to_back
            .send(SpaceWriteFrame::RemoveSpaceUser {
                space_name: self.name.clone(),
                user_id,
            })
            .await
            .map_err(|_| BackError::StreamClosed)?;
        self.local_remove_user(user_id).await;
        Ok(())
    }

    /// Remote-originated registration, fanned out to admitted watchers.
    pub async fn local_add_user(&self, user: SpaceUser) {
        let mut inner = self.inner.lock().await;
        if inner.users.get(&user.id) == Some(&user) {
            // Echo of a record we already mirrored and announced.
            return;
        }
        fan_out_add(&inner, &user);
        inner.users.insert(user.id, user);
    }

    /// Remote-originated masked update. Watchers for whom the user crosses
    /// the filter boundary get an add or a remove instead of the update.
    pub async fn local_update_user(&self, update: SpaceUser, mask: FieldMask) {
        let mut inner = self.inner.lock().await;
        let Some(existing) = inner.users.get(&update.id) else {
            // Update for a user we never mirrored; treat it as an add.
            drop(inner);
            self.local_add_user(update).await;
            return;
        };
        let before = existing.clone();
        let mut merged = before.clone();
        let unknown = merged.merge_masked(&update, &mask);
        if !unknown.is_empty() {
            tracing::warn!(space = self.name, ?unknown, "Unknown field-mask paths.");
        }
        inner.users.insert(merged.id, merged.clone());

        for watcher in inner.watchers.values() {
            let was_admitted = filters_admit(&watcher.filters, &before);
            let is_admitted = filters_admit(&watcher.filters, &merged);
            match (was_admitted, is_admitted) {
                (false, true) => watcher.client.send(ServerMessage::SpaceUserAdded {
                    space_name: watcher.local_name.clone(),
                    user: merged.clone(),
                }),
                (true, true) => watcher.client.send(ServerMessage::SpaceUserUpdated {
                    space_name: watcher.local_name.clone(),
                    user: merged.clone(),
                    mask: mask.clone(),
                }),
                (true, false) => watcher.client.send(ServerMessage::SpaceUserRemoved {
                    space_name: watcher.local_name.clone(),
                    user_id: merged.id,
                }),
                (false, false) => {}
            }
        }
    }

    /// Remote-originated removal.
    pub async fn local_remove_user(&self, user_id: i32) {
        let mut inner = self.inner.lock().await;
        let Some(removed) = inner.users.remove(&user_id) else {
            return;
        };
        for watcher in inner.watchers.values() {
            if filters_admit(&watcher.filters, &removed) {
                watcher.client.send(ServerMessage::SpaceUserRemoved {
                    space_name: watcher.local_name.clone(),
                    user_id,
                });
            }
        }
    }

    /// Merge-overwrites top-level metadata keys. `propagate` notifies
    /// watchers of the update; local echoes of a client's own write skip it.
    pub async fn local_update_metadata(&self, update: HashMap<String, Value>, propagate: bool) {
        let mut inner = self.inner.lock().await;
        for (key, value) in &update {
            inner.metadata.insert(key.clone(), value.clone());
        }
        if !propagate {
            return;
        }
        let blob = serde_json::to_string(&update).unwrap_or_else(|_| "{}".into());
        for watcher in inner.watchers.values() {
            watcher.client.send(ServerMessage::SpaceMetadataUpdated {
                space_name: watcher.local_name.clone(),
                metadata: blob.clone(),
            });
        }
    }

    pub async fn metadata_value(&self, key: &str) -> Option<Value> {
        self.inner.lock().await.metadata.get(key).cloned()
    }

    /// Installs or replaces a filter by name, then reports the visibility
    /// delta to the client: adds for newly visible users, removes for newly
    /// hidden ones. Adding the same filter twice is a no-op.
    pub async fn handle_add_filter(&self, client: &ClientSession, filter: SpaceFilter) {
        let mut inner = self.inner.lock().await;
        let SpaceInner {
            users, watchers, ..
        } = &mut *inner;
        let Some(watcher) = watchers.get_mut(&client.session_id) else {
            return;
        };
        let before = watcher.filters.clone();
        match watcher.filters.iter_mut().find(|f| f.name == filter.name) {
            Some(existing) => *existing = filter,
            None => watcher.filters.push(filter),
        }
        report_filter_delta(users, watcher, &before);
    }

    /// Replaces a filter by name. Returns false when no filter with that
    /// name exists so the caller can log and drop the request.
    pub async fn handle_update_filter(&self, client: &ClientSession, filter: SpaceFilter) -> bool {
        let mut inner = self.inner.lock().await;
        let SpaceInner {
            users, watchers, ..
        } = &mut *inner;
        let Some(watcher) = watchers.get_mut(&client.session_id) else {
            return false;
        };
        let before = watcher.filters.clone();
        let Some(existing) = watcher.filters.iter_mut().find(|f| f.name == filter.name) else {
            return false;
        };
        *existing = filter;
        report_filter_delta(users, watcher, &before);
        true
    }

    /// Drops a filter by name; removing an absent filter is a no-op.
    pub async fn handle_remove_filter(&self, client: &ClientSession, filter_name: &str) {
        let mut inner = self.inner.lock().await;
        let SpaceInner {
            users, watchers, ..
        } = &mut *inner;
        let Some(watcher) = watchers.get_mut(&client.session_id) else {
            return;
        };
        let before = watcher.filters.clone();
        watcher.filters.retain(|f| f.name != filter_name);
        if watcher.filters.len() != before.len() {
            report_filter_delta(users, watcher, &before);
        }
    }

    /// Fan-out of a public event to every watcher.
    pub async fn send_public_event(&self, event: PublicSpaceEvent) {
        let inner = self.inner.lock().await;
        for watcher in inner.watchers.values() {
            let mut event = event.clone();
            event.space_name = watcher.local_name.clone();
            watcher.client.send(ServerMessage::PublicSpaceEvent(event));
        }
    }

    /// Delivery of a private event to the single addressed watcher.
    pub async fn send_private_event(&self, event: PrivateSpaceEvent) {
        let inner = self.inner.lock().await;
        for watcher in inner.watchers.values() {
            if watcher.client.user_id() == Some(event.receiver_user_id) {
                let mut event = event.clone();
                event.space_name = watcher.local_name.clone();
                watcher.client.send(ServerMessage::PrivateSpaceEvent(event));
                return;
            }
        }
        tracing::debug!(
            space = self.name,
            receiver = event.receiver_user_id,
            "Private event for a user not watching here."
        );
    }

    /// Client-originated events are forwarded to the back; the back echoes
    /// them to every pusher watching the space.
    pub async fn forward_public_event(&self, event: PublicSpaceEvent) -> Result<(), BackError> {
        self.to_back
            .send(SpaceWriteFrame::PublicEvent(event))
            .await
            .map_err(|_| BackError::StreamClosed)
    }

    pub async fn forward_private_event(&self, event: PrivateSpaceEvent) -> Result<(), BackError> {
        self.to_back
            .send(SpaceWriteFrame::PrivateEvent(event))
            .await
            .map_err(|_| BackError::StreamClosed)
    }

    /// Relays a kick request to the back, which owns the authorization.
    pub async fn kick_off_user(
        &self,
        sender: &ClientSession,
        user_id: i32,
    ) -> Result<(), BackError> {
        tracing::info!(
            space = self.name,
            sender = sender.uuid,
            user_id,
            "Relaying kick-off to back."
        );
        self.to_back
            .send(SpaceWriteFrame::KickOffUser {
                space_name: self.name.clone(),
                user_id,
            })
            .await
            .map_err(|_| BackError::StreamClosed)
    }

    /// Forwards a metadata update to the back.
    pub async fn forward_metadata_update(&self, metadata: String) -> Result<(), BackError> {
        self.to_back
            .send(SpaceWriteFrame::UpdateSpaceMetadata {
                space_name: self.name.clone(),
                metadata,
            })
            .await
            .map_err(|_| BackError::StreamClosed)
    }

    /// Announces to the back that no local client watches this space any
    /// more. Called right before the space is dropped from the directory.
    pub async fn announce_leave(&self) {
        let _ = self
            .to_back
            .send(SpaceWriteFrame::LeaveSpace {
                space_name: self.name.clone(),
            })
            .await;
    }
}

fn fan_out_add(inner: &SpaceInner, user: &SpaceUser) {
    for watcher in inner.watchers.values() {
        if filters_admit(&watcher.filters, user) {
            watcher.client.send(ServerMessage::SpaceUserAdded {
                space_name: watcher.local_name.clone(),
                user: user.clone(),
            });
        }
    }
}

/// Sends the visibility difference caused by a filter change to the watcher.
fn report_filter_delta(users: &HashMap<i32, SpaceUser>, watcher: &Watcher, before: &[SpaceFilter]) {
    for user in users.values() {
        let was_admitted = filters_admit(before, user);
        let is_admitted = filters_admit(&watcher.filters, user);
        match (was_admitted, is_admitted) {
            (false, true) => watcher.client.send(ServerMessage::SpaceUserAdded {
                space_name: watcher.local_name.clone(),
                user: user.clone(),
            }),
            (true, false) => watcher.client.send(ServerMessage::SpaceUserRemoved {
                space_name: watcher.local_name.clone(),
                user_id: user.id,
            }),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchSettings;
    use crate::client::{ClientIdentity, Outbound};
    use protocol::{SpaceFilterKind, SpaceWriteFrame};
    use tokio::sync::mpsc::Receiver;

    fn test_client(name: &str) -> (Arc<ClientSession>, Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(64);
        let client = ClientSession::new(
            ClientIdentity {
                room_id: "room/x".into(),
                uuid: format!("uuid-{name}"),
                name: name.into(),
                ..ClientIdentity::default()
            },
            tx,
            BatchSettings::default(),
        );
        (client, rx)
    }

    fn space() -> (Arc<Space>, mpsc::Receiver<SpaceWriteFrame>) {
        let (to_back, back_rx) = mpsc::channel(64);
        (Space::new("space/s", 3, to_back), back_rx)
    }

    fn guide_filter() -> SpaceFilter {
        SpaceFilter {
            name: "guides-only".into(),
            kind: SpaceFilterKind::ByRole("guide".into()),
        }
    }

    fn user(id: i32, role: &str) -> SpaceUser {
        SpaceUser {
            id,
            uuid: format!("u-{id}"),
            name: format!("user-{id}"),
            role: role.into(),
            ..SpaceUser::default()
        }
    }

    fn drain(rx: &mut Receiver<Outbound>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(Outbound::Frame(frame)) = rx.try_recv() {
            out.push(frame);
        }
        out
    }

    #[tokio::test]
    async fn filtered_update_crossing_the_boundary_becomes_an_add() {
        let (space, _back) = space();
        let (watcher, mut rx) = test_client("a");
        space
            .add_client_watcher(watcher.clone(), "space/s", vec![guide_filter()])
            .await;

        space.local_add_user(user(1, "guide")).await;
        space.local_add_user(user(2, "guest")).await;
        // Only the guide was visible so far.
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ServerMessage::SpaceUserAdded { user, .. } if user.id == 1
        ));

        // u2 becomes a guide; previously invisible, so an add, not an update.
        space
            .local_update_user(user(2, "guide"), FieldMask::new(["role"]))
            .await;
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ServerMessage::SpaceUserAdded { user, .. } if user.id == 2 && user.role == "guide"
        ));
    }

    #[tokio::test]
    async fn update_leaving_the_filter_becomes_a_remove() {
        let (space, _back) = space();
        let (watcher, mut rx) = test_client("a");
        space
            .add_client_watcher(watcher.clone(), "space/s", vec![guide_filter()])
            .await;
        space.local_add_user(user(1, "guide")).await;
        drain(&mut rx);

        space
            .local_update_user(user(1, "guest"), FieldMask::new(["role"]))
            .await;
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ServerMessage::SpaceUserRemoved { user_id: 1, .. }
        ));
    }

    #[tokio::test]
    async fn masked_update_keeps_unmasked_fields_for_watchers() {
        let (space, _back) = space();
        let (watcher, mut rx) = test_client("a");
        space.add_client_watcher(watcher.clone(), "space/s", Vec::new()).await;
        let mut original = user(5, "guide");
        original.chat_id = "keep@chat".into();
        space.local_add_user(original).await;
        drain(&mut rx);

        let mut update = user(5, "guest");
        update.chat_id = "ignored@chat".into();
        space.local_update_user(update, FieldMask::new(["role"])).await;

        let frames = drain(&mut rx);
        assert!(matches!(
            &frames[0],
            ServerMessage::SpaceUserUpdated { user, .. }
                if user.role == "guest" && user.chat_id == "keep@chat"
        ));
    }

    #[tokio::test]
    async fn adding_a_filter_reports_the_visibility_delta() {
        let (space, _back) = space();
        let (watcher, mut rx) = test_client("a");
        space.add_client_watcher(watcher.clone(), "space/s", Vec::new()).await;
        space.local_add_user(user(1, "guide")).await;
        space.local_add_user(user(2, "guest")).await;
        drain(&mut rx);

        space.handle_add_filter(&watcher, guide_filter()).await;
        let frames = drain(&mut rx);
        // The guest drops out; the guide stays visible and is not re-added.
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            ServerMessage::SpaceUserRemoved { user_id: 2, .. }
        ));

        // Adding the identical filter again changes nothing.
        space.handle_add_filter(&watcher, guide_filter()).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn updating_an_unknown_filter_is_rejected() {
        let (space, _back) = space();
        let (watcher, _rx) = test_client("a");
        space.add_client_watcher(watcher.clone(), "space/s", Vec::new()).await;
        assert!(!space.handle_update_filter(&watcher, guide_filter()).await);
    }

    #[tokio::test]
    async fn removing_a_filter_restores_hidden_users() {
        let (space, _back) = space();
        let (watcher, mut rx) = test_client("a");
        space
            .add_client_watcher(watcher.clone(), "space/s", vec![guide_filter()])
            .await;
        space.local_add_user(user(1, "guest")).await;
        assert!(drain(&mut rx).is_empty());

        space.handle_remove_filter(&watcher, "guides-only").await;
        let frames = drain(&mut rx);
        assert!(matches!(
            &frames[0],
            ServerMessage::SpaceUserAdded { user, .. } if user.id == 1
        ));

        // Removing it again is a no-op.
        space.handle_remove_filter(&watcher, "guides-only").await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn metadata_merge_overwrites_only_named_keys() {
        let (space, _back) = space();
        space
            .local_update_metadata(
                HashMap::from([("topic".to_string(), Value::from("rust"))]),
                false,
            )
            .await;
        space
            .local_update_metadata(
                HashMap::from([("mood".to_string(), Value::from("good"))]),
                false,
            )
            .await;
        assert_eq!(space.metadata_value("topic").await, Some(Value::from("rust")));
        assert_eq!(space.metadata_value("mood").await, Some(Value::from("good")));

        space
            .local_update_metadata(
                HashMap::from([("topic".to_string(), Value::from("tokio"))]),
                false,
            )
            .await;
        assert_eq!(space.metadata_value("topic").await, Some(Value::from("tokio")));
        assert_eq!(space.metadata_value("mood").await, Some(Value::from("good")));
    }

    #[tokio::test]
    async fn metadata_propagation_reaches_watchers_under_their_alias() {
        let (space, _back) = space();
        let (watcher, mut rx) = test_client("a");
        space
            .add_client_watcher(watcher.clone(), "local-alias", Vec::new())
            .await;
        space
            .local_update_metadata(
                HashMap::from([("topic".to_string(), Value::from("rust"))]),
                true,
            )
            .await;
        let frames = drain(&mut rx);
        assert!(matches!(
            &frames[0],
            ServerMessage::SpaceMetadataUpdated { space_name, metadata }
                if space_name == "local-alias" && metadata.contains("rust")
        ));
    }

    #[tokio::test]
    async fn first_add_user_announces_to_the_back_once() {
        let (space, mut back) = space();
        let (client, _rx) = test_client("a");
        space.add_user(user(1, "guide"), &client).await.unwrap();
        space.add_user(user(1, "guide"), &client).await.unwrap();
        assert!(matches!(
            back.try_recv(),
            Ok(SpaceWriteFrame::AddSpaceUser { .. })
        ));
        assert!(back.try_recv().is_err());
    }

    #[tokio::test]
    async fn private_events_reach_only_the_addressed_watcher() {
        let (space, _back) = space();
        let (alice, mut alice_rx) = test_client("alice");
        let (bob, mut bob_rx) = test_client("bob");
        alice.assign_user_id(1);
        bob.assign_user_id(2);
        space.add_client_watcher(alice.clone(), "space/s", Vec::new()).await;
        space.add_client_watcher(bob.clone(), "space/s", Vec::new()).await;

        space
            .send_private_event(PrivateSpaceEvent {
                space_name: "space/s".into(),
                sender_user_id: 1,
                receiver_user_id: 2,
                payload: "\"psst\"".into(),
            })
            .await;

        assert!(drain(&mut alice_rx).is_empty());
        let frames = drain(&mut bob_rx);
        assert_eq!(frames.len(), 1);
    }
}
