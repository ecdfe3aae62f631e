//! Frames exchanged on the room-scoped back-end streams and the geometry
//! types the zone fan-out works with.

use serde::{Deserialize, Serialize};

/// A point in room coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

/// The rectangle of the room a client currently sees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Viewport {
    /// Containment test used by the zone fan-out. Edges count as inside.
    pub fn contains(&self, position: Position) -> bool {
        position.x >= self.left
            && position.x <= self.right
            && position.y >= self.top
            && position.y <= self.bottom
    }
}

/// Mutable presentation details of a player, diffed by the pusher on
/// `setPlayerDetails` to decide what to broadcast to spaces.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerDetails {
    /// 0 means "not reported"; the pusher never broadcasts a zero status.
    pub availability_status: i32,
    pub chat_id: String,
    pub outline_color: Option<u32>,
}

/// An opaque payload the pusher relays without interpreting it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionMessage {
    pub payload: Vec<u8>,
}

/// The join announcement, first frame on every room stream.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinRoomMessage {
    pub room_url: String,
    pub user_uuid: String,
    pub name: String,
    pub ip_address: String,
    pub textures: Vec<String>,
    pub tags: Vec<String>,
}

/// A movement report from a client, carrying the viewport it now sees.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct UserMovesMessage {
    pub position: Position,
    pub viewport: Viewport,
}

/// Client-scoped frames written to the back (one stream per client and room).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RoomInFrame {
    JoinRoom(JoinRoomMessage),
    UpdateViewport(Viewport),
    UserMoves(UserMovesMessage),
    SetPlayerDetails(PlayerDetails),
    /// Arbitrary client action forwarded verbatim.
    Action(ActionMessage),
    /// Map-edit command, only forwarded for clients the back granted edit rights.
    EditMapAction(ActionMessage),
}

/// The back's answer to a successful room join.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomJoinedMessage {
    /// The user id the back assigned to this client.
    pub current_user_id: i32,
    /// Tags the back resolved for the client.
    pub tags: Vec<String>,
    /// Whether this client may edit the map.
    pub can_edit: bool,
}

/// Client-scoped frames read from the back. All of them are re-emitted to the
/// owning client unchanged; `RoomJoined` and `RefreshRoom` are additionally
/// snooped by the pusher.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RoomOutFrame {
    RoomJoined(RoomJoinedMessage),
    RefreshRoom { version: u64 },
    ErrorMessage { message: String },
    Action(ActionMessage),
}

/// A user as mirrored by the zone index of a room.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneUser {
    pub user_id: i32,
    pub uuid: String,
    pub name: String,
    pub textures: Vec<String>,
    pub position: Position,
    pub availability_status: i32,
}

/// A walking group as mirrored by the zone index of a room.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDescriptor {
    pub group_id: i32,
    pub position: Position,
    pub group_size: u32,
    pub locked: bool,
}

/// First frame on a zone-watcher stream, telling the back which room to feed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneWatchRequest {
    pub room_url: String,
}

/// Room-scoped frames read from the back on the zone-watcher stream. The
/// pusher mirrors positions and fans every event out to the clients whose
/// viewport admits the entity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ZoneFrame {
    UserEntered(ZoneUser),
    UserMoved { user_id: i32, position: Position },
    UserLeft { user_id: i32 },
    GroupUpdated(GroupDescriptor),
    GroupDeleted { group_id: i32 },
    Emote { user_id: i32, emote: String },
    PlayerDetailsUpdated { user_id: i32, details: PlayerDetails },
    Error { message: String },
}

/// Payload of the `sendAdminMessage` unary call: a moderation message for one user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminMessage {
    pub recipient_uuid: String,
    pub message: String,
    pub kind: String,
}

/// Payload of the `ban` unary call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanMessage {
    pub recipient_uuid: String,
    pub message: String,
}

/// Payload of the `sendAdminMessageToRoom` unary call: a broadcast for every
/// client of one room.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomBroadcast {
    pub kind: String,
    pub content: String,
}

/// The unary calls a pusher can issue against a back, framed like every other
/// stream so the transport stays uniform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AdminRpcFrame {
    SendAdminMessage(AdminMessage),
    Ban(BanMessage),
    SendAdminMessageToRoom {
        room_url: String,
        broadcast: RoomBroadcast,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viewport_contains_is_edge_inclusive() {
        let vp = Viewport {
            left: 0,
            top: 0,
            right: 10,
            bottom: 10,
        };
        assert!(vp.contains(Position { x: 0, y: 0 }));
        assert!(vp.contains(Position { x: 10, y: 10 }));
        assert!(!vp.contains(Position { x: 11, y: 10 }));
        assert!(!vp.contains(Position { x: -1, y: 5 }));
    }
}
