//! The northbound contract: frames exchanged with front clients over the
//! binary WebSocket, plus the JSON text envelopes of the admin protocol.

use serde::{Deserialize, Serialize};

use crate::room::{
    ActionMessage, GroupDescriptor, PlayerDetails, Position, RoomOutFrame, UserMovesMessage,
    Viewport, ZoneUser,
};
use crate::space::{
    FieldMask, PrivateSpaceEvent, PublicSpaceEvent, SpaceFilter, SpaceUser,
};

/// A global broadcast request, optionally fanned to every room of the world.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayGlobalMessage {
    pub kind: String,
    pub content: String,
    pub broadcast_to_world: bool,
}

/// Queries a client can issue; every query is answered exactly once with an
/// [`AnswerPayload`] keyed by the query id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    RoomTags,
    RoomsFromSameWorld,
    SearchMembers { query: String },
    SearchTags { query: String },
    GetMember { uuid: String },
    ChatMembers { search: String },
    EmbeddableWebsite { url: String },
    OauthRefreshToken { token: String },
}

/// A member record as returned by the admin service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberData {
    pub uuid: String,
    pub name: String,
    pub email: Option<String>,
}

/// A chat member record as returned by the admin service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMemberData {
    pub uuid: String,
    pub name: String,
    pub chat_id: String,
}

/// Verdict of the embeddable-URL probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddableState {
    Embeddable,
    NotEmbeddable,
    Unreachable,
}

/// The answer to a [`QueryKind`]. Failures of the underlying service call
/// come back as the `Error` variant instead of crashing the session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerPayload {
    Error {
        message: String,
    },
    Tags {
        tags: Vec<String>,
    },
    Rooms {
        room_urls: Vec<String>,
    },
    Members {
        members: Vec<MemberData>,
        total: u32,
    },
    Member {
        member: MemberData,
    },
    ChatMembers {
        members: Vec<ChatMemberData>,
        total: u32,
    },
    EmbeddableWebsite {
        url: String,
        state: EmbeddableState,
        message: Option<String>,
    },
    OauthRefreshToken {
        token: String,
    },
}

/// Everything a front client can send to the pusher after the handshake.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    Viewport(Viewport),
    UserMoves(UserMovesMessage),
    SetPlayerDetails(PlayerDetails),
    /// Opaque action relayed to the client's room stream.
    ForwardAction(ActionMessage),
    /// Map edit, only relayed when the back granted edit rights.
    EditMapAction(ActionMessage),
    JoinSpace {
        space_name: String,
        local_name: String,
    },
    LeaveSpace {
        space_name: String,
    },
    UpdateSpaceMetadata {
        space_name: String,
        metadata: String,
    },
    AddSpaceFilter {
        space_name: String,
        filter: SpaceFilter,
    },
    UpdateSpaceFilter {
        space_name: String,
        filter: SpaceFilter,
    },
    RemoveSpaceFilter {
        space_name: String,
        filter_name: String,
    },
    UpdateSpaceUser {
        space_name: String,
        user: SpaceUser,
        mask: FieldMask,
    },
    PublicEvent {
        space_name: String,
        payload: String,
    },
    PrivateEvent {
        space_name: String,
        receiver_user_id: i32,
        payload: String,
    },
    KickOffUser {
        space_name: String,
        user_id: i32,
    },
    PlayGlobal(PlayGlobalMessage),
    BanUser {
        uuid: String,
        name: String,
        message: String,
    },
    ReportPlayer {
        reported_uuid: String,
        comment: String,
    },
    Query {
        id: u32,
        kind: QueryKind,
    },
}

/// One entry of a coalesced zone batch. Group moves have no tag of their own
/// and travel as `GroupUpdate`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum BatchSub {
    UserJoined(ZoneUser),
    UserMoved { user_id: i32, position: Position },
    UserLeft { user_id: i32 },
    GroupUpdate(GroupDescriptor),
    GroupDelete { group_id: i32 },
    Emote { user_id: i32, emote: String },
    PlayerDetailsUpdated { user_id: i32, details: PlayerDetails },
    Error { message: String },
}

/// Everything the pusher can send to a front client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Coalesced zone events, bounded by the batch settings.
    Batch(Vec<BatchSub>),
    /// A room back-end frame re-emitted unchanged.
    Room(RoomOutFrame),
    SpaceUserAdded {
        space_name: String,
        user: SpaceUser,
    },
    SpaceUserUpdated {
        space_name: String,
        user: SpaceUser,
        mask: FieldMask,
    },
    SpaceUserRemoved {
        space_name: String,
        user_id: i32,
    },
    SpaceMetadataUpdated {
        space_name: String,
        metadata: String,
    },
    PublicSpaceEvent(PublicSpaceEvent),
    PrivateSpaceEvent(PrivateSpaceEvent),
    Answer {
        id: u32,
        payload: AnswerPayload,
    },
}

/// Commands an administrative client sends over the JSON text protocol.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AdminCommand {
    /// Subscribe to member join/leave events of the listed rooms.
    Listen { room_ids: Vec<String> },
    Ban {
        uuid: String,
        name: String,
        room_id: String,
        message: String,
    },
    UserMessage {
        uuid: String,
        room_id: String,
        message: String,
        kind: String,
    },
}

/// A member snapshot carried by the admin envelopes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminMemberData {
    pub uuid: String,
    pub name: String,
    pub ip_address: String,
    pub room_id: String,
}

/// Envelopes the pusher sends to administrative clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum AdminEnvelope {
    MemberJoin(AdminMemberData),
    MemberLeave { uuid: String, room_id: String },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_envelopes_use_the_type_data_shape() {
        let envelope = AdminEnvelope::MemberLeave {
            uuid: "u-1".into(),
            room_id: "room/x".into(),
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "MemberLeave");
        assert_eq!(json["data"]["uuid"], "u-1");

        let back: AdminEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn admin_commands_round_trip_through_json() {
        let cmd = AdminCommand::Listen {
            room_ids: vec!["room/a".into(), "room/b".into()],
        };
        let text = serde_json::to_string(&cmd).unwrap();
        let back: AdminCommand = serde_json::from_str(&text).unwrap();
        assert_eq!(back, cmd);
    }
}
