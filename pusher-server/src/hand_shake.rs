//! The front handshake: the join query of the upgrade request is turned into
//! the immutable identity of the session. Token validation happens upstream;
//! the pusher treats the token as opaque.

use serde::Deserialize;

use crate::client::ClientIdentity;

/// Query parameters of the front WebSocket upgrade.
#[derive(Debug, Deserialize)]
pub struct JoinQuery {
    #[serde(rename = "roomId")]
    pub room_id: String,
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub token: String,
    /// Comma separated texture ids.
    #[serde(default)]
    pub textures: String,
    /// Comma separated tags, "admin" included.
    #[serde(default)]
    pub tags: String,
    #[serde(default, rename = "chatID")]
    pub chat_id: String,
}

/// Validates the query and builds the session identity.
pub fn identity_from_query(
    query: JoinQuery,
    ip_address: String,
) -> Result<ClientIdentity, &'static str> {
    if query.room_id.is_empty() {
        return Err("Missing room id in join request.");
    }
    if query.name.is_empty() {
        return Err("Missing player name in join request.");
    }
    if query.uuid.is_empty() {
        return Err("Missing user uuid in join request.");
    }
    Ok(ClientIdentity {
        room_id: query.room_id,
        uuid: query.uuid,
        name: query.name,
        ip_address,
        tags: split_list(&query.tags),
        textures: split_list(&query.textures),
        chat_id: query.chat_id,
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
