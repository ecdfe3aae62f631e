//! Everything space-shaped: the user record with its field-mask merge, the
//! per-client filters, and the frames of the shared space stream.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The canonical record of one user inside a space. Mutations arrive as
/// field-mask merges, never as whole-record overwrites.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpaceUser {
    pub id: i32,
    pub uuid: String,
    pub name: String,
    pub role: String,
    pub tags: Vec<String>,
    pub availability_status: i32,
    pub chat_id: String,
}

/// An ordered list of dotted field paths, named after the wire fields they
/// select. Merging takes the masked fields from the update and leaves
/// everything else intact.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    pub paths: Vec<String>,
}

impl FieldMask {
    pub fn new<S: Into<String>>(paths: impl IntoIterator<Item = S>) -> Self {
        FieldMask {
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl SpaceUser {
    /// Applies `update` to `self`, restricted to the fields the mask names.
    /// Only the first segment of a dotted path selects a field. Returns the
    /// paths that named no known field so the caller can log them.
    pub fn merge_masked(&mut self, update: &SpaceUser, mask: &FieldMask) -> Vec<String> {
        let mut unknown = Vec::new();
        for path in &mask.paths {
            let field = path.split('.').next().unwrap_or(path.as_str());
            match field {
                "id" => self.id = update.id,
                "uuid" => self.uuid = update.uuid.clone(),
                "name" => self.name = update.name.clone(),
                "role" => self.role = update.role.clone(),
                "tags" => self.tags = update.tags.clone(),
                "availabilityStatus" => self.availability_status = update.availability_status,
                "chatID" => self.chat_id = update.chat_id.clone(),
                _ => unknown.push(path.clone()),
            }
        }
        unknown
    }
}

/// A named predicate a client installs on a space to see a subset of its
/// users. Names are unique per client and space; adds replace by name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceFilter {
    pub name: String,
    pub kind: SpaceFilterKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpaceFilterKind {
    Everybody,
    /// Admits users whose role equals the given one.
    ByRole(String),
    /// Admits users whose name contains the given needle.
    ByName(String),
}

impl SpaceFilter {
    pub fn admits(&self, user: &SpaceUser) -> bool {
        match &self.kind {
            SpaceFilterKind::Everybody => true,
            SpaceFilterKind::ByRole(role) => user.role == *role,
            SpaceFilterKind::ByName(needle) => user.name.contains(needle.as_str()),
        }
    }
}

/// Combined admission over a client's filter list: no filters means
/// everybody, otherwise any matching filter admits.
pub fn filters_admit(filters: &[SpaceFilter], user: &SpaceUser) -> bool {
    filters.is_empty() || filters.iter().any(|f| f.admits(user))
}

/// Parses the raw metadata blob the back sends. The blob must be a JSON
/// object; anything else is a protocol violation the caller drops.
pub fn parse_metadata(blob: &str) -> Result<HashMap<String, Value>, String> {
    match serde_json::from_str::<Value>(blob) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(other) => Err(format!("metadata must be a JSON object, got {other}")),
        Err(err) => Err(err.to_string()),
    }
}

/// A public announcement inside a space, fanned to every watcher.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicSpaceEvent {
    pub space_name: String,
    pub sender_user_id: i32,
    /// JSON blob the pusher relays without interpreting it.
    pub payload: String,
}

/// A targeted announcement inside a space, delivered only to the watcher
/// whose user id matches the receiver.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateSpaceEvent {
    pub space_name: String,
    pub sender_user_id: i32,
    pub receiver_user_id: i32,
    pub payload: String,
}

/// Frames the pusher writes to the shared per-back space stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SpaceWriteFrame {
    /// Announces that this pusher now watches the space.
    JoinSpace {
        space_name: String,
    },
    /// Announces that no local client watches the space any more.
    LeaveSpace {
        space_name: String,
    },
    AddSpaceUser {
        space_name: String,
        user: SpaceUser,
    },
    UpdateSpaceUser {
        space_name: String,
        user: SpaceUser,
        mask: FieldMask,
    },
    RemoveSpaceUser {
        space_name: String,
        user_id: i32,
    },
    UpdateSpaceMetadata {
        space_name: String,
        /// JSON object with the keys to merge-overwrite.
        metadata: String,
    },
    KickOffUser {
        space_name: String,
        user_id: i32,
    },
    PublicEvent(PublicSpaceEvent),
    PrivateEvent(PrivateSpaceEvent),
    Pong,
}

/// Frames the pusher reads from the shared per-back space stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SpaceReadFrame {
    AddSpaceUser {
        space_name: String,
        user: SpaceUser,
    },
    UpdateSpaceUser {
        space_name: String,
        user: SpaceUser,
        mask: FieldMask,
    },
    RemoveSpaceUser {
        space_name: String,
        user_id: i32,
    },
    UpdateSpaceMetadata {
        space_name: String,
        metadata: String,
    },
    Ping,
    KickOff {
        space_name: String,
        user_id: i32,
    },
    PublicEvent(PublicSpaceEvent),
    PrivateEvent(PrivateSpaceEvent),
}
