//! The capability rooms call back on to deliver zone events to one client.

use protocol::{GroupDescriptor, PlayerDetails, Position, ZoneUser};

use crate::client::ClientSession;

/// Implemented by the multiplexer; every invocation targets a single client
/// and is delivered through that client's batch emitter. Group moves have no
/// wire tag of their own, so `on_group_moves` is encoded as a group update.
pub trait ZoneEventListener: Send + Sync {
    fn on_user_enters(&self, client: &ClientSession, user: &ZoneUser);
    fn on_user_moves(&self, client: &ClientSession, user_id: i32, position: Position);
    fn on_user_leaves(&self, client: &ClientSession, user_id: i32);
    fn on_group_enters(&self, client: &ClientSession, group: &GroupDescriptor);
    fn on_group_moves(&self, client: &ClientSession, group: &GroupDescriptor);
    fn on_group_leaves(&self, client: &ClientSession, group_id: i32);
    fn on_emote(&self, client: &ClientSession, user_id: i32, emote: &str);
    fn on_player_details_updated(
        &self,
        client: &ClientSession,
        user_id: i32,
        details: &PlayerDetails,
    );
    fn on_error(&self, client: &ClientSession, message: &str);
}
