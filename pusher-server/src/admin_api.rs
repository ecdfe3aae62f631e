//! HTTP client for the admin service. Every call is an opaque awaitable for
//! the multiplexer; callers decide whether a failure degrades or surfaces.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use protocol::{ChatMemberData, MemberData};

#[derive(Debug, Error)]
pub enum AdminApiError {
    #[error("admin service request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("admin service returned status {status}")]
    Status { status: u16 },
}

/// The calls the multiplexer issues against the admin service.
#[async_trait]
pub trait AdminApi: Send + Sync {
    async fn report_player(
        &self,
        reported_uuid: &str,
        comment: &str,
        reporter_uuid: &str,
        room_url: &str,
    ) -> Result<(), AdminApiError>;

    async fn ban_user_by_uuid(
        &self,
        uuid: &str,
        room_url: &str,
        name: &str,
        message: &str,
    ) -> Result<(), AdminApiError>;

    async fn get_tags_list(&self, room_url: &str) -> Result<Vec<String>, AdminApiError>;

    async fn get_url_rooms_from_same_world(
        &self,
        room_url: &str,
    ) -> Result<Vec<String>, AdminApiError>;

    async fn search_members(
        &self,
        room_url: &str,
        query: &str,
    ) -> Result<(Vec<MemberData>, u32), AdminApiError>;

    async fn search_tags(&self, room_url: &str, query: &str)
    -> Result<Vec<String>, AdminApiError>;

    async fn get_member(&self, uuid: &str) -> Result<MemberData, AdminApiError>;

    async fn get_world_chat_members(
        &self,
        room_url: &str,
        search: &str,
    ) -> Result<(Vec<ChatMemberData>, u32), AdminApiError>;

    async fn update_chat_id(&self, uuid: &str, chat_id: &str) -> Result<(), AdminApiError>;

    async fn refresh_oauth_token(&self, token: &str) -> Result<String, AdminApiError>;
}

pub struct AdminHttpClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Deserialize)]
struct MemberSearchResponse {
    members: Vec<MemberData>,
    total: u32,
}

#[derive(Deserialize)]
struct ChatMemberSearchResponse {
    members: Vec<ChatMemberData>,
    total: u32,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
}

impl AdminHttpClient {
    pub fn new(base_url: &str, token: &str) -> Self {
        AdminHttpClient {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("HTTP client construction"),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn checked(response: reqwest::Response) -> Result<reqwest::Response, AdminApiError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else {
            Err(AdminApiError::Status {
                status: status.as_u16(),
            })
        }
    }
}

// Request bodies, kept as pure builders so the wire shapes stay testable.

fn report_body(
    reported_uuid: &str,
    comment: &str,
    reporter_uuid: &str,
    room_url: &str,
) -> serde_json::Value {
    serde_json::json!({
        "reportedUserUuid": reported_uuid,
        "reportWorldComment": comment,
        "reporterUserUuid": reporter_uuid,
        "roomUrl": room_url,
    })
}

fn ban_body(uuid: &str, room_url: &str, name: &str, message: &str) -> serde_json::Value {
    serde_json::json!({
        "uuidToBan": uuid,
        "roomUrl": room_url,
        "name": name,
        "message": message,
    })
}

fn chat_id_body(chat_id: &str) -> serde_json::Value {
    serde_json::json!({ "chatId": chat_id })
}

fn token_body(token: &str) -> serde_json::Value {
    serde_json::json!({ "token": token })
}

#[async_trait]
impl AdminApi for AdminHttpClient {
    async fn report_player(
        &self,
        reported_uuid: &str,
        comment: &str,
        reporter_uuid: &str,
        room_url: &str,
    ) -> Result<(), AdminApiError> {
        let response = self
            .http
            .post(self.url("/api/report"))
            .bearer_auth(&self.token)
            .json(&report_body(reported_uuid, comment, reporter_uuid, room_url))
            .send()
            .await?;
        Self::checked(response).map(|_| ())
    }

    async fn ban_user_by_uuid(
        &self,
        uuid: &str,
        room_url: &str,
        name: &str,
        message: &str,
    ) -> Result<(), AdminApiError> {
        let response = self
            .http
            .post(self.url("/api/ban"))
            .bearer_auth(&self.token)
            .json(&ban_body(uuid, room_url, name, message))
            .send()
            .await?;
        Self::checked(response).map(|_| ())
    }

    async fn get_tags_list(&self, room_url: &str) -> Result<Vec<String>, AdminApiError> {
        let response = self
            .http
            .get(self.url("/api/room/tags"))
            .bearer_auth(&self.token)
            .query(&[("roomUrl", room_url)])
            .send()
            .await?;
        Ok(Self::checked(response)?.json().await?)
    }

    async fn get_url_rooms_from_same_world(
        &self,
        room_url: &str,
    ) -> Result<Vec<String>, AdminApiError> {
        let response = self
            .http
            .get(self.url("/api/room/sameWorld"))
            .bearer_auth(&self.token)
            .query(&[("roomUrl", room_url)])
            .send()
            .await?;
        Ok(Self::checked(response)?.json().await?)
    }

    async fn search_members(
        &self,
        room_url: &str,
        query: &str,
    ) -> Result<(Vec<MemberData>, u32), AdminApiError> {
        let response = self
            .http
            .get(self.url("/api/members/search"))
            .bearer_auth(&self.token)
            .query(&[("roomUrl", room_url), ("searchText", query)])
            .send()
            .await?;
        let parsed: MemberSearchResponse = Self::checked(response)?.json().await?;
        Ok((parsed.members, parsed.total))
    }

    async fn search_tags(
        &self,
        room_url: &str,
        query: &str,
    ) -> Result<Vec<String>, AdminApiError> {
        let response = self
            .http
            .get(self.url("/api/tags/search"))
            .bearer_auth(&self.token)
            .query(&[("roomUrl", room_url), ("searchText", query)])
            .send()
            .await?;
        Ok(Self::checked(response)?.json().await?)
    }

    async fn get_member(&self, uuid: &str) -> Result<MemberData, AdminApiError> {
        let response = self
            .http
            .get(self.url(&format!("/api/members/{uuid}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Ok(Self::checked(response)?.json().await?)
    }

    async fn get_world_chat_members(
        &self,
        room_url: &str,
        search: &str,
    ) -> Result<(Vec<ChatMemberData>, u32), AdminApiError> {
        let response = self
            .http
            .get(self.url("/api/world/chatMembers"))
            .bearer_auth(&self.token)
            .query(&[("roomUrl", room_url), ("searchText", search)])
            .send()
            .await?;
        let parsed: ChatMemberSearchResponse = Self::checked(response)?.json().await?;
        Ok((parsed.members, parsed.total))
    }

    async fn update_chat_id(&self, uuid: &str, chat_id: &str) -> Result<(), AdminApiError> {
        let response = self
            .http
            .put(self.url(&format!("/api/members/{uuid}/chatId")))
            .bearer_auth(&self.token)
            .json(&chat_id_body(chat_id))
            .send()
            .await?;
        Self::checked(response).map(|_| ())
    }

    async fn refresh_oauth_token(&self, token: &str) -> Result<String, AdminApiError> {
        let response = self
            .http
            .post(self.url("/api/oauth/refresh"))
            .bearer_auth(&self.token)
            .json(&token_body(token))
            .send()
            .await?;
        let parsed: TokenResponse = Self::checked(response)?.json().await?;
        Ok(parsed.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AdminHttpClient {
        AdminHttpClient::new("http://admin.example/", "secret")
    }

    #[test]
    fn urls_join_without_a_double_slash() {
        let client = client();
        assert_eq!(client.url("/api/report"), "http://admin.example/api/report");
        assert_eq!(
            client.url(&format!("/api/members/{}/chatId", "u-1")),
            "http://admin.example/api/members/u-1/chatId"
        );
    }

    #[test]
    fn report_body_carries_every_party() {
        let body = report_body("u-bad", "spamming", "u-witness", "world/room");
        assert_eq!(body["reportedUserUuid"], "u-bad");
        assert_eq!(body["reportWorldComment"], "spamming");
        assert_eq!(body["reporterUserUuid"], "u-witness");
        assert_eq!(body["roomUrl"], "world/room");
    }

    #[test]
    fn ban_body_names_the_target() {
        let body = ban_body("u-bad", "world/room", "Mallory", "bye");
        assert_eq!(body["uuidToBan"], "u-bad");
        assert_eq!(body["roomUrl"], "world/room");
        assert_eq!(body["name"], "Mallory");
        assert_eq!(body["message"], "bye");
    }

    #[test]
    fn single_field_bodies_use_the_expected_keys() {
        assert_eq!(chat_id_body("alice@chat")["chatId"], "alice@chat");
        assert_eq!(token_body("tok-1")["token"], "tok-1");
    }

    #[test]
    fn member_search_responses_deserialize() {
        let parsed: MemberSearchResponse = serde_json::from_str(
            r#"{
                "members": [
                    {"uuid": "u-1", "name": "Alice", "email": "alice@example.com"},
                    {"uuid": "u-2", "name": "Bob", "email": null}
                ],
                "total": 2
            }"#,
        )
        .unwrap();
        assert_eq!(parsed.total, 2);
        assert_eq!(parsed.members[0].uuid, "u-1");
        assert_eq!(parsed.members[1].email, None);
    }

    #[test]
    fn chat_member_search_responses_deserialize() {
        let parsed: ChatMemberSearchResponse = serde_json::from_str(
            r#"{
                "members": [{"uuid": "u-1", "name": "Alice", "chat_id": "alice@chat"}],
                "total": 1
            }"#,
        )
        .unwrap();
        assert_eq!(parsed.total, 1);
        assert_eq!(parsed.members[0].chat_id, "alice@chat");
    }

    #[test]
    fn token_responses_deserialize() {
        let parsed: TokenResponse = serde_json::from_str(r#"{"token": "tok-2"}"#).unwrap();
        assert_eq!(parsed.token, "tok-2");
    }
}
