use crate::{config::AppConfig, errors::ServiceError};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, instrument};

const DISCORD_API: &str = "https://discord.com/api/v10";

// Discord permission bits used for ticket channel overwrites.
const VIEW_CHANNEL: u64 = 1 << 10;
const SEND_MESSAGES: u64 = 1 << 11;
const EMBED_LINKS: u64 = 1 << 14;
const ATTACH_FILES: u64 = 1 << 15;
const READ_MESSAGE_HISTORY: u64 = 1 << 16;

const BUYER_ALLOW: u64 =
    VIEW_CHANNEL | SEND_MESSAGES | READ_MESSAGE_HISTORY | ATTACH_FILES | EMBED_LINKS;
const SUPPORT_ALLOW: u64 = VIEW_CHANNEL | SEND_MESSAGES | READ_MESSAGE_HISTORY;

/// The slice of the chat platform the shop needs: given a channel handle it
/// can create one, send text into it, and eventually delete it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Creates a private ticket channel visible to the buyer (and support),
    /// returning the new channel id.
    async fn create_ticket_channel(
        &self,
        name: &str,
        buyer_id: &str,
    ) -> Result<String, ServiceError>;

    async fn send_message(&self, channel_id: &str, text: &str) -> Result<(), ServiceError>;

    async fn delete_channel(&self, channel_id: &str) -> Result<(), ServiceError>;
}

/// Thin Discord REST client; only the three calls above, nothing
/// gateway-related.
pub struct DiscordRestClient {
    http: reqwest::Client,
    bot_token: String,
    guild_id: String,
    category_id: String,
    support_role_id: Option<String>,
}

impl DiscordRestClient {
    pub fn new(cfg: &AppConfig) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(cfg.http_timeout())
            .build()
            .map_err(|e| ServiceError::InternalError(format!("http client: {e}")))?;

        Ok(Self {
            http,
            bot_token: cfg.discord_bot_token.clone(),
            guild_id: cfg.guild_id.clone(),
            category_id: cfg.ticket_category_id.clone(),
            support_role_id: cfg.support_role_id.clone(),
        })
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    async fn check(response: reqwest::Response, what: &str) -> Result<Value, ServiceError> {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(ServiceError::ExternalServiceError(format!(
                "{what} failed ({status}): {body}"
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl ChatClient for DiscordRestClient {
    #[instrument(skip(self))]
    async fn create_ticket_channel(
        &self,
        name: &str,
        buyer_id: &str,
    ) -> Result<String, ServiceError> {
        // @everyone overwrite uses the guild id; deny viewing for everyone,
        // then allow the buyer (and support role, when configured) back in.
        let mut overwrites = vec![
            json!({ "id": self.guild_id, "type": 0, "deny": VIEW_CHANNEL.to_string() }),
            json!({ "id": buyer_id, "type": 1, "allow": BUYER_ALLOW.to_string() }),
        ];
        if let Some(role) = &self.support_role_id {
            overwrites.push(json!({ "id": role, "type": 0, "allow": SUPPORT_ALLOW.to_string() }));
        }

        let body = json!({
            "name": name,
            "type": 0,
            "parent_id": self.category_id,
            "permission_overwrites": overwrites,
        });

        let response = self
            .http
            .post(format!("{DISCORD_API}/guilds/{}/channels", self.guild_id))
            .header("Authorization", self.auth())
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("create channel: {e}")))?;

        let payload = Self::check(response, "channel creation").await?;
        let channel_id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::ExternalServiceError("channel creation returned no id".to_string())
            })?
            .to_string();

        debug!(channel_id = %channel_id, "ticket channel created");
        Ok(channel_id)
    }

    #[instrument(skip(self, text))]
    async fn send_message(&self, channel_id: &str, text: &str) -> Result<(), ServiceError> {
        let response = self
            .http
            .post(format!("{DISCORD_API}/channels/{channel_id}/messages"))
            .header("Authorization", self.auth())
            .json(&json!({ "content": text }))
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("send message: {e}")))?;

        Self::check(response, "message send").await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn delete_channel(&self, channel_id: &str) -> Result<(), ServiceError> {
        let response = self
            .http
            .delete(format!("{DISCORD_API}/channels/{channel_id}"))
            .header("Authorization", self.auth())
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("delete channel: {e}")))?;

        Self::check(response, "channel deletion").await.map(|_| ())
    }
}
