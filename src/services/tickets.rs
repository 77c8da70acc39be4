//! Ticket sessions: one private channel per customer, carrying the working
//! nickname/email/order binding until the purchase is committed to the
//! ledger. Sessions are typed in-memory records keyed by channel id; nothing
//! here is parsed back out of channel metadata strings.

use crate::{
    clients::ChatClient,
    errors::ServiceError,
    guards::GuardService,
    services::ledger::OrderLedger,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

static EMAIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("valid email regex"));

pub fn looks_like_email(text: &str) -> bool {
    EMAIL_RE.is_match(text)
}

/// Working state of one open ticket.
#[derive(Debug, Clone)]
pub struct TicketSession {
    pub buyer_id: String,
    pub nick: String,
    pub email: String,
    pub order_id: Option<String>,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TicketConfig {
    pub cooldown: Duration,
    pub inactivity_close: Duration,
    pub delete_delay: Duration,
}

struct Inner {
    ledger: Arc<OrderLedger>,
    guards: Arc<GuardService>,
    chat: Arc<dyn ChatClient>,
    config: TicketConfig,
    /// channel id -> session
    sessions: DashMap<String, TicketSession>,
    /// buyer id -> channel id
    open_tickets: DashMap<String, String>,
    cooldowns: DashMap<String, Instant>,
    inactivity_timers: DashMap<String, JoinHandle<()>>,
}

#[derive(Clone)]
pub struct TicketService {
    inner: Arc<Inner>,
}

fn safe_channel_name(username: &str, user_id: &str) -> String {
    let mut safe = String::new();
    let mut last_dash = true;
    for ch in username.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            safe.push(ch);
            last_dash = false;
        } else if !last_dash {
            safe.push('-');
            last_dash = true;
        }
    }
    let safe = safe.trim_matches('-');
    let tail: String = user_id
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if safe.is_empty() {
        format!("ticket-{tail}")
    } else {
        format!("ticket-{safe}-{tail}")
    }
}

impl TicketService {
    pub fn new(
        ledger: Arc<OrderLedger>,
        guards: Arc<GuardService>,
        chat: Arc<dyn ChatClient>,
        config: TicketConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger,
                guards,
                chat,
                config,
                sessions: DashMap::new(),
                open_tickets: DashMap::new(),
                cooldowns: DashMap::new(),
                inactivity_timers: DashMap::new(),
            }),
        }
    }

    /// Opens a ticket channel for a customer. Cooldown, the existing-ticket
    /// check and the creation lock together keep two near-simultaneous
    /// clicks from producing two channels.
    #[instrument(skip(self))]
    pub async fn open_ticket(
        &self,
        user_id: &str,
        username: &str,
    ) -> Result<String, ServiceError> {
        let inner = &self.inner;

        if let Some(existing) = inner.open_tickets.get(user_id) {
            return Err(ServiceError::Conflict(format!(
                "You already have an open ticket: <#{}>",
                existing.value()
            )));
        }

        if let Some(last) = inner.cooldowns.get(user_id) {
            let elapsed = last.elapsed();
            if elapsed < inner.config.cooldown {
                let wait = (inner.config.cooldown - elapsed).as_secs().max(1);
                return Err(ServiceError::InvalidOperation(format!(
                    "Wait {wait}s before opening another ticket."
                )));
            }
        }

        let _lease = inner.guards.lock_ticket_creation(user_id).ok_or_else(|| {
            ServiceError::InvalidOperation(
                "Your ticket is being created, try again in a moment.".to_string(),
            )
        })?;

        let profile = inner.ledger.get_profile(user_id).await?;
        let (nick, email) = profile
            .map(|p| (p.nick, p.email))
            .unwrap_or_default();

        let channel_id = inner
            .chat
            .create_ticket_channel(&safe_channel_name(username, user_id), user_id)
            .await?;

        inner.sessions.insert(
            channel_id.clone(),
            TicketSession {
                buyer_id: user_id.to_string(),
                nick: nick.clone(),
                email: email.clone(),
                order_id: None,
                opened_at: Utc::now(),
            },
        );
        inner.open_tickets.insert(user_id.to_string(), channel_id.clone());
        inner.cooldowns.insert(user_id.to_string(), Instant::now());

        let intro = format!(
            "🪙 **Coin purchase**\n\
             **Step 1:** send your **nick** (message) or use /setnick\n\
             **Step 2:** send your **email** (message) or use /setemail\n\
             **Step 3:** pick a pack to generate the **payment link**\n\n\
             📌 Saved nick: **{}**\n\
             📌 Saved email: **{}**",
            if nick.is_empty() { "—" } else { &nick },
            if email.is_empty() { "—" } else { &email },
        );
        if let Err(e) = inner.chat.send_message(&channel_id, &intro).await {
            warn!(error = %e, channel_id = %channel_id, "failed to post ticket intro");
        }

        self.reset_inactivity_timer(&channel_id);
        info!(user_id, channel_id = %channel_id, "ticket opened");
        Ok(channel_id)
    }

    /// Closes a ticket: the buyer or support may close; the channel is
    /// deleted after a short delay so the closing message is readable.
    #[instrument(skip(self))]
    pub async fn close_ticket(
        &self,
        channel_id: &str,
        requested_by: &str,
        is_support: bool,
    ) -> Result<(), ServiceError> {
        let inner = &self.inner;

        let buyer_id = inner
            .sessions
            .get(channel_id)
            .map(|s| s.buyer_id.clone())
            .ok_or_else(|| {
                ServiceError::NotFound("This channel is not an open ticket.".to_string())
            })?;

        if requested_by != buyer_id && !is_support {
            return Err(ServiceError::Unauthorized(
                "You cannot close this ticket.".to_string(),
            ));
        }

        let _ = inner.chat.send_message(channel_id, "🔒 Ticket closed.").await;
        self.schedule_delete(channel_id, inner.config.delete_delay);
        Ok(())
    }

    /// Deletes a channel after a delay and cleans up every trace of its
    /// session.
    pub fn schedule_delete(&self, channel_id: &str, delay: Duration) {
        let inner = Arc::clone(&self.inner);
        let channel_id = channel_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = inner.chat.delete_channel(&channel_id).await {
                warn!(error = %e, channel_id = %channel_id, "failed to delete ticket channel");
            }
            cleanup_channel(&inner, &channel_id);
        });
    }

    /// Saves a delivery nickname, updating both the durable profile and the
    /// live session when the caller owns it.
    #[instrument(skip(self))]
    pub async fn set_nick(
        &self,
        user_id: &str,
        nick: &str,
        channel_id: Option<&str>,
    ) -> Result<String, ServiceError> {
        let nick = nick.trim();
        if nick.len() < 2 {
            return Err(ServiceError::ValidationError(
                "Nick must be at least 2 characters.".to_string(),
            ));
        }

        self.inner.ledger.upsert_profile(user_id, Some(nick), None).await?;
        if let Some(channel_id) = channel_id {
            if let Some(mut session) = self.inner.sessions.get_mut(channel_id) {
                if session.buyer_id == user_id {
                    session.nick = nick.to_string();
                }
            }
        }
        Ok(format!("✅ Nick updated to **{nick}**."))
    }

    /// Saves a contact email (lower-cased), same dual-write as `set_nick`.
    #[instrument(skip(self))]
    pub async fn set_email(
        &self,
        user_id: &str,
        email: &str,
        channel_id: Option<&str>,
    ) -> Result<String, ServiceError> {
        let email = email.trim().to_lowercase();
        if !looks_like_email(&email) {
            return Err(ServiceError::ValidationError(
                "That does not look like a valid email.".to_string(),
            ));
        }

        self.inner
            .ledger
            .upsert_profile(user_id, None, Some(&email))
            .await?;
        if let Some(channel_id) = channel_id {
            if let Some(mut session) = self.inner.sessions.get_mut(channel_id) {
                if session.buyer_id == user_id {
                    session.email = email.clone();
                }
            }
        }
        Ok(format!("✅ Email updated to **{email}**."))
    }

    /// Free-text capture inside a ticket: the buyer's first message becomes
    /// the nick, the next email-looking message becomes the email. Messages
    /// from anyone else, or once both fields are set, are ignored.
    #[instrument(skip(self, text))]
    pub async fn capture_message(
        &self,
        channel_id: &str,
        author_id: &str,
        text: &str,
    ) -> Result<(), ServiceError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let (buyer_id, nick, email) = match self.inner.sessions.get(channel_id) {
            Some(s) => (s.buyer_id.clone(), s.nick.clone(), s.email.clone()),
            None => return Ok(()),
        };
        if author_id != buyer_id {
            return Ok(());
        }

        self.reset_inactivity_timer(channel_id);

        if nick.is_empty() {
            self.set_nick(author_id, text, Some(channel_id)).await?;
            let _ = self
                .inner
                .chat
                .send_message(
                    channel_id,
                    &format!("✅ Nick saved: **{text}**\nNow send your **email** (or use /setemail)."),
                )
                .await;
            return Ok(());
        }

        if email.is_empty() && looks_like_email(text) {
            let lowered = text.to_lowercase();
            self.set_email(author_id, &lowered, Some(channel_id)).await?;
            let _ = self
                .inner
                .chat
                .send_message(
                    channel_id,
                    &format!("✅ Email saved: **{lowered}**\nNow pick a pack to generate the link."),
                )
                .await;
        }

        Ok(())
    }

    /// Snapshot of a channel's session, if one is open.
    pub fn session(&self, channel_id: &str) -> Option<TicketSession> {
        self.inner.sessions.get(channel_id).map(|s| s.clone())
    }

    /// Binds the channel's session to a freshly created order.
    pub fn bind_order(&self, channel_id: &str, order_id: &str) {
        if let Some(mut session) = self.inner.sessions.get_mut(channel_id) {
            session.order_id = Some(order_id.to_string());
        }
    }

    /// Restarts the idle countdown for a channel. Fires a warning message and
    /// deletes the channel when it expires.
    pub fn reset_inactivity_timer(&self, channel_id: &str) {
        let inner = Arc::clone(&self.inner);
        let key = channel_id.to_string();
        let handle = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            let channel_id = key.clone();
            async move {
                tokio::time::sleep(inner.config.inactivity_close).await;
                if !inner.sessions.contains_key(&channel_id) {
                    return;
                }
                let _ = inner
                    .chat
                    .send_message(
                        &channel_id,
                        "⏳ No activity in this ticket; closing it automatically.",
                    )
                    .await;
                if let Err(e) = inner.chat.delete_channel(&channel_id).await {
                    warn!(error = %e, channel_id = %channel_id, "inactivity close failed");
                }
                cleanup_channel(&inner, &channel_id);
            }
        });

        if let Some(old) = inner.inactivity_timers.insert(key, handle) {
            old.abort();
        }
    }

    /// Reacts to the chat platform reporting a channel deletion (by a
    /// moderator, for example): drop all state tied to it.
    pub fn handle_channel_deleted(&self, channel_id: &str) {
        cleanup_channel(&self.inner, channel_id);
        info!(channel_id, "cleaned up after channel deletion");
    }
}

fn cleanup_channel(inner: &Arc<Inner>, channel_id: &str) {
    inner.sessions.remove(channel_id);
    inner
        .open_tickets
        .retain(|_, open_channel| open_channel != channel_id);
    if let Some((_, timer)) = inner.inactivity_timers.remove(channel_id) {
        timer.abort();
    }
    inner.guards.forget_channel(channel_id);
}
