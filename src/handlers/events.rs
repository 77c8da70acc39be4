//! Customer interaction intake.
//!
//! The gateway process that owns the chat connection forwards decoded user
//! interactions here as JSON events. Every event gets exactly one
//! acknowledgement: the real outcome when the work finishes in time, or a
//! "still working" note when it does not. The work itself runs in a spawned
//! task, so a slow collaborator never leaves an interaction unanswered and
//! never cancels the underlying operation.

use crate::{errors::ServiceError, AppState};
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tracing::{error, instrument, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserEvent {
    OpenTicket {
        event_id: String,
        user_id: String,
        username: String,
    },
    CloseTicket {
        event_id: String,
        channel_id: String,
        user_id: String,
        #[serde(default)]
        is_support: bool,
    },
    SelectPack {
        event_id: String,
        channel_id: String,
        user_id: String,
        pack_id: String,
    },
    SetNick {
        event_id: String,
        user_id: String,
        nick: String,
        #[serde(default)]
        channel_id: Option<String>,
    },
    SetEmail {
        event_id: String,
        user_id: String,
        email: String,
        #[serde(default)]
        channel_id: Option<String>,
    },
    Message {
        event_id: String,
        channel_id: String,
        author_id: String,
        content: String,
    },
    ChannelDeleted {
        event_id: String,
        channel_id: String,
    },
}

impl UserEvent {
    pub fn event_id(&self) -> &str {
        match self {
            UserEvent::OpenTicket { event_id, .. }
            | UserEvent::CloseTicket { event_id, .. }
            | UserEvent::SelectPack { event_id, .. }
            | UserEvent::SetNick { event_id, .. }
            | UserEvent::SetEmail { event_id, .. }
            | UserEvent::Message { event_id, .. }
            | UserEvent::ChannelDeleted { event_id, .. } => event_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            UserEvent::OpenTicket { .. } => "open_ticket",
            UserEvent::CloseTicket { .. } => "close_ticket",
            UserEvent::SelectPack { .. } => "select_pack",
            UserEvent::SetNick { .. } => "set_nick",
            UserEvent::SetEmail { .. } => "set_email",
            UserEvent::Message { .. } => "message",
            UserEvent::ChannelDeleted { .. } => "channel_deleted",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Ack {
    pub ack: String,
}

async fn dispatch(state: AppState, event: UserEvent) -> Result<String, ServiceError> {
    match event {
        UserEvent::OpenTicket {
            user_id, username, ..
        } => {
            let channel = state.tickets.open_ticket(&user_id, &username).await?;
            Ok(format!("🎫 Ticket opened: <#{channel}>"))
        }
        UserEvent::CloseTicket {
            channel_id,
            user_id,
            is_support,
            ..
        } => {
            state
                .tickets
                .close_ticket(&channel_id, &user_id, is_support)
                .await?;
            Ok("🔒 Closing the ticket…".to_string())
        }
        UserEvent::SelectPack {
            channel_id,
            user_id,
            pack_id,
            ..
        } => state.orders.create_order(&channel_id, &user_id, &pack_id).await,
        UserEvent::SetNick {
            user_id,
            nick,
            channel_id,
            ..
        } => {
            state
                .tickets
                .set_nick(&user_id, &nick, channel_id.as_deref())
                .await
        }
        UserEvent::SetEmail {
            user_id,
            email,
            channel_id,
            ..
        } => {
            state
                .tickets
                .set_email(&user_id, &email, channel_id.as_deref())
                .await
        }
        UserEvent::Message {
            channel_id,
            author_id,
            content,
            ..
        } => {
            state
                .tickets
                .capture_message(&channel_id, &author_id, &content)
                .await?;
            Ok(String::new())
        }
        UserEvent::ChannelDeleted { channel_id, .. } => {
            state.tickets.handle_channel_deleted(&channel_id);
            Ok(String::new())
        }
    }
}

/// Accepts one decoded interaction and acknowledges it within the watchdog
/// window. Duplicate interaction ids inside the dedupe window are dropped
/// before any work starts.
#[instrument(skip(state, event), fields(kind = event.kind(), event_id = event.event_id()))]
pub async fn handle_event(State(state): State<AppState>, Json(event): Json<UserEvent>) -> Json<Ack> {
    if state.guards.is_duplicate_event(event.event_id()) {
        return Json(Ack {
            ack: "⏳ That action is already being processed.".to_string(),
        });
    }

    let ack_timeout = state.config.ack_timeout();
    let kind = event.kind();

    // The work outlives the acknowledgement: a timeout only changes what the
    // customer is told, never cancels the operation.
    let task = tokio::spawn(dispatch(state, event));

    match tokio::time::timeout(ack_timeout, task).await {
        Ok(Ok(Ok(ack))) => Json(Ack { ack }),
        Ok(Ok(Err(e))) => {
            warn!(kind, error = %e, "interaction rejected");
            Json(Ack {
                ack: format!("⚠️ {e}"),
            })
        }
        Ok(Err(join_err)) => {
            error!(kind, error = %join_err, "interaction task panicked");
            Json(Ack {
                ack: "⚠️ Something went wrong, please try again.".to_string(),
            })
        }
        Err(_) => Json(Ack {
            ack: "⏳ Still working on it, this is taking longer than usual…".to_string(),
        }),
    }
}
