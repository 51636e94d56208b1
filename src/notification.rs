use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::post::{Author, PostId};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Like,
    Reply,
    Mention,
    Follow,
}

/// Which slice of the notification list a query asks for.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NotificationFilter {
    #[default]
    All,
    Mentions,
}

impl NotificationFilter {
    /// Value of the `type` query parameter, if any.
    pub fn as_param(&self) -> Option<&'static str> {
        match self {
            NotificationFilter::All => None,
            NotificationFilter::Mentions => Some("mentions"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PostExcerpt {
    pub id: PostId,
    pub content: String,
    #[serde(rename = "image", default)]
    pub media_url: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ReplyExcerpt {
    pub id: PostId,
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub created_at: DateTime<Utc>,
    pub actor: Author,
    #[serde(default)]
    pub post: Option<PostExcerpt>,
    #[serde(default)]
    pub reply: Option<ReplyExcerpt>,
}

#[derive(Deserialize, Debug)]
pub(crate) struct UnreadCount {
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_reply_notification() {
        let json = r#"{
            "type": "reply",
            "created_at": "2024-05-01T12:00:00Z",
            "actor": {"id": 7, "name": "Bob", "handle": "@bob", "avatar": "https://x/y.png"},
            "post": {"id": "p1", "content": "original"},
            "reply": {"id": "p2", "content": "answer"}
        }"#;
        let n: Notification = serde_json::from_str(json).unwrap();
        assert_eq!(n.kind, NotificationKind::Reply);
        assert_eq!(n.actor.id.as_str(), "7");
        assert_eq!(n.reply.unwrap().id, PostId::from("p2"));
    }

    #[test]
    fn unknown_kind_is_a_parse_error() {
        let json = r#"{"type": "poke", "created_at": "2024-05-01T12:00:00Z",
            "actor": {"id": "u", "name": "B", "handle": "b"}}"#;
        assert!(serde_json::from_str::<Notification>(json).is_err());
    }

    #[test]
    fn filter_param() {
        assert_eq!(NotificationFilter::All.as_param(), None);
        assert_eq!(NotificationFilter::Mentions.as_param(), Some("mentions"));
    }
}
