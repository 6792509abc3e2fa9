use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(MessageId);

/// A chat participant other than the authenticated user.
///
/// The roster endpoint historically emits `userId` and `avtUrl`; both the
/// short and the canonical field names are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correspondent {
    #[serde(alias = "userId")]
    pub id: UserId,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default, alias = "avtUrl", skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub username: String,
}

impl Correspondent {
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSelection {
    pub recipient_id: UserId,
    pub full_name: String,
}

impl From<&Correspondent> for ConversationSelection {
    fn from(value: &Correspondent) -> Self {
        Self {
            recipient_id: value.id,
            full_name: value.full_name(),
        }
    }
}

/// One chat message. `timestamp` is milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    pub content: String,
    pub timestamp: i64,
}

impl Message {
    /// True when the message was exchanged between `self_id` and `peer_id`,
    /// in either direction. A missing recipient is resolved from the sender.
    pub fn is_between(&self, self_id: UserId, peer_id: UserId) -> bool {
        match (self.sender_id, self.recipient_id) {
            (sender, Some(recipient)) => {
                (sender == self_id && recipient == peer_id)
                    || (sender == peer_id && recipient == self_id)
            }
            (sender, None) => sender == self_id || sender == peer_id,
        }
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// The credentials presented to the broker and the REST collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
    pub login: Option<String>,
    pub passcode: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sent_at_reads_epoch_millis() {
        let message = Message {
            id: MessageId(1),
            sender_id: UserId(1),
            recipient_id: None,
            content: "hi".into(),
            timestamp: 1_700_000_000_123,
        };
        let sent_at = message.sent_at().expect("valid timestamp");
        assert_eq!(sent_at.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn roster_entry_accepts_legacy_field_names() {
        let raw = r#"{"userId":1,"firstName":"A","lastName":"B","avtUrl":"http://x/a.png","username":"ab"}"#;
        let parsed: Correspondent = serde_json::from_str(raw).expect("parse");
        assert_eq!(parsed.id, UserId(1));
        assert_eq!(parsed.avatar_url.as_deref(), Some("http://x/a.png"));
        assert_eq!(parsed.full_name(), "A B");
    }

    #[test]
    fn message_membership_checks_both_directions() {
        let inbound = Message {
            id: MessageId(10),
            sender_id: UserId(1),
            recipient_id: Some(UserId(99)),
            content: "hi".into(),
            timestamp: 100,
        };
        assert!(inbound.is_between(UserId(99), UserId(1)));
        assert!(!inbound.is_between(UserId(99), UserId(2)));

        let mut stray = inbound.clone();
        stray.recipient_id = Some(UserId(7));
        assert!(!stray.is_between(UserId(99), UserId(1)));

        let mut untargeted = inbound;
        untargeted.recipient_id = None;
        assert!(untargeted.is_between(UserId(99), UserId(1)));
        assert!(!untargeted.is_between(UserId(99), UserId(2)));
    }
}
