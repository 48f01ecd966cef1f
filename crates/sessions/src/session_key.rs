//! Session key derivation.
//!
//! The key `sess:{tenant}:{agent}:{interlocutor}:{channel}` is the identity
//! on which the orchestrator serializes turns: one in-flight turn per key.
//! UUIDs are rendered lowercase; the channel tag is normalized to lowercase.

use uuid::Uuid;

/// Compute the session key for an interlocutor on a channel.
pub fn derive_session_key(
    tenant_id: Uuid,
    agent_id: Uuid,
    interlocutor_id: Uuid,
    channel: &str,
) -> String {
    format!(
        "sess:{tenant_id}:{agent_id}:{interlocutor_id}:{}",
        channel.to_ascii_lowercase()
    )
}

/// Parsed components of a session key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKeyParts {
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    pub interlocutor_id: Uuid,
    pub channel: String,
}

/// Parse a session key back into its components. Returns `None` for
/// malformed keys.
pub fn parse_session_key(key: &str) -> Option<SessionKeyParts> {
    let rest = key.strip_prefix("sess:")?;
    let mut parts = rest.splitn(4, ':');
    let tenant_id = parts.next()?.parse().ok()?;
    let agent_id = parts.next()?.parse().ok()?;
    let interlocutor_id = parts.next()?.parse().ok()?;
    let channel = parts.next()?;
    if channel.is_empty() {
        return None;
    }
    Some(SessionKeyParts {
        tenant_id,
        agent_id,
        interlocutor_id,
        channel: channel.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format() {
        let key = derive_session_key(Uuid::nil(), Uuid::nil(), Uuid::nil(), "WhatsApp");
        assert_eq!(
            key,
            "sess:00000000-0000-0000-0000-000000000000\
             :00000000-0000-0000-0000-000000000000\
             :00000000-0000-0000-0000-000000000000:whatsapp"
        );
    }

    #[test]
    fn round_trip() {
        let t = Uuid::new_v4();
        let a = Uuid::new_v4();
        let i = Uuid::new_v4();
        let key = derive_session_key(t, a, i, "web");
        let parts = parse_session_key(&key).unwrap();
        assert_eq!(parts.tenant_id, t);
        assert_eq!(parts.agent_id, a);
        assert_eq!(parts.interlocutor_id, i);
        assert_eq!(parts.channel, "web");
    }

    #[test]
    fn rejects_malformed() {
        assert!(parse_session_key("sess:not-a-uuid:x:y:web").is_none());
        assert!(parse_session_key("other:prefix").is_none());
        let key = derive_session_key(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "");
        assert!(parse_session_key(&key).is_none());
    }

    #[test]
    fn same_interlocutor_distinct_channels_distinct_keys() {
        let t = Uuid::new_v4();
        let a = Uuid::new_v4();
        let i = Uuid::new_v4();
        assert_ne!(
            derive_session_key(t, a, i, "whatsapp"),
            derive_session_key(t, a, i, "sms")
        );
    }
}
