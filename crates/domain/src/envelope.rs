//! Normalized inbound envelope — the channel-agnostic message contract.
//!
//! Connectors (WhatsApp, SMS, web, voice, …) normalize provider payloads into
//! a [`RawMessage`] before posting it to the ingress. Unknown provider fields
//! are tolerated and ignored; `metadata` carries anything worth keeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Content
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Location,
    Contact,
    Mixed,
}

/// A media attachment reference. The fabric never fetches media; it carries
/// the reference through to the pipeline and outbound segments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RawMessage
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The normalized ingress envelope. `tenant_id` and `agent_id` are resolved
/// upstream and trusted here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMessage {
    pub tenant_id: Uuid,
    pub agent_id: Uuid,
    /// Channel tag: `"whatsapp"`, `"sms"`, `"web"`, `"voice"`, …
    pub channel: String,
    /// Provider-scoped user identifier within the channel.
    pub channel_user_id: String,
    pub content_type: ContentType,
    /// May be `None` when `content_type != text` and media/location carries
    /// the payload.
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    /// Provider-specific structured content (buttons, list replies, …).
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
    /// Platform-native message ID.
    pub provider_message_id: String,
    /// Caller-supplied idempotency key for duplicate submission collapsing.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl RawMessage {
    /// Validate required fields. Size is checked separately by the ingress
    /// against the configured cap.
    pub fn validate(&self) -> Result<()> {
        if self.channel.is_empty() {
            return Err(Error::InvalidRequest("channel must not be empty".into()));
        }
        if self.channel_user_id.is_empty() {
            return Err(Error::InvalidRequest(
                "channel_user_id must not be empty".into(),
            ));
        }
        if self.provider_message_id.is_empty() {
            return Err(Error::InvalidRequest(
                "provider_message_id must not be empty".into(),
            ));
        }
        if self.content_type == ContentType::Text
            && self.text.as_deref().map_or(true, str::is_empty)
        {
            return Err(Error::InvalidRequest(
                "text content requires a non-empty text field".into(),
            ));
        }
        if self.content_type == ContentType::Location && self.location.is_none() {
            return Err(Error::InvalidRequest(
                "location content requires a location field".into(),
            ));
        }
        Ok(())
    }

    /// Serialized size in bytes, used against the ingress envelope cap.
    pub fn approx_size(&self) -> usize {
        serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
    }

    /// Byte length of the textual payload (for aggregation byte caps).
    pub fn payload_len(&self) -> usize {
        self.text.as_deref().map_or(0, str::len)
            + self
                .structured
                .as_ref()
                .map_or(0, |v| v.to_string().len())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound segments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentType {
    Text,
    Image,
    Audio,
    Video,
    Document,
}

/// One normalized outbound response segment. Channel adapters translate
/// segments into provider wire formats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseSegment {
    #[serde(rename = "type")]
    pub segment_type: SegmentType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<String>,
}

impl ResponseSegment {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            segment_type: SegmentType::Text,
            text: Some(text.into()),
            media_url: None,
            mime_type: None,
            buttons: Vec::new(),
            quick_replies: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_message(text: &str) -> RawMessage {
        RawMessage {
            tenant_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            channel: "whatsapp".into(),
            channel_user_id: "+33612345678".into(),
            content_type: ContentType::Text,
            text: Some(text.into()),
            media: Vec::new(),
            location: None,
            structured: None,
            provider_message_id: "wamid.1".into(),
            idempotency_key: None,
            received_at: Utc::now(),
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn valid_text_message() {
        assert!(sample_message("hello").validate().is_ok());
    }

    #[test]
    fn text_message_requires_text() {
        let mut msg = sample_message("hello");
        msg.text = None;
        assert!(matches!(msg.validate(), Err(Error::InvalidRequest(_))));

        msg.text = Some(String::new());
        assert!(matches!(msg.validate(), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn media_message_without_text_is_valid() {
        let mut msg = sample_message("");
        msg.content_type = ContentType::Image;
        msg.text = None;
        msg.media.push(MediaRef {
            url: "https://cdn.example/img.jpg".into(),
            mime_type: Some("image/jpeg".into()),
            caption: None,
        });
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn location_requires_point() {
        let mut msg = sample_message("x");
        msg.content_type = ContentType::Location;
        assert!(msg.validate().is_err());
        msg.location = Some(GeoPoint {
            latitude: 48.85,
            longitude: 2.35,
        });
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn unknown_fields_tolerated() {
        let json = serde_json::json!({
            "tenant_id": Uuid::new_v4(),
            "agent_id": Uuid::new_v4(),
            "channel": "sms",
            "channel_user_id": "u1",
            "content_type": "text",
            "text": "hi",
            "provider_message_id": "m1",
            "received_at": Utc::now(),
            "some_future_field": {"nested": true},
        });
        let msg: RawMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.text.as_deref(), Some("hi"));
    }

    #[test]
    fn segment_serializes_with_type_tag() {
        let seg = ResponseSegment::text("hello");
        let json = serde_json::to_value(&seg).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hello");
        assert!(json.get("buttons").is_none());
    }
}
