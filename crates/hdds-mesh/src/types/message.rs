// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Routed message envelope.

use crate::types::address::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of a routed message, carried on the wire as a short tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Request,
    Reply,
    OneWay,
    SubscriptionRequest,
    BroadcastSubscriptionRequest,
    MulticastSubscriptionRequest,
    SubscriptionReply,
    SubscriptionStop,
    Publication,
    Multicast,
    /// Tag this runtime does not understand.
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Request => "rq",
            MessageType::Reply => "rp",
            MessageType::OneWay => "oneWay",
            MessageType::SubscriptionRequest => "srq",
            MessageType::BroadcastSubscriptionRequest => "brq",
            MessageType::MulticastSubscriptionRequest => "mrq",
            MessageType::SubscriptionReply => "srp",
            MessageType::SubscriptionStop => "sst",
            MessageType::Publication => "p",
            MessageType::Multicast => "m",
            MessageType::Unknown(tag) => tag,
        }
    }

    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "rq" => MessageType::Request,
            "rp" => MessageType::Reply,
            "oneWay" => MessageType::OneWay,
            "srq" => MessageType::SubscriptionRequest,
            "brq" => MessageType::BroadcastSubscriptionRequest,
            "mrq" => MessageType::MulticastSubscriptionRequest,
            "srp" => MessageType::SubscriptionReply,
            "sst" => MessageType::SubscriptionStop,
            "p" => MessageType::Publication,
            "m" => MessageType::Multicast,
            other => MessageType::Unknown(other.to_string()),
        }
    }

    /// Messages that open a conversation and expect something back.
    pub fn is_request_like(&self) -> bool {
        matches!(
            self,
            MessageType::Request
                | MessageType::SubscriptionRequest
                | MessageType::BroadcastSubscriptionRequest
                | MessageType::MulticastSubscriptionRequest
        )
    }

    /// Messages addressed to a proxy that cannot be re-discovered if it is gone.
    pub fn is_response_like(&self) -> bool {
        matches!(
            self,
            MessageType::Reply | MessageType::SubscriptionReply | MessageType::Publication
        )
    }
}

impl From<String> for MessageType {
    fn from(tag: String) -> Self {
        MessageType::from_tag(&tag)
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message travelling through the router.
///
/// `payload` is the JSON encoding of the typed body (request, publication...).
/// For multicast messages `recipient` holds the multicast id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub sender: String,
    pub recipient: String,
    /// Absolute expiry, milliseconds since the Unix epoch.
    pub expiry_date_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Address>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
    pub payload: String,
    /// Set by transports for messages that arrived over the global transport.
    #[serde(skip)]
    pub is_received_from_global: bool,
    /// Both ends of the message live in this process.
    #[serde(skip)]
    pub is_local_message: bool,
}

impl Message {
    pub fn new(
        msg_type: MessageType,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            msg_type,
            sender: sender.into(),
            recipient: recipient.into(),
            expiry_date_ms: 0,
            reply_to: None,
            custom_headers: BTreeMap::new(),
            signature: None,
            payload: payload.into(),
            is_received_from_global: false,
            is_local_message: false,
        }
    }

    pub fn with_expiry_date(mut self, expiry_date_ms: u64) -> Self {
        self.expiry_date_ms = expiry_date_ms;
        self
    }

    pub fn with_reply_to(mut self, address: Address) -> Self {
        self.reply_to = Some(address);
        self
    }

    pub fn with_custom_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_headers.insert(key.into(), value.into());
        self
    }

    pub fn received_from_global(mut self, flag: bool) -> Self {
        self.is_received_from_global = flag;
        self
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiry_date_ms < now_ms
    }

    /// Approximate footprint used for queue accounting.
    pub fn size_bytes(&self) -> usize {
        let headers: usize = self
            .custom_headers
            .iter()
            .map(|(k, v)| k.len() + v.len())
            .sum();
        self.payload.len()
            + self.id.len()
            + self.sender.len()
            + self.recipient.len()
            + headers
            + self.signature.as_ref().map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_tags() {
        for t in [
            MessageType::Request,
            MessageType::Reply,
            MessageType::OneWay,
            MessageType::SubscriptionRequest,
            MessageType::BroadcastSubscriptionRequest,
            MessageType::MulticastSubscriptionRequest,
            MessageType::SubscriptionReply,
            MessageType::SubscriptionStop,
            MessageType::Publication,
            MessageType::Multicast,
        ] {
            assert_eq!(MessageType::from_tag(t.as_str()), t);
        }
        assert_eq!(
            MessageType::from_tag("xyz"),
            MessageType::Unknown("xyz".into())
        );
    }

    #[test]
    fn test_local_flags_not_serialized() {
        let msg = Message::new(MessageType::Request, "proxy", "provider", "{}")
            .with_expiry_date(42)
            .received_from_global(true);
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"type\":\"rq\""));

        let back: Message = serde_json::from_str(&json).expect("deserialize");
        assert!(!back.is_received_from_global);
        assert_eq!(back.expiry_date_ms, 42);
        assert_eq!(back.id, msg.id);
    }

    #[test]
    fn test_expiry_and_size() {
        let msg = Message::new(MessageType::OneWay, "a", "b", "0123456789").with_expiry_date(100);
        assert!(!msg.is_expired(100));
        assert!(msg.is_expired(101));
        assert_eq!(msg.size_bytes(), 10 + msg.id.len() + 2);
    }
}
