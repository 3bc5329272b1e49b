// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport addresses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// WebSocket scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebSocketProtocol {
    Ws,
    Wss,
}

/// Where a participant can be reached.
///
/// Equality is structural. The variant selects the stub/skeleton factory
/// through [`Address::address_type`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Address {
    /// Participant living in this process, keyed in the in-process registry.
    InProcess { id: String },
    /// WebSocket server endpoint.
    WebSocket {
        protocol: WebSocketProtocol,
        host: String,
        port: u16,
        path: String,
    },
    /// WebSocket client connected to a local server.
    WebSocketClient { id: String },
    /// Unix domain socket server.
    Uds { path: String },
    /// Unix domain socket client connected to a local server.
    UdsClient { id: String },
    /// Inter-tab (browser window) endpoint.
    Browser { window_id: String },
    /// Global channel reached through a messaging endpoint.
    Channel {
        messaging_endpoint_url: String,
        channel_id: String,
    },
}

/// Type tag of an [`Address`], the key of the factory registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    InProcess,
    WebSocket,
    WebSocketClient,
    Uds,
    UdsClient,
    Browser,
    Channel,
}

impl AddressType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressType::InProcess => "InProcessAddress",
            AddressType::WebSocket => "WebSocketAddress",
            AddressType::WebSocketClient => "WebSocketClientAddress",
            AddressType::Uds => "UdsAddress",
            AddressType::UdsClient => "UdsClientAddress",
            AddressType::Browser => "BrowserAddress",
            AddressType::Channel => "ChannelAddress",
        }
    }
}

impl fmt::Display for AddressType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Address {
    pub fn in_process(id: impl Into<String>) -> Self {
        Address::InProcess { id: id.into() }
    }

    pub fn websocket(protocol: WebSocketProtocol, host: impl Into<String>, port: u16) -> Self {
        Address::WebSocket {
            protocol,
            host: host.into(),
            port,
            path: String::new(),
        }
    }

    pub fn address_type(&self) -> AddressType {
        match self {
            Address::InProcess { .. } => AddressType::InProcess,
            Address::WebSocket { .. } => AddressType::WebSocket,
            Address::WebSocketClient { .. } => AddressType::WebSocketClient,
            Address::Uds { .. } => AddressType::Uds,
            Address::UdsClient { .. } => AddressType::UdsClient,
            Address::Browser { .. } => AddressType::Browser,
            Address::Channel { .. } => AddressType::Channel,
        }
    }

    pub fn is_in_process(&self) -> bool {
        matches!(self, Address::InProcess { .. })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::InProcess { id } => write!(f, "inprocess:{}", id),
            Address::WebSocket {
                protocol,
                host,
                port,
                path,
            } => {
                let scheme = match protocol {
                    WebSocketProtocol::Ws => "ws",
                    WebSocketProtocol::Wss => "wss",
                };
                write!(f, "{}://{}:{}{}", scheme, host, port, path)
            }
            Address::WebSocketClient { id } => write!(f, "ws-client:{}", id),
            Address::Uds { path } => write!(f, "uds:{}", path),
            Address::UdsClient { id } => write!(f, "uds-client:{}", id),
            Address::Browser { window_id } => write!(f, "browser:{}", window_id),
            Address::Channel {
                messaging_endpoint_url,
                channel_id,
            } => write!(f, "channel:{}@{}", channel_id, messaging_endpoint_url),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_type_tags() {
        assert_eq!(
            Address::in_process("p1").address_type(),
            AddressType::InProcess
        );
        assert_eq!(
            Address::Uds {
                path: "/tmp/mesh.sock".into()
            }
            .address_type()
            .as_str(),
            "UdsAddress"
        );
    }

    #[test]
    fn test_address_json_is_tagged() {
        let address = Address::websocket(WebSocketProtocol::Wss, "broker", 4242);
        let json = serde_json::to_string(&address).expect("serialize");
        assert!(json.contains("\"type\":\"webSocket\""));

        let back: Address = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, address);
        assert_eq!(back.to_string(), "wss://broker:4242");
    }
}
