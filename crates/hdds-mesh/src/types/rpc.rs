// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/reply payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub request_reply_id: String,
    pub method_name: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub param_datatypes: Vec<String>,
}

impl Request {
    pub fn new(method_name: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            request_reply_id: uuid::Uuid::new_v4().to_string(),
            method_name: method_name.into(),
            params,
            param_datatypes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub request_reply_id: String,
    #[serde(default)]
    pub response: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneWayRequest {
    pub method_name: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub param_datatypes: Vec<String>,
}
