// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Inbound demultiplexing and typed outbound sends.

pub mod dispatcher;
pub mod handler;

pub use dispatcher::{Dispatcher, MessageSigner, MessagingQos, DEFAULT_TTL_MS, MAX_EXPIRY_DATE_MS};
pub use handler::{
    PublicationHandler, PublicationSender, RequestReplyHandler, SubscriptionHandler,
    SubscriptionReplyCallback,
};
