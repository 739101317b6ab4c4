//! # sms-gateway — SMS gateway for a serial cellular modem
//!
//! A long-running daemon that accepts short text messages over an
//! authenticated HTTP endpoint and delivers each one, as an SMS, to a fixed
//! list of recipients by driving a cellular modem over a serial port with the
//! AT command set.
//!
//! ## How a message travels
//!
//! ```text
//! POST /sendsms ──▶ id allocation ──▶ messages/inbox/<id>_<ts>  (atomic rename)
//!                                          │
//!                            delivery scheduler (1 s tick)
//!                                          │
//!                         modem session: CPIN? / CMGF=1 / CMGS
//!                                          │
//!                     state.json bookkeeping ──▶ messages/sent/
//! ```
//!
//! Delivery is durable: pending messages survive restarts on disk, failed
//! sends retry with cubic backoff, configurable rate limits bound the send
//! frequency, and an optional keep-alive message prevents prepaid SIM
//! deactivation during quiet periods.
//!
//! ## Module Organization
//!
//! - [`api`] - HTTP ingestion endpoint and status page
//! - [`config`] - INI configuration, rate limit grammar, live-reload watcher
//! - [`delivery`] - inbox scheduler and failure/backoff tracking
//! - [`keepalive`] - periodic keep-alive enqueueing
//! - [`message`] - message ids and on-disk naming
//! - [`modem`] - serial AT session and response parser
//! - [`state`] - persisted ids/timestamps and the rate limiter
//! - [`storage`] - inbox/sent message store
//!
//! The binary in `src/main.rs` wires these together and owns startup,
//! signal handling and shutdown ordering.

pub mod api;
pub mod config;
pub mod delivery;
pub mod keepalive;
pub mod logutil;
pub mod message;
pub mod modem;
pub mod state;
pub mod storage;
