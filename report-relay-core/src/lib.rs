#![doc = "report-relay-core: intake and dispatch pipeline for report-relay."]

//! This crate holds the pipeline that watches a report folder and forwards new files to
//! topic-scoped channels of a group chat: classification, rate limiting, retry, the
//! sent-file ledger, per-path tracking and the audit recorder.
//! The concrete chat client lives in the host crate; everything here talks to it through
//! [`contract::ChannelClient`].
//!
//! # Usage
//! Build a [`config::RelayConfig`], pick a `ChannelClient` and hand both to
//! [`intake::IntakePipeline::start`].

pub mod audit;
pub mod classify;
pub mod config;
pub mod contract;
pub mod dispatch;
pub mod intake;
pub mod ledger;
pub mod notifier;
pub mod queue;
pub mod rate_limit;
pub mod tracker;
pub mod watch;
