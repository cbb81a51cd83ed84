//! # okra-rs
//!
//! Lease-based work scheduling over a shared document store.
//!
//! Producers [`schedule`](scheduler::Scheduler::schedule) items with a run
//! date. Any number of workers compete to claim them with
//! [`peek`](scheduler::Scheduler::peek) or
//! [`poll`](scheduler::Scheduler::poll), keep their lease alive with
//! [`heartbeat`](scheduler::Scheduler::heartbeat), and delete them when
//! done. Items abandoned by a crashed worker become claimable again once
//! their heartbeat goes stale.
//!
//! All mutual exclusion comes from the store's atomic find-and-update;
//! see [`store::ItemStore`]. Postgres ([`db::Db`]) and in-memory
//! ([`store::MemoryStore`]) stores are provided.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod mapper;
pub mod model;
pub mod query;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod worker;
