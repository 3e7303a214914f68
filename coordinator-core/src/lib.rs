//! Coordinator backend for multi-party Phase-2 trusted-setup ceremonies.
//!
//! A ceremony is a set of circuits, each requiring a sequential chain of
//! contributions from distinct participants. This crate is the participant
//! lifecycle and contribution scheduler: it admits participants, serializes
//! contributions per circuit through a waiting queue, drives the
//! download → compute → upload → verify protocol, verifies uploaded zkeys
//! (in-process or on a transient VM), and reclaims stalled slots with a
//! timeout-and-penalty sweep.
//!
//! Everything external is injected: the linearizable document [`store`],
//! the [`blob_store`] holding the artifacts, the [`vm_executor`] and the
//! zkey primitive, plus a [`clock`]. The serving layer delegates to
//! [`engine::CeremonyEngine`] and spawns the [`scheduler`], [`refresh`],
//! [`sweeper`] and [`cron`] loops.

pub mod auth;
pub mod blob_store;
pub mod clock;
pub mod config;
pub mod cron;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod queue;
pub mod refresh;
pub mod scheduler;
pub mod store;
pub mod store_memory;
pub mod sweeper;
pub mod types;
pub mod verifier;
pub mod vm_executor;
pub mod zkey;

pub use engine::CeremonyEngine;
pub use error::CoordinatorError;
