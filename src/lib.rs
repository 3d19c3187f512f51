//! Meshsentry library — control plane for a mesh-commanded scanning node.
//!
//! The node scans the 2.4 GHz spectrum for target devices and attack
//! signatures, reports findings over a short-range serial text mesh, and
//! hosts a local web UI from its own soft-AP. This crate is the portable
//! control-plane layer: the addressed command/notification protocol on the
//! mesh link, the state machine that arbitrates the single radio between
//! soft-AP/web mode and promiscuous scanning, task-slot supervision for
//! the long-running scan/detection workers, the clock authority that
//! reconciles GPS time with the battery-backed RTC, and the crash-tolerant
//! telemetry log.
//!
//! Everything here is `no_std`, allocator-free, and testable on any host
//! with `cargo test`. Hardware access is injected through traits
//! ([`radio::RadioDriver`], [`clock::RtcDevice`], [`telemetry::LogStorage`],
//! [`mesh::MeshPort`], [`dispatch::Platform`]); the platform binary
//! (`firmware/`, ESP-IDF) provides radio access, storage, and the capture
//! engines.

#![cfg_attr(not(test), no_std)]

pub mod board;
pub mod clock;
pub mod config;
pub mod defaults;
pub mod dispatch;
pub mod mesh;
pub mod protocol;
pub mod radio;
pub mod status;
pub mod tasks;
pub mod telemetry;
pub mod vibration;
