//! Road hazard detection worker
//!
//! This library provides the core of the hazard-scan system: it discovers
//! newly uploaded videos and images in a shared Postgres job table (through a
//! LISTEN/NOTIFY change feed and a periodic poller), claims each job exactly
//! once, runs per-frame object detection and records the strongest hit.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
