//! Core of the MDM download manager: a single-threaded cooperative scheduler
//! driving segmented, multi-source transfers.
//!
//! [`engine::Scheduler`] owns a [`registry::GroupRegistry`] and a readiness
//! poll. Every unit of work is an [`engine::Task`] that runs a bounded step
//! per tick. A [`group::DownloadGroup`] is one logical download: its URIs,
//! its [`segmenter::SegmentManager`], its temp file, and its outcome.

pub mod chunked;
pub mod config;
pub mod engine;
pub mod error;
pub mod group;
pub mod logging;
pub mod registry;
pub mod retry;
pub mod segmenter;
pub mod storage;
pub mod transfer;
