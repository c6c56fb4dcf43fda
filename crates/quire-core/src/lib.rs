//! Reading session engine for a networked e-reader client.
//!
//! [`session::SessionController`] holds the state of one open book and turns
//! host commands and asynchronous results into effects. [`runtime`] drives
//! it on tokio against a [`service::ReadingService`] and an
//! [`runtime::AudioOutput`].

pub mod cancellation;
pub mod characters;
pub mod chat;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod model;
pub mod narration;
pub mod navigation;
pub mod pagination;
pub mod runtime;
pub mod service;
pub mod session;
pub mod speed_reading;
pub mod storage;
pub mod text_utils;
