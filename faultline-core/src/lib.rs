//! # faultline-core
//!
//! Core library for faultline - a buffered error telemetry client.
//!
//! This library provides:
//! - Configuration validation and normalization ([`resolve`])
//! - A bounded, persistent event queue with batched delivery ([`EventQueue`])
//! - HTTP delivery with scrubbing of sensitive data
//! - A capture client with sampling, enrichment and `before_send`
//! - Automatic capture of `tracing` errors and panics
//! - Configuration file and logging infrastructure
//!
//! ## Example
//!
//! ```rust,no_run
//! use faultline_core::{resolve, Client, ConfigInput, Level};
//!
//! # async fn run() -> faultline_core::Result<()> {
//! let config = resolve(
//!     &ConfigInput::new()
//!         .set("api_key", "flt_live_xxxx")
//!         .set("api_url", "https://collector.example.com/v1/events"),
//! )?;
//!
//! let client = Client::new(config)?;
//! client.capture_message("cache warmup failed", Level::Warning);
//! client.flush().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use client::Client;
pub use config::Config;
pub use error::{Error, Result, ValidationError, ValidationErrorKind};
pub use event::{Breadcrumb, Event, ExceptionInfo, Level};
pub use queue::{DrainSummary, EventQueue, FlushOptions, FlushOutcome, QueueOptions};
pub use resolver::{
    default_config, resolve, BeforeSend, ConfigInput, ResolvedConfig, Settings, TagValue,
};

// Public modules
pub mod capture;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod queue;
pub mod resolver;
pub mod scrub;
pub mod storage;
pub mod transport;
