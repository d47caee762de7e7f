//! # pg-notify-source
//!
//! Delivers PostgreSQL `NOTIFY` payloads as an async stream and watches the
//! stream for silence.
//!
//! ## Strategies
//!
//! - `PgNotifySource`: LISTEN on a channel with background reconnect
//! - `ChannelSource`: in-memory source for tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! let source = Arc::new(PgNotifySource::new(config));
//! source.start().await?;
//!
//! let monitor = IdleMonitor::new(source.clone(), Duration::from_secs(90));
//! let mut stream = source.notifications().await?;
//! loop {
//!     match monitor.next(&mut stream).await {
//!         Wake::Item(Some(Ok(notification))) => handle(notification).await,
//!         Wake::Item(Some(Err(e))) => warn!(error = %e, "listener error"),
//!         Wake::Item(None) => break,
//!         Wake::Idle => {}
//!     }
//! }
//! ```

pub mod backoff;
pub mod monitor;
pub mod source;

pub use backoff::*;
pub use monitor::*;
pub use source::*;
