//! # Genesys Power Supply Driver
//!
//! Asynchronous driver for TDK-Lambda Genesys DC power supplies over RS-232, raw
//! TCP, or an in-process emulated unit. Callers read and write named channels;
//! the driver turns them into the Genesys ASCII protocol, keeps a single
//! exchange on the wire at a time, retries, and reconnects on its own.
//!
//! ## Crate Structure
//!
//! - **`config`**: `AppConfig` and friends, loaded from TOML plus `GENESYS_`
//!   environment overrides, validated before anything connects.
//! - **`error`**: `PsuError` and the transport/decode error kinds beneath it.
//! - **`tracing_setup`**: subscriber initialisation for binaries and tests.
//! - **`transport`**: the `Transport` trait and its serial, TCP and emulated links.
//! - **`protocol`**: `Command`, `Value` and the `Codec`, the one place the wire
//!   grammar is written down.
//! - **`emulator`**: a virtual Genesys unit reachable through the transport layer.
//! - **`channel`**: the bounded FIFO between callers and the session.
//! - **`error_recovery`**: retry and reconnect-backoff policies.
//! - **`session`**: the connection state machine that owns the link.
//! - **`bridge`**: named channels (`volt_set`, `out_ena`, ...), polling, and the
//!   `Service` that wires everything together.
//!
//! ## Example
//!
//! ```rust,no_run
//! use genesys_psu::bridge::Service;
//! use genesys_psu::config::AppConfig;
//! use genesys_psu::protocol::Value;
//! use genesys_psu::session::SessionState;
//!
//! # async fn demo() -> Result<(), genesys_psu::error::PsuError> {
//! let service = Service::start(&AppConfig::emulated()).await?;
//! service.session().wait_for(SessionState::Ready).await?;
//!
//! service.bridge().put("volt_set", Value::Number(12.345)).await?;
//! let measured = service.bridge().get("volt_real").await?;
//! println!("measured {measured} V");
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod channel;
pub mod config;
pub mod emulator;
pub mod error;
pub mod error_recovery;
pub mod protocol;
pub mod session;
pub mod tracing_setup;
pub mod transport;
