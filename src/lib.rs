//! Multi-factor authentication decision engine.
//!
//! `validi` decides whether a submitted credential authenticates a user,
//! across a mixed fleet of token types: static passwords, counter-based
//! OTPs, long-step time-based passwords, out-of-band email codes and
//! attested X.509 certificates. The [`engine::Engine`] orchestrates the
//! decision; persistence, user resolution, policy evaluation, auditing and
//! certificate authorities are collaborator traits the embedding service
//! implements (in-memory reference implementations ship for each).
//!
//! ```no_run
//! use std::sync::Arc;
//! use validi::challenge::InMemoryChallengeStore;
//! use validi::config::EngineConfig;
//! use validi::engine::{CheckRequest, Engine};
//! use validi::store::InMemoryTokenStore;
//! use validi::users::StaticDirectory;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = Engine::new(
//!     EngineConfig::new(),
//!     Arc::new(InMemoryTokenStore::new()),
//!     Arc::new(InMemoryChallengeStore::new()),
//!     Arc::new(StaticDirectory::new()),
//! );
//! let verdict = engine
//!     .check_credential(&CheckRequest {
//!         user: Some("alice".into()),
//!         pass: "pin123456".into(),
//!         ..CheckRequest::default()
//!     })
//!     .await?;
//! println!("authenticated: {}", verdict.authenticated);
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod ca;
pub mod certs;
pub mod challenge;
pub mod config;
pub mod engine;
pub mod error;
pub mod otp;
pub mod policy;
pub mod store;
pub mod token;
pub mod users;

pub use config::EngineConfig;
pub use engine::{CheckRequest, CheckResult, Engine};
pub use error::{Error, Result};
