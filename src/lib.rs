//! Build-and-supervise pipeline for single-container web service images.
//!
//! One configuration file describes the image and its runtime:
//!
//! - **Identity** - the unprivileged runtime user and the paths it owns
//! - **Packages** - system and language packages, scoped `runtime` or `build-only`
//! - **Assets** - the external asset build and the pruning that follows it
//! - **Template** - the reverse-proxy config rendered at container start
//! - **Supervisor** - long-running processes kept alive under a restart policy
//!
//! # Architecture
//!
//! ```text
//! container.toml
//!     │
//!     ├── build ──► pipeline ──► executor ──► packages / assets / users
//!     │                │
//!     │                └── publishes rootfs/, image-config.json, image.tar.zst
//!     │
//!     └── start ──► supervisor::Supervisor::start (render, then run)
//! ```
//!
//! Build stages run strictly in sequence against a staging root that is only
//! renamed into place once every stage succeeded and no build-only package is
//! left in the package ledger.
//!
//! # Example
//!
//! ```rust,ignore
//! use container_builder::config;
//!
//! let config = config::load("container.toml".as_ref())?;
//! let outcome = config.pipeline()?.run_with_command_backends()?;
//! println!("published {}", outcome.archive.display());
//! ```

pub mod assets;
pub mod config;
pub mod error;
pub mod executor;
pub mod packages;
pub mod pipeline;
pub mod preflight;
pub mod runs;
pub mod stage;
pub mod supervisor;
pub mod template;

pub use error::{Error, Result};
pub use pipeline::{BuildOutcome, Pipeline, PipelineSettings};
pub use supervisor::{Supervisor, SupervisorOutcome};
