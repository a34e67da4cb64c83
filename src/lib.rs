//! Release pipeline for forked builds of an upstream desktop application.
//!
//! `forkbuild` follows an upstream project's releases and turns each one into
//! a branded fork release. The stages run in a fixed order and hand data to
//! each other only through the filesystem and environment variables:
//!
//! ```text
//! check ──> fetch ──> patch ──> build ──> package ──> publish
//!   │                                                    │
//!   └──── version mapping (configs/version-mapping.json) ┘
//! ```
//!
//! - **check** ([`version`]) - ask the forge for the latest upstream release
//!   and derive the next fork version (`23.12.1` → `23.12.1.1`)
//! - **fetch** ([`fetch`]) - clone or download the upstream tree at the tag
//! - **patch** ([`patch`]) - apply branding, core and addon patch
//!   directories, rolling back on any failure
//! - **build** ([`builder`]) - run the upstream's own build entry point
//! - **package** ([`package`]) - lay out and archive per-platform artifacts
//! - **publish** ([`release`]) - create the forge release, upload assets and
//!   record the mapping
//!
//! The forge is reached through the [`forge::ReleaseApi`] trait and diffs are
//! applied through [`patch::PatchTool`], so every stage can be exercised
//! without network access or host tools.

pub mod build_config;
pub mod builder;
pub mod config;
pub mod fetch;
pub mod forge;
pub mod fsutil;
pub mod outputs;
pub mod package;
pub mod patch;
pub mod platform;
pub mod preflight;
pub mod process;
pub mod release;
pub mod version;

pub use build_config::{BuildConfig, PackageFormat};
pub use config::{PipelineEnv, Settings};
pub use forge::{GitHubClient, ReleaseApi};
pub use platform::{Arch, Platform};
