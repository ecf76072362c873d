//! probeship-lib: build and release the netprobify container image
//!
//! This crate provides the pieces the `probeship` CLI drives:
//! - `recipe`: the ordered image recipe and its Containerfile rendering
//! - `build`: evaluating a recipe for one platform against a layer cache
//! - `execute`: building every target platform concurrently behind a join barrier
//! - `registry`: OCI distribution client and an in-memory stand-in
//! - `release`: the trigger-to-publish state machine

pub mod build;
pub mod cache;
pub mod config;
pub mod consts;
pub mod context;
pub mod execute;
pub mod oci;
pub mod platform;
pub mod recipe;
pub mod registry;
pub mod release;
pub mod secret;
pub mod util;
