//! Shared utilities.
//!
//! Hashing helpers used by the build context, the layer cache and the OCI
//! document model.

pub mod hash;
