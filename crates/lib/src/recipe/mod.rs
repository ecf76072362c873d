//! Image recipes.
//!
//! A recipe is an ordered list of build steps on top of a pinned base image.
//! Order matters for caching: each layer's cache key covers its own inputs
//! plus every earlier step, so the dependency manifest is staged and
//! installed before any application source is copied. That way editing the
//! application does not invalidate the dependency layer.
//!
//! # Submodules
//!
//! - `types` - authoring form ([`ImageRecipe`], [`Step`]) and validation
//! - `instruction` - lowered form, one [`Instruction`] per cache unit
//! - `render` - Containerfile rendering and recipe labels

mod instruction;
pub mod render;
mod types;

pub use instruction::Instruction;
pub use types::*;
