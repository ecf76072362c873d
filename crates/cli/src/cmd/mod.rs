mod build;
mod cache;
mod plan;
mod release;
mod render;

pub use build::cmd_build;
pub use cache::{cmd_cache_clear, cmd_cache_info};
pub use plan::cmd_plan;
pub use release::{ReleaseOptions, cmd_release};
pub use render::cmd_render;
