pub mod host_config;
pub mod plugin_descriptor;

pub use host_config::*;
pub use plugin_descriptor::*;
