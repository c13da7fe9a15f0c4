mod dirs;
mod settings;
mod validation;

pub use dirs::{config_file, default_config_dir};
pub use settings::{ClientConfig, PollPolicy, socket_from_docker_host};
pub use validation::warn_unknown_fields;
