//! Template node synthesis: kube-env parsing, OS facts, reserved resources and the node builder.

pub mod builder;
pub mod kube_env;
pub mod os_info;
pub mod quantity;
pub mod reserved;

pub use builder::TemplateBuilder;
pub use kube_env::KubeEnv;
pub use os_info::MigOsInfo;
