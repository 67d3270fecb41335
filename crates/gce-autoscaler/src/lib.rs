pub mod core;
pub mod platform;
pub mod template;
