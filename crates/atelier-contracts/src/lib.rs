pub mod logs;
pub mod presets;
pub mod prompt;
pub mod session;
