pub mod aider;
pub mod claude;
pub mod event;
pub mod process;

pub use aider::AiderBackend;
pub use claude::ClaudeBackend;
