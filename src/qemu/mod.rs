//! Virtualization engine plumbing: launch builder and QMP monitor channel.

pub mod builder;
pub mod monitor;

pub use builder::QemuBuilder;
pub use monitor::Monitor;
