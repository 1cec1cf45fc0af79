//! CLI commands.

pub mod apply;
pub mod commit;
pub mod init;
pub mod list;
pub mod queue;
pub mod refs;
pub mod run;
