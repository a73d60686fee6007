pub mod batch_commands;
pub mod process_commands;
pub mod watch_commands;
