pub mod builtin;
pub mod command;
pub mod file;
pub mod store;

pub use builtin::register_defaults;
pub use command::{CmdError, CmdOutput, run_cmd};
pub use file::{DirEntry, file_exists, list_dir, read_file, resolve, write_file};
pub use store::{AGENT_DIR, JsonStore, STOPS_FILE, deep_merge};
