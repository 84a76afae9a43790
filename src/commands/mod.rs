//! CLI command implementations
//!
//! Device commands take an opened `RmiDevice`, so the same code runs over
//! every transport. `parse` and `generate` work on files only.

mod flash;
mod generate;
mod info;
mod list;
mod parse;

pub use flash::run_flash;
pub use generate::{run_generate, GenerateArgs};
pub use info::{run_info, run_probe};
pub use list::list_transports;
pub use parse::run_parse;
