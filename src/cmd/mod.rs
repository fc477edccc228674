//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `watch`  | `Watch`          |
//! | `config` | `Config`         |

pub mod config;
pub mod watch;

pub use config::cmd_config;
pub use watch::{WatchArgs, cmd_watch};
