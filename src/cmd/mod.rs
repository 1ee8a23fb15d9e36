//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                                       |
//! |----------|--------------------------------------------------------|
//! | `run`    | `Supervise`, `Worker`                                  |
//! | `slot`   | `Provision`, `Command`, `Configure`, `Status`, `Ledger` |
//! | `config` | `Config`                                               |

pub mod config;
pub mod run;
pub mod slot;

pub use config::cmd_config;
pub use run::{cmd_supervise, cmd_worker};
pub use slot::{cmd_command, cmd_configure, cmd_ledger, cmd_provision, cmd_status};
