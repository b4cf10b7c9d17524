//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                     |
//! |----------|--------------------------------------|
//! | `serve`  | `Serve`                              |
//! | `users`  | `InitDb`, `CreateUser`               |
//! | `data`   | `Export`, `Import`                   |
//! | `config` | `Config`                             |

pub mod config;
pub mod data;
pub mod serve;
pub mod users;

pub use config::cmd_config;
pub use data::{cmd_export, cmd_import};
pub use serve::cmd_serve;
pub use users::{cmd_create_user, cmd_init_db};
