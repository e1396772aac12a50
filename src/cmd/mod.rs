//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `run`     | `Run`            |
//! | `plan`    | `Plan`           |
//! | `history` | `History`        |
//! | `tag`     | `Tag`            |
//! | `config`  | `Config`         |

pub mod config;
pub mod history;
pub mod plan;
pub mod run;
pub mod tag;

pub use config::cmd_config;
pub use history::cmd_history;
pub use plan::cmd_plan;
pub use run::cmd_run;
pub use tag::cmd_tag;
