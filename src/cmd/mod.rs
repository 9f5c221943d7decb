//! CLI command implementations.
//!
//! | Module  | Commands handled |
//! |---------|------------------|
//! | `check` | `Check`          |
//! | `up`    | `Up`             |

pub mod check;
pub mod up;

pub use check::cmd_check;
pub use up::cmd_up;
