//! The variable engine: live variables, per-shard managers, and the
//! dispatcher that routes by UUID byte.

pub mod dispatcher;
pub mod var;
pub mod varmgr;

pub use dispatcher::{apply_to_var_sync, VarDispatcher};
pub use var::{Var, VarError, WriteSubscriber};
pub use varmgr::VarManager;
