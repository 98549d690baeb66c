//! Configuration input: the operator-supplied cluster goal plus local
//! process settings.

mod load;
mod schema;

pub use load::{load, ConfigError};
pub use schema::{
    ClusterSpec, Config, LogFormat, LoggingConfig, Timing, TransitioningTo,
};
