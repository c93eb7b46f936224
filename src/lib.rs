pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod drone;
pub mod error;
pub mod model;
pub mod shutdown;
pub mod worker;
