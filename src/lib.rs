pub mod clock;
pub mod config;
pub mod errors;
pub mod ledger;
pub mod logging;
pub mod store;
pub mod supervisor;
pub mod worker;
