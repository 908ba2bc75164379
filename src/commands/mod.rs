pub mod check;
pub mod run;
pub mod test;

pub use check::{check_config, CheckReport};
pub use run::run_transfers;
pub use test::{test_connection, TestConnectionResult};
