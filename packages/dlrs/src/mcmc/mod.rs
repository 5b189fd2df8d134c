pub mod chain;
pub mod dependent;
pub mod parameter;
pub mod proposer;
