pub mod dlr_model;
pub mod dup_loss_probs;
pub mod model;
pub mod options;
pub mod realisation;
pub mod reconciliation_helper;
pub mod run;
