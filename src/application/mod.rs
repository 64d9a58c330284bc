pub mod engine;
pub mod ledger;
pub mod pin_guard;
pub mod refund;
pub mod settlement;
pub mod step_up;
pub mod unit_of_work;
