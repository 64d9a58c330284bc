//! Entities, value objects and the ports the application layer talks through.

pub mod money;
pub mod order;
pub mod ports;
pub mod product;
pub mod refund;
pub mod transaction;
pub mod voucher;
pub mod wallet;
