pub mod history_writer;
pub mod wallet_writer;
