use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;
use uuid::Uuid;

/// One line of the final wallet report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalletRecord {
    pub user: String,
    pub wallet: Uuid,
    pub balance: Decimal,
    pub failed_attempts: u32,
    pub locked: bool,
}

/// Writes wallet states as CSV with a `user,wallet,balance,failed_attempts,locked` header.
pub struct WalletWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> WalletWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_wallets(&mut self, records: Vec<WalletRecord>) -> Result<(), csv::Error> {
        for record in records {
            self.writer.serialize(record)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
