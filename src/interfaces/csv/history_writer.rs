use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;
use uuid::Uuid;

/// A ledger entry as exported. `amount` is signed from the wallet's point of view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub user: String,
    pub wallet: Uuid,
    pub transaction: Option<Uuid>,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

pub struct HistoryWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> HistoryWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_entries(&mut self, records: Vec<HistoryRecord>) -> Result<(), csv::Error> {
        for record in records {
            self.writer.serialize(record)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
