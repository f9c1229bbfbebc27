//! Append-only CSV log of settled orders.

use crate::{fs::ensure_directory_exists, order::Order, timestamp::Timestamp};
use anyhow::{Context, Result};
use serde::{Serialize, Serializer};
use std::{
    fs::{File, OpenOptions},
    path::Path,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// A UTC timestamp rendered human-readable; ledger times are epoch
/// milliseconds everywhere else.
#[derive(Debug, Clone, Copy)]
pub struct UtcDateTime(OffsetDateTime);

impl From<Timestamp> for UtcDateTime {
    fn from(timestamp: Timestamp) -> Self {
        let nanos = i128::from(timestamp.as_millis()) * 1_000_000;
        let datetime =
            OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(OffsetDateTime::UNIX_EPOCH);

        UtcDateTime(datetime)
    }
}

impl Serialize for UtcDateTime {
    fn serialize<S>(&self, serializer: S) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
    where
        S: Serializer,
    {
        let formatted = self
            .0
            .format(&Rfc3339)
            .map_err(serde::ser::Error::custom)?;

        serializer.serialize_str(&formatted)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Settlement {
    pub order_id: String,
    pub status: String,
    pub ledger_a: String,
    pub token_a: String,
    pub amount_a: u64,
    pub ledger_b: String,
    pub token_b: String,
    pub amount_b: u64,
    pub created_at: UtcDateTime,
    pub finished_at: UtcDateTime,
}

impl Settlement {
    pub fn new(order: &Order, finished_at: Timestamp) -> Self {
        Settlement {
            order_id: order.order_id.to_string(),
            status: order.status.to_string(),
            ledger_a: order.side_a.ledger.clone(),
            token_a: order.side_a.token.clone(),
            amount_a: order.side_a.amount.as_base_units(),
            ledger_b: order.side_b.ledger.clone(),
            token_b: order.side_b.token.clone(),
            amount_b: order.side_b.amount.as_base_units(),
            created_at: order.created_at.into(),
            finished_at: finished_at.into(),
        }
    }
}

#[derive(Debug)]
pub struct History {
    writer: csv::Writer<File>,
}

impl History {
    pub fn new(path: &Path) -> Result<History> {
        ensure_directory_exists(path).context("failed to create the history parent directory")?;

        let has_headers = !path.exists();

        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to open history file {}", path.display()))?;

        let writer = csv::WriterBuilder::new()
            .has_headers(has_headers)
            .from_writer(file);

        Ok(History { writer })
    }

    pub fn write(&mut self, settlement: Settlement) -> Result<()> {
        self.writer
            .serialize(settlement)
            .context("failed to write history entry")?;
        self.writer.flush().context("failed to flush history file")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, StdThreadGen};

    #[test]
    fn written_settlements_are_readable_back() {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let path = tmp_dir.path().join("history.csv");

        let order = {
            let mut gen = StdThreadGen::new(10);
            Order::arbitrary(&mut gen)
        };

        {
            let mut history = History::new(&path).unwrap();
            history
                .write(Settlement::new(&order, Timestamp::from_millis(2_000)))
                .unwrap();
            history
                .write(Settlement::new(&order, Timestamp::from_millis(3_000)))
                .unwrap();
        }

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<csv::StringRecord> = reader.records().map(|row| row.unwrap()).collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][0], order.order_id.to_string().as_str());
    }

    #[test]
    fn timestamps_render_as_rfc3339() {
        let datetime = UtcDateTime::from(Timestamp::from_millis(0));
        let json = serde_json::to_string(&datetime).unwrap();

        assert_eq!(json, "\"1970-01-01T00:00:00Z\"");
    }
}
