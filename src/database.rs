//! The order record store: the only durable, shared mutable state.
//!
//! Every coordinator step checkpoints here before and after its ledger
//! write. Records are CBOR with a schema version; a record written by a
//! newer coordinator is refused, never silently truncated.

use crate::{order::Order, order::OrderId, timestamp::Timestamp};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

const SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct Record {
    schema_version: u32,
    order: Order,
    terminal_at: Option<Timestamp>,
}

#[derive(Debug)]
pub struct Database {
    db: sled::Db,
    #[cfg(test)]
    tmp_dir: Option<tempfile::TempDir>,
}

impl Database {
    pub fn new(path: &std::path::Path) -> Result<Self> {
        let path = path
            .to_str()
            .ok_or_else(|| anyhow!("failed to convert path to utf-8 string: {:?}", path))?;

        let db = sled::open(path).with_context(|| format!("failed to open DB at {}", path))?;

        Ok(Database {
            db,
            #[cfg(test)]
            tmp_dir: None,
        })
    }

    #[cfg(test)]
    pub fn new_test() -> Result<Self> {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let db = sled::open(tmp_dir.path())
            .with_context(|| format!("failed to open DB at {}", tmp_dir.path().display()))?;

        Ok(Database {
            db,
            tmp_dir: Some(tmp_dir),
        })
    }

    pub async fn insert_order(&self, order: Order) -> Result<()> {
        let order_id = order.order_id;
        let key = order_id.as_bytes();

        let record = Record {
            schema_version: SCHEMA_VERSION,
            order,
            terminal_at: None,
        };
        let new_value = serialize(&record).context("failed to serialize new order record")?;

        self.db
            .compare_and_swap(key, Option::<Vec<u8>>::None, Some(new_value))
            .context("failed to write in the DB")?
            .map_err(|_| anyhow!("order {} is already stored", order_id))?;

        self.flush().await
    }

    /// Persist the current state of an order. The swap between the old
    /// and the new record is atomic; a concurrent writer for the same
    /// order is a bug and surfaces as an error.
    pub async fn update_order(&self, order: &Order) -> Result<()> {
        let key = order.order_id.as_bytes();

        let old_bytes = self
            .db
            .get(key)?
            .ok_or_else(|| anyhow!("order {} does not exist", order.order_id))?;
        let old_record: Record = deserialize(&old_bytes).context("failed to deserialize order")?;

        let terminal_at = match (old_record.terminal_at, order.is_terminal()) {
            (Some(at), _) => Some(at),
            (None, true) => Some(wall_clock_now()),
            (None, false) => None,
        };

        let new_record = Record {
            schema_version: SCHEMA_VERSION,
            order: order.clone(),
            terminal_at,
        };
        let new_value = serialize(&new_record).context("failed to serialize order record")?;

        self.db
            .compare_and_swap(key, Some(old_bytes.to_vec()), Some(new_value))
            .context("failed to write in the DB")?
            .map_err(|_| {
                anyhow!(
                    "stored record for order {} changed underneath us",
                    order.order_id
                )
            })?;

        self.flush().await
    }

    pub fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>> {
        let record = self.get_record(order_id)?;

        Ok(record.map(|record| record.order))
    }

    pub fn all_orders(&self) -> Result<Vec<Order>> {
        self.records()
            .map(|result| result.map(|(_, record)| record.order))
            .collect()
    }

    pub fn non_terminal_orders(&self) -> Result<Vec<Order>> {
        Ok(self
            .all_orders()?
            .into_iter()
            .filter(|order| !order.is_terminal())
            .collect())
    }

    pub async fn remove_order(&self, order_id: &OrderId) -> Result<()> {
        self.db
            .remove(order_id.as_bytes())
            .with_context(|| format!("failed to delete order {}", order_id))?;

        self.flush().await
    }

    /// Remove terminal orders whose retention window has passed.
    /// Returns how many records were collected.
    pub async fn collect_garbage(&self, retention_ms: u64, now: Timestamp) -> Result<usize> {
        let mut collected = 0;

        for result in self.records() {
            let (order_id, record) = result?;

            if let Some(terminal_at) = record.terminal_at {
                if terminal_at.plus(retention_ms) < now {
                    self.db.remove(order_id.as_bytes())?;
                    collected += 1;
                }
            }
        }

        if collected > 0 {
            self.flush().await?;
        }

        Ok(collected)
    }

    fn get_record(&self, order_id: &OrderId) -> Result<Option<Record>> {
        let record = match self.db.get(order_id.as_bytes())? {
            Some(data) => deserialize(&data).context("failed to deserialize order")?,
            None => return Ok(None),
        };

        Ok(Some(record))
    }

    fn records(&self) -> impl Iterator<Item = Result<(OrderId, Record)>> + '_ {
        self.db.iter().map(|item| {
            let (key, value) = item.context("failed to retrieve orders from DB")?;

            let mut bytes = [0u8; 32];
            if key.len() != 32 {
                return Err(anyhow!("malformed order key of length {}", key.len()));
            }
            bytes.copy_from_slice(&key);

            let record: Record = deserialize(&value).context("failed to deserialize order")?;

            Ok((OrderId::from(bytes), record))
        })
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .context("failed to flush db")
    }
}

impl From<[u8; 32]> for OrderId {
    fn from(bytes: [u8; 32]) -> Self {
        // Round-trip through hex keeps OrderId's single constructor
        // surface small without exposing raw bytes publicly.
        hex::encode(bytes)
            .parse()
            .expect("32 bytes of hex always parse as an order id")
    }
}

fn wall_clock_now() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};

    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();

    #[allow(clippy::cast_possible_truncation)]
    Timestamp::from_millis(elapsed.as_millis() as u64)
}

pub fn serialize<T>(t: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    Ok(serde_cbor::to_vec(t)?)
}

pub fn deserialize<T>(v: &[u8]) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let value: serde_cbor::Value = serde_cbor::from_slice(v)?;

    if let serde_cbor::Value::Map(ref map) = value {
        let version_key = serde_cbor::Value::Text("schema_version".to_owned());
        if let Some(serde_cbor::Value::Integer(version)) = map.get(&version_key) {
            if *version > i128::from(SCHEMA_VERSION) {
                anyhow::bail!(
                    "record has schema version {} but this build only understands up to {}",
                    version,
                    SCHEMA_VERSION
                );
            }
        }
    }

    Ok(serde_cbor::value::from_value(value)?)
}
