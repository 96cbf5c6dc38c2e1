//! The value nodes agree on for each ledger.

use std::fmt;

use lumen_common::Hash256;
use lumen_scp::Value;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Payload externalized by SCP: which transaction set closes the next
/// ledger, at what time and with what base fee.
///
/// SCP itself only sees the opaque encoding produced by
/// [`ConsensusValue::to_value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsensusValue {
    pub tx_set_hash: Hash256,
    pub close_time: u64,
    pub base_fee: u64,
}

impl ConsensusValue {
    pub fn new(tx_set_hash: Hash256, close_time: u64, base_fee: u64) -> Self {
        Self {
            tx_set_hash,
            close_time,
            base_fee,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let bytes = bincode::serialize(self).map_err(lumen_common::Error::from)?;
        Ok(Value::new(bytes))
    }

    /// Decode a value seen on the wire. Trailing bytes are rejected.
    pub fn from_value(value: &Value) -> Result<Self> {
        let decoded: Self =
            bincode::deserialize(value.as_bytes()).map_err(lumen_common::Error::from)?;
        let canonical = bincode::serialized_size(&decoded).map_err(lumen_common::Error::from)?;
        if canonical != value.as_bytes().len() as u64 {
            return Err(lumen_common::Error::InvalidData(format!(
                "{} trailing bytes after consensus value",
                value.as_bytes().len() as u64 - canonical
            ))
            .into());
        }
        Ok(decoded)
    }
}

impl fmt::Display for ConsensusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[txset {} close {} fee {}]",
            self.tx_set_hash.short(),
            self.close_time,
            self.base_fee
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_encoding_is_canonical() {
        let value = ConsensusValue::new(Hash256::hash(b"set"), 1_000, 100);
        let encoded = value.to_value().unwrap();
        assert_eq!(ConsensusValue::from_value(&encoded).unwrap(), value);

        let mut padded = encoded.as_bytes().to_vec();
        padded.push(0);
        assert!(ConsensusValue::from_value(&Value::new(padded)).is_err());
        assert!(ConsensusValue::from_value(&Value::new(b"junk".to_vec())).is_err());
    }
}
