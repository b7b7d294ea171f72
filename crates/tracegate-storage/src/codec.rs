//! Raw values as they come out of the indexer store
//!
//! Indexer deployments disagree on column types: hashes and addresses may be
//! `bytea` or hex text, amounts may be `numeric` or text, and trace addresses
//! may be native integer arrays or array literals. Rows are therefore decoded
//! into [`StoredValue`] and only normalized when rendered.

use alloy_primitives::{Address, B256};

/// A single column value decoded without assuming the column's type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StoredValue {
    #[default]
    Null,
    /// Binary column (`bytea`)
    Bytes(Vec<u8>),
    /// Integer column
    Int(i64),
    /// Textual column: hex, `\x` escaped binary, decimal numeral or array literal
    Text(String),
    /// Native integer array column
    IntArray(Vec<i64>),
}

impl From<Vec<u8>> for StoredValue {
    fn from(bytes: Vec<u8>) -> Self {
        StoredValue::Bytes(bytes)
    }
}

impl From<&[u8]> for StoredValue {
    fn from(bytes: &[u8]) -> Self {
        StoredValue::Bytes(bytes.to_vec())
    }
}

impl From<i64> for StoredValue {
    fn from(n: i64) -> Self {
        StoredValue::Int(n)
    }
}

impl From<&str> for StoredValue {
    fn from(s: &str) -> Self {
        StoredValue::Text(s.to_string())
    }
}

impl From<String> for StoredValue {
    fn from(s: String) -> Self {
        StoredValue::Text(s)
    }
}

impl From<Vec<i64>> for StoredValue {
    fn from(path: Vec<i64>) -> Self {
        StoredValue::IntArray(path)
    }
}

impl From<B256> for StoredValue {
    fn from(hash: B256) -> Self {
        StoredValue::Bytes(hash.as_slice().to_vec())
    }
}

impl From<Address> for StoredValue {
    fn from(address: Address) -> Self {
        StoredValue::Bytes(address.as_slice().to_vec())
    }
}

impl<T: Into<StoredValue>> From<Option<T>> for StoredValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(StoredValue::Null, Into::into)
    }
}

/// One indexed internal call joined with its parent transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRow {
    pub transaction_hash: StoredValue,
    pub block_hash: StoredValue,
    pub block_number: i64,
    pub transaction_position: i64,
    pub call_type: Option<String>,
    pub from_address: StoredValue,
    pub to_address: StoredValue,
    pub value: StoredValue,
    pub gas: StoredValue,
    pub gas_used: StoredValue,
    pub input: StoredValue,
    pub output: StoredValue,
    pub error: Option<String>,
    pub trace_address: StoredValue,
    pub trace_index: i64,
}

/// A transaction as recorded by the indexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredTransaction {
    /// `None` while the transaction is pending
    pub block_number: Option<u64>,
}

#[cfg(test)]
mod tests {
    use alloy_primitives::address;

    use super::*;

    #[test]
    fn test_option_conversion() {
        let none: Option<Address> = None;
        assert_eq!(StoredValue::from(none), StoredValue::Null);

        let addr = address!("0x00000000000000000000000000000000000000aa");
        assert_eq!(
            StoredValue::from(Some(addr)),
            StoredValue::Bytes(addr.as_slice().to_vec())
        );
    }
}
