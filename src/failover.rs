//! Per-partition failover table.
//!
//! An ordered list of (uuid, seqno) history branches, newest first. The
//! consumer resumes from the latest branch and installs a wholesale
//! replacement when the producer accepts a stream.

use crate::wire::{self, WireError};

/// One branch of a partition's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverEntry {
    pub uuid: u64,
    pub seqno: u64,
}

/// Ordered failover history for one partition, newest entry first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailoverTable {
    entries: Vec<FailoverEntry>,
}

impl FailoverTable {
    /// A fresh table with a single genesis branch.
    pub fn new(uuid: u64) -> Self {
        Self {
            entries: vec![FailoverEntry { uuid, seqno: 0 }],
        }
    }

    pub fn latest_entry(&self) -> FailoverEntry {
        self.entries[0]
    }

    pub fn entries(&self) -> &[FailoverEntry] {
        &self.entries
    }

    /// Replace the whole table with the log from a stream-request response
    /// body.
    pub fn replace_from_wire(&mut self, body: &[u8]) -> Result<(), WireError> {
        self.entries = wire::parse_failover_log(body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_table_has_genesis_branch() {
        let table = FailoverTable::new(7);
        assert_eq!(table.latest_entry(), FailoverEntry { uuid: 7, seqno: 0 });
        assert_eq!(table.entries().len(), 1);
    }

    #[test]
    fn replace_installs_wire_body() {
        let mut table = FailoverTable::new(1);
        let mut body = Vec::new();
        body.extend_from_slice(&9u64.to_be_bytes());
        body.extend_from_slice(&100u64.to_be_bytes());
        body.extend_from_slice(&8u64.to_be_bytes());
        body.extend_from_slice(&0u64.to_be_bytes());

        table.replace_from_wire(&body).expect("replace");
        assert_eq!(table.entries().len(), 2);
        assert_eq!(table.latest_entry(), FailoverEntry { uuid: 9, seqno: 100 });
    }

    #[test]
    fn replace_rejects_bad_body_and_keeps_table() {
        let mut table = FailoverTable::new(3);
        assert!(table.replace_from_wire(&[0u8; 5]).is_err());
        assert_eq!(table.latest_entry().uuid, 3);
    }
}
