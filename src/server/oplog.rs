//! In-memory operation log.

use crate::utils::ViewstampError;
use crate::server::Command;
use crate::client::ClientId;

use serde::{Serialize, Deserialize};

/// Operation (op) number type, the position of a record in the log.
pub type OpNum = u64;

/// Client request number type, increasing per client.
pub type RequestNum = u64;

/// A client request as carried through the log and Prepare messages.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Command to be replicated and executed.
    pub cmd: Command,

    /// Issuing client's ID.
    pub client: ClientId,

    /// Client-assigned request number.
    pub req_num: RequestNum,
}

/// Log record: a request paired with its assigned op number.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct OpRecord {
    pub request: Request,
    pub op_num: OpNum,
}

/// Append-only (modulo single-step undo) sequence of op records. Record at
/// position `i` always carries op number `i + 1`.
#[derive(Debug, Default, Clone)]
pub struct OpLog {
    records: Vec<OpRecord>,
}

impl OpLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        OpLog { records: vec![] }
    }

    /// Appends a request at the given op number, which must be exactly one
    /// past the current last op number.
    pub fn append(
        &mut self,
        request: Request,
        op_num: OpNum,
    ) -> Result<(), ViewstampError> {
        let expected = self.last_op() + 1;
        if op_num != expected {
            return Err(ViewstampError::msg(format!(
                "out-of-order append: expected op {}, got {}",
                expected, op_num
            )));
        }
        self.records.push(OpRecord { request, op_num });
        Ok(())
    }

    /// Returns the last request and its op number.
    pub fn read_last(&self) -> Result<(&Request, OpNum), ViewstampError> {
        match self.records.last() {
            Some(rec) => Ok((&rec.request, rec.op_num)),
            None => Err(ViewstampError::EmptyLog),
        }
    }

    /// Removes the most recently appended record and returns it.
    pub fn undo_last(&mut self) -> Result<OpRecord, ViewstampError> {
        self.records.pop().ok_or(ViewstampError::EmptyLog)
    }

    /// Adopts an externally supplied record sequence verbatim. The sequence
    /// must itself satisfy the position/op number invariant.
    pub fn replace(
        &mut self,
        records: Vec<OpRecord>,
    ) -> Result<(), ViewstampError> {
        if let Some((idx, rec)) = records
            .iter()
            .enumerate()
            .find(|(idx, rec)| rec.op_num != *idx as OpNum + 1)
        {
            return Err(ViewstampError::msg(format!(
                "gap in adopted log at position {}: op {}",
                idx, rec.op_num
            )));
        }
        self.records = records;
        Ok(())
    }

    /// Op number of the last record, or 0 if the log is empty.
    #[inline]
    pub fn last_op(&self) -> OpNum {
        self.records.last().map_or(0, |rec| rec.op_num)
    }

    /// Returns the record at given op number, if present.
    #[inline]
    pub fn get(&self, op_num: OpNum) -> Option<&OpRecord> {
        if op_num == 0 {
            return None;
        }
        self.records.get((op_num - 1) as usize)
    }

    /// Returns all records.
    #[inline]
    pub fn records(&self) -> &[OpRecord] {
        &self.records
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
