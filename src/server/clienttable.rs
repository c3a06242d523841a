//! Client response table with one-slot undo.

use std::collections::HashMap;

use crate::server::{CommandResult, OpRecord, RequestNum};
use crate::client::ClientId;

use serde::{Serialize, Deserialize};

/// Most recent response recorded for a client. `result` stays `None` while
/// the request is in flight (provisional entry).
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Response {
    pub view: u64,
    pub req_num: RequestNum,
    pub result: Option<CommandResult>,
}

/// Map from client ID to the latest response delivered to (or being prepared
/// for) that client.
#[derive(Debug, Default)]
pub struct ClientTable {
    /// Current entries.
    entries: HashMap<ClientId, Response>,

    /// Value held before the most recent `set()`, per client. An inner `None`
    /// means the client had no entry before.
    undo_buf: HashMap<ClientId, Option<Response>>,
}

impl ClientTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        ClientTable {
            entries: HashMap::new(),
            undo_buf: HashMap::new(),
        }
    }

    /// Gets the stored response for a client.
    #[inline]
    pub fn get(&self, client: ClientId) -> Option<&Response> {
        self.entries.get(&client)
    }

    /// Stores a response, saving the previous value into the undo slot.
    pub fn set(&mut self, client: ClientId, resp: Response) {
        let prev = self.entries.insert(client, resp);
        self.undo_buf.insert(client, prev);
    }

    /// Restores the value held before the last `set()` for this client, or
    /// its absence if nothing was buffered.
    pub fn undo(&mut self, client: ClientId) {
        match self.undo_buf.remove(&client).flatten() {
            Some(prev) => {
                self.entries.insert(client, prev);
            }
            None => {
                self.entries.remove(&client);
            }
        }
    }

    /// Returns true if a request with this number has already been seen from
    /// the client.
    #[inline]
    pub fn is_duplicate(&self, client: ClientId, req_num: RequestNum) -> bool {
        self.entries
            .get(&client)
            .is_some_and(|resp| resp.req_num >= req_num)
    }

    /// Fills in the execution result if the client's entry still refers to
    /// the given request.
    pub fn fill_result(
        &mut self,
        client: ClientId,
        req_num: RequestNum,
        result: CommandResult,
    ) {
        if let Some(resp) = self.entries.get_mut(&client) {
            if resp.req_num == req_num {
                resp.result = Some(result);
            }
        }
    }

    /// Adds provisional entries for every record newer than what the table
    /// holds. Used after adopting a log wholesale; drops all undo slots.
    pub fn rebuild_from(&mut self, records: &[OpRecord], view: u64) {
        self.undo_buf.clear();
        for rec in records {
            let client = rec.request.client;
            let req_num = rec.request.req_num;
            if !self.is_duplicate(client, req_num) {
                self.entries.insert(
                    client,
                    Response {
                        view,
                        req_num,
                        result: None,
                    },
                );
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
