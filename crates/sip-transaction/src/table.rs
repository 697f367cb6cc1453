// siphon-rs - The Siphon SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::HashMap;

use crate::transaction::Transaction;
use crate::TransactionId;

/// Transactions keyed by id.
///
/// A CANCEL server transaction linked to an INVITE server transaction lives
/// inside its parent; `cancel_index` maps the CANCEL's own id to the parent
/// so lookups by either id succeed.
#[derive(Debug, Default)]
pub struct TransactionTable {
    entries: HashMap<TransactionId, Transaction>,
    cancel_index: HashMap<TransactionId, TransactionId>,
    servers: usize,
    clients: usize,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live transactions, linked CANCELs included.
    pub fn len(&self) -> usize {
        self.servers + self.clients
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn server_count(&self) -> usize {
        self.servers
    }

    pub fn client_count(&self) -> usize {
        self.clients
    }

    pub fn contains(&self, id: &TransactionId) -> bool {
        self.entries.contains_key(id) || self.cancel_index.contains_key(id)
    }

    /// True only for top-level entries (not linked CANCELs).
    pub fn contains_entry(&self, id: &TransactionId) -> bool {
        self.entries.contains_key(id)
    }

    /// Inserts a standalone transaction, replacing any entry with the same id.
    pub fn insert(&mut self, transaction: Transaction) {
        let id = transaction.id().clone();
        self.count(&id, 1);
        if let Some(previous) = self.entries.insert(id, transaction) {
            self.count(previous.id(), -1);
        }
    }

    /// Links a CANCEL transaction to its INVITE server transaction.
    ///
    /// Returns the child back when the parent does not exist.
    pub fn attach_cancel(
        &mut self,
        parent: &TransactionId,
        child: Transaction,
    ) -> Result<(), Transaction> {
        let Some(entry) = self.entries.get_mut(parent) else {
            return Err(child);
        };
        if let Some(old) = entry.take_linked_cancel() {
            self.cancel_index.remove(old.id());
            self.servers -= 1;
        }
        self.cancel_index.insert(child.id().clone(), parent.clone());
        self.servers += 1;
        entry.attach_cancel(child);
        Ok(())
    }

    pub fn get(&self, id: &TransactionId) -> Option<&Transaction> {
        if let Some(tx) = self.entries.get(id) {
            return Some(tx);
        }
        let parent = self.cancel_index.get(id)?;
        self.entries
            .get(parent)?
            .linked_cancel()
            .filter(|child| child.id() == id)
    }

    pub fn get_mut(&mut self, id: &TransactionId) -> Option<&mut Transaction> {
        if self.entries.contains_key(id) {
            return self.entries.get_mut(id);
        }
        let parent = self.cancel_index.get(id)?;
        self.entries
            .get_mut(parent)?
            .linked_cancel_mut()
            .filter(|child| child.id() == id)
    }

    /// Removes a transaction by id.
    ///
    /// Removing an INVITE server transaction whose linked CANCEL is still
    /// running re-homes the CANCEL as a standalone entry.
    pub fn remove(&mut self, id: &TransactionId) -> Option<Transaction> {
        if let Some(mut tx) = self.entries.remove(id) {
            self.count(id, -1);
            if let Some(child) = tx.take_linked_cancel() {
                self.cancel_index.remove(child.id());
                if child.is_terminated() {
                    self.servers -= 1;
                } else {
                    self.entries.insert(child.id().clone(), child);
                }
            }
            return Some(tx);
        }

        let parent = self.cancel_index.remove(id)?;
        let child = self.entries.get_mut(&parent)?.take_linked_cancel()?;
        self.servers -= 1;
        Some(child)
    }

    fn count(&mut self, id: &TransactionId, delta: isize) {
        let counter = if id.is_server {
            &mut self.servers
        } else {
            &mut self.clients
        };
        *counter = counter.saturating_add_signed(delta);
    }
}
