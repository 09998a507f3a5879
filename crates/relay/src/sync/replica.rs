// Server-side replica of one collaborative document, backed by yrs.
//
// Merge is delegated entirely to the CRDT: applying the same set of updates
// in any order, any number of times, yields the same state.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Transact, Update};

/// Shared text type the REST layer reads as the plaintext body.
pub const CONTENT_TEXT: &str = "content";

#[derive(Debug, thiserror::Error)]
pub enum ReplicaError {
    #[error("failed to decode update: {0}")]
    Decode(String),
    #[error("failed to integrate update: {0}")]
    Integrate(String),
    #[error("failed to decode state vector: {0}")]
    StateVector(String),
}

/// Whether an integrated update changed the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeEffect {
    Changed,
    Unchanged,
}

pub struct ReplicaDoc {
    doc: Doc,
}

impl ReplicaDoc {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Rebuilds a replica from a persisted full-state snapshot.
    pub fn from_snapshot(payload: &[u8]) -> Result<Self, ReplicaError> {
        let replica = Self::new();
        let update = decode_update(payload)?;
        replica.integrate(update)?;
        Ok(replica)
    }

    /// Merges an already decoded update and reports whether the state
    /// vector or the delete set moved. Updates whose causal dependencies
    /// are still missing are buffered by yrs and report `Unchanged` until
    /// the gap is filled.
    pub fn integrate(&self, update: Update) -> Result<MergeEffect, ReplicaError> {
        let before = self.fingerprint();
        self.doc
            .transact_mut()
            .apply_update(update)
            .map_err(|error| ReplicaError::Integrate(error.to_string()))?;

        if self.fingerprint() == before {
            Ok(MergeEffect::Unchanged)
        } else {
            Ok(MergeEffect::Changed)
        }
    }

    pub fn apply_update(&self, payload: &[u8]) -> Result<MergeEffect, ReplicaError> {
        self.integrate(decode_update(payload)?)
    }

    pub fn full_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Minimal update a peer holding `remote_state_vector` is missing.
    pub fn diff_since(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let remote = StateVector::decode_v1(remote_state_vector)
            .map_err(|error| ReplicaError::StateVector(error.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    pub fn text_projection(&self, name: &str) -> String {
        let text = self.doc.get_or_insert_text(name);
        text.get_string(&self.doc.transact())
    }

    /// State vector plus delete set; equal fingerprints mean equal state.
    fn fingerprint(&self) -> (Vec<u8>, Vec<u8>) {
        let txn = self.doc.transact();
        let state_vector = txn.state_vector();
        let delete_set = txn.encode_state_as_update_v1(&state_vector);
        (state_vector.encode_v1(), delete_set)
    }

    #[cfg(test)]
    pub(crate) fn insert_text(&self, name: &str, index: u32, content: &str) {
        use yrs::Text;
        let text = self.doc.get_or_insert_text(name);
        let mut txn = self.doc.transact_mut();
        text.insert(&mut txn, index, content);
    }

    #[cfg(test)]
    pub(crate) fn remove_text(&self, name: &str, index: u32, len: u32) {
        use yrs::Text;
        let text = self.doc.get_or_insert_text(name);
        let mut txn = self.doc.transact_mut();
        text.remove_range(&mut txn, index, len);
    }

    #[cfg(test)]
    pub(crate) fn text_len(&self, name: &str) -> u32 {
        use yrs::Text;
        let text = self.doc.get_or_insert_text(name);
        text.len(&self.doc.transact())
    }
}

impl Default for ReplicaDoc {
    fn default() -> Self {
        Self::new()
    }
}

pub fn decode_update(payload: &[u8]) -> Result<Update, ReplicaError> {
    Update::decode_v1(payload).map_err(|error| ReplicaError::Decode(error.to_string()))
}
