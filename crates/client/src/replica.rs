// Local CRDT replica of one document.
//
// Wraps a yrs Doc holding a single text root. Every mutation is applied in a
// transaction tagged with its MutationOrigin, and the returned Mutation tells
// the caller whether it should be whispered and scheduled for save.

use draftsync_common::crdt::origin::MutationOrigin;
use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, Options, ReadTxn, StateVector, Text, Transact, Update};

/// Name of the shared text root edited by clients.
pub const CONTENT_ROOT: &str = "content";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReplicaError {
    #[error("failed to decode replica update: {0}")]
    Decode(String),
    #[error("failed to apply replica update: {0}")]
    Apply(String),
    #[error("text range {index}..{end} is outside a document of length {len}")]
    OutOfRange { index: u32, end: u32, len: u32 },
}

/// Outcome of applying one change to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mutation {
    pub origin: MutationOrigin,
    /// The whole replica was swapped for a restored state.
    pub replaced: bool,
}

impl Mutation {
    /// Whether the change should be whispered to peers and counted for autosave.
    pub fn propagates(&self) -> bool {
        self.origin.propagates()
    }
}

pub struct Replica {
    doc: Doc,
}

impl Replica {
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Replica with a fixed client id (deterministic tests).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Build a replica from a full encoded state. An empty state yields an empty replica.
    pub fn from_state(state: &[u8]) -> Result<Self, ReplicaError> {
        let replica = Self::new();
        if !state.is_empty() {
            replica.apply(state, MutationOrigin::Remote)?;
        }
        Ok(replica)
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    pub fn text(&self) -> String {
        let text = self.doc.get_or_insert_text(CONTENT_ROOT);
        text.get_string(&self.doc.transact())
    }

    pub fn len(&self) -> u32 {
        let text = self.doc.get_or_insert_text(CONTENT_ROOT);
        text.len(&self.doc.transact())
    }

    /// Full encoded state, suitable for a save or an `update` whisper.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn insert_text(&self, index: u32, chunk: &str) -> Result<Mutation, ReplicaError> {
        let text = self.doc.get_or_insert_text(CONTENT_ROOT);
        let mut txn = self.doc.transact_mut_with(origin_tag(MutationOrigin::Local));
        let len = text.len(&txn);
        if index > len {
            return Err(ReplicaError::OutOfRange { index, end: index, len });
        }
        text.insert(&mut txn, index, chunk);
        Ok(Mutation { origin: MutationOrigin::Local, replaced: false })
    }

    pub fn remove_text(&self, index: u32, count: u32) -> Result<Mutation, ReplicaError> {
        let text = self.doc.get_or_insert_text(CONTENT_ROOT);
        let mut txn = self.doc.transact_mut_with(origin_tag(MutationOrigin::Local));
        let len = text.len(&txn);
        let end = index.saturating_add(count);
        if end > len {
            return Err(ReplicaError::OutOfRange { index, end, len });
        }
        text.remove_range(&mut txn, index, count);
        Ok(Mutation { origin: MutationOrigin::Local, replaced: false })
    }

    /// Apply an update produced by a local editor binding.
    pub fn apply_local_update(&self, update: &[u8]) -> Result<Mutation, ReplicaError> {
        self.apply(update, MutationOrigin::Local)
    }

    /// Merge state received from a peer. Never re-broadcast.
    pub fn apply_remote(&self, update: &[u8]) -> Result<Mutation, ReplicaError> {
        self.apply(update, MutationOrigin::Remote)
    }

    /// Swap the whole replica for a fresh document built from `state`.
    ///
    /// Used for restores: merging a restored state into the current one would
    /// keep every edit made after the restored version.
    pub fn replace_with(&mut self, state: &[u8]) -> Result<Mutation, ReplicaError> {
        let options = Options { client_id: self.doc.client_id(), ..Default::default() };
        let fresh = Doc::with_options(options);
        if !state.is_empty() {
            let update = decode_update(state)?;
            fresh
                .transact_mut_with(origin_tag(MutationOrigin::Remote))
                .apply_update(update)
                .map_err(|error| ReplicaError::Apply(error.to_string()))?;
        }
        self.doc = fresh;
        Ok(Mutation { origin: MutationOrigin::Remote, replaced: true })
    }

    fn apply(&self, update: &[u8], origin: MutationOrigin) -> Result<Mutation, ReplicaError> {
        let update = decode_update(update)?;
        self.doc
            .transact_mut_with(origin_tag(origin))
            .apply_update(update)
            .map_err(|error| ReplicaError::Apply(error.to_string()))?;
        Ok(Mutation { origin, replaced: false })
    }
}

impl Default for Replica {
    fn default() -> Self {
        Self::new()
    }
}

fn origin_tag(origin: MutationOrigin) -> yrs::Origin {
    yrs::Origin::from([origin.to_byte()].as_slice())
}

fn decode_update(bytes: &[u8]) -> Result<Update, ReplicaError> {
    Update::decode_v1(bytes).map_err(|error| ReplicaError::Decode(error.to_string()))
}
