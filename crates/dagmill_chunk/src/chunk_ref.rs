// Copyright (c) the Dagmill Project Authors.
// Licensed under the MIT License.

use std::fmt;

use crate::OsProc;

/// An opaque handle to a datum residing on a specific worker.
///
/// The handle is all the scheduler ever holds of an intermediate result; the
/// datum itself stays in the owning worker's store until every consumer has
/// finished with it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChunkRef {
    id: u64,
    owner: OsProc,
}

impl ChunkRef {
    /// Creates a handle. Store implementations call this when admitting a
    /// datum; everyone else treats handles as opaque.
    #[must_use]
    pub const fn new(id: u64, owner: OsProc) -> Self {
        Self { id, owner }
    }

    /// The store-assigned chunk id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// The worker process holding the datum.
    #[must_use]
    pub const fn owner(&self) -> OsProc {
        self.owner
    }
}

impl fmt::Display for ChunkRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chunk:{}@{}", self.id, self.owner)
    }
}
