// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Network binding.
//!
//! Transfers are persistent point-to-point requests: created once per
//! (buffer, peer, tag) triple, then started once per exchange round. This layer
//! only creates and starts them; testing and waiting belong to whoever drains
//! the pending-request queue.
//!
//! Each request follows
//!
//! ```text
//! Created ──start──▶ Started ──▶ InFlight ──test/wait──▶ Completed
//!                       ▲                                    │
//!                       └───────────────start────────────────┘
//! ```
//!
//! `Created` is never re-entered once the first `start` happened. `test` and
//! `wait` may be called from any thread while another thread waits on the same
//! request; only `wait` ever blocks.

mod local;

pub use local::{LocalCommunicator, LocalWorld};

use std::fmt;
use std::sync::Arc;

use crate::device::HostStorage;
use crate::error::Result;

/// Message tag.
pub type Tag = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Send,
    Recv,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Send => f.write_str("send"),
            TransferKind::Recv => f.write_str("recv"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    /// `start` was called but the transfer is not issued yet. Bindings that
    /// issue the transfer inside `start` go straight to `InFlight`, so this
    /// state is only observable with a binding that defers issuing.
    Started,
    InFlight,
    Completed,
}

impl RequestState {
    /// Whether the request may be started again.
    pub fn is_inactive(self) -> bool {
        matches!(self, RequestState::Created | RequestState::Completed)
    }
}

/// A persistent point-to-point request bound to one host buffer.
pub trait PersistentRequest: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransferKind;

    fn peer(&self) -> usize;

    fn tag(&self) -> Tag;

    fn state(&self) -> RequestState;

    /// Issue this round's non-blocking transfer.
    ///
    /// Fails with a usage error if the previous round has not been observed
    /// complete yet.
    fn start(&self) -> Result<()>;

    /// Non-blocking completion check. An inactive request reports complete.
    ///
    /// A transfer that finished with an error status is reported here, once.
    fn test(&self) -> Result<bool>;

    /// Block until the current round completes. Returns immediately for an
    /// inactive request.
    fn wait(&self) -> Result<()>;
}

pub type RequestHandle = Arc<dyn PersistentRequest>;

/// Factory for persistent requests.
///
/// Implementations are passed explicitly to whoever creates requests; nothing
/// in this crate reaches for a process-wide communicator.
pub trait Communicator: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Create a persistent send of `buffer` to `peer`.
    fn send_init(
        &self,
        buffer: Arc<dyn HostStorage>,
        peer: usize,
        tag: Tag,
    ) -> Result<RequestHandle>;

    /// Create a persistent receive into `buffer` from `peer`.
    fn recv_init(
        &self,
        buffer: Arc<dyn HostStorage>,
        peer: usize,
        tag: Tag,
    ) -> Result<RequestHandle>;
}

/// Create a request of the given kind with the matching factory.
pub fn request_init(
    comm: &dyn Communicator,
    kind: TransferKind,
    buffer: Arc<dyn HostStorage>,
    peer: usize,
    tag: Tag,
) -> Result<RequestHandle> {
    match kind {
        TransferKind::Send => comm.send_init(buffer, peer, tag),
        TransferKind::Recv => comm.recv_init(buffer, peer, tag),
    }
}
