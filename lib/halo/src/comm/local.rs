// SPDX-FileCopyrightText: Copyright (c) 2025-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-process communicator.
//!
//! A [`LocalWorld`] connects a fixed number of ranks living in the same process,
//! typically one per thread. Sends are eager: starting a send snapshots the
//! host buffer into the world's mailbox for `(source, destination, tag)`, so the
//! send buffer is free again as soon as `start` returns. Receives complete when
//! a matching message is found by `test` or `wait`. Messages between the same
//! pair of ranks with the same tag are delivered in the order they were sent.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use super::{Communicator, PersistentRequest, RequestHandle, RequestState, Tag, TransferKind};
use crate::device::HostStorage;
use crate::error::{HaloError, Result};

/// (source rank, destination rank, tag)
type Route = (usize, usize, Tag);

#[derive(Default)]
struct Mailboxes {
    slots: Mutex<HashMap<Route, VecDeque<Bytes>>>,
    delivered: Condvar,
}

impl Mailboxes {
    fn post(&self, route: Route, payload: Bytes) {
        self.slots.lock().entry(route).or_default().push_back(payload);
        self.delivered.notify_all();
    }

    fn take(&self, route: Route) -> Option<Bytes> {
        self.slots
            .lock()
            .get_mut(&route)
            .and_then(VecDeque::pop_front)
    }

    /// Block until `route` holds at least one message, without taking it.
    fn wait_posted(&self, route: Route) {
        let mut slots = self.slots.lock();
        while !slots.get(&route).is_some_and(|queue| !queue.is_empty()) {
            self.delivered.wait(&mut slots);
        }
    }

    fn in_transit(&self) -> usize {
        self.slots.lock().values().map(VecDeque::len).sum()
    }
}

/// A set of in-process ranks sharing one set of mailboxes.
#[derive(Clone)]
pub struct LocalWorld {
    size: usize,
    mailboxes: Arc<Mailboxes>,
}

impl LocalWorld {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            mailboxes: Arc::new(Mailboxes::default()),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn communicator(&self, rank: usize) -> Result<LocalCommunicator> {
        if rank >= self.size {
            return Err(HaloError::InvalidPeer {
                peer: rank,
                world_size: self.size,
            });
        }
        Ok(LocalCommunicator {
            rank,
            size: self.size,
            mailboxes: self.mailboxes.clone(),
        })
    }

    /// One communicator per rank, in rank order.
    pub fn communicators(&self) -> Vec<LocalCommunicator> {
        (0..self.size)
            .map(|rank| LocalCommunicator {
                rank,
                size: self.size,
                mailboxes: self.mailboxes.clone(),
            })
            .collect()
    }

    /// Messages sent but not yet matched by a receive.
    pub fn in_transit(&self) -> usize {
        self.mailboxes.in_transit()
    }
}

impl fmt::Debug for LocalWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalWorld")
            .field("size", &self.size)
            .field("in_transit", &self.in_transit())
            .finish()
    }
}

/// One rank's endpoint in a [`LocalWorld`].
#[derive(Clone)]
pub struct LocalCommunicator {
    rank: usize,
    size: usize,
    mailboxes: Arc<Mailboxes>,
}

impl LocalCommunicator {
    fn init(
        &self,
        kind: TransferKind,
        buffer: Arc<dyn HostStorage>,
        peer: usize,
        tag: Tag,
    ) -> Result<RequestHandle> {
        if peer >= self.size {
            return Err(HaloError::InvalidPeer {
                peer,
                world_size: self.size,
            });
        }

        tracing::debug!(
            rank = self.rank,
            peer,
            tag,
            %kind,
            bytes = buffer.size(),
            "created persistent request"
        );

        Ok(Arc::new(LocalRequest {
            kind,
            rank: self.rank,
            peer,
            tag,
            buffer,
            mailboxes: self.mailboxes.clone(),
            state: Mutex::new(RequestState::Created),
        }))
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.size
    }

    fn send_init(
        &self,
        buffer: Arc<dyn HostStorage>,
        peer: usize,
        tag: Tag,
    ) -> Result<RequestHandle> {
        self.init(TransferKind::Send, buffer, peer, tag)
    }

    fn recv_init(
        &self,
        buffer: Arc<dyn HostStorage>,
        peer: usize,
        tag: Tag,
    ) -> Result<RequestHandle> {
        self.init(TransferKind::Recv, buffer, peer, tag)
    }
}

impl fmt::Debug for LocalCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCommunicator")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

struct LocalRequest {
    kind: TransferKind,
    rank: usize,
    peer: usize,
    tag: Tag,
    buffer: Arc<dyn HostStorage>,
    mailboxes: Arc<Mailboxes>,
    state: Mutex<RequestState>,
}

impl LocalRequest {
    fn outgoing(&self) -> Route {
        (self.rank, self.peer, self.tag)
    }

    fn incoming(&self) -> Route {
        (self.peer, self.rank, self.tag)
    }

    fn deliver(&self, payload: Bytes) -> Result<()> {
        if payload.len() != self.buffer.size() {
            return Err(HaloError::Transport {
                peer: self.peer,
                tag: self.tag,
                reason: format!(
                    "message of {} bytes does not match receive buffer of {} bytes",
                    payload.len(),
                    self.buffer.size()
                ),
            });
        }
        self.buffer.write_from(&payload)
    }

    /// Complete the current round if its message is available.
    fn try_complete(&self, state: &mut RequestState) -> Result<bool> {
        if state.is_inactive() {
            return Ok(true);
        }

        match self.kind {
            TransferKind::Send => {
                *state = RequestState::Completed;
                Ok(true)
            }
            TransferKind::Recv => match self.mailboxes.take(self.incoming()) {
                Some(payload) => {
                    *state = RequestState::Completed;
                    self.deliver(payload).map(|()| true)
                }
                None => Ok(false),
            },
        }
    }
}

impl PersistentRequest for LocalRequest {
    fn kind(&self) -> TransferKind {
        self.kind
    }

    fn peer(&self) -> usize {
        self.peer
    }

    fn tag(&self) -> Tag {
        self.tag
    }

    fn state(&self) -> RequestState {
        *self.state.lock()
    }

    fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.is_inactive() {
            tracing::warn!(
                rank = self.rank,
                peer = self.peer,
                tag = self.tag,
                kind = %self.kind,
                state = ?*state,
                "start on an active persistent request"
            );
            return Err(HaloError::RequestActive {
                peer: self.peer,
                tag: self.tag,
            });
        }

        let payload = match self.kind {
            TransferKind::Send => {
                let mut payload = vec![0u8; self.buffer.size()];
                self.buffer.read_into(&mut payload)?;
                Some(Bytes::from(payload))
            }
            TransferKind::Recv => None,
        };

        // The transfer is issued here, so the request never rests in `Started`.
        if let Some(payload) = payload {
            self.mailboxes.post(self.outgoing(), payload);
        }
        *state = RequestState::InFlight;

        tracing::trace!(
            rank = self.rank,
            peer = self.peer,
            tag = self.tag,
            kind = %self.kind,
            "started persistent request"
        );
        Ok(())
    }

    fn test(&self) -> Result<bool> {
        self.try_complete(&mut self.state.lock())
    }

    fn wait(&self) -> Result<()> {
        loop {
            let done = self.try_complete(&mut self.state.lock())?;
            if done {
                return Ok(());
            }
            // Parked without the state lock; a concurrent `test` may complete
            // the round first, which the next pass observes as inactive.
            self.mailboxes.wait_posted(self.incoming());
        }
    }
}

impl fmt::Debug for LocalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRequest")
            .field("kind", &self.kind)
            .field("rank", &self.rank)
            .field("peer", &self.peer)
            .field("tag", &self.tag)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::device::{Device, HostDevice};

    fn mirror(device: &HostDevice, data: &[u8]) -> Arc<dyn HostStorage> {
        let buffer = device.alloc_host(data.len()).unwrap();
        buffer.write_from(data).unwrap();
        buffer
    }

    fn contents(buffer: &Arc<dyn HostStorage>) -> Vec<u8> {
        let mut out = vec![0u8; buffer.size()];
        buffer.read_into(&mut out).unwrap();
        out
    }

    #[test]
    fn test_state_machine() {
        let device = HostDevice::new();
        let world = LocalWorld::new(2);
        let comms = world.communicators();

        let send = comms[0]
            .send_init(mirror(&device, &[1, 2, 3]), 1, 7)
            .unwrap();
        let recv_buf = mirror(&device, &[0, 0, 0]);
        let recv = comms[1].recv_init(recv_buf.clone(), 0, 7).unwrap();

        assert_eq!(send.state(), RequestState::Created);
        assert_eq!(recv.state(), RequestState::Created);
        assert!(recv.test().unwrap(), "inactive request tests complete");

        recv.start().unwrap();
        assert_eq!(recv.state(), RequestState::InFlight);
        assert!(!recv.test().unwrap());

        send.start().unwrap();
        assert_eq!(send.state(), RequestState::InFlight);
        send.wait().unwrap();
        assert_eq!(send.state(), RequestState::Completed);

        recv.wait().unwrap();
        assert_eq!(recv.state(), RequestState::Completed);
        assert_eq!(contents(&recv_buf), vec![1, 2, 3]);
    }

    #[test]
    fn test_restart_while_active_is_rejected() {
        let device = HostDevice::new();
        let world = LocalWorld::new(2);
        let recv = world
            .communicator(1)
            .unwrap()
            .recv_init(mirror(&device, &[0; 4]), 0, 1)
            .unwrap();

        recv.start().unwrap();
        let err = recv.start().unwrap_err();
        assert!(matches!(err, HaloError::RequestActive { peer: 0, tag: 1 }));
        assert_eq!(err.kind(), crate::ErrorKind::Usage);
    }

    #[test]
    fn test_send_snapshots_buffer_at_start() {
        let device = HostDevice::new();
        let world = LocalWorld::new(2);
        let comms = world.communicators();

        let src = mirror(&device, &[5, 5]);
        let dst = mirror(&device, &[0, 0]);
        let send = comms[0].send_init(src.clone(), 1, 0).unwrap();
        let recv = comms[1].recv_init(dst.clone(), 0, 0).unwrap();

        send.start().unwrap();
        src.write_from(&[9, 9]).unwrap();
        send.wait().unwrap();

        recv.start().unwrap();
        recv.wait().unwrap();
        assert_eq!(contents(&dst), vec![5, 5]);
    }

    #[test]
    fn test_tags_are_matched_independently() {
        let device = HostDevice::new();
        let world = LocalWorld::new(2);
        let comms = world.communicators();

        let a = comms[0].send_init(mirror(&device, &[1]), 1, 10).unwrap();
        let b = comms[0].send_init(mirror(&device, &[2]), 1, 20).unwrap();
        let rb_buf = mirror(&device, &[0]);
        let rb = comms[1].recv_init(rb_buf.clone(), 0, 20).unwrap();

        a.start().unwrap();
        b.start().unwrap();
        assert_eq!(world.in_transit(), 2);

        rb.start().unwrap();
        rb.wait().unwrap();
        assert_eq!(contents(&rb_buf), vec![2]);
        assert_eq!(world.in_transit(), 1);
    }

    #[test]
    fn test_size_mismatch_is_transport_error() {
        let device = HostDevice::new();
        let world = LocalWorld::new(2);
        let comms = world.communicators();

        let send = comms[0].send_init(mirror(&device, &[1, 2, 3, 4]), 1, 3).unwrap();
        let recv = comms[1].recv_init(mirror(&device, &[0, 0]), 0, 3).unwrap();

        send.start().unwrap();
        recv.start().unwrap();
        let err = recv.wait().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Transport);
        // the failed round is over; the handle can be started again
        assert_eq!(recv.state(), RequestState::Completed);
    }

    #[test]
    fn test_invalid_peer_rejected_at_init() {
        let device = HostDevice::new();
        let world = LocalWorld::new(2);
        let err = world
            .communicator(0)
            .unwrap()
            .send_init(mirror(&device, &[0]), 2, 0)
            .unwrap_err();
        assert!(matches!(
            err,
            HaloError::InvalidPeer {
                peer: 2,
                world_size: 2
            }
        ));
        assert!(world.communicator(5).is_err());
    }

    #[test]
    fn test_wait_blocks_until_message_arrives() {
        let device = HostDevice::new();
        let world = LocalWorld::new(2);
        let comms = world.communicators();

        let dst = mirror(&device, &[0; 8]);
        let recv = comms[1].recv_init(dst.clone(), 0, 4).unwrap();
        recv.start().unwrap();

        let sender = comms[0].clone();
        let src = mirror(&device, &[3; 8]);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            let send = sender.send_init(src, 1, 4).unwrap();
            send.start().unwrap();
            send.wait().unwrap();
        });

        recv.wait().unwrap();
        handle.join().unwrap();
        assert_eq!(contents(&dst), vec![3; 8]);
    }

    #[test]
    fn test_handle_stays_responsive_during_wait() {
        let device = HostDevice::new();
        let world = LocalWorld::new(2);
        let comms = world.communicators();

        let dst = mirror(&device, &[0; 4]);
        let recv = comms[1].recv_init(dst.clone(), 0, 9).unwrap();
        recv.start().unwrap();

        let waiter = {
            let recv = recv.clone();
            std::thread::spawn(move || recv.wait())
        };
        std::thread::sleep(Duration::from_millis(20));

        let (tx, rx) = std::sync::mpsc::channel();
        let poller = {
            let recv = recv.clone();
            std::thread::spawn(move || {
                let tested = recv.test();
                let restarted = recv.start();
                let _ = tx.send((tested, restarted, recv.state()));
            })
        };
        let (tested, restarted, state) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("test() blocked behind a concurrent wait()");
        poller.join().unwrap();

        assert!(!tested.unwrap());
        assert!(matches!(restarted, Err(HaloError::RequestActive { .. })));
        assert_eq!(state, RequestState::InFlight);

        let send = comms[0].send_init(mirror(&device, &[6; 4]), 1, 9).unwrap();
        send.start().unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(recv.state(), RequestState::Completed);
        assert_eq!(contents(&dst), vec![6; 4]);
    }

    #[test]
    fn test_wait_returns_when_test_completes_the_round() {
        let device = HostDevice::new();
        let world = LocalWorld::new(2);
        let comms = world.communicators();

        let dst = mirror(&device, &[0; 2]);
        let recv = comms[1].recv_init(dst.clone(), 0, 5).unwrap();
        recv.start().unwrap();

        let waiter = {
            let recv = recv.clone();
            std::thread::spawn(move || recv.wait())
        };

        let send = comms[0].send_init(mirror(&device, &[4, 2]), 1, 5).unwrap();
        send.start().unwrap();
        while !recv.test().unwrap() {
            std::thread::yield_now();
        }

        waiter.join().unwrap().unwrap();
        assert_eq!(contents(&dst), vec![4, 2]);
        assert_eq!(world.in_transit(), 0);
    }
}
