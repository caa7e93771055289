// Copyright (C) 2019-2021  Pierre Krieger
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The virtualizer itself: request routing between clients and the driver.
//!
//! One [`Virtualizer`] owns the driver side of the storage conversation
//! (its queue pair and notification channel), one queue pair per client,
//! the staging [`BufferPool`], the [`Ledger`] of in-flight requests, and
//! the partition assigned to each client. It is driven entirely from the
//! outside: the environment calls [`Virtualizer::notified`] whenever the
//! driver or a client raises a notification, and everything else follows
//! from there on the caller's thread.

use alloc::vec::Vec;
use core::convert::TryFrom;

use lodestone_block_interface::{
    Operation, QueueHandle, Request, RespDescriptor, Response, Status, StorageInfo,
    StorageInfoCell,
};
use smallvec::SmallVec;

use crate::buffer_pool::BufferPool;
use crate::ledger::{Ledger, RequestContext, RequestId};
use crate::mbr;
use crate::platform::{Channel, ClientAddr, ClientId, DriverAddr, Platform};


/// Which counterpart raised the notification being delivered to
/// [`Virtualizer::notified`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    /// The driver signalled its response ring.
    Driver,
    /// The given client signalled its request ring.
    Client(ClientId),
}

/// Why a [`VirtBuilder`] refused to produce a [`Virtualizer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, derive_more::Display)]
pub enum BuildError {
    /// No driver queue was supplied.
    #[display(fmt = "no driver queue was supplied")]
    MissingDriver,
    /// No client was attached.
    #[display(fmt = "no client was attached")]
    NoClients,
    /// No staging region was supplied, or it holds zero transfer units.
    #[display(fmt = "no usable staging region was supplied")]
    MissingStaging,
    /// The transfer unit size must be a non-zero multiple of the sector
    /// size.
    #[display(fmt = "invalid transfer unit size: {}", size)]
    BadTransferSize { size: u32 },
    /// The driver hasn't published its storage properties yet. The
    /// environment must wait for the driver before assembling the
    /// virtualizer; there is no spinning here.
    #[display(fmt = "driver has not published its storage properties")]
    DriverNotReady,
}

/// Prototype for a [`Virtualizer`] under construction.
pub struct VirtBuilder<'a, TPlat> {
    platform: TPlat,
    transfer_size: u32,
    driver: Option<(QueueHandle<'a>, Channel, &'a StorageInfoCell)>,
    clients: Vec<ClientConn<'a>>,
    staging: Option<(DriverAddr, usize)>,
    ledger_capacity: Option<usize>,
}

impl<'a, TPlat: Platform> VirtBuilder<'a, TPlat> {
    /// Starts assembling a virtualizer whose staging region is divided
    /// into transfer units of `transfer_size` bytes.
    pub fn new(platform: TPlat, transfer_size: u32) -> VirtBuilder<'a, TPlat> {
        VirtBuilder {
            platform,
            transfer_size,
            driver: None,
            clients: Vec::new(),
            staging: None,
            ledger_capacity: None,
        }
    }

    /// Sets the driver's queue pair, notification channel and storage
    /// descriptor.
    pub fn with_driver(
        mut self,
        queue: QueueHandle<'a>,
        channel: Channel,
        info: &'a StorageInfoCell,
    ) -> Self {
        self.driver = Some((queue, channel, info));
        self
    }

    /// Attaches a client. Clients are identified by [`ClientId`]s assigned
    /// in attachment order, starting at 0, and receive partitions in the
    /// same order.
    pub fn with_client(
        mut self,
        queue: QueueHandle<'a>,
        channel: Channel,
        info: &'a StorageInfoCell,
    ) -> Self {
        self.clients.push(ClientConn {
            queue,
            channel,
            info,
            partition: None,
        });
        self
    }

    /// Sets the staging region: `units` transfer units starting at `base`
    /// in driver-visible memory.
    pub fn with_staging(mut self, base: DriverAddr, units: usize) -> Self {
        self.staging = Some((base, units));
        self
    }

    /// Overrides the number of requests that can be in flight at the
    /// driver simultaneously. Defaults to the summed capacity of all
    /// client request rings, which by construction can never be exceeded.
    pub fn with_ledger_capacity(mut self, capacity: usize) -> Self {
        self.ledger_capacity = Some(capacity);
        self
    }

    /// Validates the configuration, issues the partition table read, and
    /// returns the virtualizer in its bootstrapping state.
    pub fn build(self) -> Result<Virtualizer<'a, TPlat>, BuildError> {
        let (driver_queue, driver_channel, driver_info) =
            self.driver.ok_or(BuildError::MissingDriver)?;
        if self.clients.is_empty() {
            return Err(BuildError::NoClients);
        }
        let (staging_base, staging_units) = self.staging.ok_or(BuildError::MissingStaging)?;
        if staging_units == 0 {
            return Err(BuildError::MissingStaging);
        }
        if self.transfer_size == 0 || self.transfer_size as usize % mbr::SECTOR_SIZE != 0 {
            return Err(BuildError::BadTransferSize {
                size: self.transfer_size,
            });
        }
        let driver_props = driver_info.get().ok_or(BuildError::DriverNotReady)?;

        let ledger_capacity = self.ledger_capacity.unwrap_or_else(|| {
            self.clients
                .iter()
                .map(|c| c.queue.request_capacity())
                .sum()
        });

        let mut virt = Virtualizer {
            platform: self.platform,
            driver_queue,
            driver_channel,
            driver_props,
            clients: self.clients,
            pool: BufferPool::new(staging_base, self.transfer_size, staging_units),
            ledger: Ledger::new(ledger_capacity),
            transfer_size: self.transfer_size,
            sectors_per_unit: u64::from(self.transfer_size) / mbr::SECTOR_SIZE as u64,
            state: State::Bootstrapping,
        };
        virt.request_boot_record();
        Ok(virt)
    }
}

/// The block storage virtualizer.
//
// # Resource discipline
//
// Three bounded resources gate the acceptance of a client request: a slot
// in the driver's request ring, a slot in the ledger, and (for requests
// that move data) a contiguous run in the staging pool. All three are
// checked *before* anything is taken, so acceptance is atomic: a request
// either acquires everything it needs or acquires nothing and stays parked
// in its ring. Conversely, processing a driver response always releases
// the ledger slot and the staged run before anything else can go wrong,
// so a completion can never leak resources, whatever its status and
// whatever happens to its delivery.
//
// # Identity discipline
//
// The driver only ever sees request identifiers issued by the ledger, and
// the ledger never issues an identifier that is still live. A response is
// therefore attributed by construction: the identifier picks the ledger
// slot, the slot names the owning client and its original tag. Nothing
// else, in particular no addresses or sector numbers, is ever used to
// route a completion.
pub struct Virtualizer<'a, TPlat> {
    platform: TPlat,
    driver_queue: QueueHandle<'a>,
    driver_channel: Channel,
    /// Storage properties the driver had published by the time the
    /// virtualizer was built.
    driver_props: StorageInfo,
    clients: Vec<ClientConn<'a>>,
    pool: BufferPool,
    ledger: Ledger,
    /// Size in bytes of one transfer unit.
    transfer_size: u32,
    /// Transfer unit size expressed in sectors.
    sectors_per_unit: u64,
    state: State,
}

struct ClientConn<'a> {
    queue: QueueHandle<'a>,
    channel: Channel,
    info: &'a StorageInfoCell,
    /// Assigned when partitioning completes; `None` only before `Ready`.
    partition: Option<PartitionView>,
}

/// A client's partition, pre-scaled to transfer units.
#[derive(Debug, Copy, Clone)]
struct PartitionView {
    base_units: u64,
    len_units: u64,
}

enum State {
    /// Waiting for the driver's response to the partition table read.
    Bootstrapping,
    /// The partition table couldn't be used. Terminal and inert.
    PartitioningFailed,
    /// Serving client traffic.
    Ready,
}

/// What a pass over a client's request ring produced.
#[derive(Default)]
struct DrainOutcome {
    /// Requests forwarded to the driver.
    driver_requests: usize,
    /// Responses pushed into the client's response ring.
    responses: usize,
}

impl<'a, TPlat: Platform> Virtualizer<'a, TPlat> {
    /// True once partitioning has completed and client traffic is served.
    pub fn is_ready(&self) -> bool {
        match self.state {
            State::Ready => true,
            _ => false,
        }
    }

    /// Number of attached clients.
    pub fn num_clients(&self) -> usize {
        self.clients.len()
    }

    /// Delivers a notification to the virtualizer.
    ///
    /// This is the sole entry point after construction. It never blocks;
    /// it drains whatever the notification announced, forwards or answers
    /// what it can, and returns.
    ///
    /// # Panic
    ///
    /// Panics if the driver responds with a request identifier it was
    /// never given. Under a correct driver this is unreachable, and a
    /// driver that fabricates identifiers has corrupted the conversation
    /// beyond recovery.
    pub fn notified(&mut self, event: Event) {
        match self.state {
            State::Bootstrapping => self.handle_bootstrap_event(event),
            State::PartitioningFailed => {
                log::debug!("ignoring {:?}: partitioning failed at bring-up", event);
            }
            State::Ready => match event {
                Event::Driver => self.handle_driver_event(),
                Event::Client(client) => self.handle_client_event(client),
            },
        }
    }

    /// Issues the driver read that fetches the partition table. Called
    /// exactly once, from the builder.
    fn request_boot_record(&mut self) {
        // This is the first request ever issued; every resource involved
        // is untouched and cannot be exhausted.
        let addr = self.pool.alloc(1).expect("pool is untouched at bring-up");
        let id = self
            .ledger
            .alloc(RequestContext {
                client: ClientId(0),
                tag: 0,
                client_addr: ClientAddr(0),
                driver_addr: addr,
                count: 1,
                operation: Operation::Read,
            })
            .expect("ledger is untouched at bring-up");
        self.driver_queue
            .enqueue_request(Request {
                operation: Operation::Read,
                addr: addr.0,
                block_number: 0,
                count: 1,
                id: id.to_wire(),
            })
            .expect("driver ring is untouched at bring-up");
        self.notify_driver();
    }

    fn handle_bootstrap_event(&mut self, event: Event) {
        if let Event::Client(client) = event {
            log::warn!("{:?} signalled before the storage is ready", client);
            return;
        }
        let desc = match self.driver_queue.dequeue_response() {
            Some(desc) => desc,
            None => {
                log::error!("bootstrap: driver signalled but no response is queued");
                return;
            }
        };
        let ctx = self.retrieve_context(desc.id);

        if Status::from_code(desc.status) != Ok(Status::Success) {
            self.pool.free(ctx.driver_addr, ctx.count);
            // Deliberately no retry: a device that cannot produce its
            // first sector is a failed boot dependency.
            log::error!("bootstrap: driver failed to read sector 0");
            return;
        }

        let len = self.run_len(ctx.count);
        self.platform.cache_invalidate(ctx.driver_addr, len);
        let mut sector = [0u8; mbr::SECTOR_SIZE];
        self.platform.read_staging(ctx.driver_addr, &mut sector);
        self.pool.free(ctx.driver_addr, ctx.count);

        match mbr::assign_partitions(&sector, self.clients.len(), self.sectors_per_unit) {
            Ok(partitions) => {
                self.publish_partitions(partitions);
                self.state = State::Ready;
            }
            Err(err) => {
                log::error!("bootstrap: {}", err);
                self.state = State::PartitioningFailed;
            }
        }
    }

    fn publish_partitions(&mut self, partitions: Vec<mbr::Partition>) {
        debug_assert_eq!(partitions.len(), self.clients.len());
        for (client, partition) in self.clients.iter_mut().zip(partitions) {
            let view = PartitionView {
                base_units: partition.lba_start.0 / self.sectors_per_unit,
                len_units: partition.sectors / self.sectors_per_unit,
            };
            client.partition = Some(view);
            client.info.publish(StorageInfo {
                sector_size: self.driver_props.sector_size,
                block_size: self.driver_props.block_size,
                capacity: view.len_units,
                read_only: self.driver_props.read_only,
            });
        }
    }

    fn handle_driver_event(&mut self) {
        let mut to_notify: SmallVec<[ClientId; 8]> = SmallVec::new();
        loop {
            self.driver_queue.responses().cancel_signal();
            while let Some(desc) = self.driver_queue.dequeue_response() {
                self.process_driver_response(desc, &mut to_notify);
            }
            self.driver_queue.responses().request_signal();
            if self.driver_queue.response_ring_empty() {
                break;
            }
            // A response slipped in between the last drain and the signal
            // re-arm; go around again or its notification is lost.
        }
        for client in to_notify {
            self.notify_client(client);
        }

        // The completions above released ledger slots and staged runs, so
        // requests that were left parked in client rings may be
        // serviceable now.
        let mut driver_requests = 0;
        for index in 0..self.clients.len() {
            let client = ClientId(index as u32);
            let outcome = self.drain_client_requests(client);
            if outcome.responses > 0 {
                self.notify_client(client);
            }
            driver_requests += outcome.driver_requests;
        }
        if driver_requests > 0 {
            self.notify_driver();
        }
    }

    fn process_driver_response(
        &mut self,
        desc: RespDescriptor,
        to_notify: &mut SmallVec<[ClientId; 8]>,
    ) {
        let ctx = self.retrieve_context(desc.id);
        // The staged run is released whatever the status; operations
        // without a payload never held one.
        if ctx.operation.has_payload() {
            self.pool.free(ctx.driver_addr, ctx.count);
        }

        let status = match Status::from_code(desc.status) {
            Ok(status) => status,
            Err(code) => {
                log::warn!("driver reported {}; treating as an I/O failure", code);
                Status::SeekError
            }
        };

        let index = ctx.client.0 as usize;
        if self.clients[index].queue.responses().is_full() {
            // Deliberate policy: a client that does not drain its response
            // ring loses completions rather than stalling the shared
            // driver path. Resources were already released above.
            log::debug!(
                "dropping completion for {:?}: response ring is full",
                ctx.client
            );
            return;
        }

        if status == Status::Success && ctx.operation == Operation::Read {
            let len = self.run_len(ctx.count);
            self.platform.cache_invalidate(ctx.driver_addr, len);
            self.platform
                .copy_to_client(ctx.driver_addr, ctx.client_addr, len);
        }

        let pushed = self.clients[index].queue.enqueue_response(Response {
            status,
            count: desc.count,
            id: ctx.tag,
        });
        debug_assert!(pushed.is_ok());
        if !to_notify.contains(&ctx.client) {
            to_notify.push(ctx.client);
        }
    }

    fn handle_client_event(&mut self, client: ClientId) {
        if client.0 as usize >= self.clients.len() {
            log::warn!("notification attributed to unknown {:?}", client);
            return;
        }
        let outcome = self.drain_client_requests(client);
        if outcome.responses > 0 {
            self.notify_client(client);
        }
        if outcome.driver_requests > 0 {
            self.notify_driver();
        }
    }

    /// Drains a client's request ring until it is empty or a request has
    /// to be deferred, re-arming the notify-suppression flag on the way
    /// out.
    fn drain_client_requests(&mut self, client: ClientId) -> DrainOutcome {
        let index = client.0 as usize;
        let mut outcome = DrainOutcome::default();
        loop {
            self.clients[index].queue.requests().cancel_signal();
            let deferred = self.process_client_ring(client, &mut outcome);
            self.clients[index].queue.requests().request_signal();
            if deferred || self.clients[index].queue.requests().is_empty() {
                break;
            }
            // A request slipped in between the last drain and the signal
            // re-arm; go around again or its notification is lost.
        }
        outcome
    }

    /// Processes requests until the ring is empty (returns `false`) or a
    /// request can't acquire the resources it needs (returns `true`,
    /// leaving that request in the ring).
    fn process_client_ring(&mut self, client: ClientId, outcome: &mut DrainOutcome) -> bool {
        let index = client.0 as usize;
        loop {
            let desc = match self.clients[index].queue.requests().peek() {
                Some(desc) => desc,
                None => return false,
            };
            let rq = match Request::try_from(desc) {
                Ok(rq) => rq,
                Err(code) => {
                    self.clients[index].queue.requests().consume();
                    log::warn!("{:?} submitted {}; rejecting", client, code);
                    self.push_client_response(
                        client,
                        Response {
                            status: Status::SeekError,
                            count: 0,
                            id: desc.id,
                        },
                        outcome,
                    );
                    continue;
                }
            };

            let partition = self.clients[index]
                .partition
                .expect("partitions are assigned before entering the ready state");

            if rq.operation.has_payload() {
                let in_bounds = match rq.block_number.checked_add(u64::from(rq.count)) {
                    Some(end) => end <= partition.len_units,
                    None => false,
                };
                if !in_bounds {
                    // Answered synchronously; the driver never sees
                    // anything and no resource is touched.
                    self.clients[index].queue.requests().consume();
                    self.push_client_response(
                        client,
                        Response {
                            status: Status::SeekError,
                            count: 0,
                            id: rq.id,
                        },
                        outcome,
                    );
                    continue;
                }
                if rq.count == 0 {
                    self.clients[index].queue.requests().consume();
                    self.push_client_response(
                        client,
                        Response {
                            status: Status::Success,
                            count: 0,
                            id: rq.id,
                        },
                        outcome,
                    );
                    continue;
                }
                if self.driver_queue.request_ring_full()
                    || self.ledger.is_full()
                    || self.pool.is_full(rq.count)
                {
                    return true;
                }
                self.clients[index].queue.requests().consume();

                let driver_addr = self
                    .pool
                    .alloc(rq.count)
                    .expect("pool availability was checked before consuming");
                let len = self.run_len(rq.count);
                let client_addr = ClientAddr(rq.addr);
                if rq.operation == Operation::Write {
                    self.platform.copy_from_client(client_addr, driver_addr, len);
                    self.platform.cache_clean(driver_addr, len);
                }
                self.forward_request(client, rq, client_addr, driver_addr, partition);
                outcome.driver_requests += 1;
            } else {
                if self.driver_queue.request_ring_full() || self.ledger.is_full() {
                    return true;
                }
                self.clients[index].queue.requests().consume();
                // No data moves for Flush/Barrier; the client's address is
                // forwarded untouched.
                self.forward_request(
                    client,
                    rq,
                    ClientAddr(rq.addr),
                    DriverAddr(rq.addr),
                    partition,
                );
                outcome.driver_requests += 1;
            }
        }
    }

    /// Parks the request in the ledger and pushes its driver-space
    /// translation onto the driver's request ring. Capacity for both was
    /// checked by the caller.
    fn forward_request(
        &mut self,
        client: ClientId,
        rq: Request,
        client_addr: ClientAddr,
        driver_addr: DriverAddr,
        partition: PartitionView,
    ) {
        let id = self
            .ledger
            .alloc(RequestContext {
                client,
                tag: rq.id,
                client_addr,
                driver_addr,
                count: rq.count,
                operation: rq.operation,
            })
            .expect("ledger occupancy was checked before consuming");
        let pushed = self.driver_queue.enqueue_request(Request {
            operation: rq.operation,
            addr: driver_addr.0,
            block_number: partition.base_units + rq.block_number,
            count: rq.count,
            id: id.to_wire(),
        });
        debug_assert!(pushed.is_ok());
    }

    fn push_client_response(
        &mut self,
        client: ClientId,
        response: Response,
        outcome: &mut DrainOutcome,
    ) {
        let index = client.0 as usize;
        if self.clients[index].queue.enqueue_response(response).is_err() {
            log::debug!("dropping response for {:?}: response ring is full", client);
            return;
        }
        outcome.responses += 1;
    }

    fn retrieve_context(&mut self, raw_id: u64) -> RequestContext {
        let id = RequestId::from_wire(raw_id);
        match self.ledger.retrieve_and_free(id) {
            Some(ctx) => ctx,
            // There is no way to attribute this response, and the
            // bookkeeping can no longer be trusted.
            None => panic!("driver responded with unknown request id {:?}", id),
        }
    }

    fn notify_driver(&mut self) {
        if self.driver_queue.requests().signal_requested() {
            self.platform.notify(self.driver_channel);
        }
    }

    fn notify_client(&mut self, client: ClientId) {
        let index = client.0 as usize;
        if self.clients[index].queue.responses().signal_requested() {
            let channel = self.clients[index].channel;
            self.platform.notify(channel);
        }
    }

    fn run_len(&self, count: u16) -> usize {
        usize::from(count) * self.transfer_size as usize
    }
}
