//! Open devices and their in-flight transfer queues.
//!
//! A transfer lives on exactly one list at a time: it is linked onto the
//! owning device's `incomplete` list at creation and moved (once) to the
//! `pending` list by completion. The lists are lock-guarded because real
//! hardware backends complete transfers from background threads; delivery to
//! the client only ever happens on the emulation thread, in the batched drain
//! pass.

use std::sync::{Arc, Mutex};

use starlet_io_snapshot::{Decoder, Encoder, SnapshotError, SnapshotResult};
use starlet_timing::{EventId, RemoteScheduler};
use tracing::warn;

use crate::{
    status, OpenKey, TransferTag, UsbSetup, REQUEST_SET_CONFIGURATION, REQUEST_SET_INTERFACE,
};

/// Completion payload handed to the client on the emulation thread.
///
/// IN data is returned here as owned bytes; the client copies it back to guest
/// memory. `packet_lengths` is only populated for isochronous transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub status: i32,
    pub data: Vec<u8>,
    pub packet_lengths: Vec<u16>,
}

impl TransferResult {
    pub fn from_status(status: i32) -> Self {
        Self {
            status,
            data: Vec::new(),
            packet_lengths: Vec::new(),
        }
    }
}

/// Receives transfer completions for one open device. Invoked only from the
/// emulation thread.
pub trait UsbDeviceClient {
    fn request_complete(&mut self, tag: &TransferTag, result: &TransferResult);
}

/// Endpoint value used for control-pipe and synthetic transfers, which have no
/// guest-visible endpoint.
const CONTROL_ENDPOINT: i16 = -1;

#[derive(Debug)]
struct Transfer {
    serial: u64,
    tag: TransferTag,
    endpoint: i16,
    /// Synthesized internally to satisfy protocol expectations (for example a
    /// virtualized SET_CONFIGURATION); not backed by real host I/O and
    /// therefore exempt from cancellation.
    synthetic: bool,
    status: i32,
    data: Vec<u8>,
    packet_lengths: Vec<u16>,
}

#[derive(Debug, Default)]
struct TransferQueues {
    next_serial: u64,
    incomplete: Vec<Transfer>,
    pending: Vec<Transfer>,
    /// Set while this device sits on the host's has-completions list with a
    /// drain event scheduled; cleared when the batch is taken.
    drain_scheduled: bool,
}

/// Notifies the emulation thread that a device has completions to drain.
#[derive(Debug, Clone)]
pub(crate) struct DrainNotifier {
    pub(crate) pending_devices: Arc<Mutex<Vec<u64>>>,
    pub(crate) remote: RemoteScheduler,
    pub(crate) drain_event: EventId,
}

/// Cross-thread core of one open device: the transfer queues and the drain
/// hook. Everything behind the lock is plain `Send` data.
#[derive(Debug)]
pub(crate) struct DeviceCore {
    pub(crate) id: u64,
    queues: Mutex<TransferQueues>,
    notifier: DrainNotifier,
}

impl DeviceCore {
    pub(crate) fn new(id: u64, notifier: DrainNotifier) -> Self {
        Self {
            id,
            queues: Mutex::new(TransferQueues::default()),
            notifier,
        }
    }

    fn begin(self: &Arc<Self>, tag: TransferTag, endpoint: i16, synthetic: bool) -> TransferTicket {
        let mut q = self.queues.lock().expect("transfer queues poisoned");
        let serial = q.next_serial;
        q.next_serial += 1;
        q.incomplete.push(Transfer {
            serial,
            tag,
            endpoint,
            synthetic,
            status: 0,
            data: Vec::new(),
            packet_lengths: Vec::new(),
        });
        TransferTicket {
            core: Arc::clone(self),
            serial,
        }
    }

    fn complete(&self, serial: u64, status: i32, data: Vec<u8>, packet_lengths: Vec<u16>) {
        let schedule_drain = {
            let mut q = self.queues.lock().expect("transfer queues poisoned");
            let Some(idx) = q.incomplete.iter().position(|t| t.serial == serial) else {
                // Already force-completed (cancellation, restore); stale
                // completions are dropped.
                return;
            };
            let mut transfer = q.incomplete.remove(idx);
            transfer.status = status;
            transfer.data = data;
            transfer.packet_lengths = packet_lengths;
            q.pending.push(transfer);

            if q.drain_scheduled {
                false
            } else {
                q.drain_scheduled = true;
                true
            }
        };

        if schedule_drain {
            self.notifier
                .pending_devices
                .lock()
                .expect("pending device list poisoned")
                .push(self.id);
            self.notifier
                .remote
                .schedule_immediate(self.notifier.drain_event, self.id);
        }
    }

    /// Takes the whole pending batch, clearing the drain flag in the same
    /// critical section so a completion racing in re-arms the event.
    pub(crate) fn take_pending(&self) -> Vec<(TransferTag, TransferResult)> {
        let mut q = self.queues.lock().expect("transfer queues poisoned");
        q.drain_scheduled = false;
        q.pending
            .drain(..)
            .map(|t| {
                (
                    t.tag,
                    TransferResult {
                        status: t.status,
                        data: t.data,
                        packet_lengths: t.packet_lengths,
                    },
                )
            })
            .collect()
    }

    fn cancel_endpoint(&self, endpoint: u8) -> bool {
        let mut q = self.queues.lock().expect("transfer queues poisoned");
        let mut moved_any = false;

        let mut idx = 0;
        while idx < q.incomplete.len() {
            let t = &q.incomplete[idx];
            if t.endpoint == i16::from(endpoint) && !t.synthetic {
                let mut transfer = q.incomplete.remove(idx);
                transfer.status = status::CANCELLED;
                transfer.data = Vec::new();
                transfer.packet_lengths = Vec::new();
                q.pending.push(transfer);
                moved_any = true;
            } else {
                idx += 1;
            }
        }
        for t in q.pending.iter_mut() {
            if t.endpoint == i16::from(endpoint) && !t.synthetic {
                t.status = status::CANCELLED;
                t.data = Vec::new();
                t.packet_lengths = Vec::new();
            }
        }

        if moved_any && !q.drain_scheduled {
            q.drain_scheduled = true;
            true
        } else {
            false
        }
    }

    fn outstanding_tags(&self) -> (Vec<TransferTag>, Vec<TransferTag>) {
        let q = self.queues.lock().expect("transfer queues poisoned");
        (
            q.incomplete.iter().map(|t| t.tag).collect(),
            q.pending.iter().map(|t| t.tag).collect(),
        )
    }

    fn drop_all(&self) {
        let mut q = self.queues.lock().expect("transfer queues poisoned");
        q.incomplete.clear();
        q.pending.clear();
    }
}

/// Completion handle for one accepted transfer. `Send`, so real-hardware
/// backends can carry it into their polling threads. Completing consumes the
/// ticket; the underlying transfer moves lists exactly once.
#[derive(Debug)]
pub struct TransferTicket {
    core: Arc<DeviceCore>,
    serial: u64,
}

impl TransferTicket {
    pub fn complete(self, status: i32) {
        self.core.complete(self.serial, status, Vec::new(), Vec::new());
    }

    pub fn complete_with_data(self, status: i32, data: Vec<u8>) {
        self.core.complete(self.serial, status, data, Vec::new());
    }

    pub fn complete_isochronous(self, status: i32, data: Vec<u8>, packet_lengths: Vec<u16>) {
        self.core.complete(self.serial, status, data, packet_lengths);
    }
}

/// Controller-specific transport behind an open device: real hardware submits
/// to the host OS, emulated devices answer inline. Unserviceable requests must
/// complete their ticket with a small negative status, never panic.
pub trait UsbPortDriver {
    fn set_config(&mut self, config: u32) -> i32;

    fn set_default_config(&mut self) -> i32 {
        self.set_config(1)
    }

    fn set_interface_alt_setting(&mut self, interface: u32, setting: u32) -> i32;

    fn submit_control(&mut self, ticket: TransferTicket, setup: &UsbSetup, payload: Vec<u8>);
    fn submit_bulk(&mut self, ticket: TransferTicket, endpoint: u8, payload: Vec<u8>);
    fn submit_interrupt(&mut self, ticket: TransferTicket, endpoint: u8, payload: Vec<u8>);
    fn submit_isochronous(
        &mut self,
        ticket: TransferTicket,
        endpoint: u8,
        payload: Vec<u8>,
        packet_lengths: Vec<u16>,
    );

    /// The guest closed the device. Outstanding host I/O should be abandoned.
    fn closed(&mut self) {}
}

/// An exclusively opened device. Owned by the backend that opened it; closing
/// goes through [`crate::UsbHost::close_device`] so the global open-set stays
/// consistent.
pub struct OpenDevice {
    pub(crate) key: OpenKey,
    pub(crate) core: Arc<DeviceCore>,
    pub(crate) driver: Box<dyn UsbPortDriver>,
    pub(crate) closed: bool,
}

impl std::fmt::Debug for OpenDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenDevice")
            .field("key", &self.key)
            .field("core", &self.core)
            .field("driver", &format_args!("<dyn UsbPortDriver>"))
            .field("closed", &self.closed)
            .finish()
    }
}

impl OpenDevice {
    pub fn key(&self) -> OpenKey {
        self.key
    }

    /// Issues a control request.
    ///
    /// SET_CONFIGURATION and SET_INTERFACE are intercepted and completed
    /// synthetically from the driver's synchronous result; everything else
    /// goes to the transport.
    pub fn control_request(&mut self, setup: &UsbSetup, payload: Vec<u8>, tag: TransferTag) {
        match setup.request {
            REQUEST_SET_CONFIGURATION => {
                let result = self.driver.set_config(u32::from(setup.value));
                self.core
                    .begin(tag, CONTROL_ENDPOINT, true)
                    .complete(result);
            }
            REQUEST_SET_INTERFACE => {
                let result = self
                    .driver
                    .set_interface_alt_setting(u32::from(setup.index), u32::from(setup.value));
                self.core
                    .begin(tag, CONTROL_ENDPOINT, true)
                    .complete(result);
            }
            _ => {
                let ticket = self.core.begin(tag, CONTROL_ENDPOINT, false);
                self.driver.submit_control(ticket, setup, payload);
            }
        }
    }

    pub fn bulk_request(&mut self, endpoint: u8, payload: Vec<u8>, tag: TransferTag) {
        let ticket = self.core.begin(tag, i16::from(endpoint), false);
        self.driver.submit_bulk(ticket, endpoint, payload);
    }

    pub fn interrupt_request(&mut self, endpoint: u8, payload: Vec<u8>, tag: TransferTag) {
        let ticket = self.core.begin(tag, i16::from(endpoint), false);
        self.driver.submit_interrupt(ticket, endpoint, payload);
    }

    pub fn isochronous_request(
        &mut self,
        endpoint: u8,
        payload: Vec<u8>,
        packet_lengths: Vec<u16>,
        tag: TransferTag,
    ) {
        let ticket = self.core.begin(tag, i16::from(endpoint), false);
        self.driver
            .submit_isochronous(ticket, endpoint, payload, packet_lengths);
    }

    pub fn set_default_config(&mut self) -> i32 {
        self.driver.set_default_config()
    }

    /// Force-completes every non-synthetic request on `endpoint`, on both
    /// lists, with the cancelled status. Synchronous and immediate; the
    /// cancelled completions are delivered in the next drain pass.
    pub fn cancel_requests(&mut self, endpoint: u8) {
        if self.core.cancel_endpoint(endpoint) {
            let n = &self.core.notifier;
            n.pending_devices
                .lock()
                .expect("pending device list poisoned")
                .push(self.core.id);
            n.remote.schedule_immediate(n.drain_event, self.core.id);
        }
    }

    /// Serializes the outstanding transfer tags (incomplete list, then
    /// pending list). Nothing else about an in-flight transfer is
    /// persistable: real-hardware I/O cannot be resumed across a save-state.
    pub fn save_outstanding_tags(&self) -> Vec<u8> {
        let (incomplete, pending) = self.core.outstanding_tags();
        let mut enc = Encoder::new();
        for list in [&incomplete, &pending] {
            enc = enc.u32(list.len() as u32);
            for tag in list.iter() {
                enc = enc.bytes(tag);
            }
        }
        enc.finish()
    }

    pub(crate) fn drop_outstanding(&self) {
        self.core.drop_all();
    }
}

impl Drop for OpenDevice {
    fn drop(&mut self) {
        // Closing must go through the host so the open-set entry is released.
        // A leak here would make the device permanently un-openable, which is
        // worth a diagnostic.
        if !self.closed {
            warn!(key = ?self.key, "open device dropped without close");
        }
    }
}

const MAX_SAVED_TRANSFERS: usize = 4096;

/// Counterpart of [`OpenDevice::save_outstanding_tags`]: invokes `deliver` for
/// every persisted tag. Callers complete each tag with
/// [`status::DISCONNECTED`] immediately; by contract, restored transfers are
/// never resumed.
pub fn restore_outstanding_tags(
    bytes: &[u8],
    mut deliver: impl FnMut(TransferTag),
) -> SnapshotResult<()> {
    let mut d = Decoder::new(bytes);
    for _ in 0..2 {
        let count = d.u32()? as usize;
        if count > MAX_SAVED_TRANSFERS {
            return Err(SnapshotError::InvalidFieldEncoding("transfer tag count"));
        }
        for _ in 0..count {
            let raw = d.bytes(crate::TRANSFER_TAG_LEN)?;
            let mut tag: TransferTag = [0; crate::TRANSFER_TAG_LEN];
            tag.copy_from_slice(raw);
            deliver(tag);
        }
    }
    d.finish()
}
