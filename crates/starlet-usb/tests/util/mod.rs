//! Shared fixtures for the bus integration tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use starlet_timing::Scheduler;
use starlet_usb::{
    ControllerId, DeviceDescriptor, DeviceChangeListener, EmulatedController, TransferResult,
    TransferTag, TransferTicket, UsbDeviceClient, UsbHost, UsbPortDriver, UsbSetup,
};

/// Client that records every delivered completion.
#[derive(Default)]
pub struct RecordingClient {
    pub completions: Vec<(TransferTag, TransferResult)>,
}

impl UsbDeviceClient for RecordingClient {
    fn request_complete(&mut self, tag: &TransferTag, result: &TransferResult) {
        self.completions.push((*tag, result.clone()));
    }
}

/// Listener that records every merged list it is shown.
#[derive(Default)]
pub struct RecordingListener {
    pub calls: Vec<Vec<DeviceDescriptor>>,
}

impl DeviceChangeListener for RecordingListener {
    fn devices_changed(&mut self, devices: &[DeviceDescriptor]) {
        self.calls.push(devices.to_vec());
    }
}

/// Transport that parks every submitted request so tests can complete them
/// explicitly (optionally from another thread).
pub struct QueueDriver {
    pub held: Rc<RefCell<Vec<(i16, TransferTicket)>>>,
}

impl UsbPortDriver for QueueDriver {
    fn set_config(&mut self, _config: u32) -> i32 {
        0
    }

    fn set_interface_alt_setting(&mut self, _interface: u32, _setting: u32) -> i32 {
        0
    }

    fn submit_control(&mut self, ticket: TransferTicket, _setup: &UsbSetup, _payload: Vec<u8>) {
        self.held.borrow_mut().push((-1, ticket));
    }

    fn submit_bulk(&mut self, ticket: TransferTicket, endpoint: u8, _payload: Vec<u8>) {
        self.held.borrow_mut().push((i16::from(endpoint), ticket));
    }

    fn submit_interrupt(&mut self, ticket: TransferTicket, endpoint: u8, _payload: Vec<u8>) {
        self.held.borrow_mut().push((i16::from(endpoint), ticket));
    }

    fn submit_isochronous(
        &mut self,
        ticket: TransferTicket,
        endpoint: u8,
        _payload: Vec<u8>,
        _packet_lengths: Vec<u16>,
    ) {
        self.held.borrow_mut().push((i16::from(endpoint), ticket));
    }
}

pub fn descriptor(vid: u16, pid: u16) -> DeviceDescriptor {
    DeviceDescriptor {
        vid,
        pid,
        name: format!("emulated {vid:04x}:{pid:04x}"),
        ..Default::default()
    }
}

/// Host with one emulated controller whose device parks requests on the
/// returned queue.
pub fn emulated_host(
    scheduler: &mut Scheduler,
    vid: u16,
    pid: u16,
) -> (UsbHost, ControllerId, Rc<RefCell<Vec<(i16, TransferTicket)>>>) {
    let mut host = UsbHost::new(scheduler);
    let held: Rc<RefCell<Vec<(i16, TransferTicket)>>> = Rc::new(RefCell::new(Vec::new()));
    let desc = descriptor(vid, pid);
    let controller = host.add_controller(|id, publisher| {
        let held = held.clone();
        EmulatedController::new(
            id,
            publisher,
            desc,
            Box::new(move || {
                Box::new(QueueDriver {
                    held: held.clone(),
                })
            }),
        )
    });
    (host, controller, held)
}

/// Delivers every due zero-delay event into the host.
pub fn pump(scheduler: &mut Scheduler, host: &mut UsbHost) {
    for ev in scheduler.advance(0) {
        host.process_event(ev.id, ev.userdata);
    }
}

pub fn plug(scheduler: &mut Scheduler, host: &mut UsbHost, controller: ControllerId, plugged: bool) {
    host.controller_mut(controller)
        .unwrap()
        .as_any_mut()
        .downcast_mut::<EmulatedController>()
        .unwrap()
        .set_enabled(plugged);
    pump(scheduler, host);
}

pub fn tag(n: u8) -> TransferTag {
    let mut tag = [0u8; 16];
    tag[0] = n;
    tag
}
