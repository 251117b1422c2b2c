//! Shared rig for dispatcher integration tests: guest RAM, scheduler, bus
//! host, doorbell-backed MMIO and the dispatcher, driven the way the machine
//! drives them.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use starlet_ipc::{
    CtrlFlags, DeviceRegistry, IpcDispatcher, IpcDoorbell, CMD_IOCTL, CMD_IOCTLV, CMD_OPEN,
};
use starlet_ipc::doorbell::{IPC_COMMAND_REGISTER, IPC_CONTROL_REGISTER};
use starlet_memory::{GuestMemory, Ram};
use starlet_mmio::Mapping;
use starlet_timing::Scheduler;
use starlet_usb::{
    ControllerId, DeviceDescriptor, EmulatedController, TransferTicket, UsbHost, UsbPortDriver,
    UsbSetup,
};

pub struct Rig {
    pub ram: Ram,
    pub scheduler: Scheduler,
    pub usb: UsbHost,
    pub mmio: Mapping,
    pub doorbell: Rc<RefCell<IpcDoorbell>>,
    pub dispatcher: IpcDispatcher,
}

impl Rig {
    pub fn new(setup: impl FnOnce(&mut DeviceRegistry)) -> Self {
        let mut scheduler = Scheduler::new();
        let usb = UsbHost::new(&mut scheduler);
        let mut registry = DeviceRegistry::new();
        setup(&mut registry);
        let dispatcher = IpcDispatcher::new(&mut scheduler, registry);

        let mut mmio = Mapping::new();
        let doorbell = Rc::new(RefCell::new(IpcDoorbell::new()));
        IpcDoorbell::map_registers(&doorbell, &mut mmio);

        Self {
            ram: Ram::new(0x40000),
            scheduler,
            usb,
            mmio,
            doorbell,
            dispatcher,
        }
    }

    /// One emulated time slice: deliver due events, then one dispatcher pass.
    pub fn step(&mut self, ticks: u64) {
        for ev in self.scheduler.advance(ticks) {
            if self.usb.process_event(ev.id, ev.userdata) {
                continue;
            }
            self.dispatcher.process_event(ev.id, ev.userdata);
        }
        let mut bell = self.doorbell.borrow_mut();
        self.dispatcher
            .update(&mut self.ram, &mut self.scheduler, &mut self.usb, &mut bell);
    }

    /// Guest interrupt handler: consume acknowledge and reply.
    pub fn guest_ack(&mut self) {
        self.mmio.write_u32(
            IPC_CONTROL_REGISTER,
            (CtrlFlags::ACKNOWLEDGE | CtrlFlags::REPLY).bits(),
        );
    }

    /// Guest posts a command block through the doorbell registers.
    pub fn post(&mut self, addr: u32) {
        self.mmio.write_u32(IPC_COMMAND_REGISTER, addr);
        self.mmio.write_u32(IPC_CONTROL_REGISTER, CtrlFlags::EXECUTE.bits());
    }

    pub fn result(&self, addr: u32) -> i32 {
        self.ram.read_u32(addr + 4) as i32
    }

    /// Steps tick by tick, collecting `(delivery_time, block_address)` for
    /// every reply the doorbell raises.
    pub fn collect_replies(&mut self, ticks: u64) -> Vec<(u64, u32)> {
        let mut replies = Vec::new();
        for _ in 0..ticks {
            self.step(1);
            let delivered = {
                let bell = self.doorbell.borrow();
                bell.ctrl().contains(CtrlFlags::REPLY).then(|| bell.answer())
            };
            if let Some(addr) = delivered {
                replies.push((self.scheduler.now(), addr));
            }
            self.guest_ack();
        }
        replies
    }

    /// Steps until the reply for `addr` is delivered, panicking after the
    /// tick budget. Other replies delivered on the way are discarded.
    pub fn run_until_replied(&mut self, addr: u32, max_ticks: u64) -> u64 {
        for _ in 0..max_ticks {
            self.step(1);
            let delivered = {
                let bell = self.doorbell.borrow();
                bell.ctrl().contains(CtrlFlags::REPLY) && bell.answer() == addr
            };
            self.guest_ack();
            if delivered {
                return self.scheduler.now();
            }
        }
        panic!("no reply for block {addr:#010x}");
    }

    pub fn write_open_block(&mut self, addr: u32, name: &str, mode: u32) {
        let name_ptr = addr + 0x80;
        self.ram.write_u32(addr, CMD_OPEN);
        self.ram.write_u32(addr + 0x04, 0);
        self.ram.write_u32(addr + 0x08, 0xFFFF_FFFF);
        self.ram.write_u32(addr + 0x0C, name_ptr);
        self.ram.write_u32(addr + 0x10, mode);
        self.ram.write_bytes(name_ptr, name.as_bytes());
        self.ram.write_u8(name_ptr + name.len() as u32, 0);
    }

    /// Open via the full doorbell path; returns the status word (the
    /// descriptor on success). The budget covers devices with long simulated
    /// delays.
    pub fn open(&mut self, addr: u32, name: &str) -> i32 {
        self.write_open_block(addr, name, 0);
        self.post(addr);
        self.run_until_replied(addr, 4096);
        self.result(addr)
    }

    pub fn write_command_block(&mut self, addr: u32, command: u32, fd: i32) {
        self.ram.write_u32(addr, command);
        self.ram.write_u32(addr + 0x04, 0);
        self.ram.write_u32(addr + 0x08, fd as u32);
    }

    /// Ioctl block: request word plus in/out buffer descriptors.
    pub fn write_ioctl_block(
        &mut self,
        addr: u32,
        fd: i32,
        request: u32,
        buffer_in: (u32, u32),
        buffer_out: (u32, u32),
    ) {
        self.write_command_block(addr, CMD_IOCTL, fd);
        self.ram.write_u32(addr + 0x0C, request);
        self.ram.write_u32(addr + 0x10, buffer_in.0);
        self.ram.write_u32(addr + 0x14, buffer_in.1);
        self.ram.write_u32(addr + 0x18, buffer_out.0);
        self.ram.write_u32(addr + 0x1C, buffer_out.1);
    }

    /// Ioctlv block: parameter word plus the (address, size) pair vector,
    /// written at `addr + 0x40`.
    pub fn write_ioctlv_block(
        &mut self,
        addr: u32,
        fd: i32,
        parameter: u32,
        in_buffers: &[(u32, u32)],
        payload_buffers: &[(u32, u32)],
    ) {
        self.write_command_block(addr, CMD_IOCTLV, fd);
        let vector = addr + 0x40;
        self.ram.write_u32(addr + 0x0C, parameter);
        self.ram.write_u32(addr + 0x10, in_buffers.len() as u32);
        self.ram.write_u32(addr + 0x14, payload_buffers.len() as u32);
        self.ram.write_u32(addr + 0x18, vector);

        let mut cursor = vector;
        for (address, size) in in_buffers.iter().chain(payload_buffers.iter()) {
            self.ram.write_u32(cursor, *address);
            self.ram.write_u32(cursor + 4, *size);
            cursor += 8;
        }
    }
}

// ----------------------------------------
// Emulated bus fixtures
// ----------------------------------------

/// Transport that parks submitted requests for explicit completion.
pub struct HeldDriver {
    pub held: Rc<RefCell<Vec<(i16, TransferTicket)>>>,
}

impl UsbPortDriver for HeldDriver {
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

/// Adds an emulated controller carrying one pluggable device; returns the
/// controller id and the parked-request queue.
pub fn add_emulated_device(
    usb: &mut UsbHost,
    vid: u16,
    pid: u16,
) -> (ControllerId, Rc<RefCell<Vec<(i16, TransferTicket)>>>) {
    let held: Rc<RefCell<Vec<(i16, TransferTicket)>>> = Rc::new(RefCell::new(Vec::new()));
    let descriptor = DeviceDescriptor {
        vid,
        pid,
        name: format!("emulated {vid:04x}:{pid:04x}"),
        ..Default::default()
    };
    let held_for_factory = held.clone();
    let controller = usb.add_controller(move |id, publisher| {
        EmulatedController::new(
            id,
            publisher,
            descriptor,
            Box::new(move || {
                Box::new(HeldDriver {
                    held: held_for_factory.clone(),
                })
            }),
        )
    });
    (controller, held)
}

pub fn set_plugged(rig: &mut Rig, controller: ControllerId, plugged: bool) {
    rig.usb
        .controller_mut(controller)
        .unwrap()
        .as_any_mut()
        .downcast_mut::<EmulatedController>()
        .unwrap()
        .set_enabled(plugged);
    rig.step(0);
}
