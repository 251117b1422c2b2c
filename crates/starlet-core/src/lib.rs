//! Machine context: owns guest RAM, the register dispatch table, the
//! scheduler, the peripheral-bus host and the IPC dispatcher, and routes
//! timer events between them.
//!
//! There is deliberately no global state anywhere in the workspace; this
//! object is constructed at power-on, passed by reference into everything,
//! and dropped at power-off.

use std::cell::RefCell;
use std::rc::Rc;

use starlet_io_snapshot::{
    IoSnapshot, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter,
};
use starlet_ipc::devices::{KeyboardDevice, StubDevice, UsbPassthroughDevice, UsbRootDevice};
use starlet_ipc::{DeviceRegistry, IpcDispatcher, IpcDoorbell};
use starlet_memory::{GuestMemory, Ram};
use starlet_mmio::Mapping;
use starlet_timing::Scheduler;
use starlet_usb::UsbHost;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    pub ram_size: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size: 0x0180_0000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MachineError {
    #[error("ram size must be a multiple of 64 KiB, at least 64 KiB and at most 64 MiB")]
    InvalidRamSize,
}

impl MachineConfig {
    pub fn validate(&self) -> Result<(), MachineError> {
        let ok = self.ram_size >= 0x1_0000
            && self.ram_size <= 0x0400_0000
            && self.ram_size % 0x1_0000 == 0;
        if ok {
            Ok(())
        } else {
            Err(MachineError::InvalidRamSize)
        }
    }
}

pub struct Machine {
    config: MachineConfig,
    ram: Ram,
    mmio: Mapping,
    scheduler: Scheduler,
    usb: UsbHost,
    doorbell: Rc<RefCell<IpcDoorbell>>,
    ipc: IpcDispatcher,
}

impl Machine {
    /// Builds the whole machine and wires the IPC doorbell into the register
    /// window. The standard backend factories are registered; embedders add
    /// bus controllers afterwards through [`Machine::usb_mut`].
    pub fn power_on(config: MachineConfig) -> Result<Self, MachineError> {
        config.validate()?;
        info!(ram_size = config.ram_size, "machine power on");

        let mut scheduler = Scheduler::new();
        let usb = UsbHost::new(&mut scheduler);

        let mut registry = DeviceRegistry::new();
        KeyboardDevice::register(&mut registry);
        UsbRootDevice::register(&mut registry);
        UsbPassthroughDevice::register(&mut registry);
        StubDevice::register(&mut registry, "/dev/stm/immediate");
        let ipc = IpcDispatcher::new(&mut scheduler, registry);

        let mut mmio = Mapping::new();
        let doorbell = Rc::new(RefCell::new(IpcDoorbell::new()));
        IpcDoorbell::map_registers(&doorbell, &mut mmio);

        Ok(Self {
            ram: Ram::new(config.ram_size),
            config,
            mmio,
            scheduler,
            usb,
            doorbell,
            ipc,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut Ram {
        &mut self.ram
    }

    /// The guest's register-access path.
    pub fn mmio_mut(&mut self) -> &mut Mapping {
        &mut self.mmio
    }

    pub fn usb_mut(&mut self) -> &mut UsbHost {
        &mut self.usb
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn ipc(&self) -> &IpcDispatcher {
        &self.ipc
    }

    pub fn doorbell(&self) -> Rc<RefCell<IpcDoorbell>> {
        Rc::clone(&self.doorbell)
    }

    /// Advances virtual time by `ticks`, routes every fired event, then runs
    /// one dispatcher pass.
    pub fn step(&mut self, ticks: u64) {
        for ev in self.scheduler.advance(ticks) {
            if self.usb.process_event(ev.id, ev.userdata) {
                continue;
            }
            self.ipc.process_event(ev.id, ev.userdata);
        }
        let mut bell = self.doorbell.borrow_mut();
        self.ipc
            .update(&mut self.ram, &mut self.scheduler, &mut self.usb, &mut bell);
    }

    /// Machine reset: force-closes every descriptor, flushes the queues and
    /// the doorbell. Register slots live for the machine's lifetime and are
    /// not touched.
    pub fn reset(&mut self) {
        info!("machine reset");
        self.ipc
            .reset(&mut self.ram, &mut self.scheduler, &mut self.usb);
        self.doorbell.borrow_mut().reset();
    }
}

// Whole-machine save-state: RAM, scheduler, doorbell, dispatcher (which
// embeds each open backend's state), in fixed section order.
impl IoSnapshot for Machine {
    const DEVICE_ID: [u8; 4] = *b"MACH";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        const TAG_RAM: u16 = 1;
        const TAG_SCHEDULER: u16 = 2;
        const TAG_DOORBELL: u16 = 3;
        const TAG_IPC: u16 = 4;

        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        let mut ram = vec![0u8; self.ram.len()];
        self.ram.read_bytes(0, &mut ram);
        w.field_bytes(TAG_RAM, ram);
        w.field_bytes(TAG_SCHEDULER, self.scheduler.save_state());
        w.field_bytes(TAG_DOORBELL, self.doorbell.borrow().save_state());
        w.field_bytes(TAG_IPC, self.ipc.save_state());
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_RAM: u16 = 1;
        const TAG_SCHEDULER: u16 = 2;
        const TAG_DOORBELL: u16 = 3;
        const TAG_IPC: u16 = 4;

        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        let ram = r
            .bytes(TAG_RAM)
            .ok_or(SnapshotError::InvalidFieldEncoding("missing ram section"))?;
        if ram.len() != self.ram.len() {
            return Err(SnapshotError::InvalidFieldEncoding("ram size mismatch"));
        }
        let scheduler = r
            .bytes(TAG_SCHEDULER)
            .ok_or(SnapshotError::InvalidFieldEncoding("missing timer section"))?;
        let doorbell = r
            .bytes(TAG_DOORBELL)
            .ok_or(SnapshotError::InvalidFieldEncoding("missing doorbell section"))?;
        let ipc = r
            .bytes(TAG_IPC)
            .ok_or(SnapshotError::InvalidFieldEncoding("missing ipc section"))?;

        // The dispatcher section is the one with rehydration side effects, so
        // it loads first; the remaining sections validate fully before they
        // mutate anything.
        self.ipc
            .load_state(ipc, &mut self.ram, &mut self.scheduler, &mut self.usb)?;
        self.scheduler.load_state(scheduler)?;
        self.doorbell.borrow_mut().load_state(doorbell)?;
        self.ram.write_bytes(0, ram);
        Ok(())
    }
}
