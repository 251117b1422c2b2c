//! Per-device node of the version-0 USB interface.
//!
//! Opening `/dev/usb/oh0/<vid>/<pid>` claims the matching physical device
//! exclusively on the peripheral bus. Control/bulk/interrupt/isochronous
//! ioctlvs become bus requests with the command-block address packed into the
//! transfer tag; the commands stay suspended until the completion comes back
//! and is flushed into a reply by the `update` hook. A removal hook suspends
//! until the device disappears from a published list.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use starlet_io_snapshot::{
    Decoder, Encoder, SnapshotError, SnapshotReader, SnapshotResult, SnapshotVersion,
    SnapshotWriter,
};
use starlet_memory::GuestMemory;
use starlet_usb::{
    restore_outstanding_tags, status, DeviceChangeListener, DeviceDescriptor, OpenDevice,
    TransferResult, TransferTag, UsbDeviceClient, UsbSetup,
};
use tracing::{debug, warn};

use crate::block::CommandBlock;
use crate::device::{DeviceRc, DeviceRegistry, Disposition, IpcContext, IpcDevice};
use crate::devices::usb_v0;
use crate::{fs_status, IoctlvBuffer};

const DEVICE_NAME_PREFIX: &str = "/dev/usb/oh0/";

/// Status written when the node has no backing physical device.
const NO_BACKING_DEVICE: i32 = -1;

/// Transfer payloads are bounded defensively; the interface's length fields
/// are 16-bit anyway.
const MAX_PAYLOAD_LEN: u32 = 0x1_0000;

fn parse_device_name(name: &str) -> Option<(u16, u16)> {
    let rest = name.strip_prefix(DEVICE_NAME_PREFIX)?;
    let (vid, pid) = rest.split_once('/')?;
    if pid.contains('/') {
        return None;
    }
    Some((
        u16::from_str_radix(vid, 16).ok()?,
        u16::from_str_radix(pid, 16).ok()?,
    ))
}

/// Tag layout: command address, isochronous packet count, packet-lengths
/// address, payload address: everything the completion path needs to finish
/// the command.
fn pack_tag(command: u32, num_packets: u32, lengths_addr: u32, payload_addr: u32) -> TransferTag {
    let mut tag = [0u8; 16];
    tag[0..4].copy_from_slice(&command.to_be_bytes());
    tag[4..8].copy_from_slice(&num_packets.to_be_bytes());
    tag[8..12].copy_from_slice(&lengths_addr.to_be_bytes());
    tag[12..16].copy_from_slice(&payload_addr.to_be_bytes());
    tag
}

fn unpack_tag(tag: &TransferTag) -> (u32, u32, u32, u32) {
    let word = |i: usize| u32::from_be_bytes([tag[i], tag[i + 1], tag[i + 2], tag[i + 3]]);
    (word(0), word(4), word(8), word(12))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CompletedTransfer {
    command: u32,
    num_packets: u32,
    lengths_addr: u32,
    payload_addr: u32,
    result: TransferResult,
}

pub struct UsbPassthroughDevice {
    name: String,
    device: Option<OpenDevice>,
    removal_command: Option<u32>,
    /// Completions delivered by the bus drain, awaiting the `update` hook to
    /// turn them into replies on the emulation thread.
    completed: VecDeque<CompletedTransfer>,
}

impl UsbPassthroughDevice {
    /// Factory for `/dev/usb/oh0/<vid>/<pid>` names. Each accepted name
    /// constructs a fresh node; exclusivity comes from the bus open-set, so a
    /// second concurrent open of the same hardware simply fails its Open.
    pub fn register(registry: &mut DeviceRegistry) {
        registry.register(|ctx, name| {
            let (vid, pid) = parse_device_name(name)?;
            debug!(name = %name, "opening usb passthrough node");

            let device = Rc::new(RefCell::new(UsbPassthroughDevice {
                name: name.to_string(),
                device: None,
                removal_command: None,
                completed: VecDeque::new(),
            }));
            ctx.usb.register_change_listener(device.clone());

            let opened = ctx.usb.open_vid_pid(vid, pid, device.clone());
            match opened {
                Ok(open) => device.borrow_mut().device = Some(open),
                Err(err) => warn!(name = %name, %err, "usb passthrough open failed"),
            }
            Some(device as DeviceRc)
        });
    }

    fn read_payload(mem: &dyn GuestMemory, addr: u32, len: u32) -> Vec<u8> {
        let len = len.min(MAX_PAYLOAD_LEN) as usize;
        let mut buf = vec![0u8; len];
        mem.read_bytes(addr, &mut buf);
        buf
    }
}

impl UsbDeviceClient for UsbPassthroughDevice {
    fn request_complete(&mut self, tag: &TransferTag, result: &TransferResult) {
        let (command, num_packets, lengths_addr, payload_addr) = unpack_tag(tag);
        debug!(
            command = format_args!("{command:#010x}"),
            status = result.status,
            "usb transfer complete"
        );
        self.completed.push_back(CompletedTransfer {
            command,
            num_packets,
            lengths_addr,
            payload_addr,
            result: result.clone(),
        });
    }
}

impl DeviceChangeListener for UsbPassthroughDevice {
    fn devices_changed(&mut self, devices: &[DeviceDescriptor]) {
        let Some(removal_command) = self.removal_command else {
            return;
        };
        let still_present = self
            .device
            .as_ref()
            .is_some_and(|open| devices.iter().any(|d| d.open_key == open.key()));
        if !still_present {
            debug!(device = %self.name, "removal hook fired");
            self.removal_command = None;
            self.completed.push_back(CompletedTransfer {
                command: removal_command,
                num_packets: 0,
                lengths_addr: 0,
                payload_addr: 0,
                result: TransferResult::from_status(fs_status::SUCCESS),
            });
        }
    }
}

impl IpcDevice for UsbPassthroughDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, _ctx: &mut IpcContext<'_>, _block: &CommandBlock, _mode: u32) -> i32 {
        if self.device.is_some() {
            fs_status::SUCCESS
        } else {
            warn!(device = %self.name, "open failed, no backing device");
            fs_status::ENOENT
        }
    }

    fn close(
        &mut self,
        ctx: &mut IpcContext<'_>,
        block: Option<&CommandBlock>,
        _force: bool,
    ) -> Disposition {
        if let Some(open) = self.device.take() {
            ctx.usb.close_device(open);
        }
        if let Some(block) = block {
            block.set_result(ctx.mem, fs_status::SUCCESS);
        }
        Disposition::Reply
    }

    fn ioctl(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        if self.device.is_none() {
            block.set_result(ctx.mem, NO_BACKING_DEVICE);
            return Disposition::Reply;
        }

        let request = block.arg(ctx.mem, 0);
        debug!(device = %self.name, request, "usb node ioctl");
        let status = match request {
            usb_v0::IOCTL_SUSPENDDEV | usb_v0::IOCTL_RESUMEDEV => fs_status::SUCCESS,
            usb_v0::IOCTL_RESET_DEVICE => {
                warn!(device = %self.name, "reset request ignored");
                fs_status::SUCCESS
            }
            usb_v0::IOCTL_DEVREMOVALHOOK => {
                if self.removal_command.is_some() {
                    fs_status::EINVAL
                } else {
                    self.removal_command = Some(block.address);
                    return Disposition::Suspend;
                }
            }
            _ => return self.unimplemented(ctx, block, "IOCtl"),
        };

        block.set_result(ctx.mem, status);
        Disposition::Reply
    }

    fn ioctlv(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        if self.device.is_none() {
            block.set_result(ctx.mem, NO_BACKING_DEVICE);
            return Disposition::Reply;
        }

        let v = IoctlvBuffer::parse(ctx.mem, block);
        debug!(device = %self.name, parameter = v.parameter, "usb node ioctlv");

        match v.parameter {
            usb_v0::IOCTLV_CTRLMSG => {
                let (Some(request_type), Some(request), Some(value), Some(index), Some(length)) = (
                    v.in_u8(ctx.mem, 0),
                    v.in_u8(ctx.mem, 1),
                    // Setup words are little-endian on the wire, unlike the
                    // corresponding fields of every other request.
                    v.in_u16_le(ctx.mem, 2),
                    v.in_u16_le(ctx.mem, 3),
                    v.in_u16_le(ctx.mem, 4),
                ) else {
                    return self.unimplemented(ctx, block, "CTRLMSG");
                };
                let Some(payload_buf) = v.payload_buffers.first().copied() else {
                    return self.unimplemented(ctx, block, "CTRLMSG");
                };

                let setup = UsbSetup {
                    request_type,
                    request,
                    value,
                    index,
                    length,
                };
                let payload = Self::read_payload(ctx.mem, payload_buf.address, payload_buf.size);
                let tag = pack_tag(block.address, 0, 0, payload_buf.address);
                self.device
                    .as_mut()
                    .expect("checked above")
                    .control_request(&setup, payload, tag);
                Disposition::Suspend
            }
            usb_v0::IOCTLV_BLKMSG | usb_v0::IOCTLV_INTRMSG => {
                let (Some(endpoint), Some(length), Some(data)) = (
                    v.in_u8(ctx.mem, 0),
                    v.in_u16(ctx.mem, 1),
                    v.in_buffers.get(2).copied(),
                ) else {
                    return self.unimplemented(ctx, block, "BLKMSG/INTRMSG");
                };

                let payload = Self::read_payload(ctx.mem, data.address, u32::from(length));
                let tag = pack_tag(block.address, 0, 0, data.address);
                let device = self.device.as_mut().expect("checked above");
                if v.parameter == usb_v0::IOCTLV_BLKMSG {
                    device.bulk_request(endpoint, payload, tag);
                } else {
                    device.interrupt_request(endpoint, payload, tag);
                }
                Disposition::Suspend
            }
            usb_v0::IOCTLV_ISOMSG => {
                let (Some(endpoint), Some(length), Some(num_packets)) = (
                    v.in_u8(ctx.mem, 0),
                    v.in_u16(ctx.mem, 1),
                    v.in_u8(ctx.mem, 2),
                ) else {
                    return self.unimplemented(ctx, block, "ISOMSG");
                };
                let (Some(lengths_buf), Some(data_buf)) = (
                    v.payload_buffers.first().copied(),
                    v.payload_buffers.get(1).copied(),
                ) else {
                    return self.unimplemented(ctx, block, "ISOMSG");
                };

                // Packet lengths are 12-bit; out-of-range bits are masked off.
                let mut packet_lengths = Vec::with_capacity(usize::from(num_packets));
                for i in 0..u32::from(num_packets) {
                    packet_lengths.push(ctx.mem.read_u16(lengths_buf.address + i * 2) & 0xFFF);
                }
                let payload = Self::read_payload(ctx.mem, data_buf.address, u32::from(length));
                let tag = pack_tag(
                    block.address,
                    u32::from(num_packets),
                    lengths_buf.address,
                    data_buf.address,
                );
                self.device
                    .as_mut()
                    .expect("checked above")
                    .isochronous_request(endpoint, payload, packet_lengths, tag);
                Disposition::Suspend
            }
            usb_v0::IOCTLV_LBLKMSG => {
                warn!(device = %self.name, "long bulk message unimplemented");
                block.set_result(ctx.mem, fs_status::EINVAL);
                Disposition::Reply
            }
            _ => self.unimplemented(ctx, block, "IOCtlV"),
        }
    }

    fn update(&mut self, ctx: &mut IpcContext<'_>) -> bool {
        let mut progressed = false;
        while let Some(done) = self.completed.pop_front() {
            let block = CommandBlock::new(done.command);
            if done.num_packets > 0 && done.result.status >= 0 {
                // Write back per-packet actual lengths for isochronous bursts.
                let count = done.result.packet_lengths.len().min(done.num_packets as usize);
                for (i, len) in done.result.packet_lengths[..count].iter().enumerate() {
                    ctx.mem.write_u16(done.lengths_addr + i as u32 * 2, *len);
                }
            }
            if !done.result.data.is_empty() {
                ctx.mem.write_bytes(done.payload_addr, &done.result.data);
            }
            block.set_result(ctx.mem, done.result.status);
            ctx.enqueue_reply(done.command, 0);
            progressed = true;
        }
        progressed
    }

    fn save_state(&self) -> Vec<u8> {
        const TAG_REMOVAL: u16 = 1;
        const TAG_TRANSFER_TAGS: u16 = 2;
        const TAG_UNDELIVERED: u16 = 3;

        let mut w = SnapshotWriter::new(*b"USBP", SnapshotVersion::new(1, 0));
        if let Some(addr) = self.removal_command {
            w.field_u32(TAG_REMOVAL, addr);
        }
        if let Some(open) = &self.device {
            w.field_bytes(TAG_TRANSFER_TAGS, open.save_outstanding_tags());
        }

        // Completions that arrived but have not been flushed to replies yet:
        // their commands must not be lost across a save-state.
        let mut enc = Encoder::new().u32(self.completed.len() as u32);
        for done in &self.completed {
            enc = enc.u32(done.command);
        }
        w.field_bytes(TAG_UNDELIVERED, enc.finish());

        w.finish()
    }

    /// Restore never resumes real-hardware I/O: every persisted transfer tag
    /// and undelivered completion is immediately completed disconnected, and
    /// the node comes back without a backing device (the factory may have
    /// reopened the hardware; that open is released here).
    fn load_state(&mut self, ctx: &mut IpcContext<'_>, bytes: &[u8]) -> SnapshotResult<()> {
        const TAG_REMOVAL: u16 = 1;
        const TAG_TRANSFER_TAGS: u16 = 2;
        const TAG_UNDELIVERED: u16 = 3;

        let r = SnapshotReader::parse(bytes, *b"USBP")?;
        r.ensure_device_major(1)?;

        let mut completed = VecDeque::new();
        if let Some(buf) = r.bytes(TAG_TRANSFER_TAGS) {
            restore_outstanding_tags(buf, |tag| {
                let (command, num_packets, lengths_addr, payload_addr) = unpack_tag(&tag);
                completed.push_back(CompletedTransfer {
                    command,
                    num_packets,
                    lengths_addr,
                    payload_addr,
                    result: TransferResult::from_status(status::DISCONNECTED),
                });
            })?;
        }
        if let Some(buf) = r.bytes(TAG_UNDELIVERED) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > 4096 {
                return Err(SnapshotError::InvalidFieldEncoding("undelivered count"));
            }
            for _ in 0..count {
                completed.push_back(CompletedTransfer {
                    command: d.u32()?,
                    num_packets: 0,
                    lengths_addr: 0,
                    payload_addr: 0,
                    result: TransferResult::from_status(status::DISCONNECTED),
                });
            }
            d.finish()?;
        }

        self.removal_command = r.u32(TAG_REMOVAL)?;
        self.completed = completed;
        if let Some(open) = self.device.take() {
            ctx.usb.close_device(open);
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
