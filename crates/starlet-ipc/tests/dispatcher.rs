//! Dispatcher behavior: descriptor capacity, status codes, the completion
//! fixups, and reply-order pacing.

mod util;

use std::cell::RefCell;
use std::rc::Rc;

use starlet_ipc::{
    fs_status, CommandBlock, DeviceRegistry, Disposition, IpcContext, IpcDevice,
    CMD_CLOSE, CMD_IOCTL, CMD_REPLY_SENTINEL, IPC_MAX_FDS,
};
use util::Rig;

/// Minimal backend with a configurable reply delay.
struct TestDevice {
    name: String,
    delay: u64,
}

impl IpcDevice for TestDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, _ctx: &mut IpcContext<'_>, _block: &CommandBlock, _mode: u32) -> i32 {
        fs_status::SUCCESS
    }

    fn ioctl(&mut self, ctx: &mut IpcContext<'_>, block: &CommandBlock) -> Disposition {
        block.set_result(ctx.mem, fs_status::SUCCESS);
        Disposition::Reply
    }

    fn cmd_delay(&mut self, _ctx: &mut IpcContext<'_>, _block: &CommandBlock) -> u64 {
        self.delay
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

fn register_test_devices(registry: &mut DeviceRegistry, prefix: &'static str, delay: u64) {
    registry.register(move |_ctx, name| {
        name.starts_with(prefix).then(|| {
            Rc::new(RefCell::new(TestDevice {
                name: name.to_string(),
                delay,
            })) as starlet_ipc::device::DeviceRc
        })
    });
}

#[test]
fn opens_grant_distinct_descriptors_until_the_table_is_exhausted() {
    let mut rig = Rig::new(|registry| register_test_devices(registry, "/dev/test/", 0));

    let mut fds = Vec::new();
    for i in 0..IPC_MAX_FDS {
        let fd = rig.open(0x1000 + i as u32 * 0x100, &format!("/dev/test/{i}"));
        assert!(fd >= 0, "open {i} failed: {fd}");
        assert!(!fds.contains(&fd));
        fds.push(fd);
    }

    // Table full.
    let fd = rig.open(0x8000, "/dev/test/overflow");
    assert_eq!(fd, fs_status::EFDEXHAUSTED);

    // Closing frees the slot for the next open, lowest-slot-first.
    let close_addr = 0x9000;
    rig.write_command_block(close_addr, CMD_CLOSE, fds[5]);
    rig.post(close_addr);
    rig.run_until_replied(close_addr, 64);
    assert_eq!(rig.result(close_addr), fs_status::SUCCESS);

    let fd = rig.open(0xA000, "/dev/test/again");
    assert_eq!(fd, fds[5]);
}

#[test]
fn unknown_device_names_report_no_such_device() {
    let mut rig = Rig::new(|registry| register_test_devices(registry, "/dev/test/", 0));
    assert_eq!(rig.open(0x1000, "/dev/nonexistent"), fs_status::ENOENT);
    assert_eq!(rig.dispatcher.open_descriptor_count(), 0);
}

#[test]
fn operations_on_bad_descriptors_report_invalid() {
    let mut rig = Rig::new(|registry| register_test_devices(registry, "/dev/test/", 0));

    for fd in [-1, 0, 7, IPC_MAX_FDS as i32, 0x7FFF_FFFF] {
        let addr = 0x2000;
        rig.write_ioctl_block(addr, fd, 1, (0, 0), (0, 0));
        rig.post(addr);
        rig.run_until_replied(addr, 64);
        assert_eq!(rig.result(addr), fs_status::EINVAL, "fd {fd}");
    }
}

#[test]
fn completed_commands_carry_the_sentinel_and_echo_the_kind() {
    let mut rig = Rig::new(|registry| register_test_devices(registry, "/dev/test/", 0));
    let fd = rig.open(0x1000, "/dev/test/a");

    let addr = 0x2000;
    rig.write_ioctl_block(addr, fd, 42, (0, 0), (0, 0));
    rig.post(addr);
    rig.run_until_replied(addr, 64);

    use starlet_memory::GuestMemory;
    assert_eq!(rig.ram.read_u32(addr), CMD_REPLY_SENTINEL);
    assert_eq!(rig.ram.read_u32(addr + 8), CMD_IOCTL);
    assert_eq!(rig.result(addr), fs_status::SUCCESS);
}

#[test]
fn a_fast_reply_never_overtakes_an_earlier_slow_one() {
    let mut rig = Rig::new(|registry| {
        register_test_devices(registry, "/dev/slow/", 1000);
        register_test_devices(registry, "/dev/fast/", 10);
    });
    let slow = rig.open(0x1000, "/dev/slow/a");
    let fast = rig.open(0x1100, "/dev/fast/b");

    // The slow command goes in first; the fast one a tick later.
    let slow_addr = 0x2000;
    let fast_addr = 0x2100;
    rig.write_ioctl_block(slow_addr, slow, 1, (0, 0), (0, 0));
    rig.write_ioctl_block(fast_addr, fast, 1, (0, 0), (0, 0));
    rig.post(slow_addr);
    rig.step(1);
    rig.guest_ack();
    rig.post(fast_addr);

    let replies = rig.collect_replies(2000);
    assert_eq!(replies.len(), 2);
    let (slow_time, first_addr) = replies[0];
    let (fast_time, second_addr) = replies[1];
    assert_eq!(first_addr, slow_addr);
    assert_eq!(second_addr, fast_addr);

    // The slow device's 1000-tick delay lands first; the fast command's reply
    // is clamped behind the watermark rather than arriving ~10 ticks in.
    assert!(slow_time >= 1000, "slow reply at {slow_time}");
    assert!(fast_time >= slow_time, "fast reply at {fast_time} overtook {slow_time}");
    assert!(
        fast_time < slow_time + 100,
        "fast reply should ride the watermark, got {fast_time}"
    );
}

#[test]
fn update_delivers_at_most_one_reply_per_slice() {
    let mut rig = Rig::new(|registry| register_test_devices(registry, "/dev/test/", 0));
    let fd = rig.open(0x1000, "/dev/test/a");

    // Two requests queued back to back; each slice acknowledges or delivers
    // one thing, so replies arrive on distinct ticks.
    let a = 0x2000;
    let b = 0x2100;
    rig.write_ioctl_block(a, fd, 1, (0, 0), (0, 0));
    rig.write_ioctl_block(b, fd, 1, (0, 0), (0, 0));
    rig.post(a);
    rig.post(b);

    let replies = rig.collect_replies(64);
    assert_eq!(replies.len(), 2);
    assert_eq!(replies[0].1, a);
    assert_eq!(replies[1].1, b);
    assert!(replies[0].0 < replies[1].0);
}

#[test]
fn close_on_a_shared_backend_destroys_it_only_at_zero_references() {
    // A singleton factory: both opens share one backend.
    let shared: Rc<RefCell<Option<starlet_ipc::device::DeviceRc>>> = Rc::new(RefCell::new(None));
    let mut rig = Rig::new(|registry| {
        let shared = shared.clone();
        registry.register(move |_ctx, name| {
            if name != "/dev/test/shared" {
                return None;
            }
            let mut cached = shared.borrow_mut();
            Some(
                cached
                    .get_or_insert_with(|| {
                        Rc::new(RefCell::new(TestDevice {
                            name: name.to_string(),
                            delay: 0,
                        })) as starlet_ipc::device::DeviceRc
                    })
                    .clone(),
            )
        });
    });

    let fd_a = rig.open(0x1000, "/dev/test/shared");
    let fd_b = rig.open(0x1100, "/dev/test/shared");
    assert_ne!(fd_a, fd_b);
    assert!(rig.dispatcher.device_by_name("/dev/test/shared").is_some());

    let close = 0x2000;
    rig.write_command_block(close, CMD_CLOSE, fd_a);
    rig.post(close);
    rig.run_until_replied(close, 64);
    assert!(
        rig.dispatcher.device_by_name("/dev/test/shared").is_some(),
        "backend lives while a descriptor still refers to it"
    );

    rig.write_command_block(close, CMD_CLOSE, fd_b);
    rig.post(close);
    rig.run_until_replied(close, 64);
    assert!(rig.dispatcher.device_by_name("/dev/test/shared").is_none());
}
