//! Shared-memory command/response transport between the kernel and an
//! accelerator offload target.
//!
//! Two fixed-size SPSC rings (one per direction) plus a doorbell control
//! block make up the whole wire protocol (spec.md §6). Each ring and the
//! doorbell are genuinely byte-addressed: `RingHeader`/`DoorbellBlock` are
//! not just size-asserted placeholders, they are read and written directly
//! off the same bytes a peer on the other side of a mapped shared-memory
//! window would see, little-endian, at the documented offsets. `new()`
//! allocates its own backing bytes as a stand-in for a region an embedder
//! would otherwise obtain by calling `Platform::phys_to_virt` on the
//! physical address it handed to the accelerator.

use crate::error::{Error, Result};
use crate::platform::Platform;
use crate::time::Clock;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::cell::UnsafeCell;
use core::sync::atomic::{fence, Ordering};
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Magic stamped at the head of the doorbell control block ("DOOR", spec.md 6).
pub const DOORBELL_MAGIC: u32 = 0x444F_4F52;
pub const DOORBELL_VERSION: u32 = 1;

/// Ring magics (spec.md §6).
pub const CMD_RING_MAGIC: u32 = 0x51DE_CA9E;
pub const RSP_RING_MAGIC: u32 = 0x5253_5030;

/// 64-byte preamble each ring carries ahead of its entry array ("Ring
/// header"). This is the live on-wire state: `head`/`tail` are read and
/// written directly from these bytes, not mirrored from some other source.
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct RingHeader {
    pub magic: u32,
    pub head: u32,
    pub tail: u32,
    pub size: u32,
    pub reserved: [u32; 12],
}

const_assert_eq!(core::mem::size_of::<RingHeader>(), 64);

/// A command posted to the accelerator ("Command packet").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct CommandPacket {
    pub cmd: u16,
    pub flags: u16,
    pub payload_id: u32,
    pub timestamp_us: u64,
}

const_assert_eq!(core::mem::size_of::<CommandPacket>(), 16);

/// A response posted back by the accelerator ("Response packet").
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct ResponsePacket {
    pub status: u16,
    pub orig_cmd: u16,
    pub result: u32,
    pub timestamp_us: u64,
}

const_assert_eq!(core::mem::size_of::<ResponsePacket>(), 16);

/// Live doorbell control block, byte-for-byte.
#[derive(Debug, Clone, Copy, AsBytes, FromZeroes, FromBytes)]
#[repr(C)]
pub struct DoorbellBlock {
    pub magic: u32,
    pub version: u32,
    pub cmd_doorbell: u32,
    pub cmd_flags: u32,
    pub cmd_irq_count: u32,
    pub rsp_doorbell: u32,
    pub rsp_flags: u32,
    pub rsp_irq_count: u32,
    pub cmd_writes: u64,
    pub rsp_writes: u64,
    pub reserved: [u32; 52],
}

const_assert_eq!(core::mem::size_of::<DoorbellBlock>(), 256);

/// Command codes the kernel may post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CommandCode {
    Ping = 0x0001,
    Print = 0x0002,
    RunModel = 0x0010,
}

impl CommandCode {
    pub const fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0001 => CommandCode::Ping,
            0x0002 => CommandCode::Print,
            0x0010 => CommandCode::RunModel,
            _ => return None,
        })
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResponseStatus {
    Ok = 0x8000,
    Error = 0x8001,
    Busy = 0x8002,
}

impl ResponseStatus {
    pub const fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x8000 => ResponseStatus::Ok,
            0x8001 => ResponseStatus::Error,
            0x8002 => ResponseStatus::Busy,
            _ => return None,
        })
    }
}

bitflags! {
    /// Per-command flags.
    #[derive(Default)]
    pub struct CommandFlags: u16 {
        const IRQ_ON_COMPLETE = 0x0001;
    }
}

bitflags! {
    /// Doorbell flag byte, shared meaning for both the command and response
    /// sides.
    #[derive(Default)]
    pub struct DoorbellFlags: u32 {
        const IRQ_ENABLED = 0x01;
        const PENDING = 0x02;
    }
}

/// Command/response ring capacity. Matches spec.md's S5 worked example
/// ("command ring size 1024") and, with the 64-byte header, comfortably
/// fits inside the 32 KiB window §6 reserves per ring.
pub const COMMAND_RING_ENTRIES: usize = 1024;
pub const RESPONSE_RING_ENTRIES: usize = 1024;

/// Per-ring window reserved by the shared-memory layout (§6): 32 KiB each.
const RING_WINDOW_BYTES: usize = 32 * 1024;

static_assertions::const_assert!(COMMAND_RING_ENTRIES.is_power_of_two());
static_assertions::const_assert!(
    core::mem::size_of::<RingHeader>() + COMMAND_RING_ENTRIES * core::mem::size_of::<CommandPacket>() <= RING_WINDOW_BYTES
);

mod ring_layout {
    pub const MAGIC: usize = 0;
    pub const HEAD: usize = 4;
    pub const TAIL: usize = 8;
    pub const SIZE: usize = 12;
    pub const HEADER_LEN: usize = 64;
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn write_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn write_u64(buf: &mut [u8], off: usize, val: u64) {
    buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

/// Single-producer/single-consumer ring of [`CommandPacket`]s, backed by a
/// real byte buffer laid out exactly as spec.md §6 describes: a
/// [`RingHeader`] followed by `COMMAND_RING_ENTRIES` 16-byte slots. The
/// kernel is the sole producer (`push`), the accelerator is the sole
/// consumer (`pop`); swapped for [`ResponseRing`]. A `Release` fence between
/// writing the slot and publishing the new `tail` keeps this safe without a
/// lock, the same ordering the nyx-os submission queue uses.
pub struct CommandRing {
    bytes: UnsafeCell<Vec<u8>>,
}

unsafe impl Sync for CommandRing {}

impl CommandRing {
    fn entry_offset(idx: usize) -> usize {
        ring_layout::HEADER_LEN + idx * core::mem::size_of::<CommandPacket>()
    }

    pub fn new() -> Self {
        let mut buf = vec![0u8; ring_layout::HEADER_LEN + COMMAND_RING_ENTRIES * core::mem::size_of::<CommandPacket>()];
        write_u32(&mut buf, ring_layout::MAGIC, CMD_RING_MAGIC);
        write_u32(&mut buf, ring_layout::SIZE, COMMAND_RING_ENTRIES as u32);
        CommandRing { bytes: UnsafeCell::new(buf) }
    }

    /// Read the live 64-byte header straight off the backing bytes.
    pub fn header(&self) -> RingHeader {
        let buf = unsafe { &*self.bytes.get() };
        RingHeader::read_from_prefix(&buf[..ring_layout::HEADER_LEN]).expect("ring header bytes")
    }

    pub fn len(&self) -> usize {
        let buf = unsafe { &*self.bytes.get() };
        let head = read_u32(buf, ring_layout::HEAD);
        let tail = read_u32(buf, ring_layout::TAIL);
        tail.wrapping_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side. `Err(RingFull)` if the ring has `COMMAND_RING_ENTRIES`
    /// entries outstanding ("producer observes full").
    pub fn push(&self, packet: CommandPacket) -> Result<()> {
        let buf = unsafe { &mut *self.bytes.get() };
        let head = read_u32(buf, ring_layout::HEAD);
        let tail = read_u32(buf, ring_layout::TAIL);
        if tail.wrapping_sub(head) as usize >= COMMAND_RING_ENTRIES {
            return Err(Error::RingFull);
        }
        let idx = (tail as usize) & (COMMAND_RING_ENTRIES - 1);
        let off = Self::entry_offset(idx);
        buf[off..off + core::mem::size_of::<CommandPacket>()].copy_from_slice(packet.as_bytes());
        fence(Ordering::Release);
        write_u32(buf, ring_layout::TAIL, tail.wrapping_add(1));
        Ok(())
    }

    /// Consumer side. `Err(RingEmpty)` if `head == tail`.
    pub fn pop(&self) -> Result<CommandPacket> {
        let buf = unsafe { &mut *self.bytes.get() };
        let head = read_u32(buf, ring_layout::HEAD);
        let tail = read_u32(buf, ring_layout::TAIL);
        if head == tail {
            return Err(Error::RingEmpty);
        }
        let idx = (head as usize) & (COMMAND_RING_ENTRIES - 1);
        let off = Self::entry_offset(idx);
        let packet = CommandPacket::read_from_prefix(&buf[off..off + core::mem::size_of::<CommandPacket>()]).expect("command packet bytes");
        fence(Ordering::Acquire);
        write_u32(buf, ring_layout::HEAD, head.wrapping_add(1));
        Ok(packet)
    }
}

/// Mirror of [`CommandRing`], accelerator-to-kernel direction.
pub struct ResponseRing {
    bytes: UnsafeCell<Vec<u8>>,
}

unsafe impl Sync for ResponseRing {}

impl ResponseRing {
    fn entry_offset(idx: usize) -> usize {
        ring_layout::HEADER_LEN + idx * core::mem::size_of::<ResponsePacket>()
    }

    pub fn new() -> Self {
        let mut buf = vec![0u8; ring_layout::HEADER_LEN + RESPONSE_RING_ENTRIES * core::mem::size_of::<ResponsePacket>()];
        write_u32(&mut buf, ring_layout::MAGIC, RSP_RING_MAGIC);
        write_u32(&mut buf, ring_layout::SIZE, RESPONSE_RING_ENTRIES as u32);
        ResponseRing { bytes: UnsafeCell::new(buf) }
    }

    pub fn header(&self) -> RingHeader {
        let buf = unsafe { &*self.bytes.get() };
        RingHeader::read_from_prefix(&buf[..ring_layout::HEADER_LEN]).expect("ring header bytes")
    }

    pub fn len(&self) -> usize {
        let buf = unsafe { &*self.bytes.get() };
        let head = read_u32(buf, ring_layout::HEAD);
        let tail = read_u32(buf, ring_layout::TAIL);
        tail.wrapping_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, packet: ResponsePacket) -> Result<()> {
        let buf = unsafe { &mut *self.bytes.get() };
        let head = read_u32(buf, ring_layout::HEAD);
        let tail = read_u32(buf, ring_layout::TAIL);
        if tail.wrapping_sub(head) as usize >= RESPONSE_RING_ENTRIES {
            return Err(Error::RingFull);
        }
        let idx = (tail as usize) & (RESPONSE_RING_ENTRIES - 1);
        let off = Self::entry_offset(idx);
        buf[off..off + core::mem::size_of::<ResponsePacket>()].copy_from_slice(packet.as_bytes());
        fence(Ordering::Release);
        write_u32(buf, ring_layout::TAIL, tail.wrapping_add(1));
        Ok(())
    }

    pub fn pop(&self) -> Result<ResponsePacket> {
        let buf = unsafe { &mut *self.bytes.get() };
        let head = read_u32(buf, ring_layout::HEAD);
        let tail = read_u32(buf, ring_layout::TAIL);
        if head == tail {
            return Err(Error::RingEmpty);
        }
        let idx = (head as usize) & (RESPONSE_RING_ENTRIES - 1);
        let off = Self::entry_offset(idx);
        let packet = ResponsePacket::read_from_prefix(&buf[off..off + core::mem::size_of::<ResponsePacket>()]).expect("response packet bytes");
        fence(Ordering::Acquire);
        write_u32(buf, ring_layout::HEAD, head.wrapping_add(1));
        Ok(packet)
    }
}

mod doorbell_layout {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const CMD_DOORBELL: usize = 8;
    pub const CMD_FLAGS: usize = 12;
    pub const CMD_IRQ_COUNT: usize = 16;
    pub const RSP_DOORBELL: usize = 20;
    pub const RSP_FLAGS: usize = 24;
    pub const RSP_IRQ_COUNT: usize = 28;
    pub const CMD_WRITES: usize = 32;
    pub const RSP_WRITES: usize = 40;
    pub const LEN: usize = 256;
}

/// Live doorbell state, byte-addressed exactly as [`DoorbellBlock`]
/// describes. Ringing increments a write counter and the doorbell itself;
/// it additionally raises `PENDING` only when `IRQ_ENABLED` is set, matching
/// spec.md 4.6's "IRQ semantics are opt-in per side".
pub struct Doorbell {
    bytes: UnsafeCell<Vec<u8>>,
}

unsafe impl Sync for Doorbell {}

impl Doorbell {
    pub fn new() -> Self {
        let mut buf = vec![0u8; doorbell_layout::LEN];
        write_u32(&mut buf, doorbell_layout::MAGIC, DOORBELL_MAGIC);
        write_u32(&mut buf, doorbell_layout::VERSION, DOORBELL_VERSION);
        Doorbell { bytes: UnsafeCell::new(buf) }
    }

    fn with_buf<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let buf = unsafe { &mut *self.bytes.get() };
        f(buf)
    }

    pub fn enable_cmd_irq(&self) {
        self.with_buf(|buf| {
            let flags = read_u32(buf, doorbell_layout::CMD_FLAGS) | DoorbellFlags::IRQ_ENABLED.bits();
            write_u32(buf, doorbell_layout::CMD_FLAGS, flags);
        });
    }

    pub fn enable_rsp_irq(&self) {
        self.with_buf(|buf| {
            let flags = read_u32(buf, doorbell_layout::RSP_FLAGS) | DoorbellFlags::IRQ_ENABLED.bits();
            write_u32(buf, doorbell_layout::RSP_FLAGS, flags);
        });
    }

    pub fn ring_cmd(&self) {
        self.with_buf(|buf| {
            let writes = read_u64(buf, doorbell_layout::CMD_WRITES) + 1;
            write_u64(buf, doorbell_layout::CMD_WRITES, writes);
            let doorbell = read_u32(buf, doorbell_layout::CMD_DOORBELL) + 1;
            fence(Ordering::Release);
            write_u32(buf, doorbell_layout::CMD_DOORBELL, doorbell);
            let flags = read_u32(buf, doorbell_layout::CMD_FLAGS);
            if flags & DoorbellFlags::IRQ_ENABLED.bits() != 0 {
                write_u32(buf, doorbell_layout::CMD_FLAGS, flags | DoorbellFlags::PENDING.bits());
                let irq_count = read_u32(buf, doorbell_layout::CMD_IRQ_COUNT) + 1;
                write_u32(buf, doorbell_layout::CMD_IRQ_COUNT, irq_count);
            }
        });
    }

    pub fn ring_rsp(&self) {
        self.with_buf(|buf| {
            let writes = read_u64(buf, doorbell_layout::RSP_WRITES) + 1;
            write_u64(buf, doorbell_layout::RSP_WRITES, writes);
            let doorbell = read_u32(buf, doorbell_layout::RSP_DOORBELL) + 1;
            fence(Ordering::Release);
            write_u32(buf, doorbell_layout::RSP_DOORBELL, doorbell);
            let flags = read_u32(buf, doorbell_layout::RSP_FLAGS);
            if flags & DoorbellFlags::IRQ_ENABLED.bits() != 0 {
                write_u32(buf, doorbell_layout::RSP_FLAGS, flags | DoorbellFlags::PENDING.bits());
                let irq_count = read_u32(buf, doorbell_layout::RSP_IRQ_COUNT) + 1;
                write_u32(buf, doorbell_layout::RSP_IRQ_COUNT, irq_count);
            }
        });
    }

    pub fn cmd_pending(&self) -> bool {
        let buf = unsafe { &*self.bytes.get() };
        fence(Ordering::Acquire);
        read_u32(buf, doorbell_layout::CMD_FLAGS) & DoorbellFlags::PENDING.bits() != 0
    }

    pub fn rsp_pending(&self) -> bool {
        let buf = unsafe { &*self.bytes.get() };
        fence(Ordering::Acquire);
        read_u32(buf, doorbell_layout::RSP_FLAGS) & DoorbellFlags::PENDING.bits() != 0
    }

    pub fn ack_cmd(&self) {
        self.with_buf(|buf| {
            let flags = read_u32(buf, doorbell_layout::CMD_FLAGS) & !DoorbellFlags::PENDING.bits();
            write_u32(buf, doorbell_layout::CMD_FLAGS, flags);
            fence(Ordering::Release);
        });
    }

    pub fn ack_rsp(&self) {
        self.with_buf(|buf| {
            let flags = read_u32(buf, doorbell_layout::RSP_FLAGS) & !DoorbellFlags::PENDING.bits();
            write_u32(buf, doorbell_layout::RSP_FLAGS, flags);
            fence(Ordering::Release);
        });
    }

    /// Read the live 256-byte control block straight off the backing bytes.
    pub fn snapshot(&self) -> DoorbellBlock {
        let buf = unsafe { &*self.bytes.get() };
        DoorbellBlock::read_from_prefix(buf).expect("doorbell block bytes")
    }
}

/// The whole transport: one ring per direction plus the doorbell. Owned by
/// the kernel side; an accelerator-side stand-in drains `commands`/fills
/// `responses` directly in tests.
pub struct IpcTransport {
    pub commands: CommandRing,
    pub responses: ResponseRing,
    pub doorbell: Doorbell,
}

impl IpcTransport {
    pub fn new() -> Self {
        IpcTransport {
            commands: CommandRing::new(),
            responses: ResponseRing::new(),
            doorbell: Doorbell::new(),
        }
    }

    /// Post a command and ring the doorbell.
    pub fn send_command(
        &self,
        platform: &dyn Platform,
        clock: &Clock,
        cmd: CommandCode,
        flags: CommandFlags,
        payload_id: u32,
    ) -> Result<()> {
        let packet = CommandPacket {
            cmd: cmd as u16,
            flags: flags.bits(),
            payload_id,
            timestamp_us: clock.now_us(platform),
        };
        self.commands.push(packet)?;
        self.doorbell.ring_cmd();
        Ok(())
    }

    /// Non-blocking poll for a response.
    pub fn try_recv_response(&self) -> Result<ResponsePacket> {
        let packet = self.responses.pop()?;
        self.doorbell.ack_rsp();
        Ok(packet)
    }
}
