//! The IPI3 message frame, byte for byte.
//!
//! Both directions are exactly 32 bytes and little-endian. The layout is shared
//! with the peer firmware, so every offset is spelled out here rather than left
//! to struct layout.

use arrayvec::ArrayVec;
use bitfield_struct::bitfield;
use bitflags::bitflags;
use core::fmt;
use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use static_assertions::const_assert;
use thiserror_no_std::Error;

pub const FRAME_SIZE: usize = 32;
pub const HEADER_SIZE: usize = 2;
pub const INLINE_TEXT_MAX: usize = FRAME_SIZE - HEADER_SIZE - 1;
pub const PTR_PRINT_TEXT_MAX: usize = FRAME_SIZE - 20;

pub type RawFrame = [u8; FRAME_SIZE];
pub type InlineText = ArrayVec<u8, INLINE_TEXT_MAX>;

const FIRE_AND_FORGET_BIT: u8 = 0x80;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FunctionCode {
    /// Print text from a DDR buffer that must stay valid until the response.
    PtrPrint = 0x00,
    DdrLoBlockAlloc = 0x01,
    DdrHiBlockAlloc = 0x02,
    FetchBootData = 0x03,

    InlinePrint = FIRE_AND_FORGET_BIT,
    DdrLoBlockFree = FIRE_AND_FORGET_BIT | 0x01,
    DdrHiBlockFree = FIRE_AND_FORGET_BIT | 0x02,
    BootComplete = FIRE_AND_FORGET_BIT | 0x04,
    CpuWakeOrSleep = FIRE_AND_FORGET_BIT | 0x06,
    DeviceWakeOrSleep = FIRE_AND_FORGET_BIT | 0x07,
}

impl FunctionCode {
    /// The peer sends no response for these.
    pub const fn is_fire_and_forget(self) -> bool {
        self as u8 & FIRE_AND_FORGET_BIT != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, IntoPrimitive)]
#[repr(i8)]
pub enum ResponseResult {
    Success = 1,
    #[num_enum(default)]
    UnknownFailure = 0,
    OutOfMemory = -1,
    BadParameters = -2,
}

#[bitfield(u8)]
pub struct HeaderFlags {
    /// Payload lives in a DDR buffer instead of the frame.
    pub ddr_ptr: bool,
    #[bits(7)]
    _reserved: u8,
}

#[bitfield(u8)]
struct InlineLength {
    #[bits(3)]
    _reserved: u8,
    #[bits(5)]
    size: u8,
}

/// Opaque 4 character tag the peer prints next to allocations.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceTag(pub u32);

impl ServiceTag {
    pub const MMU: ServiceTag = ServiceTag::from_ascii(*b"MMU ");

    pub const fn from_ascii(chars: [u8; 4]) -> Self {
        ServiceTag(u32::from_be_bytes(chars))
    }
}

impl fmt::Debug for ServiceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let chars = self.0.to_be_bytes();
        match core::str::from_utf8(&chars) {
            Ok(s) => write!(f, "ServiceTag({:?})", s),
            Err(_) => write!(f, "ServiceTag({:#010x})", self.0),
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct Cpus: u8 {
        const A53_0 = 1 << 0;
        const A53_1 = 1 << 1;
        const A53_2 = 1 << 2;
        const A53_3 = 1 << 3;
        const R5F_0 = 1 << 4;
        const R5F_1 = 1 << 5;
    }
}

impl Cpus {
    // One flag byte per core on the wire, in this order.
    const WIRE_ORDER: [Cpus; 6] = [
        Cpus::A53_0,
        Cpus::A53_1,
        Cpus::A53_2,
        Cpus::A53_3,
        Cpus::R5F_0,
        Cpus::R5F_1,
    ];

    fn write_flags(self, out: &mut [u8]) {
        for (byte, cpu) in out.iter_mut().zip(Self::WIRE_ORDER) {
            *byte = self.contains(cpu) as u8;
        }
    }

    fn read_flags(src: &[u8]) -> Self {
        src.iter()
            .zip(Self::WIRE_ORDER)
            .filter(|(byte, _)| **byte != 0)
            .fold(Cpus::empty(), |acc, (_, cpu)| acc | cpu)
    }
}

/// State the boot loader leaves with the peer for later stages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct BootData {
    /// Physical address of the page-table manager storage.
    pub mmu: u64,
    pub boot_code_start: u32,
    pub boot_code_size: u32,
    pub video_block: u32,
}

impl BootData {
    pub const SIZE: usize = 24;

    fn write_to(&self, out: &mut [u8]) {
        put_u64(out, 0, self.mmu);
        put_u32(out, 8, self.boot_code_start);
        put_u32(out, 12, self.boot_code_size);
        put_u32(out, 16, self.video_block);
        put_u32(out, 20, 0);
    }

    fn read_from(src: &[u8]) -> Self {
        BootData {
            mmu: get_u64(src, 0),
            boot_code_start: get_u32(src, 8),
            boot_code_size: get_u32(src, 12),
            video_block: get_u32(src, 16),
        }
    }
}

const_assert!(BootData::SIZE <= FRAME_SIZE - HEADER_SIZE);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockAlloc {
    pub blocks_64kb: u32,
    pub tag: ServiceTag,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockFree {
    pub block_count: u16,
    /// Byte offset from the base of the DDR window.
    pub offset: u32,
    pub tag: ServiceTag,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DdrPacket {
    pub address: u64,
    /// Includes the 32 byte frame at the start of the packet.
    pub size: u32,
    pub text: [u8; PTR_PRINT_TEXT_MAX],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct CpuWakeOrSleep {
    pub sleep: Cpus,
    pub wake: Cpus,
    pub wake_address: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DeviceWakeOrSleep {
    pub sleep_fpga: bool,
    pub wake_fpga: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown function code {0:#04x}")]
    UnknownFunction(u8),
    #[error("inline print length {0} is longer than the frame")]
    BadInlineLength(u8),
}

/// A request from this core to the peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    PtrPrint(DdrPacket),
    DdrLoBlockAlloc(BlockAlloc),
    DdrHiBlockAlloc(BlockAlloc),
    FetchBootData,
    InlinePrint(InlineText),
    DdrLoBlockFree(BlockFree),
    DdrHiBlockFree(BlockFree),
    BootComplete(BootData),
    CpuWakeOrSleep(CpuWakeOrSleep),
    DeviceWakeOrSleep(DeviceWakeOrSleep),
}

impl Request {
    pub fn function(&self) -> FunctionCode {
        match self {
            Request::PtrPrint(_) => FunctionCode::PtrPrint,
            Request::DdrLoBlockAlloc(_) => FunctionCode::DdrLoBlockAlloc,
            Request::DdrHiBlockAlloc(_) => FunctionCode::DdrHiBlockAlloc,
            Request::FetchBootData => FunctionCode::FetchBootData,
            Request::InlinePrint(_) => FunctionCode::InlinePrint,
            Request::DdrLoBlockFree(_) => FunctionCode::DdrLoBlockFree,
            Request::DdrHiBlockFree(_) => FunctionCode::DdrHiBlockFree,
            Request::BootComplete(_) => FunctionCode::BootComplete,
            Request::CpuWakeOrSleep(_) => FunctionCode::CpuWakeOrSleep,
            Request::DeviceWakeOrSleep(_) => FunctionCode::DeviceWakeOrSleep,
        }
    }

    pub fn is_fire_and_forget(&self) -> bool {
        self.function().is_fire_and_forget()
    }

    pub fn encode(&self) -> RawFrame {
        let mut frame = [0u8; FRAME_SIZE];
        let mut flags = HeaderFlags::new();
        frame[0] = self.function().into();

        match self {
            Request::PtrPrint(packet) => {
                flags.set_ddr_ptr(true);
                put_u64(&mut frame, 8, packet.address);
                put_u32(&mut frame, 16, packet.size);
                frame[20..].copy_from_slice(&packet.text);
            }
            Request::DdrLoBlockAlloc(alloc) | Request::DdrHiBlockAlloc(alloc) => {
                put_u32(&mut frame, 4, alloc.blocks_64kb);
                put_u32(&mut frame, 8, alloc.tag.0);
            }
            Request::FetchBootData => {}
            Request::InlinePrint(text) => {
                frame[2] = InlineLength::new().with_size(text.len() as u8).into();
                frame[3..3 + text.len()].copy_from_slice(text);
            }
            Request::DdrLoBlockFree(free) | Request::DdrHiBlockFree(free) => {
                put_u16(&mut frame, 2, free.block_count);
                put_u32(&mut frame, 4, free.offset);
                put_u32(&mut frame, 8, free.tag.0);
            }
            Request::BootComplete(data) => data.write_to(&mut frame[2..2 + BootData::SIZE]),
            Request::CpuWakeOrSleep(cpus) => {
                cpus.sleep.write_flags(&mut frame[2..8]);
                cpus.wake.write_flags(&mut frame[8..14]);
                put_u64(&mut frame, 14, cpus.wake_address);
            }
            Request::DeviceWakeOrSleep(device) => {
                frame[2] = device.sleep_fpga as u8;
                frame[3] = device.wake_fpga as u8;
            }
        }

        frame[1] = flags.into();
        frame
    }

    pub fn decode(frame: &RawFrame) -> Result<Self, FrameError> {
        let function = FunctionCode::try_from(frame[0])
            .map_err(|_| FrameError::UnknownFunction(frame[0]))?;

        let alloc = || BlockAlloc {
            blocks_64kb: get_u32(frame, 4),
            tag: ServiceTag(get_u32(frame, 8)),
        };
        let free = || BlockFree {
            block_count: get_u16(frame, 2),
            offset: get_u32(frame, 4),
            tag: ServiceTag(get_u32(frame, 8)),
        };

        let request = match function {
            FunctionCode::PtrPrint => {
                let mut text = [0u8; PTR_PRINT_TEXT_MAX];
                text.copy_from_slice(&frame[20..]);
                Request::PtrPrint(DdrPacket {
                    address: get_u64(frame, 8),
                    size: get_u32(frame, 16),
                    text,
                })
            }
            FunctionCode::DdrLoBlockAlloc => Request::DdrLoBlockAlloc(alloc()),
            FunctionCode::DdrHiBlockAlloc => Request::DdrHiBlockAlloc(alloc()),
            FunctionCode::FetchBootData => Request::FetchBootData,
            FunctionCode::InlinePrint => {
                let size = InlineLength::from(frame[2]).size();
                if size as usize > INLINE_TEXT_MAX {
                    return Err(FrameError::BadInlineLength(size));
                }
                let mut text = InlineText::new();
                text.extend(frame[3..3 + size as usize].iter().copied());
                Request::InlinePrint(text)
            }
            FunctionCode::DdrLoBlockFree => Request::DdrLoBlockFree(free()),
            FunctionCode::DdrHiBlockFree => Request::DdrHiBlockFree(free()),
            FunctionCode::BootComplete => {
                Request::BootComplete(BootData::read_from(&frame[2..2 + BootData::SIZE]))
            }
            FunctionCode::CpuWakeOrSleep => Request::CpuWakeOrSleep(CpuWakeOrSleep {
                sleep: Cpus::read_flags(&frame[2..8]),
                wake: Cpus::read_flags(&frame[8..14]),
                wake_address: get_u64(frame, 14),
            }),
            FunctionCode::DeviceWakeOrSleep => Request::DeviceWakeOrSleep(DeviceWakeOrSleep {
                sleep_fpga: frame[2] != 0,
                wake_fpga: frame[3] != 0,
            }),
        };
        Ok(request)
    }
}

/// A reply from the peer. The payload meaning depends on the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Response {
    pub result: ResponseResult,
    pub payload: [u8; FRAME_SIZE - 1],
}

impl Response {
    pub const fn new(result: ResponseResult) -> Self {
        Response {
            result,
            payload: [0; FRAME_SIZE - 1],
        }
    }

    pub fn allocated(offset: u32) -> Self {
        let mut response = Response::new(ResponseResult::Success);
        put_u32(&mut response.payload, 0, offset);
        response
    }

    pub fn with_boot_data(data: &BootData) -> Self {
        let mut response = Response::new(ResponseResult::Success);
        data.write_to(&mut response.payload[..BootData::SIZE]);
        response
    }

    /// Byte offset from the DDR window base for block allocations.
    pub fn block_offset(&self) -> u32 {
        get_u32(&self.payload, 0)
    }

    pub fn boot_data(&self) -> BootData {
        BootData::read_from(&self.payload[..BootData::SIZE])
    }

    pub fn encode(&self) -> RawFrame {
        let mut frame = [0u8; FRAME_SIZE];
        frame[0] = i8::from(self.result) as u8;
        frame[1..].copy_from_slice(&self.payload);
        frame
    }

    pub fn decode(frame: &RawFrame) -> Self {
        let mut payload = [0u8; FRAME_SIZE - 1];
        payload.copy_from_slice(&frame[1..]);
        Response {
            result: ResponseResult::from(frame[0] as i8),
            payload,
        }
    }
}

fn put_u16(out: &mut [u8], at: usize, value: u16) {
    out[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(out: &mut [u8], at: usize, value: u32) {
    out[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(out: &mut [u8], at: usize, value: u64) {
    out[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u16(src: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([src[at], src[at + 1]])
}

fn get_u32(src: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([src[at], src[at + 1], src[at + 2], src[at + 3]])
}

fn get_u64(src: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&src[at..at + 8]);
    u64::from_le_bytes(bytes)
}
