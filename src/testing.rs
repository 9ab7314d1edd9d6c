//! Host doubles for the hardware and the OS service peer.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::vec::Vec;

use crate::cache::CacheMaintenance;
use crate::ipi::frame::{BootData, Request, Response, ResponseResult};
use crate::ipi::{RawFrame, Transport};
use crate::mmu::regs::TranslationRegisters;
use crate::os_services::BLOCK_SIZE;
use crate::phys::{PhysAddr, PhysMemory};

/// Plays the PMU side of the protocol. Allocations hand out increasing,
/// never reused offsets from each window.
#[derive(Debug)]
pub struct SimPeer {
    next_offset: [u32; 2],
    failure: Option<ResponseResult>,
    boot_data: BootData,
    requests: Vec<Request>,
    submits: usize,
    fetches: usize,
}

impl SimPeer {
    const FIRST_OFFSET: u32 = 0x0100_0000;

    pub fn new() -> Self {
        SimPeer {
            next_offset: [Self::FIRST_OFFSET; 2],
            failure: None,
            boot_data: BootData::default(),
            requests: Vec::new(),
            submits: 0,
            fetches: 0,
        }
    }

    /// Answer every following request/response call with `result`.
    pub fn fail_with(&mut self, result: ResponseResult) {
        self.failure = Some(result);
    }

    pub fn succeed(&mut self) {
        self.failure = None;
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn last_request(&self) -> Option<Request> {
        self.requests.last().cloned()
    }

    pub fn alloc_calls(&self) -> usize {
        self.count(|r| matches!(r, Request::DdrLoBlockAlloc(_) | Request::DdrHiBlockAlloc(_)))
    }

    pub fn free_calls(&self) -> usize {
        self.count(|r| matches!(r, Request::DdrLoBlockFree(_) | Request::DdrHiBlockFree(_)))
    }

    pub fn submits(&self) -> usize {
        self.submits
    }

    pub fn fetches(&self) -> usize {
        self.fetches
    }

    /// Everything sent with inline prints, in order.
    pub fn printed(&self) -> Vec<u8> {
        self.requests
            .iter()
            .filter_map(|r| match r {
                Request::InlinePrint(text) => Some(text.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    fn count(&self, f: impl Fn(&Request) -> bool) -> usize {
        self.requests.iter().filter(|r| f(r)).count()
    }

    fn record(&mut self, msg: &RawFrame) -> Request {
        let request = Request::decode(msg).expect("peer got an undecodable frame");
        self.requests.push(request.clone());
        request
    }

    fn respond(&mut self, request: &Request) -> Response {
        if let Some(result) = self.failure {
            return Response::new(result);
        }
        match request {
            Request::DdrLoBlockAlloc(alloc) | Request::DdrHiBlockAlloc(alloc) => {
                let window = matches!(request, Request::DdrHiBlockAlloc(_)) as usize;
                let offset = self.next_offset[window];
                self.next_offset[window] += alloc.blocks_64kb * BLOCK_SIZE as u32;
                Response::allocated(offset)
            }
            Request::FetchBootData => Response::with_boot_data(&self.boot_data),
            _ => Response::new(ResponseResult::Success),
        }
    }
}

impl Transport for SimPeer {
    fn submit(&mut self, msg: &RawFrame) {
        self.submits += 1;
        let request = self.record(msg);
        assert!(request.is_fire_and_forget(), "{:?} expects a response", request);
        if let Request::BootComplete(data) = request {
            self.boot_data = data;
        }
    }

    fn submit_and_fetch(&mut self, msg: &RawFrame) -> RawFrame {
        self.fetches += 1;
        let request = self.record(msg);
        assert!(!request.is_fire_and_forget(), "{:?} has no response", request);
        self.respond(&request).encode()
    }
}

#[repr(C, align(65536))]
struct Chunk([u8; BLOCK_SIZE as usize]);

struct Chunks(BTreeMap<u64, *mut Chunk>);

impl Drop for Chunks {
    fn drop(&mut self) {
        for chunk in self.0.values() {
            unsafe { dealloc(*chunk as *mut u8, Layout::new::<Chunk>()) };
        }
    }
}

/// Physical memory made of zeroed 64KB chunks, created on first touch.
/// Clones share the same memory.
#[derive(Clone)]
pub struct SimMemory {
    chunks: Rc<RefCell<Chunks>>,
}

impl SimMemory {
    pub fn new() -> Self {
        SimMemory {
            chunks: Rc::new(RefCell::new(Chunks(BTreeMap::new()))),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.borrow().0.len()
    }

    pub fn snapshot(&self) -> Vec<(u64, Vec<u8>)> {
        self.chunks
            .borrow()
            .0
            .iter()
            .map(|(base, chunk)| (*base, unsafe { (**chunk).0.to_vec() }))
            .collect()
    }
}

unsafe impl PhysMemory for SimMemory {
    fn host_ptr(&self, pa: PhysAddr) -> *mut u8 {
        let base = pa.align_down(BLOCK_SIZE).as_u64();
        let mut chunks = self.chunks.borrow_mut();
        let chunk = *chunks.0.entry(base).or_insert_with(|| {
            let chunk = unsafe { alloc_zeroed(Layout::new::<Chunk>()) } as *mut Chunk;
            assert!(!chunk.is_null());
            chunk
        });
        unsafe { (chunk as *mut u8).add((pa.as_u64() - base) as usize) }
    }
}

#[derive(Debug, Default)]
pub struct CountingCache {
    calls: Cell<usize>,
    bytes: Cell<usize>,
}

impl CountingCache {
    pub fn calls(&self) -> usize {
        self.calls.get()
    }

    pub fn bytes(&self) -> usize {
        self.bytes.get()
    }
}

impl CacheMaintenance for CountingCache {
    fn clean_invalidate(&self, _addr: usize, len: usize) {
        self.calls.set(self.calls.get() + 1);
        self.bytes.set(self.bytes.get() + len);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOp {
    Sctlr(u64),
    Tcr(u64),
    Mair(u64),
    Ttbr0(u64),
    InvalidateTlb,
    Barrier,
}

#[derive(Debug, Default)]
pub struct RecordingRegisters {
    ops: Vec<RegisterOp>,
}

impl RecordingRegisters {
    pub fn ops(&self) -> &[RegisterOp] {
        &self.ops
    }
}

impl TranslationRegisters for RecordingRegisters {
    fn write_sctlr(&mut self, value: u64) {
        self.ops.push(RegisterOp::Sctlr(value));
    }

    fn write_tcr(&mut self, value: u64) {
        self.ops.push(RegisterOp::Tcr(value));
    }

    fn write_mair(&mut self, value: u64) {
        self.ops.push(RegisterOp::Mair(value));
    }

    fn write_ttbr0(&mut self, value: u64) {
        self.ops.push(RegisterOp::Ttbr0(value));
    }

    fn invalidate_tlb(&mut self) {
        self.ops.push(RegisterOp::InvalidateTlb);
    }

    fn barrier(&mut self) {
        self.ops.push(RegisterOp::Barrier);
    }
}
