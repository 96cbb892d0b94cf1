//! Native memory model.
//!
//! Every byte block lives at a unique raw address inside one process-wide
//! [`AddressSpace`], so a raw address written into a register can later be
//! resolved back into a bounded [`Segment`]. Blocks are unmapped when their last
//! owner drops them, or eagerly when the [`Arena`] that owns them is released.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use crate::layout::align_up;
use crate::value::{Address, Value, ValueType};
use crate::{Error, Result};

const FIRST_ADDRESS: u64 = 0x1_0000;
/// Every block starts on at least this boundary.
const BLOCK_ALIGN: u64 = 16;
/// Unmapped gap left after every block so neighbouring blocks never touch.
const GUARD_BYTES: u64 = 16;

struct AddressSpace {
    blocks: RwLock<BTreeMap<u64, Weak<Block>>>,
    next: Mutex<u64>,
}

static ADDRESS_SPACE: OnceLock<AddressSpace> = OnceLock::new();

impl AddressSpace {
    fn global() -> &'static AddressSpace {
        ADDRESS_SPACE.get_or_init(|| AddressSpace {
            blocks: RwLock::new(BTreeMap::new()),
            next: Mutex::new(FIRST_ADDRESS),
        })
    }

    fn reserve(&self, size: u64, align: u64) -> u64 {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        let address = align_up(*next, align.max(BLOCK_ALIGN));
        *next = address + size.max(1) + GUARD_BYTES;
        address
    }

    fn map(&self, block: &Arc<Block>) {
        self.blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(block.address, Arc::downgrade(block));
    }

    fn unmap(&self, address: u64) {
        self.blocks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&address);
    }

    fn lookup(&self, address: u64) -> Option<Arc<Block>> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        blocks
            .range(..=address)
            .next_back()
            .and_then(|(_, block)| block.upgrade())
    }
}

struct Block {
    address: u64,
    bytes: Mutex<Vec<u8>>,
    live: AtomicBool,
}

impl Block {
    fn new(size: u64, align: u64) -> Result<Arc<Self>> {
        let len = usize::try_from(size)
            .map_err(|_| Error::MemoryAccess(format!("cannot allocate {size} bytes")))?;
        let space = AddressSpace::global();
        let block = Arc::new(Block {
            address: space.reserve(size, align),
            bytes: Mutex::new(vec![0; len]),
            live: AtomicBool::new(true),
        });
        space.map(&block);
        Ok(block)
    }

    fn size(&self) -> u64 {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).len() as u64
    }

    fn release(&self) {
        self.live.store(false, Ordering::Release);
        AddressSpace::global().unmap(self.address);
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        AddressSpace::global().unmap(self.address);
    }
}

/// A bounded, shared view of native memory.
#[derive(Clone)]
pub struct Segment {
    block: Arc<Block>,
    offset: u64,
    len: u64,
}

impl Segment {
    /// Allocates a zero-filled segment that stays mapped while any clone of it is alive.
    pub fn allocate(size: u64, align: u64) -> Result<Segment> {
        let block = Block::new(size, align)?;
        Ok(Segment {
            block,
            offset: 0,
            len: size,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Segment> {
        let segment = Segment::allocate(bytes.len() as u64, BLOCK_ALIGN)?;
        segment.write(0, bytes)?;
        Ok(segment)
    }

    #[must_use]
    pub fn address(&self) -> u64 {
        self.block.address + self.offset
    }

    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_address(&self) -> Address {
        Address::new(self.address(), self.len)
    }

    /// Whether the memory behind this segment is still mapped.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.block.live.load(Ordering::Acquire)
    }

    pub fn slice(&self, offset: u64, len: u64) -> Result<Segment> {
        self.check(offset, len)?;
        Ok(Segment {
            block: Arc::clone(&self.block),
            offset: self.offset + offset,
            len,
        })
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.check(offset, buf.len() as u64)?;
        let bytes = self.block.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let start = self.check(offset, data.len() as u64)?;
        let mut bytes = self.block.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        bytes[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.len)
            .map_err(|_| Error::MemoryAccess("segment too large to copy".into()))?;
        let mut out = vec![0; len];
        self.read(0, &mut out)?;
        Ok(out)
    }

    /// Copies all of `src` to the start of this segment.
    pub fn copy_from(&self, src: &Segment) -> Result<()> {
        let data = src.to_vec()?;
        self.write(0, &data)
    }

    /// Reads `width` bytes at `offset` as a value of type `ty`.
    pub fn get(&self, ty: ValueType, offset: u64, width: u64) -> Result<Value> {
        let width = checked_width(ty, width)?;
        let mut raw = [0u8; 8];
        self.read(offset, &mut raw[..width])?;
        Value::from_bits(ty, u64::from_le_bytes(raw))
    }

    /// Writes the low `width` bytes of `value` at `offset`.
    pub fn set(&self, offset: u64, width: u64, value: &Value) -> Result<()> {
        let width = checked_width(value.value_type(), width)?;
        let raw = value.to_bits().to_le_bytes();
        self.write(offset, &raw[..width])
    }

    pub fn get_i32(&self, offset: u64) -> Result<i32> {
        match self.get(ValueType::I32, offset, 4)? {
            Value::I32(v) => Ok(v),
            other => Err(Error::Internal(format!("unexpected {other}"))),
        }
    }

    pub fn get_i64(&self, offset: u64) -> Result<i64> {
        match self.get(ValueType::I64, offset, 8)? {
            Value::I64(v) => Ok(v),
            other => Err(Error::Internal(format!("unexpected {other}"))),
        }
    }

    pub fn get_f64(&self, offset: u64) -> Result<f64> {
        match self.get(ValueType::F64, offset, 8)? {
            Value::F64(v) => Ok(v),
            other => Err(Error::Internal(format!("unexpected {other}"))),
        }
    }

    pub(crate) fn same_region(&self, other: &Segment) -> bool {
        Arc::ptr_eq(&self.block, &other.block) && self.offset == other.offset && self.len == other.len
    }

    fn check(&self, offset: u64, len: u64) -> Result<usize> {
        if !self.is_alive() {
            return Err(Error::MemoryAccess(format!(
                "segment at {:#x} accessed after its scope was released",
                self.address()
            )));
        }
        if offset.checked_add(len).is_none_or(|end| end > self.len) {
            return Err(Error::MemoryAccess(format!(
                "access of {len} bytes at offset {offset} is out of bounds for segment of {} bytes",
                self.len
            )));
        }
        usize::try_from(self.offset + offset)
            .map_err(|_| Error::MemoryAccess("offset overflow".into()))
    }
}

fn checked_width(ty: ValueType, width: u64) -> Result<usize> {
    match ty.byte_size() {
        Some(max) if width > 0 && width <= max => Ok(width as usize),
        _ => Err(Error::Internal(format!(
            "invalid access width {width} for {ty}"
        ))),
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Resolves a raw address into a segment of `len` bytes.
///
/// Fails when the address is unmapped or the range runs past its block.
pub fn resolve(address: u64, len: u64) -> Result<Segment> {
    let block = AddressSpace::global().lookup(address).ok_or_else(|| {
        Error::MemoryAccess(format!("address {address:#x} is not mapped"))
    })?;
    if !block.live.load(Ordering::Acquire) {
        return Err(Error::MemoryAccess(format!(
            "address {address:#x} belongs to a released scope"
        )));
    }
    let offset = address - block.address;
    let size = block.size();
    if offset.checked_add(len).is_none_or(|end| end > size) {
        return Err(Error::MemoryAccess(format!(
            "range {address:#x}+{len} is not mapped"
        )));
    }
    Ok(Segment { block, offset, len })
}

/// Whether `address` currently falls inside a live block.
#[must_use]
pub fn is_mapped(address: u64) -> bool {
    resolve(address, 0).is_ok()
}

/// Source of segments for `ALLOCATE` and `COPY` bindings.
pub trait SegmentAllocator {
    fn allocate(&mut self, size: u64, align: u64) -> Result<Segment>;
}

/// Allocates independent segments that live as long as their owners.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoAllocator;

impl SegmentAllocator for AutoAllocator {
    fn allocate(&mut self, size: u64, align: u64) -> Result<Segment> {
        Segment::allocate(size, align)
    }
}

/// A call-scoped bump arena.
///
/// All memory is handed out from one pre-sized block. Releasing the arena (or
/// dropping it) unmaps the block, and every segment carved from it becomes
/// inaccessible, whether or not it escaped.
pub struct Arena {
    block: Option<Arc<Block>>,
    capacity: u64,
    used: u64,
}

impl Arena {
    /// An arena that can hand out `capacity` bytes. A zero capacity creates no block.
    pub fn bounded(capacity: u64) -> Result<Arena> {
        let block = if capacity == 0 {
            None
        } else {
            Some(Block::new(capacity, BLOCK_ALIGN)?)
        };
        Ok(Arena {
            block,
            capacity,
            used: 0,
        })
    }

    #[must_use]
    pub const fn empty() -> Arena {
        Arena {
            block: None,
            capacity: 0,
            used: 0,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub const fn used(&self) -> u64 {
        self.used
    }

    /// Address of the arena's block, if it has one.
    #[must_use]
    pub fn base_address(&self) -> Option<u64> {
        self.block.as_ref().map(|b| b.address)
    }

    pub fn release(&mut self) {
        if let Some(block) = self.block.take() {
            block.release();
        }
    }
}

impl SegmentAllocator for Arena {
    fn allocate(&mut self, size: u64, align: u64) -> Result<Segment> {
        let Some(block) = &self.block else {
            return Err(Error::Internal(format!(
                "allocation of {size} bytes from an empty call arena"
            )));
        };
        let offset = align_up(self.used, align);
        if offset + size > self.capacity {
            return Err(Error::Internal(format!(
                "call arena exhausted: {size} bytes requested, {} of {} used",
                self.used, self.capacity
            )));
        }
        self.used = offset + size;
        Ok(Segment {
            block: Arc::clone(block),
            offset,
            len: size,
        })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &self.capacity)
            .field("used", &self.used)
            .field("released", &self.block.is_none())
            .finish()
    }
}
