use std::fmt;
use std::ptr;

use serde::Serialize;

/// The 32-bit word inserted before a 64-bit payload that would otherwise be
/// only 4-byte aligned.
pub const ALIGNMENT_FILLER: u32 = 0xdead_beef;

/// Bits that may never be set in a derived register address: the address must
/// fit in 32 bits and be 4-byte aligned.
const BAD_ADDR_MASK: u64 = 0xffff_ffff_0000_0003;

/// The 1 KiB page selected by a write burst's BASE field.
const PAGE_MASK: u64 = 0xffff_fc00;

const CMD_META: u32 = 0;
const CMD_READ: u32 = 1;
const CMD_WRITE32: u32 = 2;
const CMD_WRITE64: u32 = 3;

const META_END: u32 = 0;

// Command word layouts, little-endian, bit 0 = LSB.
//
// Meta (CMD=0):
//
// | 31    29 | 28                         3 | 2    | 1  0 |
// |========================================================
// |   res    |            DATA              | META | CMD  |
//
// Read (CMD=1), two header words:
//
// | 31       16 | 15    8 | 7   4 | 3     | 2     | 1  0 |
// |=======================================================
// |  BASE[15:0] |  RECNT  | COUNT | RETRY | LARGE | CMD  |
//
// | 31            14 | 13       6 | 5          0 |
// |===============================================
// |       res        |    OFF     |  BASE[21:16] |
//
// Write (CMD=2 is 32-bit, CMD=3 is 64-bit), one header word:
//
// | 31 28 | 27                 6 | 5     2 | 1  0 |
// |================================================
// |  res  |         BASE         |  COUNT  | CMD  |
//
// COUNT holds N-1; the N OFF bytes follow the header, padded to a 4-byte
// boundary, then the N payload words.

fn cmd_tag(w0: u32) -> u32 {
    w0 & 0x3
}

fn meta_sub(w0: u32) -> u32 {
    (w0 >> 2) & 0x1
}

fn meta_data(w0: u32) -> u32 {
    (w0 >> 3) & 0x03ff_ffff
}

fn meta_with_data(w0: u32, data: u32) -> u32 {
    (w0 & !(0x03ff_ffff << 3)) | ((data & 0x03ff_ffff) << 3)
}

fn read_large(w0: u32) -> bool {
    w0 & (1 << 2) != 0
}

fn read_retry(w0: u32) -> bool {
    w0 & (1 << 3) != 0
}

fn read_count(w0: u32) -> u32 {
    (w0 >> 4) & 0xf
}

fn read_recnt(w0: u32) -> u8 {
    ((w0 >> 8) & 0xff) as u8
}

fn read_base(w0: u32, w1: u32) -> u32 {
    ((w1 & 0x3f) << 16) | (w0 >> 16)
}

fn read_off(w1: u32) -> u32 {
    (w1 >> 6) & 0xff
}

fn read_with_retry(w0: u32, retry: bool) -> u32 {
    (w0 & !(1 << 3)) | ((retry as u32) << 3)
}

fn read_with_recnt(w0: u32, recnt: u8) -> u32 {
    (w0 & !(0xff << 8)) | ((recnt as u32) << 8)
}

fn read_with_base(w0: u32, w1: u32, base: u32) -> (u32, u32) {
    (
        (w0 & 0x0000_ffff) | ((base & 0xffff) << 16),
        (w1 & !0x3f) | ((base >> 16) & 0x3f),
    )
}

fn read_with_off(w1: u32, off: u32) -> u32 {
    (w1 & !(0xff << 6)) | ((off & 0xff) << 6)
}

fn write_count(w0: u32) -> u32 {
    (w0 >> 2) & 0xf
}

fn write_base(w0: u32) -> u32 {
    (w0 >> 6) & 0x003f_ffff
}

fn write_with_base(w0: u32, base: u32) -> u32 {
    (w0 & !(0x003f_ffff << 6)) | ((base & 0x003f_ffff) << 6)
}

fn join_addr(base: u32, off: u32) -> u64 {
    (u64::from(base) << 10) | (u64::from(off) << 2)
}

/// Governs when a `0xDEADBEEF` word before a 64-bit payload counts as
/// alignment filler.
///
/// In live reconfig engine memory, 64-bit payloads are naturally 8-byte
/// aligned and the filler only ever appears at a 4-but-not-8-byte aligned
/// address. A sequence extracted from an iBoot image keeps the filler words
/// but loses the original alignment, so there the sentinel is always honored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignmentMode {
    Volatile,
    Extracted,
}

/// Selects how tape bytes are loaded and stored.
///
/// `Volatile` pins every access to a single volatile load/store of the
/// field's exact width, as required when the tape is memory-mapped device
/// memory. `Normal` allows ordinary (coalescable) memory access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    Normal,
    Volatile,
}

/// Construction-time tape configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TapeConfig {
    pub alignment: AlignmentMode,
    pub access: AccessMode,
}

impl TapeConfig {
    /// Configuration for a tape that lives in mapped reconfig engine memory.
    pub fn live() -> Self {
        Self {
            alignment: AlignmentMode::Volatile,
            access: AccessMode::Volatile,
        }
    }

    /// Configuration for a tape extracted from an iBoot image into ordinary
    /// memory.
    pub fn extracted() -> Self {
        Self {
            alignment: AlignmentMode::Extracted,
            access: AccessMode::Normal,
        }
    }
}

/// A structural reject: the tape is malformed at `offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckError {
    /// Offset of the start of the failing command. Equal to the tape length
    /// when the tape ran out without an End command.
    pub offset: usize,
    /// Static description of the reject.
    pub reason: &'static str,
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "offset {:#x}: {}", self.offset, self.reason)
    }
}

impl std::error::Error for CheckError {}

fn reject(offset: usize, reason: &'static str) -> CheckError {
    log::debug!("structural reject at {:#x}: {}", offset, reason);
    CheckError { offset, reason }
}

/// Failure surface of `visit` and `walk`.
#[derive(Debug)]
pub enum WalkError {
    /// The tape is malformed or truncated. The walker trusts semantic
    /// validity but still refuses to read past the buffer.
    Malformed(CheckError),
    /// An update was requested where none is allowed: by the `generic` or
    /// `end` callbacks, or through the read-only `visit` entry point.
    UpdateRefused { offset: usize },
    /// An updated delay does not fit in 26 bits.
    DelayRange { offset: usize, ticks: u32 },
    /// An updated address is not a 4-byte-aligned 32-bit address.
    AddressRange { offset: usize, addr: u64 },
    /// An updated address leaves the shared page of a multi-entry write.
    PageMismatch { offset: usize, addr: u64 },
    /// A callback failed; the error is surfaced verbatim.
    Callback(anyhow::Error),
}

impl fmt::Display for WalkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WalkError::Malformed(err) => write!(f, "malformed tape: {}", err),
            WalkError::UpdateRefused { offset } => {
                write!(f, "offset {:#x}: update not permitted here", offset)
            }
            WalkError::DelayRange { offset, ticks } => {
                write!(f, "offset {:#x}: delay {:#x} exceeds 26 bits", offset, ticks)
            }
            WalkError::AddressRange { offset, addr } => {
                write!(f, "offset {:#x}: bad register address {:#x}", offset, addr)
            }
            WalkError::PageMismatch { offset, addr } => {
                write!(f, "offset {:#x}: address {:#x} leaves the shared page", offset, addr)
            }
            WalkError::Callback(err) => write!(f, "callback failed: {:#}", err),
        }
    }
}

impl std::error::Error for WalkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WalkError::Callback(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

fn malformed(offset: usize, reason: &'static str) -> WalkError {
    WalkError::Malformed(reject(offset, reason))
}

/// What a callback asks the walker to do next.
#[derive(Debug)]
pub enum Disposition {
    /// Keep walking.
    Success,
    /// Write the (possibly mutated) fields back into the tape, then keep
    /// walking.
    Update,
    /// Terminate the walk; it returns `Ok(Outcome::Stop)`.
    Stop,
    /// Terminate the walk; the error is surfaced verbatim as
    /// `WalkError::Callback`.
    Error(anyhow::Error),
}

/// How a completed walk ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Every callback returned `Success`.
    Success,
    /// At least one update was committed to the tape.
    Update,
    /// A callback stopped the walk early.
    Stop,
}

/// A decoded command, unpacked from the on-tape representation. Batched
/// writes decode to one value per entry.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    End,
    Delay { ticks: u32 },
    Read32 { addr: u64, mask: u32, data: u32, retry: bool, recnt: u8 },
    Read64 { addr: u64, mask: u64, data: u64, retry: bool, recnt: u8 },
    Write32 { addr: u64, data: u32 },
    Write64 { addr: u64, data: u64 },
}

/// Per-command callbacks for `visit` and `walk`.
///
/// Every method is optional; the default implementations return
/// `Disposition::Success`, which makes the walker skip over the command
/// untouched. Field-level callbacks receive mutable references and may return
/// `Disposition::Update` to have the mutated values packed back into the
/// tape.
#[allow(unused_variables)]
pub trait Visitor {
    /// Called first for every command with a snapshot of its first header
    /// word. Must not return `Update`.
    fn generic(&mut self, word: u32) -> Disposition {
        Disposition::Success
    }

    /// Called for the End command, after which the walk terminates. Must not
    /// return `Update`.
    fn end(&mut self) -> Disposition {
        Disposition::Success
    }

    fn delay(&mut self, ticks: &mut u32) -> Disposition {
        Disposition::Success
    }

    fn r32(
        &mut self,
        addr: &mut u64,
        mask: &mut u32,
        data: &mut u32,
        retry: &mut bool,
        recnt: &mut u8,
    ) -> Disposition {
        Disposition::Success
    }

    fn r64(
        &mut self,
        addr: &mut u64,
        mask: &mut u64,
        data: &mut u64,
        retry: &mut bool,
        recnt: &mut u8,
    ) -> Disposition {
        Disposition::Success
    }

    /// Called once per entry of a 32-bit write burst, in index order. For
    /// bursts with more than one entry an updated address must stay within
    /// the burst's shared BASE page; only single-entry bursts may move it.
    fn w32(&mut self, addr: &mut u64, data: &mut u32) -> Disposition {
        Disposition::Success
    }

    /// 64-bit counterpart of `w32`, with the same shared-page rule.
    fn w64(&mut self, addr: &mut u64, data: &mut u64) -> Disposition {
        Disposition::Success
    }
}

/// Raw view over the tape with width-exact access primitives.
///
/// All multi-byte accesses are little-endian. Under `AccessMode::Volatile`
/// every load and store is a single volatile access of the field's exact
/// width; header words and 32-bit payloads go through 32-bit accesses,
/// 64-bit payloads through 64-bit accesses, OFF bytes through 8-bit
/// accesses.
struct Cursor {
    base: *mut u8,
    len: usize,
    config: TapeConfig,
    writable: bool,
}

impl Cursor {
    fn from_ref(bytes: &[u8], config: TapeConfig) -> Self {
        Self {
            base: bytes.as_ptr() as *mut u8,
            len: bytes.len(),
            config,
            writable: false,
        }
    }

    fn from_mut(bytes: &mut [u8], config: TapeConfig) -> Self {
        Self {
            base: bytes.as_mut_ptr(),
            len: bytes.len(),
            config,
            writable: true,
        }
    }

    fn load8(&self, pos: usize) -> u8 {
        assert!(pos < self.len);
        match self.config.access {
            AccessMode::Normal => unsafe { ptr::read(self.base.add(pos)) },
            AccessMode::Volatile => unsafe { ptr::read_volatile(self.base.add(pos)) },
        }
    }

    fn load32(&self, pos: usize) -> u32 {
        assert!(pos + 4 <= self.len);
        match self.config.access {
            AccessMode::Normal => {
                let bytes = unsafe { ptr::read_unaligned(self.base.add(pos) as *const [u8; 4]) };
                u32::from_le_bytes(bytes)
            }
            AccessMode::Volatile => {
                debug_assert_eq!((self.base as usize + pos) % 4, 0);
                u32::from_le(unsafe { ptr::read_volatile(self.base.add(pos) as *const u32) })
            }
        }
    }

    fn load64(&self, pos: usize) -> u64 {
        assert!(pos + 8 <= self.len);
        match self.config.access {
            AccessMode::Normal => {
                let bytes = unsafe { ptr::read_unaligned(self.base.add(pos) as *const [u8; 8]) };
                u64::from_le_bytes(bytes)
            }
            AccessMode::Volatile => {
                debug_assert_eq!((self.base as usize + pos) % 8, 0);
                u64::from_le(unsafe { ptr::read_volatile(self.base.add(pos) as *const u64) })
            }
        }
    }

    fn store8(&mut self, pos: usize, value: u8) {
        assert!(pos < self.len);
        debug_assert!(self.writable);
        match self.config.access {
            AccessMode::Normal => unsafe { ptr::write(self.base.add(pos), value) },
            AccessMode::Volatile => unsafe { ptr::write_volatile(self.base.add(pos), value) },
        }
    }

    fn store32(&mut self, pos: usize, value: u32) {
        assert!(pos + 4 <= self.len);
        debug_assert!(self.writable);
        match self.config.access {
            AccessMode::Normal => unsafe {
                ptr::write_unaligned(self.base.add(pos) as *mut [u8; 4], value.to_le_bytes())
            },
            AccessMode::Volatile => unsafe {
                debug_assert_eq!((self.base as usize + pos) % 4, 0);
                ptr::write_volatile(self.base.add(pos) as *mut u32, value.to_le())
            },
        }
    }

    fn store64(&mut self, pos: usize, value: u64) {
        assert!(pos + 8 <= self.len);
        debug_assert!(self.writable);
        match self.config.access {
            AccessMode::Normal => unsafe {
                ptr::write_unaligned(self.base.add(pos) as *mut [u8; 8], value.to_le_bytes())
            },
            AccessMode::Volatile => unsafe {
                debug_assert_eq!((self.base as usize + pos) % 8, 0);
                ptr::write_volatile(self.base.add(pos) as *mut u64, value.to_le())
            },
        }
    }

    /// Whether the word at `pos` is alignment filler before a 64-bit
    /// payload.
    fn is_filler(&self, pos: usize) -> bool {
        if self.load32(pos) != ALIGNMENT_FILLER {
            return false;
        }
        match self.config.alignment {
            AlignmentMode::Extracted => true,
            AlignmentMode::Volatile => (self.base as usize + pos) & 0x4 != 0,
        }
    }
}

/// Verifies that `bytes` is a well-formed command tape terminated by an End
/// command on its last 4 bytes.
///
/// Returns `Ok(len)` on success. On failure, the error carries the offset of
/// the start of the failing command; a tape that runs out without an End
/// command fails at offset == len.
pub fn check(bytes: &[u8], config: TapeConfig) -> Result<usize, CheckError> {
    let cur = Cursor::from_ref(bytes, config);
    let len = cur.len;
    let mut pos = 0usize;

    while pos != len {
        if len - pos < 4 {
            return Err(reject(pos, "truncated command header"));
        }
        let w0 = cur.load32(pos);
        match cmd_tag(w0) {
            CMD_META => {
                if meta_sub(w0) == META_END {
                    if meta_data(w0) != 0 {
                        return Err(reject(pos, "end command with nonzero data"));
                    }
                    if pos + 4 != len {
                        return Err(reject(pos, "end command before the last byte"));
                    }
                    return Ok(len);
                }
                pos += 4;
            }
            CMD_READ => {
                if len - pos < 8 {
                    return Err(reject(pos, "truncated read header"));
                }
                if read_count(w0) != 0 {
                    return Err(reject(pos, "read with nonzero count"));
                }
                // Retry count without the retry flag and nonzero reserved
                // bits both occur in real firmware; tolerated.
                if !read_large(w0) {
                    if len - pos < 16 {
                        return Err(reject(pos, "truncated read32 payload"));
                    }
                    pos += 16;
                } else {
                    if len - pos < 24 {
                        return Err(reject(pos, "truncated read64 payload"));
                    }
                    let mut data_pos = pos + 8;
                    if cur.is_filler(data_pos) {
                        if len - pos < 28 {
                            return Err(reject(pos, "truncated read64 payload"));
                        }
                        data_pos += 4;
                    }
                    pos = data_pos + 16;
                }
            }
            CMD_WRITE32 => {
                let cnt = write_count(w0) as usize + 1;
                let alcnt = (cnt + 3) & !3;
                if cnt > 16 || alcnt > 16 {
                    return Err(reject(pos, "write burst too long"));
                }
                if len - pos < 4 + alcnt + 4 * cnt {
                    return Err(reject(pos, "truncated write32 burst"));
                }
                pos += 4 + alcnt + 4 * cnt;
            }
            CMD_WRITE64 => {
                let cnt = write_count(w0) as usize + 1;
                let alcnt = (cnt + 3) & !3;
                if cnt > 16 || alcnt > 16 {
                    return Err(reject(pos, "write burst too long"));
                }
                if len - pos < 4 + alcnt + 8 * cnt {
                    return Err(reject(pos, "truncated write64 burst"));
                }
                let mut data_pos = pos + 4 + alcnt;
                if cur.is_filler(data_pos) {
                    if len - pos < 4 + alcnt + 4 + 8 * cnt {
                        return Err(reject(pos, "truncated write64 burst"));
                    }
                    data_pos += 4;
                }
                pos = data_pos + 8 * cnt;
            }
            _ => return Err(reject(pos, "unknown command")),
        }
    }

    Err(reject(len, "no end command"))
}

/// Traverses the tape read-only, invoking `visitor` per command.
///
/// Identical to `walk` except that `Update` dispositions are refused with
/// `WalkError::UpdateRefused`.
pub fn visit<V: Visitor>(
    bytes: &[u8],
    config: TapeConfig,
    visitor: &mut V,
) -> Result<Outcome, WalkError> {
    run(Cursor::from_ref(bytes, config), visitor)
}

/// Traverses the tape, invoking `visitor` per command and committing
/// `Update` dispositions back into the tape in place.
///
/// The walker assumes the tape has passed `check` and does not re-verify
/// semantic validity; untrusted input should be checked first. Updates
/// committed before a failure stay committed.
pub fn walk<V: Visitor>(
    bytes: &mut [u8],
    config: TapeConfig,
    visitor: &mut V,
) -> Result<Outcome, WalkError> {
    run(Cursor::from_mut(bytes, config), visitor)
}

/// Control decision derived from one callback's disposition.
enum Flow {
    Continue { update: bool },
    Stop,
    Fail(WalkError),
}

fn flow_of(disposition: Disposition, offset: usize, may_update: bool) -> Flow {
    match disposition {
        Disposition::Success => Flow::Continue { update: false },
        Disposition::Update if may_update => Flow::Continue { update: true },
        Disposition::Update => Flow::Fail(WalkError::UpdateRefused { offset }),
        Disposition::Stop => Flow::Stop,
        Disposition::Error(err) => Flow::Fail(WalkError::Callback(err)),
    }
}

fn run<V: Visitor>(mut cur: Cursor, visitor: &mut V) -> Result<Outcome, WalkError> {
    let len = cur.len;
    let writable = cur.writable;
    let mut pos = 0usize;
    let mut updated = false;

    while pos != len {
        if len - pos < 4 {
            return Err(malformed(pos, "truncated command header"));
        }
        let w0 = cur.load32(pos);

        // The snapshot hands the callback a plain copy, never the (possibly
        // volatile) tape word itself.
        match flow_of(visitor.generic(w0), pos, false) {
            Flow::Continue { .. } => {}
            Flow::Stop => return Ok(Outcome::Stop),
            Flow::Fail(err) => return Err(err),
        }

        match cmd_tag(w0) {
            CMD_META => {
                if meta_sub(w0) == META_END {
                    return match flow_of(visitor.end(), pos, false) {
                        Flow::Continue { .. } => Ok(if updated {
                            Outcome::Update
                        } else {
                            Outcome::Success
                        }),
                        Flow::Stop => Ok(Outcome::Stop),
                        Flow::Fail(err) => Err(err),
                    };
                }
                let mut ticks = meta_data(w0);
                match flow_of(visitor.delay(&mut ticks), pos, writable) {
                    Flow::Continue { update: false } => {}
                    Flow::Continue { update: true } => {
                        if ticks >= 1 << 26 {
                            return Err(WalkError::DelayRange { offset: pos, ticks });
                        }
                        cur.store32(pos, meta_with_data(w0, ticks));
                        updated = true;
                    }
                    Flow::Stop => return Ok(Outcome::Stop),
                    Flow::Fail(err) => return Err(err),
                }
                pos += 4;
            }
            CMD_READ => {
                if len - pos < 8 {
                    return Err(malformed(pos, "truncated read header"));
                }
                let w1 = cur.load32(pos + 4);
                let mut addr = join_addr(read_base(w0, w1), read_off(w1));
                let mut retry = read_retry(w0);
                let mut recnt = read_recnt(w0);

                if !read_large(w0) {
                    if len - pos < 16 {
                        return Err(malformed(pos, "truncated read32 payload"));
                    }
                    let mut mask = cur.load32(pos + 8);
                    let mut data = cur.load32(pos + 12);
                    let disposition =
                        visitor.r32(&mut addr, &mut mask, &mut data, &mut retry, &mut recnt);
                    match flow_of(disposition, pos, writable) {
                        Flow::Continue { update: false } => {}
                        Flow::Continue { update: true } => {
                            if addr & BAD_ADDR_MASK != 0 {
                                return Err(WalkError::AddressRange { offset: pos, addr });
                            }
                            let (w0, w1) = read_with_base(w0, w1, (addr >> 10) as u32);
                            let w0 = read_with_recnt(read_with_retry(w0, retry), recnt);
                            let w1 = read_with_off(w1, ((addr >> 2) & 0xff) as u32);
                            cur.store32(pos, w0);
                            cur.store32(pos + 4, w1);
                            cur.store32(pos + 8, mask);
                            cur.store32(pos + 12, data);
                            updated = true;
                        }
                        Flow::Stop => return Ok(Outcome::Stop),
                        Flow::Fail(err) => return Err(err),
                    }
                    pos += 16;
                } else {
                    if len - pos < 24 {
                        return Err(malformed(pos, "truncated read64 payload"));
                    }
                    let mut data_pos = pos + 8;
                    if cur.is_filler(data_pos) {
                        if len - pos < 28 {
                            return Err(malformed(pos, "truncated read64 payload"));
                        }
                        data_pos += 4;
                    }
                    let mut mask = cur.load64(data_pos);
                    let mut data = cur.load64(data_pos + 8);
                    let disposition =
                        visitor.r64(&mut addr, &mut mask, &mut data, &mut retry, &mut recnt);
                    match flow_of(disposition, pos, writable) {
                        Flow::Continue { update: false } => {}
                        Flow::Continue { update: true } => {
                            if addr & BAD_ADDR_MASK != 0 {
                                return Err(WalkError::AddressRange { offset: pos, addr });
                            }
                            let (w0, w1) = read_with_base(w0, w1, (addr >> 10) as u32);
                            let w0 = read_with_recnt(read_with_retry(w0, retry), recnt);
                            let w1 = read_with_off(w1, ((addr >> 2) & 0xff) as u32);
                            cur.store32(pos, w0);
                            cur.store32(pos + 4, w1);
                            cur.store64(data_pos, mask);
                            cur.store64(data_pos + 8, data);
                            updated = true;
                        }
                        Flow::Stop => return Ok(Outcome::Stop),
                        Flow::Fail(err) => return Err(err),
                    }
                    pos = data_pos + 16;
                }
            }
            CMD_WRITE32 => {
                let cnt = write_count(w0) as usize + 1;
                let alcnt = (cnt + 3) & !3;
                if len - pos < 4 + alcnt + 4 * cnt {
                    return Err(malformed(pos, "truncated write32 burst"));
                }
                let data_pos = pos + 4 + alcnt;
                let base = write_base(w0);
                for i in 0..cnt {
                    let mut addr = join_addr(base, u32::from(cur.load8(pos + 4 + i)));
                    let mut data = cur.load32(data_pos + 4 * i);
                    match flow_of(visitor.w32(&mut addr, &mut data), pos, writable) {
                        Flow::Continue { update: false } => {}
                        Flow::Continue { update: true } => {
                            if addr & BAD_ADDR_MASK != 0 {
                                return Err(WalkError::AddressRange { offset: pos, addr });
                            }
                            if cnt == 1 {
                                cur.store32(pos, write_with_base(w0, (addr >> 10) as u32));
                            } else if addr & PAGE_MASK != u64::from(base) << 10 {
                                return Err(WalkError::PageMismatch { offset: pos, addr });
                            }
                            cur.store8(pos + 4 + i, ((addr >> 2) & 0xff) as u8);
                            cur.store32(data_pos + 4 * i, data);
                            updated = true;
                        }
                        Flow::Stop => return Ok(Outcome::Stop),
                        Flow::Fail(err) => return Err(err),
                    }
                }
                pos = data_pos + 4 * cnt;
            }
            CMD_WRITE64 => {
                let cnt = write_count(w0) as usize + 1;
                let alcnt = (cnt + 3) & !3;
                if len - pos < 4 + alcnt + 8 * cnt {
                    return Err(malformed(pos, "truncated write64 burst"));
                }
                let mut data_pos = pos + 4 + alcnt;
                if cur.is_filler(data_pos) {
                    if len - pos < 4 + alcnt + 4 + 8 * cnt {
                        return Err(malformed(pos, "truncated write64 burst"));
                    }
                    data_pos += 4;
                }
                let base = write_base(w0);
                for i in 0..cnt {
                    let mut addr = join_addr(base, u32::from(cur.load8(pos + 4 + i)));
                    let mut data = cur.load64(data_pos + 8 * i);
                    match flow_of(visitor.w64(&mut addr, &mut data), pos, writable) {
                        Flow::Continue { update: false } => {}
                        Flow::Continue { update: true } => {
                            if addr & BAD_ADDR_MASK != 0 {
                                return Err(WalkError::AddressRange { offset: pos, addr });
                            }
                            if cnt == 1 {
                                cur.store32(pos, write_with_base(w0, (addr >> 10) as u32));
                            } else if addr & PAGE_MASK != u64::from(base) << 10 {
                                return Err(WalkError::PageMismatch { offset: pos, addr });
                            }
                            cur.store8(pos + 4 + i, ((addr >> 2) & 0xff) as u8);
                            cur.store64(data_pos + 8 * i, data);
                            updated = true;
                        }
                        Flow::Stop => return Ok(Outcome::Stop),
                        Flow::Fail(err) => return Err(err),
                    }
                }
                pos = data_pos + 8 * cnt;
            }
            _ => return Err(malformed(pos, "unknown command")),
        }
    }

    Err(malformed(len, "no end command"))
}
