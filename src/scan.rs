use anyhow::{anyhow, Result};

/// Encoding of `ldr x1, 0x300`; its presence at offset 0x8 selects where the
/// image's base address pointer lives.
const LDR_X1_0X300: u32 = 0x5800_17c1;

/// One located sequence: the window-relative byte range to decode, plus the
/// descriptor that named it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SeqWindow {
    pub offset: usize,
    pub len: usize,
    /// The descriptor's load address.
    pub addr: u64,
    /// The descriptor's length in 32-bit words.
    pub words: u64,
}

fn word32(buf: &[u8], off: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(bytes)
}

fn word64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

/// Whether (`addr`, `words`) looks like a sequence descriptor: an even,
/// nonzero, short word count and a 4-byte-aligned address inside the image.
fn descriptor_ok(addr: u64, words: u64, base: u64, top: u64) -> bool {
    words != 0
        && words & 0x1 == 0
        && words < 0x10000
        && addr & 0x3 == 0
        && addr > base
        && addr.checked_add(words * 4).map_or(false, |end| end < top)
}

/// Locates ReConfig sequences inside an iBoot image window.
///
/// This is a heuristic: it keys off the iBoot version banner, reads the
/// image's base address from a pivot that depends on an early instruction
/// word, then hunts for a (0, 0)-terminated table of (address, word count)
/// descriptors. Each descriptor names one sequence to decode.
pub fn find_sequences(window: &[u8]) -> Result<Vec<SeqWindow>> {
    if window.len() < 0x320 {
        return Err(anyhow!("window too small to scan ({:#x} bytes)", window.len()));
    }
    if &window[0x280..0x286] != b"iBoot-" {
        return Err(anyhow!("no iBoot banner at offset 0x280"));
    }

    let pivot = if word32(window, 0x8) == LDR_X1_0X300 { 0x300 } else { 0x318 };
    let base = word64(window, pivot);
    let top = base
        .checked_add(window.len() as u64)
        .ok_or_else(|| anyhow!("bad image base {:#x}", base))?;
    log::debug!("image base {:#x} (pivot {:#x}), top {:#x}", base, pivot, top);

    let mut found = Vec::new();
    let mut cur = 0x320;
    while cur + 8 <= window.len() {
        let a = word64(window, cur);
        let b = word64(window, cur - 8);
        let c = word64(window, cur - 16);
        let d = word64(window, cur - 24);
        if a == 0 && b == 0 && descriptor_ok(d, c, base, top) {
            // Terminator found; back up over the table to its first entry.
            let mut p = cur - 24;
            while p >= 16 && descriptor_ok(word64(window, p - 16), word64(window, p - 8), base, top)
            {
                p -= 16;
            }
            while p + 16 <= window.len() {
                let (addr, words) = (word64(window, p), word64(window, p + 8));
                if addr == 0 || words == 0 {
                    break;
                }
                if !descriptor_ok(addr, words, base, top) {
                    return Err(anyhow!("descriptor at {:#x} out of range", p));
                }
                found.push(SeqWindow {
                    offset: (addr - base) as usize,
                    len: (words * 4) as usize,
                    addr,
                    words,
                });
                p += 16;
            }
        }
        cur += 8;
    }

    if found.is_empty() {
        return Err(anyhow!("no reconfig sequences found"));
    }
    Ok(found)
}
