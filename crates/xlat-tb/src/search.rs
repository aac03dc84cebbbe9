//! Compressed per-instruction search table: for each guest instruction, the
//! ULEB128 deltas of its guest pc and of the host offset its code starts at.

fn put_uleb(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn get_uleb(bytes: &[u8], pos: &mut usize) -> Option<u64> {
    let mut v = 0u64;
    let mut shift = 0;
    loop {
        let b = *bytes.get(*pos)?;
        *pos += 1;
        v |= ((b & 0x7f) as u64) << shift;
        if b & 0x80 == 0 {
            return Some(v);
        }
        shift += 7;
        if shift >= 64 {
            return None;
        }
    }
}

/// Encode `(pc, host_offset)` pairs, both relative to the block start.
pub(crate) fn encode(block_pc: u64, insns: impl Iterator<Item = (u64, u32)>) -> Vec<u8> {
    let mut out = Vec::new();
    let (mut prev_pc, mut prev_off) = (block_pc, 0u32);
    for (pc, off) in insns {
        put_uleb(&mut out, pc.wrapping_sub(prev_pc));
        put_uleb(&mut out, off.wrapping_sub(prev_off) as u64);
        prev_pc = pc;
        prev_off = off;
    }
    out
}

/// Find the instruction whose code contains `host_off` (relative to the block's
/// code start). Returns `(guest pc, instruction index)`.
pub(crate) fn restore(table: &[u8], block_pc: u64, host_off: u32) -> Option<(u64, u32)> {
    let mut pos = 0;
    let (mut pc, mut off) = (block_pc, 0u32);
    let mut found = None;
    let mut idx = 0u32;
    while pos < table.len() {
        pc = pc.wrapping_add(get_uleb(table, &mut pos)?);
        off = off.wrapping_add(get_uleb(table, &mut pos)? as u32);
        if off > host_off {
            break;
        }
        found = Some((pc, idx));
        idx += 1;
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restores_containing_instruction() {
        let table = encode(0x1000, [(0x1000, 0), (0x1004, 48), (0x1008, 200)].into_iter());
        assert_eq!(restore(&table, 0x1000, 0), Some((0x1000, 0)));
        assert_eq!(restore(&table, 0x1000, 47), Some((0x1000, 0)));
        assert_eq!(restore(&table, 0x1000, 48), Some((0x1004, 1)));
        assert_eq!(restore(&table, 0x1000, 5000), Some((0x1008, 2)));
        assert_eq!(restore(&[], 0x1000, 5), None);
    }

    #[test]
    fn large_deltas_use_multiple_bytes() {
        let table = encode(0, [(0, 0), (1 << 40, 1 << 20)].into_iter());
        assert!(table.len() > 4);
        assert_eq!(restore(&table, 0, 1 << 20), Some((1 << 40, 1)));
    }
}
