use anyhow::{anyhow, Result};
use rand::Rng;

use crate::trace::TraceRing;

/// Base of guest physical memory.
pub const MBASE: u32 = 0x8000_0000;

/// Size of guest physical memory, in bytes.
pub const MSIZE: usize = 0x0800_0000;

pub const PMEM_LEFT: u32 = MBASE;
pub const PMEM_RIGHT: u32 = MBASE + (MSIZE as u32 - 1);

/// Why a read is happening. Fetches are logged to the access ring before
/// the access itself; data reads are not.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ReadKind {
    Fetch,
    Data,
}

/// Seam for memory-mapped devices. Addresses outside guest physical memory
/// are handed to the installed device; the device models themselves live
/// elsewhere.
pub trait Device {
    fn read(&mut self, addr: u32, len: usize) -> Result<u32>;
    fn write(&mut self, addr: u32, len: usize, data: u32) -> Result<()>;

    /// Called between retirements so the device can make progress.
    fn update(&mut self) {}
}

/// Guest physical memory: a flat byte array at `MBASE`, with bounds-checked
/// little-endian accesses and a ring of recent accesses for post-mortems.
pub struct Memory {
    pmem: Vec<u8>,
    ring: TraceRing,
    mmio: Option<Box<dyn Device>>,
}

impl Memory {
    pub fn new(randomize: bool) -> Self {
        let mut pmem = vec![0u8; MSIZE];

        if randomize {
            let mut rng = rand::thread_rng();
            for chunk in pmem.chunks_exact_mut(4) {
                chunk.copy_from_slice(&rng.gen::<u32>().to_le_bytes());
            }
        }

        log::info!(
            "physical memory area [{:#010x}, {:#010x}]",
            PMEM_LEFT,
            PMEM_RIGHT
        );

        Self {
            pmem,
            ring: TraceRing::new(),
            mmio: None,
        }
    }

    pub fn set_mmio(&mut self, dev: Box<dyn Device>) {
        self.mmio = Some(dev);
    }

    pub fn in_pmem(addr: u32) -> bool {
        addr >= MBASE && ((addr - MBASE) as usize) < MSIZE
    }

    fn covers(addr: u32, len: usize) -> bool {
        Self::in_pmem(addr) && (addr - MBASE) as usize + len <= MSIZE
    }

    pub fn guest_to_host(paddr: u32) -> usize {
        (paddr - MBASE) as usize
    }

    pub fn host_to_guest(offset: usize) -> u32 {
        MBASE + offset as u32
    }

    /// Copy a raw image into guest memory at `addr`.
    pub fn load(&mut self, addr: u32, bytes: &[u8]) -> Result<()> {
        if !Self::covers(addr, bytes.len()) {
            return Err(anyhow!(
                "image of {} bytes does not fit at {:#010x}",
                bytes.len(),
                addr
            ));
        }

        let off = Self::guest_to_host(addr);
        self.pmem[off..off + bytes.len()].copy_from_slice(bytes);

        Ok(())
    }

    /// Bounds-checked little-endian read of `len` bytes (1, 2 or 4).
    pub fn read(&mut self, addr: u32, len: usize, kind: ReadKind) -> Result<u32> {
        debug_assert!(matches!(len, 1 | 2 | 4));

        if kind == ReadKind::Fetch {
            self.ring
                .push(format!("[paddr_read] start[{:#010x}], len[{}].", addr, len));
        }

        if Self::in_pmem(addr) {
            if Self::covers(addr, len) {
                return Ok(self.pmem_read(addr, len));
            }
            // The access starts inside pmem but runs off the end.
            return self.out_of_bound(addr);
        }

        if let Some(mmio) = self.mmio.as_mut() {
            log::debug!("mmio read at {:#010x}, len {}", addr, len);
            return mmio.read(addr, len);
        }

        self.out_of_bound(addr)
    }

    /// Bounds-checked little-endian write of the low `8 * len` bits of `data`.
    pub fn write(&mut self, addr: u32, len: usize, data: u32) -> Result<()> {
        debug_assert!(matches!(len, 1 | 2 | 4));

        self.ring.push(format!(
            "[paddr_write] start[{:#010x}], len[{}], data[{:#010x}].",
            addr, len, data
        ));

        if Self::in_pmem(addr) {
            if Self::covers(addr, len) {
                self.pmem_write(addr, len, data);
                return Ok(());
            }
            return self.out_of_bound(addr).map(|_| ());
        }

        if let Some(mmio) = self.mmio.as_mut() {
            log::debug!("mmio write at {:#010x}, len {}", addr, len);
            return mmio.write(addr, len, data);
        }

        self.out_of_bound(addr).map(|_| ())
    }

    pub fn update_device(&mut self) {
        if let Some(mmio) = self.mmio.as_mut() {
            mmio.update();
        }
    }

    pub fn dump_ring(&self) {
        self.ring.dump();
    }

    fn pmem_read(&self, addr: u32, len: usize) -> u32 {
        let off = Self::guest_to_host(addr);
        let bytes = &self.pmem[off..off + len];

        match len {
            1 => bytes[0] as u32,
            2 => u16::from_le_bytes([bytes[0], bytes[1]]) as u32,
            _ => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }

    fn pmem_write(&mut self, addr: u32, len: usize, data: u32) {
        let off = Self::guest_to_host(addr);
        self.pmem[off..off + len].copy_from_slice(&data.to_le_bytes()[..len]);
    }

    fn out_of_bound(&self, addr: u32) -> Result<u32> {
        self.ring.dump();

        Err(anyhow!(
            "address {:#010x} is out of bound of pmem [{:#010x}, {:#010x}]",
            addr,
            PMEM_LEFT,
            PMEM_RIGHT
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_round_trip() {
        let mut mem = Memory::new(false);

        mem.write(MBASE, 4, 0xdead_beef).unwrap();
        assert_eq!(mem.read(MBASE, 4, ReadKind::Data).unwrap(), 0xdead_beef);
        assert_eq!(mem.read(MBASE, 1, ReadKind::Data).unwrap(), 0xef);
        assert_eq!(mem.read(MBASE + 1, 1, ReadKind::Data).unwrap(), 0xbe);
        assert_eq!(mem.read(MBASE, 2, ReadKind::Data).unwrap(), 0xbeef);
        assert_eq!(mem.read(MBASE + 2, 2, ReadKind::Data).unwrap(), 0xdead);
    }

    #[test]
    fn test_narrow_write_masks_data() {
        let mut mem = Memory::new(false);

        mem.write(MBASE, 4, 0xffff_ffff).unwrap();
        mem.write(MBASE, 1, 0x1234_56ab).unwrap();
        assert_eq!(mem.read(MBASE, 4, ReadKind::Data).unwrap(), 0xffff_ffab);

        mem.write(MBASE, 2, 0x9999_0102).unwrap();
        assert_eq!(mem.read(MBASE, 4, ReadKind::Data).unwrap(), 0xffff_0102);
    }

    #[test]
    fn test_unaligned_access_succeeds() {
        let mut mem = Memory::new(false);

        mem.write(MBASE + 1, 4, 0x0403_0201).unwrap();
        assert_eq!(
            mem.read(MBASE + 1, 4, ReadKind::Data).unwrap(),
            0x0403_0201
        );
        assert_eq!(mem.read(MBASE + 3, 2, ReadKind::Data).unwrap(), 0x0403);
    }

    #[test]
    fn test_out_of_bound_reports_range() {
        let mut mem = Memory::new(false);

        let err = mem.read(0x1000, 4, ReadKind::Data).unwrap_err();
        assert!(err.to_string().contains("out of bound"));

        let err = mem.write(MBASE - 4, 4, 0).unwrap_err();
        assert!(err.to_string().contains("out of bound"));
    }

    #[test]
    fn test_access_must_fit_entirely() {
        let mut mem = Memory::new(false);

        let last = MBASE + (MSIZE as u32 - 1);
        assert_eq!(mem.read(last, 1, ReadKind::Data).unwrap(), 0);
        assert!(mem.read(last, 4, ReadKind::Data).is_err());
        assert!(mem.write(last - 1, 4, 0).is_err());
    }

    #[test]
    fn test_guest_host_round_trip() {
        assert_eq!(Memory::guest_to_host(MBASE), 0);
        assert_eq!(Memory::host_to_guest(0x100), MBASE + 0x100);
        assert_eq!(
            Memory::host_to_guest(Memory::guest_to_host(0x8000_1234)),
            0x8000_1234
        );
    }

    #[test]
    fn test_load_bounds() {
        let mut mem = Memory::new(false);

        mem.load(MBASE, &[1, 2, 3, 4]).unwrap();
        assert_eq!(mem.read(MBASE, 4, ReadKind::Data).unwrap(), 0x0403_0201);

        assert!(mem.load(MBASE + MSIZE as u32 - 2, &[0; 4]).is_err());
        assert!(mem.load(0, &[0; 4]).is_err());
    }

    struct FixedDevice(u32);

    impl Device for FixedDevice {
        fn read(&mut self, _addr: u32, _len: usize) -> Result<u32> {
            Ok(self.0)
        }

        fn write(&mut self, _addr: u32, _len: usize, data: u32) -> Result<()> {
            self.0 = data;
            Ok(())
        }
    }

    #[test]
    fn test_mmio_delegation() {
        let mut mem = Memory::new(false);
        mem.set_mmio(Box::new(FixedDevice(0x55)));

        assert_eq!(mem.read(0x1000_0000, 4, ReadKind::Data).unwrap(), 0x55);
        mem.write(0x1000_0000, 4, 0x77).unwrap();
        assert_eq!(mem.read(0x1000_0000, 4, ReadKind::Data).unwrap(), 0x77);

        // In-bounds accesses never reach the device.
        mem.write(MBASE, 4, 0x42).unwrap();
        assert_eq!(mem.read(MBASE, 4, ReadKind::Data).unwrap(), 0x42);
    }

    #[test]
    fn test_randomized_memory_is_reproducible_in_bounds() {
        let mut mem = Memory::new(true);

        // Whatever the fill produced, reads must agree with themselves.
        let a = mem.read(MBASE + 8, 4, ReadKind::Data).unwrap();
        let b = mem.read(MBASE + 8, 4, ReadKind::Data).unwrap();
        assert_eq!(a, b);
    }
}
