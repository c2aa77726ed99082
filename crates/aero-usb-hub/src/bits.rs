use std::sync::atomic::{AtomicU32, Ordering};

/// Per-hub pending-work bitset. Bit 0 is the hub itself, bits 1..=31 are ports.
#[derive(Debug, Default)]
pub(crate) struct PortBits(AtomicU32);

impl PortBits {
    pub(crate) fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub(crate) fn set(&self, bit: u8) {
        self.0.fetch_or(mask(bit), Ordering::AcqRel);
    }

    pub(crate) fn clear(&self, bit: u8) {
        self.0.fetch_and(!mask(bit), Ordering::AcqRel);
    }

    pub(crate) fn test(&self, bit: u8) -> bool {
        self.0.load(Ordering::Acquire) & mask(bit) != 0
    }

    pub(crate) fn test_and_clear(&self, bit: u8) -> bool {
        self.0.fetch_and(!mask(bit), Ordering::AcqRel) & mask(bit) != 0
    }

    pub(crate) fn or(&self, bits: u32) {
        self.0.fetch_or(bits, Ordering::AcqRel);
    }

    pub(crate) fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn any(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    pub(crate) fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }
}

fn mask(bit: u8) -> u32 {
    1u32 << (bit & 31)
}
