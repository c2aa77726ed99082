/// Bus address bitmap. Addresses 1..=127 are handed out round-robin so a freshly released
/// address is not immediately reused by the next device.
#[derive(Debug, Clone)]
pub(crate) struct DevnumMap {
    used: u128,
    next: u8,
}

pub(crate) const MAX_DEVNUM: u8 = 127;

impl DevnumMap {
    pub(crate) fn new() -> Self {
        Self { used: 0, next: 1 }
    }

    fn is_used(&self, devnum: u8) -> bool {
        self.used & (1u128 << devnum) != 0
    }

    pub(crate) fn alloc(&mut self) -> Option<u8> {
        let found = (self.next..=MAX_DEVNUM)
            .chain(1..self.next)
            .find(|&n| !self.is_used(n))?;
        self.used |= 1u128 << found;
        self.next = if found >= MAX_DEVNUM { 1 } else { found + 1 };
        Some(found)
    }

    /// Marks a specific address as taken (root hubs always sit at address 1).
    pub(crate) fn reserve(&mut self, devnum: u8) -> bool {
        if devnum == 0 || devnum > MAX_DEVNUM || self.is_used(devnum) {
            return false;
        }
        self.used |= 1u128 << devnum;
        if self.next == devnum {
            self.next = if devnum >= MAX_DEVNUM { 1 } else { devnum + 1 };
        }
        true
    }

    pub(crate) fn release(&mut self, devnum: u8) {
        if devnum > 0 && devnum <= MAX_DEVNUM {
            self.used &= !(1u128 << devnum);
        }
    }

    pub(crate) fn in_use(&self) -> u32 {
        self.used.count_ones()
    }
}
