use tokio::time::Instant;

/// Byte-granular view of the device's 16-bit address space: the most recent
/// value observed for each address together with the instant of observation.
///
/// The gateway consults it before going to the wire and refreshes it after
/// every successful read; it is guarded by the gateway's command mutex.
pub(crate) struct MemCache {
    values: Box<[u8]>,
    observed: Box<[Option<Instant>]>,
}

impl MemCache {
    pub(crate) fn new() -> MemCache {
        MemCache {
            values: vec![0; 1 << 16].into_boxed_slice(),
            observed: vec![None; 1 << 16].into_boxed_slice(),
        }
    }

    /// Returns the cached run `[address, address + len)` and the oldest of
    /// its observation stamps, or `None` when any byte has never been read.
    pub(crate) fn lookup(&self, address: u16, len: usize) -> Option<(Vec<u8>, Instant)> {
        let mut body = Vec::with_capacity(len);
        let mut oldest: Option<Instant> = None;
        let mut addr = address;
        for _ in 0..len {
            let index = usize::from(addr);
            let observed = self.observed[index]?;
            oldest = Some(match oldest {
                Some(o) => o.min(observed),
                None => observed,
            });
            body.push(self.values[index]);
            addr = addr.wrapping_add(1);
        }
        oldest.map(|o| (body, o))
    }

    pub(crate) fn store(&mut self, address: u16, data: &[u8], at: Instant) {
        let mut addr = address;
        for b in data {
            let index = usize::from(addr);
            self.values[index] = *b;
            self.observed[index] = Some(at);
            addr = addr.wrapping_add(1);
        }
    }
}
