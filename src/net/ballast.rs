//! Memory ballast.
//!
//! A reserved, never-written allocation held while the engine serves. The
//! pages stay virtual until touched, so the block raises the process's
//! reserved footprint without costing resident memory.

use std::collections::TryReserveError;

const MIB: usize = 1 << 20;

#[derive(Debug)]
pub struct Ballast {
    block: Vec<u8>,
}

impl Ballast {
    /// Reserve `size_mib` MiB. Fails instead of aborting when the
    /// allocator refuses.
    pub fn allocate(size_mib: usize) -> Result<Self, TryReserveError> {
        let mut block = Vec::new();
        block.try_reserve_exact(size_mib.saturating_mul(MIB))?;
        Ok(Self { block })
    }

    /// Reserved size in bytes.
    pub fn capacity(&self) -> usize {
        self.block.capacity()
    }
}
