//! # User Mapping Exporter
//!
//! Maps a slice of the DMA buffer into the calling process, zero-copy.
//! The mapping aliases the buffer's memory, so stores through either side
//! are visible through the other without any copy or flush.

use alloc::sync::Arc;

use pcidma_core::{is_page_aligned, ByteSize, Error, PciAddr, Result, UserAddr};
use pcidma_hal::{MappingFlags, Platform};

use crate::dma::{DmaBuffer, DmaRegion};

/// A live mapping of DMA memory in a process
#[derive(Debug)]
pub struct UserMapping<P: Platform> {
    platform: Arc<P>,
    dev: PciAddr,
    region: Arc<DmaRegion>,
    user: UserAddr,
    offset: u64,
    size: u64,
    mapped: ByteSize,
    flags: MappingFlags,
}

impl<P: Platform> UserMapping<P> {
    /// Map `size` bytes of `buffer`, starting `offset` bytes in
    ///
    /// `offset` must be page aligned, `size` non-zero, and the range must
    /// lie inside the buffer. Anything else is `InvalidArgument`.
    pub fn map_into_process(buffer: &DmaBuffer<P>, size: u64, offset: u64) -> Result<Self> {
        let dev = buffer.addr();
        let desc = buffer.descriptor();
        if !desc.allocated {
            return Err(Error::NotBound);
        }
        if size == 0 || !is_page_aligned(offset) {
            return Err(Error::InvalidArgument);
        }
        let end = offset.checked_add(size).ok_or(Error::InvalidArgument)?;
        if end > desc.length_bytes.as_bytes() {
            log::warn!(
                "{}: mmap of {:#x}+{:#x} exceeds the {} buffer",
                dev,
                offset,
                size,
                desc.length_bytes
            );
            return Err(Error::InvalidArgument);
        }
        // Offset and buffer length are page multiples, so rounding up the
        // size cannot leave the buffer
        let mapped = ByteSize::from_bytes(size)
            .page_aligned()
            .ok_or(Error::InvalidArgument)?;

        let bus = desc.bus_address_at(offset, size)?;
        let flags = MappingFlags::DMA_BUFFER;
        let platform = buffer.platform();
        let user = platform.map_user(dev, bus, mapped, flags)?;
        let region = Arc::clone(buffer.region());
        if let Err(e) = region.attach(user, mapped) {
            platform.unmap_user(dev, user, mapped);
            return Err(e);
        }
        log::debug!(
            "{}: mapped {:#x} bytes at {:?} (buffer offset {:#x})",
            dev,
            size,
            user,
            offset
        );

        Ok(Self {
            platform: Arc::clone(platform),
            dev,
            region,
            user,
            offset,
            size,
            mapped,
            flags,
        })
    }

    /// Start of the mapping in the process
    pub fn user_addr(&self) -> UserAddr {
        self.user
    }

    /// Requested size in bytes
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Check for an empty mapping (never true for a live mapping)
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Offset into the DMA buffer
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Policy flags of the mapping
    pub fn flags(&self) -> MappingFlags {
        self.flags
    }

    /// Has the underlying buffer been freed
    pub fn is_revoked(&self) -> bool {
        self.region.is_revoked()
    }

    fn check(&self, at: u64, len: usize) -> Result<u64> {
        if self.is_revoked() {
            return Err(Error::NotBound);
        }
        let end = at.checked_add(len as u64).ok_or(Error::InvalidArgument)?;
        if end > self.size {
            return Err(Error::InvalidArgument);
        }
        Ok(self.offset + at)
    }

    /// Load through the mapping
    pub fn read(&self, at: u64, buf: &mut [u8]) -> Result<()> {
        let offset = self.check(at, buf.len())?;
        self.region.read(offset, buf)
    }

    /// Store through the mapping
    pub fn write(&self, at: u64, data: &[u8]) -> Result<()> {
        let offset = self.check(at, data.len())?;
        self.region.write(offset, data)
    }
}

impl<P: Platform> Drop for UserMapping<P> {
    fn drop(&mut self) {
        // Already torn down if the buffer was freed first
        if let Some(len) = self.region.detach(self.user) {
            self.platform.unmap_user(self.dev, self.user, len);
            log::debug!("{}: unmapped {:?}", self.dev, self.user);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{platform, DEV};
    use pcidma_core::PAGE_SIZE;
    use pcidma_hal::sim::Faults;

    const MIB: u64 = 1 << 20;

    #[test]
    fn test_mapping_boundaries() {
        let sim = platform();
        let buffer = DmaBuffer::allocate(&sim, DEV, ByteSize::from_mib(4)).unwrap();

        assert_eq!(
            UserMapping::map_into_process(&buffer, 8 * MIB, 0).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(
            UserMapping::map_into_process(&buffer, 3 * MIB, 2 * MIB).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(
            UserMapping::map_into_process(&buffer, 0, 0).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(
            UserMapping::map_into_process(&buffer, PAGE_SIZE, 100).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(
            UserMapping::map_into_process(&buffer, u64::MAX, PAGE_SIZE).unwrap_err(),
            Error::InvalidArgument
        );
        assert_eq!(sim.user_mappings(), 0);

        let whole = UserMapping::map_into_process(&buffer, 4 * MIB, 0).unwrap();
        let upper = UserMapping::map_into_process(&buffer, 2 * MIB, 2 * MIB).unwrap();
        assert_eq!(whole.len(), 4 * MIB);
        assert_eq!(upper.offset(), 2 * MIB);
        assert_eq!(sim.user_mappings(), 2);
    }

    #[test]
    fn test_mapping_aliases_buffer() {
        let sim = platform();
        let buffer = DmaBuffer::allocate(&sim, DEV, ByteSize::from_mib(4)).unwrap();
        let mapping = UserMapping::map_into_process(&buffer, 2 * MIB, 2 * MIB).unwrap();

        // Driver-side store, process-side load
        buffer.write(2 * MIB + 16, &[0xa5; 4]).unwrap();
        let mut out = [0u8; 4];
        mapping.read(16, &mut out).unwrap();
        assert_eq!(out, [0xa5; 4]);

        // And the other way round
        mapping.write(0, b"user").unwrap();
        buffer.read(2 * MIB, &mut out).unwrap();
        assert_eq!(&out, b"user");

        // The platform resolves the user address to the same memory
        let cpu = sim.user_to_cpu(mapping.user_addr()).unwrap();
        assert_eq!(cpu, buffer.descriptor().cpu_address.offset(2 * MIB as usize));
        assert_eq!(sim.user_mapping_flags(mapping.user_addr()), Some(MappingFlags::DMA_BUFFER));

        assert_eq!(mapping.read(2 * MIB - 2, &mut out), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_mapping_revoked_with_buffer() {
        let sim = platform();
        let buffer = DmaBuffer::allocate(&sim, DEV, ByteSize::from_kib(64)).unwrap();
        let mapping = UserMapping::map_into_process(&buffer, 4096, 0).unwrap();
        drop(buffer);

        assert!(mapping.is_revoked());
        assert_eq!(sim.user_mappings(), 0);
        let mut out = [0u8; 1];
        assert_eq!(mapping.read(0, &mut out), Err(Error::NotBound));
        assert_eq!(mapping.write(0, &out), Err(Error::NotBound));
        drop(mapping);
        assert_eq!(sim.outstanding(DEV), 0);
    }

    #[test]
    fn test_unmap_on_drop() {
        let sim = platform();
        let buffer = DmaBuffer::allocate(&sim, DEV, ByteSize::from_kib(64)).unwrap();
        let mapping = UserMapping::map_into_process(&buffer, 100, 0).unwrap();
        assert_eq!(buffer.region().mapping_count(), 1);
        drop(mapping);
        assert_eq!(buffer.region().mapping_count(), 0);
        assert_eq!(sim.user_mappings(), 0);

        sim.inject(Faults::MAP_USER);
        assert_eq!(
            UserMapping::map_into_process(&buffer, 100, 0).unwrap_err(),
            Error::MapFailed
        );
    }
}
