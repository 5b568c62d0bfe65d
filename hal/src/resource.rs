//! # I/O Memory Resource Tree
//!
//! Tracks which physical register ranges are claimed, and by whom.
//! A range can be claimed by at most one owner; any overlap is `Busy`.

use alloc::vec::Vec;

use pcidma_core::{ByteSize, Error, PciAddr, PhysAddr, Result};
use spin::Mutex;

/// One claimed range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    /// First byte
    pub start: u64,
    /// One past the last byte
    pub end: u64,
    /// Device that holds the claim
    pub owner: PciAddr,
    /// Driver name the claim was taken for
    pub name: &'static str,
}

impl Claim {
    fn overlaps(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

/// Claimed physical ranges
#[derive(Debug, Default)]
pub struct IoResourceTree {
    claims: Mutex<Vec<Claim>>,
}

impl IoResourceTree {
    /// Create an empty tree
    pub const fn new() -> Self {
        Self {
            claims: Mutex::new(Vec::new()),
        }
    }

    /// Claim every range in `ranges` for `owner`, or none of them
    ///
    /// Empty ranges are ignored.
    pub fn claim_all(
        &self,
        ranges: &[(PhysAddr, ByteSize)],
        owner: PciAddr,
        name: &'static str,
    ) -> Result<usize> {
        let mut pending: Vec<Claim> = Vec::with_capacity(ranges.len());
        for &(base, size) in ranges {
            if size.is_zero() {
                continue;
            }
            let start = base.raw();
            let end = start
                .checked_add(size.as_bytes())
                .ok_or(Error::InvalidArgument)?;
            if pending.iter().any(|c| c.overlaps(start, end)) {
                return Err(Error::InvalidArgument);
            }
            pending.push(Claim {
                start,
                end,
                owner,
                name,
            });
        }

        let mut claims = self.claims.lock();
        for new in &pending {
            if let Some(held) = claims.iter().find(|c| c.overlaps(new.start, new.end)) {
                log::warn!(
                    "iomem [{:#x}-{:#x}) for {} conflicts with {} ({})",
                    new.start,
                    new.end,
                    owner,
                    held.owner,
                    held.name
                );
                return Err(Error::Busy);
            }
        }
        let count = pending.len();
        claims.extend(pending);
        Ok(count)
    }

    /// Drop every claim held by `owner`; returns how many were dropped
    pub fn release_owner(&self, owner: PciAddr) -> usize {
        let mut claims = self.claims.lock();
        let before = claims.len();
        claims.retain(|c| c.owner != owner);
        before - claims.len()
    }

    /// Claims currently held by `owner`
    pub fn claims_of(&self, owner: PciAddr) -> usize {
        self.claims.lock().iter().filter(|c| c.owner == owner).count()
    }

    /// Owner of the claim covering `addr`, if any
    pub fn owner_of(&self, addr: PhysAddr) -> Option<PciAddr> {
        let a = addr.raw();
        self.claims
            .lock()
            .iter()
            .find(|c| c.start <= a && a < c.end)
            .map(|c| c.owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_A: PciAddr = PciAddr::new(0, 1, 0, 0);
    const DEV_B: PciAddr = PciAddr::new(0, 2, 0, 0);

    fn range(base: u64, kib: u64) -> (PhysAddr, ByteSize) {
        (PhysAddr::new(base), ByteSize::from_kib(kib))
    }

    #[test]
    fn test_disjoint_claims() {
        let tree = IoResourceTree::new();
        assert_eq!(tree.claim_all(&[range(0x1000, 4)], DEV_A, "a"), Ok(1));
        assert_eq!(tree.claim_all(&[range(0x2000, 4)], DEV_B, "b"), Ok(1));
        assert_eq!(tree.owner_of(PhysAddr::new(0x1fff)), Some(DEV_A));
        assert_eq!(tree.owner_of(PhysAddr::new(0x2000)), Some(DEV_B));
    }

    #[test]
    fn test_overlap_is_busy_and_atomic() {
        let tree = IoResourceTree::new();
        tree.claim_all(&[range(0x1000, 8)], DEV_A, "a").unwrap();
        let err = tree
            .claim_all(&[range(0x8000, 4), range(0x1800, 4)], DEV_B, "b")
            .unwrap_err();
        assert_eq!(err, Error::Busy);
        // Nothing from the failed request stays claimed
        assert_eq!(tree.claims_of(DEV_B), 0);
        assert_eq!(tree.owner_of(PhysAddr::new(0x8000)), None);
    }

    #[test]
    fn test_release_owner() {
        let tree = IoResourceTree::new();
        tree.claim_all(&[range(0x1000, 4), range(0x4000, 4)], DEV_A, "a")
            .unwrap();
        assert_eq!(tree.release_owner(DEV_A), 2);
        assert_eq!(tree.release_owner(DEV_A), 0);
        tree.claim_all(&[range(0x1000, 4)], DEV_B, "b").unwrap();
    }

    #[test]
    fn test_empty_ranges_skipped() {
        let tree = IoResourceTree::new();
        let ranges = [(PhysAddr::new(0x1000), ByteSize::ZERO)];
        assert_eq!(tree.claim_all(&ranges, DEV_A, "a"), Ok(0));
    }
}
