//! Logical addresses into the hybrid log.
//!
//! An address is a 48-bit monotonically increasing byte offset into the log.
//! Addresses are never reused; the region an address falls into (mutable,
//! read-only, on-disk) is decided by comparing it against the log frontiers.
//! Bit 47 is reserved as the read-cache marker, so the main log is limited to
//! 47 bits of real address space.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// A logical address in the hybrid log (or, with bit 47 set, the read cache).
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Address(u64);

impl Address {
    /// The invalid address. Also the value of an empty hash entry, which is
    /// why the log itself never allocates address zero.
    pub const INVALID: Self = Self(0);

    /// Number of address bits.
    pub const BITS: u32 = 48;

    /// Largest representable address.
    pub const MAX: u64 = (1 << Self::BITS) - 1;

    /// Marker bit distinguishing read-cache addresses from main-log ones.
    pub const READ_CACHE_BIT: u64 = 1 << (Self::BITS - 1);

    /// Mask selecting the address bits out of a packed word.
    pub const MASK: u64 = (1 << Self::BITS) - 1;

    /// Create an address from a raw value.
    #[inline]
    pub const fn new(control: u64) -> Self {
        debug_assert!(control <= Self::MAX);
        Self(control)
    }

    /// Address of the first byte of `page` for a given page size.
    #[inline]
    pub const fn from_page(page: u64, page_bits: u32) -> Self {
        Self(page << page_bits)
    }

    /// Raw value.
    #[inline]
    pub const fn control(&self) -> u64 {
        self.0
    }

    /// Page index for a given page size (read-cache bit excluded).
    #[inline]
    pub const fn page(&self, page_bits: u32) -> u64 {
        (self.0 & !Self::READ_CACHE_BIT) >> page_bits
    }

    /// Byte offset within the page for a given page size.
    #[inline]
    pub const fn offset(&self, page_bits: u32) -> u64 {
        self.0 & ((1 << page_bits) - 1)
    }

    #[inline]
    pub const fn is_invalid(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.0 != 0
    }

    /// Whether this address points into the read cache.
    #[inline]
    pub const fn in_read_cache(&self) -> bool {
        (self.0 & Self::READ_CACHE_BIT) != 0
    }

    /// The address with the read-cache marker stripped.
    #[inline]
    pub const fn without_read_cache_bit(&self) -> Self {
        Self(self.0 & !Self::READ_CACHE_BIT)
    }

    /// The address with the read-cache marker set.
    #[inline]
    pub const fn with_read_cache_bit(&self) -> Self {
        Self(self.0 | Self::READ_CACHE_BIT)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.in_read_cache() {
            write!(f, "Address(rc:{})", self.without_read_cache_bit().0)
        } else {
            write!(f, "Address({})", self.0)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for Address {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add<u64> for Address {
    type Output = Self;

    #[inline]
    fn add(self, delta: u64) -> Self::Output {
        Self(self.0 + delta)
    }
}

impl AddAssign<u64> for Address {
    #[inline]
    fn add_assign(&mut self, delta: u64) {
        self.0 += delta;
    }
}

impl Sub for Address {
    type Output = u64;

    #[inline]
    fn sub(self, other: Self) -> Self::Output {
        debug_assert!(self.0 >= other.0);
        self.0 - other.0
    }
}

impl From<u64> for Address {
    #[inline]
    fn from(control: u64) -> Self {
        Self(control)
    }
}

impl From<Address> for u64 {
    #[inline]
    fn from(addr: Address) -> Self {
        addr.0
    }
}

/// Atomic cell holding an `Address`.
#[repr(transparent)]
#[derive(Default)]
pub struct AtomicAddress {
    control: AtomicU64,
}

impl AtomicAddress {
    #[inline]
    pub const fn new(address: Address) -> Self {
        Self {
            control: AtomicU64::new(address.0),
        }
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> Address {
        Address(self.control.load(ordering))
    }

    #[inline]
    pub fn store(&self, address: Address, ordering: AtomicOrdering) {
        self.control.store(address.0, ordering);
    }

    #[inline]
    pub fn compare_exchange(
        &self,
        current: Address,
        new: Address,
        success: AtomicOrdering,
        failure: AtomicOrdering,
    ) -> Result<Address, Address> {
        self.control
            .compare_exchange(current.0, new.0, success, failure)
            .map(Address)
            .map_err(Address)
    }

    /// Monotonically advance to `target`. Returns true if this call moved the
    /// frontier (false if it was already at or past `target`).
    pub fn advance_to(&self, target: Address) -> bool {
        let mut current = self.load(AtomicOrdering::Acquire);
        loop {
            if target <= current {
                return false;
            }
            match self.compare_exchange(
                current,
                target,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for AtomicAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicAddress({:?})", self.load(AtomicOrdering::Relaxed))
    }
}

impl Clone for AtomicAddress {
    fn clone(&self) -> Self {
        Self::new(self.load(AtomicOrdering::Relaxed))
    }
}

/// Packed (page, in-page offset) word used for tail reservation.
///
/// The offset field is 40 bits, deliberately much wider than any page size,
/// so that racing `fetch_add` reservations can overflow past the page end
/// without wrapping; the overflowing reservations lose and retry on the next
/// page. The page field occupies the remaining 24 bits.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct TailOffset(u64);

impl TailOffset {
    const OFFSET_FIELD_BITS: u32 = 40;
    const OFFSET_FIELD_MASK: u64 = (1 << Self::OFFSET_FIELD_BITS) - 1;

    #[inline]
    pub const fn new(page: u64, offset: u64) -> Self {
        debug_assert!(offset <= Self::OFFSET_FIELD_MASK);
        Self((page << Self::OFFSET_FIELD_BITS) | offset)
    }

    #[inline]
    pub const fn page(&self) -> u64 {
        self.0 >> Self::OFFSET_FIELD_BITS
    }

    /// In-page offset; may exceed the page size after racing reservations.
    #[inline]
    pub const fn offset(&self) -> u64 {
        self.0 & Self::OFFSET_FIELD_MASK
    }

    /// Clamp to a real log address for a given page size.
    #[inline]
    pub fn to_address(self, page_bits: u32) -> Address {
        let page_size = 1u64 << page_bits;
        let offset = self.offset().min(page_size);
        Address::new((self.page() << page_bits) + offset)
    }

    #[inline]
    pub fn from_address(address: Address, page_bits: u32) -> Self {
        Self::new(address.page(page_bits), address.offset(page_bits))
    }
}

impl fmt::Debug for TailOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TailOffset(page={}, offset={})", self.page(), self.offset())
    }
}

/// Atomic tail reservation word.
pub struct AtomicTailOffset {
    control: AtomicU64,
}

impl AtomicTailOffset {
    #[inline]
    pub const fn new(tail: TailOffset) -> Self {
        Self {
            control: AtomicU64::new(tail.0),
        }
    }

    #[inline]
    pub fn load(&self, ordering: AtomicOrdering) -> TailOffset {
        TailOffset(self.control.load(ordering))
    }

    #[inline]
    pub fn store(&self, tail: TailOffset, ordering: AtomicOrdering) {
        self.control.store(tail.0, ordering);
    }

    /// Reserve `len` bytes on the current page; returns the pre-reservation
    /// tail. The caller must check whether the reservation overflowed the
    /// page.
    #[inline]
    pub fn reserve(&self, len: u64) -> TailOffset {
        TailOffset(self.control.fetch_add(len, AtomicOrdering::AcqRel))
    }

    /// Move the tail from `old_page` to the start of the next page.
    ///
    /// Returns `(advanced, won)`: `advanced` is true once some thread has
    /// moved past `old_page`; `won` is true only for the thread whose CAS
    /// performed the move (that thread seals the old page).
    pub fn try_new_page(&self, old_page: u64) -> (bool, bool) {
        let current = self.load(AtomicOrdering::Acquire);
        if current.page() != old_page {
            return (current.page() > old_page, false);
        }
        let next = TailOffset::new(old_page + 1, 0);
        match self.control.compare_exchange(
            current.0,
            next.0,
            AtomicOrdering::AcqRel,
            AtomicOrdering::Acquire,
        ) {
            Ok(_) => (true, true),
            Err(actual) => (TailOffset(actual).page() > old_page, false),
        }
    }
}

impl Default for AtomicTailOffset {
    fn default() -> Self {
        Self::new(TailOffset::default())
    }
}

impl fmt::Debug for AtomicTailOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AtomicTailOffset({:?})", self.load(AtomicOrdering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_page_offset_split() {
        let addr = Address::new((3 << 12) + 100);
        assert_eq!(addr.page(12), 3);
        assert_eq!(addr.offset(12), 100);
        assert_eq!(Address::from_page(3, 12) + 100, addr);
    }

    #[test]
    fn address_ordering_and_arithmetic() {
        let a = Address::new(100);
        let b = a + 28;
        assert!(a < b);
        assert_eq!(b - a, 28);
    }

    #[test]
    fn read_cache_marker() {
        let addr = Address::new(4096).with_read_cache_bit();
        assert!(addr.in_read_cache());
        assert_eq!(addr.without_read_cache_bit(), Address::new(4096));
        assert!(!Address::new(4096).in_read_cache());
    }

    #[test]
    fn atomic_advance_is_monotonic() {
        let frontier = AtomicAddress::new(Address::new(100));
        assert!(frontier.advance_to(Address::new(200)));
        assert!(!frontier.advance_to(Address::new(150)));
        assert_eq!(frontier.load(AtomicOrdering::Relaxed), Address::new(200));
    }

    #[test]
    fn tail_reserve_and_page_roll() {
        let tail = AtomicTailOffset::new(TailOffset::new(0, 0));
        let prev = tail.reserve(64);
        assert_eq!(prev.page(), 0);
        assert_eq!(prev.offset(), 0);
        assert_eq!(tail.load(AtomicOrdering::Relaxed).offset(), 64);

        let (advanced, won) = tail.try_new_page(0);
        assert!(advanced);
        assert!(won);
        let now = tail.load(AtomicOrdering::Relaxed);
        assert_eq!(now.page(), 1);
        assert_eq!(now.offset(), 0);

        // A second roll for the stale page does not win.
        let (advanced, won) = tail.try_new_page(0);
        assert!(advanced);
        assert!(!won);
    }
}
