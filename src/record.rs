//! On-log record format.
//!
//! Every record starts with an 8-byte atomic header followed by the encoded
//! key and value bytes. The header packs:
//!
//! - `previous_address` (48 bits): prior record in the same hash chain;
//! - `version` (11 bits): checkpoint version the record was written in;
//! - `sealed` (bit 59): a copy-updater claimed this record as its source;
//!   in-place updaters back off and retry against the replacement;
//! - `lock` (bit 60): short-term exclusive latch serialising in-place value
//!   access in the mutable region; never set on flushed records (the
//!   region becomes append-only, via epoch drain, before it is flushed);
//! - `invalid` (bit 61): record retired (lost install race, unlinked head);
//!   chain walks skip it;
//! - `tombstone` (bit 62): delete marker;
//! - `in_new_version` (bit 63): written by a session that had already moved
//!   to the post-checkpoint version; never visible in the recovered image of
//!   the version being checkpointed.
//!
//! Fixed-layout codecs store bare key/value bytes after the header.
//! Variable-length codecs prefix them with `key_len: u32, value_len: u32`.
//! Records are padded to 8-byte alignment; a zero header therefore always
//! means "no record here" (end of the used part of a page).

use std::mem;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::codec::{KeyCodec, StoreKey, StoreValue, ValueCodec};
use crate::status::Status;
use crate::utility::pad_to;

/// Size of the record header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Size of the `key_len`/`value_len` prefix for variable-length records.
pub const VARLEN_PREFIX_SIZE: usize = 2 * mem::size_of::<u32>();

/// The 8-byte record header.
#[repr(transparent)]
pub struct RecordHeader {
    control: AtomicU64,
}

impl RecordHeader {
    const VERSION_SHIFT: u32 = 48;
    const VERSION_MASK: u64 = (1 << 11) - 1;
    const SEAL_BIT: u64 = 1 << 59;
    const LOCK_BIT: u64 = 1 << 60;
    const INVALID_BIT: u64 = 1 << 61;
    const TOMBSTONE_BIT: u64 = 1 << 62;
    const NEW_VERSION_BIT: u64 = 1 << 63;

    /// Build a header word without materialising a `RecordHeader`.
    pub fn pack(
        previous_address: Address,
        version: u32,
        tombstone: bool,
        in_new_version: bool,
    ) -> u64 {
        let mut control = previous_address.control() & Address::MASK;
        control |= ((version as u64) & Self::VERSION_MASK) << Self::VERSION_SHIFT;
        if tombstone {
            control |= Self::TOMBSTONE_BIT;
        }
        if in_new_version {
            control |= Self::NEW_VERSION_BIT;
        }
        control
    }

    pub fn from_control(control: u64) -> Self {
        Self {
            control: AtomicU64::new(control),
        }
    }

    #[inline]
    pub fn control(&self) -> u64 {
        self.control.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.control() == 0
    }

    #[inline]
    pub fn previous_address(&self) -> Address {
        Address::new(self.control() & Address::MASK)
    }

    #[inline]
    pub fn version(&self) -> u32 {
        ((self.control() >> Self::VERSION_SHIFT) & Self::VERSION_MASK) as u32
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        (self.control() & Self::INVALID_BIT) != 0
    }

    #[inline]
    pub fn set_invalid(&self) {
        self.control.fetch_or(Self::INVALID_BIT, Ordering::AcqRel);
    }

    #[inline]
    pub fn is_tombstone(&self) -> bool {
        (self.control() & Self::TOMBSTONE_BIT) != 0
    }

    #[inline]
    pub fn in_new_version(&self) -> bool {
        (self.control() & Self::NEW_VERSION_BIT) != 0
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        (self.control() & Self::SEAL_BIT) != 0
    }

    /// Claim this record as a copy-update source. Call under the latch.
    #[inline]
    pub fn seal(&self) {
        self.control.fetch_or(Self::SEAL_BIT, Ordering::AcqRel);
    }

    /// Release a seal whose copy-update lost its install CAS.
    #[inline]
    pub fn unseal(&self) {
        self.control.fetch_and(!Self::SEAL_BIT, Ordering::AcqRel);
    }

    /// Take the record latch, spinning on contention.
    pub fn lock_exclusive(&self) {
        loop {
            let current = self.control.load(Ordering::Acquire);
            if current & Self::LOCK_BIT == 0
                && self
                    .control
                    .compare_exchange_weak(
                        current,
                        current | Self::LOCK_BIT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                return;
            }
            std::hint::spin_loop();
        }
    }

    /// Release the record latch.
    pub fn unlock(&self) {
        self.control.fetch_and(!Self::LOCK_BIT, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for RecordHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordHeader")
            .field("previous_address", &self.previous_address())
            .field("version", &self.version())
            .field("invalid", &self.is_invalid())
            .field("tombstone", &self.is_tombstone())
            .field("in_new_version", &self.in_new_version())
            .finish()
    }
}

const _: () = assert!(mem::size_of::<RecordHeader>() == HEADER_SIZE);

/// Whether records of `(K, V)` have a fixed byte layout.
#[inline]
pub(crate) const fn is_fixed_layout<K, V>() -> bool
where
    K: StoreKey,
    V: StoreValue,
{
    <K as StoreKey>::Codec::IS_FIXED && <V as StoreValue>::Codec::IS_FIXED
}

/// Payload byte length of a fixed-layout record (header + key + value).
#[inline]
pub(crate) fn fixed_payload_len<K, V>() -> usize
where
    K: StoreKey,
    V: StoreValue,
{
    debug_assert!(is_fixed_layout::<K, V>());
    HEADER_SIZE + <K as StoreKey>::Codec::FIXED_LEN + <V as StoreValue>::Codec::FIXED_LEN
}

/// Byte lengths of one record as laid out in the log.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordLayout {
    /// Bytes meaningful on disk (header + prefixes + key + value).
    pub payload_len: usize,
    /// Bytes reserved in the log (payload padded to header alignment).
    pub alloc_len: usize,
    pub key_len: usize,
    pub value_len: usize,
}

impl RecordLayout {
    /// Layout for writing `key` with `value` (`None` = tombstone).
    pub fn for_write<K, V>(key: &K, value: Option<&V>) -> Result<Self, Status>
    where
        K: StoreKey,
        V: StoreValue,
    {
        if is_fixed_layout::<K, V>() {
            let payload_len = fixed_payload_len::<K, V>();
            Ok(Self {
                payload_len,
                alloc_len: pad_to(payload_len, HEADER_SIZE),
                key_len: <K as StoreKey>::Codec::FIXED_LEN,
                value_len: <V as StoreValue>::Codec::FIXED_LEN,
            })
        } else {
            let key_len = <K as StoreKey>::Codec::encoded_len(key)?;
            // Tombstones in the variable-length layout carry a zero-length
            // value so the codec round-trips the slot.
            let value_len = match value {
                Some(value) => <V as StoreValue>::Codec::encoded_len(value)?,
                None => 0,
            };
            let payload_len = HEADER_SIZE + VARLEN_PREFIX_SIZE + key_len + value_len;
            Ok(Self {
                payload_len,
                alloc_len: pad_to(payload_len, HEADER_SIZE),
                key_len,
                value_len,
            })
        }
    }
}

/// Borrowed view of one record's bytes in the log.
///
/// Valid only while the caller pins the underlying page (epoch protection or
/// an owned buffer).
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecordRef<'a> {
    pub header_control: u64,
    pub key: &'a [u8],
    /// `None` for tombstones.
    pub value: Option<&'a [u8]>,
}

impl<'a> RecordRef<'a> {
    #[inline]
    pub fn previous_address(&self) -> Address {
        Address::new(self.header_control & Address::MASK)
    }

    #[inline]
    pub fn is_tombstone(&self) -> bool {
        (self.header_control & RecordHeader::TOMBSTONE_BIT) != 0
    }

    #[inline]
    pub fn is_invalid(&self) -> bool {
        (self.header_control & RecordHeader::INVALID_BIT) != 0
    }

    #[inline]
    pub fn in_new_version(&self) -> bool {
        (self.header_control & RecordHeader::NEW_VERSION_BIT) != 0
    }

    #[inline]
    pub fn version(&self) -> u32 {
        ((self.header_control >> RecordHeader::VERSION_SHIFT) & RecordHeader::VERSION_MASK) as u32
    }
}

/// Outcome of parsing record bytes that may be truncated (disk reads probe a
/// bounded prefix first).
pub(crate) enum ParsedRecord<'a> {
    Ok(RecordRef<'a>),
    /// The buffer holds fewer bytes than the record occupies; re-read with at
    /// least this many bytes.
    Truncated(usize),
}

/// Bytes a parsed record occupies in the log, padding included; used to
/// advance sequential scans (recovery, cache eviction).
pub(crate) fn record_alloc_len<K, V>(record: &RecordRef<'_>) -> usize
where
    K: StoreKey,
    V: StoreValue,
{
    if is_fixed_layout::<K, V>() {
        pad_to(fixed_payload_len::<K, V>(), HEADER_SIZE)
    } else {
        let value_len = record.value.map_or(0, |v| v.len());
        pad_to(
            HEADER_SIZE + VARLEN_PREFIX_SIZE + record.key.len() + value_len,
            HEADER_SIZE,
        )
    }
}

/// Reference to the atomic header inside the log.
///
/// # Safety
/// `ptr` must point at a record header within a pinned page.
#[inline]
pub(crate) unsafe fn header_at<'a>(ptr: *const u8) -> &'a RecordHeader {
    &*(ptr as *const RecordHeader)
}

/// Parse one record out of `bytes`.
///
/// `bytes` starts at the record header and may extend past the record (other
/// records follow in the same page); it may also be truncated, in which case
/// `ParsedRecord::Truncated` reports the required length.
pub(crate) fn parse_record<'a, K, V>(bytes: &'a [u8]) -> Result<ParsedRecord<'a>, Status>
where
    K: StoreKey,
    V: StoreValue,
{
    if bytes.len() < HEADER_SIZE {
        return Ok(ParsedRecord::Truncated(HEADER_SIZE));
    }
    let header_control = u64::from_le_bytes(bytes[..HEADER_SIZE].try_into().expect("8 bytes"));
    if header_control == 0 {
        // Zeroed slot: allocation padding or an unwritten page suffix.
        return Err(Status::NotFound);
    }
    let tombstone = (header_control & RecordHeader::TOMBSTONE_BIT) != 0;

    if is_fixed_layout::<K, V>() {
        let payload_len = fixed_payload_len::<K, V>();
        if bytes.len() < payload_len {
            return Ok(ParsedRecord::Truncated(payload_len));
        }
        let key_len = <K as StoreKey>::Codec::FIXED_LEN;
        let value_len = <V as StoreValue>::Codec::FIXED_LEN;
        let key = &bytes[HEADER_SIZE..HEADER_SIZE + key_len];
        let value = if tombstone {
            None
        } else {
            Some(&bytes[HEADER_SIZE + key_len..HEADER_SIZE + key_len + value_len])
        };
        Ok(ParsedRecord::Ok(RecordRef {
            header_control,
            key,
            value,
        }))
    } else {
        if bytes.len() < HEADER_SIZE + VARLEN_PREFIX_SIZE {
            return Ok(ParsedRecord::Truncated(HEADER_SIZE + VARLEN_PREFIX_SIZE));
        }
        let key_len =
            u32::from_le_bytes(bytes[HEADER_SIZE..HEADER_SIZE + 4].try_into().expect("4")) as usize;
        let value_len = u32::from_le_bytes(
            bytes[HEADER_SIZE + 4..HEADER_SIZE + 8].try_into().expect("4"),
        ) as usize;
        let payload_len = HEADER_SIZE
            .checked_add(VARLEN_PREFIX_SIZE)
            .and_then(|n| n.checked_add(key_len))
            .and_then(|n| n.checked_add(value_len))
            .ok_or(Status::Corruption)?;
        if bytes.len() < payload_len {
            return Ok(ParsedRecord::Truncated(payload_len));
        }
        if tombstone && value_len != 0 {
            return Err(Status::Corruption);
        }
        let key_start = HEADER_SIZE + VARLEN_PREFIX_SIZE;
        let key = &bytes[key_start..key_start + key_len];
        let value = if tombstone {
            None
        } else {
            Some(&bytes[key_start + key_len..key_start + key_len + value_len])
        };
        Ok(ParsedRecord::Ok(RecordRef {
            header_control,
            key,
            value,
        }))
    }
}

/// Parse a record from raw page memory.
///
/// # Safety
/// `ptr` must point at a record header inside a pinned page with at least
/// `limit` readable bytes.
pub(crate) unsafe fn parse_record_at<'a, K, V>(
    ptr: *const u8,
    limit: usize,
) -> Result<RecordRef<'a>, Status>
where
    K: StoreKey,
    V: StoreValue,
{
    let bytes = slice::from_raw_parts(ptr, limit);
    match parse_record::<K, V>(bytes)? {
        ParsedRecord::Ok(record) => Ok(record),
        ParsedRecord::Truncated(_) => Err(Status::Corruption),
    }
}

/// Write one record into `dst` and return the packed header word.
///
/// `dst` must be at least `layout.alloc_len` bytes; the padding suffix is
/// left as the zeroes the page was initialised with.
pub(crate) fn write_record<K, V>(
    dst: &mut [u8],
    layout: &RecordLayout,
    header_control: u64,
    key: &K,
    value: Option<&V>,
) -> Result<(), Status>
where
    K: StoreKey,
    V: StoreValue,
{
    debug_assert!(dst.len() >= layout.payload_len);
    let mut cursor = HEADER_SIZE;
    if !is_fixed_layout::<K, V>() {
        dst[cursor..cursor + 4].copy_from_slice(&(layout.key_len as u32).to_le_bytes());
        dst[cursor + 4..cursor + 8].copy_from_slice(&(layout.value_len as u32).to_le_bytes());
        cursor += VARLEN_PREFIX_SIZE;
    }
    <K as StoreKey>::Codec::encode_into(key, &mut dst[cursor..cursor + layout.key_len])?;
    cursor += layout.key_len;
    match value {
        Some(value) => {
            <V as StoreValue>::Codec::encode_into(value, &mut dst[cursor..cursor + layout.value_len])?;
        }
        None => debug_assert_eq!(layout.value_len, 0, "tombstones carry no value bytes"),
    }
    // The header is published last so a concurrent chain walker never sees a
    // record whose payload is still being written.
    dst[..HEADER_SIZE].copy_from_slice(&header_control.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_packs_all_fields() {
        let prev = Address::new(123_456);
        let control = RecordHeader::pack(prev, 42, true, true);
        let header = RecordHeader::from_control(control);
        assert_eq!(header.previous_address(), prev);
        assert_eq!(header.version(), 42);
        assert!(header.is_tombstone());
        assert!(header.in_new_version());
        assert!(!header.is_invalid());

        header.set_invalid();
        assert!(header.is_invalid());
        assert_eq!(header.previous_address(), prev);
    }

    #[test]
    fn fixed_record_roundtrip() {
        let layout = RecordLayout::for_write::<u64, u64>(&7, Some(&700)).unwrap();
        assert_eq!(layout.payload_len, 24);
        assert_eq!(layout.alloc_len, 24);

        let mut buf = vec![0u8; layout.alloc_len];
        let control = RecordHeader::pack(Address::INVALID, 1, false, false);
        write_record::<u64, u64>(&mut buf, &layout, control, &7, Some(&700)).unwrap();

        match parse_record::<u64, u64>(&buf).unwrap() {
            ParsedRecord::Ok(record) => {
                assert_eq!(record.key, 7u64.to_le_bytes());
                assert_eq!(record.value.unwrap(), 700u64.to_le_bytes());
                assert!(!record.is_tombstone());
                assert_eq!(record.version(), 1);
            }
            ParsedRecord::Truncated(_) => panic!("record should parse"),
        }
    }

    #[test]
    fn varlen_record_roundtrip() {
        use crate::codec::Bytes;

        let key = Bytes::from(b"key-1".to_vec());
        let value = Bytes::from(b"a longer value".to_vec());
        let layout = RecordLayout::for_write::<Bytes, Bytes>(&key, Some(&value)).unwrap();
        assert_eq!(layout.key_len, 5);
        assert_eq!(layout.value_len, 14);

        let mut buf = vec![0u8; layout.alloc_len];
        let control = RecordHeader::pack(Address::new(64), 3, false, false);
        write_record::<Bytes, Bytes>(&mut buf, &layout, control, &key, Some(&value)).unwrap();

        match parse_record::<Bytes, Bytes>(&buf).unwrap() {
            ParsedRecord::Ok(record) => {
                assert_eq!(record.key, b"key-1");
                assert_eq!(record.value.unwrap(), b"a longer value");
                assert_eq!(record.previous_address(), Address::new(64));
            }
            ParsedRecord::Truncated(_) => panic!("record should parse"),
        }
    }

    #[test]
    fn varlen_tombstone_has_empty_value() {
        use crate::codec::Bytes;

        let key = Bytes::from(b"gone".to_vec());
        let layout = RecordLayout::for_write::<Bytes, Bytes>(&key, None).unwrap();
        assert_eq!(layout.value_len, 0);

        let mut buf = vec![0u8; layout.alloc_len];
        let control = RecordHeader::pack(Address::INVALID, 0, true, false);
        write_record::<Bytes, Bytes>(&mut buf, &layout, control, &key, None).unwrap();

        match parse_record::<Bytes, Bytes>(&buf).unwrap() {
            ParsedRecord::Ok(record) => {
                assert!(record.is_tombstone());
                assert!(record.value.is_none());
            }
            ParsedRecord::Truncated(_) => panic!("record should parse"),
        }
    }

    #[test]
    fn truncated_parse_reports_required_len() {
        let layout = RecordLayout::for_write::<u64, u64>(&7, Some(&700)).unwrap();
        let mut buf = vec![0u8; layout.alloc_len];
        let control = RecordHeader::pack(Address::INVALID, 0, false, false);
        write_record::<u64, u64>(&mut buf, &layout, control, &7, Some(&700)).unwrap();

        match parse_record::<u64, u64>(&buf[..10]).unwrap() {
            ParsedRecord::Truncated(needed) => assert_eq!(needed, 24),
            ParsedRecord::Ok(_) => panic!("should be truncated"),
        }
    }

    #[test]
    fn zero_header_is_not_a_record() {
        let buf = [0u8; 32];
        assert!(matches!(
            parse_record::<u64, u64>(&buf),
            Err(Status::NotFound)
        ));
    }
}
