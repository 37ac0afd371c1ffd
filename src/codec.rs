//! Persistence codecs for keys and values.
//!
//! The store works on encoded bytes: a key/value type selects a codec, and
//! the codec defines the byte layout used for in-log storage, disk I/O, key
//! equality, and hashing. Requiring a codec at compile time also settles the
//! key-comparer question — there is no reflective fallback; a type without a
//! codec simply does not build.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::status::Status;

/// Hash encoded key bytes into a 64-bit value.
///
/// Must be deterministic across processes: recovery rebuilds hash chains from
/// persisted bytes, so `DefaultHasher` (randomly seeded) is not an option.
#[inline]
pub fn hash64(bytes: &[u8]) -> u64 {
    xxhash_rust::xxh3::xxh3_64(bytes)
}

/// A key type usable by the store, bound to its default codec.
pub trait StoreKey: Clone + Eq + Send + Sync + 'static {
    /// Codec producing this key's stable byte encoding.
    type Codec: KeyCodec<Self>;
}

/// A value type usable by the store, bound to its default codec.
pub trait StoreValue: Clone + Send + Sync + 'static {
    /// Codec producing this value's stable byte encoding.
    type Codec: ValueCodec<Self>;
}

/// Encode/decode and hashing contract for keys.
pub trait KeyCodec<K>: Send + Sync + 'static {
    /// True when every `K` encodes to exactly `FIXED_LEN` bytes.
    const IS_FIXED: bool;
    /// Encoded length when `IS_FIXED` (zero otherwise).
    const FIXED_LEN: usize;

    fn encoded_len(key: &K) -> Result<usize, Status>;

    /// Write exactly `encoded_len(key)` bytes into `dst`.
    fn encode_into(key: &K, dst: &mut [u8]) -> Result<(), Status>;

    /// Compare in-log encoded bytes against a typed key without allocating.
    fn equals_encoded(encoded: &[u8], key: &K) -> Result<bool, Status>;

    fn decode(encoded: &[u8]) -> Result<K, Status>;

    #[inline]
    fn hash_encoded(encoded: &[u8]) -> u64 {
        hash64(encoded)
    }

    /// Hash a typed key. The default encodes into a scratch buffer;
    /// fixed-size codecs override to stay allocation-free.
    fn hash(key: &K) -> Result<u64, Status> {
        let len = Self::encoded_len(key)?;
        let mut buf = vec![0u8; len];
        Self::encode_into(key, &mut buf)?;
        Ok(Self::hash_encoded(&buf))
    }
}

/// Encode/decode contract for values.
pub trait ValueCodec<V>: Send + Sync + 'static {
    const IS_FIXED: bool;
    const FIXED_LEN: usize;

    fn encoded_len(value: &V) -> Result<usize, Status>;
    fn encode_into(value: &V, dst: &mut [u8]) -> Result<(), Status>;
    fn decode(encoded: &[u8]) -> Result<V, Status>;
}

// ============ Fixed-layout codec for primitive integers ============

/// Codec for fixed-layout primitives stored as little-endian bytes.
pub struct FixedCodec<T> {
    _marker: PhantomData<T>,
}

macro_rules! impl_fixed_codec {
    ($($ty:ty),* $(,)?) => {
        $(
            impl KeyCodec<$ty> for FixedCodec<$ty> {
                const IS_FIXED: bool = true;
                const FIXED_LEN: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn encoded_len(_key: &$ty) -> Result<usize, Status> {
                    Ok(<Self as KeyCodec<$ty>>::FIXED_LEN)
                }

                #[inline]
                fn encode_into(key: &$ty, dst: &mut [u8]) -> Result<(), Status> {
                    if dst.len() < <Self as KeyCodec<$ty>>::FIXED_LEN {
                        return Err(Status::InvalidArgument);
                    }
                    dst[..<Self as KeyCodec<$ty>>::FIXED_LEN].copy_from_slice(&key.to_le_bytes());
                    Ok(())
                }

                #[inline]
                fn equals_encoded(encoded: &[u8], key: &$ty) -> Result<bool, Status> {
                    if encoded.len() < <Self as KeyCodec<$ty>>::FIXED_LEN {
                        return Err(Status::Corruption);
                    }
                    Ok(encoded[..<Self as KeyCodec<$ty>>::FIXED_LEN] == key.to_le_bytes())
                }

                #[inline]
                fn decode(encoded: &[u8]) -> Result<$ty, Status> {
                    let bytes: [u8; std::mem::size_of::<$ty>()] = encoded
                        .get(..<Self as KeyCodec<$ty>>::FIXED_LEN)
                        .and_then(|b| b.try_into().ok())
                        .ok_or(Status::Corruption)?;
                    Ok(<$ty>::from_le_bytes(bytes))
                }

                #[inline]
                fn hash(key: &$ty) -> Result<u64, Status> {
                    Ok(hash64(&key.to_le_bytes()))
                }
            }

            impl ValueCodec<$ty> for FixedCodec<$ty> {
                const IS_FIXED: bool = true;
                const FIXED_LEN: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn encoded_len(_value: &$ty) -> Result<usize, Status> {
                    Ok(<Self as ValueCodec<$ty>>::FIXED_LEN)
                }

                #[inline]
                fn encode_into(value: &$ty, dst: &mut [u8]) -> Result<(), Status> {
                    <Self as KeyCodec<$ty>>::encode_into(value, dst)
                }

                #[inline]
                fn decode(encoded: &[u8]) -> Result<$ty, Status> {
                    <Self as KeyCodec<$ty>>::decode(encoded)
                }
            }

            impl StoreKey for $ty {
                type Codec = FixedCodec<$ty>;
            }

            impl StoreValue for $ty {
                type Codec = FixedCodec<$ty>;
            }
        )*
    };
}

impl_fixed_codec!(u16, u32, u64, i16, i32, i64);

// ============ Variable-length byte string ============

/// Owned byte-string key/value with an identity encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Bytes(pub Vec<u8>);

impl From<Vec<u8>> for Bytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Bytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Identity codec for `Bytes`.
pub struct BytesCodec;

impl KeyCodec<Bytes> for BytesCodec {
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    #[inline]
    fn encoded_len(key: &Bytes) -> Result<usize, Status> {
        Ok(key.0.len())
    }

    #[inline]
    fn encode_into(key: &Bytes, dst: &mut [u8]) -> Result<(), Status> {
        if dst.len() < key.0.len() {
            return Err(Status::InvalidArgument);
        }
        dst[..key.0.len()].copy_from_slice(&key.0);
        Ok(())
    }

    #[inline]
    fn equals_encoded(encoded: &[u8], key: &Bytes) -> Result<bool, Status> {
        Ok(encoded == key.0.as_slice())
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<Bytes, Status> {
        Ok(Bytes(encoded.to_vec()))
    }
}

impl ValueCodec<Bytes> for BytesCodec {
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    #[inline]
    fn encoded_len(value: &Bytes) -> Result<usize, Status> {
        Ok(value.0.len())
    }

    #[inline]
    fn encode_into(value: &Bytes, dst: &mut [u8]) -> Result<(), Status> {
        <Self as KeyCodec<Bytes>>::encode_into(value, dst)
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<Bytes, Status> {
        <Self as KeyCodec<Bytes>>::decode(encoded)
    }
}

impl StoreKey for Bytes {
    type Codec = BytesCodec;
}

impl StoreValue for Bytes {
    type Codec = BytesCodec;
}

// ============ UTF-8 string ============

/// UTF-8 string key/value encoded as its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Str(pub String);

impl From<&str> for Str {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Str {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Codec for `Str`; decoding validates UTF-8.
pub struct StrCodec;

impl KeyCodec<Str> for StrCodec {
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    #[inline]
    fn encoded_len(key: &Str) -> Result<usize, Status> {
        Ok(key.0.len())
    }

    #[inline]
    fn encode_into(key: &Str, dst: &mut [u8]) -> Result<(), Status> {
        if dst.len() < key.0.len() {
            return Err(Status::InvalidArgument);
        }
        dst[..key.0.len()].copy_from_slice(key.0.as_bytes());
        Ok(())
    }

    #[inline]
    fn equals_encoded(encoded: &[u8], key: &Str) -> Result<bool, Status> {
        Ok(encoded == key.0.as_bytes())
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<Str, Status> {
        String::from_utf8(encoded.to_vec())
            .map(Str)
            .map_err(|_| Status::Corruption)
    }
}

impl ValueCodec<Str> for StrCodec {
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    #[inline]
    fn encoded_len(value: &Str) -> Result<usize, Status> {
        Ok(value.0.len())
    }

    #[inline]
    fn encode_into(value: &Str, dst: &mut [u8]) -> Result<(), Status> {
        <Self as KeyCodec<Str>>::encode_into(value, dst)
    }

    #[inline]
    fn decode(encoded: &[u8]) -> Result<Str, Status> {
        <Self as KeyCodec<Str>>::decode(encoded)
    }
}

impl StoreKey for Str {
    type Codec = StrCodec;
}

impl StoreValue for Str {
    type Codec = StrCodec;
}

// ============ Serde wrapper ============

/// Wrapper persisting any serde type through bincode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Serde<T>(pub T);

/// Bincode-backed codec for `Serde<T>`.
pub struct SerdeCodec<T> {
    _marker: PhantomData<T>,
}

impl<T> KeyCodec<Serde<T>> for SerdeCodec<T>
where
    T: Serialize + DeserializeOwned + Clone + Eq + Send + Sync + 'static,
{
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    fn encoded_len(key: &Serde<T>) -> Result<usize, Status> {
        bincode::serialized_size(&key.0)
            .map(|n| n as usize)
            .map_err(|_| Status::InvalidArgument)
    }

    fn encode_into(key: &Serde<T>, dst: &mut [u8]) -> Result<(), Status> {
        bincode::serialize_into(dst, &key.0).map_err(|_| Status::InvalidArgument)
    }

    fn equals_encoded(encoded: &[u8], key: &Serde<T>) -> Result<bool, Status> {
        let decoded: T = bincode::deserialize(encoded).map_err(|_| Status::Corruption)?;
        Ok(decoded == key.0)
    }

    fn decode(encoded: &[u8]) -> Result<Serde<T>, Status> {
        bincode::deserialize(encoded)
            .map(Serde)
            .map_err(|_| Status::Corruption)
    }
}

impl<T> ValueCodec<Serde<T>> for SerdeCodec<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    const IS_FIXED: bool = false;
    const FIXED_LEN: usize = 0;

    fn encoded_len(value: &Serde<T>) -> Result<usize, Status> {
        bincode::serialized_size(&value.0)
            .map(|n| n as usize)
            .map_err(|_| Status::InvalidArgument)
    }

    fn encode_into(value: &Serde<T>, dst: &mut [u8]) -> Result<(), Status> {
        bincode::serialize_into(dst, &value.0).map_err(|_| Status::InvalidArgument)
    }

    fn decode(encoded: &[u8]) -> Result<Serde<T>, Status> {
        bincode::deserialize(encoded)
            .map(Serde)
            .map_err(|_| Status::Corruption)
    }
}

impl<T> StoreKey for Serde<T>
where
    T: Serialize + DeserializeOwned + Clone + Eq + Send + Sync + 'static,
{
    type Codec = SerdeCodec<T>;
}

impl<T> StoreValue for Serde<T>
where
    T: Serialize + DeserializeOwned + Clone + Eq + Send + Sync + 'static,
{
    type Codec = SerdeCodec<T>;
}

/// Encode a key into a fresh buffer.
pub(crate) fn encode_key<K: StoreKey>(key: &K) -> Result<Vec<u8>, Status> {
    let len = <K as StoreKey>::Codec::encoded_len(key)?;
    let mut buf = vec![0u8; len];
    <K as StoreKey>::Codec::encode_into(key, &mut buf)?;
    Ok(buf)
}
