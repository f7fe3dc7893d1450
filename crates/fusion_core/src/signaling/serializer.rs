//! # Event Serialization Hooks
//!
//! `run()` drives an [`EventSerializer`] through every mirrored generator:
//!
//! ```text
//! begin_generator(key)
//!   write_event(payload bytes)   x N, in trigger order
//! end_generator(key)
//! ```
//!
//! What the serializer does with that is up to the network layer.
//! [`RecordSerializer`] is a reference encoding:
//!
//! ```text
//! ┌───────────┬──────────────┬─────────────────┐
//! │ key bytes │ len: u32 LE  │ payload (len B) │  one record per event
//! └───────────┴──────────────┴─────────────────┘
//! ```

use std::fmt::Debug;
use std::hash::Hash;

use bytemuck::Pod;

/// Generator key with a byte encoding.
pub trait EventKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    /// Appends the encoded key.
    fn write_key(&self, out: &mut Vec<u8>);

    /// Decodes a key from the front of `bytes`, returning it and the bytes used.
    fn read_key(bytes: &[u8]) -> Option<(Self, usize)>;
}

macro_rules! int_event_key {
    ($($ty:ty),*) => {
        $(
            impl EventKey for $ty {
                #[inline]
                fn write_key(&self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn read_key(bytes: &[u8]) -> Option<(Self, usize)> {
                    const N: usize = std::mem::size_of::<$ty>();
                    let raw: [u8; N] = bytes.get(..N)?.try_into().ok()?;
                    Some((<$ty>::from_le_bytes(raw), N))
                }
            }
        )*
    };
}

int_event_key!(u16, u32, u64);

/// Strings are encoded as a `u16` LE length followed by UTF-8. Longer keys
/// are cut at the last character boundary that fits.
impl EventKey for String {
    fn write_key(&self, out: &mut Vec<u8>) {
        let mut end = self.len().min(usize::from(u16::MAX));
        while !self.is_char_boundary(end) {
            end -= 1;
        }
        let len = u16::try_from(end).unwrap_or(0);
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.as_bytes()[..usize::from(len)]);
    }

    fn read_key(bytes: &[u8]) -> Option<(Self, usize)> {
        let (len, head) = u16::read_key(bytes)?;
        let end = head + usize::from(len);
        let text = std::str::from_utf8(bytes.get(head..end)?).ok()?;
        Some((text.to_owned(), end))
    }
}

/// Receiver of replicated events during `run()`.
pub trait EventSerializer<K> {
    /// A batch of events from `key` follows.
    fn begin_generator(&mut self, key: &K);

    /// One encoded payload.
    fn write_event(&mut self, payload: &[u8]);

    /// The batch from `key` is complete.
    fn end_generator(&mut self, key: &K);

    /// When false, payloads are not encoded at all.
    fn is_enabled(&self) -> bool {
        true
    }
}

/// Discards everything. Default for systems that only deliver locally.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSerializer;

impl<K> EventSerializer<K> for NullSerializer {
    fn begin_generator(&mut self, _key: &K) {}

    fn write_event(&mut self, _payload: &[u8]) {}

    fn end_generator(&mut self, _key: &K) {}

    fn is_enabled(&self) -> bool {
        false
    }
}

/// Writes key-prefixed, length-prefixed records into a byte buffer.
#[derive(Clone, Debug)]
pub struct RecordSerializer<K> {
    buffer: Vec<u8>,
    current: Option<K>,
    records: usize,
}

impl<K> Default for RecordSerializer<K> {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            current: None,
            records: 0,
        }
    }
}

impl<K: EventKey> RecordSerializer<K> {
    /// Number of records written.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records
    }

    /// True if nothing was written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    /// The encoded records.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Takes the encoded records.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

impl<K: EventKey> EventSerializer<K> for RecordSerializer<K> {
    fn begin_generator(&mut self, key: &K) {
        debug_assert!(self.current.is_none(), "begin_generator without end_generator");
        self.current = Some(key.clone());
    }

    fn write_event(&mut self, payload: &[u8]) {
        let Some(key) = &self.current else {
            tracing::warn!("write_event outside a generator batch, dropped");
            return;
        };
        let Ok(len) = u32::try_from(payload.len()) else {
            tracing::warn!(key = ?key, bytes = payload.len(), "event payload too large, dropped");
            return;
        };
        key.write_key(&mut self.buffer);
        self.buffer.extend_from_slice(&len.to_le_bytes());
        self.buffer.extend_from_slice(payload);
        self.records += 1;
    }

    fn end_generator(&mut self, _key: &K) {
        self.current = None;
    }
}

/// Iterates the records written by a [`RecordSerializer`].
///
/// Stops at the first malformed record; [`is_truncated`](Self::is_truncated)
/// tells the two endings apart.
pub struct RecordReader<'a, K> {
    bytes: &'a [u8],
    position: usize,
    truncated: bool,
    _key: std::marker::PhantomData<fn() -> K>,
}

impl<'a, K: EventKey> RecordReader<'a, K> {
    /// Reads from `bytes`.
    #[must_use]
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            position: 0,
            truncated: false,
            _key: std::marker::PhantomData,
        }
    }

    /// True if iteration stopped on malformed input.
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    fn read_record(&self) -> Option<(K, &'a [u8], usize)> {
        let rest = &self.bytes[self.position..];
        let (key, used) = K::read_key(rest)?;
        let (len, len_bytes) = u32::read_key(&rest[used..])?;
        let start = used + len_bytes;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        let payload = rest.get(start..end)?;
        Some((key, payload, end))
    }
}

impl<'a, K: EventKey> Iterator for RecordReader<'a, K> {
    type Item = (K, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.truncated || self.position >= self.bytes.len() {
            return None;
        }
        match self.read_record() {
            Some((key, payload, used)) => {
                self.position += used;
                Some((key, payload))
            }
            None => {
                self.truncated = true;
                None
            }
        }
    }
}

/// Decodes a payload written by a replicated generator.
#[must_use]
pub fn decode_pod<T: Pod>(payload: &[u8]) -> Option<T> {
    (payload.len() == std::mem::size_of::<T>()).then(|| bytemuck::pod_read_unaligned(payload))
}
