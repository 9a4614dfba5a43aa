//! Reference-counted, chainable receive buffers.
//!
//! A [`Pbuf`] is one logical delivery from the stack. It may span several
//! segments (one per underlying packet) linked head to tail. Every segment
//! carries its own reference count; a link from one segment to the next
//! holds one reference on the next segment, so releasing a chain walks
//! forward only while segments drop to zero.
//!
//! ```text
//!  handle ──► [seg A | refs 1] ──► [seg B | refs 2] ──► [seg C | refs 1]
//!                                      ▲
//!  handle (chain) ─────────────────────┘
//! ```
//!
//! Releasing the first handle frees A, drops B to 1 and stops there; C stays
//! alive until the second handle is released too.

use crate::error::PbufError;

use bytes::{Bytes, BytesMut};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{error, trace};

struct Segment {
    payload: Bytes,
    refs: AtomicUsize,
    next: OnceLock<Arc<Segment>>,
}

impl Segment {
    fn new(payload: Bytes) -> Arc<Self> {
        Arc::new(Self {
            payload,
            refs: AtomicUsize::new(1),
            next: OnceLock::new(),
        })
    }

    fn last(self: &Arc<Self>) -> &Arc<Segment> {
        let mut cur = self;
        while let Some(next) = cur.next.get() {
            cur = next;
        }
        cur
    }

    fn contains(self: &Arc<Self>, other: &Arc<Segment>) -> bool {
        let mut cur = Some(self);
        while let Some(seg) = cur {
            if Arc::ptr_eq(seg, other) {
                return true;
            }
            cur = seg.next.get();
        }
        false
    }
}

/// Drop one reference from `head` and keep walking while segments hit zero.
fn release_chain(head: &Arc<Segment>) -> usize {
    let mut freed = 0;
    let mut cur = Some(head);
    while let Some(seg) = cur {
        let prev = seg.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "segment reference count underflow");
        if prev != 1 {
            break;
        }
        freed += 1;
        cur = seg.next.get();
    }
    freed
}

/// Compare `needle` against the chain starting `skip` bytes into `chunks`.
fn matches_from(chunks: Chunks<'_>, mut skip: usize, needle: &[u8]) -> bool {
    let mut rest = needle;
    for chunk in chunks {
        if rest.is_empty() {
            break;
        }
        if skip >= chunk.len() {
            skip -= chunk.len();
            continue;
        }
        let avail = &chunk[skip..];
        skip = 0;
        let n = avail.len().min(rest.len());
        if avail[..n] != rest[..n] {
            return false;
        }
        rest = &rest[n..];
    }
    rest.is_empty()
}

/// Handle to a received buffer chain.
///
/// The handle owns exactly one reference on its head segment. `Pbuf` is not
/// `Clone`: an extra reference is taken explicitly with [`Pbuf::reference`].
/// A handle that is dropped without [`Pbuf::release`] releases itself.
pub struct Pbuf {
    head: Arc<Segment>,
    released: AtomicBool,
}

impl Pbuf {
    /// Wrap a single payload. The reference count starts at 1.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            head: Segment::new(payload.into()),
            released: AtomicBool::new(false),
        }
    }

    /// Build a chain from fragments of one logical delivery.
    ///
    /// An empty iterator yields a single empty segment.
    pub fn from_segments<I>(segments: I) -> Self
    where
        I: IntoIterator<Item = Bytes>,
    {
        let mut parts: Vec<Bytes> = segments.into_iter().collect();
        let mut tail: Option<Arc<Segment>> = None;
        while let Some(payload) = parts.pop() {
            let seg = Segment::new(payload);
            if let Some(next) = tail.take() {
                let _ = seg.next.set(next);
            }
            tail = Some(seg);
        }

        Self {
            head: tail.unwrap_or_else(|| Segment::new(Bytes::new())),
            released: AtomicBool::new(false),
        }
    }

    /// Total bytes across the whole chain.
    pub fn len(&self) -> usize {
        self.chunks().map(<[u8]>::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes held by the head segment only.
    pub fn segment_len(&self) -> usize {
        self.head.payload.len()
    }

    pub fn segment_count(&self) -> usize {
        self.chunks().count()
    }

    /// Current reference count of the head segment.
    pub fn ref_count(&self) -> usize {
        self.head.refs.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Take an additional reference on this chain, returned as a new handle.
    /// A released handle has nothing left to share.
    pub fn reference(&self) -> Result<Self, PbufError> {
        if self.is_released() {
            return Err(PbufError::Released);
        }
        self.head
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .map_err(|_| PbufError::Released)?;
        Ok(Self {
            head: self.head.clone(),
            released: AtomicBool::new(false),
        })
    }

    /// Release this handle's reference.
    ///
    /// Segments whose count reaches zero are freed; the walk stops at the
    /// first segment still referenced elsewhere. Releasing the same handle
    /// twice is reported as [`PbufError::DoubleRelease`].
    pub fn release(&self) -> Result<(), PbufError> {
        if self.released.swap(true, Ordering::AcqRel) {
            error!(len = self.head.payload.len(), "Buffer released twice");
            return Err(PbufError::DoubleRelease);
        }

        let freed = release_chain(&self.head);
        trace!(freed, "Buffer released");
        Ok(())
    }

    /// Append `tail` to this chain. The reference held by `tail` moves into
    /// the link, so the caller gives up the `tail` handle.
    pub fn cat(&self, tail: Pbuf) -> Result<(), PbufError> {
        self.link(&tail)?;
        // The link now owns tail's reference.
        tail.released.store(true, Ordering::Release);
        Ok(())
    }

    /// Append `tail` to this chain, taking a new reference on it. The caller
    /// keeps `tail` and must still release it.
    pub fn chain(&self, tail: &Pbuf) -> Result<(), PbufError> {
        tail.head.refs.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.link(tail) {
            tail.head.refs.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }
        Ok(())
    }

    fn link(&self, tail: &Pbuf) -> Result<(), PbufError> {
        if self.is_released() || tail.is_released() {
            return Err(PbufError::Released);
        }
        if tail.head.contains(self.head.last()) {
            return Err(PbufError::SelfChain);
        }

        let mut last = self.head.last();
        loop {
            match last.next.set(tail.head.clone()) {
                Ok(()) => return Ok(()),
                // Another thread appended first; walk to the new end.
                Err(_) => last = last.last(),
            }
        }
    }

    /// Iterate over segment payloads, head first.
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks {
            cur: Some(&self.head),
        }
    }

    /// Byte at `pos` counted across the chain.
    pub fn get_at(&self, pos: usize) -> Option<u8> {
        let mut pos = pos;
        for chunk in self.chunks() {
            if pos < chunk.len() {
                return Some(chunk[pos]);
            }
            pos -= chunk.len();
        }
        None
    }

    /// Copy bytes starting at `offset` into `dst`. Returns the number copied.
    pub fn copy_to(&self, dst: &mut [u8], offset: usize) -> usize {
        let mut skip = offset;
        let mut copied = 0;
        for chunk in self.chunks() {
            if copied == dst.len() {
                break;
            }
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            let src = &chunk[skip..];
            skip = 0;
            let n = src.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&src[..n]);
            copied += n;
        }
        copied
    }

    /// Whether `needle` occurs at `pos`.
    pub fn matches_at(&self, pos: usize, needle: &[u8]) -> bool {
        match pos.checked_add(needle.len()) {
            Some(end) if end <= self.len() => matches_from(self.chunks(), pos, needle),
            _ => false,
        }
    }

    /// Position of the first occurrence of `needle` at or after `offset`.
    pub fn find(&self, needle: &[u8], offset: usize) -> Option<usize> {
        let first = *needle.first()?;
        let last = self.len().checked_sub(needle.len())?;
        if offset > last {
            return None;
        }

        let mut base = 0;
        let mut cur = Some(&self.head);
        while let Some(seg) = cur {
            let chunk = &seg.payload[..];
            let start = offset.saturating_sub(base);
            for (i, &b) in chunk.iter().enumerate().skip(start) {
                let pos = base + i;
                if pos > last {
                    return None;
                }
                if b == first && matches_from(Chunks { cur: Some(seg) }, i, needle) {
                    return Some(pos);
                }
            }
            base += chunk.len();
            cur = seg.next.get();
        }
        None
    }

    /// Contiguous copy of the whole chain. Single-segment chains are not copied.
    pub fn to_bytes(&self) -> Bytes {
        if self.head.next.get().is_none() {
            return self.head.payload.clone();
        }
        let mut out = BytesMut::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out.freeze()
    }
}

impl Drop for Pbuf {
    fn drop(&mut self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            release_chain(&self.head);
        }
    }
}

impl From<Bytes> for Pbuf {
    fn from(payload: Bytes) -> Self {
        Self::new(payload)
    }
}

impl From<Vec<u8>> for Pbuf {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

impl fmt::Debug for Pbuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pbuf")
            .field("len", &self.len())
            .field("segments", &self.segment_count())
            .field("refs", &self.ref_count())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Iterator over the segments of a [`Pbuf`].
pub struct Chunks<'a> {
    cur: Option<&'a Arc<Segment>>,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let seg = self.cur?;
        self.cur = seg.next.get();
        Some(&seg.payload[..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_length_and_access() {
        let p = Pbuf::from_segments(vec![
            Bytes::from_static(b"GET / "),
            Bytes::from_static(b"HTTP/1.1\r\n"),
            Bytes::from_static(b"\r\n"),
        ]);
        assert_eq!(p.len(), 18);
        assert_eq!(p.segment_len(), 6);
        assert_eq!(p.segment_count(), 3);
        assert_eq!(p.get_at(6), Some(b'H'));
        assert_eq!(p.get_at(18), None);
        assert_eq!(p.find(b"\r\n\r\n", 0), Some(14));
        assert!(p.matches_at(0, b"GET"));
        assert_eq!(&p.to_bytes()[..], b"GET / HTTP/1.1\r\n\r\n");

        let mut dst = [0u8; 8];
        assert_eq!(p.copy_to(&mut dst, 4), 8);
        assert_eq!(&dst, b"/ HTTP/1");
    }

    #[test]
    fn test_double_release_detected() {
        let p = Pbuf::new(Bytes::from_static(b"data"));
        assert!(p.release().is_ok());
        assert_eq!(p.ref_count(), 0);
        assert_eq!(p.release(), Err(PbufError::DoubleRelease));
    }

    #[test]
    fn test_reference_keeps_segment_alive() {
        let p = Pbuf::new(Bytes::from_static(b"data"));
        let extra = p.reference().unwrap();
        assert_eq!(p.ref_count(), 2);

        p.release().unwrap();
        assert_eq!(extra.ref_count(), 1);
        extra.release().unwrap();
        assert_eq!(extra.ref_count(), 0);
    }

    #[test]
    fn test_release_stops_at_shared_segment() {
        let head = Pbuf::new(Bytes::from_static(b"head"));
        let tail = Pbuf::new(Bytes::from_static(b"tail"));
        head.chain(&tail).unwrap();
        assert_eq!(tail.ref_count(), 2);
        assert_eq!(head.len(), 8);

        head.release().unwrap();
        assert_eq!(tail.ref_count(), 1);
        tail.release().unwrap();
        assert_eq!(tail.ref_count(), 0);
    }

    #[test]
    fn test_cat_transfers_reference() {
        let head = Pbuf::new(Bytes::from_static(b"ab"));
        let tail = Pbuf::new(Bytes::from_static(b"cd"));
        let observer = tail.reference().unwrap();
        head.cat(tail).unwrap();
        assert_eq!(observer.ref_count(), 2);

        head.release().unwrap();
        assert_eq!(observer.ref_count(), 1);
    }

    #[test]
    fn test_self_chain_rejected() {
        let p = Pbuf::new(Bytes::from_static(b"loop"));
        let same = p.reference().unwrap();
        assert_eq!(p.chain(&same), Err(PbufError::SelfChain));
        assert_eq!(p.ref_count(), 2);
    }

    #[test]
    fn test_drop_releases() {
        let p = Pbuf::new(Bytes::from_static(b"x"));
        let observer = p.reference().unwrap();
        drop(p);
        assert_eq!(observer.ref_count(), 1);
    }

    #[test]
    fn test_reference_after_release_rejected() {
        let p = Pbuf::new(Bytes::from_static(b"gone"));
        p.release().unwrap();
        assert_eq!(p.reference().err(), Some(PbufError::Released));
        assert_eq!(p.ref_count(), 0);
    }

    #[test]
    fn test_search_across_segments() {
        let p = Pbuf::from_segments(vec![
            Bytes::from_static(b"ab"),
            Bytes::from_static(b"cab"),
            Bytes::from_static(b"c"),
        ]);
        assert_eq!(p.find(b"abc", 0), Some(0));
        assert_eq!(p.find(b"abc", 1), Some(3));
        assert_eq!(p.find(b"bca", 0), Some(1));
        assert_eq!(p.find(b"abc", 4), None);
        assert_eq!(p.find(b"", 0), None);
        assert_eq!(p.find(b"abcabcabc", 0), None);
        assert!(p.matches_at(1, b"bcab"));
        assert!(!p.matches_at(1, b"bcac"));
        assert!(!p.matches_at(usize::MAX, b"a"));
        assert_eq!(p.find(b"a", usize::MAX), None);
    }
}
