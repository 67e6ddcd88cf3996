use std::{
    fmt::{Display, Formatter},
    ops::{BitOr, BitOrAssign},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;

/// Buffer flags shared by access units and encoder buffers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    pub const EOS: Self = Self(1);
    pub const CODEC_CONFIG: Self = Self(1 << 1);
    pub const KEY_FRAME: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for BufferFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

struct ReleaseInner {
    released: AtomicBool,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ReleaseInner {
    fn fire(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callback = match self.callback.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(callback) = callback {
            callback();
        }
        true
    }
}

impl Drop for ReleaseInner {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Reference-counted handle to a buffer owned by someone else.
///
/// The callback runs exactly once: on the first explicit [`release`](Self::release),
/// or when the last clone is dropped without one.
#[derive(Clone)]
pub struct ReleaseHandle {
    inner: Arc<ReleaseInner>,
}

impl ReleaseHandle {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(ReleaseInner {
                released: AtomicBool::new(false),
                callback: Mutex::new(Some(Box::new(callback))),
            }),
        }
    }

    /// Returns false if the handle was already released.
    pub fn release(&self) -> bool {
        self.inner.fire()
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

/// One timestamped unit of raw or encoded media.
#[derive(Debug, Default)]
pub struct AccessUnit {
    data: Bytes,
    time_us: i64,
    flags: BufferFlags,
    // raw frame borrowed from the source's buffer pool
    media_buffer: Option<ReleaseHandle>,
    // zero-copy encoder output awaiting transport acknowledgement
    release: Option<ReleaseHandle>,
}

impl AccessUnit {
    pub fn new(data: impl Into<Bytes>, time_us: i64) -> Self {
        Self {
            data: data.into(),
            time_us,
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: BufferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_media_buffer(mut self, handle: ReleaseHandle) -> Self {
        self.media_buffer = Some(handle);
        self
    }

    pub fn with_release(mut self, handle: ReleaseHandle) -> Self {
        self.release = Some(handle);
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn time_us(&self) -> i64 {
        self.time_us
    }

    pub fn flags(&self) -> BufferFlags {
        self.flags
    }

    pub fn is_key_frame(&self) -> bool {
        self.flags.contains(BufferFlags::KEY_FRAME)
    }

    pub fn has_media_buffer(&self) -> bool {
        self.media_buffer.is_some()
    }

    /// Moves the source buffer reference out, e.g. into an encoder input slot.
    pub fn take_media_buffer(&mut self) -> Option<ReleaseHandle> {
        self.media_buffer.take()
    }

    pub fn release_media_buffer(&mut self) {
        if let Some(handle) = self.media_buffer.take() {
            handle.release();
        }
    }

    /// Handle the transport releases once it is done with a zero-copy buffer.
    pub fn release_handle(&self) -> Option<&ReleaseHandle> {
        self.release.as_ref()
    }

    pub fn is_zero_copy(&self) -> bool {
        self.release.is_some()
    }

    /// Acknowledges a zero-copy buffer; no-op for regular buffers.
    pub fn release(&self) {
        if let Some(handle) = &self.release {
            handle.release();
        }
    }
}

impl Display for AccessUnit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "AccessUnit {{ size: {}, time_us: {}, flags: {:#x} }}",
            self.data.len(),
            self.time_us,
            self.flags.bits()
        )
    }
}

/// Iterates over the NAL units of an Annex-B byte stream, start codes stripped.
pub fn nal_units(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut offset = find_start_code(data, 0).map(|(_, end)| end);
    std::iter::from_fn(move || {
        let start = offset?;
        match find_start_code(data, start) {
            Some((code_start, next)) => {
                offset = Some(next);
                Some(&data[start..code_start])
            }
            None => {
                offset = None;
                Some(&data[start..])
            }
        }
    })
}

// Returns (start of code, first byte after code).
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let start = if i > from && data[i - 1] == 0 { i - 1 } else { i };
            return Some((start, i + 3));
        }
        i += 1;
    }
    None
}

/// True when the H.264 byte stream contains an IDR slice.
pub fn is_idr(data: &[u8]) -> bool {
    nal_units(data).any(|nal| nal.first().map(|b| b & 0x1f) == Some(5))
}
