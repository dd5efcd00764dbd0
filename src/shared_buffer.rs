//! Reference-counted shared buffers for zero-copy payloads between
//! contexts. Grounded on `SharedBuffer.h`'s `Create`/`CreateFrom`/`CreateTyped`
//! API, reshaped around `Arc` instead of a hand-rolled atomic refcount.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::TasError;
use crate::value::SerializedValue;

const DEFAULT_MAX_SIZE: usize = 64 * 1024 * 1024;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    id: u64,
    data: Mutex<Vec<u8>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A cloneable, reference-counted handle to a shared byte buffer.
///
/// Cloning a handle is cheap (an `Arc` bump); it does not copy the
/// underlying bytes. `clone_deep` makes an independent copy.
#[derive(Clone)]
pub struct SharedBufferHandle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SharedBufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBufferHandle")
            .field("id", &self.inner.id)
            .field("size", &self.size())
            .finish()
    }
}

impl PartialEq for SharedBufferHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl SharedBufferHandle {
    pub fn create(size: usize) -> Result<Self, TasError> {
        Self::create_with_max(size, DEFAULT_MAX_SIZE)
    }

    pub fn create_with_max(size: usize, max_size: usize) -> Result<Self, TasError> {
        if size == 0 {
            return Err(TasError::InvalidArgument(
                "shared buffer size must be > 0".to_string(),
            ));
        }
        if size > max_size {
            return Err(TasError::InvalidArgument(format!(
                "shared buffer size {size} exceeds maximum {max_size}"
            )));
        }
        Ok(SharedBufferHandle {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                data: Mutex::new(vec![0u8; size]),
            }),
        })
    }

    pub fn create_from(bytes: &[u8]) -> Result<Self, TasError> {
        let handle = Self::create(bytes.len())?;
        handle.write(bytes, 0)?;
        Ok(handle)
    }

    /// Creates a buffer holding the raw bytes of a trivially-copyable
    /// value, grounded on `SharedBuffer::CreateTyped`. Only `Copy` types
    /// with no padding-sensitive invariants should be passed here; the
    /// caller is responsible for `T` being safe to reinterpret as bytes
    /// (an enum or a type with pointers is not).
    pub fn create_typed<T: Copy>(value: T) -> Result<Self, TasError> {
        let bytes = unsafe {
            std::slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>())
        };
        Self::create_from(bytes)
    }

    /// Reads this buffer's bytes back as a trivially-copyable value.
    /// Fails if the buffer size doesn't match `size_of::<T>()`.
    pub fn read_typed<T: Copy>(&self) -> Result<T, TasError> {
        let data = lock(&self.inner.data);
        if data.len() != std::mem::size_of::<T>() {
            return Err(TasError::InvalidArgument(format!(
                "buffer of {} bytes cannot be read as a {}-byte typed value",
                data.len(),
                std::mem::size_of::<T>()
            )));
        }
        Ok(unsafe { std::ptr::read_unaligned(data.as_ptr() as *const T) })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn size(&self) -> usize {
        lock(&self.inner.data).len()
    }

    pub fn read(&self, dst: &mut [u8], offset: usize) -> Result<(), TasError> {
        let data = lock(&self.inner.data);
        let end = offset
            .checked_add(dst.len())
            .ok_or_else(|| TasError::InvalidArgument("read offset overflow".to_string()))?;
        if end > data.len() {
            return Err(TasError::InvalidArgument(format!(
                "read of {} bytes at offset {} exceeds buffer size {}",
                dst.len(),
                offset,
                data.len()
            )));
        }
        dst.copy_from_slice(&data[offset..end]);
        Ok(())
    }

    pub fn write(&self, src: &[u8], offset: usize) -> Result<(), TasError> {
        let mut data = lock(&self.inner.data);
        let end = offset
            .checked_add(src.len())
            .ok_or_else(|| TasError::InvalidArgument("write offset overflow".to_string()))?;
        if end > data.len() {
            return Err(TasError::InvalidArgument(format!(
                "write of {} bytes at offset {} exceeds buffer size {}",
                src.len(),
                offset,
                data.len()
            )));
        }
        data[offset..end].copy_from_slice(src);
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        lock(&self.inner.data).clone()
    }

    /// Deep copy: an independent buffer with the same bytes.
    pub fn clone_deep(&self) -> Self {
        let bytes = self.to_vec();
        Self::create_from(&bytes).expect("cloning an existing valid buffer cannot fail")
    }

    /// Serializes a table-shaped `SerializedValue` into a fresh buffer
    /// holding its JSON encoding.
    pub fn from_table(value: &SerializedValue) -> Result<Self, TasError> {
        let json = serde_json::to_vec(&value.to_json())
            .map_err(|e| TasError::SerializationRejected(e.to_string()))?;
        if json.is_empty() {
            return Self::create_from(b"null");
        }
        Self::create_from(&json)
    }

    /// Parses this buffer's bytes as JSON back into a `SerializedValue`.
    pub fn to_table(&self) -> Result<SerializedValue, TasError> {
        let bytes = self.to_vec();
        let json: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| TasError::SerializationRejected(format!("invalid JSON buffer: {e}")))?;
        Ok(SerializedValue::from_json(&json))
    }
}

impl mlua::UserData for SharedBufferHandle {
    fn add_methods<M: mlua::UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("size", |_, this, ()| Ok(this.size()));
        methods.add_method("id", |_, this, ()| Ok(this.id()));
        methods.add_method("to_table", |lua, this, ()| {
            let value = this
                .to_table()
                .map_err(|e| mlua::Error::RuntimeError(e.to_string()))?;
            value.to_lua(lua)
        });
        methods.add_method("clone", |_, this, ()| Ok(this.clone_deep()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let buf = SharedBufferHandle::create(8).unwrap();
        buf.write(&[1, 2, 3, 4], 0).unwrap();
        let mut out = [0u8; 4];
        buf.read(&mut out, 0).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn rejects_zero_size() {
        assert!(SharedBufferHandle::create(0).is_err());
    }

    #[test]
    fn rejects_oversized_access() {
        let buf = SharedBufferHandle::create(4).unwrap();
        let mut out = [0u8; 8];
        assert!(buf.read(&mut out, 0).is_err());
    }

    #[test]
    fn clone_is_shared_deep_is_independent() {
        let buf = SharedBufferHandle::create(4).unwrap();
        let shared = buf.clone();
        let deep = buf.clone_deep();
        buf.write(&[9, 9, 9, 9], 0).unwrap();
        assert_eq!(shared.to_vec(), vec![9, 9, 9, 9]);
        assert_eq!(deep.to_vec(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn typed_round_trip() {
        #[derive(Clone, Copy)]
        struct Pos {
            x: f32,
            y: f32,
        }
        let buf = SharedBufferHandle::create_typed(Pos { x: 1.5, y: -2.0 }).unwrap();
        let back: Pos = buf.read_typed().unwrap();
        assert_eq!(back.x, 1.5);
        assert_eq!(back.y, -2.0);
    }

    #[test]
    fn table_round_trip() {
        let mut map = std::collections::BTreeMap::new();
        map.insert("k".to_string(), SerializedValue::Number(3.0));
        let value = SerializedValue::Table(map);
        let buf = SharedBufferHandle::from_table(&value).unwrap();
        let back = buf.to_table().unwrap();
        assert_eq!(value, back);
    }
}
