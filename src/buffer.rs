// Copyright (C) 2023, Alex Badics
// This file is part of ps1080-protocol
// Licensed under the MIT license. See LICENSE file in the project root for details.

//! Byte buffer with a write cursor. See [`Buffer`]

use crate::{Error, Result};

enum Storage<'a> {
    Owned(Vec<u8>),
    Borrowed(&'a mut [u8]),
}

/// A fixed-capacity byte buffer, backed either by its own allocation or by a borrowed region.
///
/// `size` counts the valid bytes at the front, and never exceeds `max_size`. The backing store
/// is not cleared by [`Buffer::reset`], so bytes past `size` hold whatever was there before.
pub struct Buffer<'a> {
    storage: Storage<'a>,
    size: usize,
}

impl Buffer<'static> {
    /// An empty buffer without storage. Call [`Buffer::allocate`] before writing.
    pub fn new() -> Self {
        Self {
            storage: Storage::Owned(Vec::new()),
            size: 0,
        }
    }

    /// Owned buffer with `max_size` zeroed bytes of storage.
    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            storage: Storage::Owned(vec![0; max_size]),
            size: 0,
        }
    }
}

impl Default for Buffer<'static> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Buffer<'a> {
    /// Non-owning view over `external`. The region is never freed by the buffer.
    pub fn from_external(external: &'a mut [u8]) -> Self {
        Self {
            storage: Storage::Borrowed(external),
            size: 0,
        }
    }

    /// Replace the current storage with a zeroed owned region of `max_size` bytes.
    pub fn allocate(&mut self, max_size: usize) {
        self.storage = Storage::Owned(vec![0; max_size]);
        self.size = 0;
    }

    /// Make the buffer a view over `external`, dropping any owned storage.
    pub fn bind_external(&mut self, external: &'a mut [u8]) {
        self.storage = Storage::Borrowed(external);
        self.size = 0;
    }

    /// Release owned storage. Borrowed regions are only detached.
    pub fn free(&mut self) {
        self.storage = Storage::Owned(Vec::new());
        self.size = 0;
    }

    /// `true` if the storage is a borrowed region
    pub fn is_external(&self) -> bool {
        matches!(self.storage, Storage::Borrowed(_))
    }

    fn storage(&self) -> &[u8] {
        match &self.storage {
            Storage::Owned(v) => v,
            Storage::Borrowed(s) => s,
        }
    }

    fn storage_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Storage::Owned(v) => v,
            Storage::Borrowed(s) => s,
        }
    }

    /// Number of valid bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Capacity of the backing store
    pub fn max_size(&self) -> usize {
        self.storage().len()
    }

    /// Bytes that can still be written
    pub fn free_space(&self) -> usize {
        self.max_size() - self.size
    }

    /// The valid bytes
    pub fn data(&self) -> &[u8] {
        &self.storage()[..self.size]
    }

    /// The valid bytes, mutably
    pub fn data_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        &mut self.storage_mut()[..size]
    }

    /// Append `data`, or fail with [`Error::BufferTooSmall`] leaving the buffer untouched.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.free_space() {
            return Err(Error::BufferTooSmall {
                needed: data.len(),
                available: self.free_space(),
            });
        }
        self.write_unchecked(data);
        Ok(())
    }

    /// Append `data` without the capacity check.
    ///
    /// The caller must have checked [`Buffer::free_space`] first. Writing past the end is a
    /// bug and panics.
    #[inline]
    pub fn write_unchecked(&mut self, data: &[u8]) {
        debug_assert!(data.len() <= self.free_space());
        let size = self.size;
        self.storage_mut()[size..size + data.len()].copy_from_slice(data);
        self.size += data.len();
    }

    /// The writable tail of the buffer, past the valid bytes. Pair with [`Buffer::advance`].
    pub fn spare_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        &mut self.storage_mut()[size..]
    }

    /// Mark `count` more bytes of [`Buffer::spare_mut`] as written.
    #[inline]
    pub fn advance(&mut self, count: usize) {
        debug_assert!(count <= self.free_space());
        self.size = (self.size + count).min(self.max_size());
    }

    /// Set the number of valid bytes directly. Clamped to the capacity.
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size <= self.max_size());
        self.size = size.min(self.max_size());
    }

    /// Forget the valid bytes. Storage is kept as is.
    pub fn reset(&mut self) {
        self.size = 0;
    }
}
