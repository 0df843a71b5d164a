//! OS-dependent primitives: locking, DMA-coherent memory, and the
//! software cipher routines backing integrity re-verification.

use crate::prelude::*;
use core::marker::PhantomData;
use core::ptr::NonNull;
use openssl::symm::{decrypt_aead, encrypt_aead, Cipher, Crypter, Mode};

/// Reuse the `Mutex` and `MutexGuard` implementation.
pub use spin::{Mutex, MutexGuard};

pub const PAGE_SIZE: usize = 4096;

struct PageAllocator;

impl PageAllocator {
    /// Allocate memory buffer with specific size.
    ///
    /// The `len` indicates the number of pages.
    fn alloc(len: usize) -> Option<NonNull<u8>> {
        if len == 0 {
            return None;
        }

        // SAFETY: the `count` is non-zero, then the `Layout` has
        // non-zero size, so it's safe.
        unsafe {
            let layout =
                std::alloc::Layout::from_size_align_unchecked(len * PAGE_SIZE, PAGE_SIZE);
            let ptr = std::alloc::alloc_zeroed(layout);
            NonNull::new(ptr)
        }
    }

    /// Deallocate memory buffer at the given `ptr` and `len`.
    ///
    /// # Safety
    ///
    /// The caller should make sure that:
    /// * `ptr` must denote the memory buffer currently allocated via
    ///   `PageAllocator::alloc`,
    ///
    /// * `len` must be the same size that was used to allocate the
    ///   memory buffer.
    unsafe fn dealloc(ptr: *mut u8, len: usize) {
        // SAFETY: the caller should pass valid `ptr` and `len`.
        unsafe {
            let layout =
                std::alloc::Layout::from_size_align_unchecked(len * PAGE_SIZE, PAGE_SIZE);
            std::alloc::dealloc(ptr, layout)
        }
    }
}

/// A `PAGE_SIZE` aligned memory buffer standing in for a DMA-coherent
/// region. The device model addresses it by bus address, which equals
/// the host address here (no IOMMU translation in the simulated path).
pub struct Pages {
    ptr: NonNull<u8>,
    len: usize,
    _p: PhantomData<[u8]>,
}

// SAFETY: `Pages` owns the memory buffer, so it can be safely
// transferred across threads.
unsafe impl Send for Pages {}

// SAFETY: shared access hands out raw pointers only; mutation goes
// through per-slot regions that are exclusively owned by one in-flight
// request at a time.
unsafe impl Sync for Pages {}

impl Pages {
    /// Allocate specific number of pages.
    pub fn alloc(len: usize) -> Result<Self> {
        let ptr = PageAllocator::alloc(len).ok_or(Error::new(OutOfMemory))?;
        Ok(Self {
            ptr,
            len,
            _p: PhantomData,
        })
    }

    /// Return the number of pages.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return the base pointer of the region.
    pub fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Return the bus address of the byte at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is outside the region.
    pub fn bus_addr(&self, offset: usize) -> u64 {
        assert!(offset < self.len * PAGE_SIZE);
        self.ptr.as_ptr() as u64 + offset as u64
    }
}

impl Drop for Pages {
    fn drop(&mut self) {
        // SAFETY: `ptr` is `NonNull` and allocated by `PageAllocator::alloc`
        // with the same size of `len`, so it's valid and safe.
        unsafe { PageAllocator::dealloc(self.ptr.as_mut(), self.len) }
    }
}

/// Encrypt `data` with an AEAD cipher, writing the authentication tag
/// into `mac_out`. Returns the ciphertext.
pub(crate) fn aead_seal(
    cipher: Cipher,
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    data: &[u8],
    mac_out: &mut [u8],
) -> Result<Vec<u8>> {
    encrypt_aead(cipher, key, Some(iv), aad, data, mac_out)
        .map_err(|_| Error::with_msg(HardwareError, "aead seal failed"))
}

/// Decrypt-and-authenticate `data` with an AEAD cipher against the
/// expected tag `mac`. Returns `BadMessage` on tag mismatch.
pub(crate) fn aead_open(
    cipher: Cipher,
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    data: &[u8],
    mac: &[u8],
) -> Result<Vec<u8>> {
    decrypt_aead(cipher, key, Some(iv), aad, data, mac)
        .map_err(|_| Error::with_msg(BadMessage, "authentication tag mismatch"))
}

/// Run a block/stream cipher over `data` with padding disabled, the
/// way the device transforms exact-length payloads.
pub(crate) fn symm_transform(
    cipher: Cipher,
    encrypt: bool,
    key: &[u8],
    iv: Option<&[u8]>,
    data: &[u8],
) -> Result<Vec<u8>> {
    let mode = if encrypt {
        Mode::Encrypt
    } else {
        Mode::Decrypt
    };
    let mut crypter = Crypter::new(cipher, mode, key, iv)
        .map_err(|_| Error::with_msg(HardwareError, "cipher init failed"))?;
    crypter.pad(false);

    let mut out = vec![0u8; data.len() + cipher.block_size()];
    let mut count = crypter
        .update(data, &mut out)
        .map_err(|_| Error::with_msg(HardwareError, "cipher update failed"))?;
    count += crypter
        .finalize(&mut out[count..])
        .map_err(|_| Error::with_msg(HardwareError, "cipher finalize failed"))?;
    out.truncate(count);
    Ok(out)
}
