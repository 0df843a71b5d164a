//! Software device model.
//!
//! `SimDevice` implements both collaborator interfaces against host
//! memory: descriptors are executed synchronously with `openssl`
//! doing the cipher math, and completed descriptors queue up until a
//! test (or an embedding runtime) pumps them into
//! `SecContext::complete`. The explicit pump keeps completion
//! interleaving under the caller's control, and the failure knobs
//! exercise the transient-rejection, flag-mismatch, and forged-done
//! paths of the engine.

use crate::descriptor::{
    SecDescriptor, ADDR_MODE_PBUF, DESC_DONE, ETYPE_AUTH_FAIL, ETYPE_NONE, ETYPE_UNSUPPORTED,
    FLAGS_AEAD, FLAGS_CIPHER,
};
use crate::os::{self, Mutex};
use crate::prelude::*;
use crate::request::ScatterList;
use crate::transport::{QueueTransport, SglEntry, SglHeader, SglMapping, SglPool};
use openssl::symm::Cipher;
use ostd::Pod;
use std::collections::{HashMap, VecDeque};

const MODE_ECB: u8 = 0x0;
const MODE_CBC: u8 = 0x1;
const MODE_CTR: u8 = 0x2;
const MODE_XTS: u8 = 0x3;
const MODE_GCM: u8 = 0x4;

const ALG_AES: u8 = 0x1;
const ALG_SM4: u8 = 0x2;
const ALG_3DES: u8 = 0x3;

struct SimInner {
    pending: Vec<VecDeque<SecDescriptor>>,
    tables: HashMap<u64, Box<[u8]>>,
    next_handle: u64,
    reject_sends: usize,
    corrupt_result_flags: bool,
    forge_auth_success: bool,
}

/// A software crypto device with one completion queue per queue-pair.
pub struct SimDevice {
    inner: Mutex<SimInner>,
}

impl SimDevice {
    pub fn new(qp_count: usize) -> Self {
        Self {
            inner: Mutex::new(SimInner {
                pending: (0..qp_count).map(|_| VecDeque::new()).collect(),
                tables: HashMap::new(),
                next_handle: 0,
                reject_sends: 0,
                corrupt_result_flags: false,
                forge_auth_success: false,
            }),
        }
    }

    /// Reject the next `n` doorbells with a transient `Retry`.
    pub fn reject_next_sends(&self, n: usize) {
        self.inner.lock().reject_sends = n;
    }

    /// Report the wrong result flags on subsequent completions.
    pub fn corrupt_result_flags(&self, on: bool) {
        self.inner.lock().corrupt_result_flags = on;
    }

    /// Report success for AEAD decryptions whose tag does not verify,
    /// emulating a device integrity bypass.
    pub fn forge_auth_success(&self, on: bool) {
        self.inner.lock().forge_auth_success = on;
    }

    /// Completed descriptors not yet pumped for `qp`; zero for an
    /// unknown queue-pair.
    pub fn pending(&self, qp: usize) -> usize {
        self.inner.lock().pending.get(qp).map_or(0, |q| q.len())
    }

    /// Pop the oldest completed descriptor of `qp`.
    pub fn fire_one(&self, qp: usize) -> Option<SecDescriptor> {
        self.inner.lock().pending.get_mut(qp)?.pop_front()
    }

    /// Pop every completed descriptor, oldest first per queue.
    pub fn fire_all(&self) -> Vec<(usize, SecDescriptor)> {
        let mut inner = self.inner.lock();
        let mut fired = Vec::new();
        for (qp, queue) in inner.pending.iter_mut().enumerate() {
            while let Some(desc) = queue.pop_front() {
                fired.push((qp, desc));
            }
        }
        fired
    }

    /// Number of live SGL mappings; zero once everything is unmapped.
    pub fn live_sgl_mappings(&self) -> usize {
        self.inner.lock().tables.len()
    }

    /// Execute one descriptor, filling in its completion fields.
    ///
    /// # Safety
    ///
    /// Every address in `desc` must point to memory owned by the
    /// engine (slot scratch, request key material, or mapped scatter
    /// segments) that stays valid and unaliased for the duration of
    /// the call; the engine's exclusive-slot ownership provides this.
    unsafe fn execute(&self, desc: &mut SecDescriptor, corrupt_flags: bool, forge_auth: bool) {
        let is_aead = desc.cipher_mode == MODE_GCM;
        desc.done = DESC_DONE;
        desc.error_type = ETYPE_NONE;
        desc.result_flags = match (is_aead, corrupt_flags) {
            (true, false) => FLAGS_AEAD,
            (false, false) => FLAGS_CIPHER,
            (true, true) => FLAGS_CIPHER,
            (false, true) => FLAGS_AEAD,
        };

        let Some(cipher) = cipher_for(desc) else {
            desc.error_type = ETYPE_UNSUPPORTED;
            return;
        };

        let aad_len = desc.aad_len as usize;
        let data_len = desc.data_len as usize;
        // SAFETY: delegated to the caller's contract.
        let (key, iv, input) = unsafe {
            let key = read_mem(desc.cipher_key_addr, cipher.key_len());
            let iv = read_mem(desc.cipher_iv_addr, 16);
            let input = gather(desc.addr_mode_src, desc.data_src_addr, aad_len + data_len);
            (key, iv, input)
        };
        let (aad, payload) = input.split_at(aad_len);
        let iv_used = cipher.iv_len().map(|n| &iv[..n]);
        let nonce = iv_used.unwrap_or(&iv[..12]);
        let encrypt = desc.direction == 0;

        let output = if is_aead {
            let mac_len = desc.mac_len as usize;
            if encrypt {
                let mut mac = vec![0u8; mac_len];
                match os::aead_seal(cipher, &key, nonce, aad, payload, &mut mac) {
                    Ok(ct) => {
                        // SAFETY: as above; the MAC buffer is slot scratch.
                        unsafe { write_mem(desc.mac_addr, &mac) };
                        Some([aad, &ct].concat())
                    }
                    Err(_) => {
                        desc.error_type = ETYPE_UNSUPPORTED;
                        None
                    }
                }
            } else {
                // SAFETY: the expected tag was staged in slot scratch.
                let mac = unsafe { read_mem(desc.mac_addr, mac_len) };
                match os::aead_open(cipher, &key, nonce, aad, payload, &mac) {
                    Ok(pt) => Some([aad, &pt].concat()),
                    Err(_) if forge_auth => None,
                    Err(_) => {
                        desc.error_type = ETYPE_AUTH_FAIL;
                        None
                    }
                }
            }
        } else {
            match os::symm_transform(cipher, encrypt, &key, iv_used, payload) {
                Ok(out) => Some(out),
                Err(_) => {
                    desc.error_type = ETYPE_UNSUPPORTED;
                    None
                }
            }
        };

        if let Some(out) = output {
            // SAFETY: destination addresses are engine-owned as above.
            unsafe { scatter(desc.addr_mode_dst, desc.data_dst_addr, &out) };
        }
    }
}

impl QueueTransport for SimDevice {
    fn send(&self, qp: usize, desc: &SecDescriptor) -> Result<()> {
        let (corrupt_flags, forge_auth) = {
            let mut inner = self.inner.lock();
            if qp >= inner.pending.len() {
                return_errno_with_msg!(InvalidArgs, "unknown queue-pair");
            }
            if inner.reject_sends > 0 {
                inner.reject_sends -= 1;
                return_errno_with_msg!(Retry, "ring transiently full");
            }
            (inner.corrupt_result_flags, inner.forge_auth_success)
        };

        let mut completed = *desc;
        // SAFETY: the engine submits descriptors whose addresses all
        // point into live slot scratch, request-owned heap buffers,
        // or SGL tables this pool still holds.
        unsafe { self.execute(&mut completed, corrupt_flags, forge_auth) };

        self.inner.lock().pending[qp].push_back(completed);
        Ok(())
    }

    fn used_count(&self, qp: usize) -> usize {
        self.pending(qp)
    }
}

impl SglPool for SimDevice {
    fn map_scatterlist(&self, list: &ScatterList) -> Result<SglMapping> {
        let segs = list.segments();
        let header = SglHeader {
            entry_count: segs.len() as u32,
            total_len: list.len() as u32,
        };
        let mut raw = Vec::with_capacity(
            core::mem::size_of::<SglHeader>() + segs.len() * core::mem::size_of::<SglEntry>(),
        );
        raw.extend_from_slice(header.as_bytes());
        for seg in segs {
            let entry = SglEntry {
                addr: seg.as_ptr() as u64,
                len: seg.len() as u32,
                reserved: 0,
            };
            raw.extend_from_slice(entry.as_bytes());
        }

        let raw = raw.into_boxed_slice();
        let dma_addr = raw.as_ptr() as u64;
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let handle = inner.next_handle;
        inner.tables.insert(handle, raw);
        Ok(SglMapping { dma_addr, handle })
    }

    fn unmap(&self, mapping: SglMapping) {
        self.inner.lock().tables.remove(&mapping.handle);
    }
}

/// Pick the software cipher matching the descriptor's algorithm id,
/// key-length class, and mode. `None` means the model does not
/// implement the combination and reports it as unsupported.
fn cipher_for(desc: &SecDescriptor) -> Option<Cipher> {
    match (desc.cipher_alg, desc.cipher_mode, desc.key_len_class) {
        (ALG_AES, MODE_ECB, 0) => Some(Cipher::aes_128_ecb()),
        (ALG_AES, MODE_ECB, 1) => Some(Cipher::aes_192_ecb()),
        (ALG_AES, MODE_ECB, 2) => Some(Cipher::aes_256_ecb()),
        (ALG_AES, MODE_CBC, 0) => Some(Cipher::aes_128_cbc()),
        (ALG_AES, MODE_CBC, 1) => Some(Cipher::aes_192_cbc()),
        (ALG_AES, MODE_CBC, 2) => Some(Cipher::aes_256_cbc()),
        (ALG_AES, MODE_CTR, 0) => Some(Cipher::aes_128_ctr()),
        (ALG_AES, MODE_CTR, 1) => Some(Cipher::aes_192_ctr()),
        (ALG_AES, MODE_CTR, 2) => Some(Cipher::aes_256_ctr()),
        (ALG_AES, MODE_XTS, 0) => Some(Cipher::aes_128_xts()),
        (ALG_AES, MODE_GCM, 0) => Some(Cipher::aes_128_gcm()),
        (ALG_AES, MODE_GCM, 1) => Some(Cipher::aes_192_gcm()),
        (ALG_AES, MODE_GCM, 2) => Some(Cipher::aes_256_gcm()),
        (ALG_3DES, MODE_ECB, _) => Some(Cipher::des_ede3()),
        (ALG_3DES, MODE_CBC, _) => Some(Cipher::des_ede3_cbc()),
        (ALG_SM4, _, _) => None,
        _ => None,
    }
}

/// # Safety
///
/// `addr..addr+len` must be readable engine-owned memory.
unsafe fn read_mem(addr: u64, len: usize) -> Vec<u8> {
    // SAFETY: delegated to the caller.
    unsafe { core::slice::from_raw_parts(addr as *const u8, len) }.to_vec()
}

/// # Safety
///
/// `addr..addr+data.len()` must be writable engine-owned memory with
/// no live references.
unsafe fn write_mem(addr: u64, data: &[u8]) {
    // SAFETY: delegated to the caller.
    unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()) }
}

/// # Safety
///
/// `addr` must point to a live SGL table produced by
/// `map_scatterlist`, with all its entries still valid.
unsafe fn walk_sgl(addr: u64) -> Vec<(u64, usize)> {
    // SAFETY: delegated to the caller; `from_bytes` tolerates the
    // table's byte alignment.
    unsafe {
        let header = SglHeader::from_bytes(&read_mem(addr, core::mem::size_of::<SglHeader>()));
        let mut off = addr + core::mem::size_of::<SglHeader>() as u64;
        let mut entries = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            let entry = SglEntry::from_bytes(&read_mem(off, core::mem::size_of::<SglEntry>()));
            entries.push((entry.addr, entry.len as usize));
            off += core::mem::size_of::<SglEntry>() as u64;
        }
        entries
    }
}

/// # Safety
///
/// See `read_mem`/`walk_sgl`; `len` must not exceed the mapped total.
unsafe fn gather(addr_mode: u8, addr: u64, len: usize) -> Vec<u8> {
    // SAFETY: delegated to the caller.
    unsafe {
        if addr_mode == ADDR_MODE_PBUF {
            return read_mem(addr, len);
        }
        let mut out = Vec::with_capacity(len);
        for (seg_addr, seg_len) in walk_sgl(addr) {
            if out.len() == len {
                break;
            }
            let take = seg_len.min(len - out.len());
            out.extend_from_slice(core::slice::from_raw_parts(seg_addr as *const u8, take));
        }
        out
    }
}

/// # Safety
///
/// See `write_mem`/`walk_sgl`; the mapped total must cover `data`.
unsafe fn scatter(addr_mode: u8, addr: u64, data: &[u8]) {
    // SAFETY: delegated to the caller.
    unsafe {
        if addr_mode == ADDR_MODE_PBUF {
            return write_mem(addr, data);
        }
        let mut off = 0;
        for (seg_addr, seg_len) in walk_sgl(addr) {
            if off == data.len() {
                break;
            }
            let put = seg_len.min(data.len() - off);
            write_mem(seg_addr, &data[off..off + put]);
            off += put;
        }
    }
}
