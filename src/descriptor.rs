//! Hardware submission/completion descriptor.
//!
//! The device consumes a fixed-size `repr(C)` record per request and
//! hands the same record back, with the `done`/`error_type`/
//! `result_flags` fields filled in, when the operation completes. The
//! `tag` field carries the slot id and is the only key the completion
//! path has to recover the originating request, so it must be unique
//! among descriptors concurrently submitted to one queue-pair.

use crate::mapper::{AddrMode, MappedBuffers};
use crate::queue::SlotId;
use crate::request::{CipherAlg, CipherMode, CryptoOp, CryptoRequest};
use ostd::Pod;
use static_assertions::const_assert_eq;

/// `done` value reported by the device for a serviced descriptor.
pub const DESC_DONE: u8 = 0x1;

/// Expected `result_flags` for a symmetric-cipher completion.
pub const FLAGS_CIPHER: u8 = 0x2;
/// Expected `result_flags` for an AEAD completion.
pub const FLAGS_AEAD: u8 = 0x7;

/// `error_type` values reported by the device.
pub const ETYPE_NONE: u8 = 0x0;
pub const ETYPE_AUTH_FAIL: u8 = 0x1;
pub const ETYPE_UNSUPPORTED: u8 = 0x2;

/// Source/destination addressing modes.
pub const ADDR_MODE_PBUF: u8 = 0x0;
pub const ADDR_MODE_SGL: u8 = 0x1;

/// MAC ordering relative to the cipher pass.
pub const ORDER_CIPHER_THEN_AUTH: u8 = 0x0;
pub const ORDER_AUTH_THEN_CIPHER: u8 = 0x1;

const DIR_ENCRYPT: u8 = 0x0;
const DIR_DECRYPT: u8 = 0x1;

/// The submission descriptor record.
#[repr(C)]
#[derive(Copy, Clone, Pod, Debug, Default)]
pub struct SecDescriptor {
    pub cipher_key_addr: u64,
    pub cipher_iv_addr: u64,
    pub data_src_addr: u64,
    pub data_dst_addr: u64,
    pub auth_key_addr: u64,
    pub mac_addr: u64,
    pub data_len: u32,
    pub aad_len: u32,
    pub aad_offset: u32,
    pub tag: u16,
    pub cipher_alg: u8,
    pub key_len_class: u8,
    pub cipher_mode: u8,
    pub direction: u8,
    pub addr_mode_src: u8,
    pub addr_mode_dst: u8,
    pub auth_key_len: u8,
    pub mac_len: u8,
    pub auth_order: u8,
    pub done: u8,
    pub error_type: u8,
    pub result_flags: u8,
    pub scene: u8,
    pub reserved: [u8; 5],
}

// The record crosses a hardware interface; its size is part of the
// contract.
const_assert_eq!(core::mem::size_of::<SecDescriptor>(), 80);

fn alg_id(alg: CipherAlg) -> u8 {
    match alg {
        CipherAlg::Aes128 | CipherAlg::Aes192 | CipherAlg::Aes256 => 0x1,
        CipherAlg::Sm4 => 0x2,
        CipherAlg::TripleDes => 0x3,
    }
}

fn key_len_class(alg: CipherAlg) -> u8 {
    match alg {
        CipherAlg::Aes128 | CipherAlg::Sm4 => 0x0,
        CipherAlg::Aes192 | CipherAlg::TripleDes => 0x1,
        CipherAlg::Aes256 => 0x2,
    }
}

fn mode_id(mode: CipherMode) -> u8 {
    match mode {
        CipherMode::Ecb => 0x0,
        CipherMode::Cbc => 0x1,
        CipherMode::Ctr => 0x2,
        CipherMode::Xts => 0x3,
        CipherMode::Gcm => 0x4,
    }
}

/// Expected `result_flags` for an operation kind; anything else on the
/// completion path is a protocol violation.
pub fn expected_flags(is_aead: bool) -> u8 {
    if is_aead {
        FLAGS_AEAD
    } else {
        FLAGS_CIPHER
    }
}

/// Fill a submission descriptor from the request's cipher parameters
/// and its mapped buffers.
pub(crate) fn build_descriptor(
    req: &CryptoRequest,
    slot: SlotId,
    bufs: &MappedBuffers,
) -> SecDescriptor {
    let addr_mode = match bufs.addr_mode {
        AddrMode::Pbuf => ADDR_MODE_PBUF,
        AddrMode::Sgl => ADDR_MODE_SGL,
    };

    let mut desc = SecDescriptor {
        cipher_key_addr: req.key.as_ptr() as u64,
        cipher_iv_addr: bufs.iv_addr,
        data_src_addr: bufs.src_addr,
        data_dst_addr: bufs.dst_addr,
        data_len: req.payload_len as u32,
        tag: slot,
        cipher_alg: alg_id(req.alg),
        key_len_class: key_len_class(req.alg),
        cipher_mode: mode_id(req.mode),
        direction: if req.direction.is_encrypt() {
            DIR_ENCRYPT
        } else {
            DIR_DECRYPT
        },
        addr_mode_src: addr_mode,
        addr_mode_dst: addr_mode,
        scene: addr_mode,
        ..SecDescriptor::default()
    };

    if let CryptoOp::Aead(p) = &req.op {
        desc.aad_len = p.aad_len as u32;
        desc.aad_offset = 0;
        desc.mac_len = p.mac_len as u8;
        desc.mac_addr = bufs.mac_addr;
        if !p.auth_key.is_empty() {
            desc.auth_key_addr = p.auth_key.as_ptr() as u64;
            desc.auth_key_len = p.auth_key.len() as u8;
        }
        // Encryption MACs the produced ciphertext; decryption must
        // authenticate the input before any plaintext is exposed.
        desc.auth_order = if req.direction.is_encrypt() {
            ORDER_CIPHER_THEN_AUTH
        } else {
            ORDER_AUTH_THEN_CIPHER
        };
    }

    desc
}
