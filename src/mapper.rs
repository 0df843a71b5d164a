//! Buffer mapping strategy.
//!
//! Small requests are copied into the slot's pre-allocated pooled
//! buffer and the device works on that single contiguous region for
//! both input and output, skipping per-request SGL setup. Everything
//! else goes through the external SGL pool: the source list is
//! mapped, the destination list only when it is distinct (in-place
//! requests reuse the source mapping), and a source mapping is
//! unwound if the destination mapping fails.
//!
//! `unmap` is the inverse: pooled output is copied back out to the
//! caller's scatter list, SGL mappings are released. Output copy-back
//! is skipped for failed requests so an unauthenticated plaintext is
//! never delivered.

use crate::pool::{ResourcePool, PBUF_DATA_SIZE};
use crate::prelude::*;
use crate::queue::SlotId;
use crate::request::{CryptoOp, CryptoRequest};
use crate::transport::{SglMapping, SglPool};

/// Addressing mode recorded in the descriptor's scene field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AddrMode {
    Pbuf,
    Sgl,
}

/// Bus addresses handed to the descriptor builder.
#[derive(Debug)]
pub(crate) struct MappedBuffers {
    pub src_addr: u64,
    pub dst_addr: u64,
    pub iv_addr: u64,
    pub mac_addr: u64,
    pub addr_mode: AddrMode,
}

/// What `unmap` has to undo for one request.
#[derive(Debug)]
pub(crate) enum Mapping {
    Pbuf,
    Sgl {
        src: SglMapping,
        dst: Option<SglMapping>,
    },
}

/// The pooled-buffer decision rule: pooling enabled for the context
/// and the device-visible input fits the threshold.
pub(crate) fn pbuf_eligible(enabled: bool, threshold: usize, req: &CryptoRequest) -> bool {
    enabled && req.input_len() <= threshold.min(PBUF_DATA_SIZE)
}

/// Map the request's buffers for slot `slot`, recording the mapping
/// in the request and returning the addresses for the descriptor.
pub(crate) fn map(
    pool: &ResourcePool,
    sgl: &dyn SglPool,
    req: &mut CryptoRequest,
    slot: SlotId,
) -> Result<MappedBuffers> {
    debug_assert!(req.mapping.is_none());

    let mapped = if req.use_pbuf {
        map_pbuf(pool, req, slot)
    } else {
        map_sgl(pool, sgl, req, slot)?
    };

    // For AEAD decryption the expected tag trails the source buffer;
    // stage it in the slot so the device (and the software check)
    // verify against a stable copy.
    if let CryptoOp::Aead(p) = &req.op {
        if !req.direction.is_encrypt() {
            // In-place SGL decryption overwrites the source segments
            // with plaintext; keep the ciphertext for the
            // completion-path tag re-check.
            if !req.use_pbuf && req.in_place() {
                req.src_snapshot = Some(req.src.to_vec());
            }
            let mut mac = vec![0u8; p.mac_len];
            req.src.copy_tail(&mut mac);
            // SAFETY: `slot` is exclusively owned by this request.
            let staged = unsafe {
                if req.use_pbuf {
                    pool.pbuf_mac(slot)
                } else {
                    pool.mac_verify(slot)
                }
            };
            staged[..p.mac_len].copy_from_slice(&mac);
        }
    }

    Ok(mapped)
}

fn map_pbuf(pool: &ResourcePool, req: &mut CryptoRequest, slot: SlotId) -> MappedBuffers {
    let in_len = req.input_len();
    // SAFETY: `slot` is exclusively owned by this request; no other
    // reference into its regions exists.
    unsafe {
        let mut staging = vec![0u8; in_len];
        req.src.copy_range(0, &mut staging);
        pool.pbuf_data(slot)[..in_len].copy_from_slice(&staging);
        pool.pbuf_iv(slot).copy_from_slice(&req.iv);
    }

    req.mapping = Some(Mapping::Pbuf);
    MappedBuffers {
        src_addr: pool.pbuf_addr(slot),
        dst_addr: pool.pbuf_addr(slot),
        iv_addr: pool.pbuf_iv_addr(slot),
        mac_addr: pool.pbuf_mac_addr(slot),
        addr_mode: AddrMode::Pbuf,
    }
}

fn map_sgl(
    pool: &ResourcePool,
    sgl: &dyn SglPool,
    req: &mut CryptoRequest,
    slot: SlotId,
) -> Result<MappedBuffers> {
    // SAFETY: `slot` is exclusively owned by this request.
    unsafe {
        pool.iv_mut(slot).copy_from_slice(&req.iv);
    }

    let src = sgl.map_scatterlist(&req.src)?;
    let dst = if req.in_place() {
        None
    } else {
        match sgl.map_scatterlist(req.dst.as_ref().unwrap()) {
            Ok(m) => Some(m),
            Err(e) => {
                sgl.unmap(src);
                return Err(e);
            }
        }
    };

    let src_addr = src.dma_addr;
    let dst_addr = dst.as_ref().map_or(src_addr, |m| m.dma_addr);
    let mac_addr = if req.direction.is_encrypt() {
        pool.mac_scratch_addr(slot)
    } else {
        pool.mac_verify_addr(slot)
    };

    req.mapping = Some(Mapping::Sgl { src, dst });
    Ok(MappedBuffers {
        src_addr,
        dst_addr,
        iv_addr: pool.iv_addr(slot),
        mac_addr,
        addr_mode: AddrMode::Sgl,
    })
}

/// Undo the request's mapping. When `deliver` is set, device output
/// (and the freshly produced MAC on AEAD encryption) is copied out to
/// the caller's scatter list first.
pub(crate) fn unmap(
    pool: &ResourcePool,
    sgl: &dyn SglPool,
    req: &mut CryptoRequest,
    slot: SlotId,
    deliver: bool,
) {
    req.src_snapshot = None;
    let Some(mapping) = req.mapping.take() else {
        return;
    };

    let body_len = req.input_len();
    let mac_len = req.op.mac_len();
    let append_mac = deliver && req.op.is_aead() && req.direction.is_encrypt();

    match mapping {
        Mapping::Pbuf => {
            if deliver {
                // SAFETY: `slot` is still exclusively owned; it is
                // freed only after unmapping finishes.
                let (body, mac) = unsafe {
                    let mut body = vec![0u8; body_len];
                    body.copy_from_slice(&pool.pbuf_data(slot)[..body_len]);
                    let mut mac = vec![0u8; mac_len];
                    mac.copy_from_slice(&pool.pbuf_mac(slot)[..mac_len]);
                    (body, mac)
                };
                let out = req.output_mut();
                out.write_range(0, &body);
                if append_mac {
                    out.write_range(body_len, &mac);
                }
            }
        }
        Mapping::Sgl { src, dst } => {
            if append_mac {
                // SAFETY: as above, the slot is still owned.
                let mac = unsafe { pool.mac_scratch(slot)[..mac_len].to_vec() };
                req.output_mut().write_range(body_len, &mac);
            }
            sgl.unmap(src);
            if let Some(dst) = dst {
                sgl.unmap(dst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::Mutex;
    use crate::request::{CipherAlg, CipherMode, CryptoRequestBuilder, Direction, ScatterList};

    /// An `SglPool` that hands out fake mappings and can be told to
    /// fail after a number of successful maps.
    struct CountingPool {
        state: Mutex<(u64, usize, usize)>, // next handle, live, fail-after
    }

    impl CountingPool {
        fn new(fail_after: usize) -> Self {
            Self {
                state: Mutex::new((1, 0, fail_after)),
            }
        }

        fn live(&self) -> usize {
            self.state.lock().1
        }
    }

    impl SglPool for CountingPool {
        fn map_scatterlist(&self, _list: &ScatterList) -> Result<SglMapping> {
            let mut state = self.state.lock();
            if state.2 == 0 {
                return_errno_with_msg!(NoResources, "sgl pool exhausted");
            }
            state.2 -= 1;
            state.1 += 1;
            let handle = state.0;
            state.0 += 1;
            Ok(SglMapping {
                dma_addr: 0x1000 * handle,
                handle,
            })
        }

        fn unmap(&self, _mapping: SglMapping) {
            self.state.lock().1 -= 1;
        }
    }

    fn pooled_request(len: usize) -> CryptoRequest {
        let mut req =
            CryptoRequestBuilder::new(CipherAlg::Aes128, CipherMode::Cbc, Direction::Encrypt)
                .key(vec![0u8; 16])
                .iv([0x11; 16])
                .src(ScatterList::new(vec![vec![0xab; len / 2], vec![0xcd; len / 2]]))
                .dst(ScatterList::zeroed(len))
                .build();
        req.use_pbuf = true;
        req
    }

    #[test]
    fn eligibility_boundary() {
        let at = pooled_request(512);
        assert!(pbuf_eligible(true, 512, &at));
        assert!(!pbuf_eligible(false, 512, &at));

        let over = pooled_request(514);
        assert!(!pbuf_eligible(true, 512, &over));
        // The slot buffer size caps an oversized threshold.
        assert!(!pbuf_eligible(true, 4096, &over));
    }

    #[test]
    fn pbuf_copy_in_and_back() {
        let pool = ResourcePool::new(4).unwrap();
        let sgl = CountingPool::new(0);
        let mut req = pooled_request(32);

        let bufs = map(&pool, &sgl, &mut req, 2).unwrap();
        assert_eq!(bufs.addr_mode, AddrMode::Pbuf);
        assert_eq!(bufs.src_addr, bufs.dst_addr);
        // SAFETY: slot 2 belongs to `req` in this test.
        unsafe {
            assert_eq!(&pool.pbuf_data(2)[..16], &[0xab; 16]);
            assert_eq!(&pool.pbuf_data(2)[16..32], &[0xcd; 16]);
            assert_eq!(pool.pbuf_iv(2), &[0x11; 16]);
            // Pretend the device transformed the payload in place.
            pool.pbuf_data(2)[..32].copy_from_slice(&[0x5a; 32]);
        }

        unmap(&pool, &sgl, &mut req, 2, true);
        assert_eq!(req.output().to_vec(), vec![0x5a; 32]);
        assert_eq!(sgl.live(), 0);
    }

    #[test]
    fn sgl_maps_src_and_dst_separately() {
        let pool = ResourcePool::new(4).unwrap();
        let sgl = CountingPool::new(8);
        let mut req = pooled_request(64);
        req.use_pbuf = false;

        let bufs = map(&pool, &sgl, &mut req, 0).unwrap();
        assert_eq!(bufs.addr_mode, AddrMode::Sgl);
        assert_ne!(bufs.src_addr, bufs.dst_addr);
        assert_eq!(sgl.live(), 2);

        unmap(&pool, &sgl, &mut req, 0, true);
        assert_eq!(sgl.live(), 0);
    }

    #[test]
    fn in_place_reuses_source_mapping() {
        let pool = ResourcePool::new(4).unwrap();
        let sgl = CountingPool::new(8);
        let mut req =
            CryptoRequestBuilder::new(CipherAlg::Aes128, CipherMode::Cbc, Direction::Encrypt)
                .key(vec![0u8; 16])
                .src(ScatterList::zeroed(64))
                .build();

        let bufs = map(&pool, &sgl, &mut req, 1).unwrap();
        assert_eq!(bufs.src_addr, bufs.dst_addr);
        assert_eq!(sgl.live(), 1);

        unmap(&pool, &sgl, &mut req, 1, true);
        assert_eq!(sgl.live(), 0);
    }

    #[test]
    fn dst_mapping_failure_unwinds_src() {
        let pool = ResourcePool::new(4).unwrap();
        let sgl = CountingPool::new(1);
        let mut req = pooled_request(64);
        req.use_pbuf = false;

        let err = map(&pool, &sgl, &mut req, 0).unwrap_err();
        assert_eq!(err.errno(), NoResources);
        assert_eq!(sgl.live(), 0);
        assert!(req.mapping.is_none());
    }

    #[test]
    fn decrypt_stages_expected_mac() {
        let pool = ResourcePool::new(4).unwrap();
        let sgl = CountingPool::new(8);
        let mut src = vec![0u8; 32];
        src.extend_from_slice(&[0xee; 16]);
        let mut req =
            CryptoRequestBuilder::new(CipherAlg::Aes128, CipherMode::Gcm, Direction::Decrypt)
                .key(vec![0u8; 16])
                .aead(Vec::new(), 16, 0)
                .src(ScatterList::from_vec(src))
                .dst(ScatterList::zeroed(32))
                .build();

        map(&pool, &sgl, &mut req, 3).unwrap();
        // SAFETY: slot 3 belongs to `req` in this test.
        unsafe {
            assert_eq!(&pool.mac_verify(3)[..16], &[0xee; 16]);
        }
        unmap(&pool, &sgl, &mut req, 3, false);
    }
}
