//! Top-level dispatch context.
//!
//! `SecContext` owns the queue-pair array and the per-direction
//! round-robin cursors, and drives one request through the
//! map → build → submit pipeline. Queue-pairs are partitioned in
//! half: the first half serves encryption, the second half
//! decryption, so the two directions never contend for the same
//! ring.

use crate::descriptor::{build_descriptor, SecDescriptor};
use crate::mapper;
use crate::pool::PBUF_DATA_SIZE;
use crate::prelude::*;
use crate::queue::{QueuePair, SubmitOutcome};
use crate::request::{CipherMode, Completion, CryptoRequest, Direction};
use crate::transport::{QueueTransport, SglPool};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct SecConfig {
    /// Number of queue-pairs; must be even so the direction partition
    /// splits cleanly.
    pub qp_count: usize,
    /// Hardware depth of each queue-pair.
    pub depth: usize,
    /// Whether small requests may use the pooled-buffer path (viable
    /// when there is no IOMMU translation cost to hide).
    pub pbuf_enabled: bool,
    /// Pooled-buffer eligibility threshold in bytes, capped by the
    /// slot buffer size.
    pub pbuf_threshold: usize,
}

impl Default for SecConfig {
    fn default() -> Self {
        Self {
            qp_count: 4,
            depth: 64,
            pbuf_enabled: true,
            pbuf_threshold: PBUF_DATA_SIZE,
        }
    }
}

/// The dispatch engine: queue-pair contexts plus the collaborator
/// handles for the transport and the SGL pool.
pub struct SecContext {
    config: SecConfig,
    queues: Vec<QueuePair>,
    transport: Arc<dyn QueueTransport>,
    sgl: Arc<dyn SglPool>,
    enc_cursor: AtomicUsize,
    dec_cursor: AtomicUsize,
}

impl SecContext {
    pub fn new(
        config: SecConfig,
        transport: Arc<dyn QueueTransport>,
        sgl: Arc<dyn SglPool>,
    ) -> Result<Self> {
        if config.qp_count < 2 || config.qp_count % 2 != 0 {
            return_errno_with_msg!(InvalidArgs, "queue-pair count must be even");
        }
        let queues = (0..config.qp_count)
            .map(|id| QueuePair::new(id, config.depth))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            queues,
            transport,
            sgl,
            enc_cursor: AtomicUsize::new(0),
            dec_cursor: AtomicUsize::new(0),
        })
    }

    pub fn config(&self) -> &SecConfig {
        &self.config
    }

    pub fn queue(&self, id: usize) -> &QueuePair {
        &self.queues[id]
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Whether every queue-pair is drained; shutdown requires this.
    pub fn is_idle(&self) -> bool {
        self.queues.iter().all(|qp| qp.is_idle())
    }

    /// Round-robin queue selection, biased per direction over the
    /// partition. A plain atomic increment; never blocks.
    fn select_queue(&self, direction: Direction) -> usize {
        let half = self.queues.len() / 2;
        if direction.is_encrypt() {
            self.enc_cursor.fetch_add(1, Ordering::Relaxed) % half
        } else {
            half + self.dec_cursor.fetch_add(1, Ordering::Relaxed) % half
        }
    }

    /// Submit a request with a completion callback.
    ///
    /// On success the callback fires exactly once, later. On error
    /// the request is handed back with the error and the callback
    /// will never fire; the caller owns no further cleanup.
    pub fn submit<C: Completion + 'static>(
        &self,
        mut req: CryptoRequest,
        callback: C,
    ) -> core::result::Result<SubmitOutcome, (CryptoRequest, Error)> {
        req.callback = Some(Box::new(callback));
        self.process(req)
    }

    /// Drive one request through validation, queue selection, slot
    /// allocation, buffer mapping, descriptor construction, and
    /// admission. Every failure edge unwinds exactly what was set up
    /// before it.
    pub fn process(
        &self,
        mut req: CryptoRequest,
    ) -> core::result::Result<SubmitOutcome, (CryptoRequest, Error)> {
        if let Err(e) = req.validate() {
            return Err((req, e));
        }

        let qp_id = self.select_queue(req.direction);
        let qp = &self.queues[qp_id];
        let slot = match qp.alloc_slot() {
            Ok(slot) => slot,
            Err(e) => return Err((req, e)),
        };
        req.queue = Some(qp_id);
        req.slot = Some(slot);
        req.use_pbuf =
            mapper::pbuf_eligible(self.config.pbuf_enabled, self.config.pbuf_threshold, &req);
        debug!(
            "dispatch: queue {} slot {} pbuf {} len {}",
            qp_id, slot, req.use_pbuf, req.payload_len
        );

        let bufs = match mapper::map(qp.pool(), &*self.sgl, &mut req, slot) {
            Ok(bufs) => bufs,
            Err(e) => {
                qp.free_slot(slot);
                req.slot = None;
                req.queue = None;
                return Err((req, e));
            }
        };

        // CBC decryption consumes the trailing ciphertext block as
        // the next chained IV. The slot buffer already holds the
        // original IV for the device; update the caller's copy now
        // and keep a snapshot so a rejected send can restore it.
        if req.mode == CipherMode::Cbc && !req.direction.is_encrypt() {
            req.iv_backup = Some(req.iv);
            let bs = req.alg.block_size();
            let mut block = vec![0u8; bs];
            req.src
                .copy_range(req.op.aad_len() + req.payload_len - bs, &mut block);
            req.iv[..bs].copy_from_slice(&block);
        }

        let desc = build_descriptor(&req, slot, &bufs);
        match qp.try_submit(req, desc, &*self.transport) {
            Ok(outcome) => Ok(outcome),
            Err((mut req, e)) => {
                mapper::unmap(qp.pool(), &*self.sgl, &mut req, slot, false);
                if let Some(saved) = req.iv_backup.take() {
                    req.iv = saved;
                }
                qp.free_slot(slot);
                req.slot = None;
                req.queue = None;
                Err((req, e))
            }
        }
    }

    /// Completion delivery; the transport's interrupt context invokes
    /// this with the raw completed descriptor.
    pub fn complete(&self, qp: usize, raw: &SecDescriptor) {
        let Some(queue) = self.queues.get(qp) else {
            warn!("completion for unknown queue-pair {}", qp);
            return;
        };
        queue.complete(raw, &*self.sgl, &*self.transport);
    }
}
