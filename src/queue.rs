//! Queue-pair context: slot allocation, admission control, backlog,
//! and the completion path.
//!
//! Each queue-pair owns a fixed-depth slot arena, a FIFO backlog of
//! deferred requests, and an admission counter capped at half the
//! hardware depth. One lock guards all three, so counter updates and
//! backlog push/pop are atomic as a unit; doorbell writes and buffer
//! work happen outside the lock.

use crate::descriptor::{self, SecDescriptor, DESC_DONE, ETYPE_NONE};
use crate::mapper;
use crate::os::{self, Mutex};
use crate::pool::ResourcePool;
use crate::prelude::*;
use crate::request::{CipherMode, CryptoOp, CryptoRequest, RequestState, GCM_IV_SIZE};
use crate::transport::{QueueTransport, SglPool};
use openssl::symm::Cipher;
use std::collections::VecDeque;

/// Index into a queue-pair's slot arena; doubles as the descriptor
/// tag correlating completions with requests.
pub type SlotId = u16;

/// Outcome of a successful submission attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The device accepted the descriptor; a completion will follow.
    Submitted,
    /// The admission limit was reached; the request sits in the FIFO
    /// backlog and will be resubmitted as completions free capacity.
    Backlogged,
}

enum SlotEntry {
    Free,
    /// Handed out by the allocator but not yet holding a request:
    /// the request is being mapped, sits in the backlog, or is being
    /// torn down on the completion path.
    Reserved,
    InFlight(CryptoRequest),
}

/// Fixed-size arena of request slots with cyclic id allocation.
///
/// The cyclic scan starts after the last id handed out, spreading
/// slot reuse over the table. The slot-to-request reference is the
/// arena index itself, so a stale tag on a spurious completion can at
/// worst miss, never touch freed memory.
struct SlotTable {
    entries: Vec<SlotEntry>,
    next: usize,
}

impl SlotTable {
    fn new(depth: usize) -> Self {
        Self {
            entries: (0..depth).map(|_| SlotEntry::Free).collect(),
            next: 0,
        }
    }

    fn alloc(&mut self) -> Option<SlotId> {
        let depth = self.entries.len();
        for i in 0..depth {
            let idx = (self.next + i) % depth;
            if matches!(self.entries[idx], SlotEntry::Free) {
                self.entries[idx] = SlotEntry::Reserved;
                self.next = (idx + 1) % depth;
                return Some(idx as SlotId);
            }
        }
        None
    }

    fn install(&mut self, slot: SlotId, req: CryptoRequest) {
        let entry = &mut self.entries[slot as usize];
        debug_assert!(matches!(entry, SlotEntry::Reserved));
        *entry = SlotEntry::InFlight(req);
    }

    /// Remove the request behind `slot`, leaving the slot reserved so
    /// its scratch buffers stay owned until teardown frees the id.
    fn take(&mut self, slot: SlotId) -> Option<CryptoRequest> {
        let entry = self.entries.get_mut(slot as usize)?;
        if !matches!(entry, SlotEntry::InFlight(_)) {
            return None;
        }
        match core::mem::replace(entry, SlotEntry::Reserved) {
            SlotEntry::InFlight(req) => Some(req),
            _ => unreachable!(),
        }
    }

    fn free(&mut self, slot: SlotId) {
        let entry = &mut self.entries[slot as usize];
        debug_assert!(
            !matches!(entry, SlotEntry::InFlight(_)),
            "freeing a slot that still holds a request"
        );
        *entry = SlotEntry::Free;
    }
}

struct BacklogEntry {
    req: CryptoRequest,
    desc: SecDescriptor,
}

struct QueueInner {
    slots: SlotTable,
    backlog: VecDeque<BacklogEntry>,
    in_flight: usize,
    spurious: u64,
}

/// One hardware queue-pair with its slot arena, scratch pool,
/// admission counter, and backlog.
pub struct QueuePair {
    id: usize,
    depth: usize,
    limit: usize,
    pool: ResourcePool,
    inner: Mutex<QueueInner>,
}

impl QueuePair {
    pub(crate) fn new(id: usize, depth: usize) -> Result<Self> {
        if depth < 2 || depth > SlotId::MAX as usize + 1 {
            return_errno_with_msg!(InvalidArgs, "unsupported queue depth");
        }
        Ok(Self {
            id,
            depth,
            // Half the hardware depth, so backlog capacity and
            // headroom for device-reported stragglers always exist.
            limit: depth / 2,
            pool: ResourcePool::new(depth)?,
            inner: Mutex::new(QueueInner {
                slots: SlotTable::new(depth),
                backlog: VecDeque::new(),
                in_flight: 0,
                spurious: 0,
            }),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// The admission limit `L`.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Requests currently known to the device.
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    pub fn backlog_len(&self) -> usize {
        self.inner.lock().backlog.len()
    }

    /// Completions dropped because their tag matched no live request.
    pub fn spurious_completions(&self) -> u64 {
        self.inner.lock().spurious
    }

    /// Whether nothing is in flight or backlogged; shutdown requires
    /// this to hold.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.in_flight == 0 && inner.backlog.is_empty()
    }

    pub(crate) fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub(crate) fn alloc_slot(&self) -> Result<SlotId> {
        self.inner
            .lock()
            .slots
            .alloc()
            .ok_or(Error::with_msg(NoResources, "all slots in use"))
    }

    pub(crate) fn free_slot(&self, slot: SlotId) {
        self.inner.lock().slots.free(slot);
    }

    /// Attempt admission for a mapped request with its built
    /// descriptor.
    ///
    /// Below the admission limit the request enters the slot arena
    /// and the doorbell is rung outside the lock; a transient device
    /// rejection surfaces as `Retry` with the request handed back. At
    /// the limit the request is backlogged when allowed, otherwise
    /// refused with `Busy`.
    pub(crate) fn try_submit(
        &self,
        mut req: CryptoRequest,
        desc: SecDescriptor,
        transport: &dyn QueueTransport,
    ) -> core::result::Result<SubmitOutcome, (CryptoRequest, Error)> {
        let slot = desc.tag;
        {
            let mut inner = self.inner.lock();
            if inner.in_flight < self.limit {
                inner.in_flight += 1;
                req.state = RequestState::Submitted;
                inner.slots.install(slot, req);
            } else if req.allow_backlog {
                req.state = RequestState::Backlogged;
                inner.backlog.push_back(BacklogEntry { req, desc });
                debug!(
                    "queue {}: admission limit {} reached, request backlogged (depth {})",
                    self.id,
                    self.limit,
                    inner.backlog.len()
                );
                return Ok(SubmitOutcome::Backlogged);
            } else {
                return Err((req, Error::with_msg(Busy, "admission limit reached")));
            }
        }

        if transport.used_count(self.id) >= self.depth {
            // The ring is full even though admission allowed us in;
            // hand the request back as transiently rejected.
            return Err((self.withdraw(slot), Error::new(Retry)));
        }
        match transport.send(self.id, &desc) {
            Ok(()) => Ok(SubmitOutcome::Submitted),
            Err(e) => Err((self.withdraw(slot), e)),
        }
    }

    /// Take a just-installed request back out after a failed doorbell.
    /// The device never saw the descriptor, so no completion can race
    /// with this.
    fn withdraw(&self, slot: SlotId) -> CryptoRequest {
        let mut inner = self.inner.lock();
        let mut req = inner
            .slots
            .take(slot)
            .expect("withdrawn request must still be in its slot");
        inner.in_flight -= 1;
        req.state = RequestState::Idle;
        req
    }

    /// The interrupt-context completion path.
    ///
    /// Validates the tag, classifies the device status, re-verifies
    /// AEAD decryption tags in software, unmaps, frees the slot,
    /// fires the caller's callback exactly once, and drains the
    /// backlog.
    pub(crate) fn complete(
        &self,
        raw: &SecDescriptor,
        sgl: &dyn SglPool,
        transport: &dyn QueueTransport,
    ) {
        let slot = raw.tag;
        let mut req = {
            let mut inner = self.inner.lock();
            match inner.slots.take(slot) {
                Some(req) => {
                    inner.in_flight -= 1;
                    req
                }
                None => {
                    // Spurious or duplicate device signal; count and
                    // drop rather than crash.
                    inner.spurious += 1;
                    warn!(
                        "queue {}: dropping completion with unexpected tag {}",
                        self.id, slot
                    );
                    return;
                }
            }
        };

        let mut result = classify(raw, &req);

        // Do not trust the device's done flag for AEAD decryption:
        // re-verify the tag in software over the caller's ciphertext
        // while it is still mapped.
        if req.op.is_aead() && !req.direction.is_encrypt() {
            if let Err(e) = software_verify(&req) {
                if result.is_ok() {
                    error!(
                        "queue {}: device reported success but tag verification failed",
                        self.id
                    );
                }
                result = Err(e);
            }
        }

        let deliver = result.is_ok();
        mapper::unmap(&self.pool, sgl, &mut req, slot, deliver);

        // Chained-IV contract: CBC encryption leaves the trailing
        // ciphertext block in the caller's IV field.
        if deliver && req.mode == CipherMode::Cbc && req.direction.is_encrypt() {
            let bs = req.alg.block_size();
            let mut block = vec![0u8; bs];
            req.output().copy_range(req.output_len() - bs, &mut block);
            req.iv[..bs].copy_from_slice(&block);
        }

        self.free_slot(slot);

        req.state = RequestState::Completed;
        if let Some(cb) = req.callback.take() {
            cb.complete(req, result);
        }

        self.drain_backlog(sgl, transport);
    }

    /// Resubmit backlogged requests in FIFO order while capacity
    /// lasts, notifying each caller that its request is now in
    /// progress.
    fn drain_backlog(&self, sgl: &dyn SglPool, transport: &dyn QueueTransport) {
        loop {
            let mut entry = {
                let mut inner = self.inner.lock();
                if inner.in_flight >= self.limit {
                    return;
                }
                let Some(entry) = inner.backlog.pop_front() else {
                    return;
                };
                inner.in_flight += 1;
                entry
            };

            // The notice runs without the lock held; between the pop
            // and the install the entry is exclusively ours.
            if let Some(cb) = entry.req.callback.as_mut() {
                cb.in_progress();
            }

            let slot = entry.desc.tag;
            let desc = entry.desc;
            {
                let mut inner = self.inner.lock();
                entry.req.state = RequestState::Submitted;
                inner.slots.install(slot, entry.req);
            }

            match transport.send(self.id, &desc) {
                Ok(()) => {}
                Err(e) if e.errno() == Retry => {
                    let mut req = self.withdraw(slot);
                    req.state = RequestState::Backlogged;
                    let mut inner = self.inner.lock();
                    inner.backlog.push_front(BacklogEntry { req, desc });
                    // With descriptors still in flight, the next
                    // completion re-runs the drain. With none, no
                    // future event would, and the ring cannot stay
                    // full while this queue holds nothing, so ring
                    // again.
                    if inner.in_flight > 0 {
                        return;
                    }
                }
                Err(e) => {
                    let mut req = self.withdraw(slot);
                    error!(
                        "queue {}: doorbell failed for backlogged request: {:?}",
                        self.id, e
                    );
                    mapper::unmap(&self.pool, sgl, &mut req, slot, false);
                    self.free_slot(slot);
                    req.state = RequestState::Completed;
                    if let Some(cb) = req.callback.take() {
                        cb.complete(req, Err(e));
                    }
                }
            }
        }
    }
}

/// Map the raw completed descriptor to a request result: the done
/// bit, the device error type, and the operation-kind result flags
/// must all agree.
fn classify(raw: &SecDescriptor, req: &CryptoRequest) -> Result<()> {
    if raw.done != DESC_DONE {
        return_errno_with_msg!(HardwareError, "done flag not set");
    }
    if raw.error_type != ETYPE_NONE {
        return_errno_with_msg!(HardwareError, "device reported error type");
    }
    if raw.result_flags != descriptor::expected_flags(req.op.is_aead()) {
        return_errno_with_msg!(HardwareError, "result flag mismatch");
    }
    Ok(())
}

/// Recompute the AEAD tag over the caller's ciphertext and compare it
/// with the expected tag, independent of what the device reported.
fn software_verify(req: &CryptoRequest) -> Result<()> {
    let CryptoOp::Aead(p) = &req.op else {
        return Ok(());
    };
    let cipher = match req.key.len() {
        16 => Cipher::aes_128_gcm(),
        24 => Cipher::aes_192_gcm(),
        32 => Cipher::aes_256_gcm(),
        _ => return_errno_with_msg!(Internal, "unexpected AEAD key length"),
    };

    // In-place decryption has already scattered plaintext over the
    // source segments; the mapper snapshotted the ciphertext then.
    let flat;
    let sealed: &[u8] = match &req.src_snapshot {
        Some(snap) => snap,
        None => {
            flat = req.src.to_vec();
            &flat
        }
    };
    let aad = &sealed[..p.aad_len];
    let ciphertext = &sealed[p.aad_len..p.aad_len + req.payload_len];
    let mac = &sealed[sealed.len() - p.mac_len..];

    os::aead_open(cipher, &req.key, &req.iv[..GCM_IV_SIZE], aad, ciphertext, mac).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{build_descriptor, FLAGS_CIPHER};
    use crate::request::{CipherAlg, Completion, CryptoRequestBuilder, Direction, ScatterList};
    use crate::transport::SglMapping;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Accepts every doorbell unless told to fail, and records sends.
    struct FakeTransport {
        sent: Mutex<Vec<SecDescriptor>>,
        fail_with: Mutex<Option<Errno>>,
        used: AtomicUsize,
    }

    impl FakeTransport {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_with: Mutex::new(None),
                used: AtomicUsize::new(0),
            }
        }

        fn fail_next(&self, errno: Errno) {
            *self.fail_with.lock() = Some(errno);
        }

        fn sent_tags(&self) -> Vec<u16> {
            self.sent.lock().iter().map(|d| d.tag).collect()
        }
    }

    impl QueueTransport for FakeTransport {
        fn send(&self, _qp: usize, desc: &SecDescriptor) -> Result<()> {
            if let Some(errno) = self.fail_with.lock().take() {
                return_errno!(errno);
            }
            self.sent.lock().push(*desc);
            self.used.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn used_count(&self, _qp: usize) -> usize {
            self.used.load(Ordering::Relaxed)
        }
    }

    struct NullSgl;

    impl SglPool for NullSgl {
        fn map_scatterlist(&self, _list: &ScatterList) -> Result<SglMapping> {
            Ok(SglMapping {
                dma_addr: 0xdead_0000,
                handle: 0,
            })
        }

        fn unmap(&self, _mapping: SglMapping) {}
    }

    fn new_request(done: &Arc<AtomicUsize>) -> CryptoRequest {
        let done = done.clone();
        let mut req =
            CryptoRequestBuilder::new(CipherAlg::Aes128, CipherMode::Cbc, Direction::Encrypt)
                .key(vec![0u8; 16])
                .src(ScatterList::zeroed(32))
                .dst(ScatterList::zeroed(32))
                .allow_backlog(true)
                .build();
        req.use_pbuf = true;
        req.callback = Some(Box::new(move |_req: CryptoRequest, _res: Result<()>| {
            done.fetch_add(1, Ordering::SeqCst);
        }));
        req
    }

    /// Map, build, and submit one request; returns the slot id.
    fn push_one(
        qp: &QueuePair,
        transport: &FakeTransport,
        done: &Arc<AtomicUsize>,
    ) -> (SlotId, SubmitOutcome) {
        let mut req = new_request(done);
        let slot = qp.alloc_slot().unwrap();
        req.slot = Some(slot);
        let bufs = mapper::map(qp.pool(), &NullSgl, &mut req, slot).unwrap();
        let desc = build_descriptor(&req, slot, &bufs);
        let outcome = qp.try_submit(req, desc, transport).unwrap();
        (slot, outcome)
    }

    fn completion_for(slot: SlotId) -> SecDescriptor {
        SecDescriptor {
            tag: slot,
            done: DESC_DONE,
            error_type: ETYPE_NONE,
            result_flags: FLAGS_CIPHER,
            ..SecDescriptor::default()
        }
    }

    #[test]
    fn cyclic_slot_allocation() {
        let qp = QueuePair::new(0, 8).unwrap();
        let a = qp.alloc_slot().unwrap();
        let b = qp.alloc_slot().unwrap();
        assert_ne!(a, b);
        qp.free_slot(a);
        // The freed id is not reused immediately; the scan continues
        // past the last returned id.
        let c = qp.alloc_slot().unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn slot_exhaustion_reports_no_resources() {
        let qp = QueuePair::new(0, 4).unwrap();
        let slots: Vec<_> = (0..4).map(|_| qp.alloc_slot().unwrap()).collect();
        assert_eq!(qp.alloc_slot().unwrap_err().errno(), NoResources);
        for s in slots {
            qp.free_slot(s);
        }
        qp.alloc_slot().unwrap();
    }

    #[test]
    fn admission_bound_and_backlog() {
        let qp = QueuePair::new(0, 8).unwrap();
        let transport = FakeTransport::new();
        let done = Arc::new(AtomicUsize::new(0));
        let limit = qp.limit();
        assert_eq!(limit, 4);

        let mut first = Vec::new();
        for _ in 0..limit {
            let (slot, outcome) = push_one(&qp, &transport, &done);
            assert_eq!(outcome, SubmitOutcome::Submitted);
            first.push(slot);
        }
        assert_eq!(qp.in_flight(), limit);

        // The (L+1)th is deferred, not an error.
        let (_slot, outcome) = push_one(&qp, &transport, &done);
        assert_eq!(outcome, SubmitOutcome::Backlogged);
        assert_eq!(qp.in_flight(), limit);
        assert_eq!(qp.backlog_len(), 1);

        // Completing any of the first L drains the backlog entry.
        qp.complete(&completion_for(first[0]), &NullSgl, &transport);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(qp.backlog_len(), 0);
        assert_eq!(qp.in_flight(), limit);
        assert_eq!(transport.sent_tags().len(), limit + 1);
    }

    #[test]
    fn backlog_drains_in_fifo_order() {
        let qp = QueuePair::new(0, 4).unwrap();
        let transport = FakeTransport::new();
        let done = Arc::new(AtomicUsize::new(0));
        let limit = qp.limit();

        let mut direct = Vec::new();
        for _ in 0..limit {
            direct.push(push_one(&qp, &transport, &done).0);
        }
        let mut deferred = Vec::new();
        for _ in 0..3 {
            let (slot, outcome) = push_one(&qp, &transport, &done);
            assert_eq!(outcome, SubmitOutcome::Backlogged);
            deferred.push(slot);
        }

        for &slot in &direct {
            qp.complete(&completion_for(slot), &NullSgl, &transport);
        }
        let tags = transport.sent_tags();
        // Backlog entries hit the device in enqueue order.
        assert_eq!(&tags[limit..], &deferred[..]);
    }

    #[test]
    fn busy_when_backlog_disallowed() {
        let qp = QueuePair::new(0, 4).unwrap();
        let transport = FakeTransport::new();
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..qp.limit() {
            push_one(&qp, &transport, &done);
        }

        let mut req = new_request(&done);
        req.allow_backlog = false;
        let slot = qp.alloc_slot().unwrap();
        req.slot = Some(slot);
        let bufs = mapper::map(qp.pool(), &NullSgl, &mut req, slot).unwrap();
        let desc = build_descriptor(&req, slot, &bufs);
        let (mut rejected, err) = qp.try_submit(req, desc, &transport).unwrap_err();
        assert_eq!(err.errno(), Busy);
        // The caller gets the request back untouched by the device.
        assert_eq!(rejected.state(), RequestState::Idle);
        mapper::unmap(qp.pool(), &NullSgl, &mut rejected, slot, false);
        qp.free_slot(slot);
        assert_eq!(done.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn transient_send_failure_surfaces_retry() {
        let qp = QueuePair::new(0, 8).unwrap();
        let transport = FakeTransport::new();
        let done = Arc::new(AtomicUsize::new(0));

        let mut req = new_request(&done);
        let slot = qp.alloc_slot().unwrap();
        req.slot = Some(slot);
        let bufs = mapper::map(qp.pool(), &NullSgl, &mut req, slot).unwrap();
        let desc = build_descriptor(&req, slot, &bufs);

        transport.fail_next(Retry);
        let (mut back, err) = qp.try_submit(req, desc, &transport).unwrap_err();
        assert_eq!(err.errno(), Retry);
        assert_eq!(qp.in_flight(), 0);

        // The caller may retry immediately with the same request.
        mapper::unmap(qp.pool(), &NullSgl, &mut back, slot, false);
        qp.free_slot(slot);
        let (_, outcome) = push_one(&qp, &transport, &done);
        assert_eq!(outcome, SubmitOutcome::Submitted);
    }

    /// Records `in_progress` notices and the terminal result.
    struct Recorder {
        notices: Arc<AtomicUsize>,
        result: Arc<Mutex<Option<Result<()>>>>,
    }

    impl Completion for Recorder {
        fn in_progress(&mut self) {
            self.notices.fetch_add(1, Ordering::SeqCst);
        }

        fn complete(self: Box<Self>, _req: CryptoRequest, result: Result<()>) {
            *self.result.lock() = Some(result);
        }
    }

    /// Submit a recorder-backed request that lands in the backlog.
    fn backlog_recorder(
        qp: &QueuePair,
        transport: &FakeTransport,
        notices: &Arc<AtomicUsize>,
        result: &Arc<Mutex<Option<Result<()>>>>,
    ) -> SlotId {
        let mut req = new_request(&Arc::new(AtomicUsize::new(0)));
        req.callback = Some(Box::new(Recorder {
            notices: notices.clone(),
            result: result.clone(),
        }));
        let slot = qp.alloc_slot().unwrap();
        req.slot = Some(slot);
        let bufs = mapper::map(qp.pool(), &NullSgl, &mut req, slot).unwrap();
        let desc = build_descriptor(&req, slot, &bufs);
        let outcome = qp.try_submit(req, desc, transport).unwrap();
        assert_eq!(outcome, SubmitOutcome::Backlogged);
        slot
    }

    #[test]
    fn parked_backlog_recovers_without_new_traffic() {
        let qp = QueuePair::new(0, 2).unwrap();
        let transport = FakeTransport::new();
        let done = Arc::new(AtomicUsize::new(0));
        assert_eq!(qp.limit(), 1);

        let (a, outcome) = push_one(&qp, &transport, &done);
        assert_eq!(outcome, SubmitOutcome::Submitted);
        let (b, outcome) = push_one(&qp, &transport, &done);
        assert_eq!(outcome, SubmitOutcome::Backlogged);

        // The drain's doorbell is transiently rejected at the moment
        // nothing is left in flight; no completion will ever re-run
        // the drain, so it must ring again on its own.
        transport.fail_next(Retry);
        qp.complete(&completion_for(a), &NullSgl, &transport);
        assert_eq!(qp.in_flight(), 1);
        assert_eq!(qp.backlog_len(), 0);

        qp.complete(&completion_for(b), &NullSgl, &transport);
        assert_eq!(done.load(Ordering::SeqCst), 2);
        assert!(qp.is_idle());
    }

    #[test]
    fn backlog_resubmit_sends_in_progress_notice() {
        let qp = QueuePair::new(0, 4).unwrap();
        let transport = FakeTransport::new();
        let done = Arc::new(AtomicUsize::new(0));

        let mut direct = Vec::new();
        for _ in 0..qp.limit() {
            direct.push(push_one(&qp, &transport, &done).0);
        }
        let notices = Arc::new(AtomicUsize::new(0));
        let result = Arc::new(Mutex::new(None));
        let slot = backlog_recorder(&qp, &transport, &notices, &result);
        assert_eq!(notices.load(Ordering::SeqCst), 0);

        qp.complete(&completion_for(direct[0]), &NullSgl, &transport);
        // Resubmitted from the backlog: notified, not yet terminal.
        assert_eq!(notices.load(Ordering::SeqCst), 1);
        assert!(result.lock().is_none());

        qp.complete(&completion_for(slot), &NullSgl, &transport);
        assert!(result.lock().take().unwrap().is_ok());
        assert_eq!(notices.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hard_doorbell_failure_terminates_drained_entry() {
        let qp = QueuePair::new(0, 2).unwrap();
        let transport = FakeTransport::new();
        let done = Arc::new(AtomicUsize::new(0));
        let (a, _) = push_one(&qp, &transport, &done);

        let notices = Arc::new(AtomicUsize::new(0));
        let result = Arc::new(Mutex::new(None));
        backlog_recorder(&qp, &transport, &notices, &result);

        transport.fail_next(HardwareError);
        qp.complete(&completion_for(a), &NullSgl, &transport);

        // The drained entry dies through its own callback.
        let err = result.lock().take().unwrap().unwrap_err();
        assert_eq!(err.errno(), HardwareError);
        assert_eq!(notices.load(Ordering::SeqCst), 1);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(qp.is_idle());
    }

    #[test]
    fn spurious_completion_is_counted_and_dropped() {
        let qp = QueuePair::new(0, 8).unwrap();
        let transport = FakeTransport::new();

        qp.complete(&completion_for(5), &NullSgl, &transport);
        assert_eq!(qp.spurious_completions(), 1);

        // A duplicate completion for an already-finished slot is
        // equally harmless.
        let done = Arc::new(AtomicUsize::new(0));
        let (slot, _) = push_one(&qp, &transport, &done);
        qp.complete(&completion_for(slot), &NullSgl, &transport);
        qp.complete(&completion_for(slot), &NullSgl, &transport);
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(qp.spurious_completions(), 2);
    }

    #[test]
    fn hardware_error_type_reaches_callback() {
        let qp = QueuePair::new(0, 8).unwrap();
        let transport = FakeTransport::new();
        let seen = Arc::new(Mutex::new(None));

        let mut req = {
            let seen = seen.clone();
            let mut req = CryptoRequestBuilder::new(
                CipherAlg::Aes128,
                CipherMode::Cbc,
                Direction::Encrypt,
            )
            .key(vec![0u8; 16])
            .src(ScatterList::zeroed(32))
            .build();
            req.use_pbuf = true;
            req.callback = Some(Box::new(move |_req: CryptoRequest, res: Result<()>| {
                *seen.lock() = Some(res.unwrap_err().errno());
            }));
            req
        };

        let slot = qp.alloc_slot().unwrap();
        req.slot = Some(slot);
        let bufs = mapper::map(qp.pool(), &NullSgl, &mut req, slot).unwrap();
        let desc = build_descriptor(&req, slot, &bufs);
        qp.try_submit(req, desc, &transport).unwrap();

        let mut raw = completion_for(slot);
        raw.error_type = 0x7;
        qp.complete(&raw, &NullSgl, &transport);
        assert_eq!(*seen.lock(), Some(HardwareError));
    }

    #[test]
    fn wrong_result_flags_is_a_protocol_error() {
        let qp = QueuePair::new(0, 8).unwrap();
        let transport = FakeTransport::new();
        let seen = Arc::new(Mutex::new(None));

        let mut req = new_request(&Arc::new(AtomicUsize::new(0)));
        {
            let seen = seen.clone();
            req.callback = Some(Box::new(move |_req: CryptoRequest, res: Result<()>| {
                *seen.lock() = Some(res.map_err(|e| e.errno()));
            }));
        }
        let slot = qp.alloc_slot().unwrap();
        req.slot = Some(slot);
        let bufs = mapper::map(qp.pool(), &NullSgl, &mut req, slot).unwrap();
        let desc = build_descriptor(&req, slot, &bufs);
        qp.try_submit(req, desc, &transport).unwrap();

        let mut raw = completion_for(slot);
        raw.result_flags = crate::descriptor::FLAGS_AEAD;
        qp.complete(&raw, &NullSgl, &transport);
        assert_eq!(*seen.lock(), Some(Err(HardwareError)));
    }
}
