//! Crypto request model.
//!
//! A `CryptoRequest` describes one in-flight operation handed to the
//! dispatch engine: the cipher parameters, the caller's scatter-gather
//! buffers, and the completion callback. The symmetric-vs-AEAD split is
//! resolved once at construction time through `CryptoOp`, so the hot
//! path never re-inspects algorithm tables.

use crate::mapper::Mapping;
use crate::prelude::*;
use crate::queue::SlotId;

/// Size of the IV field carried by every request. GCM nonces use the
/// first [`GCM_IV_SIZE`] bytes.
pub const MAX_IV_SIZE: usize = 16;
pub const GCM_IV_SIZE: usize = 12;

pub type Iv = [u8; MAX_IV_SIZE];

/// Direction of a crypto operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

impl Direction {
    pub fn is_encrypt(&self) -> bool {
        matches!(self, Direction::Encrypt)
    }
}

/// Cipher algorithm, doubling as the key-length class of the
/// hardware descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherAlg {
    Aes128,
    Aes192,
    Aes256,
    Sm4,
    TripleDes,
}

impl CipherAlg {
    /// Length of a single cipher key in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            CipherAlg::Aes128 | CipherAlg::Sm4 => 16,
            CipherAlg::Aes192 => 24,
            CipherAlg::Aes256 => 32,
            CipherAlg::TripleDes => 24,
        }
    }

    /// Cipher block size in bytes.
    pub fn block_size(&self) -> usize {
        match self {
            CipherAlg::TripleDes => 8,
            _ => 16,
        }
    }

    pub fn is_aes(&self) -> bool {
        matches!(self, CipherAlg::Aes128 | CipherAlg::Aes192 | CipherAlg::Aes256)
    }
}

/// Cipher mode of operation. `Gcm` is only valid for AEAD requests;
/// the other modes only for symmetric ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherMode {
    Ecb,
    Cbc,
    Ctr,
    Xts,
    Gcm,
}

impl CipherMode {
    /// Whether payloads must be a multiple of the cipher block size.
    pub fn requires_block_alignment(&self) -> bool {
        matches!(self, CipherMode::Ecb | CipherMode::Cbc)
    }
}

/// AEAD-specific parameters.
#[derive(Clone, Debug)]
pub struct AeadParams {
    /// Authentication key for cipher+MAC constructions. Empty for
    /// single-pass AEAD modes (GCM), where the cipher key covers both.
    pub auth_key: Vec<u8>,
    /// Length of the authentication tag in bytes.
    pub mac_len: usize,
    /// Length of the associated data prefix in the source buffer.
    pub aad_len: usize,
}

/// The operation kind, resolved once per request.
#[derive(Clone, Debug)]
pub enum CryptoOp {
    Symmetric,
    Aead(AeadParams),
}

impl CryptoOp {
    pub fn is_aead(&self) -> bool {
        matches!(self, CryptoOp::Aead(_))
    }

    pub fn aad_len(&self) -> usize {
        match self {
            CryptoOp::Symmetric => 0,
            CryptoOp::Aead(p) => p.aad_len,
        }
    }

    pub fn mac_len(&self) -> usize {
        match self {
            CryptoOp::Symmetric => 0,
            CryptoOp::Aead(p) => p.mac_len,
        }
    }
}

/// A caller-owned scatter-gather buffer.
///
/// Segments are heap-backed so their addresses stay stable while the
/// request is in flight, no matter how the owning `CryptoRequest`
/// moves between the backlog and the slot table.
#[derive(Clone, Debug, Default)]
pub struct ScatterList {
    segs: Vec<Vec<u8>>,
    total: usize,
}

impl ScatterList {
    pub fn new(segs: Vec<Vec<u8>>) -> Self {
        let total = segs.iter().map(|s| s.len()).sum();
        Self { segs, total }
    }

    /// A single-segment list holding `data`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::new(vec![data])
    }

    /// A single zero-filled segment of `len` bytes, typically used as
    /// a destination buffer.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segs
    }

    /// Gather `out.len()` bytes starting at `offset` into `out`.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside the list.
    pub fn copy_range(&self, offset: usize, out: &mut [u8]) {
        assert!(offset + out.len() <= self.total, "range out of bounds");
        let mut skip = offset;
        let mut done = 0;
        for seg in &self.segs {
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let avail = &seg[skip..];
            skip = 0;
            let n = avail.len().min(out.len() - done);
            out[done..done + n].copy_from_slice(&avail[..n]);
            done += n;
            if done == out.len() {
                break;
            }
        }
    }

    /// Gather the trailing `out.len()` bytes into `out`.
    pub fn copy_tail(&self, out: &mut [u8]) {
        self.copy_range(self.total - out.len(), out);
    }

    /// Scatter `data` into the list starting at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside the list.
    pub fn write_range(&mut self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.total, "range out of bounds");
        let mut skip = offset;
        let mut done = 0;
        for seg in &mut self.segs {
            if skip >= seg.len() {
                skip -= seg.len();
                continue;
            }
            let avail = &mut seg[skip..];
            skip = 0;
            let n = avail.len().min(data.len() - done);
            avail[..n].copy_from_slice(&data[done..done + n]);
            done += n;
            if done == data.len() {
                break;
            }
        }
    }

    /// Gather the whole list into one contiguous vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total];
        self.copy_range(0, &mut out);
        out
    }
}

/// The type of the callback invoked when a request finishes.
///
/// `complete` fires exactly once per accepted request, on either the
/// hardware completion path or a terminal doorbell failure during
/// backlog drain. `in_progress` is a non-terminal notice that a
/// backlogged request has been handed to the device.
pub trait Completion: Send {
    fn in_progress(&mut self) {}

    fn complete(self: Box<Self>, req: CryptoRequest, result: Result<()>);
}

impl<F> Completion for F
where
    F: FnOnce(CryptoRequest, Result<()>) + Send,
{
    fn complete(self: Box<Self>, req: CryptoRequest, result: Result<()>) {
        (*self)(req, result)
    }
}

/// The explicit lifecycle of a request inside the engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    /// Not yet accepted by a queue-pair.
    Idle,
    /// Deferred in a queue-pair's FIFO backlog; the device has not
    /// seen it.
    Backlogged,
    /// Known to the device; a completion is pending.
    Submitted,
    /// The terminal callback has fired (or is about to); the engine
    /// no longer references the request.
    Completed,
}

/// One in-flight crypto operation.
pub struct CryptoRequest {
    pub(crate) op: CryptoOp,
    pub(crate) direction: Direction,
    pub(crate) alg: CipherAlg,
    pub(crate) mode: CipherMode,
    pub(crate) key: Vec<u8>,
    pub(crate) iv: Iv,
    pub(crate) src: ScatterList,
    pub(crate) dst: Option<ScatterList>,
    pub(crate) payload_len: usize,
    pub(crate) allow_backlog: bool,

    pub(crate) state: RequestState,
    pub(crate) slot: Option<SlotId>,
    pub(crate) queue: Option<usize>,
    pub(crate) use_pbuf: bool,
    pub(crate) iv_backup: Option<Iv>,
    /// Ciphertext copy for in-place SGL decryption, taken at map
    /// time: the device scatters plaintext over the source segments,
    /// and the completion-path tag re-check needs the original bytes.
    pub(crate) src_snapshot: Option<Vec<u8>>,
    pub(crate) mapping: Option<Mapping>,
    pub(crate) callback: Option<Box<dyn Completion>>,
}

impl Debug for CryptoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoRequest")
            .field("op", &self.op)
            .field("direction", &self.direction)
            .field("alg", &self.alg)
            .field("mode", &self.mode)
            .field("payload_len", &self.payload_len)
            .field("state", &self.state)
            .field("slot", &self.slot)
            .field("queue", &self.queue)
            .field("use_pbuf", &self.use_pbuf)
            .finish_non_exhaustive()
    }
}

impl CryptoRequest {
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn iv(&self) -> &Iv {
        &self.iv
    }

    pub fn src(&self) -> &ScatterList {
        &self.src
    }

    /// The buffer holding the operation's output: the destination
    /// list, or the source list for in-place requests.
    pub fn output(&self) -> &ScatterList {
        self.dst.as_ref().unwrap_or(&self.src)
    }

    pub(crate) fn output_mut(&mut self) -> &mut ScatterList {
        self.dst.as_mut().unwrap_or(&mut self.src)
    }

    /// Whether source and destination are the same scatter list.
    pub(crate) fn in_place(&self) -> bool {
        self.dst.is_none()
    }

    /// Bytes the device consumes: associated data plus payload.
    pub(crate) fn input_len(&self) -> usize {
        self.op.aad_len() + self.payload_len
    }

    /// Bytes the engine delivers to the output buffer.
    pub(crate) fn output_len(&self) -> usize {
        let mac = if self.direction.is_encrypt() {
            self.op.mac_len()
        } else {
            0
        };
        self.op.aad_len() + self.payload_len + mac
    }

    /// Reject malformed requests before any resource is touched.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.payload_len == 0 {
            return_errno_with_msg!(InvalidArgs, "zero-length payload");
        }

        let expected_key = match self.mode {
            CipherMode::Xts => self.alg.key_len() * 2,
            _ => self.alg.key_len(),
        };
        if self.key.len() != expected_key {
            return_errno_with_msg!(InvalidArgs, "key length does not match algorithm");
        }

        if self.mode.requires_block_alignment() && self.payload_len % self.alg.block_size() != 0 {
            return_errno_with_msg!(InvalidArgs, "payload not block aligned");
        }

        match &self.op {
            CryptoOp::Symmetric => {
                if self.mode == CipherMode::Gcm {
                    return_errno_with_msg!(InvalidArgs, "GCM requires an AEAD request");
                }
            }
            CryptoOp::Aead(p) => {
                if self.mode != CipherMode::Gcm {
                    return_errno_with_msg!(InvalidArgs, "AEAD requests must use GCM");
                }
                if !self.alg.is_aes() {
                    return_errno_with_msg!(InvalidArgs, "AEAD requires an AES key class");
                }
                if p.mac_len < 4 || p.mac_len > 16 {
                    return_errno_with_msg!(InvalidArgs, "unsupported MAC length");
                }
            }
        }

        let in_needed = self.input_len()
            + if self.direction.is_encrypt() {
                0
            } else {
                self.op.mac_len()
            };
        if self.src.len() < in_needed {
            return_errno_with_msg!(InvalidArgs, "source buffer shorter than request");
        }

        let out_needed = self.output_len();
        if self.output().len() < out_needed {
            return_errno_with_msg!(InvalidArgs, "output buffer shorter than request");
        }

        Ok(())
    }
}

/// A builder for `CryptoRequest`.
pub struct CryptoRequestBuilder {
    alg: CipherAlg,
    mode: CipherMode,
    direction: Direction,
    op: CryptoOp,
    key: Vec<u8>,
    iv: Iv,
    src: Option<ScatterList>,
    dst: Option<ScatterList>,
    allow_backlog: bool,
}

impl CryptoRequestBuilder {
    /// Creates a builder for a request of the given cipher and direction.
    pub fn new(alg: CipherAlg, mode: CipherMode, direction: Direction) -> Self {
        Self {
            alg,
            mode,
            direction,
            op: CryptoOp::Symmetric,
            key: Vec::new(),
            iv: [0u8; MAX_IV_SIZE],
            src: None,
            dst: None,
            allow_backlog: false,
        }
    }

    /// Give the cipher key (double length for XTS).
    pub fn key(mut self, key: Vec<u8>) -> Self {
        self.key = key;
        self
    }

    /// Give the initialization vector / nonce.
    pub fn iv(mut self, iv: Iv) -> Self {
        self.iv = iv;
        self
    }

    /// Give the source buffer: `aad || payload` for AEAD encrypt,
    /// `aad || ciphertext || mac` for AEAD decrypt, plain payload
    /// otherwise.
    pub fn src(mut self, src: ScatterList) -> Self {
        self.src = Some(src);
        self
    }

    /// Give a distinct destination buffer. Requests without one run
    /// in place over the source list.
    pub fn dst(mut self, dst: ScatterList) -> Self {
        self.dst = Some(dst);
        self
    }

    /// Turn the request into an AEAD operation.
    pub fn aead(mut self, auth_key: Vec<u8>, mac_len: usize, aad_len: usize) -> Self {
        self.op = CryptoOp::Aead(AeadParams {
            auth_key,
            mac_len,
            aad_len,
        });
        self
    }

    /// Allow the engine to defer the request to the backlog instead of
    /// failing with `Busy` when the admission limit is reached.
    pub fn allow_backlog(mut self, allow: bool) -> Self {
        self.allow_backlog = allow;
        self
    }

    /// Build the request.
    pub fn build(self) -> CryptoRequest {
        let src = self.src.unwrap_or_default();
        let trailing_mac = if self.direction.is_encrypt() {
            0
        } else {
            self.op.mac_len()
        };
        let payload_len = src
            .len()
            .saturating_sub(self.op.aad_len() + trailing_mac);

        CryptoRequest {
            op: self.op,
            direction: self.direction,
            alg: self.alg,
            mode: self.mode,
            key: self.key,
            iv: self.iv,
            src,
            dst: self.dst,
            payload_len,
            allow_backlog: self.allow_backlog,
            state: RequestState::Idle,
            slot: None,
            queue: None,
            use_pbuf: false,
            iv_backup: None,
            src_snapshot: None,
            mapping: None,
            callback: None,
        }
    }
}
