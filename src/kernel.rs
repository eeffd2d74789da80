//! Tile-kernel call context and the opaque kernel contract.

use std::ptr;

/// Call context handed to the tile kernel.
///
/// The four role-tagged address slots (`src`, `dst`, `filt`, `bias`) exist
/// in a *current* and a `_prf` *prefetch* variant. The drivers run a
/// one-stage software pipeline: each inner-loop step first commits the
/// prefetch slots into the current slots ([`TileCallArgs::commit`]), then
/// computes the next row's addresses into the prefetch slots, then invokes
/// the kernel on the current slots only. The very first step of a thread's
/// loop has nothing committed yet — a null current `src` suppresses the
/// invocation — and one flush call after the loop consumes the final
/// prefetch set.
///
/// `kh_len` is the effective kernel height after padding clipping and
/// flows through the pipeline; `kw_len` is recomputed fresh every step
/// and never pipelined. `channel` marks which channel block the call
/// covers — kernels switch between initialize and accumulate on it.
#[derive(Debug, Clone, Copy)]
pub struct TileCallArgs {
    /// Source plane (written by the backward-data pass, read otherwise).
    pub src: *mut f32,
    /// Destination plane (written by the forward pass, read by backward
    /// passes).
    pub dst: *mut f32,
    /// Filter tile (written by the backward-weights pass, read otherwise).
    pub filt: *mut f32,
    /// Bias vector, always read-only; null when bias is disabled.
    pub bias: *const f32,
    pub src_prf: *mut f32,
    pub dst_prf: *mut f32,
    pub filt_prf: *mut f32,
    pub bias_prf: *const f32,
    /// Effective kernel rows after padding clipping.
    pub kh_len: usize,
    pub kh_len_prf: usize,
    /// Effective kernel columns; recomputed fresh, never pipelined.
    pub kw_len: usize,
    /// Channel-block marker.
    pub channel: usize,
    pub channel_prf: usize,
}

impl Default for TileCallArgs {
    fn default() -> Self {
        Self {
            src: ptr::null_mut(),
            dst: ptr::null_mut(),
            filt: ptr::null_mut(),
            bias: ptr::null(),
            src_prf: ptr::null_mut(),
            dst_prf: ptr::null_mut(),
            filt_prf: ptr::null_mut(),
            bias_prf: ptr::null(),
            kh_len: 0,
            kh_len_prf: 0,
            kw_len: 0,
            channel: 0,
            channel_prf: 0,
        }
    }
}

impl TileCallArgs {
    /// Shift every prefetch field into its current slot. Runs at the top
    /// of every inner-loop step, before the next prefetch set is computed
    /// and the kernel is invoked on the current set.
    #[inline]
    pub fn commit(&mut self) {
        self.src = self.src_prf;
        self.dst = self.dst_prf;
        self.filt = self.filt_prf;
        self.bias = self.bias_prf;
        self.kh_len = self.kh_len_prf;
        self.channel = self.channel_prf;
    }
}

/// The opaque per-tile compute callable.
///
/// One invocation performs the arithmetic for one tile: a
/// (spatial-row × channel-chunk) slice in the forward and backward-data
/// passes, or one (job, image) pair in the backward-weights pass. The
/// kernel must treat the current-slot fields of [`TileCallArgs`] as its
/// only inputs and must not read the prefetch fields.
///
/// Access direction per pass:
///
/// | pass             | src   | dst   | filt       | bias |
/// |------------------|-------|-------|------------|------|
/// | forward          | read  | write | read       | read |
/// | backward-data    | write | read  | read       | —    |
/// | backward-weights | read  | read  | accumulate | —    |
///
/// A kernel failure must panic; the dispatch is torn down as a whole with
/// no partial-result recovery.
pub trait TileKernel: Sync {
    /// # Safety
    ///
    /// The current-slot addresses must point into the live buffers the
    /// dispatch was invoked with, pre-offset to the tile the call covers;
    /// the drivers guarantee this for every non-null-`src` invocation.
    /// Implementations must confine reads and writes to the tile described
    /// by `kh_len`/`kw_len` and the descriptor they were built for.
    unsafe fn run(&self, args: &TileCallArgs);
}
