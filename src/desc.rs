//! Convolution job descriptor.

use crate::error::ConvError;

/// Channel block width. Channel counts are expressed as
/// block-count × `SIMD_W`; the transpose and bias loops unroll over this
/// fixed width, matching the register width the tile kernels are built
/// for.
pub const SIMD_W: usize = 16;

/// Nesting order of the per-thread (channel-chunk, group, batch) walk.
///
/// The numerical result is identical under either order; the choice only
/// affects which memory region (source, weights) stays resident in cache
/// between consecutive kernel calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOrder {
    /// Channel chunk outermost, batch image fastest.
    ChunkGroupBatch,
    /// Group outermost, channel chunk fastest.
    GroupBatchChunk,
}

/// Immutable per-dispatch convolution shape, shared by every worker
/// thread. Construction is the caller's job; [`ConvDesc::validate`] is
/// re-run at every dispatch entry so invariant violations surface as a
/// dispatch-level error, never inside a worker loop.
#[derive(Debug, Clone)]
pub struct ConvDesc {
    /// Minibatch size.
    pub mb: usize,
    /// Convolution group count.
    pub ngroups: usize,
    /// Input / output channel block counts (channels = blocks × `SIMD_W`).
    pub nb_ic: usize,
    pub nb_oc: usize,
    /// Channel block widths; must equal [`SIMD_W`].
    pub ic_block: usize,
    pub oc_block: usize,
    /// Spatial extents.
    pub ih: usize,
    pub iw: usize,
    pub oh: usize,
    pub ow: usize,
    /// Kernel extents.
    pub kh: usize,
    pub kw: usize,
    /// Strides. The forward driver steps source rows by `stride_h`;
    /// `stride_w` is consumed inside the tile kernel.
    pub stride_h: usize,
    pub stride_w: usize,
    /// Top / bottom spatial padding. No left/right padding in this kernel
    /// family.
    pub t_pad: usize,
    pub b_pad: usize,
    /// Channel-chunking factors: the forward pass walks output-channel
    /// chunks of `nb_oc_blocking` blocks, backward-data walks input-channel
    /// chunks of `nb_ic_blocking` blocks.
    pub nb_ic_blocking: usize,
    pub nb_oc_blocking: usize,
    pub loop_order: LoopOrder,
    /// Grouped convolution (the weights layout carries a real group
    /// dimension).
    pub with_groups: bool,
    pub with_bias: bool,
    /// Backward-weights only: run the source-transpose pre-pass before
    /// accumulation.
    pub transpose_src: bool,
}

impl ConvDesc {
    /// Output-channel chunk count walked by the forward pass.
    #[inline]
    pub fn oc_chunks(&self) -> usize {
        self.nb_oc / self.nb_oc_blocking
    }

    /// Input-channel chunk count walked by the backward-data pass.
    #[inline]
    pub fn ic_chunks(&self) -> usize {
        self.nb_ic / self.nb_ic_blocking
    }

    /// Reject descriptors the drivers cannot run. Called at every dispatch
    /// entry, before the parallel region starts.
    pub fn validate(&self) -> Result<(), ConvError> {
        if self.mb == 0 || self.ngroups == 0 {
            return Err(ConvError::invalid("mb and ngroups must be > 0"));
        }
        if self.nb_ic == 0 || self.nb_oc == 0 {
            return Err(ConvError::invalid("channel block counts must be > 0"));
        }
        if self.ic_block != SIMD_W || self.oc_block != SIMD_W {
            return Err(ConvError::invalid(format!(
                "channel block width must be {SIMD_W}, got ic_block={} oc_block={}",
                self.ic_block, self.oc_block
            )));
        }
        if self.ih == 0 || self.iw == 0 || self.oh == 0 || self.ow == 0 {
            return Err(ConvError::invalid("spatial extents must be > 0"));
        }
        if self.kh == 0 || self.kw == 0 {
            return Err(ConvError::invalid("kernel extents must be > 0"));
        }
        if self.stride_h == 0 || self.stride_w == 0 {
            return Err(ConvError::invalid("strides must be > 0"));
        }
        if self.nb_oc_blocking == 0 || self.nb_oc % self.nb_oc_blocking != 0 {
            return Err(ConvError::invalid(format!(
                "nb_oc_blocking {} must evenly divide nb_oc {}",
                self.nb_oc_blocking, self.nb_oc
            )));
        }
        if self.nb_ic_blocking == 0 || self.nb_ic % self.nb_ic_blocking != 0 {
            return Err(ConvError::invalid(format!(
                "nb_ic_blocking {} must evenly divide nb_ic {}",
                self.nb_ic_blocking, self.nb_ic
            )));
        }
        if !self.with_groups && self.ngroups != 1 {
            return Err(ConvError::invalid(
                "ngroups > 1 requires with_groups",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_desc() -> ConvDesc {
        ConvDesc {
            mb: 2,
            ngroups: 1,
            nb_ic: 2,
            nb_oc: 4,
            ic_block: SIMD_W,
            oc_block: SIMD_W,
            ih: 8,
            iw: 8,
            oh: 6,
            ow: 6,
            kh: 3,
            kw: 3,
            stride_h: 1,
            stride_w: 1,
            t_pad: 0,
            b_pad: 0,
            nb_ic_blocking: 1,
            nb_oc_blocking: 2,
            loop_order: LoopOrder::ChunkGroupBatch,
            with_groups: false,
            with_bias: false,
            transpose_src: false,
        }
    }

    #[test]
    fn valid_descriptor_passes() {
        assert!(base_desc().validate().is_ok());
    }

    #[test]
    fn non_dividing_oc_blocking_rejected() {
        let mut d = base_desc();
        d.nb_oc_blocking = 3; // 4 % 3 != 0
        assert!(d.validate().is_err());
    }

    #[test]
    fn non_dividing_ic_blocking_rejected() {
        let mut d = base_desc();
        d.nb_ic_blocking = 3;
        assert!(d.validate().is_err());
    }

    #[test]
    fn wrong_block_width_rejected() {
        let mut d = base_desc();
        d.ic_block = 8;
        assert!(d.validate().is_err());
    }

    #[test]
    fn groups_without_flag_rejected() {
        let mut d = base_desc();
        d.ngroups = 2;
        assert!(d.validate().is_err());
        d.with_groups = true;
        assert!(d.validate().is_ok());
    }

    #[test]
    fn chunk_counts() {
        let d = base_desc();
        assert_eq!(d.oc_chunks(), 2);
        assert_eq!(d.ic_chunks(), 2);
    }
}
