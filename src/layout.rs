//! Blocked-offset collaborator contracts and dense reference layouts.
//!
//! The drivers never inspect a tensor's blocking scheme. They ask an
//! externally supplied layout for element offsets at logical coordinates,
//! derive strides as offset deltas (`blk_off(0, 0, 1, 0)` is the row
//! stride), and do all remaining addressing with pointer arithmetic. The
//! one assumption baked into the contract: the `block` channel lanes at a
//! coordinate are contiguous.

/// Maps logical activation coordinates to element offsets in a blocked
/// tensor.
pub trait TensorLayout: Sync {
    /// Element offset of (image, channel-block, row, column).
    ///
    /// `row` may be negative: the forward driver anchors its source
    /// pointer above the padded top edge (`-t_pad`) and only dereferences
    /// after padding clipping moves it back inside the buffer.
    fn blk_off(&self, img: usize, blk: usize, row: isize, col: usize) -> isize;

    /// Total elements addressable through this layout. Used for
    /// pre-dispatch buffer length checks and workspace sizing.
    fn span(&self) -> usize;
}

/// Same contract for the weights tensor. Non-grouped layouts are
/// addressed with a group dimension of extent 1.
pub trait WeightsLayout: Sync {
    /// Element offset of (group, oc-block, ic-block, kernel-row), at
    /// kernel-column 0.
    fn blk_off(&self, g: usize, ocb: usize, icb: usize, kh: usize) -> isize;

    /// Total elements addressable through this layout.
    fn span(&self) -> usize;
}

/// Dense nChw16c-style activation layout: per image, `nblocks` channel
/// blocks, each an `h × w` plane of `block`-wide channel vectors.
#[derive(Debug, Clone)]
pub struct BlockedActivations {
    pub mb: usize,
    pub nblocks: usize,
    pub h: usize,
    pub w: usize,
    pub block: usize,
}

impl BlockedActivations {
    pub fn new(mb: usize, nblocks: usize, h: usize, w: usize, block: usize) -> Self {
        Self {
            mb,
            nblocks,
            h,
            w,
            block,
        }
    }
}

impl TensorLayout for BlockedActivations {
    #[inline]
    fn blk_off(&self, img: usize, blk: usize, row: isize, col: usize) -> isize {
        let plane = (img * self.nblocks + blk) as isize;
        ((plane * self.h as isize + row) * self.w as isize + col as isize) * self.block as isize
    }

    fn span(&self) -> usize {
        self.mb * self.nblocks * self.h * self.w * self.block
    }
}

/// Dense gOIhw16i16o-style weights layout: per (group, oc-block, ic-block)
/// a contiguous `kh × kw × block_i × block_o` tile. Tiles are laid out
/// job-major in (group, oc-block, ic-block) order — the shape the
/// backward-weights reduction merges into.
#[derive(Debug, Clone)]
pub struct BlockedWeights {
    pub ngroups: usize,
    pub nb_oc: usize,
    pub nb_ic: usize,
    pub kh: usize,
    pub kw: usize,
    pub ic_block: usize,
    pub oc_block: usize,
}

impl BlockedWeights {
    pub fn new(
        ngroups: usize,
        nb_oc: usize,
        nb_ic: usize,
        kh: usize,
        kw: usize,
        ic_block: usize,
        oc_block: usize,
    ) -> Self {
        Self {
            ngroups,
            nb_oc,
            nb_ic,
            kh,
            kw,
            ic_block,
            oc_block,
        }
    }

    /// Elements in one (group, oc-block, ic-block) tile.
    #[inline]
    pub fn job_size(&self) -> usize {
        self.kh * self.kw * self.ic_block * self.oc_block
    }
}

impl WeightsLayout for BlockedWeights {
    #[inline]
    fn blk_off(&self, g: usize, ocb: usize, icb: usize, kh: usize) -> isize {
        let tile = (g * self.nb_oc + ocb) * self.nb_ic + icb;
        ((tile * self.kh + kh) * self.kw * self.ic_block * self.oc_block) as isize
    }

    fn span(&self) -> usize {
        self.ngroups * self.nb_oc * self.nb_ic * self.job_size()
    }
}
