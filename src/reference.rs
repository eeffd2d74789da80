//! Scalar reference tile kernels.
//!
//! These implement the [`TileKernel`] contract in plain Rust for the dense
//! blocked layouts in [`crate::layout`]. They are the executable form of
//! the contract a generated kernel must honor — channel-marker
//! initialize-vs-accumulate, clipped-height handling, transposed-source
//! addressing — and back the end-to-end tests. A kernel is always built
//! for one concrete layout; these capture the layouts' strides at
//! construction and never consult them again.

use crate::desc::ConvDesc;
use crate::driver::ConvLayouts;
use crate::kernel::{TileCallArgs, TileKernel};
use crate::layout::{TensorLayout, WeightsLayout};

/// Forward pass: one call computes one output row for one
/// `nb_oc_blocking`-wide output-channel chunk, from one input-channel
/// block. On `channel == 0` the row is initialized from bias (or zero);
/// later channel blocks accumulate.
pub struct RefForwardKernel {
    nb_oc_blocking: usize,
    ow: usize,
    stride_w: usize,
    ic_block: usize,
    oc_block: usize,
    src_h_stride: isize,
    src_w_stride: isize,
    dst_c_stride: isize,
    dst_w_stride: isize,
    wht_oc_stride: isize,
    wht_h_stride: isize,
}

impl RefForwardKernel {
    pub fn new(desc: &ConvDesc, layouts: &ConvLayouts<'_>) -> Self {
        Self {
            nb_oc_blocking: desc.nb_oc_blocking,
            ow: desc.ow,
            stride_w: desc.stride_w,
            ic_block: desc.ic_block,
            oc_block: desc.oc_block,
            src_h_stride: layouts.src.blk_off(0, 0, 1, 0),
            src_w_stride: layouts.src.blk_off(0, 0, 0, 1),
            dst_c_stride: layouts.dst.blk_off(0, 1, 0, 0),
            dst_w_stride: layouts.dst.blk_off(0, 0, 0, 1),
            wht_oc_stride: layouts.weights.blk_off(0, 1, 0, 0),
            wht_h_stride: layouts.weights.blk_off(0, 0, 0, 1),
        }
    }
}

impl TileKernel for RefForwardKernel {
    unsafe fn run(&self, a: &TileCallArgs) {
        for ocb_l in 0..self.nb_oc_blocking {
            let dst = a.dst.wrapping_offset(ocb_l as isize * self.dst_c_stride);
            let filt = a.filt.wrapping_offset(ocb_l as isize * self.wht_oc_stride);
            let bias = if a.bias.is_null() {
                a.bias
            } else {
                a.bias.wrapping_add(ocb_l * self.oc_block)
            };

            for x in 0..self.ow {
                let out = dst.wrapping_offset(x as isize * self.dst_w_stride);
                for o in 0..self.oc_block {
                    let mut acc = if a.channel == 0 {
                        if bias.is_null() {
                            0.0
                        } else {
                            *bias.add(o)
                        }
                    } else {
                        *out.add(o)
                    };
                    for r in 0..a.kh_len {
                        let s_row = a.src.wrapping_offset(r as isize * self.src_h_stride);
                        let w_row = filt.wrapping_offset(r as isize * self.wht_h_stride);
                        for c in 0..a.kw_len {
                            let s = s_row.wrapping_offset(
                                (x * self.stride_w + c) as isize * self.src_w_stride,
                            );
                            let w = w_row.add(c * self.ic_block * self.oc_block);
                            for i in 0..self.ic_block {
                                acc += *s.add(i) * *w.add(i * self.oc_block + o);
                            }
                        }
                    }
                    *out.add(o) = acc;
                }
            }
        }
    }
}

/// Backward-data pass: one call computes one source-gradient row for one
/// `nb_ic_blocking`-wide input-channel chunk, from one upstream channel
/// block. The filter pointer arrives pre-offset past the bottom-clipped
/// taps; tap `t` pairs filter row `clip + t` with upstream row
/// `base - t`. Assumes unit stride (enforced at dispatch entry).
pub struct RefBackwardDataKernel {
    nb_ic_blocking: usize,
    iw: usize,
    ow: usize,
    ic_block: usize,
    oc_block: usize,
    src_c_stride: isize,
    src_w_stride: isize,
    dst_h_stride: isize,
    dst_w_stride: isize,
    wht_ic_stride: isize,
    wht_h_stride: isize,
}

impl RefBackwardDataKernel {
    pub fn new(desc: &ConvDesc, layouts: &ConvLayouts<'_>) -> Self {
        Self {
            nb_ic_blocking: desc.nb_ic_blocking,
            iw: desc.iw,
            ow: desc.ow,
            ic_block: desc.ic_block,
            oc_block: desc.oc_block,
            src_c_stride: layouts.src.blk_off(0, 1, 0, 0),
            src_w_stride: layouts.src.blk_off(0, 0, 0, 1),
            dst_h_stride: layouts.dst.blk_off(0, 0, 1, 0),
            dst_w_stride: layouts.dst.blk_off(0, 0, 0, 1),
            wht_ic_stride: layouts.weights.blk_off(0, 0, 1, 0),
            wht_h_stride: layouts.weights.blk_off(0, 0, 0, 1),
        }
    }
}

impl TileKernel for RefBackwardDataKernel {
    unsafe fn run(&self, a: &TileCallArgs) {
        for icb_l in 0..self.nb_ic_blocking {
            let ds = a.src.wrapping_offset(icb_l as isize * self.src_c_stride);
            let filt = a.filt.wrapping_offset(icb_l as isize * self.wht_ic_stride);

            for x in 0..self.iw {
                let out = ds.wrapping_offset(x as isize * self.src_w_stride);
                for i in 0..self.ic_block {
                    let mut acc = if a.channel == 0 { 0.0 } else { *out.add(i) };
                    for t in 0..a.kh_len {
                        let dd_row =
                            a.dst.wrapping_offset(-(t as isize) * self.dst_h_stride);
                        let w_row = filt.wrapping_offset(t as isize * self.wht_h_stride);
                        for c in 0..a.kw_len {
                            let Some(ox) = x.checked_sub(c) else { continue };
                            if ox >= self.ow {
                                continue;
                            }
                            let d = dd_row.wrapping_offset(ox as isize * self.dst_w_stride);
                            let w = w_row.add(c * self.ic_block * self.oc_block);
                            for o in 0..self.oc_block {
                                acc += *w.add(i * self.oc_block + o) * *d.add(o);
                            }
                        }
                    }
                    *out.add(i) = acc;
                }
            }
        }
    }
}

/// Backward-weights pass: one call accumulates one (job, image) pair into
/// the private filter slice. The driver zeroes the slice on each job's
/// first image; this kernel is purely additive. Padding is handled here
/// (the driver passes whole planes).
pub struct RefBackwardWeightsKernel {
    oh: usize,
    ow: usize,
    kh: usize,
    kw: usize,
    ih: usize,
    iw: usize,
    stride_h: usize,
    stride_w: usize,
    t_pad: usize,
    ic_block: usize,
    oc_block: usize,
    transpose_src: bool,
    src_h_stride: isize,
    src_w_stride: isize,
    dst_h_stride: isize,
    dst_w_stride: isize,
}

impl RefBackwardWeightsKernel {
    pub fn new(desc: &ConvDesc, layouts: &ConvLayouts<'_>) -> Self {
        Self {
            oh: desc.oh,
            ow: desc.ow,
            kh: desc.kh,
            kw: desc.kw,
            ih: desc.ih,
            iw: desc.iw,
            stride_h: desc.stride_h,
            stride_w: desc.stride_w,
            t_pad: desc.t_pad,
            ic_block: desc.ic_block,
            oc_block: desc.oc_block,
            transpose_src: desc.transpose_src,
            src_h_stride: layouts.src.blk_off(0, 0, 1, 0),
            src_w_stride: layouts.src.blk_off(0, 0, 0, 1),
            dst_h_stride: layouts.dst.blk_off(0, 0, 1, 0),
            dst_w_stride: layouts.dst.blk_off(0, 0, 0, 1),
        }
    }
}

impl TileKernel for RefBackwardWeightsKernel {
    unsafe fn run(&self, a: &TileCallArgs) {
        for r in 0..self.kh {
            for oh_i in 0..self.oh {
                let ih_i = (oh_i * self.stride_h + r) as isize - self.t_pad as isize;
                if ih_i < 0 || ih_i >= self.ih as isize {
                    continue;
                }
                let s_row = a.src.wrapping_offset(ih_i * self.src_h_stride);
                let d_row = a.dst.wrapping_offset(oh_i as isize * self.dst_h_stride);

                for c in 0..self.kw {
                    let tap = a.filt.add((r * self.kw + c) * self.ic_block * self.oc_block);
                    for ow_i in 0..self.ow {
                        let iw_i = ow_i * self.stride_w + c;
                        let d = d_row.wrapping_offset(ow_i as isize * self.dst_w_stride);
                        for i in 0..self.ic_block {
                            let s = if self.transpose_src {
                                *s_row.add(i * self.iw + iw_i)
                            } else {
                                *s_row
                                    .wrapping_offset(iw_i as isize * self.src_w_stride)
                                    .add(i)
                            };
                            for o in 0..self.oc_block {
                                *tap.add(i * self.oc_block + o) += s * *d.add(o);
                            }
                        }
                    }
                }
            }
        }
    }
}
