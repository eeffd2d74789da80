//! Prefetch-pipelined forward and backward-data drivers.
//!
//! Both passes share the same orchestration: partition the flattened
//! (batch × group × channel-chunk) space across the pool, walk each
//! thread's tuples under the descriptor's loop order, and run the inner
//! spatial-row loop as a one-stage software pipeline — the address set the
//! kernel consumes now was computed on the previous step, and the next
//! row's set is computed before the kernel is invoked. The first step of a
//! thread's loop only primes the pipeline (a null current source
//! suppresses the call); one flush invocation after the loop consumes the
//! final set.
//!
//! Buffers cross into the parallel region as `usize` addresses; every
//! thread writes a disjoint output region determined by its exclusive work
//! range, so no locking is needed.

use crate::balance::{nd_iterator_init, nd_iterator_step, split_work};
use crate::desc::{ConvDesc, LoopOrder};
use crate::error::ConvError;
use crate::kernel::{TileCallArgs, TileKernel};
use crate::layout::{TensorLayout, WeightsLayout};

/// Blocked-offset collaborators for one dispatch. `src`/`dst` name the
/// regular-pass roles; the backward passes reuse the same slots for their
/// gradient counterparts (diff_src / diff_dst).
pub struct ConvLayouts<'a> {
    pub src: &'a dyn TensorLayout,
    pub dst: &'a dyn TensorLayout,
    pub weights: &'a dyn WeightsLayout,
}

pub(crate) fn check_len(
    buffer: &'static str,
    got: usize,
    needed: usize,
) -> Result<(), ConvError> {
    if got < needed {
        return Err(ConvError::ShortBuffer {
            buffer,
            needed,
            got,
        });
    }
    Ok(())
}

/// Execute one forward convolution pass across the current rayon pool.
///
/// Returns before any buffer write on configuration errors, so `Err`
/// always means "did not run".
pub fn execute_forward<K: TileKernel>(
    desc: &ConvDesc,
    layouts: &ConvLayouts<'_>,
    src: &[f32],
    weights: &[f32],
    bias: Option<&[f32]>,
    dst: &mut [f32],
    kernel: &K,
) -> Result<(), ConvError> {
    desc.validate()?;
    check_len("src", src.len(), layouts.src.span())?;
    check_len("dst", dst.len(), layouts.dst.span())?;
    check_len("weights", weights.len(), layouts.weights.span())?;
    let bias_addr = if desc.with_bias {
        let b = bias.ok_or_else(|| ConvError::invalid("with_bias set but no bias supplied"))?;
        check_len("bias", b.len(), desc.ngroups * desc.nb_oc * desc.oc_block)?;
        b.as_ptr() as usize
    } else {
        0
    };

    log::debug!(
        "forward dispatch: mb={} ngroups={} oc_chunks={} nb_ic={} oh={}",
        desc.mb,
        desc.ngroups,
        desc.oc_chunks(),
        desc.nb_ic,
        desc.oh
    );

    let src_addr = src.as_ptr() as usize;
    let wht_addr = weights.as_ptr() as usize;
    let dst_addr = dst.as_mut_ptr() as usize;

    rayon::broadcast(|ctx| {
        forward_thread(
            desc,
            layouts,
            src_addr,
            wht_addr,
            bias_addr,
            dst_addr,
            ctx.index(),
            ctx.num_threads(),
            kernel,
        );
    });
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn forward_thread<K: TileKernel>(
    desc: &ConvDesc,
    layouts: &ConvLayouts<'_>,
    src_addr: usize,
    wht_addr: usize,
    bias_addr: usize,
    dst_addr: usize,
    ithr: usize,
    nthr: usize,
    kernel: &K,
) {
    let src = src_addr as *const f32;
    let weights = wht_addr as *const f32;
    let bias = bias_addr as *const f32;
    let dst = dst_addr as *mut f32;

    let oc_chunks = desc.oc_chunks();
    let work_amount = desc.mb * desc.ngroups * oc_chunks;
    let range = split_work(work_amount, nthr, ithr);
    if range.is_empty() {
        return;
    }

    let src_h_stride = layouts.src.blk_off(0, 0, 1, 0);
    let src_c_stride = layouts.src.blk_off(0, 1, 0, 0);
    let dst_h_stride = layouts.dst.blk_off(0, 0, 1, 0);
    let wht_h_stride = layouts.weights.blk_off(0, 0, 0, 1);
    let wht_ic_stride = layouts.weights.blk_off(0, 0, 1, 0);

    let (mut occ, mut g, mut n) = match desc.loop_order {
        LoopOrder::ChunkGroupBatch => {
            let [occ, g, n] =
                nd_iterator_init(range.start, [oc_chunks, desc.ngroups, desc.mb]);
            (occ, g, n)
        }
        LoopOrder::GroupBatchChunk => {
            let [g, n, occ] =
                nd_iterator_init(range.start, [desc.ngroups, desc.mb, oc_chunks]);
            (occ, g, n)
        }
    };

    let kh = desc.kh as isize;
    let ih = desc.ih as isize;
    let mut args = TileCallArgs::default();

    for _iwork in range {
        let ocb = occ * desc.nb_oc_blocking;
        let g_ocb = g * desc.nb_oc + ocb;
        let g_oc = g_ocb * desc.oc_block;
        let g_icb = g * desc.nb_ic;

        let bias_ptr = if bias.is_null() {
            bias
        } else {
            bias.wrapping_add(g_oc)
        };
        let dst_base = dst.wrapping_offset(layouts.dst.blk_off(n, g_ocb, 0, 0));
        // Anchored above the padded top edge; clipping brings it back
        // in-bounds before any dereference.
        let mut src_base = src
            .wrapping_offset(layouts.src.blk_off(n, g_icb, -(desc.t_pad as isize), 0));
        let mut wht_base = weights.wrapping_offset(layouts.weights.blk_off(g, ocb, 0, 0));

        for icb in 0..desc.nb_ic {
            let mut src_ptr = src_base;
            let mut dst_ptr = dst_base;
            let mut ij = -(desc.t_pad as isize);

            for _oh in 0..desc.oh {
                let i_t_overflow = (-ij).max(0);
                let i_b_overflow = (ij + kh).max(ih) - ih;

                args.commit();
                args.src_prf =
                    src_ptr.wrapping_offset(i_t_overflow * src_h_stride) as *mut f32;
                args.dst_prf = dst_ptr;
                args.filt_prf =
                    wht_base.wrapping_offset(i_t_overflow * wht_h_stride) as *mut f32;
                args.bias_prf = bias_ptr;
                args.kh_len_prf = (kh - i_t_overflow - i_b_overflow).max(0) as usize;
                args.kw_len = desc.kw;
                args.channel_prf = icb;

                if !args.src.is_null() {
                    // Safety: committed addresses were clipped in-bounds on
                    // the previous step.
                    unsafe { kernel.run(&args) };
                }

                src_ptr = src_ptr.wrapping_offset(src_h_stride * desc.stride_h as isize);
                dst_ptr = dst_ptr.wrapping_offset(dst_h_stride);
                ij += desc.stride_h as isize;
            }

            src_base = src_base.wrapping_offset(src_c_stride);
            wht_base = wht_base.wrapping_offset(wht_ic_stride);
        }

        match desc.loop_order {
            LoopOrder::ChunkGroupBatch => {
                let mut c = [occ, g, n];
                nd_iterator_step(&mut c, [oc_chunks, desc.ngroups, desc.mb]);
                [occ, g, n] = c;
            }
            LoopOrder::GroupBatchChunk => {
                let mut c = [g, n, occ];
                nd_iterator_step(&mut c, [desc.ngroups, desc.mb, oc_chunks]);
                [g, n, occ] = c;
            }
        }
    }

    // Flush: the last computed prefetch set was never consumed inside the
    // loop.
    args.commit();
    args.kw_len = desc.kw;
    if !args.src.is_null() {
        unsafe { kernel.run(&args) };
    }
}

/// Execute one backward-data pass (gradient w.r.t. the source) across the
/// current rayon pool.
pub fn execute_backward_data<K: TileKernel>(
    desc: &ConvDesc,
    layouts: &ConvLayouts<'_>,
    diff_src: &mut [f32],
    weights: &[f32],
    diff_dst: &[f32],
    kernel: &K,
) -> Result<(), ConvError> {
    desc.validate()?;
    if desc.stride_h != 1 {
        // The backward-data row arithmetic assumes unit stride.
        return Err(ConvError::invalid("backward-data requires stride_h == 1"));
    }
    check_len("diff_src", diff_src.len(), layouts.src.span())?;
    check_len("diff_dst", diff_dst.len(), layouts.dst.span())?;
    check_len("weights", weights.len(), layouts.weights.span())?;

    log::debug!(
        "backward-data dispatch: mb={} ngroups={} ic_chunks={} nb_oc={} ih={}",
        desc.mb,
        desc.ngroups,
        desc.ic_chunks(),
        desc.nb_oc,
        desc.ih
    );

    let ds_addr = diff_src.as_mut_ptr() as usize;
    let wht_addr = weights.as_ptr() as usize;
    let dd_addr = diff_dst.as_ptr() as usize;

    rayon::broadcast(|ctx| {
        backward_data_thread(
            desc,
            layouts,
            ds_addr,
            wht_addr,
            dd_addr,
            ctx.index(),
            ctx.num_threads(),
            kernel,
        );
    });
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn backward_data_thread<K: TileKernel>(
    desc: &ConvDesc,
    layouts: &ConvLayouts<'_>,
    ds_addr: usize,
    wht_addr: usize,
    dd_addr: usize,
    ithr: usize,
    nthr: usize,
    kernel: &K,
) {
    let diff_src = ds_addr as *mut f32;
    let weights = wht_addr as *const f32;
    let diff_dst = dd_addr as *const f32;

    let ic_chunks = desc.ic_chunks();
    let work_amount = desc.ngroups * desc.mb * ic_chunks;
    let range = split_work(work_amount, nthr, ithr);
    if range.is_empty() {
        return;
    }

    let (mut icc, mut g, mut n) = match desc.loop_order {
        LoopOrder::ChunkGroupBatch => {
            let [icc, g, n] =
                nd_iterator_init(range.start, [ic_chunks, desc.ngroups, desc.mb]);
            (icc, g, n)
        }
        LoopOrder::GroupBatchChunk => {
            let [g, n, icc] =
                nd_iterator_init(range.start, [desc.ngroups, desc.mb, ic_chunks]);
            (icc, g, n)
        }
    };

    let kh = desc.kh as isize;
    let ih = desc.ih as isize;
    let t_pad = desc.t_pad as isize;
    let b_pad = desc.b_pad as isize;
    let mut args = TileCallArgs::default();

    for _iwork in range {
        let ic = icc * desc.nb_ic_blocking;
        let g_ic = g * desc.nb_ic + ic;

        for oc in 0..desc.nb_oc {
            let g_oc = g * desc.nb_oc + oc;

            for ih_row in 0..desc.ih {
                let r = ih_row as isize;
                // Taps whose upstream row falls outside [0, oh) are
                // clipped: high taps at the top edge, low taps at the
                // bottom edge; the filter pointer starts past the
                // bottom-clipped taps.
                let i_t_overflow = (kh - 1 - r - t_pad).max(0);
                let i_b_overflow = (kh - 1 - (ih - 1 - r) - b_pad).max(0);
                let oh_row = r + t_pad - i_b_overflow;

                args.commit();
                args.src_prf =
                    diff_src.wrapping_offset(layouts.src.blk_off(n, g_ic, r, 0));
                args.dst_prf =
                    diff_dst.wrapping_offset(layouts.dst.blk_off(n, g_oc, oh_row, 0))
                        as *mut f32;
                args.filt_prf = weights.wrapping_offset(layouts.weights.blk_off(
                    g,
                    oc,
                    ic,
                    i_b_overflow as usize,
                )) as *mut f32;
                args.kh_len_prf = (kh - i_t_overflow - i_b_overflow).max(0) as usize;
                args.kw_len = desc.kw;
                args.channel_prf = oc;

                if !args.src.is_null() {
                    unsafe { kernel.run(&args) };
                }
            }
        }

        match desc.loop_order {
            LoopOrder::ChunkGroupBatch => {
                let mut c = [icc, g, n];
                nd_iterator_step(&mut c, [ic_chunks, desc.ngroups, desc.mb]);
                [icc, g, n] = c;
            }
            LoopOrder::GroupBatchChunk => {
                let mut c = [g, n, icc];
                nd_iterator_step(&mut c, [desc.ngroups, desc.mb, ic_chunks]);
                [g, n, icc] = c;
            }
        }
    }

    args.commit();
    args.kw_len = desc.kw;
    if !args.src.is_null() {
        unsafe { kernel.run(&args) };
    }
}
