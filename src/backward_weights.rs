//! Backward-weights driver: gradient accumulation as a two-level parallel
//! reduction, with an optional source-transpose pre-pass.
//!
//! One fork-join region runs up to three phases per thread, separated by
//! full barriers:
//!
//! 1. if the descriptor asks for it, rewrite source tiles from the
//!    channel-interleaved layout into the row-major shape the
//!    weight-gradient kernel expects — separately load-balanced, because
//!    the weight jobs are redistributed afterwards and any thread may read
//!    tiles another thread transposed;
//! 2. accumulate weight gradients into thread-private scratch slices over
//!    each thread's (job sub-range × batch sub-range), then merge via the
//!    [`ReduceBalancer`]'s partitioned lock-free fold;
//! 3. if bias is enabled, the structurally identical bias phase — a plain
//!    16-wide row sum stands in for the tile kernel.

use std::sync::Barrier;

use crate::balance::{nd_iterator_init, nd_iterator_step, split_work};
use crate::desc::{ConvDesc, SIMD_W};
use crate::driver::{check_len, ConvLayouts};
use crate::error::ConvError;
use crate::kernel::{TileCallArgs, TileKernel};
use crate::layout::TensorLayout;
use crate::reduce::{ReduceBalancer, ReduceScratch};

/// Execute one backward-weights pass (gradient w.r.t. the weights and,
/// optionally, the bias) across the current rayon pool.
///
/// `layouts.src` addresses the forward source, `layouts.dst` the upstream
/// gradient, `layouts.weights` the weight gradient. The weight-gradient
/// buffer must be job-major contiguous (see [`ReduceBalancer`]).
pub fn execute_backward_weights<K: TileKernel>(
    desc: &ConvDesc,
    layouts: &ConvLayouts<'_>,
    src: &[f32],
    diff_dst: &[f32],
    diff_weights: &mut [f32],
    mut diff_bias: Option<&mut [f32]>,
    kernel: &K,
) -> Result<(), ConvError> {
    desc.validate()?;
    check_len("src", src.len(), layouts.src.span())?;
    check_len("diff_dst", diff_dst.len(), layouts.dst.span())?;
    check_len("diff_weights", diff_weights.len(), layouts.weights.span())?;
    let db_addr = if desc.with_bias {
        let b = diff_bias
            .as_deref_mut()
            .ok_or_else(|| ConvError::invalid("with_bias set but no diff_bias supplied"))?;
        check_len("diff_bias", b.len(), desc.ngroups * desc.nb_oc * desc.oc_block)?;
        b.as_mut_ptr() as usize
    } else {
        0
    };

    let nthr = rayon::current_num_threads();

    let w_njobs = desc.ngroups * desc.nb_oc * desc.nb_ic;
    let w_job_size = desc.kh * desc.kw * desc.ic_block * desc.oc_block;
    let rw = ReduceBalancer::new(nthr, w_njobs, w_job_size, desc.mb);
    let mut w_scratch = ReduceScratch::new(&rw);
    let w_scratch_addr = w_scratch.base_addr();
    let w_stride = w_scratch.stride();

    let rb = desc
        .with_bias
        .then(|| ReduceBalancer::new(nthr, desc.ngroups * desc.nb_oc, desc.oc_block, desc.mb));
    let mut b_scratch = rb.as_ref().map(ReduceScratch::new);
    let (b_scratch_addr, b_stride) = match b_scratch.as_mut() {
        Some(s) => (s.base_addr(), s.stride()),
        None => (0, 0),
    };

    // Transpose workspace shares the source layout's addressing.
    let mut tr_src = if desc.transpose_src {
        vec![0.0f32; layouts.src.span()]
    } else {
        Vec::new()
    };
    let tr_addr = tr_src.as_mut_ptr() as usize;

    log::debug!(
        "backward-weights dispatch: mb={} jobs={} groups={}x{} transpose={} bias={}",
        desc.mb,
        w_njobs,
        rw.ngroups(),
        rw.nthr_per_group(),
        desc.transpose_src,
        desc.with_bias
    );

    let src_addr = src.as_ptr() as usize;
    let dd_addr = diff_dst.as_ptr() as usize;
    let dw_addr = diff_weights.as_mut_ptr() as usize;

    let barrier = Barrier::new(nthr);

    rayon::broadcast(|ctx| {
        let ithr = ctx.index();
        let nthr = ctx.num_threads();

        if desc.transpose_src {
            transpose_thread(desc, layouts, src_addr, tr_addr, ithr, nthr);
        }
        // No thread may start accumulating before every transposed tile it
        // might read is written.
        barrier.wait();

        let acc_src_addr = if desc.transpose_src { tr_addr } else { src_addr };
        acc_weights_thread(
            desc,
            layouts,
            &rw,
            acc_src_addr,
            dd_addr,
            w_scratch_addr,
            w_stride,
            ithr,
            kernel,
        );
        barrier.wait();
        // Safety: every producer passed the barrier above; destination
        // slices are disjoint by job partition.
        unsafe { rw.reduce(ithr, w_scratch_addr, w_stride, dw_addr) };

        if let Some(rb) = &rb {
            acc_bias_thread(desc, layouts, rb, dd_addr, b_scratch_addr, b_stride, ithr);
            barrier.wait();
            unsafe { rb.reduce(ithr, b_scratch_addr, b_stride, db_addr) };
        }
    });

    Ok(())
}

/// Rewrite one `iw × 16` channel-interleaved source row per work item into
/// a `16 × iw` row-major tile at the same blocked offset in the workspace.
fn transpose_thread(
    desc: &ConvDesc,
    layouts: &ConvLayouts<'_>,
    src_addr: usize,
    tr_addr: usize,
    ithr: usize,
    nthr: usize,
) {
    let src = src_addr as *const f32;
    let tr = tr_addr as *mut f32;

    let dims = [desc.mb, desc.ngroups, desc.nb_ic, desc.ih];
    let work_amount = desc.mb * desc.ngroups * desc.nb_ic * desc.ih;
    let range = split_work(work_amount, nthr, ithr);
    if range.is_empty() {
        return;
    }

    let w_stride = layouts.src.blk_off(0, 0, 0, 1) as usize;
    let mut coords = nd_iterator_init(range.start, dims);

    for _iwork in range {
        let [img, g, b_ic, row] = coords;
        let ic = g * desc.nb_ic + b_ic;
        let off = layouts.src.blk_off(img, ic, row as isize, 0);
        unsafe {
            let s = src.offset(off);
            let d = tr.offset(off);
            for x in 0..desc.iw {
                for j in 0..SIMD_W {
                    *d.add(j * desc.iw + x) = *s.add(x * w_stride + j);
                }
            }
        }
        nd_iterator_step(&mut coords, dims);
    }
}

/// Accumulate weight gradients for every (job, image) pair assigned to
/// `ithr`, into its private scratch slice. The slice is zeroed on the
/// first image of each job — accumulation is always additive into an
/// initialized buffer; the kernel never zero-initializes.
#[allow(clippy::too_many_arguments)]
fn acc_weights_thread<K: TileKernel>(
    desc: &ConvDesc,
    layouts: &ConvLayouts<'_>,
    rw: &ReduceBalancer,
    src_addr: usize,
    dd_addr: usize,
    scratch_addr: usize,
    stride: usize,
    ithr: usize,
    kernel: &K,
) {
    let jobs = rw.ithr_job_range(ithr);
    if jobs.is_empty() {
        return;
    }
    let imgs = rw.ithr_reduction_range(ithr);

    let src = src_addr as *const f32;
    let diff_dst = dd_addr as *const f32;
    let my_scratch = (scratch_addr as *mut f32).wrapping_add(ithr * stride);
    let job_size = rw.job_size();

    let dims = [desc.ngroups, desc.nb_oc, desc.nb_ic];
    let start_coords = nd_iterator_init(jobs.start, dims);

    for img in imgs.clone() {
        let mut coords = start_coords;
        for jl in 0..jobs.len() {
            let [g, ocb, icb] = coords;
            let g_oc = g * desc.nb_oc + ocb;
            let g_ic = g * desc.nb_ic + icb;

            let filt = my_scratch.wrapping_add(jl * job_size);
            if img == imgs.start {
                unsafe { std::ptr::write_bytes(filt, 0, job_size) };
            }

            let args = TileCallArgs {
                src: src.wrapping_offset(layouts.src.blk_off(img, g_ic, 0, 0)) as *mut f32,
                dst: diff_dst.wrapping_offset(layouts.dst.blk_off(img, g_oc, 0, 0))
                    as *mut f32,
                filt,
                kh_len: desc.kh,
                kw_len: desc.kw,
                channel: icb,
                ..TileCallArgs::default()
            };
            // Safety: plane bases are in-bounds by the span checks; the
            // filt slice is this thread's exclusive scratch.
            unsafe { kernel.run(&args) };

            nd_iterator_step(&mut coords, dims);
        }
    }
}

/// Bias-gradient accumulation: same job/reduction split as the weight
/// phase, with a plain elementwise row sum over the SIMD block width in
/// place of the tile kernel.
fn acc_bias_thread(
    desc: &ConvDesc,
    layouts: &ConvLayouts<'_>,
    rb: &ReduceBalancer,
    dd_addr: usize,
    scratch_addr: usize,
    stride: usize,
    ithr: usize,
) {
    let jobs = rb.ithr_job_range(ithr);
    if jobs.is_empty() {
        return;
    }
    let imgs = rb.ithr_reduction_range(ithr);

    let diff_dst = dd_addr as *const f32;
    let my_scratch = (scratch_addr as *mut f32).wrapping_add(ithr * stride);

    let dims = [desc.ngroups, desc.nb_oc];
    let start_coords = nd_iterator_init(jobs.start, dims);
    let dst_h_stride = layouts.dst.blk_off(0, 0, 1, 0);
    let dst_w_stride = layouts.dst.blk_off(0, 0, 0, 1);

    for img in imgs.clone() {
        let mut coords = start_coords;
        for jl in 0..jobs.len() {
            let [g, ocb] = coords;
            let g_oc = g * desc.nb_oc + ocb;

            let d_bias = my_scratch.wrapping_add(jl * desc.oc_block);
            if img == imgs.start {
                unsafe { std::ptr::write_bytes(d_bias, 0, desc.oc_block) };
            }

            let row0 = diff_dst.wrapping_offset(layouts.dst.blk_off(img, g_oc, 0, 0));
            unsafe {
                for row in 0..desc.oh {
                    let r = row0.wrapping_offset(row as isize * dst_h_stride);
                    for col in 0..desc.ow {
                        let p = r.wrapping_offset(col as isize * dst_w_stride);
                        for o in 0..SIMD_W {
                            *d_bias.add(o) += *p.add(o);
                        }
                    }
                }
            }

            nd_iterator_step(&mut coords, dims);
        }
    }
}
