//! End-to-end dispatch validation against direct scalar convolution
//! references.
//!
//! Every test drives a full dispatch through the public entry points with
//! the scalar reference kernels from `conv_driver::reference`, on thread
//! pools of controlled size, and compares against a straight-line
//! reference computed over the same dense blocked layouts:
//! - forward / backward-data / backward-weights numerical correctness
//! - loop-order and thread-count invariance
//! - transpose-pre-pass equivalence
//! - bias forward fusion and bias gradient

use conv_driver::reference::{
    RefBackwardDataKernel, RefBackwardWeightsKernel, RefForwardKernel,
};
use conv_driver::{
    execute_backward_data, execute_backward_weights, execute_forward, BlockedActivations,
    BlockedWeights, ConvDesc, ConvLayouts, LoopOrder, TensorLayout, WeightsLayout, SIMD_W,
};

// ═══════════════════════════════════════════════════════════════════════
// Helpers
// ═══════════════════════════════════════════════════════════════════════

fn desc_small() -> ConvDesc {
    // The canonical scenario: mb=2, one group, one 16-wide channel block
    // on each side, 4x4 input, 3x3 kernel, stride 1, no padding.
    ConvDesc {
        mb: 2,
        ngroups: 1,
        nb_ic: 1,
        nb_oc: 1,
        ic_block: SIMD_W,
        oc_block: SIMD_W,
        ih: 4,
        iw: 4,
        oh: 2,
        ow: 2,
        kh: 3,
        kw: 3,
        stride_h: 1,
        stride_w: 1,
        t_pad: 0,
        b_pad: 0,
        nb_ic_blocking: 1,
        nb_oc_blocking: 1,
        loop_order: LoopOrder::ChunkGroupBatch,
        with_groups: false,
        with_bias: false,
        transpose_src: false,
    }
}

fn desc_padded() -> ConvDesc {
    ConvDesc {
        mb: 2,
        ngroups: 1,
        nb_ic: 2,
        nb_oc: 2,
        ic_block: SIMD_W,
        oc_block: SIMD_W,
        ih: 6,
        iw: 6,
        oh: 6,
        ow: 4,
        kh: 3,
        kw: 3,
        stride_h: 1,
        stride_w: 1,
        t_pad: 1,
        b_pad: 1,
        nb_ic_blocking: 1,
        nb_oc_blocking: 2,
        loop_order: LoopOrder::ChunkGroupBatch,
        with_groups: false,
        with_bias: false,
        transpose_src: false,
    }
}

fn desc_grouped() -> ConvDesc {
    ConvDesc {
        mb: 2,
        ngroups: 2,
        nb_ic: 2,
        nb_oc: 2,
        ic_block: SIMD_W,
        oc_block: SIMD_W,
        ih: 5,
        iw: 5,
        oh: 3,
        ow: 3,
        kh: 3,
        kw: 3,
        stride_h: 1,
        stride_w: 1,
        t_pad: 0,
        b_pad: 0,
        nb_ic_blocking: 2,
        nb_oc_blocking: 1,
        loop_order: LoopOrder::GroupBatchChunk,
        with_groups: true,
        with_bias: false,
        transpose_src: false,
    }
}

struct Setup {
    src_l: BlockedActivations,
    dst_l: BlockedActivations,
    wht_l: BlockedWeights,
    src: Vec<f32>,
    wht: Vec<f32>,
    bias: Vec<f32>,
}

fn setup(desc: &ConvDesc) -> Setup {
    let src_l = BlockedActivations::new(
        desc.mb,
        desc.ngroups * desc.nb_ic,
        desc.ih,
        desc.iw,
        SIMD_W,
    );
    let dst_l = BlockedActivations::new(
        desc.mb,
        desc.ngroups * desc.nb_oc,
        desc.oh,
        desc.ow,
        SIMD_W,
    );
    let wht_l = BlockedWeights::new(
        desc.ngroups,
        desc.nb_oc,
        desc.nb_ic,
        desc.kh,
        desc.kw,
        SIMD_W,
        SIMD_W,
    );
    let mut src = vec![0.0f32; src_l.span()];
    let mut wht = vec![0.0f32; wht_l.span()];
    let mut bias = vec![0.0f32; desc.ngroups * desc.nb_oc * SIMD_W];
    fill(&mut src, 1);
    fill(&mut wht, 2);
    fill(&mut bias, 3);
    Setup {
        src_l,
        dst_l,
        wht_l,
        src,
        wht,
        bias,
    }
}

/// Deterministic pseudo-random fill in [-0.5, 0.5).
fn fill(v: &mut [f32], seed: u32) {
    for (i, x) in v.iter_mut().enumerate() {
        let h = (i as u32)
            .wrapping_mul(2654435761)
            .wrapping_add(seed.wrapping_mul(97));
        *x = (h % 1000) as f32 / 1000.0 - 0.5;
    }
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let diff = (x - y).abs();
        let scale = x.abs().max(y.abs()).max(1.0);
        assert!(
            diff <= tol * scale,
            "mismatch at {i}: {x} vs {y} (diff {diff})"
        );
    }
}

fn on_pool<R: Send>(nthreads: usize, f: impl FnOnce() -> R + Send) -> R {
    rayon::ThreadPoolBuilder::new()
        .num_threads(nthreads)
        .build()
        .unwrap()
        .install(f)
}

// ═══════════════════════════════════════════════════════════════════════
// Direct scalar references (dense blocked layouts)
// ═══════════════════════════════════════════════════════════════════════

fn wht_idx(
    wl: &BlockedWeights,
    g: usize,
    ocb: usize,
    icb: usize,
    r: usize,
    c: usize,
    i: usize,
    o: usize,
) -> usize {
    (wl.blk_off(g, ocb, icb, r) as usize) + (c * SIMD_W + i) * SIMD_W + o
}

fn direct_forward(desc: &ConvDesc, s: &Setup, with_bias: bool) -> Vec<f32> {
    let mut dst = vec![0.0f32; s.dst_l.span()];
    for n in 0..desc.mb {
        for g in 0..desc.ngroups {
            for ocb in 0..desc.nb_oc {
                for y in 0..desc.oh {
                    for x in 0..desc.ow {
                        for o in 0..SIMD_W {
                            let mut acc = if with_bias {
                                s.bias[(g * desc.nb_oc + ocb) * SIMD_W + o]
                            } else {
                                0.0
                            };
                            for icb in 0..desc.nb_ic {
                                for r in 0..desc.kh {
                                    let iy =
                                        (y * desc.stride_h + r) as isize - desc.t_pad as isize;
                                    if iy < 0 || iy >= desc.ih as isize {
                                        continue;
                                    }
                                    for c in 0..desc.kw {
                                        let ix = x * desc.stride_w + c;
                                        for i in 0..SIMD_W {
                                            let so = s.src_l.blk_off(
                                                n,
                                                g * desc.nb_ic + icb,
                                                iy,
                                                ix,
                                            ) as usize;
                                            acc += s.src[so + i]
                                                * s.wht[wht_idx(
                                                    &s.wht_l, g, ocb, icb, r, c, i, o,
                                                )];
                                        }
                                    }
                                }
                            }
                            let d =
                                s.dst_l.blk_off(n, g * desc.nb_oc + ocb, y as isize, x) as usize;
                            dst[d + o] = acc;
                        }
                    }
                }
            }
        }
    }
    dst
}

fn direct_backward_data(desc: &ConvDesc, s: &Setup, dd: &[f32]) -> Vec<f32> {
    let mut ds = vec![0.0f32; s.src_l.span()];
    for n in 0..desc.mb {
        for g in 0..desc.ngroups {
            for icb in 0..desc.nb_ic {
                for y in 0..desc.ih {
                    for x in 0..desc.iw {
                        for i in 0..SIMD_W {
                            let mut acc = 0.0f32;
                            for ocb in 0..desc.nb_oc {
                                for r in 0..desc.kh {
                                    let oy = y as isize + desc.t_pad as isize - r as isize;
                                    if oy < 0 || oy >= desc.oh as isize {
                                        continue;
                                    }
                                    for c in 0..desc.kw {
                                        let Some(ox) = x.checked_sub(c) else { continue };
                                        if ox >= desc.ow {
                                            continue;
                                        }
                                        let d = s.dst_l.blk_off(
                                            n,
                                            g * desc.nb_oc + ocb,
                                            oy,
                                            ox,
                                        ) as usize;
                                        for o in 0..SIMD_W {
                                            acc += s.wht[wht_idx(
                                                &s.wht_l, g, ocb, icb, r, c, i, o,
                                            )] * dd[d + o];
                                        }
                                    }
                                }
                            }
                            let so =
                                s.src_l.blk_off(n, g * desc.nb_ic + icb, y as isize, x) as usize;
                            ds[so + i] = acc;
                        }
                    }
                }
            }
        }
    }
    ds
}

fn direct_backward_weights(desc: &ConvDesc, s: &Setup, dd: &[f32]) -> (Vec<f32>, Vec<f32>) {
    let mut dw = vec![0.0f32; s.wht_l.span()];
    let mut db = vec![0.0f32; desc.ngroups * desc.nb_oc * SIMD_W];
    for g in 0..desc.ngroups {
        for ocb in 0..desc.nb_oc {
            for icb in 0..desc.nb_ic {
                for r in 0..desc.kh {
                    for c in 0..desc.kw {
                        for i in 0..SIMD_W {
                            for o in 0..SIMD_W {
                                let mut acc = 0.0f32;
                                for n in 0..desc.mb {
                                    for y in 0..desc.oh {
                                        let iy = (y * desc.stride_h + r) as isize
                                            - desc.t_pad as isize;
                                        if iy < 0 || iy >= desc.ih as isize {
                                            continue;
                                        }
                                        for x in 0..desc.ow {
                                            let ix = x * desc.stride_w + c;
                                            let so = s.src_l.blk_off(
                                                n,
                                                g * desc.nb_ic + icb,
                                                iy,
                                                ix,
                                            ) as usize;
                                            let d = s.dst_l.blk_off(
                                                n,
                                                g * desc.nb_oc + ocb,
                                                y as isize,
                                                x,
                                            ) as usize;
                                            acc += s.src[so + i] * dd[d + o];
                                        }
                                    }
                                }
                                dw[wht_idx(&s.wht_l, g, ocb, icb, r, c, i, o)] = acc;
                            }
                        }
                    }
                }
            }
            for o in 0..SIMD_W {
                let mut acc = 0.0f32;
                for n in 0..desc.mb {
                    for y in 0..desc.oh {
                        for x in 0..desc.ow {
                            let d =
                                s.dst_l.blk_off(n, g * desc.nb_oc + ocb, y as isize, x) as usize;
                            acc += dd[d + o];
                        }
                    }
                }
                db[(g * desc.nb_oc + ocb) * SIMD_W + o] = acc;
            }
        }
    }
    (dw, db)
}

fn run_forward(desc: &ConvDesc, s: &Setup, nthreads: usize, with_bias: bool) -> Vec<f32> {
    let layouts = ConvLayouts {
        src: &s.src_l,
        dst: &s.dst_l,
        weights: &s.wht_l,
    };
    let kernel = RefForwardKernel::new(desc, &layouts);
    let mut dst = vec![0.0f32; s.dst_l.span()];
    let bias = with_bias.then_some(s.bias.as_slice());
    on_pool(nthreads, || {
        execute_forward(desc, &layouts, &s.src, &s.wht, bias, &mut dst, &kernel).unwrap();
    });
    dst
}

fn run_backward_weights(
    desc: &ConvDesc,
    s: &Setup,
    dd: &[f32],
    nthreads: usize,
) -> (Vec<f32>, Vec<f32>) {
    let layouts = ConvLayouts {
        src: &s.src_l,
        dst: &s.dst_l,
        weights: &s.wht_l,
    };
    let kernel = RefBackwardWeightsKernel::new(desc, &layouts);
    let mut dw = vec![0.0f32; s.wht_l.span()];
    let mut db = vec![0.0f32; desc.ngroups * desc.nb_oc * SIMD_W];
    on_pool(nthreads, || {
        let bias_out = desc.with_bias.then_some(&mut db[..]);
        execute_backward_weights(desc, &layouts, &s.src, dd, &mut dw, bias_out, &kernel)
            .unwrap();
    });
    (dw, db)
}

// ═══════════════════════════════════════════════════════════════════════
// Forward
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn forward_matches_direct_reference_single_thread() {
    let desc = desc_small();
    let s = setup(&desc);
    let dst = run_forward(&desc, &s, 1, false);
    let expect = direct_forward(&desc, &s, false);
    assert_close(&dst, &expect, 1e-5);
}

#[test]
fn forward_with_padding_matches_direct() {
    let mut desc = desc_padded();
    desc.with_bias = true;
    let s = setup(&desc);
    let dst = run_forward(&desc, &s, 2, true);
    let expect = direct_forward(&desc, &s, true);
    assert_close(&dst, &expect, 1e-5);
}

#[test]
fn forward_grouped_matches_direct() {
    let desc = desc_grouped();
    let s = setup(&desc);
    let dst = run_forward(&desc, &s, 3, false);
    let expect = direct_forward(&desc, &s, false);
    assert_close(&dst, &expect, 1e-5);
}

#[test]
fn forward_loop_order_invariant() {
    let mut desc = desc_padded();
    let s = setup(&desc);
    desc.loop_order = LoopOrder::ChunkGroupBatch;
    let a = run_forward(&desc, &s, 2, false);
    desc.loop_order = LoopOrder::GroupBatchChunk;
    let b = run_forward(&desc, &s, 2, false);
    // Identical per-element computation order: bitwise equal.
    assert_eq!(a, b);
}

#[test]
fn forward_thread_count_invariant() {
    let desc = desc_padded();
    let s = setup(&desc);
    let a = run_forward(&desc, &s, 1, false);
    for nthreads in [2, 4, 7] {
        let b = run_forward(&desc, &s, nthreads, false);
        // Disjoint writes, identical per-element order: bitwise equal.
        assert_eq!(a, b);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Backward data
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn backward_data_matches_direct() {
    let desc = desc_padded();
    let s = setup(&desc);
    let mut dd = vec![0.0f32; s.dst_l.span()];
    fill(&mut dd, 4);

    let layouts = ConvLayouts {
        src: &s.src_l,
        dst: &s.dst_l,
        weights: &s.wht_l,
    };
    let kernel = RefBackwardDataKernel::new(&desc, &layouts);
    let mut ds = vec![0.0f32; s.src_l.span()];
    on_pool(2, || {
        execute_backward_data(&desc, &layouts, &mut ds, &s.wht, &dd, &kernel).unwrap();
    });

    let expect = direct_backward_data(&desc, &s, &dd);
    assert_close(&ds, &expect, 1e-5);
}

#[test]
fn backward_data_loop_order_invariant() {
    let mut desc = desc_padded();
    let s = setup(&desc);
    let mut dd = vec![0.0f32; s.dst_l.span()];
    fill(&mut dd, 4);
    let layouts = ConvLayouts {
        src: &s.src_l,
        dst: &s.dst_l,
        weights: &s.wht_l,
    };
    let kernel = RefBackwardDataKernel::new(&desc, &layouts);

    let mut run = |order| {
        desc.loop_order = order;
        let mut ds = vec![0.0f32; s.src_l.span()];
        on_pool(2, || {
            execute_backward_data(&desc, &layouts, &mut ds, &s.wht, &dd, &kernel).unwrap();
        });
        ds
    };
    let a = run(LoopOrder::ChunkGroupBatch);
    let b = run(LoopOrder::GroupBatchChunk);
    assert_eq!(a, b);
}

#[test]
fn backward_data_grouped_matches_direct() {
    // Two groups with a 2-block input-channel chunk per work item.
    let desc = desc_grouped();
    let s = setup(&desc);
    let mut dd = vec![0.0f32; s.dst_l.span()];
    fill(&mut dd, 9);

    let layouts = ConvLayouts {
        src: &s.src_l,
        dst: &s.dst_l,
        weights: &s.wht_l,
    };
    let kernel = RefBackwardDataKernel::new(&desc, &layouts);
    let mut ds = vec![0.0f32; s.src_l.span()];
    on_pool(3, || {
        execute_backward_data(&desc, &layouts, &mut ds, &s.wht, &dd, &kernel).unwrap();
    });

    let expect = direct_backward_data(&desc, &s, &dd);
    assert_close(&ds, &expect, 1e-5);
}

// ═══════════════════════════════════════════════════════════════════════
// Backward weights
// ═══════════════════════════════════════════════════════════════════════

#[test]
fn backward_weights_matches_direct() {
    let mut desc = desc_padded();
    desc.with_bias = true;
    let s = setup(&desc);
    let mut dd = vec![0.0f32; s.dst_l.span()];
    fill(&mut dd, 5);

    let (dw, db) = run_backward_weights(&desc, &s, &dd, 1);
    let (ew, eb) = direct_backward_weights(&desc, &s, &dd);
    assert_close(&dw, &ew, 1e-4);
    assert_close(&db, &eb, 1e-4);
}

#[test]
fn backward_weights_thread_count_invariant() {
    let mut desc = desc_padded();
    desc.with_bias = true;
    let s = setup(&desc);
    let mut dd = vec![0.0f32; s.dst_l.span()];
    fill(&mut dd, 5);

    let (dw1, db1) = run_backward_weights(&desc, &s, &dd, 1);
    for nthreads in [2, 4, 5] {
        let (dwn, dbn) = run_backward_weights(&desc, &s, &dd, nthreads);
        // Summation order differs across the batch split: tolerance, not
        // bitwise.
        assert_close(&dw1, &dwn, 1e-4);
        assert_close(&db1, &dbn, 1e-4);
    }
}

#[test]
fn backward_weights_batch_split_reduction() {
    // One job, more threads than jobs: the balancer puts several threads
    // in one group, each accumulating a batch sub-range, and the merge
    // sums their partials.
    let desc = desc_small();
    let s = setup(&desc);
    let mut dd = vec![0.0f32; s.dst_l.span()];
    fill(&mut dd, 8);

    let (dw, _) = run_backward_weights(&desc, &s, &dd, 4);
    let (ew, _) = direct_backward_weights(&desc, &s, &dd);
    assert_close(&dw, &ew, 1e-4);
}

#[test]
fn backward_weights_transpose_equivalent() {
    let mut desc = desc_padded();
    let s = setup(&desc);
    let mut dd = vec![0.0f32; s.dst_l.span()];
    fill(&mut dd, 6);

    desc.transpose_src = false;
    let (plain, _) = run_backward_weights(&desc, &s, &dd, 3);
    desc.transpose_src = true;
    let (transposed, _) = run_backward_weights(&desc, &s, &dd, 3);
    assert_close(&plain, &transposed, 1e-6);
}

#[test]
fn backward_weights_grouped_matches_direct() {
    let desc = desc_grouped();
    let s = setup(&desc);
    let mut dd = vec![0.0f32; s.dst_l.span()];
    fill(&mut dd, 7);

    let (dw, _) = run_backward_weights(&desc, &s, &dd, 4);
    let (ew, _) = direct_backward_weights(&desc, &s, &dd);
    assert_close(&dw, &ew, 1e-4);
}
