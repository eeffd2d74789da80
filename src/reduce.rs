//! Reduction balancing for the backward-weights pass.
//!
//! The job space (independent gradient accumulators) is split into
//! reduction groups: all threads of a group share the group's contiguous
//! job sub-range and split the minibatch dimension between them. During
//! accumulation each thread writes only its private scratch slice; after a
//! barrier the group's output element range is re-partitioned across its
//! members and each member folds every partial into a disjoint slice of
//! the shared destination. No two threads ever touch overlapping
//! destination elements, so the merge needs no locks.

use crate::balance::split_work;
use std::ops::Range;

/// Thread/group shape for one reduction dispatch.
///
/// The shared destination must be job-major contiguous: flattened job `j`
/// owns `dst[j * job_size .. (j + 1) * job_size]` (the dense
/// [`crate::layout::BlockedWeights`] layout has exactly this shape).
#[derive(Debug, Clone)]
pub struct ReduceBalancer {
    nthr: usize,
    ngroups: usize,
    nthr_per_group: usize,
    njobs: usize,
    job_size: usize,
    reduction_size: usize,
}

impl ReduceBalancer {
    /// Shape the group grid: as many groups as jobs can fill (capped by
    /// the thread count), leftover threads-per-group spent on the
    /// reduction dimension (capped by its extent). Threads beyond
    /// `ngroups × nthr_per_group` receive empty ranges everywhere.
    pub fn new(nthr: usize, njobs: usize, job_size: usize, reduction_size: usize) -> Self {
        assert!(nthr >= 1);
        let ngroups = njobs.clamp(1, nthr);
        let nthr_per_group = (nthr / ngroups).clamp(1, reduction_size.max(1));
        Self {
            nthr,
            ngroups,
            nthr_per_group,
            njobs,
            job_size,
            reduction_size,
        }
    }

    pub fn nthr(&self) -> usize {
        self.nthr
    }

    pub fn ngroups(&self) -> usize {
        self.ngroups
    }

    pub fn nthr_per_group(&self) -> usize {
        self.nthr_per_group
    }

    pub fn job_size(&self) -> usize {
        self.job_size
    }

    #[inline]
    pub fn group_id(&self, ithr: usize) -> usize {
        ithr / self.nthr_per_group
    }

    #[inline]
    pub fn id_in_group(&self, ithr: usize) -> usize {
        ithr % self.nthr_per_group
    }

    fn group_jobs(&self, grp: usize) -> Range<usize> {
        if grp >= self.ngroups {
            return 0..0;
        }
        split_work(self.njobs, self.ngroups, grp)
    }

    /// Contiguous job sub-range of `ithr`, shared by its whole group.
    pub fn ithr_job_range(&self, ithr: usize) -> Range<usize> {
        self.group_jobs(self.group_id(ithr))
    }

    /// Contiguous reduction (minibatch) sub-range of `ithr` within its
    /// group.
    pub fn ithr_reduction_range(&self, ithr: usize) -> Range<usize> {
        if self.group_id(ithr) >= self.ngroups {
            return 0..0;
        }
        split_work(
            self.reduction_size,
            self.nthr_per_group,
            self.id_in_group(ithr),
        )
    }

    /// Upper bound of jobs any single group owns; the per-thread scratch
    /// stride in jobs.
    pub fn max_group_jobs(&self) -> usize {
        (self.njobs + self.ngroups - 1) / self.ngroups
    }

    /// Fold every group member's private slice into the shared
    /// destination: the group's flattened output element range is split
    /// across members via [`split_work`], and each member writes its
    /// disjoint destination slice as the sum over all members' partials.
    /// Zero-job threads return immediately (merge as a no-op).
    ///
    /// # Safety
    ///
    /// `scratch_addr`/`stride` must come from the dispatch's
    /// [`ReduceScratch`]; `dst_addr` must address at least
    /// `njobs * job_size` elements; all accumulation writes must be
    /// ordered before this call (barrier).
    pub unsafe fn reduce(&self, ithr: usize, scratch_addr: usize, stride: usize, dst_addr: usize) {
        let grp = self.group_id(ithr);
        if grp >= self.ngroups {
            return;
        }
        let jobs = self.group_jobs(grp);
        if jobs.is_empty() {
            return;
        }

        let group_elems = jobs.len() * self.job_size;
        let mine = split_work(group_elems, self.nthr_per_group, self.id_in_group(ithr));
        if mine.is_empty() {
            return;
        }

        let dst = (dst_addr as *mut f32).add(jobs.start * self.job_size);
        for m in 0..self.nthr_per_group {
            let member = grp * self.nthr_per_group + m;
            let part = (scratch_addr as *const f32).add(member * stride);
            if m == 0 {
                for x in mine.clone() {
                    *dst.add(x) = *part.add(x);
                }
            } else {
                for x in mine.clone() {
                    *dst.add(x) += *part.add(x);
                }
            }
        }
    }
}

/// Dispatch-lifetime private accumulation buffers: one uniform-stride,
/// zero-initialized slice per thread.
pub struct ReduceScratch {
    buf: Vec<f32>,
    stride: usize,
}

impl ReduceScratch {
    pub fn new(balancer: &ReduceBalancer) -> Self {
        let stride = balancer.max_group_jobs() * balancer.job_size();
        Self {
            buf: vec![0.0; balancer.nthr() * stride],
            stride,
        }
    }

    /// Elements between consecutive threads' slices.
    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Base address handed across the parallel region; thread `ithr` owns
    /// `[base + ithr * stride, base + (ithr + 1) * stride)`.
    pub fn base_addr(&mut self) -> usize {
        self.buf.as_mut_ptr() as usize
    }
}
