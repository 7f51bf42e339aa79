use crate::config::ModelKind;

/// Above this log-space gap the smaller term is dropped in fast-math mode.
const LOG_ADD_CUTOFF: f32 = 16.0;

/// `ln(e^x + e^y)` computed without overflow.
#[inline]
pub fn log_add(x: f32, y: f32, fast: bool) -> f32 {
    let (hi, lo) = if x > y { (x, y) } else { (y, x) };
    if lo == f32::NEG_INFINITY {
        return hi;
    }
    let d = hi - lo;
    if fast && d > LOG_ADD_CUTOFF {
        return hi;
    }
    hi + (-d).exp().ln_1p()
}

/// Three-state pair-HMM (match, insertion in x, insertion in y) scoring
/// residue pairs, plus the thread count used when the model is evaluated in
/// the final alignment stages.
#[derive(Debug, Clone)]
pub struct ProbabilisticModel {
    kind: ModelKind,
    /// Probability of leaving the match state into either insert state.
    gap_open: f32,
    /// Probability of staying in an insert state.
    gap_extend: f32,
    /// Probability that an aligned pair carries identical residues.
    match_identity: f32,
    num_threads: usize,
}

impl ProbabilisticModel {
    pub fn new(kind: ModelKind) -> Self {
        match kind {
            ModelKind::Protein => ProbabilisticModel {
                kind,
                gap_open: 0.02,
                gap_extend: 0.4,
                match_identity: 0.6,
                num_threads: 1,
            },
            ModelKind::Nucleotide => ProbabilisticModel {
                kind,
                gap_open: 0.03,
                gap_extend: 0.5,
                match_identity: 0.8,
                num_threads: 1,
            },
        }
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    pub fn set_num_threads(&mut self, num_threads: usize) {
        self.num_threads = num_threads.max(1);
    }

    fn alphabet_size(&self) -> f32 {
        match self.kind {
            ModelKind::Protein => 20.0,
            ModelKind::Nucleotide => 4.0,
        }
    }

    #[inline]
    fn log_match_emission(&self, a: u8, b: u8) -> f32 {
        let size = self.alphabet_size();
        if a.eq_ignore_ascii_case(&b) {
            (self.match_identity / size).ln()
        } else {
            ((1.0 - self.match_identity) / (size * (size - 1.0))).ln()
        }
    }

    /// Posterior probability that `x[i-1]` aligns with `y[j-1]`, as a dense
    /// `(|x| + 1) x (|y| + 1)` row-major matrix with an empty row and column 0.
    pub fn posterior(&self, x: &[u8], y: &[u8], fast_math: bool) -> Vec<f32> {
        let n = x.len();
        let m = y.len();
        let w = m + 1;
        let size = (n + 1) * w;
        let neg = f32::NEG_INFINITY;

        let t_mm = (1.0 - 2.0 * self.gap_open).ln();
        let t_mi = self.gap_open.ln();
        let t_ii = self.gap_extend.ln();
        let t_im = (1.0 - self.gap_extend).ln();
        let e_ins = (1.0 / self.alphabet_size()).ln();

        // Forward; the begin state sits in fm[0] and behaves like a match state.
        let mut fm = vec![neg; size];
        let mut fx = vec![neg; size];
        let mut fy = vec![neg; size];
        fm[0] = 0.0;
        for i in 0..=n {
            for j in 0..=m {
                if i == 0 && j == 0 {
                    continue;
                }
                let cur = i * w + j;
                if i > 0 && j > 0 {
                    let k = (i - 1) * w + j - 1;
                    let s = log_add(
                        log_add(fm[k] + t_mm, fx[k] + t_im, fast_math),
                        fy[k] + t_im,
                        fast_math,
                    );
                    fm[cur] = s + self.log_match_emission(x[i - 1], y[j - 1]);
                }
                if i > 0 {
                    let k = (i - 1) * w + j;
                    fx[cur] = log_add(fm[k] + t_mi, fx[k] + t_ii, fast_math) + e_ins;
                }
                if j > 0 {
                    let k = i * w + j - 1;
                    fy[cur] = log_add(fm[k] + t_mi, fy[k] + t_ii, fast_math) + e_ins;
                }
            }
        }
        let last = size - 1;
        let total = log_add(log_add(fm[last], fx[last], fast_math), fy[last], fast_math);

        // Backward
        let mut bm = vec![neg; size];
        let mut bx = vec![neg; size];
        let mut by = vec![neg; size];
        bm[last] = 0.0;
        bx[last] = 0.0;
        by[last] = 0.0;
        for i in (0..=n).rev() {
            for j in (0..=m).rev() {
                if i == n && j == m {
                    continue;
                }
                let (mut vm, mut vx, mut vy) = (neg, neg, neg);
                if i < n && j < m {
                    let e = self.log_match_emission(x[i], y[j]) + bm[(i + 1) * w + j + 1];
                    vm = log_add(vm, t_mm + e, fast_math);
                    vx = log_add(vx, t_im + e, fast_math);
                    vy = log_add(vy, t_im + e, fast_math);
                }
                if i < n {
                    let e = e_ins + bx[(i + 1) * w + j];
                    vm = log_add(vm, t_mi + e, fast_math);
                    vx = log_add(vx, t_ii + e, fast_math);
                }
                if j < m {
                    let e = e_ins + by[i * w + j + 1];
                    vm = log_add(vm, t_mi + e, fast_math);
                    vy = log_add(vy, t_ii + e, fast_math);
                }
                let cur = i * w + j;
                bm[cur] = vm;
                bx[cur] = vx;
                by[cur] = vy;
            }
        }

        let mut posterior = vec![0.0f32; size];
        for i in 1..=n {
            for j in 1..=m {
                let cur = i * w + j;
                posterior[cur] = (fm[cur] + bm[cur] - total).exp().min(1.0);
            }
        }
        posterior
    }
}

/// Score of the maximum expected accuracy path through a dense posterior,
/// divided by the shorter sequence length.
pub fn expected_accuracy(posterior: &[f32], n: usize, m: usize) -> f32 {
    if n == 0 || m == 0 {
        return 0.0;
    }
    let w = m + 1;
    let mut prev = vec![0.0f32; w];
    let mut cur = vec![0.0f32; w];
    for i in 1..=n {
        cur[0] = 0.0;
        for j in 1..=m {
            let diag = prev[j - 1] + posterior[i * w + j];
            cur[j] = diag.max(prev[j]).max(cur[j - 1]);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[m] / n.min(m) as f32
}
