//! Every pairwise matrix is freed exactly once, by the pipeline itself.
//!
//! Kept in its own test binary: the allocation log is process-wide.

use probmsa::config::{Configuration, ModelKind};
use probmsa::sequence::{Sequence, SequenceSet};
use probmsa::sparse::{Cell, FromPosterior, PosteriorMatrix, SparseMatrix};
use probmsa::MsaPipeline;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
static CREATED: Mutex<Vec<usize>> = Mutex::new(Vec::new());
static FREED: Mutex<Vec<usize>> = Mutex::new(Vec::new());

/// Sparse matrix that logs its creation and destruction.
struct Tracked {
    id: usize,
    inner: SparseMatrix,
}

impl Tracked {
    fn wrap(inner: SparseMatrix) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        CREATED.lock().unwrap().push(id);
        Tracked { id, inner }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        FREED.lock().unwrap().push(self.id);
    }
}

impl PosteriorMatrix for Tracked {
    fn seq1_len(&self) -> usize {
        self.inner.seq1_len()
    }

    fn seq2_len(&self) -> usize {
        self.inner.seq2_len()
    }

    fn row(&self, i: usize) -> &[Cell] {
        self.inner.row(i)
    }

    fn set_rows(&mut self, rows: Vec<Vec<Cell>>) {
        self.inner.set_rows(rows);
    }
}

impl FromPosterior for Tracked {
    fn from_posterior(dense: &[f32], len1: usize, len2: usize, cutoff: f32) -> Self {
        Tracked::wrap(SparseMatrix::from_dense(dense, len1, len2, cutoff))
    }

    fn transposed(&self) -> Self {
        Tracked::wrap(self.inner.transpose())
    }
}

#[test]
fn test_matrices_released_exactly_once() {
    let set = SequenceSet::new(vec![
        Sequence::new("a", b"ACGTACGTAC"),
        Sequence::new("b", b"ACGTACGAAC"),
        Sequence::new("c", b"ACGTTCGAACG"),
        Sequence::new("d", b"TCGTACGTACA"),
    ]);
    let mut config = Configuration::default();
    config.hardware.num_threads = 2;
    config.algorithm.model = ModelKind::Nucleotide;
    config.algorithm.refinement.iterations = 3;
    config.io.enable_annotation = true;

    let mut pipeline: MsaPipeline<Tracked> = MsaPipeline::new(config, None).unwrap();
    let output = pipeline.align(&set).unwrap();
    assert_eq!(output.alignment.num_sequences(), 4);
    assert!(output.stats.get("time.5-delete").is_some());

    // released inside align, before the pipeline itself goes away
    let mut created = CREATED.lock().unwrap().clone();
    let mut freed = FREED.lock().unwrap().clone();
    assert_eq!(created.len(), 2 * 6, "one matrix and one mirror per pair");
    created.sort_unstable();
    freed.sort_unstable();
    assert_eq!(freed, created, "every matrix freed exactly once");

    drop(pipeline);
    assert_eq!(FREED.lock().unwrap().len(), 12);
}
