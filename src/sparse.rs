//! Sparse posterior matrices and the triangular store that owns them.
//!
//! Residues are numbered from 1 in both dimensions, so row 0 of every matrix is
//! always empty. A cell `(j, p)` in row `i` is the probability that residue `i`
//! of the first sequence aligns with residue `j` of the second.

use crate::error::{MsaError, Result};
use log::debug;

/// `(column, probability)` entry of a sparse row.
pub type Cell = (u32, f32);

/// Probabilities below this value are not stored.
pub const POSTERIOR_CUTOFF: f32 = 0.01;

/// Row-oriented access to a pairwise posterior matrix.
pub trait PosteriorMatrix: Send + Sync {
    fn seq1_len(&self) -> usize;

    fn seq2_len(&self) -> usize;

    /// Cells of row `i`, sorted by column.
    fn row(&self, i: usize) -> &[Cell];

    /// Replace the content in place. `rows` has `seq1_len() + 1` entries.
    fn set_rows(&mut self, rows: Vec<Vec<Cell>>);

    fn get(&self, i: usize, j: usize) -> f32 {
        let row = self.row(i);
        match row.binary_search_by_key(&(j as u32), |&(col, _)| col) {
            Ok(pos) => row[pos].1,
            Err(_) => 0.0,
        }
    }
}

/// Matrices that can be produced from a dense posterior.
pub trait FromPosterior: PosteriorMatrix + Sized {
    fn from_posterior(dense: &[f32], len1: usize, len2: usize, cutoff: f32) -> Self;

    /// The mirror matrix, rows over the second sequence.
    fn transposed(&self) -> Self;
}

/// Transpose row lists of a `len1 x len2` matrix.
pub fn transpose_rows(rows: &[Vec<Cell>], len2: usize) -> Vec<Vec<Cell>> {
    let mut out: Vec<Vec<Cell>> = vec![Vec::new(); len2 + 1];
    for (i, row) in rows.iter().enumerate() {
        for &(j, p) in row {
            out[j as usize].push((i as u32, p));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// CSR implementation
// ---------------------------------------------------------------------------

/// Compressed sparse row matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseMatrix {
    seq1_len: usize,
    seq2_len: usize,
    row_ptr: Vec<usize>,
    cells: Vec<Cell>,
}

impl SparseMatrix {
    /// Build from a dense `(len1 + 1) x (len2 + 1)` row-major posterior,
    /// keeping entries at or above `cutoff`.
    pub fn from_dense(dense: &[f32], len1: usize, len2: usize, cutoff: f32) -> Self {
        debug_assert_eq!(dense.len(), (len1 + 1) * (len2 + 1));
        let mut row_ptr = Vec::with_capacity(len1 + 2);
        let mut cells = Vec::new();
        row_ptr.push(0);
        row_ptr.push(0);
        for i in 1..=len1 {
            let base = i * (len2 + 1);
            for j in 1..=len2 {
                let p = dense[base + j];
                if p >= cutoff {
                    cells.push((j as u32, p));
                }
            }
            row_ptr.push(cells.len());
        }
        SparseMatrix {
            seq1_len: len1,
            seq2_len: len2,
            row_ptr,
            cells,
        }
    }

    pub fn from_rows(len1: usize, len2: usize, rows: Vec<Vec<Cell>>) -> Self {
        let mut m = SparseMatrix {
            seq1_len: len1,
            seq2_len: len2,
            row_ptr: vec![0; len1 + 2],
            cells: Vec::new(),
        };
        m.set_rows(rows);
        m
    }

    pub fn transpose(&self) -> Self {
        let rows: Vec<Vec<Cell>> = (0..=self.seq1_len).map(|i| self.row(i).to_vec()).collect();
        SparseMatrix::from_rows(self.seq2_len, self.seq1_len, transpose_rows(&rows, self.seq2_len))
    }

    /// Number of stored cells.
    pub fn nnz(&self) -> usize {
        self.cells.len()
    }
}

impl PosteriorMatrix for SparseMatrix {
    fn seq1_len(&self) -> usize {
        self.seq1_len
    }

    fn seq2_len(&self) -> usize {
        self.seq2_len
    }

    fn row(&self, i: usize) -> &[Cell] {
        &self.cells[self.row_ptr[i]..self.row_ptr[i + 1]]
    }

    fn set_rows(&mut self, rows: Vec<Vec<Cell>>) {
        debug_assert_eq!(rows.len(), self.seq1_len + 1, "row count mismatch");
        self.cells.clear();
        self.row_ptr.clear();
        self.row_ptr.push(0);
        for mut row in rows {
            row.sort_unstable_by_key(|&(col, _)| col);
            self.cells.extend(row);
            self.row_ptr.push(self.cells.len());
        }
    }
}

impl FromPosterior for SparseMatrix {
    fn from_posterior(dense: &[f32], len1: usize, len2: usize, cutoff: f32) -> Self {
        SparseMatrix::from_dense(dense, len1, len2, cutoff)
    }

    fn transposed(&self) -> Self {
        self.transpose()
    }
}

// ---------------------------------------------------------------------------
// Pair store
// ---------------------------------------------------------------------------

/// The matrix for `a < b` and its mirror, owned and freed together.
#[derive(Debug)]
pub struct PairSlot<M> {
    /// Rows over residues of `a`.
    pub forward: M,
    /// Rows over residues of `b`.
    pub reverse: M,
}

/// One slot per unordered sequence pair, stored as a flat upper triangle.
#[derive(Debug)]
pub struct PairStore<M> {
    num_seqs: usize,
    slots: Vec<Option<PairSlot<M>>>,
}

impl<M: PosteriorMatrix> PairStore<M> {
    pub fn new(num_seqs: usize) -> Self {
        let num_pairs = num_seqs * num_seqs.saturating_sub(1) / 2;
        PairStore {
            num_seqs,
            slots: (0..num_pairs).map(|_| None).collect(),
        }
    }

    pub fn num_seqs(&self) -> usize {
        self.num_seqs
    }

    /// Position of the pair `a < b` in the flat triangle.
    fn slot_index(&self, a: usize, b: usize) -> usize {
        debug_assert!(a < b && b < self.num_seqs);
        a * (2 * self.num_seqs - a - 1) / 2 + (b - a - 1)
    }

    /// Every `(a, b)` with `a < b`, in row-major order.
    pub fn pairs(&self) -> Vec<(usize, usize)> {
        let n = self.num_seqs;
        (0..n).flat_map(|a| (a + 1..n).map(move |b| (a, b))).collect()
    }

    /// Store `forward` (rows over `a`) and its mirror; `a > b` is turned around.
    pub fn insert(&mut self, a: usize, b: usize, forward: M, reverse: M) {
        debug_assert_ne!(a, b);
        let (a, b, forward, reverse) = if a < b {
            (a, b, forward, reverse)
        } else {
            (b, a, reverse, forward)
        };
        let idx = self.slot_index(a, b);
        self.slots[idx] = Some(PairSlot { forward, reverse });
    }

    /// Matrix with rows over residues of `i` and columns over residues of `j`.
    pub fn get(&self, i: usize, j: usize) -> Option<&M> {
        if i == j || i >= self.num_seqs || j >= self.num_seqs {
            return None;
        }
        let (a, b) = if i < j { (i, j) } else { (j, i) };
        let slot = self.slots[self.slot_index(a, b)].as_ref()?;
        Some(if i < j { &slot.forward } else { &slot.reverse })
    }

    pub fn slot_mut(&mut self, a: usize, b: usize) -> Option<&mut PairSlot<M>> {
        if a >= b || b >= self.num_seqs {
            return None;
        }
        let idx = self.slot_index(a, b);
        self.slots[idx].as_mut()
    }

    /// Rewrite the pair `a < b` from forward rows; the mirror gets the transpose.
    pub fn update(&mut self, a: usize, b: usize, rows: Vec<Vec<Cell>>) -> Result<()> {
        let Some(slot) = self.slot_mut(a, b) else {
            return Ok(());
        };
        let (len1, len2) = (slot.forward.seq1_len(), slot.forward.seq2_len());
        if rows.len() != len1 + 1 {
            return Err(MsaError::stage(
                "pair store",
                format!("pair ({}, {}) expects {} rows, got {}", a, b, len1 + 1, rows.len()),
            ));
        }
        if let Some(&(col, _)) = rows.iter().flatten().find(|&&(col, _)| col == 0 || col as usize > len2) {
            return Err(MsaError::stage(
                "pair store",
                format!("pair ({}, {}) has column {} outside 1..={}", a, b, col, len2),
            ));
        }
        let mirrored = transpose_rows(&rows, len2);
        slot.forward.set_rows(rows);
        slot.reverse.set_rows(mirrored);
        Ok(())
    }

    /// Number of populated matrices, mirrors included.
    pub fn num_matrices(&self) -> usize {
        2 * self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Free every matrix, each pair with its mirror, and return how many were freed.
    pub fn release(&mut self) -> usize {
        let mut freed = 0;
        for slot in self.slots.iter_mut() {
            if let Some(pair) = slot.take() {
                drop(pair);
                freed += 2;
            }
        }
        debug!("Released {} pairwise matrices", freed);
        freed
    }
}
