use crate::alignment::{Alignment, GAP};
use crate::sparse::{PairStore, PosteriorMatrix};
use std::io::{self, Write};

/// Per-column reliability of an alignment.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    scores: Vec<f32>,
}

impl Annotation {
    /// Mean posterior probability over the residue pairs aligned in each column.
    /// Columns with fewer than two residues score 0.
    pub fn compute<M: PosteriorMatrix>(alignment: &Alignment, store: &PairStore<M>) -> Self {
        let k = alignment.num_sequences();
        let mut numbering = vec![0u32; k];
        let mut scores = Vec::with_capacity(alignment.len());

        for col in 0..alignment.len() {
            let mut present: Vec<usize> = Vec::with_capacity(k);
            for (r, number) in numbering.iter_mut().enumerate() {
                if alignment.row(r)[col] != GAP {
                    *number += 1;
                    present.push(r);
                }
            }

            let mut sum = 0.0f32;
            let mut count = 0usize;
            for (i, &a) in present.iter().enumerate() {
                for &b in &present[i + 1..] {
                    if let Some(m) = store.get(alignment.ids()[a], alignment.ids()[b]) {
                        sum += m.get(numbering[a] as usize, numbering[b] as usize);
                    }
                    count += 1;
                }
            }
            scores.push(if count > 0 { sum / count as f32 } else { 0.0 });
        }
        Annotation { scores }
    }

    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// One score per line.
    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for score in &self.scores {
            writeln!(writer, "{:.4}", score)?;
        }
        Ok(())
    }
}
