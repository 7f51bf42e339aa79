use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::io::{self, Write};

pub const GAP: u8 = b'-';

/// Width of sequence lines in MFA output.
const MFA_LINE_WIDTH: usize = 60;

/// A multiple alignment: one gapped row per sequence, all of equal length.
///
/// `ids[k]` is the index, in the input set, of the sequence stored in row `k`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alignment {
    names: Vec<String>,
    ids: Vec<usize>,
    rows: Vec<Vec<u8>>,
}

impl Alignment {
    /// Build an alignment from gapped rows of equal length.
    pub fn new(names: Vec<String>, ids: Vec<usize>, rows: Vec<Vec<u8>>) -> Self {
        debug_assert_eq!(names.len(), rows.len());
        debug_assert_eq!(ids.len(), rows.len());
        debug_assert!(
            rows.windows(2).all(|w| w[0].len() == w[1].len()),
            "ragged alignment rows"
        );
        Alignment { names, ids, rows }
    }

    pub fn num_sequences(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.rows.first().map_or(0, |r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn ids(&self) -> &[usize] {
        &self.ids
    }

    pub fn rows(&self) -> &[Vec<u8>] {
        &self.rows
    }

    pub fn row(&self, k: usize) -> &[u8] {
        &self.rows[k]
    }

    pub fn column(&self, col: usize) -> Option<Vec<u8>> {
        if col >= self.len() {
            return None;
        }
        Some(self.rows.iter().map(|r| r[col]).collect())
    }

    /// Residues of row `k` with gaps removed.
    pub fn ungapped(&self, k: usize) -> Vec<u8> {
        self.rows[k].iter().copied().filter(|&c| c != GAP).collect()
    }

    /// For row `k`, the column holding each residue (index 0 is residue 1).
    pub fn residue_columns(&self, k: usize) -> Vec<usize> {
        self.rows[k]
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c != GAP)
            .map(|(col, _)| col)
            .collect()
    }

    /// Reorder rows by input index.
    pub fn sorted_by_id(mut self) -> Self {
        let mut order: Vec<usize> = (0..self.rows.len()).collect();
        order.sort_by_key(|&k| self.ids[k]);
        self.names = order.iter().map(|&k| std::mem::take(&mut self.names[k])).collect();
        self.rows = order.iter().map(|&k| std::mem::take(&mut self.rows[k])).collect();
        self.ids = order.iter().map(|&k| self.ids[k]).collect();
        self
    }

    /// Take the rows `subset` (positions in this alignment) and drop all-gap columns.
    pub fn project(&self, subset: &[usize]) -> Alignment {
        let keep: Vec<usize> = (0..self.len())
            .filter(|&col| subset.iter().any(|&k| self.rows[k][col] != GAP))
            .collect();
        let rows = subset
            .iter()
            .map(|&k| keep.iter().map(|&col| self.rows[k][col]).collect())
            .collect();
        Alignment {
            names: subset.iter().map(|&k| self.names[k].clone()).collect(),
            ids: subset.iter().map(|&k| self.ids[k]).collect(),
            rows,
        }
    }

    /// Content hash of names and rows; stable across runs and platforms.
    pub fn calculate_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for (name, row) in self.names.iter().zip(&self.rows) {
            name.hash(&mut hasher);
            row.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Write the alignment in multi-FASTA format.
    pub fn write_mfa<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        for (name, row) in self.names.iter().zip(&self.rows) {
            writeln!(writer, ">{}", name)?;
            for chunk in row.chunks(MFA_LINE_WIDTH) {
                writer.write_all(chunk)?;
                writer.write_all(b"\n")?;
            }
        }
        Ok(())
    }
}
