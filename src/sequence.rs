use crate::error::{MsaError, Result};
use noodles::fasta;
use std::path::Path;

/// A named biological sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    pub name: String,
    pub residues: Vec<u8>,
}

impl Sequence {
    pub fn new(name: &str, residues: &[u8]) -> Self {
        Sequence {
            name: name.to_string(),
            residues: residues.to_vec(),
        }
    }

    pub fn len(&self) -> usize {
        self.residues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.residues.is_empty()
    }
}

/// Ordered, immutable input of the aligner. Sequences are identified by index.
#[derive(Debug, Clone, Default)]
pub struct SequenceSet {
    sequences: Vec<Sequence>,
}

impl SequenceSet {
    pub fn new(sequences: Vec<Sequence>) -> Self {
        SequenceSet { sequences }
    }

    /// Read every record of a (optionally bgzipped) FASTA file.
    pub fn from_fasta<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = fasta::io::reader::Builder::default().build_from_path(path.as_ref())?;

        let mut sequences = Vec::new();
        for result in reader.records() {
            let record = result?;
            let name = String::from_utf8_lossy(record.name()).into_owned();
            let residues: Vec<u8> = record
                .sequence()
                .as_ref()
                .iter()
                .filter(|b| !b.is_ascii_whitespace())
                .copied()
                .collect();
            sequences.push(Sequence { name, residues });
        }

        Ok(SequenceSet { sequences })
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn get(&self, index: usize) -> &Sequence {
        &self.sequences[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.sequences.iter().map(|s| s.name.clone()).collect()
    }

    /// Reject empty sets and sequences without residues or with gap symbols.
    pub fn validate(&self) -> Result<()> {
        if self.sequences.is_empty() {
            return Err(MsaError::EmptyInput);
        }
        for (index, seq) in self.sequences.iter().enumerate() {
            if seq.is_empty() {
                return Err(MsaError::MalformedSequence {
                    index,
                    reason: format!("'{}' has no residues", seq.name),
                });
            }
            if let Some(pos) = seq.residues.iter().position(|&b| b == b'-' || !b.is_ascii_graphic()) {
                return Err(MsaError::MalformedSequence {
                    index,
                    reason: format!("'{}' has an invalid symbol at position {}", seq.name, pos),
                });
            }
        }
        Ok(())
    }
}
