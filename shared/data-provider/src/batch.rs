use crate::SequenceLength;

use serde_json::{json, Value};

/// One tokenized source/target pair, still carrying its raw text.
#[derive(Clone, Debug, PartialEq)]
pub struct Seq2SeqExample {
    pub source_text: String,
    pub target_text: String,
    pub source: Vec<u32>,
    pub target: Vec<u32>,
}

impl SequenceLength for Seq2SeqExample {
    fn sequence_length(&self) -> usize {
        self.source.len().max(self.target.len())
    }
}

/// A batch of token sequences plus an optional side channel.
///
/// Readers fill `example` with an object holding the `source_text` and
/// `target_text` string arrays, in batch order.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Seq2SeqBatch {
    pub source_seqs: Vec<Vec<u32>>,
    pub target_seqs: Vec<Vec<u32>>,
    pub example: Option<Value>,
}

impl Seq2SeqBatch {
    pub fn new(source_seqs: Vec<Vec<u32>>, target_seqs: Vec<Vec<u32>>) -> Self {
        Self {
            source_seqs,
            target_seqs,
            example: None,
        }
    }

    pub fn with_example(mut self, example: Value) -> Self {
        self.example = Some(example);
        self
    }

    pub fn collate(examples: Vec<Seq2SeqExample>) -> Self {
        let mut source_text = Vec::with_capacity(examples.len());
        let mut target_text = Vec::with_capacity(examples.len());
        let mut source_seqs = Vec::with_capacity(examples.len());
        let mut target_seqs = Vec::with_capacity(examples.len());
        for example in examples {
            source_text.push(example.source_text);
            target_text.push(example.target_text);
            source_seqs.push(example.source);
            target_seqs.push(example.target);
        }
        Self::new(source_seqs, target_seqs).with_example(json!({
            "source_text": source_text,
            "target_text": target_text,
        }))
    }

    pub fn batch_size(&self) -> usize {
        self.source_seqs.len()
    }

    pub fn num_source_elements(&self) -> usize {
        self.source_seqs.iter().map(Vec::len).sum()
    }

    pub fn num_target_elements(&self) -> usize {
        self.target_seqs.iter().map(Vec::len).sum()
    }

    /// Token slots the batch occupies once padded to its longest sequence.
    pub fn padded_num_elements(&self) -> usize {
        let longest = self
            .source_seqs
            .iter()
            .chain(&self.target_seqs)
            .map(Vec::len)
            .max()
            .unwrap_or(0);
        self.batch_size() * longest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(source: &str, target: &str) -> Seq2SeqExample {
        Seq2SeqExample {
            source_text: source.to_string(),
            target_text: target.to_string(),
            source: source.bytes().map(u32::from).collect(),
            target: target.bytes().map(u32::from).collect(),
        }
    }

    #[test]
    fn collate_keeps_text_aligned_with_sequences() {
        let batch = Seq2SeqBatch::collate(vec![example("ab", "xyz"), example("c", "w")]);

        assert_eq!(batch.batch_size(), 2);
        assert_eq!(batch.num_source_elements(), 3);
        assert_eq!(batch.num_target_elements(), 4);
        assert_eq!(batch.padded_num_elements(), 6);
        assert_eq!(
            batch.example,
            Some(json!({"source_text": ["ab", "c"], "target_text": ["xyz", "w"]}))
        );
    }

    #[test]
    fn empty_batch_has_no_elements() {
        let batch = Seq2SeqBatch::default();
        assert_eq!(batch.batch_size(), 0);
        assert_eq!(batch.padded_num_elements(), 0);
    }
}
