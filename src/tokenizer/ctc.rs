//! CTC label collapsing.
//!
//! CTC models emit one label per encoder frame, where a dedicated blank
//! label separates repeats. Decoding removes blanks and collapses
//! consecutive duplicates before the labels are mapped to strings.

use super::BpeTokenizer;

/// Collapse a frame-level label sequence.
///
/// Removes `blank_id` and collapses consecutive duplicates:
/// `[b, 1, 1, b, 2, b, b, 3]` becomes `[1, 2, 3]`.
pub fn collapse(labels: &[u32], blank_id: u32) -> Vec<u32> {
    let mut out = Vec::new();
    let mut prev: Option<u32> = None;
    for &label in labels {
        if label == blank_id {
            prev = None;
            continue;
        }
        if prev != Some(label) {
            out.push(label);
        }
        prev = Some(label);
    }
    out
}

/// Collapse frame labels and decode them through the vocabulary.
pub fn decode(tokenizer: &BpeTokenizer, labels: &[u32], blank_id: u32) -> String {
    let collapsed = collapse(labels, blank_id);
    tokenizer.decode(&collapsed, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokenizer::test_vocab;

    #[test]
    fn test_collapse_reference_sequence() {
        let b = 99;
        assert_eq!(collapse(&[b, 1, 1, b, 2, b, b, 3], b), vec![1, 2, 3]);
    }

    #[test]
    fn test_collapse_keeps_blank_separated_repeats() {
        let b = 0;
        // blank between equal labels means the label genuinely repeats
        assert_eq!(collapse(&[5, b, 5], b), vec![5, 5]);
        // no blank between them means one emission
        assert_eq!(collapse(&[5, 5], b), vec![5]);
    }

    #[test]
    fn test_collapse_all_blank_is_empty() {
        assert!(collapse(&[7, 7, 7], 7).is_empty());
        assert!(collapse(&[], 7).is_empty());
    }

    #[test]
    fn test_decode_maps_labels_to_text() {
        let tok = BpeTokenizer::from_json(&test_vocab::vocab_json(&[])).unwrap();
        let blank = tok.vocab_size() as u32;
        // 'h' = 0x68, 'i' = 0x69; IDs offset by 3 specials.
        let labels = [blank, 0x68 + 3, 0x68 + 3, blank, 0x69 + 3, blank];
        assert_eq!(decode(&tok, &labels, blank), "hi");
    }
}
