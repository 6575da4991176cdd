//! Root-identifier heuristics.
//!
//! Publishers re-submit the same contract with the running amendment count
//! appended to its identifier (`...00`, `...01`, ...). Stripping that suffix
//! yields a root shared by every submission of one agreement.

use serde::{Deserialize, Serialize};

/// Characters replaced by `_` when cleaning a published identifier.
const NOISE_CHARS: [char; 5] = [' ', ',', '\\', '.', '/'];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootIdentifier {
    pub root_id: String,
    pub expected_suffix: String,
    pub suffix_stripped: bool,
}

/// Swappable identity rule used to group re-submitted contracts.
pub trait IdentityHeuristic: Send + Sync {
    fn root_of(&self, cleaned_id: &str, amendment_count: usize) -> RootIdentifier;
}

/// Strips a zero-padded amendment-count suffix when the identifier ends with it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuffixStripping;

impl IdentityHeuristic for SuffixStripping {
    fn root_of(&self, cleaned_id: &str, amendment_count: usize) -> RootIdentifier {
        normalize_identifier(cleaned_id, amendment_count)
    }
}

pub fn amendment_suffix(amendment_count: usize) -> String {
    format!("{amendment_count:02}")
}

/// Replace punctuation noise with `_`. Returns the cleaned identifier and
/// whether anything was changed.
pub fn clean_identifier(raw_id: &str) -> (String, bool) {
    let cleaned: String = raw_id
        .chars()
        .map(|c| if NOISE_CHARS.contains(&c) { '_' } else { c })
        .collect();
    let changed = cleaned != raw_id;
    (cleaned, changed)
}

/// Never strips the whole identifier: an id made only of the suffix is its own root.
pub fn normalize_identifier(cleaned_id: &str, amendment_count: usize) -> RootIdentifier {
    let expected_suffix = amendment_suffix(amendment_count);
    match cleaned_id.strip_suffix(expected_suffix.as_str()) {
        Some(root) if !root.is_empty() => RootIdentifier {
            root_id: root.to_string(),
            expected_suffix,
            suffix_stripped: true,
        },
        _ => RootIdentifier {
            root_id: cleaned_id.to_string(),
            expected_suffix,
            suffix_stripped: false,
        },
    }
}

pub fn uid(buyer_id: &str, root_id: &str) -> String {
    format!("{buyer_id}{root_id}")
}
