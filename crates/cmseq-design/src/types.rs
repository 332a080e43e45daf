use crate::error::{DesignError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Number of semantic categories, and therefore the length of every sequence.
pub const SEQUENCE_LEN: usize = 6;

/// Identifier of one sequence: a single uppercase letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Label(char);

impl Label {
    pub fn new(c: char) -> Result<Self> {
        if c.is_ascii_uppercase() {
            Ok(Label(c))
        } else {
            Err(DesignError::InvalidDesign(format!(
                "sequence label must be an uppercase ASCII letter, got '{}'",
                c
            )))
        }
    }

    /// Constant tables only ever hold uppercase letters.
    pub(crate) const fn from_table(c: char) -> Self {
        Label(c)
    }

    /// The first `n` labels, `A`, `B`, ...
    pub fn first(n: usize) -> Result<Vec<Label>> {
        if n > 26 {
            return Err(DesignError::InvalidDesign(format!(
                "at most 26 sequence labels are supported, got {}",
                n
            )));
        }
        Ok((0..n as u8).map(|i| Label((b'A' + i) as char)).collect())
    }

    pub fn as_char(self) -> char {
        self.0
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Label {
    type Error = DesignError;

    fn try_from(value: String) -> Result<Self> {
        let mut chars = value.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Label::new(c),
            _ => Err(DesignError::InvalidDesign(format!(
                "sequence label must be a single letter, got '{}'",
                value
            ))),
        }
    }
}

impl From<Label> for String {
    fn from(value: Label) -> Self {
        value.0.to_string()
    }
}

/// Presentation form of a stimulus or a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Modality {
    #[serde(rename = "img")]
    Image,
    #[serde(rename = "txt")]
    Text,
}

impl Modality {
    pub fn as_str(self) -> &'static str {
        match self {
            Modality::Image => "img",
            Modality::Text => "txt",
        }
    }

    pub fn other(self) -> Modality {
        match self {
            Modality::Image => Modality::Text,
            Modality::Text => Modality::Image,
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ItemId = String;

/// Concrete item sequences keyed by label. Built once per session, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SequenceSet {
    sequences: BTreeMap<Label, Vec<ItemId>>,
}

impl SequenceSet {
    pub(crate) fn from_map(sequences: BTreeMap<Label, Vec<ItemId>>) -> Self {
        Self { sequences }
    }

    pub fn len(&self) -> usize {
        self.sequences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    pub fn labels(&self) -> Vec<Label> {
        self.sequences.keys().copied().collect()
    }

    pub fn get(&self, label: Label) -> Option<&[ItemId]> {
        self.sequences.get(&label).map(|v| v.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (Label, &[ItemId])> {
        self.sequences.iter().map(|(l, v)| (*l, v.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_rejects_lowercase_and_multichar() {
        assert!(Label::new('a').is_err());
        assert!(Label::try_from("AB".to_string()).is_err());
        assert!(Label::try_from(String::new()).is_err());
        assert_eq!(Label::try_from("C".to_string()).expect("label").as_char(), 'C');
    }

    #[test]
    fn first_labels_are_alphabetical() {
        let labels = Label::first(3).expect("labels");
        let chars: Vec<char> = labels.iter().map(|l| l.as_char()).collect();
        assert_eq!(chars, vec!['A', 'B', 'C']);
        assert!(Label::first(27).is_err());
    }

    #[test]
    fn modality_other_flips() {
        assert_eq!(Modality::Image.other(), Modality::Text);
        assert_eq!(Modality::Text.other(), Modality::Image);
        assert_eq!(Modality::Text.to_string(), "txt");
    }
}
