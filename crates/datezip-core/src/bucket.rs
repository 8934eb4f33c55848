use std::collections::BTreeMap;

use crate::date::CaptureDate;

/// Reserved top-level key for results without a usable capture date.
/// Never collides with a year key, which is always numeric.
pub const NO_DATE_KEY: &str = "no_date";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeResult {
    pub output_name: String,
    pub data: Vec<u8>,
    pub date: Option<CaptureDate>,
}

/// A node of the bucket tree. Dated branches are three maps deep
/// (year/month/day), the `no_date` branch is a list directly under the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Branch(BTreeMap<String, Node>),
    Leaf(Vec<TranscodeResult>),
}

impl Node {
    fn branch_mut(&mut self) -> &mut BTreeMap<String, Node> {
        match self {
            Node::Branch(map) => map,
            Node::Leaf(_) => unreachable!("leaf above day depth"),
        }
    }

    fn leaf_mut(&mut self) -> &mut Vec<TranscodeResult> {
        match self {
            Node::Leaf(items) => items,
            Node::Branch(_) => unreachable!("branch at day depth"),
        }
    }
}

/// Results of one batch, grouped by capture date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketTree {
    root: BTreeMap<String, Node>,
}

impl Default for BucketTree {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketTree {
    pub fn new() -> Self {
        Self {
            root: BTreeMap::new(),
        }
    }

    /// Append `result` to its date leaf (or the `no_date` leaf).
    /// Append-only: inserting the same result twice yields two entries.
    pub fn insert(&mut self, mut result: TranscodeResult, date: Option<CaptureDate>) {
        result.date = date;
        let leaf = match date {
            Some(d) => {
                let [y, m, day] = d.keys();
                self.root
                    .entry(y)
                    .or_insert_with(|| Node::Branch(BTreeMap::new()))
                    .branch_mut()
                    .entry(m)
                    .or_insert_with(|| Node::Branch(BTreeMap::new()))
                    .branch_mut()
                    .entry(day)
                    .or_insert_with(|| Node::Leaf(Vec::new()))
                    .leaf_mut()
            }
            None => self
                .root
                .entry(NO_DATE_KEY.to_string())
                .or_insert_with(|| Node::Leaf(Vec::new()))
                .leaf_mut(),
        };
        leaf.push(result);
    }

    /// Sum of all leaf list lengths.
    pub fn len(&self) -> usize {
        self.walk().count()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Every result with the key path leading to its leaf, depth-first in key
    /// order. Descends until a list is met, whatever the depth.
    pub fn walk(&self) -> Walk<'_> {
        let mut stack = Vec::new();
        for (key, node) in self.root.iter().rev() {
            stack.push((vec![key.as_str()], node));
        }
        Walk {
            stack,
            current: None,
        }
    }

    /// First result met by walking down the tree.
    pub fn first(&self) -> Option<&TranscodeResult> {
        self.walk().next().map(|(_, r)| r)
    }

}

pub struct Walk<'a> {
    stack: Vec<(Vec<&'a str>, &'a Node)>,
    current: Option<(Vec<&'a str>, std::slice::Iter<'a, TranscodeResult>)>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = (Vec<&'a str>, &'a TranscodeResult);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((path, items)) = &mut self.current {
                if let Some(item) = items.next() {
                    return Some((path.clone(), item));
                }
                self.current = None;
            }

            let (path, node) = self.stack.pop()?;
            match node {
                Node::Leaf(items) => self.current = Some((path, items.iter())),
                Node::Branch(map) => {
                    for (key, child) in map.iter().rev() {
                        let mut child_path = path.clone();
                        child_path.push(key.as_str());
                        self.stack.push((child_path, child));
                    }
                }
            }
        }
    }
}
