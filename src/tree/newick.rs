use super::{TreeAssembler, TreeNode};
use crate::error::{MsaError, Result};
use rustc_hash::FxHashMap;

/// Subtree as written in the Newick text.
#[derive(Debug)]
struct ParsedNode {
    name: Option<String>,
    length: f32,
    children: Vec<ParsedNode>,
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Parser {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn error(&self, msg: &str) -> MsaError {
        MsaError::GuideTree(format!("Newick parse error at byte {}: {}", self.pos, msg))
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_whitespace();
        self.input.get(self.pos).copied()
    }

    fn parse_tree(&mut self) -> Result<ParsedNode> {
        let root = self.parse_subtree()?;
        match self.peek() {
            Some(b';') => {
                self.pos += 1;
            }
            None => {}
            Some(_) => return Err(self.error("expected ';'")),
        }
        if self.peek().is_some() {
            return Err(self.error("trailing characters after ';'"));
        }
        Ok(root)
    }

    fn parse_subtree(&mut self) -> Result<ParsedNode> {
        let mut children = Vec::new();
        if self.peek() == Some(b'(') {
            self.pos += 1;
            loop {
                children.push(self.parse_subtree()?);
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b')') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("expected ',' or ')'")),
                }
            }
        }
        let name = self.parse_name();
        let length = self.parse_length()?;
        if children.is_empty() && name.is_none() {
            return Err(self.error("leaf without a name"));
        }
        Ok(ParsedNode {
            name,
            length,
            children,
        })
    }

    fn parse_name(&mut self) -> Option<String> {
        self.skip_whitespace();
        let start = self.pos;
        while self.pos < self.input.len() && !b"(),:;".contains(&self.input[self.pos]) {
            self.pos += 1;
        }
        let name = String::from_utf8_lossy(&self.input[start..self.pos]).trim().to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    fn parse_length(&mut self) -> Result<f32> {
        if self.peek() != Some(b':') {
            return Ok(0.0);
        }
        self.pos += 1;
        self.skip_whitespace();
        let start = self.pos;
        while self.pos < self.input.len() && !b"(),:;".contains(&self.input[self.pos]) {
            self.pos += 1;
        }
        let text = String::from_utf8_lossy(&self.input[start..self.pos]).trim().to_string();
        text.parse::<f32>()
            .map_err(|_| self.error(&format!("invalid branch length '{}'", text)))
    }
}

/// Build tree nodes from Newick text whose leaf labels are exactly `names`.
/// Multifurcations are resolved into a left-to-right cascade of binary joins.
pub fn assemble(newick: &str, names: &[String]) -> Result<Vec<TreeNode>> {
    let parsed = Parser::new(newick).parse_tree()?;

    let index: FxHashMap<&str, usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();
    let mut seen = vec![false; names.len()];
    let mut tree = TreeAssembler::with_leaves(names.len());

    let root = place(&parsed, &index, &mut seen, &mut tree)?;
    if let Some(missing) = seen.iter().position(|&s| !s) {
        return Err(MsaError::GuideTree(format!(
            "sequence '{}' is missing from the guide tree",
            names[missing]
        )));
    }

    let nodes = tree.into_nodes();
    debug_assert_eq!(root, nodes.len() - 1);
    Ok(nodes)
}

fn place(
    node: &ParsedNode,
    index: &FxHashMap<&str, usize>,
    seen: &mut [bool],
    tree: &mut TreeAssembler,
) -> Result<usize> {
    if node.children.is_empty() {
        let name = node.name.as_deref().unwrap_or_default();
        let &leaf = index
            .get(name)
            .ok_or_else(|| MsaError::GuideTree(format!("unknown sequence '{}' in guide tree", name)))?;
        if seen[leaf] {
            return Err(MsaError::GuideTree(format!("sequence '{}' appears twice in guide tree", name)));
        }
        seen[leaf] = true;
        return Ok(leaf);
    }

    let mut placed = Vec::with_capacity(node.children.len());
    for child in &node.children {
        placed.push((place(child, index, seen, tree)?, child.length));
    }

    let mut iter = placed.into_iter();
    let first = iter.next().ok_or_else(|| MsaError::GuideTree("empty subtree".into()))?;
    let mut current = first;
    for next in iter {
        current = (tree.join_with_lengths(current, next), 0.0);
    }
    Ok(current.0)
}
