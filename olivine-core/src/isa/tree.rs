//! Construction of the decoder tree: instruction declarations grouped by shared mask prefixes.

use super::schema::InstructionDecl;
use log::debug;

/// A node of the decoder tree.
///
/// Each inner node caches the bitwise AND of the masks of all leaves beneath it, restricted to
/// the bits on which their patterns agree, along with the agreed pattern values. The compiler
/// uses this cached prefix when testing whether to enter the node.
#[derive(Debug)]
pub enum DecoderTree {
    /// Dispatch on the value of `switch_mask`: child `i` is entered when
    /// `word & switch_mask == keys[i]`.
    Switch(SwitchNode),
    /// Try each child in order; a child is entered when the word matches its cached prefix.
    Branch(BranchNode),
    /// A single declaration.
    Leaf(LeafNode),
}

#[derive(Debug)]
pub struct SwitchNode {
    pub switch_mask: u32,
    pub keys: Vec<u32>,
    pub children: Vec<DecoderTree>,
    pub mask: u32,
    pub pattern: u32,
}

#[derive(Debug)]
pub struct BranchNode {
    pub children: Vec<DecoderTree>,
    pub mask: u32,
    pub pattern: u32,
}

#[derive(Debug)]
pub struct LeafNode {
    pub decl: InstructionDecl,
}

impl DecoderTree {
    /// Build the decoder tree for `decls`.
    ///
    /// The declarations must already be validated (see
    /// [`InstructionSet::parse`](super::schema::InstructionSet::parse)); building panics on
    /// ambiguity, since a malformed instruction schema is a host-level startup failure.
    pub fn build(decls: &[InstructionDecl]) -> Self {
        assert!(!decls.is_empty(), "cannot build a decoder for no instructions");
        let tree = build_group(decls.to_vec(), 0);
        let tree = collapse_small_switches(tree);
        debug!(
            leaves = decls.len();
            "Built decoder tree"
        );
        tree
    }

    /// The bits on which every leaf below this node agrees (tested and equal).
    pub fn mask(&self) -> u32 {
        match self {
            DecoderTree::Switch(node) => node.mask,
            DecoderTree::Branch(node) => node.mask,
            DecoderTree::Leaf(node) => node.decl.pattern_mask,
        }
    }

    /// The agreed values of the bits in [`mask`](Self::mask).
    pub fn pattern(&self) -> u32 {
        match self {
            DecoderTree::Switch(node) => node.pattern,
            DecoderTree::Branch(node) => node.pattern,
            DecoderTree::Leaf(node) => node.decl.pattern,
        }
    }

    /// Iterate over all declarations below this node.
    pub fn leaves(&self) -> Box<dyn Iterator<Item = &InstructionDecl> + '_> {
        match self {
            DecoderTree::Switch(node) => {
                Box::new(node.children.iter().flat_map(|child| child.leaves()))
            }
            DecoderTree::Branch(node) => {
                Box::new(node.children.iter().flat_map(|child| child.leaves()))
            }
            DecoderTree::Leaf(node) => Box::new(std::iter::once(&node.decl)),
        }
    }
}

/// Compute the agreed (mask, pattern) prefix over a set of children.
fn agreed_prefix(children: &[DecoderTree]) -> (u32, u32) {
    let mut mask = children
        .iter()
        .fold(u32::MAX, |acc, child| acc & child.mask());
    let first = children[0].pattern();
    for child in &children[1..] {
        mask &= !(first ^ child.pattern());
    }
    (mask, first & mask)
}

fn build_group(mut decls: Vec<InstructionDecl>, group_mask: u32) -> DecoderTree {
    // A group of one is a leaf; it still needs a branch wrapper if it tests more bits than the
    // path to it has already committed.
    if decls.len() == 1 {
        let decl = decls.pop().unwrap();
        let leaf = DecoderTree::Leaf(LeafNode { decl });
        return match leaf.mask() == group_mask {
            true => leaf,
            false => {
                let (mask, pattern) = (leaf.mask(), leaf.pattern());
                DecoderTree::Branch(BranchNode {
                    children: vec![leaf],
                    mask,
                    pattern,
                })
            }
        };
    }

    let mask_intersect = decls
        .iter()
        .fold(u32::MAX, |acc, decl| acc & decl.pattern_mask);

    // Partition the declarations by their pattern restricted to the shared mask.
    let mut buckets: Vec<(u32, Vec<InstructionDecl>)> = Vec::new();
    for decl in decls {
        let key = decl.pattern & mask_intersect;
        match buckets.iter_mut().find(|(k, _)| *k == key) {
            Some((_, bucket)) => bucket.push(decl),
            None => buckets.push((key, vec![decl])),
        }
    }

    if buckets.len() == 1 {
        // All patterns agree on the shared mask; order the declarations most-specific first and
        // try them in sequence.
        let (_, mut bucket) = buckets.pop().unwrap();
        bucket.sort_by(|a, b| {
            b.pattern_mask
                .count_ones()
                .cmp(&a.pattern_mask.count_ones())
        });
        verify_domination(&bucket);
        let children: Vec<_> = bucket
            .into_iter()
            .map(|decl| DecoderTree::Leaf(LeafNode { decl }))
            .collect();
        let (mask, pattern) = agreed_prefix(&children);
        return DecoderTree::Branch(BranchNode {
            children,
            mask,
            pattern,
        });
    }

    // Sort the bucket keys as unsigned integers for a stable, reproducible dispatch order.
    buckets.sort_by_key(|&(key, _)| key);
    let keys = buckets.iter().map(|&(key, _)| key).collect();
    let children: Vec<_> = buckets
        .into_iter()
        .map(|(_, bucket)| build_group(bucket, mask_intersect))
        .collect();
    let (mask, pattern) = agreed_prefix(&children);
    DecoderTree::Switch(SwitchNode {
        switch_mask: mask_intersect,
        keys,
        children,
        mask,
        pattern,
    })
}

/// Assert the dominated-ambiguity rule for a specificity chain: two declarations whose patterns
/// agree on their shared mask are only allowed if one's mask contains the other's, or if a
/// strictly more specific declaration in the chain covers their whole overlap.
fn verify_domination(chain: &[InstructionDecl]) {
    for (i, a) in chain.iter().enumerate() {
        for b in &chain[i + 1..] {
            let shared = a.pattern_mask & b.pattern_mask;
            if a.pattern & shared != b.pattern & shared {
                continue;
            }
            if a.pattern_mask & b.pattern_mask == b.pattern_mask {
                // `a` is at least as specific; it is tried first and wins.
                continue;
            }
            let combined = a.pattern_mask | b.pattern_mask;
            let overlap_pattern = a.pattern | b.pattern;
            let dominated = chain.iter().any(|c| {
                c.pattern_mask == combined
                    && c.pattern_mask != a.pattern_mask
                    && c.pattern_mask != b.pattern_mask
                    && c.pattern == overlap_pattern & c.pattern_mask
            });
            assert!(
                dominated,
                "declarations `{}` and `{}` are ambiguous",
                a.name, b.name,
            );
        }
    }
}

/// Collapse switches with fewer than three children into branches, reducing dispatch overhead.
fn collapse_small_switches(tree: DecoderTree) -> DecoderTree {
    match tree {
        DecoderTree::Switch(SwitchNode {
            switch_mask,
            keys,
            children,
            mask,
            pattern,
        }) => {
            let children: Vec<_> = children.into_iter().map(collapse_small_switches).collect();
            if children.len() < 3 {
                DecoderTree::Branch(BranchNode {
                    children,
                    mask,
                    pattern,
                })
            } else {
                DecoderTree::Switch(SwitchNode {
                    switch_mask,
                    keys,
                    children,
                    mask,
                    pattern,
                })
            }
        }
        DecoderTree::Branch(node) => DecoderTree::Branch(BranchNode {
            children: node
                .children
                .into_iter()
                .map(collapse_small_switches)
                .collect(),
            mask: node.mask,
            pattern: node.pattern,
        }),
        leaf => leaf,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::schema::InstructionSet;

    fn build(text: &str) -> DecoderTree {
        DecoderTree::build(InstructionSet::parse(text).unwrap().decls())
    }

    #[test]
    fn test_single_declaration_wraps_in_branch() {
        let tree = build("inst ECALL | 000000000000_00000_000_00000_1110011 |\n");
        // The group mask starts empty, so the full pattern still has to be tested.
        match tree {
            DecoderTree::Branch(node) => {
                assert_eq!(1, node.children.len());
                assert_eq!(0xFFFF_FFFF, node.mask);
            }
            _ => panic!("expected a branch wrapper"),
        }
    }

    #[test]
    fn test_opcode_switch() {
        let tree = build(
            "field rd 11:7\n\
             field imm s31:12@12\n\
             field rs1 19:15\n\
             field i s31:20\n\
             inst LUI | ...._...._...._...._...._....._0110111 | rd imm\n\
             inst AUIPC | ...._...._...._...._...._....._0010111 | rd imm\n\
             inst ADDI | ............_....._000_....._0010011 | rd rs1 i\n\
             inst ANDI | ............_....._111_....._0010011 | rd rs1 i\n\
             inst XORI | ............_....._100_....._0010011 | rd rs1 i\n",
        );
        let DecoderTree::Switch(node) = &tree else {
            panic!("expected a switch on the opcode");
        };
        assert_eq!(0x7F, node.switch_mask);
        assert_eq!(3, node.children.len());
        // Keys are sorted as unsigned integers.
        assert_eq!(vec![0b0010011, 0b0010111, 0b0110111], node.keys);
        // The OP-IMM bucket switches further on funct3 (three children keeps it a switch).
        let DecoderTree::Switch(op_imm) = &node.children[0] else {
            panic!("expected a nested switch on funct3");
        };
        assert_eq!(0x707F, op_imm.switch_mask);
    }

    #[test]
    fn test_small_switch_collapses_to_branch() {
        let tree = build(
            "field rd 11:7\n\
             field imm s31:12@12\n\
             inst LUI | ...._...._...._...._...._....._0110111 | rd imm\n\
             inst AUIPC | ...._...._...._...._...._....._0010111 | rd imm\n",
        );
        assert!(matches!(tree, DecoderTree::Branch(_)));
    }

    #[test]
    fn test_specificity_chain_orders_most_specific_first() {
        let tree = build(
            "field rs1 19:15\n\
             field rd 11:7\n\
             inst ANY | 000000000000_....._000_....._1110011 | rs1 rd\n\
             inst SPECIFIC | 000000000000_00000_000_00000_1110011 |\n",
        );
        let DecoderTree::Branch(node) = &tree else {
            panic!("expected a specificity chain");
        };
        let names: Vec<_> = node
            .children
            .iter()
            .flat_map(|child| child.leaves())
            .map(|decl| decl.name.as_str())
            .collect();
        assert_eq!(vec!["SPECIFIC", "ANY"], names);
    }

    #[test]
    fn test_dominated_chain_builds() {
        // A and B overlap, but C covers the whole intersection and is tried first.
        let tree = build(
            "field rs2 24:20\n\
             field f3 14:12\n\
             inst A | 0000000_....._00000_000_00000_0000011 | rs2\n\
             inst B | 0000000_00000_00000_..._00000_0000011 | f3\n\
             inst C | 0000000_00000_00000_000_00000_0000011 |\n",
        );
        let names: Vec<_> = tree.leaves().map(|decl| decl.name.as_str()).collect();
        // Sorted most-specific first: C tests all 32 bits, B 29, A 27.
        assert_eq!(vec!["C", "B", "A"], names);
    }

    #[test]
    fn test_leaves_roundtrip() {
        let tree = build(
            "field rd 11:7\n\
             field imm s31:12@12\n\
             inst LUI | ...._...._...._...._...._....._0110111 | rd imm\n\
             inst AUIPC | ...._...._...._...._...._....._0010111 | rd imm\n",
        );
        assert_eq!(2, tree.leaves().count());
    }
}
