//! Parser for the declarative instruction-set description.
//!
//! The description is a line-oriented text format with three statement kinds:
//!
//! ```text
//! field <name> <mapping>+ [| +<addend>]
//! inst <name> [<display>] | <bitpattern> | <arg>*
//! illegal <name> | <bitpattern>
//! nop <name> | <bitpattern> | <arg>*
//! ```
//!
//! A mapping is `[s]<msb>[:<lsb>][@<dstLSB>]`; the `s` prefix requests sign extension from the
//! slice's top bit. Bit patterns are written most-significant bit first using `0`/`1` for fixed
//! bits, `*` for unused bits, and `.` for bits covered by an argument field. Underscores and
//! spaces inside a pattern are ignored. A pattern describing exactly 16 bits declares a
//! compressed instruction.

use crate::bits;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// A single bit-slice contribution to a field value.
///
/// The instruction-word bits `src_msb..=src_lsb` land at `dst_lsb` in the field value. If
/// `sign_extend` is set, the value is sign-extended from the top bit of the slice after
/// placement.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FieldMapping {
    pub src_msb: u32,
    pub src_lsb: u32,
    pub dst_lsb: u32,
    pub sign_extend: bool,
}

impl FieldMapping {
    fn source_bits(&self) -> u32 {
        bits::mask(self.src_msb - self.src_lsb + 1) << self.src_lsb
    }
}

/// Post-processing applied to a field value after all mappings are combined.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PostProcess {
    /// Add a constant (e.g. `+8` for the compressed-register encodings).
    Add(u32),
}

/// A named argument field: where its bits live in the instruction word and how to combine them.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Field {
    pub name: String,
    pub mappings: Vec<FieldMapping>,
    pub post: Option<PostProcess>,
}

impl Field {
    /// Extract this field's value from an instruction word.
    ///
    /// This is position-independent: hoisting the extraction to an ancestor decoder node yields
    /// the same value as extracting at the leaf.
    pub fn extract(&self, word: u32) -> u32 {
        let mut value = 0;
        for mapping in &self.mappings {
            let slice = bits::extract(word, mapping.src_msb, mapping.src_lsb) << mapping.dst_lsb;
            value |= match mapping.sign_extend {
                true => bits::sign_extend(
                    slice,
                    mapping.src_msb - mapping.src_lsb + mapping.dst_lsb,
                ),
                false => slice,
            };
        }
        match self.post {
            Some(PostProcess::Add(addend)) => value.wrapping_add(addend),
            None => value,
        }
    }

    /// The instruction-word bits this field reads.
    pub fn source_bits(&self) -> u32 {
        self.mappings
            .iter()
            .fold(0, |acc, mapping| acc | mapping.source_bits())
    }
}

/// The three kinds of declaration.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeclKind {
    /// An instruction with a handler.
    Regular,
    /// An encoding that is architecturally an illegal instruction.
    Illegal,
    /// An encoding executed as a no-op (HINT encodings).
    Hint,
}

/// A single instruction declaration.
#[derive(Debug, Clone)]
pub struct InstructionDecl {
    pub name: String,
    /// Human-readable mnemonic; defaults to the name.
    pub display: String,
    pub kind: DeclKind,
    /// Instruction size in bytes: 2 (compressed) or 4.
    pub size: u32,
    /// The fixed bits' values.
    pub pattern: u32,
    /// The positions of the fixed bits.
    pub pattern_mask: u32,
    /// Bits that are neither fixed nor read by any argument.
    pub unused_bits: u32,
    /// Ordered argument fields.
    pub args: Vec<Field>,
}

impl InstructionDecl {
    /// Returns `true` if `word` matches this declaration's fixed bits.
    pub fn matches(&self, word: u32) -> bool {
        word & self.pattern_mask == self.pattern
    }

    /// The union of all argument fields' source bits.
    pub fn argument_bits(&self) -> u32 {
        self.args
            .iter()
            .fold(0, |acc, field| acc | field.source_bits())
    }

    /// Mask covering every described bit of the instruction word.
    pub fn word_mask(&self) -> u32 {
        bits::mask(self.size * 8)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.args.iter().find(|field| field.name == name)
    }
}

impl fmt::Display for InstructionDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display)
    }
}

/// A parsed and validated instruction-set description.
#[derive(Debug)]
pub struct InstructionSet {
    decls: Vec<InstructionDecl>,
}

impl InstructionSet {
    /// Parse and validate a description.
    ///
    /// Validation enforces, per declaration, that fixed bits and argument bits are disjoint and
    /// that every described bit is accounted for, and across declarations that all pairs are
    /// unambiguous under the more-specific-wins rule.
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let mut fields: HashMap<String, Field> = HashMap::new();
        let mut decls = Vec::new();
        for (index, raw_line) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let keyword = line.split_whitespace().next().unwrap();
            match keyword {
                "field" => {
                    let field = parse_field(line, line_no)?;
                    if fields.insert(field.name.clone(), field).is_some() {
                        return Err(SchemaError::DuplicateField { line: line_no });
                    }
                }
                "inst" | "illegal" | "nop" => {
                    let kind = match keyword {
                        "inst" => DeclKind::Regular,
                        "illegal" => DeclKind::Illegal,
                        _ => DeclKind::Hint,
                    };
                    decls.push(parse_decl(line, line_no, kind, &fields)?);
                }
                _ => return Err(SchemaError::UnknownStatement { line: line_no }),
            }
        }
        let set = Self { decls };
        set.check_ambiguity()?;
        Ok(set)
    }

    pub fn decls(&self) -> &[InstructionDecl] {
        &self.decls
    }

    pub fn decl(&self, name: &str) -> Option<&InstructionDecl> {
        self.decls.iter().find(|decl| decl.name == name)
    }

    /// Check that all declaration pairs are unambiguous.
    ///
    /// Two declarations whose patterns can match the same word are allowed only if one is
    /// strictly more specific (its mask is a strict superset), or if every such word is covered
    /// by a third declaration strictly more specific than both.
    fn check_ambiguity(&self) -> Result<(), SchemaError> {
        for (i, a) in self.decls.iter().enumerate() {
            for b in &self.decls[i + 1..] {
                let shared = a.pattern_mask & b.pattern_mask;
                if a.pattern & shared != b.pattern & shared {
                    // The patterns disagree somewhere in the intersection.
                    continue;
                }
                let combined = a.pattern_mask | b.pattern_mask;
                if combined == a.pattern_mask || combined == b.pattern_mask {
                    // One dominates the other; the more specific declaration wins.
                    continue;
                }
                // Incomparable masks with agreeing patterns: a strictly more specific third
                // declaration must cover the whole overlap.
                let overlap_pattern = a.pattern | b.pattern;
                let dominated = self.decls.iter().any(|c| {
                    c.pattern_mask & combined == c.pattern_mask
                        && c.pattern_mask & a.pattern_mask == a.pattern_mask
                        && c.pattern_mask & b.pattern_mask == b.pattern_mask
                        && c.pattern_mask != a.pattern_mask
                        && c.pattern_mask != b.pattern_mask
                        && c.pattern == overlap_pattern & c.pattern_mask
                });
                if !dominated {
                    return Err(SchemaError::AmbiguousDeclarations {
                        first: a.name.clone(),
                        second: b.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn parse_field(line: &str, line_no: usize) -> Result<Field, SchemaError> {
    let (head, post) = match line.split_once('|') {
        Some((head, post)) => (head, Some(post.trim())),
        None => (line, None),
    };
    let mut tokens = head.split_whitespace();
    tokens.next(); // "field"
    let name = tokens
        .next()
        .ok_or(SchemaError::MalformedStatement { line: line_no })?
        .to_owned();
    let mappings = tokens
        .map(|token| parse_mapping(token, line_no))
        .collect::<Result<Vec<_>, _>>()?;
    if mappings.is_empty() {
        return Err(SchemaError::MalformedStatement { line: line_no });
    }
    let post = post
        .map(|token| match token.strip_prefix('+') {
            Some(addend) => addend
                .trim()
                .parse()
                .map(PostProcess::Add)
                .map_err(|_| SchemaError::MalformedStatement { line: line_no }),
            None => Err(SchemaError::MalformedStatement { line: line_no }),
        })
        .transpose()?;
    Ok(Field {
        name,
        mappings,
        post,
    })
}

fn parse_mapping(token: &str, line_no: usize) -> Result<FieldMapping, SchemaError> {
    let malformed = || SchemaError::MalformedStatement { line: line_no };
    let (sign_extend, rest) = match token.strip_prefix('s') {
        Some(rest) => (true, rest),
        None => (false, token),
    };
    let (src, dst_lsb) = match rest.split_once('@') {
        Some((src, dst)) => (src, dst.parse().map_err(|_| malformed())?),
        None => (rest, 0),
    };
    let (src_msb, src_lsb) = match src.split_once(':') {
        Some((msb, lsb)) => (
            msb.parse().map_err(|_| malformed())?,
            lsb.parse().map_err(|_| malformed())?,
        ),
        None => {
            let bit = src.parse().map_err(|_| malformed())?;
            (bit, bit)
        }
    };
    if src_msb < src_lsb || src_msb > 31 || dst_lsb > 31 {
        return Err(malformed());
    }
    Ok(FieldMapping {
        src_msb,
        src_lsb,
        dst_lsb,
        sign_extend,
    })
}

fn parse_decl(
    line: &str,
    line_no: usize,
    kind: DeclKind,
    fields: &HashMap<String, Field>,
) -> Result<InstructionDecl, SchemaError> {
    let mut parts = line.splitn(3, '|');
    let head = parts
        .next()
        .ok_or(SchemaError::MalformedStatement { line: line_no })?;
    let pattern_text = parts
        .next()
        .ok_or(SchemaError::MalformedStatement { line: line_no })?;
    let arg_text = parts.next().unwrap_or("");

    let mut head_tokens = head.split_whitespace();
    head_tokens.next(); // keyword
    let name = head_tokens
        .next()
        .ok_or(SchemaError::MalformedStatement { line: line_no })?
        .to_owned();
    let display = head_tokens.next().map(str::to_owned).unwrap_or_else(|| name.clone());

    let mut pattern = 0u32;
    let mut pattern_mask = 0u32;
    let mut unused_bits = 0u32;
    let mut dot_bits = 0u32;
    let described: Vec<char> = pattern_text
        .chars()
        .filter(|c| !matches!(c, ' ' | '_'))
        .collect();
    let size = match described.len() {
        16 => 2,
        32 => 4,
        n => return Err(SchemaError::BadPatternWidth { line: line_no, bits: n }),
    };
    for (i, c) in described.iter().enumerate() {
        let bit = 1u32 << (described.len() - 1 - i);
        match c {
            '0' => pattern_mask |= bit,
            '1' => {
                pattern_mask |= bit;
                pattern |= bit;
            }
            '*' => unused_bits |= bit,
            '.' => dot_bits |= bit,
            _ => return Err(SchemaError::MalformedStatement { line: line_no }),
        }
    }

    let args = arg_text
        .split_whitespace()
        .map(|arg| {
            fields
                .get(arg)
                .cloned()
                .ok_or_else(|| SchemaError::UnknownField {
                    line: line_no,
                    field: arg.to_owned(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let decl = InstructionDecl {
        name,
        display,
        kind,
        size,
        pattern,
        pattern_mask,
        unused_bits,
        args,
    };

    let argument_bits = decl.argument_bits();
    if pattern_mask & argument_bits != 0 {
        return Err(SchemaError::FieldOverlapsPattern { line: line_no });
    }
    if argument_bits != dot_bits
        || pattern_mask | unused_bits | argument_bits != decl.word_mask()
    {
        return Err(SchemaError::UnaccountedBits { line: line_no });
    }
    Ok(decl)
}

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum SchemaError {
    #[error("line {line}: unknown statement")]
    UnknownStatement { line: usize },
    #[error("line {line}: malformed statement")]
    MalformedStatement { line: usize },
    #[error("line {line}: field declared twice")]
    DuplicateField { line: usize },
    #[error("line {line}: reference to unknown field `{field}`")]
    UnknownField { line: usize, field: String },
    #[error("line {line}: pattern describes {bits} bits, expected 16 or 32")]
    BadPatternWidth { line: usize, bits: usize },
    #[error("line {line}: argument field bits overlap fixed pattern bits")]
    FieldOverlapsPattern { line: usize },
    #[error("line {line}: not all instruction bits are accounted for")]
    UnaccountedBits { line: usize },
    #[error("declarations `{first}` and `{second}` are ambiguous")]
    AmbiguousDeclarations { first: String, second: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_mappings() {
        let set = InstructionSet::parse(
            "field imm s31:20\n\
             field rd 11:7\n\
             inst ADDI | ............_....._000_....._0010011 | rd imm\n",
        )
        .unwrap_err();
        // rs1 bits are neither fixed nor covered by an argument.
        assert_eq!(SchemaError::UnaccountedBits { line: 3 }, set);
    }

    #[test]
    fn test_extract_simple_and_signed() {
        let field = Field {
            name: "imm".into(),
            mappings: vec![FieldMapping {
                src_msb: 31,
                src_lsb: 20,
                dst_lsb: 0,
                sign_extend: true,
            }],
            post: None,
        };
        assert_eq!(5, field.extract(0x0050_0093));
        assert_eq!(-42i32 as u32, field.extract((-42i32 as u32) << 20));
    }

    #[test]
    fn test_extract_scattered_with_post() {
        // The compressed register field rs1' reads bits 9:7 and adds 8.
        let field = Field {
            name: "crs1".into(),
            mappings: vec![FieldMapping {
                src_msb: 9,
                src_lsb: 7,
                dst_lsb: 0,
                sign_extend: false,
            }],
            post: Some(PostProcess::Add(8)),
        };
        assert_eq!(8, field.extract(0x0000));
        assert_eq!(13, field.extract(5 << 7));
    }

    #[test]
    fn test_branch_immediate_extraction() {
        // B-type immediate: imm[12|10:5] at 31:25, imm[4:1|11] at 11:7.
        let field = Field {
            name: "bimm".into(),
            mappings: vec![
                FieldMapping {
                    src_msb: 31,
                    src_lsb: 31,
                    dst_lsb: 12,
                    sign_extend: true,
                },
                FieldMapping {
                    src_msb: 30,
                    src_lsb: 25,
                    dst_lsb: 5,
                    sign_extend: false,
                },
                FieldMapping {
                    src_msb: 11,
                    src_lsb: 8,
                    dst_lsb: 1,
                    sign_extend: false,
                },
                FieldMapping {
                    src_msb: 7,
                    src_lsb: 7,
                    dst_lsb: 11,
                    sign_extend: false,
                },
            ],
            post: None,
        };
        // beq x0, x0, -4 encodes as 0xFE000EE3.
        assert_eq!(-4i32 as u32, field.extract(0xFE00_0EE3));
        // beq x0, x0, 8 encodes as 0x00000463.
        assert_eq!(8, field.extract(0x0000_0463));
    }

    #[test]
    fn test_compressed_size_detection() {
        let set = InstructionSet::parse(
            "inst C.EBREAK | 100_1_00000_00000_10 |\n\
             inst EBREAK | 000000000001_00000_000_00000_1110011 |\n",
        )
        .unwrap();
        assert_eq!(2, set.decl("C.EBREAK").unwrap().size);
        assert_eq!(4, set.decl("EBREAK").unwrap().size);
    }

    #[test]
    fn test_pattern_and_args_disjoint() {
        let err = InstructionSet::parse(
            "field rd 11:7\n\
             inst BAD | ................_....._000_00000_0010011 | rd\n",
        )
        .unwrap_err();
        assert_eq!(SchemaError::FieldOverlapsPattern { line: 2 }, err);
    }

    #[test]
    fn test_ambiguity_dominated_is_allowed() {
        // A and B overlap where funct3 == 0 and rs2 == 0, but C dominates that intersection.
        let set = InstructionSet::parse(
            "field rs2 24:20\n\
             field f3 14:12\n\
             inst A | 0000000_....._00000_000_00000_0000011 | rs2\n\
             inst B | 0000000_00000_00000_..._00000_0000011 | f3\n\
             inst C | 0000000_00000_00000_000_00000_0000011 |\n",
        );
        assert!(set.is_ok());
    }

    #[test]
    fn test_ambiguity_rejected() {
        let err = InstructionSet::parse(
            "field rs2 24:20\n\
             field f3 14:12\n\
             inst A | 0000000_....._00000_000_00000_0000011 | rs2\n\
             inst B | 0000000_00000_00000_..._00000_0000011 | f3\n",
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::AmbiguousDeclarations { .. }));
    }

    #[test]
    fn test_more_specific_wins_is_allowed() {
        let set = InstructionSet::parse(
            "field rs1 19:15\n\
             field rd 11:7\n\
             inst ANY | 000000000000_....._000_....._1110011 | rs1 rd\n\
             inst SPECIFIC | 000000000000_00000_000_00000_1110011 |\n",
        );
        assert!(set.is_ok());
    }
}
