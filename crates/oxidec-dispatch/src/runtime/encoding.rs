//! Type encodings for method signatures.
//!
//! Encodings follow the `@encode()` alphabet: one element for the return
//! type followed by one element per argument, the first two arguments being
//! the receiver (`@`) and the selector (`:`). Compilers interleave stack
//! offsets (`v16@0:8`) and prefix qualifiers (`r`, `n`, `o`, ...); neither
//! changes which implementation a call site expects, so both are ignored
//! when signatures are compared.
//!
//! # Encoding alphabet (subset)
//!
//! - `v` void, `@` object, `#` class, `:` selector
//! - `c i s l q` and unsigned `C I S L Q`, `B` bool
//! - `f` float, `d` double, `D` long double
//! - `*` C string, the historical shorthand for `^c`
//! - `^T` pointer to `T`, `[NT]` array, `{name=...}` struct, `(name=...)` union
//! - `?` unknown (function pointers, blocks)

use crate::error::{Error, Result};

/// Qualifier letters that precede a type element.
const QUALIFIERS: &[char] = &['r', 'n', 'N', 'o', 'O', 'R', 'V', 'A', '!'];

/// How a return value travels back through the call convention.
///
/// Zero-valued stubs for nil receivers are chosen by this classification,
/// because a float return does not share a register with an integer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnKind {
    /// No return value.
    Void,
    /// Pointers, integers, selectors, classes: one machine word.
    Word,
    /// `f`: single precision.
    Float,
    /// `d`: double precision.
    Double,
    /// `D`: extended precision.
    LongDouble,
}

impl ReturnKind {
    /// Bytes a zero-valued stub writes into the return slot.
    #[must_use]
    pub const fn zero_width(self) -> usize {
        match self {
            ReturnKind::Void => 0,
            ReturnKind::Word => size_of::<usize>(),
            ReturnKind::Float => 4,
            ReturnKind::Double => 8,
            ReturnKind::LongDouble => 16,
        }
    }
}

fn is_irrelevant(ch: char) -> bool {
    ch.is_ascii_digit() || QUALIFIERS.contains(&ch)
}

/// Compares two signatures the way selector uniquing does.
///
/// Qualifiers and stack offsets are skipped, and `*` is accepted wherever
/// the other side spells `^c` or `^C`.
///
/// ```
/// use oxidec_dispatch::runtime::encoding::types_equal;
///
/// assert!(types_equal("v16@0:8*16", "v@:^c"));
/// assert!(types_equal("rv@:", "v@:"));
/// assert!(!types_equal("v@:i", "v@:f"));
/// ```
#[must_use]
pub fn types_equal(a: &str, b: &str) -> bool {
    let a: Vec<char> = a.chars().filter(|&c| !is_irrelevant(c)).collect();
    let b: Vec<char> = b.chars().filter(|&c| !is_irrelevant(c)).collect();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match (a[i], b[j]) {
            ('*', '*') => {}
            ('*', '^') if matches!(b.get(j + 1), Some('c' | 'C')) => j += 1,
            ('^', '*') if matches!(a.get(i + 1), Some('c' | 'C')) => i += 1,
            (x, y) if x == y => {}
            _ => return false,
        }
        i += 1;
        j += 1;
    }
    i == a.len() && j == b.len()
}

/// Classifies the return element of `types`.
///
/// An empty or unparseable encoding is treated as returning a word, which
/// is what an untyped call site assumes.
#[must_use]
pub fn return_kind(types: &str) -> ReturnKind {
    match types.chars().find(|&c| !QUALIFIERS.contains(&c)) {
        Some('v') => ReturnKind::Void,
        Some('f') => ReturnKind::Float,
        Some('d') => ReturnKind::Double,
        Some('D') => ReturnKind::LongDouble,
        _ => ReturnKind::Word,
    }
}

/// Splits an encoding into its return element and argument elements.
///
/// Offsets and qualifiers are dropped; compound elements (`^`, `[]`, `{}`,
/// `()`) are kept whole.
///
/// # Errors
///
/// Returns [`Error::InvalidEncoding`] if the encoding is empty, a compound
/// element is unterminated, or fewer than the two implicit arguments
/// (receiver and selector) are present.
pub fn parse_signature(encoding: &str) -> Result<(String, Vec<String>)> {
    let invalid = || Error::InvalidEncoding {
        encoding: encoding.to_string(),
    };
    let chars: Vec<char> = encoding.chars().collect();
    let mut elements = Vec::new();
    let mut pos = 0;
    while pos < chars.len() {
        while pos < chars.len() && is_irrelevant(chars[pos]) {
            pos += 1;
        }
        if pos == chars.len() {
            break;
        }
        let end = element_end(&chars, pos).ok_or_else(invalid)?;
        elements.push(chars[pos..end].iter().collect::<String>());
        pos = end;
    }
    if elements.len() < 3 {
        return Err(invalid());
    }
    let return_type = elements.remove(0);
    Ok((return_type, elements))
}

/// Number of explicit arguments, excluding the receiver and selector.
///
/// # Errors
///
/// Propagates [`parse_signature`] failures.
pub fn argument_count(encoding: &str) -> Result<usize> {
    parse_signature(encoding).map(|(_, args)| args.len() - 2)
}

/// Returns the index one past the element starting at `start`.
fn element_end(chars: &[char], start: usize) -> Option<usize> {
    let mut pos = start;
    while pos < chars.len() && QUALIFIERS.contains(&chars[pos]) {
        pos += 1;
    }
    match chars.get(pos)? {
        '^' => element_end(chars, pos + 1),
        open @ ('[' | '{' | '(') => {
            let close = match open {
                '[' => ']',
                '{' => '}',
                _ => ')',
            };
            let mut depth = 0usize;
            for (offset, &ch) in chars[pos..].iter().enumerate() {
                if ch == *open {
                    depth += 1;
                } else if ch == close {
                    depth -= 1;
                    if depth == 0 {
                        return Some(pos + offset + 1);
                    }
                }
            }
            None
        }
        _ => Some(pos + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_c_string_shorthand_is_pointer_to_char() {
        assert!(types_equal("v@:*", "v@:^c"));
        assert!(types_equal("v@:^C", "v@:*"));
        assert!(types_equal("*@:", "^c@:"));
        assert!(!types_equal("v@:*", "v@:^i"));
        assert!(!types_equal("v@:^c", "v@:^i"));
    }

    #[test]
    fn test_offsets_and_qualifiers_ignored() {
        assert!(types_equal("v24@0:8i16", "v@:i"));
        assert!(types_equal("Vv@:", "v@:"));
        assert!(types_equal("v@:r*", "v@:*"));
    }

    #[test]
    fn test_length_mismatch_is_unequal() {
        assert!(!types_equal("v@:", "v@:i"));
        assert!(!types_equal("v@:i", "v@:"));
        assert!(types_equal("", ""));
    }

    #[test]
    fn test_return_kind() {
        assert_eq!(return_kind("v@:"), ReturnKind::Void);
        assert_eq!(return_kind("@@:"), ReturnKind::Word);
        assert_eq!(return_kind("q@:"), ReturnKind::Word);
        assert_eq!(return_kind("f@:"), ReturnKind::Float);
        assert_eq!(return_kind("rd@:"), ReturnKind::Double);
        assert_eq!(return_kind("D@:"), ReturnKind::LongDouble);
        assert_eq!(return_kind(""), ReturnKind::Word);
    }

    #[test]
    fn test_parse_signature_compound_elements() {
        let (ret, args) = parse_signature("{Point=dd}24@0:8^{Rect=[4i]}16").unwrap();
        assert_eq!(ret, "{Point=dd}");
        assert_eq!(args, vec!["@", ":", "^{Rect=[4i]}"]);
    }

    #[test]
    fn test_argument_count() {
        assert_eq!(argument_count("v@:").unwrap(), 0);
        assert_eq!(argument_count("v@:i*").unwrap(), 2);
        assert!(argument_count("v").is_err());
        assert!(argument_count("v@:{Open=i").is_err());
    }
}
