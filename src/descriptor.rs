//! Minimal field/method descriptor parsing. Full descriptor *grammar* objects (with class-usage
//! extraction, generic signature parsing, etc.) are the tree-layer's job and out of scope here;
//! the frame engine only needs to know, per parameter or return type, how many stack slots it
//! occupies and whether it is a reference, and at what array dimension.

/// The verification-relevant shape of a descriptor element: how many local/stack slots it
/// occupies and what category of [`crate::frame::Type`] it produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Reference,
    Int,
    Float,
    Long,
    Double,
}

impl SlotKind {
    /// `2` for `long`/`double`, `1` otherwise.
    pub fn width(self) -> u8 {
        match self {
            SlotKind::Long | SlotKind::Double => 2,
            _ => 1,
        }
    }
}

/// One field type: the slot it occupies, its array dimension (`0` for a non-array), and — for
/// `Reference` at dimension 0 — the internal class name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldType {
    pub kind: SlotKind,
    pub dim: u32,
    pub class_name: Option<String>,
}

/// Parses a single field descriptor (e.g. `I`, `[[Ljava/lang/String;`, `Lfoo/Bar;`) starting at
/// `input`, returning the parsed type and the remainder of the string.
pub fn parse_field_type(input: &str) -> Option<(FieldType, &str)> {
    let mut dim = 0u32;
    let mut rest = input;
    while let Some(stripped) = rest.strip_prefix('[') {
        dim += 1;
        rest = stripped;
    }

    let mut chars = rest.char_indices();
    let (_, first) = chars.next()?;
    let (kind, consumed, class_name) = match first {
        'B' => (SlotKind::Int, 1, None),
        'C' => (SlotKind::Int, 1, None),
        'D' => (SlotKind::Double, 1, None),
        'F' => (SlotKind::Float, 1, None),
        'I' => (SlotKind::Int, 1, None),
        'J' => (SlotKind::Long, 1, None),
        'S' => (SlotKind::Int, 1, None),
        'Z' => (SlotKind::Int, 1, None),
        'L' => {
            let end = rest.find(';')?;
            (SlotKind::Reference, end + 1, Some(rest[1..end].to_string()))
        }
        _ => return None,
    };

    Some((FieldType { kind, dim, class_name }, &rest[consumed..]))
}

/// Parses a full method descriptor `(ParamTypes)ReturnType` into its parameter types and return
/// type (`None` for `V`oid).
pub fn parse_method_descriptor(descriptor: &str) -> Option<(Vec<FieldType>, Option<FieldType>)> {
    let body = descriptor.strip_prefix('(')?;
    let (params_str, return_str) = body.split_once(')')?;

    let mut params = Vec::new();
    let mut rest = params_str;
    while !rest.is_empty() {
        let (ty, remainder) = parse_field_type(rest)?;
        params.push(ty);
        rest = remainder;
    }

    let return_type = if return_str == "V" {
        None
    } else {
        parse_field_type(return_str).map(|(ty, _)| ty)
    };

    Some((params, return_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_primitive() {
        let (ty, rest) = parse_field_type("I").unwrap();
        assert_eq!(ty.kind, SlotKind::Int);
        assert_eq!(ty.dim, 0);
        assert!(rest.is_empty());
    }

    #[test]
    fn parses_array_of_object() {
        let (ty, rest) = parse_field_type("[[Ljava/lang/String;tail").unwrap();
        assert_eq!(ty.dim, 2);
        assert_eq!(ty.kind, SlotKind::Reference);
        assert_eq!(ty.class_name.as_deref(), Some("java/lang/String"));
        assert_eq!(rest, "tail");
    }

    #[test]
    fn parses_method_descriptor() {
        let (params, ret) = parse_method_descriptor("(ILjava/lang/String;[D)J").unwrap();
        assert_eq!(params.len(), 3);
        assert_eq!(params[0].kind, SlotKind::Int);
        assert_eq!(params[1].class_name.as_deref(), Some("java/lang/String"));
        assert_eq!(params[2].dim, 1);
        assert_eq!(ret.unwrap().kind, SlotKind::Long);
    }

    #[test]
    fn void_return_is_none() {
        let (_, ret) = parse_method_descriptor("()V").unwrap();
        assert!(ret.is_none());
    }
}
