//! Type graph extraction: base types, pointers, composites, arrays,
//! enumerations and typedef chains, resolved lazily per DIE.

use crate::debugger::debugee::dwarf::unit::ParsedUnit;
use crate::debugger::debugee::dwarf::EndianArcSlice;
use crate::debugger::error::Error;
use gimli::{
    AttributeValue, DwAte, DW_AT_byte_size, DW_AT_const_value, DW_AT_count,
    DW_AT_data_member_location, DW_AT_encoding, DW_AT_name, DW_AT_type, DW_AT_upper_bound,
    DW_TAG_array_type, DW_TAG_base_type, DW_TAG_class_type, DW_TAG_const_type,
    DW_TAG_enumeration_type, DW_TAG_enumerator, DW_TAG_member, DW_TAG_pointer_type,
    DW_TAG_reference_type, DW_TAG_restrict_type, DW_TAG_structure_type, DW_TAG_subrange_type,
    DW_TAG_typedef, DW_TAG_union_type, DW_TAG_volatile_type, Reader, UnitOffset,
};

const MAX_TYPE_DEPTH: usize = 32;

#[derive(Debug, Clone)]
pub struct Member {
    pub name: Option<String>,
    pub offset: u64,
    pub type_ref: Option<UnitOffset>,
}

#[derive(Debug, Clone)]
pub enum TypeKind {
    Scalar(DwAte),
    Pointer { pointee: Option<UnitOffset> },
    Struct { members: Vec<Member> },
    Array { element: Option<UnitOffset>, count: Option<u64> },
    Enum { variants: Vec<(i64, String)> },
    Unknown,
}

/// One resolved level of the type graph.
#[derive(Debug, Clone)]
pub struct TypeView {
    pub name: String,
    pub byte_size: Option<u64>,
    pub kind: TypeKind,
}

impl TypeView {
    pub fn unknown() -> Self {
        Self {
            name: "<unknown>".to_string(),
            byte_size: None,
            kind: TypeKind::Unknown,
        }
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self.kind, TypeKind::Pointer { .. })
    }
}

fn die_name(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    parsed: &ParsedUnit,
    entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
) -> Option<String> {
    let attr = entry.attr_value(DW_AT_name).ok()??;
    let s = dwarf.attr_string(&parsed.unit, attr).ok()?;
    s.to_string_lossy().ok().map(|s| s.to_string())
}

fn inner_type_ref(
    entry: &gimli::DebuggingInformationEntry<EndianArcSlice>,
) -> Option<UnitOffset> {
    match entry.attr_value(DW_AT_type).ok()?? {
        AttributeValue::UnitRef(offset) => Some(offset),
        _ => None,
    }
}

/// Resolve one level of the type graph; typedef/const/volatile wrappers are
/// followed transparently.
pub fn type_view(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    parsed: &ParsedUnit,
    offset: UnitOffset,
) -> Result<TypeView, Error> {
    type_view_inner(dwarf, parsed, offset, 0)
}

fn type_view_inner(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    parsed: &ParsedUnit,
    offset: UnitOffset,
    depth: usize,
) -> Result<TypeView, Error> {
    if depth > MAX_TYPE_DEPTH {
        return Ok(TypeView::unknown());
    }

    let entry = parsed.unit.entry(offset)?;
    let byte_size = entry
        .attr_value(DW_AT_byte_size)?
        .and_then(|v| v.udata_value());

    match entry.tag() {
        DW_TAG_base_type => {
            let encoding = match entry.attr_value(DW_AT_encoding)? {
                Some(AttributeValue::Encoding(e)) => e,
                _ => gimli::DW_ATE_unsigned,
            };
            Ok(TypeView {
                name: die_name(dwarf, parsed, &entry).unwrap_or_else(|| "<base>".to_string()),
                byte_size,
                kind: TypeKind::Scalar(encoding),
            })
        }
        DW_TAG_pointer_type | DW_TAG_reference_type => {
            let pointee = inner_type_ref(&entry);
            let pointee_name = pointee
                .map(|p| type_name(dwarf, parsed, Some(p), depth + 1))
                .unwrap_or_else(|| "()".to_string());
            Ok(TypeView {
                name: format!("*{pointee_name}"),
                byte_size: byte_size.or(Some(8)),
                kind: TypeKind::Pointer { pointee },
            })
        }
        DW_TAG_typedef | DW_TAG_const_type | DW_TAG_volatile_type | DW_TAG_restrict_type => {
            match inner_type_ref(&entry) {
                Some(inner) => {
                    let mut view = type_view_inner(dwarf, parsed, inner, depth + 1)?;
                    if let Some(name) = die_name(dwarf, parsed, &entry) {
                        view.name = name;
                    }
                    Ok(view)
                }
                None => Ok(TypeView::unknown()),
            }
        }
        DW_TAG_structure_type | DW_TAG_class_type | DW_TAG_union_type => {
            let name = die_name(dwarf, parsed, &entry)
                .unwrap_or_else(|| "<anonymous>".to_string());
            let mut members = vec![];
            let mut tree = parsed.unit.entries_tree(Some(offset))?;
            let root = tree.root()?;
            let mut children = root.children();
            while let Some(child) = children.next()? {
                let child_entry = child.entry();
                if child_entry.tag() != DW_TAG_member {
                    continue;
                }
                let member_offset = child_entry
                    .attr_value(DW_AT_data_member_location)?
                    .and_then(|v| v.udata_value())
                    .unwrap_or(0);
                members.push(Member {
                    name: die_name(dwarf, parsed, child_entry),
                    offset: member_offset,
                    type_ref: inner_type_ref(child_entry),
                });
            }
            Ok(TypeView {
                name,
                byte_size,
                kind: TypeKind::Struct { members },
            })
        }
        DW_TAG_array_type => {
            let element = inner_type_ref(&entry);
            let mut count = None;
            let mut tree = parsed.unit.entries_tree(Some(offset))?;
            let root = tree.root()?;
            let mut children = root.children();
            while let Some(child) = children.next()? {
                let child_entry = child.entry();
                if child_entry.tag() != DW_TAG_subrange_type {
                    continue;
                }
                count = child_entry
                    .attr_value(DW_AT_count)?
                    .and_then(|v| v.udata_value())
                    .or_else(|| {
                        child_entry
                            .attr_value(DW_AT_upper_bound)
                            .ok()
                            .flatten()
                            .and_then(|v| v.udata_value())
                            .map(|ub| ub + 1)
                    });
            }
            let elem_name = element
                .map(|e| type_name(dwarf, parsed, Some(e), depth + 1))
                .unwrap_or_else(|| "<unknown>".to_string());
            Ok(TypeView {
                name: match count {
                    Some(n) => format!("[{elem_name}; {n}]"),
                    None => format!("[{elem_name}]"),
                },
                byte_size,
                kind: TypeKind::Array { element, count },
            })
        }
        DW_TAG_enumeration_type => {
            let name = die_name(dwarf, parsed, &entry)
                .unwrap_or_else(|| "<anonymous enum>".to_string());
            let mut variants = vec![];
            let mut tree = parsed.unit.entries_tree(Some(offset))?;
            let root = tree.root()?;
            let mut children = root.children();
            while let Some(child) = children.next()? {
                let child_entry = child.entry();
                if child_entry.tag() != DW_TAG_enumerator {
                    continue;
                }
                let value = match child_entry.attr_value(DW_AT_const_value)? {
                    Some(AttributeValue::Sdata(v)) => v,
                    Some(AttributeValue::Udata(v)) => v as i64,
                    _ => continue,
                };
                if let Some(vname) = die_name(dwarf, parsed, child_entry) {
                    variants.push((value, vname));
                }
            }
            Ok(TypeView {
                name,
                byte_size,
                kind: TypeKind::Enum { variants },
            })
        }
        _ => Ok(TypeView::unknown()),
    }
}

/// Human readable name of a (possibly absent) type reference.
pub fn type_name(
    dwarf: &gimli::Dwarf<EndianArcSlice>,
    parsed: &ParsedUnit,
    offset: Option<UnitOffset>,
    depth: usize,
) -> String {
    if depth > MAX_TYPE_DEPTH {
        return "<recursive>".to_string();
    }
    match offset {
        Some(offset) => type_view_inner(dwarf, parsed, offset, depth)
            .map(|v| v.name)
            .unwrap_or_else(|_| "<unknown>".to_string()),
        None => "()".to_string(),
    }
}

/// Render raw value bytes according to the resolved type.
pub fn render_scalar(view: &TypeView, bytes: &[u8]) -> String {
    fn u64_from(bytes: &[u8]) -> u64 {
        let mut buf = [0u8; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        u64::from_ne_bytes(buf)
    }

    fn i64_from(bytes: &[u8]) -> i64 {
        let size = bytes.len().min(8);
        let raw = u64_from(bytes);
        if size < 8 {
            let shift = 64 - size * 8;
            ((raw << shift) as i64) >> shift
        } else {
            raw as i64
        }
    }

    if bytes.is_empty() {
        return "<optimized out>".to_string();
    }

    match &view.kind {
        TypeKind::Scalar(encoding) => match *encoding {
            gimli::DW_ATE_signed | gimli::DW_ATE_signed_char => i64_from(bytes).to_string(),
            gimli::DW_ATE_unsigned => u64_from(bytes).to_string(),
            gimli::DW_ATE_boolean => (u64_from(bytes) != 0).to_string(),
            gimli::DW_ATE_float => match bytes.len() {
                4 => f32::from_ne_bytes(bytes[..4].try_into().expect("checked len")).to_string(),
                _ => f64::from_ne_bytes({
                    let mut buf = [0u8; 8];
                    let n = bytes.len().min(8);
                    buf[..n].copy_from_slice(&bytes[..n]);
                    buf
                })
                .to_string(),
            },
            gimli::DW_ATE_unsigned_char => {
                let v = u64_from(bytes);
                char::from_u32(v as u32)
                    .map(|c| format!("'{c}'"))
                    .unwrap_or_else(|| v.to_string())
            }
            gimli::DW_ATE_UTF => {
                let v = u64_from(bytes) as u32;
                char::from_u32(v)
                    .map(|c| format!("'{c}'"))
                    .unwrap_or_else(|| v.to_string())
            }
            _ => format!("{:#x}", u64_from(bytes)),
        },
        TypeKind::Pointer { .. } => format!("{:#x}", u64_from(bytes)),
        TypeKind::Enum { variants } => {
            let v = i64_from(bytes);
            variants
                .iter()
                .find(|(value, _)| *value == v)
                .map(|(_, name)| name.clone())
                .unwrap_or_else(|| v.to_string())
        }
        TypeKind::Struct { members } => format!("{} {{ {} fields }}", view.name, members.len()),
        TypeKind::Array { count, .. } => match count {
            Some(n) => format!("{} [{n}]", view.name),
            None => view.name.clone(),
        },
        TypeKind::Unknown => format!("{:#x}", u64_from(bytes)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn scalar(encoding: DwAte, size: u64) -> TypeView {
        TypeView {
            name: "t".to_string(),
            byte_size: Some(size),
            kind: TypeKind::Scalar(encoding),
        }
    }

    #[test]
    fn test_render_signed() {
        let view = scalar(gimli::DW_ATE_signed, 4);
        assert_eq!(render_scalar(&view, &(-5i32).to_ne_bytes()), "-5");
        assert_eq!(render_scalar(&view, &30i32.to_ne_bytes()), "30");
    }

    #[test]
    fn test_render_bool_and_float() {
        let b = scalar(gimli::DW_ATE_boolean, 1);
        assert_eq!(render_scalar(&b, &[1]), "true");
        assert_eq!(render_scalar(&b, &[0]), "false");

        let f = scalar(gimli::DW_ATE_float, 8);
        assert_eq!(render_scalar(&f, &2.5f64.to_ne_bytes()), "2.5");
    }

    #[test]
    fn test_render_enum() {
        let view = TypeView {
            name: "Color".to_string(),
            byte_size: Some(4),
            kind: TypeKind::Enum {
                variants: vec![(0, "Red".to_string()), (1, "Green".to_string())],
            },
        };
        assert_eq!(render_scalar(&view, &1i32.to_ne_bytes()), "Green");
        assert_eq!(render_scalar(&view, &7i32.to_ne_bytes()), "7");
    }
}
