//! Native memory layouts and function signatures.
//!
//! Layouts describe C data: scalars, addresses, and composites (structs, unions,
//! arrays) with explicit member offsets. A [`FunctionType`] is an ordered list of
//! parameter layouts, an optional return layout and an optional variadic tail.

mod parse;

use std::fmt;

use crate::value::{MethodType, ValueType};
use crate::{Error, Result};

/// Largest alignment a layout may request.
pub const MAX_ALIGNMENT: u64 = 16;

/// Size in bytes of an address on every supported ABI.
pub const ADDRESS_SIZE: u64 = 8;

/// Largest size a layout may have. Stack offsets are 32-bit.
pub const MAX_LAYOUT_SIZE: u64 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarKind {
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl ScalarKind {
    #[must_use]
    pub const fn size(self) -> u64 {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    #[must_use]
    pub const fn carrier(self) -> ValueType {
        match self {
            Self::I8 => ValueType::I8,
            Self::I16 => ValueType::I16,
            Self::I32 => ValueType::I32,
            Self::I64 => ValueType::I64,
            Self::F32 => ValueType::F32,
            Self::F64 => ValueType::F64,
        }
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

/// A member of a struct or union, placed at a fixed byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Member {
    pub offset: u64,
    pub layout: TypeLayout,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupLayout {
    members: Vec<Member>,
    size: u64,
    align: u64,
    packed: bool,
    align_override: Option<u64>,
}

impl GroupLayout {
    #[must_use]
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub const fn align(&self) -> u64 {
        self.align
    }

    #[must_use]
    pub const fn is_packed(&self) -> bool {
        self.packed
    }

    fn structure(members: Vec<(Option<String>, TypeLayout)>, packed: bool) -> Self {
        let mut offset = 0;
        let mut align = 1;
        let mut placed = Vec::with_capacity(members.len());
        for (name, layout) in members {
            if !packed {
                let member_align = layout.align();
                offset = align_up(offset, member_align);
                align = align.max(member_align);
            }
            let size = layout.size();
            placed.push(Member {
                offset,
                layout,
                name,
            });
            offset = offset.saturating_add(size);
        }
        Self {
            members: placed,
            size: align_up(offset, align),
            align,
            packed,
            align_override: None,
        }
    }

    fn union(members: Vec<(Option<String>, TypeLayout)>) -> Self {
        let align = members.iter().map(|(_, l)| l.align()).max().unwrap_or(1);
        let size = members.iter().map(|(_, l)| l.size()).max().unwrap_or(0);
        Self {
            members: members
                .into_iter()
                .map(|(name, layout)| Member {
                    offset: 0,
                    layout,
                    name,
                })
                .collect(),
            size: align_up(size, align),
            align,
            packed: false,
            align_override: None,
        }
    }

    fn validate(&self, what: &str) -> Result<()> {
        if self.members.is_empty() || self.size == 0 {
            return Err(Error::InvalidSignature(format!("empty {what} is not supported")));
        }
        check_alignment(self.align)?;
        if self.size % self.align != 0 {
            return Err(Error::InvalidSignature(format!(
                "{what} size {} is not a multiple of its alignment {}",
                self.size, self.align
            )));
        }
        for member in &self.members {
            member.layout.validate_nested()?;
            let member_align = member.layout.align();
            let label = member.name.as_deref().unwrap_or("<anonymous>");
            if member.offset % member_align != 0 || member_align > self.align {
                return Err(Error::InvalidSignature(format!(
                    "{what} member `{label}` at offset {} is misaligned (requires alignment {member_align})",
                    member.offset
                )));
            }
            if member.offset.saturating_add(member.layout.size()) > self.size {
                return Err(Error::InvalidSignature(format!(
                    "{what} member `{label}` extends past the end of the {what}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeLayout {
    Scalar(ScalarKind),
    /// An address, optionally describing the pointee.
    Address(Option<Box<TypeLayout>>),
    Struct(GroupLayout),
    Union(GroupLayout),
    Array {
        element: Box<TypeLayout>,
        count: u64,
    },
    Padding(u64),
}

impl TypeLayout {
    pub const I8: TypeLayout = TypeLayout::Scalar(ScalarKind::I8);
    pub const I16: TypeLayout = TypeLayout::Scalar(ScalarKind::I16);
    pub const I32: TypeLayout = TypeLayout::Scalar(ScalarKind::I32);
    pub const I64: TypeLayout = TypeLayout::Scalar(ScalarKind::I64);
    pub const F32: TypeLayout = TypeLayout::Scalar(ScalarKind::F32);
    pub const F64: TypeLayout = TypeLayout::Scalar(ScalarKind::F64);
    pub const POINTER: TypeLayout = TypeLayout::Address(None);

    #[must_use]
    pub fn pointer_to(pointee: TypeLayout) -> Self {
        Self::Address(Some(Box::new(pointee)))
    }

    /// A struct with natural (C) member placement.
    #[must_use]
    pub fn structure(members: impl IntoIterator<Item = TypeLayout>) -> Self {
        Self::Struct(GroupLayout::structure(
            members.into_iter().map(|l| (None, l)).collect(),
            false,
        ))
    }

    #[must_use]
    pub fn named_structure<S: Into<String>>(
        members: impl IntoIterator<Item = (S, TypeLayout)>,
    ) -> Self {
        Self::Struct(GroupLayout::structure(
            members
                .into_iter()
                .map(|(n, l)| (Some(n.into()), l))
                .collect(),
            false,
        ))
    }

    /// A struct whose members are placed back to back with alignment 1.
    #[must_use]
    pub fn packed(members: impl IntoIterator<Item = TypeLayout>) -> Self {
        Self::Struct(GroupLayout::structure(
            members.into_iter().map(|l| (None, l)).collect(),
            true,
        ))
    }

    #[must_use]
    pub fn union_of(members: impl IntoIterator<Item = TypeLayout>) -> Self {
        Self::Union(GroupLayout::union(
            members.into_iter().map(|l| (None, l)).collect(),
        ))
    }

    #[must_use]
    pub fn array(element: TypeLayout, count: u64) -> Self {
        Self::Array {
            element: Box::new(element),
            count,
        }
    }

    #[must_use]
    pub const fn padding(bytes: u64) -> Self {
        Self::Padding(bytes)
    }

    /// Raises the alignment of a struct or union. Other layouts are returned as is.
    #[must_use]
    pub fn with_alignment(self, align: u64) -> Self {
        match self {
            Self::Struct(mut g) => {
                g.align = align;
                g.size = align_up(g.size, align);
                g.align_override = Some(align);
                Self::Struct(g)
            }
            Self::Union(mut g) => {
                g.align = align;
                g.size = align_up(g.size, align);
                g.align_override = Some(align);
                Self::Union(g)
            }
            other => other,
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Scalar(kind) => kind.size(),
            Self::Address(_) => ADDRESS_SIZE,
            Self::Struct(g) | Self::Union(g) => g.size,
            Self::Array { element, count } => element.size().saturating_mul(*count),
            Self::Padding(bytes) => *bytes,
        }
    }

    #[must_use]
    pub fn align(&self) -> u64 {
        match self {
            Self::Scalar(kind) => kind.size(),
            Self::Address(_) => ADDRESS_SIZE,
            Self::Struct(g) | Self::Union(g) => g.align,
            Self::Array { element, .. } => element.align(),
            Self::Padding(_) => 1,
        }
    }

    #[must_use]
    pub const fn is_composite(&self) -> bool {
        matches!(self, Self::Struct(_) | Self::Union(_) | Self::Array { .. })
    }

    /// Size of the pointee for address layouts, zero when unknown.
    #[must_use]
    pub fn pointee_size(&self) -> u64 {
        match self {
            Self::Address(Some(target)) => target.size(),
            _ => 0,
        }
    }

    /// The high-level carrier used for values of this layout.
    #[must_use]
    pub const fn carrier(&self) -> ValueType {
        match self {
            Self::Scalar(kind) => kind.carrier(),
            Self::Address(_) => ValueType::Address,
            Self::Struct(_) | Self::Union(_) | Self::Array { .. } | Self::Padding(_) => {
                ValueType::Segment
            }
        }
    }

    /// Validates a layout used directly as a parameter or return value.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Padding(_) => Err(Error::InvalidSignature(
                "padding is only allowed inside a struct or union".into(),
            )),
            Self::Array { .. } => Err(Error::InvalidSignature(
                "arrays cannot be passed by value; wrap them in a struct".into(),
            )),
            other => other.validate_nested(),
        }
    }

    fn validate_nested(&self) -> Result<()> {
        let size = self.size();
        if size > MAX_LAYOUT_SIZE {
            return Err(Error::InvalidSignature(format!(
                "layout size overflows: `{self}` exceeds {MAX_LAYOUT_SIZE} bytes"
            )));
        }
        match self {
            Self::Scalar(_) | Self::Padding(_) => Ok(()),
            Self::Address(pointee) => match pointee {
                Some(target) => target.validate_nested(),
                None => Ok(()),
            },
            Self::Struct(g) => g.validate("struct"),
            Self::Union(g) => g.validate("union"),
            Self::Array { element, count } => {
                if *count == 0 {
                    return Err(Error::InvalidSignature(
                        "zero-length arrays are not supported".into(),
                    ));
                }
                if matches!(**element, Self::Padding(_)) {
                    return Err(Error::InvalidSignature(
                        "arrays of padding are not supported".into(),
                    ));
                }
                element.validate_nested()
            }
        }
    }

    /// Flattens a composite into its scalar leaves, in offset order.
    pub(crate) fn flatten(&self) -> Vec<FlatField> {
        let mut out = Vec::new();
        self.flatten_into(0, &mut out);
        out.sort_by_key(|f| f.offset);
        out
    }

    fn flatten_into(&self, base: u64, out: &mut Vec<FlatField>) {
        match self {
            Self::Scalar(kind) => out.push(FlatField {
                offset: base,
                size: kind.size(),
                float: kind.is_float().then_some(*kind),
            }),
            Self::Address(_) => out.push(FlatField {
                offset: base,
                size: ADDRESS_SIZE,
                float: None,
            }),
            Self::Struct(g) | Self::Union(g) => {
                for member in &g.members {
                    member.layout.flatten_into(base + member.offset, out);
                }
            }
            Self::Array { element, count } => {
                let stride = element.size();
                for i in 0..*count {
                    element.flatten_into(base + i * stride, out);
                }
            }
            Self::Padding(_) => {}
        }
    }
}

/// One scalar leaf of a flattened composite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlatField {
    pub offset: u64,
    pub size: u64,
    /// `Some` for floating-point leaves.
    pub float: Option<ScalarKind>,
}

fn check_alignment(align: u64) -> Result<()> {
    if !align.is_power_of_two() || align > MAX_ALIGNMENT {
        return Err(Error::InvalidSignature(format!(
            "alignment {align} must be a power of two no larger than {MAX_ALIGNMENT}"
        )));
    }
    Ok(())
}

/// Rounds `value` up to a multiple of `align`, saturating at `u64::MAX`.
/// A saturated layout size is rejected by validation.
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    if align <= 1 {
        return value;
    }
    match value.checked_next_multiple_of(align) {
        Some(aligned) => aligned,
        None => u64::MAX,
    }
}

/// A native function signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    params: Vec<TypeLayout>,
    ret: Option<TypeLayout>,
    /// Index of the first variadic parameter, if the function is variadic.
    first_variadic: Option<usize>,
}

impl FunctionType {
    #[must_use]
    pub fn new(params: impl IntoIterator<Item = TypeLayout>, ret: Option<TypeLayout>) -> Self {
        Self {
            params: params.into_iter().collect(),
            ret,
            first_variadic: None,
        }
    }

    #[must_use]
    pub fn returning(params: impl IntoIterator<Item = TypeLayout>, ret: TypeLayout) -> Self {
        Self::new(params, Some(ret))
    }

    #[must_use]
    pub fn void(params: impl IntoIterator<Item = TypeLayout>) -> Self {
        Self::new(params, None)
    }

    /// Marks the function as variadic after its current parameters.
    #[must_use]
    pub fn variadic(mut self) -> Self {
        self.first_variadic = Some(self.params.len());
        self
    }

    #[must_use]
    pub fn params(&self) -> &[TypeLayout] {
        &self.params
    }

    #[must_use]
    pub const fn ret(&self) -> Option<&TypeLayout> {
        self.ret.as_ref()
    }

    #[must_use]
    pub const fn first_variadic(&self) -> Option<usize> {
        self.first_variadic
    }

    #[must_use]
    pub const fn is_variadic(&self) -> bool {
        self.first_variadic.is_some()
    }

    /// Number of fixed (non-variadic) parameters.
    #[must_use]
    pub fn fixed_arity(&self) -> usize {
        self.first_variadic.unwrap_or(self.params.len())
    }

    #[must_use]
    pub fn is_variadic_param(&self, index: usize) -> bool {
        self.first_variadic.is_some_and(|first| index >= first)
    }

    /// The concrete signature of one variadic call: the fixed parameters followed
    /// by the given variadic layouts.
    #[must_use]
    pub fn with_variadic_args(&self, layouts: impl IntoIterator<Item = TypeLayout>) -> Self {
        let fixed = self.fixed_arity();
        let mut params = self.params[..fixed].to_vec();
        params.extend(layouts);
        Self {
            params,
            ret: self.ret.clone(),
            first_variadic: Some(fixed),
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (i, param) in self.params.iter().enumerate() {
            param
                .validate()
                .map_err(|e| annotate(e, &format!("parameter {i}")))?;
        }
        if let Some(ret) = &self.ret {
            ret.validate().map_err(|e| annotate(e, "return value"))?;
        }
        Ok(())
    }

    /// The carrier type a managed implementation of this signature must have.
    #[must_use]
    pub fn carrier_type(&self) -> MethodType {
        MethodType::new(
            self.params.iter().map(TypeLayout::carrier),
            self.ret.as_ref().map(TypeLayout::carrier),
        )
    }
}

fn annotate(error: Error, context: &str) -> Error {
    match error {
        Error::InvalidSignature(msg) => Error::InvalidSignature(format!("{context}: {msg}")),
        other => other,
    }
}

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Display for TypeLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(kind) => write!(f, "{kind}"),
            Self::Address(None) => f.write_str("ptr"),
            Self::Address(Some(target)) => write!(f, "ptr<{target}>"),
            Self::Struct(g) => {
                if let Some(align) = g.align_override {
                    write!(f, "align({align}) ")?;
                }
                if g.packed {
                    f.write_str("packed")?;
                }
                write_members(f, &g.members)
            }
            Self::Union(g) => {
                if let Some(align) = g.align_override {
                    write!(f, "align({align}) ")?;
                }
                f.write_str("union")?;
                write_members(f, &g.members)
            }
            Self::Array { element, count } => write!(f, "[{count} x {element}]"),
            Self::Padding(bytes) => write!(f, "pad({bytes})"),
        }
    }
}

fn write_members(f: &mut fmt::Formatter<'_>, members: &[Member]) -> fmt::Result {
    f.write_str("{")?;
    for (i, member) in members.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        if let Some(name) = &member.name {
            write!(f, "{name}: ")?;
        }
        write!(f, "{}", member.layout)?;
    }
    f.write_str("}")
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        let mut first = true;
        for (i, param) in self.params.iter().enumerate() {
            if self.first_variadic == Some(i) {
                f.write_str(if first { "..." } else { ", ..." })?;
                first = false;
            }
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
            first = false;
        }
        if self.first_variadic == Some(self.params.len()) {
            f.write_str(if first { "..." } else { ", ..." })?;
        }
        f.write_str(") -> ")?;
        match &self.ret {
            Some(ret) => write!(f, "{ret}"),
            None => f.write_str("void"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_struct_layout() {
        let layout = TypeLayout::structure([TypeLayout::I8, TypeLayout::I32, TypeLayout::I16]);
        let TypeLayout::Struct(group) = &layout else {
            panic!("expected struct");
        };
        let offsets: Vec<u64> = group.members().iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8]);
        assert_eq!(layout.size(), 12);
        assert_eq!(layout.align(), 4);
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_packed_struct_is_rejected() {
        let layout = TypeLayout::packed([TypeLayout::I8, TypeLayout::I32]);
        assert_eq!(layout.size(), 5);
        let err = layout.validate().unwrap_err();
        assert!(matches!(err, Error::InvalidSignature(_)), "{err}");
        assert!(err.to_string().contains("misaligned"), "{err}");
    }

    #[test]
    fn test_union_layout() {
        let layout = TypeLayout::union_of([TypeLayout::I8, TypeLayout::F64, TypeLayout::I32]);
        assert_eq!(layout.size(), 8);
        assert_eq!(layout.align(), 8);
        assert_eq!(layout.flatten().len(), 3);
    }

    #[test]
    fn test_alignment_limits() {
        let over = TypeLayout::structure([TypeLayout::I32]).with_alignment(32);
        assert!(over.validate().is_err());
        let ok = TypeLayout::structure([TypeLayout::I32]).with_alignment(16);
        assert_eq!(ok.size(), 16);
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_flatten_arrays_and_padding() {
        let layout = TypeLayout::structure([
            TypeLayout::F32,
            TypeLayout::padding(4),
            TypeLayout::array(TypeLayout::I16, 3),
        ]);
        let fields = layout.flatten();
        let offsets: Vec<u64> = fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 8, 10, 12]);
        assert_eq!(fields[0].float, Some(ScalarKind::F32));
        assert_eq!(fields[1].float, None);
    }

    #[test]
    fn test_top_level_padding_and_empty_struct_rejected() {
        assert!(TypeLayout::padding(4).validate().is_err());
        assert!(TypeLayout::structure([]).validate().is_err());
        let sig = FunctionType::void([TypeLayout::I32, TypeLayout::array(TypeLayout::I8, 4)]);
        let err = sig.validate().unwrap_err();
        assert!(err.to_string().contains("parameter 1"), "{err}");
    }

    #[test]
    fn test_oversized_layouts_saturate_and_are_rejected() {
        let nested = TypeLayout::array(TypeLayout::array(TypeLayout::I64, 1 << 32), 1 << 32);
        let wrapped = TypeLayout::structure([nested]);
        assert_eq!(wrapped.size(), u64::MAX);
        let err = wrapped.validate().unwrap_err();
        assert!(err.to_string().contains("layout size overflows"), "{err}");

        let padded = TypeLayout::structure([TypeLayout::padding(u64::MAX), TypeLayout::I64]);
        assert_eq!(padded.size(), u64::MAX);
        assert!(padded.validate().is_err());

        assert_eq!(align_up(u64::MAX - 3, 8), u64::MAX);
        assert_eq!(align_up(13, 8), 16);
        assert_eq!(align_up(13, 0), 13);
    }

    #[test]
    fn test_variadic_concrete_signature() {
        let declared = FunctionType::returning([TypeLayout::POINTER], TypeLayout::I32).variadic();
        assert_eq!(declared.fixed_arity(), 1);
        let concrete = declared.with_variadic_args([TypeLayout::I32, TypeLayout::F64]);
        assert_eq!(concrete.params().len(), 3);
        assert!(!concrete.is_variadic_param(0));
        assert!(concrete.is_variadic_param(2));
        assert_eq!(concrete.to_string(), "(ptr, ..., i32, f64) -> i32");
    }
}
