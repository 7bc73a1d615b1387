//! Reference descriptors: where an instruction reads or writes a value.

use std::fmt;

use compact_str::CompactString;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

#[cfg(feature = "serde")]
use serde::{Serialize, Deserialize};

use crate::error::OperandError;

/// The tag byte of an encoded [`Reference`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, FromPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u8)]
pub enum ReferenceType {
    Src,
    #[cfg_attr(feature = "serde", serde(rename = "Self"))]
    SelfRef,
    Usr,
    Args,
    World,
    SuperProc,
    ListIndex,
    Argument,
    Local,
    Global,
    GlobalProc,
    Field,
    SrcField,
    SrcProc,
    Callee,
    Caller,
    Invalid,
}
impl ReferenceType {
    pub fn from_byte(value: u8) -> Option<Self> {
        Self::from_u8(value)
    }
}
impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SelfRef => f.write_str("Self"),
            x => write!(f, "{x:?}"),
        }
    }
}

/// A tagged storage location.
///
/// `Argument` and `Local` slots are a single byte on the wire, so their constructors reject indices above 255.
/// Field and proc names are kept as text and only turned into string ids when encoded.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Reference {
    Src,
    #[cfg_attr(feature = "serde", serde(rename = "Self"))]
    SelfRef,
    Usr,
    Args,
    World,
    SuperProc,
    ListIndex,
    Argument(u8),
    Local(u8),
    Global(i32),
    GlobalProc(i32),
    Field(CompactString),
    SrcField(CompactString),
    SrcProc(CompactString),
    Callee,
    Caller,
    Invalid,
}
impl Reference {
    pub fn argument(index: usize) -> Result<Self, OperandError> {
        u8::try_from(index).map(Self::Argument).map_err(|_| OperandError::IndexOutOfRange { kind: "argument", index })
    }
    pub fn local(index: usize) -> Result<Self, OperandError> {
        u8::try_from(index).map(Self::Local).map_err(|_| OperandError::IndexOutOfRange { kind: "local", index })
    }
    pub fn field(name: impl Into<CompactString>) -> Self {
        Self::Field(name.into())
    }

    pub fn ref_type(&self) -> ReferenceType {
        match self {
            Self::Src => ReferenceType::Src,
            Self::SelfRef => ReferenceType::SelfRef,
            Self::Usr => ReferenceType::Usr,
            Self::Args => ReferenceType::Args,
            Self::World => ReferenceType::World,
            Self::SuperProc => ReferenceType::SuperProc,
            Self::ListIndex => ReferenceType::ListIndex,
            Self::Argument(_) => ReferenceType::Argument,
            Self::Local(_) => ReferenceType::Local,
            Self::Global(_) => ReferenceType::Global,
            Self::GlobalProc(_) => ReferenceType::GlobalProc,
            Self::Field(_) => ReferenceType::Field,
            Self::SrcField(_) => ReferenceType::SrcField,
            Self::SrcProc(_) => ReferenceType::SrcProc,
            Self::Callee => ReferenceType::Callee,
            Self::Caller => ReferenceType::Caller,
            Self::Invalid => ReferenceType::Invalid,
        }
    }

    /// Builds a payload-free reference from its tag. Returns `None` for tags that carry a payload.
    pub fn from_unit_type(ty: ReferenceType) -> Option<Self> {
        Some(match ty {
            ReferenceType::Src => Self::Src,
            ReferenceType::SelfRef => Self::SelfRef,
            ReferenceType::Usr => Self::Usr,
            ReferenceType::Args => Self::Args,
            ReferenceType::World => Self::World,
            ReferenceType::SuperProc => Self::SuperProc,
            ReferenceType::ListIndex => Self::ListIndex,
            ReferenceType::Callee => Self::Callee,
            ReferenceType::Caller => Self::Caller,
            ReferenceType::Invalid => Self::Invalid,
            ReferenceType::Argument | ReferenceType::Local | ReferenceType::Global | ReferenceType::GlobalProc
            | ReferenceType::Field | ReferenceType::SrcField | ReferenceType::SrcProc => return None,
        })
    }

    /// The field or proc name this reference names, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Field(x) | Self::SrcField(x) | Self::SrcProc(x) => Some(x),
            _ => None,
        }
    }
}
impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Argument(x) => write!(f, "Argument({x})"),
            Self::Local(x) => write!(f, "Local({x})"),
            Self::Global(x) => write!(f, "Global({x})"),
            Self::GlobalProc(x) => write!(f, "GlobalProc({x})"),
            Self::Field(x) => write!(f, "Field({x:?})"),
            Self::SrcField(x) => write!(f, "SrcField({x:?})"),
            Self::SrcProc(x) => write!(f, "SrcProc({x:?})"),
            x => write!(f, "{}", x.ref_type()),
        }
    }
}

#[test]
fn test_reference_index_range() {
    assert_eq!(Reference::local(0), Ok(Reference::Local(0)));
    assert_eq!(Reference::argument(255), Ok(Reference::Argument(255)));
    assert_eq!(Reference::local(256), Err(OperandError::IndexOutOfRange { kind: "local", index: 256 }));
    assert!(Reference::argument(1000).is_err());
}

#[test]
fn test_reference_display() {
    assert_eq!(Reference::Local(3).to_string(), "Local(3)");
    assert_eq!(Reference::Global(-1).to_string(), "Global(-1)");
    assert_eq!(Reference::field("name").to_string(), "Field(\"name\")");
    assert_eq!(Reference::SrcProc("Move".into()).to_string(), "SrcProc(\"Move\")");
    assert_eq!(Reference::SelfRef.to_string(), "Self");
    assert_eq!(Reference::ListIndex.to_string(), "ListIndex");
}

#[test]
fn test_reference_tags() {
    assert_eq!(ReferenceType::SelfRef as u8, 1);
    assert_eq!(ReferenceType::Argument as u8, 7);
    assert_eq!(ReferenceType::Invalid as u8, 16);
    assert_eq!(ReferenceType::from_byte(13), Some(ReferenceType::SrcProc));
    assert_eq!(ReferenceType::from_byte(17), None);
    for tag in 0..=16u8 {
        let ty = ReferenceType::from_byte(tag).unwrap();
        if let Some(r) = Reference::from_unit_type(ty) {
            assert_eq!(r.ref_type(), ty);
        }
    }
    assert_eq!(Reference::field("x"), Reference::field("x"));
    assert_ne!(Reference::field("x"), Reference::SrcField("x".into()));
}
