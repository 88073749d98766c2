//! Basic attribute type and functional-constraint tags.

use std::fmt;

/// Basic type of a data attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    Int8U,
    Int16U,
    Int32U,
    Float32,
    Float64,
    Enumerated,
    VisString32,
    VisString64,
    VisString129,
    VisString255,
    UnicodeString255,
    OctetString64,
    Quality,
    Timestamp,
    Constructed,
}

impl AttributeType {
    /// Type used when a model names an unknown or missing type.
    pub const FALLBACK: AttributeType = AttributeType::VisString255;

    /// Case-insensitive lookup.
    ///
    /// Accepts both the canonical engine names (`VIS_STRING_64`) and the
    /// short names used by the GUI's data model (`VisString64`, `Enum`).
    pub fn parse(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let ty = match upper.as_str() {
            "BOOLEAN" | "BOOL" => AttributeType::Boolean,
            "INT8" => AttributeType::Int8,
            "INT16" => AttributeType::Int16,
            "INT24" | "INT32" => AttributeType::Int32,
            "INT64" | "INT128" => AttributeType::Int64,
            "INT8U" => AttributeType::Int8U,
            "INT16U" => AttributeType::Int16U,
            "INT24U" | "INT32U" => AttributeType::Int32U,
            "FLOAT32" => AttributeType::Float32,
            "FLOAT64" => AttributeType::Float64,
            "ENUM" | "ENUMERATED" | "DBPOS" | "TCMD" => AttributeType::Enumerated,
            "VIS_STRING_32" | "VISSTRING32" => AttributeType::VisString32,
            "VIS_STRING_64" | "VISSTRING64" | "OBJREF" => AttributeType::VisString64,
            "VIS_STRING_129" | "VISSTRING129" => AttributeType::VisString129,
            "VIS_STRING_255" | "VISSTRING255" => AttributeType::VisString255,
            "UNICODE_STRING_255" | "UNICODE255" => AttributeType::UnicodeString255,
            "OCTET_STRING_64" | "OCTET64" => AttributeType::OctetString64,
            "QUALITY" => AttributeType::Quality,
            "TIMESTAMP" | "ENTRYTIME" => AttributeType::Timestamp,
            "CONSTRUCTED" | "STRUCT" => AttributeType::Constructed,
            _ => return None,
        };
        Some(ty)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttributeType::Boolean => "BOOLEAN",
            AttributeType::Int8 => "INT8",
            AttributeType::Int16 => "INT16",
            AttributeType::Int32 => "INT32",
            AttributeType::Int64 => "INT64",
            AttributeType::Int8U => "INT8U",
            AttributeType::Int16U => "INT16U",
            AttributeType::Int32U => "INT32U",
            AttributeType::Float32 => "FLOAT32",
            AttributeType::Float64 => "FLOAT64",
            AttributeType::Enumerated => "ENUMERATED",
            AttributeType::VisString32 => "VIS_STRING_32",
            AttributeType::VisString64 => "VIS_STRING_64",
            AttributeType::VisString129 => "VIS_STRING_129",
            AttributeType::VisString255 => "VIS_STRING_255",
            AttributeType::UnicodeString255 => "UNICODE_STRING_255",
            AttributeType::OctetString64 => "OCTET_STRING_64",
            AttributeType::Quality => "QUALITY",
            AttributeType::Timestamp => "TIMESTAMP",
            AttributeType::Constructed => "CONSTRUCTED",
        }
    }

    /// Inclusive value range of a signed integer type.
    pub(crate) fn signed_range(&self) -> Option<(i64, i64)> {
        match self {
            AttributeType::Int8 => Some((i8::MIN.into(), i8::MAX.into())),
            AttributeType::Int16 => Some((i16::MIN.into(), i16::MAX.into())),
            AttributeType::Int32 | AttributeType::Enumerated => {
                Some((i32::MIN.into(), i32::MAX.into()))
            }
            AttributeType::Int64 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }

    /// Upper bound of an unsigned integer type.
    pub(crate) fn unsigned_max(&self) -> Option<u32> {
        match self {
            AttributeType::Int8U => Some(u8::MAX.into()),
            AttributeType::Int16U => Some(u16::MAX.into()),
            AttributeType::Int32U => Some(u32::MAX),
            _ => None,
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(
            self,
            AttributeType::VisString32
                | AttributeType::VisString64
                | AttributeType::VisString129
                | AttributeType::VisString255
                | AttributeType::UnicodeString255
        )
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Functional constraint of a data attribute.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionalConstraint {
    ST,
    MX,
    SP,
    SV,
    CF,
    DC,
    SG,
    SE,
    SR,
    OR,
    BL,
    EX,
    CO,
}

impl FunctionalConstraint {
    /// Constraint used when a model names an unknown or missing FC.
    pub const FALLBACK: FunctionalConstraint = FunctionalConstraint::ST;

    /// Case-insensitive lookup.
    pub fn parse(name: &str) -> Option<Self> {
        let fc = match name.trim().to_ascii_uppercase().as_str() {
            "ST" => FunctionalConstraint::ST,
            "MX" => FunctionalConstraint::MX,
            "SP" => FunctionalConstraint::SP,
            "SV" => FunctionalConstraint::SV,
            "CF" => FunctionalConstraint::CF,
            "DC" => FunctionalConstraint::DC,
            "SG" => FunctionalConstraint::SG,
            "SE" => FunctionalConstraint::SE,
            "SR" => FunctionalConstraint::SR,
            "OR" => FunctionalConstraint::OR,
            "BL" => FunctionalConstraint::BL,
            "EX" => FunctionalConstraint::EX,
            "CO" => FunctionalConstraint::CO,
            _ => return None,
        };
        Some(fc)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FunctionalConstraint::ST => "ST",
            FunctionalConstraint::MX => "MX",
            FunctionalConstraint::SP => "SP",
            FunctionalConstraint::SV => "SV",
            FunctionalConstraint::CF => "CF",
            FunctionalConstraint::DC => "DC",
            FunctionalConstraint::SG => "SG",
            FunctionalConstraint::SE => "SE",
            FunctionalConstraint::SR => "SR",
            FunctionalConstraint::OR => "OR",
            FunctionalConstraint::BL => "BL",
            FunctionalConstraint::EX => "EX",
            FunctionalConstraint::CO => "CO",
        }
    }
}

impl fmt::Display for FunctionalConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_lookup_is_case_insensitive() {
        assert_eq!(AttributeType::parse("boolean"), Some(AttributeType::Boolean));
        assert_eq!(AttributeType::parse("INT16U"), Some(AttributeType::Int16U));
        assert_eq!(AttributeType::parse("VisString64"), Some(AttributeType::VisString64));
        assert_eq!(AttributeType::parse("vis_string_129"), Some(AttributeType::VisString129));
        assert_eq!(AttributeType::parse("Enum"), Some(AttributeType::Enumerated));
        assert_eq!(AttributeType::parse("Dbpos"), Some(AttributeType::Enumerated));
        assert_eq!(AttributeType::parse("nonsense"), None);
    }

    #[test]
    fn test_fc_lookup_and_fallback() {
        assert_eq!(FunctionalConstraint::parse("mx"), Some(FunctionalConstraint::MX));
        assert_eq!(FunctionalConstraint::parse(" co "), Some(FunctionalConstraint::CO));
        assert_eq!(FunctionalConstraint::parse("XX"), None);
        assert_eq!(FunctionalConstraint::FALLBACK, FunctionalConstraint::ST);
        assert_eq!(AttributeType::FALLBACK, AttributeType::VisString255);
    }

    #[test]
    fn test_integer_bounds() {
        assert_eq!(AttributeType::Int8.signed_range(), Some((-128, 127)));
        assert_eq!(AttributeType::Int16U.unsigned_max(), Some(65535));
        assert_eq!(AttributeType::Float32.signed_range(), None);
    }
}
