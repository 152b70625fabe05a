//! The FIT base types. Every base type has a designated "not available"
//! sentinel stored on the wire when a device has no value for a field;
//! wrappers keep the raw value and expose the sentinel check.
use super::decode::FitError;

macro_rules! fit_scalar {
    ($(#[$attr:meta])* $name:ident, $prim:ty, $na:expr) => {
        $(#[$attr])*
        #[derive(Clone, Copy, Debug, PartialEq)]
        pub struct $name(pub $prim);

        impl $name {
            pub const NA: $prim = $na;

            pub fn is_na(&self) -> bool {
                self.0 == Self::NA
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name(Self::NA)
            }
        }
    };
}

fit_scalar!(/** `enum` (0x00) */ FitEnum, u8, 0xFF);
fit_scalar!(/** `sint8` (0x01) */ FitSint8, i8, 0x7F);
fit_scalar!(/** `uint8` (0x02) */ FitUint8, u8, 0xFF);
fit_scalar!(/** `sint16` (0x83) */ FitSint16, i16, 0x7FFF);
fit_scalar!(/** `uint16` (0x84) */ FitUint16, u16, 0xFFFF);
fit_scalar!(/** `sint32` (0x85) */ FitSint32, i32, 0x7FFF_FFFF);
fit_scalar!(/** `uint32` (0x86) */ FitUint32, u32, 0xFFFF_FFFF);
fit_scalar!(/** `string` (0x07) */ FitChar, u8, 0x00);
fit_scalar!(/** `uint8z` (0x0A) */ FitUint8z, u8, 0x00);
fit_scalar!(/** `uint16z` (0x8B) */ FitUint16z, u16, 0x0000);
fit_scalar!(/** `uint32z` (0x8C) */ FitUint32z, u32, 0x0000_0000);
fit_scalar!(/** `byte` (0x0D) */ FitByte, u8, 0xFF);

/// `float32` (0x88). The sentinel is the all-ones bit pattern, which is a
/// NaN, so the check has to compare bits rather than values.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FitFloat32(pub f32);

impl FitFloat32 {
    pub fn is_na(&self) -> bool {
        self.0.to_bits() == u32::MAX
    }
}

impl Default for FitFloat32 {
    fn default() -> Self {
        FitFloat32(f32::from_bits(u32::MAX))
    }
}

/// `float64` (0x89). All-ones sentinel, as for `float32`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FitFloat64(pub f64);

impl FitFloat64 {
    pub fn is_na(&self) -> bool {
        self.0.to_bits() == u64::MAX
    }
}

impl Default for FitFloat64 {
    fn default() -> Self {
        FitFloat64(f64::from_bits(u64::MAX))
    }
}

/// Width in bytes of a base type.
pub(crate) fn base_type_size(base_type: u8) -> Result<usize, FitError> {
    match base_type {
        0x00 | 0x01 | 0x02 | 0x07 | 0x0A | 0x0D => Ok(1),
        0x83 | 0x84 | 0x8B => Ok(2),
        0x85 | 0x86 | 0x88 | 0x8C => Ok(4),
        0x89 => Ok(8),
        other => Err(FitError::BadTypeId(other)),
    }
}

/// A single decoded scalar of any base type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Enum(FitEnum),
    Sint8(FitSint8),
    Uint8(FitUint8),
    Sint16(FitSint16),
    Uint16(FitUint16),
    Sint32(FitSint32),
    Uint32(FitUint32),
    Char(FitChar),
    Float32(FitFloat32),
    Float64(FitFloat64),
    Uint8z(FitUint8z),
    Uint16z(FitUint16z),
    Uint32z(FitUint32z),
    Byte(FitByte),
}

impl Value {
    pub fn is_na(&self) -> bool {
        match self {
            Value::Enum(v) => v.is_na(),
            Value::Sint8(v) => v.is_na(),
            Value::Uint8(v) => v.is_na(),
            Value::Sint16(v) => v.is_na(),
            Value::Uint16(v) => v.is_na(),
            Value::Sint32(v) => v.is_na(),
            Value::Uint32(v) => v.is_na(),
            Value::Char(v) => v.is_na(),
            Value::Float32(v) => v.is_na(),
            Value::Float64(v) => v.is_na(),
            Value::Uint8z(v) => v.is_na(),
            Value::Uint16z(v) => v.is_na(),
            Value::Uint32z(v) => v.is_na(),
            Value::Byte(v) => v.is_na(),
        }
    }

    /// Integer value widened to u64, or None when the value is NA or not an
    /// integer type. Signed values wrap; callers assigning into a narrower
    /// wrapper truncate, matching how FIT fields are re-typed in practice.
    pub fn as_u64(&self) -> Option<u64> {
        if self.is_na() {
            return None;
        }
        match self {
            Value::Enum(v) => Some(v.0 as u64),
            Value::Sint8(v) => Some(v.0 as u64),
            Value::Uint8(v) => Some(v.0 as u64),
            Value::Sint16(v) => Some(v.0 as u64),
            Value::Uint16(v) => Some(v.0 as u64),
            Value::Sint32(v) => Some(v.0 as u64),
            Value::Uint32(v) => Some(v.0 as u64),
            Value::Char(v) => Some(v.0 as u64),
            Value::Uint8z(v) => Some(v.0 as u64),
            Value::Uint16z(v) => Some(v.0 as u64),
            Value::Uint32z(v) => Some(v.0 as u64),
            Value::Byte(v) => Some(v.0 as u64),
            Value::Float32(_) | Value::Float64(_) => None,
        }
    }

    pub(crate) fn to_enum(self) -> FitEnum {
        self.as_u64().map(|v| FitEnum(v as u8)).unwrap_or_default()
    }

    pub(crate) fn to_uint8(self) -> FitUint8 {
        self.as_u64().map(|v| FitUint8(v as u8)).unwrap_or_default()
    }

    pub(crate) fn to_uint16(self) -> FitUint16 {
        self.as_u64()
            .map(|v| FitUint16(v as u16))
            .unwrap_or_default()
    }

    pub(crate) fn to_uint32(self) -> FitUint32 {
        self.as_u64()
            .map(|v| FitUint32(v as u32))
            .unwrap_or_default()
    }

    pub(crate) fn to_uint32z(self) -> FitUint32z {
        self.as_u64()
            .map(|v| FitUint32z(v as u32))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn na_sentinels() {
        assert!(FitUint16(0xFFFF).is_na());
        assert!(!FitUint16(0xFFFE).is_na());
        assert!(FitSint8(0x7F).is_na());
        assert!(!FitSint8(-1).is_na());
        assert!(FitUint32z(0).is_na());
        assert!(!FitUint32z(1).is_na());
        assert!(FitChar(0).is_na());
        assert!(FitFloat32(f32::from_bits(u32::MAX)).is_na());
        assert!(!FitFloat32(0.0).is_na());
        assert!(FitFloat64(f64::from_bits(u64::MAX)).is_na());
    }

    #[test]
    fn defaults_are_na() {
        assert!(FitEnum::default().is_na());
        assert!(FitUint32::default().is_na());
        assert!(FitFloat64::default().is_na());
    }

    #[test]
    fn value_widening() {
        assert_eq!(Value::Uint16(FitUint16(0x010A)).as_u64(), Some(0x010A));
        assert_eq!(Value::Uint16(FitUint16::default()).as_u64(), None);
        assert_eq!(Value::Float32(FitFloat32(1.0)).as_u64(), None);
        assert_eq!(Value::Enum(FitEnum(4)).to_uint16(), FitUint16(4));
        assert!(Value::Uint32(FitUint32::default())
            .to_uint32()
            .is_na());
    }

    #[test]
    fn base_type_widths() {
        for (id, width) in [
            (0x00u8, 1usize),
            (0x01, 1),
            (0x02, 1),
            (0x83, 2),
            (0x84, 2),
            (0x85, 4),
            (0x86, 4),
            (0x07, 1),
            (0x88, 4),
            (0x89, 8),
            (0x0A, 1),
            (0x8B, 2),
            (0x8C, 4),
            (0x0D, 1),
        ] {
            assert_eq!(base_type_size(id).unwrap(), width, "type {id:#04x}");
        }
        assert!(matches!(base_type_size(0x1B), Err(FitError::BadTypeId(0x1B))));
    }
}
