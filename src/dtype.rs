//! Scalar element types, devices, and byte-level scalar access.

use std::fmt;

use half::f16;

/// Element type of a buffer or immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarType {
    Bool,
    Byte,
    Char,
    Short,
    Int,
    Long,
    Half,
    Float,
    Double,
}

impl ScalarType {
    pub fn size_bytes(self) -> usize {
        match self {
            ScalarType::Bool | ScalarType::Byte | ScalarType::Char => 1,
            ScalarType::Short | ScalarType::Half => 2,
            ScalarType::Int | ScalarType::Float => 4,
            ScalarType::Long | ScalarType::Double => 8,
        }
    }

    pub fn is_floating_point(self) -> bool {
        matches!(
            self,
            ScalarType::Half | ScalarType::Float | ScalarType::Double
        )
    }

    /// Result type of a binary op between `self` and `other`.
    ///
    /// The lattice is ordered Bool < integral < floating; within a class the
    /// wider type wins.
    pub fn promote(self, other: ScalarType) -> ScalarType {
        if self == other {
            return self;
        }
        match (self.is_floating_point(), other.is_floating_point()) {
            (true, false) => self,
            (false, true) => other,
            _ => self.max(other),
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::Bool => "bool",
            ScalarType::Byte => "byte",
            ScalarType::Char => "char",
            ScalarType::Short => "short",
            ScalarType::Int => "int",
            ScalarType::Long => "long",
            ScalarType::Half => "half",
            ScalarType::Float => "float",
            ScalarType::Double => "double",
        };
        write!(f, "{name}")
    }
}

/// Execution device. A kernel is compiled for exactly one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

/// Scalars that can be stored in and read out of untyped buffers.
pub trait Scalar: Copy {
    const DTYPE: ScalarType;
    fn from_bytes(bytes: &[u8]) -> Self;
    fn to_bytes(self) -> Vec<u8>;
}

macro_rules! impl_scalar {
    ($ty:ty, $dtype:expr) => {
        impl Scalar for $ty {
            const DTYPE: ScalarType = $dtype;
            fn from_bytes(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(&bytes[..std::mem::size_of::<$ty>()]);
                <$ty>::from_le_bytes(buf)
            }
            fn to_bytes(self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
        }
    };
}

impl_scalar!(u8, ScalarType::Byte);
impl_scalar!(i8, ScalarType::Char);
impl_scalar!(i16, ScalarType::Short);
impl_scalar!(i32, ScalarType::Int);
impl_scalar!(i64, ScalarType::Long);
impl_scalar!(f32, ScalarType::Float);
impl_scalar!(f64, ScalarType::Double);

impl Scalar for bool {
    const DTYPE: ScalarType = ScalarType::Bool;
    fn from_bytes(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
    fn to_bytes(self) -> Vec<u8> {
        vec![self as u8]
    }
}

impl Scalar for f16 {
    const DTYPE: ScalarType = ScalarType::Half;
    fn from_bytes(bytes: &[u8]) -> Self {
        f16::from_le_bytes([bytes[0], bytes[1]])
    }
    fn to_bytes(self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion() {
        assert_eq!(
            ScalarType::Int.promote(ScalarType::Float),
            ScalarType::Float
        );
        assert_eq!(
            ScalarType::Float.promote(ScalarType::Long),
            ScalarType::Float
        );
        assert_eq!(ScalarType::Int.promote(ScalarType::Long), ScalarType::Long);
        assert_eq!(
            ScalarType::Half.promote(ScalarType::Double),
            ScalarType::Double
        );
        assert_eq!(ScalarType::Bool.promote(ScalarType::Byte), ScalarType::Byte);
    }

    #[test]
    fn test_scalar_round_trip() {
        let x = 1.5f32;
        assert_eq!(f32::from_bytes(&x.to_bytes()), x);
        let n = -42i64;
        assert_eq!(i64::from_bytes(&n.to_bytes()), n);
        assert!(bool::from_bytes(&true.to_bytes()));
    }
}
