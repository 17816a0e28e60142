//! Fixed-size scalars that can be loaded from and stored into an arena.
//!
//! All values are encoded little-endian regardless of the host platform so
//! that arena contents mean the same thing on every machine.

/// Size in bytes of an address cell stored inside the arena.
pub const ADDRESS_SIZE: usize = 8;

/// An arena-relative byte offset.
pub type Address = usize;

/// A plain scalar with a fixed little-endian byte representation.
pub trait Primitive: Copy {
    const SIZE: usize;

    /// Decode from the first `SIZE` bytes of `bytes`.
    fn read_le(bytes: &[u8]) -> Self;

    /// Encode into the first `SIZE` bytes of `out`.
    fn write_le(self, out: &mut [u8]);
}

macro_rules! impl_primitive {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Primitive for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    buf.copy_from_slice(&bytes[..Self::SIZE]);
                    <$ty>::from_le_bytes(buf)
                }

                #[inline]
                fn write_le(self, out: &mut [u8]) {
                    out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_primitive!(i8, u8, i16, u16, i32, u32, i64, u64, f32, f64);

impl Primitive for bool {
    const SIZE: usize = 1;

    #[inline]
    fn read_le(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }

    #[inline]
    fn write_le(self, out: &mut [u8]) {
        out[0] = self as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        let mut buf = [0u8; 4];
        0x0102_0304u32.write_le(&mut buf);
        assert_eq!(buf, [4, 3, 2, 1]);
        assert_eq!(u32::read_le(&buf), 0x0102_0304);
    }

    #[test]
    fn test_bool() {
        let mut buf = [7u8; 1];
        false.write_le(&mut buf);
        assert_eq!(buf, [0]);
        assert!(bool::read_le(&[2]));
    }
}
