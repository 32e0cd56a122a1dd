//! Plain-old-data payload access.
//!
//! Array storages expose typed reads, writes, and increments over fixed
//! offsets of a record payload. The [`Primitive`] trait is what keeps
//! those operations monomorphic: one instantiation per integer/float
//! width, no dispatch at run time.

/// A fixed-width value that can live at an offset inside a record payload.
pub trait Primitive: Copy + PartialEq + std::fmt::Debug {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// Decode from little-endian bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Encode into little-endian bytes.
    fn write_le(&self, out: &mut [u8]);

    /// Addition for `increment`; integer types wrap.
    fn add(self, other: Self) -> Self;
}

macro_rules! int_primitive {
    ($($ty:ty),*) => {
        $(impl Primitive for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn read_le(bytes: &[u8]) -> Self {
                <$ty>::from_le_bytes(bytes[..Self::SIZE].try_into().unwrap())
            }

            fn write_le(&self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }

            fn add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
        })*
    };
}

macro_rules! float_primitive {
    ($($ty:ty),*) => {
        $(impl Primitive for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn read_le(bytes: &[u8]) -> Self {
                <$ty>::from_le_bytes(bytes[..Self::SIZE].try_into().unwrap())
            }

            fn write_le(&self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }

            fn add(self, other: Self) -> Self {
                self + other
            }
        })*
    };
}

int_primitive!(u8, u16, u32, u64, i8, i16, i32, i64);
float_primitive!(f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_and_adds() {
        let mut buf = [0u8; 8];
        1234567890123i64.write_le(&mut buf);
        assert_eq!(i64::read_le(&buf), 1234567890123);
        assert_eq!(5u32.add(7), 12);
        assert_eq!(u8::MAX.add(1), 0);
        assert_eq!(1.5f64.add(2.25), 3.75);
    }
}
