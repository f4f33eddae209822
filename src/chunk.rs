//! The unit of data moving through a stream.

use std::sync::Arc;

/// An opaque, sized unit of data.
///
/// In byte mode a queue accounts each chunk by [`Chunk::byte_len`]; in object
/// mode every chunk counts as one unit regardless of its contents.
pub trait Chunk: Send + 'static {
    /// Length of the chunk in bytes.
    fn byte_len(&self) -> usize;
}

impl Chunk for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl Chunk for Box<[u8]> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl Chunk for Arc<[u8]> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl Chunk for &'static [u8] {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl Chunk for String {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl Chunk for Arc<str> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

impl Chunk for &'static str {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

macro_rules! scalar_chunk {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Chunk for $ty {
                fn byte_len(&self) -> usize {
                    std::mem::size_of::<$ty>()
                }
            }
        )*
    };
}

scalar_chunk!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char);
