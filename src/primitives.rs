use crate::signature::Token;

use byteorder::ByteOrder;
use std::mem::size_of;

/// Fixed-size numeric types, which are aligned to their own size.
pub(crate) trait WirePrimitive: Copy {
    const TOKEN: Token;
    const SIZE: usize;

    fn write<B: ByteOrder>(self, out: &mut [u8]);
    fn read<B: ByteOrder>(buf: &[u8]) -> Self;
}

macro_rules! wire_primitive {
    ($type:ident, $token:ident, $read:ident, $write:ident) => {
        impl WirePrimitive for $type {
            const TOKEN: Token = Token::$token;
            const SIZE: usize = size_of::<$type>();

            fn write<B: ByteOrder>(self, out: &mut [u8]) {
                B::$write(out, self)
            }

            fn read<B: ByteOrder>(buf: &[u8]) -> Self {
                B::$read(buf)
            }
        }
    };
}

wire_primitive!(i16, Int16, read_i16, write_i16);
wire_primitive!(u16, UInt16, read_u16, write_u16);
wire_primitive!(i32, Int32, read_i32, write_i32);
wire_primitive!(u32, UInt32, read_u32, write_u32);
wire_primitive!(i64, Int64, read_i64, write_i64);
wire_primitive!(u64, UInt64, read_u64, write_u64);
wire_primitive!(f64, Double, read_f64, write_f64);

impl WirePrimitive for u8 {
    const TOKEN: Token = Token::Byte;
    const SIZE: usize = 1;

    fn write<B: ByteOrder>(self, out: &mut [u8]) {
        out[0] = self;
    }

    fn read<B: ByteOrder>(buf: &[u8]) -> Self {
        buf[0]
    }
}
