// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Integer address types usable as map keys and physical bases.

use core::fmt;

/// Unsigned integer that can serve as an address, a region size or a physical base.
///
/// All arithmetic inside the map happens on `u64`; implementors only provide lossless
/// widening, checked narrowing and a fixed little-endian encoding used for cluster slots.
pub trait AddrKey: Copy + Eq + Ord + fmt::Debug + fmt::LowerHex + 'static {
    /// Width of the type in bits.
    const BITS: u32;
    /// Encoded size in bytes.
    const BYTES: usize;
    /// Largest representable address (`KeyMax`).
    const MAX: Self;

    /// Widens the value to `u64`.
    fn to_u64(self) -> u64;

    /// Narrows `value`, returning `None` when it does not fit.
    fn try_from_u64(value: u64) -> Option<Self>;

    /// Writes the value into `out[..Self::BYTES]`.
    fn write_le(self, out: &mut [u8]);

    /// Reads a value previously stored with [`AddrKey::write_le`].
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_addr_key {
    ($($ty:ty),* $(,)?) => {
        $(
            impl AddrKey for $ty {
                const BITS: u32 = <$ty>::BITS;
                const BYTES: usize = core::mem::size_of::<$ty>();
                const MAX: Self = <$ty>::MAX;

                #[inline]
                fn to_u64(self) -> u64 {
                    self as u64
                }

                #[inline]
                fn try_from_u64(value: u64) -> Option<Self> {
                    <$ty>::try_from(value).ok()
                }

                #[inline]
                fn write_le(self, out: &mut [u8]) {
                    out[..Self::BYTES].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; core::mem::size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..Self::BYTES]);
                    <$ty>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_addr_key!(u16, u32, u64, usize);

static_assertions::const_assert!(usize::BITS <= u64::BITS);
