//! Field encodings

use crate::stream::{StateStream, StreamMode};
use core_types::{AddressSpaceId, Handle, MachineId, ObjectId};

/// A value that can be saved to and loaded from a [`StateStream`]
///
/// Implementations must read exactly what they write, in the same order.
pub trait Absorb {
    fn absorb(&mut self, stream: &mut StateStream);
}

macro_rules! absorb_int {
    ($($t:ty),*) => {
        $(
            impl Absorb for $t {
                fn absorb(&mut self, stream: &mut StateStream) {
                    if stream.mode() == StreamMode::Read {
                        if let Some(bytes) = stream.take(std::mem::size_of::<$t>()) {
                            let mut raw = [0u8; std::mem::size_of::<$t>()];
                            raw.copy_from_slice(bytes);
                            *self = <$t>::from_le_bytes(raw);
                        }
                    } else {
                        stream.put(&self.to_le_bytes());
                    }
                }
            }
        )*
    };
}

absorb_int!(u8, u16, u32, u64, i8, i16, i32, i64);

impl Absorb for bool {
    fn absorb(&mut self, stream: &mut StateStream) {
        let mut raw = *self as u8;
        raw.absorb(stream);
        *self = raw != 0;
    }
}

/// Reads or writes a `u32` length prefix, rejecting lengths that cannot fit
fn absorb_len(stream: &mut StateStream, len: usize, min_item_size: usize) -> Option<usize> {
    let mut raw = len as u32;
    raw.absorb(stream);
    if stream.is_failed() {
        return None;
    }
    let len = raw as usize;
    if stream.is_reading() && len.saturating_mul(min_item_size) > stream.remaining() {
        // Force a truncation failure instead of allocating a bogus length
        stream.take(usize::MAX);
        return None;
    }
    Some(len)
}

impl Absorb for String {
    fn absorb(&mut self, stream: &mut StateStream) {
        let Some(len) = absorb_len(stream, self.len(), 1) else {
            return;
        };

        if stream.is_reading() {
            let Some(bytes) = stream.take(len) else {
                return;
            };
            match String::from_utf8(bytes.to_vec()) {
                Ok(text) => *self = text,
                Err(_) => stream.fail_invalid_string(),
            }
        } else {
            stream.put(self.as_bytes());
        }
    }
}

impl<T: Absorb + Default> Absorb for Vec<T> {
    fn absorb(&mut self, stream: &mut StateStream) {
        let Some(len) = absorb_len(stream, self.len(), 1) else {
            return;
        };

        if stream.is_reading() {
            self.clear();
            self.resize_with(len, T::default);
        }
        for item in self.iter_mut() {
            stream.absorb(item);
        }
    }
}

/// Fixed-size runs carry no length prefix
impl<T: Absorb> Absorb for [T] {
    fn absorb(&mut self, stream: &mut StateStream) {
        for item in self.iter_mut() {
            stream.absorb(item);
        }
    }
}

impl<T: Absorb, const N: usize> Absorb for [T; N] {
    fn absorb(&mut self, stream: &mut StateStream) {
        self.as_mut_slice().absorb(stream);
    }
}

impl<T: Absorb + Default> Absorb for Option<T> {
    fn absorb(&mut self, stream: &mut StateStream) {
        let mut present = self.is_some();
        present.absorb(stream);

        if stream.is_reading() && !stream.is_failed() {
            *self = if present { Some(T::default()) } else { None };
        }
        if let Some(value) = self {
            stream.absorb(value);
        }
    }
}

impl Absorb for ObjectId {
    fn absorb(&mut self, stream: &mut StateStream) {
        let mut raw = self.as_raw();
        raw.absorb(stream);
        *self = ObjectId::from_raw(raw);
    }
}

impl Absorb for Handle {
    fn absorb(&mut self, stream: &mut StateStream) {
        let mut raw = self.as_raw();
        raw.absorb(stream);
        *self = Handle::from_raw(raw);
    }
}

impl Absorb for AddressSpaceId {
    fn absorb(&mut self, stream: &mut StateStream) {
        let mut raw = self.as_raw();
        raw.absorb(stream);
        *self = AddressSpaceId::from_raw(raw);
    }
}

impl Absorb for MachineId {
    fn absorb(&mut self, stream: &mut StateStream) {
        let mut raw = *self.as_bytes();
        raw.absorb(stream);
        *self = MachineId::from_bytes(raw);
    }
}
