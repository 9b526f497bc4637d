// Fixed size arrays don't get a Serde impl past 32 elements, and the Seq fallback is painfully slow for the big blocks
// of memory in this emulator anyway. So we wrap each of them in a newtype that serializes as a single byte blob, and
// implement enough of std::ops that the wrapped data can still be indexed/sliced transparently.
// IMPORTANT: memory segments can only be made out of primitive types. We shuffle the contents in and out as &[u8]
// slices with some unsafe code below. Multi-byte element types are stored in native byte order.
#[macro_export]
macro_rules! memory_segment {
    ( $name:ident; $type:tt; $size:tt ) => {
        #[repr(C)]
        #[derive(Clone)]
        pub struct $name([$type; $size]);

        impl Default for $name {
            fn default() -> $name {
                $name([Default::default(); $size])
            }
        }

        impl std::ops::Deref for $name {
            type Target = [$type];

            fn deref(&self) -> &[$type] {
                &self.0
            }
        }

        impl std::ops::DerefMut for $name {
            fn deref_mut(&mut self) -> &mut [$type] {
                &mut self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                let slice: &[u8] = unsafe {
                    std::slice::from_raw_parts(self.0.as_ptr() as *const u8, std::mem::size_of::<$type>() * $size)
                };
                serializer.serialize_bytes(slice)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<$name, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct SegmentVisitor;

                impl<'de> serde::de::Visitor<'de> for SegmentVisitor {
                    type Value = $name;

                    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                        write!(formatter, "a byte blob holding {} elements", $size)
                    }

                    fn visit_bytes<E>(self, value: &[u8]) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        let expected_size = std::mem::size_of::<$type>() * $size;
                        if value.len() != expected_size {
                            return Err(E::invalid_length(value.len(), &self));
                        }

                        let mut segment: $name = Default::default();
                        unsafe {
                            let dst = segment.0.as_mut_ptr() as *mut u8;
                            std::ptr::copy_nonoverlapping(value.as_ptr(), dst, expected_size);
                        }
                        Ok(segment)
                    }

                    fn visit_byte_buf<E>(self, value: Vec<u8>) -> Result<Self::Value, E>
                    where
                        E: serde::de::Error,
                    {
                        self.visit_bytes(&value)
                    }
                }

                deserializer.deserialize_bytes(SegmentVisitor)
            }
        }
    };
}

/// Expands a 5-bit colour channel to 8 bits, replicating the high bits into the bottom so that 0x1F maps to 0xFF.
#[inline]
pub fn expand_5bit(c: u16) -> u8 {
    let c = (c & 0x1F) as u8;
    (c << 3) | (c >> 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    memory_segment! { TestSegment; u16; 48 }

    // Test that a segment survives a trip through bincode as a single blob.
    #[test]
    fn test_segment_serde() {
        let mut seg = TestSegment::default();
        for (i, v) in seg.iter_mut().enumerate() {
            *v = (i as u16) * 0x0101;
        }

        let bytes = bincode::serialize(&seg).unwrap();
        assert_eq!(bytes.len(), 8 + 96);
        let restored: TestSegment = bincode::deserialize(&bytes).unwrap();
        assert_eq!(&restored[..], &seg[..]);
    }

    // Test that a blob of the wrong size is rejected instead of partially copied.
    #[test]
    fn test_segment_wrong_size() {
        let bytes = bincode::serialize(&serde_bytes::Bytes::new(&[1, 2, 3])).unwrap();
        assert!(bincode::deserialize::<TestSegment>(&bytes).is_err());
    }

    #[test]
    fn test_expand_5bit() {
        assert_eq!(expand_5bit(0), 0);
        assert_eq!(expand_5bit(0x1F), 0xFF);
        assert_eq!(expand_5bit(0x10), 0x84);
    }
}
