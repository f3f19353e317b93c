//! Key adapters for the pool-resident hash map.
//!
//! Plain-old-data keys are embedded in their bucket and compared by value.
//! String keys cannot be: a pointer is meaningless in another process, so
//! the bytes are copied into the pool on insert and the bucket stores the
//! copy's offset. Comparison and hashing then go by content, which keeps
//! bucket placement consistent across every process that maps the pool.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ptr;

use crate::pool::Pool;

/// How a key type is converted for storage in a shared bucket, compared
/// against a stored key, and hashed to a bucket index.
pub trait MapKey {
    /// The trivially copyable form a bucket embeds.
    type Stored: Copy;

    /// Produces the stored form, allocating pool memory if the key's bytes
    /// must live in the segment. `None` means the pool is exhausted.
    fn convert(&self, pool: &Pool) -> Option<Self::Stored>;

    /// Whether a stored key equals this one.
    fn matches(&self, stored: &Self::Stored, pool: &Pool) -> bool;

    /// Content hash. Must be identical in every participating process, so
    /// only deterministic hashers and only key bytes may feed it.
    fn hash_key(&self) -> u64;

    /// Releases any pool storage the stored form owns.
    fn release(stored: &Self::Stored, pool: &Pool);
}

macro_rules! pod_map_key {
    ($($t:ty),* $(,)?) => {$(
        impl MapKey for $t {
            type Stored = $t;

            fn convert(&self, _pool: &Pool) -> Option<$t> {
                Some(*self)
            }

            fn matches(&self, stored: &$t, _pool: &Pool) -> bool {
                stored == self
            }

            fn hash_key(&self) -> u64 {
                let mut hasher = DefaultHasher::new();
                self.hash(&mut hasher);
                hasher.finish()
            }

            fn release(_stored: &$t, _pool: &Pool) {}
        }
    )*};
}

pod_map_key!(i8, i16, i32, i64, u8, u16, u32, u64, isize, usize);

impl MapKey for &str {
    /// Pool offset of a NUL-terminated copy of the bytes.
    type Stored = i32;

    fn convert(&self, pool: &Pool) -> Option<i32> {
        let bytes = self.as_bytes();
        let offset = pool.allocate(bytes.len() + 1)?;
        unsafe {
            let dst: *mut u8 = pool.at_offset(offset);
            ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            dst.add(bytes.len()).write(0);
        }
        Some(offset)
    }

    fn matches(&self, stored: &i32, pool: &Pool) -> bool {
        let bytes = self.as_bytes();
        unsafe {
            let mut cursor: *const u8 = pool.at_offset(*stored);
            for &b in bytes {
                if cursor.read() != b || b == 0 {
                    return false;
                }
                cursor = cursor.add(1);
            }
            cursor.read() == 0
        }
    }

    fn hash_key(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        hasher.write(self.as_bytes());
        hasher.finish()
    }

    fn release(stored: &i32, pool: &Pool) {
        let len = unsafe {
            let base: *const u8 = pool.at_offset(*stored);
            let mut len = 0;
            while base.add(len).read() != 0 {
                len += 1;
            }
            len
        };
        pool.free(*stored, len + 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_pool;

    #[test]
    fn test_pod_keys_compare_by_value() {
        let pool = test_pool();
        let key = 42i32;
        let stored = key.convert(pool).unwrap();
        assert!(MapKey::matches(&key, &stored, pool));
        assert!(!MapKey::matches(&43i32, &stored, pool));
        assert_eq!(key.hash_key(), 42i32.hash_key());
    }

    #[test]
    fn test_str_keys_compare_by_content() {
        let pool = test_pool();
        let stored = "telemetry".convert(pool).unwrap();

        // A different &str with equal content matches; prefixes and
        // extensions do not.
        let other = String::from("telemetry");
        assert!(MapKey::matches(&other.as_str(), &stored, pool));
        assert!(!MapKey::matches(&"telemetr", &stored, pool));
        assert!(!MapKey::matches(&"telemetry2", &stored, pool));

        assert_eq!("telemetry".hash_key(), other.as_str().hash_key());
        assert_ne!("telemetry".hash_key(), "control".hash_key());

        <&str>::release(&stored, pool);
    }

    #[test]
    fn test_str_release_returns_storage() {
        let pool = test_pool();
        let stored = "abcdef".convert(pool).unwrap();
        assert!(pool.is_used(stored));
        <&str>::release(&stored, pool);
        assert!(!pool.is_used(stored));
    }
}
