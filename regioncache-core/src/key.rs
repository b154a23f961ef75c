//! Logical cache keys.

use std::borrow::Cow;
use uuid::Uuid;

/// A logical key within a region.
///
/// A key whose rendered form is empty is the null key: reads treat it as a
/// miss and writes reject it.
pub trait CacheKey {
    fn cache_key(&self) -> Cow<'_, str>;

    fn is_null_key(&self) -> bool {
        self.cache_key().is_empty()
    }
}

impl CacheKey for str {
    fn cache_key(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl CacheKey for String {
    fn cache_key(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.as_str())
    }
}

impl<T: CacheKey + ?Sized> CacheKey for &T {
    fn cache_key(&self) -> Cow<'_, str> {
        (**self).cache_key()
    }
}

impl<T: CacheKey> CacheKey for Option<T> {
    fn cache_key(&self) -> Cow<'_, str> {
        match self {
            Some(key) => key.cache_key(),
            None => Cow::Borrowed(""),
        }
    }
}

impl CacheKey for Uuid {
    fn cache_key(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }
}

macro_rules! integer_cache_key {
    ($($ty:ty),*) => {
        $(
            impl CacheKey for $ty {
                fn cache_key(&self) -> Cow<'_, str> {
                    Cow::Owned(self.to_string())
                }
            }
        )*
    };
}

integer_cache_key!(i32, i64, u32, u64, usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_like_keys() {
        assert_eq!("user".cache_key(), "user");
        assert_eq!(String::from("user").cache_key(), "user");
        assert_eq!((&"user").cache_key(), "user");
    }

    #[test]
    fn test_null_keys() {
        assert!("".is_null_key());
        assert!(None::<&str>.is_null_key());
        assert!(!Some("a").is_null_key());
        assert!(!0u64.is_null_key());
    }

    #[test]
    fn test_numeric_and_uuid_keys() {
        assert_eq!(42u64.cache_key(), "42");
        assert_eq!((-3i32).cache_key(), "-3");
        assert_eq!(Uuid::nil().cache_key(), "00000000-0000-0000-0000-000000000000");
    }
}
