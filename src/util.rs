pub mod cpu;

pub type HashMap<K, T> = std::collections::HashMap<K, T, ahash::RandomState>;
pub type IndexMap<K, T> = indexmap::map::IndexMap<K, T, ahash::RandomState>;

#[macro_export]
macro_rules! some_or_return {
    ($body:expr, $return_fn:expr) => {
        match $body {
            Some(r) => r,
            None => {
                return $return_fn();
            }
        }
    };
    ($body:expr) => {
        match $body {
            Some(r) => r,
            None => {
                return;
            }
        }
    };
}
