use hashbrown::HashMap;

use rye_core::Value;

/// Append-only interned value pool, addressable by small integer keys.
/// Scalar ints and doubles are deduplicated through secondary maps; other
/// values are appended as-is.
#[derive(Default)]
pub struct Pool {
    values: Vec<Value>,
    ints: HashMap<i32, u32>,
    reals: HashMap<u64, u32>,
}

impl Pool {
    pub fn new() -> Pool {
        Pool::default()
    }

    /// A pool whose key 0 is reserved (holds null); used for the source pool
    /// where key 0 means "no source of its own".
    pub fn with_reserved_zero() -> Pool {
        let mut pool = Pool::default();
        pool.values.push(Value::null());
        pool
    }

    pub fn insert(&mut self, value: Value) -> u32 {
        if let Some(i) = value.as_int_scalar() {
            if !value.has_attrs() {
                if let Some(&idx) = self.ints.get(&i) {
                    return idx;
                }
                let idx = self.push(value);
                self.ints.insert(i, idx);
                return idx;
            }
        } else if let Some(x) = value.as_real_scalar() {
            if !value.has_attrs() {
                let bits = x.to_bits();
                if let Some(&idx) = self.reals.get(&bits) {
                    return idx;
                }
                let idx = self.push(value);
                self.reals.insert(bits, idx);
                return idx;
            }
        }
        self.push(value)
    }

    fn push(&mut self, value: Value) -> u32 {
        let idx = self.values.len() as u32;
        self.values.push(value);
        idx
    }

    pub fn get(&self, idx: u32) -> Value {
        self.values[idx as usize].clone()
    }

    pub fn try_get(&self, idx: u32) -> Option<Value> {
        self.values.get(idx as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_dedup() {
        let mut pool = Pool::new();
        let a = pool.insert(Value::int(42));
        let b = pool.insert(Value::int(42));
        assert_eq!(a, b);
        let c = pool.insert(Value::real(1.5));
        let d = pool.insert(Value::real(1.5));
        assert_eq!(c, d);
        assert_ne!(a, c);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_non_numeric_appends() {
        let mut pool = Pool::new();
        let a = pool.insert(Value::sym("x"));
        let b = pool.insert(Value::sym("x"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_reserved_zero() {
        let mut pool = Pool::with_reserved_zero();
        assert!(pool.get(0).is_null());
        let k = pool.insert(Value::sym("f"));
        assert!(k >= 1);
    }
}
