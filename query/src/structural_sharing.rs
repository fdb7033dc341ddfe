//! Structural sharing between successive query values.
//!
//! When a query refetches and the new value is equal to the old one in whole or in part,
//! consumers should keep seeing the *same* allocations for the unchanged parts. For
//! reference counted containers this is observable with [`Rc::ptr_eq`], which is what
//! memoizing consumers compare.

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hash,
    rc::Rc,
    sync::Arc,
};

/// A value that can be rebuilt from a newer version while reusing the unchanged parts of an
/// older one.
///
/// The provided [`share`](Self::share) is the deep-equality fallback: if `prev == next` the
/// previous value is returned, otherwise `next`. Containers override it to recurse.
///
/// Implementations must return a value equal to `next` and must not observe any difference
/// between `prev` and the returned value other than allocation identity.
pub trait StructuralShare: Clone + PartialEq {
    /// Returns a value equal to `next` that reuses `prev` wherever a subtree is unchanged,
    /// along with whether nothing changed at all.
    ///
    /// Containers keep their own previous allocation exactly when every child reports no change.
    fn share(prev: &Self, next: Self) -> (Self, bool) {
        if *prev == next {
            (prev.clone(), true)
        } else {
            (next, false)
        }
    }

    /// Returns a value equal to `next` that reuses `prev` wherever a subtree is unchanged.
    fn replace_equal_deep(prev: &Self, next: Self) -> Self {
        Self::share(prev, next).0
    }
}

/// Returns a value equal to `next` that reuses `prev` wherever a subtree is unchanged.
///
/// ```
/// use query_core::replace_equal_deep;
/// use std::{collections::BTreeMap, rc::Rc};
///
/// let a = Rc::new(vec![1, 2]);
/// let prev = Rc::new(BTreeMap::from([("a".to_string(), a.clone()), ("b".to_string(), Rc::new(vec![3]))]));
/// let next = Rc::new(BTreeMap::from([("a".to_string(), Rc::new(vec![1, 2])), ("b".to_string(), Rc::new(vec![4]))]));
///
/// let result = replace_equal_deep(&prev, next);
/// assert!(Rc::ptr_eq(&result["a"], &a));
/// assert!(!Rc::ptr_eq(&result, &prev));
/// ```
pub fn replace_equal_deep<T: StructuralShare>(prev: &T, next: T) -> T {
    T::replace_equal_deep(prev, next)
}

macro_rules! impl_structural_share_by_equality {
    ($($ty:ty),* $(,)?) => {
        $(impl StructuralShare for $ty {})*
    };
}

impl_structural_share_by_equality!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64,
    String,
    &'static str,
    crate::Instant,
    serde_json::Value,
);

impl<T: StructuralShare> StructuralShare for Option<T> {
    fn share(prev: &Self, next: Self) -> (Self, bool) {
        match (prev, next) {
            (Some(prev), Some(next)) => {
                let (shared, unchanged) = T::share(prev, next);
                (Some(shared), unchanged)
            }
            (None, None) => (None, true),
            (_, next) => (next, false),
        }
    }
}

impl<T: StructuralShare, E: StructuralShare> StructuralShare for Result<T, E> {
    fn share(prev: &Self, next: Self) -> (Self, bool) {
        match (prev, next) {
            (Ok(prev), Ok(next)) => {
                let (shared, unchanged) = T::share(prev, next);
                (Ok(shared), unchanged)
            }
            (Err(prev), Err(next)) => {
                let (shared, unchanged) = E::share(prev, next);
                (Err(shared), unchanged)
            }
            (_, next) => (next, false),
        }
    }
}

impl<T: StructuralShare> StructuralShare for Vec<T> {
    fn share(prev: &Self, next: Self) -> (Self, bool) {
        if prev.len() != next.len() {
            return (next, false);
        }
        let mut unchanged = true;
        let shared = prev
            .iter()
            .zip(next)
            .map(|(prev, next)| {
                let (shared, same) = T::share(prev, next);
                unchanged &= same;
                shared
            })
            .collect();
        (shared, unchanged)
    }
}

impl<K, T> StructuralShare for BTreeMap<K, T>
where
    K: Ord + Clone,
    T: StructuralShare,
{
    fn share(prev: &Self, next: Self) -> (Self, bool) {
        // Same count is not enough, every key of `next` must exist in `prev`.
        if prev.len() != next.len() || next.keys().any(|key| !prev.contains_key(key)) {
            return (next, false);
        }
        let mut unchanged = true;
        let shared = next
            .into_iter()
            .map(|(key, next)| {
                let value = match prev.get(&key) {
                    Some(prev) => {
                        let (shared, same) = T::share(prev, next);
                        unchanged &= same;
                        shared
                    }
                    None => {
                        unchanged = false;
                        next
                    }
                };
                (key, value)
            })
            .collect();
        (shared, unchanged)
    }
}

impl<K, T> StructuralShare for HashMap<K, T>
where
    K: Eq + Hash + Clone,
    T: StructuralShare,
{
    fn share(prev: &Self, next: Self) -> (Self, bool) {
        if prev.len() != next.len() || next.keys().any(|key| !prev.contains_key(key)) {
            return (next, false);
        }
        let mut unchanged = true;
        let shared = next
            .into_iter()
            .map(|(key, next)| {
                let value = match prev.get(&key) {
                    Some(prev) => {
                        let (shared, same) = T::share(prev, next);
                        unchanged &= same;
                        shared
                    }
                    None => {
                        unchanged = false;
                        next
                    }
                };
                (key, value)
            })
            .collect();
        (shared, unchanged)
    }
}

impl<T: StructuralShare> StructuralShare for Rc<T> {
    fn share(prev: &Self, next: Self) -> (Self, bool) {
        if Rc::ptr_eq(prev, &next) {
            return (prev.clone(), true);
        }
        let next = Rc::try_unwrap(next).unwrap_or_else(|shared| (*shared).clone());
        match T::share(prev, next) {
            (_, true) => (prev.clone(), true),
            (shared, false) => (Rc::new(shared), false),
        }
    }
}

impl<T: StructuralShare> StructuralShare for Arc<T> {
    fn share(prev: &Self, next: Self) -> (Self, bool) {
        if Arc::ptr_eq(prev, &next) {
            return (prev.clone(), true);
        }
        let next = Arc::try_unwrap(next).unwrap_or_else(|shared| (*shared).clone());
        match T::share(prev, next) {
            (_, true) => (prev.clone(), true),
            (shared, false) => (Arc::new(shared), false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Node = Rc<BTreeMap<String, Rc<Vec<u32>>>>;

    fn node(entries: &[(&str, &[u32])]) -> Node {
        Rc::new(
            entries
                .iter()
                .map(|(key, values)| (key.to_string(), Rc::new(values.to_vec())))
                .collect(),
        )
    }

    #[test]
    fn identical_reference_is_returned() {
        let value = node(&[("a", &[1])]);
        let result = replace_equal_deep(&value, value.clone());
        assert!(Rc::ptr_eq(&result, &value));
    }

    #[test]
    fn deep_equal_value_reuses_previous() {
        let prev = node(&[("a", &[1, 2]), ("b", &[3])]);
        let next = node(&[("a", &[1, 2]), ("b", &[3])]);

        let result = replace_equal_deep(&prev, next);
        assert!(Rc::ptr_eq(&result, &prev));
    }

    #[test]
    fn unchanged_subtrees_are_shared() {
        let prev = node(&[("a", &[1]), ("b", &[2])]);
        let next = node(&[("a", &[1]), ("b", &[3])]);

        let result = replace_equal_deep(&prev, next.clone());

        assert_eq!(result, next);
        assert!(!Rc::ptr_eq(&result, &prev));
        assert!(Rc::ptr_eq(&result["a"], &prev["a"]));
        assert!(!Rc::ptr_eq(&result["b"], &prev["b"]));
    }

    #[test]
    fn same_key_count_with_different_names_is_not_reused() {
        let prev = node(&[("a", &[1]), ("b", &[2])]);
        let next = node(&[("a", &[1]), ("c", &[2])]);

        let result = replace_equal_deep(&prev, next.clone());
        assert_eq!(result, next);
        assert!(!result.contains_key("b"));
    }

    #[test]
    fn arrays_of_different_length_take_next() {
        let prev = Rc::new(vec![Rc::new(1_u32), Rc::new(2)]);
        let next = Rc::new(vec![Rc::new(1_u32)]);

        let result = replace_equal_deep(&prev, next.clone());
        assert_eq!(result, next);
        assert!(Rc::ptr_eq(&result[0], &next[0]));
    }

    #[test]
    fn array_elements_are_shared_individually() {
        let prev = Rc::new(vec![Rc::new("x".to_string()), Rc::new("y".to_string())]);
        let next = Rc::new(vec![Rc::new("x".to_string()), Rc::new("z".to_string())]);

        let result = replace_equal_deep(&prev, next);
        assert!(Rc::ptr_eq(&result[0], &prev[0]));
        assert_eq!(*result[1], "z");
    }

    #[test]
    fn option_transitions() {
        let prev = Some(Rc::new(5_u32));
        let shared = replace_equal_deep(&prev, Some(Rc::new(5)));
        assert!(Rc::ptr_eq(shared.as_ref().unwrap(), prev.as_ref().unwrap()));

        assert_eq!(replace_equal_deep(&prev, None), None);
        assert_eq!(replace_equal_deep(&None, Some(Rc::new(1_u32))), Some(Rc::new(1)));
    }

    #[test]
    fn primitives_take_next_value() {
        assert_eq!(replace_equal_deep(&1_u32, 2), 2);
        assert_eq!(replace_equal_deep(&"a".to_string(), "b".to_string()), "b");
        assert!(replace_equal_deep(&f64::NAN, f64::NAN).is_nan());
    }

    thread_local! {
        static COMPARISONS: std::cell::Cell<usize> = std::cell::Cell::new(0);
    }

    #[derive(Debug, Clone)]
    struct Leaf(u32);

    impl PartialEq for Leaf {
        fn eq(&self, other: &Self) -> bool {
            COMPARISONS.with(|count| count.set(count.get() + 1));
            self.0 == other.0
        }
    }

    impl StructuralShare for Leaf {}

    #[test]
    fn nested_rcs_compare_each_leaf_once() {
        let tree = |leaves: &[u32]| {
            Rc::new(vec![
                Rc::new(vec![Rc::new(leaves.iter().copied().map(Leaf).collect::<Vec<_>>())]),
                Rc::new(vec![Rc::new(vec![Leaf(0)])]),
            ])
        };
        let prev = tree(&[1, 2, 3]);

        COMPARISONS.with(|count| count.set(0));
        let result = replace_equal_deep(&prev, tree(&[1, 2, 3]));
        assert!(Rc::ptr_eq(&result, &prev));
        assert_eq!(COMPARISONS.with(|count| count.get()), 4);

        COMPARISONS.with(|count| count.set(0));
        let result = replace_equal_deep(&prev, tree(&[1, 2, 4]));
        assert!(!Rc::ptr_eq(&result, &prev));
        assert!(Rc::ptr_eq(&result[1], &prev[1]));
        assert_eq!(COMPARISONS.with(|count| count.get()), 4);
    }

    #[test]
    fn inputs_are_not_mutated() {
        let prev = node(&[("a", &[1])]);
        let next = node(&[("a", &[2])]);
        let prev_snapshot = (*prev).clone();
        let next_snapshot = (*next).clone();

        let _ = replace_equal_deep(&prev, next.clone());

        assert_eq!(*prev, prev_snapshot);
        assert_eq!(*next, next_snapshot);
    }
}
