//! Structural deep copy for baseline snapshots.
//!
//! A snapshot must share no mutable storage with the live value it was taken
//! from, otherwise mutating the live entry would silently mutate the baseline
//! too and the change would never be detected. `Clone` is not enough for that:
//! cloning an `Arc<Mutex<T>>` hands back the same mutex. [`DeepCopy`] is the
//! stricter contract, implemented per shape below.
//!
//! # Shapes
//!
//! - Scalars and owned terminal values (`String`, integers, `Duration`, ...)
//!   are copied by value.
//! - `Option<T>`: `None` stays `None`, `Some` recurses.
//! - `Box<T>`, `Rc<T>` and `Arc<T>`: a fresh allocation holding a deep copy
//!   of the pointee. Two `Arc`s that shared a pointee before the copy no
//!   longer do after it.
//! - `Vec`, `VecDeque`, arrays and tuples: new backing storage, element-wise
//!   recursion. `Vec` keeps its capacity.
//! - `HashMap` and `BTreeMap`: keys are cloned, values recurse.
//! - `Cell<T: Copy>`, `RefCell`, `Mutex` and `RwLock`: a new cell or lock
//!   around a deep copy of the current content. A poisoned lock is read
//!   through.
//! - Records: [`deep_copy_struct!`](crate::deep_copy_struct) generates the
//!   field-by-field impl. Every field must be listed, private ones included.
//!
//! There is no impl for `Weak<T>`. A cycle of strong `Rc<RefCell<_>>` or
//! `Arc<Mutex<_>>` links recurses without bound.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::{BuildHasher, Hash};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

/// A value that can produce a copy sharing no mutable storage with itself.
pub trait DeepCopy: Sized {
    /// Produce a structurally equal, fully independent copy.
    fn deep_copy(&self) -> Self;
}

/// Free-function form of [`DeepCopy::deep_copy`].
pub fn deep_copy<T: DeepCopy>(value: &T) -> T {
    value.deep_copy()
}

/// Implement [`DeepCopy`] for a record by copying each listed field.
///
/// The generated struct literal has no `..rest`, so leaving a field out is a
/// compile error rather than a field silently reset in the snapshot.
///
/// ```
/// use cachedb_core::{deep_copy_struct, DeepCopy};
///
/// #[derive(Debug, PartialEq)]
/// struct Point {
///     x: i64,
///     y: i64,
///     labels: Vec<String>,
/// }
///
/// deep_copy_struct!(Point { x, y, labels });
///
/// let p = Point { x: 1, y: 2, labels: vec!["a".into()] };
/// assert_eq!(p.deep_copy(), p);
/// ```
#[macro_export]
macro_rules! deep_copy_struct {
    ($ty:ty { $($field:ident),+ $(,)? }) => {
        impl $crate::DeepCopy for $ty {
            fn deep_copy(&self) -> Self {
                Self {
                    $($field: $crate::DeepCopy::deep_copy(&self.$field),)+
                }
            }
        }
    };
}

/// Implement [`DeepCopy`] through `Clone` for types whose clone already owns
/// all of its storage, such as field-less enums or plain-data structs.
#[macro_export]
macro_rules! deep_copy_via_clone {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $crate::DeepCopy for $ty {
                fn deep_copy(&self) -> Self {
                    ::std::clone::Clone::clone(self)
                }
            }
        )+
    };
}

deep_copy_via_clone!(
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
    Duration,
    PathBuf,
    serde_json::Value,
);

impl DeepCopy for &'static str {
    fn deep_copy(&self) -> Self {
        *self
    }
}

impl<T: DeepCopy> DeepCopy for Option<T> {
    fn deep_copy(&self) -> Self {
        self.as_ref().map(DeepCopy::deep_copy)
    }
}

impl<T: DeepCopy> DeepCopy for Box<T> {
    fn deep_copy(&self) -> Self {
        Box::new((**self).deep_copy())
    }
}

impl<T: DeepCopy> DeepCopy for Rc<T> {
    fn deep_copy(&self) -> Self {
        Rc::new((**self).deep_copy())
    }
}

impl<T: DeepCopy> DeepCopy for Arc<T> {
    fn deep_copy(&self) -> Self {
        Arc::new((**self).deep_copy())
    }
}

impl<T: DeepCopy> DeepCopy for Vec<T> {
    fn deep_copy(&self) -> Self {
        let mut out = Vec::with_capacity(self.capacity());
        out.extend(self.iter().map(DeepCopy::deep_copy));
        out
    }
}

impl<T: DeepCopy> DeepCopy for VecDeque<T> {
    fn deep_copy(&self) -> Self {
        let mut out = VecDeque::with_capacity(self.capacity());
        out.extend(self.iter().map(DeepCopy::deep_copy));
        out
    }
}

impl<T: DeepCopy, const N: usize> DeepCopy for [T; N] {
    fn deep_copy(&self) -> Self {
        std::array::from_fn(|i| self[i].deep_copy())
    }
}

impl<K, V, S> DeepCopy for HashMap<K, V, S>
where
    K: Clone + Eq + Hash,
    V: DeepCopy,
    S: BuildHasher + Clone,
{
    fn deep_copy(&self) -> Self {
        let mut out = HashMap::with_capacity_and_hasher(self.len(), self.hasher().clone());
        for (key, value) in self {
            out.insert(key.clone(), value.deep_copy());
        }
        out
    }
}

impl<K: Clone + Ord, V: DeepCopy> DeepCopy for BTreeMap<K, V> {
    fn deep_copy(&self) -> Self {
        self.iter()
            .map(|(key, value)| (key.clone(), value.deep_copy()))
            .collect()
    }
}

impl<K, S> DeepCopy for HashSet<K, S>
where
    K: Clone + Eq + Hash,
    S: BuildHasher + Clone,
{
    fn deep_copy(&self) -> Self {
        self.clone()
    }
}

impl<K: Clone + Ord> DeepCopy for BTreeSet<K> {
    fn deep_copy(&self) -> Self {
        self.clone()
    }
}

impl<T: Copy> DeepCopy for Cell<T> {
    fn deep_copy(&self) -> Self {
        Cell::new(self.get())
    }
}

/// # Panics
///
/// Panics if the cell is mutably borrowed, like `RefCell::clone`.
impl<T: DeepCopy> DeepCopy for RefCell<T> {
    fn deep_copy(&self) -> Self {
        RefCell::new(self.borrow().deep_copy())
    }
}

impl<T: DeepCopy> DeepCopy for Mutex<T> {
    fn deep_copy(&self) -> Self {
        let guard = self.lock().unwrap_or_else(PoisonError::into_inner);
        Mutex::new(guard.deep_copy())
    }
}

impl<T: DeepCopy> DeepCopy for RwLock<T> {
    fn deep_copy(&self) -> Self {
        let guard = self.read().unwrap_or_else(PoisonError::into_inner);
        RwLock::new(guard.deep_copy())
    }
}

macro_rules! deep_copy_tuple {
    ($($name:ident . $idx:tt),+) => {
        impl<$($name: DeepCopy),+> DeepCopy for ($($name,)+) {
            fn deep_copy(&self) -> Self {
                ($(self.$idx.deep_copy(),)+)
            }
        }
    };
}

deep_copy_tuple!(A.0);
deep_copy_tuple!(A.0, B.1);
deep_copy_tuple!(A.0, B.1, C.2);
deep_copy_tuple!(A.0, B.1, C.2, D.3);
