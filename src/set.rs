//! Ordered-set algebra used by the dataflow meets.

use std::collections::BTreeSet;

/// Intersect two sets.
pub fn intersect<T: Ord + Clone>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> BTreeSet<T> {
    a.intersection(b).cloned().collect()
}

/// Fold a sequence of sets with intersection. An empty sequence yields the
/// empty set; boundary conditions are the caller's responsibility.
pub fn intersect_all<'a, T, I>(sets: I) -> BTreeSet<T>
where
    T: Ord + Clone + 'a,
    I: IntoIterator<Item = &'a BTreeSet<T>>,
{
    let mut it = sets.into_iter();
    let mut out = match it.next() {
        Some(first) => first.clone(),
        None => return BTreeSet::new(),
    };
    for s in it {
        out = intersect(&out, s);
    }
    out
}

/// Fold a sequence of sets with union.
pub fn union_all<'a, T, I>(sets: I) -> BTreeSet<T>
where
    T: Ord + Clone + 'a,
    I: IntoIterator<Item = &'a BTreeSet<T>>,
{
    let mut out = BTreeSet::new();
    for s in sets {
        out.extend(s.iter().cloned());
    }
    out
}
