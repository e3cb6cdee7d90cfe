//! Top-K selection by sort-then-truncate.
//!
//! Per-interval inputs are small enough (bounded by the map sizes the
//! instrumentation allows) that a full stable sort is cheaper to reason
//! about than a heap, and it makes tie-breaking deterministic.

/// Return the `k` items with the greatest key in ascending key order.
///
/// The sort is stable, so among equal keys the item encountered later wins
/// a place at the boundary. Returns fewer than `k` items when the input is
/// smaller and nothing when `k == 0`.
pub fn select<T, K, F>(mut items: Vec<T>, key: F, k: usize) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    if k == 0 {
        return Vec::new();
    }

    items.sort_by_key(|item| key(item));

    let skip = items.len().saturating_sub(k);
    items.drain(..skip);
    items
}

/// Same set as [`select`], largest first. Equal keys stay in encounter
/// order.
pub fn select_desc<T, K, F>(items: Vec<T>, key: F, k: usize) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> K,
{
    let mut top = select(items, &key, k);
    top.sort_by(|a, b| key(b).cmp(&key(a)));
    top
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_returns_k_largest_ascending() {
        let top = select(vec![5, 1, 9, 3, 7], |v| *v, 3);
        assert_eq!(top, vec![5, 7, 9]);
    }

    #[test]
    fn test_select_fewer_than_k() {
        assert_eq!(select(vec![2, 1], |v| *v, 10), vec![1, 2]);
    }

    #[test]
    fn test_select_zero_k() {
        assert!(select(vec![1, 2, 3], |v| *v, 0).is_empty());
    }

    #[test]
    fn test_select_empty_input() {
        assert!(select(Vec::<u64>::new(), |v| *v, 3).is_empty());
    }

    #[test]
    fn test_select_ties_keep_later_item() {
        let items = vec![("a", 1), ("b", 5), ("c", 5)];
        let top = select(items, |(_, k)| *k, 1);
        assert_eq!(top, vec![("c", 5)]);
    }

    #[test]
    fn test_select_desc() {
        let top = select_desc(vec![4, 8, 1, 6], |v| *v, 2);
        assert_eq!(top, vec![8, 6]);
    }

    #[test]
    fn test_select_desc_ties_in_encounter_order() {
        let items = vec![("a", 3), ("b", 7), ("c", 3), ("d", 1)];
        let top = select_desc(items, |(_, k)| *k, 3);
        assert_eq!(top, vec![("b", 7), ("a", 3), ("c", 3)]);
    }

    #[test]
    fn test_select_never_exceeds_k() {
        for k in 0..8 {
            let input: Vec<u32> = (0..5).collect();
            assert!(select(input, |v| *v, k).len() <= k);
        }
    }
}
