// Member selection strategies. Pure over the loaded member list; the
// rotation cursor is persisted on the queue row between invocations.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use uuid::Uuid;

use super::QueueMember;

/// Simple rotation: continue from the persisted cursor, picking the next
/// position after it (wrapping around). Returns the chosen member and the
/// new cursor value. Missing/removed positions are naturally skipped
/// because only live members are in the list.
pub fn select_rotation(members: &[QueueMember], cursor: i32) -> Option<(Uuid, i32)> {
    if members.is_empty() {
        return None;
    }

    let mut ordered: Vec<&QueueMember> = members.iter().collect();
    ordered.sort_by_key(|m| m.position);

    let chosen = ordered
        .iter()
        .find(|m| m.position > cursor)
        .or_else(|| ordered.first())?;

    Some((chosen.user_id, chosen.position))
}

/// Weighted selection: probability proportional to weight, with ties and
/// the all-zero-weight degenerate case falling back to position order.
pub fn select_weighted<R: Rng + ?Sized>(members: &[QueueMember], rng: &mut R) -> Option<Uuid> {
    if members.is_empty() {
        return None;
    }

    let mut ordered: Vec<&QueueMember> = members.iter().collect();
    ordered.sort_by_key(|m| m.position);

    let weights: Vec<i32> = ordered.iter().map(|m| m.weight.max(0)).collect();
    if weights.iter().sum::<i32>() == 0 {
        return Some(ordered[0].user_id);
    }

    let index = WeightedIndex::new(&weights).ok()?;
    Some(ordered[index.sample(rng)].user_id)
}
