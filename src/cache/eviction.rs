//! Oldest-first eviction planning for a cache tier.

use super::types::EntryMeta;

/// Budget of a single tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Budget {
  pub max_entries: usize,
  pub max_bytes: u64,
  /// Once over `max_bytes`, evict down to this fraction of it
  pub evict_to_ratio: f64,
}

impl Budget {
  pub fn byte_target(&self) -> u64 {
    (self.max_bytes as f64 * self.evict_to_ratio).floor() as u64
  }
}

/// Pick the request keys to delete so that `entries` (oldest first) fits `budget`.
///
/// The count limit is applied first (down to `max_entries`), then the byte
/// limit: when the remaining bytes exceed `max_bytes`, oldest entries go until
/// the total is at or under `evict_to_ratio * max_bytes`.
pub fn plan(entries: &[EntryMeta], budget: &Budget) -> Vec<String> {
  let mut count = entries.len();
  let mut bytes: u64 = entries.iter().map(|e| e.size).sum();
  let mut oldest = entries.iter();
  let mut victims = Vec::new();

  while count > budget.max_entries {
    match oldest.next() {
      Some(entry) => {
        victims.push(entry.request_key.clone());
        count -= 1;
        bytes -= entry.size;
      }
      None => break,
    }
  }

  if bytes > budget.max_bytes {
    victims.extend(shrink(oldest.as_slice(), bytes, budget.byte_target()));
  }

  victims
}

/// Oldest keys to delete so that `total_bytes` drops to `target_bytes` or below.
pub fn shrink(entries: &[EntryMeta], total_bytes: u64, target_bytes: u64) -> Vec<String> {
  let mut bytes = total_bytes;
  entries
    .iter()
    .take_while(|entry| {
      let over = bytes > target_bytes;
      if over {
        bytes = bytes.saturating_sub(entry.size);
      }
      over
    })
    .map(|entry| entry.request_key.clone())
    .collect()
}
