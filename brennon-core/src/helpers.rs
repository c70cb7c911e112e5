use crate::error::{BrennonError, Result};
use rand::distr::{Alphanumeric, SampleString};
use rand::rng;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn generate_punishment_id() -> String {
  Alphanumeric.sample_string(&mut rng(), 8)
}

/// Process identity used to drop our own broadcasts.
pub fn generate_origin_id(server_name: &str) -> String {
  format!("{server_name}-{}", Alphanumeric.sample_string(&mut rng(), 6))
}

pub fn hash_api_key(key: &str) -> String {
  format!("{:x}", Sha256::digest(key.as_bytes()))
}

pub fn now() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs() as i64
}

/// Await a store or transport call, failing with `Timeout` after `limit`.
pub async fn bounded<T, E, F>(limit: Duration, operation: &'static str, fut: F) -> Result<T>
where
  F: Future<Output = std::result::Result<T, E>>,
  E: Into<BrennonError>,
{
  match tokio::time::timeout(limit, fut).await {
    Ok(result) => result.map_err(Into::into),
    Err(_) => Err(BrennonError::Timeout(operation)),
  }
}

/// `issued_at + duration` in Unix seconds, None when it does not fit.
pub fn expiry_after(issued_at: i64, duration: Duration) -> Option<i64> {
  i64::try_from(duration.as_secs())
    .ok()
    .and_then(|secs| issued_at.checked_add(secs))
}

const UNITS: [(char, i64); 5] = [('w', 604_800), ('d', 86_400), ('h', 3_600), ('m', 60), ('s', 1)];

/// `90061` -> `1d1h1m1s`; `None` -> `permanent`.
pub fn format_duration(seconds: Option<i64>) -> String {
  let Some(mut remaining) = seconds else {
    return "permanent".to_string();
  };
  if remaining <= 0 {
    return "0s".to_string();
  }

  let mut out = String::new();
  for (unit, size) in UNITS {
    let count = remaining / size;
    if count > 0 {
      out.push_str(&format!("{count}{unit}"));
      remaining -= count * size;
    }
  }
  out
}

/// Parse `1d2h`, `30m`, `2w` into a duration. `perm`/`permanent` yields `None`.
pub fn parse_duration(input: &str) -> Option<Option<Duration>> {
  let input = input.trim().to_ascii_lowercase();
  if input == "perm" || input == "permanent" {
    return Some(None);
  }

  let mut total: u64 = 0;
  let mut digits = String::new();
  for c in input.chars() {
    if c.is_ascii_digit() {
      digits.push(c);
      continue;
    }
    let size = UNITS.iter().find(|(unit, _)| *unit == c)?.1 as u64;
    let count: u64 = digits.parse().ok()?;
    total = total.checked_add(count.checked_mul(size)?)?;
    digits.clear();
  }

  // Expiry is stored as i64 seconds
  if !digits.is_empty() || total == 0 || total > i64::MAX as u64 {
    return None;
  }
  Some(Some(Duration::from_secs(total)))
}
