use std::collections::HashMap;
use std::collections::TryReserveError;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
	#[error("maximum number of environment variables exceeded")]
	Capacity,
	#[error("failed to allocate memory for environment variable")]
	OutOfMemory,
}

impl From<TryReserveError> for StoreError {
	fn from(_: TryReserveError) -> StoreError {
		StoreError::OutOfMemory
	}
}

/// Copies `s` into a fresh allocation, reporting exhaustion instead of aborting.
pub fn try_own(s: &str) -> Result<String, TryReserveError> {
	let mut owned = String::new();
	owned.try_reserve_exact(s.len())?;
	owned.push_str(s);
	Ok(owned)
}

/// Shell variables set with `name=value`. Touched only by the control loop.
#[derive(Debug, Clone)]
pub struct Vars {
	imp: HashMap<String, String>,
	capacity: usize,
}

impl Vars {
	pub fn new(capacity: usize) -> Vars {
		Vars { imp: HashMap::new(), capacity: capacity }
	}

	pub fn set(&mut self, name: &str, value: &str) -> Result<(), StoreError> {
		if let Some(slot) = self.imp.get_mut(name) {
			*slot = try_own(value)?;
			return Ok(());
		}
		if self.imp.len() >= self.capacity {
			return Err(StoreError::Capacity);
		}
		self.imp.try_reserve(1)?;
		self.imp.insert(try_own(name)?, try_own(value)?);
		Ok(())
	}

	pub fn get(&self, name: &str) -> Option<&str> {
		self.imp.get(name).map(String::as_str)
	}

	pub fn clear(&mut self) {
		self.imp.clear();
	}

	pub fn len(&self) -> usize {
		self.imp.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn set_then_get() {
		let mut vars = Vars::new(4);
		assert_eq!(vars.get("x"), None);
		vars.set("x", "1").unwrap();
		assert_eq!(vars.get("x"), Some("1"));
		vars.set("x", "two").unwrap();
		assert_eq!(vars.get("x"), Some("two"));
		assert_eq!(vars.len(), 1);
	}

	#[test]
	fn capacity_counts_names_not_writes() {
		let mut vars = Vars::new(2);
		vars.set("a", "1").unwrap();
		vars.set("b", "2").unwrap();
		assert_eq!(vars.set("c", "3"), Err(StoreError::Capacity));
		assert_eq!(vars.set("a", "again"), Ok(()));
		assert_eq!(vars.get("c"), None);
	}

	#[test]
	fn clear_forgets_everything() {
		let mut vars = Vars::new(2);
		vars.set("a", "1").unwrap();
		vars.clear();
		assert_eq!(vars.get("a"), None);
		assert_eq!(vars.len(), 0);
	}
}
