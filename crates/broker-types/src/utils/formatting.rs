//! String formatting utilities for log output.

/// Shortens an order or instance id for log lines.
///
/// Ids of up to 8 characters are returned unchanged, longer ones keep their
/// first 8 characters followed by "..".
pub fn truncate_id(id: &str) -> String {
	match id.char_indices().nth(8) {
		Some((idx, _)) => format!("{}..", &id[..idx]),
		None => id.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_truncate_id() {
		assert_eq!(truncate_id("vm-123"), "vm-123");
		assert_eq!(truncate_id("12345678"), "12345678");
		assert_eq!(
			truncate_id("7f1c2a9e-5b1d-4c7e-9f00-1234567890ab"),
			"7f1c2a9e.."
		);
	}
}
