#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod error;

/// Truncates `value` to at most `max_chars` characters, appending an ellipsis when cut.
///
/// Used to keep upstream error bodies from flooding logs and status snapshots.
#[must_use]
pub fn truncate_detail(value: &str, max_chars: usize) -> String {
	let mut chars = value.chars();
	let head = chars.by_ref().take(max_chars).collect::<String>();

	if chars.next().is_some() {
		format!("{head}…")
	} else {
		head
	}
}
