use std::io::{self, Write};

use clap::builder::{
	Styles,
	styling::{AnsiColor, Effects},
};
use serde::Serialize;

/// `<crate version>-<git sha>-<target triple>`, stamped at build time.
pub const VERSION: &str = concat!(
	env!("CARGO_PKG_VERSION"),
	"-",
	env!("VERGEN_GIT_SHA"),
	"-",
	env!("VERGEN_CARGO_TARGET_TRIPLE"),
);

pub fn styles() -> Styles {
	Styles::styled()
		.header(AnsiColor::Cyan.on_default() | Effects::BOLD)
		.usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
		.literal(AnsiColor::Green.on_default() | Effects::BOLD)
		.placeholder(AnsiColor::Yellow.on_default())
		.error(AnsiColor::Red.on_default() | Effects::BOLD)
}

/// Writes `value` to stdout as pretty JSON followed by a newline. Maintenance commands print
/// their reports this way so scripts can consume them.
pub fn print_json<T>(value: &T) -> io::Result<()>
where
	T: ?Sized + Serialize,
{
	let mut out = io::stdout().lock();

	serde_json::to_writer_pretty(&mut out, value)?;

	writeln!(out)
}
