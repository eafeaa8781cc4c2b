pub mod ci;
pub mod env;
pub mod server;
pub mod sessions;

use testmon_core::Kind;

/// Print `value` as pretty JSON, exiting on failure.
pub fn print_json<T: serde::Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => {
            eprintln!("Failed to serialize output: {e}");
            std::process::exit(1);
        }
    }
}

/// Shorten a 64-char hex identifier for table output.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Parse an optional `--kind` filter. Case and surrounding spaces are ignored.
pub fn parse_kind(raw: Option<&str>) -> Result<Option<Kind>, String> {
    raw.map(str::parse::<Kind>).transpose()
}
