use std::env;
use std::sync::OnceLock;

static RWKV_RS_PRINT_ERRORS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

/// Default for the print-errors flag of new contexts and of the process-wide error slot.
pub(crate) fn print_errors_default() -> bool {
    *RWKV_RS_PRINT_ERRORS.get_or_init(|| match env::var("RWKV_RS_PRINT_ERRORS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => true,
    })
}
