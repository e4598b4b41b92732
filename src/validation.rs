use crate::error::AppError;

/// Longest chat message accepted, in characters, after sanitizing.
pub const MAX_MESSAGE_CHARS: usize = 1000;

pub fn require_non_empty(field: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} cannot be empty")));
    }
    Ok(())
}

/// Trim and strip `<`/`>` from a user message, then enforce the length bounds.
pub fn sanitize_message(raw: &str) -> Result<String, AppError> {
    let cleaned: String = raw.chars().filter(|c| !matches!(c, '<' | '>')).collect();
    let cleaned = cleaned.trim().to_string();
    require_non_empty("message", &cleaned)?;

    let len = cleaned.chars().count();
    if len > MAX_MESSAGE_CHARS {
        return Err(AppError::Validation(format!(
            "message is {len} characters, the limit is {MAX_MESSAGE_CHARS}"
        )));
    }
    Ok(cleaned)
}
