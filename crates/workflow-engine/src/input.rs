//! Stdin payload resolution for a task's `TaskInput` (spec.md §4.4 step 3).

use crate::expr::{self, ExprContext};
use crate::model::TaskInput;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Resolve the stdin byte payload for `input`. Never fails: a missing file
/// or invalid base64 degrades to "no bytes" / the literal UTF-8 value
/// rather than raising an error (spec.md §4.4 step 3).
pub async fn resolve_input(input: &TaskInput, ctx: &ExprContext<'_>) -> Option<Vec<u8>> {
    match input {
        TaskInput::None => None,
        TaskInput::Text { value } => Some(expr::interpolate(value, ctx).into_bytes()),
        TaskInput::Bytes { value } => match BASE64.decode(value.as_bytes()) {
            Ok(bytes) => Some(bytes),
            Err(_) => Some(value.as_bytes().to_vec()),
        },
        TaskInput::File { file_path } => tokio::fs::read(file_path).await.ok(),
        TaskInput::Pipe { value } => {
            let resolved = expr::interpolate(value, ctx);
            if resolved.is_empty() {
                None
            } else {
                Some(resolved.into_bytes())
            }
        }
    }
}
