use chrono::Utc;

use crate::shared::Millis;

pub fn now_millis() -> Millis {
    Utc::now().timestamp_millis()
}

/// Strips a surrounding markdown code fence (```json ... ``` or ``` ... ```)
/// from LLM output, leaving bare content untouched.
pub fn strip_code_fences(content: &str) -> &str {
    let mut s = content.trim();

    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }

    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }

    s.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1}  "), "{\"a\":1}");
    }
}
