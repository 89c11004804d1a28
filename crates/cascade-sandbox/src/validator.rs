//! Pre-execution script validator.
//!
//! The isolate is the real boundary; these checks reject obvious escape
//! attempts before a runtime is created and give clearer errors.

use crate::error::SandboxError;

/// Default maximum script size in bytes (64 KB).
const DEFAULT_MAX_CODE_SIZE: usize = 64 * 1024;

/// Patterns rejected anywhere in a script.
///
/// Patterns that start with an identifier character only match at an
/// identifier boundary, so `myFunction(` or `medieval(` are accepted.
const BANNED_PATTERNS: &[&str] = &[
    "require(",
    "import(",
    "Deno.",
    "eval(",
    "Function(",
    "__proto__",
    "constructor.constructor",
    "process.env",
    "process.exit",
];

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Whether `pattern` occurs in `code` not preceded by an identifier character.
fn contains_token(code: &str, pattern: &str) -> bool {
    let anchored = pattern.chars().next().is_some_and(is_ident_char);
    code.match_indices(pattern).any(|(idx, _)| {
        !anchored || !code[..idx].chars().next_back().is_some_and(is_ident_char)
    })
}

/// Validate a script body before execution.
///
/// An empty body is valid and evaluates to `null`.
pub fn validate_code(code: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_CODE_SIZE);

    if code.len() > max {
        return Err(SandboxError::CodeTooLarge {
            max,
            actual: code.len(),
        });
    }

    if code.contains('\0') {
        return Err(SandboxError::ValidationFailed {
            reason: "code contains a NUL byte".into(),
        });
    }

    for pattern in BANNED_PATTERNS {
        if contains_token(code, pattern) {
            return Err(SandboxError::BannedPattern {
                pattern: (*pattern).to_string(),
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn banned(code: &str) -> bool {
        matches!(
            validate_code(code, None),
            Err(SandboxError::BannedPattern { .. })
        )
    }

    #[test]
    fn accepts_plain_script() {
        assert!(validate_code("return 1+1;", None).is_ok());
        assert!(validate_code("logger.info('x'); return await fetch(url);", None).is_ok());
    }

    #[test]
    fn accepts_empty_body() {
        assert!(validate_code("", None).is_ok());
        assert!(validate_code("  \n", None).is_ok());
    }

    #[test]
    fn rejects_oversized_code() {
        let big = "x".repeat(100_000);
        let err = validate_code(&big, None).unwrap_err();
        assert!(matches!(err, SandboxError::CodeTooLarge { .. }));
    }

    #[test]
    fn custom_max_size() {
        let code = "x".repeat(100);
        assert!(validate_code(&code, Some(50)).is_err());
        assert!(validate_code(&code, Some(200)).is_ok());
    }

    #[test]
    fn rejects_module_loading() {
        assert!(banned("const fs = require('fs');"));
        assert!(banned("const m = await import('fs');"));
    }

    #[test]
    fn rejects_code_generation() {
        assert!(banned("return eval('1+1');"));
        assert!(banned("return new Function('return this')();"));
        assert!(banned("return ''.constructor.constructor('return this')();"));
    }

    #[test]
    fn rejects_host_escapes() {
        assert!(banned("return Deno.readFile('/etc/passwd');"));
        assert!(banned("return process.env.SECRET;"));
        assert!(banned("process.exit(1);"));
        assert!(banned("({}).__proto__.polluted = true;"));
    }

    #[test]
    fn identifier_boundary_avoids_false_positives() {
        assert!(validate_code("function myFunction() {} return myFunction();", None).is_ok());
        assert!(validate_code("const medieval = (x) => x; return medieval(1);", None).is_ok());
        assert!(validate_code("return data.process.status;", None).is_ok());
    }

    #[test]
    fn pattern_after_punctuation_still_matches() {
        assert!(banned("return (eval('2'));"));
        assert!(banned("x=require('a')"));
    }

    #[test]
    fn rejects_nul_bytes() {
        let err = validate_code("return 1;\0", None).unwrap_err();
        assert!(matches!(err, SandboxError::ValidationFailed { .. }));
    }
}
