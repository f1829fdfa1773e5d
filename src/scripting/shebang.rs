//! Script shebang parsing
//!
//! Scripts may open with `#!<engine> [flags=f1,f2,...]` to select a
//! non-default engine and declare script flags. Without a shebang the
//! script targets the default engine in EVAL compatibility mode.

use super::{ScriptFlags, DEFAULT_ENGINE};

/// Result of parsing a script body's optional shebang line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShebangInfo {
    /// Engine name as written (lookup is case-insensitive)
    pub engine: String,

    /// Parsed script flags
    pub flags: ScriptFlags,

    /// Byte offset where the code handed to the engine starts. The
    /// newline terminating the shebang is kept so source line numbers
    /// stay aligned for the debugger.
    pub body_offset: usize,
}

/// Parse the optional shebang line of `body`.
///
/// Errors carry the exact message reported to the client.
pub fn parse_shebang(body: &str) -> Result<ShebangInfo, String> {
    if !body.starts_with("#!") {
        // When no shebang is declared, assume the default engine.
        let mut flags = ScriptFlags::empty();
        flags.insert(ScriptFlags::EVAL_COMPAT_MODE);
        return Ok(ShebangInfo {
            engine: DEFAULT_ENGINE.to_string(),
            flags,
            body_offset: 0,
        });
    }

    let newline = match body.find('\n') {
        Some(pos) => pos,
        None => return Err("Invalid script shebang".to_string()),
    };

    let shebang = &body[..newline];
    let mut parts = shebang.split_whitespace();

    let engine = match parts.next() {
        Some(first) => {
            let name = &first[2..];
            if name.is_empty() {
                return Err("Invalid engine in script shebang".to_string());
            }
            name.to_string()
        }
        None => return Err("Invalid engine in script shebang".to_string()),
    };

    let mut flags = ScriptFlags::empty();
    for option in parts {
        if let Some(list) = option.strip_prefix("flags=") {
            for token in list.split(',') {
                match ScriptFlags::parse_token(token) {
                    Some(flag) => flags.insert(flag),
                    None => {
                        return Err(format!("Unexpected flag in script shebang: {}", token));
                    }
                }
            }
        } else {
            // Only the flags option is supported.
            return Err(format!("Unknown script shebang option: {}", option));
        }
    }

    Ok(ShebangInfo {
        engine,
        flags,
        body_offset: newline,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_shebang_defaults() {
        let info = parse_shebang("return 1").unwrap();
        assert_eq!(info.engine, DEFAULT_ENGINE);
        assert!(info.flags.contains(ScriptFlags::EVAL_COMPAT_MODE));
        assert_eq!(info.body_offset, 0);
    }

    #[test]
    fn test_engine_only() {
        let info = parse_shebang("#!hello\nFUNCTION foo RETURN").unwrap();
        assert_eq!(info.engine, "hello");
        assert!(!info.flags.contains(ScriptFlags::EVAL_COMPAT_MODE));
        assert_eq!(&"#!hello\nFUNCTION foo RETURN"[info.body_offset..], "\nFUNCTION foo RETURN");
    }

    #[test]
    fn test_flags_parsed() {
        let info = parse_shebang("#!lua flags=no-writes,allow-stale\nreturn 1").unwrap();
        assert_eq!(info.engine, "lua");
        assert!(info.flags.contains(ScriptFlags::NO_WRITES));
        assert!(info.flags.contains(ScriptFlags::ALLOW_STALE));
        assert!(!info.flags.contains(ScriptFlags::EVAL_COMPAT_MODE));
    }

    #[test]
    fn test_missing_newline_is_an_error() {
        let err = parse_shebang("#!lua flags=no-writes").unwrap_err();
        assert_eq!(err, "Invalid script shebang");
    }

    #[test]
    fn test_unknown_flag() {
        let err = parse_shebang("#!lua flags=no-writes,warp-drive\nreturn 1").unwrap_err();
        assert_eq!(err, "Unexpected flag in script shebang: warp-drive");
    }

    #[test]
    fn test_unknown_option() {
        let err = parse_shebang("#!lua mode=fast\nreturn 1").unwrap_err();
        assert_eq!(err, "Unknown script shebang option: mode=fast");
    }

    #[test]
    fn test_empty_engine_name() {
        let err = parse_shebang("#!\nreturn 1").unwrap_err();
        assert_eq!(err, "Invalid engine in script shebang");
    }

    #[test]
    fn test_emit_parse_law() {
        let mut flags = ScriptFlags::empty();
        flags.insert(ScriptFlags::NO_WRITES);
        flags.insert(ScriptFlags::ALLOW_CROSS_SLOT_KEYS);

        let shebang = format!("#!lua flags={}\nreturn 1", flags.emit());
        let info = parse_shebang(&shebang).unwrap();
        assert_eq!(info.flags, flags);
    }
}
